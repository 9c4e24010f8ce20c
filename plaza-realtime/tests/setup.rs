use std::sync::Arc;
use std::time::Duration;

use axum_test::{TestServer, TestWebSocket};
use plaza_realtime::config::{Environment, RealtimeNodeConfig};
use plaza_realtime::services::poi_lifecycle::PoiLifecycle;
use plaza_realtime::services::presence::PresenceStore as _;
use plaza_realtime::services::rate_limiter::Quota;
use plaza_realtime::{RealtimeServiceBuilder, RealtimeStores};
use plaza_types::api::PLAZA_PROTOCOL_VERSION_HEADER;
use plaza_types::api::v1::{Envelope, ServerEvent};
use plaza_types::{MapId, Position, Session, UserId};
use tokio_util::sync::CancellationToken;

pub const PROTOCOL_VERSION: &str = "1.2.0";
pub const TEST_SESSION_TTL: Duration = Duration::from_secs(60);

/// A realtime node on in-memory stores plus direct handles to them, so
/// tests can arrange presence and observe live state from the outside like
/// the hosting REST layer would.
pub struct TestBackend {
    pub server: Arc<TestServer>,
    pub stores: RealtimeStores,
    pub poi_lifecycle: PoiLifecycle,
    pub _cancellation_token: CancellationToken,
}

pub fn test_config() -> RealtimeNodeConfig {
    RealtimeNodeConfig {
        environment: Environment::Dev,
        kv_store_url: String::from("redis://127.0.0.1:6379").into(),
        bus_url: String::from("redis://127.0.0.1:6379").into(),
        ws_max_message_size: 64 * 1024,
        write_timeout: Duration::from_secs(2),
        outbound_queue_capacity: 64,
        heartbeat_interval: Duration::from_secs(15),
        idle_threshold: Duration::from_secs(300),
        idle_grace: Duration::from_secs(30),
        reaper_interval: Duration::from_secs(60),
        session_ttl: TEST_SESSION_TTL,
        store_op_timeout: Duration::from_secs(2),
        bus_publish_timeout: Duration::from_millis(500),
        shutdown_drain: Duration::from_secs(1),
        version_req: "^1".parse().unwrap(),
        rate_limit_create_session: Quota::parse("10/1m").unwrap(),
        rate_limit_update_avatar: Quota::parse("60/1m").unwrap(),
        rate_limit_create_poi: Quota::parse("5/1m").unwrap(),
        rate_limit_join_poi: Quota::parse("20/1m").unwrap(),
    }
}

impl TestBackend {
    pub async fn start() -> Self {
        Self::start_with(test_config()).await
    }

    pub async fn start_with(config: RealtimeNodeConfig) -> Self {
        let stores = RealtimeStores::in_memory(config.rate_limits());
        let cancellation_token = CancellationToken::new();
        let builder = RealtimeServiceBuilder::init(
            config,
            stores.clone(),
            cancellation_token.clone(),
        );
        let poi_lifecycle = builder.poi_lifecycle();
        let (router, _reaper) = builder.build();
        let server = TestServer::builder()
            .http_transport()
            .build(router)
            .expect("Can build test-server");
        TestBackend {
            server: Arc::new(server),
            stores,
            poi_lifecycle,
            _cancellation_token: cancellation_token,
        }
    }

    /// What the hosting REST layer does on `POST /sessions`.
    pub async fn create_session(&self, user: &str, map: &str) -> Session {
        let session = Session::new(
            UserId::from(user),
            MapId::from(map),
            Position { lat: 0.0, lng: 0.0 },
        );
        self.stores
            .presence
            .put(session.clone(), TEST_SESSION_TTL)
            .await
            .expect("can create session");
        session
    }

    /// Opens a websocket authenticated as the session and consumes the
    /// welcome frame.
    pub async fn connect(&self, session: &Session) -> TestWebSocket {
        let mut websocket = self.open_socket(session).await;
        let welcome = next_event(&mut websocket).await;
        let ServerEvent::Welcome(welcome) = welcome else {
            panic!("expected welcome, got {welcome:?}");
        };
        assert_eq!(welcome.session_id, session.id);
        websocket
    }

    /// Opens a websocket without consuming anything.
    pub async fn open_socket(&self, session: &Session) -> TestWebSocket {
        self.server
            .get_websocket("/ws")
            .add_header(
                http::header::AUTHORIZATION.as_str(),
                format!("Bearer {}", session.id),
            )
            .add_header(PLAZA_PROTOCOL_VERSION_HEADER.as_str(), PROTOCOL_VERSION)
            .await
            .into_websocket()
            .await
    }
}

/// Receives the next server event, bounded by a timeout so a missing frame
/// fails the test instead of hanging it.
pub async fn next_event(websocket: &mut TestWebSocket) -> ServerEvent {
    let envelope: Envelope = tokio::time::timeout(
        Duration::from_secs(2),
        websocket.receive_json::<Envelope>(),
    )
    .await
    .expect("a frame within two seconds");
    assert!(envelope.timestamp.as_millis() > 0);
    envelope.event
}

/// Skips frames until one matches, bounded so unrelated chatter cannot
/// loop forever.
pub async fn wait_for(
    websocket: &mut TestWebSocket,
    mut matches: impl FnMut(&ServerEvent) -> bool,
) -> ServerEvent {
    for _ in 0..25 {
        let event = next_event(websocket).await;
        if matches(&event) {
            return event;
        }
    }
    panic!("expected event did not arrive within 25 frames");
}
