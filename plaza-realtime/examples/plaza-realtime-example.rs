use std::{net::SocketAddr, process::ExitCode, time::Duration};

use clap::Parser;
use eyre::Context as _;
use plaza_realtime::{
    RealtimeServiceBuilder, RealtimeStores,
    config::{Environment, RealtimeNodeConfig},
};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

/// The configuration for the example plaza realtime node.
///
/// It can be configured via environment variables or command line arguments
/// using `clap`.
#[derive(Parser, Debug)]
pub struct ExampleNodeConfig {
    /// The bind addr of the AXUM server
    #[clap(long, env = "PLAZA_NODE_BIND_ADDR", default_value = "0.0.0.0:4500")]
    pub bind_addr: SocketAddr,

    /// Max wait time the service waits for its workers during shutdown.
    #[clap(
        long,
        env = "PLAZA_NODE_MAX_WAIT_TIME_SHUTDOWN",
        default_value = "10s",
        value_parser = humantime::parse_duration
    )]
    pub max_wait_time_shutdown: Duration,

    /// The realtime service config
    #[clap(flatten)]
    pub service_config: RealtimeNodeConfig,
}

#[tokio::main]
async fn main() -> eyre::Result<ExitCode> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("plaza_realtime=debug,info")),
        )
        .init();

    let config = ExampleNodeConfig::parse();
    let result = start_service(config, shutdown_signal()).await;
    match result {
        Ok(()) => {
            tracing::info!("good night!");
            Ok(ExitCode::SUCCESS)
        }
        Err(err) => {
            // we don't want to double print the error therefore we just return FAILURE
            tracing::error!("{err:?}");
            Ok(ExitCode::FAILURE)
        }
    }
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}

async fn build_stores(config: &RealtimeNodeConfig) -> eyre::Result<RealtimeStores> {
    match config.environment {
        Environment::Dev => {
            // single-node in-memory wiring, nothing is shared with a fleet
            config.environment.assert_is_dev();
            Ok(RealtimeStores::in_memory(config.rate_limits()))
        }
        #[cfg(feature = "redis")]
        Environment::Prod => RealtimeStores::connect(config)
            .await
            .context("while connecting the stores"),
        #[cfg(not(feature = "redis"))]
        Environment::Prod => {
            eyre::bail!("this build lacks the `redis` feature required for prod")
        }
    }
}

pub async fn start_service(
    config: ExampleNodeConfig,
    shutdown_signal: impl std::future::Future<Output = ()> + Send + 'static,
) -> eyre::Result<()> {
    tracing::info!("starting plaza-realtime with config: {config:#?}");
    let cancellation_token = CancellationToken::new();
    tokio::spawn({
        let cancellation_token = cancellation_token.clone();
        async move {
            shutdown_signal.await;
            tracing::info!("received shutdown signal");
            cancellation_token.cancel();
        }
    });

    tracing::info!("init stores..");
    let stores = build_stores(&config.service_config).await?;

    tracing::info!("init realtime service..");
    plaza_realtime::metrics::describe_metrics();
    let builder = RealtimeServiceBuilder::init(
        config.service_config,
        stores,
        cancellation_token.clone(),
    );
    let hub = builder.hub();
    let drain = builder.shutdown_drain();
    let (router, reaper) = builder.build();

    let listener = tokio::net::TcpListener::bind(config.bind_addr).await?;
    let axum_cancel_token = cancellation_token.clone();
    let server = tokio::spawn(async move {
        tracing::info!(
            "starting axum server on {}",
            listener
                .local_addr()
                .map(|x| x.to_string())
                .unwrap_or(String::from("invalid addr"))
        );
        let axum_shutdown_signal = axum_cancel_token.clone();
        let axum_result = axum::serve(listener, router)
            .with_graceful_shutdown(async move { axum_shutdown_signal.cancelled().await })
            .await;
        tracing::info!("axum server shutdown");
        if let Err(err) = axum_result {
            tracing::error!("got error from axum: {err:?}");
        }
        // we cancel the token in case axum encountered an error to shutdown the service
        axum_cancel_token.cancel();
    });

    tracing::info!("everything started successfully - now waiting for shutdown...");
    cancellation_token.cancelled().await;

    tracing::info!("draining connections (max wait time {drain:?})..");
    hub.shutdown(drain).await;
    tracing::info!(
        "waiting for shutdown of services (max wait time {:?})..",
        config.max_wait_time_shutdown
    );
    match tokio::time::timeout(config.max_wait_time_shutdown, async move {
        tokio::join!(server, reaper)
    })
    .await
    {
        Ok(_) => tracing::info!("successfully finished shutdown in time"),
        Err(_) => tracing::warn!("could not finish shutdown in time"),
    }
    Ok(())
}
