//! # API module
//!
//! Entry point for all API version modules.
//!
//! Currently exposes the version 1 wire protocol types under [`v1`].

use http::HeaderName;

pub mod v1;

/// The name of the protocol-version header clients send on upgrade.
pub static PLAZA_PROTOCOL_VERSION_HEADER: HeaderName =
    HeaderName::from_static("x-plaza-protocol-version");
