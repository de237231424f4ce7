//! # HTTP Surfaces
//!
//! Two axum routers, served on separate listeners by the binary:
//!
//! - [`webhook`]: public, bearer-authenticated CRM callbacks
//! - [`admin`]: loopback-only manual triggers and statistics
//!
//! Both answer errors with the shape in [`error`].

pub mod admin;
pub mod error;
pub mod webhook;

pub use admin::AdminState;
pub use error::{ApiError, ErrorBody};
pub use webhook::WebhookState;
