//! # tally-core: Pure Sync Domain for Tally POS
//!
//! This crate holds the types and decisions of the POS ↔ CRM sync engine as
//! pure functions with zero I/O dependencies.
//!
//! ## Architecture Position
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                      Tally POS Sync Architecture                        │
//! │                                                                         │
//! │  ┌─────────────────────────────────────────────────────────────────┐   │
//! │  │                apps/sync-server (timers + HTTP)                 │   │
//! │  └─────────────────────────────┬───────────────────────────────────┘   │
//! │                                │                                        │
//! │  ┌─────────────────────────────▼───────────────────────────────────┐   │
//! │  │     tally-sync: processor, CRM adapter, reconciliation,         │   │
//! │  │                 webhook receiver                                │   │
//! │  └─────────────────────────────┬───────────────────────────────────┘   │
//! │                                │                                        │
//! │  ┌─────────────────────────────▼───────────────────────────────────┐   │
//! │  │               ★ tally-core (THIS CRATE) ★                       │   │
//! │  │                                                                 │   │
//! │  │   ┌───────────┐  ┌───────────┐  ┌───────────┐  ┌───────────┐  │   │
//! │  │   │   types   │  │  policy   │  │   drift   │  │ validation│  │   │
//! │  │   │ QueueItem │  │ ordering  │  │ threshold │  │  email    │  │   │
//! │  │   │ Customer  │  │ backoff   │  │ decisions │  │  phone    │  │   │
//! │  │   └───────────┘  └───────────┘  └───────────┘  └───────────┘  │   │
//! │  │                                                                 │   │
//! │  │   NO I/O • NO DATABASE • NO NETWORK • PURE FUNCTIONS           │   │
//! │  └─────────────────────────────────────────────────────────────────┘   │
//! │                                │                                        │
//! │  ┌─────────────────────────────▼───────────────────────────────────┐   │
//! │  │                  tally-db (SQLite queue + entities)             │   │
//! │  └─────────────────────────────────────────────────────────────────┘   │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`types`] - Queue items, entities, audit records
//! - [`policy`] - Dispatch ordering and retry/backoff decisions
//! - [`drift`] - Loyalty drift classification
//! - [`money`] - Integer money with decimal wire encoding
//! - [`validation`] - Input rules for CRM-originated data
//! - [`error`] - Domain error types
//!
//! ## Example Usage
//!
//! ```rust
//! use chrono::Utc;
//! use tally_core::policy::{FailureOutcome, RetryPolicy};
//!
//! let policy = RetryPolicy::default();
//! match policy.on_failure(0, true, Utc::now()) {
//!     FailureOutcome::Retry { retry_count, .. } => assert_eq!(retry_count, 1),
//!     FailureOutcome::Failed { .. } => unreachable!(),
//! }
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

pub mod drift;
pub mod error;
pub mod money;
pub mod policy;
pub mod types;
pub mod validation;

// =============================================================================
// Re-exports for Convenience
// =============================================================================

pub use drift::{DriftDecision, DriftThresholds};
pub use error::{CoreError, CoreResult, ValidationError};
pub use money::Money;
pub use policy::{FailureOutcome, RetryPolicy};
pub use types::*;
