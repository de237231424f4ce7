//! # tally-sync: POS ↔ CRM Sync Engine
//!
//! Keeps the local POS store and a remote multi-tenant CRM eventually
//! consistent.
//!
//! ## Architecture Overview
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                          Sync Engine                                    │
//! │                                                                         │
//! │  domain event ──► Enqueuer ──► sync_queue (outbox, dedup per entity)    │
//! │                                     │                                   │
//! │                                     ▼  every interval_secs              │
//! │  ┌──────────────────────────────────────────────────────────────────┐  │
//! │  │  SyncProcessor (single-flight)                                   │  │
//! │  │   recover stuck ─► HIGH ─► NORMAL ─► LOW ─► RETRY ─► cleanup     │  │
//! │  │                      │                                           │  │
//! │  │                      ▼                                           │  │
//! │  │   Scheduler: customer synced? ── no ──► defer + enqueue customer │  │
//! │  │                      │ yes                                       │  │
//! │  │                      ▼                                           │  │
//! │  │   CrmClient ── ok ──► SUCCESS                                    │  │
//! │  │             └─ err ─► RetryPolicy ──► RETRY (2^n min) | FAILED   │  │
//! │  └──────────────────────────────────────────────────────────────────┘  │
//! │                                                                         │
//! │  ┌────────────────────────┐  ┌────────────────────────────────────┐    │
//! │  │ ReconciliationEngine   │  │ Webhook receiver (axum)            │    │
//! │  │ daily, own guard       │  │ CRM ──► local customers            │    │
//! │  │ POS vs CRM points      │  │ created / updated / deleted        │    │
//! │  └────────────────────────┘  └────────────────────────────────────┘    │
//! │                                                                         │
//! │  Admin routes (loopback): trigger-now, retry-failed, statistics         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Module Organization
//! - [`config`] - TOML + environment configuration
//! - [`error`] - Sync error taxonomy
//! - [`auth`] - Outbound token minting, inbound webhook verification
//! - [`crm`] - CRM adapter: payloads, HTTP calls, audit ledger
//! - [`enqueuer`] - Deduplicating queue writes
//! - [`scheduler`] - Batch selection and the customer dependency rule
//! - [`guard`] - Single-flight flag
//! - [`timer`] - Shutdown handles for the background loops
//! - [`processor`] - The batch processor loop
//! - [`log_retry`] - Re-drive of failed ledger rows
//! - [`reconciliation`] - Loyalty points drift detection
//! - [`http`] - Webhook and admin routers
//!
//! ## Usage
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use tally_sync::{CrmClient, SyncConfig, SyncProcessor, TimerHandle};
//!
//! let config = SyncConfig::load(None)?;
//! let crm = CrmClient::new(&config.crm, db.clone())?;
//! let processor = Arc::new(SyncProcessor::new(db, crm, config.processor.clone()));
//!
//! let (timer, shutdown_rx) = TimerHandle::new();
//! tokio::spawn(processor.clone().run(shutdown_rx));
//!
//! // later
//! timer.shutdown().await?;
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

pub mod auth;
pub mod config;
pub mod crm;
pub mod enqueuer;
pub mod error;
pub mod guard;
pub mod http;
pub mod log_retry;
pub mod processor;
pub mod reconciliation;
pub mod scheduler;
pub mod timer;

// =============================================================================
// Re-exports
// =============================================================================

pub use auth::{Claims, TokenMinter, WebhookVerifier};
pub use config::{
    CrmSettings, DatabaseSettings, ProcessorSettings, ReconciliationSettings, SyncConfig,
    WebhookSettings,
};
pub use crm::CrmClient;
pub use enqueuer::Enqueuer;
pub use error::{SyncError, SyncResult};
pub use guard::SingleFlight;
pub use http::{AdminState, ApiError, WebhookState};
pub use log_retry::{LogRetryReport, SyncLogRetryJob};
pub use processor::{CycleReport, ProcessorStatus, SyncProcessor};
pub use reconciliation::{BusinessReconciliation, ReconciliationEngine};
pub use scheduler::{Readiness, Scheduler};
pub use timer::TimerHandle;
