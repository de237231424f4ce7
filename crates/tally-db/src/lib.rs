//! # tally-db: Database Layer for Tally POS Sync
//!
//! SQLite persistence for the sync engine: the outbound queue, the audit
//! ledger, the syncable entities and the reconciliation records.
//!
//! ## Architecture Position
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                      Tally POS Sync Data Flow                           │
//! │                                                                         │
//! │  Processor / Webhook / Reconciliation (tally-sync)                     │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  ┌─────────────────────────────────────────────────────────────────┐   │
//! │  │                     tally-db (THIS CRATE)                       │   │
//! │  │                                                                 │   │
//! │  │   ┌───────────────┐    ┌───────────────┐    ┌──────────────┐  │   │
//! │  │   │   Database    │    │  Repositories │    │  Migrations  │  │   │
//! │  │   │   (pool.rs)   │    │               │    │  (embedded)  │  │   │
//! │  │   │               │    │ SyncQueueRepo │    │ 001_initial  │  │   │
//! │  │   │ SqlitePool    │◄───│ SyncLogRepo   │    │ 002_queue    │  │   │
//! │  │   │ WAL, FKs on   │    │ CustomerRepo  │    │ 003_loyalty  │  │   │
//! │  │   │               │    │ ...           │    │              │  │   │
//! │  │   └───────────────┘    └───────────────┘    └──────────────┘  │   │
//! │  │                                                                 │   │
//! │  └─────────────────────────────────────────────────────────────────┘   │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  ┌─────────────────────────────────────────────────────────────────┐   │
//! │  │                     SQLite Database                             │   │
//! │  └─────────────────────────────────────────────────────────────────┘   │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Module Organization
//!
//! - [`pool`] - Connection pool creation and configuration
//! - [`migrations`] - Embedded database migrations
//! - [`error`] - Database error types
//! - [`repository`] - Repository implementations
//!
//! ## Usage
//!
//! ```rust,ignore
//! use tally_db::{Database, DbConfig};
//!
//! let db = Database::new(DbConfig::new("path/to/sync.db")).await?;
//! let stats = db.queue().stats(None).await?;
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

pub mod error;
pub mod migrations;
pub mod pool;
pub mod repository;

// =============================================================================
// Re-exports
// =============================================================================

pub use error::{DbError, DbResult};
pub use pool::{Database, DbConfig};

// Repository re-exports for convenience
pub use repository::business::BusinessRepository;
pub use repository::customer::{CustomerPatch, CustomerRepository, NewCustomer};
pub use repository::queue::{Enqueued, SyncQueueRepository};
pub use repository::reconciliation::ReconciliationRepository;
pub use repository::rental::{NewRental, NewRentalItem, RentalRepository};
pub use repository::sync_log::{NewSyncLog, SyncLogRepository};
pub use repository::transaction::{NewTransaction, NewTransactionItem, TransactionRepository};
