//! # Repository Module
//!
//! One repository per table group, all handed out by [`crate::Database`].
//!
//! ## Repository Pattern
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                    Who Uses Which Repository                            │
//! │                                                                         │
//! │  Enqueuer / Processor ──► SyncQueueRepository                          │
//! │                           ├── enqueue (dedup on insert)                │
//! │                           ├── due_items (dispatch order)               │
//! │                           └── mark_* / defer / recover_stuck           │
//! │                                                                         │
//! │  CRM adapter ──────────► SyncLogRepository (audit every call)          │
//! │                         Customer / Transaction / Rental repositories   │
//! │                           (read entity, write synced flags)            │
//! │                                                                         │
//! │  Reconciliation ───────► CustomerRepository + ReconciliationRepository │
//! │                                                                         │
//! │  Webhook receiver ─────► BusinessRepository (tenant → business)        │
//! │                         CustomerRepository (upsert / deactivate)      │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Available Repositories
//!
//! - [`queue::SyncQueueRepository`] - Outbound work queue
//! - [`sync_log::SyncLogRepository`] - Sync audit ledger
//! - [`business::BusinessRepository`] - Tenant mapping
//! - [`customer::CustomerRepository`] - Customers
//! - [`transaction::TransactionRepository`] - Sales and line items
//! - [`rental::RentalRepository`] - Rental contracts
//! - [`reconciliation::ReconciliationRepository`] - Loyalty drift records

pub mod business;
pub mod customer;
pub mod queue;
pub mod reconciliation;
pub mod rental;
pub mod sync_log;
pub mod transaction;
