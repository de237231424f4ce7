//! # Transaction Repository
//!
//! Completed sales and their line items, plus the CRM synced flag.
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  insert(txn, items)      one SQLite transaction: header + lines        │
//! │  get / items             read path used to build the wire payload      │
//! │  mark_synced             synced_to_crm = 1, synced_at = now            │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use tracing::debug;
use uuid::Uuid;

use crate::error::DbResult;
use tally_core::{Transaction, TransactionItem};

const TRANSACTION_COLUMNS: &str = "id, business_id, transaction_number, customer_id, \
     subtotal_cents, tax_cents, discount_cents, total_cents, currency, payment_method, \
     points_earned, points_redeemed, status, notes, synced_to_crm, synced_at, created_at";

const ITEM_COLUMNS: &str = "id, transaction_id, product_id, product_name, sku, quantity, \
     unit_price_cents, discount_cents, tax_cents, total_cents";

/// Fields of a new transaction header.
#[derive(Debug, Clone)]
pub struct NewTransaction {
    pub business_id: String,
    pub transaction_number: String,
    pub customer_id: Option<String>,
    pub subtotal_cents: i64,
    pub tax_cents: i64,
    pub discount_cents: i64,
    pub total_cents: i64,
    pub currency: String,
    pub payment_method: String,
    pub points_earned: i64,
    pub points_redeemed: i64,
    pub status: String,
    pub notes: Option<String>,
}

impl NewTransaction {
    /// A completed cash sale in USD with no loyalty movement.
    pub fn new(
        business_id: impl Into<String>,
        transaction_number: impl Into<String>,
        customer_id: Option<String>,
        total_cents: i64,
    ) -> Self {
        NewTransaction {
            business_id: business_id.into(),
            transaction_number: transaction_number.into(),
            customer_id,
            subtotal_cents: total_cents,
            tax_cents: 0,
            discount_cents: 0,
            total_cents,
            currency: "USD".to_string(),
            payment_method: "cash".to_string(),
            points_earned: 0,
            points_redeemed: 0,
            status: "completed".to_string(),
            notes: None,
        }
    }
}

/// Fields of a new line item.
#[derive(Debug, Clone)]
pub struct NewTransactionItem {
    pub product_id: String,
    pub product_name: String,
    pub sku: Option<String>,
    pub quantity: i64,
    pub unit_price_cents: i64,
    pub discount_cents: i64,
    pub tax_cents: i64,
    pub total_cents: i64,
}

/// Repository for `transactions` and `transaction_items`.
#[derive(Debug, Clone)]
pub struct TransactionRepository {
    pool: SqlitePool,
}

impl TransactionRepository {
    /// Creates a new TransactionRepository.
    pub fn new(pool: SqlitePool) -> Self {
        TransactionRepository { pool }
    }

    /// Inserts a transaction and its items atomically.
    pub async fn insert(
        &self,
        new: &NewTransaction,
        items: &[NewTransactionItem],
    ) -> DbResult<Transaction> {
        let txn = Transaction {
            id: Uuid::new_v4().to_string(),
            business_id: new.business_id.clone(),
            transaction_number: new.transaction_number.clone(),
            customer_id: new.customer_id.clone(),
            subtotal_cents: new.subtotal_cents,
            tax_cents: new.tax_cents,
            discount_cents: new.discount_cents,
            total_cents: new.total_cents,
            currency: new.currency.clone(),
            payment_method: new.payment_method.clone(),
            points_earned: new.points_earned,
            points_redeemed: new.points_redeemed,
            status: new.status.clone(),
            notes: new.notes.clone(),
            synced_to_crm: false,
            synced_at: None,
            created_at: Utc::now(),
        };

        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            INSERT INTO transactions (
                id, business_id, transaction_number, customer_id,
                subtotal_cents, tax_cents, discount_cents, total_cents,
                currency, payment_method, points_earned, points_redeemed,
                status, notes, synced_to_crm, synced_at, created_at
            ) VALUES (
                ?1, ?2, ?3, ?4,
                ?5, ?6, ?7, ?8,
                ?9, ?10, ?11, ?12,
                ?13, ?14, 0, NULL, ?15
            )
            "#,
        )
        .bind(&txn.id)
        .bind(&txn.business_id)
        .bind(&txn.transaction_number)
        .bind(&txn.customer_id)
        .bind(txn.subtotal_cents)
        .bind(txn.tax_cents)
        .bind(txn.discount_cents)
        .bind(txn.total_cents)
        .bind(&txn.currency)
        .bind(&txn.payment_method)
        .bind(txn.points_earned)
        .bind(txn.points_redeemed)
        .bind(&txn.status)
        .bind(&txn.notes)
        .bind(txn.created_at)
        .execute(&mut *tx)
        .await?;

        for item in items {
            sqlx::query(
                r#"
                INSERT INTO transaction_items (
                    id, transaction_id, product_id, product_name, sku, quantity,
                    unit_price_cents, discount_cents, tax_cents, total_cents
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
                "#,
            )
            .bind(Uuid::new_v4().to_string())
            .bind(&txn.id)
            .bind(&item.product_id)
            .bind(&item.product_name)
            .bind(&item.sku)
            .bind(item.quantity)
            .bind(item.unit_price_cents)
            .bind(item.discount_cents)
            .bind(item.tax_cents)
            .bind(item.total_cents)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;

        debug!(
            transaction_id = %txn.id,
            number = %txn.transaction_number,
            items = items.len(),
            "Transaction inserted"
        );
        Ok(txn)
    }

    /// Gets a transaction by id.
    pub async fn get(&self, id: &str) -> DbResult<Option<Transaction>> {
        let sql = format!("SELECT {TRANSACTION_COLUMNS} FROM transactions WHERE id = ?1");
        let txn = sqlx::query_as::<_, Transaction>(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(txn)
    }

    /// Line items of a transaction, in insertion order.
    pub async fn items(&self, transaction_id: &str) -> DbResult<Vec<TransactionItem>> {
        let sql = format!(
            "SELECT {ITEM_COLUMNS} FROM transaction_items WHERE transaction_id = ?1 ORDER BY rowid"
        );
        let items = sqlx::query_as::<_, TransactionItem>(&sql)
            .bind(transaction_id)
            .fetch_all(&self.pool)
            .await?;
        Ok(items)
    }

    /// Flags the transaction as delivered to the CRM.
    pub async fn mark_synced(&self, id: &str, now: DateTime<Utc>) -> DbResult<()> {
        sqlx::query("UPDATE transactions SET synced_to_crm = 1, synced_at = ?2 WHERE id = ?1")
            .bind(id)
            .bind(now)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}
