//! # Rental Repository
//!
//! Rental contracts, their rented lines, and the CRM synced flag.

use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use tracing::debug;
use uuid::Uuid;

use crate::error::DbResult;
use tally_core::{Rental, RentalItem};

const RENTAL_COLUMNS: &str = "id, business_id, contract_number, customer_id, status, start_date, \
     due_date, returned_at, deposit_cents, total_cents, synced_to_crm, synced_at, created_at";

const ITEM_COLUMNS: &str = "id, rental_id, product_id, product_name, sku, quantity, daily_rate_cents";

/// Fields of a new rental contract.
#[derive(Debug, Clone)]
pub struct NewRental {
    pub business_id: String,
    pub contract_number: String,
    pub customer_id: Option<String>,
    pub status: String,
    pub start_date: DateTime<Utc>,
    pub due_date: DateTime<Utc>,
    pub deposit_cents: i64,
    pub total_cents: i64,
}

/// Fields of a new rented line.
#[derive(Debug, Clone)]
pub struct NewRentalItem {
    pub product_id: String,
    pub product_name: String,
    pub sku: Option<String>,
    pub quantity: i64,
    pub daily_rate_cents: i64,
}

/// Repository for `rentals` and `rental_items`.
#[derive(Debug, Clone)]
pub struct RentalRepository {
    pool: SqlitePool,
}

impl RentalRepository {
    /// Creates a new RentalRepository.
    pub fn new(pool: SqlitePool) -> Self {
        RentalRepository { pool }
    }

    /// Inserts a rental and its lines atomically.
    pub async fn insert(&self, new: &NewRental, items: &[NewRentalItem]) -> DbResult<Rental> {
        let rental = Rental {
            id: Uuid::new_v4().to_string(),
            business_id: new.business_id.clone(),
            contract_number: new.contract_number.clone(),
            customer_id: new.customer_id.clone(),
            status: new.status.clone(),
            start_date: new.start_date,
            due_date: new.due_date,
            returned_at: None,
            deposit_cents: new.deposit_cents,
            total_cents: new.total_cents,
            synced_to_crm: false,
            synced_at: None,
            created_at: Utc::now(),
        };

        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            INSERT INTO rentals (
                id, business_id, contract_number, customer_id, status,
                start_date, due_date, returned_at, deposit_cents, total_cents,
                synced_to_crm, synced_at, created_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, NULL, ?8, ?9, 0, NULL, ?10)
            "#,
        )
        .bind(&rental.id)
        .bind(&rental.business_id)
        .bind(&rental.contract_number)
        .bind(&rental.customer_id)
        .bind(&rental.status)
        .bind(rental.start_date)
        .bind(rental.due_date)
        .bind(rental.deposit_cents)
        .bind(rental.total_cents)
        .bind(rental.created_at)
        .execute(&mut *tx)
        .await?;

        for item in items {
            sqlx::query(
                r#"
                INSERT INTO rental_items (
                    id, rental_id, product_id, product_name, sku, quantity, daily_rate_cents
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                "#,
            )
            .bind(Uuid::new_v4().to_string())
            .bind(&rental.id)
            .bind(&item.product_id)
            .bind(&item.product_name)
            .bind(&item.sku)
            .bind(item.quantity)
            .bind(item.daily_rate_cents)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;

        debug!(rental_id = %rental.id, contract = %rental.contract_number, "Rental inserted");
        Ok(rental)
    }

    /// Gets a rental by id.
    pub async fn get(&self, id: &str) -> DbResult<Option<Rental>> {
        let sql = format!("SELECT {RENTAL_COLUMNS} FROM rentals WHERE id = ?1");
        let rental = sqlx::query_as::<_, Rental>(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(rental)
    }

    /// Rented lines of a contract, in insertion order.
    pub async fn items(&self, rental_id: &str) -> DbResult<Vec<RentalItem>> {
        let sql = format!("SELECT {ITEM_COLUMNS} FROM rental_items WHERE rental_id = ?1 ORDER BY rowid");
        let items = sqlx::query_as::<_, RentalItem>(&sql)
            .bind(rental_id)
            .fetch_all(&self.pool)
            .await?;
        Ok(items)
    }

    /// Records the return of the rented goods.
    pub async fn mark_returned(&self, id: &str, returned_at: DateTime<Utc>) -> DbResult<()> {
        sqlx::query("UPDATE rentals SET status = 'returned', returned_at = ?2 WHERE id = ?1")
            .bind(id)
            .bind(returned_at)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Flags the rental as delivered to the CRM.
    pub async fn mark_synced(&self, id: &str, now: DateTime<Utc>) -> DbResult<()> {
        sqlx::query("UPDATE rentals SET synced_to_crm = 1, synced_at = ?2 WHERE id = ?1")
            .bind(id)
            .bind(now)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use chrono::Duration;

    use crate::pool::{Database, DbConfig};

    use super::*;

    #[tokio::test]
    async fn test_rental_lifecycle() {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        let biz = db.businesses().insert("Main St", None).await.unwrap();
        let repo = db.rentals();
        let start = Utc::now();

        let rental = repo
            .insert(
                &NewRental {
                    business_id: biz.id.clone(),
                    contract_number: "R-100".into(),
                    customer_id: None,
                    status: "active".into(),
                    start_date: start,
                    due_date: start + Duration::days(3),
                    deposit_cents: 5000,
                    total_cents: 4500,
                },
                &[NewRentalItem {
                    product_id: "p-kayak".into(),
                    product_name: "Kayak".into(),
                    sku: Some("KYK-1".into()),
                    quantity: 1,
                    daily_rate_cents: 1500,
                }],
            )
            .await
            .unwrap();

        assert_eq!(repo.items(&rental.id).await.unwrap().len(), 1);

        repo.mark_returned(&rental.id, start + Duration::days(2)).await.unwrap();
        repo.mark_synced(&rental.id, Utc::now()).await.unwrap();

        let stored = repo.get(&rental.id).await.unwrap().unwrap();
        assert_eq!(stored.status, "returned");
        assert!(stored.returned_at.is_some());
        assert!(stored.synced_to_crm);
    }
}
