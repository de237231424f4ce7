//! # Customer Repository
//!
//! Local customer records and their CRM mapping state.
//!
//! ## Identity Lookups
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  by local id        get(id)                   outbound sync, updated   │
//! │  by remote id       find_by_external_id(..)   created replay, deleted  │
//! │  by contact         find_by_contact(..)       created (first sighting) │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::DbResult;
use tally_core::{Customer, CustomerSyncState};

const CUSTOMER_COLUMNS: &str = "id, business_id, first_name, last_name, email, phone, address, \
     city, state, postal_code, loyalty_points, loyalty_tier, total_spent_cents, visit_count, \
     marketing_opt_in, is_anonymous, is_active, external_id, sync_state, last_synced_at, \
     created_at, updated_at";

// =============================================================================
// Input Types
// =============================================================================

/// Fields of a new customer row.
#[derive(Debug, Clone, Default)]
pub struct NewCustomer {
    pub business_id: String,
    pub first_name: String,
    pub last_name: String,
    pub email: Option<String>,
    pub phone: Option<String>,
    pub address: Option<String>,
    pub city: Option<String>,
    pub state: Option<String>,
    pub postal_code: Option<String>,
    pub loyalty_points: i64,
    pub loyalty_tier: Option<String>,
    pub total_spent_cents: i64,
    pub visit_count: i64,
    pub marketing_opt_in: bool,
    pub is_anonymous: bool,
    pub external_id: Option<String>,
    pub sync_state: CustomerSyncState,
}

impl NewCustomer {
    pub fn new(
        business_id: impl Into<String>,
        first_name: impl Into<String>,
        last_name: impl Into<String>,
    ) -> Self {
        NewCustomer {
            business_id: business_id.into(),
            first_name: first_name.into(),
            last_name: last_name.into(),
            ..Default::default()
        }
    }

    /// The walk-in placeholder customer.
    pub fn anonymous(business_id: impl Into<String>) -> Self {
        NewCustomer {
            is_anonymous: true,
            ..NewCustomer::new(business_id, "Walk-in", "Customer")
        }
    }
}

/// A partial update: `None` leaves the stored value untouched.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CustomerPatch {
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub email: Option<String>,
    pub phone: Option<String>,
    pub address: Option<String>,
    pub city: Option<String>,
    pub state: Option<String>,
    pub postal_code: Option<String>,
    pub loyalty_points: Option<i64>,
    pub loyalty_tier: Option<String>,
    pub total_spent_cents: Option<i64>,
    pub visit_count: Option<i64>,
    pub marketing_opt_in: Option<bool>,
    pub is_active: Option<bool>,
    pub external_id: Option<String>,
}

// =============================================================================
// Repository
// =============================================================================

/// Repository for the `customers` table.
#[derive(Debug, Clone)]
pub struct CustomerRepository {
    pool: SqlitePool,
}

impl CustomerRepository {
    /// Creates a new CustomerRepository.
    pub fn new(pool: SqlitePool) -> Self {
        CustomerRepository { pool }
    }

    /// Inserts a customer.
    pub async fn insert(&self, new: &NewCustomer) -> DbResult<Customer> {
        let now = Utc::now();
        let customer = Customer {
            id: Uuid::new_v4().to_string(),
            business_id: new.business_id.clone(),
            first_name: new.first_name.clone(),
            last_name: new.last_name.clone(),
            email: new.email.clone(),
            phone: new.phone.clone(),
            address: new.address.clone(),
            city: new.city.clone(),
            state: new.state.clone(),
            postal_code: new.postal_code.clone(),
            loyalty_points: new.loyalty_points,
            loyalty_tier: new.loyalty_tier.clone(),
            total_spent_cents: new.total_spent_cents,
            visit_count: new.visit_count,
            marketing_opt_in: new.marketing_opt_in,
            is_anonymous: new.is_anonymous,
            is_active: true,
            external_id: new.external_id.clone(),
            sync_state: new.sync_state,
            last_synced_at: (new.sync_state == CustomerSyncState::Synced).then_some(now),
            created_at: now,
            updated_at: now,
        };

        sqlx::query(
            r#"
            INSERT INTO customers (
                id, business_id, first_name, last_name, email, phone, address,
                city, state, postal_code, loyalty_points, loyalty_tier,
                total_spent_cents, visit_count, marketing_opt_in, is_anonymous,
                is_active, external_id, sync_state, last_synced_at, created_at, updated_at
            ) VALUES (
                ?1, ?2, ?3, ?4, ?5, ?6, ?7,
                ?8, ?9, ?10, ?11, ?12,
                ?13, ?14, ?15, ?16,
                ?17, ?18, ?19, ?20, ?21, ?22
            )
            "#,
        )
        .bind(&customer.id)
        .bind(&customer.business_id)
        .bind(&customer.first_name)
        .bind(&customer.last_name)
        .bind(&customer.email)
        .bind(&customer.phone)
        .bind(&customer.address)
        .bind(&customer.city)
        .bind(&customer.state)
        .bind(&customer.postal_code)
        .bind(customer.loyalty_points)
        .bind(&customer.loyalty_tier)
        .bind(customer.total_spent_cents)
        .bind(customer.visit_count)
        .bind(customer.marketing_opt_in)
        .bind(customer.is_anonymous)
        .bind(customer.is_active)
        .bind(&customer.external_id)
        .bind(customer.sync_state)
        .bind(customer.last_synced_at)
        .bind(customer.created_at)
        .bind(customer.updated_at)
        .execute(&self.pool)
        .await?;

        debug!(customer_id = %customer.id, anonymous = customer.is_anonymous, "Customer inserted");
        Ok(customer)
    }

    /// Gets a customer by local id.
    pub async fn get(&self, id: &str) -> DbResult<Option<Customer>> {
        let sql = format!("SELECT {CUSTOMER_COLUMNS} FROM customers WHERE id = ?1");
        let customer = sqlx::query_as::<_, Customer>(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(customer)
    }

    /// Gets a customer of a business by the CRM-assigned id.
    pub async fn find_by_external_id(
        &self,
        business_id: &str,
        external_id: &str,
    ) -> DbResult<Option<Customer>> {
        let sql = format!(
            "SELECT {CUSTOMER_COLUMNS} FROM customers \
             WHERE business_id = ?1 AND external_id = ?2"
        );
        let customer = sqlx::query_as::<_, Customer>(&sql)
            .bind(business_id)
            .bind(external_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(customer)
    }

    /// Finds a customer of a business by email, then by phone.
    ///
    /// Active records win over deactivated ones, then the oldest wins.
    pub async fn find_by_contact(
        &self,
        business_id: &str,
        email: Option<&str>,
        phone: Option<&str>,
    ) -> DbResult<Option<Customer>> {
        if let Some(email) = email {
            let sql = format!(
                "SELECT {CUSTOMER_COLUMNS} FROM customers \
                 WHERE business_id = ?1 AND lower(email) = lower(?2) \
                 ORDER BY is_active DESC, created_at ASC LIMIT 1"
            );
            let found = sqlx::query_as::<_, Customer>(&sql)
                .bind(business_id)
                .bind(email)
                .fetch_optional(&self.pool)
                .await?;
            if found.is_some() {
                return Ok(found);
            }
        }

        if let Some(phone) = phone {
            let sql = format!(
                "SELECT {CUSTOMER_COLUMNS} FROM customers \
                 WHERE business_id = ?1 AND phone = ?2 \
                 ORDER BY is_active DESC, created_at ASC LIMIT 1"
            );
            let found = sqlx::query_as::<_, Customer>(&sql)
                .bind(business_id)
                .bind(phone)
                .fetch_optional(&self.pool)
                .await?;
            return Ok(found);
        }

        Ok(None)
    }

    /// Active, non-anonymous customers of a business that have a remote id.
    pub async fn list_reconcilable(&self, business_id: &str) -> DbResult<Vec<Customer>> {
        let sql = format!(
            "SELECT {CUSTOMER_COLUMNS} FROM customers \
             WHERE business_id = ?1 AND is_active = 1 AND is_anonymous = 0 \
               AND external_id IS NOT NULL \
             ORDER BY created_at ASC"
        );
        let customers = sqlx::query_as::<_, Customer>(&sql)
            .bind(business_id)
            .fetch_all(&self.pool)
            .await?;
        Ok(customers)
    }

    /// Records a successful outbound sync. A `None` remote id keeps the
    /// stored mapping.
    pub async fn mark_synced(
        &self,
        id: &str,
        external_id: Option<&str>,
        now: DateTime<Utc>,
    ) -> DbResult<()> {
        sqlx::query(
            r#"
            UPDATE customers SET
                external_id = COALESCE(?2, external_id),
                sync_state = 'SYNCED',
                last_synced_at = ?3
            WHERE id = ?1
            "#,
        )
        .bind(id)
        .bind(external_id)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Records a terminal outbound failure.
    pub async fn mark_sync_failed(&self, id: &str) -> DbResult<()> {
        sqlx::query("UPDATE customers SET sync_state = 'FAILED' WHERE id = ?1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Overwrites the local point balance.
    pub async fn update_loyalty_points(
        &self,
        id: &str,
        points: i64,
        now: DateTime<Utc>,
    ) -> DbResult<()> {
        sqlx::query("UPDATE customers SET loyalty_points = ?2, updated_at = ?3 WHERE id = ?1")
            .bind(id)
            .bind(points)
            .bind(now)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Applies the present fields of a patch and marks the record SYNCED.
    pub async fn apply_patch(
        &self,
        id: &str,
        patch: &CustomerPatch,
        now: DateTime<Utc>,
    ) -> DbResult<()> {
        sqlx::query(
            r#"
            UPDATE customers SET
                first_name        = COALESCE(?2, first_name),
                last_name         = COALESCE(?3, last_name),
                email             = COALESCE(?4, email),
                phone             = COALESCE(?5, phone),
                address           = COALESCE(?6, address),
                city              = COALESCE(?7, city),
                state             = COALESCE(?8, state),
                postal_code       = COALESCE(?9, postal_code),
                loyalty_points    = COALESCE(?10, loyalty_points),
                loyalty_tier      = COALESCE(?11, loyalty_tier),
                total_spent_cents = COALESCE(?12, total_spent_cents),
                visit_count       = COALESCE(?13, visit_count),
                marketing_opt_in  = COALESCE(?14, marketing_opt_in),
                is_active         = COALESCE(?15, is_active),
                external_id       = COALESCE(?16, external_id),
                sync_state        = 'SYNCED',
                last_synced_at    = ?17,
                updated_at        = ?17
            WHERE id = ?1
            "#,
        )
        .bind(id)
        .bind(&patch.first_name)
        .bind(&patch.last_name)
        .bind(&patch.email)
        .bind(&patch.phone)
        .bind(&patch.address)
        .bind(&patch.city)
        .bind(&patch.state)
        .bind(&patch.postal_code)
        .bind(patch.loyalty_points)
        .bind(&patch.loyalty_tier)
        .bind(patch.total_spent_cents)
        .bind(patch.visit_count)
        .bind(patch.marketing_opt_in)
        .bind(patch.is_active)
        .bind(&patch.external_id)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Soft-deactivates a customer. The remote id mapping is kept.
    ///
    /// Returns false when the record was already inactive.
    pub async fn deactivate(&self, id: &str, now: DateTime<Utc>) -> DbResult<bool> {
        let result = sqlx::query(
            "UPDATE customers SET is_active = 0, updated_at = ?2 WHERE id = ?1 AND is_active = 1",
        )
        .bind(id)
        .bind(now)
        .execute(&self.pool)
        .await?;

        let changed = result.rows_affected() == 1;
        if changed {
            info!(customer_id = %id, "Customer deactivated");
        }
        Ok(changed)
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
