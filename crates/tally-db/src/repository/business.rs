//! # Business Repository
//!
//! Local businesses and their CRM tenant mapping.

use chrono::Utc;
use sqlx::SqlitePool;
use tracing::info;
use uuid::Uuid;

use crate::error::DbResult;
use tally_core::Business;

const BUSINESS_COLUMNS: &str = "id, name, crm_tenant_id, is_active, created_at";

/// Repository for the `businesses` table.
#[derive(Debug, Clone)]
pub struct BusinessRepository {
    pool: SqlitePool,
}

impl BusinessRepository {
    /// Creates a new BusinessRepository.
    pub fn new(pool: SqlitePool) -> Self {
        BusinessRepository { pool }
    }

    /// Inserts a business, optionally already mapped to a CRM tenant.
    pub async fn insert(&self, name: &str, crm_tenant_id: Option<&str>) -> DbResult<Business> {
        let business = Business {
            id: Uuid::new_v4().to_string(),
            name: name.to_string(),
            crm_tenant_id: crm_tenant_id.map(str::to_string),
            is_active: true,
            created_at: Utc::now(),
        };

        sqlx::query(
            r#"
            INSERT INTO businesses (id, name, crm_tenant_id, is_active, created_at)
            VALUES (?1, ?2, ?3, ?4, ?5)
            "#,
        )
        .bind(&business.id)
        .bind(&business.name)
        .bind(&business.crm_tenant_id)
        .bind(business.is_active)
        .bind(business.created_at)
        .execute(&self.pool)
        .await?;

        info!(business_id = %business.id, mapped = business.crm_tenant_id.is_some(), "Business created");
        Ok(business)
    }

    /// Gets a business by id.
    pub async fn get(&self, id: &str) -> DbResult<Option<Business>> {
        let sql = format!("SELECT {BUSINESS_COLUMNS} FROM businesses WHERE id = ?1");
        let business = sqlx::query_as::<_, Business>(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(business)
    }

    /// Resolves a CRM tenant id to the local business.
    pub async fn find_by_crm_tenant(&self, crm_tenant_id: &str) -> DbResult<Option<Business>> {
        let sql = format!("SELECT {BUSINESS_COLUMNS} FROM businesses WHERE crm_tenant_id = ?1");
        let business = sqlx::query_as::<_, Business>(&sql)
            .bind(crm_tenant_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(business)
    }

    /// Active businesses that have a CRM tenant mapping.
    pub async fn list_mapped(&self) -> DbResult<Vec<Business>> {
        let sql = format!(
            "SELECT {BUSINESS_COLUMNS} FROM businesses \
             WHERE crm_tenant_id IS NOT NULL AND is_active = 1 \
             ORDER BY created_at ASC"
        );
        let businesses = sqlx::query_as::<_, Business>(&sql)
            .fetch_all(&self.pool)
            .await?;
        Ok(businesses)
    }

    /// Sets or clears the CRM tenant mapping.
    pub async fn set_crm_tenant(&self, id: &str, crm_tenant_id: Option<&str>) -> DbResult<()> {
        sqlx::query("UPDATE businesses SET crm_tenant_id = ?2 WHERE id = ?1")
            .bind(id)
            .bind(crm_tenant_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use crate::error::DbError;
    use crate::pool::{Database, DbConfig};

    #[tokio::test]
    async fn test_tenant_mapping() {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        let repo = db.businesses();

        let mapped = repo.insert("Main St", Some("tenant-a")).await.unwrap();
        let unmapped = repo.insert("Pop-up", None).await.unwrap();

        let found = repo.find_by_crm_tenant("tenant-a").await.unwrap().unwrap();
        assert_eq!(found.id, mapped.id);
        assert!(repo.find_by_crm_tenant("tenant-x").await.unwrap().is_none());

        let listed = repo.list_mapped().await.unwrap();
        assert_eq!(listed.len(), 1);

        repo.set_crm_tenant(&unmapped.id, Some("tenant-b")).await.unwrap();
        assert_eq!(repo.list_mapped().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_tenant_id_is_unique() {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        let repo = db.businesses();

        repo.insert("A", Some("tenant-a")).await.unwrap();
        let err = repo.insert("B", Some("tenant-a")).await.unwrap_err();
        assert!(matches!(err, DbError::UniqueViolation { .. }));
    }
}
