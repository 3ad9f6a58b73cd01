use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::PgConnection;

use crate::common::{RestaurantId, TenantId, UserId};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct Restaurant {
    pub id: RestaurantId,
    pub tenant_id: TenantId,
    pub name: String,
    /// Lower-case, unique per tenant.
    pub slug: String,
    pub cuisine: Option<String>,
    pub created_by: Option<UserId>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewRestaurant {
    pub tenant_id: TenantId,
    pub name: String,
    pub slug: String,
    pub cuisine: Option<String>,
    pub created_by: Option<UserId>,
}

impl NewRestaurant {
    pub fn into_restaurant(self) -> Restaurant {
        Restaurant {
            id: RestaurantId::new(),
            tenant_id: self.tenant_id,
            name: self.name,
            slug: self.slug,
            cuisine: self.cuisine,
            created_by: self.created_by,
            created_at: Utc::now(),
        }
    }
}

// =============================================================================
// SQL Queries - ALL queries must be in models/
// =============================================================================

impl Restaurant {
    pub async fn find_by_id(
        tenant_id: TenantId,
        id: RestaurantId,
        conn: &mut PgConnection,
    ) -> Result<Option<Self>> {
        let restaurant = sqlx::query_as::<_, Restaurant>(
            "SELECT * FROM restaurants WHERE tenant_id = $1 AND id = $2",
        )
        .bind(tenant_id)
        .bind(id)
        .fetch_optional(conn)
        .await?;
        Ok(restaurant)
    }

    pub async fn find_by_slug(
        tenant_id: TenantId,
        slug: &str,
        conn: &mut PgConnection,
    ) -> Result<Option<Self>> {
        let restaurant = sqlx::query_as::<_, Restaurant>(
            "SELECT * FROM restaurants WHERE tenant_id = $1 AND slug = $2",
        )
        .bind(tenant_id)
        .bind(slug)
        .fetch_optional(conn)
        .await?;
        Ok(restaurant)
    }

    pub async fn insert(new: NewRestaurant, conn: &mut PgConnection) -> Result<Self> {
        let restaurant = new.into_restaurant();

        let inserted = sqlx::query_as::<_, Restaurant>(
            r#"
            INSERT INTO restaurants (id, tenant_id, name, slug, cuisine, created_by, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            RETURNING *
            "#,
        )
        .bind(restaurant.id)
        .bind(restaurant.tenant_id)
        .bind(&restaurant.name)
        .bind(&restaurant.slug)
        .bind(&restaurant.cuisine)
        .bind(restaurant.created_by)
        .bind(restaurant.created_at)
        .fetch_one(conn)
        .await?;
        Ok(inserted)
    }

    pub async fn find_all_for_tenant(tenant_id: TenantId, conn: &mut PgConnection) -> Result<Vec<Self>> {
        let restaurants = sqlx::query_as::<_, Restaurant>(
            "SELECT * FROM restaurants WHERE tenant_id = $1 ORDER BY created_at",
        )
        .bind(tenant_id)
        .fetch_all(conn)
        .await?;
        Ok(restaurants)
    }
}
