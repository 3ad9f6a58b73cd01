use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::PgConnection;

use crate::common::{LeadId, RestaurantId, TenantId, UserId};

/// A contact request left for a restaurant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct Lead {
    pub id: LeadId,
    pub tenant_id: TenantId,
    pub restaurant_id: RestaurantId,
    pub name: String,
    pub email: String,
    pub phone: Option<String>,
    pub message: String,
    pub created_by: Option<UserId>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewLead {
    pub tenant_id: TenantId,
    pub restaurant_id: RestaurantId,
    pub name: String,
    pub email: String,
    pub phone: Option<String>,
    pub message: String,
    pub created_by: Option<UserId>,
}

impl NewLead {
    pub fn into_lead(self) -> Lead {
        Lead {
            id: LeadId::new(),
            tenant_id: self.tenant_id,
            restaurant_id: self.restaurant_id,
            name: self.name,
            email: self.email,
            phone: self.phone,
            message: self.message,
            created_by: self.created_by,
            created_at: Utc::now(),
        }
    }
}

// =============================================================================
// SQL Queries - ALL queries must be in models/
// =============================================================================

impl Lead {
    pub async fn insert(new: NewLead, conn: &mut PgConnection) -> Result<Self> {
        let lead = new.into_lead();

        let inserted = sqlx::query_as::<_, Lead>(
            r#"
            INSERT INTO leads (
                id, tenant_id, restaurant_id, name, email, phone, message, created_by, created_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            RETURNING *
            "#,
        )
        .bind(lead.id)
        .bind(lead.tenant_id)
        .bind(lead.restaurant_id)
        .bind(&lead.name)
        .bind(&lead.email)
        .bind(&lead.phone)
        .bind(&lead.message)
        .bind(lead.created_by)
        .bind(lead.created_at)
        .fetch_one(conn)
        .await?;
        Ok(inserted)
    }

    pub async fn find_by_restaurant(
        tenant_id: TenantId,
        restaurant_id: RestaurantId,
        conn: &mut PgConnection,
    ) -> Result<Vec<Self>> {
        let leads = sqlx::query_as::<_, Lead>(
            r#"
            SELECT * FROM leads
            WHERE tenant_id = $1 AND restaurant_id = $2
            ORDER BY created_at
            "#,
        )
        .bind(tenant_id)
        .bind(restaurant_id)
        .fetch_all(conn)
        .await?;
        Ok(leads)
    }
}
