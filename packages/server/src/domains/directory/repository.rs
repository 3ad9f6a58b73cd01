//! Persistence port for the directory domain.
//!
//! Every method takes the unit-of-work transaction handle so that the
//! existence/uniqueness checks and the insert see the same snapshot as the
//! outbox and audit writes.

use anyhow::Result;
use async_trait::async_trait;

use crate::common::{RestaurantId, TenantId};
use crate::domains::directory::models::{Lead, NewLead, NewRestaurant, Restaurant};
use crate::kernel::unit_of_work::PgTx;

#[async_trait]
pub trait DirectoryRepository<Tx: Send>: Send + Sync {
    async fn find_restaurant(
        &self,
        tenant_id: TenantId,
        id: RestaurantId,
        tx: &mut Tx,
    ) -> Result<Option<Restaurant>>;

    async fn find_restaurant_by_slug(
        &self,
        tenant_id: TenantId,
        slug: &str,
        tx: &mut Tx,
    ) -> Result<Option<Restaurant>>;

    async fn insert_restaurant(&self, new: NewRestaurant, tx: &mut Tx) -> Result<Restaurant>;

    async fn insert_lead(&self, new: NewLead, tx: &mut Tx) -> Result<Lead>;
}

#[derive(Debug, Clone, Default)]
pub struct PgDirectoryRepository;

#[async_trait]
impl DirectoryRepository<PgTx> for PgDirectoryRepository {
    async fn find_restaurant(
        &self,
        tenant_id: TenantId,
        id: RestaurantId,
        tx: &mut PgTx,
    ) -> Result<Option<Restaurant>> {
        Restaurant::find_by_id(tenant_id, id, &mut **tx).await
    }

    async fn find_restaurant_by_slug(
        &self,
        tenant_id: TenantId,
        slug: &str,
        tx: &mut PgTx,
    ) -> Result<Option<Restaurant>> {
        Restaurant::find_by_slug(tenant_id, slug, &mut **tx).await
    }

    async fn insert_restaurant(&self, new: NewRestaurant, tx: &mut PgTx) -> Result<Restaurant> {
        Restaurant::insert(new, &mut **tx).await
    }

    async fn insert_lead(&self, new: NewLead, tx: &mut PgTx) -> Result<Lead> {
        Lead::insert(new, &mut **tx).await
    }
}
