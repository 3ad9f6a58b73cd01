//! Transaction boundary around a command's mutation, outbox write and audit write.

use anyhow::Result;
use async_trait::async_trait;
use futures::future::BoxFuture;
use sqlx::{PgPool, Postgres, Transaction};
use tracing::{debug, warn};

use crate::kernel::traits::BaseUnitOfWork;

/// Transaction handle of the Postgres unit of work.
pub type PgTx = Transaction<'static, Postgres>;

/// Run `f` inside a transaction.
///
/// Commits when `f` returns `Ok`, rolls back when it returns `Err`. Every
/// repository call made inside `f` must be given the supplied handle; a call
/// made without it runs outside the atomic unit.
///
/// ```ignore
/// let restaurant = within_transaction(deps.unit_of_work.as_ref(), move |tx| {
///     Box::pin(async move { repo.insert_restaurant(&new, tx).await })
/// })
/// .await?;
/// ```
pub async fn within_transaction<Tx, T, E, F>(
    unit_of_work: &dyn BaseUnitOfWork<Tx = Tx>,
    f: F,
) -> Result<T, E>
where
    Tx: Send + 'static,
    T: Send,
    E: From<anyhow::Error> + Send,
    F: for<'t> FnOnce(&'t mut Tx) -> BoxFuture<'t, Result<T, E>> + Send,
{
    let mut tx = unit_of_work.begin().await.map_err(E::from)?;

    let result = f(&mut tx).await;

    match result {
        Ok(value) => {
            unit_of_work.commit(tx).await.map_err(E::from)?;
            debug!("Transaction committed");
            Ok(value)
        }
        Err(err) => {
            // The original error wins; a failed rollback only gets logged
            if let Err(rollback_err) = unit_of_work.rollback(tx).await {
                warn!(error = %rollback_err, "Transaction rollback failed");
            }
            Err(err)
        }
    }
}

// =============================================================================
// PostgreSQL unit of work
// =============================================================================

#[derive(Clone)]
pub struct PgUnitOfWork {
    pool: PgPool,
}

impl PgUnitOfWork {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl BaseUnitOfWork for PgUnitOfWork {
    type Tx = PgTx;

    async fn begin(&self) -> Result<PgTx> {
        Ok(self.pool.begin().await?)
    }

    async fn commit(&self, tx: PgTx) -> Result<()> {
        tx.commit().await?;
        Ok(())
    }

    async fn rollback(&self, tx: PgTx) -> Result<()> {
        tx.rollback().await?;
        Ok(())
    }
}
