use tracing::info;

use crate::domains::directory::commands::CreateRestaurant;
use crate::domains::directory::events::RestaurantCreated;
use crate::domains::directory::models::{NewRestaurant, Restaurant};
use crate::kernel::error::CommandError;
use crate::kernel::executor::{execute_command, CommandContext, CommandResponse, Mutation};
use crate::kernel::ServerDeps;

pub const SLUG_ALREADY_EXISTS: &str = "SLUG_ALREADY_EXISTS";

/// Create a restaurant in the caller's tenant.
///
/// Slug uniqueness is checked inside the transaction; the unique index on
/// `(tenant_id, slug)` backs it up for two different keys racing on one slug.
pub async fn create_restaurant<Tx: Send + 'static>(
    deps: &ServerDeps<Tx>,
    ctx: &CommandContext,
    command: CreateRestaurant,
) -> Result<CommandResponse<Restaurant>, CommandError> {
    let directory = deps.directory.clone();

    execute_command(deps, ctx, command, move |tx, input| {
        Box::pin(async move {
            let tenant_id = input.tenant()?;
            let command = input.command;

            if directory
                .find_restaurant_by_slug(tenant_id, &command.slug, tx)
                .await?
                .is_some()
            {
                return Err(slug_taken(&command.slug));
            }

            let slug = command.slug.clone();
            let restaurant = directory
                .insert_restaurant(
                    NewRestaurant {
                        tenant_id,
                        name: command.name,
                        slug: command.slug,
                        cuisine: command.cuisine,
                        created_by: input.user_id,
                    },
                    tx,
                )
                .await
                .map_err(|e| {
                    if is_unique_violation(&e) {
                        slug_taken(&slug)
                    } else {
                        CommandError::Internal(e)
                    }
                })?;

            info!(
                restaurant_id = %restaurant.id,
                tenant_id = %tenant_id,
                slug = %restaurant.slug,
                "Restaurant created"
            );

            let event = RestaurantCreated::from(&restaurant);
            Mutation::new(restaurant)
                .with_event(&event)
                .map_err(CommandError::from)
        })
    })
    .await
}

fn slug_taken(slug: &str) -> CommandError {
    CommandError::conflict(
        SLUG_ALREADY_EXISTS,
        format!("A restaurant with slug '{}' already exists", slug),
    )
}

fn is_unique_violation(err: &anyhow::Error) -> bool {
    err.downcast_ref::<sqlx::Error>()
        .and_then(|e| e.as_database_error())
        .map(|e| e.is_unique_violation())
        .unwrap_or(false)
}
