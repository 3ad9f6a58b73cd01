use tracing::info;

use crate::domains::directory::commands::CreateLead;
use crate::domains::directory::events::LeadCreated;
use crate::domains::directory::models::{Lead, NewLead};
use crate::kernel::error::CommandError;
use crate::kernel::executor::{execute_command, CommandContext, CommandResponse, Mutation};
use crate::kernel::ServerDeps;

/// Record a lead against a restaurant of the caller's tenant.
pub async fn create_lead<Tx: Send + 'static>(
    deps: &ServerDeps<Tx>,
    ctx: &CommandContext,
    command: CreateLead,
) -> Result<CommandResponse<Lead>, CommandError> {
    let directory = deps.directory.clone();

    execute_command(deps, ctx, command, move |tx, input| {
        Box::pin(async move {
            let tenant_id = input.tenant()?;
            let command = input.command;

            let restaurant = directory
                .find_restaurant(tenant_id, command.restaurant_id, tx)
                .await?
                .ok_or_else(|| CommandError::not_found("Restaurant", command.restaurant_id))?;

            let lead = directory
                .insert_lead(
                    NewLead {
                        tenant_id,
                        restaurant_id: restaurant.id,
                        name: command.name,
                        email: command.email,
                        phone: command.phone,
                        message: command.message,
                        created_by: input.user_id,
                    },
                    tx,
                )
                .await?;

            info!(
                lead_id = %lead.id,
                restaurant_id = %restaurant.id,
                tenant_id = %tenant_id,
                "Lead created"
            );

            let event = LeadCreated::from(&lead);
            Mutation::new(lead)
                .with_event(&event)
                .map_err(CommandError::from)
        })
    })
    .await
}
