// SPDX-License-Identifier: MIT

//! Subscription-management CLI: a separate invocation mode of the binary for
//! creating, listing, inspecting and deleting Strava webhook subscriptions.

use anyhow::Context;
use clap::{Parser, Subcommand};

use crate::config::Config;
use crate::db::Store;
use crate::error::AppError;
use crate::services::StravaClient;

/// Durable Strava ingestion relay.
#[derive(Debug, Parser)]
#[command(name = "strava-relay", version, about)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Manage Strava webhook subscriptions
    Subscriptions {
        #[command(subcommand)]
        action: SubscriptionAction,
    },
}

#[derive(Debug, Subcommand)]
pub enum SubscriptionAction {
    /// List active webhook subscriptions
    List {
        /// Credential set to act on (defaults to primary)
        #[arg(long)]
        credential_set: Option<String>,
    },
    /// Create a webhook subscription pointing at this relay
    Create {
        #[arg(long)]
        credential_set: Option<String>,
    },
    /// Show one webhook subscription by id
    View {
        subscription_id: i64,
        #[arg(long)]
        credential_set: Option<String>,
    },
    /// Delete a webhook subscription by id
    Delete {
        subscription_id: i64,
        #[arg(long)]
        credential_set: Option<String>,
    },
}

/// Run a subscription command against the Strava API.
pub async fn run(action: SubscriptionAction, config: Config) -> anyhow::Result<()> {
    let credential_set = match &action {
        SubscriptionAction::List { credential_set }
        | SubscriptionAction::Create { credential_set }
        | SubscriptionAction::View { credential_set, .. }
        | SubscriptionAction::Delete { credential_set, .. } => credential_set
            .clone()
            .unwrap_or_else(|| config.default_credential_set().to_string()),
    };

    if !config.has_credential_set(&credential_set) {
        anyhow::bail!(
            "unknown credential set: {credential_set} (available: {})",
            config.credential_set_names().join(", ")
        );
    }

    let db = Store::open(&config.database_path)
        .await
        .context("failed to open database")?;
    let client = StravaClient::new(config.clone(), db);

    match action {
        SubscriptionAction::List { .. } => list_subscriptions(&client, &credential_set).await,
        SubscriptionAction::Create { .. } => {
            create_subscription(&client, &config, &credential_set).await
        }
        SubscriptionAction::View { subscription_id, .. } => {
            view_subscription(&client, subscription_id, &credential_set).await
        }
        SubscriptionAction::Delete { subscription_id, .. } => {
            delete_subscription(&client, subscription_id, &credential_set).await
        }
    }
}

async fn list_subscriptions(client: &StravaClient, credential_set: &str) -> anyhow::Result<()> {
    println!("Fetching subscriptions for credential set: {credential_set}");

    let subscriptions = client
        .list_subscriptions(credential_set)
        .await
        .context("failed to list subscriptions")?;

    if subscriptions.is_empty() {
        println!("No active subscriptions found.");
        return Ok(());
    }

    println!("\nFound {} subscription(s):\n", subscriptions.len());
    for sub in subscriptions {
        println!("ID: {}", sub.id);
        println!("  Application ID: {}", sub.application_id);
        println!("  Callback URL: {}", sub.callback_url);
        println!("  Created: {}", sub.created_at);
        println!("  Updated: {}", sub.updated_at);
        println!();
    }

    Ok(())
}

async fn create_subscription(
    client: &StravaClient,
    config: &Config,
    credential_set: &str,
) -> anyhow::Result<()> {
    let creds = config
        .credential_set(credential_set)
        .expect("credential set validated by caller");

    let callback_url = format!("https://{}/webhook-callback/{credential_set}", config.domain);

    println!("Creating webhook subscription...");
    println!("Credential set: {credential_set}");
    println!("Callback URL: {callback_url}");
    println!();

    let subscription = client
        .create_subscription(&callback_url, &creds.verify_token, credential_set)
        .await
        .context("subscription creation failed")?;

    println!("Subscription created successfully!");
    println!("  ID: {}", subscription.id);

    Ok(())
}

async fn view_subscription(
    client: &StravaClient,
    subscription_id: i64,
    credential_set: &str,
) -> anyhow::Result<()> {
    println!("Fetching subscription {subscription_id} (credential set: {credential_set})...");

    match client.view_subscription(subscription_id, credential_set).await {
        Ok(sub) => {
            println!();
            println!("ID: {}", sub.id);
            println!("  Application ID: {}", sub.application_id);
            println!("  Callback URL: {}", sub.callback_url);
            println!("  Created: {}", sub.created_at);
            println!("  Updated: {}", sub.updated_at);
            Ok(())
        }
        Err(AppError::NotFound(_)) => {
            anyhow::bail!("subscription {subscription_id} not found")
        }
        Err(err) => Err(err).context("failed to view subscription"),
    }
}

async fn delete_subscription(
    client: &StravaClient,
    subscription_id: i64,
    credential_set: &str,
) -> anyhow::Result<()> {
    println!("Deleting subscription {subscription_id} (credential set: {credential_set})...");

    match client.delete_subscription(subscription_id, credential_set).await {
        Ok(()) => {
            println!("Subscription deleted successfully!");
            Ok(())
        }
        Err(AppError::NotFound(_)) => {
            anyhow::bail!("subscription {subscription_id} not found")
        }
        Err(err) => Err(err).context("failed to delete subscription"),
    }
}
