//! Asset hub projector and operator tooling.

use anyhow::{Context, Result};
use asset_hub_core::auth::{Hs256Verifier, TokenVerifier};
use asset_hub_core::broker::{EventBroker, RedisStreamBroker};
use asset_hub_core::cache::RedisCacheStore;
use asset_hub_core::config::Config;
use asset_hub_core::deadletter::{self, RedisDeadLetters};
use asset_hub_core::events::Topic;
use asset_hub_core::grants::PgGrantStore;
use asset_hub_core::projector::{self, CacheProjector};
use asset_hub_core::{AccessService, Permission, ResourceRef};
use clap::{Parser, Subcommand};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "asset-hub")]
#[command(about = "Access control and cache projection for folders, notes and teams")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Consume domain events and project them into the cache
    Project {
        /// Health and stats listen address
        #[arg(short, long, default_value = "0.0.0.0:8080")]
        addr: String,

        /// Consumer name inside the group
        #[arg(short, long)]
        consumer: Option<String>,
    },

    /// Re-publish dead-lettered records of one topic
    ReplayDeadLetters {
        #[arg(short, long)]
        topic: Topic,

        #[arg(short, long, default_value_t = 100)]
        batch: usize,
    },

    /// Verify an access token and print the principal it carries
    Whoami {
        #[arg(short, long)]
        token: String,
    },

    /// Grant a principal access to a folder or note
    Share {
        /// Access token of the principal performing the change
        #[arg(short, long)]
        token: String,

        /// Resource as `folder:<id>` or `note:<id>`
        #[arg(short, long)]
        resource: ResourceRef,

        #[arg(short, long)]
        grantee: String,

        #[arg(short, long, default_value = "read")]
        permission: Permission,
    },

    /// Revoke a principal's share on a folder or note
    Unshare {
        #[arg(short, long)]
        token: String,

        #[arg(short, long)]
        resource: ResourceRef,

        #[arg(short, long)]
        grantee: String,
    },

    /// Create the relational schema if it does not exist
    InitSchema,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let config = Config::from_env()?;

    match cli.command {
        Commands::Project { addr, consumer } => {
            let mut config = config;
            if let Some(consumer) = consumer {
                config.consumer_name = consumer;
            }
            run_projector(addr.parse()?, config).await?;
        }
        Commands::ReplayDeadLetters { topic, batch } => {
            replay_dead_letters(topic, batch, config).await?;
        }
        Commands::Whoami { token } => {
            let verifier = Hs256Verifier::new(config.require_jwt_secret()?);
            let principal = verifier
                .verify(&token)
                .await
                .context("token rejected")?;
            println!("{}", serde_json::to_string_pretty(&principal)?);
        }
        Commands::Share {
            token,
            resource,
            grantee,
            permission,
        } => {
            change_share(&config, &token, resource, &grantee, Some(permission)).await?;
        }
        Commands::Unshare {
            token,
            resource,
            grantee,
        } => {
            change_share(&config, &token, resource, &grantee, None).await?;
        }
        Commands::InitSchema => {
            let store = PgGrantStore::connect(&config.database_url).await?;
            store.init_schema().await?;
            info!("schema ready");
        }
    }

    Ok(())
}

async fn run_projector(addr: SocketAddr, config: Config) -> Result<()> {
    info!(
        group = %config.consumer_group,
        consumer = %config.consumer_name,
        "starting cache projector"
    );

    let cache = Arc::new(RedisCacheStore::connect(&config.redis_url).await?);
    let dead_letters =
        Arc::new(RedisDeadLetters::connect(&config.redis_url, config.dead_letter_capacity).await?);
    let broker: Arc<dyn EventBroker> =
        Arc::new(RedisStreamBroker::connect(&config.redis_url, config.topic_partitions).await?);

    let projector = Arc::new(CacheProjector::new(cache, dead_letters, config.write_retry()));
    let stats = projector.stats();

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let handles = projector::spawn_all(projector, broker, config.consumer_settings(), shutdown_rx);

    let listener = TcpListener::bind(addr).await?;
    info!(%addr, "listening");
    axum::serve(listener, asset_hub::router(stats))
        .with_graceful_shutdown(async {
            if let Err(err) = tokio::signal::ctrl_c().await {
                warn!(error = %err, "failed to listen for ctrl-c");
            }
        })
        .await?;

    info!("shutting down projector");
    let _ = shutdown_tx.send(true);
    for handle in handles {
        if let Err(err) = handle.await {
            warn!(error = %err, "projector task ended abnormally");
        }
    }
    Ok(())
}

async fn replay_dead_letters(topic: Topic, batch: usize, config: Config) -> Result<()> {
    let sink = RedisDeadLetters::connect(&config.redis_url, config.dead_letter_capacity).await?;
    let broker = RedisStreamBroker::connect(&config.redis_url, config.topic_partitions).await?;
    let replayed = deadletter::replay(&sink, &broker, topic.as_str(), batch.max(1)).await?;
    println!("replayed {replayed} records from {topic}");
    Ok(())
}

/// Apply one share change through the access service. The outbox flusher
/// runs for the duration so an event parked by a broker hiccup still goes
/// out before exit.
async fn change_share(
    config: &Config,
    token: &str,
    resource: ResourceRef,
    grantee: &str,
    permission: Option<Permission>,
) -> Result<()> {
    let verifier = Hs256Verifier::new(config.require_jwt_secret()?);
    let principal = verifier.verify(token).await.context("token rejected")?;
    let service = AccessService::from_config(config).await?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let flusher = service
        .emitter()
        .clone()
        .spawn_flusher(config.outbox_flush_interval, shutdown_rx);

    let result = match permission {
        Some(permission) => service
            .share(&principal, resource, grantee, permission)
            .await
            .map(|grant| println!("{grantee} now has {} on {resource}", grant.permission.as_str())),
        None => service
            .revoke_share(&principal, resource, grantee)
            .await
            .map(|()| println!("{grantee} no longer shares {resource}")),
    };

    let _ = shutdown_tx.send(true);
    if let Err(err) = flusher.await {
        warn!(error = %err, "outbox flusher ended abnormally");
    }
    let pending = service.emitter().pending();
    if pending > 0 {
        warn!(pending, "change committed but its event is still unpublished");
    }
    result.context("share change rejected")
}
