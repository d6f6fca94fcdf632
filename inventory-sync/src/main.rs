mod api;
mod config;
mod error;
mod ledger;
mod merge;
mod models;
mod outbox;
mod platform;
mod processor;
mod push;
mod queue;
mod reconcile;
mod register;
mod schema;
mod store;
mod webhook;

#[cfg(test)]
mod testing;

use diesel_migrations::{embed_migrations, EmbeddedMigrations, MigrationHarness};
use diesel::PgConnection;

const MIGRATIONS: EmbeddedMigrations = embed_migrations!("migrations");

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Result};
use clap::{Parser, Subcommand, ValueEnum};
use diesel::Connection;
use diesel_async::{pooled_connection::bb8::Pool, AsyncPgConnection};
use serde::Serialize;
use tokio::task::JoinSet;
use tokio::time::{self, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::config::Config;
use crate::outbox::{Dispatcher, Outbox};
use crate::platform::{PlatformApi, PlatformClient};
use crate::processor::{HandlerRegistry, WebhookProcessor};
use crate::push::InventoryPusher;
use crate::queue::TaskQueue;
use crate::reconcile::Reconciler;
use crate::store::{PgStore, SyncStore};
use crate::webhook::WebhookIngress;

#[derive(Parser)]
#[command(name = "inventory-sync")]
struct Cli {
    #[command(flatten)]
    config: Config,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// HTTP ingress and admin API, with the dispatcher, processor and schedulers.
    Serve,
    /// Pull platform state once and print the report.
    Reconcile {
        #[arg(value_enum, default_value_t = ReconcileTarget::All)]
        target: ReconcileTarget,
    },
    /// Run only the outbox dispatcher pool.
    Dispatcher,
    /// Run only the webhook processor pool.
    WebhookProcessor,
    /// Push local stock to the platform once.
    PushInventory,
    /// Make sure the platform delivers our webhook topics here.
    RegisterWebhooks,
}

#[derive(Clone, Copy, ValueEnum)]
enum ReconcileTarget {
    All,
    Products,
    Locations,
    InventoryLevels,
    Orders,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    let config = cli.config;
    crate::config::init_tracing(&config.log_level);

    let platform: Arc<dyn PlatformApi> = Arc::new(PlatformClient::new(config.platform())?);

    match cli.command.unwrap_or(Command::Serve) {
        Command::Serve => {
            let store = connect(&config).await?;
            let queue = queue::select_queue(&config)?;
            serve(config, store, platform, queue).await?;
        }
        Command::Reconcile { target } => {
            let store = connect(&config).await?;
            let reconciler = Reconciler::new(store, platform);
            match target {
                ReconcileTarget::All => print_json(&reconciler.sync_all().await)?,
                ReconcileTarget::Products => print_json(&reconciler.sync_products().await?)?,
                ReconcileTarget::Locations => print_json(&reconciler.sync_locations().await?)?,
                ReconcileTarget::InventoryLevels => {
                    print_json(&reconciler.sync_inventory_levels().await?)?
                }
                ReconcileTarget::Orders => print_json(&reconciler.sync_recent_orders().await?)?,
            }
        }
        Command::Dispatcher => {
            let store = connect(&config).await?;
            let dispatcher = Arc::new(Dispatcher::new(store, platform, config.outbox()));
            dispatcher.run(cancel_on_ctrl_c()).await;
        }
        Command::WebhookProcessor => {
            let store = connect(&config).await?;
            let queue = queue::select_queue(&config)?;
            let processor = Arc::new(WebhookProcessor::new(
                store.clone(),
                HandlerRegistry::with_defaults(store),
                config.processor(),
            ));
            processor.run(queue, cancel_on_ctrl_c()).await;
        }
        Command::PushInventory => {
            let store = connect(&config).await?;
            let pusher = InventoryPusher::new(store, platform, config.default_location_id);
            print_json(&pusher.push_all_local_inventory().await?)?;
        }
        Command::RegisterWebhooks => {
            let public_url = config.public_url()?;
            let report = register::ensure_webhooks(platform.as_ref(), public_url).await?;
            print_json(&report)?;
            if !report.failed.is_empty() {
                bail!("{} webhook registrations failed", report.failed.len());
            }
        }
    }

    Ok(())
}

async fn connect(config: &Config) -> Result<Arc<dyn SyncStore>> {
    // Run migrations first
    info!("Running database migrations...");
    let mut conn = PgConnection::establish(&config.database_url)?;
    conn.run_pending_migrations(MIGRATIONS).map_err(|e| anyhow::anyhow!("Migration error: {}", e))?;
    info!("Migrations completed successfully");

    let manager = diesel_async::pooled_connection::AsyncDieselConnectionManager::<AsyncPgConnection>::new(&config.database_url);
    let pool = Pool::builder().build(manager).await?;
    Ok(Arc::new(PgStore::new(pool)))
}

async fn serve(
    config: Config,
    store: Arc<dyn SyncStore>,
    platform: Arc<dyn PlatformApi>,
    queue: Arc<dyn TaskQueue>,
) -> Result<()> {
    let shutdown = cancel_on_ctrl_c();
    let mut tasks = JoinSet::new();

    let dispatcher = Arc::new(Dispatcher::new(store.clone(), platform.clone(), config.outbox()));
    tasks.spawn(dispatcher.run(shutdown.clone()));

    let processor = Arc::new(WebhookProcessor::new(
        store.clone(),
        HandlerRegistry::with_defaults(store.clone()),
        config.processor(),
    ));
    tasks.spawn(processor.run(queue.clone(), shutdown.clone()));

    let reconciler = Arc::new(Reconciler::new(store.clone(), platform.clone()));
    let pusher = Arc::new(InventoryPusher::new(
        store.clone(),
        platform.clone(),
        config.default_location_id,
    ));

    if config.sync_enable {
        let r = reconciler.clone();
        every(&mut tasks, "inventory sync", minutes(config.sync_inventory_minutes), &shutdown, move || {
            let r = r.clone();
            async move {
                if let Err(e) = r.sync_inventory_levels().await {
                    error!("Scheduled inventory sync failed: {}", e);
                }
            }
        });
        let r = reconciler.clone();
        every(&mut tasks, "product sync", minutes(config.sync_products_minutes), &shutdown, move || {
            let r = r.clone();
            async move {
                if let Err(e) = r.sync_products().await {
                    error!("Scheduled product sync failed: {}", e);
                }
            }
        });
        let r = reconciler.clone();
        every(&mut tasks, "order sync", minutes(config.sync_orders_minutes), &shutdown, move || {
            let r = r.clone();
            async move {
                if let Err(e) = r.sync_recent_orders().await {
                    error!("Scheduled order sync failed: {}", e);
                }
            }
        });
    }

    if config.inventory_push_enable {
        let p = pusher.clone();
        every(&mut tasks, "inventory push", minutes(config.inventory_push_minutes), &shutdown, move || {
            let p = p.clone();
            async move {
                if let Err(e) = p.push_all_local_inventory().await {
                    error!("Scheduled inventory push failed: {}", e);
                }
            }
        });
    }

    let app_state = api::AppState {
        ingress: WebhookIngress::new(
            store.clone(),
            queue,
            config.webhook_secret.clone(),
            config.webhook_topic.clone(),
        ),
        reconciler,
        pusher,
        outbox: Outbox::new(store),
    };

    let app = api::create_router(app_state);
    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{}", config.port)).await?;

    info!("Inventory sync web server started on port {}", config.port);

    let graceful = shutdown.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { graceful.cancelled().await })
        .await?;

    shutdown.cancel();
    while let Some(joined) = tasks.join_next().await {
        if let Err(e) = joined {
            error!("Background task failed: {}", e);
        }
    }
    info!("Inventory sync stopped");
    Ok(())
}

fn minutes(n: u64) -> Duration {
    Duration::from_secs(n.max(1) * 60)
}

/// Run `job` now and then every `period` until shutdown.
fn every<F, Fut>(
    tasks: &mut JoinSet<()>,
    name: &'static str,
    period: Duration,
    shutdown: &CancellationToken,
    job: F,
) where
    F: Fn() -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    let shutdown = shutdown.clone();
    info!(name, every_secs = period.as_secs(), "scheduler started");
    tasks.spawn(async move {
        let mut interval = time::interval(period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = interval.tick() => job().await,
            }
        }
        info!(name, "scheduler stopped");
    });
}

fn cancel_on_ctrl_c() -> CancellationToken {
    let shutdown = CancellationToken::new();
    let token = shutdown.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("Shutdown requested");
                token.cancel();
            }
            Err(e) => error!("Failed to listen for shutdown signal: {}", e),
        }
    });
    shutdown
}

fn print_json<T: Serialize>(report: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(report)?);
    Ok(())
}
