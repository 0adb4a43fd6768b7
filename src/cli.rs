//! CLI surface (SPEC_FULL.md §4.6, ambient addition): `serve`, `migrate`
//! and function-registry management, modeled on the clap derive style used
//! throughout the pack's other binaries.

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use log::info;
use uuid::Uuid;

use crate::config::Settings;
use crate::db::Db;
use crate::error::{Error, Result};
use crate::reconciler::Reconciler;
use crate::registry::FunctionRegistry;
use crate::scheduler::{Scheduler, SchedulerSettings};
use crate::vm::{FakeHypervisor, Hypervisor, ProcessHypervisor, VmPoolManager};

#[derive(Parser)]
#[command(name = "faasd")]
#[command(about = "Function-as-a-service control plane: VM pool manager, scheduler and result reconciler")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Run the API server, scheduler workers, pool refiller and timeout monitor.
    Serve,
    /// Apply pending database migrations and exit.
    Migrate,
    /// Manage registered functions.
    Function {
        #[command(subcommand)]
        action: FunctionAction,
    },
}

#[derive(Subcommand)]
pub enum FunctionAction {
    /// Register a new function from a source file.
    Register {
        #[arg(long)]
        name: String,
        #[arg(long)]
        runtime: String,
        #[arg(long, default_value_t = 128)]
        memory_mib: i64,
        #[arg(long, default_value_t = 30)]
        timeout_secs: i64,
        #[arg(long)]
        code_path: PathBuf,
        #[arg(long)]
        requirements_path: Option<PathBuf>,
    },
    /// List all registered functions.
    List,
    /// Delete a function by id.
    Delete {
        #[arg(long)]
        id: Uuid,
    },
}

pub async fn run(cli: Cli) -> Result<()> {
    let settings = Settings::from_env()?;

    match cli.command {
        Command::Serve => serve(settings).await,
        Command::Migrate => {
            let db = Db::connect(&settings.db_path).await?;
            db.migrate().await?;
            info!("migrations applied");
            Ok(())
        }
        Command::Function { action } => function_action(settings, action).await,
    }
}

async fn serve(settings: Settings) -> Result<()> {
    let db = Db::connect(&settings.db_path).await?;
    db.migrate().await?;

    let hypervisor: Arc<dyn Hypervisor> = if settings.hypervisor.use_fake_hypervisor {
        Arc::new(FakeHypervisor)
    } else {
        Arc::new(ProcessHypervisor::new(settings.hypervisor.clone()))
    };

    let pool = VmPoolManager::new(db.clone(), hypervisor, settings.hypervisor.clone(), settings.warm_pool_size, settings.vm_ip_cidr);
    pool.spawn_refiller();

    let registry = FunctionRegistry::new(db.clone());

    let scheduler_settings = SchedulerSettings {
        async_queue_capacity: settings.async_queue_capacity,
        async_worker_count: settings.async_worker_count,
        sync_poll_interval_ms: settings.sync_poll_interval_ms,
        sync_poll_max_attempts: settings.sync_poll_max_attempts,
        timeout_monitor_threshold_secs: settings.timeout_monitor_threshold_secs,
    };
    let scheduler = Scheduler::new(db.clone(), pool.clone(), registry.clone(), scheduler_settings);
    scheduler.spawn_workers();
    scheduler.spawn_timeout_monitor();

    let reconciler = Reconciler::new(db.clone());

    let state = crate::api::AppState {
        db,
        registry,
        pool,
        scheduler,
        reconciler,
        api_token: settings.api_token.clone().map(Arc::from),
    };

    let app = crate::api::router(state);
    let addr = std::net::SocketAddr::from(([0, 0, 0, 0], settings.port));
    info!("listening on http://{addr}");

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| Error::Internal(format!("failed to bind {addr}: {e}")))?;
    axum::serve(listener, app).await.map_err(|e| Error::Internal(format!("server error: {e}")))?;
    Ok(())
}

async fn function_action(settings: Settings, action: FunctionAction) -> Result<()> {
    let db = Db::connect(&settings.db_path).await?;
    db.migrate().await?;
    let registry = FunctionRegistry::new(db);

    match action {
        FunctionAction::Register { name, runtime, memory_mib, timeout_secs, code_path, requirements_path } => {
            let code = tokio::fs::read_to_string(&code_path)
                .await
                .map_err(|e| Error::Internal(format!("failed to read {code_path:?}: {e}")))?;
            let requirements = match requirements_path {
                Some(p) => Some(
                    tokio::fs::read_to_string(&p)
                        .await
                        .map_err(|e| Error::Internal(format!("failed to read {p:?}: {e}")))?,
                ),
                None => None,
            };
            let function = registry.register(name, runtime, memory_mib, timeout_secs, code, requirements, None).await?;
            println!("registered {} ({})", function.name, function.id);
            Ok(())
        }
        FunctionAction::List => {
            for function in registry.list().await? {
                println!("{}\t{}\t{}\t{}", function.id, function.name, function.runtime, function.version);
            }
            Ok(())
        }
        FunctionAction::Delete { id } => {
            registry.delete(id).await?;
            println!("deleted {id}");
            Ok(())
        }
    }
}
