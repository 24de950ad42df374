//! pgwardend - PostgreSQL performance and health daemon.
//!
//! Captures statement statistics, analyzes the workload, keeps index
//! recommendations current and runs periodic health checks against the
//! database named by the standard libpq environment variables.

#[cfg(not(target_env = "msvc"))]
use tikv_jemallocator::Jemalloc;
#[cfg(not(target_env = "msvc"))]
#[global_allocator]
static GLOBAL: Jemalloc = Jemalloc;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use clap::Parser;
use tokio::sync::broadcast::error::RecvError;
use tracing::{Level, debug, error, info, warn};
use tracing_subscriber::EnvFilter;

use pgwarden::config::EngineConfig;
use pgwarden::engine::Engine;
use pgwarden::health::{HealthEvent, HealthStatus};
use pgwarden::provider::PostgresProvider;

/// PostgreSQL performance and health daemon.
#[derive(Parser)]
#[command(name = "pgwardend", about = "PostgreSQL performance and health daemon", version)]
struct Args {
    /// TOML configuration file. Missing keys keep their defaults.
    #[arg(short, long, env = "PGWARDEN_CONFIG")]
    config: Option<PathBuf>,

    /// Health check interval in milliseconds.
    #[arg(long, env = "PGWARDEN_CHECK_INTERVAL_MS")]
    check_interval_ms: Option<u64>,

    /// Statistics capture interval in milliseconds.
    #[arg(long, env = "PGWARDEN_CAPTURE_INTERVAL_MS")]
    capture_interval_ms: Option<u64>,

    /// Workload analysis interval in milliseconds.
    #[arg(long, env = "PGWARDEN_ANALYSIS_INTERVAL_MS")]
    analysis_interval_ms: Option<u64>,

    /// Per-call database timeout in milliseconds.
    #[arg(long, env = "PGWARDEN_TIMEOUT_MS")]
    timeout_ms: Option<u64>,

    /// Run remediation rules when a health pass is critical.
    #[arg(long)]
    auto_remediation: bool,

    /// Let remediation create recommended indexes instead of a dry run.
    #[arg(long)]
    auto_create_indexes: bool,

    /// Connection string. Defaults to PGHOST/PGPORT/PGUSER/PGPASSWORD/PGDATABASE.
    #[arg(long, env = "DATABASE_URL", hide_env_values = true)]
    database_url: Option<String>,

    /// Path to /proc filesystem (for host CPU and memory).
    #[arg(long, default_value = "/proc")]
    proc_path: String,

    /// Health history file, restored on startup and written on shutdown.
    #[arg(long, env = "PGWARDEN_HISTORY")]
    history_file: Option<PathBuf>,

    /// Increase logging verbosity (-v for debug, -vv for trace). Default is info level.
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Quiet mode - only show errors.
    #[arg(short, long)]
    quiet: bool,
}

impl Args {
    fn engine_config(&self) -> Result<EngineConfig, pgwarden::config::ConfigError> {
        let mut config = match &self.config {
            Some(path) => EngineConfig::from_file(path)?,
            None => EngineConfig::default(),
        };
        if let Some(v) = self.check_interval_ms {
            config.check_interval_ms = v;
        }
        if let Some(v) = self.capture_interval_ms {
            config.capture_interval_ms = v;
        }
        if let Some(v) = self.analysis_interval_ms {
            config.analysis_interval_ms = v;
        }
        if let Some(v) = self.timeout_ms {
            config.timeout_ms = v;
        }
        config.enable_auto_remediation |= self.auto_remediation;
        config.auto_create_indexes |= self.auto_create_indexes;
        Ok(config)
    }
}

/// Default level is INFO. Use -q for errors only; RUST_LOG overrides both.
fn init_logging(verbose: u8, quiet: bool) {
    let level = if quiet {
        Level::ERROR
    } else {
        match verbose {
            0 => Level::INFO,
            1 => Level::DEBUG,
            _ => Level::TRACE,
        }
    };

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("pgwardend={level},pgwarden={level}")));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

async fn log_events(engine: &Engine) {
    let mut events = engine.subscribe();
    loop {
        match events.recv().await {
            Ok(HealthEvent::CheckCompleted(s)) => {
                let degraded: Vec<_> = s
                    .results
                    .iter()
                    .filter(|r| !matches!(r.status, HealthStatus::Healthy))
                    .map(|r| format!("{}={}", r.axis.as_str(), r.status))
                    .collect();
                debug!(
                    status = %s.overall_status,
                    duration_ms = s.duration_ms,
                    degraded = %degraded.join(","),
                    "health check"
                );
            }
            Ok(HealthEvent::StatusChanged { previous, current, .. }) => match current {
                HealthStatus::Critical => error!(from = %previous, to = %current, "database health critical"),
                HealthStatus::Warning => warn!(from = %previous, to = %current, "database health degraded"),
                _ => info!(from = %previous, to = %current, "database health changed"),
            },
            Ok(HealthEvent::Remediation(a)) => {
                info!(action = %a.action_type, succeeded = a.succeeded(), "remediation");
            }
            Err(RecvError::Lagged(n)) => warn!(skipped = n, "event logger lagged"),
            Err(RecvError::Closed) => break,
        }
    }
}

fn restore_history(engine: &Engine, path: &Path) {
    if !path.exists() {
        return;
    }
    match engine.restore_health_history(path) {
        Ok(n) => info!(snapshots = n, path = %path.display(), "health history restored"),
        Err(e) => warn!(error = %e, path = %path.display(), "health history not restored"),
    }
}

fn main() {
    let args = Args::parse();
    init_logging(args.verbose, args.quiet);

    info!("pgwardend {} starting", pgwarden::VERSION);

    let config = match args.engine_config() {
        Ok(c) => c,
        Err(e) => {
            error!(error = %e, "invalid configuration");
            std::process::exit(2);
        }
    };

    let provider = match &args.database_url {
        Some(url) => Ok(PostgresProvider::with_connection_string(url.clone(), config.timeout())),
        None => PostgresProvider::from_env(config.timeout()),
    };
    let provider = match provider {
        Ok(p) => p.with_proc_path(args.proc_path.clone()),
        Err(e) => {
            error!(error = %e, "cannot configure database connection");
            std::process::exit(1);
        }
    };
    match provider.try_connect() {
        Ok(()) => info!("connected to PostgreSQL"),
        // the provider reconnects on every pass
        Err(e) => warn!(error = %e, "PostgreSQL not reachable yet"),
    }

    let engine = match Engine::new(config, Arc::new(provider)) {
        Ok(e) => Arc::new(e),
        Err(e) => {
            error!(error = %e, "invalid configuration");
            std::process::exit(2);
        }
    };
    info!(
        check_ms = engine.config().check_interval_ms,
        capture_ms = engine.config().capture_interval_ms,
        analysis_ms = engine.config().analysis_interval_ms,
        auto_remediation = engine.config().enable_auto_remediation,
        "engine configured"
    );

    let running = Arc::new(AtomicBool::new(true));
    let r = running.clone();
    if let Err(e) = ctrlc::set_handler(move || {
        info!("Received shutdown signal");
        r.store(false, Ordering::SeqCst);
    }) {
        warn!("Failed to set Ctrl-C handler: {}", e);
    }

    let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(rt) => rt,
        Err(e) => {
            error!(error = %e, "cannot start tokio runtime");
            std::process::exit(1);
        }
    };

    runtime.block_on(async {
        if let Some(path) = &args.history_file {
            restore_history(&engine, path);
        }

        let logger = {
            let engine = Arc::clone(&engine);
            tokio::spawn(async move { log_events(&engine).await })
        };

        if let Err(e) = engine.start() {
            error!(error = %e, "cannot start schedules");
            return;
        }

        while running.load(Ordering::SeqCst) {
            tokio::time::sleep(Duration::from_millis(250)).await;
        }

        engine.stop();
        logger.abort();
    });

    if let Some(path) = &args.history_file {
        match engine.save_health_history(path) {
            Ok(()) => info!(path = %path.display(), "health history saved"),
            Err(e) => error!(error = %e, path = %path.display(), "health history not saved"),
        }
    }
    info!("pgwardend stopped");
}
