use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use config::{Config, Environment, File as ConfigFile};
use ippan_handle_reservation::handle;
use ippan_handle_reservation::{
    ConfirmRequest, GuardConfig, IndexerClient, IndexerConfig, LeaseStore, MemoryLeaseStore,
    OwnershipAuthority, Reconciler, ReconcilerConfig, ReservationError, ReservationGuard,
    SledLeaseStore, StubAuthority, ValidateRequest,
};
use metrics::describe_counter;
use metrics_exporter_prometheus::PrometheusBuilder;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const ENV_PREFIX: &str = "HANDLE_RESERVATION";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
enum StoreBackend {
    Memory,
    Sled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
enum AuthorityBackend {
    Stub,
    Indexer,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
struct AppConfig {
    store: StoreBackend,
    data_dir: PathBuf,
    authority: AuthorityBackend,
    indexer: IndexerConfig,
    guard: GuardConfig,
    reconciler: ReconcilerConfig,
    log_level: String,
    log_format: String,
    prometheus_enabled: bool,
    metrics_addr: SocketAddr,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            store: StoreBackend::Sled,
            data_dir: PathBuf::from("./data/handle-reservation"),
            authority: AuthorityBackend::Indexer,
            indexer: IndexerConfig::default(),
            guard: GuardConfig::default(),
            reconciler: ReconcilerConfig::default(),
            log_level: "info".to_string(),
            log_format: "pretty".to_string(),
            prometheus_enabled: true,
            metrics_addr: SocketAddr::from(([127, 0, 0, 1], 9102)),
        }
    }
}

impl AppConfig {
    /// File (if any), then `HANDLE_RESERVATION__*` environment variables.
    fn load(config_path: Option<&Path>) -> Result<Self> {
        let mut builder = Config::builder();

        if let Some(path) = config_path {
            if !path.exists() {
                anyhow::bail!(
                    "Configuration file {} not found (specified via --config)",
                    path.display()
                );
            }
            builder = builder.add_source(ConfigFile::from(path));
        }

        builder = builder.add_source(
            Environment::with_prefix(ENV_PREFIX)
                .separator("__")
                .try_parsing(true),
        );

        builder
            .build()
            .context("failed to read configuration")?
            .try_deserialize()
            .context("configuration has invalid values")
    }

    fn apply_overrides(&mut self, cli: &Cli) {
        if let Some(data_dir) = &cli.data_dir {
            self.data_dir = data_dir.clone();
        }
        if let Some(level) = &cli.log_level {
            self.log_level = level.clone();
        }
        if let Some(format) = &cli.log_format {
            self.log_format = format.clone();
        }
        if let Some(store) = cli.store {
            self.store = store;
        }
        if let Some(authority) = cli.authority {
            self.authority = authority;
        }
        if let Some(url) = &cli.indexer_url {
            self.indexer.base_url = url.clone();
        }
        if cli.disable_metrics {
            self.prometheus_enabled = false;
        }
    }

    fn validate(&self) -> Result<()> {
        self.guard.validate().context("invalid guard settings")?;
        self.reconciler
            .validate()
            .context("invalid reconciler settings")?;
        if self.authority == AuthorityBackend::Indexer {
            self.indexer.validate().context("invalid indexer settings")?;
        }
        if self.store == StoreBackend::Sled && self.data_dir.as_os_str().is_empty() {
            anyhow::bail!("data_dir must not be empty when the sled store is selected");
        }
        if !matches!(self.log_format.as_str(), "pretty" | "json") {
            anyhow::bail!(
                "log_format must be 'pretty' or 'json', got '{}'",
                self.log_format
            );
        }
        Ok(())
    }

    /// Rules that depend on the subcommand as well as the settings.
    fn validate_command(&self, command: &Commands) -> Result<()> {
        if matches!(command, Commands::Run) && self.store == StoreBackend::Memory {
            anyhow::bail!(
                "the memory store cannot back `run`: reservations made by other \
                 processes would never reach it; use the sled store"
            );
        }
        Ok(())
    }

    fn store_path(&self) -> PathBuf {
        self.data_dir.join("leases")
    }
}

#[derive(Debug, Parser)]
#[command(name = "ippan-handle-reservation")]
#[command(about = "Reserve handles off-chain and reconcile them with the on-chain indexer")]
#[command(long_about = "Reserve handles off-chain and reconcile them with the on-chain indexer.

`run` holds an exclusive lock on the sled store under --data-dir. Stop the \
daemon before running one-shot commands against the same directory.")]
#[command(version)]
struct Cli {
    /// TOML configuration file
    #[arg(long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,

    #[arg(long, global = true, value_name = "DIR")]
    data_dir: Option<PathBuf>,

    #[arg(long, global = true)]
    log_level: Option<String>,

    #[arg(long, global = true, value_parser = ["pretty", "json"])]
    log_format: Option<String>,

    #[arg(long, global = true, value_enum)]
    store: Option<StoreBackend>,

    #[arg(long, global = true, value_enum)]
    authority: Option<AuthorityBackend>,

    /// Base URL of the ownership indexer
    #[arg(long, global = true)]
    indexer_url: Option<String>,

    /// Disable the Prometheus metrics endpoint
    #[arg(long, global = true)]
    disable_metrics: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run the reconciler until interrupted
    Run,
    /// Run a single reconciliation pass and print its report
    Reconcile,
    /// Check a handle against the naming rules without touching the store
    Check { handle: String },
    /// Reserve a handle
    Validate {
        handle: String,
        #[arg(long)]
        owner: String,
        #[arg(long)]
        external_name: String,
        /// Lease in seconds; capped by guard.max_ttl_secs
        #[arg(long)]
        ttl: Option<u64>,
        #[arg(long)]
        idempotency_key: Option<String>,
    },
    /// Attach a submitted registration transaction to a reservation
    Confirm {
        handle: String,
        #[arg(long)]
        tx_hash: String,
        #[arg(long)]
        owner: String,
        #[arg(long)]
        extend_ttl: Option<u64>,
    },
    /// Drop a reservation
    Release {
        handle: String,
        #[arg(long)]
        owner: String,
    },
    /// Show the combined on-chain and reservation state of a handle
    Status { handle: String },
}

/// Store and authority shared by every command.
struct Services {
    store: Arc<dyn LeaseStore>,
    sled: Option<SledLeaseStore>,
    authority: Arc<dyn OwnershipAuthority>,
}

impl Services {
    fn build(config: &AppConfig) -> Result<Self> {
        let sled = match config.store {
            StoreBackend::Memory => None,
            StoreBackend::Sled => {
                let path = config.store_path();
                std::fs::create_dir_all(&config.data_dir).with_context(|| {
                    format!("failed to create data directory {}", config.data_dir.display())
                })?;
                let sled = SledLeaseStore::open(&path).with_context(|| {
                    format!(
                        "failed to open lease store at {} (is `run` holding it?)",
                        path.display()
                    )
                })?;
                info!(path = %path.display(), "opened sled lease store");
                Some(sled)
            }
        };
        let store: Arc<dyn LeaseStore> = match &sled {
            Some(sled) => Arc::new(sled.clone()),
            None => Arc::new(MemoryLeaseStore::new()),
        };

        let authority: Arc<dyn OwnershipAuthority> = match config.authority {
            AuthorityBackend::Stub => {
                warn!("using stub ownership authority; nothing is confirmed on-chain");
                Arc::new(StubAuthority::new())
            }
            AuthorityBackend::Indexer => {
                let client = IndexerClient::new(&config.indexer)
                    .context("failed to build indexer client")?;
                info!(base_url = client.base_url(), "using indexer ownership authority");
                Arc::new(client)
            }
        };

        Ok(Self {
            store,
            sled,
            authority,
        })
    }

    fn guard(&self, config: &AppConfig) -> ReservationGuard {
        ReservationGuard::new(
            Arc::clone(&self.store),
            Arc::clone(&self.authority),
            config.guard.clone(),
        )
    }

    fn reconciler(&self, config: &AppConfig) -> Reconciler {
        Reconciler::new(
            Arc::clone(&self.store),
            Arc::clone(&self.authority),
            config.reconciler.clone(),
        )
    }

    fn flush(&self) -> Result<()> {
        if let Some(sled) = &self.sled {
            sled.flush().context("failed to flush lease store")?;
        }
        Ok(())
    }
}

/// Error shape printed by the one-shot commands.
#[derive(Debug, Serialize)]
struct ErrorBody {
    error: &'static str,
    status: u16,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    retry_after_secs: Option<u64>,
}

impl From<&ReservationError> for ErrorBody {
    fn from(err: &ReservationError) -> Self {
        Self {
            error: err.kind(),
            status: err.status_code(),
            message: err.to_string(),
            retry_after_secs: err.retry_after_secs(),
        }
    }
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// Prints the outcome and reports whether it was a success.
fn report<T: Serialize>(result: Result<T, ReservationError>) -> Result<bool> {
    match result {
        Ok(value) => {
            print_json(&value)?;
            Ok(true)
        }
        Err(err) => {
            debug!(error = %err, "command rejected");
            print_json(&ErrorBody::from(&err))?;
            Ok(false)
        }
    }
}

async fn execute(command: Commands, config: &AppConfig, services: &Services) -> Result<bool> {
    let guard = services.guard(config);
    let success = match command {
        Commands::Run => {
            run_daemon(config, services).await?;
            true
        }
        Commands::Reconcile => {
            let report = services
                .reconciler(config)
                .run_once()
                .await
                .context("reconciliation pass failed")?;
            print_json(&report)?;
            true
        }
        Commands::Check { handle: raw } => {
            let check = handle::check(&raw);
            print_json(&check)?;
            check.valid
        }
        Commands::Validate {
            handle,
            owner,
            external_name,
            ttl,
            idempotency_key,
        } => report(
            guard
                .validate(ValidateRequest {
                    handle,
                    external_name,
                    owner,
                    ttl_secs: ttl,
                    idempotency_key,
                })
                .await,
        )?,
        Commands::Confirm {
            handle,
            tx_hash,
            owner,
            extend_ttl,
        } => report(
            guard
                .confirm(ConfirmRequest {
                    handle,
                    tx_hash,
                    owner,
                    extend_ttl_secs: extend_ttl,
                })
                .await,
        )?,
        Commands::Release { handle, owner } => report(guard.release(&handle, &owner).await)?,
        Commands::Status { handle } => report(guard.status(&handle).await)?,
    };
    services.flush()?;
    Ok(success)
}

async fn run_daemon(config: &AppConfig, services: &Services) -> Result<()> {
    let reconciler = Arc::new(services.reconciler(config)).start();

    // Expired sled envelopes only read as absent; sweep them periodically.
    let sweeper = services.sled.clone().map(|sled| {
        let period = config.reconciler.interval().max(Duration::from_secs(60));
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            loop {
                interval.tick().await;
                if let Err(err) = sled.purge_expired() {
                    warn!(error = %err, "failed to purge expired leases");
                }
            }
        })
    });

    info!(
        store = ?config.store,
        authority = ?config.authority,
        interval_secs = config.reconciler.interval_secs,
        "handle reservation service is running"
    );

    tokio::signal::ctrl_c().await?;
    info!("Shutting down handle reservation service");

    reconciler.stop().await;
    if let Some(sweeper) = sweeper {
        sweeper.abort();
    }
    services.flush()?;

    info!("Handle reservation service shutdown complete");
    Ok(())
}

fn init_metrics(config: &AppConfig) {
    if !config.prometheus_enabled {
        info!("Prometheus metrics exporter disabled via configuration");
        return;
    }

    match PrometheusBuilder::new()
        .with_http_listener(config.metrics_addr)
        .install()
    {
        Ok(()) => {
            info!(addr = %config.metrics_addr, "Prometheus metrics exporter listening");
            describe_counter!(
                "handle_reservation_validate_total",
                "Reservation attempts by outcome"
            );
            describe_counter!(
                "handle_reservation_confirm_total",
                "Confirmations by outcome"
            );
            describe_counter!("handle_reservation_release_total", "Releases by outcome");
            describe_counter!(
                "handle_reconciler_actions_total",
                "Actions taken on pending reservations"
            );
            describe_counter!(
                "handle_reconciler_runs_total",
                "Reconciler ticks by result"
            );
        }
        Err(err) => {
            warn!("Failed to install Prometheus metrics exporter: {}", err);
        }
    }
}

fn init_logging(config: &AppConfig) -> Result<()> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    // stdout carries command output
    if config.log_format == "json" {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr))
            .try_init()?;
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().pretty().with_writer(std::io::stderr))
            .try_init()?;
    }

    Ok(())
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();

    let mut config = AppConfig::load(cli.config.as_deref())?;
    config.apply_overrides(&cli);
    config.validate()?;
    config.validate_command(&cli.command)?;

    init_logging(&config)?;
    if matches!(cli.command, Commands::Run) {
        init_metrics(&config);
    }

    let services = Services::build(&config)?;
    let success = execute(cli.command, &config, &services).await?;

    Ok(if success {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    fn memory_config() -> AppConfig {
        AppConfig {
            store: StoreBackend::Memory,
            authority: AuthorityBackend::Stub,
            ..AppConfig::default()
        }
    }

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn file_values_override_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("handles.toml");
        std::fs::write(
            &path,
            r#"
store = "memory"
authority = "stub"
log_format = "json"

[reconciler]
interval_secs = 10

[indexer]
base_url = "https://indexer.example"
"#,
        )
        .unwrap();

        let config = AppConfig::load(Some(path.as_path())).unwrap();
        assert_eq!(config.store, StoreBackend::Memory);
        assert_eq!(config.authority, AuthorityBackend::Stub);
        assert_eq!(config.log_format, "json");
        assert_eq!(config.reconciler.interval_secs, 10);
        assert_eq!(config.reconciler.max_age_secs, 3_600);
        assert_eq!(config.indexer.base_url, "https://indexer.example");
        assert_eq!(config.guard, GuardConfig::default());
        config.validate().unwrap();
    }

    #[test]
    fn missing_config_file_is_an_error() {
        let err = AppConfig::load(Some(Path::new("/nonexistent/handles.toml"))).unwrap_err();
        assert!(err.to_string().contains("not found"));
    }

    #[test]
    fn cli_flags_override_config() {
        let cli = Cli::try_parse_from([
            "ippan-handle-reservation",
            "--store",
            "memory",
            "--authority",
            "stub",
            "--log-level",
            "debug",
            "--disable-metrics",
            "status",
            "@alice",
        ])
        .unwrap();

        let mut config = AppConfig::default();
        config.apply_overrides(&cli);
        assert_eq!(config.store, StoreBackend::Memory);
        assert_eq!(config.authority, AuthorityBackend::Stub);
        assert_eq!(config.log_level, "debug");
        assert!(!config.prometheus_enabled);
        assert!(matches!(cli.command, Commands::Status { ref handle } if handle == "@alice"));
    }

    #[test]
    fn invalid_settings_are_rejected() {
        let mut config = AppConfig::default();
        config.indexer.base_url = "indexer.local".to_string();
        assert!(config.validate().is_err());

        // the indexer URL is irrelevant with the stub authority
        config.authority = AuthorityBackend::Stub;
        config.validate().unwrap();

        config.reconciler.mid_age_secs = config.reconciler.max_age_secs;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("reconciler"));

        let config = AppConfig {
            log_format: "xml".to_string(),
            ..memory_config()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn run_requires_a_persistent_store() {
        let err = memory_config()
            .validate_command(&Commands::Run)
            .unwrap_err();
        assert!(err.to_string().contains("memory store"));

        let config = AppConfig {
            authority: AuthorityBackend::Stub,
            ..AppConfig::default()
        };
        config.validate_command(&Commands::Run).unwrap();
        memory_config()
            .validate_command(&Commands::Reconcile)
            .unwrap();
    }

    #[tokio::test]
    async fn sled_store_is_exclusive_to_one_process() {
        let dir = tempfile::tempdir().unwrap();
        let config = AppConfig {
            store: StoreBackend::Sled,
            data_dir: dir.path().to_path_buf(),
            ..memory_config()
        };
        let _daemon = Services::build(&config).unwrap();

        let err = Services::build(&config).err().expect("second open must fail");
        assert!(format!("{err:#}").contains("is `run` holding it?"));
    }

    #[tokio::test]
    async fn one_shot_commands_report_outcomes() {
        let config = memory_config();
        let services = Services::build(&config).unwrap();

        let validate = || Commands::Validate {
            handle: "@alice".to_string(),
            owner: "0xa11ce".to_string(),
            external_name: "alice.eth".to_string(),
            ttl: None,
            idempotency_key: Some("k1".to_string()),
        };
        assert!(execute(validate(), &config, &services).await.unwrap());
        // replay with the same key succeeds
        assert!(execute(validate(), &config, &services).await.unwrap());

        let other = Commands::Validate {
            handle: "alice".to_string(),
            owner: "0xb0b".to_string(),
            external_name: "bob.eth".to_string(),
            ttl: None,
            idempotency_key: None,
        };
        assert!(!execute(other, &config, &services).await.unwrap());

        let check = Commands::Check {
            handle: "a".to_string(),
        };
        assert!(!execute(check, &config, &services).await.unwrap());

        assert!(execute(Commands::Reconcile, &config, &services)
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn sled_backend_persists_under_data_dir() {
        let dir = tempfile::tempdir().unwrap();
        let config = AppConfig {
            store: StoreBackend::Sled,
            data_dir: dir.path().to_path_buf(),
            ..memory_config()
        };
        let services = Services::build(&config).unwrap();

        let validate = Commands::Validate {
            handle: "carol".to_string(),
            owner: "0xc4r01".to_string(),
            external_name: "carol.eth".to_string(),
            ttl: Some(60),
            idempotency_key: None,
        };
        assert!(execute(validate, &config, &services).await.unwrap());
        assert!(config.store_path().exists());
        assert_eq!(
            services
                .store
                .scan(handle::RESERVATION_KEY_PREFIX)
                .await
                .unwrap(),
            vec!["handle:reservation:carol".to_string()]
        );
    }

    #[test]
    fn error_body_carries_retry_hint() {
        let err = ReservationError::AlreadyReserved {
            handle: ippan_handle_reservation::Handle::parse("alice").unwrap(),
            expires_in_sec: 42,
        };
        let body = serde_json::to_value(ErrorBody::from(&err)).unwrap();
        assert_eq!(body["error"], "already_reserved");
        assert_eq!(body["status"], 409);
        assert_eq!(body["retry_after_secs"], 42);
    }
}
