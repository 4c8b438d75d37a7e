// # tunecastd - Presence Daemon
//
// Thin integration layer: everything presence related lives in
// tunecast-core. The daemon is responsible for:
//
// 1. Reading its own settings from environment variables
// 2. Initializing tracing and the runtime
// 3. Registering source adapters and the Discord presence channel
// 4. Binding the ingestion relay
// 5. Running the supervisor until SIGTERM/SIGINT
//
// ## Environment
//
// - `TUNECAST_CONFIG`: path of the YAML configuration (default `tunecast.yaml`,
//   written with defaults when missing)
// - `TUNECAST_LOG_LEVEL`: trace, debug, info, warn or error (default info)
// - `TUNECAST_SHUTDOWN_TIMEOUT_SECS`: upper bound on a graceful shutdown
//   (default 10)
//
// Everything else (sources, credentials, relay address, timings) is read from
// the configuration file, which is reloaded while the daemon runs.
//
// ## Example
//
// ```bash
// export TUNECAST_CONFIG=$HOME/.config/tunecast/config.yaml
// export TUNECAST_LOG_LEVEL=debug
//
// tunecastd
// ```

use anyhow::Result;
use std::env;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{Level, debug, error, info, warn};
use tracing_subscriber::FmtSubscriber;
use tunecast_core::{
    AdapterRegistry, ConfigLoader, PresenceConfig, RelayServer, RelayState, Supervisor,
    SupervisorEvent, YamlConfigLoader,
};
use tunecast_discord::DiscordIpcFactory;

#[cfg(unix)]
use tokio::signal::unix::{SignalKind, signal};

/// Exit codes for different termination scenarios
///
/// These codes follow systemd conventions:
/// - 0: Clean shutdown
/// - 1: Configuration or startup error
/// - 2: Runtime error (unexpected)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TunecastExitCode {
    /// Clean shutdown (normal exit)
    CleanShutdown = 0,
    /// Configuration error or startup failure
    ConfigError = 1,
    /// Runtime error (unexpected failure)
    RuntimeError = 2,
}

impl From<TunecastExitCode> for ExitCode {
    fn from(code: TunecastExitCode) -> Self {
        ExitCode::from(code as u8)
    }
}

/// Daemon settings taken from the environment
#[derive(Debug)]
struct DaemonEnv {
    config_path: PathBuf,
    log_level: String,
    shutdown_timeout: Duration,
}

impl DaemonEnv {
    fn from_env() -> Result<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let shutdown_timeout_secs = match lookup("TUNECAST_SHUTDOWN_TIMEOUT_SECS") {
            Some(raw) => raw.trim().parse::<u64>().map_err(|_| {
                anyhow::anyhow!(
                    "TUNECAST_SHUTDOWN_TIMEOUT_SECS must be a whole number of seconds. Got: {}",
                    raw
                )
            })?,
            None => 10,
        };

        Ok(Self {
            config_path: lookup("TUNECAST_CONFIG")
                .filter(|s| !s.is_empty())
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("tunecast.yaml")),
            log_level: lookup("TUNECAST_LOG_LEVEL").unwrap_or_else(|| "info".to_string()),
            shutdown_timeout: Duration::from_secs(shutdown_timeout_secs),
        })
    }

    fn validate(&self) -> Result<()> {
        parse_log_level(&self.log_level)?;

        if !(1..=300).contains(&self.shutdown_timeout.as_secs()) {
            anyhow::bail!(
                "TUNECAST_SHUTDOWN_TIMEOUT_SECS must be between 1 and 300 seconds. Got: {}",
                self.shutdown_timeout.as_secs()
            );
        }

        Ok(())
    }
}

fn parse_log_level(level: &str) -> Result<Level> {
    match level.to_lowercase().as_str() {
        "trace" => Ok(Level::TRACE),
        "debug" => Ok(Level::DEBUG),
        "info" => Ok(Level::INFO),
        "warn" => Ok(Level::WARN),
        "error" => Ok(Level::ERROR),
        _ => anyhow::bail!(
            "TUNECAST_LOG_LEVEL '{}' is not valid. \
            Valid levels: trace, debug, info, warn, error",
            level
        ),
    }
}

fn main() -> ExitCode {
    let daemon_env = match DaemonEnv::from_env() {
        Ok(env) => env,
        Err(e) => {
            eprintln!("Configuration error: {}", e);
            return TunecastExitCode::ConfigError.into();
        }
    };

    if let Err(e) = daemon_env.validate() {
        eprintln!("Configuration validation error: {}", e);
        return TunecastExitCode::ConfigError.into();
    }

    let log_level = parse_log_level(&daemon_env.log_level).unwrap_or(Level::INFO);
    let subscriber = FmtSubscriber::builder().with_max_level(log_level).finish();

    if let Err(e) = tracing::subscriber::set_global_default(subscriber) {
        eprintln!("Failed to set tracing subscriber: {}", e);
        return TunecastExitCode::ConfigError.into();
    }

    info!("Starting tunecastd daemon");
    info!("Configuration file: {}", daemon_env.config_path.display());

    let rt = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            error!("Failed to create tokio runtime: {}", e);
            return TunecastExitCode::RuntimeError.into();
        }
    };

    let result = rt.block_on(async {
        if let Err(e) = run_daemon(daemon_env).await {
            error!("Daemon error: {}", e);
            TunecastExitCode::RuntimeError
        } else {
            TunecastExitCode::CleanShutdown
        }
    });

    result.into()
}

fn build_adapter_registry() -> AdapterRegistry {
    let registry = AdapterRegistry::new();

    #[cfg(feature = "lastfm")]
    {
        info!("Registering Last.fm source");
        tunecast_source_lastfm::register(&registry);
    }

    #[cfg(feature = "plex")]
    {
        info!("Registering Plex source");
        tunecast_source_plex::register(&registry);
    }

    registry
}

/// Configuration in effect before the supervisor's first tick
fn initial_config(loader: &YamlConfigLoader) -> PresenceConfig {
    match loader.load().and_then(|config| config.validate().map(|()| config)) {
        Ok(config) => config,
        Err(e) => {
            warn!(
                "Configuration {} is not usable yet ({}); starting with defaults",
                loader.path().display(),
                e
            );
            PresenceConfig::default()
        }
    }
}

/// Run the daemon
async fn run_daemon(daemon_env: DaemonEnv) -> Result<()> {
    let loader = YamlConfigLoader::new(&daemon_env.config_path);
    let config = initial_config(&loader);
    let relay_config = config.relay.clone();

    let adapters = Arc::new(build_adapter_registry());
    let channels = Arc::new(DiscordIpcFactory::new());

    let (config_tx, config_rx) = watch::channel(config);
    let relay = Arc::new(RelayState::new(config_rx));
    let cancel = CancellationToken::new();

    // The listener is bound once; later config changes only affect which
    // relayed sources are accepted.
    let relay_task = if relay_config.enabled {
        match RelayServer::bind(&relay_config, Arc::clone(&relay)).await {
            Ok(server) => {
                let token = cancel.child_token();
                Some(tokio::spawn(async move { server.run(token).await }))
            }
            Err(e) => {
                error!("Ingestion relay unavailable: {}", e);
                None
            }
        }
    } else {
        info!("Ingestion relay disabled");
        None
    };

    let (supervisor, events) = Supervisor::new(Arc::new(loader), adapters, channels, config_tx);
    let supervisor = supervisor.with_relay(relay);

    let event_task = tokio::spawn(log_events(events));
    let supervisor_task = tokio::spawn({
        let token = cancel.child_token();
        async move { supervisor.run(token).await }
    });

    info!("Daemon initialized successfully");

    let signal = wait_for_shutdown().await?;
    info!("Received shutdown signal: {}", signal);
    info!("Shutting down daemon");
    cancel.cancel();

    let shutdown = async {
        let supervised = supervisor_task.await;
        if let Some(relay_task) = relay_task {
            match relay_task.await {
                Ok(Err(e)) => warn!("Relay stopped with error: {}", e),
                Err(e) => warn!("Relay task failed: {}", e),
                Ok(Ok(())) => {}
            }
        }
        // The sender lives in the supervisor; the drain ends once it is gone
        let _ = event_task.await;
        supervised
    };

    match tokio::time::timeout(daemon_env.shutdown_timeout, shutdown).await {
        Ok(Ok(result)) => result.map_err(Into::into),
        Ok(Err(e)) => Err(anyhow::anyhow!("Supervisor task failed: {}", e)),
        Err(_) => Err(anyhow::anyhow!(
            "Shutdown timeout after {:?}",
            daemon_env.shutdown_timeout
        )),
    }
}

async fn log_events(mut events: mpsc::Receiver<SupervisorEvent>) {
    while let Some(event) = events.recv().await {
        match event {
            SupervisorEvent::ConfigApplied { enabled_sources } => {
                info!("Enabled sources: {:?}", enabled_sources)
            }
            SupervisorEvent::Published {
                source,
                start_ms,
                end_ms,
            } => debug!("Published {} ({:?}..{:?})", source, start_ms, end_ms),
            other => debug!("Supervisor event: {:?}", other),
        }
    }
}

/// Wait for shutdown signals (SIGTERM, SIGINT)
///
/// # Returns
///
/// Returns the name of the signal received.
#[cfg(unix)]
async fn wait_for_shutdown() -> Result<&'static str> {
    let mut sigterm = signal(SignalKind::terminate())
        .map_err(|e| anyhow::anyhow!("Failed to setup SIGTERM handler: {}", e))?;
    let mut sigint = signal(SignalKind::interrupt())
        .map_err(|e| anyhow::anyhow!("Failed to setup SIGINT handler: {}", e))?;

    let signal = tokio::select! {
        _ = sigterm.recv() => "SIGTERM",
        _ = sigint.recv() => "SIGINT",
    };
    Ok(signal)
}

/// Wait for shutdown signals (SIGINT only)
///
/// Fallback implementation for non-Unix platforms.
#[cfg(not(unix))]
async fn wait_for_shutdown() -> Result<&'static str> {
    tokio::signal::ctrl_c()
        .await
        .map_err(|e| anyhow::anyhow!("Failed to wait for CTRL-C: {}", e))?;
    Ok("SIGINT")
}
