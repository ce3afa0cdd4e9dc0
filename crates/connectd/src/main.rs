// # connectd - Remote Access Agent Daemon
//
// This is a THIN integration layer:
// - No reconnect, backoff, or remote access logic lives here
// - All agent logic is in connect-core
// - Configuration is via environment variables only
//
// The connectd daemon is responsible for:
// 1. Reading configuration from environment variables
// 2. Initializing logging and the runtime
// 3. Wiring the relay, router, proxy, WAN and persistence collaborators
// 4. Seeding system facts and running the agent until a signal arrives
//
// ## Configuration
//
// ### Relay
// - `CONNECT_RELAY_URL`: Relay endpoint (ws:// or wss://, required)
// - `CONNECT_API_KEY`: Credential to store on startup (optional)
//
// ### Persistence
// - `CONNECT_CONFIG_PATH`: Path to the JSON config file (in-memory if unset)
//
// ### System
// - `CONNECT_FLASH_GUID`: Hardware identity (required)
// - `CONNECT_SERVER_VERSION`: Appliance OS version (required)
// - `CONNECT_SSL_MODE`: Local web server SSL mode (no, yes, auto)
// - `CONNECT_HTTP_PORT`: Local HTTP port (default 80)
// - `CONNECT_HTTPS_PORT`: Local HTTPS port (default 443)
//
// ### Collaborators
// - `CONNECT_PROXY_RELOAD_CMD`: Command that reloads the reverse proxy (optional)
// - `CONNECT_WAN_IP_URL`: Comma-separated WAN address echo services (optional)
//
// ### Logging
// - `CONNECT_LOG_LEVEL`: trace, debug, info, warn, error (default info)
//
// ## Example
//
// ```bash
// export CONNECT_RELAY_URL=wss://relay.example.net/ws
// export CONNECT_CONFIG_PATH=/var/lib/connect/config.json
// export CONNECT_FLASH_GUID=0781-5571-0000-1234
// export CONNECT_SERVER_VERSION=7.0.0
// export CONNECT_SSL_MODE=yes
// export CONNECT_PROXY_RELOAD_CMD="nginx -s reload"
//
// connectd
// ```

use anyhow::Result;
use std::env;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::{Level, error, info, warn};
use tracing_subscriber::FmtSubscriber;

use connect_core::config::parse_port;
use connect_core::proxy::{CommandReverseProxy, NoopReverseProxy};
use connect_core::state::{LoadStatus, NetworkSecurity, SslMode};
use connect_core::traits::{ConfigStore, ReverseProxy};
use connect_core::{AgentConfig, Collaborators, ConnectAgent, FileConfigStore, MemoryConfigStore};
use connect_relay_ws::WsRelayTransport;
use connect_router_igd::IgdRouter;
use connect_wan_http::HttpWanResolver;

#[cfg(unix)]
use tokio::signal::unix::{SignalKind, signal};

/// How long the agent gets to stop backends and flush after a signal
const SHUTDOWN_TIMEOUT_SECS: u64 = 30;

/// Exit codes for different termination scenarios
///
/// These codes follow systemd conventions:
/// - 0: Clean shutdown
/// - 1: Configuration or startup error
/// - 2: Runtime error (unexpected)
#[derive(Debug, Clone, Copy)]
enum ConnectExitCode {
    /// Clean shutdown (normal exit)
    CleanShutdown = 0,
    /// Configuration error or startup failure
    ConfigError = 1,
    /// Runtime error (unexpected failure)
    RuntimeError = 2,
}

impl From<ConnectExitCode> for ExitCode {
    fn from(code: ConnectExitCode) -> Self {
        ExitCode::from(code as u8)
    }
}

/// Application configuration
#[derive(Debug)]
struct Config {
    relay_url: String,
    api_key: Option<String>,
    config_path: Option<String>,
    flash_guid: String,
    server_version: String,
    network: NetworkSecurity,
    proxy_reload_cmd: Option<String>,
    wan_ip_urls: Vec<String>,
    log_level: String,
}

/// Read a variable, treating empty values as unset
fn non_empty(name: &str) -> Option<String> {
    env::var(name)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

impl Config {
    /// Load configuration from environment variables
    fn from_env() -> Result<Self> {
        let ssl_mode = match non_empty("CONNECT_SSL_MODE") {
            Some(raw) => raw.parse::<SslMode>()?,
            None => SslMode::No,
        };
        let http_port = match non_empty("CONNECT_HTTP_PORT") {
            Some(raw) => parse_port(&raw)?,
            None => 80,
        };
        let https_port = match non_empty("CONNECT_HTTPS_PORT") {
            Some(raw) => parse_port(&raw)?,
            None => 443,
        };

        Ok(Self {
            relay_url: non_empty("CONNECT_RELAY_URL").ok_or_else(|| {
                anyhow::anyhow!(
                    "CONNECT_RELAY_URL is required. \
                    Set it via: export CONNECT_RELAY_URL=wss://relay.example.net/ws"
                )
            })?,
            api_key: non_empty("CONNECT_API_KEY"),
            config_path: non_empty("CONNECT_CONFIG_PATH"),
            flash_guid: non_empty("CONNECT_FLASH_GUID").unwrap_or_default(),
            server_version: non_empty("CONNECT_SERVER_VERSION").unwrap_or_default(),
            network: NetworkSecurity {
                ssl_mode,
                http_port,
                https_port,
            },
            proxy_reload_cmd: non_empty("CONNECT_PROXY_RELOAD_CMD"),
            wan_ip_urls: split_list(&env::var("CONNECT_WAN_IP_URL").unwrap_or_default()),
            log_level: env::var("CONNECT_LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
        })
    }

    /// Validate configuration
    ///
    /// Checks values the agent would only reject much later, with messages
    /// that say how to fix them.
    fn validate(&self) -> Result<()> {
        if !(self.relay_url.starts_with("ws://") || self.relay_url.starts_with("wss://")) {
            anyhow::bail!(
                "CONNECT_RELAY_URL '{}' must use ws:// or wss://",
                self.relay_url
            );
        }

        if self.flash_guid.is_empty() {
            anyhow::bail!(
                "CONNECT_FLASH_GUID is required. \
                The relay identifies the appliance by its hardware GUID."
            );
        }

        if self.server_version.is_empty() {
            anyhow::bail!(
                "CONNECT_SERVER_VERSION is required. \
                Set it to the appliance OS version, e.g. 7.0.0"
            );
        }

        // Check for obvious placeholder keys (common mistake)
        if let Some(key) = &self.api_key {
            let lower = key.to_lowercase();
            if lower.contains("your_key") || lower.contains("replace_me") || lower == "key" {
                anyhow::bail!(
                    "CONNECT_API_KEY appears to be a placeholder. \
                    Use the key issued for this server."
                );
            }
        }

        if let Some(path) = &self.config_path
            && let Some(parent) = std::path::Path::new(path).parent()
            && !parent.as_os_str().is_empty()
            && !parent.exists()
        {
            anyhow::bail!(
                "CONNECT_CONFIG_PATH directory '{}' does not exist. \
                Create it first or choose another path.",
                parent.display()
            );
        }

        for url in &self.wan_ip_urls {
            if !(url.starts_with("http://") || url.starts_with("https://")) {
                anyhow::bail!(
                    "CONNECT_WAN_IP_URL entry '{}' must use http:// or https://",
                    url
                );
            }
        }

        match self.log_level.to_lowercase().as_str() {
            "trace" | "debug" | "info" | "warn" | "error" => {}
            other => anyhow::bail!(
                "CONNECT_LOG_LEVEL '{}' is not supported. \
                Valid levels: trace, debug, info, warn, error",
                other
            ),
        }

        Ok(())
    }
}

/// Split a comma-separated list, dropping empty entries
fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

fn main() -> ExitCode {
    // Load configuration from environment
    let config = match Config::from_env() {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("Configuration error: {}", e);
            return ConnectExitCode::ConfigError.into();
        }
    };

    // Validate configuration
    if let Err(e) = config.validate() {
        eprintln!("Configuration validation error: {}", e);
        return ConnectExitCode::ConfigError.into();
    }

    // Initialize tracing
    let log_level = match config.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let subscriber = FmtSubscriber::builder().with_max_level(log_level).finish();

    if let Err(e) = tracing::subscriber::set_global_default(subscriber) {
        eprintln!("Failed to set tracing subscriber: {}", e);
        return ConnectExitCode::ConfigError.into();
    }

    info!("Starting connectd daemon");
    info!(relay = %config.relay_url, "Configuration loaded");

    // Enter tokio runtime
    let rt = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            error!("Failed to create tokio runtime: {}", e);
            return ConnectExitCode::RuntimeError.into();
        }
    };

    let result = rt.block_on(async {
        if let Err(e) = run_daemon(config).await {
            error!("Daemon error: {:#}", e);
            ConnectExitCode::RuntimeError
        } else {
            ConnectExitCode::CleanShutdown
        }
    });

    result.into()
}

/// Build the concrete collaborators from configuration
async fn collaborators(config: &Config) -> Result<Collaborators> {
    let persistence: Arc<dyn ConfigStore> = match &config.config_path {
        Some(path) => {
            info!(path = %path, "Using file config store");
            Arc::new(FileConfigStore::new(path).await?)
        }
        None => {
            warn!("CONNECT_CONFIG_PATH not set; configuration will not survive a restart");
            Arc::new(MemoryConfigStore::new())
        }
    };

    let proxy: Arc<dyn ReverseProxy> = match &config.proxy_reload_cmd {
        Some(line) => Arc::new(CommandReverseProxy::from_command_line(line)?),
        None => {
            info!("No reverse proxy reload command; WAN access changes are only logged");
            Arc::new(NoopReverseProxy)
        }
    };

    Ok(Collaborators {
        transport: Arc::new(WsRelayTransport::new(&config.relay_url)?),
        router: Arc::new(IgdRouter::new()),
        proxy,
        wan: Arc::new(HttpWanResolver::new(config.wan_ip_urls.clone())),
        persistence,
    })
}

/// Run the daemon
async fn run_daemon(config: Config) -> Result<()> {
    let collaborators = collaborators(&config).await?;
    let agent = Arc::new(ConnectAgent::new(AgentConfig::new(config.relay_url.clone()), collaborators).await?);

    if let Some(api_key) = config.api_key.clone() {
        agent.set_api_key(Some(api_key)).await?;
    }

    // Seed system facts; the agent stays idle until both halves are loaded
    agent.store().update_system(|system| {
        system.flash_guid = Some(config.flash_guid.clone());
        system.server_version = Some(config.server_version.clone());
        system.network = config.network;
        system.array_status = LoadStatus::Loaded;
    });

    let (shutdown_tx, shutdown_rx) = oneshot::channel();
    let mut runner = {
        let agent = agent.clone();
        tokio::spawn(async move { agent.run_with_shutdown(Some(shutdown_rx)).await })
    };

    info!("Agent started");

    tokio::select! {
        signal = wait_for_shutdown() => {
            info!("Received shutdown signal: {}", signal?);
        }
        finished = &mut runner => {
            // The agent stopped without being asked to
            return match finished {
                Ok(result) => result.map_err(Into::into),
                Err(e) => Err(anyhow::anyhow!("Agent task failed: {}", e)),
            };
        }
    }

    info!("Shutting down daemon");
    let _ = shutdown_tx.send(());

    match tokio::time::timeout(Duration::from_secs(SHUTDOWN_TIMEOUT_SECS), runner).await {
        Ok(Ok(result)) => result?,
        Ok(Err(e)) => anyhow::bail!("Agent task failed: {}", e),
        Err(_) => anyhow::bail!("Shutdown timeout after {}s", SHUTDOWN_TIMEOUT_SECS),
    }

    Ok(())
}

/// Wait for shutdown signals (SIGTERM, SIGINT)
///
/// Returns the name of the signal received.
#[cfg(unix)]
async fn wait_for_shutdown() -> Result<&'static str> {
    // Set up signal handlers for SIGTERM and SIGINT
    let mut sigterm = signal(SignalKind::terminate())
        .map_err(|e| anyhow::anyhow!("Failed to setup SIGTERM handler: {}", e))?;
    let mut sigint = signal(SignalKind::interrupt())
        .map_err(|e| anyhow::anyhow!("Failed to setup SIGINT handler: {}", e))?;

    Ok(tokio::select! {
        _ = sigterm.recv() => "SIGTERM",
        _ = sigint.recv() => "SIGINT",
    })
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
