use clap::Parser;
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

/// Parlor realtime chat & call-signaling server
#[derive(Parser, Serialize, Deserialize, Clone, Debug)]
#[command(name = "parlor-server", version, about = "Parlor realtime chat server")]
pub struct Config {
    /// Port to listen on
    #[arg(long, env = "PARLOR_PORT", default_value = "7440")]
    pub port: u16,

    /// Bind address
    #[arg(long, env = "PARLOR_BIND_ADDRESS", default_value = "0.0.0.0")]
    pub bind_address: String,

    /// Path to TOML config file
    #[arg(long, default_value = "./parlor.toml")]
    pub config: String,

    /// Enable structured JSON logging (for Docker/production)
    #[arg(long, env = "PARLOR_JSON_LOGS")]
    pub json_logs: bool,

    /// Output a commented TOML config template and exit
    #[arg(long)]
    pub generate_config: bool,

    /// Data directory for persistent state (DB, keys)
    #[arg(long, env = "PARLOR_DATA_DIR", default_value = "./data")]
    pub data_dir: String,

    /// Call signaling tuning (loaded from [calls] section in TOML)
    #[arg(skip)]
    #[serde(default)]
    pub calls: CallsConfig,

    /// Media relay configuration (loaded from [relay] section in TOML)
    #[arg(skip)]
    #[serde(default)]
    pub relay: Option<RelayConfig>,

    /// Push provider configuration (loaded from [push] section in TOML)
    #[arg(skip)]
    #[serde(default)]
    pub push: Option<PushConfig>,
}

/// Tuning for the call-signaling state machine sweeps.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallsConfig {
    /// Seconds a call may sit in initiated/ringing before the sweep marks it missed
    #[serde(default = "default_ring_timeout")]
    pub ring_timeout_secs: u64,

    /// Interval between stale-call sweep runs
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,
}

impl Default for CallsConfig {
    fn default() -> Self {
        Self {
            ring_timeout_secs: 120,
            sweep_interval_secs: 60,
        }
    }
}

fn default_ring_timeout() -> u64 {
    120
}

fn default_sweep_interval() -> u64 {
    60
}

/// Configuration for the third-party audio/video relay.
///
/// Sessions are provisioned over HTTP; per-participant access tokens are
/// minted locally with the shared-secret time-limited credential mechanism.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayConfig {
    /// Whether relay provisioning is enabled (default: false)
    #[serde(default)]
    pub enabled: bool,

    /// Relay provider base URL, e.g. "https://relay.example.com"
    #[serde(default)]
    pub endpoint: String,

    /// Application id registered with the relay provider
    #[serde(default)]
    pub app_id: String,

    /// Shared secret for minting time-limited access tokens
    #[serde(default)]
    pub shared_secret: String,

    /// Access token TTL in seconds (default: 3600)
    #[serde(default = "default_token_ttl")]
    pub token_ttl_secs: u64,
}

fn default_token_ttl() -> u64 {
    3600
}

/// Configuration for the push-notification provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PushConfig {
    /// Whether push delivery is enabled (default: false)
    #[serde(default)]
    pub enabled: bool,

    /// Provider delivery URL; one POST per (subscription, notification)
    #[serde(default)]
    pub endpoint: String,

    /// Bearer credential for the provider
    #[serde(default)]
    pub api_key: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 7440,
            bind_address: "0.0.0.0".to_string(),
            config: "./parlor.toml".to_string(),
            json_logs: false,
            generate_config: false,
            data_dir: "./data".to_string(),
            calls: CallsConfig::default(),
            relay: None,
            push: None,
        }
    }
}

impl Config {
    /// Load config with layered precedence:
    /// built-in defaults < TOML file < env vars (PARLOR_*) < CLI args
    pub fn load() -> Result<Self, figment::Error> {
        let cli = Config::parse();
        let config_path = cli.config.clone();

        Figment::new()
            .merge(Serialized::defaults(Config::default()))
            .merge(Toml::file(&config_path))
            .merge(Env::prefixed("PARLOR_"))
            .merge(Serialized::defaults(cli))
            .extract()
    }
}

/// Generate a commented TOML config template
pub fn generate_config_template() -> String {
    r#"# Parlor Server Configuration
# Place this file at ./parlor.toml or specify with --config <path>
# All settings can be overridden via environment variables (PARLOR_PORT, etc.)
# or CLI flags (--port, etc.)

# Server port (default: 7440)
# port = 7440

# Bind address (default: 0.0.0.0 — all interfaces)
# bind_address = "0.0.0.0"

# Enable structured JSON logging for Docker/production
# json_logs = false

# Data directory for SQLite database and JWT signing key
# data_dir = "./data"

# ---- Call Signaling ----
# [calls]

# Seconds a call may sit unanswered before the sweep marks it missed
# ring_timeout_secs = 120

# Interval in seconds between stale-call sweep runs
# sweep_interval_secs = 60

# ---- Media Relay ----
# [relay]
# enabled = false
# endpoint = "https://relay.example.com"
# app_id = ""
# shared_secret = ""
# token_ttl_secs = 3600  # 1 hour

# ---- Push Notifications ----
# [push]
# enabled = false
# endpoint = "https://push.example.com/v1/send"
# api_key = ""
"#
    .to_string()
}
