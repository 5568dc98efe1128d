use clap::Parser;

/// VLESS-over-WebSocket tunnel terminator.
///
/// Accepts WebSocket upgrades carrying a VLESS-style greeting, authenticates
/// the embedded UUID against the configured providers, and proxies payload
/// as outbound TCP, DNS-over-HTTPS, or Mux.Cool sub-streams.
#[derive(Parser, Debug, Clone)]
#[command(version, about)]
pub struct Config {
    /// Port to listen on for HTTP/WebSocket connections
    #[arg(long, env = "PORT", default_value_t = 8080)]
    pub listen_port: u16,

    /// Shared secret required for /api/* endpoints
    #[arg(long, env = "API_KEY")]
    pub api_key: Option<String>,

    /// Development UUID (registered as a static provider when DEV_MODE is set)
    #[arg(long, env = "UUID")]
    pub uuid: Option<String>,

    /// Register UUID as a static provider
    #[arg(long, env = "DEV_MODE", default_value_t = false)]
    pub dev_mode: bool,

    /// Remnawave panel base URL (enables the remote provider)
    #[arg(long, env = "RW_API_URL")]
    pub rw_api_url: Option<String>,

    /// Remnawave panel bearer token
    #[arg(long, env = "RW_API_KEY")]
    pub rw_api_key: Option<String>,

    /// Generic HTTP UUID list endpoint
    #[arg(long, env = "UUID_API_URL")]
    pub uuid_api_url: Option<String>,

    /// UUID cache TTL in seconds
    #[arg(long, env = "UUID_CACHE_TTL", default_value_t = 300)]
    pub uuid_cache_ttl: u64,

    /// Optional sqlite path for the persistent UUID cache tier
    #[arg(long, env = "CACHE_DB")]
    pub cache_db: Option<String>,

    /// Fallback host for the one-shot TCP connect retry
    #[arg(long, env = "PROXY_IP")]
    pub proxy_ip: Option<String>,

    /// DNS-over-HTTPS endpoint for tunneled UDP port-53 queries
    #[arg(long, env = "DNS_SERVER", default_value = "https://1.1.1.1/dns-query")]
    pub dns_server: String,

    /// Allow Mux.Cool tunnels (explicit MUX command or sentinel address)
    #[arg(long, env = "MUX_ENABLED", default_value_t = true)]
    pub mux_enabled: bool,

    /// Host-imposed cap on outbound TCP sub-connections per tunnel
    #[arg(long, env = "MAX_SUBREQUESTS", default_value_t = 48)]
    pub max_subrequests: u32,

    /// Idle threshold in seconds for Mux session teardown
    #[arg(long, env = "IDLE_TIMEOUT", default_value_t = 300)]
    pub idle_timeout_secs: u64,

    /// Traffic report endpoint (disabled when unset)
    #[arg(long, env = "STATS_REPORT_URL")]
    pub stats_report_url: Option<String>,

    /// Bearer token for traffic reports
    #[arg(long, env = "STATS_REPORT_TOKEN")]
    pub stats_report_token: Option<String>,

    /// Log level (off, error, warn, info, debug)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    pub log_level: String,
}

impl Config {
    pub fn validate(&self) -> anyhow::Result<()> {
        let level = self.log_level.to_ascii_lowercase();
        if !matches!(
            level.as_str(),
            "off" | "error" | "warn" | "info" | "debug" | "trace"
        ) {
            anyhow::bail!("invalid LOG_LEVEL: {}", self.log_level);
        }
        if self.uuid_cache_ttl == 0 {
            anyhow::bail!("UUID_CACHE_TTL must be positive");
        }
        if self.max_subrequests == 0 {
            anyhow::bail!("MAX_SUBREQUESTS must be positive");
        }
        if self.dev_mode && self.uuid.is_none() {
            anyhow::bail!("DEV_MODE requires UUID");
        }
        Ok(())
    }

    /// Normalized lowercase log level for the tracing filter.
    pub fn log_filter(&self) -> String {
        self.log_level.to_ascii_lowercase()
    }
}
