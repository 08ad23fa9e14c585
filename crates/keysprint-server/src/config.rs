use serde::Deserialize;

/// Top-level server configuration, loaded from `keysprint.toml`.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub listen_addr: String,
    pub auth: AuthFileConfig,
    pub limits: LimitsConfig,
    pub rooms: RoomsConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0:8080".to_string(),
            auth: AuthFileConfig::default(),
            limits: LimitsConfig::default(),
            rooms: RoomsConfig::default(),
        }
    }
}

/// Auth section of the config file.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct AuthFileConfig {
    /// Shared secret the identity provider signs session tokens with. With
    /// no secret configured every `authenticate` attempt is rejected.
    pub session_secret: Option<String>,
    /// Bearer token guarding the management API. None disables the guard.
    pub bearer_token: Option<String>,
}

/// Infrastructure limits (connection caps, buffer sizes, rate limits).
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LimitsConfig {
    pub max_ws_connections: usize,
    /// Outbound message buffer per connection; full buffers drop frames
    /// rather than stall the room.
    pub connection_buffer: usize,
    pub ws_rate_limit_per_sec: f64,
    pub heartbeat_interval_secs: u64,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_ws_connections: 200,
            connection_buffer: 256,
            ws_rate_limit_per_sec: 50.0,
            heartbeat_interval_secs: 30,
        }
    }
}

/// Race pacing and room lifecycle configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RoomsConfig {
    /// First value of the countdown broadcast sequence.
    pub countdown_from: u32,
    pub countdown_interval_ms: u64,
    /// Delay between a race finishing and its room being destroyed.
    pub finished_teardown_secs: u64,
    pub idle_timeout_secs: u64,
    pub idle_check_interval_secs: u64,
}

impl Default for RoomsConfig {
    fn default() -> Self {
        Self {
            countdown_from: 5,
            countdown_interval_ms: 1000,
            finished_teardown_secs: 30,
            idle_timeout_secs: 3600,
            idle_check_interval_secs: 60,
        }
    }
}

impl ServerConfig {
    /// Validate configuration, logging warnings for issues.
    pub fn validate(&self) {
        if self.listen_addr.parse::<std::net::SocketAddr>().is_err() {
            tracing::error!(
                addr = %self.listen_addr,
                "listen_addr is not a valid socket address"
            );
            std::process::exit(1);
        }

        if self.auth.session_secret.is_none() {
            tracing::warn!(
                "No session secret is configured — every authenticate attempt will be rejected"
            );
        }

        // Warn about secrets in config file (should use env vars in production)
        if self.auth.session_secret.is_some() {
            tracing::warn!(
                "session_secret is set in config file — use KEYSPRINT_SESSION_SECRET env var in production"
            );
        }
        if self.auth.bearer_token.is_some() {
            tracing::warn!(
                "bearer_token is set in config file — use KEYSPRINT_API_TOKEN env var in production"
            );
        }

        // Validate limits
        if self.limits.max_ws_connections == 0 {
            tracing::error!("limits.max_ws_connections must be > 0");
            std::process::exit(1);
        }
        if self.limits.connection_buffer == 0 {
            tracing::error!("limits.connection_buffer must be > 0");
            std::process::exit(1);
        }
        if self.limits.ws_rate_limit_per_sec <= 0.0 {
            tracing::error!("limits.ws_rate_limit_per_sec must be > 0");
            std::process::exit(1);
        }
        if self.limits.heartbeat_interval_secs == 0 {
            tracing::error!("limits.heartbeat_interval_secs must be > 0");
            std::process::exit(1);
        }

        // Validate rooms
        if self.rooms.countdown_interval_ms == 0 {
            tracing::error!("rooms.countdown_interval_ms must be > 0");
            std::process::exit(1);
        }
        if self.rooms.idle_timeout_secs == 0 {
            tracing::error!("rooms.idle_timeout_secs must be > 0");
            std::process::exit(1);
        }
        if self.rooms.idle_check_interval_secs == 0 {
            tracing::error!("rooms.idle_check_interval_secs must be > 0");
            std::process::exit(1);
        }
    }

    /// Load config from `keysprint.toml` if it exists, then apply env var overrides.
    pub fn load() -> Self {
        let mut config = match std::fs::read_to_string("keysprint.toml") {
            Ok(content) => match toml::from_str::<ServerConfig>(&content) {
                Ok(cfg) => {
                    tracing::info!("Loaded configuration from keysprint.toml");
                    cfg
                },
                Err(e) => {
                    tracing::warn!("Failed to parse keysprint.toml: {e}, using defaults");
                    ServerConfig::default()
                },
            },
            Err(_) => {
                tracing::info!("No keysprint.toml found, using defaults");
                ServerConfig::default()
            },
        };

        // Environment variable overrides
        if let Ok(addr) = std::env::var("KEYSPRINT_LISTEN_ADDR")
            && !addr.is_empty()
        {
            config.listen_addr = addr;
        }
        if let Ok(secret) = std::env::var("KEYSPRINT_SESSION_SECRET")
            && !secret.is_empty()
        {
            config.auth.session_secret = Some(secret);
        }
        if let Ok(token) = std::env::var("KEYSPRINT_API_TOKEN")
            && !token.is_empty()
        {
            config.auth.bearer_token = Some(token);
        }

        // Limits overrides
        if let Ok(val) = std::env::var("KEYSPRINT_MAX_WS_CONNECTIONS")
            && let Ok(n) = val.parse::<usize>()
        {
            config.limits.max_ws_connections = n;
        }
        if let Ok(val) = std::env::var("KEYSPRINT_WS_RATE_LIMIT")
            && let Ok(n) = val.parse::<f64>()
        {
            config.limits.ws_rate_limit_per_sec = n;
        }
        if let Ok(val) = std::env::var("KEYSPRINT_HEARTBEAT_INTERVAL_SECS")
            && let Ok(n) = val.parse::<u64>()
        {
            config.limits.heartbeat_interval_secs = n;
        }

        config
    }
}
