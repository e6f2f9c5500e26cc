//! Gateway configuration, loaded from environment variables at startup.
//!
//! DESIGN
//! ======
//! One read at process start into an immutable `Config`; no hot reload.
//! Unparseable values fall back to defaults rather than aborting, matching
//! how the rest of the platform treats tuning knobs.

use std::time::Duration;

use tracing::warn;

const DEFAULT_BIND: &str = "0.0.0.0:3000";
const DEFAULT_PATH: &str = "/websocket";
const DEFAULT_AUTH_TIMEOUT_SECS: u64 = 15;
const DEFAULT_HEARTBEAT_PERIOD_SECS: u64 = 30;

/// Admission policy for the websocket upgrade endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthMode {
    /// Admit everyone; connections start with null accountability.
    Public,
    /// Admit everyone, then require an `AUTH` frame within the timeout.
    Handshake,
    /// Require a resolvable `access_token` query parameter at upgrade time.
    Strict,
}

impl AuthMode {
    fn parse(raw: &str) -> Option<Self> {
        match raw.to_ascii_lowercase().as_str() {
            "public" => Some(Self::Public),
            "handshake" => Some(Self::Handshake),
            "strict" => Some(Self::Strict),
            _ => None,
        }
    }
}

/// Immutable runtime configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Listen address for the HTTP server.
    pub bind: String,
    /// Path the websocket upgrade endpoint is mounted on.
    pub path: String,
    /// Admission policy.
    pub auth_mode: AuthMode,
    /// Handshake deadline and token-expiry grace window.
    pub auth_timeout: Duration,
    /// Server-initiated ping cadence; `None` disables the heartbeat.
    pub heartbeat_period: Option<Duration>,
}

impl Config {
    /// Load configuration from the environment.
    #[must_use]
    pub fn from_env() -> Self {
        let auth_mode = match std::env::var("WEBSOCKETS_REST_AUTH") {
            Ok(raw) => AuthMode::parse(&raw).unwrap_or_else(|| {
                warn!(value = %raw, "unrecognized WEBSOCKETS_REST_AUTH; falling back to handshake");
                AuthMode::Handshake
            }),
            Err(_) => AuthMode::Handshake,
        };

        // The x10000 factor is a wart inherited from the reference deployment:
        // the timeout was documented in seconds but has always been applied
        // multiplied by 10000. Deployed clients size their retry windows
        // around the inflated value, so it is preserved verbatim here.
        // TODO: add a WEBSOCKETS_REST_AUTH_TIMEOUT_MS variable and migrate
        // deployments off the multiplied form.
        let auth_timeout_secs = env_parse("WEBSOCKETS_REST_AUTH_TIMEOUT", DEFAULT_AUTH_TIMEOUT_SECS);
        let auth_timeout = Duration::from_millis(auth_timeout_secs.saturating_mul(10_000));

        let heartbeat_period = if env_parse("WEBSOCKETS_HEARTBEAT_ENABLED", true) {
            Some(Duration::from_secs(env_parse(
                "WEBSOCKETS_HEARTBEAT_PERIOD",
                DEFAULT_HEARTBEAT_PERIOD_SECS,
            )))
        } else {
            None
        };

        Self {
            bind: std::env::var("GATEWAY_BIND").unwrap_or_else(|_| DEFAULT_BIND.into()),
            path: std::env::var("WEBSOCKETS_REST_PATH").unwrap_or_else(|_| DEFAULT_PATH.into()),
            auth_mode,
            auth_timeout,
            heartbeat_period,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind: DEFAULT_BIND.into(),
            path: DEFAULT_PATH.into(),
            auth_mode: AuthMode::Handshake,
            auth_timeout: Duration::from_secs(DEFAULT_AUTH_TIMEOUT_SECS),
            heartbeat_period: Some(Duration::from_secs(DEFAULT_HEARTBEAT_PERIOD_SECS)),
        }
    }
}

fn env_parse<T>(key: &str, default: T) -> T
where
    T: std::str::FromStr + Copy,
{
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse::<T>().ok())
        .unwrap_or(default)
}

#[cfg(test)]
#[path = "config_test.rs"]
mod tests;
