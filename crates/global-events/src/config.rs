//! Event bus configuration.

use crate::error::{EventBusError, EventBusResult};
use crate::types::SubscriptionMode;

/// Prefix used when none is configured.
pub const DEFAULT_PREFIX: &str = "global-";

/// Default capacity of the error broadcast channel.
pub const DEFAULT_ERROR_CAPACITY: usize = 64;

/// Event bus configuration.
///
/// The broker connection and codec are passed to the constructor; this
/// struct holds everything else.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BusConfig {
    /// Prefix prepended to every wire channel (default: "global-").
    pub prefix: String,

    /// Subscription strategy (default: wildcard).
    pub mode: SubscriptionMode,

    /// Subscribe as soon as the receive connection is ready (default: true).
    pub auto_subscribe: bool,

    /// Buffered errors per `errors()` receiver before the oldest are dropped (default: 64).
    pub error_capacity: usize,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            prefix: DEFAULT_PREFIX.to_string(),
            mode: SubscriptionMode::default(),
            auto_subscribe: true,
            error_capacity: DEFAULT_ERROR_CAPACITY,
        }
    }
}

impl BusConfig {
    /// Create the default configuration.
    pub fn new() -> Self {
        Self::default()
    }

    /// Read configuration from the environment.
    ///
    /// - `EVENT_BUS_PREFIX`: channel prefix (may be empty)
    /// - `EVENT_BUS_MODE`: `wildcard` or `per-event`
    /// - `EVENT_BUS_AUTO_SUBSCRIBE`: `true`/`false`/`1`/`0`
    ///
    /// Unset variables keep their defaults; malformed ones are an error.
    pub fn from_env() -> EventBusResult<Self> {
        let mut config = Self::default();

        if let Ok(prefix) = std::env::var("EVENT_BUS_PREFIX") {
            config.prefix = prefix;
        }

        if let Ok(mode) = std::env::var("EVENT_BUS_MODE") {
            config.mode = mode.parse()?;
        }

        if let Ok(flag) = std::env::var("EVENT_BUS_AUTO_SUBSCRIBE") {
            config.auto_subscribe = parse_flag(&flag).ok_or_else(|| {
                EventBusError::Config(format!("EVENT_BUS_AUTO_SUBSCRIBE: invalid value '{}'", flag))
            })?;
        }

        config.validate()?;
        Ok(config)
    }

    /// Set the channel prefix.
    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self
    }

    /// Set the subscription strategy.
    pub fn with_mode(mut self, mode: SubscriptionMode) -> Self {
        self.mode = mode;
        self
    }

    /// Enable or disable auto-subscribe.
    pub fn with_auto_subscribe(mut self, auto_subscribe: bool) -> Self {
        self.auto_subscribe = auto_subscribe;
        self
    }

    /// Set the error channel capacity.
    pub fn with_error_capacity(mut self, capacity: usize) -> Self {
        self.error_capacity = capacity;
        self
    }

    /// Check the configuration.
    ///
    /// Glob metacharacters in the prefix would widen the wildcard pattern
    /// beyond this bus's namespace.
    pub fn validate(&self) -> EventBusResult<()> {
        if let Some(c) = self.prefix.chars().find(|c| matches!(c, '*' | '?' | '[' | ']')) {
            return Err(EventBusError::Config(format!(
                "prefix '{}' contains glob character '{}'",
                self.prefix, c
            )));
        }

        if self.error_capacity == 0 {
            return Err(EventBusError::Config(
                "error_capacity must be greater than zero".to_string(),
            ));
        }

        Ok(())
    }
}

fn parse_flag(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}
