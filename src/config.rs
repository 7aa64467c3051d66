use std::time::Duration;

pub const CALL_TIMEOUT_ENV: &str = "WEBCHANNEL_CALL_TIMEOUT_MS";

/// Knobs for a [`Channel`](crate::Channel).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChannelConfig {
    /// Upper bound on how long an awaited reply may take. `None` waits forever.
    pub call_timeout: Option<Duration>,
}

impl ChannelConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = Some(timeout);
        self
    }

    /// Reads `WEBCHANNEL_CALL_TIMEOUT_MS`. Unset or unparseable means no
    /// timeout.
    pub fn from_env() -> Self {
        let call_timeout = match std::env::var(CALL_TIMEOUT_ENV) {
            Ok(raw) => match raw.trim().parse::<u64>() {
                Ok(ms) => Some(Duration::from_millis(ms)),
                Err(e) => {
                    tracing::warn!(value = %raw, error = %e, "ignoring {}", CALL_TIMEOUT_ENV);
                    None
                }
            },
            Err(_) => None,
        };
        Self { call_timeout }
    }
}
