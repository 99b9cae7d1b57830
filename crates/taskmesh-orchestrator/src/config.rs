//! Orchestrator configuration.
//!
//! Read once at startup from the environment (the CLI loads `.env`
//! first).  Everything has a default except the planner key -- without
//! `PLANNER_API_KEY` the orchestrator runs with the offline keyword
//! planner.

use std::time::Duration;

use crate::planner::PlannerConfig;

/// Environment variable naming the bus endpoint.
pub const ENV_BUS_URL: &str = "BUS_URL";

/// Environment variable carrying the planner API key.
pub const ENV_PLANNER_API_KEY: &str = "PLANNER_API_KEY";

/// Optional override of the planner endpoint.
pub const ENV_PLANNER_BASE_URL: &str = "PLANNER_BASE_URL";

/// Optional override of the planner model.
pub const ENV_PLANNER_MODEL: &str = "PLANNER_MODEL";

/// Optional dispatch timeout in seconds; `0` disables expiry.
pub const ENV_DISPATCH_TIMEOUT_SECS: &str = "DISPATCH_TIMEOUT_SECS";

/// Default in-process bus endpoint.
pub const DEFAULT_BUS_URL: &str = "mem://local";

/// Default pause at the bottom of an idle dispatch scan.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Default time before an unanswered dispatch is released.
pub const DEFAULT_DISPATCH_TIMEOUT: Duration = Duration::from_secs(120);

/// Top-level orchestrator settings.
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Bus endpoint URL.
    pub bus_url: String,
    /// Pause between dispatch scans.
    pub poll_interval: Duration,
    /// Release unanswered dispatches after this long; `None` waits
    /// forever.
    pub dispatch_timeout: Option<Duration>,
    /// LLM planner settings, when a key is configured.
    pub planner: Option<PlannerConfig>,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            bus_url: DEFAULT_BUS_URL.to_owned(),
            poll_interval: DEFAULT_POLL_INTERVAL,
            dispatch_timeout: Some(DEFAULT_DISPATCH_TIMEOUT),
            planner: None,
        }
    }
}

impl OrchestratorConfig {
    /// Assemble configuration from the process environment.
    pub fn from_env() -> Self {
        let mut config = Self {
            bus_url: std::env::var(ENV_BUS_URL).unwrap_or_else(|_| DEFAULT_BUS_URL.to_owned()),
            ..Self::default()
        };

        if let Ok(secs) = std::env::var(ENV_DISPATCH_TIMEOUT_SECS) {
            match secs.parse::<u64>() {
                Ok(0) => config.dispatch_timeout = None,
                Ok(secs) => config.dispatch_timeout = Some(Duration::from_secs(secs)),
                Err(_) => {
                    tracing::warn!(
                        value = %secs,
                        "ignoring unparseable {ENV_DISPATCH_TIMEOUT_SECS}"
                    );
                }
            }
        }

        if let Ok(api_key) = std::env::var(ENV_PLANNER_API_KEY)
            && !api_key.is_empty()
        {
            let mut planner = PlannerConfig::new(api_key);
            if let Ok(base_url) = std::env::var(ENV_PLANNER_BASE_URL) {
                planner.base_url = base_url;
            }
            if let Ok(model) = std::env::var(ENV_PLANNER_MODEL) {
                planner.model = model;
            }
            config.planner = Some(planner);
        }

        config
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let config = OrchestratorConfig::default();
        assert_eq!(config.bus_url, DEFAULT_BUS_URL);
        assert_eq!(config.poll_interval, DEFAULT_POLL_INTERVAL);
        assert_eq!(config.dispatch_timeout, Some(DEFAULT_DISPATCH_TIMEOUT));
        assert!(config.planner.is_none());
    }
}
