//! Server configuration, loaded from environment variables at startup.

use std::time::Duration;

use reelforge_core::{OrchestratorConfig, RuntimeError};

/// Base URL and credential of one provider-facing service.
#[derive(Clone)]
pub struct Endpoint {
    pub base_url: String,
    pub api_key: String,
}

impl std::fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Endpoint")
            .field("base_url", &self.base_url)
            .field("api_key", &"<redacted>")
            .finish()
    }
}

/// Runtime configuration for reelforge-server.
///
/// Server settings have defaults; provider endpoints do not. A missing
/// endpoint is reported by [`Config::endpoint`] as a configuration error so
/// startup aborts before any task is created.
#[derive(Debug, Clone)]
pub struct Config {
    /// TCP address to bind (default: `"0.0.0.0:3000"`).
    pub bind_address: String,

    /// SQLite database URL (default: `"sqlite://reelforge.db"`).
    pub database_url: String,

    /// `tracing` filter string, e.g. `"info"` or `"debug,tower_http=warn"`.
    pub log_level: String,

    /// When `true`, emit log records as newline-delimited JSON.
    pub log_json: bool,

    pub image: Option<Endpoint>,
    pub audio: Option<Endpoint>,
    pub motion: Option<Endpoint>,
    pub video: Option<Endpoint>,
    /// Asset hosting used to make local files reachable by providers.
    pub assets: Option<Endpoint>,
    /// Avatar group management.
    pub avatar: Option<Endpoint>,

    /// Simultaneous uploads inside a run (default: 2).
    pub upload_concurrency: usize,
    /// Admission cap for standalone batches (default: 2).
    pub batch_concurrency: usize,
    /// Seconds between two status checks of one task (default: 5).
    pub poll_interval_secs: u64,
    /// Voice used when a run request names none.
    pub default_voice_id: Option<String>,
}

impl Config {
    /// Build [`Config`] from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build [`Config`] from an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = OrchestratorConfig::default();
        Self {
            bind_address: env_or(&lookup, "REELFORGE_BIND", "0.0.0.0:3000"),
            database_url: env_or(&lookup, "REELFORGE_DATABASE_URL", "sqlite://reelforge.db"),
            log_level: env_or(&lookup, "REELFORGE_LOG", "info"),
            log_json: lookup("REELFORGE_LOG_JSON")
                .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
                .unwrap_or(false),
            image: endpoint(&lookup, "IMAGE"),
            audio: endpoint(&lookup, "AUDIO"),
            motion: endpoint(&lookup, "MOTION"),
            video: endpoint(&lookup, "VIDEO"),
            assets: endpoint(&lookup, "ASSETS"),
            avatar: endpoint(&lookup, "AVATAR"),
            upload_concurrency: parse_env(
                &lookup,
                "REELFORGE_UPLOAD_CONCURRENCY",
                defaults.upload_concurrency,
            ),
            batch_concurrency: parse_env(
                &lookup,
                "REELFORGE_BATCH_CONCURRENCY",
                defaults.batch_concurrency,
            ),
            poll_interval_secs: parse_env(
                &lookup,
                "REELFORGE_POLL_INTERVAL_SECS",
                defaults.poll_interval.as_secs(),
            ),
            default_voice_id: lookup("REELFORGE_DEFAULT_VOICE_ID").filter(|v| !v.is_empty()),
        }
    }

    /// The endpoint configured under `name`, or a configuration error
    /// naming the variables to set.
    pub fn endpoint<'a>(
        &self,
        name: &str,
        slot: &'a Option<Endpoint>,
    ) -> Result<&'a Endpoint, RuntimeError> {
        slot.as_ref().ok_or_else(|| {
            let var = name.to_uppercase();
            RuntimeError::Configuration(format!(
                "{name} provider is not configured; set REELFORGE_{var}_URL and REELFORGE_{var}_API_KEY"
            ))
        })
    }

    /// Core tuning derived from the server settings.
    pub fn orchestrator(&self) -> OrchestratorConfig {
        OrchestratorConfig {
            upload_concurrency: self.upload_concurrency.max(1),
            batch_concurrency: self.batch_concurrency.max(1),
            poll_interval: Duration::from_secs(self.poll_interval_secs.max(1)),
            default_voice_id: self.default_voice_id.clone(),
            ..OrchestratorConfig::default()
        }
    }
}

// ── private helpers ──────────────────────────────────────────────────────────

fn env_or<F>(lookup: &F, key: &str, default: &str) -> String
where
    F: Fn(&str) -> Option<String>,
{
    lookup(key).unwrap_or_else(|| default.to_owned())
}

fn parse_env<F, T>(lookup: &F, key: &str, default: T) -> T
where
    F: Fn(&str) -> Option<String>,
    T: std::str::FromStr,
{
    lookup(key).and_then(|v| v.parse().ok()).unwrap_or(default)
}

/// `REELFORGE_{name}_URL` plus `REELFORGE_{name}_API_KEY`; both are needed.
fn endpoint<F>(lookup: &F, name: &str) -> Option<Endpoint>
where
    F: Fn(&str) -> Option<String>,
{
    let base_url = lookup(&format!("REELFORGE_{name}_URL")).filter(|v| !v.is_empty())?;
    let api_key = lookup(&format!("REELFORGE_{name}_API_KEY")).filter(|v| !v.is_empty())?;
    Some(Endpoint {
        base_url: base_url.trim_end_matches('/').to_owned(),
        api_key,
    })
}
