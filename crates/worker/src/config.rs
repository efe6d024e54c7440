//! Worker configuration

use saasbill_payments::webhooks::DEFAULT_REPLAY_BATCH;
use saasbill_shared::config::{env_optional, env_parse, env_required};
use saasbill_shared::ConfigError;

#[derive(Clone)]
pub struct WorkerConfig {
    pub database_url: String,
    /// Failed provider events replayed per run
    pub replay_batch: i64,
    /// Successfully processed provider events older than this are deleted
    pub event_retention_days: i64,
    pub json_logs: bool,
}

impl std::fmt::Debug for WorkerConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerConfig")
            .field("database_url", &"[REDACTED]")
            .field("replay_batch", &self.replay_batch)
            .field("event_retention_days", &self.event_retention_days)
            .field("json_logs", &self.json_logs)
            .finish()
    }
}

impl WorkerConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let replay_batch = env_parse("WORKER_REPLAY_BATCH", DEFAULT_REPLAY_BATCH)?;
        if replay_batch <= 0 {
            return Err(ConfigError::Invalid {
                key: "WORKER_REPLAY_BATCH".to_string(),
                message: "must be greater than zero".to_string(),
            });
        }

        let event_retention_days = env_parse("EVENT_RETENTION_DAYS", 30i64)?;
        if event_retention_days < 1 {
            return Err(ConfigError::Invalid {
                key: "EVENT_RETENTION_DAYS".to_string(),
                message: "must be at least 1".to_string(),
            });
        }

        Ok(Self {
            database_url: env_required("DATABASE_URL")?,
            replay_batch,
            event_retention_days,
            json_logs: env_optional("LOG_FORMAT").is_some_and(|f| f.eq_ignore_ascii_case("json")),
        })
    }
}
