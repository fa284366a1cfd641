use crate::projector::{default_consumer_name, ConsumerSettings, DEFAULT_CONSUMER_GROUP};
use crate::retry::RetryPolicy;
use anyhow::{Context, Result};
use std::str::FromStr;
use std::time::Duration;

/// Process configuration, read once at start-up and handed to the
/// components that need it.
#[derive(Clone, Debug)]
pub struct Config {
    pub redis_url: String,
    pub database_url: String,
    pub user_service_url: String,
    pub user_service_token: Option<String>,
    pub jwt_secret: Option<String>,
    pub consumer_group: String,
    pub consumer_name: String,
    pub topic_partitions: u32,
    pub projector_max_attempts: u32,
    pub projector_base_delay: Duration,
    pub projector_max_delay: Duration,
    pub dead_letter_capacity: usize,
    pub outbox_capacity: usize,
    pub outbox_flush_interval: Duration,
}

fn var_or(name: &str, default: &str) -> String {
    std::env::var(name).unwrap_or_else(|_| default.to_string())
}

fn optional_var(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.is_empty())
}

fn parsed_var<T>(name: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .with_context(|| format!("invalid value for {name}: {raw:?}")),
        Err(_) => Ok(default),
    }
}

impl Config {
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            redis_url: var_or("REDIS_URL", "redis://localhost:6379"),
            database_url: var_or("DATABASE_URL", "postgres://localhost/assethub"),
            user_service_url: var_or("USER_SERVICE_URL", "http://localhost:8081"),
            user_service_token: optional_var("USER_SERVICE_TOKEN"),
            jwt_secret: optional_var("JWT_SECRET"),
            consumer_group: var_or("CONSUMER_GROUP", DEFAULT_CONSUMER_GROUP),
            consumer_name: optional_var("CONSUMER_NAME").unwrap_or_else(default_consumer_name),
            topic_partitions: parsed_var("TOPIC_PARTITIONS", 8)?,
            projector_max_attempts: parsed_var("PROJECTOR_MAX_ATTEMPTS", 5)?,
            projector_base_delay: Duration::from_millis(parsed_var("PROJECTOR_BASE_DELAY_MS", 100)?),
            projector_max_delay: Duration::from_millis(parsed_var("PROJECTOR_MAX_DELAY_MS", 5000)?),
            dead_letter_capacity: parsed_var("DEAD_LETTER_CAPACITY", 10_000)?,
            outbox_capacity: parsed_var("OUTBOX_CAPACITY", 10_000)?,
            outbox_flush_interval: Duration::from_millis(parsed_var("OUTBOX_FLUSH_INTERVAL_MS", 1000)?),
        })
    }

    pub fn write_retry(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.projector_max_attempts,
            self.projector_base_delay,
            self.projector_max_delay,
        )
    }

    pub fn consumer_settings(&self) -> ConsumerSettings {
        ConsumerSettings {
            group: self.consumer_group.clone(),
            consumer: self.consumer_name.clone(),
            read_backoff: RetryPolicy::new(u32::MAX, self.projector_base_delay, self.projector_max_delay),
        }
    }

    /// The token secret, required by anything that verifies tokens.
    pub fn require_jwt_secret(&self) -> Result<&str> {
        self.jwt_secret
            .as_deref()
            .context("JWT_SECRET must be set to verify tokens")
    }
}
