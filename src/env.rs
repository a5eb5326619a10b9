use std::env;
use std::str::FromStr;

use anyhow::{Context, Result};
use dotenv::dotenv;

use crate::config::{ConnectionConfig, RabbitConfig};

pub const AMQP_ADDR: &str = "AMQP_ADDR";
pub const RABBITMQ_QUEUE: &str = "RABBITMQ_QUEUE";
pub const RABBITMQ_CONSUMER_TAG: &str = "RABBITMQ_CONSUMER_TAG";
pub const RABBITMQ_EXCHANGE: &str = "RABBITMQ_EXCHANGE";
pub const RABBITMQ_EXCHANGE_TYPE: &str = "RABBITMQ_EXCHANGE_TYPE";
pub const RABBITMQ_PREFETCH_COUNT: &str = "RABBITMQ_PREFETCH_COUNT";
pub const RABBITMQ_CONNECT_TIMEOUT_SECONDS: &str = "RABBITMQ_CONNECT_TIMEOUT_SECONDS";
pub const RABBITMQ_PUBLISH_ATTEMPTS: &str = "RABBITMQ_PUBLISH_ATTEMPTS";
pub const RABBITMQ_PUBLISHER_CONFIRMS: &str = "RABBITMQ_PUBLISHER_CONFIRMS";

impl RabbitConfig {
    /// Reads the process environment, after loading `.env` if one is present.
    pub fn from_env() -> Result<Self> {
        dotenv().ok();
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Builds a config from any key lookup; unset keys keep their defaults.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let text = |key: &str| lookup(key).unwrap_or_default();

        let connection = ConnectionConfig::new(
            &text(AMQP_ADDR),
            &text(RABBITMQ_QUEUE),
            &text(RABBITMQ_CONSUMER_TAG),
        )
        .with_exchange(&text(RABBITMQ_EXCHANGE), &text(RABBITMQ_EXCHANGE_TYPE));

        let mut config = RabbitConfig {
            connection,
            ..RabbitConfig::default()
        };
        let settings = &mut config.settings;

        if let Some(prefetch) = parse(&lookup, RABBITMQ_PREFETCH_COUNT)? {
            settings.prefetch_count = prefetch;
        }
        if let Some(seconds) = parse::<u64, _>(&lookup, RABBITMQ_CONNECT_TIMEOUT_SECONDS)? {
            settings.connect_timeout_ms = seconds.saturating_mul(1_000);
        }
        if let Some(attempts) = parse(&lookup, RABBITMQ_PUBLISH_ATTEMPTS)? {
            settings.publish_attempts = attempts;
        }
        if let Some(confirms) = parse(&lookup, RABBITMQ_PUBLISHER_CONFIRMS)? {
            settings.publisher_confirms = confirms;
        }

        config.validate()?;
        Ok(config)
    }
}

fn parse<T, F>(lookup: &F, key: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        Some(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse()
            .map(Some)
            .with_context(|| format!("Invalid value for {key}: {raw:?}")),
        _ => Ok(None),
    }
}
