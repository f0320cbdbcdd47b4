// Client defaults and configuration loading.
use anyhow::{Context, Result};
use serde::Deserialize;
use std::fs;
use uuid::Uuid;

use crate::flow::FlowConfig;

pub(crate) const DEFAULT_COMMAND_WORKERS: usize = 4;
pub(crate) const DEFAULT_QUERY_WORKERS: usize = 4;
pub(crate) const DEFAULT_QUEUE_CAPACITY: usize = 500;
pub(crate) const DEFAULT_INITIAL_PERMITS: u64 = 1000;
pub(crate) const DEFAULT_REFILL_BATCH: u64 = 500;
pub(crate) const DEFAULT_REFILL_THRESHOLD: u64 = 500;

/// Client identity and tuning knobs.
///
/// `component_id` names the application toward the routing server (it is
/// carried on every subscribe/unsubscribe frame); `client_id` identifies
/// this process instance.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub component_id: String,
    pub client_id: String,
    pub command_workers: usize,
    pub query_workers: usize,
    pub queue_capacity: usize,
    pub initial_permits: u64,
    pub refill_batch: u64,
    pub refill_threshold: u64,
}

#[derive(Debug, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
struct ClientConfigOverride {
    command_workers: Option<usize>,
    query_workers: Option<usize>,
    queue_capacity: Option<usize>,
    initial_permits: Option<u64>,
    refill_batch: Option<u64>,
    refill_threshold: Option<u64>,
}

impl ClientConfig {
    pub fn new(component_id: impl Into<String>) -> Self {
        Self {
            component_id: component_id.into(),
            client_id: Uuid::new_v4().to_string(),
            command_workers: DEFAULT_COMMAND_WORKERS,
            query_workers: DEFAULT_QUERY_WORKERS,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            initial_permits: DEFAULT_INITIAL_PERMITS,
            refill_batch: DEFAULT_REFILL_BATCH,
            refill_threshold: DEFAULT_REFILL_THRESHOLD,
        }
    }

    /// Defaults, then `COURIER_*` environment overrides, then an optional
    /// YAML override file (explicit path or `COURIER_CLIENT_CONFIG`).
    pub fn from_env_or_yaml(
        component_id: impl Into<String>,
        config_path: Option<&str>,
    ) -> Result<Self> {
        let mut config = Self::from_env(component_id);
        let override_path = config_path
            .map(|value| value.to_string())
            .or_else(|| std::env::var("COURIER_CLIENT_CONFIG").ok());
        let contents = match override_path.as_deref() {
            Some(path) => match fs::read_to_string(path) {
                Ok(contents) => Some(contents),
                Err(err) => {
                    return Err(err).with_context(|| format!("read client config: {path}"));
                }
            },
            None => None,
        };
        if let Some(contents) = contents {
            let override_cfg: ClientConfigOverride =
                serde_yaml::from_str(&contents).context("parse client config yaml")?;
            override_cfg.apply(&mut config);
        }
        Ok(config)
    }

    fn from_env(component_id: impl Into<String>) -> Self {
        let mut config = Self::new(component_id);
        if let Some(value) = read_usize_env("COURIER_COMMAND_WORKERS") {
            config.command_workers = value;
        }
        if let Some(value) = read_usize_env("COURIER_QUERY_WORKERS") {
            config.query_workers = value;
        }
        if let Some(value) = read_usize_env("COURIER_QUEUE_CAPACITY") {
            config.queue_capacity = value;
        }
        if let Some(value) = read_u64_env("COURIER_INITIAL_PERMITS") {
            config.initial_permits = value;
        }
        if let Some(value) = read_u64_env("COURIER_REFILL_BATCH") {
            config.refill_batch = value;
        }
        if let Some(value) = read_u64_env("COURIER_REFILL_THRESHOLD") {
            config.refill_threshold = value;
        }
        config
    }

    pub(crate) fn flow(&self) -> FlowConfig {
        FlowConfig {
            initial: self.initial_permits,
            batch: self.refill_batch,
            threshold: self.refill_threshold,
        }
    }
}

impl ClientConfigOverride {
    fn apply(&self, config: &mut ClientConfig) {
        if let Some(value) = self.command_workers
            && value > 0
        {
            config.command_workers = value;
        }
        if let Some(value) = self.query_workers
            && value > 0
        {
            config.query_workers = value;
        }
        if let Some(value) = self.queue_capacity
            && value > 0
        {
            config.queue_capacity = value;
        }
        if let Some(value) = self.initial_permits
            && value > 0
        {
            config.initial_permits = value;
        }
        if let Some(value) = self.refill_batch
            && value > 0
        {
            config.refill_batch = value;
        }
        if let Some(value) = self.refill_threshold
            && value > 0
        {
            config.refill_threshold = value;
        }
    }
}

fn read_u64_env(key: &str) -> Option<u64> {
    std::env::var(key)
        .ok()
        .and_then(|value| value.parse::<u64>().ok())
        .filter(|value| *value > 0)
}

fn read_usize_env(key: &str) -> Option<usize> {
    std::env::var(key)
        .ok()
        .and_then(|value| value.parse::<usize>().ok())
        .filter(|value| *value > 0)
}
