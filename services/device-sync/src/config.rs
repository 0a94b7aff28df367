use std::{path::PathBuf, time::Duration};

use derivation::{AtRiskThresholds, DerivationConfig};
use ingestion::config::{ConfigError, EnvSource, derivation_settings};
use schema::{MAX_DEVICE_ID_LEN, ValidationRules};

use crate::{
    node::DeviceSettings,
    outbox::{OutboxConfig, OverflowPolicy, RetryPolicy},
    reconciler::SyncConfig,
};

pub const DEFAULT_GATE_URL: &str = "http://127.0.0.1:8090";

#[derive(Debug, Clone)]
pub struct DeviceConfig {
    pub device_id: String,
    pub gate_url: String,
    pub outbox_path: Option<PathBuf>,
    pub outbox: OutboxConfig,
    pub sync: SyncConfig,
    pub registry_path: Option<PathBuf>,
    pub duplicate_window_ms: i64,
    pub validation: ValidationRules,
    pub derivation: DerivationConfig,
    pub at_risk: AtRiskThresholds,
}

impl DeviceConfig {
    pub fn from_env_and_args() -> Result<Self, ConfigError> {
        device_config_from_inputs(std::env::args().skip(1), |key| std::env::var(key).ok())
    }

    pub fn settings(&self) -> DeviceSettings {
        DeviceSettings {
            device_id: self.device_id.clone(),
            duplicate_window_ms: self.duplicate_window_ms,
            validation: self.validation.clone(),
            derivation: self.derivation.clone(),
            at_risk: self.at_risk,
        }
    }

    pub fn summary(&self) -> Vec<String> {
        vec![
            format!("device_id={} gate_url={}", self.device_id, self.gate_url),
            format!(
                "outbox_path={} max_entries={} overflow={:?}",
                self.outbox_path
                    .as_ref()
                    .map(|path| path.display().to_string())
                    .unwrap_or_else(|| "<in-memory>".to_string()),
                self.outbox.max_entries,
                self.outbox.overflow
            ),
            format!(
                "retry_base_ms={} retry_max_ms={} max_attempts={}",
                self.outbox.retry.base_delay_ms,
                self.outbox.retry.max_delay_ms,
                self.outbox.retry.max_attempts
            ),
            format!(
                "batch_size={} push_interval_ms={} pull_online_ms={} pull_offline_ms={} timeout_ms={}",
                self.sync.batch_size,
                self.sync.push_interval.as_millis(),
                self.sync.pull_interval_online.as_millis(),
                self.sync.pull_interval_offline.as_millis(),
                self.sync.request_timeout.as_millis()
            ),
            format!(
                "duplicate_window_ms={} route={}",
                self.duplicate_window_ms,
                self.derivation.route.summary()
            ),
        ]
    }
}

pub fn device_config_from_inputs<I, F>(args: I, env_lookup: F) -> Result<DeviceConfig, ConfigError>
where
    I: IntoIterator<Item = String>,
    F: Fn(&str) -> Option<String>,
{
    let mut device_override: Option<String> = None;
    let mut gate_override: Option<String> = None;
    let mut outbox_override: Option<String> = None;
    let mut registry_override: Option<String> = None;

    let mut args = args.into_iter();
    while let Some(arg) = args.next() {
        let (flag, inline) = match arg.split_once('=') {
            Some((flag, value)) => (flag.to_string(), Some(value.to_string())),
            None => (arg.clone(), None),
        };
        let slot = match flag.as_str() {
            "--device-id" => &mut device_override,
            "--gate" => &mut gate_override,
            "--outbox" => &mut outbox_override,
            "--registry" => &mut registry_override,
            _ => return Err(ConfigError::UnknownOption(arg)),
        };
        let value = match inline {
            Some(value) => value,
            None => args.next().ok_or_else(|| ConfigError::MissingValue(flag.clone()))?,
        };
        *slot = Some(value);
    }

    let env = EnvSource::new("DEVICE", env_lookup);
    let retry_defaults = RetryPolicy::default();
    let outbox_defaults = OutboxConfig::default();
    let sync_defaults = SyncConfig::default();

    let device_id = device_override
        .or_else(|| env.string("DEVICE_ID"))
        .ok_or_else(|| ConfigError::MissingValue("YATRA_DEVICE_ID".to_string()))?;
    if device_id.trim().is_empty() || device_id.len() > MAX_DEVICE_ID_LEN {
        return Err(ConfigError::InvalidValue {
            key: "device_id".to_string(),
            value: device_id,
        });
    }

    let overflow = env
        .parse::<OverflowPolicy>("OUTBOX_OVERFLOW")?
        .unwrap_or(outbox_defaults.overflow);
    let outbox = OutboxConfig {
        max_entries: env
            .positive_usize("OUTBOX_MAX_ENTRIES")?
            .unwrap_or(outbox_defaults.max_entries),
        overflow,
        retry: RetryPolicy {
            base_delay_ms: env
                .positive_u64("RETRY_BASE_DELAY_MS")?
                .map(|value| value as i64)
                .unwrap_or(retry_defaults.base_delay_ms),
            max_delay_ms: env
                .positive_u64("RETRY_MAX_DELAY_MS")?
                .map(|value| value as i64)
                .unwrap_or(retry_defaults.max_delay_ms),
            max_attempts: env
                .parse::<u32>("RETRY_MAX_ATTEMPTS")?
                .filter(|value| *value > 0)
                .unwrap_or(retry_defaults.max_attempts),
        },
        compact_after_records: outbox_defaults.compact_after_records,
    };

    let millis = |name: &str, default: Duration| -> Result<Duration, ConfigError> {
        Ok(env
            .positive_u64(name)?
            .map(Duration::from_millis)
            .unwrap_or(default))
    };
    let sync = SyncConfig {
        batch_size: env
            .positive_usize("PUSH_BATCH_SIZE")?
            .unwrap_or(sync_defaults.batch_size),
        push_interval: millis("PUSH_INTERVAL_MS", sync_defaults.push_interval)?,
        pull_interval_online: millis("PULL_INTERVAL_ONLINE_MS", sync_defaults.pull_interval_online)?,
        pull_interval_offline: millis(
            "PULL_INTERVAL_OFFLINE_MS",
            sync_defaults.pull_interval_offline,
        )?,
        pull_page_limit: sync_defaults.pull_page_limit,
        request_timeout: millis("REQUEST_TIMEOUT_MS", sync_defaults.request_timeout)?,
    };

    let (derivation, at_risk) = derivation_settings(&env)?;
    let validation_defaults = ValidationRules::default();
    let validation = ValidationRules {
        route: derivation.route.clone(),
        max_future_skew_ms: validation_defaults.max_future_skew_ms,
    };

    Ok(DeviceConfig {
        device_id: device_id.trim().to_string(),
        gate_url: gate_override
            .or_else(|| env.string("GATE_URL"))
            .unwrap_or_else(|| DEFAULT_GATE_URL.to_string()),
        outbox_path: outbox_override
            .or_else(|| env.string("OUTBOX_PATH"))
            .map(PathBuf::from),
        outbox,
        sync,
        registry_path: registry_override
            .or_else(|| env.string("REGISTRY_PATH"))
            .map(PathBuf::from),
        duplicate_window_ms: env
            .parse::<i64>("DUPLICATE_WINDOW_MS")?
            .filter(|value| *value > 0)
            .unwrap_or(ingestion::gate::DEFAULT_DUPLICATE_WINDOW_MS),
        validation,
        derivation,
        at_risk,
    })
}
