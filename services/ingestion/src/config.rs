use std::{path::PathBuf, str::FromStr, time::Duration};

use derivation::{AtRiskThresholds, DerivationConfig, DerivationConfigError};
use schema::{CheckpointId, CheckpointRole, CheckpointRoute, MINUTE_MS, ValidationRules};
use store::{CheckpointPolicy, WalWritePolicy};
use thiserror::Error;

use crate::gate::GateConfig;

pub const DEFAULT_BIND_ADDR: &str = "127.0.0.1:8090";
pub const DEFAULT_SWEEP_INTERVAL_SECS: u64 = 120;
pub const DEFAULT_BATCH_MAX_ITEMS: usize = 500;
const SHARED_PREFIX: &str = "YATRA";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid value '{value}' for {key}")]
    InvalidValue { key: String, value: String },
    #[error("{0} requires a value")]
    MissingValue(String),
    #[error("unknown option '{0}'")]
    UnknownOption(String),
    #[error("checkpoint route has no {0} checkpoint")]
    IncompleteRoute(&'static str),
    #[error(transparent)]
    Derivation(#[from] DerivationConfigError),
}

/// Environment lookup with a service-specific key and a shared fallback:
/// `YATRA_INGEST_<NAME>` first, then `YATRA_<NAME>`.
pub struct EnvSource<F> {
    service_prefix: String,
    lookup: F,
}

impl<F> EnvSource<F>
where
    F: Fn(&str) -> Option<String>,
{
    pub fn new(service: &str, lookup: F) -> Self {
        Self {
            service_prefix: format!("{SHARED_PREFIX}_{service}"),
            lookup,
        }
    }

    /// First non-blank value and the key it came from.
    pub fn raw(&self, name: &str) -> Option<(String, String)> {
        [
            format!("{}_{name}", self.service_prefix),
            format!("{SHARED_PREFIX}_{name}"),
        ]
        .into_iter()
        .find_map(|key| {
            (self.lookup)(&key)
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
                .map(|value| (key, value))
        })
    }

    pub fn string(&self, name: &str) -> Option<String> {
        self.raw(name).map(|(_, value)| value)
    }

    pub fn parse<T: FromStr>(&self, name: &str) -> Result<Option<T>, ConfigError> {
        match self.raw(name) {
            None => Ok(None),
            Some((key, value)) => value
                .parse::<T>()
                .map(Some)
                .map_err(|_| ConfigError::InvalidValue { key, value }),
        }
    }

    /// Zero counts as unset, so `0` falls back to the default.
    pub fn positive_u64(&self, name: &str) -> Result<Option<u64>, ConfigError> {
        Ok(self.parse::<u64>(name)?.filter(|value| *value > 0))
    }

    pub fn positive_usize(&self, name: &str) -> Result<Option<usize>, ConfigError> {
        Ok(self.parse::<usize>(name)?.filter(|value| *value > 0))
    }

    /// Minutes as milliseconds. A count too large for `i64` milliseconds is invalid.
    pub fn positive_minutes_ms(&self, name: &str) -> Result<Option<i64>, ConfigError> {
        let Some(minutes) = self.positive_u64(name)? else {
            return Ok(None);
        };
        match i64::try_from(minutes)
            .ok()
            .and_then(|minutes| minutes.checked_mul(MINUTE_MS))
        {
            Some(ms) => Ok(Some(ms)),
            None => {
                let (key, value) = self.raw(name).unwrap_or_default();
                Err(ConfigError::InvalidValue { key, value })
            }
        }
    }

    pub fn checkpoint_list(&self, name: &str) -> Result<Option<Vec<CheckpointId>>, ConfigError> {
        let Some((key, value)) = self.raw(name) else {
            return Ok(None);
        };
        value
            .split(',')
            .map(str::trim)
            .filter(|part| !part.is_empty())
            .map(|part| {
                part.parse::<CheckpointId>()
                    .map_err(|_| ConfigError::InvalidValue {
                        key: key.clone(),
                        value: value.clone(),
                    })
            })
            .collect::<Result<Vec<_>, _>>()
            .map(Some)
    }
}

#[derive(Debug, Clone)]
pub struct IngestConfig {
    pub bind_addr: String,
    pub wal_path: Option<PathBuf>,
    pub wal_policy: WalWritePolicy,
    /// Background flush cadence for batched WAL writes; `None` when every append syncs.
    pub wal_flush_interval: Option<Duration>,
    pub checkpoint_policy: CheckpointPolicy,
    pub registry_path: Option<PathBuf>,
    pub gate: GateConfig,
    pub derivation: DerivationConfig,
    pub at_risk: AtRiskThresholds,
    pub sweep_interval: Duration,
    pub admin_token: Option<String>,
    pub max_batch_items: usize,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            bind_addr: DEFAULT_BIND_ADDR.to_string(),
            wal_path: None,
            wal_policy: WalWritePolicy::default(),
            wal_flush_interval: None,
            checkpoint_policy: CheckpointPolicy::default(),
            registry_path: None,
            gate: GateConfig::default(),
            derivation: DerivationConfig::default(),
            at_risk: AtRiskThresholds::default(),
            sweep_interval: Duration::from_secs(DEFAULT_SWEEP_INTERVAL_SECS),
            admin_token: None,
            max_batch_items: DEFAULT_BATCH_MAX_ITEMS,
        }
    }
}

impl IngestConfig {
    pub fn from_env_and_args() -> Result<Self, ConfigError> {
        config_from_inputs(std::env::args().skip(1), |key| std::env::var(key).ok())
    }

    /// One line per concern, logged at startup.
    pub fn summary(&self) -> Vec<String> {
        vec![
            format!("bind_addr={}", self.bind_addr),
            format!(
                "wal_path={} sync_every_records={} append_buffer_records={} sync_interval_ms={}",
                self.wal_path
                    .as_ref()
                    .map(|path| path.display().to_string())
                    .unwrap_or_else(|| "<in-memory>".to_string()),
                self.wal_policy.sync_every_records,
                self.wal_policy.append_buffer_max_records,
                self.wal_policy
                    .sync_interval
                    .map(|value| value.as_millis())
                    .unwrap_or(0)
            ),
            format!(
                "duplicate_window_ms={} max_future_skew_ms={} route={}",
                self.gate.duplicate_window_ms,
                self.gate.validation.max_future_skew_ms,
                self.gate.validation.route.summary()
            ),
            format!(
                "min_lap_ms={} max_lap_ms={} completion_lookback_ms={} day_utc_offset_minutes={}",
                self.derivation.min_lap_ms,
                self.derivation.max_lap_ms,
                self.derivation.completion_lookback_ms,
                self.derivation.day_utc_offset_minutes
            ),
            format!(
                "transit_threshold_ms={} inactivity_threshold_ms={} daily_lap_target={} sweep_interval_secs={}",
                self.at_risk.transit_threshold_ms,
                self.at_risk.inactivity_threshold_ms,
                self.at_risk.daily_lap_target,
                self.sweep_interval.as_secs()
            ),
            format!(
                "admin_purge={}",
                if self.admin_token.is_some() {
                    "enabled"
                } else {
                    "disabled"
                }
            ),
        ]
    }
}

pub fn config_from_inputs<I, F>(args: I, env_lookup: F) -> Result<IngestConfig, ConfigError>
where
    I: IntoIterator<Item = String>,
    F: Fn(&str) -> Option<String>,
{
    let mut bind_override: Option<String> = None;
    let mut wal_override: Option<String> = None;
    let mut registry_override: Option<String> = None;

    let mut args = args.into_iter();
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--bind" | "--wal" | "--registry" => {
                let value = args
                    .next()
                    .ok_or_else(|| ConfigError::MissingValue(arg.clone()))?;
                match arg.as_str() {
                    "--bind" => bind_override = Some(value),
                    "--wal" => wal_override = Some(value),
                    _ => registry_override = Some(value),
                }
            }
            _ => {
                if let Some(value) = arg.strip_prefix("--bind=") {
                    bind_override = Some(value.to_string());
                } else if let Some(value) = arg.strip_prefix("--wal=") {
                    wal_override = Some(value.to_string());
                } else if let Some(value) = arg.strip_prefix("--registry=") {
                    registry_override = Some(value.to_string());
                } else {
                    return Err(ConfigError::UnknownOption(arg.clone()));
                }
            }
        }
    }

    let env = EnvSource::new("INGEST", env_lookup);
    let defaults = IngestConfig::default();

    let wal_policy = WalWritePolicy {
        sync_every_records: env
            .positive_usize("WAL_SYNC_EVERY_RECORDS")?
            .unwrap_or(defaults.wal_policy.sync_every_records),
        append_buffer_max_records: env
            .positive_usize("WAL_APPEND_BUFFER_RECORDS")?
            .unwrap_or(defaults.wal_policy.append_buffer_max_records),
        sync_interval: env
            .positive_u64("WAL_SYNC_INTERVAL_MS")?
            .map(Duration::from_millis),
    };
    let batching = wal_policy.sync_every_records > 1
        || wal_policy.append_buffer_max_records > 1
        || wal_policy.sync_interval.is_some();
    let wal_flush_interval = env
        .positive_u64("WAL_FLUSH_INTERVAL_MS")?
        .map(Duration::from_millis)
        .or_else(|| {
            batching.then(|| {
                wal_policy
                    .sync_interval
                    .unwrap_or(Duration::from_millis(250))
            })
        });

    let (derivation, at_risk) = derivation_settings(&env)?;

    let gate = GateConfig {
        duplicate_window_ms: env
            .parse::<i64>("DUPLICATE_WINDOW_MS")?
            .filter(|value| *value > 0)
            .unwrap_or(defaults.gate.duplicate_window_ms),
        validation: ValidationRules {
            route: derivation.route.clone(),
            max_future_skew_ms: env
                .parse::<i64>("MAX_FUTURE_SKEW_MS")?
                .filter(|value| *value >= 0)
                .unwrap_or(defaults.gate.validation.max_future_skew_ms),
        },
    };

    Ok(IngestConfig {
        bind_addr: bind_override
            .or_else(|| env.string("BIND"))
            .unwrap_or(defaults.bind_addr),
        wal_path: wal_override.or_else(|| env.string("WAL_PATH")).map(PathBuf::from),
        wal_policy,
        wal_flush_interval,
        checkpoint_policy: CheckpointPolicy {
            max_wal_records: env.positive_usize("CHECKPOINT_MAX_WAL_RECORDS")?,
            max_wal_bytes: env.positive_u64("CHECKPOINT_MAX_WAL_BYTES")?,
        },
        registry_path: registry_override
            .or_else(|| env.string("REGISTRY_PATH"))
            .map(PathBuf::from),
        gate,
        derivation,
        at_risk,
        sweep_interval: Duration::from_secs(
            env.positive_u64("SWEEP_INTERVAL_SECS")?
                .unwrap_or(DEFAULT_SWEEP_INTERVAL_SECS),
        ),
        admin_token: env.string("ADMIN_TOKEN"),
        max_batch_items: env
            .positive_usize("BATCH_MAX_ITEMS")?
            .unwrap_or(defaults.max_batch_items),
    })
}

/// Route, lap bounds and at-risk thresholds; shared by every service that derives stats.
pub fn derivation_settings<F>(
    env: &EnvSource<F>,
) -> Result<(DerivationConfig, AtRiskThresholds), ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    let defaults_derivation = DerivationConfig::default();
    let defaults_at_risk = AtRiskThresholds::default();
    let default_route = CheckpointRoute::default();
    let role_ids = |role: CheckpointRole| {
        default_route
            .checkpoints()
            .filter(|(_, r)| *r == role)
            .map(|(id, _)| id)
            .collect::<Vec<_>>()
    };
    let descent = env
        .checkpoint_list("DESCENT_CHECKPOINTS")?
        .unwrap_or_else(|| role_ids(CheckpointRole::DescentStart));
    let completion = env
        .checkpoint_list("COMPLETION_CHECKPOINTS")?
        .unwrap_or_else(|| role_ids(CheckpointRole::LapCompletion));
    let waypoints = env
        .checkpoint_list("WAYPOINT_CHECKPOINTS")?
        .unwrap_or_else(|| role_ids(CheckpointRole::Waypoint));
    if descent.is_empty() {
        return Err(ConfigError::IncompleteRoute("descent start"));
    }
    if completion.is_empty() {
        return Err(ConfigError::IncompleteRoute("lap completion"));
    }
    let route = CheckpointRoute::new(&descent, &completion, &waypoints);

    let day_utc_offset_minutes = env
        .parse::<i32>("DAY_UTC_OFFSET_MINUTES")?
        .unwrap_or(defaults_derivation.day_utc_offset_minutes);
    let derivation = DerivationConfig {
        route,
        min_lap_ms: env
            .positive_minutes_ms("MIN_LAP_MINUTES")?
            .unwrap_or(defaults_derivation.min_lap_ms),
        max_lap_ms: env
            .positive_minutes_ms("MAX_LAP_MINUTES")?
            .unwrap_or(defaults_derivation.max_lap_ms),
        completion_lookback_ms: env
            .positive_minutes_ms("COMPLETION_LOOKBACK_MINUTES")?
            .unwrap_or(defaults_derivation.completion_lookback_ms),
        day_utc_offset_minutes,
    };
    derivation.validate()?;

    let at_risk = AtRiskThresholds {
        transit_threshold_ms: env
            .positive_minutes_ms("TRANSIT_THRESHOLD_MINUTES")?
            .unwrap_or(defaults_at_risk.transit_threshold_ms),
        inactivity_threshold_ms: env
            .positive_minutes_ms("INACTIVITY_THRESHOLD_MINUTES")?
            .unwrap_or(defaults_at_risk.inactivity_threshold_ms),
        daily_lap_target: env
            .parse::<u32>("DAILY_LAP_TARGET")?
            .filter(|value| *value > 0)
            .unwrap_or(defaults_at_risk.daily_lap_target),
        day_utc_offset_minutes,
    };

    Ok((derivation, at_risk))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env_lookup(values: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = values
            .iter()
            .map(|(key, value)| ((*key).to_string(), (*value).to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_apply_when_env_is_empty() {
        let config = config_from_inputs(Vec::<String>::new(), env_lookup(&[])).unwrap();
        assert_eq!(config.bind_addr, DEFAULT_BIND_ADDR);
        assert_eq!(config.gate.duplicate_window_ms, 10 * MINUTE_MS);
        assert_eq!(config.at_risk.transit_threshold_ms, 300 * MINUTE_MS);
        assert_eq!(config.sweep_interval, Duration::from_secs(120));
        assert_eq!(config.wal_path, None);
        assert_eq!(config.wal_flush_interval, None);
        assert_eq!(
            config.gate.validation.route.role(2),
            Some(CheckpointRole::LapCompletion)
        );
    }

    #[test]
    fn service_key_wins_over_shared_fallback() {
        let config = config_from_inputs(
            Vec::<String>::new(),
            env_lookup(&[
                ("YATRA_INGEST_DUPLICATE_WINDOW_MS", "300000"),
                ("YATRA_DUPLICATE_WINDOW_MS", "900000"),
                ("YATRA_TRANSIT_THRESHOLD_MINUTES", "240"),
            ]),
        )
        .unwrap();
        assert_eq!(config.gate.duplicate_window_ms, 300_000);
        assert_eq!(config.at_risk.transit_threshold_ms, 240 * MINUTE_MS);
    }

    #[test]
    fn zero_values_fall_back_to_defaults() {
        let config = config_from_inputs(
            Vec::<String>::new(),
            env_lookup(&[
                ("YATRA_INGEST_DUPLICATE_WINDOW_MS", "0"),
                ("YATRA_INGEST_SWEEP_INTERVAL_SECS", "0"),
            ]),
        )
        .unwrap();
        assert_eq!(config.gate.duplicate_window_ms, 10 * MINUTE_MS);
        assert_eq!(config.sweep_interval, Duration::from_secs(120));
    }

    #[test]
    fn malformed_value_is_reported_with_its_key() {
        let err = config_from_inputs(
            Vec::<String>::new(),
            env_lookup(&[("YATRA_DUPLICATE_WINDOW_MS", "ten minutes")]),
        )
        .unwrap_err();
        assert_eq!(
            err,
            ConfigError::InvalidValue {
                key: "YATRA_DUPLICATE_WINDOW_MS".into(),
                value: "ten minutes".into(),
            }
        );
    }

    #[test]
    fn minute_values_that_overflow_milliseconds_are_rejected() {
        for minutes in ["200000000000000", "18446744073709551615"] {
            let err = config_from_inputs(
                Vec::<String>::new(),
                env_lookup(&[("YATRA_TRANSIT_THRESHOLD_MINUTES", minutes)]),
            )
            .unwrap_err();
            assert_eq!(
                err,
                ConfigError::InvalidValue {
                    key: "YATRA_TRANSIT_THRESHOLD_MINUTES".into(),
                    value: minutes.into(),
                }
            );
        }

        let config = config_from_inputs(
            Vec::<String>::new(),
            env_lookup(&[("YATRA_INACTIVITY_THRESHOLD_MINUTES", "1440")]),
        )
        .unwrap();
        assert_eq!(config.at_risk.inactivity_threshold_ms, 1440 * MINUTE_MS);
    }

    #[test]
    fn route_lists_and_cli_overrides_are_applied() {
        let config = config_from_inputs(
            vec![
                "--bind".to_string(),
                "0.0.0.0:9000".to_string(),
                "--wal=/tmp/yatra/events.wal".to_string(),
            ],
            env_lookup(&[
                ("YATRA_DESCENT_CHECKPOINTS", "1, 4"),
                ("YATRA_COMPLETION_CHECKPOINTS", "2"),
                ("YATRA_WAYPOINT_CHECKPOINTS", ""),
                ("YATRA_INGEST_WAL_SYNC_EVERY_RECORDS", "8"),
            ]),
        )
        .unwrap();
        assert_eq!(config.bind_addr, "0.0.0.0:9000");
        assert_eq!(config.wal_path, Some(PathBuf::from("/tmp/yatra/events.wal")));
        assert_eq!(
            config.derivation.route.role(4),
            Some(CheckpointRole::DescentStart)
        );
        assert_eq!(
            config.derivation.route.role(3),
            Some(CheckpointRole::Waypoint)
        );
        assert_eq!(config.wal_flush_interval, Some(Duration::from_millis(250)));
    }

    #[test]
    fn inverted_lap_bounds_are_rejected() {
        let err = config_from_inputs(
            Vec::<String>::new(),
            env_lookup(&[
                ("YATRA_MIN_LAP_MINUTES", "200"),
                ("YATRA_MAX_LAP_MINUTES", "100"),
            ]),
        )
        .unwrap_err();
        assert!(matches!(
            err,
            ConfigError::Derivation(DerivationConfigError::LapBoundsInverted { .. })
        ));
    }

    #[test]
    fn unknown_cli_option_is_rejected() {
        let err = config_from_inputs(vec!["--serve".to_string()], env_lookup(&[])).unwrap_err();
        assert_eq!(err, ConfigError::UnknownOption("--serve".into()));
    }
}
