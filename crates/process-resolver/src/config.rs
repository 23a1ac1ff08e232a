use std::{
    collections::{HashMap, hash_map::Iter},
    fmt::Display,
    path::PathBuf,
    str::FromStr,
    time::Duration,
};

use thiserror::Error;

/// Name of the configuration section read by the resolver.
pub const SECTION: &str = "process-resolver";

/// Raw key/value configuration of a single section.
#[derive(Debug, Clone, Default)]
pub struct ModuleConfig {
    inner: HashMap<String, String>,
}

#[derive(Error, Debug, Clone)]
pub enum ConfigError {
    #[error("field {field} is required")]
    RequiredValue { field: String },
    #[error("{value} is not a valid value for field {field}: {err}")]
    InvalidValue {
        field: String,
        value: String,
        err: String,
    },
}

impl ModuleConfig {
    /// Inserts a new configuration value.
    pub fn insert(&mut self, key: String, value: String) -> Option<String> {
        self.inner.insert(key, value)
    }

    /// Returns an option of raw configuration value.
    pub fn get_raw(&self, config_name: &str) -> Option<&str> {
        self.inner.get(config_name).map(String::as_str)
    }

    /// Returns a typed configuration value.
    pub fn required<T>(&self, config_name: &str) -> Result<T, ConfigError>
    where
        T: FromStr,
        <T as FromStr>::Err: Display,
    {
        match self.inner.get(config_name) {
            None => Err(ConfigError::RequiredValue {
                field: config_name.to_string(),
            }),
            Some(value) => parse(value, config_name),
        }
    }

    /// Returns an optional typed configuration value.
    pub fn optional<T>(&self, config_name: &str) -> Result<Option<T>, ConfigError>
    where
        T: FromStr,
        <T as FromStr>::Err: Display,
    {
        self.inner
            .get(config_name)
            .map(|value| parse(value, config_name))
            .transpose()
    }

    /// Returns a typed configuration value, or `default` if the field is missing.
    pub fn with_default<T>(&self, config_name: &str, default: T) -> Result<T, ConfigError>
    where
        T: FromStr,
        <T as FromStr>::Err: Display,
    {
        Ok(self.optional(config_name)?.unwrap_or(default))
    }

    /// Return an Iter to the underlying HashMap
    pub fn iter(&self) -> Iter<'_, String, String> {
        self.inner.iter()
    }
}

fn parse<T>(value: &str, config_name: &str) -> Result<T, ConfigError>
where
    T: FromStr,
    <T as FromStr>::Err: Display,
{
    T::from_str(value).map_err(|err| ConfigError::InvalidValue {
        field: config_name.to_string(),
        value: value.to_string(),
        err: err.to_string(),
    })
}

/// Typed resolver configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolverConfig {
    /// Maximum parent chain depth resolved for a single event.
    pub max_resolve_depth: usize,
    /// Filesystem fallbacks allowed per pid in each period.
    pub fallback_allowed_per_period: u32,
    pub fallback_period: Duration,
    /// Number of pids tracked by the fallback rate limiter.
    pub fallback_tracked_pids: usize,
    /// Pending argument/environment chunks kept before eviction.
    pub args_envs_cache_size: usize,
    /// Distinct strings kept by the interner.
    pub interner_size: usize,
    /// Size of a single argument/environment chunk sent by the probes.
    pub max_arg_env_size: usize,
    /// Maximum number of environment variables read from procfs.
    pub max_envs: usize,
    pub envs_resolution: bool,
    /// Read the controlling terminal from procfs when the event has none.
    pub tty_fallback: bool,
    /// How long exited processes stay in the table.
    pub exit_retention: Duration,
    /// Period of the absent process sweep.
    pub flush_interval: Duration,
    /// Recycled entries kept for reuse.
    pub pool_capacity: usize,
    /// Directory of the pinned kernel maps.
    pub pinned_maps_path: PathBuf,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            max_resolve_depth: 16,
            fallback_allowed_per_period: 1,
            fallback_period: Duration::from_secs(30),
            fallback_tracked_pids: 128,
            args_envs_cache_size: 512,
            interner_size: 8192,
            max_arg_env_size: 256,
            max_envs: 256,
            envs_resolution: true,
            tty_fallback: true,
            exit_retention: Duration::from_secs(60),
            flush_interval: Duration::from_secs(120),
            pool_capacity: 1024,
            pinned_maps_path: PathBuf::from("/sys/fs/bpf/pulsar"),
        }
    }
}

fn non_zero(field: &str, value: usize) -> Result<usize, ConfigError> {
    if value == 0 {
        return Err(ConfigError::InvalidValue {
            field: field.to_string(),
            value: value.to_string(),
            err: "must be greater than zero".to_string(),
        });
    }
    Ok(value)
}

impl TryFrom<&ModuleConfig> for ResolverConfig {
    type Error = ConfigError;

    fn try_from(config: &ModuleConfig) -> Result<Self, Self::Error> {
        let default = ResolverConfig::default();
        Ok(ResolverConfig {
            max_resolve_depth: non_zero(
                "max_resolve_depth",
                config.with_default("max_resolve_depth", default.max_resolve_depth)?,
            )?,
            fallback_allowed_per_period: config.with_default(
                "fallback_allowed_per_period",
                default.fallback_allowed_per_period,
            )?,
            fallback_period: Duration::from_secs(
                config.with_default("fallback_period_secs", default.fallback_period.as_secs())?,
            ),
            fallback_tracked_pids: non_zero(
                "fallback_tracked_pids",
                config.with_default("fallback_tracked_pids", default.fallback_tracked_pids)?,
            )?,
            args_envs_cache_size: non_zero(
                "args_envs_cache_size",
                config.with_default("args_envs_cache_size", default.args_envs_cache_size)?,
            )?,
            interner_size: non_zero(
                "interner_size",
                config.with_default("interner_size", default.interner_size)?,
            )?,
            max_arg_env_size: config.with_default("max_arg_env_size", default.max_arg_env_size)?,
            max_envs: config.with_default("max_envs", default.max_envs)?,
            envs_resolution: config.with_default("envs_resolution", default.envs_resolution)?,
            tty_fallback: config.with_default("tty_fallback", default.tty_fallback)?,
            exit_retention: Duration::from_secs(
                config.with_default("exit_retention_secs", default.exit_retention.as_secs())?,
            ),
            flush_interval: Duration::from_secs(non_zero(
                "flush_interval_secs",
                config.with_default(
                    "flush_interval_secs",
                    default.flush_interval.as_secs() as usize,
                )?,
            )? as u64),
            pool_capacity: config.with_default("pool_capacity", default.pool_capacity)?,
            pinned_maps_path: config
                .with_default("pinned_maps_path", default.pinned_maps_path)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn module_config(values: &[(&str, &str)]) -> ModuleConfig {
        let mut config = ModuleConfig::default();
        for (key, value) in values {
            config.insert(key.to_string(), value.to_string());
        }
        config
    }

    #[test]
    fn defaults() {
        let config = ResolverConfig::try_from(&ModuleConfig::default()).unwrap();
        assert_eq!(config, ResolverConfig::default());
        assert_eq!(config.max_resolve_depth, 16);
        assert_eq!(config.fallback_period, Duration::from_secs(30));
    }

    #[test]
    fn overrides() {
        let config = ResolverConfig::try_from(&module_config(&[
            ("fallback_period_secs", "5"),
            ("envs_resolution", "false"),
            ("pinned_maps_path", "/tmp/maps"),
        ]))
        .unwrap();
        assert_eq!(config.fallback_period, Duration::from_secs(5));
        assert!(!config.envs_resolution);
        assert_eq!(config.pinned_maps_path, PathBuf::from("/tmp/maps"));
    }

    #[test]
    fn invalid_values() {
        let err = ResolverConfig::try_from(&module_config(&[("interner_size", "0")])).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { field, .. } if field == "interner_size"));

        let err =
            ResolverConfig::try_from(&module_config(&[("tty_fallback", "maybe")])).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { field, .. } if field == "tty_fallback"));
    }

    #[test]
    fn required_field() {
        let config = module_config(&[]);
        assert!(matches!(
            config.required::<u32>("pool_capacity"),
            Err(ConfigError::RequiredValue { .. })
        ));
    }
}
