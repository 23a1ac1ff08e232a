use std::{
    collections::HashMap,
    path::{Path, PathBuf},
};

use anyhow::{Context, Result, bail};
use process_resolver::{ModuleConfig, ResolverConfig, config::SECTION};

const DEFAULT_CONFIG_FILE: &str = "/var/lib/lineage/lineage.ini";

/// Read every section of an INI file.
pub fn load_sections(config_file: &Path) -> Result<HashMap<String, ModuleConfig>> {
    let mut configs: HashMap<String, ModuleConfig> = HashMap::new();

    let conf = ini::Ini::load_from_file(config_file)
        .with_context(|| format!("Error loading configuration from {config_file:?}"))?;

    for (section, prop) in &conf {
        if let Some(section) = section {
            let mod_config = configs.entry(section.to_string()).or_default();
            for (key, value) in prop.iter() {
                log::debug!("{}.{}={}", section, key, value);
                mod_config.insert(key.to_string(), value.to_string());
            }
        }
    }

    Ok(configs)
}

/// Resolver configuration from `custom_file`, which must exist, or from the
/// default file when present. Missing sections and keys take their defaults.
pub fn load_resolver_config(custom_file: Option<&Path>) -> Result<ResolverConfig> {
    let config_file = match custom_file {
        Some(file) => {
            if !file.exists() {
                bail!("Configuration file {} not found", file.display());
            }
            file.to_path_buf()
        }
        None => {
            let file = PathBuf::from(DEFAULT_CONFIG_FILE);
            if !file.exists() {
                log::debug!("no configuration file, using defaults");
                return Ok(ResolverConfig::default());
            }
            file
        }
    };

    let sections = load_sections(&config_file)?;
    let module_config = sections.get(SECTION).cloned().unwrap_or_default();
    ResolverConfig::try_from(&module_config)
        .with_context(|| format!("Invalid [{SECTION}] section in {config_file:?}"))
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    fn write_config(name: &str, content: &str) -> PathBuf {
        let path = std::env::temp_dir().join(format!("lineage-{}-{name}.ini", std::process::id()));
        std::fs::write(&path, content).unwrap();
        path
    }

    #[test]
    fn section_overrides_defaults() {
        let path = write_config(
            "overrides",
            "[process-resolver]\nexit_retention_secs=5\nenvs_resolution=false\n\n[other]\nkey=value\n",
        );
        let config = load_resolver_config(Some(&path)).unwrap();
        assert_eq!(config.exit_retention, Duration::from_secs(5));
        assert!(!config.envs_resolution);
        assert_eq!(config.max_resolve_depth, ResolverConfig::default().max_resolve_depth);

        let sections = load_sections(&path).unwrap();
        assert_eq!(sections["other"].get_raw("key"), Some("value"));
        std::fs::remove_file(path).unwrap();
    }

    #[test]
    fn missing_section_uses_defaults() {
        let path = write_config("empty", "[other]\nkey=value\n");
        assert_eq!(load_resolver_config(Some(&path)).unwrap(), ResolverConfig::default());
        std::fs::remove_file(path).unwrap();
    }

    #[test]
    fn invalid_values_are_reported() {
        let path = write_config("invalid", "[process-resolver]\nmax_resolve_depth=0\n");
        assert!(load_resolver_config(Some(&path)).is_err());
        std::fs::remove_file(path).unwrap();
    }

    #[test]
    fn custom_file_must_exist() {
        assert!(load_resolver_config(Some(Path::new("/nonexistent/lineage.ini"))).is_err());
    }
}
