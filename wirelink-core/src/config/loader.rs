//! # Configuration Loading
//!
//! Loads configuration from defaults, a TOML file found on the search paths and
//! `WIRELINK_*` environment variables, in that order, then validates the result.

use crate::{Error, Result};
use serde::{de::DeserializeOwned, Serialize};
use std::{
    collections::HashMap,
    env,
    path::{Path, PathBuf},
};
use tracing::{debug, info};
use validator::Validate;

/// File names probed in every search path.
const CONFIG_FILE_NAMES: [&str; 2] = ["wirelink.toml", "config.toml"];

/// Configuration loader with support for multiple sources
#[derive(Debug, Clone)]
pub struct ConfigLoader {
    search_paths: Vec<PathBuf>,
    env_prefix: String,
    env_overrides: Option<HashMap<String, String>>,
}

impl ConfigLoader {
    /// Create a new configuration loader
    #[must_use]
    pub fn new() -> Self {
        Self {
            search_paths: vec![PathBuf::from("."), PathBuf::from("./config")],
            env_prefix: "WIRELINK".to_string(),
            env_overrides: None,
        }
    }

    /// Add a search path for configuration files
    #[must_use]
    pub fn with_path<P: AsRef<Path>>(mut self, path: P) -> Self {
        self.search_paths.push(path.as_ref().to_path_buf());
        self
    }

    /// Set the environment variable prefix
    #[must_use]
    pub fn with_env_prefix<S: AsRef<str>>(mut self, prefix: S) -> Self {
        self.env_prefix = prefix.as_ref().to_string();
        self
    }

    /// Use an explicit variable set instead of the process environment.
    #[must_use]
    pub fn with_env_vars(mut self, vars: HashMap<String, String>) -> Self {
        self.env_overrides = Some(vars);
        self
    }

    /// Load configuration from all available sources
    ///
    /// # Errors
    /// Returns [`Error::Configuration`] if a source cannot be read or the merged
    /// configuration fails validation.
    pub fn load<T>(&self) -> Result<T>
    where
        T: Default + Serialize + DeserializeOwned + Validate,
    {
        info!("Loading configuration from multiple sources");

        let mut config_value = toml::Value::try_from(T::default())
            .map_err(|e| Error::configuration(format!("Failed to serialize default config: {e}")))?;

        if let Some(config_path) = self.find_config_file() {
            let file_config = Self::load_config_file(&config_path)?;
            config_value = Self::merge_config(config_value, file_config);
            info!("Loaded configuration file: {}", config_path.display());
        } else {
            debug!("No configuration file found in search paths");
        }

        self.apply_env_vars(&mut config_value);

        let config: T = config_value
            .try_into()
            .map_err(|e| Error::configuration(format!("Failed to deserialize config: {e}")))?;
        config.validate()?;

        info!("Configuration loaded and validated successfully");
        Ok(config)
    }

    /// Load configuration from a specific file, over the defaults.
    ///
    /// # Errors
    /// Returns [`Error::Configuration`] if the file cannot be read, parsed or validated.
    pub fn load_from_file<T, P>(&self, path: P) -> Result<T>
    where
        T: Default + Serialize + DeserializeOwned + Validate,
        P: AsRef<Path>,
    {
        let path = path.as_ref();
        info!("Loading configuration from file: {}", path.display());

        let defaults = toml::Value::try_from(T::default())
            .map_err(|e| Error::configuration(format!("Failed to serialize default config: {e}")))?;
        let merged = Self::merge_config(defaults, Self::load_config_file(path)?);
        let config: T = merged
            .try_into()
            .map_err(|e| Error::configuration(format!("Failed to parse config file: {e}")))?;

        config.validate()?;
        Ok(config)
    }

    /// Find the first available configuration file
    fn find_config_file(&self) -> Option<PathBuf> {
        self.search_paths.iter().find_map(|search_path| {
            CONFIG_FILE_NAMES.iter().map(|name| search_path.join(name)).find(|path| {
                let exists = path.exists();
                if exists {
                    debug!("Found config file: {}", path.display());
                }
                exists
            })
        })
    }

    /// Load configuration from a TOML file
    fn load_config_file(path: &Path) -> Result<toml::Value> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::configuration(format!("Failed to read config file {}: {e}", path.display()))
        })?;

        content.parse::<toml::Value>().map_err(|e| {
            Error::configuration(format!("Failed to parse config file {}: {e}", path.display()))
        })
    }

    /// Merge two TOML configuration values
    fn merge_config(mut base: toml::Value, override_value: toml::Value) -> toml::Value {
        if let (toml::Value::Table(base_table), toml::Value::Table(override_table)) =
            (&mut base, override_value)
        {
            for (key, value) in override_table {
                match base_table.get_mut(&key) {
                    Some(existing) if existing.is_table() && value.is_table() => {
                        *existing = Self::merge_config(existing.clone(), value);
                    },
                    Some(existing) => *existing = value,
                    None => {
                        base_table.insert(key, value);
                    },
                }
            }
        }

        base
    }

    /// Apply `PREFIX_SECTION__FIELD` variables; `__` separates nesting levels.
    fn apply_env_vars(&self, config: &mut toml::Value) {
        let prefix = format!("{}_", self.env_prefix);
        let vars: Vec<(String, String)> = match &self.env_overrides {
            Some(vars) => vars.iter().map(|(k, v)| (k.clone(), v.clone())).collect(),
            None => env::vars().collect(),
        };

        let mut applied = 0usize;
        for (key, value) in vars {
            let Some(stripped) = key.strip_prefix(&prefix) else {
                continue;
            };
            let path: Vec<String> = stripped.to_lowercase().split("__").map(str::to_string).collect();
            if Self::set_nested_value(config, &path, &value) {
                applied += 1;
            } else {
                debug!("Ignoring unknown configuration variable {key}");
            }
        }

        debug!("Applied {applied} environment variables");
    }

    /// Set an existing nested key, keeping the type of the value it replaces.
    fn set_nested_value(config: &mut toml::Value, path: &[String], value: &str) -> bool {
        let Some((last, parents)) = path.split_last() else {
            return false;
        };

        let mut current = config;
        for part in parents {
            match current.get_mut(part.as_str()) {
                Some(next) => current = next,
                None => return false,
            }
        }

        let Some(table) = current.as_table_mut() else {
            return false;
        };

        let parsed = match table.get(last.as_str()) {
            Some(toml::Value::Boolean(_)) => value.parse().map(toml::Value::Boolean).ok(),
            Some(toml::Value::Integer(_)) => value.parse().map(toml::Value::Integer).ok(),
            Some(toml::Value::Float(_)) => value.parse().map(toml::Value::Float).ok(),
            Some(toml::Value::String(_)) => Some(toml::Value::String(value.to_string())),
            // Optional fields are absent from the serialized defaults.
            None => Some(
                value
                    .parse::<i64>()
                    .map(toml::Value::Integer)
                    .unwrap_or_else(|_| toml::Value::String(value.to_string())),
            ),
            Some(_) => None,
        };

        match parsed {
            Some(parsed) => {
                table.insert(last.clone(), parsed);
                true
            },
            None => false,
        }
    }
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}
