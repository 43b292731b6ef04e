//! CLI configuration management.

use crate::commands::BackendKind;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tarstash_cache::CompressionType;

/// CLI configuration, read from `config.yaml` in the user config directory.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct CliConfig {
    /// Where cache objects live.
    #[serde(default)]
    pub backend: BackendConfig,
    /// Log every protocol step.
    #[serde(default)]
    pub debug: bool,
    /// Compression for saves.
    #[serde(default)]
    pub compression: CompressionType,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum BackendConfig {
    Filesystem {
        #[serde(default = "default_fs_root")]
        root: PathBuf,
    },
    S3 {
        #[serde(default)]
        region: Option<String>,
        #[serde(default)]
        endpoint: Option<String>,
        #[serde(default)]
        force_path_style: bool,
    },
}

impl Default for BackendConfig {
    fn default() -> Self {
        BackendConfig::Filesystem {
            root: default_fs_root(),
        }
    }
}

fn project_dirs() -> Option<directories::ProjectDirs> {
    directories::ProjectDirs::from("dev", "tarstash", "tarstash")
}

fn default_fs_root() -> PathBuf {
    project_dirs()
        .map(|dirs| dirs.cache_dir().join("store"))
        .unwrap_or_else(|| PathBuf::from(".tarstash"))
}

/// Values from flags or the environment that win over the config file.
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub backend: Option<BackendKind>,
    pub fs_root: Option<PathBuf>,
    pub s3_region: Option<String>,
    pub s3_endpoint: Option<String>,
    pub debug: bool,
}

impl CliConfig {
    /// Load configuration from file.
    pub fn load() -> Result<Self, Box<dyn std::error::Error>> {
        let path = Self::config_path()?;
        if path.exists() {
            let content = std::fs::read_to_string(&path)?;
            Ok(serde_yaml::from_str(&content)?)
        } else {
            Ok(Self::default())
        }
    }

    /// Save configuration to file.
    pub fn save(&self) -> Result<(), Box<dyn std::error::Error>> {
        let path = Self::config_path()?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = serde_yaml::to_string(self)?;
        std::fs::write(&path, content)?;
        Ok(())
    }

    /// Get the configuration file path.
    pub fn config_path() -> Result<PathBuf, Box<dyn std::error::Error>> {
        let dirs = project_dirs().ok_or("Could not determine config directory")?;
        Ok(dirs.config_dir().join("config.yaml"))
    }

    /// Apply flag and environment overrides.
    pub fn apply(&mut self, overrides: &Overrides) {
        if overrides.debug {
            self.debug = true;
        }

        match overrides.backend {
            Some(BackendKind::Filesystem) if !matches!(self.backend, BackendConfig::Filesystem { .. }) => {
                self.backend = BackendConfig::default();
            }
            Some(BackendKind::S3) if !matches!(self.backend, BackendConfig::S3 { .. }) => {
                self.backend = BackendConfig::S3 {
                    region: None,
                    endpoint: None,
                    force_path_style: false,
                };
            }
            _ => {}
        }

        match &mut self.backend {
            BackendConfig::Filesystem { root } => {
                if let Some(fs_root) = &overrides.fs_root {
                    *root = fs_root.clone();
                }
            }
            BackendConfig::S3 {
                region, endpoint, ..
            } => {
                if overrides.s3_region.is_some() {
                    *region = overrides.s3_region.clone();
                }
                if overrides.s3_endpoint.is_some() {
                    *endpoint = overrides.s3_endpoint.clone();
                }
            }
        }
    }

    /// Set a configuration value.
    pub fn set(&mut self, key: &str, value: &str) -> Result<(), String> {
        match key {
            "debug" => {
                self.debug = value
                    .parse()
                    .map_err(|_| format!("Invalid boolean: {}", value))?;
            }
            "compression" => {
                self.compression = value.parse().map_err(|e| format!("{}", e))?;
            }
            "backend" => {
                self.backend = match value {
                    "filesystem" => BackendConfig::default(),
                    "s3" => BackendConfig::S3 {
                        region: None,
                        endpoint: None,
                        force_path_style: false,
                    },
                    _ => return Err(format!("Invalid backend: {}", value)),
                };
            }
            "fs_root" => match &mut self.backend {
                BackendConfig::Filesystem { root } => *root = PathBuf::from(value),
                _ => return Err("fs_root requires the filesystem backend".to_string()),
            },
            "s3_region" | "s3_endpoint" | "s3_force_path_style" => match &mut self.backend {
                BackendConfig::S3 {
                    region,
                    endpoint,
                    force_path_style,
                } => match key {
                    "s3_region" => *region = Some(value.to_string()),
                    "s3_endpoint" => *endpoint = Some(value.to_string()),
                    _ => {
                        *force_path_style = value
                            .parse()
                            .map_err(|_| format!("Invalid boolean: {}", value))?;
                    }
                },
                _ => return Err(format!("{} requires the s3 backend", key)),
            },
            _ => return Err(format!("Unknown config key: {}", key)),
        }
        Ok(())
    }
}
