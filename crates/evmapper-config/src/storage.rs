//! On-disk configuration layout
//!
//! ```text
//! <config_dir>/config.json                       top-level settings + autoload
//! <config_dir>/presets/<group>/<preset>.json     ordered mapping arrays
//! <config_dir>/xmodmap.json                      layout symbol overrides
//! ```
//!
//! Preset files are read-only during injection. All writes publish
//! atomically: serialize to a staging file next to the target, then rename.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::model::{Mapping, Preset};

pub const CONFIG_FILE: &str = "config.json";
pub const XMODMAP_FILE: &str = "xmodmap.json";
pub const PRESETS_DIR: &str = "presets";

fn default_version() -> String {
    "1".to_string()
}

/// Contents of `config.json`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct GlobalConfig {
    /// Schema version of the configuration tree.
    #[serde(default = "default_version")]
    pub version: String,
    /// group key -> preset name, started automatically by `Autoload`.
    #[serde(default)]
    pub autoload: HashMap<String, String>,
}

impl Default for GlobalConfig {
    fn default() -> Self {
        Self {
            version: default_version(),
            autoload: HashMap::new(),
        }
    }
}

/// Handle to one configuration directory.
#[derive(Debug, Clone)]
pub struct ConfigDir {
    root: PathBuf,
}

impl ConfigDir {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn config_path(&self) -> PathBuf {
        self.root.join(CONFIG_FILE)
    }

    pub fn xmodmap_path(&self) -> PathBuf {
        self.root.join(XMODMAP_FILE)
    }

    pub fn presets_dir(&self) -> PathBuf {
        self.root.join(PRESETS_DIR)
    }

    pub fn group_dir(&self, group: &str) -> PathBuf {
        self.presets_dir().join(group)
    }

    pub fn preset_path(&self, group: &str, preset: &str) -> PathBuf {
        self.group_dir(group).join(format!("{preset}.json"))
    }

    /// Load `config.json`, or the defaults if it does not exist yet.
    pub fn load_config(&self) -> Result<GlobalConfig, ConfigError> {
        let path = self.config_path();
        if !path.exists() {
            return Ok(GlobalConfig::default());
        }
        let content = std::fs::read_to_string(&path).map_err(|source| ConfigError::Read {
            path: path.clone(),
            source,
        })?;
        serde_json::from_str(&content).map_err(|source| ConfigError::Json { path, source })
    }

    pub fn save_config(&self, config: &GlobalConfig) -> Result<(), ConfigError> {
        let content = serde_json::to_string_pretty(config).expect("config always serializes");
        self.publish(&self.config_path(), &content)
    }

    /// Load the layout symbol overrides, empty if the file is absent.
    pub fn load_xmodmap(&self) -> Result<HashMap<String, u16>, ConfigError> {
        let path = self.xmodmap_path();
        if !path.exists() {
            return Ok(HashMap::new());
        }
        let content = std::fs::read_to_string(&path).map_err(|source| ConfigError::Read {
            path: path.clone(),
            source,
        })?;
        serde_json::from_str(&content).map_err(|source| ConfigError::Json { path, source })
    }

    /// Preset names available for a group, sorted by name.
    pub fn list_presets(&self, group: &str) -> Result<Vec<String>, ConfigError> {
        let dir = self.group_dir(group);
        if !dir.exists() {
            return Ok(Vec::new());
        }

        let entries = std::fs::read_dir(&dir).map_err(|source| ConfigError::Read {
            path: dir.clone(),
            source,
        })?;

        let mut names = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|source| ConfigError::Read {
                path: dir.clone(),
                source,
            })?;
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) == Some("json") {
                if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                    names.push(stem.to_string());
                }
            }
        }
        names.sort();
        Ok(names)
    }

    pub fn load_preset(&self, group: &str, name: &str) -> Result<Preset, ConfigError> {
        let path = self.preset_path(group, name);
        let content = std::fs::read_to_string(&path).map_err(|source| ConfigError::Read {
            path: path.clone(),
            source,
        })?;
        let mappings: Vec<Mapping> =
            serde_json::from_str(&content).map_err(|source| ConfigError::Json { path, source })?;
        Ok(Preset {
            name: name.to_string(),
            group_key: group.to_string(),
            mappings,
        })
    }

    pub fn save_preset(&self, preset: &Preset) -> Result<(), ConfigError> {
        let path = self.preset_path(&preset.group_key, &preset.name);
        let content =
            serde_json::to_string_pretty(&preset.mappings).expect("mappings always serialize");
        self.publish(&path, &content)
    }

    /// Write to a staging file and rename over the target.
    fn publish(&self, path: &Path, content: &str) -> Result<(), ConfigError> {
        let write_error = |source| ConfigError::Write {
            path: path.to_path_buf(),
            source,
        };

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(write_error)?;
        }

        let staging = path.with_extension("json.tmp");
        std::fs::write(&staging, content).map_err(write_error)?;
        std::fs::rename(&staging, path).map_err(write_error)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{InputCombination, InputConfig, TargetDevice};

    fn config_dir() -> (tempfile::TempDir, ConfigDir) {
        let tmp = tempfile::tempdir().unwrap();
        let dir = ConfigDir::new(tmp.path());
        (tmp, dir)
    }

    #[test]
    fn missing_config_yields_defaults() {
        let (_tmp, dir) = config_dir();
        let config = dir.load_config().unwrap();
        assert_eq!(config.version, "1");
        assert!(config.autoload.is_empty());
    }

    #[test]
    fn config_round_trips() {
        let (_tmp, dir) = config_dir();
        let mut config = GlobalConfig::default();
        config
            .autoload
            .insert("3_1234_5678_usb-0000".to_string(), "gaming".to_string());
        dir.save_config(&config).unwrap();
        assert_eq!(dir.load_config().unwrap(), config);
        // no staging file left behind
        assert!(!dir.config_path().with_extension("json.tmp").exists());
    }

    #[test]
    fn preset_round_trips() {
        let (_tmp, dir) = config_dir();
        let mut preset = Preset::new("test", "My Keyboard");
        preset.mappings.push(Mapping::key_to_key(
            InputCombination::new(vec![InputConfig::key(30)]),
            TargetDevice::Keyboard,
            48,
        ));
        dir.save_preset(&preset).unwrap();

        let loaded = dir.load_preset("My Keyboard", "test").unwrap();
        assert_eq!(loaded, preset);
    }

    #[test]
    fn lists_presets_sorted() {
        let (_tmp, dir) = config_dir();
        for name in ["b", "a", "c"] {
            dir.save_preset(&Preset::new(name, "group")).unwrap();
        }
        // non-json files are ignored
        std::fs::write(dir.group_dir("group").join("notes.txt"), "x").unwrap();

        assert_eq!(dir.list_presets("group").unwrap(), vec!["a", "b", "c"]);
        assert!(dir.list_presets("absent").unwrap().is_empty());
    }

    #[test]
    fn xmodmap_overrides_load() {
        let (_tmp, dir) = config_dir();
        assert!(dir.load_xmodmap().unwrap().is_empty());

        std::fs::write(dir.xmodmap_path(), r#"{"odiaeresis": 39}"#).unwrap();
        let overrides = dir.load_xmodmap().unwrap();
        assert_eq!(overrides.get("odiaeresis"), Some(&39));
    }
}
