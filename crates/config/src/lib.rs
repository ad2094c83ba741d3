//! Storage descriptors and configuration loading.
//!
//! A [`StorageDescriptor`] is the declarative, serializable description of
//! one storage location: a protocol tag plus an untyped bag of [`Settings`].
//! Descriptors are usually loaded in bulk through [`Config`].

mod descriptor;
pub mod error;
mod settings;

pub use crate::descriptor::StorageDescriptor;
pub use crate::settings::Settings;
use crate::error::{ConfigError, Result};
use directories::ProjectDirs;
use exn::{OptionExt, ResultExt};
use figment::Figment;
use figment::providers::{Env, Format, Json, Toml, Yaml};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Environment variables with this prefix override values from the file.
pub const ENV_PREFIX: &str = "FSBRIDGE_";
const CONFIG_FILE_NAME: &str = "storage.toml";

/// Top-level configuration file contents.
#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub storages: Vec<StorageDescriptor>,
}
impl Config {
    /// Load configuration from a file, choosing the format from its
    /// extension, then apply `FSBRIDGE_` environment overrides (nested keys
    /// separated by `__`).
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let figment = match path.extension().and_then(|ext| ext.to_str()) {
            Some("toml") => Figment::new().merge(Toml::file(path)),
            Some("yaml" | "yml") => Figment::new().merge(Yaml::file(path)),
            Some("json") => Figment::new().merge(Json::file(path)),
            _ => exn::bail!(ConfigError::UnsupportedFormat(path.to_path_buf())),
        };
        tracing::debug!(path = %path.display(), "loading storage configuration");
        figment
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract()
            .or_raise(|| ConfigError::Load(path.to_path_buf()))
    }

    /// Load `storage.toml` from the platform configuration directory. A
    /// missing file yields an empty configuration.
    pub fn load_default() -> Result<Self> {
        let path = default_path()?;
        if !path.exists() {
            tracing::info!(path = %path.display(), "no storage configuration found, using defaults");
            return Ok(Self::default());
        }
        Self::load(path)
    }

    /// Look up a descriptor by its identifier.
    pub fn descriptor(&self, id: &str) -> Option<&StorageDescriptor> {
        self.storages.iter().find(|descriptor| descriptor.id == id)
    }

    pub fn enabled(&self) -> impl Iterator<Item = &StorageDescriptor> {
        self.storages.iter().filter(|descriptor| descriptor.enabled)
    }
}

/// Location of the configuration file used by [`Config::load_default`].
pub fn default_path() -> Result<PathBuf> {
    let dirs = ProjectDirs::from("", "", "fsbridge").ok_or_raise(|| ConfigError::NoConfigDirectory)?;
    Ok(dirs.config_dir().join(CONFIG_FILE_NAME))
}

#[cfg(test)]
mod tests {
    use super::*;
    use figment::Jail;

    const TOML: &str = r#"
        [[storages]]
        id = "nas"
        name = "Office NAS"
        protocol = "smb"
        [storages.settings]
        host = "nas.local"
        share = "media"
        port = 1445

        [[storages]]
        id = "scratch"
        name = "Scratch"
        protocol = "local"
        enabled = false
        settings = { base_path = "/tmp/scratch" }
    "#;

    #[test]
    fn test_load_toml() {
        Jail::expect_with(|jail| {
            jail.create_file("storage.toml", TOML)?;
            let config = Config::load("storage.toml").unwrap();
            assert_eq!(config.storages.len(), 2);
            let nas = config.descriptor("nas").unwrap();
            assert_eq!(nas.protocol, "smb");
            assert!(nas.enabled);
            assert_eq!(nas.settings.string("host"), Some("nas.local"));
            assert_eq!(nas.settings.integer("port"), Some(1445));
            assert_eq!(config.enabled().count(), 1);
            Ok(())
        });
    }

    #[test]
    fn test_load_yaml_and_json_agree() {
        Jail::expect_with(|jail| {
            jail.create_file(
                "storage.yaml",
                "storages:\n  - id: dav\n    name: Dav\n    protocol: webdav\n    settings:\n      url: https://dav.example.com\n",
            )?;
            jail.create_file(
                "storage.json",
                r#"{"storages": [{"id": "dav", "name": "Dav", "protocol": "webdav", "settings": {"url": "https://dav.example.com"}}]}"#,
            )?;
            let yaml = Config::load("storage.yaml").unwrap();
            let json = Config::load("storage.json").unwrap();
            assert_eq!(yaml.storages[0].settings, json.storages[0].settings);
            assert_eq!(yaml.storages[0].protocol, "webdav");
            Ok(())
        });
    }

    #[test]
    fn test_unsupported_extension() {
        let err = Config::load("storage.ini").unwrap_err();
        assert!(matches!(&*err, ConfigError::UnsupportedFormat(_)));
    }

    #[test]
    fn test_invalid_document() {
        Jail::expect_with(|jail| {
            jail.create_file("storage.toml", "storages = 5")?;
            let err = Config::load("storage.toml").unwrap_err();
            assert!(matches!(&*err, ConfigError::Load(_)));
            Ok(())
        });
    }

    #[test]
    fn test_default_path_file_name() {
        if let Ok(path) = default_path() {
            assert!(path.ends_with(CONFIG_FILE_NAME));
        }
    }
}
