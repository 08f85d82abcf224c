use std::fs;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::convert::{CONVERTER_PROGRAM, default_flags};
use crate::error::DlError;
use crate::reconcile::DEFAULT_ANCILLARY_EXTENSION;
use crate::session::DEFAULT_ANCILLARY_RESOURCE;

pub const DEFAULT_CONFIG_FILE: &str = "cnda-dl.json";
pub const SERVER_URL_ENV: &str = "CNDADL_XNAT_URL";

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub schema_version: Option<u32>,
    #[serde(default)]
    pub server_url: Option<String>,
    #[serde(default)]
    pub converter: Option<ConverterEntry>,
    #[serde(default)]
    pub ancillary_resource: Option<String>,
    #[serde(default)]
    pub ancillary_extension: Option<String>,
    #[serde(default)]
    pub log_dir: Option<PathBuf>,
}

#[derive(Debug, Deserialize, Serialize)]
#[serde(untagged)]
pub enum ConverterEntry {
    Shorthand(String),
    Detailed(ConverterEntryObject),
}

#[derive(Debug, Deserialize, Serialize)]
pub struct ConverterEntryObject {
    #[serde(default)]
    pub program: Option<String>,
    #[serde(default)]
    pub flags: Option<Vec<String>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConverterSettings {
    pub program: String,
    pub flags: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    pub schema_version: u32,
    pub server_url: Option<String>,
    pub converter: ConverterSettings,
    pub ancillary_resource: String,
    pub ancillary_extension: String,
    pub log_dir: Option<PathBuf>,
}

impl ResolvedConfig {
    /// The catalog base URL; only needed once something has to be fetched.
    pub fn require_server_url(&self) -> Result<&str, DlError> {
        self.server_url.as_deref().ok_or(DlError::MissingServerUrl)
    }
}

pub struct ConfigLoader;

impl ConfigLoader {
    /// Loads `path`, or `cnda-dl.json` from the working directory when it
    /// exists, then applies `CNDADL_XNAT_URL`.
    pub fn resolve(path: Option<&str>) -> Result<ResolvedConfig, DlError> {
        let config_path = match path {
            Some(path) => PathBuf::from(path),
            None => PathBuf::from(DEFAULT_CONFIG_FILE),
        };

        let config = if path.is_none() && !config_path.exists() {
            Config::default()
        } else {
            let content = fs::read_to_string(&config_path)
                .map_err(|_| DlError::ConfigRead(config_path.clone()))?;
            serde_json::from_str(&content).map_err(|err| DlError::ConfigParse(err.to_string()))?
        };

        let env_url = std::env::var(SERVER_URL_ENV).ok();
        Self::resolve_config(config, env_url)
    }

    pub fn resolve_config(
        config: Config,
        env_url: Option<String>,
    ) -> Result<ResolvedConfig, DlError> {
        let schema_version = config.schema_version.unwrap_or(1);
        if schema_version != 1 {
            return Err(DlError::ConfigParse(format!(
                "unsupported schema_version {schema_version}"
            )));
        }

        let server_url = env_url
            .or(config.server_url)
            .map(|url| url.trim().to_string())
            .filter(|url| !url.is_empty());

        let converter = match config.converter {
            None => ConverterSettings {
                program: CONVERTER_PROGRAM.to_string(),
                flags: default_flags(),
            },
            Some(ConverterEntry::Shorthand(program)) => ConverterSettings {
                program,
                flags: default_flags(),
            },
            Some(ConverterEntry::Detailed(obj)) => ConverterSettings {
                program: obj.program.unwrap_or_else(|| CONVERTER_PROGRAM.to_string()),
                flags: obj.flags.unwrap_or_else(default_flags),
            },
        };

        let ancillary_extension = config
            .ancillary_extension
            .unwrap_or_else(|| DEFAULT_ANCILLARY_EXTENSION.to_string())
            .trim_start_matches('.')
            .to_string();
        if ancillary_extension.is_empty() {
            return Err(DlError::ConfigParse(
                "ancillary_extension must not be empty".to_string(),
            ));
        }

        Ok(ResolvedConfig {
            schema_version,
            server_url,
            converter,
            ancillary_resource: config
                .ancillary_resource
                .unwrap_or_else(|| DEFAULT_ANCILLARY_RESOURCE.to_string()),
            ancillary_extension,
            log_dir: config.log_dir,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_config_uses_defaults() {
        let resolved = ConfigLoader::resolve_config(Config::default(), None).unwrap();
        assert_eq!(resolved.schema_version, 1);
        assert_eq!(resolved.server_url, None);
        assert_eq!(resolved.converter.program, "dcmdat2niix");
        assert_eq!(resolved.ancillary_resource, "NORDIC_VOLUMES");
        assert_eq!(resolved.ancillary_extension, "dat");
    }
}
