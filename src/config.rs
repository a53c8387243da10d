use log::{debug, info};
use regex::Regex;
use serde::Deserialize;
use std::{
    env::VarError,
    fs,
    path::{Path, PathBuf},
    time::Duration,
};
use url::Url;

use crate::error::{Error, Result};
use crate::model::compile_content_regex;

pub const DEFAULT_TOPIC: &str = "checksite";
pub const DEFAULT_PARTITIONS: i32 = 3;
pub const DEFAULT_REPLICATION: i32 = 1;
pub const DEFAULT_CHECK_INTERVAL_SECS: u64 = 60;
pub const DEFAULT_TIMEOUT_SECS: u64 = 10;
pub const DEFAULT_DELIVERY_TIMEOUT_SECS: u64 = 15;

/// Runtime configuration, built once at start-up and passed down by reference.
#[derive(Debug, Clone)]
pub struct Config {
    pub site_url: String,
    pub content_regex: Regex,
    pub kafka_servers: String,
    pub kafka_topic: String,
    pub kafka_ssl: Option<KafkaSsl>,
    pub kafka_partitions: i32,
    pub kafka_replication: i32,
    pub postgresql_url: Option<String>,
    pub check_interval_secs: u64,
    pub timeout_secs: u64,
    pub delivery_timeout_secs: u64,
}

/// Client TLS material for the broker connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KafkaSsl {
    pub ca_location: String,
    pub certificate_location: String,
    pub key_location: String,
}

/// Optional TOML configuration file. Every key can be overridden by the
/// matching `CK_*` environment variable.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FileConfig {
    pub site_url: Option<String>,
    pub content_regex: Option<String>,
    pub kafka_servers: Option<String>,
    pub kafka_topic: Option<String>,
    pub kafka_ssl: Option<String>,
    pub kafka_partitions: Option<i32>,
    pub kafka_replication: Option<i32>,
    pub postgresql_url: Option<String>,
    pub check_interval_secs: Option<u64>,
    pub timeout_secs: Option<u64>,
    pub delivery_timeout_secs: Option<u64>,
}

impl FileConfig {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<FileConfig> {
        let content = fs::read_to_string(path)?;
        Ok(toml::from_str(&content)?)
    }
}

impl Config {
    /// Loads the configuration from the config file (if any), `.env` and the
    /// process environment, in increasing order of precedence.
    pub fn load() -> Result<Config> {
        if let Ok(path) = dotenvy::dotenv() {
            debug!("Loaded environment from {}", path.display());
        }

        let file = match config_file_path()? {
            Some(path) => {
                info!("Reading configuration file {}", path.display());
                FileConfig::load(path)?
            }
            None => FileConfig::default(),
        };

        Config::from_sources(file, env_var)
    }

    /// Builds the configuration from a parsed file and an environment lookup.
    pub fn from_sources<F>(file: FileConfig, lookup: F) -> Result<Config>
    where
        F: Fn(&str) -> Result<Option<String>>,
    {
        let string = |key: &str, from_file: Option<String>| -> Result<Option<String>> {
            Ok(lookup(key)?.or(from_file))
        };
        let required = |key: &str, from_file: Option<String>| -> Result<String> {
            string(key, from_file)?.ok_or_else(|| Error::Config(format!("{key} is not set")))
        };

        let site_url = required("CK_SITE_URL", file.site_url)?;
        let parsed = Url::parse(&site_url)?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(Error::Config(format!(
                "CK_SITE_URL must be an http(s) URL, got {site_url}"
            )));
        }

        let content_regex =
            compile_content_regex(&required("CK_CONTENT_REGEX", file.content_regex)?)?;
        let kafka_servers = required("CK_KAFKA_SERVERS", file.kafka_servers)?;
        let kafka_topic = string("CK_KAFKA_TOPIC", file.kafka_topic)?
            .unwrap_or_else(|| DEFAULT_TOPIC.to_string());
        let kafka_ssl =
            parse_kafka_ssl(&string("CK_KAFKA_SSL", file.kafka_ssl)?.unwrap_or_default())?;

        let kafka_partitions = number(&lookup, "CK_KAFKA_PARTITIONS", file.kafka_partitions)?
            .unwrap_or(DEFAULT_PARTITIONS);
        let kafka_replication = number(&lookup, "CK_KAFKA_REPLICATION", file.kafka_replication)?
            .unwrap_or(DEFAULT_REPLICATION);
        if kafka_partitions < 1 || kafka_replication < 1 {
            return Err(Error::Config(
                "topic partitions and replication must be at least 1".to_string(),
            ));
        }

        let postgresql_url = string("CK_POSTGRESQL_URL", file.postgresql_url)?
            .filter(|url| !url.is_empty());

        Ok(Config {
            site_url,
            content_regex,
            kafka_servers,
            kafka_topic,
            kafka_ssl,
            kafka_partitions,
            kafka_replication,
            postgresql_url,
            check_interval_secs: number(
                &lookup,
                "CK_CHECK_INTERVAL_SECS",
                file.check_interval_secs,
            )?
            .unwrap_or(DEFAULT_CHECK_INTERVAL_SECS),
            timeout_secs: number(&lookup, "CK_TIMEOUT_SECS", file.timeout_secs)?
                .unwrap_or(DEFAULT_TIMEOUT_SECS),
            delivery_timeout_secs: number(
                &lookup,
                "CK_DELIVERY_TIMEOUT_SECS",
                file.delivery_timeout_secs,
            )?
            .unwrap_or(DEFAULT_DELIVERY_TIMEOUT_SECS),
        })
    }

    /// Properties for the broker client.
    pub fn kafka_settings(&self) -> Vec<(&'static str, String)> {
        let mut settings = vec![("bootstrap.servers", self.kafka_servers.clone())];
        if let Some(ssl) = &self.kafka_ssl {
            settings.push(("security.protocol", "ssl".to_string()));
            settings.push(("ssl.ca.location", ssl.ca_location.clone()));
            settings.push(("ssl.certificate.location", ssl.certificate_location.clone()));
            settings.push(("ssl.key.location", ssl.key_location.clone()));
        }
        settings
    }

    pub fn postgresql_url(&self) -> Result<&str> {
        self.postgresql_url
            .as_deref()
            .ok_or_else(|| Error::Config("CK_POSTGRESQL_URL is not set".to_string()))
    }

    pub fn check_interval(&self) -> Duration {
        Duration::from_secs(self.check_interval_secs)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn delivery_timeout(&self) -> Duration {
        Duration::from_secs(self.delivery_timeout_secs)
    }
}

fn number<T, F>(lookup: &F, key: &str, from_file: Option<T>) -> Result<Option<T>>
where
    T: std::str::FromStr,
    F: Fn(&str) -> Result<Option<String>>,
{
    match lookup(key)? {
        Some(value) => value
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| Error::Config(format!("{key} must be a number, got {value:?}"))),
        None => Ok(from_file),
    }
}

fn parse_kafka_ssl(value: &str) -> Result<Option<KafkaSsl>> {
    match value.split_whitespace().collect::<Vec<_>>().as_slice() {
        [] => Ok(None),
        [ca, cert, key] => Ok(Some(KafkaSsl {
            ca_location: (*ca).to_string(),
            certificate_location: (*cert).to_string(),
            key_location: (*key).to_string(),
        })),
        _ => Err(Error::Config(format!(
            "CK_KAFKA_SSL must be \"<ca> <cert> <key>\", got {value:?}"
        ))),
    }
}

fn env_var(key: &str) -> Result<Option<String>> {
    match dotenvy::var(key) {
        Ok(value) => Ok(Some(value)),
        Err(dotenvy::Error::EnvVar(VarError::NotPresent)) => Ok(None),
        Err(err) => Err(err.into()),
    }
}

/// `$CK_CONFIG_FILE` if set (it must exist), else the per-user config file
/// when present.
fn config_file_path() -> Result<Option<PathBuf>> {
    if let Some(path) = env_var("CK_CONFIG_FILE")? {
        return Ok(Some(PathBuf::from(path)));
    }
    Ok(dirs::config_dir()
        .map(|dir| dir.join("checksite").join("config.toml"))
        .filter(|path| path.is_file()))
}
