//! Server configuration: defaults, an optional TOML file, then environment
//! variables.

use anyhow::{Context, Result};
use catbook_core::vision::{DEFAULT_MAX_RESULTS, DEFAULT_TIMEOUT, DEFAULT_VISION_ENDPOINT};
use catbook_core::{
    DEFAULT_ACCEPT_LABEL, ServiceAccountKey, VisionConfig, load_service_account,
    persist_service_account_json,
};
use serde::Deserialize;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

pub const DEFAULT_PORT: u16 = 8080;
pub const DEFAULT_MAX_UPLOAD_BYTES: usize = 10 * 1024 * 1024;

/// Environment lookup; `std::env::var` in production, a map in tests.
pub type EnvLookup<'a> = &'a dyn Fn(&str) -> Option<String>;

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub upload_dir: PathBuf,
    /// Pre-built UI bundle served for every non-API path.
    pub static_dir: PathBuf,
    pub max_upload_bytes: usize,
    /// Label an upload must carry to be kept.
    pub accept_label: String,
    pub vision: VisionSettings,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: DEFAULT_PORT,
            upload_dir: PathBuf::from("uploads"),
            static_dir: PathBuf::from("client/build"),
            max_upload_bytes: DEFAULT_MAX_UPLOAD_BYTES,
            accept_label: DEFAULT_ACCEPT_LABEL.to_string(),
            vision: VisionSettings::default(),
        }
    }
}

#[derive(Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct VisionSettings {
    pub endpoint: String,
    pub max_results: u32,
    pub timeout_secs: u64,
    pub api_key: Option<String>,
    /// Where inline service account JSON is written at startup.
    pub credentials_file: PathBuf,
}

impl Default for VisionSettings {
    fn default() -> Self {
        Self {
            endpoint: DEFAULT_VISION_ENDPOINT.to_string(),
            max_results: DEFAULT_MAX_RESULTS,
            timeout_secs: DEFAULT_TIMEOUT.as_secs(),
            api_key: None,
            credentials_file: PathBuf::from("service-account.json"),
        }
    }
}

impl fmt::Debug for VisionSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VisionSettings")
            .field("endpoint", &self.endpoint)
            .field("max_results", &self.max_results)
            .field("timeout_secs", &self.timeout_secs)
            .field("api_key", &self.api_key.as_ref().map(|_| "<redacted>"))
            .field("credentials_file", &self.credentials_file)
            .finish()
    }
}

/// Credentials chosen at startup for the classification API.
#[derive(Debug, Clone)]
pub enum ResolvedCredentials {
    ServiceAccount(ServiceAccountKey),
    ApiKey(String),
}

impl ServerConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(&|name| std::env::var(name).ok())
    }

    pub fn from_lookup(lookup: EnvLookup<'_>) -> Result<Self> {
        let mut cfg = match non_empty(lookup, "CATBOOK_CONFIG") {
            Some(path) => Self::from_toml_file(Path::new(&path))?,
            None => Self::default(),
        };
        cfg.apply_env(lookup);
        Ok(cfg)
    }

    pub fn from_toml_str(raw: &str) -> Result<Self> {
        toml::from_str(raw).context("invalid configuration file")
    }

    pub fn from_toml_file(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .with_context(|| format!("cannot read configuration file {}", path.display()))?;
        Self::from_toml_str(&raw).with_context(|| format!("in {}", path.display()))
    }

    fn apply_env(&mut self, lookup: EnvLookup<'_>) {
        if let Some(host) = non_empty(lookup, "CATBOOK_HOST") {
            self.host = host;
        }
        override_parsed(lookup, "PORT", &mut self.port);
        if let Some(dir) = non_empty(lookup, "CATBOOK_UPLOAD_DIR") {
            self.upload_dir = PathBuf::from(dir);
        }
        if let Some(dir) = non_empty(lookup, "CATBOOK_STATIC_DIR") {
            self.static_dir = PathBuf::from(dir);
        }
        override_parsed(lookup, "CATBOOK_MAX_UPLOAD_BYTES", &mut self.max_upload_bytes);
        if let Some(label) = non_empty(lookup, "CATBOOK_ACCEPT_LABEL") {
            self.accept_label = label;
        }
        if let Some(endpoint) = non_empty(lookup, "VISION_ENDPOINT") {
            self.vision.endpoint = endpoint;
        }
        override_parsed(lookup, "VISION_MAX_RESULTS", &mut self.vision.max_results);
        override_parsed(lookup, "VISION_TIMEOUT_SECS", &mut self.vision.timeout_secs);
        if let Some(key) = non_empty(lookup, "VISION_API_KEY") {
            self.vision.api_key = Some(key);
        }
        if let Some(path) = non_empty(lookup, "CATBOOK_CREDENTIALS_FILE") {
            self.vision.credentials_file = PathBuf::from(path);
        }
    }

    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn vision_config(&self) -> VisionConfig {
        VisionConfig {
            endpoint: self.vision.endpoint.clone(),
            max_results: self.vision.max_results,
            timeout: Duration::from_secs(self.vision.timeout_secs),
        }
    }

    /// Pick classification credentials. Inline `SERVICE_ACCOUNT_JSON` wins and
    /// is written to the credentials file first, then a key file named by
    /// `GOOGLE_APPLICATION_CREDENTIALS`, then an API key.
    pub fn resolve_credentials(&self, lookup: EnvLookup<'_>) -> Result<ResolvedCredentials> {
        if let Some(json) = non_empty(lookup, "SERVICE_ACCOUNT_JSON") {
            let key = persist_service_account_json(&json, &self.vision.credentials_file)
                .context("SERVICE_ACCOUNT_JSON is not usable")?;
            return Ok(ResolvedCredentials::ServiceAccount(key));
        }
        if let Some(path) = non_empty(lookup, "GOOGLE_APPLICATION_CREDENTIALS") {
            let key = load_service_account(&path)
                .with_context(|| format!("cannot load service account from {path}"))?;
            return Ok(ResolvedCredentials::ServiceAccount(key));
        }
        if let Some(key) = self.vision.api_key.as_ref().filter(|k| !k.trim().is_empty()) {
            return Ok(ResolvedCredentials::ApiKey(key.clone()));
        }
        anyhow::bail!(
            "no classification credentials: set SERVICE_ACCOUNT_JSON, GOOGLE_APPLICATION_CREDENTIALS or VISION_API_KEY"
        )
    }
}

fn non_empty(lookup: EnvLookup<'_>, name: &str) -> Option<String> {
    lookup(name).filter(|v| !v.trim().is_empty())
}

fn override_parsed<T: FromStr>(lookup: EnvLookup<'_>, name: &str, slot: &mut T) {
    let Some(raw) = non_empty(lookup, name) else {
        return;
    };
    match raw.trim().parse::<T>() {
        Ok(value) => *slot = value,
        Err(_) => tracing::warn!(name, value = %raw, "ignoring unparsable setting"),
    }
}

/// Truthy/falsy environment flag, `default` when unset or unrecognised.
pub fn env_bool(name: &str, default: bool) -> bool {
    std::env::var(name)
        .ok()
        .and_then(|v| parse_bool(&v))
        .unwrap_or(default)
}

/// Loads `KEY=value` lines into the process environment, never overriding
/// variables that are already set. `None` looks for `.env` in the working
/// directory and its parents. Returns the file used, or `None` if there was
/// no file.
pub fn load_env_file(path: Option<&Path>) -> Result<Option<PathBuf>, dotenvy::Error> {
    let loaded = match path {
        Some(p) => dotenvy::from_path(p).map(|()| p.to_path_buf()),
        None => dotenvy::dotenv(),
    };
    match loaded {
        Ok(p) => Ok(Some(p)),
        Err(e) if e.not_found() => Ok(None),
        Err(e) => Err(e),
    }
}

fn parse_bool(raw: &str) -> Option<bool> {
    match raw.trim() {
        "1" | "true" | "TRUE" | "yes" | "YES" => Some(true),
        "0" | "false" | "FALSE" | "no" | "NO" => Some(false),
        _ => None,
    }
}
