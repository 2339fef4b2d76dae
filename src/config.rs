//! Runtime settings: JSON file, then environment overrides, then validation.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::client::HttpTransport;
use crate::error::SdmxError;
use crate::fetch::FetchOptions;
use crate::metadata::MetadataStore;

pub const DEFAULT_BASE_URL: &str = "https://sdmx.data.unicef.org/ws/public/sdmxapi/rest";

pub const ENV_BASE_URL: &str = "UNICEF_SDMX_BASE_URL";
pub const ENV_METADATA_DIR: &str = "UNICEF_SDMX_METADATA_DIR";
pub const ENV_PAGE_SIZE: &str = "UNICEF_SDMX_PAGE_SIZE";

/// `labels=` query parameter: codes only, or `CODE: Label` pairs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LabelMode {
    #[default]
    Id,
    Both,
}

impl LabelMode {
    pub fn as_param(self) -> &'static str {
        match self {
            LabelMode::Id => "id",
            LabelMode::Both => "both",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub base_url: String,
    pub agency: String,
    pub version: String,
    pub metadata_dir: PathBuf,
    pub page_size: usize,
    pub max_attempts: u32,
    pub retry_delay_ms: u64,
    pub timeout_secs: u64,
    pub connect_timeout_secs: u64,
    pub max_pages: usize,
    pub labels: LabelMode,
    pub cache_max_age_days: u32,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            agency: "UNICEF".to_string(),
            version: "1.0".to_string(),
            metadata_dir: default_metadata_dir(),
            page_size: 100_000,
            max_attempts: 3,
            retry_delay_ms: 1_000,
            timeout_secs: 120,
            connect_timeout_secs: 10,
            max_pages: 1_000,
            labels: LabelMode::Id,
            cache_max_age_days: 30,
        }
    }
}

fn default_metadata_dir() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("unicef-sdmx")
}

impl Settings {
    /// Reads `path` (when given), then applies the process environment.
    pub fn load(path: Option<&Path>) -> Result<Self, SdmxError> {
        let mut settings = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        settings.apply_env_with(|name| std::env::var(name).ok())?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn from_file(path: &Path) -> Result<Self, SdmxError> {
        let content = fs::read_to_string(path)
            .map_err(|e| SdmxError::Config(format!("read {}: {e}", path.display())))?;
        serde_json::from_str(&content)
            .map_err(|e| SdmxError::Config(format!("parse {}: {e}", path.display())))
    }

    /// Applies overrides from `lookup` (normally `std::env::var`).
    pub fn apply_env_with<F>(&mut self, lookup: F) -> Result<(), SdmxError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let value = |name: &str| lookup(name).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());
        if let Some(url) = value(ENV_BASE_URL) {
            self.base_url = url;
        }
        if let Some(dir) = value(ENV_METADATA_DIR) {
            self.metadata_dir = PathBuf::from(dir);
        }
        if let Some(size) = value(ENV_PAGE_SIZE) {
            self.page_size = size
                .parse()
                .map_err(|_| SdmxError::Config(format!("{ENV_PAGE_SIZE}={size:?} is not a number")))?;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), SdmxError> {
        if self.page_size == 0 {
            return Err(SdmxError::Config("page_size must be at least 1".into()));
        }
        if self.max_attempts == 0 {
            return Err(SdmxError::Config("max_attempts must be at least 1".into()));
        }
        if self.max_pages == 0 {
            return Err(SdmxError::Config("max_pages must be at least 1".into()));
        }
        if !(self.base_url.starts_with("http://") || self.base_url.starts_with("https://")) {
            return Err(SdmxError::Config(format!(
                "base_url {:?} is not an http(s) URL",
                self.base_url
            )));
        }
        Ok(())
    }

    pub fn fetch_options(&self) -> FetchOptions {
        FetchOptions {
            page_size: self.page_size,
            max_attempts: self.max_attempts,
            retry_delay: Duration::from_millis(self.retry_delay_ms),
            max_pages: self.max_pages,
            agency: self.agency.clone(),
            version: self.version.clone(),
        }
    }

    pub fn transport(&self) -> Result<HttpTransport, SdmxError> {
        HttpTransport::new(self)
    }

    pub fn metadata_store(&self) -> MetadataStore {
        MetadataStore::new(self.metadata_dir.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn partial_json_keeps_defaults() {
        let s: Settings = serde_json::from_str(r#"{"page_size": 500, "labels": "both"}"#).unwrap();
        assert_eq!(s.page_size, 500);
        assert_eq!(s.labels, LabelMode::Both);
        assert_eq!(s.base_url, DEFAULT_BASE_URL);
        assert_eq!(s.max_attempts, 3);
    }

    #[test]
    fn env_overrides() {
        let env: HashMap<&str, &str> = [
            (ENV_BASE_URL, "http://localhost:8080/rest"),
            (ENV_METADATA_DIR, "/tmp/meta"),
            (ENV_PAGE_SIZE, " 2500 "),
        ]
        .into_iter()
        .collect();
        let mut s = Settings::default();
        s.apply_env_with(|k| env.get(k).map(|v| v.to_string())).unwrap();
        assert_eq!(s.base_url, "http://localhost:8080/rest");
        assert_eq!(s.metadata_dir, PathBuf::from("/tmp/meta"));
        assert_eq!(s.page_size, 2500);
    }

    #[test]
    fn bad_page_size_env_is_config_error() {
        let mut s = Settings::default();
        let err = s
            .apply_env_with(|k| (k == ENV_PAGE_SIZE).then(|| "lots".to_string()))
            .unwrap_err();
        assert!(matches!(err, SdmxError::Config(_)));
    }

    #[test]
    fn zero_limits_rejected() {
        let s = Settings {
            page_size: 0,
            ..Settings::default()
        };
        assert!(s.validate().is_err());
        let s = Settings {
            max_attempts: 0,
            ..Settings::default()
        };
        assert!(s.validate().is_err());
        assert!(Settings::default().validate().is_ok());
    }

    #[test]
    fn fetch_options_follow_settings() {
        let s = Settings {
            page_size: 10,
            retry_delay_ms: 5,
            ..Settings::default()
        };
        let o = s.fetch_options();
        assert_eq!(o.page_size, 10);
        assert_eq!(o.retry_delay, Duration::from_millis(5));
        assert_eq!(o.agency, "UNICEF");
    }
}
