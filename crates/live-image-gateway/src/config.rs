//! Server configuration, read from `LIVE_IMAGE_*` environment variables.

use axum::http::{header, HeaderMap};
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use thiserror::Error;

pub const DEFAULT_PORT: u16 = 8774;
pub const DEFAULT_API_PREFIX: &str = "/v3";
pub const DEFAULT_METADATA_ITEMS: u64 = 128;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Invalid value for {var}: {message}")]
    InvalidValue { var: &'static str, message: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiServerConfig {
    pub host: IpAddr,
    pub port: u16,
    /// Mount point of the compute API, e.g. `/v3`. Empty mounts at the root.
    pub api_prefix: String,
    /// Overrides the application URL derived from request headers.
    pub public_url: Option<String>,
    pub policy_file: Option<PathBuf>,
    pub inventory_file: Option<PathBuf>,
    pub metadata_items: u64,
}

impl Default for ApiServerConfig {
    fn default() -> Self {
        Self {
            host: IpAddr::from([0, 0, 0, 0]),
            port: DEFAULT_PORT,
            api_prefix: DEFAULT_API_PREFIX.to_string(),
            public_url: None,
            policy_file: None,
            inventory_file: None,
            metadata_items: DEFAULT_METADATA_ITEMS,
        }
    }
}

impl ApiServerConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Build from an arbitrary variable source. Unset and blank values
    /// fall back to defaults.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |var: &str| lookup(var).filter(|value| !value.trim().is_empty());
        let defaults = Self::default();

        let host = match get("LIVE_IMAGE_API_HOST") {
            Some(value) => value
                .trim()
                .parse()
                .map_err(|e: std::net::AddrParseError| ConfigError::InvalidValue {
                    var: "LIVE_IMAGE_API_HOST",
                    message: e.to_string(),
                })?,
            None => defaults.host,
        };

        let port = match get("LIVE_IMAGE_API_PORT") {
            Some(value) => value
                .trim()
                .parse()
                .map_err(|e: std::num::ParseIntError| ConfigError::InvalidValue {
                    var: "LIVE_IMAGE_API_PORT",
                    message: e.to_string(),
                })?,
            None => defaults.port,
        };

        let api_prefix = match lookup("LIVE_IMAGE_API_PREFIX") {
            Some(value) => normalize_prefix(&value)?,
            None => defaults.api_prefix,
        };

        let metadata_items = match get("LIVE_IMAGE_METADATA_ITEMS") {
            Some(value) => value
                .trim()
                .parse()
                .map_err(|e: std::num::ParseIntError| ConfigError::InvalidValue {
                    var: "LIVE_IMAGE_METADATA_ITEMS",
                    message: e.to_string(),
                })?,
            None => defaults.metadata_items,
        };

        Ok(Self {
            host,
            port,
            api_prefix,
            public_url: get("LIVE_IMAGE_PUBLIC_URL")
                .map(|url| url.trim().trim_end_matches('/').to_string()),
            policy_file: get("LIVE_IMAGE_POLICY_FILE").map(PathBuf::from),
            inventory_file: get("LIVE_IMAGE_INVENTORY_FILE").map(PathBuf::from),
            metadata_items,
        })
    }

    pub fn listen_addr(&self) -> SocketAddr {
        SocketAddr::new(self.host, self.port)
    }

    /// Base URL of the compute API as the caller sees it.
    pub fn application_url(&self, headers: &HeaderMap) -> String {
        if let Some(url) = &self.public_url {
            return url.clone();
        }

        let scheme = headers
            .get("X-Forwarded-Proto")
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .unwrap_or("http");
        let host = headers
            .get(header::HOST)
            .and_then(|v| v.to_str().ok())
            .filter(|v| !v.is_empty())
            .map(str::to_string)
            .unwrap_or_else(|| format!("localhost:{}", self.port));

        format!("{}://{}{}", scheme, host, self.api_prefix)
    }
}

fn normalize_prefix(value: &str) -> Result<String, ConfigError> {
    let trimmed = value.trim().trim_end_matches('/');
    if trimmed.is_empty() {
        return Ok(String::new());
    }
    if !trimmed.starts_with('/') {
        return Err(ConfigError::InvalidValue {
            var: "LIVE_IMAGE_API_PREFIX",
            message: format!("'{trimmed}' must start with '/'"),
        });
    }
    Ok(trimmed.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |var| vars.get(var).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = ApiServerConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config, ApiServerConfig::default());
        assert_eq!(config.listen_addr().to_string(), "0.0.0.0:8774");
    }

    #[test]
    fn test_overrides() {
        let config = ApiServerConfig::from_lookup(lookup(&[
            ("LIVE_IMAGE_API_HOST", "127.0.0.1"),
            ("LIVE_IMAGE_API_PORT", "9000"),
            ("LIVE_IMAGE_API_PREFIX", "/compute/v2.1/"),
            ("LIVE_IMAGE_PUBLIC_URL", "https://api.example.com/v2.1/"),
            ("LIVE_IMAGE_POLICY_FILE", "/etc/live-image/policy.json"),
            ("LIVE_IMAGE_METADATA_ITEMS", "16"),
        ]))
        .unwrap();

        assert_eq!(config.listen_addr().to_string(), "127.0.0.1:9000");
        assert_eq!(config.api_prefix, "/compute/v2.1");
        assert_eq!(
            config.public_url.as_deref(),
            Some("https://api.example.com/v2.1")
        );
        assert_eq!(
            config.policy_file,
            Some(PathBuf::from("/etc/live-image/policy.json"))
        );
        assert_eq!(config.inventory_file, None);
        assert_eq!(config.metadata_items, 16);
    }

    #[test]
    fn test_empty_prefix_mounts_at_root() {
        let config =
            ApiServerConfig::from_lookup(lookup(&[("LIVE_IMAGE_API_PREFIX", "/")])).unwrap();
        assert_eq!(config.api_prefix, "");
    }

    #[test]
    fn test_invalid_values() {
        let err = ApiServerConfig::from_lookup(lookup(&[("LIVE_IMAGE_API_PORT", "http")]))
            .unwrap_err();
        assert!(matches!(
            err,
            ConfigError::InvalidValue { var: "LIVE_IMAGE_API_PORT", .. }
        ));

        let err = ApiServerConfig::from_lookup(lookup(&[("LIVE_IMAGE_API_PREFIX", "v3")]))
            .unwrap_err();
        assert!(matches!(
            err,
            ConfigError::InvalidValue { var: "LIVE_IMAGE_API_PREFIX", .. }
        ));

        let err = ApiServerConfig::from_lookup(lookup(&[("LIVE_IMAGE_METADATA_ITEMS", "lots")]))
            .unwrap_err();
        assert!(matches!(
            err,
            ConfigError::InvalidValue { var: "LIVE_IMAGE_METADATA_ITEMS", .. }
        ));

        let err = ApiServerConfig::from_lookup(lookup(&[("LIVE_IMAGE_API_HOST", "not-an-ip")]))
            .unwrap_err();
        assert!(matches!(
            err,
            ConfigError::InvalidValue { var: "LIVE_IMAGE_API_HOST", .. }
        ));
    }

    #[test]
    fn test_application_url_from_headers() {
        let config = ApiServerConfig::default();

        let mut headers = HeaderMap::new();
        headers.insert(header::HOST, HeaderValue::from_static("compute.local:8774"));
        assert_eq!(
            config.application_url(&headers),
            "http://compute.local:8774/v3"
        );

        headers.insert("X-Forwarded-Proto", HeaderValue::from_static("https"));
        assert_eq!(
            config.application_url(&headers),
            "https://compute.local:8774/v3"
        );

        assert_eq!(
            config.application_url(&HeaderMap::new()),
            "http://localhost:8774/v3"
        );
    }

    #[test]
    fn test_public_url_wins() {
        let config = ApiServerConfig {
            public_url: Some("https://api.example.com/v3".to_string()),
            ..ApiServerConfig::default()
        };

        let mut headers = HeaderMap::new();
        headers.insert(header::HOST, HeaderValue::from_static("internal:8774"));
        assert_eq!(config.application_url(&headers), "https://api.example.com/v3");
    }
}
