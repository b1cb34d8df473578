//! Remote sync configuration.
//!
//! Front ends build a [`SyncConfig`] either explicitly or from the
//! `JOTTER_API_URL` / `JOTTER_API_TOKEN` / `JOTTER_SYNC_INTERVAL_SECS`
//! environment variables.

use std::time::Duration;

use crate::error::{Error, Result};
use crate::util::{is_http_url, normalize_text_option};

pub const API_URL_VAR: &str = "JOTTER_API_URL";
pub const API_TOKEN_VAR: &str = "JOTTER_API_TOKEN";
pub const SYNC_INTERVAL_VAR: &str = "JOTTER_SYNC_INTERVAL_SECS";

const DEFAULT_SYNC_INTERVAL: Duration = Duration::from_secs(60);

/// Configuration for syncing with the remote journal API
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncConfig {
    /// Remote API base URL (e.g., `https://api.example.com`)
    pub api_base_url: Option<String>,
    /// Bearer token for the remote API
    pub auth_token: Option<String>,
    /// Automatic sync interval for watch mode (default: 60 seconds)
    pub sync_interval: Option<Duration>,
}

impl SyncConfig {
    /// Create a new sync configuration
    pub fn new(api_base_url: impl Into<String>, auth_token: impl Into<String>) -> Self {
        Self {
            api_base_url: Some(api_base_url.into()),
            auth_token: Some(auth_token.into()),
            sync_interval: Some(DEFAULT_SYNC_INTERVAL),
        }
    }

    /// Set the automatic sync interval
    #[must_use]
    pub const fn with_sync_interval(mut self, interval: Duration) -> Self {
        self.sync_interval = Some(interval);
        self
    }

    /// Disable automatic sync (manual sync only)
    #[must_use]
    pub const fn without_auto_sync(mut self) -> Self {
        self.sync_interval = None;
        self
    }

    /// Check if sync is configured
    pub const fn is_configured(&self) -> bool {
        self.api_base_url.is_some() && self.auth_token.is_some()
    }

    /// Read sync configuration from process environment variables.
    ///
    /// Returns `Ok(None)` when neither URL nor token is set.
    pub fn from_env() -> Result<Option<Self>> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build sync configuration from an arbitrary key lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Option<Self>> {
        let url = normalize_text_option(lookup(API_URL_VAR));
        let token = normalize_text_option(lookup(API_TOKEN_VAR));

        let (url, token) = match (url, token) {
            (None, None) => return Ok(None),
            (Some(url), Some(token)) => (url, token),
            (Some(_), None) => {
                return Err(Error::InvalidInput(format!(
                    "{API_URL_VAR} is set but {API_TOKEN_VAR} is missing"
                )))
            }
            (None, Some(_)) => {
                return Err(Error::InvalidInput(format!(
                    "{API_TOKEN_VAR} is set but {API_URL_VAR} is missing"
                )))
            }
        };

        if !is_http_url(&url) {
            return Err(Error::InvalidInput(format!(
                "{API_URL_VAR} must include http:// or https://"
            )));
        }

        let mut config = Self::new(url.trim_end_matches('/'), token);
        if let Some(raw) = normalize_text_option(lookup(SYNC_INTERVAL_VAR)) {
            let secs = raw.parse::<u64>().map_err(|_| {
                Error::InvalidInput(format!("{SYNC_INTERVAL_VAR} must be a number of seconds"))
            })?;
            config = if secs == 0 {
                config.without_auto_sync()
            } else {
                config.with_sync_interval(Duration::from_secs(secs))
            };
        }

        Ok(Some(config))
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map = pairs
            .iter()
            .map(|(key, value)| ((*key).to_string(), (*value).to_string()))
            .collect::<HashMap<_, _>>();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_sync_config_new() {
        let config = SyncConfig::new("https://api.example.com", "test-token");
        assert!(config.is_configured());
        assert_eq!(config.sync_interval, Some(Duration::from_secs(60)));
    }

    #[test]
    fn test_sync_config_default_not_configured() {
        let config = SyncConfig::default();
        assert!(!config.is_configured());
    }

    #[test]
    fn from_lookup_returns_none_when_unset() {
        assert_eq!(SyncConfig::from_lookup(lookup(&[])).unwrap(), None);
        assert_eq!(
            SyncConfig::from_lookup(lookup(&[(API_URL_VAR, "  "), (API_TOKEN_VAR, "")])).unwrap(),
            None
        );
    }

    #[test]
    fn from_lookup_requires_both_values() {
        let error =
            SyncConfig::from_lookup(lookup(&[(API_URL_VAR, "https://api.example.com")]))
                .unwrap_err();
        assert!(error.to_string().contains(API_TOKEN_VAR));
    }

    #[test]
    fn from_lookup_rejects_missing_scheme() {
        let error = SyncConfig::from_lookup(lookup(&[
            (API_URL_VAR, "api.example.com"),
            (API_TOKEN_VAR, "secret"),
        ]))
        .unwrap_err();
        assert!(error.to_string().contains("http://"));
    }

    #[test]
    fn from_lookup_trims_and_reads_interval() {
        let config = SyncConfig::from_lookup(lookup(&[
            (API_URL_VAR, " https://api.example.com/ "),
            (API_TOKEN_VAR, "secret"),
            (SYNC_INTERVAL_VAR, "15"),
        ]))
        .unwrap()
        .unwrap();

        assert_eq!(config.api_base_url.as_deref(), Some("https://api.example.com"));
        assert_eq!(config.sync_interval, Some(Duration::from_secs(15)));
    }

    #[test]
    fn from_lookup_zero_interval_disables_auto_sync() {
        let config = SyncConfig::from_lookup(lookup(&[
            (API_URL_VAR, "https://api.example.com"),
            (API_TOKEN_VAR, "secret"),
            (SYNC_INTERVAL_VAR, "0"),
        ]))
        .unwrap()
        .unwrap();
        assert_eq!(config.sync_interval, None);
    }
}
