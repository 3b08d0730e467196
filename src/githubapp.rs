//! GitHub App authentication seam.
//!
//! Upstream requests and `git` subprocesses against github.com can be
//! authenticated with per-organisation installation tokens.  Token issuance
//! (App JWT signing, installation token exchange) is deliberately behind the
//! [`TokenProvider`] trait; the shipped provider resolves tokens from
//! operator-supplied environment variables, which is all CI deployments with
//! an external token broker need.

use std::collections::HashMap;

use anyhow::Context;
use async_trait::async_trait;
use serde::Deserialize;
use tracing::{debug, info};

// ---------------------------------------------------------------------------
// Config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GithubAppConfig {
    /// GitHub App ID.
    #[serde(default)]
    pub app_id: String,
    /// Path to the App private key (PEM).
    #[serde(default)]
    pub private_key_path: String,
    /// JSON object mapping organisation names to installation IDs.
    #[serde(default)]
    pub installations_json: String,
    /// Prefix for per-org token environment variables; `<PREFIX>_<ORG>` is
    /// consulted first, then `<PREFIX>` as a fallback.
    #[serde(default = "default_token_env_prefix")]
    pub token_env_prefix: String,
}

fn default_token_env_prefix() -> String {
    "CACHEW_GITHUB_TOKEN".to_string()
}

// ---------------------------------------------------------------------------
// Provider
// ---------------------------------------------------------------------------

/// Source of GitHub access tokens for upstream operations.
#[async_trait]
pub trait TokenProvider: Send + Sync {
    /// Token for an organisation, or `None` when none is configured.
    async fn token_for_org(&self, org: &str) -> Option<String>;

    /// Token for a URL: only github.com URLs are eligible, with the
    /// organisation taken from the first path segment.
    async fn token_for_url(&self, url: &str) -> Option<String> {
        let parsed = url::Url::parse(url).ok()?;
        if parsed.host_str() != Some("github.com") {
            return None;
        }
        let org = parsed.path_segments()?.find(|segment| !segment.is_empty())?.to_string();
        self.token_for_org(&org).await
    }
}

/// Environment-backed token provider scoped to the configured installations.
pub struct EnvTokenProvider {
    installations: HashMap<String, String>,
    env_prefix: String,
}

impl EnvTokenProvider {
    /// Build a provider from config.  Returns `None` when the github-app
    /// block is absent or empty, in which case system git credentials apply.
    pub fn from_config(config: &GithubAppConfig) -> anyhow::Result<Option<Self>> {
        if config.installations_json.is_empty() {
            return Ok(None);
        }
        let installations: HashMap<String, String> =
            serde_json::from_str(&config.installations_json)
                .context("parse installations-json")?;
        anyhow::ensure!(
            !installations.is_empty(),
            "installations-json must contain at least one organisation"
        );
        info!(
            app_id = %config.app_id,
            installations = installations.len(),
            "GitHub App authentication configured"
        );
        Ok(Some(Self {
            installations,
            env_prefix: config.token_env_prefix.clone(),
        }))
    }

    fn env_name(&self, org: &str) -> String {
        format!(
            "{}_{}",
            self.env_prefix,
            org.to_uppercase().replace('-', "_")
        )
    }
}

#[async_trait]
impl TokenProvider for EnvTokenProvider {
    async fn token_for_org(&self, org: &str) -> Option<String> {
        if !self.installations.contains_key(org) {
            return None;
        }
        let token = std::env::var(self.env_name(org))
            .or_else(|_| std::env::var(&self.env_prefix))
            .ok()
            .filter(|token| !token.is_empty());
        if token.is_some() {
            debug!(org, "resolved GitHub token");
        }
        token
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn provider() -> EnvTokenProvider {
        EnvTokenProvider {
            installations: HashMap::from([("acme".to_string(), "123".to_string())]),
            env_prefix: "CACHEW_TEST_TOKEN".to_string(),
        }
    }

    #[tokio::test]
    async fn unknown_org_has_no_token() {
        std::env::set_var("CACHEW_TEST_TOKEN", "secret");
        assert_eq!(provider().token_for_org("other").await, None);
        std::env::remove_var("CACHEW_TEST_TOKEN");
    }

    #[tokio::test]
    async fn url_resolution_requires_github_host() {
        std::env::set_var("CACHEW_TEST_TOKEN_ACME", "org-secret");
        let provider = provider();
        assert_eq!(
            provider
                .token_for_org("acme")
                .await
                .as_deref(),
            Some("org-secret")
        );
        assert_eq!(
            provider
                .token_for_url("https://github.com/acme/widgets.git")
                .await
                .as_deref(),
            Some("org-secret")
        );
        assert_eq!(
            provider
                .token_for_url("https://gitlab.com/acme/widgets.git")
                .await,
            None
        );
        std::env::remove_var("CACHEW_TEST_TOKEN_ACME");
    }

    #[test]
    fn empty_config_disables_provider() {
        assert!(EnvTokenProvider::from_config(&GithubAppConfig::default())
            .unwrap()
            .is_none());
    }

    #[test]
    fn bad_installations_json_is_an_error() {
        let config = GithubAppConfig {
            installations_json: "not-json".to_string(),
            ..GithubAppConfig::default()
        };
        assert!(EnvTokenProvider::from_config(&config).is_err());
    }
}
