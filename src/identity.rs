//! Identity-provider capability: resolve the caller behind a bearer token
//! and mint Google OAuth access tokens for stored subjects.

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use reqwest::{Client, Url};
use serde::Deserialize;
use std::fmt;

/// The resolved caller. `auth_ref` is the opaque reference stored on the
/// watch row and later exchanged for provider access tokens.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserIdentity {
    pub subject: String,
    pub email: String,
    pub auth_ref: String,
}

#[async_trait]
pub trait IdentityProvider: Send + Sync {
    /// Resolve a front-end bearer token to a user identity.
    async fn resolve(&self, bearer: &str) -> Result<UserIdentity>;

    /// Mint a Google OAuth access token for a stored `auth_ref`.
    async fn access_token(&self, auth_ref: &str) -> Result<String>;
}

#[derive(Clone)]
pub struct IdentityClient {
    http: Client,
    base_url: Url,
    secret_key: String,
}

impl fmt::Debug for IdentityClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IdentityClient")
            .field("base_url", &self.base_url)
            .finish_non_exhaustive()
    }
}

impl IdentityClient {
    pub fn new(base_url: Url, secret_key: String) -> Self {
        let http = Client::builder()
            .user_agent("inbox-relay/0.1")
            .build()
            .expect("reqwest client");
        Self {
            http,
            base_url,
            secret_key,
        }
    }
}

#[derive(Deserialize)]
struct UserInfoResp {
    sub: String,
    email: String,
}

#[derive(Deserialize)]
struct OauthTokenEntry {
    token: String,
}

#[async_trait]
impl IdentityProvider for IdentityClient {
    async fn resolve(&self, bearer: &str) -> Result<UserIdentity> {
        let url = self.base_url.join("v1/userinfo")?;
        let res = self
            .http
            .get(url)
            .bearer_auth(bearer)
            .send()
            .await
            .context("failed to reach identity provider")?;
        if !res.status().is_success() {
            return Err(anyhow!("identity resolution failed: {}", res.status()));
        }
        let info: UserInfoResp = res.json().await.context("invalid userinfo response")?;
        Ok(UserIdentity {
            subject: info.sub.clone(),
            email: info.email,
            auth_ref: info.sub,
        })
    }

    async fn access_token(&self, auth_ref: &str) -> Result<String> {
        let url = self.base_url.join(&format!(
            "v1/users/{}/oauth_access_tokens/oauth_google",
            auth_ref
        ))?;
        let res = self
            .http
            .get(url)
            .bearer_auth(&self.secret_key)
            .send()
            .await
            .context("failed to reach identity provider")?;
        if !res.status().is_success() {
            return Err(anyhow!("oauth token retrieval failed: {}", res.status()));
        }
        let tokens: Vec<OauthTokenEntry> =
            res.json().await.context("invalid oauth token response")?;
        tokens
            .into_iter()
            .next()
            .map(|t| t.token)
            .ok_or_else(|| anyhow!("no Google OAuth token on file for {}", auth_ref))
    }
}
