//! Caller identity resolution
//!
//! Three mechanisms, first success wins: trusted headers injected by an
//! upstream gateway, bearer-token introspection against the hub API,
//! and cookie forwarding to an external who-am-I endpoint. With auth
//! disabled, the trusted header (or a `user` query parameter) is
//! accepted without verification.

use hyper::header::HeaderMap;
use portmap_core::{CoreError, Result};
use serde_json::Value;
use std::time::Duration;
use tracing::debug;

use crate::config::GatewayConfig;

const TOKEN_INTROSPECTION_TIMEOUT: Duration = Duration::from_secs(5);
const WHOAMI_TIMEOUT: Duration = Duration::from_secs(8);

/// A resolved caller.
#[derive(Clone, Debug)]
pub struct Account {
    pub account: String,
    /// Which mechanism produced this identity.
    pub source: &'static str,
    /// Provider payload, echoed on `/api/me`.
    pub raw: Value,
}

impl Account {
    fn simple(account: String, source: &'static str) -> Self {
        let raw = serde_json::json!({ "account": account, "source": source });
        Self {
            account,
            source,
            raw,
        }
    }
}

/// First non-empty of the account-ish fields identity providers use.
pub fn extract_account(value: &Value) -> Option<String> {
    for field in ["account", "username", "user", "email", "name"] {
        if let Some(v) = value.get(field).and_then(Value::as_str) {
            if !v.trim().is_empty() {
                return Some(v.trim().to_string());
            }
        }
    }
    None
}

pub struct IdentityResolver {
    disable_auth: bool,
    trust_user_headers: bool,
    user_headers: Vec<String>,
    hub_api_url: Option<String>,
    auth_me_url: Option<String>,
    http: reqwest::Client,
}

impl IdentityResolver {
    pub fn new(config: &GatewayConfig) -> Self {
        Self {
            disable_auth: config.disable_auth,
            trust_user_headers: config.trust_user_headers,
            user_headers: config.user_headers.clone(),
            hub_api_url: config.hub_api_url.clone(),
            auth_me_url: config.auth_me_url.clone(),
            http: reqwest::Client::new(),
        }
    }

    /// Resolve the caller for a CRUD request.
    pub async fn resolve(&self, headers: &HeaderMap, query: Option<&str>) -> Result<Account> {
        if self.disable_auth {
            if let Some(account) = self.from_trusted_headers(headers) {
                return Ok(account);
            }
            if let Some(account) = query.and_then(account_from_query) {
                return Ok(Account::simple(account, "query"));
            }
            return Err(CoreError::Unauthenticated);
        }

        if let Some(account) = self.from_trusted_headers(headers) {
            return Ok(account);
        }
        if let Some(account) = self.from_bearer_token(headers).await {
            return Ok(account);
        }
        self.from_cookie(headers).await
    }

    fn from_trusted_headers(&self, headers: &HeaderMap) -> Option<Account> {
        if !self.trust_user_headers {
            return None;
        }
        for name in &self.user_headers {
            let Some(value) = headers.get(name.as_str()).and_then(|v| v.to_str().ok()) else {
                continue;
            };
            let cleaned = value.trim();
            if !cleaned.is_empty() {
                debug!("Caller identified via trusted header {}", name);
                return Some(Account::simple(cleaned.to_string(), "trusted-header"));
            }
        }
        None
    }

    /// Introspect a bearer/token Authorization header against the hub
    /// API. Any failure here falls through to the next mechanism.
    async fn from_bearer_token(&self, headers: &HeaderMap) -> Option<Account> {
        let hub_api = self.hub_api_url.as_deref()?;
        let authz = headers.get("authorization")?.to_str().ok()?;
        let lower = authz.to_lowercase();
        if !lower.starts_with("bearer ") && !lower.starts_with("token ") {
            return None;
        }
        let token = authz.split_whitespace().nth(1)?.trim();
        if token.is_empty() {
            return None;
        }

        let url = format!("{}/user", hub_api.trim_end_matches('/'));
        let response = self
            .http
            .get(&url)
            .timeout(TOKEN_INTROSPECTION_TIMEOUT)
            .header("Authorization", format!("Bearer {}", token))
            .send()
            .await
            .ok()?;
        if !response.status().is_success() {
            return None;
        }
        let data: Value = response.json().await.ok()?;
        let account = extract_account(&data)?;
        debug!("Caller identified via token introspection");
        Some(Account {
            account,
            source: "hub-token",
            raw: data,
        })
    }

    /// Forward the caller's cookie to the who-am-I endpoint. Endpoint
    /// 401 means unauthenticated; endpoint transport failure or any
    /// other non-success is a gateway-side failure, not the caller's.
    async fn from_cookie(&self, headers: &HeaderMap) -> Result<Account> {
        let cookie = headers
            .get("cookie")
            .and_then(|v| v.to_str().ok())
            .filter(|c| !c.is_empty())
            .ok_or(CoreError::Unauthenticated)?;
        let url = self
            .auth_me_url
            .as_deref()
            .ok_or(CoreError::Unauthenticated)?;

        let response = self
            .http
            .get(url)
            .timeout(WHOAMI_TIMEOUT)
            .header("Cookie", cookie)
            .send()
            .await
            .map_err(|e| CoreError::BadGateway(format!("identity provider unreachable: {}", e)))?;

        if response.status().as_u16() == 401 {
            return Err(CoreError::Unauthenticated);
        }
        if !response.status().is_success() {
            return Err(CoreError::BadGateway(format!(
                "identity provider failed (HTTP {})",
                response.status().as_u16()
            )));
        }
        let data: Value = response
            .json()
            .await
            .map_err(|e| CoreError::BadGateway(format!("identity provider response: {}", e)))?;
        let account = extract_account(&data).ok_or(CoreError::Unauthenticated)?;
        Ok(Account {
            account,
            source: "whoami-cookie",
            raw: data,
        })
    }
}

/// `user`/`username` from a raw query string; only consulted with auth
/// disabled.
fn account_from_query(query: &str) -> Option<String> {
    for pair in query.split('&') {
        let Some((key, value)) = pair.split_once('=') else {
            continue;
        };
        if (key == "user" || key == "username") && !value.is_empty() {
            return Some(value.to_string());
        }
    }
    None
}
