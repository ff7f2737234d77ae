//! Environment-driven gateway configuration

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

const DEFAULT_BIND: &str = "0.0.0.0:32000";
const DEFAULT_PROXY_TIMEOUT_SECS: u64 = 30;
const DEFAULT_USER_HEADERS: &str =
    "x-jupyterhub-user,x-forwarded-user,x-remote-user,x-auth-request-user";

#[derive(Clone, Debug)]
pub struct GatewayConfig {
    pub bind: SocketAddr,
    /// Explicit state-file override.
    pub state_file: Option<PathBuf>,
    /// Explicit data-dir override; joined with `mappings.json`.
    pub data_dir: Option<PathBuf>,
    /// Built-in default state location, also used to seed a fallback.
    pub default_state_file: PathBuf,
    /// External who-am-I endpoint for cookie authentication.
    pub auth_me_url: Option<String>,
    /// Hub API base for bearer-token introspection.
    pub hub_api_url: Option<String>,
    pub disable_auth: bool,
    /// Whether upstream-gateway identity headers are trusted.
    pub trust_user_headers: bool,
    /// Header names checked for a trusted identity, in order.
    pub user_headers: Vec<String>,
    pub proxy_timeout: Duration,
    /// Base for the public URLs shown in mapping listings.
    pub public_base_url: Option<String>,
    pub namespace: String,
    pub label_selector: String,
}

impl GatewayConfig {
    pub fn from_env() -> Self {
        let bind = std::env::var("PORTMAP_BIND")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or_else(|| DEFAULT_BIND.parse().expect("default bind address"));

        Self {
            bind,
            state_file: std::env::var_os("PORTMAP_STATE_FILE").map(PathBuf::from),
            data_dir: std::env::var_os("PORTMAP_DATA_DIR").map(PathBuf::from),
            default_state_file: PathBuf::from("data/mappings.json"),
            auth_me_url: non_empty_var("PORTMAP_AUTH_ME_URL"),
            hub_api_url: non_empty_var("PORTMAP_HUB_API_URL"),
            disable_auth: parse_bool(std::env::var("PORTMAP_DISABLE_AUTH").ok().as_deref(), false),
            trust_user_headers: parse_bool(
                std::env::var("PORTMAP_TRUST_USER_HEADERS").ok().as_deref(),
                true,
            ),
            user_headers: parse_header_list(
                std::env::var("PORTMAP_USER_HEADERS")
                    .ok()
                    .as_deref()
                    .unwrap_or(DEFAULT_USER_HEADERS),
            ),
            proxy_timeout: Duration::from_secs(
                std::env::var("PORTMAP_PROXY_TIMEOUT")
                    .ok()
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(DEFAULT_PROXY_TIMEOUT_SECS),
            ),
            public_base_url: non_empty_var("PORTMAP_PUBLIC_BASE_URL")
                .map(|u| u.trim_end_matches('/').to_string()),
            namespace: std::env::var("PORTMAP_NAMESPACE").unwrap_or_else(|_| "jhub".to_string()),
            label_selector: std::env::var("PORTMAP_LABEL_SELECTOR")
                .unwrap_or_else(|_| "component=singleuser-server".to_string()),
        }
    }
}

fn non_empty_var(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

pub fn parse_bool(value: Option<&str>, default: bool) -> bool {
    match value {
        Some(v) => v.eq_ignore_ascii_case("true"),
        None => default,
    }
}

pub fn parse_header_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(|h| h.trim().to_lowercase())
        .filter(|h| !h.is_empty())
        .collect()
}
