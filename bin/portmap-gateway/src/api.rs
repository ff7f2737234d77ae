//! HTTP surface: mapping CRUD under `/api`, proxying everywhere else
//!
//! Every handler funnels through [`Gateway::handle`], which converts the
//! error taxonomy into JSON responses and turns anything unexpected into
//! a generic 500, so a single request can never take the serving task
//! down.

use std::collections::HashMap;
use std::sync::Arc;

use http_body_util::{BodyExt, Full};
use hyper::body::{Bytes, Incoming};
use hyper::{Method, Request, Response, StatusCode};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use portmap_core::{normalize_endpoint, owner_key, CoreError, Mapping, MappingStore, Result};
use portmap_pods::{PodInfo, PodResolver};
use portmap_proxy::ProxyRouter;

use crate::identity::IdentityResolver;

const MAX_NOTE_LEN: usize = 200;
const MIN_IDENTIFIER_LEN: usize = 4;
const MAX_IDENTIFIER_LEN: usize = 64;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MappingRequest {
    pub pod_identifier: String,
    pub endpoint: String,
    pub port: u16,
    #[serde(default)]
    pub note: Option<String>,
}

/// A mapping joined with the live status of its target pod.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EnrichedMapping {
    #[serde(flatten)]
    pub mapping: Mapping,
    pub pod_name: Option<String>,
    pub pod_ip: Option<String>,
    pub pod_phase: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub server_name: Option<String>,
    /// Public URL this mapping is reachable under.
    pub url: String,
}

#[derive(Debug, Serialize)]
pub struct MappingListResponse {
    pub items: Vec<EnrichedMapping>,
    pub pods: Vec<PodInfo>,
}

pub struct Gateway {
    store: Arc<MappingStore>,
    resolver: Arc<dyn PodResolver>,
    router: ProxyRouter,
    identity: IdentityResolver,
    public_base_url: Option<String>,
}

impl Gateway {
    pub fn new(
        store: Arc<MappingStore>,
        resolver: Arc<dyn PodResolver>,
        router: ProxyRouter,
        identity: IdentityResolver,
        public_base_url: Option<String>,
    ) -> Self {
        Self {
            store,
            resolver,
            router,
            identity,
            public_base_url,
        }
    }

    /// Handle one request. Infallible: every error becomes a response.
    pub async fn handle(&self, req: Request<Incoming>) -> Response<Full<Bytes>> {
        let method = req.method().clone();
        let path = req.uri().path().to_string();
        debug!("{} {}", method, path);

        match self.dispatch(req).await {
            Ok(response) => response,
            Err(e) => {
                let status = e.status_code();
                if status >= 500 {
                    warn!("{} {} failed: {}", method, path, e);
                }
                match e {
                    CoreError::Io(_) | CoreError::Serialization(_) | CoreError::Internal(_) => {
                        json_error(StatusCode::INTERNAL_SERVER_ERROR, "internal error")
                    }
                    other => json_error(
                        StatusCode::from_u16(status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR),
                        &other.to_string(),
                    ),
                }
            }
        }
    }

    async fn dispatch(&self, req: Request<Incoming>) -> Result<Response<Full<Bytes>>> {
        let method = req.method().clone();
        let path = req.uri().path().to_string();

        if method == Method::GET && (path == "/healthz" || path == "/") {
            return json_ok(&serde_json::json!({"ok": true, "service": "portmap-gateway"}));
        }

        if path == "/api" || path.starts_with("/api/") {
            return self.dispatch_api(&method, &path, req).await;
        }

        self.dispatch_proxy(&method, &path, req).await
    }

    async fn dispatch_api(
        &self,
        method: &Method,
        path: &str,
        req: Request<Incoming>,
    ) -> Result<Response<Full<Bytes>>> {
        let account = self
            .identity
            .resolve(req.headers(), req.uri().query())
            .await?;
        let key = owner_key(&account.account);

        match (method, path) {
            (&Method::GET, "/api/me") => json_ok(&serde_json::json!({
                "account": account.account,
                "source": account.source,
                "raw": account.raw,
            })),
            (&Method::GET, "/api/pods") => {
                let pods = self.resolver.list_pods(&key).await?;
                json_ok(&serde_json::json!({ "items": pods }))
            }
            (&Method::GET, "/api/mappings") => {
                let base = self.base_url(&req);
                let pods = self.resolver.list_pods(&key).await?;
                let items = self
                    .store
                    .list_for_owner(&key)
                    .await
                    .into_iter()
                    .map(|m| enrich(m, &pods, &base))
                    .collect();
                json_ok(&MappingListResponse { items, pods })
            }
            (&Method::POST, "/api/mappings") => {
                let base = self.base_url(&req);
                let body = read_json_body::<MappingRequest>(req).await?;
                validate_mapping_request(&body)?;

                let pod = self
                    .resolver
                    .find_pod(&key, body.pod_identifier.trim())
                    .await?
                    .ok_or_else(|| {
                        CoreError::NotFound(
                            "pod not found or not owned by this account".to_string(),
                        )
                    })?;

                let mapping = self
                    .store
                    .upsert(
                        &account.account,
                        body.pod_identifier.trim(),
                        &body.endpoint,
                        body.port,
                        body.note,
                    )
                    .await?;
                json_ok(&enrich(mapping, &[pod], &base))
            }
            (&Method::DELETE, _) => {
                let Some((identifier, endpoint)) = parse_delete_path(path) else {
                    return Err(CoreError::NotFound(format!("no such API route: {}", path)));
                };
                if !self.store.delete(&key, &identifier, &endpoint).await? {
                    return Err(CoreError::NotFound("no matching mapping".to_string()));
                }
                json_ok(&serde_json::json!({"ok": true}))
            }
            _ => Err(CoreError::NotFound(format!("no such API route: {}", path))),
        }
    }

    async fn dispatch_proxy(
        &self,
        method: &Method,
        path: &str,
        req: Request<Incoming>,
    ) -> Result<Response<Full<Bytes>>> {
        const PROXY_METHODS: [Method; 7] = [
            Method::GET,
            Method::POST,
            Method::PUT,
            Method::PATCH,
            Method::DELETE,
            Method::OPTIONS,
            Method::HEAD,
        ];
        if !PROXY_METHODS.contains(method) {
            return Err(CoreError::InvalidArgument(format!(
                "method {} not supported on proxy paths",
                method
            )));
        }

        let Some((identifier, rest)) = split_proxy_path(path) else {
            return Err(CoreError::NotFound("no mapping identifier in path".to_string()));
        };

        let response = self.router.route(&identifier, &rest, req).await?;
        let (parts, body) = response.into_parts();
        Ok(Response::from_parts(parts, Full::new(body)))
    }

    /// Base for public mapping URLs: configured value, else derived from
    /// the request's Host header.
    fn base_url(&self, req: &Request<Incoming>) -> String {
        if let Some(base) = &self.public_base_url {
            return base.clone();
        }
        let host = req
            .headers()
            .get("host")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("localhost");
        format!("http://{}", host)
    }
}

fn enrich(mapping: Mapping, pods: &[PodInfo], base: &str) -> EnrichedMapping {
    let by_identifier: HashMap<&str, &PodInfo> = pods
        .iter()
        .flat_map(|p| {
            p.identifier_candidates
                .iter()
                .map(move |c| (c.as_str(), p))
        })
        .collect();
    let pod = by_identifier.get(mapping.pod_identifier.as_str());
    let url = format!("{}/{}{}", base, mapping.pod_identifier, mapping.endpoint);
    EnrichedMapping {
        pod_name: pod.map(|p| p.name.clone()),
        pod_ip: pod.and_then(|p| p.address.clone()),
        pod_phase: pod.and_then(|p| p.phase.clone()),
        server_name: pod.and_then(|p| p.server_name.clone()),
        url,
        mapping,
    }
}

fn validate_mapping_request(body: &MappingRequest) -> Result<()> {
    let identifier = body.pod_identifier.trim();
    if identifier.len() < MIN_IDENTIFIER_LEN || identifier.len() > MAX_IDENTIFIER_LEN {
        return Err(CoreError::InvalidArgument(format!(
            "pod identifier must be {}-{} characters",
            MIN_IDENTIFIER_LEN, MAX_IDENTIFIER_LEN
        )));
    }
    if body.endpoint.trim().is_empty() {
        return Err(CoreError::InvalidArgument("endpoint is required".to_string()));
    }
    if body.port == 0 {
        return Err(CoreError::InvalidArgument(
            "port must be between 1 and 65535".to_string(),
        ));
    }
    if let Some(note) = &body.note {
        if note.len() > MAX_NOTE_LEN {
            return Err(CoreError::InvalidArgument(format!(
                "note must be at most {} characters",
                MAX_NOTE_LEN
            )));
        }
    }
    Ok(())
}

/// `/api/mappings/{identifier}/{endpoint...}` → (identifier, endpoint).
fn parse_delete_path(path: &str) -> Option<(String, String)> {
    let rest = path.strip_prefix("/api/mappings/")?;
    if rest.is_empty() {
        return None;
    }
    match rest.split_once('/') {
        Some((identifier, endpoint)) if !identifier.is_empty() => Some((
            identifier.to_string(),
            normalize_endpoint(endpoint),
        )),
        Some(_) => None,
        None => Some((rest.to_string(), "/".to_string())),
    }
}

/// `/{identifier}/{path...}` → (identifier, rest path starting with `/`).
fn split_proxy_path(path: &str) -> Option<(String, String)> {
    let rest = path.strip_prefix('/')?;
    if rest.is_empty() {
        return None;
    }
    match rest.split_once('/') {
        Some((identifier, tail)) if !identifier.is_empty() => {
            Some((identifier.to_string(), format!("/{}", tail)))
        }
        Some(_) => None,
        None => Some((rest.to_string(), "/".to_string())),
    }
}

fn json_ok<T: Serialize>(value: &T) -> Result<Response<Full<Bytes>>> {
    let body = serde_json::to_vec(value)?;
    Ok(Response::builder()
        .status(StatusCode::OK)
        .header("content-type", "application/json")
        .body(Full::new(Bytes::from(body)))
        .unwrap())
}

fn json_error(status: StatusCode, detail: &str) -> Response<Full<Bytes>> {
    let body = serde_json::json!({ "detail": detail }).to_string();
    Response::builder()
        .status(status)
        .header("content-type", "application/json")
        .body(Full::new(Bytes::from(body)))
        .unwrap()
}

async fn read_json_body<T: serde::de::DeserializeOwned>(req: Request<Incoming>) -> Result<T> {
    let bytes = req
        .into_body()
        .collect()
        .await
        .map_err(|e| CoreError::InvalidArgument(format!("failed to read body: {}", e)))?
        .to_bytes();
    serde_json::from_slice(&bytes)
        .map_err(|e| CoreError::InvalidArgument(format!("invalid request body: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(identifier: &str, endpoint: &str, port: u16, note: Option<&str>) -> MappingRequest {
        MappingRequest {
            pod_identifier: identifier.to_string(),
            endpoint: endpoint.to_string(),
            port,
            note: note.map(|n| n.to_string()),
        }
    }

    #[test]
    fn test_validate_bounds() {
        assert!(validate_mapping_request(&request("abcd1234", "/nb", 8888, None)).is_ok());
        assert!(validate_mapping_request(&request("abc", "/nb", 8888, None)).is_err());
        assert!(validate_mapping_request(&request(&"a".repeat(65), "/nb", 8888, None)).is_err());
        assert!(validate_mapping_request(&request("abcd1234", "  ", 8888, None)).is_err());
        assert!(validate_mapping_request(&request("abcd1234", "/nb", 0, None)).is_err());
        assert!(
            validate_mapping_request(&request("abcd1234", "/nb", 80, Some(&"x".repeat(201))))
                .is_err()
        );
    }

    #[test]
    fn test_parse_delete_path() {
        assert_eq!(
            parse_delete_path("/api/mappings/abcd1234/notebook/tree"),
            Some(("abcd1234".to_string(), "/notebook/tree".to_string()))
        );
        assert_eq!(
            parse_delete_path("/api/mappings/abcd1234"),
            Some(("abcd1234".to_string(), "/".to_string()))
        );
        assert_eq!(parse_delete_path("/api/mappings/"), None);
        assert_eq!(parse_delete_path("/api/pods"), None);
    }

    #[test]
    fn test_split_proxy_path() {
        assert_eq!(
            split_proxy_path("/abcd1234/notebook/tree"),
            Some(("abcd1234".to_string(), "/notebook/tree".to_string()))
        );
        assert_eq!(
            split_proxy_path("/abcd1234"),
            Some(("abcd1234".to_string(), "/".to_string()))
        );
        assert_eq!(
            split_proxy_path("/abcd1234/"),
            Some(("abcd1234".to_string(), "/".to_string()))
        );
        assert_eq!(split_proxy_path("/"), None);
    }

    #[test]
    fn test_enrich_matches_any_candidate() {
        let mapping = Mapping {
            owner: "alice".to_string(),
            owner_key: "alice".to_string(),
            pod_identifier: "deadbeef".to_string(),
            endpoint: "/nb".to_string(),
            port: 8888,
            note: None,
            created_at: chrono::Utc::now(),
            updated_at: chrono::Utc::now(),
        };
        let pod = PodInfo {
            name: "jupyter-alice-deadbeef".to_string(),
            display_owner: "alice".to_string(),
            owner_key: "alice".to_string(),
            identifier_candidates: vec!["01234567".to_string(), "deadbeef".to_string()],
            address: Some("10.0.0.1".to_string()),
            phase: Some("Running".to_string()),
            node: None,
            server_name: None,
        };
        let enriched = enrich(mapping, &[pod], "https://gw.example");
        assert_eq!(enriched.pod_ip.as_deref(), Some("10.0.0.1"));
        assert_eq!(enriched.url, "https://gw.example/deadbeef/nb");
    }

    #[test]
    fn test_enrich_without_live_pod() {
        let mapping = Mapping {
            owner: "alice".to_string(),
            owner_key: "alice".to_string(),
            pod_identifier: "deadbeef".to_string(),
            endpoint: "/nb".to_string(),
            port: 8888,
            note: None,
            created_at: chrono::Utc::now(),
            updated_at: chrono::Utc::now(),
        };
        let enriched = enrich(mapping, &[], "https://gw.example");
        assert!(enriched.pod_name.is_none());
        assert!(enriched.pod_phase.is_none());
    }
}
