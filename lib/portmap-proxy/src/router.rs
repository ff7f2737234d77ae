//! Proxy routing: from (identifier, path) to a forwarded upstream call
//!
//! The proxy surface is identifier-first: the caller presents no
//! credentials. Ownership is established by the stored mapping's owner
//! key plus confirmation that the same owner still has a live pod with
//! that identifier.

use std::sync::Arc;

use hyper::body::{Body, Bytes};
use hyper::{Request, Response};
use tracing::debug;

use portmap_core::{normalize_endpoint, CoreError, Mapping, MappingStore, Result};
use portmap_pods::PodResolver;

use crate::forwarder::RequestForwarder;

/// Longest-endpoint-prefix match over one identifier's mappings.
///
/// Candidates are tried in endpoint-length-descending order so `/api/v2`
/// beats `/api` for `/api/v2/users`; a match is an exact path or a
/// segment-boundary prefix. Returns the mapping and the remainder path
/// forwarded upstream (`/` when the match is exact).
pub fn match_endpoint<'a>(
    mappings: &'a [Mapping],
    full_path: &str,
) -> Option<(&'a Mapping, String)> {
    let mut candidates: Vec<&Mapping> = mappings.iter().collect();
    candidates.sort_by(|a, b| b.endpoint.len().cmp(&a.endpoint.len()));

    for mapping in candidates {
        let endpoint = mapping.endpoint.as_str();
        let boundary_prefix =
            full_path.starts_with(endpoint) && full_path[endpoint.len()..].starts_with('/');
        if full_path == endpoint || boundary_prefix {
            let remainder = &full_path[endpoint.len()..];
            let remainder = if remainder.is_empty() { "/" } else { remainder };
            return Some((mapping, remainder.to_string()));
        }
    }
    None
}

/// Routes proxy requests: mapping lookup, live-pod resolution,
/// forwarding. Holds no lock; concurrent requests proceed in parallel.
pub struct ProxyRouter {
    store: Arc<MappingStore>,
    resolver: Arc<dyn PodResolver>,
    forwarder: RequestForwarder,
}

impl ProxyRouter {
    pub fn new(
        store: Arc<MappingStore>,
        resolver: Arc<dyn PodResolver>,
        forwarder: RequestForwarder,
    ) -> Self {
        Self {
            store,
            resolver,
            forwarder,
        }
    }

    /// Resolve and forward one proxy request.
    ///
    /// `rest_path` is the request path with the `/{identifier}` prefix
    /// already stripped; the original query string is carried over from
    /// the request URI unchanged.
    pub async fn route<B>(
        &self,
        pod_identifier: &str,
        rest_path: &str,
        request: Request<B>,
    ) -> Result<Response<Bytes>>
    where
        B: Body + Send,
        B::Data: Send,
        B::Error: std::fmt::Display,
    {
        let mappings = self.store.list_for_identifier(pod_identifier).await;
        if mappings.is_empty() {
            return Err(CoreError::NotFound(format!(
                "no mapping registered for identifier {}",
                pod_identifier
            )));
        }

        let full_path = normalize_endpoint(rest_path);
        let Some((mapping, remainder)) = match_endpoint(&mappings, &full_path) else {
            return Err(CoreError::NotFound(format!(
                "no endpoint matches path {} for identifier {}",
                full_path, pod_identifier
            )));
        };
        debug!(
            "Matched endpoint {} for {}, forwarding {}",
            mapping.endpoint, pod_identifier, remainder
        );

        let pod = self
            .resolver
            .find_pod(&mapping.owner_key, pod_identifier)
            .await?;
        let address = pod.and_then(|p| p.address).ok_or_else(|| {
            CoreError::ServiceUnavailable(format!(
                "target pod not ready or does not exist: {}",
                pod_identifier
            ))
        })?;

        let mut target = format!("http://{}:{}{}", address, mapping.port, remainder);
        if let Some(query) = request.uri().query() {
            target.push('?');
            target.push_str(query);
        }

        self.forwarder.forward(&target, request).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use http_body_util::Full;
    use hyper::server::conn::http1;
    use hyper::service::service_fn;
    use hyper_util::rt::tokio::TokioIo;
    use portmap_core::StorePaths;
    use portmap_pods::PodInfo;
    use std::time::Duration;
    use tempfile::tempdir;
    use tokio::net::TcpListener;

    struct StaticResolver {
        pods: Vec<PodInfo>,
    }

    #[async_trait]
    impl PodResolver for StaticResolver {
        async fn list_pods(&self, owner_key: &str) -> Result<Vec<PodInfo>> {
            Ok(self
                .pods
                .iter()
                .filter(|p| p.owner_key == owner_key)
                .cloned()
                .collect())
        }
    }

    fn pod(owner_key: &str, identifier: &str, address: Option<&str>) -> PodInfo {
        PodInfo {
            name: format!("jupyter-{}-{}", owner_key, identifier),
            display_owner: owner_key.to_string(),
            owner_key: owner_key.to_string(),
            identifier_candidates: vec![identifier.to_string()],
            address: address.map(|a| a.to_string()),
            phase: Some("Running".to_string()),
            node: None,
            server_name: None,
        }
    }

    async fn store_with(entries: &[(&str, &str, &str, u16)]) -> (Arc<MappingStore>, tempfile::TempDir) {
        let dir = tempdir().unwrap();
        let file = dir.path().join("mappings.json");
        let (store, _) = MappingStore::open(&StorePaths {
            state_file: file.clone(),
            default_state_file: file,
        });
        for (owner, identifier, endpoint, port) in entries {
            store
                .upsert(owner, identifier, endpoint, *port, None)
                .await
                .unwrap();
        }
        (Arc::new(store), dir)
    }

    fn router(store: Arc<MappingStore>, pods: Vec<PodInfo>) -> ProxyRouter {
        ProxyRouter::new(
            store,
            Arc::new(StaticResolver { pods }),
            RequestForwarder::new(Duration::from_secs(2)),
        )
    }

    fn empty_request(path_and_query: &str) -> Request<Full<Bytes>> {
        Request::builder()
            .uri(path_and_query)
            .body(Full::new(Bytes::new()))
            .unwrap()
    }

    /// Upstream that echoes the requested path+query and marks its
    /// responses with `x-upstream`.
    async fn spawn_echo_upstream() -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    break;
                };
                tokio::spawn(async move {
                    let service = service_fn(|req: Request<hyper::body::Incoming>| async move {
                        let seen = format!(
                            "{}|host={}|connection={}",
                            req.uri(),
                            req.headers().contains_key("host"),
                            req.headers().contains_key("connection"),
                        );
                        let response = Response::builder()
                            .header("x-upstream", "yes")
                            .header("proxy-authenticate", "Basic")
                            .body(Full::new(Bytes::from(seen)))
                            .unwrap();
                        Ok::<_, std::convert::Infallible>(response)
                    });
                    let _ = http1::Builder::new()
                        .serve_connection(TokioIo::new(stream), service)
                        .await;
                });
            }
        });
        port
    }

    fn mapping(endpoint: &str, port: u16) -> Mapping {
        Mapping {
            owner: "alice".to_string(),
            owner_key: "alice".to_string(),
            pod_identifier: "abcd1234".to_string(),
            endpoint: endpoint.to_string(),
            port,
            note: None,
            created_at: chrono::Utc::now(),
            updated_at: chrono::Utc::now(),
        }
    }

    #[test]
    fn test_longest_prefix_wins() {
        let mappings = vec![mapping("/api", 8000), mapping("/api/v2", 9000)];

        let (matched, remainder) = match_endpoint(&mappings, "/api/v2/users").unwrap();
        assert_eq!(matched.port, 9000);
        assert_eq!(remainder, "/users");

        let (matched, remainder) = match_endpoint(&mappings, "/api/status").unwrap();
        assert_eq!(matched.port, 8000);
        assert_eq!(remainder, "/status");
    }

    #[test]
    fn test_exact_match_remainder_defaults_to_root() {
        let mappings = vec![mapping("/api", 8000)];
        let (_, remainder) = match_endpoint(&mappings, "/api").unwrap();
        assert_eq!(remainder, "/");
    }

    #[test]
    fn test_prefix_requires_segment_boundary() {
        let mappings = vec![mapping("/api", 8000)];
        assert!(match_endpoint(&mappings, "/apiary").is_none());
        assert!(match_endpoint(&mappings, "/ap").is_none());
    }

    #[tokio::test]
    async fn test_route_without_mapping_is_not_found() {
        let (store, _dir) = store_with(&[]).await;
        let router = router(store, vec![pod("alice", "abcd1234", Some("127.0.0.1"))]);
        let err = router
            .route("abcd1234", "/nb", empty_request("/abcd1234/nb"))
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_route_without_matching_endpoint_is_not_found() {
        let (store, _dir) = store_with(&[("alice", "abcd1234", "/nb", 8888)]).await;
        let router = router(store, vec![pod("alice", "abcd1234", Some("127.0.0.1"))]);
        let err = router
            .route("abcd1234", "/other", empty_request("/abcd1234/other"))
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_route_stale_mapping_is_service_unavailable() {
        let (store, _dir) = store_with(&[("alice", "abcd1234", "/nb", 8888)]).await;

        // Pod gone entirely.
        let router_missing = router(store.clone(), vec![]);
        let err = router_missing
            .route("abcd1234", "/nb", empty_request("/abcd1234/nb"))
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::ServiceUnavailable(_)));

        // Pod present but no address yet.
        let router_pending = router(store, vec![pod("alice", "abcd1234", None)]);
        let err = router_pending
            .route("abcd1234", "/nb", empty_request("/abcd1234/nb"))
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::ServiceUnavailable(_)));
    }

    #[tokio::test]
    async fn test_route_inventory_failure_is_surfaced() {
        struct FailingResolver;
        #[async_trait]
        impl PodResolver for FailingResolver {
            async fn list_pods(&self, _owner_key: &str) -> Result<Vec<PodInfo>> {
                Err(CoreError::PodInventory("query failed".to_string()))
            }
        }

        let (store, _dir) = store_with(&[("alice", "abcd1234", "/nb", 8888)]).await;
        let router = ProxyRouter::new(
            store,
            Arc::new(FailingResolver),
            RequestForwarder::new(Duration::from_secs(2)),
        );
        let err = router
            .route("abcd1234", "/nb", empty_request("/abcd1234/nb"))
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::PodInventory(_)));
    }

    #[tokio::test]
    async fn test_route_forwards_remainder_and_query() {
        let upstream_port = spawn_echo_upstream().await;
        let (store, _dir) = store_with(&[("alice", "abcd1234", "/notebook", upstream_port)]).await;
        let router = router(store, vec![pod("alice", "abcd1234", Some("127.0.0.1"))]);

        let request = Request::builder()
            .uri("/abcd1234/notebook/tree?x=1")
            .header("host", "gateway.example")
            .header("connection", "keep-alive")
            .body(Full::new(Bytes::new()))
            .unwrap();
        let response = router
            .route("abcd1234", "/notebook/tree", request)
            .await
            .unwrap();

        assert_eq!(response.status(), 200);
        // Upstream saw the path relative to its own root; the original
        // Host and Connection headers never reached it. hyper sets a
        // fresh Host for the upstream connection itself.
        let body = String::from_utf8(response.body().to_vec()).unwrap();
        assert!(body.starts_with("/tree?x=1|"), "body: {}", body);
        assert!(body.contains("connection=false"));
        // Response side: marker kept, hop-by-hop stripped.
        assert!(response.headers().contains_key("x-upstream"));
        assert!(!response.headers().contains_key("proxy-authenticate"));
    }

    #[tokio::test]
    async fn test_route_exact_endpoint_forwards_root() {
        let upstream_port = spawn_echo_upstream().await;
        let (store, _dir) = store_with(&[("alice", "abcd1234", "/notebook", upstream_port)]).await;
        let router = router(store, vec![pod("alice", "abcd1234", Some("127.0.0.1"))]);

        let response = router
            .route("abcd1234", "/notebook", empty_request("/abcd1234/notebook"))
            .await
            .unwrap();
        let body = String::from_utf8(response.body().to_vec()).unwrap();
        assert!(body.starts_with("/|"), "body: {}", body);
    }

    #[tokio::test]
    async fn test_route_matches_secondary_identifier_candidate() {
        let upstream_port = spawn_echo_upstream().await;
        // Mapping stored under the old name-derived token; the pod now
        // reports a container-id candidate first.
        let (store, _dir) = store_with(&[("alice", "deadbeef", "/nb", upstream_port)]).await;
        let mut stale_pod = pod("alice", "01234567", Some("127.0.0.1"));
        stale_pod.identifier_candidates.push("deadbeef".to_string());
        let router = router(store, vec![stale_pod]);

        let response = router
            .route("deadbeef", "/nb/x", empty_request("/deadbeef/nb/x"))
            .await
            .unwrap();
        assert_eq!(response.status(), 200);
    }
}
