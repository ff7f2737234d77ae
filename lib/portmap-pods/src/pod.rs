//! Pod snapshot model and identifier derivation
//!
//! A `PodInfo` is a transient, read-only view of one live pod, valid for
//! a single request. Identifier derivation keeps every scheme ever used
//! to name a pod in mappings: the container-id prefix is preferred for
//! new mappings, but name-derived tokens stay in the candidate list so
//! old mappings keep resolving.

use k8s_openapi::api::core::v1::Pod;
use portmap_core::owner_key;
use serde::Serialize;

/// Annotation/label keys that carry the owning account, most
/// authoritative first.
const OWNER_LABEL_KEYS: [&str; 3] = [
    "hub.jupyter.org/username",
    "hub.jupyter.org/escaped-username",
    "hub.jupyter.org/user",
];

const SERVER_NAME_LABEL: &str = "hub.jupyter.org/servername";

/// Container names whose container id is preferred for the primary
/// identifier.
const PREFERRED_CONTAINERS: [&str; 3] = ["notebook", "singleuser", "jupyterhub-singleuser"];

const IDENTIFIER_LEN: usize = 8;

/// One live pod, as seen by the gateway.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PodInfo {
    pub name: String,
    /// Owner account in display form.
    pub display_owner: String,
    /// Normalized owner comparison key.
    pub owner_key: String,
    /// Identifier candidates, most authoritative first. A mapping
    /// matches if its stored identifier equals ANY candidate.
    pub identifier_candidates: Vec<String>,
    /// Reachable pod address, if assigned.
    pub address: Option<String>,
    pub phase: Option<String>,
    pub node: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub server_name: Option<String>,
}

impl PodInfo {
    /// Build a snapshot from an orchestrator pod object.
    pub fn from_pod(pod: &Pod) -> Self {
        let metadata = &pod.metadata;
        let name = metadata.name.clone().unwrap_or_default();
        let (key, display) = extract_owner(pod, &name);
        let status = pod.status.as_ref();

        let server_name = metadata
            .labels
            .as_ref()
            .and_then(|labels| labels.get(SERVER_NAME_LABEL))
            .cloned();

        Self {
            identifier_candidates: identifier_candidates(&name, pod),
            address: status.and_then(|s| s.pod_ip.clone()),
            phase: status.and_then(|s| s.phase.clone()),
            node: pod.spec.as_ref().and_then(|s| s.node_name.clone()),
            name,
            display_owner: display,
            owner_key: key,
            server_name,
        }
    }

    /// The candidate used when presenting this pod to its owner.
    pub fn primary_identifier(&self) -> &str {
        self.identifier_candidates
            .first()
            .map(String::as_str)
            .unwrap_or("")
    }

    /// Whether any candidate matches a stored mapping identifier.
    pub fn matches_identifier(&self, pod_identifier: &str) -> bool {
        self.identifier_candidates
            .iter()
            .any(|c| c == pod_identifier)
    }
}

/// Owner account from pod metadata: annotations first, then labels, then
/// the `jupyter-<name>` pod-name convention. Returns (key, display).
fn extract_owner(pod: &Pod, pod_name: &str) -> (String, String) {
    let metadata = &pod.metadata;
    for source in [metadata.annotations.as_ref(), metadata.labels.as_ref()] {
        let Some(map) = source else { continue };
        for label_key in OWNER_LABEL_KEYS {
            if let Some(value) = map.get(label_key) {
                if !value.is_empty() {
                    return (owner_key(value), value.clone());
                }
            }
        }
    }

    if let Some(remainder) = pod_name.strip_prefix("jupyter-") {
        let remainder = remainder.strip_prefix('-').unwrap_or(remainder);
        // Named-server pods carry "---<server>" after the username.
        let remainder = remainder.split("---").next().unwrap_or(remainder);
        let cleaned = remainder.replace("--", "-");
        let cleaned = cleaned.trim_matches('-');
        if !cleaned.is_empty() {
            return (owner_key(cleaned), cleaned.to_string());
        }
    }

    ("(unknown)".to_string(), "(unknown)".to_string())
}

/// First 8 hex chars of a container id, runtime scheme stripped.
/// Preferred containers are checked before the rest.
fn container_id_prefix(pod: &Pod) -> Option<String> {
    let statuses = pod
        .status
        .as_ref()
        .and_then(|s| s.container_statuses.as_ref())?;

    let preferred = statuses.iter().filter(|c| {
        PREFERRED_CONTAINERS
            .iter()
            .any(|p| c.name.eq_ignore_ascii_case(p))
    });
    for container in preferred.chain(statuses.iter()) {
        let Some(cid) = container.container_id.as_deref() else {
            continue;
        };
        let raw = cid
            .split_once("://")
            .map(|(_, rest)| rest)
            .unwrap_or(cid)
            .trim()
            .to_lowercase();
        let hex_len = raw.chars().take_while(|c| c.is_ascii_hexdigit()).count();
        if hex_len >= IDENTIFIER_LEN {
            return Some(raw[..IDENTIFIER_LEN].to_string());
        }
    }
    None
}

/// Last 8 characters of a pod name (the trailing hex token when the
/// name carries one). Sliced on char boundaries: pod names are
/// DNS-1123 ASCII, but nothing here depends on that.
fn name_suffix(name: &str) -> String {
    let start = name
        .char_indices()
        .rev()
        .nth(IDENTIFIER_LEN - 1)
        .map(|(i, _)| i)
        .unwrap_or(0);
    name[start..].to_string()
}

/// Non-overlapping 8-hex-char tokens found anywhere in the name.
fn hex_tokens(name: &str) -> Vec<String> {
    let bytes = name.as_bytes();
    let mut tokens = Vec::new();
    let mut i = 0;
    while i < bytes.len() {
        let run_start = i;
        while i < bytes.len()
            && (bytes[i].is_ascii_digit() || (b'a'..=b'f').contains(&bytes[i]))
        {
            i += 1;
        }
        let mut pos = run_start;
        while pos + IDENTIFIER_LEN <= i {
            tokens.push(name[pos..pos + IDENTIFIER_LEN].to_string());
            pos += IDENTIFIER_LEN;
        }
        i += 1;
    }
    tokens
}

/// All identifier candidates for a pod, deduplicated, most
/// authoritative first.
pub fn identifier_candidates(name: &str, pod: &Pod) -> Vec<String> {
    let mut candidates: Vec<String> = Vec::new();
    let mut push = |token: String| {
        if !token.is_empty() && !candidates.contains(&token) {
            candidates.push(token);
        }
    };

    if let Some(prefix) = container_id_prefix(pod) {
        push(prefix);
    }
    if !name.is_empty() {
        push(name_suffix(name));
        for token in hex_tokens(name) {
            push(token);
        }
    }
    candidates
}
