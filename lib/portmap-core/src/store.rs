//! Durable mapping store
//!
//! One JSON document on disk, one owned in-memory copy guarded by an
//! async RwLock. Mutations hold the write lock across the whole
//! read-modify-write-persist sequence; the document is written to a
//! temp file and renamed into place so a crash mid-write leaves the
//! previous state intact.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::Utc;
use tokio::sync::RwLock;
use tracing::{debug, warn};

use crate::endpoint::normalize_endpoint;
use crate::error::{CoreError, Result};
use crate::identity::owner_key;
use crate::mapping::{Mapping, MappingDocument};

const STATE_FILE_NAME: &str = "mappings.json";

/// Resolved storage locations for a store.
#[derive(Clone, Debug)]
pub struct StorePaths {
    /// The file the store reads and writes.
    pub state_file: PathBuf,
    /// The built-in default location, used to seed a fallback once.
    pub default_state_file: PathBuf,
}

impl StorePaths {
    /// Pick the state file at startup: explicit file, explicit data dir,
    /// or the default; fall back to a writable temp/home location when
    /// the candidate is not writable.
    pub fn select(
        explicit_file: Option<PathBuf>,
        explicit_dir: Option<PathBuf>,
        default_state_file: PathBuf,
    ) -> Self {
        let candidate = explicit_file
            .or_else(|| explicit_dir.map(|d| d.join(STATE_FILE_NAME)))
            .unwrap_or_else(|| default_state_file.clone());

        let usable = if candidate.exists() {
            is_writable_file(&candidate)
        } else {
            candidate.parent().map(is_writable_dir).unwrap_or(false)
        };
        if usable {
            return Self {
                state_file: candidate,
                default_state_file,
            };
        }

        let mut alternates = vec![std::env::temp_dir().join("portmap")];
        if let Some(home) = std::env::var_os("HOME") {
            alternates.push(PathBuf::from(home).join(".portmap"));
        }
        for alt in alternates {
            if is_writable_dir(&alt) {
                warn!(
                    "State location {} not writable, falling back to {}",
                    candidate.display(),
                    alt.display()
                );
                return Self {
                    state_file: alt.join(STATE_FILE_NAME),
                    default_state_file,
                };
            }
        }

        // Nothing writable found; keep the candidate and let writes fail
        // with a real I/O error.
        Self {
            state_file: candidate,
            default_state_file,
        }
    }
}

fn is_writable_dir(path: &Path) -> bool {
    if fs::create_dir_all(path).is_err() {
        return false;
    }
    let probe = path.join(".portmap-write-probe");
    match fs::OpenOptions::new().write(true).create(true).open(&probe) {
        Ok(_) => {
            let _ = fs::remove_file(&probe);
            true
        }
        Err(_) => false,
    }
}

fn is_writable_file(path: &Path) -> bool {
    fs::OpenOptions::new().append(true).open(path).is_ok()
}

/// How the initial load went. Lets callers (and tests) tell "empty
/// because no data" apart from "empty because the file was unreadable".
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LoadOutcome {
    /// State file read and parsed; carries the record count.
    Loaded(usize),
    /// No state file; starting with an empty document.
    Missing,
    /// Fallback location seeded from the default-location file.
    SeededFromDefault(usize),
    /// State file present but unreadable or malformed; degraded to an
    /// empty document so the service stays available.
    Corrupt,
}

/// Owned, process-wide mapping registry backed by one JSON file.
pub struct MappingStore {
    state_file: PathBuf,
    state: RwLock<MappingDocument>,
}

impl MappingStore {
    /// Load (or seed) the document at the selected path and construct
    /// the store around it.
    pub fn open(paths: &StorePaths) -> (Self, LoadOutcome) {
        let (doc, outcome) = Self::load(paths);
        debug!(
            "Mapping store opened at {} ({} entries)",
            paths.state_file.display(),
            doc.entries.len()
        );
        (
            Self {
                state_file: paths.state_file.clone(),
                state: RwLock::new(doc),
            },
            outcome,
        )
    }

    fn load(paths: &StorePaths) -> (MappingDocument, LoadOutcome) {
        if !paths.state_file.exists() {
            // Fell back to an alternate location: carry the default
            // file's records over once so existing mappings survive.
            if paths.state_file != paths.default_state_file && paths.default_state_file.exists() {
                if let Some(doc) = read_document(&paths.default_state_file) {
                    let count = doc.entries.len();
                    if let Err(e) = persist(&paths.state_file, &doc) {
                        warn!("Could not seed fallback state file: {}", e);
                        return (doc, LoadOutcome::SeededFromDefault(count));
                    }
                    return (doc, LoadOutcome::SeededFromDefault(count));
                }
            }
            return (MappingDocument::empty(), LoadOutcome::Missing);
        }

        match read_document(&paths.state_file) {
            Some(doc) => {
                let count = doc.entries.len();
                (doc, LoadOutcome::Loaded(count))
            }
            None => {
                warn!(
                    "State file {} unreadable or malformed, starting empty",
                    paths.state_file.display()
                );
                (MappingDocument::empty(), LoadOutcome::Corrupt)
            }
        }
    }

    /// Path of the live state file.
    pub fn state_file(&self) -> &Path {
        &self.state_file
    }

    /// Insert or update the record for (owner, identifier, endpoint).
    ///
    /// A colliding triple updates `port`/`note`/`updated_at` in place and
    /// keeps the original `created_at`. The whole read-modify-write-persist
    /// runs under the write lock.
    pub async fn upsert(
        &self,
        owner: &str,
        pod_identifier: &str,
        endpoint: &str,
        port: u16,
        note: Option<String>,
    ) -> Result<Mapping> {
        if port == 0 {
            return Err(CoreError::InvalidArgument(
                "port must be between 1 and 65535".to_string(),
            ));
        }
        let key = owner_key(owner);
        let endpoint = normalize_endpoint(endpoint);
        let pod_identifier = pod_identifier.trim().to_string();
        let now = Utc::now();

        let mut state = self.state.write().await;
        let found = state
            .entries
            .iter()
            .position(|e| e.matches(&key, &pod_identifier, &endpoint));
        let entry = match found {
            Some(index) => {
                let existing = &mut state.entries[index];
                existing.port = port;
                existing.note = note;
                existing.updated_at = now;
                existing.clone()
            }
            None => {
                let mapping = Mapping {
                    owner: owner.to_string(),
                    owner_key: key,
                    pod_identifier,
                    endpoint,
                    port,
                    note,
                    created_at: now,
                    updated_at: now,
                };
                state.entries.push(mapping.clone());
                mapping
            }
        };
        persist(&self.state_file, &state)?;
        Ok(entry)
    }

    /// Remove the matching record. Returns false (and writes nothing)
    /// when no record matches.
    pub async fn delete(&self, owner_key: &str, pod_identifier: &str, endpoint: &str) -> Result<bool> {
        let endpoint = normalize_endpoint(endpoint);
        let pod_identifier = pod_identifier.trim();

        let mut state = self.state.write().await;
        let before = state.entries.len();
        state
            .entries
            .retain(|e| !e.matches(owner_key, pod_identifier, &endpoint));
        if state.entries.len() == before {
            return Ok(false);
        }
        persist(&self.state_file, &state)?;
        Ok(true)
    }

    /// All records belonging to an owner.
    pub async fn list_for_owner(&self, owner_key: &str) -> Vec<Mapping> {
        let state = self.state.read().await;
        state
            .entries
            .iter()
            .filter(|e| e.owner_key == owner_key)
            .cloned()
            .collect()
    }

    /// All records (across owners) for a pod identifier. The proxy path
    /// starts here: it knows the identifier but not yet the owner.
    pub async fn list_for_identifier(&self, pod_identifier: &str) -> Vec<Mapping> {
        let state = self.state.read().await;
        state
            .entries
            .iter()
            .filter(|e| e.pod_identifier == pod_identifier)
            .cloned()
            .collect()
    }
}

fn read_document(path: &Path) -> Option<MappingDocument> {
    let raw = fs::read_to_string(path).ok()?;
    let mut doc: MappingDocument = serde_json::from_str(&raw).ok()?;
    for entry in &mut doc.entries {
        entry.backfill();
    }
    Some(doc)
}

/// Write the full document to `<file>.tmp`, then rename over the live
/// file. The prior valid file stays readable until the rename lands.
fn persist(state_file: &Path, doc: &MappingDocument) -> Result<()> {
    if let Some(parent) = state_file.parent() {
        fs::create_dir_all(parent)?;
    }
    let tmp = state_file.with_extension("tmp");
    let serialized = serde_json::to_string_pretty(doc)?;
    {
        let mut file = fs::File::create(&tmp)?;
        file.write_all(serialized.as_bytes())?;
    }
    fs::rename(&tmp, state_file)?;
    Ok(())
}
