//! State file persistence
//!
//! The working set, version history and tombstones are stored together as a
//! single JSON document next to a `.sha256` sidecar holding its checksum.
//! Both files are written atomically (temp file, fsync, rename).
//!
//! On load, a checksum mismatch or unknown format version is an error: a
//! damaged history must never be silently replaced by an empty one.

use crate::core::error::{Result, StateFileError};
use crate::core::firewall::MAX_RULES;
use crate::core::state::FirewallState;
use crate::utils::{create_private_dir, get_state_dir, write_private_atomic};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// Current on-disk format
pub const STATE_FORMAT_VERSION: u32 = 1;

#[derive(Serialize, Deserialize)]
struct StateFile {
    format_version: u32,
    state: FirewallState,
}

pub fn default_state_path() -> Option<PathBuf> {
    get_state_dir().map(|dir| dir.join("state.json"))
}

fn checksum_path(path: &Path) -> PathBuf {
    let mut sidecar = path.as_os_str().to_owned();
    sidecar.push(".sha256");
    PathBuf::from(sidecar)
}

/// SHA-256 (lowercase hex) of `bytes`
pub fn compute_checksum(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

/// Writes the state file and its checksum sidecar.
///
/// # Errors
///
/// Returns `Err` if serialization or any file operation fails.
pub async fn save_state(path: &Path, state: &FirewallState) -> Result<()> {
    if let Some(parent) = path.parent() {
        create_private_dir(parent)?;
    }

    let json = serde_json::to_vec_pretty(&StateFile {
        format_version: STATE_FORMAT_VERSION,
        state: state.clone(),
    })?;
    let checksum = compute_checksum(&json);

    write_private_atomic(path, &json).await?;
    write_private_atomic(&checksum_path(path), checksum.as_bytes()).await?;

    info!(
        "Saved state ({} rules, {} versions) to {}",
        state.working().len(),
        state.versions().len(),
        path.display()
    );
    Ok(())
}

/// Loads the state file, or `None` if it does not exist.
///
/// A missing sidecar is tolerated with a warning (first run after a manual
/// copy); a present but different checksum is not.
///
/// # Errors
///
/// - [`StateFileError::ChecksumMismatch`] if the sidecar disagrees
/// - [`StateFileError::VersionMismatch`] for an unknown format version
/// - [`StateFileError::Corrupted`] for unparsable or oversized content
pub async fn load_state(path: &Path) -> Result<Option<FirewallState>> {
    let bytes = match tokio::fs::read(path).await {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };

    let actual = compute_checksum(&bytes);
    match tokio::fs::read_to_string(checksum_path(path)).await {
        Ok(expected) => {
            let expected = expected.trim().to_string();
            if expected != actual {
                return Err(StateFileError::ChecksumMismatch { expected, actual }.into());
            }
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            warn!("No checksum found for {}; skipping verification", path.display());
        }
        Err(e) => return Err(e.into()),
    }

    let file: StateFile = serde_json::from_slice(&bytes)
        .map_err(|e| StateFileError::Corrupted(format!("{}: {e}", path.display())))?;

    if file.format_version != STATE_FORMAT_VERSION {
        return Err(StateFileError::VersionMismatch {
            found: file.format_version,
            expected: STATE_FORMAT_VERSION,
        }
        .into());
    }

    let mut state = file.state;
    if state.working().len() > MAX_RULES {
        return Err(StateFileError::Corrupted(format!(
            "working set has {} rules (max {MAX_RULES})",
            state.working().len()
        ))
        .into());
    }

    if state.repair() {
        warn!("Repaired inconsistent state loaded from {}", path.display());
    }

    Ok(Some(state))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::error::Error;
    use crate::core::test_helpers::ruleset;
    use crate::core::versions::VersionManager;

    fn sample_state() -> FirewallState {
        let mut state = FirewallState::new();
        state.working = ruleset(3);
        state.next_rule_id = 4;
        let vm = VersionManager::new(true);
        let v = vm
            .snapshot(&mut state, ruleset(2), "alice", "baseline")
            .unwrap();
        vm.activate(&mut state, v.id).unwrap();
        state
    }

    #[tokio::test]
    async fn test_missing_file_is_none() {
        let dir = tempfile::tempdir().unwrap();
        assert!(load_state(&dir.path().join("state.json")).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        let state = sample_state();

        save_state(&path, &state).await.unwrap();
        let loaded = load_state(&path).await.unwrap().unwrap();

        assert_eq!(loaded.working(), state.working());
        assert_eq!(loaded.versions(), state.versions());
        assert_eq!(loaded.next_rule_id, 4);
        assert_eq!(
            loaded.active_version().unwrap().hash,
            loaded.active_version().unwrap().rules.content_hash()
        );
    }

    #[tokio::test]
    async fn test_tampered_file_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        save_state(&path, &sample_state()).await.unwrap();

        let mut content = std::fs::read_to_string(&path).unwrap();
        content = content.replace("alice", "mallory");
        std::fs::write(&path, content).unwrap();

        assert!(matches!(
            load_state(&path).await,
            Err(Error::StateFile(StateFileError::ChecksumMismatch { .. }))
        ));
    }

    #[tokio::test]
    async fn test_missing_sidecar_tolerated() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        save_state(&path, &sample_state()).await.unwrap();
        std::fs::remove_file(checksum_path(&path)).unwrap();

        assert!(load_state(&path).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_unknown_format_version() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        let json = serde_json::json!({
            "format_version": 99,
            "state": serde_json::to_value(FirewallState::new()).unwrap(),
        })
        .to_string();
        std::fs::write(&path, json).unwrap();

        assert!(matches!(
            load_state(&path).await,
            Err(Error::StateFile(StateFileError::VersionMismatch { found: 99, .. }))
        ));
    }

    #[tokio::test]
    async fn test_garbage_is_corrupted() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        std::fs::write(&path, "{]").unwrap();

        assert!(matches!(
            load_state(&path).await,
            Err(Error::StateFile(StateFileError::Corrupted(_)))
        ));
    }
}
