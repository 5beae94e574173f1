//! Utility functions for directory management and file persistence
//!
//! This module provides helper functions following the XDG Base Directory specification
//! for portable configuration and data storage across Linux distributions.
//!
//! # Directory Structure
//!
//! - Config: `~/.config/fwvault/` - Engine configuration (`config.json`)
//! - State: `~/.local/state/fwvault/` - Working set and history (`state.json`),
//!   audit log (`audit.log`), diagnostic log (`fwvault.log`)
//!
//! # Example
//!
//! ```no_run
//! use fwvault::utils::{ensure_dirs, get_state_dir};
//!
//! ensure_dirs().expect("Failed to create directories");
//!
//! if let Some(state_path) = get_state_dir() {
//!     println!("state lives in {}", state_path.display());
//! }
//! ```

use directories::ProjectDirs;
use std::path::{Path, PathBuf};

fn project_dirs() -> Option<ProjectDirs> {
    ProjectDirs::from("com", "fwvault", "fwvault")
}

pub fn get_config_dir() -> Option<PathBuf> {
    project_dirs().map(|pd| pd.config_dir().to_path_buf())
}

pub fn get_state_dir() -> Option<PathBuf> {
    project_dirs().and_then(|pd| pd.state_dir().map(Path::to_path_buf))
}

pub fn ensure_dirs() -> std::io::Result<()> {
    for dir in [get_config_dir(), get_state_dir()].into_iter().flatten() {
        create_private_dir(&dir)?;
    }
    Ok(())
}

/// Creates `dir` (and parents) readable by the owner only.
pub fn create_private_dir(dir: &Path) -> std::io::Result<()> {
    #[cfg(unix)]
    {
        use std::fs::DirBuilder;
        use std::os::unix::fs::DirBuilderExt;

        DirBuilder::new()
            .mode(0o700) // User read/write/execute only
            .recursive(true)
            .create(dir)
    }

    #[cfg(not(unix))]
    {
        std::fs::create_dir_all(dir)
    }
}

/// Writes `bytes` to `path` atomically.
///
/// 1. Writes to `<path>.tmp`, created with mode 0o600 on Unix.
/// 2. Syncs it to disk.
/// 3. Renames it over `path`.
///
/// Readers see either the old file or the new one, never a partial write.
pub async fn write_private_atomic(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    use tokio::io::AsyncWriteExt;

    let mut temp_path = path.as_os_str().to_owned();
    temp_path.push(".tmp");
    let temp_path = PathBuf::from(temp_path);

    #[cfg(unix)]
    let mut file = tokio::fs::OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .mode(0o600) // Set permissions BEFORE any data is written
        .open(&temp_path)
        .await?;

    #[cfg(not(unix))]
    let mut file = tokio::fs::File::create(&temp_path).await?;

    file.write_all(bytes).await?;
    file.sync_all().await?;
    drop(file);

    tokio::fs::rename(&temp_path, path).await.map_err(|e| {
        if e.kind() == std::io::ErrorKind::StorageFull {
            std::io::Error::new(
                std::io::ErrorKind::StorageFull,
                format!("Disk full: cannot write {}. Free up space and try again.", path.display()),
            )
        } else {
            e
        }
    })
}

/// Truncates a string to a maximum length and adds an ellipsis if needed
pub fn truncate_string(s: &str, max_len: usize) -> String {
    if s.len() <= max_len {
        s.to_string()
    } else {
        // Find the nearest character boundary to avoid splitting multi-byte characters
        let end = s
            .char_indices()
            .map(|(idx, _)| idx)
            .take_while(|&idx| idx <= max_len.saturating_sub(3))
            .last()
            .unwrap_or(0);
        format!("{}...", &s[..end])
    }
}
