//! `<log>.hashes` files recording which commit each mounted volume was at.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use git2::Repository;
use tracing::debug;

use crate::errors::DispatchError;

/// HEAD commit of the repository at `dir`, or `None` when it is not a
/// repository or has no commit yet.
pub fn head_commit(dir: &Path) -> Option<String> {
    let repo = Repository::open(dir).ok()?;
    let head = repo.head().ok()?;
    let commit = head.peel_to_commit().ok()?;
    Some(commit.id().to_string())
}

pub fn sidecar_path(log_path: &Path) -> PathBuf {
    let mut name = log_path.as_os_str().to_owned();
    name.push(".hashes");
    PathBuf::from(name)
}

/// Write `commit for <dest>: <sha>` for every volume that is a git repository.
pub fn write_commit_hashes(
    log_path: &Path,
    volumes: &BTreeMap<String, PathBuf>,
) -> Result<PathBuf, DispatchError> {
    let path = sidecar_path(log_path);
    let mut content = String::new();
    for (dest, source) in volumes {
        match head_commit(source) {
            Some(sha) => content.push_str(&format!("commit for {}: {}\n", dest, sha)),
            None => debug!(volume = %dest, source = %source.display(), "Volume is not a git checkout"),
        }
    }
    std::fs::write(&path, content).map_err(|source| DispatchError::Io {
        path: path.clone(),
        source,
    })?;
    Ok(path)
}
