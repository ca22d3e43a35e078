use std::path::{Component, Path, PathBuf};

use sha2::{Digest, Sha256};
use thiserror::Error;

use super::index::LocalFileType;
use crate::state_id::StateId;

#[derive(Debug, Error)]
pub enum PathError {
    #[error("remote path is empty")]
    Empty,
    #[error("remote path contains unsupported component")]
    UnsupportedComponent,
}

pub fn cache_path_for(cache_root: &Path, remote_path: &str) -> Result<PathBuf, PathError> {
    if remote_path.is_empty() {
        return Err(PathError::Empty);
    }

    // Remote paths are POSIX-like ("/ws/Docs/A.txt"); map them under cache_root.
    let mut out = cache_root.to_path_buf();
    for component in Path::new(remote_path).components() {
        match component {
            Component::Normal(part) => out.push(part),
            Component::RootDir => continue,
            Component::CurDir => continue,
            Component::ParentDir | Component::Prefix(_) => {
                return Err(PathError::UnsupportedComponent);
            }
        }
    }
    Ok(out)
}

/// Where an artefact of `kind` for `state` lives on disk.
///
/// File content mirrors the remote tree under a per-account directory; thumbnails
/// and previews are flat files named after a digest of the encoded state.
pub fn local_path_for(
    cache_root: &Path,
    state: &StateId,
    kind: LocalFileType,
) -> Result<PathBuf, PathError> {
    let account_dir = cache_root.join(short_digest(&state.account_id()));
    match kind {
        LocalFileType::Thumb => Ok(account_dir
            .join("thumbs")
            .join(format!("{}.jpg", digest(&state.id())))),
        LocalFileType::Preview => Ok(account_dir
            .join("previews")
            .join(format!("{}.jpg", digest(&state.id())))),
        LocalFileType::File => {
            cache_path_for(&account_dir.join("files"), state.path().ok_or(PathError::Empty)?)
        }
        LocalFileType::Transfer => cache_path_for(
            &account_dir.join("transfers"),
            state.path().ok_or(PathError::Empty)?,
        ),
    }
}

/// Removes a cached artefact. Directories are removed recursively and a missing
/// target is not an error.
pub async fn remove_local_path(path: &Path) -> std::io::Result<()> {
    match tokio::fs::metadata(path).await {
        Ok(meta) if meta.is_dir() => tokio::fs::remove_dir_all(path).await,
        Ok(_) => tokio::fs::remove_file(path).await,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err),
    }
}

fn digest(value: &str) -> String {
    let hash = Sha256::digest(value.as_bytes());
    hash.iter().map(|byte| format!("{byte:02x}")).collect()
}

fn short_digest(value: &str) -> String {
    let mut full = digest(value);
    full.truncate(16);
    full
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn maps_remote_path_under_cache_root() {
        let root = PathBuf::from("/cache");
        let mapped = cache_path_for(&root, "/ws/Docs/A.txt").unwrap();
        assert_eq!(mapped, PathBuf::from("/cache/ws/Docs/A.txt"));
    }

    #[test]
    fn rejects_parent_dir() {
        let root = PathBuf::from("/cache");
        assert!(matches!(
            cache_path_for(&root, "../secret"),
            Err(PathError::UnsupportedComponent)
        ));
    }

    #[test]
    fn thumbnails_are_named_by_digest() {
        let root = PathBuf::from("/cache");
        let state = StateId::new("alice", "https://cells.local").with_path("/ws/a.png");
        let thumb = local_path_for(&root, &state, LocalFileType::Thumb).unwrap();
        let file = local_path_for(&root, &state, LocalFileType::File).unwrap();

        assert!(thumb.to_string_lossy().contains("/thumbs/"));
        assert_eq!(thumb.extension().unwrap(), "jpg");
        assert!(file.ends_with("files/ws/a.png"));
        let account_dir = thumb.parent().and_then(Path::parent).unwrap();
        assert!(file.starts_with(account_dir));
    }

    #[tokio::test]
    async fn removing_missing_path_is_ok() {
        let dir = tempfile::tempdir().unwrap();
        remove_local_path(&dir.path().join("nope")).await.unwrap();

        let nested = dir.path().join("a/b");
        std::fs::create_dir_all(&nested).unwrap();
        std::fs::write(nested.join("f.txt"), b"x").unwrap();
        remove_local_path(&dir.path().join("a")).await.unwrap();
        assert!(!dir.path().join("a").exists());
    }
}
