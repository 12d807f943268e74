use std::path::{Component, Path, PathBuf};

use axum::{
    Json,
    body::Body,
    extract::{Path as UrlPath, State},
    http::{StatusCode, header},
    response::{IntoResponse, Response},
};
use serde::Serialize;
use tokio::fs;
use tokio_util::io::ReaderStream;
use tracing::{debug, warn};

use super::WorkerState;
use super::error::WorkerHttpError;

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub user: String,
}

/// Directory listing entry.
#[derive(Debug, Serialize)]
pub struct DirEntry {
    pub name: String,
    #[serde(rename = "type")]
    pub entry_type: EntryType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
}

#[derive(Debug, Serialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum EntryType {
    File,
    Directory,
}

pub async fn health(State(state): State<WorkerState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        user: state.user.clone(),
    })
}

pub async fn get_root(State(state): State<WorkerState>) -> Result<Response, WorkerHttpError> {
    serve(&state, "").await
}

pub async fn get_path(
    State(state): State<WorkerState>,
    UrlPath(path): UrlPath<String>,
) -> Result<Response, WorkerHttpError> {
    serve(&state, &path).await
}

async fn serve(state: &WorkerState, relative: &str) -> Result<Response, WorkerHttpError> {
    let path = resolve_and_verify_path(&state.root, relative)?;

    let metadata = match fs::metadata(&path).await {
        Ok(metadata) => metadata,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(WorkerHttpError::NotFound(relative.to_string()));
        }
        Err(e) => return Err(WorkerHttpError::Io(e)),
    };

    if metadata.is_dir() {
        debug!("Listing directory: {}", path.display());
        Ok(Json(list_dir(&path).await?).into_response())
    } else {
        debug!("Streaming file: {}", path.display());
        let file = fs::File::open(&path).await?;
        let mime = mime_guess::from_path(&path)
            .first_or_octet_stream()
            .to_string();

        Ok((
            StatusCode::OK,
            [
                (header::CONTENT_TYPE, mime),
                (header::CONTENT_LENGTH, metadata.len().to_string()),
            ],
            Body::from_stream(ReaderStream::new(file)),
        )
            .into_response())
    }
}

async fn list_dir(path: &Path) -> Result<Vec<DirEntry>, WorkerHttpError> {
    let mut entries = Vec::new();
    let mut dir = fs::read_dir(path).await?;
    while let Some(entry) = dir.next_entry().await? {
        let metadata = entry.metadata().await?;
        let (entry_type, size) = if metadata.is_dir() {
            (EntryType::Directory, None)
        } else {
            (EntryType::File, Some(metadata.len()))
        };
        entries.push(DirEntry {
            name: entry.file_name().to_string_lossy().into_owned(),
            entry_type,
            size,
        });
    }
    entries.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(entries)
}

/// Join `relative` onto `root`, rejecting anything that could leave it.
fn resolve_path(root: &Path, relative: &str) -> Result<PathBuf, WorkerHttpError> {
    let relative = relative.trim_start_matches('/');
    let mut result = root.to_path_buf();

    for component in Path::new(relative).components() {
        match component {
            Component::Normal(name) => result.push(name),
            Component::CurDir => continue,
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                warn!("Path traversal attempt: {:?}", relative);
                return Err(WorkerHttpError::PathTraversal);
            }
        }
    }

    Ok(result)
}

/// [`resolve_path`] plus a symlink check on paths that exist.
fn resolve_and_verify_path(root: &Path, relative: &str) -> Result<PathBuf, WorkerHttpError> {
    let built = resolve_path(root, relative)?;
    if !built.exists() {
        return Ok(built);
    }

    let canonical_root = root.canonicalize()?;
    let canonical = built.canonicalize()?;
    if !canonical.starts_with(&canonical_root) {
        warn!(
            "Symlink escape: {:?} resolved to {:?} outside {:?}",
            built, canonical, canonical_root
        );
        return Err(WorkerHttpError::PathTraversal);
    }
    Ok(canonical)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_path_rejects_traversal() {
        let root = Path::new("/srv/alice");
        assert!(matches!(
            resolve_path(root, "../bob/secret"),
            Err(WorkerHttpError::PathTraversal)
        ));
        assert!(matches!(
            resolve_path(root, "docs/../../etc"),
            Err(WorkerHttpError::PathTraversal)
        ));
    }

    #[test]
    fn test_resolve_path_joins_under_root() {
        let root = Path::new("/srv/alice");
        assert_eq!(
            resolve_path(root, "/docs/./a.txt").unwrap(),
            PathBuf::from("/srv/alice/docs/a.txt")
        );
        assert_eq!(resolve_path(root, "").unwrap(), PathBuf::from("/srv/alice"));
    }

    #[cfg(unix)]
    #[test]
    fn test_symlink_escape_is_rejected() {
        let outside = tempfile::tempdir().unwrap();
        let root = tempfile::tempdir().unwrap();
        std::os::unix::fs::symlink(outside.path(), root.path().join("link")).unwrap();

        assert!(matches!(
            resolve_and_verify_path(root.path(), "link"),
            Err(WorkerHttpError::PathTraversal)
        ));
    }
}
