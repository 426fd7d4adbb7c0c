//! File transfer: gzipped tar upload and streaming reads.

use std::fs;
use std::io;
use std::os::unix::fs::PermissionsExt;
use std::path::{Component, Path as FsPath, PathBuf};

use axum::body::{Body, Bytes};
use axum::extract::rejection::JsonRejection;
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use flate2::read::GzDecoder;
use serde::Deserialize;
use serde_json::json;
use tar::{Archive, EntryType};
use thiserror::Error;
use tokio_util::io::ReaderStream;
use tracing::{error, info};

use crate::{json_error, pathutil};

/// Upper bound on an uploaded archive.
pub const MAX_TAR_UPLOAD: usize = 1 << 30;

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

#[derive(Debug, Error)]
enum ExtractError {
    #[error("gzip: not a gzip stream")]
    NotGzip,
    #[error("tar: {0}")]
    Tar(io::Error),
    #[error("path traversal detected")]
    Traversal,
    #[error("write: {0}")]
    Io(io::Error),
}

impl ExtractError {
    fn status(&self) -> StatusCode {
        match self {
            ExtractError::NotGzip | ExtractError::Tar(_) | ExtractError::Traversal => {
                StatusCode::BAD_REQUEST
            }
            ExtractError::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

/// `POST /files/write`: extract a gzipped tar stream under `X-Extract-Dir`.
pub async fn write_files(headers: HeaderMap, body: Bytes) -> Response {
    let extract_dir = headers
        .get("x-extract-dir")
        .and_then(|value| value.to_str().ok())
        .unwrap_or("/");
    let extract_dir = pathutil::clean(FsPath::new(extract_dir));
    if !extract_dir.is_absolute() {
        return json_error(StatusCode::BAD_REQUEST, "X-Extract-Dir must be absolute");
    }

    let result =
        tokio::task::spawn_blocking(move || extract_archive(&body, &extract_dir)).await;
    match result {
        Ok(Ok(files_written)) => {
            info!(files_written, "archive extracted");
            Json(json!({ "filesWritten": files_written })).into_response()
        }
        Ok(Err(err)) => json_error(err.status(), &err.to_string()),
        Err(err) => {
            error!(error = %err, "extract task failed");
            json_error(StatusCode::INTERNAL_SERVER_ERROR, "internal error")
        }
    }
}

fn extract_archive(bytes: &[u8], dir: &FsPath) -> Result<usize, ExtractError> {
    if bytes.len() < 2 || bytes[..2] != GZIP_MAGIC {
        return Err(ExtractError::NotGzip);
    }

    let mut archive = Archive::new(GzDecoder::new(bytes));
    let mut files_written = 0usize;

    for entry in archive.entries().map_err(ExtractError::Tar)? {
        let mut entry = entry.map_err(ExtractError::Tar)?;
        let target = dir.join(sanitized_entry_path(&entry.path().map_err(ExtractError::Tar)?)?);

        match entry.header().entry_type() {
            EntryType::Directory => {
                fs::create_dir_all(&target).map_err(ExtractError::Io)?;
            }
            EntryType::Regular => {
                if let Some(parent) = target.parent() {
                    fs::create_dir_all(parent).map_err(ExtractError::Io)?;
                }
                let mut file = fs::File::create(&target).map_err(ExtractError::Io)?;
                io::copy(&mut entry, &mut file).map_err(ExtractError::Io)?;
                if let Ok(mode) = entry.header().mode() {
                    let _ = fs::set_permissions(&target, fs::Permissions::from_mode(mode));
                }
                files_written += 1;
            }
            _ => {}
        }
    }

    Ok(files_written)
}

/// Resolve an archive entry path to a relative path under the extraction
/// directory: `.` and leading `/` are dropped, `..` pops the previous
/// component. An entry that would climb out of the directory rejects the
/// whole upload.
fn sanitized_entry_path(path: &FsPath) -> Result<PathBuf, ExtractError> {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::Normal(part) => out.push(part),
            Component::ParentDir => {
                if !out.pop() {
                    return Err(ExtractError::Traversal);
                }
            }
            Component::CurDir | Component::RootDir | Component::Prefix(_) => {}
        }
    }
    Ok(out)
}

#[derive(Debug, Deserialize)]
pub struct ReadRequest {
    path: String,
}

/// `POST /files/read`: stream a file back as octets.
pub async fn read_file(payload: Result<Json<ReadRequest>, JsonRejection>) -> Response {
    let Ok(Json(request)) = payload else {
        return json_error(StatusCode::BAD_REQUEST, "invalid request body");
    };
    if request.path.is_empty() {
        return json_error(StatusCode::BAD_REQUEST, "path is required");
    }

    let path = pathutil::clean(FsPath::new(&request.path));
    if !path.is_absolute() {
        return json_error(StatusCode::BAD_REQUEST, "path must be absolute");
    }

    let metadata = match tokio::fs::metadata(&path).await {
        Ok(metadata) => metadata,
        Err(err) if err.kind() == io::ErrorKind::NotFound => {
            return json_error(StatusCode::NOT_FOUND, "file not found");
        }
        Err(err) => {
            return json_error(StatusCode::INTERNAL_SERVER_ERROR, &format!("stat: {err}"));
        }
    };
    if metadata.is_dir() {
        return json_error(StatusCode::BAD_REQUEST, "path is a directory");
    }

    let file = match tokio::fs::File::open(&path).await {
        Ok(file) => file,
        Err(err) => {
            return json_error(StatusCode::INTERNAL_SERVER_ERROR, &format!("open: {err}"));
        }
    };

    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "application/octet-stream")
        .header(header::CONTENT_LENGTH, metadata.len())
        .body(Body::from_stream(ReaderStream::new(file)))
        .unwrap_or_else(|err| {
            error!(error = %err, "read response build failed");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sanitized(input: &str) -> Result<PathBuf, ExtractError> {
        sanitized_entry_path(FsPath::new(input))
    }

    #[test]
    fn keeps_plain_relative_entries() {
        assert_eq!(sanitized("sub/hello.txt").unwrap(), PathBuf::from("sub/hello.txt"));
        assert_eq!(sanitized("./sub/hello.txt").unwrap(), PathBuf::from("sub/hello.txt"));
    }

    #[test]
    fn resolves_interior_parent_components() {
        assert_eq!(sanitized("sub/../hello.txt").unwrap(), PathBuf::from("hello.txt"));
        assert_eq!(sanitized("a/b/../c.txt").unwrap(), PathBuf::from("a/c.txt"));
    }

    #[test]
    fn reroots_absolute_entries() {
        assert_eq!(sanitized("/etc/passwd").unwrap(), PathBuf::from("etc/passwd"));
    }

    #[test]
    fn rejects_entries_that_escape() {
        assert!(matches!(sanitized("../escape.txt"), Err(ExtractError::Traversal)));
        assert!(matches!(sanitized("a/../../escape.txt"), Err(ExtractError::Traversal)));
    }
}
