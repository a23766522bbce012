// Result download: writes the artifact of a finished drawing or analysis to
// disk. Drawings are fetched from their storage URL; analyses are already in
// the status body and are written out as JSON.
//
// There is no retry here. Retrying belongs to status polling only.

use crate::api::{Artifact, Transport};
use crate::error::{Error, Result};
use crate::handle::{HandleKind, JobHandle, JobStatus};
use crate::pipeline::{Stage, Tracked};
use reqwest::Url;
use serde_json::Value;
use std::path::{Path, PathBuf};
use tracing::info;

pub struct ResultDownloader<'a, T: Transport + ?Sized> {
    transport: &'a T,
}

impl<'a, T: Transport + ?Sized> ResultDownloader<'a, T> {
    pub fn new(transport: &'a T) -> Self {
        ResultDownloader { transport }
    }

    /// Writes the artifact of `job` to `destination` and returns the path
    /// written. A directory destination (an existing directory, or any path
    /// ending in a separator) gets a derived file name; a file destination is
    /// overwritten. Missing directories are created. Nothing is transferred
    /// unless the job finished successfully.
    pub fn fetch(&self, job: &Tracked, destination: &Path) -> Result<PathBuf> {
        let handle = job.handle;
        if !matches!(handle.kind(), HandleKind::Drawing | HandleKind::Analysis) {
            return Err(Error::InvalidHandleKind {
                stage: Stage::Download,
                expected: &[HandleKind::Drawing, HandleKind::Analysis],
                found: handle,
            });
        }
        if job.status != JobStatus::Success {
            return Err(Error::NotReady {
                handle,
                status: job.status,
            });
        }

        let (artifact, remote_name) = match handle {
            JobHandle::Drawing(_) => {
                let url = job
                    .body
                    .get("drawingUrl")
                    .and_then(Value::as_str)
                    .ok_or_else(|| Error::Download {
                        handle,
                        reason: "response has no drawingUrl".into(),
                    })?;
                let artifact = self.transport.fetch(url).map_err(|e| Error::Download {
                    handle,
                    reason: e.to_string(),
                })?;
                (artifact, file_name_from_url(url))
            }
            _ => {
                let result = job.body.get("result").cloned().unwrap_or(Value::Null);
                let bytes = serde_json::to_vec_pretty(&result).map_err(|e| Error::Download {
                    handle,
                    reason: e.to_string(),
                })?;
                let artifact = Artifact {
                    bytes,
                    content_type: Some("application/json".into()),
                };
                (artifact, None)
            }
        };

        let target = if names_directory(destination) {
            let name = remote_name.unwrap_or_else(|| {
                let ext = extension_for(artifact.content_type.as_deref());
                format!("{}_{}.{}", handle.kind(), handle.id(), ext)
            });
            destination.join(name)
        } else {
            destination.to_path_buf()
        };
        if let Some(parent) = target.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| Error::Download {
                handle,
                reason: format!("cannot create directory {}: {e}", parent.display()),
            })?;
        }

        std::fs::write(&target, &artifact.bytes).map_err(|e| Error::Download {
            handle,
            reason: format!("cannot write {}: {e}", target.display()),
        })?;
        info!(%handle, path = %target.display(), bytes = artifact.bytes.len(), "artifact written");
        Ok(target)
    }
}

fn names_directory(destination: &Path) -> bool {
    destination.is_dir()
        || destination
            .as_os_str()
            .to_string_lossy()
            .ends_with(std::path::is_separator)
}

/// Last path segment of the URL when it looks like a file name.
fn file_name_from_url(url: &str) -> Option<String> {
    let url = Url::parse(url).ok()?;
    let name = url.path_segments()?.last()?;
    if name.contains('.') && !name.starts_with('.') {
        Some(name.to_string())
    } else {
        None
    }
}

fn extension_for(content_type: Option<&str>) -> &'static str {
    let essence = content_type
        .and_then(|ct| ct.split(';').next())
        .map(|ct| ct.trim().to_ascii_lowercase());
    match essence.as_deref() {
        Some("image/jpeg") => "jpg",
        Some("image/png") => "png",
        Some("video/mp4") => "mp4",
        Some("video/quicktime") => "mov",
        Some("application/json") => "json",
        _ => "bin",
    }
}
