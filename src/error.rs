// Error taxonomy shared by the library modules. The CLI layer wraps these in
// `anyhow::Error` and inspects them again in `main` to choose the exit code
// and how the message is styled.

use crate::handle::{HandleKind, JobHandle, JobStatus};
use crate::pipeline::Stage;
use std::path::PathBuf;

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Failures reported by the HTTP layer.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// Connection reset, timeout and similar; worth another try.
    #[error("connection problem: {0}")]
    Transient(String),

    #[error("server returned {status}: {message}")]
    Status { status: u16, message: String },

    #[error("unexpected response: {0}")]
    Decode(String),
}

impl TransportError {
    pub fn is_transient(&self) -> bool {
        match self {
            TransportError::Transient(_) => true,
            TransportError::Status { status, .. } => matches!(status, 429 | 502 | 503 | 504),
            TransportError::Decode(_) => false,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(
        "credentials are not set (missing {}). Run \"amcli configure\" to set them",
        .fields.join(", ")
    )]
    MissingCredential { fields: Vec<&'static str> },

    #[error("invalid API URL: {0}")]
    InvalidApiUrl(String),

    #[error("{stage} expects {} handle, got {found}", expected_list(.expected))]
    InvalidHandleKind {
        stage: Stage,
        expected: &'static [HandleKind],
        found: JobHandle,
    },

    #[error("{handle} is not ready for download (status: {status})")]
    NotReady { handle: JobHandle, status: JobStatus },

    #[error("{stage} failed: {source}")]
    Transport {
        stage: Stage,
        #[source]
        source: TransportError,
    },

    #[error("{}", stage_failure(.stage, .handle, .status, .reason))]
    StageFailed {
        stage: Stage,
        handle: JobHandle,
        status: JobStatus,
        reason: Option<String>,
    },

    #[error("download of {handle} failed: {reason}")]
    Download { handle: JobHandle, reason: String },

    /// Ctrl-C. `handle` is the job being polled when there was one.
    #[error("{}", interrupted(.stage, .handle))]
    Interrupted {
        stage: Stage,
        handle: Option<JobHandle>,
    },

    #[error("the extension of {} must be .jpg, .jpeg, .png, .mp4 or .mov", .path.display())]
    FileType { path: PathBuf },

    #[error("rule format is invalid: {0}")]
    InvalidRule(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },
}

impl Error {
    /// A timeout is reported differently from a hard failure: the job may
    /// still finish on the server.
    pub fn is_timeout(&self) -> bool {
        matches!(
            self,
            Error::StageFailed {
                status: JobStatus::Timeout,
                ..
            }
        )
    }

    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Error::Io {
            context: context.into(),
            source,
        }
    }
}

fn expected_list(kinds: &[HandleKind]) -> String {
    let names: Vec<&str> = kinds.iter().map(|k| k.name()).collect();
    format!("a {}", names.join(" or "))
}

fn stage_failure(
    stage: &Stage,
    handle: &JobHandle,
    status: &JobStatus,
    reason: &Option<String>,
) -> String {
    match status {
        JobStatus::Timeout => format!(
            "{stage} timed out waiting for {handle}; it may still complete on the server"
        ),
        _ => match reason {
            Some(reason) => format!("{stage} failed for {handle}: {reason}"),
            None => format!("{stage} failed for {handle} (status: {status})"),
        },
    }
}

fn interrupted(stage: &Stage, handle: &Option<JobHandle>) -> String {
    match handle {
        Some(handle) => {
            format!("interrupted while waiting for {handle}; the job continues on the server")
        }
        None => format!("interrupted before {stage} started; nothing was submitted"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handle::JobId;

    #[test]
    fn gateway_errors_are_transient() {
        let busy = TransportError::Status {
            status: 503,
            message: String::new(),
        };
        let denied = TransportError::Status {
            status: 401,
            message: "invalid token".into(),
        };
        assert!(busy.is_transient());
        assert!(!denied.is_transient());
        assert!(TransportError::Transient("reset".into()).is_transient());
    }

    #[test]
    fn messages_name_the_stage() {
        let err = Error::StageFailed {
            stage: Stage::Extract,
            handle: JobHandle::Keypoint(JobId::new(7)),
            status: JobStatus::Failure,
            reason: Some("no person detected".into()),
        };
        assert_eq!(
            err.to_string(),
            "extract failed for keypoint 7: no person detected"
        );

        let err = Error::InvalidHandleKind {
            stage: Stage::Draw,
            expected: &[HandleKind::Keypoint],
            found: JobHandle::Movie(JobId::new(3)),
        };
        assert_eq!(err.to_string(), "draw expects a keypoint handle, got movie 3");
    }

    #[test]
    fn interrupt_message_says_whether_a_job_was_left_running() {
        let waiting = Error::Interrupted {
            stage: Stage::Extract,
            handle: Some(JobHandle::Keypoint(JobId::new(222))),
        };
        assert_eq!(
            waiting.to_string(),
            "interrupted while waiting for keypoint 222; the job continues on the server"
        );

        let before = Error::Interrupted {
            stage: Stage::Draw,
            handle: None,
        };
        assert_eq!(
            before.to_string(),
            "interrupted before draw started; nothing was submitted"
        );
    }
}
