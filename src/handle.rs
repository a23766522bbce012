// Handles: the kind-tagged identifiers that link one pipeline stage to the
// next. The server assigns the numeric id; the local tag records which
// collection it belongs to so a stage can reject a handle of the wrong kind
// before a request leaves the machine.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Server-assigned identifier. Opaque to the client beyond equality and
/// display.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(u64);

impl JobId {
    pub fn new(raw: u64) -> Self {
        JobId(raw)
    }

    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for JobId {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.parse().map(JobId)
    }
}

/// The five collections the service exposes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum HandleKind {
    Image,
    Movie,
    Keypoint,
    Drawing,
    Analysis,
}

impl HandleKind {
    /// Path segment of the collection, relative to the API root.
    pub fn endpoint(self) -> &'static str {
        match self {
            HandleKind::Image => "images",
            HandleKind::Movie => "movies",
            HandleKind::Keypoint => "keypoints",
            HandleKind::Drawing => "drawings",
            HandleKind::Analysis => "analyses",
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            HandleKind::Image => "image",
            HandleKind::Movie => "movie",
            HandleKind::Keypoint => "keypoint",
            HandleKind::Drawing => "drawing",
            HandleKind::Analysis => "analysis",
        }
    }
}

impl fmt::Display for HandleKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A unit of server-side work. Created from a submission response and never
/// mutated afterwards.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum JobHandle {
    Image(JobId),
    Movie(JobId),
    Keypoint(JobId),
    Drawing(JobId),
    Analysis(JobId),
}

impl JobHandle {
    pub fn new(kind: HandleKind, id: JobId) -> Self {
        match kind {
            HandleKind::Image => JobHandle::Image(id),
            HandleKind::Movie => JobHandle::Movie(id),
            HandleKind::Keypoint => JobHandle::Keypoint(id),
            HandleKind::Drawing => JobHandle::Drawing(id),
            HandleKind::Analysis => JobHandle::Analysis(id),
        }
    }

    pub fn id(&self) -> JobId {
        match *self {
            JobHandle::Image(id)
            | JobHandle::Movie(id)
            | JobHandle::Keypoint(id)
            | JobHandle::Drawing(id)
            | JobHandle::Analysis(id) => id,
        }
    }

    pub fn kind(&self) -> HandleKind {
        match self {
            JobHandle::Image(_) => HandleKind::Image,
            JobHandle::Movie(_) => HandleKind::Movie,
            JobHandle::Keypoint(_) => HandleKind::Keypoint,
            JobHandle::Drawing(_) => HandleKind::Drawing,
            JobHandle::Analysis(_) => HandleKind::Analysis,
        }
    }
}

impl fmt::Display for JobHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.kind(), self.id())
    }
}

/// Where a job stands. `Timeout` never comes from the server: the poller
/// reports it when it gives up on a job that is still processing.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum JobStatus {
    Processing,
    Success,
    Failure,
    Timeout,
}

impl JobStatus {
    /// Maps the service's `execStatus` field. `UNPROCESSED` means queued,
    /// which the client treats the same as processing.
    pub fn from_exec_status(raw: &str) -> Option<Self> {
        match raw.to_ascii_uppercase().as_str() {
            "PROCESSING" | "UNPROCESSED" => Some(JobStatus::Processing),
            "SUCCESS" => Some(JobStatus::Success),
            "FAILURE" => Some(JobStatus::Failure),
            _ => None,
        }
    }

    pub fn is_terminal(self) -> bool {
        !matches!(self, JobStatus::Processing)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            JobStatus::Processing => "PROCESSING",
            JobStatus::Success => "SUCCESS",
            JobStatus::Failure => "FAILURE",
            JobStatus::Timeout => "TIMEOUT",
        };
        f.write_str(s)
    }
}
