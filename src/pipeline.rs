// Pipeline orchestration: the fixed stage graph of the service.
//
//   upload ──> extract ──┬──> draw ────> download
//                        └──> analyze ─> download
//
// Each stage checks the kind of the handle it is given before talking to the
// server, submits its job, and (except for upload) polls it to a terminal
// status. Every handle produced during one invocation is recorded in the
// `PipelineContext`. A chained run stops at the first stage that does not
// succeed.

use crate::api::Transport;
use crate::download::ResultDownloader;
use crate::error::{Error, Result};
use crate::handle::{HandleKind, JobHandle, JobId, JobStatus};
use crate::poller::{PollError, Poller, StatusReport};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use md5::{Digest, Md5};
use serde_json::{json, Value};
use std::fmt;
use std::path::{Path, PathBuf};
use tracing::info;

const IMAGE_SUFFIXES: &[&str] = &["jpg", "jpeg", "png"];
const MOVIE_SUFFIXES: &[&str] = &["mp4", "mov"];

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Stage {
    Upload,
    Extract,
    Draw,
    Analyze,
    Download,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Stage::Upload => "upload",
            Stage::Extract => "extract",
            Stage::Draw => "draw",
            Stage::Analyze => "analyze",
            Stage::Download => "download",
        };
        f.write_str(s)
    }
}

/// A handle together with the last status seen for it and the body of
/// that status response.
#[derive(Clone, Debug, PartialEq)]
pub struct Tracked {
    pub handle: JobHandle,
    pub status: JobStatus,
    pub body: Value,
}

impl Tracked {
    fn from_report(handle: JobHandle, report: StatusReport) -> Self {
        Tracked {
            handle,
            status: report.status,
            body: report.body,
        }
    }

    /// The server's explanation for a failed job, if it gave one.
    pub fn failure_detail(&self) -> Option<String> {
        match self.body.get("failureDetail")? {
            Value::Null => None,
            Value::String(s) if s.is_empty() => None,
            Value::String(s) => Some(s.clone()),
            other => Some(other.to_string()),
        }
    }

    /// Turns anything but `Success` into `Error::StageFailed`.
    pub fn ensure_success(&self, stage: Stage) -> Result<&Self> {
        if self.status == JobStatus::Success {
            return Ok(self);
        }
        Err(Error::StageFailed {
            stage,
            handle: self.handle,
            status: self.status,
            reason: self.failure_detail(),
        })
    }
}

/// One entry per stage run during this invocation.
#[derive(Clone, Debug, PartialEq)]
pub struct StageRecord {
    pub stage: Stage,
    pub handle: JobHandle,
    pub status: JobStatus,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct PipelineContext {
    records: Vec<StageRecord>,
}

impl PipelineContext {
    pub fn records(&self) -> &[StageRecord] {
        &self.records
    }

    pub fn handles(&self) -> impl Iterator<Item = &JobHandle> {
        self.records.iter().map(|r| &r.handle)
    }

    pub fn last(&self) -> Option<&StageRecord> {
        self.records.last()
    }

    fn record(&mut self, stage: Stage, handle: JobHandle, status: JobStatus) {
        self.records.push(StageRecord {
            stage,
            handle,
            status,
        });
    }
}

/// Hooks for progress output. Both default to doing nothing.
pub trait StageObserver {
    /// The job was accepted by the server and is about to be polled.
    fn submitted(&self, _stage: Stage, _handle: &JobHandle) {}

    /// The stage has a final answer (including uploads, which are final
    /// immediately).
    fn settled(&self, _stage: Stage, _job: &Tracked) {}
}

impl StageObserver for () {}

/// How a chained run starts.
#[derive(Clone, Debug, PartialEq)]
pub enum ChainSource {
    /// Upload this file first.
    File(PathBuf),
    /// Use an image or movie that is already on the server.
    Existing(JobHandle),
}

/// What to do with the keypoints once extracted.
#[derive(Clone, Debug, PartialEq)]
pub enum FollowUp {
    Draw {
        rule: Option<Value>,
        destination: Option<PathBuf>,
    },
    Analyze {
        rule: Value,
    },
}

#[derive(Clone, Debug, PartialEq)]
pub struct ChainPlan {
    pub source: ChainSource,
    pub follow_up: Option<FollowUp>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct ChainReport {
    pub keypoint: Tracked,
    pub follow_up: Option<Tracked>,
    pub artifact: Option<PathBuf>,
}

pub struct Orchestrator<'a, T: Transport + ?Sized> {
    transport: &'a T,
    poller: Poller,
    observer: &'a dyn StageObserver,
    context: PipelineContext,
}

impl<'a, T: Transport + ?Sized> Orchestrator<'a, T> {
    pub fn new(transport: &'a T, poller: Poller, observer: &'a dyn StageObserver) -> Self {
        Orchestrator {
            transport,
            poller,
            observer,
            context: PipelineContext::default(),
        }
    }

    pub fn context(&self) -> &PipelineContext {
        &self.context
    }

    pub fn into_context(self) -> PipelineContext {
        self.context
    }

    /// Registers `path` as an image or movie and uploads its bytes. The id
    /// is assigned by the server straight away; there is nothing to poll.
    pub fn upload(&mut self, path: &Path) -> Result<JobHandle> {
        let kind = media_kind(path)?;
        self.ensure_not_cancelled(Stage::Upload)?;
        let bytes = std::fs::read(path)
            .map_err(|e| Error::io(format!("cannot read {}", path.display()), e))?;
        let content_md5 = STANDARD.encode(Md5::digest(&bytes));
        let origin_key = path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("upload");

        let registration = self
            .transport
            .register_media(kind, origin_key, &content_md5)
            .map_err(|source| transport_error(Stage::Upload, source))?;
        self.transport
            .put_object(&registration.upload_url, bytes, &content_md5)
            .map_err(|source| transport_error(Stage::Upload, source))?;

        let handle = JobHandle::new(kind, registration.id);
        info!(%handle, path = %path.display(), "uploaded media");
        self.context.record(Stage::Upload, handle, JobStatus::Success);
        self.observer.settled(
            Stage::Upload,
            &Tracked {
                handle,
                status: JobStatus::Success,
                body: Value::Null,
            },
        );
        Ok(handle)
    }

    /// Starts keypoint extraction for an image or movie and waits for it.
    pub fn extract(&mut self, source: &JobHandle) -> Result<Tracked> {
        let body = match source {
            JobHandle::Image(id) => json!({ "image_id": id }),
            JobHandle::Movie(id) => json!({ "movie_id": id }),
            other => {
                return Err(Error::InvalidHandleKind {
                    stage: Stage::Extract,
                    expected: &[HandleKind::Image, HandleKind::Movie],
                    found: *other,
                })
            }
        };
        self.submit_and_wait(Stage::Extract, HandleKind::Keypoint, body)
    }

    /// Starts drawing keypoints onto the source media and waits for it.
    pub fn draw(&mut self, keypoint: &JobHandle, rule: Option<Value>) -> Result<Tracked> {
        let id = expect_keypoint(Stage::Draw, keypoint)?;
        let mut body = json!({ "keypoint_id": id });
        if let Some(rule) = rule {
            body["rule"] = rule;
        }
        self.submit_and_wait(Stage::Draw, HandleKind::Drawing, body)
    }

    /// Starts an analysis of the keypoints and waits for it.
    pub fn analyze(&mut self, keypoint: &JobHandle, rule: Value) -> Result<Tracked> {
        let id = expect_keypoint(Stage::Analyze, keypoint)?;
        let body = json!({ "keypoint_id": id, "rule": rule });
        self.submit_and_wait(Stage::Analyze, HandleKind::Analysis, body)
    }

    /// Current status of an existing job, from a single query.
    pub fn track(&self, handle: &JobHandle) -> Result<Tracked> {
        let report = self
            .status_of(handle)
            .map_err(|source| transport_error(stage_for(handle.kind()), source))?;
        Ok(Tracked::from_report(*handle, report))
    }

    /// Writes the artifact of a finished drawing or analysis.
    pub fn download(&mut self, job: &Tracked, destination: &Path) -> Result<PathBuf> {
        self.ensure_not_cancelled(Stage::Download)?;
        let path = ResultDownloader::new(self.transport).fetch(job, destination)?;
        self.context.record(Stage::Download, job.handle, job.status);
        Ok(path)
    }

    /// Runs extraction and the optional follow-up in order, stopping at the
    /// first stage that does not succeed.
    pub fn run_chain(&mut self, plan: &ChainPlan) -> Result<ChainReport> {
        let source = match &plan.source {
            ChainSource::File(path) => self.upload(path)?,
            ChainSource::Existing(handle) => *handle,
        };

        let keypoint = self.extract(&source)?;
        keypoint.ensure_success(Stage::Extract)?;

        let mut report = ChainReport {
            keypoint: keypoint.clone(),
            follow_up: None,
            artifact: None,
        };

        match &plan.follow_up {
            None => {}
            Some(FollowUp::Draw { rule, destination }) => {
                let drawing = self.draw(&keypoint.handle, rule.clone())?;
                drawing.ensure_success(Stage::Draw)?;
                if let Some(destination) = destination {
                    report.artifact = Some(self.download(&drawing, destination)?);
                }
                report.follow_up = Some(drawing);
            }
            Some(FollowUp::Analyze { rule }) => {
                let analysis = self.analyze(&keypoint.handle, rule.clone())?;
                analysis.ensure_success(Stage::Analyze)?;
                report.follow_up = Some(analysis);
            }
        }

        Ok(report)
    }

    fn submit_and_wait(&mut self, stage: Stage, kind: HandleKind, body: Value) -> Result<Tracked> {
        self.ensure_not_cancelled(stage)?;
        let id = self
            .transport
            .create(kind, body)
            .map_err(|source| transport_error(stage, source))?;
        let handle = JobHandle::new(kind, id);
        info!(%stage, %handle, "job submitted");
        self.context.record(stage, handle, JobStatus::Processing);
        self.observer.submitted(stage, &handle);

        let report = self
            .poller
            .poll(&handle, |h| self.status_of(h))
            .map_err(|e| match e {
                PollError::Interrupted => Error::Interrupted {
                    stage,
                    handle: Some(handle),
                },
                PollError::Transport(source) => transport_error(stage, source),
            })?;

        let job = Tracked::from_report(handle, report);
        info!(%stage, %handle, status = %job.status, "job settled");
        self.context.record(stage, handle, job.status);
        self.observer.settled(stage, &job);
        Ok(job)
    }

    /// Nothing new is started on the server once Ctrl-C has been pressed.
    fn ensure_not_cancelled(&self, stage: Stage) -> Result<()> {
        if self.poller.is_cancelled() {
            info!(%stage, "interrupted before submission");
            return Err(Error::Interrupted {
                stage,
                handle: None,
            });
        }
        Ok(())
    }

    fn status_of(&self, handle: &JobHandle) -> Result<StatusReport, crate::error::TransportError> {
        let body = self.transport.get_one(handle.kind(), handle.id())?;
        StatusReport::from_body(body)
    }
}

/// Media kind from the file extension, case-insensitively.
pub fn media_kind(path: &Path) -> Result<HandleKind> {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase)
        .unwrap_or_default();
    if IMAGE_SUFFIXES.contains(&ext.as_str()) {
        Ok(HandleKind::Image)
    } else if MOVIE_SUFFIXES.contains(&ext.as_str()) {
        Ok(HandleKind::Movie)
    } else {
        Err(Error::FileType {
            path: path.to_path_buf(),
        })
    }
}

fn expect_keypoint(stage: Stage, handle: &JobHandle) -> Result<JobId> {
    match handle {
        JobHandle::Keypoint(id) => Ok(*id),
        other => Err(Error::InvalidHandleKind {
            stage,
            expected: &[HandleKind::Keypoint],
            found: *other,
        }),
    }
}

fn stage_for(kind: HandleKind) -> Stage {
    match kind {
        HandleKind::Image | HandleKind::Movie => Stage::Upload,
        HandleKind::Keypoint => Stage::Extract,
        HandleKind::Drawing => Stage::Draw,
        HandleKind::Analysis => Stage::Analyze,
    }
}

fn transport_error(stage: Stage, source: crate::error::TransportError) -> Error {
    Error::Transport { stage, source }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::{MediaRegistration, MockTransport};
    use crate::error::TransportError;
    use crate::poller::{CancelToken, Pause, PollPolicy};
    use std::time::Duration;
    use tempfile::TempDir;

    struct NoPause;

    impl Pause for NoPause {
        fn pause(&self, _interval: Duration) {}
    }

    fn poller(max_attempts: u32) -> Poller {
        let policy = PollPolicy {
            interval: Duration::from_secs(1),
            max_attempts,
            transient_retries: 3,
        };
        Poller::new(policy, Box::new(NoPause), CancelToken::new())
    }

    fn cancelled_poller() -> Poller {
        let cancel = CancelToken::new();
        cancel.cancel();
        Poller::new(PollPolicy::default(), Box::new(NoPause), cancel)
    }

    fn status(raw: &str) -> Value {
        json!({ "execStatus": raw })
    }

    #[test]
    fn draw_rejects_movie_handle_without_any_request() {
        let transport = MockTransport::new();
        let mut orchestrator = Orchestrator::new(&transport, poller(5), &());

        let err = orchestrator
            .draw(&JobHandle::Movie(JobId::new(1)), None)
            .unwrap_err();

        assert!(matches!(
            err,
            Error::InvalidHandleKind {
                stage: Stage::Draw,
                found: JobHandle::Movie(_),
                ..
            }
        ));
        assert!(orchestrator.context().records().is_empty());
    }

    #[test]
    fn analyze_and_extract_validate_their_inputs() {
        let transport = MockTransport::new();
        let mut orchestrator = Orchestrator::new(&transport, poller(5), &());

        assert!(matches!(
            orchestrator.analyze(&JobHandle::Drawing(JobId::new(1)), json!([])),
            Err(Error::InvalidHandleKind { stage: Stage::Analyze, .. })
        ));
        assert!(matches!(
            orchestrator.extract(&JobHandle::Keypoint(JobId::new(1))),
            Err(Error::InvalidHandleKind { stage: Stage::Extract, .. })
        ));
    }

    #[test]
    fn extract_submits_movie_id_and_polls_to_success() {
        let mut transport = MockTransport::new();
        transport
            .expect_create()
            .withf(|kind, body| *kind == HandleKind::Keypoint && body["movie_id"] == 5)
            .times(1)
            .returning(|_, _| Ok(JobId::new(222)));
        let mut polls = 0;
        transport
            .expect_get_one()
            .withf(|kind, id| *kind == HandleKind::Keypoint && id.get() == 222)
            .times(3)
            .returning(move |_, _| {
                polls += 1;
                Ok(status(if polls < 3 { "PROCESSING" } else { "SUCCESS" }))
            });

        let mut orchestrator = Orchestrator::new(&transport, poller(10), &());
        let job = orchestrator.extract(&JobHandle::Movie(JobId::new(5))).unwrap();

        assert_eq!(job.handle, JobHandle::Keypoint(JobId::new(222)));
        assert_eq!(job.status, JobStatus::Success);
        let stages: Vec<_> = orchestrator
            .context()
            .records()
            .iter()
            .map(|r| (r.stage, r.status))
            .collect();
        assert_eq!(
            stages,
            vec![
                (Stage::Extract, JobStatus::Processing),
                (Stage::Extract, JobStatus::Success)
            ]
        );
    }

    #[test]
    fn draw_sends_rule_when_given() {
        let mut transport = MockTransport::new();
        transport
            .expect_create()
            .withf(|kind, body| {
                *kind == HandleKind::Drawing
                    && body["keypoint_id"] == 222
                    && body["rule"] == json!([{ "drawingType": "text" }])
            })
            .times(1)
            .returning(|_, _| Ok(JobId::new(333)));
        transport
            .expect_get_one()
            .returning(|_, _| Ok(json!({ "execStatus": "SUCCESS", "drawingUrl": "https://s/x.jpg" })));

        let mut orchestrator = Orchestrator::new(&transport, poller(3), &());
        let job = orchestrator
            .draw(
                &JobHandle::Keypoint(JobId::new(222)),
                Some(json!([{ "drawingType": "text" }])),
            )
            .unwrap();

        assert_eq!(job.handle, JobHandle::Drawing(JobId::new(333)));
    }

    #[test]
    fn failed_extraction_short_circuits_the_chain() {
        let mut transport = MockTransport::new();
        transport
            .expect_create()
            .withf(|kind, _| *kind == HandleKind::Keypoint)
            .times(1)
            .returning(|_, _| Ok(JobId::new(222)));
        transport.expect_get_one().times(1).returning(|_, _| {
            Ok(json!({ "execStatus": "FAILURE", "failureDetail": "no person detected" }))
        });
        // No expectation for a drawing: submitting one would panic.

        let mut orchestrator = Orchestrator::new(&transport, poller(3), &());
        let plan = ChainPlan {
            source: ChainSource::Existing(JobHandle::Image(JobId::new(111))),
            follow_up: Some(FollowUp::Draw {
                rule: None,
                destination: None,
            }),
        };
        let err = orchestrator.run_chain(&plan).unwrap_err();

        match err {
            Error::StageFailed {
                stage,
                status,
                reason,
                ..
            } => {
                assert_eq!(stage, Stage::Extract);
                assert_eq!(status, JobStatus::Failure);
                assert_eq!(reason.as_deref(), Some("no person detected"));
            }
            other => panic!("expected StageFailed, got {other:?}"),
        }
    }

    #[test]
    fn timed_out_extraction_is_reported_as_timeout() {
        let mut transport = MockTransport::new();
        transport
            .expect_create()
            .times(1)
            .returning(|_, _| Ok(JobId::new(222)));
        transport
            .expect_get_one()
            .times(4)
            .returning(|_, _| Ok(status("PROCESSING")));

        let mut orchestrator = Orchestrator::new(&transport, poller(4), &());
        let plan = ChainPlan {
            source: ChainSource::Existing(JobHandle::Image(JobId::new(111))),
            follow_up: Some(FollowUp::Analyze { rule: json!([]) }),
        };
        let err = orchestrator.run_chain(&plan).unwrap_err();

        assert!(err.is_timeout());
    }

    #[test]
    fn submission_errors_name_the_stage() {
        let mut transport = MockTransport::new();
        transport.expect_create().times(1).returning(|_, _| {
            Err(TransportError::Status {
                status: 401,
                message: "Invalid token".into(),
            })
        });

        let mut orchestrator = Orchestrator::new(&transport, poller(3), &());
        let err = orchestrator
            .analyze(&JobHandle::Keypoint(JobId::new(1)), json!({}))
            .unwrap_err();

        assert_eq!(err.to_string(), "analyze failed: server returned 401: Invalid token");
    }

    #[test]
    fn upload_registers_and_puts_bytes_with_md5() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("image.JPG");
        std::fs::write(&path, b"hello").unwrap();
        // base64(md5("hello"))
        let expected_md5 = "XUFAKrxLKna5cZ2REBfFkg==";

        let mut transport = MockTransport::new();
        transport
            .expect_register_media()
            .withf(move |kind, key, md5| {
                *kind == HandleKind::Image && key.eq("image.JPG") && md5.eq(expected_md5)
            })
            .times(1)
            .returning(|_, _, _| {
                Ok(MediaRegistration {
                    id: JobId::new(111),
                    upload_url: "https://storage/upload".into(),
                })
            });
        transport
            .expect_put_object()
            .withf(move |url, body, md5| {
                url.eq("https://storage/upload") && body.as_slice() == b"hello" && md5.eq(expected_md5)
            })
            .times(1)
            .returning(|_, _, _| Ok(()));

        let mut orchestrator = Orchestrator::new(&transport, poller(3), &());
        let handle = orchestrator.upload(&path).unwrap();

        assert_eq!(handle, JobHandle::Image(JobId::new(111)));
        assert_eq!(orchestrator.context().last().unwrap().stage, Stage::Upload);
    }

    #[test]
    fn unsupported_extension_is_rejected_before_upload() {
        let transport = MockTransport::new();
        let mut orchestrator = Orchestrator::new(&transport, poller(3), &());

        let err = orchestrator.upload(Path::new("notes.txt")).unwrap_err();

        assert!(matches!(err, Error::FileType { .. }));
        assert_eq!(media_kind(Path::new("clip.MOV")).unwrap(), HandleKind::Movie);
    }

    #[test]
    fn interrupted_chain_submits_no_new_job() {
        let mut transport = MockTransport::new();
        transport.expect_create().times(0);
        transport.expect_get_one().times(0);

        let mut orchestrator = Orchestrator::new(&transport, cancelled_poller(), &());
        let plan = ChainPlan {
            source: ChainSource::Existing(JobHandle::Image(JobId::new(111))),
            follow_up: Some(FollowUp::Draw {
                rule: None,
                destination: None,
            }),
        };
        let err = orchestrator.run_chain(&plan).unwrap_err();

        assert!(matches!(
            err,
            Error::Interrupted {
                stage: Stage::Extract,
                handle: None
            }
        ));
        assert!(orchestrator.context().records().is_empty());
    }

    #[test]
    fn interrupted_upload_registers_nothing() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("image.jpg");
        std::fs::write(&path, b"hello").unwrap();
        let mut transport = MockTransport::new();
        transport.expect_register_media().times(0);
        transport.expect_put_object().times(0);

        let mut orchestrator = Orchestrator::new(&transport, cancelled_poller(), &());
        let err = orchestrator.upload(&path).unwrap_err();

        assert!(matches!(
            err,
            Error::Interrupted {
                stage: Stage::Upload,
                handle: None
            }
        ));
    }

    #[test]
    fn failure_detail_ignores_empty_values() {
        let job = Tracked {
            handle: JobHandle::Drawing(JobId::new(1)),
            status: JobStatus::Failure,
            body: json!({ "failureDetail": "" }),
        };
        assert_eq!(job.failure_detail(), None);
        assert!(matches!(
            job.ensure_success(Stage::Draw),
            Err(Error::StageFailed { reason: None, .. })
        ));
    }
}
