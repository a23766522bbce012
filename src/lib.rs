// Library root
// -----------
// `amcli` drives the AnyMotion motion-analysis service: upload media,
// extract keypoints, draw or analyze them, and download the results. The
// binary (`main.rs`) only parses arguments and hands off to `cli::run`.
//
// Module responsibilities:
// - `credentials`: merges command-line, environment and file values into
//   the effective credentials, field by field.
// - `settings`: the INI files under the AnyMotion root (profiles,
//   credentials, polling configuration).
// - `api`: the `Transport` seam and its blocking HTTP implementation.
// - `handle`: kind-tagged job handles and job statuses.
// - `poller`: waits for a submitted job to reach a terminal status.
// - `pipeline`: the stage graph (upload → extract → draw/analyze →
//   download) and the per-invocation context.
// - `download`: writes finished artifacts to disk.
// - `cli` / `ui`: argument surface and everything printed to the terminal.
pub mod api;
pub mod cli;
pub mod credentials;
pub mod download;
pub mod error;
pub mod handle;
pub mod pipeline;
pub mod poller;
pub mod settings;
pub mod ui;

pub use error::{Error, Result, TransportError};
