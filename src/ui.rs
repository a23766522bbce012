// UI layer: everything the operator sees. Status lines go to stdout, errors
// and warnings to stderr, and a spinner runs while a job is being polled.
// The interactive `configure` prompts also live here.

use crate::credentials::{mask, Field, Layer, Source, DEFAULT_API_URL};
use crate::error::Error;
use crate::handle::{JobHandle, JobStatus};
use crate::pipeline::{Stage, StageObserver, Tracked};
use anyhow::Result;
use crossterm::style::{style, Color, Stylize};
use dialoguer::{Input, Password};
use indicatif::{ProgressBar, ProgressStyle};
use serde_json::Value;
use std::cell::RefCell;
use std::io::IsTerminal;
use std::time::Duration;

/// Forces informational output on or off regardless of the terminal.
pub const STDOUT_ISSHOW_ENV: &str = "ANYMOTION_STDOUT_ISSHOW";

/// Informational output is shown on terminals and hidden in pipes unless
/// `ANYMOTION_STDOUT_ISSHOW` says otherwise.
pub fn is_show() -> bool {
    match std::env::var(STDOUT_ISSHOW_ENV) {
        Ok(v) => matches!(v.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on"),
        Err(_) => std::io::stdout().is_terminal(),
    }
}

fn label(text: &str, color: Color, tty: bool) -> String {
    if tty {
        style(text).with(color).to_string()
    } else {
        text.to_string()
    }
}

pub fn echo(message: &str) {
    if is_show() {
        println!("{message}");
    }
}

pub fn echo_success(message: &str) {
    if is_show() {
        let tag = label("Success", Color::Green, std::io::stdout().is_terminal());
        println!("{tag}: {message}");
    }
}

pub fn echo_warning(message: &str) {
    let tag = label("Warning", Color::Yellow, std::io::stderr().is_terminal());
    eprintln!("{tag}: {message}");
}

pub fn echo_error(message: &str) {
    let tag = label("Error", Color::Red, std::io::stderr().is_terminal());
    eprintln!("{tag}: {message}");
}

/// Pretty JSON on stdout. Always printed: this is the command's result.
pub fn echo_json(data: &Value) {
    match serde_json::to_string_pretty(data) {
        Ok(body) => println!("{body}"),
        Err(_) => println!("{data}"),
    }
}

/// Prints a failed command. Timeouts are a warning: the job may still
/// finish on the server.
pub fn report_error(err: &anyhow::Error) {
    match err.downcast_ref::<Error>() {
        Some(e) if e.is_timeout() => echo_warning(&e.to_string()),
        _ => echo_error(&format!("{err:#}")),
    }
}

/// Spinner shown while waiting on the server; only on a terminal.
pub fn spinner(message: &str) -> Option<ProgressBar> {
    if !std::io::stdout().is_terminal() {
        return None;
    }
    let spinner = ProgressBar::new_spinner();
    if let Ok(style) = ProgressStyle::with_template("{spinner} {msg}") {
        spinner.set_style(style);
    }
    spinner.set_message(message.to_string());
    spinner.enable_steady_tick(Duration::from_millis(100));
    Some(spinner)
}

fn stage_title(stage: Stage) -> &'static str {
    match stage {
        Stage::Upload => "Upload",
        Stage::Extract => "Keypoint extraction",
        Stage::Draw => "Drawing",
        Stage::Analyze => "Analysis",
        Stage::Download => "Download",
    }
}

pub fn colored_id(handle: &JobHandle) -> String {
    let tty = std::io::stdout().is_terminal();
    format!("{} id: {}", handle.kind(), label(&handle.id().to_string(), Color::Cyan, tty))
}

/// Prints stage progress and keeps a spinner alive between `submitted`
/// and `settled`.
#[derive(Default)]
pub struct ConsoleObserver {
    spinner: RefCell<Option<ProgressBar>>,
}

impl ConsoleObserver {
    pub fn new() -> Self {
        Self::default()
    }

    fn stop_spinner(&self) {
        if let Some(spinner) = self.spinner.borrow_mut().take() {
            spinner.finish_and_clear();
        }
    }
}

impl StageObserver for ConsoleObserver {
    fn submitted(&self, stage: Stage, handle: &JobHandle) {
        echo(&format!("{} started. ({})", stage_title(stage), colored_id(handle)));
        *self.spinner.borrow_mut() = spinner("Processing...");
    }

    fn settled(&self, stage: Stage, job: &Tracked) {
        self.stop_spinner();
        if stage != Stage::Upload && job.status == JobStatus::Success {
            echo_success(&format!("{} is complete.", stage_title(stage)));
        }
    }
}

impl Drop for ConsoleObserver {
    fn drop(&mut self) {
        self.stop_spinner();
    }
}

/// Asks for the API URL and client credentials, offering the stored values
/// as defaults. An empty secret keeps the stored one. The result is a
/// command-line layer, ready to be written back.
pub fn prompt_configuration(stored: &Layer) -> Result<Layer> {
    let api_url: String = Input::new()
        .with_prompt("AnyMotion API URL")
        .default(stored.get(Field::ApiUrl).unwrap_or(DEFAULT_API_URL).to_string())
        .interact_text()?;

    let mut client_id = Input::<String>::new();
    client_id.with_prompt("AnyMotion Client ID");
    if let Some(current) = stored.get(Field::ClientId) {
        client_id.default(current.to_string());
    }
    let client_id = client_id.interact_text()?;

    let secret_prompt = match stored.get(Field::ClientSecret) {
        Some(current) => format!("AnyMotion Client Secret [{}]", mask(current)),
        None => "AnyMotion Client Secret".to_string(),
    };
    let client_secret = Password::new()
        .with_prompt(secret_prompt)
        .allow_empty_password(stored.get(Field::ClientSecret).is_some())
        .interact()?;

    let mut entered = Layer::new(Source::Cli);
    entered.set(Field::ApiUrl, Some(api_url));
    entered.set(Field::ClientId, Some(client_id));
    entered.set(Field::ClientSecret, Some(client_secret).filter(|s| !s.is_empty()));
    Ok(entered)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn labels_are_plain_outside_a_terminal() {
        assert_eq!(label("Success", Color::Green, false), "Success");
        assert!(label("Success", Color::Green, true).contains("Success"));
    }
}
