use std::process::Command;

use anyhow::{Context, Result};
use tracing::debug;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProcessOutput {
    pub code: i32,
    pub stdout: String,
    pub stderr: String,
}

/// Runs an external process to completion. Package execution, detection
/// probes, and restarts all go through this seam so tests can replace it.
pub trait ProcessRunner: Send + Sync {
    fn run(&self, command: &mut Command) -> Result<ProcessOutput>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemProcessRunner;

impl ProcessRunner for SystemProcessRunner {
    fn run(&self, command: &mut Command) -> Result<ProcessOutput> {
        let description = describe_command(command);
        debug!(command = %description, "starting process");
        let output = command
            .output()
            .with_context(|| format!("failed to start process: {description}"))?;
        // A process killed by a signal has no exit code.
        let code = output.status.code().unwrap_or(-1);
        debug!(command = %description, code, "process exited");
        Ok(ProcessOutput {
            code,
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}

pub fn describe_command(command: &Command) -> String {
    let mut rendered = command.get_program().to_string_lossy().into_owned();
    for arg in command.get_args() {
        rendered.push(' ');
        rendered.push_str(&arg.to_string_lossy());
    }
    rendered
}

/// Splits an authored argument string on whitespace, keeping double-quoted
/// runs together.
pub fn split_arguments(raw: &str) -> Vec<String> {
    let mut arguments = Vec::new();
    let mut current = String::new();
    let mut in_quotes = false;
    let mut has_token = false;

    for ch in raw.chars() {
        match ch {
            '"' => {
                in_quotes = !in_quotes;
                has_token = true;
            }
            ch if ch.is_whitespace() && !in_quotes => {
                if has_token {
                    arguments.push(std::mem::take(&mut current));
                    has_token = false;
                }
            }
            ch => {
                current.push(ch);
                has_token = true;
            }
        }
    }
    if has_token {
        arguments.push(current);
    }
    arguments
}
