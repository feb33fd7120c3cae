//! Ping probe implementation delegating echo bursts to the system `ping` command.
//!
//! Output is read line by line so every echo reply surfaces as its own event
//! while the burst is still running.

use std::future::Future;
use std::process::Stdio;
use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;

use super::{MeasurementEvent, ProbeError, StreamParser};

/// Echo requests sent per burst.
pub const ECHO_BURST_COUNT: u32 = 10;
/// Spacing between echo requests within a burst, in seconds.
pub const ECHO_SPACING_SECS: &str = "0.5";

/// Capability that runs one burst of echo probes and streams its output lines.
///
/// The stream ends when the burst is over. Dropping the receiver aborts the
/// burst.
pub trait EchoRunner: Send + Sync {
    fn run_echo_burst(&self, target: &str) -> Result<mpsc::Receiver<String>, ProbeError>;
}

/// Runs bursts through the system `ping` binary.
#[derive(Debug, Clone)]
pub struct CommandEchoRunner {
    program: String,
}

impl Default for CommandEchoRunner {
    fn default() -> Self {
        Self {
            program: "ping".to_string(),
        }
    }
}

impl CommandEchoRunner {
    fn args(target: &str) -> Vec<String> {
        let mut args = vec![
            "-c".to_string(),
            ECHO_BURST_COUNT.to_string(),
            "-i".to_string(),
            ECHO_SPACING_SECS.to_string(),
        ];
        // iputils only reports unanswered requests when asked to
        if cfg!(target_os = "linux") {
            args.push("-O".to_string());
        }
        args.push(target.to_string());
        args
    }
}

impl EchoRunner for CommandEchoRunner {
    fn run_echo_burst(&self, target: &str) -> Result<mpsc::Receiver<String>, ProbeError> {
        let mut child = Command::new(&self.program)
            .args(Self::args(target))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| ProbeError::Command(format!("failed to execute ping: {}", e)))?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| ProbeError::Command("ping stdout not captured".to_string()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| ProbeError::Command("ping stderr not captured".to_string()))?;

        let (tx, rx) = mpsc::channel(64);

        tokio::spawn(async move {
            let mut out = BufReader::new(stdout).lines();
            let mut err = BufReader::new(stderr).lines();
            let mut out_done = false;
            let mut err_done = false;

            while !(out_done && err_done) {
                let line = tokio::select! {
                    line = out.next_line(), if !out_done => match line {
                        Ok(Some(line)) => line,
                        _ => {
                            out_done = true;
                            continue;
                        }
                    },
                    line = err.next_line(), if !err_done => match line {
                        Ok(Some(line)) => line,
                        _ => {
                            err_done = true;
                            continue;
                        }
                    },
                    _ = tx.closed() => break,
                };

                if tx.send(line).await.is_err() {
                    break;
                }
            }

            // No-op when the burst already finished
            let _ = child.start_kill();
            if let Err(e) = child.wait().await {
                tracing::debug!("Failed to reap ping process: {}", e);
            }
        });

        Ok(rx)
    }
}

/// Reject targets that could be mistaken for command-line options.
pub fn validate_ping_target(target: &str) -> Result<(), ProbeError> {
    if target.is_empty() {
        return Err(ProbeError::Config("target must not be empty".to_string()));
    }
    if target.starts_with('-') || target.chars().any(char::is_whitespace) {
        return Err(ProbeError::Config(format!("invalid ping target: {:?}", target)));
    }
    Ok(())
}

/// Per-task ping state: the target, its parser and the burst runner.
pub struct PingProbe {
    target: String,
    parser: StreamParser,
    runner: Arc<dyn EchoRunner>,
}

impl PingProbe {
    pub fn new(target: &str, runner: Arc<dyn EchoRunner>) -> Self {
        Self {
            target: target.to_string(),
            parser: StreamParser::new(),
            runner,
        }
    }

    pub fn target_ip(&self) -> Option<&str> {
        self.parser.target_ip()
    }

    /// Run one echo burst, handing each event to `emit` as soon as its line
    /// is read. Returns the number of events emitted.
    ///
    /// The burst is abandoned when `stopped` resolves. A burst that produces
    /// no event at all is reported as a single failure.
    pub async fn run_burst<S, F>(&mut self, stopped: S, mut emit: F) -> usize
    where
        S: Future<Output = ()>,
        F: FnMut(MeasurementEvent),
    {
        self.parser.begin_burst();

        let mut lines = match self.runner.run_echo_burst(&self.target) {
            Ok(lines) => lines,
            Err(e) => {
                tracing::warn!("Ping probe for {} failed to start: {}", self.target, e);
                emit(MeasurementEvent::failure(self.target_ip().map(String::from), e.to_string()));
                return 1;
            }
        };

        tokio::pin!(stopped);
        let mut emitted = 0;
        let mut last_unclassified: Option<String> = None;

        loop {
            let line = tokio::select! {
                biased;
                _ = &mut stopped => return emitted,
                line = lines.recv() => line,
            };
            let Some(line) = line else { break };

            match self.parser.parse_line(&line) {
                Some(event) => {
                    emit(event);
                    emitted += 1;
                }
                None => {
                    let trimmed = line.trim();
                    if !trimmed.is_empty() {
                        last_unclassified = Some(trimmed.to_string());
                    }
                }
            }
        }

        for event in self.parser.end_burst() {
            emit(event);
            emitted += 1;
        }

        if emitted == 0 {
            let reason = match last_unclassified {
                Some(line) => format!("no echo replies: {}", line),
                None => "ping produced no output".to_string(),
            };
            emit(MeasurementEvent::failure(self.target_ip().map(String::from), reason));
            emitted = 1;
        }

        emitted
    }
}
