use crate::error::{PkgupError, Result};
use std::io::Read;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver};
use std::thread;
use std::time::{Duration, Instant};

const POLL_INTERVAL: Duration = Duration::from_millis(25);
const DRAIN_GRACE: Duration = Duration::from_secs(2);

/// Shared flag flipped once when the user interrupts the run.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken(Arc<AtomicBool>);

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    Exited,
    TimedOut,
    Cancelled,
}

#[derive(Debug, Clone)]
pub struct ProcessOutput {
    pub exit_code: Option<i32>,
    pub success: bool,
    pub stdout: String,
    pub stderr: String,
    pub duration: Duration,
    pub termination: Termination,
}

impl ProcessOutput {
    pub fn combined(&self) -> String {
        match (self.stdout.trim().is_empty(), self.stderr.trim().is_empty()) {
            (false, false) => format!("{}\n{}", self.stdout.trim_end(), self.stderr.trim_end()),
            (false, true) => self.stdout.trim_end().to_string(),
            (true, false) => self.stderr.trim_end().to_string(),
            (true, true) => String::new(),
        }
    }
}

/// Keep at most the last `max_bytes` of `text`, cut on a char boundary.
pub fn tail(text: &str, max_bytes: usize) -> &str {
    if text.len() <= max_bytes {
        return text;
    }
    let mut start = text.len() - max_bytes;
    while !text.is_char_boundary(start) {
        start += 1;
    }
    &text[start..]
}

fn spawn_reader<R: Read + Send + 'static>(source: Option<R>) -> Receiver<Vec<u8>> {
    let (tx, rx) = mpsc::channel();
    thread::spawn(move || {
        let mut buf = Vec::new();
        if let Some(mut source) = source {
            let _ = source.read_to_end(&mut buf);
        }
        let _ = tx.send(buf);
    });
    rx
}

fn collect(rx: &Receiver<Vec<u8>>, grace: Duration) -> String {
    rx.recv_timeout(grace)
        .map(|buf| String::from_utf8_lossy(&buf).into_owned())
        .unwrap_or_default()
}

fn kill_and_reap(child: &mut Child) -> Option<ExitStatus> {
    let _ = child.kill();
    child.wait().ok()
}

/// Run `command` to completion with captured output, killing it when it
/// outlives `timeout` or the run is cancelled.
pub fn run_with_timeout(
    mut command: Command,
    timeout: Duration,
    cancel: &CancellationToken,
) -> Result<ProcessOutput> {
    let program = command.get_program().to_string_lossy().into_owned();
    tracing::debug!(
        program = %program,
        args = ?command.get_args().collect::<Vec<_>>(),
        timeout_secs = timeout.as_secs(),
        "spawning process"
    );

    let started = Instant::now();
    let mut child = command
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|e| PkgupError::Execution(format!("Failed to spawn '{program}': {e}")))?;

    let stdout_rx = spawn_reader(child.stdout.take());
    let stderr_rx = spawn_reader(child.stderr.take());

    let (status, termination) = loop {
        match child.try_wait() {
            // A child killed by the same interrupt counts as cancelled.
            Ok(Some(status)) if !status.success() && cancel.is_cancelled() => {
                break (Some(status), Termination::Cancelled);
            }
            Ok(Some(status)) => break (Some(status), Termination::Exited),
            Ok(None) => {}
            Err(e) => {
                kill_and_reap(&mut child);
                return Err(PkgupError::Execution(format!(
                    "Failed to wait for '{program}': {e}"
                )));
            }
        }

        if cancel.is_cancelled() {
            break (kill_and_reap(&mut child), Termination::Cancelled);
        }
        if started.elapsed() >= timeout {
            break (kill_and_reap(&mut child), Termination::TimedOut);
        }
        thread::sleep(POLL_INTERVAL);
    };

    let grace = match termination {
        Termination::Exited => Duration::from_secs(30),
        _ => DRAIN_GRACE,
    };
    let stdout = collect(&stdout_rx, grace);
    let stderr = collect(&stderr_rx, grace);
    let duration = started.elapsed();

    let exit_code = status.and_then(|s| s.code());
    let success = termination == Termination::Exited && status.is_some_and(|s| s.success());

    tracing::debug!(
        program = %program,
        exit_code = ?exit_code,
        termination = ?termination,
        elapsed_ms = duration.as_millis() as u64,
        "process finished"
    );

    Ok(ProcessOutput {
        exit_code,
        success,
        stdout,
        stderr,
        duration,
        termination,
    })
}
