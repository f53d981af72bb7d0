//! Out-of-process solvers.
//!
//! A solver executable must support two invocations:
//!
//! * `<exe> capabilities` prints its [`Capabilities`] as JSON on stdout.
//! * `<exe> solve <case_dir>` reads `request.json` and `mesh.npz` from
//!   `case_dir` and writes `out/result.json` + `out/result.npz` there.
//!
//! While solving, each stdout line may be a JSON object
//! `{"progress": f, "message": .., "stage_id": .., "step": n}` or
//! `{"log": .., "level": ..}`; anything else is forwarded as an info log line.
//! Cancellation is cooperative first: the runner creates `<case_dir>/CANCEL`
//! and waits a grace period for the process to exit before killing it.

use std::collections::VecDeque;
use std::fs;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc;
use std::thread;
use std::time::{Duration, Instant};

use serde::Deserialize;

use crate::case_folder;
use crate::error::{Result, SolveError};
use crate::mesh::Mesh;
use crate::request::SolveRequest;
use crate::solver::{Capabilities, SolveCallbacks, SolveOutput, Solver};

pub const CANCEL_FILE: &str = "CANCEL";

const STDERR_TAIL: usize = 20;
const CANCEL_GRACE: Duration = Duration::from_secs(5);

/// Owns a running solver process; kills and reaps it unless it was reaped.
struct ChildGuard {
    child: Child,
    reaped: bool,
}

impl ChildGuard {
    fn try_wait(&mut self) -> std::io::Result<Option<ExitStatus>> {
        let status = self.child.try_wait()?;
        self.reaped = status.is_some();
        Ok(status)
    }

    fn kill(&mut self) {
        if let Err(err) = self.child.kill() {
            log::debug!("kill of pid {} failed: {err}", self.child.id());
        }
    }
}

impl Drop for ChildGuard {
    fn drop(&mut self) {
        if !self.reaped {
            self.kill();
            let _ = self.child.wait();
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum ProtocolLine {
    Progress {
        progress: f64,
        #[serde(default)]
        message: String,
        #[serde(default)]
        stage_id: String,
        #[serde(default)]
        step: usize,
    },
    Log {
        log: String,
        #[serde(default)]
        level: Option<String>,
    },
}

fn parse_level(level: Option<&str>) -> log::Level {
    match level.map(str::to_ascii_lowercase).as_deref() {
        Some("warning") => log::Level::Warn,
        Some("critical") | Some("fatal") => log::Level::Error,
        Some(other) => other.parse().unwrap_or(log::Level::Info),
        None => log::Level::Info,
    }
}

fn forward(line: &str, callbacks: &dyn SolveCallbacks) {
    match serde_json::from_str::<ProtocolLine>(line) {
        Ok(ProtocolLine::Progress {
            progress,
            message,
            stage_id,
            step,
        }) => callbacks.on_progress(progress.clamp(0.0, 1.0), &message, &stage_id, step),
        Ok(ProtocolLine::Log { log, level }) => callbacks.on_log(parse_level(level.as_deref()), &log),
        Err(_) => callbacks.on_log(log::Level::Info, line),
    }
}

static SCRATCH_COUNTER: AtomicUsize = AtomicUsize::new(0);

/// Private case folder handed to one external solve; removed on drop.
struct ScratchCase {
    path: PathBuf,
}

impl ScratchCase {
    fn create(request: &SolveRequest, mesh: &Mesh) -> Result<ScratchCase> {
        let path = std::env::temp_dir().join(format!(
            "terrasolve-external-{}-{}",
            std::process::id(),
            SCRATCH_COUNTER.fetch_add(1, Ordering::Relaxed)
        ));
        if path.exists() {
            fs::remove_dir_all(&path).map_err(SolveError::io(format!("removing {}", path.display())))?;
        }
        let scratch = ScratchCase { path };
        case_folder::write_case(&scratch.path, request, mesh)?;
        Ok(scratch)
    }
}

impl Drop for ScratchCase {
    fn drop(&mut self) {
        let _ = fs::remove_dir_all(&self.path);
    }
}

/// A solver executable driven through the process protocol.
#[derive(Debug, Clone)]
pub struct ProcessSolver {
    program: PathBuf,
    capabilities: Capabilities,
    poll_interval: Duration,
    cancel_grace: Duration,
}

impl ProcessSolver {
    /// Runs `<program> capabilities` and keeps the answer.
    pub fn load(program: &Path) -> Result<ProcessSolver> {
        let output = Command::new(program)
            .arg("capabilities")
            .stdin(Stdio::null())
            .output()
            .map_err(|err| {
                SolveError::SolverImport(format!("Unable to start {}: {err}", program.display()))
            })?;
        if !output.status.success() {
            return Err(SolveError::SolverImport(format!(
                "{} capabilities exited with {}: {}",
                program.display(),
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        let capabilities: Capabilities = serde_json::from_slice(&output.stdout).map_err(|err| {
            SolveError::SolverImport(format!(
                "{} printed invalid capabilities: {err}",
                program.display()
            ))
        })?;

        Ok(ProcessSolver {
            program: program.to_path_buf(),
            capabilities,
            poll_interval: Duration::from_millis(50),
            cancel_grace: CANCEL_GRACE,
        })
    }

    /// How long a canceled process may keep running before it is killed.
    pub fn with_cancel_grace(mut self, grace: Duration) -> ProcessSolver {
        self.cancel_grace = grace;
        self
    }

    pub fn program(&self) -> &Path {
        &self.program
    }
}

impl Solver for ProcessSolver {
    fn capabilities(&self) -> Capabilities {
        self.capabilities.clone()
    }

    fn solve(&self, request: &SolveRequest, mesh: &Mesh, callbacks: &dyn SolveCallbacks) -> Result<SolveOutput> {
        let scratch = ScratchCase::create(request, mesh)?;
        let mut child = Command::new(&self.program)
            .arg("solve")
            .arg(&scratch.path)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map(|child| ChildGuard { child, reaped: false })
            .map_err(|err| {
                SolveError::SolverRuntime(format!("Unable to start {}: {err}", self.program.display()))
            })?;

        let (tx, rx) = mpsc::channel::<String>();
        let stdout = child.child.stdout.take();
        let stdout_reader = thread::spawn(move || {
            if let Some(stdout) = stdout {
                for line in BufReader::new(stdout).lines().map_while(std::result::Result::ok) {
                    if tx.send(line).is_err() {
                        break;
                    }
                }
            }
        });
        let stderr = child.child.stderr.take();
        let stderr_reader = thread::spawn(move || {
            let mut tail = VecDeque::with_capacity(STDERR_TAIL);
            if let Some(stderr) = stderr {
                for line in BufReader::new(stderr).lines().map_while(std::result::Result::ok) {
                    if tail.len() == STDERR_TAIL {
                        tail.pop_front();
                    }
                    tail.push_back(line);
                }
            }
            Vec::from(tail).join("\n")
        });

        let mut cancel_deadline: Option<Instant> = None;
        let mut killed = false;
        let status = loop {
            match rx.recv_timeout(self.poll_interval) {
                Ok(line) => forward(line.trim(), callbacks),
                Err(mpsc::RecvTimeoutError::Timeout) | Err(mpsc::RecvTimeoutError::Disconnected) => {}
            }
            if cancel_deadline.is_none() && callbacks.should_cancel() {
                let marker = scratch.path.join(CANCEL_FILE);
                cancel_deadline = Some(match fs::write(&marker, b"") {
                    Ok(()) => {
                        log::info!("requested cancellation of {}", self.program.display());
                        Instant::now() + self.cancel_grace
                    }
                    Err(err) => {
                        log::warn!("could not write {}: {err}", marker.display());
                        Instant::now()
                    }
                });
            }
            if let Some(deadline) = cancel_deadline {
                if !killed && Instant::now() >= deadline {
                    log::warn!("{} ignored cancellation, killing it", self.program.display());
                    child.kill();
                    killed = true;
                }
            }
            match child.try_wait() {
                Ok(Some(status)) => break status,
                Ok(None) => {}
                Err(err) => {
                    return Err(SolveError::io(format!("waiting for {}", self.program.display()))(err))
                }
            }
        };
        let cancel_requested = cancel_deadline.is_some();

        // Grandchildren of a killed process may still hold the pipes open.
        let stderr_tail = if killed {
            String::new()
        } else {
            let _ = stdout_reader.join();
            stderr_reader.join().unwrap_or_default()
        };
        for line in rx.try_iter() {
            forward(line.trim(), callbacks);
        }

        if !status.success() {
            if cancel_requested {
                return Err(SolveError::Cancelled(format!(
                    "{} stopped after cancellation ({status})",
                    self.program.display()
                )));
            }
            return Err(SolveError::SolverRuntime(format!(
                "{} exited with {status}: {stderr_tail}",
                self.program.display()
            )));
        }

        let (meta, arrays) = case_folder::read_outputs(&case_folder::out_dir(&scratch.path))?;
        Ok(SolveOutput { meta, arrays })
    }
}
