//! Runs one case folder end to end on a worker thread.
//!
//! ```text
//! Idle -> Validating -> Running -> Success
//!              |            |----> Failed
//!              |            '----> Canceled
//!              '--> Failed | Canceled
//! ```
//!
//! The worker reads the case, resolves the solver, prechecks, solves, checks
//! the produced arrays and replaces `out/`. Every failure past reading the
//! case is turned into an [`ErrorInfo`] plus a diagnostics bundle; precheck
//! errors only block the run.

use std::collections::VecDeque;
use std::fmt::Display;
use std::panic::{self, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant, SystemTime};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::case_folder;
use crate::diagnostics::{self, DiagnosticsBundle, DiagnosticsContext};
use crate::error::{ErrorInfo, Result, SolveError, PRECHECK_CODE};
use crate::precheck::{self, PrecheckIssue, Severity};
use crate::registry::SolverRegistry;
use crate::result::RunStatus;
use crate::solver::{Capabilities, SolveCallbacks, SolveOutput};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunState {
    Idle,
    Validating,
    Running,
    Success,
    Failed,
    Canceled,
}

impl RunState {
    pub fn as_str(self) -> &'static str {
        match self {
            RunState::Idle => "idle",
            RunState::Validating => "validating",
            RunState::Running => "running",
            RunState::Success => "success",
            RunState::Failed => "failed",
            RunState::Canceled => "canceled",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, RunState::Success | RunState::Failed | RunState::Canceled)
    }

    pub fn can_transition_to(self, next: RunState) -> bool {
        use RunState::*;
        matches!(
            (self, next),
            (Idle, Validating)
                | (Validating, Running)
                | (Validating, Failed)
                | (Validating, Canceled)
                | (Running, Success)
                | (Running, Failed)
                | (Running, Canceled)
        )
    }

    /// Terminal state to status; `None` while the run is still going.
    pub fn status(self) -> Option<RunStatus> {
        match self {
            RunState::Success => Some(RunStatus::Success),
            RunState::Failed => Some(RunStatus::Failed),
            RunState::Canceled => Some(RunStatus::Canceled),
            _ => None,
        }
    }
}

impl Display for RunState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Shared run state that only moves along legal transitions.
#[derive(Debug, Clone)]
pub struct StateCell(Arc<Mutex<RunState>>);

impl Default for StateCell {
    fn default() -> StateCell {
        StateCell(Arc::new(Mutex::new(RunState::Idle)))
    }
}

impl StateCell {
    pub fn get(&self) -> RunState {
        *self.0.lock()
    }

    pub fn advance(&self, next: RunState) -> Result<()> {
        let mut state = self.0.lock();
        if !state.can_transition_to(next) {
            return Err(SolveError::SolverRuntime(format!(
                "illegal run state transition {} -> {next}",
                *state
            )));
        }
        *state = next;
        Ok(())
    }
}

/// Cooperative cancellation flag shared between a caller and a run.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> CancelToken {
        CancelToken::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum RunEvent {
    State(RunState),
    Progress {
        fraction: f64,
        message: String,
        stage_id: String,
        step: usize,
    },
    Log {
        level: log::Level,
        message: String,
    },
    Issue(PrecheckIssue),
}

#[derive(Debug, Clone)]
pub struct OrchestratorOptions {
    /// Most recent log lines kept for diagnostics.
    pub max_log_lines: usize,
    /// Add an existing `out/` to diagnostics bundles.
    pub include_outputs_in_bundle: bool,
    pub build_diagnostics: bool,
}

impl Default for OrchestratorOptions {
    fn default() -> OrchestratorOptions {
        OrchestratorOptions {
            max_log_lines: 5000,
            include_outputs_in_bundle: true,
            build_diagnostics: true,
        }
    }
}

/// Outcome of one run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunOutcome {
    pub case_dir: PathBuf,
    pub solver_selector: String,
    pub status: RunStatus,
    pub final_state: RunState,
    pub out_dir: Option<PathBuf>,
    pub error: Option<ErrorInfo>,
    pub issues: Vec<PrecheckIssue>,
    pub diagnostics: Option<DiagnosticsBundle>,
    pub elapsed: Duration,
}

impl RunOutcome {
    pub fn is_success(&self) -> bool {
        self.status == RunStatus::Success
    }

    pub fn error_code(&self) -> Option<&str> {
        self.error.as_ref().map(|e| e.code.as_str())
    }
}

/// Bounded buffer of the most recent log lines.
#[derive(Debug)]
struct LogRing {
    lines: Mutex<VecDeque<String>>,
    capacity: usize,
}

impl LogRing {
    fn new(capacity: usize) -> LogRing {
        LogRing {
            lines: Mutex::new(VecDeque::new()),
            capacity: capacity.max(1),
        }
    }

    fn push(&self, level: log::Level, message: &str) {
        let mut lines = self.lines.lock();
        if lines.len() == self.capacity {
            lines.pop_front();
        }
        let stamp = chrono::Local::now().format("%H:%M:%S%.3f");
        lines.push_back(format!("{stamp} [{level}] {message}"));
    }

    fn snapshot(&self) -> Vec<String> {
        self.lines.lock().iter().cloned().collect()
    }
}

/// Worker-side view of a run: event channel, logs, state and cancel flag.
struct RunContext {
    case_dir: PathBuf,
    selector: String,
    events: Sender<RunEvent>,
    logs: LogRing,
    state: StateCell,
    cancel: CancelToken,
    /// Wall clock at spawn; older files in `out/` predate this run.
    started_at: SystemTime,
}

impl RunContext {
    fn emit(&self, event: RunEvent) {
        // The receiver may be gone; the run carries on regardless.
        let _ = self.events.send(event);
    }

    fn log(&self, level: log::Level, message: &str) {
        log::log!(level, "{}: {message}", self.case_dir.display());
        self.logs.push(level, message);
        self.emit(RunEvent::Log {
            level,
            message: message.to_owned(),
        });
    }

    fn advance(&self, next: RunState) -> Result<()> {
        self.state.advance(next)?;
        self.log(log::Level::Debug, &format!("state -> {next}"));
        self.emit(RunEvent::State(next));
        Ok(())
    }
}

impl SolveCallbacks for RunContext {
    fn on_progress(&self, fraction: f64, message: &str, stage_id: &str, step: usize) {
        log::debug!("{:.0}% {message}", fraction * 100.0);
        self.emit(RunEvent::Progress {
            fraction,
            message: message.to_owned(),
            stage_id: stage_id.to_owned(),
            step,
        });
    }

    fn on_log(&self, level: log::Level, message: &str) {
        self.log(level, message);
    }

    fn should_cancel(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

/// Renders an error with its source chain and, when enabled through
/// `RUST_BACKTRACE`, a backtrace of the reporting thread.
fn traceback(err: &(dyn std::error::Error + 'static)) -> String {
    let mut text = err.to_string();
    let mut source = err.source();
    while let Some(cause) = source {
        text.push_str(&format!("\ncaused by: {cause}"));
        source = cause.source();
    }
    let backtrace = std::backtrace::Backtrace::capture();
    if backtrace.status() == std::backtrace::BacktraceStatus::Captured {
        text.push_str(&format!("\n\n{backtrace}"));
    }
    text
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_owned()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_owned()
    }
}

/// Where a failed run stopped, for error mapping and bundles.
struct Failure {
    error: SolveError,
    capabilities: Option<Capabilities>,
}

impl From<SolveError> for Failure {
    fn from(error: SolveError) -> Failure {
        Failure {
            error,
            capabilities: None,
        }
    }
}

enum Completion {
    Solved(PathBuf),
    Blocked,
}

pub struct Orchestrator {
    registry: Arc<SolverRegistry>,
    options: OrchestratorOptions,
}

impl Orchestrator {
    pub fn new(registry: Arc<SolverRegistry>) -> Orchestrator {
        Orchestrator::with_options(registry, OrchestratorOptions::default())
    }

    pub fn with_options(registry: Arc<SolverRegistry>, options: OrchestratorOptions) -> Orchestrator {
        Orchestrator { registry, options }
    }

    pub fn registry(&self) -> &Arc<SolverRegistry> {
        &self.registry
    }

    /// Starts a run with a fresh cancel token.
    pub fn spawn(&self, case_dir: &Path, selector: &str) -> Result<RunHandle> {
        self.spawn_with_cancel(case_dir, selector, CancelToken::new())
    }

    /// Starts a run that stops cooperatively once `cancel` is set.
    pub fn spawn_with_cancel(&self, case_dir: &Path, selector: &str, cancel: CancelToken) -> Result<RunHandle> {
        let (tx, rx) = mpsc::channel();
        let state = StateCell::default();
        let context = RunContext {
            case_dir: case_dir.to_path_buf(),
            selector: selector.to_owned(),
            events: tx,
            logs: LogRing::new(self.options.max_log_lines),
            state: state.clone(),
            cancel: cancel.clone(),
            started_at: SystemTime::now(),
        };
        let registry = Arc::clone(&self.registry);
        let options = self.options.clone();
        let started = Instant::now();

        let name = match case_dir.file_name() {
            Some(name) => format!("run-{}", name.to_string_lossy()),
            None => "run".to_owned(),
        };
        let thread = thread::Builder::new()
            .name(name)
            .spawn(move || execute(&registry, &options, context, started))
            .map_err(SolveError::io("spawning run thread"))?;

        Ok(RunHandle {
            events: rx,
            cancel,
            state,
            thread,
            case_dir: case_dir.to_path_buf(),
            selector: selector.to_owned(),
            started,
        })
    }

    /// Blocking run; events are only mirrored to the log.
    pub fn run(&self, case_dir: &Path, selector: &str, cancel: &CancelToken) -> RunOutcome {
        let started = Instant::now();
        match self.spawn_with_cancel(case_dir, selector, cancel.clone()) {
            Ok(handle) => handle.wait(),
            Err(err) => RunOutcome {
                case_dir: case_dir.to_path_buf(),
                solver_selector: selector.to_owned(),
                status: RunStatus::Failed,
                final_state: RunState::Idle,
                out_dir: None,
                error: Some(err.info()),
                issues: Vec::new(),
                diagnostics: None,
                elapsed: started.elapsed(),
            },
        }
    }
}

/// Caller side of a running case.
pub struct RunHandle {
    events: Receiver<RunEvent>,
    cancel: CancelToken,
    state: StateCell,
    thread: JoinHandle<RunOutcome>,
    case_dir: PathBuf,
    selector: String,
    started: Instant,
}

impl RunHandle {
    pub fn events(&self) -> &Receiver<RunEvent> {
        &self.events
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn cancel_token(&self) -> &CancelToken {
        &self.cancel
    }

    pub fn state(&self) -> RunState {
        self.state.get()
    }

    pub fn is_finished(&self) -> bool {
        self.thread.is_finished()
    }

    /// Joins the worker. A worker that panicked outside the solver call
    /// yields a failed outcome without diagnostics.
    pub fn wait(self) -> RunOutcome {
        match self.thread.join() {
            Ok(outcome) => outcome,
            Err(payload) => {
                let message = format!("run thread panicked: {}", panic_message(payload.as_ref()));
                log::error!("{}: {message}", self.case_dir.display());
                RunOutcome {
                    case_dir: self.case_dir,
                    solver_selector: self.selector,
                    status: RunStatus::Failed,
                    final_state: RunState::Failed,
                    out_dir: None,
                    error: Some(SolveError::SolverRuntime(message).info()),
                    issues: Vec::new(),
                    diagnostics: None,
                    elapsed: self.started.elapsed(),
                }
            }
        }
    }
}

fn execute(
    registry: &SolverRegistry,
    options: &OrchestratorOptions,
    context: RunContext,
    started: Instant,
) -> RunOutcome {
    let mut issues = Vec::new();
    let result = drive(registry, &context, &mut issues);

    let mut outcome = RunOutcome {
        case_dir: context.case_dir.clone(),
        solver_selector: context.selector.clone(),
        status: RunStatus::Failed,
        final_state: context.state.get(),
        out_dir: None,
        error: None,
        issues,
        diagnostics: None,
        elapsed: Duration::ZERO,
    };

    match result {
        Ok(Completion::Solved(out_dir)) => {
            outcome.out_dir = Some(out_dir);
        }
        Ok(Completion::Blocked) => {
            let (errors, warnings, _) = precheck::summarize(&outcome.issues);
            let message = format!("precheck found {errors} error(s) and {warnings} warning(s)");
            context.log(log::Level::Error, &message);
            finish(&context, RunState::Failed);
            outcome.error = Some(ErrorInfo::new(PRECHECK_CODE, message));
        }
        Err(failure) => {
            let error = failure.error;
            let info = error.info();
            context.log(log::Level::Error, &info.to_string());
            finish(
                &context,
                if error.is_cancelled() {
                    RunState::Canceled
                } else {
                    RunState::Failed
                },
            );

            if options.build_diagnostics && context.case_dir.is_dir() {
                let bundle_context = DiagnosticsContext {
                    solver_selector: context.selector.clone(),
                    capabilities: failure.capabilities,
                    state: Some(context.state.get().to_string()),
                    error: Some(info.clone()),
                    traceback: Some(traceback(&error)),
                    logs: context.logs.snapshot(),
                    include_outputs: options.include_outputs_in_bundle,
                    outputs_since: Some(context.started_at),
                };
                match diagnostics::build_bundle(&context.case_dir, &bundle_context) {
                    Ok(bundle) => outcome.diagnostics = Some(bundle),
                    Err(err) => log::warn!("could not write diagnostics: {err}"),
                }
            }
            outcome.error = Some(info);
        }
    }

    outcome.final_state = context.state.get();
    outcome.status = outcome.final_state.status().unwrap_or(RunStatus::Failed);
    outcome.elapsed = started.elapsed();
    log::info!(
        "{} finished: {} in {:.2}s",
        context.case_dir.display(),
        outcome.status,
        outcome.elapsed.as_secs_f64()
    );
    outcome
}

/// Moves to a terminal state from wherever the run stopped; a run that
/// failed before validation started passes through `Validating`.
fn finish(context: &RunContext, terminal: RunState) {
    if context.state.get() == RunState::Idle {
        let _ = context.advance(RunState::Validating);
    }
    if let Err(err) = context.advance(terminal) {
        log::warn!("{err}");
    }
}

fn drive(
    registry: &SolverRegistry,
    context: &RunContext,
    issues: &mut Vec<PrecheckIssue>,
) -> std::result::Result<Completion, Failure> {
    context.advance(RunState::Validating)?;
    let (request, mesh) = case_folder::read_case(&context.case_dir)?;
    let solver = registry.resolve(&context.selector)?;
    let canonical = SolverRegistry::canonical_selector(&context.selector);
    let capabilities = registry
        .cache()
        .get_or_try_insert_with(&canonical, || Ok(solver.capabilities()))?;
    let with_caps = |error: SolveError| Failure {
        error,
        capabilities: Some((*capabilities).clone()),
    };

    context.log(
        log::Level::Info,
        &format!(
            "solver {} {} for {} stage(s), {} cells",
            capabilities.name,
            capabilities.version,
            request.stages.len(),
            mesh.num_cells()
        ),
    );

    *issues = precheck::validate(&request, &mesh, Some(&capabilities));
    for issue in issues.iter() {
        let level = match issue.severity {
            Severity::Error => log::Level::Error,
            Severity::Warn => log::Level::Warn,
            Severity::Info => log::Level::Info,
        };
        context.log(level, &issue.to_string());
        context.emit(RunEvent::Issue(issue.clone()));
    }
    if precheck::has_errors(issues) {
        return Ok(Completion::Blocked);
    }

    if context.cancel.is_cancelled() {
        return Err(with_caps(SolveError::Cancelled("canceled before solve".to_owned())));
    }
    context.advance(RunState::Running).map_err(with_caps)?;

    let solved = panic::catch_unwind(AssertUnwindSafe(|| solver.solve(&request, &mesh, context)));
    let SolveOutput { meta, arrays } = match solved {
        Ok(result) => result.map_err(with_caps)?,
        Err(payload) => {
            return Err(with_caps(SolveError::SolverRuntime(format!(
                "solver panicked: {}",
                panic_message(payload.as_ref())
            ))))
        }
    };

    meta.check_arrays(&arrays, &mesh).map_err(with_caps)?;
    let out_dir = case_folder::replace_outputs(&context.case_dir, &meta, &arrays).map_err(with_caps)?;
    context.log(
        log::Level::Info,
        &format!("wrote {} arrays to {}", arrays.len(), out_dir.display()),
    );
    context.advance(RunState::Success).map_err(with_caps)?;
    Ok(Completion::Solved(out_dir))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cases::{elastic_case, StructuredGrid};
    use crate::mesh::Mesh;
    use crate::request::SolveRequest;
    use crate::solver::Solver;
    use crate::testutil::TempDirGuard;

    fn small_case(dir: &Path) {
        let (request, mesh) = elastic_case(&StructuredGrid::new(2.0, 1.0, 4, 2));
        case_folder::write_case(dir, &request, &mesh).unwrap();
    }

    fn orchestrator() -> Orchestrator {
        Orchestrator::new(Arc::new(SolverRegistry::new()))
    }

    #[test]
    fn state_transitions() {
        assert!(RunState::Idle.can_transition_to(RunState::Validating));
        assert!(!RunState::Idle.can_transition_to(RunState::Running));
        assert!(!RunState::Success.can_transition_to(RunState::Failed));
        assert!(!RunState::Running.can_transition_to(RunState::Validating));

        let cell = StateCell::default();
        cell.advance(RunState::Validating).unwrap();
        assert!(cell.advance(RunState::Success).is_err());
        assert_eq!(cell.get(), RunState::Validating);
    }

    #[test]
    fn successful_run_writes_outputs_and_reports_events() {
        let tmp = TempDirGuard::new("orch-success");
        small_case(tmp.path());

        let handle = orchestrator().spawn(tmp.path(), "ref_elastic").unwrap();
        let outcome = handle.wait();
        assert!(outcome.is_success(), "{:?}", outcome.error);
        assert_eq!(outcome.final_state, RunState::Success);
        assert_eq!(outcome.out_dir, Some(case_folder::out_dir(tmp.path())));
        assert!(outcome.diagnostics.is_none());

        let (meta, arrays) = case_folder::read_outputs(&case_folder::out_dir(tmp.path())).unwrap();
        assert_eq!(meta.global_steps.len(), 8);
        assert_eq!(arrays.steps().len(), 8);
    }

    #[test]
    fn event_stream_ends_in_success() {
        let tmp = TempDirGuard::new("orch-events");
        small_case(tmp.path());
        let handle = orchestrator().spawn(tmp.path(), "noop").unwrap();
        let events: Vec<RunEvent> = handle.events().iter().collect();
        let outcome = handle.wait();
        assert!(outcome.is_success());

        let states: Vec<RunState> = events
            .iter()
            .filter_map(|e| match e {
                RunEvent::State(s) => Some(*s),
                _ => None,
            })
            .collect();
        assert_eq!(states, vec![RunState::Validating, RunState::Running, RunState::Success]);
        let last_progress = events.iter().rev().find_map(|e| match e {
            RunEvent::Progress { fraction, .. } => Some(*fraction),
            _ => None,
        });
        assert_eq!(last_progress, Some(1.0));
    }

    #[test]
    fn precheck_errors_block_without_bundle() {
        let tmp = TempDirGuard::new("orch-precheck");
        let (mut request, mesh) = elastic_case(&StructuredGrid::new(2.0, 1.0, 2, 1));
        request.stages[0].loads[0].set = Some("ghost".into());
        case_folder::write_case(tmp.path(), &request, &mesh).unwrap();

        let outcome = orchestrator().run(tmp.path(), "reference_elastic", &CancelToken::new());
        assert_eq!(outcome.status, RunStatus::Failed);
        assert_eq!(outcome.error_code(), Some(PRECHECK_CODE));
        assert_eq!(outcome.issues.len(), 1);
        assert!(outcome.diagnostics.is_none());
        assert!(!case_folder::out_dir(tmp.path()).exists());
    }

    #[test]
    fn cancel_before_solve_leaves_no_outputs() {
        let tmp = TempDirGuard::new("orch-cancel");
        small_case(tmp.path());
        let cancel = CancelToken::new();
        cancel.cancel();

        let outcome = orchestrator().run(tmp.path(), "reference_elastic", &cancel);
        assert_eq!(outcome.status, RunStatus::Canceled);
        assert_eq!(outcome.final_state, RunState::Canceled);
        assert_eq!(outcome.error_code(), Some("CANCELED"));
        assert!(!case_folder::out_dir(tmp.path()).exists());
        assert!(outcome.diagnostics.unwrap().zip_path.is_file());
    }

    #[test]
    fn unknown_solver_fails_with_bundle() {
        let tmp = TempDirGuard::new("orch-import");
        small_case(tmp.path());
        let outcome = orchestrator().run(tmp.path(), "no_such_solver", &CancelToken::new());
        assert_eq!(outcome.error_code(), Some("SOLVER_IMPORT"));
        assert_eq!(outcome.final_state, RunState::Failed);
        assert!(outcome.diagnostics.is_some());
    }

    #[test]
    fn bundle_skips_outputs_of_earlier_runs() {
        let tmp = TempDirGuard::new("orch-stale-out");
        small_case(tmp.path());
        let orchestrator = orchestrator();
        assert!(orchestrator.run(tmp.path(), "noop", &CancelToken::new()).is_success());
        assert!(case_folder::out_dir(tmp.path()).join(case_folder::RESULT_NPZ).is_file());

        let failed = orchestrator.run(tmp.path(), "no_such_solver", &CancelToken::new());
        let zip_path = failed.diagnostics.unwrap().zip_path;
        let archive = zip::ZipArchive::new(std::fs::File::open(zip_path).unwrap()).unwrap();
        let names: Vec<&str> = archive.file_names().collect();
        assert!(names.contains(&"case/request.json"));
        assert!(!names.iter().any(|n| n.starts_with("case/out/")), "{names:?}");
        // the earlier good result stays in place
        assert!(case_folder::out_dir(tmp.path()).join(case_folder::RESULT_NPZ).is_file());
    }

    #[test]
    fn missing_case_is_io_failure() {
        let tmp = TempDirGuard::new("orch-missing");
        let outcome = orchestrator().run(&tmp.path().join("nope"), "noop", &CancelToken::new());
        assert_eq!(outcome.error_code(), Some("IO_NOT_FOUND"));
        assert_eq!(outcome.final_state, RunState::Failed);
        assert!(outcome.diagnostics.is_none());
    }

    #[test]
    fn solver_panics_are_contained() {
        #[derive(Default)]
        struct Exploding;
        impl Solver for Exploding {
            fn capabilities(&self) -> Capabilities {
                crate::noop::NoopSolver.capabilities()
            }
            fn solve(&self, _: &SolveRequest, _: &Mesh, _: &dyn SolveCallbacks) -> Result<SolveOutput> {
                panic!("boom");
            }
        }

        let tmp = TempDirGuard::new("orch-panic");
        small_case(tmp.path());
        let registry = Arc::new(SolverRegistry::new());
        registry.register_default::<Exploding>("exploding");
        let outcome = Orchestrator::new(registry).run(tmp.path(), "external:exploding", &CancelToken::new());
        assert_eq!(outcome.error_code(), Some("SOLVER_RUNTIME"));
        assert!(outcome.error.unwrap().message.contains("boom"));
        assert!(outcome.diagnostics.is_some());
    }
}
