use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::mpsc::RecvTimeoutError;
use std::sync::Arc;
use std::time::{Duration, Instant};

use clap::{Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};

use terrasolve::batch;
use terrasolve::case_folder;
use terrasolve::cases::{self, CaseKind};
use terrasolve::compare::{self, DiffStatus, FieldKey};
use terrasolve::error::exit_status;
use terrasolve::logging;
use terrasolve::orchestrator::{CancelToken, Orchestrator, RunEvent, RunOutcome};
use terrasolve::precheck;
use terrasolve::registry::{SolverRegistry, BUILTINS};
use terrasolve::{Result, SolveError};

/// Runs 2D geotechnical cases through pluggable solvers.
#[derive(Parser)]
#[command(name = "terrasolve", version, about, long_about = None)]
struct Cli {
    /// Log level (trace, debug, info, warn, error); falls back to RUST_LOG
    #[arg(short, long, global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Solve one case folder
    Run {
        case_dir: PathBuf,
        /// Solver selector; defaults to the reference solver for the analysis type
        #[arg(short, long)]
        solver: Option<String>,
        /// Cancel the run after this many seconds
        #[arg(long)]
        timeout: Option<f64>,
        /// Hide the progress bar
        #[arg(short, long)]
        quiet: bool,
    },
    /// Solve every case folder under a root, one after another
    BatchRun {
        root: PathBuf,
        #[arg(short, long)]
        solver: Option<String>,
        /// Folder holding baseline cases with the same names
        #[arg(long)]
        baseline: Option<PathBuf>,
        /// Where to write the JSON report [default: <root>/batch_report.json]
        #[arg(long)]
        report: Option<PathBuf>,
    },
    /// Validate a case folder without solving it
    Precheck {
        case_dir: PathBuf,
        #[arg(short, long)]
        solver: Option<String>,
    },
    /// Print a solver's capabilities as JSON
    Capabilities {
        #[arg(default_value = "reference_elastic")]
        solver: String,
    },
    /// Write a reference case folder
    MakeCase {
        /// elastic or seepage
        kind: CaseKind,
        case_dir: PathBuf,
    },
    /// Compare the results of two case or output folders
    Compare {
        a: PathBuf,
        b: PathBuf,
        /// Print the comparison as JSON
        #[arg(long)]
        json: bool,
    },
    /// Export per-step min/max/mean of one field to CSV
    Curve {
        /// Case or output folder
        results: PathBuf,
        /// Field as <location>:<name>, e.g. node:u
        #[arg(short, long)]
        field: FieldKey,
        #[arg(long)]
        csv: PathBuf,
    },
}

fn default_selector(case_dir: &Path) -> Result<String> {
    let request = case_folder::read_request(case_dir)?;
    let seepage = request
        .stages
        .iter()
        .any(|stage| stage.analysis_type.starts_with("seepage"));
    Ok(if seepage { "reference_seepage" } else { "reference_elastic" }.to_owned())
}

fn selector_for(case_dir: &Path, solver: Option<String>) -> Result<String> {
    match solver {
        Some(solver) => Ok(solver),
        None => default_selector(case_dir),
    }
}

fn outcome_code(outcome: &RunOutcome) -> ExitCode {
    let status = outcome.error_code().map(exit_status).unwrap_or(0);
    ExitCode::from(status.clamp(0, 255) as u8)
}

fn report_outcome(outcome: &RunOutcome) {
    for issue in &outcome.issues {
        eprintln!("{issue}");
    }
    match &outcome.error {
        None => println!(
            "{}: {} in {:.2}s -> {}",
            outcome.case_dir.display(),
            outcome.status.as_str(),
            outcome.elapsed.as_secs_f64(),
            outcome
                .out_dir
                .as_deref()
                .map(|p| p.display().to_string())
                .unwrap_or_default()
        ),
        Some(error) => {
            println!("{}: {} {error}", outcome.case_dir.display(), outcome.status.as_str());
            if let Some(bundle) = &outcome.diagnostics {
                println!("diagnostics: {}", bundle.zip_path.display());
            }
        }
    }
}

fn run_case(case_dir: &Path, selector: &str, timeout: Option<f64>, quiet: bool) -> Result<ExitCode> {
    let orchestrator = Orchestrator::new(Arc::new(SolverRegistry::new()));
    let handle = orchestrator.spawn(case_dir, selector)?;

    let bar = if quiet {
        ProgressBar::hidden()
    } else {
        ProgressBar::new(1000)
    };
    bar.set_style(
        ProgressStyle::with_template("[{elapsed_precise}] {bar:40} {percent:>3}% {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_bar()),
    );

    let deadline = timeout.map(|secs| Instant::now() + Duration::from_secs_f64(secs.max(0.0)));
    loop {
        if let Some(deadline) = deadline {
            if Instant::now() >= deadline && !handle.cancel_token().is_cancelled() {
                log::warn!("timeout reached, canceling {}", case_dir.display());
                handle.cancel();
            }
        }
        match handle.events().recv_timeout(Duration::from_millis(100)) {
            Ok(RunEvent::Progress { fraction, message, .. }) => {
                bar.set_position((fraction.clamp(0.0, 1.0) * 1000.0) as u64);
                bar.set_message(message);
            }
            Ok(RunEvent::State(state)) => bar.set_message(state.to_string()),
            Ok(_) => {}
            Err(RecvTimeoutError::Timeout) if !handle.is_finished() => {}
            Err(_) => break,
        }
    }
    bar.finish_and_clear();

    let outcome = handle.wait();
    report_outcome(&outcome);
    Ok(outcome_code(&outcome))
}

fn batch_run(
    root: &Path,
    solver: Option<String>,
    baseline: Option<&Path>,
    report: Option<PathBuf>,
) -> Result<ExitCode> {
    let case_dirs = batch::discover_case_folders(root)?;
    let orchestrator = Orchestrator::new(Arc::new(SolverRegistry::new()));
    let cancel = CancelToken::new();
    let bar = ProgressBar::new(case_dirs.len() as u64);

    // An unreadable request still gets a record; the run reports why.
    let select = |case_dir: &Path| {
        selector_for(case_dir, solver.clone()).unwrap_or_else(|_| "reference_elastic".to_owned())
    };
    let records = batch::run_many_with(
        &orchestrator,
        &case_dirs,
        select,
        baseline,
        &cancel,
        |_, _, dir, status| match status {
            "running" => bar.set_message(dir.display().to_string()),
            _ => bar.inc(1),
        },
    );
    bar.finish_and_clear();

    let mut failures = 0;
    for record in &records {
        let worst = record.compare.as_ref().map(|c| c.max_linf());
        println!(
            "{:<40} {:<8} {:>8.2}s {}{}",
            record.case_dir.display(),
            record.status.as_str(),
            record.elapsed_s,
            record.error_code.as_deref().unwrap_or(""),
            worst.map(|w| format!(" max|diff|={w:.3e}")).unwrap_or_default()
        );
        if record.error_code.is_some() {
            failures += 1;
        }
    }

    let report = report.unwrap_or_else(|| root.join("batch_report.json"));
    batch::write_report(&records, &report)?;
    println!("{} case(s), {failures} failed; report: {}", records.len(), report.display());
    Ok(ExitCode::SUCCESS)
}

fn run_precheck(case_dir: &Path, solver: Option<String>) -> Result<ExitCode> {
    let (request, mesh) = case_folder::read_case(case_dir)?;
    let selector = selector_for(case_dir, solver)?;
    let registry = SolverRegistry::new();
    let capabilities = registry.capabilities(&selector)?;

    let issues = precheck::validate(&request, &mesh, Some(&capabilities));
    for issue in &issues {
        println!("{issue}");
    }
    let (errors, warnings, infos) = precheck::summarize(&issues);
    println!("{errors} error(s), {warnings} warning(s), {infos} info");
    Ok(if precheck::has_errors(&issues) {
        ExitCode::from(exit_status(terrasolve::error::PRECHECK_CODE) as u8)
    } else {
        ExitCode::SUCCESS
    })
}

fn print_capabilities(solver: &str) -> Result<ExitCode> {
    let registry = SolverRegistry::new();
    let capabilities = registry.capabilities(solver)?;
    let text = serde_json::to_string_pretty(capabilities.as_ref())
        .map_err(|err| SolveError::Contract(format!("Unable to serialize capabilities: {err}")))?;
    println!("{text}");
    Ok(ExitCode::SUCCESS)
}

fn print_comparison(a: &Path, b: &Path, as_json: bool) -> Result<ExitCode> {
    let comparison = compare::compare_paths(a, b)?;
    if as_json {
        let text = serde_json::to_string_pretty(&comparison)
            .map_err(|err| SolveError::Contract(format!("Unable to serialize comparison: {err}")))?;
        println!("{text}");
        return Ok(ExitCode::SUCCESS);
    }

    match comparison.step {
        None => println!("no common steps"),
        Some(step) => println!("step {step}"),
    }
    for diff in &comparison.diffs {
        let key = format!("{}:{}", diff.field.location.as_str(), diff.field.name);
        match (diff.status, diff.stats) {
            (DiffStatus::Ok, Some(s)) => println!(
                "{key:<24} linf={:.6e} l2={:.6e} mean={:.6e}",
                s.linf, s.l2, s.mean
            ),
            (DiffStatus::ShapeMismatch, _) => println!("{key:<24} shape mismatch"),
            _ => println!("{key:<24} missing"),
        }
    }
    Ok(ExitCode::SUCCESS)
}

fn export_curve(results: &Path, field: &FieldKey, csv: &Path) -> Result<ExitCode> {
    let (_, arrays) = compare::load_outputs(results)?;
    let steps: Vec<usize> = arrays.steps().into_iter().collect();
    let curve = compare::step_curve(&arrays, field, &steps);
    compare::write_curve_csv(&curve, csv)?;
    println!("{} step(s) -> {}", curve.len(), csv.display());
    Ok(ExitCode::SUCCESS)
}

fn dispatch(command: Command) -> Result<ExitCode> {
    match command {
        Command::Run {
            case_dir,
            solver,
            timeout,
            quiet,
        } => {
            let selector = selector_for(&case_dir, solver)?;
            run_case(&case_dir, &selector, timeout, quiet)
        }
        Command::BatchRun {
            root,
            solver,
            baseline,
            report,
        } => batch_run(&root, solver, baseline.as_deref(), report),
        Command::Precheck { case_dir, solver } => run_precheck(&case_dir, solver),
        Command::Capabilities { solver } => print_capabilities(&solver),
        Command::MakeCase { kind, case_dir } => {
            cases::write_reference_case(kind, &case_dir)?;
            println!("{} -> solve with {}", case_dir.display(), kind.solver());
            Ok(ExitCode::SUCCESS)
        }
        Command::Compare { a, b, json } => print_comparison(&a, &b, json),
        Command::Curve {
            results,
            field,
            csv,
        } => export_curve(&results, &field, &csv),
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    logging::init(cli.log_level.as_deref());
    log::debug!("built-in solvers: {}", BUILTINS.join(", "));

    match dispatch(cli.command) {
        Ok(code) => code,
        Err(err) => {
            let info = err.info();
            eprintln!("error: {info}");
            ExitCode::from(exit_status(&info.code) as u8)
        }
    }
}
