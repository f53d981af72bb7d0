//! Sequential runs over many case folders with an optional baseline.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Instant;

use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::case_folder::{self, OUT_DIR};
use crate::compare::{self, Comparison};
use crate::error::{Result, SolveError};
use crate::orchestrator::{CancelToken, Orchestrator};
use crate::result::RunStatus;

/// One row of a batch report.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CaseRunRecord {
    pub case_dir: PathBuf,
    pub status: RunStatus,
    pub error_code: Option<String>,
    pub error: Option<String>,
    pub solver_selector: String,
    pub elapsed_s: f64,
    pub out_dir: Option<PathBuf>,
    pub diagnostics_zip: Option<PathBuf>,
    pub compare: Option<Comparison>,
}

/// `root` itself when it is a case, otherwise its immediate case subfolders
/// in name order. A missing root yields nothing.
pub fn discover_case_folders(root: &Path) -> Result<Vec<PathBuf>> {
    if !root.is_dir() {
        return Ok(Vec::new());
    }
    if case_folder::is_case_dir(root) {
        return Ok(vec![root.to_path_buf()]);
    }

    let entries = fs::read_dir(root).map_err(SolveError::io(format!("listing {}", root.display())))?;
    let mut cases = Vec::new();
    for entry in entries {
        let path = entry
            .map_err(SolveError::io(format!("listing {}", root.display())))?
            .path();
        if path.is_dir() && case_folder::is_case_dir(&path) {
            cases.push(path);
        }
    }
    cases.sort();
    Ok(cases)
}

/// Runs `case_dirs` one after another with one solver. A failing case never
/// stops the rest; a set `cancel` token stops before the next case starts.
///
/// `observer` sees `(index, total, case_dir, status)` with a 1-based index,
/// once with `"running"` and once with the final status of each case.
pub fn run_many(
    orchestrator: &Orchestrator,
    case_dirs: &[PathBuf],
    selector: &str,
    baseline_root: Option<&Path>,
    cancel: &CancelToken,
    observer: impl FnMut(usize, usize, &Path, &str),
) -> Vec<CaseRunRecord> {
    run_many_with(
        orchestrator,
        case_dirs,
        |_| selector.to_owned(),
        baseline_root,
        cancel,
        observer,
    )
}

/// [`run_many`] with the solver selector chosen per case by `select`.
pub fn run_many_with(
    orchestrator: &Orchestrator,
    case_dirs: &[PathBuf],
    mut select: impl FnMut(&Path) -> String,
    baseline_root: Option<&Path>,
    cancel: &CancelToken,
    mut observer: impl FnMut(usize, usize, &Path, &str),
) -> Vec<CaseRunRecord> {
    let total = case_dirs.len();
    let mut records = Vec::with_capacity(total);
    log::info!("batch of {total} case(s)");

    for (index, case_dir) in case_dirs.iter().enumerate() {
        if cancel.is_cancelled() {
            log::warn!("batch canceled after {index} of {total} case(s)");
            break;
        }
        let selector = select(case_dir);
        observer(index + 1, total, case_dir, "running");
        let started = Instant::now();
        let outcome = orchestrator.run(case_dir, &selector, cancel);

        let compare = match (&outcome.out_dir, baseline_root) {
            (Some(out_dir), Some(root)) => baseline_comparison(out_dir, root, case_dir),
            _ => None,
        };

        let record = CaseRunRecord {
            case_dir: case_dir.clone(),
            status: outcome.status,
            error_code: outcome.error.as_ref().map(|e| e.code.clone()),
            error: outcome.error.as_ref().map(|e| e.message.clone()),
            solver_selector: selector,
            elapsed_s: started.elapsed().as_secs_f64(),
            out_dir: outcome.out_dir.clone(),
            diagnostics_zip: outcome.diagnostics.map(|d| d.zip_path),
            compare,
        };
        observer(index + 1, total, case_dir, record.status.as_str());
        records.push(record);
    }
    records
}

fn baseline_comparison(out_dir: &Path, baseline_root: &Path, case_dir: &Path) -> Option<Comparison> {
    let name = case_dir.file_name()?;
    let baseline = baseline_root.join(name).join(OUT_DIR);
    if !baseline.is_dir() {
        log::debug!("no baseline at {}", baseline.display());
        return None;
    }
    match compare::compare_paths(out_dir, &baseline) {
        Ok(comparison) => Some(comparison),
        Err(err) => {
            log::warn!("comparison against {} failed: {err}", baseline.display());
            None
        }
    }
}

/// Writes `{"records": [...]}` to `path`.
pub fn write_report(records: &[CaseRunRecord], path: &Path) -> Result<()> {
    let text = serde_json::to_string_pretty(&json!({ "records": records }))
        .map_err(|err| SolveError::Contract(format!("Unable to serialize report: {err}")))?;
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).map_err(SolveError::io(format!("creating {}", parent.display())))?;
    }
    fs::write(path, text).map_err(SolveError::io(format!("writing {}", path.display())))
}
