//! Self-contained zip bundles describing a failed or canceled run.

use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use serde::{Deserialize, Serialize};
use serde_json::json;
use zip::write::FileOptions;
use zip::{CompressionMethod, ZipWriter};

use crate::case_folder::{self, MESH_FILE, REQUEST_FILE, RESULT_JSON, RESULT_NPZ};
use crate::error::{ErrorInfo, Result, SolveError};
use crate::solver::Capabilities;

pub const DIAGNOSTICS_DIR: &str = "_diagnostics";

/// Files larger than this are left out of bundles.
const MAX_ATTACHMENT_BYTES: u64 = 200 * 1024 * 1024;
const MAX_PREVIEW_BYTES: usize = 2_000_000;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiagnosticsBundle {
    pub zip_path: PathBuf,
}

/// What the orchestrator knows about a run when it fails.
#[derive(Debug, Clone, Default)]
pub struct DiagnosticsContext {
    pub solver_selector: String,
    pub capabilities: Option<Capabilities>,
    pub state: Option<String>,
    pub error: Option<ErrorInfo>,
    /// Error source chain and backtrace, written as `diag/traceback.txt`.
    pub traceback: Option<String>,
    pub logs: Vec<String>,
    pub include_outputs: bool,
    /// Output files modified before this instant belong to an earlier run
    /// and are left out.
    pub outputs_since: Option<SystemTime>,
}

fn zip_err(path: &Path) -> impl FnOnce(zip::result::ZipError) -> SolveError + '_ {
    move |err| SolveError::Io {
        context: format!("writing {}", path.display()),
        source: std::io::Error::new(std::io::ErrorKind::Other, err),
    }
}

/// Creates `_diagnostics/diag_<timestamp>.zip`, adding `_N` when the name
/// is taken.
fn create_zip_file(case_dir: &Path) -> Result<(PathBuf, File)> {
    let dir = case_dir.join(DIAGNOSTICS_DIR);
    fs::create_dir_all(&dir).map_err(SolveError::io(format!("creating {}", dir.display())))?;
    let stamp = chrono::Local::now().format("%Y%m%d_%H%M%S_%3f").to_string();

    let mut suffix = 0;
    loop {
        let name = match suffix {
            0 => format!("diag_{stamp}.zip"),
            n => format!("diag_{stamp}_{n}.zip"),
        };
        let path = dir.join(name);
        match OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(file) => return Ok((path, file)),
            Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => suffix += 1,
            Err(err) => return Err(SolveError::io(format!("creating {}", path.display()))(err)),
        }
    }
}

fn environment(context: &DiagnosticsContext) -> serde_json::Value {
    let cwd = std::env::current_dir()
        .map(|p| p.display().to_string())
        .unwrap_or_default();
    json!({
        "time": chrono::Local::now().to_rfc3339(),
        "engine": {"name": env!("CARGO_PKG_NAME"), "version": env!("CARGO_PKG_VERSION")},
        "platform": {
            "os": std::env::consts::OS,
            "arch": std::env::consts::ARCH,
            "family": std::env::consts::FAMILY,
        },
        "cwd": cwd,
        "solver_selector": context.solver_selector,
        "capabilities": context.capabilities,
        "state": context.state,
        "error": context.error,
    })
}

fn truncate_preview(text: &str) -> &str {
    if text.len() <= MAX_PREVIEW_BYTES {
        return text;
    }
    let mut end = MAX_PREVIEW_BYTES;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    &text[..end]
}

struct Bundle {
    zip: ZipWriter<File>,
    path: PathBuf,
    options: FileOptions,
}

impl Bundle {
    fn add_bytes(&mut self, name: &str, bytes: &[u8]) -> Result<()> {
        self.zip.start_file(name, self.options).map_err(zip_err(&self.path))?;
        self.zip
            .write_all(bytes)
            .map_err(SolveError::io(format!("writing {}", self.path.display())))
    }

    /// Copies `src` into the archive when it exists and is not oversized.
    fn add_file(&mut self, src: &Path, name: &str) -> Result<()> {
        match fs::metadata(src) {
            Ok(meta) if meta.is_file() && meta.len() <= MAX_ATTACHMENT_BYTES => {}
            Ok(meta) if meta.is_file() => {
                log::warn!("leaving {} out of diagnostics ({} bytes)", src.display(), meta.len());
                return Ok(());
            }
            _ => return Ok(()),
        }
        let bytes = fs::read(src).map_err(SolveError::io(format!("reading {}", src.display())))?;
        self.add_bytes(name, &bytes)
    }

    /// Like [`Bundle::add_file`], skipping files older than `since`.
    fn add_output(&mut self, src: &Path, name: &str, since: Option<SystemTime>) -> Result<()> {
        if let Some(since) = since {
            let fresh = fs::metadata(src)
                .and_then(|meta| meta.modified())
                .map(|modified| modified >= since)
                .unwrap_or(false);
            if !fresh {
                log::debug!("leaving stale {} out of diagnostics", src.display());
                return Ok(());
            }
        }
        self.add_file(src, name)
    }
}

/// Writes a diagnostics zip for `case_dir`.
///
/// Layout: `diag/meta.json`, `diag/traceback.txt`, `diag/logs.txt`,
/// `diag/request_preview.json`, `case/request.json`, `case/mesh.npz` and,
/// when requested and present, `case/out/*`.
pub fn build_bundle(case_dir: &Path, context: &DiagnosticsContext) -> Result<DiagnosticsBundle> {
    let (zip_path, file) = create_zip_file(case_dir)?;
    let mut bundle = Bundle {
        zip: ZipWriter::new(file),
        path: zip_path.clone(),
        options: FileOptions::default().compression_method(CompressionMethod::Deflated),
    };

    let meta = serde_json::to_string_pretty(&environment(context))
        .map_err(|err| SolveError::Contract(format!("Unable to serialize diagnostics: {err}")))?;
    bundle.add_bytes("diag/meta.json", meta.as_bytes())?;
    bundle.add_bytes(
        "diag/traceback.txt",
        context.traceback.as_deref().unwrap_or("").as_bytes(),
    )?;
    bundle.add_bytes("diag/logs.txt", context.logs.join("\n").as_bytes())?;

    bundle.add_file(&case_dir.join(REQUEST_FILE), "case/request.json")?;
    bundle.add_file(&case_dir.join(MESH_FILE), "case/mesh.npz")?;
    if let Ok(text) = fs::read_to_string(case_dir.join(REQUEST_FILE)) {
        bundle.add_bytes("diag/request_preview.json", truncate_preview(&text).as_bytes())?;
    }

    if context.include_outputs {
        let out = case_folder::out_dir(case_dir);
        bundle.add_output(&out.join(RESULT_JSON), "case/out/result.json", context.outputs_since)?;
        bundle.add_output(&out.join(RESULT_NPZ), "case/out/result.npz", context.outputs_since)?;
    }

    bundle.zip.finish().map_err(zip_err(&zip_path))?;
    log::info!("diagnostics written to {}", zip_path.display());
    Ok(DiagnosticsBundle { zip_path })
}
