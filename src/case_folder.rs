//! Directory persistence of a case: `request.json` + `mesh.npz`, with the
//! solved output under `out/`.

use std::fs;
use std::path::{Path, PathBuf};

use crate::error::{Result, SolveError};
use crate::mesh::Mesh;
use crate::request::SolveRequest;
use crate::result::{ResultArrays, SolveResult};

pub const REQUEST_FILE: &str = "request.json";
pub const MESH_FILE: &str = "mesh.npz";
pub const OUT_DIR: &str = "out";
pub const RESULT_JSON: &str = "result.json";
pub const RESULT_NPZ: &str = "result.npz";

/// A directory counts as a case when it holds both input files.
pub fn is_case_dir(path: &Path) -> bool {
    path.join(REQUEST_FILE).is_file() && path.join(MESH_FILE).is_file()
}

pub fn out_dir(case_dir: &Path) -> PathBuf {
    case_dir.join(OUT_DIR)
}

pub fn read_request(case_dir: &Path) -> Result<SolveRequest> {
    let path = case_dir.join(REQUEST_FILE);
    let text = fs::read_to_string(&path).map_err(SolveError::io(format!("reading {}", path.display())))?;
    SolveRequest::from_json_str(&text)
}

pub fn read_case(case_dir: &Path) -> Result<(SolveRequest, Mesh)> {
    let request = read_request(case_dir)?;
    let mesh = Mesh::read_npz(&case_dir.join(MESH_FILE))?;
    Ok((request, mesh))
}

pub fn write_case(case_dir: &Path, request: &SolveRequest, mesh: &Mesh) -> Result<()> {
    fs::create_dir_all(case_dir).map_err(SolveError::io(format!("creating {}", case_dir.display())))?;
    let path = case_dir.join(REQUEST_FILE);
    fs::write(&path, request.to_json_string()?)
        .map_err(SolveError::io(format!("writing {}", path.display())))?;
    mesh.write_npz(&case_dir.join(MESH_FILE))
}

pub fn read_outputs(out_dir: &Path) -> Result<(SolveResult, ResultArrays)> {
    let meta_path = out_dir.join(RESULT_JSON);
    let text = fs::read_to_string(&meta_path)
        .map_err(SolveError::io(format!("reading {}", meta_path.display())))?;
    let meta = SolveResult::from_json_str(&text)?;
    let arrays = ResultArrays::read_npz(&out_dir.join(RESULT_NPZ))?;
    Ok((meta, arrays))
}

pub fn write_outputs(out_dir: &Path, meta: &SolveResult, arrays: &ResultArrays) -> Result<()> {
    fs::create_dir_all(out_dir).map_err(SolveError::io(format!("creating {}", out_dir.display())))?;
    let meta_path = out_dir.join(RESULT_JSON);
    fs::write(&meta_path, meta.to_json_string()?)
        .map_err(SolveError::io(format!("writing {}", meta_path.display())))?;
    arrays.write_npz(&out_dir.join(RESULT_NPZ))
}

/// Writes a fresh `out/` for `case_dir`, replacing any stale one.
///
/// Outputs are staged next to `out/` and renamed into place so a failed
/// write never leaves a half-populated `out/`.
pub fn replace_outputs(case_dir: &Path, meta: &SolveResult, arrays: &ResultArrays) -> Result<PathBuf> {
    let target = out_dir(case_dir);
    let staging = case_dir.join(".out.partial");
    if staging.exists() {
        fs::remove_dir_all(&staging).map_err(SolveError::io(format!("removing {}", staging.display())))?;
    }

    if let Err(err) = write_outputs(&staging, meta, arrays) {
        let _ = fs::remove_dir_all(&staging);
        return Err(err);
    }

    if target.exists() {
        log::debug!("replacing stale outputs in {}", target.display());
        fs::remove_dir_all(&target).map_err(SolveError::io(format!("removing {}", target.display())))?;
    }
    fs::rename(&staging, &target).map_err(SolveError::io(format!("moving outputs to {}", target.display())))?;
    Ok(target)
}
