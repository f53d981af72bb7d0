use std::collections::BTreeMap;
use std::fmt::Display;
use std::str::FromStr;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Result, SolveError};
use crate::mesh::CellType;

/// Contract version written by this crate.
pub const CONTRACT_VERSION: &str = "0.2";

/// A versioned analysis request, as stored in `request.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SolveRequest {
    pub schema_version: String,

    /// Display-only unit labels (`length`, `pressure`, ...). Never converted.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub unit_system: BTreeMap<String, String>,

    pub model: ModelSpec,

    #[serde(default)]
    pub materials: BTreeMap<String, MaterialSpec>,

    #[serde(default)]
    pub assignments: Vec<Assignment>,

    pub stages: Vec<Stage>,

    /// Requests merged into every stage's own output requests.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub output_requests: Vec<OutputRequest>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub linear_solver: Option<LinearSolverSpec>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelSpec {
    pub dimension: u32,
    pub mode: String,
    #[serde(default)]
    pub gravity: [f64; 2],
    /// Out-of-plane thickness; 1.0 when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thickness: Option<f64>,
}

impl ModelSpec {
    pub fn analysis_mode(&self) -> Option<AnalysisMode> {
        self.mode.parse().ok()
    }

    pub fn thickness(&self) -> f64 {
        self.thickness.unwrap_or(1.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnalysisMode {
    PlaneStrain,
    PlaneStress,
    Axisymmetric,
}

impl AnalysisMode {
    pub fn as_str(self) -> &'static str {
        match self {
            AnalysisMode::PlaneStrain => "plane_strain",
            AnalysisMode::PlaneStress => "plane_stress",
            AnalysisMode::Axisymmetric => "axisymmetric",
        }
    }
}

impl Display for AnalysisMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AnalysisMode {
    type Err = SolveError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "plane_strain" => Ok(AnalysisMode::PlaneStrain),
            "plane_stress" => Ok(AnalysisMode::PlaneStress),
            "axisymmetric" => Ok(AnalysisMode::Axisymmetric),
            other => Err(SolveError::Contract(format!("Unknown model mode '{other}'"))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MaterialSpec {
    pub model_name: String,
    #[serde(default)]
    pub parameters: BTreeMap<String, Value>,
}

impl MaterialSpec {
    /// Numeric parameter lookup; `None` when absent, error when not a number.
    pub fn number(&self, key: &str) -> Result<Option<f64>> {
        match self.parameters.get(key) {
            None | Some(Value::Null) => Ok(None),
            Some(value) => value.as_f64().map(Some).ok_or_else(|| {
                SolveError::SolverRuntime(format!("material parameter '{key}' must be a number"))
            }),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Assignment {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uid: Option<String>,
    pub element_set: String,
    pub cell_type: CellType,
    pub material_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Stage {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default = "default_analysis_type")]
    pub analysis_type: String,
    #[serde(default = "default_num_steps")]
    pub num_steps: u32,
    #[serde(default = "default_dt")]
    pub dt: f64,
    #[serde(default)]
    pub bcs: Vec<BcSpec>,
    #[serde(default)]
    pub loads: Vec<LoadSpec>,
    #[serde(default)]
    pub output_requests: Vec<OutputRequest>,
}

fn default_analysis_type() -> String {
    "static".to_owned()
}

fn default_num_steps() -> u32 {
    1
}

fn default_dt() -> f64 {
    1.0
}

impl Stage {
    /// Stable stage identifier: `id`, else `uid`, else `name`, else `stage_<n>`.
    pub fn label(&self, index: usize) -> String {
        [&self.id, &self.uid, &self.name]
            .into_iter()
            .flatten()
            .find(|s| !s.trim().is_empty())
            .cloned()
            .unwrap_or_else(|| format!("stage_{}", index + 1))
    }

    /// Step count used by solvers (`0` is treated as `1`).
    pub fn steps(&self) -> usize {
        self.num_steps.max(1) as usize
    }

    /// Step length used by solvers (non-positive values are treated as `1.0`).
    pub fn step_dt(&self) -> f64 {
        if self.dt > 0.0 {
            self.dt
        } else {
            1.0
        }
    }
}

/// Boundary condition; `value` is decoded by the solver that consumes `type`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BcSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uid: Option<String>,
    #[serde(rename = "type")]
    pub kind: String,
    pub set: String,
    #[serde(default)]
    pub value: Value,
}

/// Applied force/flux; `value` is decoded by the solver that consumes `type`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoadSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uid: Option<String>,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub set: Option<String>,
    #[serde(default)]
    pub value: Value,
}

impl BcSpec {
    pub fn value_as<T: DeserializeOwned>(&self) -> Result<T> {
        decode_value(&self.kind, &self.set, &self.value)
    }
}

impl LoadSpec {
    pub fn value_as<T: DeserializeOwned>(&self) -> Result<T> {
        decode_value(&self.kind, self.set.as_deref().unwrap_or("-"), &self.value)
    }
}

fn decode_value<T: DeserializeOwned>(kind: &str, set: &str, value: &Value) -> Result<T> {
    serde_json::from_value(value.clone()).map_err(|err| {
        SolveError::SolverRuntime(format!("Invalid value for '{kind}' on set '{set}': {err}"))
    })
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutputRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uid: Option<String>,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
    #[serde(default = "default_every_n")]
    pub every_n: u32,
}

fn default_every_n() -> u32 {
    1
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum LinearSolverMethod {
    /// Sparse Cholesky factorization.
    #[default]
    Direct,
    /// Conjugate gradient.
    Cg,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LinearSolverSpec {
    #[serde(default)]
    pub method: LinearSolverMethod,
    #[serde(default = "default_tolerance")]
    pub tolerance: f64,
    #[serde(default = "default_max_iterations")]
    pub max_iterations: u64,
}

fn default_tolerance() -> f64 {
    1e-10
}

fn default_max_iterations() -> u64 {
    10_000
}

impl Default for LinearSolverSpec {
    fn default() -> Self {
        LinearSolverSpec {
            method: LinearSolverMethod::Direct,
            tolerance: default_tolerance(),
            max_iterations: default_max_iterations(),
        }
    }
}

impl SolveRequest {
    /// Parses `request.json` text. A leading UTF-8 BOM is accepted.
    pub fn from_json_str(text: &str) -> Result<SolveRequest> {
        let text = text.strip_prefix('\u{feff}').unwrap_or(text);
        serde_json::from_str(text)
            .map_err(|err| SolveError::Contract(format!("request.json is malformed: {err}")))
    }

    pub fn to_json_string(&self) -> Result<String> {
        serde_json::to_string_pretty(self)
            .map_err(|err| SolveError::Contract(format!("Unable to serialize request: {err}")))
    }

    /// Unit label for a quantity, falling back to `default`.
    pub fn unit(&self, quantity: &str, default: &str) -> String {
        self.unit_system
            .get(quantity)
            .cloned()
            .unwrap_or_else(|| default.to_owned())
    }

    pub fn linear_solver(&self) -> LinearSolverSpec {
        self.linear_solver.clone().unwrap_or_default()
    }
}

/// Parses `MAJOR.MINOR[.PATCH...]` into integer components.
pub fn parse_version(version: &str) -> Option<Vec<u64>> {
    let trimmed = version.trim();
    if trimmed.is_empty() {
        return None;
    }
    let parts = trimmed
        .split('.')
        .map(|p| p.parse::<u64>().ok())
        .collect::<Option<Vec<u64>>>()?;
    if parts.len() < 2 {
        return None;
    }
    Some(parts)
}

/// Whether `version` lies in the inclusive `[min, max]` range.
///
/// Components are compared lexicographically with missing trailing
/// components treated as zero, so `0.2` and `0.2.0` are equal.
pub fn version_in_range(version: &str, min: &str, max: &str) -> bool {
    let (Some(v), Some(lo), Some(hi)) = (parse_version(version), parse_version(min), parse_version(max))
    else {
        return false;
    };
    let cmp = |a: &[u64], b: &[u64]| {
        let len = a.len().max(b.len());
        let pad = |x: &[u64], i: usize| x.get(i).copied().unwrap_or(0);
        (0..len)
            .map(|i| pad(a, i).cmp(&pad(b, i)))
            .find(|o| o.is_ne())
            .unwrap_or(std::cmp::Ordering::Equal)
    };
    cmp(&v, &lo).is_ge() && cmp(&v, &hi).is_le()
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"{
        "schema_version": "0.2",
        "unit_system": {"length": "m", "pressure": "kPa"},
        "model": {"dimension": 2, "mode": "plane_strain", "gravity": [0.0, -9.81]},
        "materials": {"soil": {"model_name": "linear_elastic", "parameters": {"E": 3.0e7, "nu": 0.3}}},
        "assignments": [{"element_set": "all", "cell_type": "tri3", "material_id": "soil"}],
        "stages": [{
            "id": "S1",
            "bcs": [{"type": "displacement", "set": "bottom", "value": {"ux": 0.0, "uy": 0.0}}],
            "loads": [{"type": "traction", "set": "top", "value": [0.0, -10.0]}],
            "output_requests": [{"name": "u", "every_n": 2}]
        }]
    }"#;

    #[test]
    fn parses_with_defaults() {
        let request = SolveRequest::from_json_str(MINIMAL).unwrap();
        let stage = &request.stages[0];
        assert_eq!(stage.analysis_type, "static");
        assert_eq!(stage.num_steps, 1);
        assert_eq!(stage.dt, 1.0);
        assert_eq!(stage.label(0), "S1");
        assert_eq!(request.model.analysis_mode(), Some(AnalysisMode::PlaneStrain));
        assert_eq!(request.model.thickness(), 1.0);
        assert_eq!(request.unit("pressure", "Pa"), "kPa");
        assert_eq!(request.unit("time", "s"), "s");
        assert_eq!(request.linear_solver().method, LinearSolverMethod::Direct);
    }

    #[test]
    fn accepts_bom_and_round_trips() {
        let with_bom = format!("\u{feff}{MINIMAL}");
        let request = SolveRequest::from_json_str(&with_bom).unwrap();
        let again = SolveRequest::from_json_str(&request.to_json_string().unwrap()).unwrap();
        assert_eq!(request, again);
    }

    #[test]
    fn malformed_request_is_contract_error() {
        let err = SolveRequest::from_json_str(r#"{"schema_version": "0.2"}"#).unwrap_err();
        assert_eq!(err.code(), "CONTRACT");

        let stage_not_object = MINIMAL.replace(r#""stages": [{"#, r#""stages": [3, {"#);
        assert!(SolveRequest::from_json_str(&stage_not_object).is_err());
    }

    #[test]
    fn stage_labels_fall_back() {
        let stage: Stage = serde_json::from_str(r#"{"name": "dig"}"#).unwrap();
        assert_eq!(stage.label(4), "dig");
        let stage: Stage = serde_json::from_str(r#"{"num_steps": 0, "dt": -1.0}"#).unwrap();
        assert_eq!(stage.label(4), "stage_5");
        assert_eq!(stage.steps(), 1);
        assert_eq!(stage.step_dt(), 1.0);
    }

    #[test]
    fn typed_bc_values() {
        #[derive(Deserialize)]
        struct Disp {
            ux: Option<f64>,
            uy: Option<f64>,
        }
        let request = SolveRequest::from_json_str(MINIMAL).unwrap();
        let disp: Disp = request.stages[0].bcs[0].value_as().unwrap();
        assert_eq!((disp.ux, disp.uy), (Some(0.0), Some(0.0)));
        let bad: Result<f64> = request.stages[0].bcs[0].value_as();
        assert_eq!(bad.unwrap_err().code(), "SOLVER_RUNTIME");
    }

    #[test]
    fn version_ranges() {
        assert_eq!(parse_version("0.2"), Some(vec![0, 2]));
        assert_eq!(parse_version("1"), None);
        assert_eq!(parse_version("0.x"), None);
        assert!(version_in_range("0.2", "0.1", "0.2"));
        assert!(version_in_range("0.2.0", "0.2", "0.2"));
        assert!(!version_in_range("0.3", "0.1", "0.2"));
        assert!(!version_in_range("0.0.9", "0.1", "0.2"));
    }
}
