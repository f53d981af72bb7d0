//! Request/mesh validation that runs before any solver.
//!
//! Problems are collected as [`PrecheckIssue`] values instead of returned as
//! errors, so a caller sees every issue of a case at once.

use std::collections::HashSet;
use std::fmt::Display;

use serde::{Deserialize, Serialize};

use crate::mesh::Mesh;
use crate::request::{parse_version, SolveRequest};
use crate::solver::Capabilities;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Severity {
    Error,
    Warn,
    Info,
}

impl Severity {
    pub fn as_str(self) -> &'static str {
        match self {
            Severity::Error => "ERROR",
            Severity::Warn => "WARN",
            Severity::Info => "INFO",
        }
    }
}

impl Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PrecheckIssue {
    pub severity: Severity,
    pub code: String,
    pub message: String,
}

impl PrecheckIssue {
    pub fn error(code: &str, message: impl Into<String>) -> PrecheckIssue {
        PrecheckIssue::new(Severity::Error, code, message)
    }

    pub fn warn(code: &str, message: impl Into<String>) -> PrecheckIssue {
        PrecheckIssue::new(Severity::Warn, code, message)
    }

    pub fn info(code: &str, message: impl Into<String>) -> PrecheckIssue {
        PrecheckIssue::new(Severity::Info, code, message)
    }

    fn new(severity: Severity, code: &str, message: impl Into<String>) -> PrecheckIssue {
        PrecheckIssue {
            severity,
            code: code.to_owned(),
            message: message.into(),
        }
    }
}

impl Display for PrecheckIssue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}] {}: {}", self.severity, self.code, self.message)
    }
}

/// Counts of `(errors, warnings, infos)`.
pub fn summarize(issues: &[PrecheckIssue]) -> (usize, usize, usize) {
    issues.iter().fold((0, 0, 0), |(e, w, i), issue| match issue.severity {
        Severity::Error => (e + 1, w, i),
        Severity::Warn => (e, w + 1, i),
        Severity::Info => (e, w, i + 1),
    })
}

/// Any ERROR blocks a run; WARN and INFO never do.
pub fn has_errors(issues: &[PrecheckIssue]) -> bool {
    issues.iter().any(|issue| issue.severity == Severity::Error)
}

/// Drops repeated issues, keeping the first occurrence of each.
pub fn dedup(issues: Vec<PrecheckIssue>) -> Vec<PrecheckIssue> {
    let mut seen = HashSet::new();
    issues
        .into_iter()
        .filter(|issue| seen.insert(issue.clone()))
        .collect()
}

fn is_schema_version(version: &str) -> bool {
    matches!(parse_version(version), Some(parts) if (2..=3).contains(&parts.len()))
}

fn check_model(request: &SolveRequest, mesh: &Mesh, issues: &mut Vec<PrecheckIssue>) {
    if !is_schema_version(&request.schema_version) {
        issues.push(PrecheckIssue::error(
            "REQ_SCHEMA",
            format!(
                "schema_version '{}' is not of the form MAJOR.MINOR[.PATCH]",
                request.schema_version
            ),
        ));
    }
    if request.model.dimension != 2 {
        issues.push(PrecheckIssue::error(
            "REQ_DIM",
            format!("model.dimension must be 2, got {}", request.model.dimension),
        ));
    }
    if request.model.analysis_mode().is_none() {
        issues.push(PrecheckIssue::error(
            "REQ_MODE",
            format!(
                "model.mode '{}' must be one of plane_strain, plane_stress, axisymmetric",
                request.model.mode
            ),
        ));
    }
    if request.stages.is_empty() {
        issues.push(PrecheckIssue::error("REQ_STAGES", "request.stages must not be empty"));
    }
    if mesh.num_points() == 0 {
        issues.push(PrecheckIssue::warn("MESH_EMPTY", "mesh has 0 points"));
    }
    if !mesh.has_cells() {
        issues.push(PrecheckIssue::error(
            "MESH_CELLS",
            "mesh must contain at least one cells_* block",
        ));
    }
}

fn check_stages(request: &SolveRequest, mesh: &Mesh, issues: &mut Vec<PrecheckIssue>) {
    let mut ids = HashSet::new();
    for (index, stage) in request.stages.iter().enumerate() {
        let label = stage.label(index);
        if !ids.insert(label.clone()) {
            issues.push(PrecheckIssue::warn(
                "STAGE_ID_DUPLICATE",
                format!("stage id '{label}' is used by more than one stage"),
            ));
        }
        if stage.num_steps == 0 {
            issues.push(PrecheckIssue::warn(
                "STAGE_STEPS",
                format!("{label}: num_steps is 0, running 1 step"),
            ));
        }
        if stage.dt.is_nan() || stage.dt <= 0.0 {
            issues.push(PrecheckIssue::warn(
                "STAGE_DT",
                format!("{label}: dt must be positive, using 1.0"),
            ));
        }

        for (i, bc) in stage.bcs.iter().enumerate() {
            if mesh.nodes_of_set(&bc.set).is_none() {
                issues.push(PrecheckIssue::error(
                    "BC_SET_MISSING",
                    format!("{label}: bcs[{i}].set {}", describe_missing(mesh, &bc.set, "nodes or edges")),
                ));
            }
        }
        for (i, load) in stage.loads.iter().enumerate() {
            let Some(set) = load.set.as_deref() else {
                continue;
            };
            let (found, wanted) = if EDGE_LOADS.contains(&load.kind.as_str()) {
                (mesh.edges_of_set(set).is_some(), "edges")
            } else {
                (mesh.nodes_of_set(set).is_some(), "nodes or edges")
            };
            if !found {
                issues.push(PrecheckIssue::error(
                    "LOAD_SET_MISSING",
                    format!("{label}: loads[{i}].set {}", describe_missing(mesh, set, wanted)),
                ));
            }
        }
    }
}

/// Loads distributed along boundary edges.
const EDGE_LOADS: [&str; 2] = ["traction", "flux"];

fn describe_missing(mesh: &Mesh, set: &str, wanted: &str) -> String {
    if mesh.has_set(set) {
        format!("'{set}' has no {wanted}")
    } else {
        format!("references missing set '{set}'")
    }
}

fn check_assignments(request: &SolveRequest, mesh: &Mesh, issues: &mut Vec<PrecheckIssue>) {
    for (i, assignment) in request.assignments.iter().enumerate() {
        let name = &assignment.element_set;
        if !mesh.has_set(name) {
            issues.push(PrecheckIssue::error(
                "ASSIGN_SET_MISSING",
                format!("assignments[{i}].element_set references missing set '{name}'"),
            ));
        } else if mesh.element_set(name, assignment.cell_type).is_none() {
            let available: Vec<&str> = mesh
                .element_set_cell_types(name)
                .into_iter()
                .map(|ct| ct.as_str())
                .collect();
            issues.push(PrecheckIssue::error(
                "ASSIGN_CELL_TYPE_MISMATCH",
                format!(
                    "assignments[{i}]: set '{name}' has no {} cells (available: {available:?})",
                    assignment.cell_type
                ),
            ));
        }

        if !request.materials.contains_key(&assignment.material_id) {
            issues.push(PrecheckIssue::warn(
                "ASSIGN_MATERIAL_MISSING",
                format!(
                    "assignments[{i}].material_id '{}' is not defined in materials",
                    assignment.material_id
                ),
            ));
        }
    }
}

fn check_capabilities(request: &SolveRequest, caps: &Capabilities, issues: &mut Vec<PrecheckIssue>) {
    if !caps.supports_contract(&request.schema_version) {
        issues.push(PrecheckIssue::error(
            "CAP_CONTRACT",
            format!(
                "solver '{}' accepts contract {}..{}, request has schema_version {}",
                caps.name, caps.contract.min, caps.contract.max, request.schema_version
            ),
        ));
    }
    if !caps.modes.is_empty() && !caps.supports_mode(&request.model.mode) {
        issues.push(PrecheckIssue::error(
            "CAP_MODE_UNSUPPORTED",
            format!(
                "solver '{}' does not support mode '{}' (supported: {:?})",
                caps.name, request.model.mode, caps.modes
            ),
        ));
    }

    if !caps.materials.is_empty() {
        for (id, material) in &request.materials {
            if !caps.supports_material(&material.model_name) {
                issues.push(PrecheckIssue::warn(
                    "CAP_MATERIAL_UNSUPPORTED",
                    format!(
                        "material '{id}': model '{}' not in solver capabilities",
                        material.model_name
                    ),
                ));
            }
        }
    }

    let check_outputs = !caps.fields.is_empty() || !caps.results.is_empty();
    for (index, stage) in request.stages.iter().enumerate() {
        let label = stage.label(index);
        if !caps.analysis_types.is_empty() && !caps.supports_analysis_type(&stage.analysis_type) {
            issues.push(PrecheckIssue::error(
                "CAP_ANALYSIS_UNSUPPORTED",
                format!(
                    "{label}: analysis_type '{}' not supported (supported: {:?})",
                    stage.analysis_type, caps.analysis_types
                ),
            ));
        }
        if !caps.bcs.is_empty() {
            for bc in stage.bcs.iter().filter(|bc| !caps.supports_bc(&bc.kind)) {
                issues.push(PrecheckIssue::warn(
                    "CAP_BC_UNSUPPORTED",
                    format!("{label}: bc type '{}' not in solver capabilities", bc.kind),
                ));
            }
        }
        if !caps.loads.is_empty() {
            for load in stage.loads.iter().filter(|l| !caps.supports_load(&l.kind)) {
                issues.push(PrecheckIssue::warn(
                    "CAP_LOAD_UNSUPPORTED",
                    format!("{label}: load type '{}' not in solver capabilities", load.kind),
                ));
            }
        }
        if check_outputs {
            for (i, output) in stage.output_requests.iter().enumerate() {
                if !caps.supports_output(&output.name) {
                    issues.push(PrecheckIssue::warn(
                        "CAP_OUTPUT_UNSUPPORTED",
                        format!(
                            "{label}: output_requests[{i}] name '{}' not in solver capabilities",
                            output.name
                        ),
                    ));
                }
            }
        }
    }

    if check_outputs {
        for (i, output) in request.output_requests.iter().enumerate() {
            if !caps.supports_output(&output.name) {
                issues.push(PrecheckIssue::warn(
                    "CAP_OUTPUT_UNSUPPORTED",
                    format!(
                        "output_requests[{i}] name '{}' not in solver capabilities",
                        output.name
                    ),
                ));
            }
        }
    }
}

/// Validates a request against its mesh and, when given, a solver's
/// capabilities. Never fails; an empty list means the case is clean.
pub fn validate(
    request: &SolveRequest,
    mesh: &Mesh,
    capabilities: Option<&Capabilities>,
) -> Vec<PrecheckIssue> {
    let mut issues = Vec::new();
    check_model(request, mesh, &mut issues);
    check_stages(request, mesh, &mut issues);
    check_assignments(request, mesh, &mut issues);
    if let Some(caps) = capabilities {
        check_capabilities(request, caps, &mut issues);
    }

    dedup(issues)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cases::{elastic_case, seepage_case, StructuredGrid};
    use crate::elastic::ReferenceElastic;
    use crate::seepage::ReferenceSeepage;
    use crate::solver::Solver;

    fn grid() -> StructuredGrid {
        StructuredGrid::new(2.0, 1.0, 4, 2)
    }

    fn codes(issues: &[PrecheckIssue]) -> Vec<&str> {
        issues.iter().map(|i| i.code.as_str()).collect()
    }

    #[test]
    fn reference_cases_are_clean() {
        let (request, mesh) = elastic_case(&grid());
        let caps = ReferenceElastic.capabilities();
        let issues = validate(&request, &mesh, Some(&caps));
        assert!(!has_errors(&issues), "{issues:?}");

        let (request, mesh) = seepage_case(&grid());
        let caps = ReferenceSeepage.capabilities();
        assert!(validate(&request, &mesh, Some(&caps)).is_empty());
    }

    #[test]
    fn missing_bc_set_is_one_error() {
        let (mut request, mesh) = elastic_case(&grid());
        request.stages[0].bcs[0].set = "nowhere".into();
        let issues = validate(&request, &mesh, None);
        let errors: Vec<_> = issues.iter().filter(|i| i.severity == Severity::Error).collect();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].code, "BC_SET_MISSING");
        assert!(errors[0].message.contains("nowhere"));
    }

    #[test]
    fn element_only_sets_cannot_carry_bcs_or_loads() {
        let (mut request, mesh) = elastic_case(&grid());
        request.stages[0].bcs[1].set = "soil".into();
        request.stages[0].loads[0].set = Some("soil".into());
        let issues = validate(&request, &mesh, None);
        assert_eq!(codes(&issues), vec!["BC_SET_MISSING", "LOAD_SET_MISSING"]);
        assert!(issues[0].message.contains("'soil' has no nodes or edges"));
        assert!(issues[1].message.contains("'soil' has no edges"));
    }

    #[test]
    fn traction_on_a_node_set_is_rejected() {
        let (mut request, mut mesh) = elastic_case(&grid());
        mesh.add_node_set("corner", vec![0]).unwrap();
        request.stages[0].loads[0].set = Some("corner".into());
        let issues = validate(&request, &mesh, None);
        assert_eq!(codes(&issues), vec!["LOAD_SET_MISSING"]);
    }

    #[test]
    fn structural_problems() {
        let (mut request, _) = elastic_case(&grid());
        request.schema_version = "v2".into();
        request.model.dimension = 3;
        request.model.mode = "shell".into();
        request.stages.clear();
        let issues = validate(&request, &Mesh::new(Vec::new()), None);
        assert_eq!(
            codes(&issues),
            vec!["REQ_SCHEMA", "REQ_DIM", "REQ_MODE", "REQ_STAGES", "MESH_EMPTY", "MESH_CELLS", "ASSIGN_SET_MISSING"]
        );
        assert_eq!(summarize(&issues), (6, 1, 0));
    }

    #[test]
    fn assignment_cell_type_mismatch() {
        let (mut request, mesh) = elastic_case(&grid());
        request.assignments[0].cell_type = crate::mesh::CellType::Quad4;
        request.assignments[0].material_id = "ghost".into();
        let issues = validate(&request, &mesh, None);
        assert_eq!(codes(&issues), vec!["ASSIGN_CELL_TYPE_MISMATCH", "ASSIGN_MATERIAL_MISSING"]);
    }

    #[test]
    fn capability_checks() {
        let (mut request, mesh) = elastic_case(&grid());
        request.model.mode = "axisymmetric".into();
        request.stages[0].analysis_type = "dynamic".into();
        request.stages[0].loads[0].kind = "pressure".into();
        request.stages[0].output_requests[0].name = "p".into();
        let caps = ReferenceElastic.capabilities();
        let issues = validate(&request, &mesh, Some(&caps));
        assert_eq!(
            codes(&issues),
            vec!["CAP_MODE_UNSUPPORTED", "CAP_ANALYSIS_UNSUPPORTED", "CAP_LOAD_UNSUPPORTED", "CAP_OUTPUT_UNSUPPORTED"]
        );

        request.schema_version = "0.9".into();
        let issues = validate(&request, &mesh, Some(&caps));
        assert_eq!(issues[0].code, "CAP_CONTRACT");
    }

    #[test]
    fn stage_warnings_do_not_block() {
        let (mut request, mesh) = elastic_case(&grid());
        let mut second = request.stages[0].clone();
        second.num_steps = 0;
        second.dt = -1.0;
        request.stages.push(second);
        let issues = validate(&request, &mesh, None);
        assert_eq!(codes(&issues), vec!["STAGE_ID_DUPLICATE", "STAGE_STEPS", "STAGE_DT"]);
        assert!(!has_errors(&issues));
    }

    #[test]
    fn dedup_keeps_first_occurrence() {
        let a = PrecheckIssue::error("A", "x");
        let b = PrecheckIssue::warn("B", "y");
        let out = dedup(vec![a.clone(), b.clone(), a.clone()]);
        assert_eq!(out, vec![a, b]);
        assert_eq!(PrecheckIssue::info("C", "z").to_string(), "[INFO] C: z");
    }
}
