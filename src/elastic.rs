use std::collections::{BTreeMap, BTreeSet};

use nalgebra::{DMatrix, DVector, SMatrix, Vector3};
use nalgebra_sparse::CscMatrix;
use ndarray::{Array1, Array2};
use serde::Deserialize;
use serde_json::json;

use crate::error::{Result, SolveError};
use crate::fem::{
    self, cell_coords, cell_dofs, constitutive_matrix, edge_length, gauss_points, quad_gradients,
    quad_shape, quad_strain_displacement, tri_strain_displacement, Assembler, Frame, LinearSystem,
    MaterialMap,
};
use crate::mesh::{CellType, Mesh};
use crate::request::{AnalysisMode, MaterialSpec, SolveRequest};
use crate::result::{ArrayKey, FieldDescriptor, FieldLocation, FieldShape, ResultArrays, SolveResult};
use crate::solver::{Capabilities, ContractRange, SolveCallbacks, SolveOutput, Solver};

pub const NAME: &str = "reference_elastic";

const DOF: usize = 2;
const FIELDS: [&str; 5] = ["u", "sx", "sy", "sxy", "vm"];

/// Small-strain linear elastic statics on tri3/quad4 meshes.
#[derive(Debug, Clone, Copy, Default)]
pub struct ReferenceElastic;

#[derive(Debug, Clone, Copy)]
struct ElasticMaterial {
    youngs_modulus: f64,
    poisson_ratio: f64,
    density: f64,
}

fn parse_material(id: &str, spec: &MaterialSpec) -> Result<ElasticMaterial> {
    if spec.model_name != "linear_elastic" {
        return Err(SolveError::SolverRuntime(format!(
            "{NAME} supports only linear_elastic, got '{}' for material '{id}'",
            spec.model_name
        )));
    }
    let material = ElasticMaterial {
        youngs_modulus: fem::required_param(id, spec, "E")?,
        poisson_ratio: fem::required_param(id, spec, "nu")?,
        density: spec.number("rho")?.unwrap_or(0.0),
    };
    if material.youngs_modulus <= 0.0 || !(-1.0..0.5).contains(&material.poisson_ratio) {
        return Err(SolveError::SolverRuntime(format!(
            "material '{id}' needs E > 0 and -1 < nu < 0.5"
        )));
    }
    Ok(material)
}

#[derive(Debug, Deserialize)]
struct DisplacementValue {
    #[serde(default)]
    ux: Option<f64>,
    #[serde(default)]
    uy: Option<f64>,
}

/// Per-cell data kept for stress recovery: the cell's dofs and the matrix
/// mapping its nodal displacements to the (averaged) stress.
struct StressOperator {
    dofs: Vec<usize>,
    stress: DMatrix<f64>,
}

/// Assembled body-force weights and stress operators.
struct ElasticModel {
    /// `∫ rho N t dA` per node; the body force at node `i` is `weights[i] * g`.
    body_weights: DVector<f64>,
    stress_operators: Vec<StressOperator>,
}

fn assemble(
    mesh: &Mesh,
    materials: &MaterialMap<ElasticMaterial>,
    mode: AnalysisMode,
    thickness: f64,
) -> Result<(CscMatrix<f64>, ElasticModel)> {
    let ndof = DOF * mesh.num_points();
    let mut assembler = Assembler::new(ndof);
    let mut body_weights = DVector::zeros(mesh.num_points());
    let mut stress_operators = Vec::with_capacity(mesh.num_cells());

    for cell in materials.cells(mesh) {
        let m = cell.material;
        let d = constitutive_matrix(mode, m.youngs_modulus, m.poisson_ratio)?;
        let dofs = cell_dofs(cell.nodes, DOF);

        match cell.cell_type {
            CellType::Tri3 => {
                let (b, area) = tri_strain_displacement(&cell_coords::<3>(mesh, cell.nodes))?;
                let ke = b.transpose() * d * b * (area * thickness);
                assembler.add(&dofs, &ke);
                for &node in cell.nodes {
                    body_weights[node] += m.density * area * thickness / 3.0;
                }
                let db = d * b;
                stress_operators.push(StressOperator {
                    dofs,
                    stress: DMatrix::from_column_slice(3, 6, db.as_slice()),
                });
            }
            CellType::Quad4 => {
                let xy = cell_coords::<4>(mesh, cell.nodes);
                let mut ke = SMatrix::<f64, 8, 8>::zeros();
                let mut db_mean = SMatrix::<f64, 3, 8>::zeros();
                for (xi, eta) in gauss_points() {
                    let (grads, det) = quad_gradients(&xy, xi, eta)?;
                    let b = quad_strain_displacement(&grads);
                    ke += b.transpose() * d * b * (det * thickness);
                    db_mean += d * b * 0.25;
                    let n = quad_shape(xi, eta);
                    for (i, &node) in cell.nodes.iter().enumerate() {
                        body_weights[node] += m.density * n[i] * det * thickness;
                    }
                }
                assembler.add(&dofs, &ke);
                stress_operators.push(StressOperator {
                    dofs,
                    stress: DMatrix::from_column_slice(3, 8, db_mean.as_slice()),
                });
            }
        }
    }

    let model = ElasticModel {
        body_weights,
        stress_operators,
    };
    Ok((assembler.finish(), model))
}

/// Gravity vector in effect for a frame. A stage `gravity` load replaces the
/// previous vector, ramped within the stage that introduces it.
fn gravity_at(request: &SolveRequest, frame: &Frame) -> Result<[f64; 2]> {
    let mut g = request.model.gravity;
    for (index, stage) in frame.active_stages(request).iter().enumerate() {
        let factor = frame.load_factor(index);
        for load in stage.loads.iter().filter(|l| l.kind == "gravity") {
            let target: [f64; 2] = load.value_as()?;
            g = [
                g[0] + (target[0] - g[0]) * factor,
                g[1] + (target[1] - g[1]) * factor,
            ];
        }
    }
    Ok(g)
}

fn load_vector(request: &SolveRequest, mesh: &Mesh, model: &ElasticModel, frame: &Frame) -> Result<DVector<f64>> {
    let thickness = request.model.thickness();
    let g = gravity_at(request, frame)?;

    let mut f = DVector::zeros(DOF * mesh.num_points());
    for (node, w) in model.body_weights.iter().enumerate() {
        f[DOF * node] += w * g[0];
        f[DOF * node + 1] += w * g[1];
    }

    for (index, stage) in frame.active_stages(request).iter().enumerate() {
        let factor = frame.load_factor(index);
        for load in &stage.loads {
            match load.kind.as_str() {
                "gravity" => {}
                "traction" => {
                    let t: [f64; 2] = load.value_as()?;
                    for &edge in fem::set_edges(mesh, load.set.as_deref(), "traction")? {
                        let share = edge_length(mesh, edge) / 2.0 * thickness * factor;
                        for node in edge {
                            f[DOF * node] += t[0] * share;
                            f[DOF * node + 1] += t[1] * share;
                        }
                    }
                }
                other => {
                    return Err(SolveError::SolverRuntime(format!(
                        "{NAME} does not support load type '{other}'"
                    )))
                }
            }
        }
    }
    Ok(f)
}

/// Prescribed dofs in effect for a frame; later stages override earlier ones.
fn constraints(request: &SolveRequest, mesh: &Mesh, frame: &Frame) -> Result<BTreeMap<usize, f64>> {
    let mut fixed = BTreeMap::new();
    for stage in frame.active_stages(request) {
        for bc in &stage.bcs {
            if bc.kind != "displacement" {
                return Err(SolveError::SolverRuntime(format!(
                    "{NAME} does not support boundary condition type '{}'",
                    bc.kind
                )));
            }
            let value: DisplacementValue = bc.value_as()?;
            for node in fem::set_nodes(mesh, &bc.set)? {
                if let Some(ux) = value.ux {
                    fixed.insert(DOF * node, ux);
                }
                if let Some(uy) = value.uy {
                    fixed.insert(DOF * node + 1, uy);
                }
            }
        }
    }
    Ok(fixed)
}

fn registry(request: &SolveRequest, fields: &BTreeSet<String>) -> Vec<FieldDescriptor> {
    let length = request.unit("length", "m");
    let pressure = request.unit("pressure", "Pa");
    FIELDS
        .iter()
        .filter(|name| fields.contains(**name))
        .map(|&name| match name {
            "u" => FieldDescriptor::new(name, FieldLocation::Node, FieldShape::Vector2, length.clone()),
            _ => FieldDescriptor::new(name, FieldLocation::Element, FieldShape::Scalar, pressure.clone()),
        })
        .collect()
}

impl Solver for ReferenceElastic {
    fn capabilities(&self) -> Capabilities {
        let strings = |items: &[&str]| items.iter().map(|s| (*s).to_owned()).collect();
        Capabilities {
            name: NAME.to_owned(),
            version: env!("CARGO_PKG_VERSION").to_owned(),
            contract: ContractRange {
                min: "0.1".to_owned(),
                max: "0.2".to_owned(),
            },
            modes: strings(&["plane_strain", "plane_stress"]),
            analysis_types: strings(&["static"]),
            materials: strings(&["linear_elastic"]),
            bcs: strings(&["displacement"]),
            loads: strings(&["gravity", "traction"]),
            fields: strings(&FIELDS),
            results: strings(&["u", "stress", "vm"]),
        }
    }

    fn solve(&self, request: &SolveRequest, mesh: &Mesh, callbacks: &dyn SolveCallbacks) -> Result<SolveOutput> {
        let mode = match request.model.analysis_mode() {
            Some(mode @ (AnalysisMode::PlaneStrain | AnalysisMode::PlaneStress)) => mode,
            _ => {
                return Err(SolveError::SolverRuntime(format!(
                    "{NAME} supports only plane_strain/plane_stress, got '{}'",
                    request.model.mode
                )))
            }
        };
        let thickness = request.model.thickness();
        if thickness <= 0.0 {
            return Err(SolveError::SolverRuntime("model thickness must be positive".to_owned()));
        }
        if !mesh.has_cells() {
            return Err(SolveError::SolverRuntime("mesh has no cells".to_owned()));
        }

        let materials = MaterialMap::resolve(request, mesh, parse_material)?;
        callbacks.on_log(
            log::Level::Info,
            &format!(
                "{NAME}: assembling {} cells, {} dofs ({mode})",
                mesh.num_cells(),
                DOF * mesh.num_points()
            ),
        );
        let (stiffness, model) = assemble(mesh, &materials, mode, thickness)?;

        let solver_spec = request.linear_solver();
        let mut system = LinearSystem::new(stiffness, solver_spec.clone());
        let fields = fem::requested_fields(request, &FIELDS);
        let mut arrays = ResultArrays::new();

        let timeline = fem::run_stages(request, NAME, callbacks, |frame| {
            let load = load_vector(request, mesh, &model, frame)?;
            let fixed = constraints(request, mesh, frame)?;
            let u = system.solve(&load, &fixed)?;
            write_frame(&mut arrays, &fields, &model, &u, mesh.num_points(), frame.step_id)
        })?;

        let mut meta = SolveResult::success(registry(request, &fields));
        meta.solver_info = Some(json!({
            "name": NAME,
            "version": env!("CARGO_PKG_VERSION"),
            "linear_solver": solver_spec.method,
        }));
        meta.stages = timeline.stages;
        meta.global_steps = timeline.global_steps;

        Ok(SolveOutput { meta, arrays })
    }
}

fn write_frame(
    arrays: &mut ResultArrays,
    fields: &BTreeSet<String>,
    model: &ElasticModel,
    u: &DVector<f64>,
    num_points: usize,
    step: usize,
) -> Result<()> {
    if fields.contains("u") {
        let displacement = Array2::from_shape_fn((num_points, DOF), |(i, j)| u[DOF * i + j]);
        arrays.insert(ArrayKey::new(FieldLocation::Node, "u", step), displacement.into_dyn())?;
    }

    let stresses: Vec<Vector3<f64>> = model
        .stress_operators
        .iter()
        .map(|op| {
            let ue = DVector::from_iterator(op.dofs.len(), op.dofs.iter().map(|&d| u[d]));
            let s = &op.stress * ue;
            Vector3::new(s[0], s[1], s[2])
        })
        .collect();

    let components: [(&str, fn(&Vector3<f64>) -> f64); 4] = [
        ("sx", |s| s[0]),
        ("sy", |s| s[1]),
        ("sxy", |s| s[2]),
        ("vm", fem::von_mises),
    ];
    for (name, component) in components {
        if fields.contains(name) {
            let values: Array1<f64> = stresses.iter().map(component).collect();
            arrays.insert(ArrayKey::new(FieldLocation::Element, name, step), values.into_dyn())?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cases::StructuredGrid;
    use crate::solver::NoCallbacks;
    use approx::assert_relative_eq;

    fn request(json: &str) -> SolveRequest {
        SolveRequest::from_json_str(json).unwrap()
    }

    fn bar_request(extra_stage: &str) -> SolveRequest {
        request(&format!(
            r#"{{
            "schema_version": "0.2",
            "model": {{"dimension": 2, "mode": "plane_stress", "gravity": [0.0, 0.0]}},
            "materials": {{"steel": {{"model_name": "linear_elastic", "parameters": {{"E": 1000.0, "nu": 0.0}}}}}},
            "assignments": [{{"element_set": "all", "cell_type": "tri3", "material_id": "steel"}}],
            "stages": [{{
                "id": "pull",
                "bcs": [
                    {{"type": "displacement", "set": "left", "value": {{"ux": 0.0}}}},
                    {{"type": "displacement", "set": "bottom", "value": {{"uy": 0.0}}}}
                ],
                "loads": [{{"type": "traction", "set": "right", "value": [10.0, 0.0]}}]
                {extra_stage}
            }}]
        }}"#
        ))
    }

    #[test]
    fn uniaxial_tension_matches_hand_solution() {
        // 4 x 1 bar, sigma = 10, E = 1000, nu = 0 -> strain 0.01
        let grid = StructuredGrid::new(4.0, 1.0, 4, 2);
        let mesh = grid.tri_mesh("all");
        let out = ReferenceElastic.solve(&bar_request(""), &mesh, &NoCallbacks).unwrap();

        let u = out.arrays.field(FieldLocation::Node, "u", 1).unwrap();
        for (node, p) in mesh.points().iter().enumerate() {
            assert_relative_eq!(u[[node, 0]], 0.01 * p[0], epsilon = 1e-9);
        }
        let sx = out.arrays.field(FieldLocation::Element, "sx", 1).unwrap();
        let vm = out.arrays.field(FieldLocation::Element, "vm", 1).unwrap();
        for (s, v) in sx.iter().zip(vm.iter()) {
            assert_relative_eq!(*s, 10.0, epsilon = 1e-8);
            assert_relative_eq!(*v, 10.0, epsilon = 1e-8);
        }
        out.meta.check_arrays(&out.arrays, &mesh).unwrap();
    }

    #[test]
    fn quad_mesh_gives_same_uniform_stress() {
        let grid = StructuredGrid::new(4.0, 1.0, 4, 2);
        let mesh = grid.quad_mesh("all");
        let mut req = bar_request("");
        req.assignments[0].cell_type = CellType::Quad4;
        let out = ReferenceElastic.solve(&req, &mesh, &NoCallbacks).unwrap();
        let sx = out.arrays.field(FieldLocation::Element, "sx", 1).unwrap();
        assert_eq!(sx.len(), 8);
        for s in sx.iter() {
            assert_relative_eq!(*s, 10.0, epsilon = 1e-8);
        }
    }

    #[test]
    fn loads_ramp_over_steps_and_schedule_is_honored() {
        let grid = StructuredGrid::new(4.0, 1.0, 4, 2);
        let mesh = grid.tri_mesh("all");
        let req = bar_request(r#", "num_steps": 4, "output_requests": [{"name": "u", "every_n": 2}]"#);
        let out = ReferenceElastic.solve(&req, &mesh, &NoCallbacks).unwrap();

        assert_eq!(out.meta.stages[0].output_stage_steps, vec![0, 2, 3]);
        assert_eq!(out.meta.global_steps.len(), 3);
        assert_eq!(out.meta.registry.len(), 1);
        let tip = mesh.num_points() - 1;
        let u1 = out.arrays.field(FieldLocation::Node, "u", 1).unwrap()[[tip, 0]];
        let u3 = out.arrays.field(FieldLocation::Node, "u", 3).unwrap()[[tip, 0]];
        assert_relative_eq!(u1 * 4.0, u3, epsilon = 1e-9);
        assert!(out.arrays.field(FieldLocation::Element, "vm", 1).is_none());
    }

    #[test]
    fn free_body_is_singular() {
        let grid = StructuredGrid::new(1.0, 1.0, 1, 1);
        let mesh = grid.tri_mesh("all");
        let mut req = bar_request("");
        req.stages[0].bcs.clear();
        let err = ReferenceElastic.solve(&req, &mesh, &NoCallbacks).unwrap_err();
        assert_eq!(err.code(), "SOLVER_SINGULAR");
    }

    #[test]
    fn material_errors_are_runtime_errors() {
        let grid = StructuredGrid::new(1.0, 1.0, 1, 1);
        let mesh = grid.tri_mesh("all");

        let mut req = bar_request("");
        req.assignments[0].material_id = "missing".into();
        let err = ReferenceElastic.solve(&req, &mesh, &NoCallbacks).unwrap_err();
        assert_eq!(err.code(), "SOLVER_RUNTIME");
        assert!(err.to_string().contains("missing"));

        let mut req = bar_request("");
        req.assignments.clear();
        assert_eq!(
            ReferenceElastic.solve(&req, &mesh, &NoCallbacks).unwrap_err().code(),
            "SOLVER_RUNTIME"
        );
    }

    #[test]
    fn cancellation_is_polled_before_each_step() {
        struct CancelNow;
        impl SolveCallbacks for CancelNow {
            fn should_cancel(&self) -> bool {
                true
            }
        }
        let grid = StructuredGrid::new(1.0, 1.0, 1, 1);
        let err = ReferenceElastic
            .solve(&bar_request(""), &grid.tri_mesh("all"), &CancelNow)
            .unwrap_err();
        assert!(err.is_cancelled());
    }
}
