use std::collections::BTreeMap;

use nalgebra::{DVector, SMatrix};
use ndarray::Array1;
use serde_json::json;

use crate::error::{Result, SolveError};
use crate::fem::{self, cell_coords, edge_length, gauss_points, quad_gradients, tri_gradients, Assembler, Frame, LinearSystem, MaterialMap};
use crate::mesh::{CellType, Mesh};
use crate::request::{AnalysisMode, MaterialSpec, SolveRequest};
use crate::result::{ArrayKey, FieldDescriptor, FieldLocation, FieldShape, ResultArrays, SolveResult};
use crate::solver::{Capabilities, ContractRange, SolveCallbacks, SolveOutput, Solver};

pub const NAME: &str = "reference_seepage";

const FIELDS: [&str; 1] = ["p"];

/// Steady seepage (Poisson/Darcy) with nodal pressure `p`.
///
/// There is no time dependence: every scheduled frame is an independent
/// steady solve with the loads of that frame.
#[derive(Debug, Clone, Copy, Default)]
pub struct ReferenceSeepage;

#[derive(Debug, Clone, Copy)]
struct DarcyMaterial {
    permeability: f64,
}

fn parse_material(id: &str, spec: &MaterialSpec) -> Result<DarcyMaterial> {
    if spec.model_name != "darcy" {
        return Err(SolveError::SolverRuntime(format!(
            "{NAME} supports only darcy, got '{}' for material '{id}'",
            spec.model_name
        )));
    }
    let permeability = fem::required_param(id, spec, "k")?;
    if permeability <= 0.0 {
        return Err(SolveError::SolverRuntime(format!("material '{id}' needs k > 0")));
    }
    Ok(DarcyMaterial { permeability })
}

fn assemble(mesh: &Mesh, materials: &MaterialMap<DarcyMaterial>, thickness: f64) -> Result<nalgebra_sparse::CscMatrix<f64>> {
    let mut assembler = Assembler::new(mesh.num_points());
    for cell in materials.cells(mesh) {
        let k = cell.material.permeability * thickness;
        match cell.cell_type {
            CellType::Tri3 => {
                let (g, area) = tri_gradients(&cell_coords::<3>(mesh, cell.nodes))?;
                assembler.add(cell.nodes, &(g.transpose() * g * (k * area)));
            }
            CellType::Quad4 => {
                let xy = cell_coords::<4>(mesh, cell.nodes);
                let mut ke = SMatrix::<f64, 4, 4>::zeros();
                for (xi, eta) in gauss_points() {
                    let (g, det) = quad_gradients(&xy, xi, eta)?;
                    ke += g.transpose() * g * (k * det);
                }
                assembler.add(cell.nodes, &ke);
            }
        }
    }
    Ok(assembler.finish())
}

/// Boundary inflow for a frame: `flux` is a flow per unit length, positive
/// into the domain, split equally between the two nodes of each edge.
fn flux_vector(request: &SolveRequest, mesh: &Mesh, frame: &Frame) -> Result<DVector<f64>> {
    let thickness = request.model.thickness();
    let mut f = DVector::zeros(mesh.num_points());
    for (index, stage) in frame.active_stages(request).iter().enumerate() {
        let factor = frame.load_factor(index);
        for load in &stage.loads {
            if load.kind != "flux" {
                return Err(SolveError::SolverRuntime(format!(
                    "{NAME} does not support load type '{}'",
                    load.kind
                )));
            }
            let q: f64 = load.value_as()?;
            for &edge in fem::set_edges(mesh, load.set.as_deref(), "flux")? {
                let share = q * edge_length(mesh, edge) / 2.0 * thickness * factor;
                f[edge[0]] += share;
                f[edge[1]] += share;
            }
        }
    }
    Ok(f)
}

fn constraints(request: &SolveRequest, mesh: &Mesh, frame: &Frame) -> Result<BTreeMap<usize, f64>> {
    let mut fixed = BTreeMap::new();
    for stage in frame.active_stages(request) {
        for bc in &stage.bcs {
            if bc.kind != "p" {
                return Err(SolveError::SolverRuntime(format!(
                    "{NAME} does not support boundary condition type '{}'",
                    bc.kind
                )));
            }
            let value: f64 = bc.value_as()?;
            for node in fem::set_nodes(mesh, &bc.set)? {
                fixed.insert(node, value);
            }
        }
    }
    Ok(fixed)
}

impl Solver for ReferenceSeepage {
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
            analysis_types: strings(&["seepage_steady"]),
            materials: strings(&["darcy"]),
            bcs: strings(&["p"]),
            loads: strings(&["flux"]),
            fields: strings(&FIELDS),
            results: strings(&FIELDS),
        }
    }

    fn solve(&self, request: &SolveRequest, mesh: &Mesh, callbacks: &dyn SolveCallbacks) -> Result<SolveOutput> {
        if request.model.analysis_mode() == Some(AnalysisMode::Axisymmetric) {
            return Err(SolveError::SolverRuntime(format!("{NAME} does not support axisymmetric models")));
        }
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
            &format!("{NAME}: assembling {} cells, {} nodes", mesh.num_cells(), mesh.num_points()),
        );
        let spec = request.linear_solver();
        let mut system = LinearSystem::new(assemble(mesh, &materials, thickness)?, spec.clone());
        let mut arrays = ResultArrays::new();

        let timeline = fem::run_stages(request, NAME, callbacks, |frame| {
            let flux = flux_vector(request, mesh, frame)?;
            let fixed = constraints(request, mesh, frame)?;
            let p = system.solve(&flux, &fixed)?;
            let values: Array1<f64> = p.iter().copied().collect();
            arrays.insert(ArrayKey::new(FieldLocation::Node, "p", frame.step_id), values.into_dyn())
        })?;

        let unit = request.unit("pressure", "Pa");
        let mut meta = SolveResult::success(vec![FieldDescriptor::new(
            "p",
            FieldLocation::Node,
            FieldShape::Scalar,
            unit,
        )]);
        meta.solver_info = Some(json!({
            "name": NAME,
            "version": env!("CARGO_PKG_VERSION"),
            "linear_solver": spec.method,
        }));
        meta.stages = timeline.stages;
        meta.global_steps = timeline.global_steps;

        Ok(SolveOutput { meta, arrays })
    }
}
