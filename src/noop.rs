use ndarray::{Array1, Array2};
use serde_json::json;

use crate::error::Result;
use crate::fem;
use crate::mesh::Mesh;
use crate::request::SolveRequest;
use crate::result::{ArrayKey, FieldDescriptor, FieldLocation, FieldShape, ResultArrays, SolveResult};
use crate::solver::{Capabilities, ContractRange, SolveCallbacks, SolveOutput, Solver};

pub const NAME: &str = "noop";

/// Placeholder solver for bring-up and tests. Emits smooth synthetic `u`,
/// `p` and `vm` fields that grow with progress, without any numerics.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopSolver;

impl Solver for NoopSolver {
    fn capabilities(&self) -> Capabilities {
        let strings = |items: &[&str]| items.iter().map(|s| (*s).to_owned()).collect();
        Capabilities {
            name: NAME.to_owned(),
            version: env!("CARGO_PKG_VERSION").to_owned(),
            contract: ContractRange {
                min: "0.1".to_owned(),
                max: "0.2".to_owned(),
            },
            modes: strings(&["plane_strain", "plane_stress", "axisymmetric"]),
            analysis_types: strings(&["static", "dynamic", "seepage_steady", "seepage_transient", "consolidation_u_p"]),
            materials: Vec::new(),
            bcs: Vec::new(),
            loads: Vec::new(),
            fields: strings(&["u", "p", "vm"]),
            results: strings(&["u", "p", "stress", "strain", "vm"]),
        }
    }

    fn solve(&self, request: &SolveRequest, mesh: &Mesh, callbacks: &dyn SolveCallbacks) -> Result<SolveOutput> {
        let centroid_y: Vec<f64> = mesh
            .blocks()
            .flat_map(|block| block.cells())
            .map(|nodes| nodes.iter().map(|&n| mesh.points()[n][1]).sum::<f64>() / nodes.len() as f64)
            .collect();
        let total: usize = request.stages.iter().map(|s| s.steps()).sum::<usize>().max(1);

        let mut arrays = ResultArrays::new();
        let mut done = 0;
        let timeline = fem::run_stages(request, NAME, callbacks, |frame| {
            done += 1;
            let p = done as f64 / total as f64;
            let n = mesh.num_points();
            let u = Array2::from_shape_fn((n, 2), |(_, j)| if j == 0 { 1e-3 * p } else { -1e-3 * p });
            let pore = Array1::from_elem(n, 10.0 * p);
            let vm: Array1<f64> = centroid_y.iter().map(|y| 50.0 * p + 5.0 * y).collect();

            arrays.insert(ArrayKey::new(FieldLocation::Node, "u", frame.step_id), u.into_dyn())?;
            arrays.insert(ArrayKey::new(FieldLocation::Node, "p", frame.step_id), pore.into_dyn())?;
            arrays.insert(ArrayKey::new(FieldLocation::Element, "vm", frame.step_id), vm.into_dyn())
        })?;

        let length = request.unit("length", "m");
        let pressure = request.unit("pressure", "kPa");
        let mut meta = SolveResult::success(vec![
            FieldDescriptor::new("u", FieldLocation::Node, FieldShape::Vector2, length),
            FieldDescriptor::new("p", FieldLocation::Node, FieldShape::Scalar, pressure.clone()),
            FieldDescriptor::new("vm", FieldLocation::Element, FieldShape::Scalar, pressure),
        ]);
        meta.solver_info = Some(json!({"name": NAME, "note": "placeholder solver"}));
        meta.stages = timeline.stages;
        meta.global_steps = timeline.global_steps;
        Ok(SolveOutput { meta, arrays })
    }
}
