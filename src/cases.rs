//! Generators for structured rectangle meshes and the two reference cases.

use std::collections::BTreeMap;
use std::path::Path;
use std::str::FromStr;

use serde_json::{json, Value};

use crate::case_folder;
use crate::error::{Result, SolveError};
use crate::mesh::{CellType, Mesh};
use crate::request::{
    Assignment, BcSpec, LoadSpec, MaterialSpec, ModelSpec, OutputRequest, SolveRequest, Stage,
    CONTRACT_VERSION,
};

/// Boundary sets written on every generated grid, as both node and edge sets.
pub const SIDES: [&str; 4] = ["bottom", "top", "left", "right"];

/// `nx` by `ny` cells over `[0, lx] x [0, ly]`.
///
/// Node `(i, j)` has id `j * (nx + 1) + i`, so node 0 is the bottom-left
/// corner and the last node the top-right one.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StructuredGrid {
    pub lx: f64,
    pub ly: f64,
    pub nx: usize,
    pub ny: usize,
}

impl StructuredGrid {
    /// Cell counts below one are raised to one.
    pub fn new(lx: f64, ly: f64, nx: usize, ny: usize) -> StructuredGrid {
        StructuredGrid {
            lx,
            ly,
            nx: nx.max(1),
            ny: ny.max(1),
        }
    }

    fn node(&self, i: usize, j: usize) -> usize {
        j * (self.nx + 1) + i
    }

    fn points(&self) -> Vec<[f64; 2]> {
        let mut points = Vec::with_capacity((self.nx + 1) * (self.ny + 1));
        for j in 0..=self.ny {
            for i in 0..=self.nx {
                points.push([
                    self.lx * i as f64 / self.nx as f64,
                    self.ly * j as f64 / self.ny as f64,
                ]);
            }
        }
        points
    }

    fn side(&self, name: &str) -> Vec<usize> {
        match name {
            "bottom" => (0..=self.nx).map(|i| self.node(i, 0)).collect(),
            "top" => (0..=self.nx).map(|i| self.node(i, self.ny)).collect(),
            "left" => (0..=self.ny).map(|j| self.node(0, j)).collect(),
            _ => (0..=self.ny).map(|j| self.node(self.nx, j)).collect(),
        }
    }

    fn build(&self, cell_type: CellType, connectivity: Vec<usize>, element_set: &str) -> Mesh {
        let mut node_sets = BTreeMap::new();
        let mut edge_sets = BTreeMap::new();
        for name in SIDES {
            let nodes = self.side(name);
            let edges = nodes.windows(2).map(|w| [w[0], w[1]]).collect();
            node_sets.insert(name.to_owned(), nodes);
            edge_sets.insert(name.to_owned(), edges);
        }
        let num_cells = connectivity.len() / cell_type.nodes_per_cell();
        let element_sets = BTreeMap::from([((element_set.to_owned(), cell_type), (0..num_cells).collect())]);
        Mesh::from_parts(
            self.points(),
            vec![(cell_type, connectivity)],
            node_sets,
            edge_sets,
            element_sets,
        )
    }

    /// Two counter-clockwise triangles per grid cell, all in `element_set`.
    pub fn tri_mesh(&self, element_set: &str) -> Mesh {
        let mut connectivity = Vec::with_capacity(self.nx * self.ny * 6);
        for j in 0..self.ny {
            for i in 0..self.nx {
                let (n00, n10) = (self.node(i, j), self.node(i + 1, j));
                let (n01, n11) = (self.node(i, j + 1), self.node(i + 1, j + 1));
                connectivity.extend([n00, n10, n11, n00, n11, n01]);
            }
        }
        self.build(CellType::Tri3, connectivity, element_set)
    }

    /// One counter-clockwise quad per grid cell, all in `element_set`.
    pub fn quad_mesh(&self, element_set: &str) -> Mesh {
        let mut connectivity = Vec::with_capacity(self.nx * self.ny * 4);
        for j in 0..self.ny {
            for i in 0..self.nx {
                connectivity.extend([
                    self.node(i, j),
                    self.node(i + 1, j),
                    self.node(i + 1, j + 1),
                    self.node(i, j + 1),
                ]);
            }
        }
        self.build(CellType::Quad4, connectivity, element_set)
    }
}

/// Grid used by the shipped reference cases.
pub fn reference_grid() -> StructuredGrid {
    StructuredGrid::new(10.0, 4.0, 30, 12)
}

fn material(model_name: &str, parameters: Value) -> MaterialSpec {
    let parameters = match parameters {
        Value::Object(map) => map.into_iter().collect(),
        _ => BTreeMap::new(),
    };
    MaterialSpec {
        model_name: model_name.to_owned(),
        parameters,
    }
}

fn output(uid: &str, name: &str, location: &str) -> OutputRequest {
    OutputRequest {
        uid: Some(uid.to_owned()),
        name: name.to_owned(),
        location: Some(location.to_owned()),
        every_n: 1,
    }
}

fn base_request(gravity: [f64; 2], material_id: &str, spec: MaterialSpec, stage: Stage) -> SolveRequest {
    SolveRequest {
        schema_version: CONTRACT_VERSION.to_owned(),
        unit_system: BTreeMap::from([
            ("length".to_owned(), "m".to_owned()),
            ("pressure".to_owned(), "Pa".to_owned()),
        ]),
        model: ModelSpec {
            dimension: 2,
            mode: "plane_strain".to_owned(),
            gravity,
            thickness: None,
        },
        materials: BTreeMap::from([(material_id.to_owned(), spec)]),
        assignments: vec![Assignment {
            uid: Some(format!("as_{material_id}")),
            element_set: "soil".to_owned(),
            cell_type: CellType::Tri3,
            material_id: material_id.to_owned(),
        }],
        stages: vec![stage],
        output_requests: Vec::new(),
        linear_solver: None,
    }
}

/// Soil block under self weight plus a downward surface traction: bottom
/// fixed, left edge on rollers, eight load steps.
pub fn elastic_case(grid: &StructuredGrid) -> (SolveRequest, Mesh) {
    let stage = Stage {
        id: Some("S1".to_owned()),
        uid: None,
        name: Some("S1_initial".to_owned()),
        analysis_type: "static".to_owned(),
        num_steps: 8,
        dt: 1.0,
        bcs: vec![
            BcSpec {
                uid: Some("bc_bottom_fix".to_owned()),
                kind: "displacement".to_owned(),
                set: "bottom".to_owned(),
                value: json!({"ux": 0.0, "uy": 0.0}),
            },
            BcSpec {
                uid: Some("bc_left_ux".to_owned()),
                kind: "displacement".to_owned(),
                set: "left".to_owned(),
                value: json!({"ux": 0.0}),
            },
        ],
        loads: vec![LoadSpec {
            uid: Some("ld_top_trac".to_owned()),
            kind: "traction".to_owned(),
            set: Some("top".to_owned()),
            value: json!([0.0, -1.0e5]),
        }],
        output_requests: vec![output("or_u", "u", "node"), output("or_vm", "vm", "element")],
    };
    let soil = material("linear_elastic", json!({"E": 3.0e7, "nu": 0.3, "rho": 1800.0}));
    let request = base_request([0.0, -9.81], "mat_soil", soil, stage);
    (request, grid.tri_mesh("soil"))
}

/// Steady seepage with fixed pore pressure on top and outflow through the
/// bottom edge, five frames.
pub fn seepage_case(grid: &StructuredGrid) -> (SolveRequest, Mesh) {
    let stage = Stage {
        id: Some("S1".to_owned()),
        uid: None,
        name: Some("S1_seepage".to_owned()),
        analysis_type: "seepage_steady".to_owned(),
        num_steps: 5,
        dt: 1.0,
        bcs: vec![BcSpec {
            uid: Some("bc_p_top".to_owned()),
            kind: "p".to_owned(),
            set: "top".to_owned(),
            value: json!(1.0e5),
        }],
        loads: vec![LoadSpec {
            uid: Some("ld_flux_bottom".to_owned()),
            kind: "flux".to_owned(),
            set: Some("bottom".to_owned()),
            value: json!(-1.0e-6),
        }],
        output_requests: vec![output("or_p", "p", "node")],
    };
    let darcy = material("darcy", json!({"k": 1.0e-6}));
    let request = base_request([0.0, 0.0], "mat_k", darcy, stage);
    (request, grid.tri_mesh("soil"))
}

/// The reference case families `make-case` can write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaseKind {
    Elastic,
    Seepage,
}

impl CaseKind {
    pub fn build(self, grid: &StructuredGrid) -> (SolveRequest, Mesh) {
        match self {
            CaseKind::Elastic => elastic_case(grid),
            CaseKind::Seepage => seepage_case(grid),
        }
    }

    /// Solver selector that handles this case family.
    pub fn solver(self) -> &'static str {
        match self {
            CaseKind::Elastic => crate::elastic::NAME,
            CaseKind::Seepage => crate::seepage::NAME,
        }
    }
}

impl FromStr for CaseKind {
    type Err = SolveError;

    fn from_str(s: &str) -> Result<CaseKind> {
        match s {
            "elastic" => Ok(CaseKind::Elastic),
            "seepage" => Ok(CaseKind::Seepage),
            other => Err(SolveError::Contract(format!(
                "Unknown case kind '{other}' (expected elastic or seepage)"
            ))),
        }
    }
}

/// Writes the reference case of `kind` into `case_dir`.
pub fn write_reference_case(kind: CaseKind, case_dir: &Path) -> Result<()> {
    let (request, mesh) = kind.build(&reference_grid());
    case_folder::write_case(case_dir, &request, &mesh)?;
    log::info!("wrote {kind:?} case to {}", case_dir.display());
    Ok(())
}
