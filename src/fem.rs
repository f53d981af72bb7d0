//! Finite element kernel shared by the reference solvers: element matrices,
//! sparse assembly, constrained linear solves, material assignment and the
//! stage/step driver.

use std::collections::{BTreeMap, BTreeSet};

use argmin::{
    core::{
        observers::{Observe, ObserverMode},
        Error, Executor, Operator, State, KV,
    },
    solver::conjugategradient::ConjugateGradient,
};
use nalgebra::storage::RawStorage;
use nalgebra::{matrix, DMatrix, DVector, Dim, Matrix, Matrix3, SMatrix, SVector, Vector3};
use nalgebra_sparse::factorization::CscCholesky;
use nalgebra_sparse::{CooMatrix, CscMatrix};

use crate::error::{Result, SolveError};
use crate::mesh::{CellType, Mesh};
use crate::request::{
    AnalysisMode, LinearSolverMethod, LinearSolverSpec, MaterialSpec, SolveRequest, Stage,
};
use crate::result::{GlobalStep, StageInfo};
use crate::solver::SolveCallbacks;

/// Pivots below this fraction of the matching diagonal entry mark the
/// reduced system as singular.
pub const PIVOT_TOLERANCE: f64 = 1e-10;

/// 2x2 Gauss points in quad node order (-1,-1), (1,-1), (1,1), (-1,1).
/// All weights are 1.
pub fn gauss_points() -> [(f64, f64); 4] {
    let g = 1.0 / 3f64.sqrt();
    [(-g, -g), (g, -g), (g, g), (-g, g)]
}

fn degenerate(cell_type: CellType) -> SolveError {
    SolveError::SolverRuntime(format!("Degenerate {cell_type} element (zero area)"))
}

/// Signed area of a triangle (positive when counter-clockwise).
pub fn tri_area(xy: &[[f64; 2]; 3]) -> f64 {
    let [v0, v1, v2] = xy;
    0.5 * (v0[0] * (v1[1] - v2[1]) + v1[0] * (v2[1] - v0[1]) + v2[0] * (v0[1] - v1[1]))
}

/// Shape function gradients of a linear triangle, as rows `dN/dx` and
/// `dN/dy`, plus the absolute element area.
pub fn tri_gradients(xy: &[[f64; 2]; 3]) -> Result<(SMatrix<f64, 2, 3>, f64)> {
    let area = tri_area(xy);
    if area.abs() <= f64::EPSILON * scale_sq(xy) {
        return Err(degenerate(CellType::Tri3));
    }
    let [v0, v1, v2] = xy;

    let beta_1 = v1[1] - v2[1];
    let beta_2 = v2[1] - v0[1];
    let beta_3 = v0[1] - v1[1];

    let gamma_1 = v2[0] - v1[0];
    let gamma_2 = v0[0] - v2[0];
    let gamma_3 = v1[0] - v0[0];

    let grads: SMatrix<f64, 2, 3> = matrix![
        beta_1, beta_2, beta_3;
        gamma_1, gamma_2, gamma_3;
    ] / (2.0 * area);

    Ok((grads, area.abs()))
}

fn scale_sq<const N: usize>(xy: &[[f64; 2]; N]) -> f64 {
    let mut span = 0.0f64;
    for a in xy {
        for b in xy {
            span = span.max((a[0] - b[0]).abs()).max((a[1] - b[1]).abs());
        }
    }
    span * span
}

/// Constant strain-displacement matrix of a linear triangle, plus its area.
pub fn tri_strain_displacement(xy: &[[f64; 2]; 3]) -> Result<(SMatrix<f64, 3, 6>, f64)> {
    let (g, area) = tri_gradients(xy)?;
    let b = matrix![
        g[(0, 0)], 0., g[(0, 1)], 0., g[(0, 2)], 0.;
        0., g[(1, 0)], 0., g[(1, 1)], 0., g[(1, 2)];
        g[(1, 0)], g[(0, 0)], g[(1, 1)], g[(0, 1)], g[(1, 2)], g[(0, 2)];
    ];
    Ok((b, area))
}

/// Bilinear shape functions at `(xi, eta)`.
pub fn quad_shape(xi: f64, eta: f64) -> SVector<f64, 4> {
    SVector::<f64, 4>::new(
        (1.0 - xi) * (1.0 - eta),
        (1.0 + xi) * (1.0 - eta),
        (1.0 + xi) * (1.0 + eta),
        (1.0 - xi) * (1.0 + eta),
    ) * 0.25
}

/// Physical shape function gradients of a bilinear quad at `(xi, eta)` and
/// the absolute Jacobian determinant there.
pub fn quad_gradients(xy: &[[f64; 2]; 4], xi: f64, eta: f64) -> Result<(SMatrix<f64, 2, 4>, f64)> {
    let local: SMatrix<f64, 2, 4> = matrix![
        -(1.0 - eta), 1.0 - eta, 1.0 + eta, -(1.0 + eta);
        -(1.0 - xi), -(1.0 + xi), 1.0 + xi, 1.0 - xi;
    ] * 0.25;
    let coords = SMatrix::<f64, 4, 2>::from_fn(|i, j| xy[i][j]);
    let jacobian: SMatrix<f64, 2, 2> = local * coords;

    let det = jacobian.determinant();
    if det.abs() <= f64::EPSILON * scale_sq(xy) {
        return Err(degenerate(CellType::Quad4));
    }
    let inverse = jacobian.try_inverse().ok_or_else(|| degenerate(CellType::Quad4))?;
    Ok((inverse * local, det.abs()))
}

/// Strain-displacement matrix from the gradients of a bilinear quad.
pub fn quad_strain_displacement(grads: &SMatrix<f64, 2, 4>) -> SMatrix<f64, 3, 8> {
    let mut b = SMatrix::<f64, 3, 8>::zeros();
    for i in 0..4 {
        let (dx, dy) = (grads[(0, i)], grads[(1, i)]);
        b[(0, 2 * i)] = dx;
        b[(1, 2 * i + 1)] = dy;
        b[(2, 2 * i)] = dy;
        b[(2, 2 * i + 1)] = dx;
    }
    b
}

/// Isotropic constitutive matrix relating `[εx, εy, γxy]` to `[σx, σy, τxy]`.
pub fn constitutive_matrix(mode: AnalysisMode, youngs_modulus: f64, poisson_ratio: f64) -> Result<Matrix3<f64>> {
    let nu = poisson_ratio;
    match mode {
        AnalysisMode::PlaneStress => {
            let d: Matrix3<f64> = matrix![
                1.0, nu, 0.0;
                nu, 1.0, 0.0;
                0.0, 0.0, (1.0 - nu) / 2.0;
            ];
            Ok(d * (youngs_modulus / (1.0 - nu.powi(2))))
        }
        AnalysisMode::PlaneStrain => {
            let d: Matrix3<f64> = matrix![
                1.0 - nu, nu, 0.0;
                nu, 1.0 - nu, 0.0;
                0.0, 0.0, (1.0 - 2.0 * nu) / 2.0;
            ];
            Ok(d * (youngs_modulus / ((1.0 + nu) * (1.0 - 2.0 * nu))))
        }
        AnalysisMode::Axisymmetric => Err(SolveError::SolverRuntime(
            "axisymmetric mode is not supported by the reference solvers".to_owned(),
        )),
    }
}

/// Von Mises stress of a plane stress state `[σx, σy, τxy]`.
pub fn von_mises(stress: &Vector3<f64>) -> f64 {
    let (sx, sy, sxy) = (stress[0], stress[1], stress[2]);
    (sx * sx - sx * sy + sy * sy + 3.0 * sxy * sxy).max(0.0).sqrt()
}

/// Coordinates of the nodes of one cell.
pub fn cell_coords<const N: usize>(mesh: &Mesh, nodes: &[usize]) -> [[f64; 2]; N] {
    let points = mesh.points();
    std::array::from_fn(|i| points[nodes[i]])
}

pub fn edge_length(mesh: &Mesh, edge: [usize; 2]) -> f64 {
    let points = mesh.points();
    let (a, b) = (points[edge[0]], points[edge[1]]);
    ((b[0] - a[0]).powi(2) + (b[1] - a[1]).powi(2)).sqrt()
}

/// Nodes targeted by a condition on `set` (node set, else edge endpoints).
pub fn set_nodes(mesh: &Mesh, set: &str) -> Result<Vec<usize>> {
    mesh.nodes_of_set(set).ok_or_else(|| {
        SolveError::SolverRuntime(format!("Missing set: node_set__{set} (or edge_set__{set})"))
    })
}

/// Edges of a boundary load on `set`, which must be an edge set.
pub fn set_edges<'m>(mesh: &'m Mesh, set: Option<&str>, kind: &str) -> Result<&'m [[usize; 2]]> {
    let set = set.ok_or_else(|| SolveError::SolverRuntime(format!("{kind} load requires a set")))?;
    mesh.edges_of_set(set)
        .ok_or_else(|| SolveError::SolverRuntime(format!("Missing edge set for {kind} load: edge_set__{set}")))
}

/// Global dofs of a cell with `dofs_per_node` unknowns per node.
pub fn cell_dofs(nodes: &[usize], dofs_per_node: usize) -> Vec<usize> {
    nodes
        .iter()
        .flat_map(|&n| (0..dofs_per_node).map(move |d| n * dofs_per_node + d))
        .collect()
}

/// Scatter-add assembly of element matrices into a sparse global matrix.
pub struct Assembler {
    coo: CooMatrix<f64>,
}

impl Assembler {
    pub fn new(ndof: usize) -> Assembler {
        Assembler {
            coo: CooMatrix::new(ndof, ndof),
        }
    }

    pub fn add<R: Dim, C: Dim, S: RawStorage<f64, R, C>>(
        &mut self,
        dofs: &[usize],
        element: &Matrix<f64, R, C, S>,
    ) {
        for (a, &row) in dofs.iter().enumerate() {
            for (b, &col) in dofs.iter().enumerate() {
                let value = element[(a, b)];
                if value != 0.0 {
                    self.coo.push(row, col, value);
                }
            }
        }
    }

    /// Compressed matrix with duplicate entries summed.
    pub fn finish(self) -> CscMatrix<f64> {
        CscMatrix::from(&self.coo)
    }
}

/// Factorized (or CG-ready) free-dof block for one set of constrained dofs.
struct ReducedSystem {
    fixed: Vec<usize>,
    free_index: Vec<Option<usize>>,
    free_dofs: Vec<usize>,
    matrix: CscMatrix<f64>,
    factor: Option<CscCholesky<f64>>,
}

/// A symmetric global system solved repeatedly under Dirichlet constraints.
///
/// The reduced matrix and its factorization are reused while the set of
/// constrained dofs stays the same.
pub struct LinearSystem {
    stiffness: CscMatrix<f64>,
    spec: LinearSolverSpec,
    reduced: Option<ReducedSystem>,
}

impl LinearSystem {
    pub fn new(stiffness: CscMatrix<f64>, spec: LinearSolverSpec) -> LinearSystem {
        LinearSystem {
            stiffness,
            spec,
            reduced: None,
        }
    }

    pub fn ndof(&self) -> usize {
        self.stiffness.nrows()
    }

    /// Solves `K u = f` with `u[dof] = value` for every constrained dof.
    ///
    /// Constrained dofs are eliminated: the free block `K_ff` is solved with
    /// `f_f - K_fc u_c` on the right-hand side.
    pub fn solve(&mut self, load: &DVector<f64>, constraints: &BTreeMap<usize, f64>) -> Result<DVector<f64>> {
        let ndof = self.ndof();
        if load.len() != ndof {
            return Err(SolveError::SolverRuntime(format!(
                "load vector has {} entries, system has {ndof} dofs",
                load.len()
            )));
        }
        if let Some((&dof, _)) = constraints.range(ndof..).next() {
            return Err(SolveError::SolverRuntime(format!("constrained dof {dof} is out of range")));
        }

        let fixed: Vec<usize> = constraints.keys().copied().collect();
        if self.reduced.as_ref().map(|r| r.fixed != fixed).unwrap_or(true) {
            self.reduced = Some(self.reduce(fixed)?);
        }
        let reduced = match self.reduced.as_ref() {
            Some(reduced) => reduced,
            None => return Err(SolveError::SolverRuntime("reduced system unavailable".to_owned())),
        };

        let mut solution = DVector::<f64>::zeros(ndof);
        for (&dof, &value) in constraints {
            solution[dof] = value;
        }
        if reduced.free_dofs.is_empty() {
            return Ok(solution);
        }

        let mut rhs: Vec<f64> = reduced.free_dofs.iter().map(|&dof| load[dof]).collect();
        for (row, col, value) in self.stiffness.triplet_iter() {
            if let (Some(fi), Some(prescribed)) = (reduced.free_index[row], constraints.get(&col)) {
                rhs[fi] -= value * prescribed;
            }
        }

        let free_solution = match &reduced.factor {
            Some(factor) => {
                let b = DMatrix::from_column_slice(rhs.len(), 1, &rhs);
                factor.solve(&b).column(0).iter().copied().collect::<Vec<f64>>()
            }
            None => run_conjugate_gradient(&reduced.matrix, &rhs, &self.spec)?,
        };

        if free_solution.iter().any(|v| !v.is_finite()) {
            return Err(singular("solution contains non-finite values"));
        }
        for (&dof, value) in reduced.free_dofs.iter().zip(free_solution) {
            solution[dof] = value;
        }
        Ok(solution)
    }

    fn reduce(&self, fixed: Vec<usize>) -> Result<ReducedSystem> {
        let ndof = self.ndof();
        let mut free_index = vec![None; ndof];
        let mut free_dofs = Vec::with_capacity(ndof - fixed.len());
        let mut fixed_iter = fixed.iter().peekable();
        for dof in 0..ndof {
            if fixed_iter.peek() == Some(&&dof) {
                fixed_iter.next();
                continue;
            }
            free_index[dof] = Some(free_dofs.len());
            free_dofs.push(dof);
        }

        let nfree = free_dofs.len();
        let mut coo = CooMatrix::new(nfree, nfree);
        let mut diagonal = vec![0.0; nfree];
        for (row, col, &value) in self.stiffness.triplet_iter() {
            if let (Some(i), Some(j)) = (free_index[row], free_index[col]) {
                coo.push(i, j, value);
                if i == j {
                    diagonal[i] += value;
                }
            }
        }
        let matrix = CscMatrix::from(&coo);

        if let Some(dof) = diagonal.iter().position(|&d| d <= 0.0) {
            return Err(singular(&format!(
                "free dof {} has no stiffness (unconnected node?)",
                free_dofs[dof]
            )));
        }

        let factor = match self.spec.method {
            LinearSolverMethod::Direct if nfree > 0 => Some(factor_checked(&matrix, &diagonal, &free_dofs)?),
            _ => None,
        };

        log::debug!(
            "reduced system: {nfree} free dofs, {} constrained, {} non-zeros",
            fixed.len(),
            matrix.nnz()
        );

        Ok(ReducedSystem {
            fixed,
            free_index,
            free_dofs,
            matrix,
            factor,
        })
    }
}

fn singular(detail: &str) -> SolveError {
    SolveError::Singular(format!(
        "global system is singular or ill-conditioned (under-constrained rigid-body modes?): {detail}"
    ))
}

/// Sparse Cholesky factorization with a relative pivot check.
fn factor_checked(matrix: &CscMatrix<f64>, diagonal: &[f64], free_dofs: &[usize]) -> Result<CscCholesky<f64>> {
    let factor = CscCholesky::factor(matrix).map_err(|err| singular(&format!("{err:?}")))?;

    let l = factor.l();
    for (j, &d) in diagonal.iter().enumerate() {
        let col = l.col(j);
        let pivot = col
            .row_indices()
            .iter()
            .position(|&r| r == j)
            .map(|p| col.values()[p])
            .unwrap_or(0.0);
        if !pivot.is_finite() || pivot * pivot <= PIVOT_TOLERANCE * d {
            return Err(singular(&format!("vanishing pivot at dof {}", free_dofs[j])));
        }
    }
    Ok(factor)
}

/// Runs multiplication for the conjugate gradient solver
struct ConjugateGradientOperator<'a> {
    a: &'a CscMatrix<f64>,
}

impl<'a> Operator for ConjugateGradientOperator<'a> {
    type Param = Vec<f64>;
    type Output = Vec<f64>;

    fn apply(&self, x: &Self::Param) -> std::result::Result<Self::Output, Error> {
        Ok(spmv(self.a, x))
    }
}

fn spmv(a: &CscMatrix<f64>, x: &[f64]) -> Vec<f64> {
    let mut y = vec![0.0; a.nrows()];
    for (row, col, value) in a.triplet_iter() {
        y[row] += value * x[col];
    }
    y
}

/// Logs conjugate gradient progress
struct ConjugateGradientObserver {
    every: u64,
}

impl<I> Observe<I> for ConjugateGradientObserver
where
    I: State<Float = f64>,
{
    fn observe_init(&mut self, name: &str, _state: &I, _kv: &KV) -> std::result::Result<(), Error> {
        log::trace!("starting {name}");
        Ok(())
    }

    fn observe_iter(&mut self, state: &I, _kv: &KV) -> std::result::Result<(), Error> {
        let iter = state.get_iter();
        if iter % self.every == 0 {
            log::trace!("cg iteration {iter}: residual {:.3e}", state.get_cost());
        }
        Ok(())
    }
}

/// Approximates `x` in `Ax = b` for a symmetric positive definite `a` with
/// the conjugate gradient method.
///
/// Each pass solves for the correction of the current residual, normalized to
/// unit length; passes repeat until the relative residual meets
/// `spec.tolerance`.
fn run_conjugate_gradient(a: &CscMatrix<f64>, b: &[f64], spec: &LinearSolverSpec) -> Result<Vec<f64>> {
    const MAX_PASSES: usize = 4;

    let b_norm = norm(b);
    if b_norm == 0.0 {
        return Ok(vec![0.0; b.len()]);
    }

    let mut x = vec![0.0; b.len()];
    let mut relative = 1.0;
    let mut iterations = 0;
    for _ in 0..MAX_PASSES {
        let residual: Vec<f64> = spmv(a, &x).iter().zip(b).map(|(ax, bi)| bi - ax).collect();
        relative = norm(&residual) / b_norm;
        if !relative.is_finite() {
            return Err(singular("conjugate gradient diverged"));
        }
        if relative <= spec.tolerance {
            break;
        }

        let scale = relative * b_norm;
        let rhs: Vec<f64> = residual.iter().map(|r| r / scale).collect();
        let (correction, used) = conjugate_gradient_pass(a, rhs, spec)?;
        iterations += used;
        for (xi, di) in x.iter_mut().zip(correction) {
            *xi += di * scale;
        }
    }

    let residual: Vec<f64> = spmv(a, &x).iter().zip(b).map(|(ax, bi)| bi - ax).collect();
    let final_relative = norm(&residual) / b_norm;
    if !final_relative.is_finite() {
        return Err(singular("conjugate gradient diverged"));
    }
    if final_relative > spec.tolerance * 1e2 {
        return Err(SolveError::SolverRuntime(format!(
            "Conjugate gradient did not converge in {iterations} iterations \
             (relative residual {final_relative:.3e}, previous pass {relative:.3e}); \
             the system may be singular"
        )));
    }
    log::debug!("cg converged in {iterations} iterations (relative residual {final_relative:.3e})");
    Ok(x)
}

fn norm(v: &[f64]) -> f64 {
    v.iter().map(|x| x * x).sum::<f64>().sqrt()
}

fn conjugate_gradient_pass(a: &CscMatrix<f64>, b: Vec<f64>, spec: &LinearSolverSpec) -> Result<(Vec<f64>, u64)> {
    let initial_guess = vec![0.0; b.len()];
    let solver: ConjugateGradient<Vec<f64>, f64> = ConjugateGradient::new(b);
    let operator = ConjugateGradientOperator { a };

    let res = Executor::new(operator, solver)
        .configure(|state| {
            state
                .param(initial_guess)
                .max_iters(spec.max_iterations)
                .target_cost(spec.tolerance)
        })
        .add_observer(ConjugateGradientObserver { every: 100 }, ObserverMode::Always)
        .run()
        .map_err(|err| SolveError::SolverRuntime(format!("Conjugate gradient error: {err}")))?;

    let state = res.state();
    let x = state
        .get_best_param()
        .or_else(|| state.get_param())
        .cloned()
        .ok_or_else(|| SolveError::SolverRuntime("Conjugate gradient produced no solution".to_owned()))?;
    Ok((x, state.get_iter()))
}

/// Material of every cell, resolved from the request's assignments.
#[derive(Debug, Clone)]
pub struct MaterialMap<M> {
    materials: Vec<M>,
    per_block: BTreeMap<CellType, Vec<usize>>,
}

/// One cell together with its resolved material.
pub struct AssignedCell<'a, M> {
    pub cell_type: CellType,
    pub local_id: usize,
    pub nodes: &'a [usize],
    pub material: &'a M,
}

impl<M> MaterialMap<M> {
    /// Resolves materials for every cell of `mesh`.
    ///
    /// `parse` turns a material spec into the solver's material type; it is
    /// called once per referenced material id. Unknown material ids, missing
    /// element sets and unassigned cells are errors.
    pub fn resolve(
        request: &SolveRequest,
        mesh: &Mesh,
        mut parse: impl FnMut(&str, &MaterialSpec) -> Result<M>,
    ) -> Result<MaterialMap<M>> {
        let mut materials = Vec::new();
        let mut index: BTreeMap<&str, usize> = BTreeMap::new();
        let mut per_block: BTreeMap<CellType, Vec<Option<usize>>> = mesh
            .blocks()
            .map(|b| (b.cell_type(), vec![None; b.len()]))
            .collect();

        for assignment in &request.assignments {
            let id = assignment.material_id.as_str();
            let slot = match index.get(id) {
                Some(&slot) => slot,
                None => {
                    let spec = request.materials.get(id).ok_or_else(|| {
                        SolveError::SolverRuntime(format!("Unknown material_id: {id}"))
                    })?;
                    materials.push(parse(id, spec)?);
                    index.insert(id, materials.len() - 1);
                    materials.len() - 1
                }
            };

            let ids = mesh
                .element_set(&assignment.element_set, assignment.cell_type)
                .ok_or_else(|| {
                    SolveError::SolverRuntime(format!(
                        "Missing element set for assignment: elem_set__{}__{}",
                        assignment.element_set, assignment.cell_type
                    ))
                })?;
            if let Some(cells) = per_block.get_mut(&assignment.cell_type) {
                for &local in ids {
                    cells[local] = Some(slot);
                }
            }
        }

        let per_block = per_block
            .into_iter()
            .map(|(cell_type, cells)| {
                let assigned = cells.iter().filter(|c| c.is_some()).count();
                if assigned != cells.len() {
                    return Err(SolveError::SolverRuntime(format!(
                        "Unassigned {cell_type} elements ({} of {} have no material)",
                        cells.len() - assigned,
                        cells.len()
                    )));
                }
                Ok((cell_type, cells.into_iter().flatten().collect()))
            })
            .collect::<Result<BTreeMap<_, _>>>()?;

        Ok(MaterialMap {
            materials,
            per_block,
        })
    }

    pub fn materials(&self) -> &[M] {
        &self.materials
    }

    /// Every cell of `mesh` in element-field order.
    pub fn cells<'a>(&'a self, mesh: &'a Mesh) -> impl Iterator<Item = AssignedCell<'a, M>> + 'a {
        mesh.blocks().flat_map(move |block| {
            let slots = self
                .per_block
                .get(&block.cell_type())
                .map(Vec::as_slice)
                .unwrap_or(&[]);
            block
                .cells()
                .zip(slots)
                .enumerate()
                .map(move |(local_id, (nodes, &slot))| AssignedCell {
                    cell_type: block.cell_type(),
                    local_id,
                    nodes,
                    material: &self.materials[slot],
                })
        })
    }
}

/// Reads a required numeric material parameter.
pub fn required_param(id: &str, spec: &MaterialSpec, key: &str) -> Result<f64> {
    spec.number(key)?.ok_or_else(|| {
        SolveError::SolverRuntime(format!("material '{id}' is missing parameter '{key}'"))
    })
}

/// Field names to emit: requested names (global and per stage) that the
/// solver supports; every supported field when none is requested.
pub fn requested_fields(request: &SolveRequest, supported: &[&str]) -> BTreeSet<String> {
    let names: BTreeSet<String> = request
        .output_requests
        .iter()
        .chain(request.stages.iter().flat_map(|s| s.output_requests.iter()))
        .map(|r| r.name.trim())
        .filter(|name| supported.contains(name))
        .map(str::to_owned)
        .collect();
    if names.is_empty() {
        supported.iter().map(|s| (*s).to_owned()).collect()
    } else {
        names
    }
}

/// Output stride of a stage: the smallest positive `every_n` among global
/// and stage requests, 1 when there are none.
pub fn output_every_n(request: &SolveRequest, stage: &Stage) -> u32 {
    request
        .output_requests
        .iter()
        .chain(&stage.output_requests)
        .map(|r| r.every_n)
        .filter(|&n| n >= 1)
        .min()
        .unwrap_or(1)
}

/// Stage steps that produce an output frame: every `every_n`-th step and the
/// last one.
pub fn output_stage_steps(num_steps: usize, every_n: u32) -> Vec<usize> {
    let every_n = every_n.max(1) as usize;
    let num_steps = num_steps.max(1);
    (0..num_steps)
        .filter(|i| i % every_n == 0 || *i == num_steps - 1)
        .collect()
}

/// Ramp factor for loads of stage `index` while solving stage `current`.
pub fn load_factor(index: usize, current: usize, stage_step: usize, num_steps: usize) -> f64 {
    if index < current {
        1.0
    } else {
        (stage_step + 1) as f64 / num_steps.max(1) as f64
    }
}

/// One output frame handed to a solver's step routine.
#[derive(Debug, Clone)]
pub struct Frame<'a> {
    pub stage_index: usize,
    pub stage: &'a Stage,
    pub stage_id: String,
    pub stage_step: usize,
    pub num_steps: usize,
    /// 1-based global step id; the suffix of the frame's array keys.
    pub step_id: usize,
    pub time: f64,
}

impl<'a> Frame<'a> {
    /// Stages whose conditions are active in this frame.
    pub fn active_stages<'r>(&self, request: &'r SolveRequest) -> &'r [Stage] {
        &request.stages[..=self.stage_index]
    }

    pub fn load_factor(&self, stage_index: usize) -> f64 {
        load_factor(stage_index, self.stage_index, self.stage_step, self.num_steps)
    }
}

/// Timeline written into the result metadata.
#[derive(Debug, Clone, Default)]
pub struct Timeline {
    pub stages: Vec<StageInfo>,
    pub global_steps: Vec<GlobalStep>,
}

/// Walks every scheduled output frame of every stage in order, polling for
/// cancellation before each frame and reporting progress after it.
pub fn run_stages(
    request: &SolveRequest,
    solver_name: &str,
    callbacks: &dyn SolveCallbacks,
    mut solve_frame: impl FnMut(&Frame) -> Result<()>,
) -> Result<Timeline> {
    let schedules: Vec<(u32, Vec<usize>)> = request
        .stages
        .iter()
        .map(|stage| {
            let every_n = output_every_n(request, stage);
            (every_n, output_stage_steps(stage.steps(), every_n))
        })
        .collect();
    let total_frames = schedules.iter().map(|(_, s)| s.len()).sum::<usize>().max(1);

    let mut timeline = Timeline::default();
    let mut step_id = 0;
    let mut stage_start = 0.0;

    for (stage_index, (stage, (every_n, steps))) in request.stages.iter().zip(schedules).enumerate() {
        let stage_id = stage.label(stage_index);
        let num_steps = stage.steps();
        let dt = stage.step_dt();
        callbacks.on_log(
            log::Level::Info,
            &format!("{solver_name}: stage '{stage_id}' ({num_steps} steps, output every {every_n})"),
        );

        let mut times = Vec::with_capacity(steps.len());
        for &stage_step in &steps {
            if callbacks.should_cancel() {
                return Err(SolveError::Cancelled(format!(
                    "cancelled before stage '{stage_id}' step {stage_step}"
                )));
            }
            step_id += 1;
            let frame = Frame {
                stage_index,
                stage,
                stage_id: stage_id.clone(),
                stage_step,
                num_steps,
                step_id,
                time: stage_start + (stage_step + 1) as f64 * dt,
            };
            solve_frame(&frame)?;

            times.push(frame.time);
            timeline.global_steps.push(GlobalStep {
                id: step_id,
                stage_id: stage_id.clone(),
                stage_step,
                time: frame.time,
            });
            callbacks.on_progress(
                step_id as f64 / total_frames as f64,
                &format!("{solver_name} solving"),
                &stage_id,
                stage_step,
            );
        }

        stage_start += num_steps as f64 * dt;
        timeline.stages.push(StageInfo {
            id: stage_id,
            num_steps,
            times,
            output_every_n: Some(every_n),
            output_stage_steps: steps,
        });
    }

    Ok(timeline)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::OutputRequest;
    use approx::assert_relative_eq;

    const UNIT_TRI: [[f64; 2]; 3] = [[0.0, 0.0], [1.0, 0.0], [0.0, 1.0]];
    const UNIT_QUAD: [[f64; 2]; 4] = [[0.0, 0.0], [2.0, 0.0], [2.0, 1.0], [0.0, 1.0]];

    #[test]
    fn tri_area_and_gradients() {
        assert_relative_eq!(tri_area(&UNIT_TRI), 0.5);
        let cw = [UNIT_TRI[0], UNIT_TRI[2], UNIT_TRI[1]];
        assert_relative_eq!(tri_area(&cw), -0.5);

        let (g, area) = tri_gradients(&cw).unwrap();
        assert_relative_eq!(area, 0.5);
        // gradients of a partition of unity sum to zero
        assert_relative_eq!(g.column_sum().norm(), 0.0, epsilon = 1e-12);
        assert_relative_eq!(g[(0, 2)], 1.0, epsilon = 1e-12);

        assert!(tri_gradients(&[[0.0, 0.0], [1.0, 1.0], [2.0, 2.0]]).is_err());
    }

    #[test]
    fn tri_strain_of_uniform_stretch() {
        let (b, _) = tri_strain_displacement(&UNIT_TRI).unwrap();
        // u = (0.01 x, 0)
        let u = SVector::<f64, 6>::from_column_slice(&[0.0, 0.0, 0.01, 0.0, 0.0, 0.0]);
        let eps = b * u;
        assert_relative_eq!(eps[0], 0.01, epsilon = 1e-12);
        assert_relative_eq!(eps[1], 0.0, epsilon = 1e-12);
        assert_relative_eq!(eps[2], 0.0, epsilon = 1e-12);
    }

    #[test]
    fn quad_shape_functions_and_jacobian() {
        for (xi, eta) in gauss_points() {
            assert_relative_eq!(quad_shape(xi, eta).sum(), 1.0, epsilon = 1e-12);
            let (g, det) = quad_gradients(&UNIT_QUAD, xi, eta).unwrap();
            assert_relative_eq!(det, 0.5, epsilon = 1e-12);
            assert_relative_eq!(g.column_sum().norm(), 0.0, epsilon = 1e-12);
        }
        let flat = [[0.0, 0.0], [1.0, 0.0], [2.0, 0.0], [3.0, 0.0]];
        assert!(quad_gradients(&flat, 0.0, 0.0).is_err());
    }

    #[test]
    fn constitutive_matrices() {
        let d = constitutive_matrix(AnalysisMode::PlaneStress, 1.0, 0.25).unwrap();
        assert_relative_eq!(d[(0, 0)], 1.0 / (1.0 - 0.0625));
        assert_relative_eq!(d[(2, 2)], 0.375 / (1.0 - 0.0625));

        let d = constitutive_matrix(AnalysisMode::PlaneStrain, 1.0, 0.25).unwrap();
        let c = 1.0 / (1.25 * 0.5);
        assert_relative_eq!(d[(0, 0)], 0.75 * c);
        assert_relative_eq!(d[(0, 1)], 0.25 * c);
        assert_relative_eq!(d[(2, 2)], 0.25 * c);

        assert!(constitutive_matrix(AnalysisMode::Axisymmetric, 1.0, 0.25).is_err());
    }

    #[test]
    fn von_mises_of_simple_states() {
        assert_relative_eq!(von_mises(&Vector3::new(100.0, 0.0, 0.0)), 100.0);
        assert_relative_eq!(von_mises(&Vector3::new(0.0, 0.0, 10.0)), 10.0 * 3f64.sqrt());
        assert_relative_eq!(von_mises(&Vector3::new(-5.0, -5.0, 0.0)), 5.0);
    }

    fn spring_chain(spec: LinearSolverSpec) -> LinearSystem {
        // three unit springs in series: 0 - 1 - 2 - 3
        let mut assembler = Assembler::new(4);
        let k: SMatrix<f64, 2, 2> = matrix![1.0, -1.0; -1.0, 1.0];
        for e in 0..3 {
            assembler.add(&[e, e + 1], &k);
        }
        LinearSystem::new(assembler.finish(), spec)
    }

    #[test]
    fn constrained_solve_direct_and_cg() {
        let load = DVector::from_vec(vec![0.0, 0.0, 0.0, 0.0]);
        let constraints: BTreeMap<usize, f64> = [(0, 0.0), (3, 3.0)].into_iter().collect();

        for method in [LinearSolverMethod::Direct, LinearSolverMethod::Cg] {
            let mut system = spring_chain(LinearSolverSpec {
                method,
                ..LinearSolverSpec::default()
            });
            let u = system.solve(&load, &constraints).unwrap();
            for (i, expected) in [0.0, 1.0, 2.0, 3.0].iter().enumerate() {
                assert_relative_eq!(u[i], *expected, epsilon = 1e-6);
            }
        }
    }

    #[test]
    fn factorization_is_reused_and_loads_apply() {
        let mut system = spring_chain(LinearSolverSpec::default());
        let constraints: BTreeMap<usize, f64> = [(0, 0.0)].into_iter().collect();
        let mut load = DVector::zeros(4);
        load[3] = 1.0;
        let u = system.solve(&load, &constraints).unwrap();
        assert_relative_eq!(u[3], 3.0, epsilon = 1e-9);

        load[3] = 2.0;
        let u = system.solve(&load, &constraints).unwrap();
        assert_relative_eq!(u[3], 6.0, epsilon = 1e-9);
    }

    #[test]
    fn unconstrained_system_is_singular() {
        let mut system = spring_chain(LinearSolverSpec::default());
        let mut load = DVector::zeros(4);
        load[0] = 1.0;
        let err = system.solve(&load, &BTreeMap::new()).unwrap_err();
        assert_eq!(err.code(), "SOLVER_SINGULAR");
    }

    #[test]
    fn output_schedule_keeps_last_step() {
        assert_eq!(output_stage_steps(5, 2), vec![0, 2, 4]);
        assert_eq!(output_stage_steps(6, 4), vec![0, 4, 5]);
        assert_eq!(output_stage_steps(3, 1), vec![0, 1, 2]);
        assert_eq!(output_stage_steps(0, 0), vec![0]);
    }

    #[test]
    fn output_requests_merge_global_and_stage() {
        let mut request: SolveRequest = serde_json::from_str(
            r#"{"schema_version": "0.2", "model": {"dimension": 2, "mode": "plane_strain"},
                "stages": [{"num_steps": 4}]}"#,
        )
        .unwrap();
        assert_eq!(output_every_n(&request, &request.stages[0]), 1);
        assert_eq!(requested_fields(&request, &["u", "vm"]).len(), 2);

        request.output_requests.push(OutputRequest {
            uid: None,
            name: "vm".into(),
            location: None,
            every_n: 3,
        });
        request.stages[0].output_requests.push(OutputRequest {
            uid: None,
            name: "porosity".into(),
            location: None,
            every_n: 2,
        });
        assert_eq!(output_every_n(&request, &request.stages[0]), 2);
        let fields = requested_fields(&request, &["u", "vm"]);
        assert_eq!(fields.into_iter().collect::<Vec<_>>(), vec!["vm".to_owned()]);
    }

    #[test]
    fn load_factors_ramp_current_stage_only() {
        assert_relative_eq!(load_factor(0, 1, 0, 4), 1.0);
        assert_relative_eq!(load_factor(1, 1, 0, 4), 0.25);
        assert_relative_eq!(load_factor(1, 1, 3, 4), 1.0);
    }
}
