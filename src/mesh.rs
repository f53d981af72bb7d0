use std::collections::{BTreeMap, BTreeSet};
use std::fmt::Display;
use std::fs::File;
use std::path::Path;
use std::str::FromStr;

use ndarray::{Array1, Array2, ArrayD, IxDyn, OwnedRepr};
use ndarray_npy::{NpzReader, NpzWriter};
use serde::{Deserialize, Serialize};

use crate::error::{Result, SolveError};

/// Supported cell types. Ordering is significant: element fields list the
/// cells of every block in this order (tri3 first, then quad4).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum CellType {
    #[serde(rename = "tri3")]
    Tri3,
    #[serde(rename = "quad4")]
    Quad4,
}

impl CellType {
    pub const ALL: [CellType; 2] = [CellType::Tri3, CellType::Quad4];

    pub fn nodes_per_cell(self) -> usize {
        match self {
            CellType::Tri3 => 3,
            CellType::Quad4 => 4,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            CellType::Tri3 => "tri3",
            CellType::Quad4 => "quad4",
        }
    }
}

impl Display for CellType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CellType {
    type Err = SolveError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "tri3" => Ok(CellType::Tri3),
            "quad4" => Ok(CellType::Quad4),
            other => Err(SolveError::Contract(format!("Unsupported cell type '{other}'"))),
        }
    }
}

/// Homogeneous connectivity for one cell type. Local ids are row indices.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CellBlock {
    cell_type: CellType,
    connectivity: Vec<usize>,
}

impl CellBlock {
    pub fn cell_type(&self) -> CellType {
        self.cell_type
    }

    pub fn len(&self) -> usize {
        self.connectivity.len() / self.cell_type.nodes_per_cell()
    }

    pub fn is_empty(&self) -> bool {
        self.connectivity.is_empty()
    }

    pub fn cell(&self, local_id: usize) -> &[usize] {
        let npc = self.cell_type.nodes_per_cell();
        &self.connectivity[local_id * npc..(local_id + 1) * npc]
    }

    pub fn cells(&self) -> impl Iterator<Item = &[usize]> {
        self.connectivity.chunks(self.cell_type.nodes_per_cell())
    }

    pub fn connectivity(&self) -> &[usize] {
        &self.connectivity
    }
}

/// Discretized 2D domain: points, cell blocks and named sets.
///
/// Every mutation goes through a validating builder method, so a `Mesh` value
/// always satisfies its index invariants.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Mesh {
    points: Vec<[f64; 2]>,
    blocks: BTreeMap<CellType, CellBlock>,
    node_sets: BTreeMap<String, Vec<usize>>,
    edge_sets: BTreeMap<String, Vec<[usize; 2]>>,
    element_sets: BTreeMap<(String, CellType), Vec<usize>>,
}

fn check_set_name(name: &str) -> Result<()> {
    if name.is_empty() || name.chars().any(char::is_whitespace) {
        return Err(SolveError::Contract(format!("Invalid set name {name:?}")));
    }
    Ok(())
}

impl Mesh {
    pub fn new(points: Vec<[f64; 2]>) -> Mesh {
        Mesh {
            points,
            ..Default::default()
        }
    }

    /// Assembles a mesh whose ids are valid by construction (generated grids).
    pub(crate) fn from_parts(
        points: Vec<[f64; 2]>,
        blocks: Vec<(CellType, Vec<usize>)>,
        node_sets: BTreeMap<String, Vec<usize>>,
        edge_sets: BTreeMap<String, Vec<[usize; 2]>>,
        element_sets: BTreeMap<(String, CellType), Vec<usize>>,
    ) -> Mesh {
        let blocks = blocks
            .into_iter()
            .map(|(cell_type, connectivity)| {
                (
                    cell_type,
                    CellBlock {
                        cell_type,
                        connectivity,
                    },
                )
            })
            .collect();
        Mesh {
            points,
            blocks,
            node_sets,
            edge_sets,
            element_sets,
        }
    }

    pub fn points(&self) -> &[[f64; 2]] {
        &self.points
    }

    pub fn num_points(&self) -> usize {
        self.points.len()
    }

    fn check_node(&self, node: usize, what: &str) -> Result<()> {
        if node >= self.points.len() {
            return Err(SolveError::Contract(format!(
                "{what} references node {node} but mesh has {} points",
                self.points.len()
            )));
        }
        Ok(())
    }

    /// Adds (or replaces) the block for `cell_type` from flat connectivity.
    pub fn add_cells(&mut self, cell_type: CellType, connectivity: Vec<usize>) -> Result<()> {
        let npc = cell_type.nodes_per_cell();
        if connectivity.len() % npc != 0 {
            return Err(SolveError::Contract(format!(
                "cells_{cell_type} length {} is not a multiple of {npc}",
                connectivity.len()
            )));
        }
        for &node in &connectivity {
            self.check_node(node, &format!("cells_{cell_type}"))?;
        }

        self.blocks.insert(
            cell_type,
            CellBlock {
                cell_type,
                connectivity,
            },
        );
        Ok(())
    }

    pub fn add_node_set(&mut self, name: &str, nodes: Vec<usize>) -> Result<()> {
        check_set_name(name)?;
        for &node in &nodes {
            self.check_node(node, &format!("node_set__{name}"))?;
        }
        self.node_sets.insert(name.to_owned(), nodes);
        Ok(())
    }

    pub fn add_edge_set(&mut self, name: &str, edges: Vec<[usize; 2]>) -> Result<()> {
        check_set_name(name)?;
        for edge in &edges {
            self.check_node(edge[0], &format!("edge_set__{name}"))?;
            self.check_node(edge[1], &format!("edge_set__{name}"))?;
        }
        self.edge_sets.insert(name.to_owned(), edges);
        Ok(())
    }

    /// Adds an element set of local ids scoped to the `cell_type` block, which
    /// must already exist.
    pub fn add_element_set(
        &mut self,
        name: &str,
        cell_type: CellType,
        local_ids: Vec<usize>,
    ) -> Result<()> {
        check_set_name(name)?;
        let block_len = match self.blocks.get(&cell_type) {
            Some(block) => block.len(),
            None => {
                return Err(SolveError::Contract(format!(
                    "elem_set__{name}__{cell_type} refers to missing block cells_{cell_type}"
                )))
            }
        };
        if let Some(bad) = local_ids.iter().find(|&&id| id >= block_len) {
            return Err(SolveError::Contract(format!(
                "elem_set__{name}__{cell_type} has local id {bad} but cells_{cell_type} has {block_len} cells"
            )));
        }
        self.element_sets
            .insert((name.to_owned(), cell_type), local_ids);
        Ok(())
    }

    pub fn blocks(&self) -> impl Iterator<Item = &CellBlock> {
        self.blocks.values()
    }

    pub fn block(&self, cell_type: CellType) -> Option<&CellBlock> {
        self.blocks.get(&cell_type)
    }

    pub fn has_cells(&self) -> bool {
        !self.blocks.is_empty()
    }

    /// Total cell count over all blocks (length of element fields).
    pub fn num_cells(&self) -> usize {
        self.blocks.values().map(CellBlock::len).sum()
    }

    /// Offset of the first cell of `cell_type` in element-field ordering.
    pub fn cell_offset(&self, cell_type: CellType) -> usize {
        self.blocks
            .values()
            .take_while(|b| b.cell_type < cell_type)
            .map(CellBlock::len)
            .sum()
    }

    pub fn node_sets(&self) -> &BTreeMap<String, Vec<usize>> {
        &self.node_sets
    }

    pub fn edge_sets(&self) -> &BTreeMap<String, Vec<[usize; 2]>> {
        &self.edge_sets
    }

    pub fn element_sets(&self) -> &BTreeMap<(String, CellType), Vec<usize>> {
        &self.element_sets
    }

    pub fn element_set(&self, name: &str, cell_type: CellType) -> Option<&[usize]> {
        self.element_sets
            .get(&(name.to_owned(), cell_type))
            .map(Vec::as_slice)
    }

    /// Cell types for which an element set called `name` exists.
    pub fn element_set_cell_types(&self, name: &str) -> Vec<CellType> {
        self.element_sets
            .keys()
            .filter(|(set, _)| set == name)
            .map(|(_, ct)| *ct)
            .collect()
    }

    /// Every set name of any kind.
    pub fn set_names(&self) -> BTreeSet<&str> {
        self.node_sets
            .keys()
            .chain(self.edge_sets.keys())
            .map(String::as_str)
            .chain(self.element_sets.keys().map(|(name, _)| name.as_str()))
            .collect()
    }

    pub fn has_set(&self, name: &str) -> bool {
        self.node_sets.contains_key(name)
            || self.edge_sets.contains_key(name)
            || self.element_sets.keys().any(|(set, _)| set == name)
    }

    /// Nodes targeted by a set: the node set of that name if present, else the
    /// sorted unique endpoints of the edge set of that name.
    pub fn nodes_of_set(&self, name: &str) -> Option<Vec<usize>> {
        if let Some(nodes) = self.node_sets.get(name) {
            return Some(nodes.clone());
        }
        self.edge_sets.get(name).map(|edges| {
            edges
                .iter()
                .flat_map(|e| e.iter().copied())
                .collect::<BTreeSet<usize>>()
                .into_iter()
                .collect()
        })
    }

    pub fn edges_of_set(&self, name: &str) -> Option<&[[usize; 2]]> {
        self.edge_sets.get(name).map(Vec::as_slice)
    }

    /// Reads a mesh archive laid out with the contract keys
    /// (`points`, `cells_<type>`, `node_set__*`, `edge_set__*`, `elem_set__*__<type>`).
    pub fn read_npz(path: &Path) -> Result<Mesh> {
        let file = File::open(path).map_err(SolveError::io(format!("opening {}", path.display())))?;
        let mut npz = NpzReader::new(file).map_err(|err| {
            SolveError::Contract(format!("{} is not a valid npz archive: {err}", path.display()))
        })?;
        let raw_names = npz
            .names()
            .map_err(|err| SolveError::Contract(format!("Unable to list {}: {err}", path.display())))?;

        // key -> name inside the archive
        let names: BTreeMap<String, String> = raw_names
            .into_iter()
            .map(|raw| {
                let key = raw.strip_suffix(".npy").unwrap_or(&raw).to_owned();
                (key, raw)
            })
            .collect();

        let points_raw = names
            .get("points")
            .ok_or_else(|| SolveError::Contract("mesh.npz must contain 'points'".to_owned()))?;
        let mut mesh = Mesh::new(read_points(&mut npz, points_raw)?);

        for (key, raw) in &names {
            if let Some(ct) = key.strip_prefix("cells_") {
                let cell_type: CellType = ct.parse()?;
                let (shape, values) = read_index_array(&mut npz, raw)?;
                let npc = cell_type.nodes_per_cell();
                if !(shape.len() == 2 && shape[1] == npc) && !values.is_empty() {
                    return Err(SolveError::Contract(format!(
                        "{key} must have shape (M, {npc}), got {shape:?}"
                    )));
                }
                mesh.add_cells(cell_type, values)?;
            }
        }

        for (key, raw) in &names {
            if key == "points" || key.starts_with("cells_") {
                continue;
            }
            if let Some(name) = key.strip_prefix("node_set__") {
                let (_, nodes) = read_index_array(&mut npz, raw)?;
                mesh.add_node_set(name, nodes)?;
            } else if let Some(name) = key.strip_prefix("edge_set__") {
                let (_, flat) = read_index_array(&mut npz, raw)?;
                if flat.len() % 2 != 0 {
                    return Err(SolveError::Contract(format!(
                        "{key} must contain node pairs"
                    )));
                }
                let edges = flat.chunks(2).map(|pair| [pair[0], pair[1]]).collect();
                mesh.add_edge_set(name, edges)?;
            } else if let Some(rest) = key.strip_prefix("elem_set__") {
                let (name, ct) = rest.rsplit_once("__").ok_or_else(|| {
                    SolveError::Contract(format!("{key} must be named elem_set__<name>__<type>"))
                })?;
                let (_, ids) = read_index_array(&mut npz, raw)?;
                mesh.add_element_set(name, ct.parse()?, ids)?;
            } else {
                return Err(SolveError::Contract(format!("Unknown mesh array '{key}'")));
            }
        }

        log::debug!(
            "loaded mesh {}: {} points, {} cells",
            path.display(),
            mesh.num_points(),
            mesh.num_cells()
        );

        Ok(mesh)
    }

    pub fn write_npz(&self, path: &Path) -> Result<()> {
        let write_err =
            |err: ndarray_npy::WriteNpzError| SolveError::Contract(format!("Failed to write {}: {err}", path.display()));

        let file = File::create(path).map_err(SolveError::io(format!("creating {}", path.display())))?;
        let mut npz = NpzWriter::new_compressed(file);

        let points = Array2::from_shape_fn((self.points.len(), 2), |(i, j)| self.points[i][j]);
        npz.add_array("points", &points).map_err(write_err)?;

        for block in self.blocks.values() {
            let npc = block.cell_type.nodes_per_cell();
            let cells = Array2::from_shape_fn((block.len(), npc), |(i, j)| {
                block.connectivity[i * npc + j] as i64
            });
            npz.add_array(format!("cells_{}", block.cell_type), &cells)
                .map_err(write_err)?;
        }
        for (name, nodes) in &self.node_sets {
            let arr: Array1<i64> = nodes.iter().map(|&n| n as i64).collect();
            npz.add_array(format!("node_set__{name}"), &arr)
                .map_err(write_err)?;
        }
        for (name, edges) in &self.edge_sets {
            let arr = Array2::from_shape_fn((edges.len(), 2), |(i, j)| edges[i][j] as i64);
            npz.add_array(format!("edge_set__{name}"), &arr)
                .map_err(write_err)?;
        }
        for ((name, ct), ids) in &self.element_sets {
            let arr: Array1<i64> = ids.iter().map(|&n| n as i64).collect();
            npz.add_array(format!("elem_set__{name}__{ct}"), &arr)
                .map_err(write_err)?;
        }

        npz.finish().map_err(write_err)?;
        Ok(())
    }
}

fn read_points(npz: &mut NpzReader<File>, raw: &str) -> Result<Vec<[f64; 2]>> {
    let arr: ArrayD<f64> = npz
        .by_name(raw)
        .map_err(|err| SolveError::Contract(format!("mesh 'points' must be float64: {err}")))?;
    let shape = arr.shape().to_vec();

    if arr.is_empty() {
        return Ok(Vec::new());
    }
    if shape.len() != 2 || shape[1] < 2 {
        return Err(SolveError::Contract(format!(
            "mesh 'points' must have shape (N, 2), got {shape:?}"
        )));
    }

    let flat: Vec<f64> = arr.iter().copied().collect();
    Ok(flat.chunks(shape[1]).map(|row| [row[0], row[1]]).collect())
}

/// Reads an integer array (int64, or int32) as a logical-order flat list of
/// non-negative indices plus its shape.
fn read_index_array(npz: &mut NpzReader<File>, raw: &str) -> Result<(Vec<usize>, Vec<usize>)> {
    let (shape, values): (Vec<usize>, Vec<i64>) = match npz.by_name::<OwnedRepr<i64>, IxDyn>(raw) {
        Ok(arr) => (arr.shape().to_vec(), arr.iter().copied().collect()),
        Err(_) => {
            let arr: ArrayD<i32> = npz.by_name(raw).map_err(|err| {
                SolveError::Contract(format!("mesh array '{raw}' must be integer: {err}"))
            })?;
            (arr.shape().to_vec(), arr.iter().map(|&v| v as i64).collect())
        }
    };

    let indices = values
        .into_iter()
        .map(|v| {
            usize::try_from(v).map_err(|_| {
                SolveError::Contract(format!("mesh array '{raw}' contains negative index {v}"))
            })
        })
        .collect::<Result<Vec<usize>>>()?;

    Ok((shape, indices))
}
