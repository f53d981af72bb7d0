use std::collections::{BTreeMap, BTreeSet};
use std::fmt::Display;
use std::fs::File;
use std::path::Path;
use std::str::FromStr;

use ndarray::ArrayD;
use ndarray_npy::{NpzReader, NpzWriter};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Result, SolveError};
use crate::mesh::Mesh;
use crate::request::CONTRACT_VERSION;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Success,
    Failed,
    Canceled,
}

impl RunStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            RunStatus::Success => "success",
            RunStatus::Failed => "failed",
            RunStatus::Canceled => "canceled",
        }
    }
}

impl Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldLocation {
    Node,
    Element,
}

impl FieldLocation {
    pub fn as_str(self) -> &'static str {
        match self {
            FieldLocation::Node => "node",
            FieldLocation::Element => "element",
        }
    }

    /// Prefix used in result array keys.
    pub fn key_prefix(self) -> &'static str {
        match self {
            FieldLocation::Node => "nodal",
            FieldLocation::Element => "elem",
        }
    }

    fn from_key_prefix(prefix: &str) -> Option<FieldLocation> {
        match prefix {
            "nodal" => Some(FieldLocation::Node),
            "elem" => Some(FieldLocation::Element),
            _ => None,
        }
    }

    /// Leading dimension of arrays stored at this location.
    pub fn len_for(self, mesh: &Mesh) -> usize {
        match self {
            FieldLocation::Node => mesh.num_points(),
            FieldLocation::Element => mesh.num_cells(),
        }
    }
}

impl FromStr for FieldLocation {
    type Err = SolveError;

    /// Accepts the descriptor names (`node`, `element`) and the key
    /// prefixes (`nodal`, `elem`).
    fn from_str(s: &str) -> Result<Self> {
        match s {
            "node" | "nodal" => Ok(FieldLocation::Node),
            "element" | "elem" => Ok(FieldLocation::Element),
            other => Err(SolveError::Contract(format!("Unknown field location '{other}'"))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldShape {
    Scalar,
    Vector2,
    Tensor,
}

impl FieldShape {
    /// Trailing dimensions of one array of this shape.
    pub fn trailing_dims(self) -> &'static [usize] {
        match self {
            FieldShape::Scalar => &[],
            FieldShape::Vector2 => &[2],
            FieldShape::Tensor => &[3],
        }
    }
}

/// One entry of the result registry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldDescriptor {
    pub name: String,
    pub location: FieldLocation,
    pub shape: FieldShape,
    pub unit: String,
    pub npz_pattern: String,
}

impl FieldDescriptor {
    pub fn new(
        name: &str,
        location: FieldLocation,
        shape: FieldShape,
        unit: impl Into<String>,
    ) -> FieldDescriptor {
        FieldDescriptor {
            name: name.to_owned(),
            location,
            shape,
            unit: unit.into(),
            npz_pattern: format!("{}__{name}__step{{step:06d}}", location.key_prefix()),
        }
    }

    pub fn key(&self, step: usize) -> ArrayKey {
        ArrayKey::new(self.location, &self.name, step)
    }

    /// Expected array shape for this field on `mesh`.
    pub fn expected_shape(&self, mesh: &Mesh) -> Vec<usize> {
        let mut shape = vec![self.location.len_for(mesh)];
        shape.extend_from_slice(self.shape.trailing_dims());
        shape
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageInfo {
    pub id: String,
    pub num_steps: usize,
    pub times: Vec<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_every_n: Option<u32>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub output_stage_steps: Vec<usize>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GlobalStep {
    pub id: usize,
    pub stage_id: String,
    pub stage_step: usize,
    pub time: f64,
}

/// Result metadata, stored as `out/result.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SolveResult {
    pub schema_version: String,
    pub status: RunStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub solver_info: Option<Value>,
    #[serde(default)]
    pub registry: Vec<FieldDescriptor>,
    #[serde(default)]
    pub stages: Vec<StageInfo>,
    #[serde(default)]
    pub global_steps: Vec<GlobalStep>,
    #[serde(default)]
    pub warnings: Vec<String>,
    #[serde(default)]
    pub errors: Vec<String>,
}

impl SolveResult {
    pub fn success(registry: Vec<FieldDescriptor>) -> SolveResult {
        SolveResult {
            schema_version: CONTRACT_VERSION.to_owned(),
            status: RunStatus::Success,
            solver_info: None,
            registry,
            stages: Vec::new(),
            global_steps: Vec::new(),
            warnings: Vec::new(),
            errors: Vec::new(),
        }
    }

    pub fn field(&self, location: FieldLocation, name: &str) -> Option<&FieldDescriptor> {
        self.registry
            .iter()
            .find(|d| d.location == location && d.name == name)
    }

    /// Step ids the arrays are expected for. Falls back to the steps present
    /// in `arrays` when the metadata lists no global steps.
    pub fn step_ids(&self, arrays: &ResultArrays) -> Vec<usize> {
        if self.global_steps.is_empty() {
            arrays.steps().into_iter().collect()
        } else {
            self.global_steps.iter().map(|s| s.id).collect()
        }
    }

    /// Checks that every registry × step key exists with a consistent shape.
    pub fn check_arrays(&self, arrays: &ResultArrays, mesh: &Mesh) -> Result<()> {
        let steps = self.step_ids(arrays);
        for descriptor in &self.registry {
            let expected = descriptor.expected_shape(mesh);
            for &step in &steps {
                let key = descriptor.key(step);
                let array = arrays.get(&key).ok_or_else(|| {
                    SolveError::SolverRuntime(format!("Result array '{key}' is missing"))
                })?;
                if array.shape() != expected.as_slice() {
                    return Err(SolveError::SolverRuntime(format!(
                        "Result array '{key}' has shape {:?}, expected {expected:?}",
                        array.shape()
                    )));
                }
            }
        }
        Ok(())
    }

    pub fn from_json_str(text: &str) -> Result<SolveResult> {
        let text = text.strip_prefix('\u{feff}').unwrap_or(text);
        serde_json::from_str(text)
            .map_err(|err| SolveError::Contract(format!("result.json is malformed: {err}")))
    }

    pub fn to_json_string(&self) -> Result<String> {
        serde_json::to_string_pretty(self)
            .map_err(|err| SolveError::Contract(format!("Unable to serialize result: {err}")))
    }
}

/// Typed form of a result array key such as `nodal__u__step000003`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ArrayKey {
    pub location: FieldLocation,
    pub name: String,
    pub step: usize,
}

impl ArrayKey {
    pub fn new(location: FieldLocation, name: &str, step: usize) -> ArrayKey {
        ArrayKey {
            location,
            name: name.to_owned(),
            step,
        }
    }
}

impl Display for ArrayKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}__{}__step{:06}",
            self.location.key_prefix(),
            self.name,
            self.step
        )
    }
}

impl FromStr for ArrayKey {
    type Err = SolveError;

    fn from_str(s: &str) -> Result<Self> {
        let bad = || SolveError::Contract(format!("Invalid result array key '{s}'"));
        let (prefix, rest) = s.split_once("__").ok_or_else(bad)?;
        let location = FieldLocation::from_key_prefix(prefix).ok_or_else(bad)?;
        let (name, step) = rest.rsplit_once("__step").ok_or_else(bad)?;
        if name.is_empty() || step.is_empty() || !step.bytes().all(|b| b.is_ascii_digit()) {
            return Err(bad());
        }
        let step = step.parse().map_err(|_| bad())?;
        Ok(ArrayKey::new(location, name, step))
    }
}

/// Indexed result array store. Arrays are write-once.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResultArrays {
    arrays: BTreeMap<ArrayKey, ArrayD<f64>>,
}

impl ResultArrays {
    pub fn new() -> ResultArrays {
        ResultArrays::default()
    }

    pub fn insert(&mut self, key: ArrayKey, array: ArrayD<f64>) -> Result<()> {
        if self.arrays.contains_key(&key) {
            return Err(SolveError::SolverRuntime(format!(
                "Result array '{key}' was already written"
            )));
        }
        self.arrays.insert(key, array);
        Ok(())
    }

    pub fn get(&self, key: &ArrayKey) -> Option<&ArrayD<f64>> {
        self.arrays.get(key)
    }

    pub fn field(&self, location: FieldLocation, name: &str, step: usize) -> Option<&ArrayD<f64>> {
        self.arrays.get(&ArrayKey::new(location, name, step))
    }

    pub fn len(&self) -> usize {
        self.arrays.len()
    }

    pub fn is_empty(&self) -> bool {
        self.arrays.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&ArrayKey, &ArrayD<f64>)> {
        self.arrays.iter()
    }

    pub fn steps(&self) -> BTreeSet<usize> {
        self.arrays.keys().map(|k| k.step).collect()
    }

    /// Distinct (location, name) pairs present in the store.
    pub fn fields(&self) -> BTreeSet<(FieldLocation, String)> {
        self.arrays
            .keys()
            .map(|k| (k.location, k.name.clone()))
            .collect()
    }

    /// Steps available for one field.
    pub fn field_steps(&self, location: FieldLocation, name: &str) -> BTreeSet<usize> {
        self.arrays
            .keys()
            .filter(|k| k.location == location && k.name == name)
            .map(|k| k.step)
            .collect()
    }

    pub fn read_npz(path: &Path) -> Result<ResultArrays> {
        let file = File::open(path).map_err(SolveError::io(format!("opening {}", path.display())))?;
        let mut npz = NpzReader::new(file).map_err(|err| {
            SolveError::Contract(format!("{} is not a valid npz archive: {err}", path.display()))
        })?;
        let names = npz
            .names()
            .map_err(|err| SolveError::Contract(format!("Unable to list {}: {err}", path.display())))?;

        let mut arrays = ResultArrays::new();
        for raw in names {
            let key: ArrayKey = raw.strip_suffix(".npy").unwrap_or(&raw).parse()?;
            let array: ArrayD<f64> = npz.by_name(&raw).map_err(|err| {
                SolveError::Contract(format!("Result array '{key}' must be float64: {err}"))
            })?;
            arrays.insert(key, array).map_err(|_| {
                SolveError::Contract(format!("{} has duplicate array names", path.display()))
            })?;
        }
        Ok(arrays)
    }

    /// Writes every array under its formatted key. Output is deterministic:
    /// keys are written in sorted order with fixed archive timestamps.
    pub fn write_npz(&self, path: &Path) -> Result<()> {
        let write_err = |err: ndarray_npy::WriteNpzError| {
            SolveError::Contract(format!("Failed to write {}: {err}", path.display()))
        };
        let file = File::create(path).map_err(SolveError::io(format!("creating {}", path.display())))?;
        let mut npz = NpzWriter::new_compressed(file);

        let sorted: BTreeMap<String, &ArrayD<f64>> =
            self.arrays.iter().map(|(k, a)| (k.to_string(), a)).collect();
        for (key, array) in sorted {
            npz.add_array(key, array).map_err(write_err)?;
        }
        npz.finish().map_err(write_err)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mesh::CellType;
    use crate::testutil::TempDirGuard;
    use ndarray::{arr1, Array2};

    fn tiny_mesh() -> Mesh {
        let mut mesh = Mesh::new(vec![[0.0, 0.0], [1.0, 0.0], [0.0, 1.0]]);
        mesh.add_cells(CellType::Tri3, vec![0, 1, 2]).unwrap();
        mesh
    }

    #[test]
    fn array_keys_format_and_parse() {
        let key = ArrayKey::new(FieldLocation::Node, "u", 3);
        assert_eq!(key.to_string(), "nodal__u__step000003");
        assert_eq!("elem__vm__step000010".parse::<ArrayKey>().unwrap().step, 10);
        assert_eq!(
            "elem__pore__water__step000002".parse::<ArrayKey>().unwrap().name,
            "pore__water"
        );
        assert!("points".parse::<ArrayKey>().is_err());
        assert!("cell__u__step000001".parse::<ArrayKey>().is_err());
        assert!("nodal__u__stepxx".parse::<ArrayKey>().is_err());
    }

    #[test]
    fn descriptor_pattern_matches_key() {
        let d = FieldDescriptor::new("vm", FieldLocation::Element, FieldShape::Scalar, "Pa");
        assert_eq!(d.npz_pattern, "elem__vm__step{step:06d}");
        assert_eq!(d.key(7).to_string(), "elem__vm__step000007");
    }

    #[test]
    fn arrays_are_write_once() {
        let mut arrays = ResultArrays::new();
        let key = ArrayKey::new(FieldLocation::Node, "p", 1);
        arrays.insert(key.clone(), arr1(&[1.0, 2.0, 3.0]).into_dyn()).unwrap();
        assert!(arrays.insert(key, arr1(&[0.0; 3]).into_dyn()).is_err());
    }

    #[test]
    fn check_arrays_reports_missing_and_misshapen() {
        let mesh = tiny_mesh();
        let mut meta = SolveResult::success(vec![
            FieldDescriptor::new("u", FieldLocation::Node, FieldShape::Vector2, "m"),
            FieldDescriptor::new("vm", FieldLocation::Element, FieldShape::Scalar, "Pa"),
        ]);
        meta.global_steps.push(GlobalStep {
            id: 1,
            stage_id: "S1".into(),
            stage_step: 0,
            time: 1.0,
        });

        let mut arrays = ResultArrays::new();
        arrays
            .insert(ArrayKey::new(FieldLocation::Node, "u", 1), Array2::zeros((3, 2)).into_dyn())
            .unwrap();
        assert!(meta.check_arrays(&arrays, &mesh).is_err());

        let mut bad = arrays.clone();
        bad.insert(ArrayKey::new(FieldLocation::Element, "vm", 1), arr1(&[0.0, 1.0]).into_dyn())
            .unwrap();
        assert!(meta.check_arrays(&bad, &mesh).is_err());

        arrays
            .insert(ArrayKey::new(FieldLocation::Element, "vm", 1), arr1(&[0.5]).into_dyn())
            .unwrap();
        meta.check_arrays(&arrays, &mesh).unwrap();
    }

    #[test]
    fn npz_round_trip_keeps_keys() {
        let tmp = TempDirGuard::new("result-npz");
        let path = tmp.path().join("result.npz");

        let mut arrays = ResultArrays::new();
        arrays
            .insert(ArrayKey::new(FieldLocation::Node, "p", 2), arr1(&[1.5, -2.0]).into_dyn())
            .unwrap();
        arrays
            .insert(ArrayKey::new(FieldLocation::Node, "p", 1), arr1(&[0.1, 0.2]).into_dyn())
            .unwrap();
        arrays.write_npz(&path).unwrap();

        let back = ResultArrays::read_npz(&path).unwrap();
        assert_eq!(back, arrays);
        assert_eq!(back.steps().into_iter().collect::<Vec<_>>(), vec![1, 2]);

        let first = std::fs::read(&path).unwrap();
        arrays.write_npz(&path).unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), first);
    }

    #[test]
    fn result_json_round_trip() {
        let mut meta = SolveResult::success(vec![FieldDescriptor::new(
            "p",
            FieldLocation::Node,
            FieldShape::Scalar,
            "kPa",
        )]);
        meta.stages.push(StageInfo {
            id: "S1".into(),
            num_steps: 2,
            times: vec![1.0, 2.0],
            output_every_n: Some(1),
            output_stage_steps: vec![0, 1],
        });
        let text = meta.to_json_string().unwrap();
        assert!(text.contains("\"status\": \"success\""));
        assert!(text.contains("nodal__p__step{step:06d}"));
        assert_eq!(SolveResult::from_json_str(&text).unwrap(), meta);
    }
}
