//! Numeric comparison of two result sets and per-step field curves.

use std::collections::BTreeSet;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;
use std::str::FromStr;

use ndarray::ArrayD;
use serde::{Deserialize, Serialize};

use crate::case_folder::{self, OUT_DIR, RESULT_JSON};
use crate::error::{Result, SolveError};
use crate::result::{FieldLocation, ResultArrays, SolveResult};

/// A field identified by location and name, written `node:u` on the CLI.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct FieldKey {
    pub location: FieldLocation,
    pub name: String,
}

impl FromStr for FieldKey {
    type Err = SolveError;

    fn from_str(s: &str) -> Result<FieldKey> {
        let (location, name) = s.split_once(':').ok_or_else(|| {
            SolveError::Contract(format!("Expected <location>:<name>, got '{s}'"))
        })?;
        Ok(FieldKey {
            location: location.trim().parse()?,
            name: name.trim().to_owned(),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FieldStats {
    pub min: f64,
    pub max: f64,
    pub mean: f64,
    pub l2: f64,
    pub linf: f64,
}

/// Vector rows collapse to their magnitude for curves; everything else is
/// flattened.
fn as_scalar(array: &ArrayD<f64>) -> Vec<f64> {
    if array.ndim() == 2 {
        array
            .outer_iter()
            .map(|row| row.iter().map(|v| v * v).sum::<f64>().sqrt())
            .collect()
    } else {
        array.iter().copied().collect()
    }
}

/// Component-wise statistics of `a - b` over the flattened arrays, or `None`
/// when the shapes differ.
pub fn diff_stats(a: &ArrayD<f64>, b: &ArrayD<f64>) -> Option<FieldStats> {
    if a.shape() != b.shape() {
        return None;
    }
    let d: Vec<f64> = (a - b).iter().copied().collect();
    if d.is_empty() {
        return Some(FieldStats {
            min: 0.0,
            max: 0.0,
            mean: 0.0,
            l2: 0.0,
            linf: 0.0,
        });
    }
    Some(FieldStats {
        min: d.iter().copied().fold(f64::INFINITY, f64::min),
        max: d.iter().copied().fold(f64::NEG_INFINITY, f64::max),
        mean: d.iter().sum::<f64>() / d.len() as f64,
        l2: d.iter().map(|v| v * v).sum::<f64>().sqrt(),
        linf: d.iter().map(|v| v.abs()).fold(0.0, f64::max),
    })
}

/// Fields registered in both results, sorted.
pub fn common_fields(a: &SolveResult, b: &SolveResult) -> Vec<FieldKey> {
    let keys = |meta: &SolveResult| -> BTreeSet<FieldKey> {
        meta.registry
            .iter()
            .map(|d| FieldKey {
                location: d.location,
                name: d.name.clone(),
            })
            .collect()
    };
    keys(a).intersection(&keys(b)).cloned().collect()
}

pub fn common_steps(a: &ResultArrays, b: &ResultArrays) -> Vec<usize> {
    a.steps().intersection(&b.steps()).copied().collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiffStatus {
    Ok,
    ShapeMismatch,
    Missing,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldDiff {
    #[serde(flatten)]
    pub field: FieldKey,
    pub status: DiffStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stats: Option<FieldStats>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Comparison {
    /// Last step present in both results; `None` when they share none.
    pub step: Option<usize>,
    pub diffs: Vec<FieldDiff>,
}

impl Comparison {
    /// Largest L-infinity difference over compared fields.
    pub fn max_linf(&self) -> f64 {
        self.diffs
            .iter()
            .filter_map(|d| d.stats.map(|s| s.linf))
            .fold(0.0, f64::max)
    }
}

/// Compares every common field at the last common step.
pub fn compare_outputs(
    meta_a: &SolveResult,
    arrays_a: &ResultArrays,
    meta_b: &SolveResult,
    arrays_b: &ResultArrays,
) -> Comparison {
    let step = common_steps(arrays_a, arrays_b).last().copied();
    let diffs = match step {
        None => Vec::new(),
        Some(step) => common_fields(meta_a, meta_b)
            .into_iter()
            .map(|field| {
                let a = arrays_a.field(field.location, &field.name, step);
                let b = arrays_b.field(field.location, &field.name, step);
                let (status, stats) = match (a, b) {
                    (Some(a), Some(b)) => match diff_stats(a, b) {
                        Some(stats) => (DiffStatus::Ok, Some(stats)),
                        None => (DiffStatus::ShapeMismatch, None),
                    },
                    _ => (DiffStatus::Missing, None),
                };
                FieldDiff { field, status, stats }
            })
            .collect(),
    };
    Comparison { step, diffs }
}

/// Reads results from an `out/` folder or from a case folder holding one.
pub fn load_outputs(path: &Path) -> Result<(SolveResult, ResultArrays)> {
    if path.join(RESULT_JSON).is_file() {
        return case_folder::read_outputs(path);
    }
    if path.join(OUT_DIR).is_dir() {
        return case_folder::read_outputs(&path.join(OUT_DIR));
    }
    Err(SolveError::Io {
        context: format!("reading outputs from {}", path.display()),
        source: std::io::Error::new(
            std::io::ErrorKind::NotFound,
            "not an output folder or case folder",
        ),
    })
}

pub fn compare_paths(a: &Path, b: &Path) -> Result<Comparison> {
    let (meta_a, arrays_a) = load_outputs(a)?;
    let (meta_b, arrays_b) = load_outputs(b)?;
    Ok(compare_outputs(&meta_a, &arrays_a, &meta_b, &arrays_b))
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CurvePoint {
    pub step: usize,
    pub min: f64,
    pub max: f64,
    pub mean: f64,
}

/// Min/max/mean of a field at each step; NaN where the step has no array.
pub fn step_curve(arrays: &ResultArrays, field: &FieldKey, steps: &[usize]) -> Vec<CurvePoint> {
    steps
        .iter()
        .map(|&step| {
            let values = match arrays.field(field.location, &field.name, step) {
                Some(array) => as_scalar(array),
                None => {
                    return CurvePoint {
                        step,
                        min: f64::NAN,
                        max: f64::NAN,
                        mean: f64::NAN,
                    }
                }
            };
            if values.is_empty() {
                return CurvePoint {
                    step,
                    min: 0.0,
                    max: 0.0,
                    mean: 0.0,
                };
            }
            CurvePoint {
                step,
                min: values.iter().copied().fold(f64::INFINITY, f64::min),
                max: values.iter().copied().fold(f64::NEG_INFINITY, f64::max),
                mean: values.iter().sum::<f64>() / values.len() as f64,
            }
        })
        .collect()
}

/// Writes a curve as `step,min,max,mean` CSV.
pub fn write_curve_csv(curve: &[CurvePoint], path: &Path) -> Result<()> {
    let io_err = || SolveError::io(format!("writing {}", path.display()));
    let file = File::create(path).map_err(SolveError::io(format!("creating {}", path.display())))?;
    let mut out = BufWriter::new(file);

    writeln!(out, "step,min,max,mean").map_err(io_err())?;
    for point in curve {
        writeln!(
            out,
            "{step},{min},{max},{mean}",
            step = point.step,
            min = point.min,
            max = point.max,
            mean = point.mean,
        )
        .map_err(io_err())?;
    }
    out.flush().map_err(io_err())?;

    log::info!("wrote {} curve points to {}", curve.len(), path.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::result::{ArrayKey, FieldDescriptor, FieldShape};
    use crate::testutil::TempDirGuard;
    use approx::assert_relative_eq;
    use ndarray::{arr1, arr2};

    fn result_with(u: &[[f64; 2]], p: &[f64]) -> (SolveResult, ResultArrays) {
        let meta = SolveResult::success(vec![
            FieldDescriptor::new("u", FieldLocation::Node, FieldShape::Vector2, "m"),
            FieldDescriptor::new("p", FieldLocation::Node, FieldShape::Scalar, "Pa"),
        ]);
        let mut arrays = ResultArrays::new();
        for step in 1..=2 {
            let scale = step as f64;
            let u: Vec<[f64; 2]> = u.iter().map(|r| [r[0] * scale, r[1] * scale]).collect();
            arrays
                .insert(ArrayKey::new(FieldLocation::Node, "u", step), arr2(&u).into_dyn())
                .unwrap();
            let p: Vec<f64> = p.iter().map(|v| v * scale).collect();
            arrays
                .insert(ArrayKey::new(FieldLocation::Node, "p", step), arr1(&p).into_dyn())
                .unwrap();
        }
        (meta, arrays)
    }

    #[test]
    fn identical_results_have_zero_difference() {
        let (meta, arrays) = result_with(&[[3.0, 4.0], [0.0, 1.0]], &[1.0, 2.0]);
        let cmp = compare_outputs(&meta, &arrays, &meta, &arrays);
        assert_eq!(cmp.step, Some(2));
        assert_eq!(cmp.diffs.len(), 2);
        assert!(cmp.diffs.iter().all(|d| d.status == DiffStatus::Ok));
        assert_eq!(cmp.max_linf(), 0.0);
    }

    #[test]
    fn vector_fields_compare_by_component() {
        let (meta_a, arrays_a) = result_with(&[[3.0, 4.0]], &[1.0]);
        let (meta_b, arrays_b) = result_with(&[[0.0, 1.0]], &[4.0]);
        let cmp = compare_outputs(&meta_a, &arrays_a, &meta_b, &arrays_b);
        let u = cmp.diffs.iter().find(|d| d.field.name == "u").unwrap();
        // step 2: (6, 8) - (0, 2) = (6, 6)
        let stats = u.stats.unwrap();
        assert_relative_eq!(stats.linf, 6.0);
        assert_relative_eq!(stats.l2, 72.0_f64.sqrt());
        let p = cmp.diffs.iter().find(|d| d.field.name == "p").unwrap();
        assert_relative_eq!(p.stats.unwrap().mean, -6.0);
    }

    #[test]
    fn flipped_vectors_are_not_equal() {
        let a = arr2(&[[1.0, 0.0], [0.0, 2.0]]).into_dyn();
        let b = arr2(&[[-1.0, 0.0], [0.0, -2.0]]).into_dyn();
        let stats = diff_stats(&a, &b).unwrap();
        assert_relative_eq!(stats.linf, 4.0);
        assert_relative_eq!(stats.l2, 20.0_f64.sqrt());
        assert_relative_eq!(stats.mean, 1.5);

        let (meta_a, arrays_a) = result_with(&[[1.0, 0.0], [0.0, 2.0]], &[1.0, 2.0]);
        let (meta_b, arrays_b) = result_with(&[[-1.0, 0.0], [0.0, -2.0]], &[1.0, 2.0]);
        let cmp = compare_outputs(&meta_a, &arrays_a, &meta_b, &arrays_b);
        // step 2 doubles everything
        assert_relative_eq!(cmp.max_linf(), 8.0);
    }

    #[test]
    fn shape_mismatch_is_reported() {
        let (meta_a, arrays_a) = result_with(&[[1.0, 0.0]], &[1.0]);
        let (meta_b, arrays_b) = result_with(&[[1.0, 0.0], [2.0, 0.0]], &[1.0, 2.0]);
        let cmp = compare_outputs(&meta_a, &arrays_a, &meta_b, &arrays_b);
        assert!(cmp.diffs.iter().all(|d| d.status == DiffStatus::ShapeMismatch));
    }

    #[test]
    fn curve_reports_missing_steps_as_nan() {
        let (_, arrays) = result_with(&[[3.0, 4.0], [0.0, 0.0]], &[1.0, 3.0]);
        let field: FieldKey = "node:u".parse().unwrap();
        let curve = step_curve(&arrays, &field, &[1, 2, 9]);
        assert_eq!(curve[0].max, 5.0);
        assert_eq!(curve[1].mean, 5.0);
        assert!(curve[2].min.is_nan());

        let tmp = TempDirGuard::new("curve-csv");
        let path = tmp.path().join("u.csv");
        write_curve_csv(&curve, &path).unwrap();
        let text = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines[0], "step,min,max,mean");
        assert_eq!(lines[1], "1,0,5,2.5");
        assert_eq!(lines.len(), 4);
    }

    #[test]
    fn field_keys_parse() {
        let key: FieldKey = "element:vm".parse().unwrap();
        assert_eq!(key.location, FieldLocation::Element);
        assert_eq!(key.name, "vm");
        assert!("vm".parse::<FieldKey>().is_err());
    }
}
