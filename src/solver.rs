use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::mesh::Mesh;
use crate::request::{version_in_range, SolveRequest};
use crate::result::{ResultArrays, SolveResult};

/// Inclusive range of contract versions a solver accepts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContractRange {
    pub min: String,
    pub max: String,
}

/// A solver's self-description.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Capabilities {
    pub name: String,
    #[serde(default)]
    pub version: String,
    pub contract: ContractRange,
    #[serde(default)]
    pub modes: Vec<String>,
    #[serde(default)]
    pub analysis_types: Vec<String>,
    #[serde(default)]
    pub materials: Vec<String>,
    #[serde(default)]
    pub bcs: Vec<String>,
    #[serde(default)]
    pub loads: Vec<String>,
    #[serde(default)]
    pub fields: Vec<String>,
    #[serde(default)]
    pub results: Vec<String>,
}

fn listed(list: &[String], value: &str) -> bool {
    list.iter().any(|v| v == value)
}

impl Capabilities {
    pub fn supports_contract(&self, schema_version: &str) -> bool {
        version_in_range(schema_version, &self.contract.min, &self.contract.max)
    }

    pub fn supports_mode(&self, mode: &str) -> bool {
        listed(&self.modes, mode)
    }

    pub fn supports_analysis_type(&self, analysis_type: &str) -> bool {
        listed(&self.analysis_types, analysis_type)
    }

    pub fn supports_material(&self, model_name: &str) -> bool {
        listed(&self.materials, model_name)
    }

    pub fn supports_bc(&self, kind: &str) -> bool {
        listed(&self.bcs, kind)
    }

    pub fn supports_load(&self, kind: &str) -> bool {
        listed(&self.loads, kind)
    }

    /// Output names are matched against both `fields` and `results`.
    pub fn supports_output(&self, name: &str) -> bool {
        listed(&self.fields, name) || listed(&self.results, name)
    }
}

/// Metadata plus arrays produced by one successful solve.
#[derive(Debug, Clone, PartialEq)]
pub struct SolveOutput {
    pub meta: SolveResult,
    pub arrays: ResultArrays,
}

/// Hooks a solver may call while solving. All of them are optional.
///
/// Calls arrive on the solver's thread; implementations forward them to
/// wherever they are consumed.
pub trait SolveCallbacks {
    /// `fraction` is in `[0, 1]`; `step` is the stage-local step index.
    fn on_progress(&self, _fraction: f64, _message: &str, _stage_id: &str, _step: usize) {}

    fn on_log(&self, _level: log::Level, _message: &str) {}

    /// Polled between discrete steps; `true` asks the solver to stop with
    /// [`crate::error::SolveError::Cancelled`].
    fn should_cancel(&self) -> bool {
        false
    }
}

/// Callbacks that ignore everything and never cancel.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoCallbacks;

impl SolveCallbacks for NoCallbacks {}

/// A solver usable by the execution engine.
pub trait Solver: Send {
    fn capabilities(&self) -> Capabilities;

    fn solve(
        &self,
        request: &SolveRequest,
        mesh: &Mesh,
        callbacks: &dyn SolveCallbacks,
    ) -> Result<SolveOutput>;
}

impl<T: Solver + ?Sized> Solver for Box<T> {
    fn capabilities(&self) -> Capabilities {
        (**self).capabilities()
    }

    fn solve(
        &self,
        request: &SolveRequest,
        mesh: &Mesh,
        callbacks: &dyn SolveCallbacks,
    ) -> Result<SolveOutput> {
        (**self).solve(request, mesh, callbacks)
    }
}
