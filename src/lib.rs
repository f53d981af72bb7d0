//! Solve contract and execution engine for 2D geotechnical analyses.
//!
//! A case is a folder holding `request.json` and `mesh.npz`. The
//! [`orchestrator`] validates it, resolves a [`solver::Solver`] through the
//! [`registry`], runs it on a worker thread and writes `out/result.json` +
//! `out/result.npz`, or a diagnostics bundle on failure.

pub mod batch;
pub mod case_folder;
pub mod cases;
pub mod compare;
pub mod diagnostics;
pub mod elastic;
pub mod error;
pub mod external;
pub mod fem;
pub mod logging;
pub mod mesh;
pub mod noop;
pub mod orchestrator;
pub mod precheck;
pub mod registry;
pub mod request;
pub mod result;
pub mod seepage;
pub mod solver;

pub use error::{Result, SolveError};
