//! Maps solver selectors to [`Solver`] implementations.
//!
//! Selectors are either a built-in name (`noop`, `reference_elastic`,
//! `reference_seepage` and their short aliases) or `external:<module>`. An
//! external module is first looked up among factories registered in-process,
//! then treated as the path of a solver executable speaking the process
//! protocol of [`crate::external`].

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::elastic::{self, ReferenceElastic};
use crate::error::{Result, SolveError};
use crate::external::ProcessSolver;
use crate::noop::{self, NoopSolver};
use crate::seepage::{self, ReferenceSeepage};
use crate::solver::{Capabilities, Solver};

pub const EXTERNAL_PREFIX: &str = "external:";

/// Built-in solver names, without aliases.
pub const BUILTINS: [&str; 3] = [noop::NAME, elastic::NAME, seepage::NAME];

pub type SolverFactory = Arc<dyn Fn() -> Box<dyn Solver> + Send + Sync>;

/// Canonical built-in name for `selector`, resolving aliases.
fn builtin_name(selector: &str) -> Option<&'static str> {
    match selector {
        "noop" | "fake" => Some(noop::NAME),
        "reference_elastic" | "ref_elastic" => Some(elastic::NAME),
        "reference_seepage" | "ref_seepage" => Some(seepage::NAME),
        _ => None,
    }
}

fn builtin(name: &str) -> Option<Box<dyn Solver>> {
    match name {
        noop::NAME => Some(Box::new(NoopSolver)),
        elastic::NAME => Some(Box::new(ReferenceElastic)),
        seepage::NAME => Some(Box::new(ReferenceSeepage)),
        _ => None,
    }
}

/// Capabilities keyed by canonical selector.
///
/// Filled on first query and read-only afterwards until invalidated.
#[derive(Default)]
pub struct CapabilityCache {
    entries: RwLock<HashMap<String, Arc<Capabilities>>>,
}

impl CapabilityCache {
    pub fn get(&self, key: &str) -> Option<Arc<Capabilities>> {
        self.entries.read().get(key).cloned()
    }

    pub fn get_or_try_insert_with(
        &self,
        key: &str,
        load: impl FnOnce() -> Result<Capabilities>,
    ) -> Result<Arc<Capabilities>> {
        if let Some(caps) = self.get(key) {
            return Ok(caps);
        }
        let caps = Arc::new(load()?);
        Ok(self
            .entries
            .write()
            .entry(key.to_owned())
            .or_insert(caps)
            .clone())
    }

    pub fn invalidate(&self, key: &str) -> bool {
        self.entries.write().remove(key).is_some()
    }

    pub fn invalidate_all(&self) {
        self.entries.write().clear();
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Default)]
pub struct SolverRegistry {
    factories: RwLock<HashMap<String, SolverFactory>>,
    cache: CapabilityCache,
}

impl SolverRegistry {
    pub fn new() -> SolverRegistry {
        SolverRegistry::default()
    }

    /// Registers a zero-argument factory reachable as `external:<name>`.
    /// Replaces any earlier factory of that name and drops its cached
    /// capabilities.
    pub fn register<F>(&self, name: &str, factory: F)
    where
        F: Fn() -> Box<dyn Solver> + Send + Sync + 'static,
    {
        let name = name.trim().to_owned();
        self.cache.invalidate(&format!("{EXTERNAL_PREFIX}{name}"));
        self.factories.write().insert(name, Arc::new(factory));
    }

    /// Registers a default-constructible solver type as `external:<name>`.
    pub fn register_default<T>(&self, name: &str)
    where
        T: Solver + Default + 'static,
    {
        self.register(name, || Box::new(T::default()));
    }

    pub fn cache(&self) -> &CapabilityCache {
        &self.cache
    }

    pub fn canonical_selector(selector: &str) -> String {
        let selector = selector.trim();
        match builtin_name(selector) {
            Some(name) => name.to_owned(),
            None => match selector.strip_prefix(EXTERNAL_PREFIX) {
                Some(module) => format!("{EXTERNAL_PREFIX}{}", module.trim()),
                None => selector.to_owned(),
            },
        }
    }

    /// Builds a fresh solver instance for `selector`.
    pub fn resolve(&self, selector: &str) -> Result<Box<dyn Solver>> {
        let canonical = SolverRegistry::canonical_selector(selector);
        if let Some(solver) = builtin(&canonical) {
            return Ok(solver);
        }

        let Some(module) = canonical.strip_prefix(EXTERNAL_PREFIX) else {
            return Err(SolveError::SolverImport(format!(
                "Unknown solver selector '{selector}' (expected one of {}, or {EXTERNAL_PREFIX}<module>)",
                BUILTINS.join(", ")
            )));
        };
        if module.is_empty() {
            return Err(SolveError::SolverImport(format!(
                "Expected {EXTERNAL_PREFIX}<module>, got '{selector}'"
            )));
        }

        let factory = self.factories.read().get(module).cloned();
        if let Some(factory) = factory {
            log::debug!("resolved {canonical} to a registered factory");
            return Ok(factory());
        }

        let program = Path::new(module);
        if program.is_file() {
            log::debug!("resolved {canonical} to executable {}", program.display());
            return Ok(Box::new(ProcessSolver::load(program)?));
        }

        Err(SolveError::SolverImport(format!(
            "'{module}' is neither a registered solver nor an executable file"
        )))
    }

    /// Cached capabilities of `selector`, resolving the solver on first use.
    pub fn capabilities(&self, selector: &str) -> Result<Arc<Capabilities>> {
        let canonical = SolverRegistry::canonical_selector(selector);
        self.cache
            .get_or_try_insert_with(&canonical, || Ok(self.resolve(selector)?.capabilities()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mesh::Mesh;
    use crate::request::SolveRequest;
    use crate::solver::{ContractRange, SolveCallbacks, SolveOutput};

    #[derive(Default)]
    struct Custom;

    impl Solver for Custom {
        fn capabilities(&self) -> Capabilities {
            Capabilities {
                name: "custom".into(),
                version: "1".into(),
                contract: ContractRange {
                    min: "0.2".into(),
                    max: "0.2".into(),
                },
                modes: vec!["plane_strain".into()],
                analysis_types: vec!["static".into()],
                materials: Vec::new(),
                bcs: Vec::new(),
                loads: Vec::new(),
                fields: Vec::new(),
                results: Vec::new(),
            }
        }

        fn solve(&self, _: &SolveRequest, _: &Mesh, _: &dyn SolveCallbacks) -> Result<SolveOutput> {
            Err(SolveError::SolverRuntime("custom solver always fails".into()))
        }
    }

    #[test]
    fn builtins_and_aliases() {
        let registry = SolverRegistry::new();
        for (selector, name) in [
            ("fake", "noop"),
            ("ref_elastic", "reference_elastic"),
            ("reference_seepage", "reference_seepage"),
        ] {
            assert_eq!(registry.resolve(selector).unwrap().capabilities().name, name);
        }
    }

    #[test]
    fn unknown_selectors_are_import_errors() {
        let registry = SolverRegistry::new();
        for selector in ["kratos", "external:", "external:does/not/exist"] {
            let err = registry.resolve(selector).err().unwrap();
            assert_eq!(err.code(), "SOLVER_IMPORT", "{selector}");
        }
    }

    #[test]
    fn registered_factories_resolve_as_external() {
        let registry = SolverRegistry::new();
        registry.register_default::<Custom>("custom");
        let caps = registry.capabilities("external:custom").unwrap();
        assert_eq!(caps.name, "custom");
        assert!(registry.resolve("custom").is_err());
    }

    #[test]
    fn capabilities_are_cached_until_invalidated() {
        let registry = SolverRegistry::new();
        let first = registry.capabilities("ref_elastic").unwrap();
        let second = registry.capabilities("reference_elastic").unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(registry.cache().len(), 1);

        assert!(registry.cache().invalidate("reference_elastic"));
        let third = registry.capabilities("ref_elastic").unwrap();
        assert!(!Arc::ptr_eq(&first, &third));

        registry.cache().invalidate_all();
        assert!(registry.cache().is_empty());
    }
}
