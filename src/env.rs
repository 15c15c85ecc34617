// ABOUTME: Environment: declarations, container, compile/plan pipeline, programs

use crate::activation::{Activation, MapActivation, PartialActivation};
use crate::ast::CheckedAst;
use crate::checker;
use crate::coverage::{CoverageReport, CoverageTracker};
use crate::error::CelError;
use crate::extensions::ExtensionRegistry;
use crate::functions::{self, Overload};
use crate::interp::Interp;
use crate::planner;
use crate::provider::{TypeProvider, TypeRegistry};
use crate::source::Source;
use crate::types::CelType;
use crate::value::Value;
use std::collections::HashMap;
use std::sync::Arc;

/// A compilation environment: declared variables and functions, the
/// namespace container, type-import abbreviations, the type provider,
/// and the extension registry. Built once, then treated as read-only by
/// compile, plan, and evaluation; nothing in the pipeline reads ambient
/// global state.
#[derive(Clone)]
pub struct Env {
    container: String,
    abbreviations: HashMap<String, String>,
    variables: HashMap<String, CelType>,
    functions: HashMap<String, Vec<Arc<Overload>>>,
    provider: Arc<dyn TypeProvider>,
    extensions: ExtensionRegistry,
}

impl Env {
    /// A new environment with the standard function library registered.
    pub fn new() -> Self {
        let mut env = Env {
            container: String::new(),
            abbreviations: HashMap::new(),
            variables: HashMap::new(),
            functions: HashMap::new(),
            provider: Arc::new(TypeRegistry::new()),
            extensions: ExtensionRegistry::with_builtins(),
        };
        functions::register_standard(&mut env);
        env
    }

    /// Set the namespace container used as the identifier search root:
    /// with container `a.b`, a reference `x` tries `a.b.x`, `a.x`, `x`.
    pub fn set_container(&mut self, container: &str) {
        self.container = container.to_string();
    }

    pub fn container(&self) -> &str {
        &self.container
    }

    /// Register an abbreviated type import: `acme.base.Widget` becomes
    /// referable as `Widget`. The alias is the last name segment.
    pub fn add_abbreviation(&mut self, qualified: &str) -> Result<(), CelError> {
        let alias = qualified.rsplit('.').next().unwrap_or(qualified);
        if alias.is_empty() || alias == qualified {
            return Err(CelError::config(format!(
                "import '{}' must be a qualified name",
                qualified
            )));
        }
        if let Some(existing) = self.abbreviations.get(alias) {
            return Err(CelError::config(format!(
                "import alias '{}' already refers to '{}'",
                alias, existing
            )));
        }
        self.abbreviations
            .insert(alias.to_string(), qualified.to_string());
        Ok(())
    }

    pub fn declare_variable(&mut self, name: &str, t: CelType) {
        self.variables.insert(name.to_string(), t);
    }

    pub fn variable(&self, name: &str) -> Option<&CelType> {
        self.variables.get(name)
    }

    /// Register (or extend) a function's overload set.
    pub fn register_function(&mut self, name: &str, overloads: Vec<Overload>) {
        let entry = self.functions.entry(name.to_string()).or_default();
        for ov in overloads {
            entry.push(Arc::new(ov));
        }
    }

    pub fn function(&self, name: &str) -> Option<&Vec<Arc<Overload>>> {
        self.functions.get(name)
    }

    pub fn set_provider(&mut self, provider: Arc<dyn TypeProvider>) {
        self.provider = provider;
    }

    pub fn provider(&self) -> &Arc<dyn TypeProvider> {
        &self.provider
    }

    pub fn extensions_mut(&mut self) -> &mut ExtensionRegistry {
        &mut self.extensions
    }

    /// Apply a named extension at the given version string (`latest`,
    /// empty for zero, or a number).
    pub fn enable_extension(&mut self, name: &str, version: &str) -> Result<(), CelError> {
        let (factory, version) = self.extensions.resolve(name, version)?;
        factory(self, version)
    }

    /// Candidate resolution names for an identifier, most-specific
    /// first. A leading dot bypasses the container; an abbreviation on
    /// the first segment rewrites to its qualified form.
    pub fn candidate_names(&self, name: &str) -> Vec<String> {
        if let Some(rest) = name.strip_prefix('.') {
            return vec![rest.to_string()];
        }
        let first = name.split('.').next().unwrap_or(name);
        if let Some(qualified) = self.abbreviations.get(first) {
            let expanded = if name.len() > first.len() {
                format!("{}{}", qualified, &name[first.len()..])
            } else {
                qualified.clone()
            };
            return vec![expanded];
        }
        let mut out = Vec::new();
        if !self.container.is_empty() {
            let segments: Vec<&str> = self.container.split('.').collect();
            for i in (1..=segments.len()).rev() {
                out.push(format!("{}.{}", segments[..i].join("."), name));
            }
        }
        out.push(name.to_string());
        out
    }

    /// Parse and check an expression source.
    pub fn compile(&self, text: &str) -> Result<CheckedAst, CelError> {
        self.compile_source(&Source::new(text))
    }

    pub fn compile_source(&self, source: &Source) -> Result<CheckedAst, CelError> {
        let ast = crate::parser::parse(source)?;
        checker::check(self, &ast)
    }

    /// Plan a checked AST into an executable program.
    pub fn plan(&self, checked: &CheckedAst, options: ProgramOptions) -> Result<Program, CelError> {
        planner::plan(self, checked, options)
    }

    /// An activation that resolves the given bindings and marks the
    /// listed names present-or-unknown instead of missing.
    pub fn partial_vars(
        &self,
        values: HashMap<String, Value>,
        unknown_names: Vec<String>,
    ) -> PartialActivation {
        PartialActivation::new(MapActivation::from(values), unknown_names)
    }
}

impl Default for Env {
    fn default() -> Self {
        Env::new()
    }
}

/// Program construction options. Optimization is on by default; the
/// rest are opt-in.
#[derive(Debug, Clone)]
pub struct ProgramOptions {
    /// Wrap every node with the observer so coverage and intermediate
    /// state are recorded.
    pub track_coverage: bool,
    /// Evaluate both sides of logical operators, both ternary branches,
    /// and full comprehension ranges.
    pub exhaustive: bool,
    /// Plan-time constant folding, literal build-out, set-membership
    /// and regex rewrites.
    pub optimize: bool,
    /// Wrap calls so activations may supply per-call overloads.
    pub late_bind: bool,
    /// Evaluation may yield unknown values for absent inputs.
    pub partial: bool,
    /// Upper bound on total comprehension steps per fold.
    pub max_fold_iterations: Option<u64>,
    /// Upper bound on constructed list/map sizes.
    pub max_collection_size: Option<usize>,
}

impl Default for ProgramOptions {
    fn default() -> Self {
        ProgramOptions {
            track_coverage: false,
            exhaustive: false,
            optimize: true,
            late_bind: false,
            partial: false,
            max_fold_iterations: None,
            max_collection_size: None,
        }
    }
}

/// Observed intermediate state from one evaluation, when tracking is
/// enabled: node id to the values seen so far.
#[derive(Debug, Default)]
pub struct EvalDetails {
    pub observed: HashMap<u64, Vec<Value>>,
}

/// A planned, immutable, evaluable expression. Programs are safe for
/// concurrent evaluation: all per-evaluation state lives in the
/// activation, and the coverage recorder is mutex-guarded.
pub struct Program {
    pub(crate) root: Interp,
    pub(crate) checked: Arc<CheckedAst>,
    pub(crate) tracker: Option<Arc<CoverageTracker>>,
}

impl Program {
    pub fn eval(&self, activation: &dyn Activation) -> Value {
        self.root.eval(activation)
    }

    /// Evaluate and return the observed intermediate state alongside
    /// the result.
    pub fn eval_with_details(&self, activation: &dyn Activation) -> (Value, EvalDetails) {
        let value = self.root.eval(activation);
        let details = EvalDetails {
            observed: self
                .tracker
                .as_ref()
                .map(|t| t.snapshot())
                .unwrap_or_default(),
        };
        (value, details)
    }

    pub fn checked_ast(&self) -> &CheckedAst {
        &self.checked
    }

    /// The coverage report accumulated across evaluations so far.
    /// Present only when the program was planned with tracking.
    pub fn coverage_report(&self) -> Option<CoverageReport> {
        self.tracker
            .as_ref()
            .map(|t| CoverageReport::generate(&self.checked, t))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_candidate_names_with_container() {
        let mut env = Env::new();
        env.set_container("acme.ns");
        assert_eq!(
            env.candidate_names("a.b"),
            vec!["acme.ns.a.b", "acme.a.b", "a.b"]
        );
        assert_eq!(env.candidate_names(".a.b"), vec!["a.b"]);
    }

    #[test]
    fn test_candidate_names_with_abbreviation() {
        let mut env = Env::new();
        env.set_container("acme.ns");
        env.add_abbreviation("acme.base.Widget").unwrap();
        assert_eq!(env.candidate_names("Widget"), vec!["acme.base.Widget"]);
        assert_eq!(
            env.candidate_names("Widget.Part"),
            vec!["acme.base.Widget.Part"]
        );
    }

    #[test]
    fn test_abbreviation_conflicts_rejected() {
        let mut env = Env::new();
        env.add_abbreviation("a.Widget").unwrap();
        assert!(env.add_abbreviation("b.Widget").is_err());
        assert!(env.add_abbreviation("bare").is_err());
    }

    #[test]
    fn test_function_registration_merges() {
        let mut env = Env::new();
        let before = env.function("size").map(Vec::len).unwrap_or(0);
        env.register_function(
            "size",
            vec![Overload::global("size_custom", vec![CelType::Duration], CelType::Int)],
        );
        assert_eq!(env.function("size").map(Vec::len), Some(before + 1));
    }
}
