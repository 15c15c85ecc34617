//! # Standard Function Library
//!
//! Declarations and runtime implementations for the built-in functions,
//! organized by category:
//!
//! - **[arithmetic]**: `_+_`, `_-_`, `_*_`, `_/_`, `_%_`, unary `-_` with
//!   checked 64-bit semantics and timestamp/duration composition
//! - **[comparison]**: `_==_`, `_!=_` and the four orderings with
//!   cross-numeric-type overloads
//! - **[logic]**: `!_` and the `@not_strictly_false` comprehension helper
//! - **[lists]**: `size`, `@in`, `_[_]_`
//! - **[strings]**: `contains`, `startsWith`, `endsWith`, `matches`
//! - **[conversions]**: `int`, `uint`, `double`, `string`, `bytes`,
//!   `bool`, `type`, `dyn`, `duration`, `timestamp`
//! - **[datetime]**: timestamp and duration accessors with timezone
//!   support
//! - **[optional]**: `optional.of`, `optional.none`, and the optional
//!   member functions
//!
//! Each category registers both the checker declarations and the
//! evaluator implementations through `Env::register_function`.

use crate::env::Env;
use crate::types::CelType;
use crate::value::Value;
use std::fmt;
use std::sync::Arc;

pub mod arithmetic;
pub mod comparison;
pub mod conversions;
pub mod datetime;
pub mod lists;
pub mod logic;
pub mod optional;
pub mod strings;

/// A runtime function implementation. Receives already-evaluated
/// arguments (the receiver first for member-style calls) and returns a
/// value; errors are returned as error values, never panics.
pub type FunctionImpl = Arc<dyn Fn(&[Value]) -> Value + Send + Sync>;

/// One typed signature for a function name. The checker selects
/// overloads by unifying declared parameter types against inferred
/// argument types; the evaluator re-checks runtime types on dispatch.
pub struct Overload {
    pub id: String,
    pub params: Vec<CelType>,
    pub result: CelType,
    pub member_style: bool,
    pub type_params: Vec<String>,
    /// Non-strict overloads receive errors and unknowns as arguments
    /// rather than having them short-circuit the call.
    pub non_strict: bool,
    pub imp: Option<FunctionImpl>,
}

impl Overload {
    pub fn global(id: &str, params: Vec<CelType>, result: CelType) -> Self {
        Overload {
            id: id.to_string(),
            params,
            result,
            member_style: false,
            type_params: Vec::new(),
            non_strict: false,
            imp: None,
        }
    }

    pub fn member(id: &str, params: Vec<CelType>, result: CelType) -> Self {
        Overload {
            id: id.to_string(),
            params,
            result,
            member_style: true,
            type_params: Vec::new(),
            non_strict: false,
            imp: None,
        }
    }

    pub fn with_type_params(mut self, names: &[&str]) -> Self {
        self.type_params = names.iter().map(|n| n.to_string()).collect();
        self
    }

    pub fn non_strict(mut self) -> Self {
        self.non_strict = true;
        self
    }

    pub fn with_impl<F>(mut self, f: F) -> Self
    where
        F: Fn(&[Value]) -> Value + Send + Sync + 'static,
    {
        self.imp = Some(Arc::new(f));
        self
    }
}

// The implementation closure has no Debug form; show the signature.
impl fmt::Debug for Overload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Overload")
            .field("id", &self.id)
            .field("params", &self.params)
            .field("result", &self.result)
            .field("member_style", &self.member_style)
            .field("non_strict", &self.non_strict)
            .finish()
    }
}

/// Register the whole standard library into an environment.
pub fn register_standard(env: &mut Env) {
    arithmetic::register(env);
    comparison::register(env);
    logic::register(env);
    lists::register(env);
    strings::register(env);
    conversions::register(env);
    datetime::register(env);
    optional::register(env);
}
