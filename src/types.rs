// ABOUTME: Check-time type descriptors for the expression language

use std::fmt;
use std::sync::Arc;

/// The type of an expression node, as assigned by the checker and carried
/// by `Value::Type` at runtime.
///
/// `Dyn` is the unknown-at-check-time type; `TypeParam` only appears
/// inside function overload declarations and is substituted away during
/// overload resolution.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum CelType {
    Bool,
    Int,
    Uint,
    Double,
    String,
    Bytes,
    Duration,
    Timestamp,
    Null,
    Dyn,
    Error,
    List(Box<CelType>),
    Map(Box<CelType>, Box<CelType>),
    Optional(Box<CelType>),
    /// The type of a type value, e.g. `type(1)` has type `type(int)`.
    Type(Box<CelType>),
    /// A named structured type resolved through the type provider.
    Object(Arc<str>),
    /// A free type variable in an overload signature.
    TypeParam(Arc<str>),
}

impl CelType {
    pub fn list_of(elem: CelType) -> CelType {
        CelType::List(Box::new(elem))
    }

    pub fn map_of(key: CelType, value: CelType) -> CelType {
        CelType::Map(Box::new(key), Box::new(value))
    }

    pub fn optional_of(elem: CelType) -> CelType {
        CelType::Optional(Box::new(elem))
    }

    pub fn type_of(inner: CelType) -> CelType {
        CelType::Type(Box::new(inner))
    }

    pub fn type_param(name: &str) -> CelType {
        CelType::TypeParam(Arc::from(name))
    }

    pub fn object(name: &str) -> CelType {
        CelType::Object(Arc::from(name))
    }

    pub fn is_dyn(&self) -> bool {
        matches!(self, CelType::Dyn)
    }

    pub fn is_numeric(&self) -> bool {
        matches!(self, CelType::Int | CelType::Uint | CelType::Double)
    }

    pub fn is_optional(&self) -> bool {
        matches!(self, CelType::Optional(_))
    }

    /// True when the type may legally appear as a map key.
    pub fn is_valid_map_key(&self) -> bool {
        matches!(
            self,
            CelType::Bool | CelType::Int | CelType::Uint | CelType::String | CelType::Dyn
        )
    }

    /// Unwrap one level of `optional`, or return self unchanged.
    pub fn unwrap_optional(&self) -> &CelType {
        match self {
            CelType::Optional(inner) => inner,
            other => other,
        }
    }

    /// Whether any `TypeParam` occurs within this type.
    pub fn has_type_params(&self) -> bool {
        match self {
            CelType::TypeParam(_) => true,
            CelType::List(e) => e.has_type_params(),
            CelType::Map(k, v) => k.has_type_params() || v.has_type_params(),
            CelType::Optional(e) => e.has_type_params(),
            CelType::Type(e) => e.has_type_params(),
            _ => false,
        }
    }

    /// Join two types: equal types join to themselves, anything else
    /// joins to `dyn`. Used for ternary branches and mixed collections.
    pub fn join(&self, other: &CelType) -> CelType {
        if self == other {
            self.clone()
        } else if matches!(self, CelType::Error) {
            other.clone()
        } else if matches!(other, CelType::Error) {
            self.clone()
        } else {
            CelType::Dyn
        }
    }
}

impl fmt::Display for CelType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CelType::Bool => write!(f, "bool"),
            CelType::Int => write!(f, "int"),
            CelType::Uint => write!(f, "uint"),
            CelType::Double => write!(f, "double"),
            CelType::String => write!(f, "string"),
            CelType::Bytes => write!(f, "bytes"),
            CelType::Duration => write!(f, "google.protobuf.Duration"),
            CelType::Timestamp => write!(f, "google.protobuf.Timestamp"),
            CelType::Null => write!(f, "null_type"),
            CelType::Dyn => write!(f, "dyn"),
            CelType::Error => write!(f, "*error*"),
            CelType::List(e) => write!(f, "list({})", e),
            CelType::Map(k, v) => write!(f, "map({}, {})", k, v),
            CelType::Optional(e) => write!(f, "optional({})", e),
            CelType::Type(t) => write!(f, "type({})", t),
            CelType::Object(name) => write!(f, "{}", name),
            CelType::TypeParam(name) => write!(f, "{}", name),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_compound_types() {
        assert_eq!(CelType::list_of(CelType::Int).to_string(), "list(int)");
        assert_eq!(
            CelType::map_of(CelType::String, CelType::Dyn).to_string(),
            "map(string, dyn)"
        );
        assert_eq!(
            CelType::optional_of(CelType::String).to_string(),
            "optional(string)"
        );
        assert_eq!(CelType::object("acme.Widget").to_string(), "acme.Widget");
    }

    #[test]
    fn test_join() {
        assert_eq!(CelType::Int.join(&CelType::Int), CelType::Int);
        assert_eq!(CelType::Int.join(&CelType::Double), CelType::Dyn);
        assert_eq!(CelType::Error.join(&CelType::Bool), CelType::Bool);
    }

    #[test]
    fn test_has_type_params() {
        let t = CelType::list_of(CelType::type_param("A"));
        assert!(t.has_type_params());
        assert!(!CelType::list_of(CelType::Int).has_type_params());
    }

    #[test]
    fn test_map_key_validity() {
        assert!(CelType::String.is_valid_map_key());
        assert!(CelType::Int.is_valid_map_key());
        assert!(!CelType::Double.is_valid_map_key());
        assert!(!CelType::list_of(CelType::Int).is_valid_map_key());
    }
}
