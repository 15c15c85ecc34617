// ABOUTME: Type provider: descriptor registry, struct construction, host value adaptation

use crate::error::{CelError, ErrorKind, ErrorValue};
use crate::types::CelType;
use crate::value::{CelMap, MapKey, StructValue, Value};
use std::collections::HashMap;
use std::sync::Arc;

// ============================================================================
// Descriptors
// ============================================================================

/// Scalar or composite type of a single message field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldType {
    Bool,
    Int32,
    Int64,
    Uint32,
    Uint64,
    Float,
    Double,
    String,
    Bytes,
    /// Fully qualified message type name.
    Message(String),
    /// Fully qualified enum type name.
    Enum(String),
    Duration,
    Timestamp,
}

impl FieldType {
    /// The check-time type a field of this scalar type carries. Host
    /// integer widths collapse to `int`, unsigned widths to `uint`,
    /// floating widths to `double`.
    pub fn cel_type(&self) -> CelType {
        match self {
            FieldType::Bool => CelType::Bool,
            FieldType::Int32 | FieldType::Int64 => CelType::Int,
            FieldType::Uint32 | FieldType::Uint64 => CelType::Uint,
            FieldType::Float | FieldType::Double => CelType::Double,
            FieldType::String => CelType::String,
            FieldType::Bytes => CelType::Bytes,
            FieldType::Message(name) => CelType::object(name),
            FieldType::Enum(_) => CelType::Int,
            FieldType::Duration => CelType::Duration,
            FieldType::Timestamp => CelType::Timestamp,
        }
    }

    fn scalar_default(&self) -> Value {
        match self {
            FieldType::Bool => Value::Bool(false),
            FieldType::Int32 | FieldType::Int64 | FieldType::Enum(_) => Value::Int(0),
            FieldType::Uint32 | FieldType::Uint64 => Value::Uint(0),
            FieldType::Float | FieldType::Double => Value::Double(0.0),
            FieldType::String => Value::string(""),
            FieldType::Bytes => Value::bytes([]),
            // Message-typed fields (durations and timestamps included)
            // read as null when unset.
            FieldType::Message(_) | FieldType::Duration | FieldType::Timestamp => Value::Null,
        }
    }
}

/// One field of a message: name, scalar type, and cardinality. A map
/// field carries its key type in `map_key` with `ty` as the value type.
#[derive(Debug, Clone)]
pub struct FieldDescriptor {
    pub name: String,
    pub ty: FieldType,
    pub repeated: bool,
    pub map_key: Option<FieldType>,
}

impl FieldDescriptor {
    pub fn scalar(name: &str, ty: FieldType) -> Self {
        FieldDescriptor {
            name: name.to_string(),
            ty,
            repeated: false,
            map_key: None,
        }
    }

    pub fn repeated(name: &str, ty: FieldType) -> Self {
        FieldDescriptor {
            name: name.to_string(),
            ty,
            repeated: true,
            map_key: None,
        }
    }

    pub fn map(name: &str, key: FieldType, value: FieldType) -> Self {
        FieldDescriptor {
            name: name.to_string(),
            ty: value,
            repeated: false,
            map_key: Some(key),
        }
    }

    pub fn cel_type(&self) -> CelType {
        if let Some(key) = &self.map_key {
            CelType::map_of(key.cel_type(), self.ty.cel_type())
        } else if self.repeated {
            CelType::list_of(self.ty.cel_type())
        } else {
            self.ty.cel_type()
        }
    }

    /// The value an unset field reads as.
    pub fn default_value(&self) -> Value {
        if self.map_key.is_some() {
            Value::map(CelMap::new())
        } else if self.repeated {
            Value::list(Vec::new())
        } else {
            self.ty.scalar_default()
        }
    }
}

/// A named structured type: fully qualified name plus field set. Nested
/// message and enum declarations flatten into the registry with
/// `package.Outer.Inner` dotting.
#[derive(Debug, Clone)]
pub struct MessageDescriptor {
    name: String,
    fields: Vec<FieldDescriptor>,
    pub nested_messages: Vec<MessageDescriptor>,
    pub nested_enums: Vec<EnumDescriptor>,
}

impl MessageDescriptor {
    pub fn new(name: &str, fields: Vec<FieldDescriptor>) -> Self {
        MessageDescriptor {
            name: name.to_string(),
            fields,
            nested_messages: Vec::new(),
            nested_enums: Vec::new(),
        }
    }

    pub fn with_nested(
        mut self,
        messages: Vec<MessageDescriptor>,
        enums: Vec<EnumDescriptor>,
    ) -> Self {
        self.nested_messages = messages;
        self.nested_enums = enums;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn field(&self, name: &str) -> Option<&FieldDescriptor> {
        self.fields.iter().find(|f| f.name == name)
    }

    pub fn fields(&self) -> &[FieldDescriptor] {
        &self.fields
    }
}

/// A named enum: value names and their numeric constants.
#[derive(Debug, Clone)]
pub struct EnumDescriptor {
    pub name: String,
    pub values: Vec<(String, i64)>,
}

impl EnumDescriptor {
    pub fn new(name: &str, values: Vec<(&str, i64)>) -> Self {
        EnumDescriptor {
            name: name.to_string(),
            values: values.into_iter().map(|(n, v)| (n.to_string(), v)).collect(),
        }
    }
}

/// One descriptor file: a package name, top-level declarations, and the
/// names of files it depends on. Registration pulls dependencies in
/// transitively from the pool.
#[derive(Debug, Clone, Default)]
pub struct FileDescriptor {
    pub name: String,
    pub package: String,
    pub messages: Vec<MessageDescriptor>,
    pub enums: Vec<EnumDescriptor>,
    pub dependencies: Vec<String>,
}

/// A set of descriptor files addressable by file name.
#[derive(Debug, Clone, Default)]
pub struct DescriptorPool {
    files: HashMap<String, FileDescriptor>,
}

impl DescriptorPool {
    pub fn new() -> Self {
        DescriptorPool::default()
    }

    pub fn add(&mut self, file: FileDescriptor) {
        self.files.insert(file.name.clone(), file);
    }

    pub fn get(&self, name: &str) -> Option<&FileDescriptor> {
        self.files.get(name)
    }
}

// ============================================================================
// Provider
// ============================================================================

/// Resolution of named types, instantiation of structured values, and
/// enum constant lookup. The only bridge between host-native structured
/// data and engine values.
pub trait TypeProvider: Send + Sync {
    /// Look up a named type. No prefix search happens here; namespace
    /// candidates are the identifier-resolution layer's concern.
    fn resolve_type(&self, name: &str) -> Option<CelType>;

    /// The declared type of a field on a named type, if both exist.
    fn field_type(&self, type_name: &str, field: &str) -> Option<CelType>;

    /// Construct an instance of a named type from engine values. Unknown
    /// fields and lossy conversions are errors.
    fn new_value(&self, name: &str, fields: Vec<(String, Value)>) -> Result<Value, ErrorValue>;

    /// Resolve a fully qualified enum value name to its constant.
    fn resolve_enum(&self, name: &str) -> Option<i64>;
}

/// Descriptor-backed registry. Built once during environment setup,
/// read-only afterwards.
#[derive(Debug, Clone, Default)]
pub struct TypeRegistry {
    messages: HashMap<String, Arc<MessageDescriptor>>,
    enum_values: HashMap<String, i64>,
}

impl TypeRegistry {
    pub fn new() -> Self {
        TypeRegistry::default()
    }

    /// Register a file and, transitively, every file it depends on.
    pub fn register_file(&mut self, pool: &DescriptorPool, file_name: &str) -> Result<(), CelError> {
        let mut pending = vec![file_name.to_string()];
        let mut seen: Vec<String> = Vec::new();
        while let Some(name) = pending.pop() {
            if seen.contains(&name) {
                continue;
            }
            seen.push(name.clone());
            let file = pool
                .get(&name)
                .ok_or_else(|| CelError::config(format!("descriptor file '{}' not in pool", name)))?;
            for dep in &file.dependencies {
                pending.push(dep.clone());
            }
            let prefix = if file.package.is_empty() {
                String::new()
            } else {
                format!("{}.", file.package)
            };
            for msg in &file.messages {
                self.register_message(&prefix, msg);
            }
            for e in &file.enums {
                self.register_enum(&prefix, e);
            }
        }
        Ok(())
    }

    /// Register a single message descriptor under its own name, plus all
    /// nested declarations with dotted names.
    pub fn register_message(&mut self, prefix: &str, msg: &MessageDescriptor) {
        let qualified = format!("{}{}", prefix, msg.name());
        let mut flat = msg.clone();
        flat.name = qualified.clone();
        let nested_prefix = format!("{}.", qualified);
        for nested in &msg.nested_messages {
            self.register_message(&nested_prefix, nested);
        }
        for e in &msg.nested_enums {
            self.register_enum(&nested_prefix, e);
        }
        flat.nested_messages.clear();
        flat.nested_enums.clear();
        self.messages.insert(qualified, Arc::new(flat));
    }

    fn register_enum(&mut self, prefix: &str, e: &EnumDescriptor) {
        let qualified = format!("{}{}", prefix, e.name);
        for (value_name, value) in &e.values {
            self.enum_values
                .insert(format!("{}.{}", qualified, value_name), *value);
        }
    }

    pub fn descriptor(&self, name: &str) -> Option<&Arc<MessageDescriptor>> {
        self.messages.get(name)
    }

    /// Convert an engine value for storage into the given field,
    /// checking representability. Widening into a narrower host width
    /// (int into int32) is allowed when the value fits; anything lossy
    /// is a conversion error.
    pub fn expr_to_host(&self, fd: &FieldDescriptor, value: Value) -> Result<Value, ErrorValue> {
        if fd.map_key.is_some() {
            return match value {
                Value::Map(_) => Ok(value),
                other => Err(field_mismatch(fd, &other)),
            };
        }
        if fd.repeated {
            return match value {
                Value::List(items) => {
                    let mut out = Vec::with_capacity(items.len());
                    for item in items.iter() {
                        out.push(self.coerce_scalar(&fd.ty, item.clone(), &fd.name)?);
                    }
                    Ok(Value::list(out))
                }
                other => Err(field_mismatch(fd, &other)),
            };
        }
        self.coerce_scalar(&fd.ty, value, &fd.name)
    }

    fn coerce_scalar(
        &self,
        ty: &FieldType,
        value: Value,
        field: &str,
    ) -> Result<Value, ErrorValue> {
        let mismatch = |v: &Value| {
            ErrorValue::new(
                ErrorKind::Conversion,
                format!("field '{}' cannot hold {}", field, v.kind_name()),
            )
        };
        match ty {
            FieldType::Bool => match value {
                Value::Bool(_) => Ok(value),
                v => Err(mismatch(&v)),
            },
            FieldType::Int64 => match value {
                Value::Int(_) => Ok(value),
                v => Err(mismatch(&v)),
            },
            FieldType::Int32 => match value {
                Value::Int(i) if i >= i32::MIN as i64 && i <= i32::MAX as i64 => Ok(Value::Int(i)),
                Value::Int(i) => Err(ErrorValue::new(
                    ErrorKind::Conversion,
                    format!("value {} out of range for 32-bit field '{}'", i, field),
                )),
                v => Err(mismatch(&v)),
            },
            FieldType::Uint64 => match value {
                Value::Uint(_) => Ok(value),
                v => Err(mismatch(&v)),
            },
            FieldType::Uint32 => match value {
                Value::Uint(u) if u <= u32::MAX as u64 => Ok(Value::Uint(u)),
                Value::Uint(u) => Err(ErrorValue::new(
                    ErrorKind::Conversion,
                    format!("value {} out of range for 32-bit field '{}'", u, field),
                )),
                v => Err(mismatch(&v)),
            },
            FieldType::Double => match value {
                Value::Double(_) => Ok(value),
                v => Err(mismatch(&v)),
            },
            FieldType::Float => match value {
                Value::Double(d) => {
                    if (d as f32) as f64 == d {
                        Ok(Value::Double(d))
                    } else {
                        Err(ErrorValue::new(
                            ErrorKind::Conversion,
                            format!("value {} loses precision in float field '{}'", d, field),
                        ))
                    }
                }
                v => Err(mismatch(&v)),
            },
            FieldType::String => match value {
                Value::String(_) => Ok(value),
                v => Err(mismatch(&v)),
            },
            FieldType::Bytes => match value {
                Value::Bytes(_) => Ok(value),
                v => Err(mismatch(&v)),
            },
            FieldType::Enum(_) => match value {
                Value::Int(i) if i >= i32::MIN as i64 && i <= i32::MAX as i64 => Ok(Value::Int(i)),
                v => Err(mismatch(&v)),
            },
            FieldType::Message(name) => match value {
                Value::Struct(ref s) if s.type_name() == name => Ok(value),
                Value::Null => Ok(Value::Null),
                v => Err(mismatch(&v)),
            },
            FieldType::Duration => match value {
                Value::Duration(_) | Value::Null => Ok(value),
                v => Err(mismatch(&v)),
            },
            FieldType::Timestamp => match value {
                Value::Timestamp(_) | Value::Null => Ok(value),
                v => Err(mismatch(&v)),
            },
        }
    }
}

fn field_mismatch(fd: &FieldDescriptor, v: &Value) -> ErrorValue {
    ErrorValue::new(
        ErrorKind::Conversion,
        format!("field '{}' cannot hold {}", fd.name, v.kind_name()),
    )
}

impl TypeProvider for TypeRegistry {
    fn resolve_type(&self, name: &str) -> Option<CelType> {
        if self.messages.contains_key(name) {
            Some(CelType::object(name))
        } else {
            None
        }
    }

    fn field_type(&self, type_name: &str, field: &str) -> Option<CelType> {
        self.messages
            .get(type_name)
            .and_then(|m| m.field(field))
            .map(|f| f.cel_type())
    }

    fn new_value(&self, name: &str, fields: Vec<(String, Value)>) -> Result<Value, ErrorValue> {
        let descriptor = self.messages.get(name).ok_or_else(|| {
            ErrorValue::new(ErrorKind::Conversion, format!("unknown type '{}'", name))
        })?;
        let mut out = HashMap::new();
        for (field_name, value) in fields {
            let fd = descriptor.field(&field_name).ok_or_else(|| {
                ErrorValue::new(
                    ErrorKind::NoSuchField,
                    format!("no such field '{}' on {}", field_name, name),
                )
            })?;
            let converted = self.expr_to_host(fd, value)?;
            out.insert(field_name, converted);
        }
        Ok(Value::Struct(Arc::new(StructValue {
            descriptor: descriptor.clone(),
            fields: out,
        })))
    }

    fn resolve_enum(&self, name: &str) -> Option<i64> {
        self.enum_values.get(name).copied()
    }
}

// ============================================================================
// Host-to-engine adaptation
// ============================================================================

/// Convert a JSON host value to an engine value. Integers that fit in
/// i64 become `int`, larger unsigned magnitudes become `uint`, all other
/// numbers become `double`; JSON null is the engine's null marker.
pub fn json_to_value(v: &serde_json::Value) -> Value {
    match v {
        serde_json::Value::Null => Value::Null,
        serde_json::Value::Bool(b) => Value::Bool(*b),
        serde_json::Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                Value::Int(i)
            } else if let Some(u) = n.as_u64() {
                Value::Uint(u)
            } else {
                Value::Double(n.as_f64().unwrap_or(f64::NAN))
            }
        }
        serde_json::Value::String(s) => Value::string(s),
        serde_json::Value::Array(items) => {
            Value::list(items.iter().map(json_to_value).collect())
        }
        serde_json::Value::Object(fields) => {
            let mut m = CelMap::new();
            for (k, val) in fields {
                m.insert(MapKey::String(Arc::from(k.as_str())), json_to_value(val));
            }
            Value::map(m)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn widget_file() -> (DescriptorPool, &'static str) {
        let mut pool = DescriptorPool::new();
        pool.add(FileDescriptor {
            name: "labels.proto".to_string(),
            package: "acme.base".to_string(),
            messages: vec![MessageDescriptor::new(
                "LabelSet",
                vec![FieldDescriptor::repeated("values", FieldType::String)],
            )],
            enums: vec![],
            dependencies: vec![],
        });
        pool.add(FileDescriptor {
            name: "widget.proto".to_string(),
            package: "acme".to_string(),
            messages: vec![MessageDescriptor::new(
                "Widget",
                vec![
                    FieldDescriptor::scalar("name", FieldType::String),
                    FieldDescriptor::scalar("weight", FieldType::Int32),
                    FieldDescriptor::scalar(
                        "labels",
                        FieldType::Message("acme.base.LabelSet".to_string()),
                    ),
                ],
            )
            .with_nested(
                vec![MessageDescriptor::new(
                    "Part",
                    vec![FieldDescriptor::scalar("sku", FieldType::String)],
                )],
                vec![EnumDescriptor::new("State", vec![("UNKNOWN", 0), ("ACTIVE", 1)])],
            )],
            enums: vec![],
            dependencies: vec!["labels.proto".to_string()],
        });
        (pool, "widget.proto")
    }

    #[test]
    fn test_transitive_registration_and_nesting() {
        let (pool, root) = widget_file();
        let mut reg = TypeRegistry::new();
        reg.register_file(&pool, root).unwrap();

        assert!(reg.resolve_type("acme.Widget").is_some());
        assert!(reg.resolve_type("acme.Widget.Part").is_some());
        // transitively pulled in through the dependency
        assert!(reg.resolve_type("acme.base.LabelSet").is_some());
        assert!(reg.resolve_type("acme.Missing").is_none());
    }

    #[test]
    fn test_nested_enum_value_resolution() {
        let (pool, root) = widget_file();
        let mut reg = TypeRegistry::new();
        reg.register_file(&pool, root).unwrap();

        assert_eq!(reg.resolve_enum("acme.Widget.State.ACTIVE"), Some(1));
        assert_eq!(reg.resolve_enum("acme.Widget.State.UNKNOWN"), Some(0));
        assert_eq!(reg.resolve_enum("acme.Widget.State.MISSING"), None);
    }

    #[test]
    fn test_new_value_unknown_field_is_error() {
        let (pool, root) = widget_file();
        let mut reg = TypeRegistry::new();
        reg.register_file(&pool, root).unwrap();

        let err = reg
            .new_value(
                "acme.Widget",
                vec![("bogus".to_string(), Value::Int(1))],
            )
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::NoSuchField);
    }

    #[test]
    fn test_int32_widening_and_range_check() {
        let (pool, root) = widget_file();
        let mut reg = TypeRegistry::new();
        reg.register_file(&pool, root).unwrap();

        let ok = reg.new_value(
            "acme.Widget",
            vec![("weight".to_string(), Value::Int(200))],
        );
        assert!(ok.is_ok());

        let err = reg
            .new_value(
                "acme.Widget",
                vec![("weight".to_string(), Value::Int(i64::MAX))],
            )
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::Conversion);
    }

    #[test]
    fn test_unset_fields_read_defaults() {
        let (pool, root) = widget_file();
        let mut reg = TypeRegistry::new();
        reg.register_file(&pool, root).unwrap();

        let v = reg.new_value("acme.Widget", vec![]).unwrap();
        match &v {
            Value::Struct(s) => {
                assert!(matches!(s.field("weight"), Value::Int(0)));
                assert!(matches!(s.field("labels"), Value::Null));
                assert!(s.field("missing").is_error());
                assert!(matches!(s.has_field("weight"), Value::Bool(false)));
            }
            other => panic!("expected struct, got {}", other),
        }
    }

    #[test]
    fn test_json_adaptation() {
        let json: serde_json::Value =
            serde_json::from_str(r#"{"a": 1, "b": [true, 2.5], "c": null}"#).unwrap();
        let v = json_to_value(&json);
        match &v {
            Value::Map(m) => {
                assert_eq!(m.len(), 3);
                let a = m.get(&MapKey::String(Arc::from("a"))).unwrap();
                assert!(matches!(a, Value::Int(1)));
                let c = m.get(&MapKey::String(Arc::from("c"))).unwrap();
                assert!(matches!(c, Value::Null));
            }
            other => panic!("expected map, got {}", other),
        }
    }
}
