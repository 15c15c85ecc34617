// ABOUTME: Extension registry: closed name set, version resolution, host-supplied factories

use crate::env::Env;
use crate::error::CelError;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

/// The closed set of extension names an environment configuration may
/// reference. The core resolves names and versions; the factories
/// themselves are supplied by the host (or are built in, for the
/// extensions the standard library already covers).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExtensionName {
    Bindings,
    Encoders,
    Lists,
    Math,
    Optional,
    Protos,
    Sets,
    Strings,
}

impl ExtensionName {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExtensionName::Bindings => "bindings",
            ExtensionName::Encoders => "encoders",
            ExtensionName::Lists => "lists",
            ExtensionName::Math => "math",
            ExtensionName::Optional => "optional",
            ExtensionName::Protos => "protos",
            ExtensionName::Sets => "sets",
            ExtensionName::Strings => "strings",
        }
    }
}

impl FromStr for ExtensionName {
    type Err = CelError;

    fn from_str(s: &str) -> Result<Self, CelError> {
        match s {
            "bindings" => Ok(ExtensionName::Bindings),
            "encoders" => Ok(ExtensionName::Encoders),
            "lists" => Ok(ExtensionName::Lists),
            "math" => Ok(ExtensionName::Math),
            "optional" => Ok(ExtensionName::Optional),
            "protos" => Ok(ExtensionName::Protos),
            "sets" => Ok(ExtensionName::Sets),
            "strings" => Ok(ExtensionName::Strings),
            other => Err(CelError::config(format!("unknown extension '{}'", other))),
        }
    }
}

impl fmt::Display for ExtensionName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A factory configures an environment for one extension version.
pub type ExtensionFactory = Arc<dyn Fn(&mut Env, u32) -> Result<(), CelError> + Send + Sync>;

#[derive(Default, Clone)]
pub struct ExtensionRegistry {
    factories: HashMap<ExtensionName, BTreeMap<u32, ExtensionFactory>>,
}

impl ExtensionRegistry {
    pub fn new() -> Self {
        ExtensionRegistry::default()
    }

    /// The registry seeded with no-op factories for the extensions the
    /// standard library already provides (`bindings` gives `cel.bind`,
    /// `optional` the optional value functions). Configurations naming
    /// them resolve cleanly.
    pub fn with_builtins() -> Self {
        let mut reg = ExtensionRegistry::new();
        let noop: ExtensionFactory = Arc::new(|_env, _version| Ok(()));
        reg.register(ExtensionName::Bindings, 0, noop.clone());
        reg.register(ExtensionName::Optional, 0, noop);
        reg
    }

    pub fn register(&mut self, name: ExtensionName, version: u32, factory: ExtensionFactory) {
        self.factories.entry(name).or_default().insert(version, factory);
    }

    /// Resolve a name and version string. `latest` maps to the highest
    /// registered version, an empty version to zero.
    pub fn resolve(&self, name: &str, version: &str) -> Result<(ExtensionFactory, u32), CelError> {
        let name: ExtensionName = name.parse()?;
        let versions = self.factories.get(&name).ok_or_else(|| {
            CelError::config(format!("extension '{}' has no registered factory", name))
        })?;
        let version = if version == "latest" {
            *versions.keys().next_back().ok_or_else(|| {
                CelError::config(format!("extension '{}' has no registered versions", name))
            })?
        } else if version.is_empty() {
            0
        } else {
            version.parse::<u32>().map_err(|_| {
                CelError::config(format!("invalid version '{}' for extension '{}'", version, name))
            })?
        };
        let factory = versions.get(&version).ok_or_else(|| {
            CelError::config(format!("extension '{}' has no version {}", name, version))
        })?;
        Ok((factory.clone(), version))
    }
}

impl fmt::Debug for ExtensionRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<_> = self.factories.keys().collect();
        f.debug_struct("ExtensionRegistry").field("names", &names).finish()
    }
}
