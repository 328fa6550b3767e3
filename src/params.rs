//! Hyperparameter set and the predicate shared by every capture path.

use serde::{Deserialize, Serialize};

use crate::models::ParamValue;

/// Marker prepended to a name to mean "use this value even if a sweep preset it".
pub const ESCAPE_PREFIX: &str = "^";

/// Anything a capture block can see bound to a name.
#[derive(Debug, Clone, PartialEq)]
pub enum Binding {
    Value(ParamValue),
    /// A function or method. Never stored.
    Callable,
    /// A module reference. Never stored.
    Module(String),
}

macro_rules! binding_from {
    ($($t:ty),*) => {
        $(
            impl From<$t> for Binding {
                fn from(v: $t) -> Self {
                    Binding::Value(v.into())
                }
            }
        )*
    };
}

binding_from!(ParamValue, f64, f32, i64, i32, usize, bool, String, &str);

/// Returns true if `name` bound to `binding` should be kept as a hyperparameter.
pub fn is_valid_hyperparam(name: &str, binding: &Binding) -> bool {
    if name.len() >= 4 && name.starts_with("__") && name.ends_with("__") {
        return false;
    }
    if name == "_" {
        return false;
    }
    matches!(binding, Binding::Value(_))
}

/// A named collection of attributes registered alongside the main parameters.
///
/// The reporter flattens each public attribute under a key prefixed by the
/// module name, with `.` separators turned into `_`.
#[derive(Debug, Clone, PartialEq)]
pub struct ExtraModule {
    pub name: String,
    pub attributes: Vec<(String, Binding)>,
}

impl ExtraModule {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            attributes: Vec::new(),
        }
    }

    pub fn attr(mut self, name: impl Into<String>, value: impl Into<Binding>) -> Self {
        self.attributes.push((name.into(), value.into()));
        self
    }

    pub fn key_prefix(&self) -> String {
        self.name.replace('.', "_")
    }

    /// Attributes that survive the hyperparameter filter. Names starting
    /// with `_` are private.
    pub fn public_attributes(&self) -> impl Iterator<Item = (&str, &ParamValue)> {
        self.attributes.iter().filter_map(|(k, b)| match b {
            Binding::Value(v) if !k.starts_with('_') && is_valid_hyperparam(k, b) => Some((k.as_str(), v)),
            _ => None,
        })
    }
}

/// Ordered mapping from parameter name to scalar value.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HyperparameterSet {
    entries: Vec<(String, ParamValue)>,
    #[serde(skip)]
    extra_modules: Vec<ExtraModule>,
}

impl HyperparameterSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace `name`. A replaced entry keeps its position.
    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<ParamValue>) {
        let name = name.into();
        let value = value.into();
        match self.entries.iter_mut().find(|(k, _)| *k == name) {
            Some((_, slot)) => *slot = value,
            None => self.entries.push((name, value)),
        }
    }

    pub fn with(mut self, name: impl Into<String>, value: impl Into<ParamValue>) -> Self {
        self.insert(name, value);
        self
    }

    pub fn get(&self, name: &str) -> Option<&ParamValue> {
        self.entries.iter().find(|(k, _)| k == name).map(|(_, v)| v)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    pub fn keys(&self) -> Vec<String> {
        self.entries.iter().map(|(k, _)| k.clone()).collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &ParamValue)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn add_extra_module(&mut self, module: ExtraModule) {
        self.extra_modules.push(module);
    }

    pub fn extra_modules(&self) -> &[ExtraModule] {
        &self.extra_modules
    }

    /// First name that starts with the escape prefix, if any.
    pub fn escaped_name(&self) -> Option<&str> {
        self.entries
            .iter()
            .map(|(k, _)| k.as_str())
            .find(|k| k.starts_with(ESCAPE_PREFIX))
    }

    pub fn to_yaml_mapping(&self) -> serde_yaml::Mapping {
        self.entries
            .iter()
            .map(|(k, v)| (serde_yaml::Value::String(k.clone()), v.to_yaml()))
            .collect()
    }
}
