//! Parameter capture.
//!
//! A `ParameterBlock` records the bindings a caller makes between `open` and
//! `close`. Only public names (no leading `_`) absent from the scope seen at
//! `open` become hyperparameters, after the shared filter in [`crate::params`]. The mapping
//! form (`from_mapping`, `from_yaml_file`) applies the same filter to a loaded
//! configuration.

use std::collections::HashSet;
use std::path::Path;

use tracing::debug;

use crate::error::{BuddyError, Result};
use crate::models::ParamValue;
use crate::params::{is_valid_hyperparam, Binding, ExtraModule, HyperparameterSet, ESCAPE_PREFIX};
use crate::storage;

/// Names already bound before a parameter block starts.
#[derive(Debug, Clone, Default)]
pub struct Scope {
    names: HashSet<String>,
}

impl Scope {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_names<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            names: names.into_iter().map(Into::into).collect(),
        }
    }

    pub fn declare(&mut self, name: impl Into<String>) {
        self.names.insert(name.into());
    }

    pub fn contains(&self, name: &str) -> bool {
        self.names.contains(name)
    }
}

/// Builder for a marked block of parameter bindings.
#[derive(Debug)]
pub struct ParameterBlock<'s> {
    before: &'s Scope,
    bindings: Vec<(String, Binding)>,
    extra_modules: Vec<ExtraModule>,
}

impl<'s> ParameterBlock<'s> {
    pub fn open(before: &'s Scope) -> Self {
        Self {
            before,
            bindings: Vec::new(),
            extra_modules: Vec::new(),
        }
    }

    /// Bind `name` inside the block. Rebinding keeps the latest value.
    pub fn bind(mut self, name: impl Into<String>, value: impl Into<Binding>) -> Self {
        let name = name.into();
        let value = value.into();
        match self.bindings.iter_mut().find(|(k, _)| *k == name) {
            Some((_, slot)) => *slot = value,
            None => self.bindings.push((name, value)),
        }
        self
    }

    pub fn bind_callable(self, name: impl Into<String>) -> Self {
        self.bind(name, Binding::Callable)
    }

    pub fn bind_module(self, name: impl Into<String>) -> Self {
        let name = name.into();
        let module = Binding::Module(name.clone());
        self.bind(name, module)
    }

    pub fn extra_module(mut self, module: ExtraModule) -> Self {
        self.extra_modules.push(module);
        self
    }

    /// Close the block and keep the new, valid bindings.
    pub fn close(self) -> HyperparameterSet {
        let mut set = HyperparameterSet::new();
        for (name, binding) in self.bindings {
            if self.before.contains(&name) {
                continue;
            }
            if is_private(&name) {
                debug!(name = %name, "dropping private binding from parameter block");
                continue;
            }
            if !is_valid_hyperparam(&name, &binding) {
                debug!(name = %name, "dropping binding from parameter block");
                continue;
            }
            if let Binding::Value(v) = binding {
                set.insert(name, v);
            }
        }
        for module in self.extra_modules {
            set.add_extra_module(module);
        }
        set
    }
}

/// Block locals starting with `_` are scratch variables, not parameters.
fn is_private(name: &str) -> bool {
    name.starts_with('_')
}

/// Build a set from an explicit mapping, e.g. a loaded configuration.
///
/// Fails with `NamingConflict` if any key starts with the escape prefix.
pub fn from_mapping<I, K, B>(entries: I) -> Result<HyperparameterSet>
where
    I: IntoIterator<Item = (K, B)>,
    K: Into<String>,
    B: Into<Binding>,
{
    let entries: Vec<(String, Binding)> = entries
        .into_iter()
        .map(|(k, b)| (k.into(), b.into()))
        .collect();

    if let Some((name, _)) = entries.iter().find(|(k, _)| k.starts_with(ESCAPE_PREFIX)) {
        return Err(BuddyError::NamingConflict {
            name: name.clone(),
            prefix: ESCAPE_PREFIX,
        });
    }

    let mut set = HyperparameterSet::new();
    for (name, binding) in entries {
        if !is_valid_hyperparam(&name, &binding) {
            debug!(name = %name, "dropping mapping entry");
            continue;
        }
        if let Binding::Value(v) = binding {
            set.insert(name, v);
        }
    }
    Ok(set)
}

/// Build a set from a flat YAML mapping of scalars.
pub fn from_yaml_value(value: &serde_yaml::Value) -> Result<HyperparameterSet> {
    let mapping = match value {
        serde_yaml::Value::Mapping(m) => m,
        serde_yaml::Value::Null => return Ok(HyperparameterSet::new()),
        _ => {
            return Err(BuddyError::Configuration(
                "hyperparameter config must be a mapping".to_string(),
            ))
        }
    };

    let mut entries = Vec::with_capacity(mapping.len());
    for (k, v) in mapping {
        let key = match k {
            serde_yaml::Value::String(s) => s.clone(),
            other => serde_yaml::to_string(other)?.trim().to_string(),
        };
        let value = yaml_scalar(&key, v)?;
        entries.push((key, Binding::Value(value)));
    }
    from_mapping(entries)
}

/// Load a YAML file and build a set from it.
pub fn from_yaml_file(path: &Path) -> Result<HyperparameterSet> {
    if !path.exists() {
        return Err(BuddyError::Configuration(format!(
            "config file not found: {}",
            path.display()
        )));
    }
    let value = storage::load_yaml_value(path)?;
    from_yaml_value(&value)
}

fn yaml_scalar(key: &str, v: &serde_yaml::Value) -> Result<ParamValue> {
    match v {
        serde_yaml::Value::Bool(b) => Ok(ParamValue::Bool(*b)),
        serde_yaml::Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                Ok(ParamValue::Int(i))
            } else if let Some(f) = n.as_f64() {
                Ok(ParamValue::Float(f))
            } else {
                Err(BuddyError::Configuration(format!(
                    "{key}: number {n} does not fit a 64-bit value"
                )))
            }
        }
        serde_yaml::Value::String(s) => Ok(ParamValue::Text(s.clone())),
        // nested configs are not supported
        _ => Err(BuddyError::Configuration(format!(
            "{key}: only scalar values are supported"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn block_keeps_only_new_valid_bindings() {
        let scope = Scope::new();
        let set = ParameterBlock::open(&scope)
            .bind("a", 1)
            .bind("_b", 2)
            .bind("__c__", 3)
            .bind_callable("f")
            .close();
        assert_eq!(set.keys(), vec!["a"]);
        assert_eq!(set.get("a"), Some(&ParamValue::Int(1)));
    }

    #[test]
    fn block_drops_bare_underscore() {
        let scope = Scope::new();
        let set = ParameterBlock::open(&scope).bind("_", 0).bind("lr", 0.1).close();
        assert_eq!(set.keys(), vec!["lr"]);
    }

    #[test]
    fn mapping_keeps_single_underscore_keys() {
        let set = from_mapping([("_seed", 1), ("lr", 2)]).unwrap();
        assert_eq!(set.keys(), vec!["_seed", "lr"]);
    }

    #[test]
    fn block_ignores_names_bound_before_it() {
        let scope = Scope::from_names(["data_dir", "np"]);
        let set = ParameterBlock::open(&scope)
            .bind("data_dir", "/tmp")
            .bind_module("np")
            .bind("lr", 0.01)
            .bind("epochs", 10)
            .close();
        assert_eq!(set.keys(), vec!["lr", "epochs"]);
    }

    #[test]
    fn rebinding_keeps_latest_value() {
        let scope = Scope::new();
        let set = ParameterBlock::open(&scope)
            .bind("lr", 0.1)
            .bind("lr", 0.2)
            .close();
        assert_eq!(set.get("lr"), Some(&ParamValue::Float(0.2)));
        assert_eq!(set.len(), 1);
    }

    #[test]
    fn mapping_rejects_escaped_keys() {
        let err = from_mapping([("^lr", 0.1)]).unwrap_err();
        assert!(matches!(err, BuddyError::NamingConflict { ref name, .. } if name == "^lr"));
    }

    #[test]
    fn mapping_applies_filter() {
        let set = from_mapping(vec![
            ("lr", Binding::from(0.1)),
            ("__name__", Binding::from("main")),
            ("os", Binding::Module("os".into())),
        ])
        .unwrap();
        assert_eq!(set.keys(), vec!["lr"]);
    }

    #[test]
    fn yaml_mapping_keeps_types_and_order() {
        let yaml: serde_yaml::Value =
            serde_yaml::from_str("lr: 0.01\nepochs: 10\nname: resnet\nshuffle: true\n").unwrap();
        let set = from_yaml_value(&yaml).unwrap();
        assert_eq!(set.keys(), vec!["lr", "epochs", "name", "shuffle"]);
        assert_eq!(set.get("epochs"), Some(&ParamValue::Int(10)));
        assert_eq!(set.get("shuffle"), Some(&ParamValue::Bool(true)));
    }

    #[test]
    fn yaml_rejects_nested_values() {
        let yaml: serde_yaml::Value = serde_yaml::from_str("optim:\n  lr: 0.1\n").unwrap();
        assert!(matches!(
            from_yaml_value(&yaml),
            Err(BuddyError::Configuration(_))
        ));
    }
}
