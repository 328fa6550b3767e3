//! Command-line override merge.
//!
//! Accepted syntax is `--name=value` or `--^name=value`. Tokens that do not
//! start with `--` are positional and ignored; a bare `--` ends parsing. Any
//! other `--` token is rejected. The merge is all-or-nothing: every token is
//! checked before the set is touched.

use tracing::{info, warn};

use crate::error::{BuddyError, Result};
use crate::models::{ParamKind, ParamValue};
use crate::params::{HyperparameterSet, ESCAPE_PREFIX};

/// One `--name=value` token.
#[derive(Debug, Clone, PartialEq)]
pub struct OverrideEntry {
    pub name: String,
    pub raw: String,
    /// The token used the `--^name` form.
    pub escaped: bool,
}

impl OverrideEntry {
    /// Parse a single token. Returns `Ok(None)` for positional tokens.
    pub fn parse(token: &str) -> Result<Option<Self>> {
        let Some(body) = token.strip_prefix("--") else {
            return Ok(None);
        };
        let Some((name, raw)) = body.split_once('=') else {
            return Err(BuddyError::MalformedArgument(token.to_string()));
        };
        let stripped = name.trim_start_matches(ESCAPE_PREFIX);
        let escaped = stripped.len() != name.len();
        let name = stripped;
        if name.is_empty() {
            return Err(BuddyError::MalformedArgument(token.to_string()));
        }
        Ok(Some(Self {
            name: name.to_string(),
            raw: raw.to_string(),
            escaped,
        }))
    }
}

/// Parse every override token in `args` (argv without the program name).
pub fn parse_overrides<I, S>(args: I) -> Result<Vec<OverrideEntry>>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut entries = Vec::new();
    for arg in args {
        let arg = arg.as_ref();
        if arg == "--" {
            break;
        }
        if let Some(entry) = OverrideEntry::parse(arg)? {
            entries.push(entry);
        }
    }
    Ok(entries)
}

struct CoercionRule {
    kind: ParamKind,
    applies: fn(&str) -> bool,
}

/// Tried in order; the first rule that applies decides the type.
const COERCION_RULES: &[CoercionRule] = &[
    CoercionRule {
        kind: ParamKind::Float,
        applies: has_decimal_point,
    },
    CoercionRule {
        kind: ParamKind::Int,
        applies: is_integer,
    },
    CoercionRule {
        kind: ParamKind::Text,
        applies: always,
    },
];

fn has_decimal_point(raw: &str) -> bool {
    raw.contains('.')
}

fn is_integer(raw: &str) -> bool {
    raw.parse::<i64>().is_ok()
}

fn always(_: &str) -> bool {
    true
}

/// Coerce a raw override string into a typed value.
pub fn coerce(name: &str, raw: &str) -> Result<ParamValue> {
    for rule in COERCION_RULES {
        if (rule.applies)(raw) {
            return rule.kind.parse(raw).ok_or_else(|| BuddyError::InvalidValue {
                name: name.to_string(),
                raw: raw.to_string(),
                kind: rule.kind.as_str(),
            });
        }
    }
    Ok(ParamValue::Text(raw.to_string()))
}

/// Apply `entries` to `params`, returning a new set.
///
/// `params` is never modified; on error nothing is applied.
pub fn merge(params: &HyperparameterSet, entries: &[OverrideEntry]) -> Result<HyperparameterSet> {
    let mut resolved = Vec::with_capacity(entries.len());
    for entry in entries {
        if !params.contains(&entry.name) {
            return Err(BuddyError::UnknownParameter {
                name: entry.name.clone(),
                valid: params.keys(),
            });
        }
        resolved.push((entry.name.as_str(), coerce(&entry.name, &entry.raw)?));
    }

    let mut merged = params.clone();
    for (name, value) in resolved {
        info!(name, value = %value, "overriding parameter");
        merged.insert(name, value);
    }
    Ok(merged)
}

/// Parse `args` and merge them into `params`.
pub fn apply_args<I, S>(params: &HyperparameterSet, args: I) -> Result<HyperparameterSet>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let entries = parse_overrides(args)?;
    merge(params, &entries)
}

/// Names whose override would change the declared kind.
pub fn kind_changes(params: &HyperparameterSet, merged: &HyperparameterSet) -> Vec<(String, ParamKind, ParamKind)> {
    params
        .iter()
        .filter_map(|(k, old)| {
            let new = merged.get(k)?;
            (old.kind() != new.kind()).then(|| (k.to_string(), old.kind(), new.kind()))
        })
        .collect()
}

/// Holds the registered hyperparameters for one process.
///
/// Registration happens once; the set is read-only afterwards.
#[derive(Debug, Default)]
pub struct Registry {
    params: Option<HyperparameterSet>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `params` merged with the overrides found in `args`.
    pub fn register<I, S>(&mut self, params: HyperparameterSet, args: I) -> Result<&HyperparameterSet>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        if self.params.is_some() {
            return Err(BuddyError::AlreadyRegistered);
        }
        if let Some(name) = params.escaped_name() {
            return Err(BuddyError::NamingConflict {
                name: name.to_string(),
                prefix: ESCAPE_PREFIX,
            });
        }

        let merged = apply_args(&params, args)?;
        for (name, from, to) in kind_changes(&params, &merged) {
            warn!(name = %name, %from, %to, "override changed parameter type");
        }
        Ok(self.params.insert(merged))
    }

    /// Register using the current process arguments.
    pub fn register_from_env(&mut self, params: HyperparameterSet) -> Result<&HyperparameterSet> {
        self.register(params, std::env::args().skip(1))
    }

    pub fn params(&self) -> Option<&HyperparameterSet> {
        self.params.as_ref()
    }
}
