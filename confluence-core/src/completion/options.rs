//! Option buckets and installable setters.
//!
//! A completion accumulates caller-supplied options before it fires. Options
//! live in three buckets:
//!
//! - `set`: plain key/value assignments
//! - `append`: values a producer should append to existing state
//! - `unset`: names a producer should clear
//!
//! Within a bucket the last write per key wins.

use indexmap::{IndexMap, IndexSet};
use serde::Serialize;
use serde_json::Value;

/// The three option buckets of a completion.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Options {
    pub set: IndexMap<String, Value>,
    pub append: IndexMap<String, Value>,
    pub unset: IndexSet<String>,
}

/// Everything recorded for a single option name across the buckets.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct OptionEntry {
    pub set: Option<Value>,
    pub append: Option<Value>,
    pub unset: bool,
}

impl OptionEntry {
    /// True if no bucket mentions the option.
    pub fn is_empty(&self) -> bool {
        self.set.is_none() && self.append.is_none() && !self.unset
    }
}

impl Options {
    /// Create buckets with `defaults` pre-loaded into `set`.
    pub fn with_defaults(defaults: IndexMap<String, Value>) -> Self {
        Self {
            set: defaults,
            ..Self::default()
        }
    }

    /// Collect what each bucket holds for `name`.
    pub fn entry(&self, name: &str) -> OptionEntry {
        OptionEntry {
            set: self.set.get(name).cloned(),
            append: self.append.get(name).cloned(),
            unset: self.unset.contains(name),
        }
    }
}

/// A setter installed on a completion under a method-like name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Setter {
    /// Writes a boolean flag. `enable` distinguishes `setX` from `resetX`.
    Flag { option: String, enable: bool },

    /// Writes its argument straight into the `set` bucket.
    Explicit { option: String },
}

impl Setter {
    pub(crate) fn apply(&self, options: &mut Options, arg: Option<Value>) {
        match self {
            Setter::Flag { option, enable: true } => {
                let value = arg.as_ref().map_or(true, truthy);
                options.set.insert(option.clone(), Value::Bool(value));
            }
            Setter::Flag { option, enable: false } => {
                let value = arg.as_ref().map_or(false, |v| !truthy(v));
                options.set.insert(option.clone(), Value::Bool(value));
            }
            Setter::Explicit { option } => {
                options
                    .set
                    .insert(option.clone(), arg.unwrap_or(Value::Null));
            }
        }
    }
}

/// Default setter name for a flag: `verbose` becomes `setVerbose`.
pub(crate) fn flag_setter_name(prefix: &str, option: &str) -> String {
    let mut chars = option.chars();
    match chars.next() {
        Some(first) => format!("{prefix}{}{}", first.to_uppercase(), chars.as_str()),
        None => prefix.to_owned(),
    }
}

/// Truthiness of a JSON value.
pub(crate) fn truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map_or(true, |f| f != 0.0 && !f.is_nan()),
        Value::String(s) => !s.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}
