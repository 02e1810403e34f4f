//! Layered configuration trees
//!
//! A configuration is an ordered YAML mapping built up by successive overlay
//! operations: defaults first, then suite-level config, then resource-specific
//! config, then computed values last (so computed values always win).

pub mod tables;

use serde_yaml::{Mapping, Value};

use crate::errors::{HarnessError, Result};

/// Recursively merge `patch` into `base`.
///
/// For every key in `patch`: if both sides are mappings, recurse; otherwise
/// the patch value replaces the base value (lists are replaced wholesale,
/// never concatenated). Keys only present in `base` survive untouched.
///
/// Both `base` and `patch` must be mappings at the root; anything else is a
/// caller contract violation and panics.
pub fn overlay(base: &mut Value, patch: &Value) {
    let (Value::Mapping(base_map), Value::Mapping(patch_map)) = (base, patch) else {
        panic!("overlay: both base and patch must be mappings");
    };

    for (key, patch_val) in patch_map {
        match base_map.get_mut(key) {
            Some(base_val) if base_val.is_mapping() && patch_val.is_mapping() => {
                overlay(base_val, patch_val);
            }
            Some(base_val) => *base_val = patch_val.clone(),
            None => {
                base_map.insert(key.clone(), patch_val.clone());
            }
        }
    }
}

/// Overlay `value` into `base` under the nested key `path`.
///
/// `overlay_at(&mut v, &["epc", "hss", "subscribers"], subs)` is shorthand for
/// overlaying `{epc: {hss: {subscribers: subs}}}`.
pub fn overlay_at(base: &mut Value, path: &[&str], value: Value) {
    let mut patch = value;
    for key in path.iter().rev() {
        let mut wrap = Mapping::new();
        wrap.insert(Value::String((*key).to_string()), patch);
        patch = Value::Mapping(wrap);
    }
    overlay(base, &patch);
}

/// Empty mapping value, the usual starting point for an overlay stack.
pub fn empty() -> Value {
    Value::Mapping(Mapping::new())
}

/// Walk a nested mapping by key path.
pub fn get_path<'a>(tree: &'a Value, path: &[&str]) -> Option<&'a Value> {
    let mut cur = tree;
    for key in path {
        cur = cur.get(*key)?;
    }
    Some(cur)
}

/// String value at a nested key path.
pub fn get_str<'a>(tree: &'a Value, path: &[&str]) -> Option<&'a str> {
    get_path(tree, path).and_then(Value::as_str)
}

/// Parse a configuration boolean, which arrives as the string "true"/"false".
pub fn str2bool(s: &str) -> bool {
    s.eq_ignore_ascii_case("true")
}

/// Render a scalar config value as the string form templates expect.
pub fn scalar_to_string(value: &Value) -> Result<String> {
    match value {
        Value::String(s) => Ok(s.clone()),
        Value::Bool(b) => Ok(b.to_string()),
        Value::Number(n) => Ok(n.to_string()),
        Value::Null => Ok(String::new()),
        other => Err(HarnessError::Config(format!(
            "expected scalar config value, got {:?}",
            other
        ))),
    }
}
