//! `${VAR}` substitution in config string values.
//!
//! Only upper-case `[A-Z_][A-Z0-9_]*` names are recognised. `$${VAR}` is an
//! escape for a literal `${VAR}`.

use std::collections::HashMap;

use anyhow::Result;
use once_cell::sync::Lazy;
use regex::{Captures, Regex};
use serde_json::Value;

/// `$${NAME}` (escape) or `${NAME}` (reference).
static REFERENCE_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(\$)?\$\{([A-Z_][A-Z0-9_]*)\}").expect("static regex"));

#[derive(Debug, thiserror::Error)]
#[error("missing env var \"{var_name}\" referenced at config path: {config_path}")]
pub struct MissingEnvVarError {
    pub var_name: String,
    pub config_path: String,
}

/// Substitute references throughout a parsed config tree from the process
/// environment.
pub fn resolve_env_vars(value: &Value) -> Result<Value> {
    resolve_env_vars_with(value, &std::env::vars().collect())
}

/// Substitute references from the given map. Unset or empty variables are
/// an error naming the config path of the offending string.
pub fn resolve_env_vars_with(value: &Value, env: &HashMap<String, String>) -> Result<Value> {
    Ok(substitute_value(value, env, "")?)
}

fn substitute_value(
    value: &Value,
    env: &HashMap<String, String>,
    path: &str,
) -> Result<Value, MissingEnvVarError> {
    match value {
        Value::String(s) => Ok(Value::String(substitute_string(s, env, path)?)),
        Value::Array(items) => items
            .iter()
            .enumerate()
            .map(|(i, v)| substitute_value(v, env, &format!("{path}[{i}]")))
            .collect::<Result<Vec<_>, _>>()
            .map(Value::Array),
        Value::Object(map) => {
            let mut out = serde_json::Map::with_capacity(map.len());
            for (key, v) in map {
                let child = if path.is_empty() {
                    key.clone()
                } else {
                    format!("{path}.{key}")
                };
                out.insert(key.clone(), substitute_value(v, env, &child)?);
            }
            Ok(Value::Object(out))
        }
        other => Ok(other.clone()),
    }
}

fn substitute_string(
    s: &str,
    env: &HashMap<String, String>,
    path: &str,
) -> Result<String, MissingEnvVarError> {
    if !s.contains("${") {
        return Ok(s.to_string());
    }
    let mut missing = None;
    let replaced = REFERENCE_PATTERN.replace_all(s, |caps: &Captures| {
        let name = &caps[2];
        if caps.get(1).is_some() {
            return format!("${{{name}}}");
        }
        match env.get(name) {
            Some(v) if !v.is_empty() => v.clone(),
            _ => {
                missing.get_or_insert_with(|| MissingEnvVarError {
                    var_name: name.to_string(),
                    config_path: path.to_string(),
                });
                String::new()
            }
        }
    });
    match missing {
        Some(err) => Err(err),
        None => Ok(replaced.into_owned()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn env(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn substitutes_nested_and_array_values() {
        let value = json!({
            "store": {"path": "${DATA_DIR}/equaforge.db"},
            "model": {"args": ["--weights", "${WEIGHTS}"]},
            "training": {"min_train_batch_size": 4}
        });
        let env = env(&[("DATA_DIR", "/srv"), ("WEIGHTS", "w.pth")]);
        let out = resolve_env_vars_with(&value, &env).unwrap();
        assert_eq!(out["store"]["path"], "/srv/equaforge.db");
        assert_eq!(out["model"]["args"][1], "w.pth");
        assert_eq!(out["training"]["min_train_batch_size"], 4);
    }

    #[test]
    fn missing_var_names_the_config_path() {
        let value = json!({"model": {"args": ["${NOPE}"]}});
        let err = resolve_env_vars_with(&value, &HashMap::new()).unwrap_err();
        let text = err.to_string();
        assert!(text.contains("NOPE"));
        assert!(text.contains("model.args[0]"));
    }

    #[test]
    fn empty_var_counts_as_missing() {
        let value = json!({"a": "${EMPTY}"});
        assert!(resolve_env_vars_with(&value, &env(&[("EMPTY", "")])).is_err());
    }

    #[test]
    fn escaped_reference_is_literal() {
        let value = json!({"a": "$${HOME} and ${USER_NAME}"});
        let out = resolve_env_vars_with(&value, &env(&[("USER_NAME", "ada")])).unwrap();
        assert_eq!(out["a"], "${HOME} and ada");
    }

    #[test]
    fn lowercase_and_plain_strings_pass_through() {
        let value = json!({"a": "${lower}", "b": "cost $5"});
        let out = resolve_env_vars_with(&value, &HashMap::new()).unwrap();
        assert_eq!(out["a"], "${lower}");
        assert_eq!(out["b"], "cost $5");
    }
}
