//! Environment variable expansion for the configuration file
//!
//! References use `${NAME}` or `${NAME:-fallback}`. A reference without a
//! fallback whose variable is unset is an error; every such variable is
//! reported at once so a broken deployment can be fixed in one pass.

use once_cell::sync::Lazy;
use regex::{Captures, Regex};
use std::env;

use crate::config::ConfigError;

static REFERENCE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)(?::-([^}]*))?\}").expect("valid env pattern")
});

/// Expand `${NAME}` and `${NAME:-fallback}` references in `input`.
pub fn expand(input: &str) -> Result<String, ConfigError> {
    expand_with(input, |name| env::var(name).ok())
}

/// Expand references using `lookup` instead of the process environment.
pub fn expand_with<F>(input: &str, lookup: F) -> Result<String, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    let mut missing: Vec<String> = Vec::new();

    let expanded = REFERENCE.replace_all(input, |caps: &Captures| {
        let name = &caps[1];
        match (lookup(name), caps.get(2)) {
            (Some(value), _) => value,
            (None, Some(fallback)) => fallback.as_str().to_string(),
            (None, None) => {
                if !missing.iter().any(|m| m == name) {
                    missing.push(name.to_string());
                }
                String::new()
            }
        }
    });

    if !missing.is_empty() {
        return Err(ConfigError::ValidationError(format!(
            "Missing environment variables: {}",
            missing.join(", ")
        )));
    }

    Ok(expanded.into_owned())
}

/// Interpret a boolean-ish environment flag such as `DEBUG=1` or `DEBUG=true`
pub fn flag_enabled(name: &str) -> bool {
    env::var(name)
        .map(|v| matches!(v.trim().to_ascii_lowercase().as_str(), "1" | "t" | "true" | "yes" | "on"))
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn vars(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_plain_text_untouched() {
        let env = vars(&[]);
        let out = expand_with("base_path: /mnt", |n| env.get(n).cloned()).unwrap();
        assert_eq!(out, "base_path: /mnt");
    }

    #[test]
    fn test_reference_replaced() {
        let env = vars(&[("PLUGIN_ROOT", "/var/lib/sshfs")]);
        let out = expand_with("base_path: ${PLUGIN_ROOT}/data", |n| env.get(n).cloned()).unwrap();
        assert_eq!(out, "base_path: /var/lib/sshfs/data");
    }

    #[test]
    fn test_fallback_used_when_unset() {
        let env = vars(&[]);
        let out = expand_with("scope: ${SCOPE:-local}", |n| env.get(n).cloned()).unwrap();
        assert_eq!(out, "scope: local");
    }

    #[test]
    fn test_value_wins_over_fallback() {
        let env = vars(&[("SCOPE", "global")]);
        let out = expand_with("scope: ${SCOPE:-local}", |n| env.get(n).cloned()).unwrap();
        assert_eq!(out, "scope: global");
    }

    #[test]
    fn test_empty_fallback_allowed() {
        let env = vars(&[]);
        let out = expand_with("x${NOPE:-}y", |n| env.get(n).cloned()).unwrap();
        assert_eq!(out, "xy");
    }

    #[test]
    fn test_missing_reported_once_each() {
        let env = vars(&[]);
        let err = expand_with("${A_MISSING} ${B_MISSING} ${A_MISSING}", |n| env.get(n).cloned())
            .unwrap_err()
            .to_string();
        assert!(err.contains("A_MISSING, B_MISSING"), "{}", err);
    }

    #[test]
    fn test_bare_dollar_not_expanded() {
        let env = vars(&[("VAR", "x")]);
        let out = expand_with("$VAR {VAR}", |n| env.get(n).cloned()).unwrap();
        assert_eq!(out, "$VAR {VAR}");
    }
}
