//! Environment variable substitution for configuration files
//!
//! `${NAME}` is replaced by the value of `NAME`; `${NAME:-fallback}` uses
//! `fallback` when `NAME` is unset. Any other `$` text is left alone.

use once_cell::sync::Lazy;
use regex::{Captures, Regex};
use std::env;

use crate::config::ConfigError;

static ENV_VAR_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)(?::-([^}]*))?\}").expect("valid env var pattern")
});

/// Substitute environment variable references in `input`
///
/// Fails listing every referenced variable that is unset and has no
/// fallback.
pub fn substitute_env_vars(input: &str) -> Result<String, ConfigError> {
    substitute_with(input, |name| env::var(name).ok())
}

fn substitute_with<L>(input: &str, lookup: L) -> Result<String, ConfigError>
where
    L: Fn(&str) -> Option<String>,
{
    let mut missing: Vec<String> = Vec::new();

    let output = ENV_VAR_PATTERN.replace_all(input, |caps: &Captures<'_>| {
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
    Ok(output.into_owned())
}
