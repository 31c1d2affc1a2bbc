//! Environment variable interpolation for config files.
//!
//! Supported syntax:
//! - `$VAR` or `${VAR}`: value of VAR, error if unset
//! - `${VAR:-default}`: default if VAR is unset or empty
//! - `${VAR-default}`: default only if VAR is unset
//! - `$$`: a literal `$`

use regex::{Captures, Regex};
use std::env;
use std::sync::LazyLock;

use crate::error::{ConfigError, EnvInterpolationSnafu};

static ENV_VAR_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?x)
        \$\$                                   # escaped dollar
        |
        \$\{ ([A-Za-z_][A-Za-z0-9_]*)          # ${NAME (1)
             (?: (:?-) ([^}]*) )?              # optional :- or - (2) and default (3)
        \}
        |
        \$([A-Za-z_][A-Za-z0-9_]*)             # $NAME (4)
        ",
    )
    .expect("env var pattern is valid")
});

/// Substitute environment variables in `input`.
///
/// Every unresolved variable is reported, not just the first.
pub fn interpolate(input: &str) -> Result<String, ConfigError> {
    let mut errors = Vec::new();
    let text = ENV_VAR_PATTERN
        .replace_all(input, |caps: &Captures| substitute(caps, &mut errors))
        .into_owned();

    if errors.is_empty() {
        Ok(text)
    } else {
        EnvInterpolationSnafu {
            message: errors.join("\n"),
        }
        .fail()
    }
}

fn substitute(caps: &Captures, errors: &mut Vec<String>) -> String {
    let whole = caps.get(0).map(|m| m.as_str()).unwrap_or_default();
    if whole == "$$" {
        return "$".to_string();
    }

    let Some(name) = caps.get(1).or_else(|| caps.get(4)).map(|m| m.as_str()) else {
        return whole.to_string();
    };
    let empty_uses_default = caps.get(2).is_some_and(|m| m.as_str() == ":-");
    let default = caps.get(3).map(|m| m.as_str());

    match env::var(name) {
        Ok(value) if value.contains(['\n', '\r']) => {
            errors.push(format!(
                "environment variable '{name}' contains newlines, which is not allowed"
            ));
            whole.to_string()
        }
        Ok(value) if value.is_empty() && empty_uses_default => {
            default.unwrap_or_default().to_string()
        }
        Ok(value) => value,
        Err(_) => match default {
            Some(default) => default.to_string(),
            None => {
                errors.push(format!("environment variable '{name}' is not set"));
                whole.to_string()
            }
        },
    }
}
