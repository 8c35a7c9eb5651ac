//! Environment variable interpolation for config files.
//!
//! Recognized forms:
//! - `$VAR` and `${VAR}` substitute the value, missing variables are errors
//! - `${VAR:-fallback}` uses the fallback when VAR is unset or empty
//! - `${VAR-fallback}` uses the fallback only when VAR is unset
//! - `$$` is a literal `$`

use std::sync::LazyLock;

use regex::{Captures, Regex};

static VARIABLE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?x)
        \$\$
        | \$\{ (?P<braced>[A-Za-z_][A-Za-z0-9_]*) (?: (?P<op>:?-) (?P<fallback>[^}]*) )? \}
        | \$ (?P<bare>[A-Za-z_][A-Za-z0-9_]*)
        ",
    )
    .expect("variable pattern is valid")
});

/// Outcome of interpolating a config document.
#[derive(Debug)]
pub struct InterpolationResult {
    /// Text with every resolvable reference substituted.
    pub text: String,
    /// One message per unresolvable reference.
    pub errors: Vec<String>,
}

impl InterpolationResult {
    pub fn is_ok(&self) -> bool {
        self.errors.is_empty()
    }
}

/// Interpolate against the process environment.
pub fn interpolate(input: &str) -> InterpolationResult {
    interpolate_with(input, |name| std::env::var(name).ok())
}

/// Interpolate using `lookup` to resolve variable names.
///
/// Errors are collected rather than returned early so a config with several
/// missing variables reports all of them at once.
pub fn interpolate_with<F>(input: &str, lookup: F) -> InterpolationResult
where
    F: Fn(&str) -> Option<String>,
{
    let mut errors = Vec::new();

    let text = VARIABLE
        .replace_all(input, |caps: &Captures| {
            let whole = &caps[0];
            if whole == "$$" {
                return "$".to_string();
            }

            let name = caps
                .name("braced")
                .or_else(|| caps.name("bare"))
                .map_or("", |m| m.as_str());
            let op = caps.name("op").map(|m| m.as_str());
            let fallback = caps.name("fallback").map_or("", |m| m.as_str());

            match (lookup(name), op) {
                (Some(value), _) if value.contains(['\n', '\r']) => {
                    errors.push(format!("environment variable '{name}' contains a newline"));
                    whole.to_string()
                }
                (Some(value), Some(":-")) if value.is_empty() => fallback.to_string(),
                (Some(value), _) => value,
                (None, Some(_)) => fallback.to_string(),
                (None, None) => {
                    errors.push(format!("environment variable '{name}' is not set"));
                    whole.to_string()
                }
            }
        })
        .into_owned();

    InterpolationResult { text, errors }
}
