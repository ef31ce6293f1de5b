use crate::error::{Error, Result};
use regex::{Captures, Regex};
use serde::Deserialize;
use std::env;
use std::fmt;
use std::sync::LazyLock;

static ENV_PLACEHOLDER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\$\{([^}]+)}")
        .expect("env placeholder pattern is valid")
});

/// Wrapper for secret strings (e.g., passwords) that prints a "<REDACTED, length {length of the secret}>" string for Debug/Display.
///
/// The stored value is kept verbatim, placeholders included. Call [`SecretString::expand`]
/// right before use so that rotated environment values take effect without a restart.
#[derive(Deserialize, Clone, PartialEq, Eq)]
#[serde(transparent)]
pub struct SecretString(String);

impl SecretString {
    pub fn new(s: impl Into<String>) -> Self {
        SecretString(s.into())
    }

    /// Access the raw secret if explicitly needed
    pub fn expose_secret(&self) -> &str {
        &self.0
    }

    /// Resolves `${VAR}` placeholders against the current environment. A bare `$` is kept literally.
    pub fn expand(&self) -> Result<SecretString> {
        expand_env_vars(&self.0).map(SecretString)
    }

    fn fmt_redacted_secret(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<REDACTED, length {}>", self.0.len())
    }
}

impl fmt::Debug for SecretString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.fmt_redacted_secret(f)
    }
}

impl fmt::Display for SecretString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.fmt_redacted_secret(f)
    }
}

/// Replaces `${VAR}` placeholders with environment variable values.
/// Returns [`Error::MissingEnvVar`] naming the first variable that is not set.
pub fn expand_env_vars(input: &str) -> Result<String> {
    let mut missing = None;
    let expanded = ENV_PLACEHOLDER.replace_all(input, |caps: &Captures| {
        let var_name = &caps[1];
        match env::var(var_name) {
            Ok(value) => value,
            Err(_) => {
                if missing.is_none() {
                    missing = Some(var_name.to_string());
                }
                String::new()
            }
        }
    });

    match missing {
        Some(variable) => Err(Error::MissingEnvVar { variable }),
        None => Ok(expanded.into_owned()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_secret_is_redacted() {
        let secret = SecretString::new("hunter2");
        assert_eq!(format!("{}", secret), "<REDACTED, length 7>");
        assert_eq!(format!("{:?}", secret), "<REDACTED, length 7>");
        assert_eq!(secret.expose_secret(), "hunter2");
    }

    #[test]
    fn test_expand_env_vars_braced() {
        unsafe {
            env::set_var("SECRET_STRING_TEST_BRACED", "value123");
        }
        let expanded = expand_env_vars("token: ${SECRET_STRING_TEST_BRACED}").unwrap();
        assert_eq!(expanded, "token: value123");
        unsafe {
            env::remove_var("SECRET_STRING_TEST_BRACED");
        }
    }

    #[test]
    fn test_expand_env_vars_multiple() {
        unsafe {
            env::set_var("SECRET_STRING_TEST_A", "foo");
            env::set_var("SECRET_STRING_TEST_B", "bar");
        }
        let expanded =
            expand_env_vars("${SECRET_STRING_TEST_A} and ${SECRET_STRING_TEST_B}").unwrap();
        assert_eq!(expanded, "foo and bar");
        unsafe {
            env::remove_var("SECRET_STRING_TEST_A");
            env::remove_var("SECRET_STRING_TEST_B");
        }
    }

    #[test]
    fn test_expand_env_vars_keeps_literal_dollar() {
        assert_eq!(expand_env_vars("robot$ci").unwrap(), "robot$ci");
        assert_eq!(expand_env_vars("pa$$word$").unwrap(), "pa$$word$");

        let secret = SecretString::new("robot$HOME");
        assert_eq!(secret.expand().unwrap().expose_secret(), "robot$HOME");
    }

    #[test]
    fn test_expand_env_vars_missing_var() {
        let err = expand_env_vars("${SECRET_STRING_TEST_MISSING}").unwrap_err();
        match err {
            Error::MissingEnvVar { variable } => {
                assert_eq!(variable, "SECRET_STRING_TEST_MISSING")
            }
            other => panic!("unexpected error {:?}", other),
        }
    }

    #[test]
    fn test_expand_env_vars_no_vars() {
        let input = "No variables here";
        assert_eq!(expand_env_vars(input).unwrap(), input);
    }

    #[test]
    fn test_expand_reads_environment_at_call_time() {
        let secret = SecretString::new("${SECRET_STRING_TEST_ROTATED}");
        unsafe {
            env::set_var("SECRET_STRING_TEST_ROTATED", "first");
        }
        assert_eq!(secret.expand().unwrap().expose_secret(), "first");
        unsafe {
            env::set_var("SECRET_STRING_TEST_ROTATED", "second");
        }
        assert_eq!(secret.expand().unwrap().expose_secret(), "second");
        assert_eq!(secret.expose_secret(), "${SECRET_STRING_TEST_ROTATED}");
        unsafe {
            env::remove_var("SECRET_STRING_TEST_ROTATED");
        }
    }
}
