//! Small env-var accessors shared by the config module.

use std::str::FromStr;

use crate::error::ConfigError;

/// Read an optional env var, treating empty/whitespace values as unset.
pub(crate) fn optional_env(key: &str) -> Result<Option<String>, ConfigError> {
    match std::env::var(key) {
        Ok(value) => {
            let trimmed = value.trim();
            if trimmed.is_empty() {
                Ok(None)
            } else {
                Ok(Some(trimmed.to_string()))
            }
        }
        Err(std::env::VarError::NotPresent) => Ok(None),
        Err(std::env::VarError::NotUnicode(_)) => {
            Err(ConfigError::NonUnicodeEnvVar(key.to_string()))
        }
    }
}

/// Read and parse an optional env var into `T`.
pub(crate) fn parsed_env<T>(key: &str) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match optional_env(key)? {
        Some(raw) => raw
            .parse::<T>()
            .map(Some)
            .map_err(|e| ConfigError::InvalidValue {
                key: key.to_string(),
                message: e.to_string(),
            }),
        None => Ok(None),
    }
}

/// Normalize a config enum variant: trim, lowercase, dashes to underscores.
pub(crate) fn normalize_variant(value: &str) -> String {
    value.trim().to_ascii_lowercase().replace('-', "_")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_handles_case_and_dashes() {
        assert_eq!(normalize_variant(" K8s-Cluster "), "k8s_cluster");
    }

    #[test]
    fn parsed_env_reports_key_on_failure() {
        // Env access in tests is process-global, so use a key nothing else sets.
        unsafe { std::env::set_var("AEGIS_TEST_PARSED_ENV", "not-a-number") };
        let err = parsed_env::<u16>("AEGIS_TEST_PARSED_ENV").unwrap_err();
        match err {
            ConfigError::InvalidValue { key, .. } => assert_eq!(key, "AEGIS_TEST_PARSED_ENV"),
            other => panic!("unexpected error: {other}"),
        }
        unsafe { std::env::remove_var("AEGIS_TEST_PARSED_ENV") };
    }
}
