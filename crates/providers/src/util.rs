//! Shared utility functions for provider adapters.

use rb_domain::error::{Error, Result};

/// Convert a [`reqwest::Error`] into the domain [`Error`] type.
///
/// Timeout errors map to [`Error::Timeout`]; everything else maps to
/// [`Error::Http`].
pub(crate) fn from_reqwest(e: reqwest::Error) -> Error {
    if e.is_timeout() {
        Error::Timeout(e.to_string())
    } else {
        Error::Http(e.to_string())
    }
}

/// Resolve the API key from the configured environment variable.
///
/// `None` means the provider needs no key (local servers).  A configured
/// but unset variable is an error so a typo does not silently send
/// unauthenticated requests.
pub(crate) fn resolve_api_key(env_var: Option<&str>) -> Result<Option<String>> {
    let Some(var) = env_var else {
        return Ok(None);
    };
    match std::env::var(var) {
        Ok(key) if !key.trim().is_empty() => Ok(Some(key)),
        _ => Err(Error::Config(format!(
            "environment variable '{var}' not set or empty"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_env_var_means_no_key() {
        assert!(resolve_api_key(None).unwrap().is_none());
    }

    #[test]
    fn env_var_is_read() {
        let var = "RB_TEST_RESOLVE_KEY_4411";
        std::env::set_var(var, "sk-test");
        assert_eq!(resolve_api_key(Some(var)).unwrap().as_deref(), Some("sk-test"));
        std::env::remove_var(var);
    }

    #[test]
    fn missing_env_var_is_an_error() {
        let err = resolve_api_key(Some("RB_TEST_MISSING_KEY_9090")).unwrap_err();
        assert!(err.to_string().contains("RB_TEST_MISSING_KEY_9090"));
    }
}
