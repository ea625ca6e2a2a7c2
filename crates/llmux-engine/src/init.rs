//! Lazy, idempotent adapter initialization.
//!
//! Credentials and endpoints are validated the first time an adapter is
//! used.  The outcome is cached either way: a misconfigured adapter keeps
//! reporting the same configuration error without re-reading anything.

use std::sync::{Arc, OnceLock};

use crate::error::{EngineError, Result};

#[derive(Debug, Clone)]
struct ConfigFailure {
    provider: String,
    message: String,
}

/// A value built at most once, success or failure.
#[derive(Debug)]
pub struct LazyInit<T> {
    cell: OnceLock<std::result::Result<Arc<T>, ConfigFailure>>,
}

impl<T> Default for LazyInit<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> LazyInit<T> {
    pub const fn new() -> Self {
        Self {
            cell: OnceLock::new(),
        }
    }

    /// Run `init` on first use and return the cached outcome afterwards.
    ///
    /// Errors other than [`EngineError::Config`] are cached as configuration
    /// errors for `provider`.
    pub fn get_or_init<F>(&self, provider: &str, init: F) -> Result<Arc<T>>
    where
        F: FnOnce() -> Result<T>,
    {
        let outcome = self.cell.get_or_init(|| {
            init().map(Arc::new).map_err(|e| match e {
                EngineError::Config { provider, message } => ConfigFailure { provider, message },
                other => ConfigFailure {
                    provider: provider.to_owned(),
                    message: other.to_string(),
                },
            })
        });

        match outcome {
            Ok(value) => Ok(Arc::clone(value)),
            Err(failure) => Err(EngineError::config(&failure.provider, failure.message.clone())),
        }
    }

    pub fn is_initialized(&self) -> bool {
        self.cell.get().is_some()
    }
}
