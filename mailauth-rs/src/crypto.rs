//! Bounded pool for signature operations
//!
//! RSA signing and verification are CPU heavy. They run on the blocking
//! thread pool, and a semaphore caps how many run at once.

use std::sync::Arc;
use tokio::sync::Semaphore;
use tracing::debug;

use crate::error::{AuthError, Result};

#[derive(Clone)]
pub struct CryptoPool {
    permits: Arc<Semaphore>,
    size: usize,
}

impl CryptoPool {
    pub fn new(size: usize) -> Self {
        let size = size.max(1);
        Self {
            permits: Arc::new(Semaphore::new(size)),
            size,
        }
    }

    /// Run `op` on the blocking pool once a permit is available
    pub async fn run<F, R>(&self, op: F) -> Result<R>
    where
        F: FnOnce() -> R + Send + 'static,
        R: Send + 'static,
    {
        let permit = Arc::clone(&self.permits)
            .acquire_owned()
            .await
            .map_err(|e| AuthError::Crypto(format!("crypto pool closed: {}", e)))?;

        debug!(
            "Crypto permit acquired ({} of {} free)",
            self.permits.available_permits(),
            self.size
        );

        tokio::task::spawn_blocking(move || {
            let result = op();
            drop(permit);
            result
        })
        .await
        .map_err(|e| AuthError::Crypto(format!("crypto task failed: {}", e)))
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn available(&self) -> usize {
        self.permits.available_permits()
    }
}

impl Default for CryptoPool {
    fn default() -> Self {
        Self::new(4)
    }
}
