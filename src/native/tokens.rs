use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::core::errors::EvaluatorError;

/// Bounded pool of concurrency slot ids `0..size`. The id is exported to the
/// target so that concurrent runs can tell each other apart.
#[derive(Debug, Clone)]
pub struct TokenPool {
    inner: Arc<TokenPoolInner>,
}

#[derive(Debug)]
struct TokenPoolInner {
    semaphore: Arc<Semaphore>,
    free: Mutex<Vec<usize>>,
}

impl TokenPool {
    pub fn new(size: usize) -> Self {
        Self {
            inner: Arc::new(TokenPoolInner {
                semaphore: Arc::new(Semaphore::new(size)),
                free: Mutex::new((0..size).rev().collect()),
            }),
        }
    }

    pub async fn acquire(&self) -> Result<SlotToken, EvaluatorError> {
        let permit = self
            .inner
            .semaphore
            .clone()
            .acquire_owned()
            .await
            .map_err(|e| EvaluatorError::Internal { msg: e.to_string() })?;

        let id = self
            .inner
            .free
            .lock()
            .pop()
            .ok_or_else(|| EvaluatorError::Internal {
                msg: "slot token pool is empty despite an acquired permit".to_string(),
            })?;

        Ok(SlotToken {
            id,
            pool: self.inner.clone(),
            _permit: permit,
        })
    }

    pub fn available(&self) -> usize {
        self.inner.semaphore.available_permits()
    }
}

/// A held slot. The id goes back to the pool when the token is dropped.
#[derive(Debug)]
pub struct SlotToken {
    id: usize,
    pool: Arc<TokenPoolInner>,
    _permit: OwnedSemaphorePermit,
}

impl SlotToken {
    pub fn id(&self) -> usize {
        self.id
    }
}

impl Drop for SlotToken {
    fn drop(&mut self) {
        self.pool.free.lock().push(self.id);
    }
}
