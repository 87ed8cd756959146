use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use crate::error::{KitchenError, KitchenResult};

type EndCallback = Box<dyn FnOnce() + Send>;

struct OperationInner {
    token: CancellationToken,
    end_callbacks: Mutex<Vec<EndCallback>>,
    ended: AtomicBool,
}

/// Cancellation scope for a cook, a request or a whole build.
///
/// Cloning shares the scope. End callbacks run once, on `end()` or when the last
/// [`OperationGuard`] drops, whether the work succeeded, failed or was aborted.
#[derive(Clone)]
pub struct Operation {
    inner: Arc<OperationInner>,
}

impl Default for Operation {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Operation")
            .field("aborted", &self.is_aborted())
            .field("ended", &self.inner.ended.load(Ordering::SeqCst))
            .finish()
    }
}

impl Operation {
    pub fn new() -> Self {
        Self::with_token(CancellationToken::new())
    }

    fn with_token(token: CancellationToken) -> Self {
        Self {
            inner: Arc::new(OperationInner {
                token,
                end_callbacks: Mutex::new(Vec::new()),
                ended: AtomicBool::new(false),
            }),
        }
    }

    /// Scope aborted together with this one, but abortable on its own.
    pub fn child(&self) -> Self {
        Self::with_token(self.inner.token.child_token())
    }

    pub fn abort(&self) {
        self.inner.token.cancel();
    }

    pub fn is_aborted(&self) -> bool {
        self.inner.token.is_cancelled()
    }

    pub fn throw_if_aborted(&self) -> KitchenResult<()> {
        if self.is_aborted() {
            Err(KitchenError::Aborted)
        } else {
            Ok(())
        }
    }

    pub fn token(&self) -> &CancellationToken {
        &self.inner.token
    }

    /// Race `future` against abortion.
    pub async fn run<T>(&self, future: impl Future<Output = KitchenResult<T>>) -> KitchenResult<T> {
        tokio::select! {
            biased;
            _ = self.inner.token.cancelled() => Err(KitchenError::Aborted),
            result = future => result,
        }
    }

    pub fn add_end_callback(&self, callback: impl FnOnce() + Send + 'static) {
        if self.inner.ended.load(Ordering::SeqCst) {
            callback();
            return;
        }
        self.inner.end_callbacks.lock().push(Box::new(callback));
    }

    /// Run end callbacks. Later calls are no-ops.
    pub fn end(&self) {
        if self.inner.ended.swap(true, Ordering::SeqCst) {
            return;
        }
        let callbacks = std::mem::take(&mut *self.inner.end_callbacks.lock());
        for callback in callbacks {
            callback();
        }
    }

    /// Guard ending the operation when dropped.
    pub fn guard(&self) -> OperationGuard {
        OperationGuard(self.clone())
    }
}

pub struct OperationGuard(Operation);

impl Drop for OperationGuard {
    fn drop(&mut self) {
        self.0.end();
    }
}
