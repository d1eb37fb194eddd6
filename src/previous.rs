use crate::error::Result;
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::OnceCell;

/// Snapshot of an image as it was persisted when first asked for.
///
/// The fetch runs at most once per instance, however many call sites
/// trigger it and however many of them race. Its outcome, value or error,
/// is stored and handed back to every later caller; a failed fetch is not
/// retried. [`PreviousImage::reset`] is the only way to take a new snapshot.
pub struct PreviousImage<T> {
    cell: OnceCell<Result<Arc<T>>>,
    fetches: AtomicUsize,
}

impl<T> PreviousImage<T> {
    pub fn new() -> Self {
        Self {
            cell: OnceCell::new(),
            fetches: AtomicUsize::new(0),
        }
    }

    /// Run `fetch` if no snapshot has been taken yet, otherwise return the
    /// stored outcome.
    pub async fn ensure_loaded<F, Fut>(&self, fetch: F) -> Result<Arc<T>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.cell
            .get_or_init(|| async move {
                self.fetches.fetch_add(1, Ordering::SeqCst);
                fetch().await.map(Arc::new)
            })
            .await
            .clone()
    }

    /// Whether the fetch has completed, successfully or not
    pub fn is_fetched(&self) -> bool {
        self.cell.initialized()
    }

    /// The stored snapshot, if the fetch has completed successfully
    pub fn get(&self) -> Option<Arc<T>> {
        match self.cell.get() {
            Some(Ok(value)) => Some(value.clone()),
            _ => None,
        }
    }

    /// Number of fetches started over this instance's lifetime
    pub fn fetch_count(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }

    /// Drop the stored outcome so the next access fetches again
    pub fn reset(&mut self) -> Option<Result<Arc<T>>> {
        self.cell.take()
    }
}

impl<T> Default for PreviousImage<T> {
    fn default() -> Self {
        Self::new()
    }
}
