//! Cleanup of interrupted multipart uploads.

/// Runs an abort action when dropped, unless the upload was completed first.
///
/// A caller cancelling an upload drops its future; the guard goes with it and
/// the abort still runs.
pub(crate) struct AbortOnDrop<F: FnOnce()> {
    abort: Option<F>,
}

impl<F: FnOnce()> AbortOnDrop<F> {
    pub(crate) fn new(abort: F) -> Self {
        Self { abort: Some(abort) }
    }

    /// Marks the upload complete.
    pub(crate) fn disarm(mut self) {
        self.abort = None;
    }
}

impl<F: FnOnce()> Drop for AbortOnDrop<F> {
    fn drop(&mut self) {
        if let Some(abort) = self.abort.take() {
            abort();
        }
    }
}
