/// Runs a closure when dropped, unless it was [defused](Self::defuse) first.
///
/// The closure also runs when the owner is torn down by a panic, which makes this suitable for
/// cleaning up shared state that a half-finished computation would otherwise leave behind.
pub struct CallOnDrop {
    f: Option<Box<dyn FnOnce() + Send + 'static>>,
}

impl CallOnDrop {
    /// Creates a new `CallOnDrop`.
    pub fn new<F: FnOnce() + Send + 'static>(f: F) -> CallOnDrop {
        CallOnDrop {
            f: Some(Box::new(f)),
        }
    }

    /// Drops the closure without running it.
    pub fn defuse(mut self) {
        self.f = None;
    }
}

impl Drop for CallOnDrop {
    fn drop(&mut self) {
        if let Some(f) = self.f.take() {
            f();
        }
    }
}

impl std::fmt::Debug for CallOnDrop {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallOnDrop")
            .field("armed", &self.f.is_some())
            .finish()
    }
}
