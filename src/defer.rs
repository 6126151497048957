/// Runs its closure once when dropped, including when the enclosing future
/// is cancelled mid-await. Counters the pool bumps on entry are undone
/// through this.
pub(crate) struct Guard<F: FnOnce()>(pub(crate) Option<F>);

impl<F: FnOnce()> Drop for Guard<F> {
    fn drop(&mut self) {
        if let Some(f) = self.0.take() {
            f()
        }
    }
}

/// `defer!(|| ...)` runs the closure at the end of the current scope.
macro_rules! defer {
    ($func:expr) => {
        let _guard = $crate::defer::Guard(Some($func));
    };
}
