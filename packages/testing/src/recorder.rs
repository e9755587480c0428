use std::any::type_name;
use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;

/// Collects values reported from callbacks, possibly from other threads, in the order they
/// arrive.
///
/// Clones share the same log, so a clone can be moved into a callback while the test keeps
/// another one for assertions.
pub struct Recorder<T> {
    entries: Arc<Mutex<Vec<T>>>,
}

impl<T> Recorder<T> {
    /// Creates an empty recorder.
    #[must_use]
    pub fn new() -> Self {
        Self {
            entries: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Appends `value` to the log.
    pub fn record(&self, value: T) {
        self.entries.lock().push(value);
    }

    /// A one-shot callback that records the value it is called with.
    #[must_use]
    pub fn sink(&self) -> impl FnOnce(T) + Send + 'static
    where
        T: Send + 'static,
    {
        let recorder = self.clone();
        move |value| recorder.record(value)
    }

    /// A copy of everything recorded so far.
    #[must_use]
    pub fn entries(&self) -> Vec<T>
    where
        T: Clone,
    {
        self.entries.lock().clone()
    }
}

impl<T> Clone for Recorder<T> {
    fn clone(&self) -> Self {
        Self {
            entries: Arc::clone(&self.entries),
        }
    }
}

impl<T> Default for Recorder<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> fmt::Debug for Recorder<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct(type_name::<Self>())
            .field("len", &self.entries.lock().len())
            .finish()
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use std::thread;

    use super::*;

    #[test]
    fn sinks_share_one_log() {
        let recorder = Recorder::new();

        let first = recorder.sink();
        let second = recorder.sink();

        thread::spawn(move || first(1)).join().unwrap();
        second(2);

        assert_eq!(recorder.entries(), vec![1, 2]);
    }
}
