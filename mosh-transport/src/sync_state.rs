/// An application-defined state object the transport synchronizes by
/// difference rather than by value. `mosh-terminal`'s `CompleteTerminal` and
/// its `UserStream` both implement this.
pub trait SyncState: Clone + PartialEq {
    /// Computes a diff that, applied to `existing`, reproduces `self`.
    /// `existing` is always a state the transport previously held.
    fn diff_from(&self, existing: &Self) -> Vec<u8>;

    /// Applies a diff produced by `diff_from` in place.
    fn apply_diff(&mut self, diff: &[u8]) -> Result<(), String>;

    /// Rationalizes `self` against `prefix`: subtracts the shared history so
    /// `self` expresses only the forward delta from `prefix`.
    fn subtract(&mut self, prefix: &Self);
}

/// A (local-clock timestamp, state number, snapshot) triple.
#[derive(Debug, Clone)]
pub struct TimestampedState<S> {
    pub timestamp: std::time::Instant,
    pub num: u64,
    pub state: S,
}

impl<S> TimestampedState<S> {
    pub fn new(timestamp: std::time::Instant, num: u64, state: S) -> Self {
        Self { timestamp, num, state }
    }
}
