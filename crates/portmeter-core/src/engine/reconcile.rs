//! Rollover-safe delta computation between two raw counter readings

/// Outcome of reconciling one raw reading against the previous one
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Reconciled {
    /// Bytes attributed to the interval since the previous reading
    pub delta: u64,
    /// Whether the reading went backwards and was treated as a counter reset
    pub reset: bool,
}

/// Bytes attributed to the interval between `last_raw` and `new_raw`
///
/// A reading below the previous one means the counter was reset (rule
/// reload, process restart, wraparound). The whole new reading is then taken
/// as the delta, i.e. the counter is assumed to have restarted from zero.
/// This overstates traffic if the reset happened partway through the
/// interval and misses anything counted before a second reset within the
/// same interval; without finer sampling neither case can be told apart.
pub fn reconcile(last_raw: u64, new_raw: u64) -> u64 {
    classify(last_raw, new_raw).delta
}

/// Like [`reconcile`], but also reports whether the reset heuristic applied
pub fn classify(last_raw: u64, new_raw: u64) -> Reconciled {
    match new_raw.checked_sub(last_raw) {
        Some(delta) => Reconciled { delta, reset: false },
        None => Reconciled {
            delta: new_raw,
            reset: true,
        },
    }
}
