//! Per-transition cleanup bookkeeping.
//!
//! Every mode transition gets a fresh [`CleanupInfoTracer`]. Work that the
//! transition discovers but defers — managers retired, catalog entries whose
//! files became garbage, checkpoint files superseded by a newer snapshot —
//! is recorded here so operators can see what a transition left behind.

use parking_lot::Mutex;

pub struct CleanupInfoTracer {
    entries: Mutex<Vec<String>>,
}

impl CleanupInfoTracer {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(Vec::new()),
        }
    }

    pub fn record(&self, what: impl Into<String>) {
        self.entries.lock().push(what.into());
    }

    pub fn entries(&self) -> Vec<String> {
        self.entries.lock().clone()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

impl Default for CleanupInfoTracer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn records_accumulate_in_order() {
        let tracer = CleanupInfoTracer::new();
        assert!(tracer.is_empty());

        tracer.record("wal manager retired");
        tracer.record("buffer manager retired");
        assert_eq!(
            tracer.entries(),
            vec![
                "wal manager retired".to_string(),
                "buffer manager retired".to_string()
            ]
        );
    }
}
