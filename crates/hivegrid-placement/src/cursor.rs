//! Rotation over named targets for the round-robin strategies.
//!
//! The cursor remembers the id of the target that received work last, not
//! a position. The next call resumes at the smallest id after it, so
//! controllers or group managers joining and leaving between submissions
//! do not reshuffle whose turn it is.

use std::sync::Mutex;

#[derive(Debug, Default)]
pub struct RotationCursor {
    last: Mutex<Option<String>>,
}

impl RotationCursor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Index into `ids` where the rotation continues, wrapping to the
    /// smallest id. `None` if `ids` is empty.
    pub fn resume<S: AsRef<str>>(&self, ids: &[S]) -> Option<usize> {
        let last = self.last();
        let ranked = ids.iter().enumerate().map(|(i, id)| (id.as_ref(), i));
        let after = last
            .as_deref()
            .and_then(|last| ranked.clone().filter(|(id, _)| *id > last).min());
        after.or_else(|| ranked.min()).map(|(_, i)| i)
    }

    /// Record `id` as the target that received work.
    pub fn record(&self, id: &str) {
        if let Ok(mut last) = self.last.lock() {
            *last = Some(id.to_string());
        }
    }

    pub fn last(&self) -> Option<String> {
        self.last.lock().ok().and_then(|last| last.clone())
    }
}
