//! Append-only transcript of everything a device has printed.
//!
//! Offsets are absolute: they count every byte ever appended, so a baseline
//! taken before eviction or a reset still means "text that arrived after this
//! point". Readers scope their matching with [`Transcript::suffix_since`].

use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

/// Default retention cap in bytes.
pub const DEFAULT_CAPACITY: usize = 32 * 1024;

/// Bounded, append-only text log fed by a channel's read loop.
#[derive(Debug)]
pub struct Transcript {
    state: Mutex<TranscriptState>,
    capacity: usize,
}

#[derive(Debug, Default)]
struct TranscriptState {
    /// Retained text.
    text: String,

    /// Absolute offset of the first retained byte.
    start: usize,

    /// Baselines currently being awaited, with a reference count each.
    pins: BTreeMap<usize, usize>,
}

impl TranscriptState {
    fn end(&self) -> usize {
        self.start + self.text.len()
    }

    /// Byte index into `text` for an absolute offset, clamped and snapped
    /// forward to a char boundary.
    fn index_of(&self, offset: usize) -> usize {
        let mut idx = offset.saturating_sub(self.start).min(self.text.len());
        while !self.text.is_char_boundary(idx) {
            idx += 1;
        }
        idx
    }
}

impl Transcript {
    /// Create a transcript retaining roughly `capacity` bytes.
    pub fn new(capacity: usize) -> Self {
        Self {
            state: Mutex::new(TranscriptState::default()),
            capacity,
        }
    }

    fn lock(&self) -> MutexGuard<'_, TranscriptState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Append decoded text. Only the channel read loop calls this.
    pub(crate) fn append(&self, text: &str) {
        let mut state = self.lock();
        state.text.push_str(text);

        if state.text.len() <= self.capacity {
            return;
        }

        // Never evict text an outstanding waiter still needs
        let limit = state
            .pins
            .keys()
            .next()
            .map_or(state.text.len(), |&pin| pin.saturating_sub(state.start));
        let mut cut = (state.text.len() - self.capacity).min(limit);

        // Prefer dropping whole lines
        if cut > 0 {
            if let Some(nl) = memchr::memchr(b'\n', &state.text.as_bytes()[cut - 1..]) {
                if cut + nl <= limit {
                    cut += nl;
                }
            }
        }
        while !state.text.is_char_boundary(cut) {
            cut -= 1;
        }

        if cut > 0 {
            state.text.drain(..cut);
            state.start += cut;
        }
    }

    /// Absolute offset of the end of the transcript.
    pub fn snapshot_len(&self) -> usize {
        self.lock().end()
    }

    /// Text that arrived at or after `offset`.
    ///
    /// An offset older than the retained text yields everything retained.
    pub fn suffix_since(&self, offset: usize) -> String {
        let state = self.lock();
        let idx = state.index_of(offset);
        state.text[idx..].to_string()
    }

    /// All retained text since the last reset.
    pub fn full_text(&self) -> String {
        self.lock().text.clone()
    }

    /// At most the last `max_bytes` of retained text, for diagnostics.
    pub fn tail(&self, max_bytes: usize) -> String {
        let state = self.lock();
        let offset = state.end().saturating_sub(max_bytes);
        let idx = state.index_of(offset);
        state.text[idx..].to_string()
    }

    /// Inspect the suffix since `offset` and the full text under one lock.
    pub fn scan<R>(&self, offset: usize, f: impl FnOnce(&str, &str) -> R) -> R {
        let state = self.lock();
        let idx = state.index_of(offset);
        f(&state.text[idx..], &state.text)
    }

    /// Drop all retained text so nothing from an earlier attempt can match.
    ///
    /// Offsets keep counting from where they were.
    pub fn reset(&self) {
        let mut state = self.lock();
        let end = state.end();
        state.text.clear();
        state.start = end;
    }

    /// Retention cap in bytes.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Pin a baseline so eviction keeps everything after it.
    pub fn pin(&self, offset: usize) -> BaselineGuard<'_> {
        *self.lock().pins.entry(offset).or_insert(0) += 1;
        BaselineGuard {
            transcript: self,
            offset,
        }
    }
}

impl Default for Transcript {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

/// Keeps a baseline pinned until dropped.
#[derive(Debug)]
pub struct BaselineGuard<'a> {
    transcript: &'a Transcript,
    offset: usize,
}

impl BaselineGuard<'_> {
    /// The pinned offset.
    pub fn offset(&self) -> usize {
        self.offset
    }
}

impl Drop for BaselineGuard<'_> {
    fn drop(&mut self) {
        let mut state = self.transcript.lock();
        if let Some(count) = state.pins.get_mut(&self.offset) {
            *count -= 1;
            if *count == 0 {
                state.pins.remove(&self.offset);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_suffix_since_baseline() {
        let transcript = Transcript::new(1024);
        transcript.append("Booting...\n");
        let baseline = transcript.snapshot_len();
        transcript.append("Waiting for provisioning commands...\n");

        assert_eq!(
            transcript.suffix_since(baseline),
            "Waiting for provisioning commands...\n"
        );
        assert!(transcript.full_text().starts_with("Booting"));
    }

    #[test]
    fn test_reset_hides_stale_text() {
        let transcript = Transcript::new(1024);
        transcript.append("Device provisioned successfully!\n");
        let before = transcript.snapshot_len();
        transcript.reset();

        assert!(transcript.full_text().is_empty());
        assert_eq!(transcript.snapshot_len(), before);

        transcript.append("rst:0x1\n");
        assert_eq!(transcript.suffix_since(0), "rst:0x1\n");
    }

    #[test]
    fn test_eviction_respects_capacity() {
        let transcript = Transcript::new(32);
        for i in 0..10 {
            transcript.append(&format!("line {i:02}\n"));
        }
        let text = transcript.full_text();
        assert!(text.len() <= 32);
        assert!(text.ends_with("line 09\n"));
        // Whole lines are dropped
        assert!(text.starts_with("line"));
        assert_eq!(transcript.snapshot_len(), 80);
    }

    #[test]
    fn test_pinned_baseline_survives_eviction() {
        let transcript = Transcript::new(16);
        transcript.append("noise\n");
        let baseline = transcript.snapshot_len();
        let guard = transcript.pin(baseline);

        transcript.append("Waiting for provisioning commands...\n");
        transcript.append("more boot chatter that overflows\n");

        assert!(
            transcript
                .suffix_since(guard.offset())
                .starts_with("Waiting for provisioning")
        );

        drop(guard);
        transcript.append("x\n");
        assert!(transcript.full_text().len() <= 16 + "x\n".len());
    }

    #[test]
    fn test_tail_respects_char_boundaries() {
        let transcript = Transcript::new(1024);
        transcript.append("temp 25°C\n");
        let tail = transcript.tail(3);
        assert!(tail.ends_with("C\n"));
    }
}
