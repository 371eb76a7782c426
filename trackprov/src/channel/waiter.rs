//! Bounded-time pattern waits over a transcript.

use std::sync::Arc;
use std::time::Duration;

use log::trace;
use regex::Regex;
use tokio::sync::watch;
use tokio::time::{self, Instant, MissedTickBehavior};

use super::transcript::Transcript;
use crate::transport::LinkState;

/// Default polling cadence.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Which part of the transcript a wait inspects.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchScope {
    /// Only text appended since the baseline.
    Suffix,
    /// The suffix first, then the whole retained transcript. This catches a
    /// message that straddles the baseline because it arrived split across
    /// two reads.
    Transcript,
}

/// Polls a transcript until a pattern shows up, the deadline passes, or the
/// channel closes.
///
/// Waits never fail: a timeout or a closed channel both resolve as "no
/// match", so cleanup paths are never blocked.
#[derive(Debug, Clone)]
pub struct PatternWaiter {
    transcript: Arc<Transcript>,
    link: watch::Receiver<LinkState>,
    poll_interval: Duration,
}

impl PatternWaiter {
    /// Create a waiter over `transcript`, stopping early when `link` leaves
    /// the open state.
    pub fn new(
        transcript: Arc<Transcript>,
        link: watch::Receiver<LinkState>,
        poll_interval: Duration,
    ) -> Self {
        Self {
            transcript,
            link,
            poll_interval,
        }
    }

    /// The transcript this waiter watches.
    pub fn transcript(&self) -> &Arc<Transcript> {
        &self.transcript
    }

    /// Current state of the channel behind the transcript.
    pub fn link_state(&self) -> LinkState {
        self.link.borrow().clone()
    }

    /// Sleep for `duration`, returning early if the channel stops.
    pub async fn settle(&self, duration: Duration) {
        let mut link = self.link.clone();
        tokio::select! {
            _ = time::sleep(duration) => {}
            _ = link.wait_for(|state| !state.is_open()) => {}
        }
    }

    /// Wait for `pattern` in text since `baseline` (or the full transcript).
    pub async fn await_match(&self, pattern: &Regex, baseline: usize, timeout: Duration) -> bool {
        self.await_any_in(&[pattern], baseline, timeout, MatchScope::Transcript)
            .await
            .is_some()
    }

    /// Like [`await_match`](Self::await_match) with an explicit scope.
    pub async fn await_match_in(
        &self,
        pattern: &Regex,
        baseline: usize,
        timeout: Duration,
        scope: MatchScope,
    ) -> bool {
        self.await_any_in(&[pattern], baseline, timeout, scope)
            .await
            .is_some()
    }

    /// Wait for whichever of `patterns` appears first.
    ///
    /// Returns the index of the winning pattern.
    pub async fn await_any(
        &self,
        patterns: &[&Regex],
        baseline: usize,
        timeout: Duration,
    ) -> Option<usize> {
        self.await_any_in(patterns, baseline, timeout, MatchScope::Transcript)
            .await
    }

    /// Core wait loop.
    ///
    /// All patterns are tested against the same snapshot on every tick.
    /// When several match, the one starting earliest in the text wins, and
    /// ties go to the lower index.
    pub async fn await_any_in(
        &self,
        patterns: &[&Regex],
        baseline: usize,
        timeout: Duration,
        scope: MatchScope,
    ) -> Option<usize> {
        let _pin = self.transcript.pin(baseline);
        let deadline = Instant::now() + timeout;
        let mut link = self.link.clone();
        let mut ticker = time::interval(self.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            if let Some(index) = self.find_any(patterns, baseline, scope) {
                trace!("pattern {} matched after baseline {}", index, baseline);
                return Some(index);
            }
            if !link.borrow_and_update().is_open() || Instant::now() >= deadline {
                return None;
            }

            tokio::select! {
                _ = ticker.tick() => {}
                _ = time::sleep_until(deadline) => {}
                changed = link.changed() => {
                    if changed.is_err() {
                        return self.find_any(patterns, baseline, scope);
                    }
                }
            }
        }
    }

    /// One non-blocking check of all patterns.
    pub fn find_any(&self, patterns: &[&Regex], baseline: usize, scope: MatchScope) -> Option<usize> {
        self.transcript.scan(baseline, |suffix, full| {
            earliest(patterns, suffix).or_else(|| match scope {
                MatchScope::Suffix => None,
                MatchScope::Transcript => earliest(patterns, full),
            })
        })
    }
}

fn earliest(patterns: &[&Regex], text: &str) -> Option<usize> {
    patterns
        .iter()
        .enumerate()
        .filter_map(|(i, p)| p.find(text).map(|m| (m.start(), i)))
        .min()
        .map(|(_, i)| i)
}
