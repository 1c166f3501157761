use std::collections::HashMap;

use crate::descriptor::Mirror;
use crate::mirror::{FailureOutcome, MirrorId, MirrorSelector};

/// Why the last attempt of a segment failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    Transport,
    Integrity,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Assignment {
    pub mirror: MirrorId,
    /// 1-based attempt number of this segment on this mirror.
    pub attempt_on_mirror: u32,
    /// Set when the previous attempt failed on a different mirror.
    pub failover_from: Option<MirrorId>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pick {
    Assign(Assignment),
    /// Candidates exist but all are busy.
    Wait,
    /// No mirror may take the segment any more.
    Exhausted {
        mirrors_tried: usize,
        last_failure: Option<FailureKind>,
    },
}

#[derive(Debug, Clone)]
struct MirrorSlot {
    cap: usize,
    active: usize,
    ranged: bool,
}

#[derive(Debug, Clone, Default)]
struct SegmentTrack {
    attempts: HashMap<MirrorId, u32>,
    last_failed: Option<MirrorId>,
    last_failure: Option<FailureKind>,
}

/// Decides which mirror fetches which segment next.
///
/// Keeps per-mirror concurrency, per-segment attempt history and the session
/// [MirrorSelector]. Holds no I/O; the coordinator feeds it results.
#[derive(Debug, Clone)]
pub struct Scheduler {
    selector: MirrorSelector,
    slots: Vec<MirrorSlot>,
    tracks: Vec<SegmentTrack>,
    max_connections: usize,
    max_mirrors_per_segment: usize,
    max_attempts_per_mirror: u32,
    active: usize,
}

impl Scheduler {
    pub fn new(
        selector: MirrorSelector,
        segments: usize,
        max_connections: usize,
        max_mirrors_per_segment: usize,
        max_attempts_per_mirror: u32,
    ) -> Self {
        Self {
            selector,
            slots: Vec::new(),
            tracks: vec![SegmentTrack::default(); segments],
            max_connections: max_connections.max(1),
            max_mirrors_per_segment: max_mirrors_per_segment.max(1),
            max_attempts_per_mirror: max_attempts_per_mirror.max(1),
            active: 0,
        }
    }

    /// Registers the next mirror of the live list. Ids follow insertion order.
    pub fn add_mirror(&mut self, cap: usize, ranged: bool) -> MirrorId {
        self.slots.push(MirrorSlot {
            cap: cap.max(1),
            active: 0,
            ranged,
        });
        self.slots.len() - 1
    }

    pub fn exclude(&mut self, id: MirrorId) {
        self.selector.exclude(id);
    }

    pub fn selector(&self) -> &MirrorSelector {
        &self.selector
    }

    pub fn active(&self) -> usize {
        self.active
    }

    fn usable_mirrors(&self) -> usize {
        (0..self.slots.len())
            .filter(|&id| !self.selector.is_excluded(id))
            .count()
    }

    /// `min(max_connections, segments, usable mirrors)`, at least 1.
    pub fn concurrency_limit(&self) -> usize {
        self.max_connections
            .min(self.tracks.len())
            .min(self.usable_mirrors())
            .max(1)
    }

    pub fn has_capacity(&self) -> bool {
        self.active < self.concurrency_limit()
    }

    pub fn mirrors_tried(&self, segment: usize) -> usize {
        self.tracks[segment].attempts.len()
    }

    /// Next mirror for `segment`: the best-ranked free mirror that has not
    /// tried it yet, otherwise a free mirror that still has attempts left.
    pub fn pick(&self, mirrors: &[Mirror], segment: usize, needs_range: bool) -> Pick {
        let track = &self.tracks[segment];
        let tried = track.attempts.len();
        let mut any_candidate = false;
        let mut untried = None;
        let mut retry = None;

        for id in self.selector.ranking(mirrors) {
            let Some(slot) = self.slots.get(id) else {
                continue;
            };
            if needs_range && !slot.ranged {
                continue;
            }
            let attempts = track.attempts.get(&id).copied().unwrap_or(0);
            if attempts >= self.max_attempts_per_mirror {
                continue;
            }
            if attempts == 0 && tried >= self.max_mirrors_per_segment {
                continue;
            }
            any_candidate = true;
            if slot.active >= slot.cap {
                continue;
            }
            if attempts == 0 {
                untried.get_or_insert(id);
            } else {
                retry.get_or_insert(id);
            }
        }

        match untried.or(retry) {
            Some(mirror) => Pick::Assign(Assignment {
                mirror,
                attempt_on_mirror: track.attempts.get(&mirror).copied().unwrap_or(0) + 1,
                failover_from: track.last_failed.filter(|&prev| prev != mirror),
            }),
            None if any_candidate => Pick::Wait,
            None => Pick::Exhausted {
                mirrors_tried: tried,
                last_failure: track.last_failure,
            },
        }
    }

    pub fn start(&mut self, segment: usize, assignment: &Assignment) {
        *self.tracks[segment]
            .attempts
            .entry(assignment.mirror)
            .or_insert(0) += 1;
        self.slots[assignment.mirror].active += 1;
        self.active += 1;
    }

    fn release(&mut self, mirror: MirrorId) {
        if let Some(slot) = self.slots.get_mut(mirror) {
            slot.active = slot.active.saturating_sub(1);
        }
        self.active = self.active.saturating_sub(1);
    }

    pub fn finish_success(&mut self, mirror: MirrorId) {
        self.release(mirror);
        self.selector.record_success(mirror);
    }

    pub fn finish_failure(
        &mut self,
        segment: usize,
        mirror: MirrorId,
        kind: FailureKind,
        permanent: bool,
    ) -> FailureOutcome {
        self.release(mirror);
        let track = &mut self.tracks[segment];
        track.last_failed = Some(mirror);
        track.last_failure = Some(kind);
        self.selector.record_failure(mirror, permanent)
    }

    pub fn finish_cancelled(&mut self, mirror: MirrorId) {
        self.release(mirror);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mirrors() -> Vec<Mirror> {
        vec![
            Mirror::parse("http://a.example.com/f", 1).unwrap(),
            Mirror::parse("http://b.example.com/f", 2).unwrap(),
            Mirror::parse("http://c.example.com/f", 3).unwrap(),
        ]
    }

    fn scheduler(segments: usize) -> Scheduler {
        let mut s = Scheduler::new(MirrorSelector::new(None, 3), segments, 5, 3, 2);
        for _ in 0..3 {
            s.add_mirror(1, true);
        }
        s
    }

    fn assign(pick: Pick) -> Assignment {
        match pick {
            Pick::Assign(a) => a,
            other => panic!("expected assignment, got {:?}", other),
        }
    }

    #[test]
    fn busy_mirrors_push_segments_down_the_ranking() {
        let m = mirrors();
        let mut s = scheduler(3);
        for (segment, expected) in [(0, 0), (1, 1), (2, 2)] {
            let a = assign(s.pick(&m, segment, true));
            assert_eq!(a.mirror, expected);
            assert_eq!(a.failover_from, None);
            s.start(segment, &a);
        }
        assert_eq!(s.active(), 3);
        assert!(!s.has_capacity());
    }

    #[test]
    fn retries_same_mirror_only_when_no_alternate_is_free() {
        let m = mirrors();
        let mut s = scheduler(2);
        // a and c busy with other work
        let a0 = assign(s.pick(&m, 0, true));
        s.start(0, &a0);
        s.slots[2].active = 1;

        let first = assign(s.pick(&m, 1, true));
        assert_eq!(first.mirror, 1);
        s.start(1, &first);
        s.finish_failure(1, 1, FailureKind::Transport, false);

        let again = assign(s.pick(&m, 1, true));
        assert_eq!(again.mirror, 1);
        assert_eq!(again.attempt_on_mirror, 2);
        assert_eq!(again.failover_from, None);
        s.start(1, &again);
        s.finish_failure(1, 1, FailureKind::Transport, false);

        assert_eq!(s.pick(&m, 1, true), Pick::Wait);

        s.finish_success(0);
        let moved = assign(s.pick(&m, 1, true));
        assert_eq!(moved.mirror, 0);
        assert_eq!(moved.failover_from, Some(1));
    }

    #[test]
    fn exhaustion_reports_tried_mirrors_and_last_cause() {
        let m = mirrors();
        let mut s = Scheduler::new(MirrorSelector::new(None, 10), 1, 5, 2, 1);
        for _ in 0..3 {
            s.add_mirror(1, true);
        }
        for expected in [0, 1] {
            let a = assign(s.pick(&m, 0, true));
            assert_eq!(a.mirror, expected);
            s.start(0, &a);
            s.finish_failure(0, a.mirror, FailureKind::Integrity, false);
        }
        // third mirror is beyond max_mirrors_per_segment
        assert_eq!(
            s.pick(&m, 0, true),
            Pick::Exhausted {
                mirrors_tried: 2,
                last_failure: Some(FailureKind::Integrity)
            }
        );
    }

    #[test]
    fn permanent_failures_exclude_and_shrink_concurrency() {
        let m = mirrors();
        let mut s = scheduler(3);
        assert_eq!(s.concurrency_limit(), 3);
        let a = assign(s.pick(&m, 0, true));
        s.start(0, &a);
        s.finish_failure(0, a.mirror, FailureKind::Transport, true);
        assert!(s.selector().is_excluded(0));
        assert_eq!(s.concurrency_limit(), 2);
        assert_eq!(assign(s.pick(&m, 0, true)).mirror, 1);
    }

    #[test]
    fn unranged_mirrors_only_take_whole_file_fetches() {
        let m = mirrors();
        let mut s = Scheduler::new(MirrorSelector::new(None, 3), 2, 5, 3, 2);
        s.add_mirror(1, false);
        s.add_mirror(1, true);
        s.exclude(2);
        assert_eq!(assign(s.pick(&m, 0, true)).mirror, 1);
        assert_eq!(assign(s.pick(&m, 0, false)).mirror, 0);
    }
}
