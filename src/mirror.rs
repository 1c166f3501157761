use std::collections::{HashMap, HashSet};

use tracing::{debug, warn};

use crate::descriptor::Mirror;

/// Index of a mirror inside the live mirror list of a file.
pub type MirrorId = usize;

/// Orders the mirrors that are not in `excluded`.
///
/// Key, in order: case-insensitive location match with `preferred_location`,
/// ascending preference, manifest order. Pure: equal inputs always give the
/// same ranking.
pub fn rank(
    mirrors: &[Mirror],
    preferred_location: Option<&str>,
    excluded: &HashSet<MirrorId>,
) -> Vec<MirrorId> {
    let mut ids: Vec<MirrorId> = (0..mirrors.len())
        .filter(|id| !excluded.contains(id))
        .collect();
    ids.sort_by_key(|&id| {
        let mirror = &mirrors[id];
        let location_match = match (preferred_location, mirror.location.as_deref()) {
            (Some(wanted), Some(actual)) => wanted.eq_ignore_ascii_case(actual),
            _ => false,
        };
        (!location_match, mirror.preference, id)
    });
    ids
}

/// Session-scoped mirror health: consecutive failure counts and the
/// permanently excluded set. Ranking itself is delegated to [rank].
#[derive(Debug, Clone)]
pub struct MirrorSelector {
    preferred_location: Option<String>,
    max_consecutive_failures: u32,
    consecutive_failures: HashMap<MirrorId, u32>,
    excluded: HashSet<MirrorId>,
}

/// What a recorded failure did to the mirror.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureOutcome {
    Demoted { consecutive: u32 },
    Excluded,
}

impl MirrorSelector {
    pub fn new(preferred_location: Option<String>, max_consecutive_failures: u32) -> Self {
        Self {
            preferred_location,
            max_consecutive_failures: max_consecutive_failures.max(1),
            consecutive_failures: HashMap::new(),
            excluded: HashSet::new(),
        }
    }

    pub fn ranking(&self, mirrors: &[Mirror]) -> Vec<MirrorId> {
        rank(mirrors, self.preferred_location.as_deref(), &self.excluded)
    }

    pub fn is_excluded(&self, id: MirrorId) -> bool {
        self.excluded.contains(&id)
    }

    pub fn excluded(&self) -> &HashSet<MirrorId> {
        &self.excluded
    }

    /// Excludes a mirror that can never be used, e.g. one without a transport.
    pub fn exclude(&mut self, id: MirrorId) {
        self.consecutive_failures.remove(&id);
        self.excluded.insert(id);
    }

    pub fn record_success(&mut self, id: MirrorId) {
        self.consecutive_failures.remove(&id);
    }

    /// `permanent` failures (not found, auth, size mismatch) exclude at once.
    pub fn record_failure(&mut self, id: MirrorId, permanent: bool) -> FailureOutcome {
        if self.excluded.contains(&id) {
            return FailureOutcome::Excluded;
        }
        let count = self.consecutive_failures.entry(id).or_insert(0);
        *count += 1;
        let consecutive = *count;
        if permanent || consecutive >= self.max_consecutive_failures {
            warn!(mirror = id, consecutive, permanent, "Excluding mirror for this session");
            self.excluded.insert(id);
            self.consecutive_failures.remove(&id);
            FailureOutcome::Excluded
        } else {
            debug!(mirror = id, consecutive, "Mirror demoted after failure");
            FailureOutcome::Demoted { consecutive }
        }
    }
}

/// Derives a two-letter location code from `LC_ALL`/`LANG`, e.g.
/// `en_US.UTF-8` gives `us`.
pub fn location_from_locale() -> Option<String> {
    ["LC_ALL", "LC_MESSAGES", "LANG"]
        .iter()
        .filter_map(|var| std::env::var(var).ok())
        .find(|v| !v.is_empty())
        .and_then(|v| location_from_locale_str(&v))
}

pub fn location_from_locale_str(locale: &str) -> Option<String> {
    let lang = locale.split(['.', '@']).next()?;
    let (_, region) = lang.split_once('_')?;
    if region.len() == 2 && region.chars().all(|c| c.is_ascii_alphabetic()) {
        Some(region.to_ascii_lowercase())
    } else {
        None
    }
}
