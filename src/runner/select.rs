//! Queue selection for a free slot.

use std::collections::BTreeSet;

use rand::seq::IndexedRandom;
use rand::Rng;

use crate::config::RunnerGroup;

use super::pending::PendingQueues;

/// Wildcard type matching every pending type.
pub const ANY_TYPE: &str = "*";

/// Job types a group may run in the given priority state.
///
/// In high priority the group's low-priority types are excluded; in low
/// priority they are added to the include list. A `*` include expands to
/// every type currently in `pending`.
pub fn candidate_types<'a>(
    group: &'a RunnerGroup,
    high: bool,
    pending: &'a PendingQueues,
) -> BTreeSet<&'a str> {
    let mut include: BTreeSet<&str> = group.include.iter().map(String::as_str).collect();
    let mut exclude: BTreeSet<&str> = group.exclude.iter().map(String::as_str).collect();
    let low = group.low_priority.iter().map(String::as_str);
    if high {
        exclude.extend(low);
    } else {
        include.extend(low);
    }
    if include.contains(ANY_TYPE) {
        include.extend(pending.keys().map(String::as_str));
    }
    include.remove(ANY_TYPE);
    include.retain(|t| !exclude.contains(t));
    include
}

/// Picks a `(type, domain)` queue uniformly among every pending queue the
/// group may run, or `None` if there is none.
pub fn select_queue<R: Rng + ?Sized>(
    group: &RunnerGroup,
    high: bool,
    pending: &PendingQueues,
    rng: &mut R,
) -> Option<(String, String)> {
    // Weigh each (type, domain) queue equally, not each type.
    let candidates: Vec<(&str, &str)> = candidate_types(group, high, pending)
        .into_iter()
        .filter_map(|t| pending.get(t).map(|domains| (t, domains)))
        .flat_map(|(t, domains)| domains.keys().map(move |d| (t, d.as_str())))
        .collect();

    candidates
        .choose(rng)
        .map(|(t, d)| (t.to_string(), d.to_string()))
}
