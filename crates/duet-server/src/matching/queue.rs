//! Pairing queues: one FIFO per region plus a global overflow pool.
//!
//! Entries are plain ids and may go stale (partner found elsewhere, socket
//! closed). Stale ids are dropped when popped rather than chased on every
//! state change.

use duet_core::{ConnId, GLOBAL_REGION};
use std::collections::{HashMap, VecDeque};
use tracing::trace;

#[derive(Debug, Default)]
pub struct PairingQueue {
    regions: HashMap<String, VecDeque<ConnId>>,
    global: VecDeque<ConnId>,
}

impl PairingQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append `id` to the tail of its region's queue, or the global queue.
    ///
    /// Any earlier entry for `id` is removed first, so an id sits in at most
    /// one queue.
    pub fn enqueue(&mut self, id: ConnId, region: &str) {
        self.remove(&id);
        if region == GLOBAL_REGION {
            self.global.push_back(id);
        } else {
            self.regions
                .entry(region.to_string())
                .or_default()
                .push_back(id);
        }
    }

    /// Pop the first usable partner for `self_id`, with the label of the
    /// queue it was popped from.
    ///
    /// Same-region waiters are preferred in arrival order; the global pool is
    /// the fallback. Popped ids that are `self_id` or fail `is_usable` are
    /// discarded.
    pub fn find_partner<F>(
        &mut self,
        region: &str,
        self_id: &ConnId,
        is_usable: F,
    ) -> Option<(ConnId, String)>
    where
        F: Fn(&ConnId) -> bool,
    {
        if region != GLOBAL_REGION {
            if let Some(queue) = self.regions.get_mut(region) {
                let found = pop_usable(queue, self_id, &is_usable);
                if queue.is_empty() {
                    self.regions.remove(region);
                }
                if let Some(partner) = found {
                    return Some((partner, region.to_string()));
                }
            }
        }
        pop_usable(&mut self.global, self_id, &is_usable)
            .map(|partner| (partner, GLOBAL_REGION.to_string()))
    }

    /// Excise `id` from every queue.
    pub fn remove(&mut self, id: &ConnId) {
        self.global.retain(|q| q != id);
        self.regions.retain(|_, queue| {
            queue.retain(|q| q != id);
            !queue.is_empty()
        });
    }

    /// Region label of the queue holding `id`, if any.
    #[cfg(test)]
    pub fn region_of(&self, id: &ConnId) -> Option<&str> {
        if self.global.contains(id) {
            return Some(GLOBAL_REGION);
        }
        self.regions
            .iter()
            .find(|(_, queue)| queue.contains(id))
            .map(|(region, _)| region.as_str())
    }

    #[cfg(test)]
    pub fn contains(&self, id: &ConnId) -> bool {
        self.region_of(id).is_some()
    }

    /// Total queued entries, stale ones included.
    pub fn len(&self) -> usize {
        self.global.len() + self.regions.values().map(VecDeque::len).sum::<usize>()
    }

    /// Number of queues holding `id`. Always 0 or 1.
    #[cfg(test)]
    fn occurrences(&self, id: &ConnId) -> usize {
        self.global.iter().filter(|q| *q == id).count()
            + self
                .regions
                .values()
                .map(|queue| queue.iter().filter(|q| *q == id).count())
                .sum::<usize>()
    }
}

fn pop_usable<F>(queue: &mut VecDeque<ConnId>, self_id: &ConnId, is_usable: &F) -> Option<ConnId>
where
    F: Fn(&ConnId) -> bool,
{
    while let Some(candidate) = queue.pop_front() {
        if &candidate != self_id && is_usable(&candidate) {
            return Some(candidate);
        }
        trace!(conn = %candidate, "dropping stale queue entry");
    }
    None
}
