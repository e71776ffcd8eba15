//! Per-cluster budget accounting.
//!
//! All cluster state is shared between the member cores' timer handlers and
//! the cluster's GPU bridge worker, so every field is an atomic. Only the
//! leader core resets usage and advances the regulation period count.

use memreg_common::config::{ClusterId, CoreId};
use memreg_common::units;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

const NO_LEADER: usize = usize::MAX;
const NOT_ARMED: u64 = u64::MAX;

#[derive(Debug)]
struct MemberSlot {
    core: CoreId,
    /// Nanoseconds since engine start at which this core's timer was armed.
    armed_at_ns: AtomicU64,
}

/// Shared usage counter, budget and leader of one cluster.
#[derive(Debug)]
pub struct ClusterAccountant {
    id: ClusterId,
    members: Vec<MemberSlot>,
    leader: AtomicUsize,
    budget_mb: AtomicU64,
    budget_events: AtomicU64,
    usage: AtomicU64,
    throttled: AtomicBool,
    regulation_period_count: AtomicU64,
    regulation_period: Duration,
    cache_line_size: u64,
}

impl ClusterAccountant {
    /// Create an accountant for `members` with a budget of `budget_mb` MB/s.
    #[must_use]
    pub fn new(
        id: ClusterId,
        members: &[CoreId],
        budget_mb: u64,
        regulation_period: Duration,
        cache_line_size: u64,
    ) -> Self {
        let budget_events = units::mb_to_events(budget_mb, regulation_period, cache_line_size);
        Self {
            id,
            members: members
                .iter()
                .map(|&core| MemberSlot {
                    core,
                    armed_at_ns: AtomicU64::new(NOT_ARMED),
                })
                .collect(),
            leader: AtomicUsize::new(NO_LEADER),
            budget_mb: AtomicU64::new(budget_mb),
            budget_events: AtomicU64::new(budget_events),
            usage: AtomicU64::new(0),
            throttled: AtomicBool::new(false),
            regulation_period_count: AtomicU64::new(0),
            regulation_period,
            cache_line_size,
        }
    }

    /// Cluster identifier.
    #[must_use]
    pub fn id(&self) -> ClusterId {
        self.id
    }

    /// Member cores in configuration order.
    pub fn members(&self) -> impl Iterator<Item = CoreId> + '_ {
        self.members.iter().map(|m| m.core)
    }

    /// Returns true if `core` belongs to this cluster.
    #[must_use]
    pub fn contains(&self, core: CoreId) -> bool {
        self.members.iter().any(|m| m.core == core)
    }

    /// Claim leadership for `core`, recording when its timer was armed.
    ///
    /// The first claim wins; later claims are refused. Returns true if
    /// `core` is the leader after the call.
    pub fn claim_leadership(&self, core: CoreId, armed_at_ns: u64) -> bool {
        if let Some(slot) = self.members.iter().find(|m| m.core == core) {
            slot.armed_at_ns.store(armed_at_ns, Ordering::Release);
        } else {
            return false;
        }
        match self
            .leader
            .compare_exchange(NO_LEADER, core, Ordering::AcqRel, Ordering::Acquire)
        {
            Ok(_) => true,
            Err(current) => current == core,
        }
    }

    /// Current leader, if one has been elected.
    #[must_use]
    pub fn leader(&self) -> Option<CoreId> {
        let leader = self.leader.load(Ordering::Acquire);
        (leader != NO_LEADER).then_some(leader)
    }

    /// Returns true if `core` is the elected leader.
    #[inline]
    #[must_use]
    pub fn is_leader(&self, core: CoreId) -> bool {
        self.leader.load(Ordering::Acquire) == core
    }

    /// When `core`'s timer was armed, in nanoseconds since engine start.
    #[must_use]
    pub fn armed_at_ns(&self, core: CoreId) -> Option<u64> {
        self.members
            .iter()
            .find(|m| m.core == core)
            .map(|m| m.armed_at_ns.load(Ordering::Acquire))
            .filter(|&ns| ns != NOT_ARMED)
    }

    /// Fold `events` into the usage of the current regulation period.
    ///
    /// Returns the usage after the addition.
    #[inline]
    pub fn add_usage(&self, events: u64) -> u64 {
        self.usage.fetch_add(events, Ordering::AcqRel).saturating_add(events)
    }

    /// Usage accumulated in the current regulation period.
    #[inline]
    #[must_use]
    pub fn usage(&self) -> u64 {
        self.usage.load(Ordering::Acquire)
    }

    /// Current budget in events per regulation period.
    #[inline]
    #[must_use]
    pub fn budget_events(&self) -> u64 {
        self.budget_events.load(Ordering::Acquire)
    }

    /// Current budget in MB/s.
    #[must_use]
    pub fn budget_mb(&self) -> u64 {
        self.budget_mb.load(Ordering::Acquire)
    }

    /// Returns true if current usage strictly exceeds the budget.
    #[inline]
    #[must_use]
    pub fn over_budget(&self) -> bool {
        self.usage() > self.budget_events()
    }

    /// Replace the budget. Takes effect at the next comparison.
    pub fn set_budget_mb(&self, budget_mb: u64) {
        let events = units::mb_to_events(budget_mb, self.regulation_period, self.cache_line_size);
        self.budget_mb.store(budget_mb, Ordering::Release);
        self.budget_events.store(events, Ordering::Release);
    }

    /// Replace the budget with a raw event count per regulation period.
    pub fn set_budget_events(&self, events: u64) {
        let mb = units::events_to_mb(events, self.regulation_period, self.cache_line_size);
        self.budget_mb.store(mb, Ordering::Release);
        self.budget_events.store(events, Ordering::Release);
    }

    /// Mark the cluster throttled.
    pub fn set_throttled(&self) {
        self.throttled.store(true, Ordering::Release);
    }

    /// Clear the cluster throttled flag.
    pub fn clear_throttled(&self) {
        self.throttled.store(false, Ordering::Release);
    }

    /// Cluster throttled flag.
    #[must_use]
    pub fn is_throttled(&self) -> bool {
        self.throttled.load(Ordering::Acquire)
    }

    /// Number of regulation periods completed.
    #[must_use]
    pub fn regulation_period_count(&self) -> u64 {
        self.regulation_period_count.load(Ordering::Acquire)
    }

    /// Reset usage and advance the regulation period count.
    ///
    /// A no-op returning false unless `core` is the leader.
    pub fn reset_period(&self, core: CoreId) -> bool {
        if !self.is_leader(core) {
            return false;
        }
        self.usage.store(0, Ordering::Release);
        self.regulation_period_count.fetch_add(1, Ordering::AcqRel);
        true
    }

    /// Point-in-time view for status reporting.
    #[must_use]
    pub fn snapshot(&self) -> ClusterSnapshot {
        ClusterSnapshot {
            id: self.id,
            members: self.members().collect(),
            leader: self.leader(),
            budget_mb: self.budget_mb(),
            budget_events: self.budget_events(),
            usage_events: self.usage(),
            throttled: self.is_throttled(),
            regulation_period_count: self.regulation_period_count(),
        }
    }
}

/// Serializable view of a [`ClusterAccountant`].
#[derive(Debug, Clone, Serialize)]
pub struct ClusterSnapshot {
    /// Cluster identifier.
    pub id: ClusterId,
    /// Regulated member cores.
    pub members: Vec<CoreId>,
    /// Elected leader core.
    pub leader: Option<CoreId>,
    /// Budget in MB/s.
    pub budget_mb: u64,
    /// Budget in events per regulation period.
    pub budget_events: u64,
    /// Usage in the current regulation period.
    pub usage_events: u64,
    /// Cluster throttled flag.
    pub throttled: bool,
    /// Completed regulation periods.
    pub regulation_period_count: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Barrier};
    use std::thread;

    fn cluster(budget_mb: u64) -> ClusterAccountant {
        ClusterAccountant::new(1, &[0, 1, 2, 3], budget_mb, Duration::from_micros(5300), 64)
    }

    #[test]
    fn test_budget_conversion() {
        let c = cluster(204_800);
        assert_eq!(c.budget_events(), 17_783_848);
        assert_eq!(c.budget_mb(), 204_800);
    }

    #[test]
    fn test_first_claim_wins() {
        let c = cluster(100);
        assert!(c.leader().is_none());
        assert!(c.claim_leadership(2, 10));
        assert!(!c.claim_leadership(0, 20));
        assert!(c.claim_leadership(2, 10));
        assert_eq!(c.leader(), Some(2));
        assert_eq!(c.armed_at_ns(0), Some(20));
        assert!(c.armed_at_ns(1).is_none());
    }

    #[test]
    fn test_non_member_cannot_lead() {
        let c = cluster(100);
        assert!(!c.claim_leadership(9, 0));
        assert!(c.leader().is_none());
    }

    #[test]
    fn test_concurrent_claims_elect_one_leader() {
        let c = Arc::new(cluster(100));
        let barrier = Arc::new(Barrier::new(4));
        let handles: Vec<_> = (0..4)
            .map(|core| {
                let c = Arc::clone(&c);
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    barrier.wait();
                    c.claim_leadership(core, core as u64)
                })
            })
            .collect();
        let winners = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|&won| won)
            .count();
        assert_eq!(winners, 1);
        assert!(c.leader().is_some());
    }

    #[test]
    fn test_only_leader_resets() {
        let c = cluster(100);
        c.claim_leadership(0, 0);
        c.add_usage(500);

        assert!(!c.reset_period(1));
        assert_eq!(c.usage(), 500);
        assert_eq!(c.regulation_period_count(), 0);

        assert!(c.reset_period(0));
        assert_eq!(c.usage(), 0);
        assert_eq!(c.regulation_period_count(), 1);
    }

    #[test]
    fn test_over_budget_is_strict() {
        let c = cluster(100);
        let budget = c.budget_events();
        c.add_usage(budget);
        assert!(!c.over_budget());
        c.add_usage(1);
        assert!(c.over_budget());
    }

    #[test]
    fn test_set_budget_takes_effect() {
        let c = cluster(204_800);
        c.add_usage(1_000_000);
        assert!(!c.over_budget());
        c.set_budget_mb(1);
        assert!(c.over_budget());
        assert_eq!(c.budget_mb(), 1);

        c.set_budget_events(2_000_000);
        assert!(!c.over_budget());
        assert_eq!(c.budget_events(), 2_000_000);
    }

    #[test]
    fn test_snapshot() {
        let c = cluster(100);
        c.claim_leadership(3, 0);
        c.add_usage(7);
        c.set_throttled();
        let snap = c.snapshot();
        assert_eq!(snap.members, vec![0, 1, 2, 3]);
        assert_eq!(snap.leader, Some(3));
        assert_eq!(snap.usage_events, 7);
        assert!(snap.throttled);
    }
}
