//! Connection budgets shared across pools.
//!
//! `max_db_connections` caps every pool pointing at the same backend
//! database; `max_user_connections` caps every pool using the same backend
//! user. Each open or in-flight backend connection holds one unit of both.
//!
//! A budget also tracks the pools drawing from it. When one of them is
//! starved by an exhausted budget, an idle connection held by a sibling is
//! closed to free a unit.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};

use crate::pool::Pool;

/// A counted cap. A limit of zero means unlimited.
#[derive(Debug, Default)]
pub struct ConnectionBudget {
    limit: AtomicUsize,
    used: AtomicUsize,
    members: Mutex<Vec<Weak<Pool>>>,
}

impl ConnectionBudget {
    pub fn new(limit: usize) -> Self {
        Self {
            limit: AtomicUsize::new(limit),
            used: AtomicUsize::new(0),
            members: Mutex::new(Vec::new()),
        }
    }

    pub fn set_limit(&self, limit: usize) {
        self.limit.store(limit, Ordering::SeqCst);
    }

    pub fn limit(&self) -> usize {
        self.limit.load(Ordering::SeqCst)
    }

    pub fn used(&self) -> usize {
        self.used.load(Ordering::SeqCst)
    }

    /// Take one unit if the cap allows it.
    pub fn try_acquire(&self) -> bool {
        let limit = self.limit();
        self.used
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |used| {
                (limit == 0 || used < limit).then_some(used + 1)
            })
            .is_ok()
    }

    pub fn release(&self) {
        let _ = self
            .used
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |used| used.checked_sub(1));
    }

    pub fn is_exhausted(&self) -> bool {
        let limit = self.limit();
        limit != 0 && self.used() >= limit
    }

    fn join(&self, pool: &Arc<Pool>) {
        self.members
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Arc::downgrade(pool));
    }

    /// Live pools drawing from this budget. Dropped pools are forgotten.
    fn members(&self) -> Vec<Arc<Pool>> {
        let mut members = self.members.lock().unwrap_or_else(PoisonError::into_inner);
        members.retain(|pool| pool.strong_count() > 0);
        members.iter().filter_map(Weak::upgrade).collect()
    }
}

/// The pair of budgets one pool draws from.
#[derive(Clone, Debug, Default)]
pub struct Budgets {
    pub database: Arc<ConnectionBudget>,
    pub user: Arc<ConnectionBudget>,
}

impl Budgets {
    pub fn new(database: Arc<ConnectionBudget>, user: Arc<ConnectionBudget>) -> Self {
        Self { database, user }
    }

    /// Budgets with no cap, for standalone pools.
    pub fn unlimited() -> Self {
        Self::default()
    }

    /// Take one unit from both budgets, or neither.
    pub fn try_acquire(&self) -> bool {
        if !self.database.try_acquire() {
            return false;
        }
        if !self.user.try_acquire() {
            self.database.release();
            return false;
        }
        true
    }

    pub fn release(&self) {
        self.database.release();
        self.user.release();
    }

    pub fn is_exhausted(&self) -> bool {
        self.database.is_exhausted() || self.user.is_exhausted()
    }

    /// Register `pool` as drawing from both budgets.
    pub(crate) fn join(&self, pool: &Arc<Pool>) {
        self.database.join(pool);
        self.user.join(pool);
    }

    /// Close one idle connection held by another pool on an exhausted
    /// budget. Returns whether a unit was freed.
    ///
    /// Must be called without any pool lock held.
    pub(crate) fn reclaim_idle(&self, requester: &Pool) -> bool {
        for budget in [&self.database, &self.user] {
            if !budget.is_exhausted() {
                continue;
            }
            for pool in budget.members() {
                if !std::ptr::eq(Arc::as_ptr(&pool), requester) && pool.close_one_idle() {
                    return true;
                }
            }
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_limit_is_unlimited() {
        let budget = ConnectionBudget::new(0);
        for _ in 0..1000 {
            assert!(budget.try_acquire());
        }
        assert_eq!(budget.used(), 1000);
    }

    #[test]
    fn limit_is_enforced() {
        let budget = ConnectionBudget::new(2);
        assert!(budget.try_acquire());
        assert!(budget.try_acquire());
        assert!(!budget.try_acquire());
        budget.release();
        assert!(budget.try_acquire());
    }

    #[test]
    fn release_never_underflows() {
        let budget = ConnectionBudget::new(1);
        budget.release();
        assert_eq!(budget.used(), 0);
    }

    #[test]
    fn lowering_limit_blocks_new_units() {
        let budget = ConnectionBudget::new(3);
        assert!(budget.try_acquire());
        assert!(budget.try_acquire());
        budget.set_limit(1);
        assert!(!budget.try_acquire());
    }

    #[test]
    fn pair_is_all_or_nothing() {
        let database = Arc::new(ConnectionBudget::new(5));
        let user = Arc::new(ConnectionBudget::new(1));
        let budgets = Budgets::new(database.clone(), user.clone());
        assert!(budgets.try_acquire());
        assert!(!budgets.try_acquire());
        // The failed attempt handed its database unit back.
        assert_eq!(database.used(), 1);
        budgets.release();
        assert_eq!(database.used(), 0);
        assert_eq!(user.used(), 0);
    }

    #[test]
    fn exhausted_only_at_a_real_limit() {
        let unlimited = ConnectionBudget::new(0);
        assert!(unlimited.try_acquire());
        assert!(!unlimited.is_exhausted());

        let database = Arc::new(ConnectionBudget::new(1));
        let budgets = Budgets::new(database.clone(), Arc::new(ConnectionBudget::new(0)));
        assert!(!budgets.is_exhausted());
        assert!(budgets.try_acquire());
        assert!(budgets.is_exhausted());
    }
}
