//! Priority-ordered arbitration of one exclusive resource
//!
//! A single mutex guards all arbiter state, and each priority level has its
//! own condition queue. Releasing hands the resource directly to one waiter at
//! the most urgent non-empty level: the release records a grant for that level
//! and keeps the resource reserved, and the woken waiter consumes the grant.
//! Because the whole release runs under the lock, a requester arriving after
//! the release cannot overtake the chosen waiter.
//!
//! A waiter that gives up (cancelled token, passed deadline, spent use budget)
//! never consumes a grant. Cancellation withdraws the waiter from the counts
//! as part of `CancellationToken::cancel`, so a later release cannot choose
//! it. If a grant was already on its way to a waiter that gives up, the grant
//! is passed on to the next most urgent waiter, or the resource is freed.
//!
//! Ordering among waiters at the same level is whatever the condition queue
//! delivers; no FIFO guarantee is made. Lower levels may starve while higher
//! levels keep arriving.

use crate::cancel::CancellationToken;
use crate::counter::WaitingCounter;
use crate::guard::ResourceGuard;
use parking_lot::{Condvar, Mutex};
use prm_config::ManagerConfig;
use prm_errors::{Error, ResourceError};
use prm_types::{Handoff, Priority, PriorityLevels};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, trace};

/// State shared between the arbiter and cancellation tokens
#[derive(Debug)]
pub(crate) struct Shared {
    levels: PriorityLevels,
    state: Mutex<State>,
    queues: Box<[Condvar]>,
}

#[derive(Debug)]
struct State {
    /// True while someone holds the resource, including while a handoff to a
    /// woken waiter is pending
    in_use: bool,
    waiting: WaitingCounter,
    /// Handoffs signaled at each level that no woken waiter has taken yet
    grants: Box<[usize]>,
    /// Grants handed out so far, pending handoffs included
    uses: u64,
    max_uses: Option<u64>,
}

impl Shared {
    pub(crate) fn new(levels: PriorityLevels) -> Self {
        Self {
            levels,
            state: Mutex::new(State {
                in_use: false,
                waiting: WaitingCounter::new(levels),
                grants: vec![0; levels.count()].into_boxed_slice(),
                uses: 0,
                max_uses: None,
            }),
            queues: (0..levels.count()).map(|_| Condvar::new()).collect(),
        }
    }

    /// Withdraw a cancelled waiter and wake its level
    ///
    /// `enrolled` is the waiter's own flag; whichever side clears it first
    /// removes the waiter from the counts.
    pub(crate) fn withdraw_cancelled(&self, priority: Priority, enrolled: &AtomicBool) {
        let mut state = self.state.lock();
        if enrolled.swap(false, Ordering::SeqCst) {
            if let Err(err) = state.withdraw(priority, self.levels, &self.queues) {
                error!(%priority, error = %err, "failed to withdraw cancelled waiter");
            }
            debug!(%priority, "cancelled waiter withdrawn");
        }
        self.queues[priority.index()].notify_all();
    }
}

impl State {
    fn take_grant(&mut self, priority: Priority) -> bool {
        let grants = &mut self.grants[priority.index()];
        if *grants == 0 {
            return false;
        }
        *grants -= 1;
        true
    }

    fn pending_grants(&self) -> usize {
        self.grants.iter().sum()
    }

    /// The budget, once every use in it has been granted
    fn exhausted(&self) -> Option<u64> {
        self.max_uses.filter(|max_uses| self.uses >= *max_uses)
    }

    /// Free the resource, then pass it to the most urgent waiter that has
    /// not been signaled yet
    fn hand_off(&mut self, levels: PriorityLevels, queues: &[Condvar]) -> Handoff {
        self.in_use = false;
        if let Some(max_uses) = self.exhausted() {
            // Nobody can be served any more; let every waiter fail.
            if self.waiting.total() > 0 {
                info!(
                    max_uses,
                    waiting = self.waiting.total(),
                    "use budget spent, waking all waiters"
                );
                for queue in queues {
                    queue.notify_all();
                }
            }
            return Handoff::NoneWaiting;
        }

        let Some(priority) = self.waiting.highest_waiting(levels, &self.grants) else {
            return Handoff::NoneWaiting;
        };
        self.grants[priority.index()] += 1;
        self.uses += 1;
        self.in_use = true;
        queues[priority.index()].notify_one();
        Handoff::Signaled(priority)
    }

    /// Remove one waiter at `priority` that will not take the resource
    ///
    /// A grant that only that waiter could have taken is passed on.
    fn withdraw(
        &mut self,
        priority: Priority,
        levels: PriorityLevels,
        queues: &[Condvar],
    ) -> Result<(), ResourceError> {
        self.waiting.decrease(priority)?;
        let index = priority.index();
        if self.grants[index] > self.waiting.count(priority) {
            self.grants[index] -= 1;
            self.uses = self.uses.saturating_sub(1);
            let handoff = self.hand_off(levels, queues);
            debug!(%priority, %handoff, "grant for a departed waiter passed on");
        } else if self.grants[index] > 0 {
            // The wakeup may have reached the departing waiter instead of the
            // sibling the grant is meant for.
            queues[index].notify_one();
        }
        Ok(())
    }
}

/// How long a blocked request is prepared to wait
enum Wait<'a> {
    Indefinitely,
    Until { deadline: Instant, timeout: Duration },
    Cancellable(&'a CancellationToken),
}

impl Wait<'_> {
    /// Error to return if the caller has stopped waiting
    fn abandoned(&self, priority: Priority) -> Option<ResourceError> {
        match self {
            Self::Indefinitely => None,
            Self::Until { deadline, timeout } => {
                (Instant::now() >= *deadline).then(|| ResourceError::TimedOut {
                    priority: priority.index(),
                    timeout_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
                })
            }
            Self::Cancellable(token) => token.is_cancelled().then(|| ResourceError::Cancelled {
                priority: priority.index(),
            }),
        }
    }
}

/// Point-in-time copy of the arbiter's bookkeeping
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ManagerSnapshot {
    pub levels: usize,
    /// True while held, and while a handoff to a woken waiter is pending
    pub in_use: bool,
    /// Blocked requesters per level, lowest level first
    pub waiting: Vec<usize>,
    /// Grants handed out so far
    pub uses: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_uses: Option<u64>,
}

impl ManagerSnapshot {
    #[must_use]
    pub fn waiting_total(&self) -> usize {
        self.waiting.iter().sum()
    }
}

/// Grants exclusive use of a resource, most urgent waiter first
///
/// The resource itself is shared with its owner through an `Arc`; the
/// arbiter only decides who may use it.
#[derive(Debug)]
pub struct PriorityResourceManager<R> {
    resource: Arc<R>,
    levels: PriorityLevels,
    shared: Arc<Shared>,
}

impl<R> PriorityResourceManager<R> {
    #[must_use]
    pub fn new(resource: Arc<R>, levels: PriorityLevels) -> Self {
        Self {
            resource,
            levels,
            shared: Arc::new(Shared::new(levels)),
        }
    }

    /// Limit the arbiter to `max_uses` grants over its lifetime
    ///
    /// Once they are spent, every request fails with
    /// `ResourceError::UsesExhausted` and blocked requests are woken to fail
    /// the same way.
    #[must_use]
    pub fn with_max_uses(self, max_uses: u64) -> Self {
        self.shared.state.lock().max_uses = Some(max_uses);
        self
    }

    /// Create an arbiter with the configured level count and use budget
    ///
    /// # Errors
    ///
    /// Returns an error if the configured level count is out of range.
    pub fn from_config(resource: Arc<R>, config: &ManagerConfig) -> Result<Self, Error> {
        let manager = Self::new(resource, config.levels()?);
        Ok(match config.max_uses {
            Some(max_uses) => manager.with_max_uses(max_uses),
            None => manager,
        })
    }

    #[must_use]
    pub fn resource(&self) -> &Arc<R> {
        &self.resource
    }

    #[must_use]
    pub fn levels(&self) -> PriorityLevels {
        self.levels
    }

    /// Block until the resource is held by the calling thread
    ///
    /// # Errors
    ///
    /// Returns `ResourceError::InvalidPriority` if `priority` is outside
    /// `[0, levels)`; nothing is changed in that case. Returns
    /// `ResourceError::UsesExhausted` once a configured use budget is spent.
    pub fn request_resource(&self, priority: i64) -> Result<(), ResourceError> {
        self.request(self.levels.validate(priority)?, Wait::Indefinitely)
    }

    /// Like [`request_resource`](Self::request_resource), but gives up when
    /// `token` is cancelled
    ///
    /// # Errors
    ///
    /// Returns `ResourceError::InvalidPriority` for an out-of-range priority
    /// and `ResourceError::Cancelled` if the token is cancelled before the
    /// resource is handed over. Cancellation always wins: a request that
    /// observes the cancelled token returns `Cancelled` even if a handoff was
    /// already on its way, and that handoff moves on to the next waiter.
    pub fn request_resource_cancellable(
        &self,
        priority: i64,
        token: &CancellationToken,
    ) -> Result<(), ResourceError> {
        self.request(self.levels.validate(priority)?, Wait::Cancellable(token))
    }

    /// Like [`request_resource`](Self::request_resource), but gives up after
    /// `timeout`
    ///
    /// # Errors
    ///
    /// Returns `ResourceError::InvalidPriority` for an out-of-range priority
    /// and `ResourceError::TimedOut` if the resource was not handed over in
    /// time. On timeout the waiter's registration has already been withdrawn.
    pub fn request_resource_timeout(
        &self,
        priority: i64,
        timeout: Duration,
    ) -> Result<(), ResourceError> {
        let priority = self.levels.validate(priority)?;
        let wait = match Instant::now().checked_add(timeout) {
            Some(deadline) => Wait::Until { deadline, timeout },
            None => Wait::Indefinitely,
        };
        self.request(priority, wait)
    }

    /// Take the resource only if it is free right now
    ///
    /// # Errors
    ///
    /// Returns `ResourceError::InvalidPriority` for an out-of-range priority
    /// and `ResourceError::UsesExhausted` once the use budget is spent.
    pub fn try_request_resource(&self, priority: i64) -> Result<bool, ResourceError> {
        let priority = self.levels.validate(priority)?;
        let mut state = self.shared.state.lock();
        if let Some(max_uses) = state.exhausted() {
            return Err(ResourceError::UsesExhausted { max_uses });
        }
        if state.in_use {
            return Ok(false);
        }
        state.in_use = true;
        state.uses += 1;
        trace!(%priority, "resource granted without waiting");
        Ok(true)
    }

    /// Block until the resource is held, returning a guard that releases it
    ///
    /// # Errors
    ///
    /// Returns `ResourceError::InvalidPriority` for an out-of-range priority.
    pub fn acquire(&self, priority: i64) -> Result<ResourceGuard<'_, R>, ResourceError> {
        let priority = self.levels.validate(priority)?;
        self.request(priority, Wait::Indefinitely)?;
        Ok(ResourceGuard::new(self, priority))
    }

    /// Give up the resource and hand it to the most urgent waiter, if any
    ///
    /// Returns the level that was signaled, or `Handoff::NoneWaiting` when the
    /// resource was left free.
    ///
    /// # Errors
    ///
    /// Returns `ResourceError::NotHeld` if the resource is free or is reserved
    /// for a waiter that has not resumed yet, since the caller cannot be the
    /// holder in either case.
    pub fn release_resource(&self) -> Result<Handoff, ResourceError> {
        let mut state = self.shared.state.lock();
        if !state.in_use || state.pending_grants() > 0 {
            error!(
                in_use = state.in_use,
                pending = state.pending_grants(),
                "resource released by a thread that does not hold it"
            );
            return Err(ResourceError::NotHeld);
        }

        let handoff = state.hand_off(self.levels, &self.shared.queues);
        match handoff {
            Handoff::Signaled(priority) => debug!(
                %priority,
                waiting = state.waiting.count(priority),
                "resource handed to waiter"
            ),
            Handoff::NoneWaiting => trace!("resource released, nobody waiting"),
        }
        Ok(handoff)
    }

    #[must_use]
    pub fn snapshot(&self) -> ManagerSnapshot {
        let state = self.shared.state.lock();
        ManagerSnapshot {
            levels: self.levels.count(),
            in_use: state.in_use,
            waiting: state.waiting.to_vec(),
            uses: state.uses,
            max_uses: state.max_uses,
        }
    }

    fn request(&self, priority: Priority, wait: Wait<'_>) -> Result<(), ResourceError> {
        // Set while this request is part of the waiting counts
        let enrolled = Arc::new(AtomicBool::new(false));
        let _registration = match wait {
            Wait::Cancellable(token) => {
                if token.is_cancelled() {
                    return Err(ResourceError::Cancelled {
                        priority: priority.index(),
                    });
                }
                Some(token.register(&self.shared, priority, &enrolled))
            }
            Wait::Indefinitely | Wait::Until { .. } => None,
        };

        let mut state = self.shared.state.lock();
        // A cancel that finished before we took the lock found nothing to
        // withdraw, so it has to be noticed here.
        if let Wait::Cancellable(token) = wait {
            if token.is_cancelled() {
                return Err(ResourceError::Cancelled {
                    priority: priority.index(),
                });
            }
        }
        if let Some(max_uses) = state.exhausted() {
            return Err(ResourceError::UsesExhausted { max_uses });
        }
        if !state.in_use {
            state.in_use = true;
            state.uses += 1;
            trace!(%priority, "resource granted without waiting");
            return Ok(());
        }

        state.waiting.increase(priority);
        enrolled.store(true, Ordering::SeqCst);
        debug!(
            %priority,
            waiting = state.waiting.count(priority),
            total = state.waiting.total(),
            "resource busy, waiting"
        );

        let queue = &self.shared.queues[priority.index()];
        loop {
            // Giving up is checked before the grant, so an abandoned wait
            // never ends up holding the resource.
            if let Some(err) = wait.abandoned(priority) {
                if enrolled.swap(false, Ordering::SeqCst) {
                    state.withdraw(priority, self.levels, &self.shared.queues)?;
                }
                info!(%priority, error = %err, "abandoned wait for resource");
                return Err(err);
            }

            if state.take_grant(priority) {
                enrolled.store(false, Ordering::SeqCst);
                state.waiting.decrease(priority)?;
                debug_assert!(state.in_use);
                debug!(%priority, "resource acquired after waiting");
                return Ok(());
            }

            if let Some(max_uses) = state.exhausted() {
                enrolled.store(false, Ordering::SeqCst);
                state.withdraw(priority, self.levels, &self.shared.queues)?;
                info!(%priority, max_uses, "use budget spent while waiting");
                return Err(ResourceError::UsesExhausted { max_uses });
            }

            // Wakeups without a grant are spurious or come from cancellation.
            match &wait {
                Wait::Until { deadline, .. } => {
                    queue.wait_until(&mut state, *deadline);
                }
                Wait::Indefinitely | Wait::Cancellable(_) => queue.wait(&mut state),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn manager(levels: usize) -> PriorityResourceManager<()> {
        PriorityResourceManager::new(Arc::new(()), PriorityLevels::new(levels).unwrap())
    }

    fn wait_for_waiters<R>(manager: &PriorityResourceManager<R>, expected: usize) {
        while manager.snapshot().waiting_total() != expected {
            thread::yield_now();
        }
    }

    #[test]
    fn test_free_resource_granted_immediately() {
        let manager = manager(3);
        manager.request_resource(1).unwrap();

        let snapshot = manager.snapshot();
        assert!(snapshot.in_use);
        assert_eq!(snapshot.waiting_total(), 0);
    }

    #[test]
    fn test_empty_release_returns_none_waiting() {
        let manager = manager(3);
        manager.request_resource(0).unwrap();
        assert_eq!(manager.release_resource().unwrap(), Handoff::NoneWaiting);
        assert!(!manager.snapshot().in_use);

        // Free again, so any level gets it straight away
        manager.request_resource(2).unwrap();
        assert!(manager.snapshot().in_use);
    }

    #[test]
    fn test_release_without_holding() {
        let manager = manager(2);
        assert_eq!(manager.release_resource(), Err(ResourceError::NotHeld));
    }

    #[test]
    fn test_invalid_priority_leaves_state_alone() {
        let manager = manager(4);
        manager.request_resource(2).unwrap();

        for raw in [-1, 4, 100] {
            assert!(matches!(
                manager.request_resource(raw),
                Err(ResourceError::InvalidPriority { .. })
            ));
            assert!(manager.try_request_resource(raw).is_err());
        }

        let snapshot = manager.snapshot();
        assert!(snapshot.in_use);
        assert_eq!(snapshot.waiting, vec![0, 0, 0, 0]);
    }

    #[test]
    fn test_try_request_resource() {
        let manager = manager(2);
        assert!(manager.try_request_resource(0).unwrap());
        assert!(!manager.try_request_resource(1).unwrap());
        manager.release_resource().unwrap();
        assert!(manager.try_request_resource(1).unwrap());
    }

    #[test]
    fn test_handoff_reserves_resource_for_woken_waiter() {
        let manager = manager(2);
        manager.request_resource(0).unwrap();

        thread::scope(|s| {
            let waiter = s.spawn(|| manager.request_resource(1));
            wait_for_waiters(&manager, 1);

            assert_eq!(
                manager.release_resource().unwrap().code(),
                1,
                "waiter at level 1 should be signaled"
            );
            // Reserved for the woken waiter: newcomers cannot take it
            assert!(!manager.try_request_resource(1).unwrap());

            waiter.join().unwrap().unwrap();
        });

        assert!(manager.snapshot().in_use);
        assert_eq!(manager.release_resource().unwrap(), Handoff::NoneWaiting);
    }

    #[test]
    fn test_timeout_withdraws_registration() {
        let manager = manager(3);
        manager.request_resource(0).unwrap();

        let result = manager.request_resource_timeout(2, Duration::from_millis(20));
        assert_eq!(
            result,
            Err(ResourceError::TimedOut {
                priority: 2,
                timeout_ms: 20
            })
        );
        assert_eq!(manager.snapshot().waiting_total(), 0);
        assert_eq!(manager.release_resource().unwrap(), Handoff::NoneWaiting);
    }

    #[test]
    fn test_expired_waiter_passes_its_grant_on() {
        let manager = manager(3);
        manager.request_resource(0).unwrap();

        thread::scope(|s| {
            let expiring =
                s.spawn(|| manager.request_resource_timeout(2, Duration::from_millis(30)));
            let low = s.spawn(|| {
                manager.request_resource(0).unwrap();
                manager.release_resource().unwrap()
            });
            while manager.snapshot().waiting != [1, 0, 1] {
                thread::yield_now();
            }

            // Hand off to level 2 only after its deadline has lapsed, while the
            // waiter is still parked behind the lock
            let handoff = {
                let mut state = manager.shared.state.lock();
                thread::sleep(Duration::from_millis(60));
                state.hand_off(manager.levels, &manager.shared.queues)
            };
            assert_eq!(handoff.code(), 2);

            assert!(matches!(
                expiring.join().unwrap(),
                Err(ResourceError::TimedOut { priority: 2, .. })
            ));
            assert_eq!(low.join().unwrap(), Handoff::NoneWaiting);
        });

        let snapshot = manager.snapshot();
        assert!(!snapshot.in_use);
        assert_eq!(snapshot.waiting, vec![0, 0, 0]);
        // The first holder and the level-0 waiter; the lapsed grant was returned
        assert_eq!(snapshot.uses, 2);
    }

    #[test]
    fn test_use_budget_limits_grants() {
        let manager = manager(2).with_max_uses(2);
        manager.request_resource(0).unwrap();
        manager.release_resource().unwrap();
        assert!(manager.try_request_resource(1).unwrap());
        manager.release_resource().unwrap();

        let exhausted = ResourceError::UsesExhausted { max_uses: 2 };
        assert_eq!(manager.request_resource(1), Err(exhausted.clone()));
        assert_eq!(manager.try_request_resource(0), Err(exhausted));

        let snapshot = manager.snapshot();
        assert!(!snapshot.in_use);
        assert_eq!(snapshot.uses, 2);
        assert_eq!(snapshot.max_uses, Some(2));
    }

    #[test]
    fn test_waiters_fail_once_budget_spent() {
        let manager = manager(2).with_max_uses(1);
        manager.request_resource(0).unwrap();

        thread::scope(|s| {
            let waiters: Vec<_> = (0..2)
                .map(|_| s.spawn(|| manager.request_resource(1)))
                .collect();
            wait_for_waiters(&manager, 2);

            assert_eq!(manager.release_resource().unwrap(), Handoff::NoneWaiting);
            for waiter in waiters {
                assert_eq!(
                    waiter.join().unwrap(),
                    Err(ResourceError::UsesExhausted { max_uses: 1 })
                );
            }
        });

        let snapshot = manager.snapshot();
        assert!(!snapshot.in_use);
        assert_eq!(snapshot.waiting_total(), 0);
    }

    #[test]
    fn test_pre_cancelled_token_fails_fast() {
        let manager = manager(2);
        let token = CancellationToken::new();
        token.cancel();

        assert_eq!(
            manager.request_resource_cancellable(1, &token),
            Err(ResourceError::Cancelled { priority: 1 })
        );
        assert!(!manager.snapshot().in_use);
    }
}
