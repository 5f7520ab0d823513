//! Lifecycle state shared by pooled resources.
//!
//! Every pooled resource moves through a small state machine:
//!
//! ```text
//! Idle <-> InUse          (repeatable)
//! Idle | InUse -> Invalid (terminal)
//! ```
//!
//! Nothing leaves `Invalid`; an invalid resource is never handed out again
//! and is closed and removed by its pool.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use parking_lot::Mutex;
use sqlpool_driver::DriverError;

/// Observable state of a pooled resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceState {
    /// Valid and available for reuse.
    Idle,
    /// Valid and handed out to a caller.
    InUse,
    /// Permanently unusable.
    Invalid,
}

impl ResourceState {
    /// Check if the resource can be handed out.
    #[must_use]
    pub fn is_available(&self) -> bool {
        matches!(self, Self::Idle)
    }

    /// Check if the resource should be removed from its pool.
    #[must_use]
    pub fn should_remove(&self) -> bool {
        matches!(self, Self::Invalid)
    }
}

/// Busy/valid flags and last-activity timestamp of a pooled resource.
#[derive(Debug)]
pub struct PooledState {
    tag_time: Mutex<Instant>,
    in_use: AtomicBool,
    valid: AtomicBool,
}

impl Default for PooledState {
    fn default() -> Self {
        Self::new()
    }
}

impl PooledState {
    /// A fresh, valid, idle state.
    #[must_use]
    pub fn new() -> Self {
        Self {
            tag_time: Mutex::new(Instant::now()),
            in_use: AtomicBool::new(false),
            valid: AtomicBool::new(true),
        }
    }

    /// Time of the last in-use transition.
    #[must_use]
    pub fn tag_time(&self) -> Instant {
        *self.tag_time.lock()
    }

    /// Whether the resource is handed out.
    #[must_use]
    pub fn is_in_use(&self) -> bool {
        self.in_use.load(Ordering::Acquire)
    }

    /// Whether the resource has not been invalidated.
    #[must_use]
    pub fn is_valid(&self) -> bool {
        self.valid.load(Ordering::Acquire)
    }

    /// Mark the resource as in use or idle, refreshing the tag time.
    pub fn set_in_use(&self, in_use: bool) {
        *self.tag_time.lock() = Instant::now();
        self.in_use.store(in_use, Ordering::Release);
    }

    /// Invalidate the resource. Returns whether it was valid before.
    pub fn invalidate(&self) -> bool {
        self.valid.swap(false, Ordering::AcqRel)
    }

    /// Current state-machine position.
    #[must_use]
    pub fn state(&self) -> ResourceState {
        if !self.is_valid() {
            ResourceState::Invalid
        } else if self.is_in_use() {
            ResourceState::InUse
        } else {
            ResourceState::Idle
        }
    }
}

/// Common interface of resources managed by a pool.
pub trait Pooled {
    /// The resource's lifecycle state.
    fn pooled_state(&self) -> &PooledState;

    /// Whether the resource can still be used.
    fn is_valid(&self) -> bool {
        self.pooled_state().is_valid()
    }

    /// Whether the resource is handed out.
    fn is_in_use(&self) -> bool {
        self.pooled_state().is_in_use()
    }

    /// Time of the last in-use transition.
    fn tag_time(&self) -> Instant {
        self.pooled_state().tag_time()
    }

    /// Mark the resource as in use or idle.
    fn set_in_use(&self, in_use: bool) {
        self.pooled_state().set_in_use(in_use);
    }

    /// Permanently invalidate the resource.
    fn invalidate(&self) {
        self.pooled_state().invalidate();
    }

    /// Current state-machine position, as seen through
    /// [`is_valid`](Self::is_valid) and [`is_in_use`](Self::is_in_use).
    fn resource_state(&self) -> ResourceState {
        if !self.is_valid() {
            ResourceState::Invalid
        } else if self.is_in_use() {
            ResourceState::InUse
        } else {
            ResourceState::Idle
        }
    }

    /// Release the resource after use, making it available again.
    fn notify_over(&self);

    /// Invalidate and close the resource.
    fn close(&self) -> Result<(), DriverError>;
}

/// Outcome of a best-effort cleanup pass.
///
/// Cleanup never aborts on a single failure; failures are collected here
/// after being logged.
#[derive(Debug, Default)]
pub struct CleanupReport {
    /// Resources closed successfully.
    pub closed: usize,
    /// Resources whose close failed, by id.
    pub failures: Vec<(u64, DriverError)>,
}

impl CleanupReport {
    /// Record the outcome of closing the resource `id`.
    pub fn record(&mut self, id: u64, kind: &'static str, outcome: Result<(), DriverError>) {
        match outcome {
            Ok(()) => self.closed += 1,
            Err(error) => {
                tracing::warn!(id, kind, error = %error, "failed to close pooled resource");
                self.failures.push((id, error));
            }
        }
    }

    /// Whether every resource closed cleanly.
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_transitions() {
        let state = PooledState::new();
        assert_eq!(state.state(), ResourceState::Idle);

        state.set_in_use(true);
        assert_eq!(state.state(), ResourceState::InUse);

        state.set_in_use(false);
        assert_eq!(state.state(), ResourceState::Idle);

        assert!(state.invalidate());
        assert_eq!(state.state(), ResourceState::Invalid);
    }

    #[test]
    fn test_invalid_is_terminal() {
        let state = PooledState::new();
        state.invalidate();
        state.set_in_use(true);
        state.set_in_use(false);
        assert_eq!(state.state(), ResourceState::Invalid);
        assert!(!state.invalidate());
    }

    #[test]
    fn test_set_in_use_refreshes_tag_time() {
        let state = PooledState::new();
        let before = state.tag_time();
        std::thread::sleep(std::time::Duration::from_millis(2));
        state.set_in_use(true);
        assert!(state.tag_time() > before);
    }

    #[test]
    fn test_resource_state_predicates() {
        assert!(ResourceState::Idle.is_available());
        assert!(!ResourceState::InUse.is_available());
        assert!(ResourceState::Invalid.should_remove());
        assert!(!ResourceState::Idle.should_remove());
    }

    struct Resource {
        state: PooledState,
        open: bool,
    }

    impl Pooled for Resource {
        fn pooled_state(&self) -> &PooledState {
            &self.state
        }

        fn is_valid(&self) -> bool {
            self.state.is_valid() && self.open
        }

        fn notify_over(&self) {
            self.set_in_use(false);
        }

        fn close(&self) -> Result<(), DriverError> {
            self.invalidate();
            Ok(())
        }
    }

    #[test]
    fn test_resource_state_follows_overridden_validity() {
        let resource = Resource {
            state: PooledState::new(),
            open: true,
        };
        assert!(resource.resource_state().is_available());
        resource.set_in_use(true);
        assert_eq!(resource.resource_state(), ResourceState::InUse);
        resource.notify_over();
        assert!(resource.resource_state().is_available());

        let closed = Resource {
            state: PooledState::new(),
            open: false,
        };
        assert!(closed.resource_state().should_remove());
        // the plain state still reads idle
        assert_eq!(closed.state.state(), ResourceState::Idle);
    }

    #[test]
    fn test_cleanup_report() {
        let mut report = CleanupReport::default();
        report.record(1, "statement", Ok(()));
        report.record(2, "statement", Err(DriverError::Closed));
        assert_eq!(report.closed, 1);
        assert_eq!(report.failures.len(), 1);
        assert!(!report.is_clean());
    }
}
