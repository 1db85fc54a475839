use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use tracing::error;

use crate::metrics_consts::RUNNER_HOOK_PANICS;

/// Observer of runner lifecycle events.
///
/// Hooks run synchronously on the driver between broker calls, so
/// implementations must return within a few milliseconds or they starve the
/// poll loop. A panicking hook is logged and suppressed; it never affects the
/// loop.
pub trait RunnerHooks: Send + Sync {
    fn on_pre_poll(&self) {}

    /// `committed` is the number of units committed in the pass that just
    /// ended.
    fn on_post_commit(&self, committed: usize) {
        let _ = committed;
    }

    fn on_pause(&self, reason: &str, backoff: Duration) {
        let _ = (reason, backoff);
    }

    fn on_resume(&self) {}

    /// Fired once, after the broker handle is released. No further hooks
    /// fire after this.
    fn on_fatal(&self, error: &anyhow::Error) {
        let _ = error;
    }
}

/// Copy-on-write fan-out to registered observers. Registration after start is
/// safe and takes effect on the next event.
#[derive(Default)]
pub struct HookBus {
    observers: RwLock<Arc<Vec<Arc<dyn RunnerHooks>>>>,
}

impl HookBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, hooks: Arc<dyn RunnerHooks>) {
        let mut guard = self.observers.write().expect("hook registry poisoned");
        let mut next = Vec::clone(&guard);
        next.push(hooks);
        *guard = Arc::new(next);
    }

    fn snapshot(&self) -> Arc<Vec<Arc<dyn RunnerHooks>>> {
        self.observers.read().expect("hook registry poisoned").clone()
    }

    fn dispatch(&self, name: &'static str, call: impl Fn(&dyn RunnerHooks)) {
        for hooks in self.snapshot().iter() {
            if catch_unwind(AssertUnwindSafe(|| call(hooks.as_ref()))).is_err() {
                metrics::counter!(RUNNER_HOOK_PANICS, "hook" => name).increment(1);
                error!(hook = name, "lifecycle hook panicked, suppressing");
            }
        }
    }

    pub(crate) fn pre_poll(&self) {
        self.dispatch("on_pre_poll", |h| h.on_pre_poll());
    }

    pub(crate) fn post_commit(&self, committed: usize) {
        self.dispatch("on_post_commit", |h| h.on_post_commit(committed));
    }

    pub(crate) fn pause(&self, reason: &str, backoff: Duration) {
        self.dispatch("on_pause", |h| h.on_pause(reason, backoff));
    }

    pub(crate) fn resume(&self) {
        self.dispatch("on_resume", |h| h.on_resume());
    }

    pub(crate) fn fatal(&self, error: &anyhow::Error) {
        self.dispatch("on_fatal", |h| h.on_fatal(error));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct Counting {
        post_commits: AtomicUsize,
        resumes: AtomicUsize,
    }

    impl RunnerHooks for Counting {
        fn on_post_commit(&self, committed: usize) {
            self.post_commits.fetch_add(committed, Ordering::SeqCst);
        }

        fn on_resume(&self) {
            self.resumes.fetch_add(1, Ordering::SeqCst);
        }
    }

    struct Panicking;

    impl RunnerHooks for Panicking {
        fn on_post_commit(&self, _committed: usize) {
            panic!("observer bug");
        }
    }

    #[test]
    fn events_fan_out_to_all_observers() {
        let bus = HookBus::new();
        let first = Arc::new(Counting::default());
        let second = Arc::new(Counting::default());
        bus.register(first.clone());
        bus.register(second.clone());

        bus.post_commit(3);
        bus.resume();

        assert_eq!(first.post_commits.load(Ordering::SeqCst), 3);
        assert_eq!(second.post_commits.load(Ordering::SeqCst), 3);
        assert_eq!(second.resumes.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn panicking_observer_does_not_starve_the_rest() {
        let bus = HookBus::new();
        let counting = Arc::new(Counting::default());
        bus.register(Arc::new(Panicking));
        bus.register(counting.clone());

        bus.post_commit(1);

        assert_eq!(counting.post_commits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn late_registration_takes_effect_on_next_event() {
        let bus = HookBus::new();
        bus.post_commit(1);

        let counting = Arc::new(Counting::default());
        bus.register(counting.clone());
        bus.post_commit(2);

        assert_eq!(counting.post_commits.load(Ordering::SeqCst), 2);
    }
}
