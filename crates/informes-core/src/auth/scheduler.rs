use std::sync::{Arc, Weak};
use std::time::Duration as StdDuration;

use chrono::{DateTime, Duration, Utc};
use futures::future::BoxFuture;
use futures::FutureExt;
use parking_lot::Mutex;
use tokio::runtime::Handle;
use tracing::{debug, warn};

use super::session::SubscriptionId;
use super::{Claims, RefreshCoordinator, Session, SessionStatus};

/// Cancel handle for a task registered with a [`TaskScheduler`].
///
/// Dropping the handle cancels the task as well.
pub struct ScheduledTask {
    cancel: Option<Box<dyn FnOnce() + Send>>,
}

impl ScheduledTask {
    pub fn new<F>(cancel: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        Self {
            cancel: Some(Box::new(cancel)),
        }
    }

    pub fn cancel(mut self) {
        self.run_cancel();
    }

    fn run_cancel(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

impl Drop for ScheduledTask {
    fn drop(&mut self) {
        self.run_cancel();
    }
}

/// Capability for running work later or right away.
pub trait TaskScheduler: Send + Sync {
    /// Run `task` once `delay` has elapsed, unless the returned handle is cancelled first.
    fn schedule(&self, delay: StdDuration, task: BoxFuture<'static, ()>) -> ScheduledTask;
    /// Run `task` as soon as possible, detached from the caller.
    fn spawn(&self, task: BoxFuture<'static, ()>);
}

/// [`TaskScheduler`] backed by tokio timers on a runtime handle.
#[derive(Debug, Clone)]
pub struct TokioScheduler {
    handle: Handle,
}

impl TokioScheduler {
    pub fn new(handle: Handle) -> Self {
        Self { handle }
    }

    /// Use the runtime of the calling context. Panics outside a tokio runtime.
    pub fn current() -> Self {
        Self::new(Handle::current())
    }
}

impl TaskScheduler for TokioScheduler {
    fn schedule(&self, delay: StdDuration, task: BoxFuture<'static, ()>) -> ScheduledTask {
        let runtime = self.handle.clone();
        let timer = self.handle.spawn(async move {
            tokio::time::sleep(delay).await;
            // Once fired the task is detached: cancelling the timer must not abort it mid-way.
            runtime.spawn(task);
        });
        ScheduledTask::new(move || timer.abort())
    }

    fn spawn(&self, task: BoxFuture<'static, ()>) {
        self.handle.spawn(task);
    }
}

/// What the scheduler decided for a freshly authenticated session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RenewalPlan {
    Immediate,
    After(StdDuration),
}

/// Compute when to renew: `lead` ahead of the token expiry, or right away if that moment has passed.
pub fn plan(claims: &Claims, now: DateTime<Utc>, lead: Duration) -> RenewalPlan {
    let millis = claims.time_until_expiry(now).num_milliseconds() - lead.num_milliseconds();
    if millis > 0 {
        RenewalPlan::After(StdDuration::from_millis(millis as u64))
    } else {
        RenewalPlan::Immediate
    }
}

/// Keeps one renewal timer armed for the current authenticated session.
#[derive(Clone)]
pub struct AutoRenewalScheduler {
    inner: Arc<SchedulerInner>,
}

struct SchedulerInner {
    coordinator: RefreshCoordinator,
    tasks: Arc<dyn TaskScheduler>,
    lead_time: Duration,
    state: Mutex<TimerState>,
    subscription: Mutex<Option<SubscriptionId>>,
}

#[derive(Default)]
struct TimerState {
    revision: u64,
    // Epoch of the credential the current plan was computed from.
    epoch: Option<u64>,
    timer: Option<ScheduledTask>,
    last_plan: Option<RenewalPlan>,
    last_immediate: Option<DateTime<Utc>>,
}

impl AutoRenewalScheduler {
    pub fn new(
        coordinator: RefreshCoordinator,
        tasks: Arc<dyn TaskScheduler>,
        lead_time: Duration,
    ) -> Self {
        Self {
            inner: Arc::new(SchedulerInner {
                coordinator,
                tasks,
                lead_time,
                state: Mutex::new(TimerState::default()),
                subscription: Mutex::new(None),
            }),
        }
    }

    /// Start following session changes. The current session is planned for right away.
    pub fn attach(&self) {
        let mut subscription = self.inner.subscription.lock();
        if subscription.is_some() {
            return;
        }
        let weak: Weak<SchedulerInner> = Arc::downgrade(&self.inner);
        let store = self.inner.coordinator.store();
        *subscription = Some(store.subscribe(move |session| {
            if let Some(inner) = weak.upgrade() {
                inner.on_session(session);
            }
        }));
        drop(subscription);
        self.inner.on_session(&store.get());
    }

    /// Stop following session changes and cancel any armed timer.
    pub fn detach(&self) {
        if let Some(id) = self.inner.subscription.lock().take() {
            self.inner.coordinator.store().unsubscribe(id);
        }
        let mut state = self.inner.state.lock();
        state.epoch = None;
        if let Some(timer) = state.timer.take() {
            timer.cancel();
        }
    }

    pub fn has_pending_timer(&self) -> bool {
        self.inner.state.lock().timer.is_some()
    }

    pub fn last_plan(&self) -> Option<RenewalPlan> {
        self.inner.state.lock().last_plan
    }
}

impl SchedulerInner {
    fn on_session(&self, session: &Session) {
        let mut state = self.state.lock();
        if session.revision() < state.revision {
            return;
        }
        state.revision = session.revision();

        let claims = match (session.status(), session.claims()) {
            (SessionStatus::Authenticated, Some(claims)) => claims,
            _ => {
                if let Some(timer) = state.timer.take() {
                    debug!(status = ?session.status(), "cancelling renewal timer");
                    timer.cancel();
                }
                state.epoch = None;
                return;
            }
        };

        if state.epoch == Some(session.epoch()) {
            return;
        }
        if let Some(timer) = state.timer.take() {
            timer.cancel();
        }
        state.epoch = Some(session.epoch());

        let now = Utc::now();
        let mut decision = plan(claims, now, self.lead_time);
        if decision == RenewalPlan::Immediate {
            // A renewal that hands back a token already inside the lead window would
            // otherwise renew again at once, forever.
            let renewed_recently = state
                .last_immediate
                .map_or(false, |at| now - at < self.lead_time);
            if renewed_recently && !claims.is_expired_at(now) {
                let half = (claims.time_until_expiry(now).num_milliseconds() / 2).max(1_000);
                warn!(
                    delay_ms = half,
                    "renewed token expires inside the lead time; backing off"
                );
                decision = RenewalPlan::After(StdDuration::from_millis(half as u64));
            }
        }
        state.last_plan = Some(decision);

        let coordinator = self.coordinator.clone();
        let task = async move {
            if let Err(err) = coordinator.refresh().await {
                warn!(error = %err, "scheduled credential renewal failed");
            }
        }
        .boxed();

        match decision {
            RenewalPlan::Immediate => {
                debug!("access token inside lead time; renewing now");
                state.last_immediate = Some(now);
                self.tasks.spawn(task);
            }
            RenewalPlan::After(delay) => {
                debug!(delay_ms = delay.as_millis() as u64, "scheduling credential renewal");
                state.timer = Some(self.tasks.schedule(delay, task));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::token::testing::token_expiring_in;
    use crate::auth::{AuthClient, Credential, MemoryKeyValueStore, SessionStore};
    use crate::config::ClientConfig;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    #[derive(Default)]
    struct RecordingScheduler {
        scheduled: Mutex<Vec<(StdDuration, Arc<AtomicBool>)>>,
        spawned: AtomicUsize,
    }

    impl RecordingScheduler {
        fn cancelled(&self) -> Vec<bool> {
            self.scheduled
                .lock()
                .iter()
                .map(|(_, flag)| flag.load(Ordering::SeqCst))
                .collect()
        }
    }

    impl TaskScheduler for RecordingScheduler {
        fn schedule(&self, delay: StdDuration, _task: BoxFuture<'static, ()>) -> ScheduledTask {
            let flag = Arc::new(AtomicBool::new(false));
            self.scheduled.lock().push((delay, Arc::clone(&flag)));
            ScheduledTask::new(move || flag.store(true, Ordering::SeqCst))
        }

        fn spawn(&self, _task: BoxFuture<'static, ()>) {
            self.spawned.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn scheduler() -> (AutoRenewalScheduler, Arc<SessionStore>, Arc<RecordingScheduler>) {
        let store = Arc::new(SessionStore::new(MemoryKeyValueStore::new()));
        let client = AuthClient::new(ClientConfig::default()).unwrap();
        let coordinator = RefreshCoordinator::new(Arc::clone(&store), client);
        let tasks = Arc::new(RecordingScheduler::default());
        let scheduler = AutoRenewalScheduler::new(
            coordinator,
            Arc::clone(&tasks) as Arc<dyn TaskScheduler>,
            Duration::milliseconds(60_000),
        );
        scheduler.attach();
        (scheduler, store, tasks)
    }

    #[test]
    fn plan_subtracts_lead_time() {
        let now = Utc::now();
        let claims = Claims {
            subject: "ana".into(),
            role: "USER".into(),
            email: None,
            expires_at: now.timestamp() + 3600,
        };
        match plan(&claims, now, Duration::seconds(60)) {
            RenewalPlan::After(delay) => {
                let secs = delay.as_secs();
                assert!((3538..=3540).contains(&secs), "unexpected delay {secs}");
            }
            other => panic!("unexpected plan {other:?}"),
        }
    }

    #[test]
    fn expiry_inside_lead_time_renews_immediately() {
        let (scheduler, store, tasks) = scheduler();
        store
            .set(Credential::new(token_expiring_in("ana", "USER", 30), "refresh"))
            .unwrap();

        assert_eq!(scheduler.last_plan(), Some(RenewalPlan::Immediate));
        assert_eq!(tasks.spawned.load(Ordering::SeqCst), 1);
        assert!(tasks.scheduled.lock().is_empty());
        assert!(!scheduler.has_pending_timer());
    }

    #[test]
    fn new_credential_replaces_previous_timer() {
        let (scheduler, store, tasks) = scheduler();
        store
            .set(Credential::new(token_expiring_in("ana", "USER", 3600), "r1"))
            .unwrap();
        store
            .set(Credential::new(token_expiring_in("ana", "USER", 7200), "r2"))
            .unwrap();

        assert_eq!(tasks.cancelled(), vec![true, false]);
        assert!(scheduler.has_pending_timer());
    }

    #[test]
    fn error_updates_do_not_reschedule() {
        let (_scheduler, store, tasks) = scheduler();
        store
            .set(Credential::new(token_expiring_in("ana", "USER", 3600), "r1"))
            .unwrap();
        store.set_error("Correo no verificado");

        assert_eq!(tasks.cancelled(), vec![false]);
    }

    #[test]
    fn logout_cancels_without_replacement() {
        let (scheduler, store, tasks) = scheduler();
        store
            .set(Credential::new(token_expiring_in("ana", "USER", 3600), "r1"))
            .unwrap();
        store.clear();

        assert_eq!(tasks.cancelled(), vec![true]);
        assert!(!scheduler.has_pending_timer());
    }

    #[test]
    fn attach_plans_an_already_restored_session() {
        let store = Arc::new(SessionStore::new(MemoryKeyValueStore::new()));
        store
            .set(Credential::new(token_expiring_in("ana", "USER", 3600), "r1"))
            .unwrap();
        let client = AuthClient::new(ClientConfig::default()).unwrap();
        let tasks = Arc::new(RecordingScheduler::default());
        let scheduler = AutoRenewalScheduler::new(
            RefreshCoordinator::new(Arc::clone(&store), client),
            Arc::clone(&tasks) as Arc<dyn TaskScheduler>,
            Duration::seconds(60),
        );
        scheduler.attach();
        assert!(scheduler.has_pending_timer());

        scheduler.detach();
        assert_eq!(tasks.cancelled(), vec![true]);
    }

    #[tokio::test(start_paused = true)]
    async fn tokio_timer_fires_unless_cancelled() {
        let tasks = TokioScheduler::current();
        let fired = Arc::new(AtomicUsize::new(0));

        let counter = Arc::clone(&fired);
        let kept = tasks.schedule(
            StdDuration::from_secs(10),
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
            }
            .boxed(),
        );
        let counter = Arc::clone(&fired);
        let cancelled = tasks.schedule(
            StdDuration::from_secs(5),
            async move {
                counter.fetch_add(10, Ordering::SeqCst);
            }
            .boxed(),
        );
        cancelled.cancel();

        tokio::time::sleep(StdDuration::from_secs(11)).await;
        tokio::task::yield_now().await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        drop(kept);
    }
}
