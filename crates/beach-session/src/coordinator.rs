//! Session lifecycle: bootstrap, sign-in/out, proactive renewal and recovery.
//!
//! Every renewal, whatever triggered it (timer, watchdog, resync, manual),
//! goes through [`SessionCoordinator::attempt_renewal`], which holds the
//! renewal flag for the whole network round trip. Sign-in, sign-out and the
//! unauthorized handler bump a generation counter; results that come back
//! under an older generation are dropped.

use crate::api::{AuthApi, Credentials};
use crate::clock::{format_epoch_ms, Clock, SystemClock};
use crate::config::SessionConfig;
use crate::error::SessionError;
use crate::identity::{Identity, Session};
use crate::route::{MemoryNavigator, Navigator, RoutePolicy};
use crate::store::{MemoryScheduleStore, PersistedSchedule, ScheduleStore};
use crate::timer::{delay_until, TimerController};
use crate::watchdog::Watchdog;
use auth_bus::{Unauthorized, UnauthorizedBus};
use parking_lot::Mutex;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

const DEFAULT_WATCHDOG_PERIOD: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RenewalTrigger {
    Timer,
    Watchdog,
    Resync,
    Manual,
}

impl RenewalTrigger {
    pub fn as_str(self) -> &'static str {
        match self {
            RenewalTrigger::Timer => "timer",
            RenewalTrigger::Watchdog => "watchdog",
            RenewalTrigger::Resync => "resync",
            RenewalTrigger::Manual => "manual",
        }
    }
}

impl fmt::Display for RenewalTrigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RenewalOutcome {
    /// New deadline persisted and timer re-armed.
    Renewed,
    /// Another attempt was already running; nothing was sent.
    InFlight,
    /// The server rejected the credential. The bus handler clears the session.
    Unauthorized,
    /// Transient failure; the stale deadline stays so the watchdog retries.
    Failed,
    /// Completed after a sign-in/sign-out/unauthorized signal and was ignored.
    Discarded,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResyncOutcome {
    /// No deadline is persisted.
    Idle,
    /// The deadline had passed; a renewal was attempted.
    Renewal(RenewalOutcome),
    /// The deadline is still ahead; the timer now targets it.
    Rearmed(Duration),
}

pub struct CoordinatorBuilder {
    api: Arc<dyn AuthApi>,
    store: Option<Arc<dyn ScheduleStore>>,
    clock: Option<Arc<dyn Clock>>,
    navigator: Option<Arc<dyn Navigator>>,
    routes: RoutePolicy,
    bus: Option<UnauthorizedBus>,
    watchdog_period: Duration,
}

impl CoordinatorBuilder {
    fn new(api: Arc<dyn AuthApi>) -> Self {
        Self {
            api,
            store: None,
            clock: None,
            navigator: None,
            routes: RoutePolicy::default(),
            bus: None,
            watchdog_period: DEFAULT_WATCHDOG_PERIOD,
        }
    }

    pub fn config(mut self, config: &SessionConfig) -> Self {
        self.routes = config.routes.clone();
        self.watchdog_period = config.watchdog_period;
        self
    }

    pub fn store(mut self, store: Arc<dyn ScheduleStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn navigator(mut self, navigator: Arc<dyn Navigator>) -> Self {
        self.navigator = Some(navigator);
        self
    }

    pub fn routes(mut self, routes: RoutePolicy) -> Self {
        self.routes = routes;
        self
    }

    pub fn bus(mut self, bus: UnauthorizedBus) -> Self {
        self.bus = Some(bus);
        self
    }

    pub fn watchdog_period(mut self, period: Duration) -> Self {
        self.watchdog_period = period;
        self
    }

    /// Wires the coordinator and subscribes it to the bus without contacting
    /// the server. Must be called inside a Tokio runtime.
    pub fn build(self) -> SessionCoordinator {
        let store = self
            .store
            .unwrap_or_else(|| MemoryScheduleStore::new() as Arc<dyn ScheduleStore>);
        let schedule = PersistedSchedule::new(store);
        let initial = schedule
            .identity_snapshot()
            .map(Session::authenticated)
            .unwrap_or_default();
        let (session, _) = watch::channel(initial);
        let (ready, _) = watch::channel(false);
        let bus = self
            .bus
            .unwrap_or_else(|| UnauthorizedBus::global().clone());
        let subscription = bus.subscribe();
        let signal_fence = AtomicU64::new(bus.last_sequence());

        let inner = Arc::new(Inner {
            api: self.api,
            schedule,
            clock: self.clock.unwrap_or_else(|| Arc::new(SystemClock)),
            navigator: self
                .navigator
                .unwrap_or_else(|| Arc::new(MemoryNavigator::new("/"))),
            routes: self.routes,
            timer: TimerController::new(),
            watchdog: Watchdog::new(self.watchdog_period),
            renewing: AtomicBool::new(false),
            generation: AtomicU64::new(0),
            bus,
            signal_fence,
            bootstrapped: AtomicBool::new(false),
            session,
            ready,
            listener: Mutex::new(None),
        });

        let weak = Arc::downgrade(&inner);
        let listener = tokio::spawn(listen_for_unauthorized(weak, subscription));
        *inner.listener.lock() = Some(listener);

        SessionCoordinator { inner }
    }

    /// [`build`](Self::build) followed by the one-time bootstrap.
    pub async fn start(self) -> SessionCoordinator {
        let coordinator = self.build();
        coordinator.bootstrap().await;
        coordinator
    }
}

async fn listen_for_unauthorized(inner: Weak<Inner>, mut subscription: auth_bus::Subscription) {
    while let Ok(signal) = subscription.recv().await {
        match inner.upgrade() {
            Some(inner) => inner.handle_unauthorized(signal),
            None => break,
        }
    }
}

/// Owner of the cached identity and the renewal schedule.
///
/// Cloning is cheap and every clone drives the same session.
#[derive(Clone)]
pub struct SessionCoordinator {
    inner: Arc<Inner>,
}

struct Inner {
    api: Arc<dyn AuthApi>,
    schedule: PersistedSchedule,
    clock: Arc<dyn Clock>,
    navigator: Arc<dyn Navigator>,
    routes: RoutePolicy,
    timer: TimerController,
    watchdog: Watchdog,
    renewing: AtomicBool,
    generation: AtomicU64,
    bus: UnauthorizedBus,
    /// Bus signals up to this sequence predate the current sign-in.
    signal_fence: AtomicU64,
    bootstrapped: AtomicBool,
    session: watch::Sender<Session>,
    ready: watch::Sender<bool>,
    listener: Mutex<Option<JoinHandle<()>>>,
}

/// Clears the renewal flag however the attempt ends, including when its
/// future is dropped mid-request.
struct RenewalGuard<'a> {
    flag: &'a AtomicBool,
}

impl Drop for RenewalGuard<'_> {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::Release);
    }
}

fn seconds_to_ms(seconds: u64) -> i64 {
    i64::try_from(seconds.saturating_mul(1_000)).unwrap_or(i64::MAX)
}

impl SessionCoordinator {
    pub fn builder(api: Arc<dyn AuthApi>) -> CoordinatorBuilder {
        CoordinatorBuilder::new(api)
    }

    /// Resolves the current identity once per coordinator and marks the
    /// coordinator ready whatever the outcome.
    pub async fn bootstrap(&self) -> Session {
        self.inner.bootstrap().await
    }

    pub async fn sign_in(&self, credentials: &Credentials) -> Result<Session, SessionError> {
        self.inner.sign_in(credentials).await
    }

    /// Always ends signed out locally, whether or not the server was reached.
    pub async fn sign_out(&self) {
        self.inner.sign_out().await
    }

    pub async fn refresh_identity(&self) -> Result<Identity, SessionError> {
        let generation = self.inner.current_generation();
        self.inner.resolve_identity(generation).await
    }

    pub async fn attempt_renewal(&self, trigger: RenewalTrigger) -> RenewalOutcome {
        self.inner.attempt_renewal(trigger).await
    }

    /// One watchdog check. `None` when nothing was due.
    pub async fn watchdog_tick(&self) -> Option<RenewalOutcome> {
        self.inner.watchdog_tick().await
    }

    /// Call when the application returns to the foreground.
    pub async fn resync(&self) -> ResyncOutcome {
        self.inner.resync().await
    }

    pub fn has_role(&self, roles: &[&str]) -> bool {
        self.inner.session.borrow().has_role(roles)
    }

    pub fn session(&self) -> Session {
        self.inner.session.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<Session> {
        self.inner.session.subscribe()
    }

    pub fn is_ready(&self) -> bool {
        *self.inner.ready.borrow()
    }

    pub async fn wait_ready(&self) {
        let mut ready = self.inner.ready.subscribe();
        let _ = ready.wait_for(|ready| *ready).await;
    }

    pub fn is_renewing(&self) -> bool {
        self.inner.renewing.load(Ordering::Acquire)
    }

    pub fn renew_at(&self) -> Option<i64> {
        self.inner.schedule.renew_at()
    }

    pub fn timer_armed_for(&self) -> Option<Duration> {
        self.inner.timer.armed_for()
    }

    pub fn is_watchdog_running(&self) -> bool {
        self.inner.watchdog.is_running()
    }

    /// Disarms the timer, stops the watchdog and drops the bus subscription.
    /// Idempotent; the session itself is left as is.
    pub fn shutdown(&self) {
        self.inner.shutdown();
    }
}

impl Inner {
    fn current_generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    fn advance_generation(&self) -> u64 {
        self.generation.fetch_add(1, Ordering::SeqCst) + 1
    }

    fn is_current(&self, generation: u64) -> bool {
        self.current_generation() == generation
    }

    fn publish(&self, session: Session) {
        self.session.send_replace(session);
    }

    async fn bootstrap(self: &Arc<Self>) -> Session {
        if self.bootstrapped.swap(true, Ordering::SeqCst) {
            return self.session.borrow().clone();
        }

        let generation = self.current_generation();
        match self.resolve_identity(generation).await {
            Ok(identity) => {
                tracing::info!(target: "beach::session", user = %identity.id, "session restored");
                match self.schedule.renew_at() {
                    Some(deadline) => {
                        let delay = delay_until(deadline, self.clock.now_ms());
                        tracing::debug!(
                            target: "beach::session",
                            renew_at = %format_epoch_ms(deadline),
                            delay_ms = delay.as_millis() as u64,
                            "resuming persisted renewal schedule"
                        );
                        self.arm_renewal(delay);
                    }
                    None => {
                        tracing::debug!(target: "beach::session", "no renewal deadline persisted; renewing now to learn one");
                        self.arm_renewal(Duration::ZERO);
                    }
                }
            }
            Err(SessionError::Superseded) => {}
            Err(err) => {
                tracing::info!(target: "beach::session", error = %err, "no active session at startup");
                if self.is_current(generation) {
                    self.publish(Session::anonymous());
                }
            }
        }

        self.ready.send_replace(true);
        self.session.borrow().clone()
    }

    async fn sign_in(self: &Arc<Self>, credentials: &Credentials) -> Result<Session, SessionError> {
        // Signals raised before this attempt concern the credential it replaces.
        self.signal_fence
            .fetch_max(self.bus.last_sequence(), Ordering::SeqCst);
        let grant = match self.api.login(credentials).await {
            Ok(grant) => grant,
            Err(err) => {
                tracing::info!(target: "beach::session", error = %err, "sign-in rejected");
                return Err(err);
            }
        };

        let generation = self.advance_generation();
        let deadline = self
            .clock
            .now_ms()
            .saturating_add(seconds_to_ms(grant.refresh_in));
        if let Err(err) = self.schedule.set_renew_at(deadline) {
            tracing::warn!(target: "beach::session", error = %err, "failed to persist renewal deadline");
        }

        let identity = match self.resolve_identity(generation).await {
            Ok(identity) => identity,
            Err(err) => {
                if self.is_current(generation) {
                    self.timer.disarm();
                    self.watchdog.stop();
                    if let Err(store_err) = self.schedule.clear() {
                        tracing::warn!(target: "beach::session", error = %store_err, "failed to clear session store");
                    }
                    self.publish(Session::anonymous());
                }
                tracing::warn!(target: "beach::session", error = %err, "signed in but identity could not be resolved");
                return Err(err);
            }
        };

        self.arm_renewal(Duration::from_secs(grant.refresh_in));
        tracing::info!(
            target: "beach::session",
            user = %identity.id,
            refresh_in = grant.refresh_in,
            "signed in"
        );
        Ok(Session::authenticated(identity))
    }

    async fn sign_out(self: &Arc<Self>) {
        // Stop new triggers before yielding on the network call.
        self.advance_generation();
        self.timer.disarm();
        self.watchdog.stop();

        if let Err(err) = self.api.logout().await {
            tracing::warn!(target: "beach::session", error = %err, "server sign-out failed; clearing local session anyway");
        }

        // Anything that started while the logout request was pending is stale.
        self.advance_generation();
        self.timer.disarm();
        self.watchdog.stop();
        if let Err(err) = self.schedule.clear() {
            tracing::warn!(target: "beach::session", error = %err, "failed to clear session store");
        }
        self.publish(Session::anonymous());
        self.navigator.navigate(&self.routes.sign_in_location(None));
        tracing::info!(target: "beach::session", "signed out");
    }

    async fn resolve_identity(self: &Arc<Self>, generation: u64) -> Result<Identity, SessionError> {
        let identity = self.api.me().await?;
        if !self.is_current(generation) {
            tracing::debug!(target: "beach::session", generation, "dropping identity resolved for a stale session");
            return Err(SessionError::Superseded);
        }

        if let Err(err) = self.schedule.set_identity_snapshot(&identity) {
            tracing::warn!(target: "beach::session", error = %err, "failed to persist identity snapshot");
        }
        self.publish(Session::authenticated(identity.clone()));
        self.ensure_watchdog();
        Ok(identity)
    }

    async fn attempt_renewal(self: &Arc<Self>, trigger: RenewalTrigger) -> RenewalOutcome {
        if self
            .renewing
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            tracing::debug!(target: "beach::session", %trigger, "renewal already in flight");
            return RenewalOutcome::InFlight;
        }
        let _guard = RenewalGuard {
            flag: &self.renewing,
        };

        let generation = self.current_generation();
        tracing::debug!(target: "beach::session", %trigger, generation, "renewing credential");

        let grant = match self.api.refresh().await {
            Ok(grant) => grant,
            Err(err) if err.is_unauthorized() => {
                tracing::info!(target: "beach::session", %trigger, "credential renewal rejected");
                return RenewalOutcome::Unauthorized;
            }
            Err(err) => {
                tracing::warn!(
                    target: "beach::session",
                    %trigger,
                    error = %err,
                    "credential renewal failed; watchdog will retry"
                );
                return RenewalOutcome::Failed;
            }
        };

        if !self.is_current(generation) {
            tracing::debug!(target: "beach::session", %trigger, "discarding renewal that completed after a session change");
            return RenewalOutcome::Discarded;
        }

        let deadline = self
            .clock
            .now_ms()
            .saturating_add(seconds_to_ms(grant.refresh_in));
        if let Err(err) = self.schedule.set_renew_at(deadline) {
            tracing::warn!(target: "beach::session", error = %err, "failed to persist renewal deadline");
        }

        match self.resolve_identity(generation).await {
            Ok(_) => {}
            Err(SessionError::Superseded) => return RenewalOutcome::Discarded,
            Err(err) if err.is_unauthorized() => return RenewalOutcome::Unauthorized,
            Err(err) => {
                tracing::warn!(target: "beach::session", error = %err, "identity refresh after renewal failed");
            }
        }

        if !self.is_current(generation) {
            return RenewalOutcome::Discarded;
        }
        self.arm_renewal(Duration::from_secs(grant.refresh_in));
        tracing::info!(
            target: "beach::session",
            %trigger,
            refresh_in = grant.refresh_in,
            renew_at = %format_epoch_ms(deadline),
            "credential renewed"
        );
        RenewalOutcome::Renewed
    }

    async fn watchdog_tick(self: &Arc<Self>) -> Option<RenewalOutcome> {
        let deadline = self.schedule.renew_at()?;
        if self.clock.now_ms() < deadline {
            return None;
        }
        tracing::debug!(
            target: "beach::session",
            renew_at = %format_epoch_ms(deadline),
            "watchdog found an overdue renewal"
        );
        Some(self.attempt_renewal(RenewalTrigger::Watchdog).await)
    }

    async fn resync(self: &Arc<Self>) -> ResyncOutcome {
        let Some(deadline) = self.schedule.renew_at() else {
            return ResyncOutcome::Idle;
        };
        let now = self.clock.now_ms();
        if now >= deadline {
            ResyncOutcome::Renewal(self.attempt_renewal(RenewalTrigger::Resync).await)
        } else {
            let delay = self.arm_renewal(delay_until(deadline, now));
            tracing::debug!(
                target: "beach::session",
                delay_ms = delay.as_millis() as u64,
                "renewal timer resynced"
            );
            ResyncOutcome::Rearmed(delay)
        }
    }

    fn arm_renewal(self: &Arc<Self>, delay: Duration) -> Duration {
        let weak = Arc::downgrade(self);
        self.timer.arm(delay, async move {
            if let Some(inner) = weak.upgrade() {
                inner.attempt_renewal(RenewalTrigger::Timer).await;
            }
        })
    }

    fn ensure_watchdog(self: &Arc<Self>) {
        let weak = Arc::downgrade(self);
        self.watchdog.start(move || {
            let weak = weak.clone();
            async move {
                match weak.upgrade() {
                    Some(inner) => {
                        inner.watchdog_tick().await;
                        true
                    }
                    None => false,
                }
            }
        });
    }

    fn handle_unauthorized(&self, signal: Unauthorized) {
        let fence = self.signal_fence.load(Ordering::SeqCst);
        if signal.sequence <= fence {
            tracing::debug!(
                target: "beach::session",
                sequence = signal.sequence,
                fence,
                "ignoring unauthorized signal raised before the current sign-in"
            );
            return;
        }
        self.advance_generation();
        self.timer.disarm();
        self.watchdog.stop();
        if let Err(err) = self.schedule.clear() {
            tracing::warn!(target: "beach::session", error = %err, "failed to clear session store");
        }

        let location = self.navigator.current_location();
        if self.routes.is_protected(&location) {
            let target = self.routes.sign_in_location(Some(&location));
            tracing::info!(target: "beach::session", from = %location, to = %target, "session lost; redirecting to sign-in");
            self.navigator.navigate(&target);
        } else {
            tracing::info!(target: "beach::session", location = %location, "session lost on a public page");
        }
        self.publish(Session::anonymous());
    }

    fn shutdown(&self) {
        self.advance_generation();
        self.timer.disarm();
        self.watchdog.stop();
        if let Some(listener) = self.listener.lock().take() {
            listener.abort();
        }
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        if let Some(listener) = self.listener.get_mut().take() {
            listener.abort();
        }
    }
}
