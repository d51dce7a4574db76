#![allow(dead_code)]

use async_trait::async_trait;
use beach_session::{
    AuthApi, Credentials, Identity, LoginGrant, ManualClock, MemoryNavigator,
    MemoryScheduleStore, RefreshGrant, SessionCoordinator, SessionError, UnauthorizedBus,
};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Notify, Semaphore};

pub const T0: i64 = 1_700_000_000_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reply {
    Ok,
    Reject,
    Network,
}

/// In-process stand-in for the auth server. Like the HTTP adapter it raises
/// the bus signal when `refresh` or `me` is rejected.
pub struct ScriptedApi {
    bus: UnauthorizedBus,
    identity: Mutex<Identity>,
    refresh_in: AtomicU64,
    login_reply: Mutex<Reply>,
    refresh_reply: Mutex<Reply>,
    me_reply: Mutex<Reply>,
    logout_reply: Mutex<Reply>,
    gate_refresh: AtomicBool,
    refresh_entered: Notify,
    refresh_release: Semaphore,
    pub login_calls: AtomicUsize,
    pub refresh_calls: AtomicUsize,
    pub me_calls: AtomicUsize,
    pub logout_calls: AtomicUsize,
}

impl ScriptedApi {
    pub fn new(bus: UnauthorizedBus) -> Arc<Self> {
        Arc::new(Self {
            bus,
            identity: Mutex::new(ada()),
            refresh_in: AtomicU64::new(900),
            login_reply: Mutex::new(Reply::Ok),
            refresh_reply: Mutex::new(Reply::Ok),
            me_reply: Mutex::new(Reply::Ok),
            logout_reply: Mutex::new(Reply::Ok),
            gate_refresh: AtomicBool::new(false),
            refresh_entered: Notify::new(),
            refresh_release: Semaphore::new(0),
            login_calls: AtomicUsize::new(0),
            refresh_calls: AtomicUsize::new(0),
            me_calls: AtomicUsize::new(0),
            logout_calls: AtomicUsize::new(0),
        })
    }

    pub fn set_refresh_in(&self, seconds: u64) {
        self.refresh_in.store(seconds, Ordering::SeqCst);
    }

    pub fn set_identity(&self, identity: Identity) {
        *self.identity.lock() = identity;
    }

    pub fn login_reply(&self, reply: Reply) {
        *self.login_reply.lock() = reply;
    }

    pub fn refresh_reply(&self, reply: Reply) {
        *self.refresh_reply.lock() = reply;
    }

    pub fn me_reply(&self, reply: Reply) {
        *self.me_reply.lock() = reply;
    }

    pub fn logout_reply(&self, reply: Reply) {
        *self.logout_reply.lock() = reply;
    }

    /// Makes `refresh` wait for [`release_refresh`](Self::release_refresh).
    pub fn gate_refresh(&self) {
        self.gate_refresh.store(true, Ordering::SeqCst);
    }

    pub fn release_refresh(&self) {
        self.refresh_release.add_permits(1);
    }

    /// Resolves once a gated `refresh` call is waiting.
    pub async fn refresh_started(&self) {
        self.refresh_entered.notified().await;
    }

    pub fn refreshes(&self) -> usize {
        self.refresh_calls.load(Ordering::SeqCst)
    }

    fn rejected(&self) -> SessionError {
        self.bus.publish();
        SessionError::Unauthorized
    }
}

#[async_trait]
impl AuthApi for ScriptedApi {
    async fn login(&self, _credentials: &Credentials) -> Result<LoginGrant, SessionError> {
        self.login_calls.fetch_add(1, Ordering::SeqCst);
        match *self.login_reply.lock() {
            Reply::Ok => Ok(LoginGrant {
                refresh_in: self.refresh_in.load(Ordering::SeqCst),
                extra: Default::default(),
            }),
            Reply::Reject => Err(SessionError::InvalidCredentials),
            Reply::Network => Err(SessionError::Network("connection refused".into())),
        }
    }

    async fn refresh(&self) -> Result<RefreshGrant, SessionError> {
        self.refresh_calls.fetch_add(1, Ordering::SeqCst);
        if self.gate_refresh.load(Ordering::SeqCst) {
            self.refresh_entered.notify_one();
            self.refresh_release
                .acquire()
                .await
                .expect("refresh gate closed")
                .forget();
        }
        let reply = *self.refresh_reply.lock();
        match reply {
            Reply::Ok => Ok(RefreshGrant {
                refresh_in: self.refresh_in.load(Ordering::SeqCst),
            }),
            Reply::Reject => Err(self.rejected()),
            Reply::Network => Err(SessionError::Timeout),
        }
    }

    async fn logout(&self) -> Result<(), SessionError> {
        self.logout_calls.fetch_add(1, Ordering::SeqCst);
        match *self.logout_reply.lock() {
            Reply::Ok => Ok(()),
            Reply::Reject => Err(SessionError::Unauthorized),
            Reply::Network => Err(SessionError::Network("connection reset".into())),
        }
    }

    async fn me(&self) -> Result<Identity, SessionError> {
        self.me_calls.fetch_add(1, Ordering::SeqCst);
        let reply = *self.me_reply.lock();
        match reply {
            Reply::Ok => Ok(self.identity.lock().clone()),
            Reply::Reject => Err(self.rejected()),
            Reply::Network => Err(SessionError::Network("connection refused".into())),
        }
    }
}

pub fn ada() -> Identity {
    Identity {
        id: "u-1".into(),
        email: "ada@example.com".into(),
        display_name: "Ada".into(),
        role: "admin".into(),
    }
}

pub fn credentials() -> Credentials {
    Credentials::new("ada@example.com", "correct horse")
}

pub struct Harness {
    pub bus: UnauthorizedBus,
    pub api: Arc<ScriptedApi>,
    pub store: Arc<MemoryScheduleStore>,
    pub clock: Arc<ManualClock>,
    pub navigator: Arc<MemoryNavigator>,
}

impl Harness {
    pub fn new(location: &str) -> Self {
        let bus = UnauthorizedBus::new();
        Self {
            api: ScriptedApi::new(bus.clone()),
            bus,
            store: MemoryScheduleStore::new(),
            clock: Arc::new(ManualClock::new(T0)),
            navigator: Arc::new(MemoryNavigator::new(location)),
        }
    }

    pub fn coordinator(&self, watchdog_period: Duration) -> SessionCoordinator {
        SessionCoordinator::builder(self.api.clone())
            .store(self.store.clone())
            .clock(self.clock.clone())
            .navigator(self.navigator.clone())
            .bus(self.bus.clone())
            .watchdog_period(watchdog_period)
            .build()
    }

    /// Coordinator whose watchdog never ticks during a test.
    pub fn quiet_coordinator(&self) -> SessionCoordinator {
        self.coordinator(Duration::from_secs(24 * 60 * 60))
    }
}

pub async fn settle() {
    for _ in 0..16 {
        tokio::task::yield_now().await;
    }
}
