//! Beach Session: client-side session and credential lifecycle.
//!
//! Responsibilities:
//! - caching the signed-in identity and exposing it as an observable session
//! - renewing the short-lived credential before it expires, one attempt at a time
//! - recovering missed renewals after sleep or suspension (watchdog, resync)
//! - turning authorization failures into a forced sign-out and redirect

pub mod api;
pub mod clock;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod identity;
pub mod route;
pub mod store;
pub mod timer;
pub mod watchdog;

pub use api::{AuthApi, Credentials, HttpAuthApi, LoginGrant, RefreshGrant};
pub use auth_bus::{Unauthorized, UnauthorizedBus};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::SessionConfig;
pub use coordinator::{
    CoordinatorBuilder, RenewalOutcome, RenewalTrigger, ResyncOutcome, SessionCoordinator,
};
pub use error::SessionError;
pub use identity::{Identity, Session};
pub use route::{MemoryNavigator, Navigator, RoutePolicy};
pub use store::{FileScheduleStore, MemoryScheduleStore, PersistedSchedule, ScheduleStore};
pub use timer::{TimerController, MAX_TIMER_DELAY};
