//! shroud — session-scoped network hardening.
//!
//! For a bounded time window, applies a composable set of protective
//! measures (kill-switch firewall, MAC rotation, VPN tunnel, isolated
//! browser, shell hygiene) and guarantees they can be cleanly and
//! idempotently reverted — by explicit command or by an unattended
//! expiry timer.

pub mod error;
pub mod notify;
pub mod orchestrator;
pub mod runner;
pub mod scopes;
pub mod session;
pub mod store;
pub mod timer;

pub use error::{Result, ShroudError};
pub use orchestrator::{DisableOptions, EnableOptions, Orchestrator};
pub use session::{MacMode, PersistMode, Scope, Session, VpnState};
pub use store::SessionStore;
