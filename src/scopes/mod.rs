//! Scope appliers: the polymorphic units of hardening.
//!
//! Each applier mutates the working session on `apply`, tears its
//! resource down on `revert` (warnings only — teardown always finishes),
//! and reports drift between recorded intent and live state on
//! `describe`.

use async_trait::async_trait;
use serde::Serialize;

use crate::error::Result;
use crate::session::{Scope, Session};

pub mod browser;
pub mod firewall;
pub mod identity;
pub mod shell;
pub mod vpn;

pub use browser::BrowserScope;
pub use firewall::FirewallScope;
pub use identity::IdentityScope;
pub use vpn::VpnScope;

/// Mismatch report between the session's recorded intent and the
/// observed external state for one scope.
#[derive(Debug, Clone, Serialize)]
pub struct Drift {
    pub scope: Scope,
    pub expected: String,
    pub observed: String,
    pub ok: bool,
}

impl Drift {
    pub fn ok(scope: Scope, state: impl Into<String>) -> Self {
        let state = state.into();
        Self {
            scope,
            expected: state.clone(),
            observed: state,
            ok: true,
        }
    }

    pub fn mismatch(
        scope: Scope,
        expected: impl Into<String>,
        observed: impl Into<String>,
    ) -> Self {
        Self {
            scope,
            expected: expected.into(),
            observed: observed.into(),
            ok: false,
        }
    }
}

#[async_trait]
pub trait ScopeApplier: Send + Sync {
    fn scope(&self) -> Scope;

    /// Apply the hardening measure, recording whatever references the
    /// later revert will need into the session.
    async fn apply(&self, session: &mut Session) -> Result<()>;

    /// Undo the measure. Failures are downgraded to warnings so the rest
    /// of the teardown always runs.
    async fn revert(&self, session: &Session) -> Vec<String>;

    /// Compare recorded intent against live state.
    async fn describe(&self, session: &Session) -> Drift;
}
