//! The session aggregate: one persisted record describing the currently
//! active hardening configuration and its lifecycle bounds.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Result, ShroudError};

/// A named, independently applicable/revertible unit of hardening.
///
/// Order of the variants is the fixed application order; reverts run in
/// reverse. Shell hygiene is emitted, never applied, so it has no variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Scope {
    Firewall,
    Identity,
    Vpn,
    Browser,
}

impl Scope {
    pub fn name(&self) -> &'static str {
        match self {
            Scope::Firewall => "firewall",
            Scope::Identity => "identity",
            Scope::Vpn => "vpn",
            Scope::Browser => "browser",
        }
    }

    pub fn from_name(s: &str) -> Option<Scope> {
        match s {
            "firewall" => Some(Scope::Firewall),
            "identity" => Some(Scope::Identity),
            "vpn" => Some(Scope::Vpn),
            "browser" => Some(Scope::Browser),
            _ => None,
        }
    }
}

impl std::fmt::Display for Scope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Advisory persistence intent. Documents how long the operator expects
/// the hardening to live; it does not change mechanics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PersistMode {
    #[default]
    Session,
    Os,
    Manual,
}

impl PersistMode {
    pub fn name(&self) -> &'static str {
        match self {
            PersistMode::Session => "session",
            PersistMode::Os => "os",
            PersistMode::Manual => "manual",
        }
    }

    pub fn from_name(s: &str) -> Option<PersistMode> {
        match s {
            "session" => Some(PersistMode::Session),
            "os" => Some(PersistMode::Os),
            "manual" => Some(PersistMode::Manual),
            _ => None,
        }
    }
}

/// Requested cloned-MAC mode. `Preserve` is a recorded no-op.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MacMode {
    Stable,
    #[default]
    Random,
    Preserve,
}

impl MacMode {
    pub fn name(&self) -> &'static str {
        match self {
            MacMode::Stable => "stable",
            MacMode::Random => "random",
            MacMode::Preserve => "preserve",
        }
    }
}

/// VPN sub-state. At most one kind can be live; the enum makes the
/// mutual exclusion structural rather than validated.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase", tag = "kind")]
pub enum VpnState {
    #[default]
    None,
    Tunnel {
        config: PathBuf,
        interface: String,
    },
    Managed {
        config: PathBuf,
        unit: String,
    },
}

impl VpnState {
    pub fn kind(&self) -> &'static str {
        match self {
            VpnState::None => "none",
            VpnState::Tunnel { .. } => "tunnel",
            VpnState::Managed { .. } => "managed",
        }
    }

    /// Interface name the kill-switch should allow, if one is known.
    pub fn interface(&self) -> Option<&str> {
        match self {
            VpnState::Tunnel { interface, .. } if !interface.is_empty() => Some(interface),
            _ => None,
        }
    }
}

/// The sole persisted aggregate. Built in full by `enable`, read by
/// `status`/`checklist`/`remind`, destroyed by `disable`.
///
/// A sub-state group is populated iff its scope is in `scopes`; a missing
/// group after disable means "not applicable", never "unknown".
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    /// Record existence is the primary active signal; this is defensive.
    pub active: bool,
    pub start_time: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub end_time: Option<DateTime<Utc>>,
    pub scopes: Vec<Scope>,
    pub persist_mode: PersistMode,
    pub remind: bool,

    // Firewall
    #[serde(skip_serializing_if = "Option::is_none")]
    pub firewall_table: Option<String>,

    // Identity
    #[serde(skip_serializing_if = "Option::is_none")]
    pub connection: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub identity_property: Option<String>,
    /// Snapshot taken before the change. `Some("")` means the property
    /// was unset; `None` means the scope never touched it.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub previous_mac: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub requested_mac: Option<String>,

    // VPN
    #[serde(default)]
    pub vpn: VpnState,

    // Browser
    #[serde(skip_serializing_if = "Option::is_none")]
    pub browser_profile: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub browser_pid: Option<u32>,

    // Timers
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expire_job: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub remind_jobs: Vec<String>,
}

impl Session {
    pub fn new(scopes: Vec<Scope>, end_time: Option<DateTime<Utc>>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            active: true,
            start_time: Utc::now(),
            end_time,
            scopes,
            persist_mode: PersistMode::default(),
            remind: false,
            firewall_table: None,
            connection: None,
            identity_property: None,
            previous_mac: None,
            requested_mac: None,
            vpn: VpnState::None,
            browser_profile: None,
            browser_pid: None,
            expire_job: None,
            remind_jobs: Vec::new(),
        }
    }

    pub fn has_scope(&self, scope: Scope) -> bool {
        self.scopes.contains(&scope)
    }

    /// Total planned duration in seconds, if the session has an end.
    pub fn total_secs(&self) -> Option<u64> {
        self.end_time
            .map(|end| (end - self.start_time).num_seconds().max(0) as u64)
    }

    /// Seconds until expiry, clamped to zero. `None` for manual sessions.
    pub fn remaining_secs(&self) -> Option<u64> {
        self.end_time
            .map(|end| (end - Utc::now()).num_seconds().max(0) as u64)
    }
}

/// Expand CLI scope names into applier scopes.
///
/// `network` expands to {firewall, identity, vpn}; `shell` is returned
/// separately because shell hygiene is stateless and never persisted.
/// The result keeps the fixed application order and is deduplicated.
pub fn parse_scopes(names: &[String]) -> Result<(Vec<Scope>, bool)> {
    let mut scopes = Vec::new();
    let mut shell = false;

    for raw in names.iter().flat_map(|n| n.split(',')) {
        let name = raw.trim();
        match name {
            "" => {}
            "network" => scopes.extend([Scope::Firewall, Scope::Identity, Scope::Vpn]),
            "browser" => scopes.push(Scope::Browser),
            "shell" => shell = true,
            other => match Scope::from_name(other) {
                Some(s) => scopes.push(s),
                None => {
                    return Err(ShroudError::Validation(format!(
                        "unknown scope '{other}' — expected network, browser or shell"
                    )))
                }
            },
        }
    }

    scopes.sort();
    scopes.dedup();
    Ok((scopes, shell))
}
