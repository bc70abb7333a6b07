//! The session state machine: Inactive → enable → Active → disable.
//!
//! `enable` validates everything before touching the system, applies
//! scopes in a fixed order, schedules timers, and persists exactly once
//! at the end — so a crash mid-enable leaves either no record (nothing
//! to revert) or a complete one (fully revertible). `disable` cancels
//! timers before reverting scopes so no reminder fires into a session
//! that is being dismantled, and clears the record unconditionally so
//! the system can never get stuck "active".

use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use colored::Colorize;
use tracing::{info, warn};

use crate::error::{Result, ShroudError};
use crate::notify::Notifier;
use crate::runner::CommandRunner;
use crate::scopes::vpn::VpnRequest;
use crate::scopes::{
    shell, BrowserScope, Drift, FirewallScope, IdentityScope, ScopeApplier, VpnScope,
};
use crate::session::{parse_scopes, MacMode, PersistMode, Scope, Session, VpnState};
use crate::store::SessionStore;
use crate::timer::TimerScheduler;

pub struct EnableOptions {
    pub scopes: Vec<String>,
    pub persist: PersistMode,
    pub duration: Option<Duration>,
    pub until: Option<DateTime<Utc>>,
    pub remind: bool,
    pub mac: MacMode,
    pub connection: Option<String>,
    pub lan_ok: bool,
    pub block_http: bool,
    pub vpn_tunnel: Option<PathBuf>,
    pub vpn_process: Option<PathBuf>,
    pub force: bool,
    pub log_event: bool,
}

impl Default for EnableOptions {
    fn default() -> Self {
        Self {
            scopes: vec!["network".to_string()],
            persist: PersistMode::Session,
            duration: None,
            until: None,
            remind: true,
            mac: MacMode::Random,
            connection: None,
            lan_ok: false,
            block_http: false,
            vpn_tunnel: None,
            vpn_process: None,
            force: false,
            log_event: true,
        }
    }
}

pub struct DisableOptions {
    pub kill_browser: bool,
    pub reconnect: bool,
    pub log_event: bool,
}

impl Default for DisableOptions {
    fn default() -> Self {
        Self {
            kill_browser: true,
            reconnect: false,
            log_event: true,
        }
    }
}

pub struct Orchestrator {
    store: SessionStore,
    runner: Arc<dyn CommandRunner>,
    exe: PathBuf,
    profile_base: PathBuf,
}

impl Orchestrator {
    pub fn new(
        store: SessionStore,
        runner: Arc<dyn CommandRunner>,
        exe: PathBuf,
        profile_base: PathBuf,
    ) -> Self {
        Self {
            store,
            runner,
            exe,
            profile_base,
        }
    }

    fn scheduler(&self) -> TimerScheduler {
        TimerScheduler::new(self.runner.clone(), self.exe.clone())
    }

    /// Record the lifecycle event in the system log; purely best-effort.
    async fn log_event(&self, enabled: bool, msg: &str) {
        if !enabled {
            return;
        }
        if let Err(e) = self.runner.run("logger", &["-t", "shroud", msg]).await {
            tracing::debug!("logger unavailable: {e}");
        }
    }

    fn enable_applier(&self, scope: Scope, opts: &EnableOptions) -> Box<dyn ScopeApplier> {
        match scope {
            Scope::Firewall => Box::new(
                FirewallScope::new(self.runner.clone(), opts.lan_ok)
                    .with_block_http(opts.block_http),
            ),
            Scope::Identity => Box::new(IdentityScope::new(
                self.runner.clone(),
                opts.mac,
                opts.connection.clone(),
            )),
            Scope::Vpn => {
                let request = opts
                    .vpn_tunnel
                    .clone()
                    .map(VpnRequest::Tunnel)
                    .or_else(|| opts.vpn_process.clone().map(VpnRequest::Managed));
                Box::new(VpnScope::new(self.runner.clone(), request))
            }
            Scope::Browser => {
                Box::new(BrowserScope::new(self.runner.clone(), self.profile_base.clone()))
            }
        }
    }

    fn disable_applier(&self, scope: Scope, opts: &DisableOptions) -> Box<dyn ScopeApplier> {
        match scope {
            Scope::Firewall => Box::new(FirewallScope::new(self.runner.clone(), false)),
            Scope::Identity => Box::new(
                IdentityScope::new(self.runner.clone(), MacMode::Preserve, None)
                    .with_reconnect(opts.reconnect),
            ),
            Scope::Vpn => Box::new(VpnScope::new(self.runner.clone(), None)),
            Scope::Browser => Box::new(
                BrowserScope::new(self.runner.clone(), self.profile_base.clone())
                    .with_kill(opts.kill_browser),
            ),
        }
    }

    /// Did the (possibly failed) apply leave this scope a revert target?
    fn scope_recorded(session: &Session, scope: Scope) -> bool {
        match scope {
            Scope::Firewall => session.firewall_table.is_some(),
            Scope::Identity => session.connection.is_some(),
            Scope::Vpn => session.vpn != VpnState::None,
            Scope::Browser => session.browser_profile.is_some(),
        }
    }

    /// Drop whatever a skipped scope may have recorded, keeping the
    /// sub-state-iff-scope invariant intact.
    fn clear_scope_state(session: &mut Session, scope: Scope) {
        match scope {
            Scope::Firewall => session.firewall_table = None,
            Scope::Identity => {
                session.connection = None;
                session.identity_property = None;
                session.previous_mac = None;
                session.requested_mac = None;
            }
            Scope::Vpn => session.vpn = VpnState::None,
            Scope::Browser => {
                session.browser_profile = None;
                session.browser_pid = None;
            }
        }
    }

    pub async fn enable(&self, opts: EnableOptions) -> Result<Session> {
        // All validation happens before any mutation.
        let (mut scopes, shell_requested) = parse_scopes(&opts.scopes)?;
        if scopes.is_empty() && !shell_requested {
            return Err(ShroudError::Validation("no scopes requested".into()));
        }
        if opts.duration.is_some() && opts.until.is_some() {
            return Err(ShroudError::Validation(
                "--for and --until are mutually exclusive".into(),
            ));
        }
        if opts.vpn_tunnel.is_some() && opts.vpn_process.is_some() {
            return Err(ShroudError::Validation(
                "--vpn-tunnel and --vpn-process are mutually exclusive".into(),
            ));
        }
        if let Some(until) = opts.until {
            if until <= Utc::now() {
                return Err(ShroudError::Validation(format!(
                    "--until {until} is not in the future"
                )));
            }
        }

        // Shell hygiene alone applies nothing, so there is nothing to
        // revert or expire: emit the fragment and leave no record behind.
        if scopes.is_empty() {
            println!("# eval this in your shell:");
            print!("{}", shell::hygiene_fragment());
            let mut session = Session::new(Vec::new(), None);
            session.active = false;
            return Ok(session);
        }

        if let Some(existing) = self.store.load().await? {
            if existing.active && !opts.force {
                return Err(ShroudError::Validation(
                    "a hardening session is already active — pass --force to supersede".into(),
                ));
            }
            info!("superseding session {}", existing.id);
            self.disable(DisableOptions {
                log_event: false,
                ..DisableOptions::default()
            })
            .await?;
        }

        // A vpn scope with nothing to bring up is dropped, not fatal:
        // `--scope network` without a VPN still gets the kill-switch.
        if scopes.contains(&Scope::Vpn)
            && opts.vpn_tunnel.is_none()
            && opts.vpn_process.is_none()
        {
            warn!("no --vpn-tunnel/--vpn-process given — skipping vpn scope");
            scopes.retain(|s| *s != Scope::Vpn);
        }

        let mut session = Session::new(scopes, None);
        session.end_time = match (opts.duration, opts.until) {
            (Some(d), None) => Some(session.start_time + d),
            (None, Some(t)) => Some(t),
            _ => None,
        };
        session.persist_mode = opts.persist;
        session.remind = opts.remind;

        // Fixed application order; a missing tool degrades its scope to
        // skipped-with-warning, any other failure is recorded but does
        // not roll back scopes already applied.
        let mut warnings = Vec::new();
        for scope in session.scopes.clone() {
            let applier = self.enable_applier(scope, &opts);
            match applier.apply(&mut session).await {
                Ok(()) => println!("{} {} applied", "✓".green(), scope),
                Err(ShroudError::ResourceMissing(tool)) => {
                    let msg = format!("{scope}: required tool '{tool}' not found — skipped");
                    warn!("{msg}");
                    println!("{} {msg}", "·".yellow());
                    session.scopes.retain(|s| *s != scope);
                    Self::clear_scope_state(&mut session, scope);
                    warnings.push(msg);
                }
                Err(e) => {
                    let msg = format!("{scope}: {e}");
                    warn!("partial apply: {msg}");
                    println!("{} {msg}", "!".red());
                    if !Self::scope_recorded(&session, scope) {
                        session.scopes.retain(|s| *s != scope);
                    }
                    warnings.push(msg);
                }
            }
        }

        // Timers are best-effort: a broken scheduler downgrades the
        // session to manual expiry, it does not abort the enable.
        let sched = self.scheduler();
        if let Err(e) = sched.schedule_expiry(&mut session).await {
            warn!("could not schedule expiry: {e}");
            warnings.push(format!("expiry not scheduled: {e}"));
        }
        if let Err(e) = sched.schedule_reminders(&mut session).await {
            warn!("could not schedule reminders: {e}");
        }

        // Single write at the very end: crash before this line leaves
        // nothing to revert, crash after leaves a complete record.
        self.store.save(&session).await?;

        let until = session
            .end_time
            .map(|t| t.with_timezone(&chrono::Local).format("%H:%M:%S").to_string())
            .unwrap_or_else(|| "manual disable".to_string());
        let scope_names: Vec<&str> = session.scopes.iter().map(|s| s.name()).collect();

        let summary = format!("hardening enabled [{}] until {until}", scope_names.join(", "));
        Notifier::new(self.runner.clone(), true).send("shroud", &summary).await;
        self.log_event(opts.log_event, &summary).await;
        println!(
            "{} session {} active until {}",
            "✓".green(),
            session.id.get(..8).unwrap_or(&session.id).cyan(),
            until.cyan()
        );

        if shell_requested {
            println!("\n# eval this in your shell:");
            print!("{}", shell::hygiene_fragment());
        }

        Ok(session)
    }

    /// Returns `true` when a session was actually torn down. A missing
    /// record is a successful no-op: the expiry timer may fire after a
    /// manual disable, and that must not be an error.
    pub async fn disable(&self, opts: DisableOptions) -> Result<bool> {
        let Some(session) = self.store.load().await? else {
            println!("{} no active session", "·".dimmed());
            return Ok(false);
        };

        // Cancel timers before touching scopes so no reminder or expiry
        // job re-enters a session mid-teardown.
        let mut warnings = self.scheduler().cancel_all(&session).await;

        // Revert in the reverse of application order, best-effort.
        for scope in session.scopes.iter().rev() {
            let applier = self.disable_applier(*scope, &opts);
            let scope_warnings = applier.revert(&session).await;
            if scope_warnings.is_empty() {
                println!("{} {} reverted", "✓".green(), scope);
            }
            warnings.extend(scope_warnings);
        }

        for w in &warnings {
            println!("{} {w}", "!".yellow());
        }

        // Cleared unconditionally: the system must never stay stuck
        // "active" because one revert step failed.
        self.store.clear().await?;
        info!("session {} disabled", session.id);

        Notifier::new(self.runner.clone(), true)
            .send("shroud", "hardening disabled")
            .await;
        self.log_event(opts.log_event, "hardening disabled").await;
        println!("{} session disabled", "✓".green());

        Ok(true)
    }

    /// Read-only projection of the persisted session.
    pub async fn status(&self, json: bool) -> Result<()> {
        let Some(session) = self.store.load().await? else {
            println!("{} inactive", "·".dimmed());
            return Ok(());
        };

        if json {
            println!("{}", serde_json::to_string_pretty(&session).unwrap_or_default());
            return Ok(());
        }

        let scope_names: Vec<&str> = session.scopes.iter().map(|s| s.name()).collect();
        println!("{:<12} {}", "STATE".bold(), if session.active { "active".green() } else { "stale".yellow() });
        println!("{:<12} {}", "SESSION".bold(), session.id);
        println!("{:<12} {}", "SCOPES".bold(), scope_names.join(", "));
        println!("{:<12} {}", "PERSIST".bold(), session.persist_mode.name());
        println!(
            "{:<12} {}",
            "STARTED".bold(),
            session.start_time.with_timezone(&chrono::Local).format("%Y-%m-%d %H:%M:%S")
        );
        match session.remaining_secs() {
            Some(secs) => println!("{:<12} {}", "REMAINING".bold(), format_secs(secs).cyan()),
            None => println!("{:<12} {}", "REMAINING".bold(), "manual disable".dimmed()),
        }
        if let VpnState::Tunnel { interface, .. } = &session.vpn {
            println!("{:<12} {}", "VPN".bold(), interface);
        }
        if let Some(pid) = session.browser_pid {
            println!("{:<12} {}", "BROWSER".bold(), pid);
        }
        Ok(())
    }

    /// Compare recorded intent against live external state, per scope.
    pub async fn checklist(&self, json: bool) -> Result<Vec<Drift>> {
        let Some(session) = self.store.load().await? else {
            println!("{} inactive — nothing to check", "·".dimmed());
            return Ok(Vec::new());
        };

        let opts = DisableOptions::default();
        let mut drifts = Vec::new();
        for scope in &session.scopes {
            let applier = self.disable_applier(*scope, &opts);
            drifts.push(applier.describe(&session).await);
        }

        if json {
            println!("{}", serde_json::to_string_pretty(&drifts).unwrap_or_default());
            return Ok(drifts);
        }

        for drift in &drifts {
            if drift.ok {
                println!("{} {:<10} {}", "✓".green(), drift.scope, drift.observed.dimmed());
            } else {
                println!(
                    "{} {:<10} expected {}, observed {}",
                    "✗".red(),
                    drift.scope,
                    drift.expected,
                    drift.observed.red()
                );
            }
        }
        Ok(drifts)
    }

    /// Scheduler re-entry point. An absent or inactive session means it
    /// was already disabled by hand — a silent, successful no-op.
    pub async fn remind(&self, tag: &str) -> Result<()> {
        let Some(session) = self.store.load().await? else {
            return Ok(());
        };
        if !session.active {
            return Ok(());
        }

        let remaining = session
            .remaining_secs()
            .map(format_secs)
            .unwrap_or_else(|| "unbounded".to_string());
        Notifier::new(self.runner.clone(), true)
            .send(
                "shroud",
                &format!("hardening session: {remaining} remaining ({tag})"),
            )
            .await;
        Ok(())
    }
}

pub fn format_secs(secs: u64) -> String {
    if secs < 60 {
        format!("{secs}s")
    } else if secs < 3600 {
        format!("{}m{}s", secs / 60, secs % 60)
    } else {
        format!("{}h{}m", secs / 3600, (secs % 3600) / 60)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_secs() {
        assert_eq!(format_secs(45), "45s");
        assert_eq!(format_secs(125), "2m5s");
        assert_eq!(format_secs(7260), "2h1m");
    }
}
