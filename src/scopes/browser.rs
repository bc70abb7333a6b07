//! Isolated browser scope.
//!
//! Launches a detached browser against an ephemeral, hardened profile
//! and tracks it only by PID. The profile directory is removed on revert
//! only once the process has actually exited — never out from under a
//! running browser.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use nix::sys::signal::Signal;
use tracing::{info, warn};

use crate::error::Result;
use crate::runner::CommandRunner;
use crate::scopes::{Drift, ScopeApplier};
use crate::session::{Scope, Session};

const BROWSER_BIN: &str = "firefox";
const GRACE_INTERVAL: Duration = Duration::from_millis(200);
const GRACE_PROBES: u32 = 10;

pub struct BrowserScope {
    runner: Arc<dyn CommandRunner>,
    profile_base: PathBuf,
    trr_uri: Option<String>,
    /// Signal the PID on revert instead of leaving the browser running.
    kill: bool,
    grace_interval: Duration,
    grace_probes: u32,
}

impl BrowserScope {
    pub fn new(runner: Arc<dyn CommandRunner>, profile_base: PathBuf) -> Self {
        Self {
            runner,
            profile_base,
            trr_uri: None,
            kill: true,
            grace_interval: GRACE_INTERVAL,
            grace_probes: GRACE_PROBES,
        }
    }

    #[cfg(test)]
    fn with_grace(mut self, interval: Duration, probes: u32) -> Self {
        self.grace_interval = interval;
        self.grace_probes = probes;
        self
    }

    pub fn with_trr_uri(mut self, uri: Option<String>) -> Self {
        self.trr_uri = uri;
        self
    }

    pub fn with_kill(mut self, kill: bool) -> Self {
        self.kill = kill;
        self
    }

    /// Create the profile directory and launch the detached browser.
    /// Shared by the session scope and the standalone `browser` command.
    pub async fn launch(&self, profile_name: &str) -> Result<(PathBuf, u32)> {
        let profile = self.profile_base.join(profile_name);
        tokio::fs::create_dir_all(&profile).await?;
        tokio::fs::write(profile.join("user.js"), hardened_prefs(self.trr_uri.as_deref()))
            .await?;

        let dir = profile.display().to_string();
        let pid = self
            .runner
            .spawn_detached(BROWSER_BIN, &["--no-remote", "--new-instance", "--profile", &dir])
            .await?;

        info!("hardened browser launched (pid {pid}, profile {dir})");
        Ok((profile, pid))
    }
}

/// Hardened preference set: HTTPS-only, tracker blocking, telemetry off,
/// optionally DNS-over-HTTPS with a custom resolver.
pub fn hardened_prefs(trr_uri: Option<&str>) -> String {
    let mut prefs = String::from(
        r#"user_pref("dom.security.https_only_mode", true);
user_pref("privacy.trackingprotection.enabled", true);
user_pref("privacy.trackingprotection.socialtracking.enabled", true);
user_pref("privacy.donottrackheader.enabled", true);
user_pref("network.cookie.cookieBehavior", 5);
user_pref("toolkit.telemetry.enabled", false);
user_pref("toolkit.telemetry.unified", false);
user_pref("datareporting.healthreport.uploadEnabled", false);
user_pref("app.shield.optoutstudies.enabled", false);
user_pref("browser.formfill.enable", false);
user_pref("signon.rememberSignons", false);
"#,
    );
    if let Some(uri) = trr_uri {
        prefs.push_str("user_pref(\"network.trr.mode\", 3);\n");
        prefs.push_str(&format!("user_pref(\"network.trr.uri\", \"{uri}\");\n"));
    }
    prefs
}

#[async_trait]
impl ScopeApplier for BrowserScope {
    fn scope(&self) -> Scope {
        Scope::Browser
    }

    async fn apply(&self, session: &mut Session) -> Result<()> {
        // Record the profile path up front so a failed launch still gets
        // its directory cleaned up by disable.
        session.browser_profile = Some(self.profile_base.join(&session.id));
        let (profile, pid) = self.launch(&session.id).await?;
        session.browser_profile = Some(profile);
        session.browser_pid = Some(pid);
        Ok(())
    }

    async fn revert(&self, session: &Session) -> Vec<String> {
        let mut warnings = Vec::new();

        if let Some(pid) = session.browser_pid {
            if self.kill && self.runner.process_alive(pid) {
                match self.runner.signal(pid, Signal::SIGTERM) {
                    Err(e) => warnings.push(format!("terminate browser pid {pid}: {e}")),
                    Ok(()) => {
                        // A just-signaled browser takes a moment to exit;
                        // give it a bounded grace period before deciding
                        // what to do with the profile.
                        for _ in 0..self.grace_probes {
                            if !self.runner.process_alive(pid) {
                                break;
                            }
                            tokio::time::sleep(self.grace_interval).await;
                        }
                    }
                }
            }

            if let Some(profile) = &session.browser_profile {
                if self.runner.process_alive(pid) {
                    // Never delete live browser state.
                    warnings.push(format!(
                        "browser pid {pid} still running — leaving profile {} in place",
                        profile.display()
                    ));
                } else if let Err(e) = tokio::fs::remove_dir_all(profile).await {
                    if e.kind() != std::io::ErrorKind::NotFound {
                        warnings.push(format!("remove profile {}: {e}", profile.display()));
                    }
                } else {
                    info!("browser profile {} removed", profile.display());
                }
            }
        } else if let Some(profile) = &session.browser_profile {
            // No PID recorded: the launch failed after the dir was made.
            if let Err(e) = tokio::fs::remove_dir_all(profile).await {
                if e.kind() != std::io::ErrorKind::NotFound {
                    warnings.push(format!("remove profile {}: {e}", profile.display()));
                }
            }
        }

        if !warnings.is_empty() {
            warn!("browser revert finished with {} warning(s)", warnings.len());
        }
        warnings
    }

    async fn describe(&self, session: &Session) -> Drift {
        let Some(pid) = session.browser_pid else {
            return Drift::ok(Scope::Browser, "not applied");
        };
        if self.runner.process_alive(pid) {
            Drift::ok(Scope::Browser, format!("pid {pid} running"))
        } else {
            Drift::mismatch(
                Scope::Browser,
                format!("pid {pid} running"),
                format!("pid {pid} exited"),
            )
        }
    }
}
