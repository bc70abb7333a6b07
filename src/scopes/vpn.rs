//! VPN scope: wireguard tunnel or a supervised client process.
//!
//! Exactly one kind can be requested per apply. Bring-up waits for the
//! interface (or unit) with a bounded poll; not observing it within the
//! deadline is a hard error so the session fails closed instead of
//! hanging half-connected.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use crate::error::{Result, ShroudError};
use crate::runner::CommandRunner;
use crate::scopes::{Drift, ScopeApplier};
use crate::session::{Scope, Session, VpnState};

const UNIT_NAME: &str = "shroud-vpn";
const POLL_INTERVAL: Duration = Duration::from_millis(500);
const POLL_DEADLINE: Duration = Duration::from_secs(15);

/// What the operator asked for. The two kinds are mutually exclusive at
/// the CLI layer already; this type keeps it that way internally.
#[derive(Debug, Clone)]
pub enum VpnRequest {
    /// `wg-quick up <config>`; interface name is the config file stem.
    Tunnel(PathBuf),
    /// Launch the client under a transient user unit.
    Managed(PathBuf),
}

pub struct VpnScope {
    runner: Arc<dyn CommandRunner>,
    request: Option<VpnRequest>,
    poll_interval: Duration,
    poll_deadline: Duration,
}

impl VpnScope {
    pub fn new(runner: Arc<dyn CommandRunner>, request: Option<VpnRequest>) -> Self {
        Self {
            runner,
            request,
            poll_interval: POLL_INTERVAL,
            poll_deadline: POLL_DEADLINE,
        }
    }

    #[cfg(test)]
    fn with_poll(mut self, interval: Duration, deadline: Duration) -> Self {
        self.poll_interval = interval;
        self.poll_deadline = deadline;
        self
    }

    async fn interface_up(&self, iface: &str) -> bool {
        match self.runner.run("ip", &["link", "show", iface]).await {
            Ok(out) => out.ok,
            Err(_) => false,
        }
    }

    async fn unit_active(&self, unit: &str) -> bool {
        match self
            .runner
            .run("systemctl", &["--user", "is-active", "--quiet", unit])
            .await
        {
            Ok(out) => out.ok,
            Err(_) => false,
        }
    }

    /// Bounded readiness poll. `probe` is re-run every interval until it
    /// reports up or the deadline passes.
    async fn wait_ready<F, Fut>(&self, what: &str, probe: F) -> Result<()>
    where
        F: Fn() -> Fut,
        Fut: std::future::Future<Output = bool>,
    {
        let deadline = tokio::time::Instant::now() + self.poll_deadline;
        loop {
            if probe().await {
                return Ok(());
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(ShroudError::Scope {
                    scope: "vpn".into(),
                    msg: format!(
                        "{what} did not come up within {}s",
                        self.poll_deadline.as_secs()
                    ),
                });
            }
            tokio::time::sleep(self.poll_interval).await;
        }
    }
}

/// Interface name for a wg-quick config: the file stem (`wg0.conf` → `wg0`).
pub fn interface_name(config: &Path) -> String {
    config
        .file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_else(|| "wg0".to_string())
}

#[async_trait]
impl ScopeApplier for VpnScope {
    fn scope(&self) -> Scope {
        Scope::Vpn
    }

    async fn apply(&self, session: &mut Session) -> Result<()> {
        let Some(request) = &self.request else {
            return Err(ShroudError::Scope {
                scope: "vpn".into(),
                msg: "no VPN configured — pass --vpn-tunnel or --vpn-process".into(),
            });
        };

        match request {
            VpnRequest::Tunnel(config) => {
                let iface = interface_name(config);
                let cfg = config.display().to_string();
                let out = self.runner.run("wg-quick", &["up", &cfg]).await?;
                if !out.ok {
                    return Err(ShroudError::Scope {
                        scope: "vpn".into(),
                        msg: format!("wg-quick up: {}", out.stderr.trim()),
                    });
                }

                // Record the sub-state before the readiness poll: if the
                // interface never appears we fail closed, but disable can
                // still tear down whatever wg-quick brought up.
                session.vpn = VpnState::Tunnel {
                    config: config.clone(),
                    interface: iface.clone(),
                };

                self.wait_ready(&format!("interface {iface}"), || self.interface_up(&iface))
                    .await?;
                info!("VPN tunnel {iface} is up");
            }
            VpnRequest::Managed(config) => {
                let cfg = config.display().to_string();
                let out = self
                    .runner
                    .run(
                        "systemd-run",
                        &["--user", "--unit", UNIT_NAME, "--collect", &cfg],
                    )
                    .await?;
                if !out.ok {
                    return Err(ShroudError::Scope {
                        scope: "vpn".into(),
                        msg: format!("systemd-run: {}", out.stderr.trim()),
                    });
                }

                session.vpn = VpnState::Managed {
                    config: config.clone(),
                    unit: UNIT_NAME.to_string(),
                };

                self.wait_ready(&format!("unit {UNIT_NAME}"), || self.unit_active(UNIT_NAME))
                    .await?;
                info!("VPN client running under unit {UNIT_NAME}");
            }
        }

        Ok(())
    }

    async fn revert(&self, session: &Session) -> Vec<String> {
        let mut warnings = Vec::new();

        match &session.vpn {
            VpnState::None => {}
            VpnState::Tunnel { config, interface } => {
                if !self.interface_up(interface).await {
                    debug!("VPN interface {interface} already down");
                    return warnings;
                }
                let cfg = config.display().to_string();
                match self.runner.run("wg-quick", &["down", &cfg]).await {
                    Ok(out) if out.ok => info!("VPN tunnel {interface} torn down"),
                    Ok(out) => warnings.push(format!("wg-quick down: {}", out.stderr.trim())),
                    Err(e) => warnings.push(format!("wg-quick down: {e}")),
                }
            }
            VpnState::Managed { unit, .. } => {
                // `stop` on an already-dead unit exits non-zero; that is not
                // worth a warning.
                if !self.unit_active(unit).await {
                    debug!("VPN unit {unit} already stopped");
                    return warnings;
                }
                match self.runner.run("systemctl", &["--user", "stop", unit]).await {
                    Ok(out) if out.ok => info!("VPN unit {unit} stopped"),
                    Ok(out) => warnings.push(format!("systemctl stop {unit}: {}", out.stderr.trim())),
                    Err(e) => warnings.push(format!("systemctl stop {unit}: {e}")),
                }
            }
        }

        if !warnings.is_empty() {
            warn!("vpn revert finished with {} warning(s)", warnings.len());
        }
        warnings
    }

    async fn describe(&self, session: &Session) -> Drift {
        match &session.vpn {
            VpnState::None => Drift::ok(Scope::Vpn, "not applied"),
            VpnState::Tunnel { interface, .. } => {
                if self.interface_up(interface).await {
                    Drift::ok(Scope::Vpn, format!("interface {interface} up"))
                } else {
                    Drift::mismatch(
                        Scope::Vpn,
                        format!("interface {interface} up"),
                        format!("interface {interface} down"),
                    )
                }
            }
            VpnState::Managed { unit, .. } => {
                if self.unit_active(unit).await {
                    Drift::ok(Scope::Vpn, format!("unit {unit} active"))
                } else {
                    Drift::mismatch(
                        Scope::Vpn,
                        format!("unit {unit} active"),
                        format!("unit {unit} inactive"),
                    )
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runner::{CmdOutput, RecordingRunner};

    #[test]
    fn test_interface_name_from_config() {
        assert_eq!(interface_name(Path::new("/etc/wireguard/wg0.conf")), "wg0");
        assert_eq!(interface_name(Path::new("mullvad-se.conf")), "mullvad-se");
    }

    #[tokio::test]
    async fn test_apply_tunnel_records_interface() {
        let runner = Arc::new(RecordingRunner::new());
        let scope = VpnScope::new(
            runner.clone(),
            Some(VpnRequest::Tunnel(PathBuf::from("/etc/wireguard/wg0.conf"))),
        );
        let mut session = Session::new(vec![Scope::Vpn], None);

        scope.apply(&mut session).await.unwrap();

        assert!(runner.saw("wg-quick", "up /etc/wireguard/wg0.conf"));
        assert!(runner.saw("ip", "link show wg0"));
        assert_eq!(
            session.vpn,
            VpnState::Tunnel {
                config: PathBuf::from("/etc/wireguard/wg0.conf"),
                interface: "wg0".into(),
            }
        );
    }

    #[tokio::test]
    async fn test_apply_fails_closed_on_poll_timeout() {
        let runner = Arc::new(RecordingRunner::new());
        runner.stub("ip", "link show wg0", CmdOutput::failure("does not exist"));
        let scope = VpnScope::new(
            runner.clone(),
            Some(VpnRequest::Tunnel(PathBuf::from("wg0.conf"))),
        )
        .with_poll(Duration::from_millis(1), Duration::from_millis(5));
        let mut session = Session::new(vec![Scope::Vpn], None);

        let err = scope.apply(&mut session).await.unwrap_err();
        assert!(matches!(err, ShroudError::Scope { .. }));
        // fail closed, but the sub-state is recorded so disable can
        // still tear down whatever came up
        assert_eq!(session.vpn.kind(), "tunnel");
    }

    #[tokio::test]
    async fn test_apply_managed_uses_transient_unit() {
        let runner = Arc::new(RecordingRunner::new());
        let scope = VpnScope::new(
            runner.clone(),
            Some(VpnRequest::Managed(PathBuf::from("/usr/bin/openvpn-client"))),
        );
        let mut session = Session::new(vec![Scope::Vpn], None);

        scope.apply(&mut session).await.unwrap();

        assert!(runner.saw("systemd-run", "--unit shroud-vpn"));
        assert!(runner.saw("systemctl", "is-active"));
        assert_eq!(session.vpn.kind(), "managed");
    }

    #[tokio::test]
    async fn test_apply_without_request_errors() {
        let runner = Arc::new(RecordingRunner::new());
        let scope = VpnScope::new(runner, None);
        let mut session = Session::new(vec![Scope::Vpn], None);
        assert!(scope.apply(&mut session).await.is_err());
    }

    #[tokio::test]
    async fn test_revert_tunnel() {
        let runner = Arc::new(RecordingRunner::new());
        let scope = VpnScope::new(runner.clone(), None);
        let mut session = Session::new(vec![Scope::Vpn], None);
        session.vpn = VpnState::Tunnel {
            config: PathBuf::from("wg0.conf"),
            interface: "wg0".into(),
        };

        let warnings = scope.revert(&session).await;
        assert!(warnings.is_empty());
        assert!(runner.saw("wg-quick", "down wg0.conf"));
    }

    #[tokio::test]
    async fn test_revert_tolerates_already_down() {
        let runner = Arc::new(RecordingRunner::new());
        runner.stub("ip", "link show wg0", CmdOutput::failure("does not exist"));
        let scope = VpnScope::new(runner.clone(), None);
        let mut session = Session::new(vec![Scope::Vpn], None);
        session.vpn = VpnState::Tunnel {
            config: PathBuf::from("wg0.conf"),
            interface: "wg0".into(),
        };

        let warnings = scope.revert(&session).await;
        assert!(warnings.is_empty());
        assert!(!runner.saw("wg-quick", "down"));
    }

    #[tokio::test]
    async fn test_describe_managed_unit_drift() {
        let runner = Arc::new(RecordingRunner::new());
        runner.stub("systemctl", "is-active", CmdOutput::failure("inactive"));
        let scope = VpnScope::new(runner.clone(), None);
        let mut session = Session::new(vec![Scope::Vpn], None);
        session.vpn = VpnState::Managed {
            config: PathBuf::from("/usr/bin/openvpn-client"),
            unit: UNIT_NAME.into(),
        };

        let drift = scope.describe(&session).await;
        assert!(!drift.ok);
    }
}
