//! Network-identity (cloned MAC) scope.
//!
//! Snapshots the connection's cloned-mac-address property before setting
//! the requested mode, so revert can put back exactly what was there —
//! including "nothing".

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use crate::error::{Result, ShroudError};
use crate::runner::CommandRunner;
use crate::scopes::{Drift, ScopeApplier};
use crate::session::{MacMode, Scope, Session};

const WIFI_PROPERTY: &str = "802-11-wireless.cloned-mac-address";
const ETHERNET_PROPERTY: &str = "802-3-ethernet.cloned-mac-address";

pub struct IdentityScope {
    runner: Arc<dyn CommandRunner>,
    mode: MacMode,
    connection: Option<String>,
    /// Cycle the connection down/up after restoring, so the old address
    /// is actually presented again.
    reconnect: bool,
}

impl IdentityScope {
    pub fn new(runner: Arc<dyn CommandRunner>, mode: MacMode, connection: Option<String>) -> Self {
        Self {
            runner,
            mode,
            connection,
            reconnect: false,
        }
    }

    pub fn with_reconnect(mut self, reconnect: bool) -> Self {
        self.reconnect = reconnect;
        self
    }

    /// Resolve the target connection and its property key. Prefers the
    /// active wireless connection when none was named.
    async fn resolve(&self) -> Result<(String, &'static str)> {
        let out = self
            .runner
            .run(
                "nmcli",
                &["-t", "-f", "NAME,TYPE,DEVICE", "connection", "show", "--active"],
            )
            .await?;
        if !out.ok {
            return Err(ShroudError::Scope {
                scope: "identity".into(),
                msg: format!("nmcli failed: {}", out.stderr.trim()),
            });
        }

        let mut first: Option<(String, String)> = None;
        for line in out.stdout.lines() {
            let mut fields = line.split(':');
            let name = fields.next().unwrap_or("").to_string();
            let kind = fields.next().unwrap_or("").to_string();
            if name.is_empty() {
                continue;
            }
            if let Some(wanted) = &self.connection {
                if &name == wanted {
                    return Ok((name, property_for(&kind)));
                }
                continue;
            }
            if kind.contains("wireless") {
                return Ok((name, WIFI_PROPERTY));
            }
            if first.is_none() {
                first = Some((name, kind));
            }
        }

        if let Some(wanted) = &self.connection {
            // Named connection not in the active list: still usable, but we
            // cannot infer its type. Assume wifi, the common case.
            return Ok((wanted.clone(), WIFI_PROPERTY));
        }

        match first {
            Some((name, kind)) => Ok((name, property_for(&kind))),
            None => Err(ShroudError::Scope {
                scope: "identity".into(),
                msg: "no active network connection".into(),
            }),
        }
    }

    async fn read_property(&self, conn: &str, property: &str) -> Result<String> {
        let out = self
            .runner
            .run("nmcli", &["-g", property, "connection", "show", conn])
            .await?;
        let value = out.stdout.trim();
        // nmcli prints "--" for unset properties
        Ok(if value == "--" { String::new() } else { value.to_string() })
    }

    async fn write_property(&self, conn: &str, property: &str, value: &str) -> Result<()> {
        let out = self
            .runner
            .run("nmcli", &["connection", "modify", conn, property, value])
            .await?;
        if !out.ok {
            return Err(ShroudError::Scope {
                scope: "identity".into(),
                msg: format!("nmcli modify {property}: {}", out.stderr.trim()),
            });
        }
        Ok(())
    }
}

fn property_for(kind: &str) -> &'static str {
    if kind.contains("wireless") {
        WIFI_PROPERTY
    } else {
        ETHERNET_PROPERTY
    }
}

#[async_trait]
impl ScopeApplier for IdentityScope {
    fn scope(&self) -> Scope {
        Scope::Identity
    }

    async fn apply(&self, session: &mut Session) -> Result<()> {
        let (conn, property) = self.resolve().await?;
        let previous = self.read_property(&conn, property).await?;

        session.connection = Some(conn.clone());
        session.identity_property = Some(property.to_string());
        session.previous_mac = Some(previous.clone());
        session.requested_mac = Some(self.mode.name().to_string());

        if self.mode == MacMode::Preserve {
            debug!("identity mode preserve: leaving {conn} untouched");
            return Ok(());
        }

        self.write_property(&conn, property, self.mode.name()).await?;
        info!(
            "cloned MAC on {conn} set to {} (was '{previous}')",
            self.mode.name()
        );
        Ok(())
    }

    async fn revert(&self, session: &Session) -> Vec<String> {
        let mut warnings = Vec::new();
        let (Some(conn), Some(property)) = (&session.connection, &session.identity_property)
        else {
            return warnings;
        };

        if let Some(previous) = &session.previous_mac {
            // An empty snapshot means the property was unset before.
            if let Err(e) = self.write_property(conn, property, previous).await {
                warnings.push(format!("restore {property} on {conn}: {e}"));
            } else {
                info!("cloned MAC on {conn} restored");
            }
        }

        if self.reconnect {
            for step in ["down", "up"] {
                match self.runner.run("nmcli", &["connection", step, conn]).await {
                    Ok(out) if out.ok => {}
                    Ok(out) => warnings.push(format!(
                        "nmcli connection {step} {conn}: {}",
                        out.stderr.trim()
                    )),
                    Err(e) => warnings.push(format!("nmcli connection {step} {conn}: {e}")),
                }
            }
        }

        if !warnings.is_empty() {
            warn!("identity revert finished with {} warning(s)", warnings.len());
        }
        warnings
    }

    async fn describe(&self, session: &Session) -> Drift {
        let (Some(conn), Some(property), Some(requested)) = (
            &session.connection,
            &session.identity_property,
            &session.requested_mac,
        ) else {
            return Drift::ok(Scope::Identity, "not applied");
        };

        // `preserve` never modified the property, so the intent is the
        // snapshot, not the mode name.
        let expected = if requested == MacMode::Preserve.name() {
            session.previous_mac.clone().unwrap_or_default()
        } else {
            requested.clone()
        };

        match self.read_property(conn, property).await {
            Ok(live) if live == expected => Drift::ok(Scope::Identity, format!("{property}={live}")),
            Ok(live) => Drift::mismatch(
                Scope::Identity,
                format!("{property}={expected}"),
                format!("{property}={live}"),
            ),
            Err(e) => Drift::mismatch(
                Scope::Identity,
                format!("{property}={expected}"),
                format!("check failed: {e}"),
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runner::{CmdOutput, RecordingRunner};

    fn active_connections(runner: &RecordingRunner) {
        runner.stub(
            "nmcli",
            "connection show --active",
            CmdOutput::success("lan0:802-3-ethernet:eth0\nhome:802-11-wireless:wlan0\n"),
        );
    }

    #[tokio::test]
    async fn test_apply_prefers_wireless() {
        let runner = Arc::new(RecordingRunner::new());
        active_connections(&runner);
        runner.stub("nmcli", "-g 802-11-wireless", CmdOutput::success("AA:BB:CC:DD:EE:FF\n"));

        let scope = IdentityScope::new(runner.clone(), MacMode::Random, None);
        let mut session = Session::new(vec![Scope::Identity], None);
        scope.apply(&mut session).await.unwrap();

        assert_eq!(session.connection.as_deref(), Some("home"));
        assert_eq!(session.identity_property.as_deref(), Some(WIFI_PROPERTY));
        assert_eq!(session.previous_mac.as_deref(), Some("AA:BB:CC:DD:EE:FF"));
        assert_eq!(session.requested_mac.as_deref(), Some("random"));
        assert!(runner.saw("nmcli", "connection modify home 802-11-wireless.cloned-mac-address random"));
    }

    #[tokio::test]
    async fn test_apply_snapshots_unset_property() {
        let runner = Arc::new(RecordingRunner::new());
        active_connections(&runner);
        runner.stub("nmcli", "-g 802-11-wireless", CmdOutput::success("--\n"));

        let scope = IdentityScope::new(runner.clone(), MacMode::Stable, None);
        let mut session = Session::new(vec![Scope::Identity], None);
        scope.apply(&mut session).await.unwrap();

        assert_eq!(session.previous_mac.as_deref(), Some(""));
    }

    #[tokio::test]
    async fn test_apply_preserve_is_noop() {
        let runner = Arc::new(RecordingRunner::new());
        active_connections(&runner);

        let scope = IdentityScope::new(runner.clone(), MacMode::Preserve, None);
        let mut session = Session::new(vec![Scope::Identity], None);
        scope.apply(&mut session).await.unwrap();

        assert!(!runner.saw("nmcli", "connection modify"));
        assert_eq!(session.requested_mac.as_deref(), Some("preserve"));
    }

    #[tokio::test]
    async fn test_apply_named_connection() {
        let runner = Arc::new(RecordingRunner::new());
        active_connections(&runner);

        let scope = IdentityScope::new(runner.clone(), MacMode::Random, Some("lan0".into()));
        let mut session = Session::new(vec![Scope::Identity], None);
        scope.apply(&mut session).await.unwrap();

        assert_eq!(session.connection.as_deref(), Some("lan0"));
        assert_eq!(session.identity_property.as_deref(), Some(ETHERNET_PROPERTY));
    }

    #[tokio::test]
    async fn test_apply_no_active_connection() {
        let runner = Arc::new(RecordingRunner::new());
        runner.stub("nmcli", "connection show --active", CmdOutput::success(""));

        let scope = IdentityScope::new(runner.clone(), MacMode::Random, None);
        let mut session = Session::new(vec![Scope::Identity], None);
        assert!(scope.apply(&mut session).await.is_err());
    }

    #[tokio::test]
    async fn test_revert_restores_previous_value() {
        let runner = Arc::new(RecordingRunner::new());
        let scope = IdentityScope::new(runner.clone(), MacMode::Random, None);
        let mut session = Session::new(vec![Scope::Identity], None);
        session.connection = Some("home".into());
        session.identity_property = Some(WIFI_PROPERTY.into());
        session.previous_mac = Some("AA:BB:CC:DD:EE:FF".into());

        let warnings = scope.revert(&session).await;
        assert!(warnings.is_empty());
        assert!(runner.saw("nmcli", "modify home 802-11-wireless.cloned-mac-address AA:BB:CC:DD:EE:FF"));
        assert!(!runner.saw("nmcli", "connection down"));
    }

    #[tokio::test]
    async fn test_revert_clears_when_previously_unset() {
        let runner = Arc::new(RecordingRunner::new());
        let scope = IdentityScope::new(runner.clone(), MacMode::Random, None).with_reconnect(true);
        let mut session = Session::new(vec![Scope::Identity], None);
        session.connection = Some("home".into());
        session.identity_property = Some(WIFI_PROPERTY.into());
        session.previous_mac = Some(String::new());

        let warnings = scope.revert(&session).await;
        assert!(warnings.is_empty());
        // empty value clears the property
        let modifies = runner.calls_for("nmcli");
        assert!(modifies.iter().any(|c| c.args.ends_with(&[
            WIFI_PROPERTY.to_string(),
            String::new()
        ])));
        assert!(runner.saw("nmcli", "connection down home"));
        assert!(runner.saw("nmcli", "connection up home"));
    }

    #[tokio::test]
    async fn test_describe_compares_live_value() {
        let runner = Arc::new(RecordingRunner::new());
        runner.stub("nmcli", "-g 802-11-wireless", CmdOutput::success("random\n"));

        let scope = IdentityScope::new(runner.clone(), MacMode::Random, None);
        let mut session = Session::new(vec![Scope::Identity], None);
        session.connection = Some("home".into());
        session.identity_property = Some(WIFI_PROPERTY.into());
        session.requested_mac = Some("random".into());

        assert!(scope.describe(&session).await.ok);
    }

    #[tokio::test]
    async fn test_describe_preserve_checks_against_snapshot() {
        let runner = Arc::new(RecordingRunner::new());
        runner.stub("nmcli", "-g 802-11-wireless", CmdOutput::success("AA:BB:CC:DD:EE:FF\n"));

        let scope = IdentityScope::new(runner.clone(), MacMode::Preserve, None);
        let mut session = Session::new(vec![Scope::Identity], None);
        session.connection = Some("home".into());
        session.identity_property = Some(WIFI_PROPERTY.into());
        session.previous_mac = Some("AA:BB:CC:DD:EE:FF".into());
        session.requested_mac = Some("preserve".into());

        // unchanged property is OK, not drift
        assert!(scope.describe(&session).await.ok);

        session.previous_mac = Some("11:22:33:44:55:66".into());
        let drift = scope.describe(&session).await;
        assert!(!drift.ok);
        assert!(drift.expected.contains("11:22:33:44:55:66"));
    }
}
