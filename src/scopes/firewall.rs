//! Kill-switch firewall scope.
//!
//! Creates an isolated nftables table with a default-deny inbound policy
//! and a narrow allow-list: loopback, established/related, the VPN
//! interface when the session has one, DHCP client traffic, and
//! optionally the RFC 1918 LAN ranges.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info};

use crate::error::{Result, ShroudError};
use crate::runner::CommandRunner;
use crate::scopes::{Drift, ScopeApplier};
use crate::session::{Scope, Session};

pub const TABLE_NAME: &str = "shroud-killswitch";

const LAN_RANGES: [&str; 3] = ["10.0.0.0/8", "172.16.0.0/12", "192.168.0.0/16"];

pub struct FirewallScope {
    runner: Arc<dyn CommandRunner>,
    lan_ok: bool,
    block_http: bool,
}

impl FirewallScope {
    pub fn new(runner: Arc<dyn CommandRunner>, lan_ok: bool) -> Self {
        Self {
            runner,
            lan_ok,
            block_http: false,
        }
    }

    /// Also reject outbound plaintext HTTP, forcing everything over TLS.
    pub fn with_block_http(mut self, block_http: bool) -> Self {
        self.block_http = block_http;
        self
    }

    async fn table_exists(&self) -> Result<bool> {
        let out = self
            .runner
            .run("nft", &["list", "table", "inet", TABLE_NAME])
            .await?;
        Ok(out.ok)
    }

    /// Run a mutating nft command; a non-zero exit is a hard error so the
    /// kill-switch can never be reported active without being installed.
    async fn nft(&self, args: &[&str]) -> Result<()> {
        let out = self.runner.run("nft", args).await?;
        if out.ok {
            return Ok(());
        }
        let stderr = out.stderr.trim().to_string();
        if stderr.contains("Operation not permitted") || stderr.contains("Permission denied") {
            return Err(ShroudError::Privilege(format!(
                "nft {}: {stderr}",
                args.first().copied().unwrap_or("")
            )));
        }
        Err(ShroudError::Scope {
            scope: "firewall".into(),
            msg: format!("nft {}: {stderr}", args.join(" ")),
        })
    }

    /// The ordered rule set for the input chain. The VPN interface rule
    /// is present only when the session knows its interface name.
    fn input_rules(&self, session: &Session) -> Vec<Vec<String>> {
        let mut rules: Vec<Vec<String>> = vec![
            svec(&["iif", "lo", "accept"]),
            svec(&["ct", "state", "established,related", "accept"]),
        ];
        if let Some(iface) = session.vpn.interface() {
            rules.push(svec(&["iifname", iface, "accept"]));
        }
        // DHCP client: server port 67 -> client port 68
        rules.push(svec(&["udp", "sport", "67", "udp", "dport", "68", "accept"]));
        if self.lan_ok {
            for range in LAN_RANGES {
                rules.push(svec(&["ip", "saddr", range, "accept"]));
            }
        }
        rules
    }
}

fn svec(parts: &[&str]) -> Vec<String> {
    parts.iter().map(|p| p.to_string()).collect()
}

#[async_trait]
impl ScopeApplier for FirewallScope {
    fn scope(&self) -> Scope {
        Scope::Firewall
    }

    async fn apply(&self, session: &mut Session) -> Result<()> {
        // Check-then-create: re-applying over an existing table is a no-op.
        if self.table_exists().await? {
            debug!("firewall table {TABLE_NAME} already present");
            session.firewall_table = Some(TABLE_NAME.to_string());
            return Ok(());
        }

        // Record the table name before creating anything so a failed
        // partial apply still leaves disable a revert target.
        session.firewall_table = Some(TABLE_NAME.to_string());

        self.nft(&["add", "table", "inet", TABLE_NAME]).await?;
        self.nft(&[
            "add", "chain", "inet", TABLE_NAME, "input",
            "{", "type", "filter", "hook", "input", "priority", "0", ";",
            "policy", "drop", ";", "}",
        ])
        .await?;

        for rule in self.input_rules(session) {
            let mut args = svec(&["add", "rule", "inet", TABLE_NAME, "input"]);
            args.extend(rule);
            let refs: Vec<&str> = args.iter().map(String::as_str).collect();
            self.nft(&refs).await?;
        }

        if self.block_http {
            self.nft(&[
                "add", "chain", "inet", TABLE_NAME, "output",
                "{", "type", "filter", "hook", "output", "priority", "0", ";",
                "policy", "accept", ";", "}",
            ])
            .await?;
            self.nft(&[
                "add", "rule", "inet", TABLE_NAME, "output",
                "tcp", "dport", "80", "reject",
            ])
            .await?;
        }

        info!("kill-switch table {TABLE_NAME} created");
        Ok(())
    }

    async fn revert(&self, session: &Session) -> Vec<String> {
        let mut warnings = Vec::new();
        let Some(table) = &session.firewall_table else {
            return warnings;
        };

        // Delete only if the table still exists; someone may have removed
        // it out-of-band and that is fine.
        match self.table_exists().await {
            Ok(true) => {
                match self.runner.run("nft", &["delete", "table", "inet", table]).await {
                    Ok(out) if out.ok => info!("kill-switch table {table} removed"),
                    Ok(out) => warnings.push(format!("nft delete table {table}: {}", out.stderr.trim())),
                    Err(e) => warnings.push(format!("nft delete table {table}: {e}")),
                }
            }
            Ok(false) => debug!("firewall table {table} already gone"),
            Err(e) => warnings.push(format!("firewall check failed: {e}")),
        }

        warnings
    }

    async fn describe(&self, session: &Session) -> Drift {
        let expected = session
            .firewall_table
            .as_deref()
            .map(|t| format!("table {t} exists"))
            .unwrap_or_else(|| "no table".to_string());

        match self.table_exists().await {
            Ok(true) if session.firewall_table.is_some() => Drift::ok(Scope::Firewall, expected),
            Ok(true) => Drift::mismatch(Scope::Firewall, expected, "table exists"),
            Ok(false) if session.firewall_table.is_none() => Drift::ok(Scope::Firewall, expected),
            Ok(false) => Drift::mismatch(Scope::Firewall, expected, "table missing"),
            Err(e) => Drift::mismatch(Scope::Firewall, expected, format!("check failed: {e}")),
        }
    }
}
