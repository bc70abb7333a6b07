use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use colored::Colorize;
use uuid::Uuid;

use shroud::error::{Result, ShroudError};
use shroud::orchestrator::{DisableOptions, EnableOptions, Orchestrator};
use shroud::runner::SystemRunner;
use shroud::scopes::{shell, BrowserScope};
use shroud::session::{MacMode, PersistMode};
use shroud::store::SessionStore;

#[derive(Parser)]
#[command(
    name = "shroud",
    about = "shroud — session-scoped network hardening with a timed, revertible kill-switch"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Apply hardening scopes for a bounded session
    Enable {
        /// Scopes to apply: network, browser, shell (comma-separated)
        #[arg(long, default_value = "network", value_delimiter = ',')]
        scope: Vec<String>,
        /// Advisory persistence intent: session, os, manual
        #[arg(long, default_value = "session", value_parser = parse_persist)]
        persist: PersistMode,
        /// Session length (seconds, or with s/m/h/d suffix)
        #[arg(long = "for", value_parser = parse_duration, conflicts_with = "until")]
        duration: Option<chrono::Duration>,
        /// Absolute end time (HH:MM today, or RFC 3339)
        #[arg(long, value_parser = parse_until)]
        until: Option<DateTime<Utc>>,
        /// Schedule remaining-time reminders
        #[arg(long, default_value = "yes", value_parser = parse_yes_no, action = clap::ArgAction::Set)]
        remind: bool,
        /// Cloned MAC mode: stable, random, preserve
        #[arg(long, default_value = "random", value_parser = parse_mac)]
        mac: MacMode,
        /// Network connection to operate on (default: active, wifi preferred)
        #[arg(long)]
        conn: Option<String>,
        /// Keep LAN ranges reachable through the kill-switch
        #[arg(long, default_value = "no", value_parser = parse_yes_no, action = clap::ArgAction::Set)]
        lan_ok: bool,
        /// Reject outbound plaintext HTTP
        #[arg(long, default_value = "no", value_parser = parse_yes_no, action = clap::ArgAction::Set)]
        block_http: bool,
        /// Bring up a wireguard tunnel from this config
        #[arg(long, conflicts_with = "vpn_process")]
        vpn_tunnel: Option<PathBuf>,
        /// Launch this VPN client under a supervised unit
        #[arg(long)]
        vpn_process: Option<PathBuf>,
        /// Supersede an already-active session
        #[arg(long)]
        force: bool,
        /// Record the event in the system log
        #[arg(long, default_value = "yes", value_parser = parse_yes_no, action = clap::ArgAction::Set)]
        log_event: bool,
    },
    /// Revert all applied scopes and clear the session
    Disable {
        /// Terminate the session browser
        #[arg(long, default_value = "yes", value_parser = parse_yes_no, action = clap::ArgAction::Set)]
        kill_browser: bool,
        /// Cycle the connection down/up after restoring the MAC
        #[arg(long, default_value = "no", value_parser = parse_yes_no, action = clap::ArgAction::Set)]
        reconnect: bool,
        /// Record the event in the system log
        #[arg(long, default_value = "yes", value_parser = parse_yes_no, action = clap::ArgAction::Set)]
        log_event: bool,
    },
    /// Show the active session and remaining time
    Status {
        #[arg(long)]
        json: bool,
    },
    /// Compare recorded intent against live system state
    Checklist {
        #[arg(long)]
        json: bool,
    },
    /// Scheduler entrypoint: notify remaining time (internal)
    Remind {
        #[arg(long)]
        tag: String,
    },
    /// Launch a hardened browser outside any session
    Browser {
        /// DNS-over-HTTPS resolver URI
        #[arg(long)]
        trr_uri: Option<String>,
    },
    /// Print the shell hygiene fragment for eval'ing
    ShellEnv {
        /// Print the hygiene fragment (the default)
        #[arg(long, conflicts_with = "disable")]
        enable: bool,
        /// Print the inverse fragment instead
        #[arg(long)]
        disable: bool,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let log_level = match cli.command {
        Commands::Enable { .. } | Commands::Disable { .. } => "info",
        _ => "warn",
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(log_level)),
        )
        .without_time()
        .init();

    if let Err(e) = run(cli).await {
        eprintln!("{} {e}", "[shroud]".red().bold());
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<()> {
    let runner = Arc::new(SystemRunner);
    let state_path = SessionStore::default_path();
    let profile_base = state_path
        .parent()
        .map(|p| p.join("profiles"))
        .unwrap_or_else(|| PathBuf::from("/tmp/shroud-profiles"));
    let exe = std::env::current_exe()
        .map_err(|e| ShroudError::State(format!("cannot locate own binary: {e}")))?;

    let orchestrator = Orchestrator::new(SessionStore::new(state_path), runner.clone(), exe, profile_base.clone());

    match cli.command {
        Commands::Enable {
            scope,
            persist,
            duration,
            until,
            remind,
            mac,
            conn,
            lan_ok,
            block_http,
            vpn_tunnel,
            vpn_process,
            force,
            log_event,
        } => {
            orchestrator
                .enable(EnableOptions {
                    scopes: scope,
                    persist,
                    duration,
                    until,
                    remind,
                    mac,
                    connection: conn,
                    lan_ok,
                    block_http,
                    vpn_tunnel,
                    vpn_process,
                    force,
                    log_event,
                })
                .await?;
        }

        Commands::Disable {
            kill_browser,
            reconnect,
            log_event,
        } => {
            orchestrator
                .disable(DisableOptions {
                    kill_browser,
                    reconnect,
                    log_event,
                })
                .await?;
        }

        Commands::Status { json } => orchestrator.status(json).await?,

        Commands::Checklist { json } => {
            let drifts = orchestrator.checklist(json).await?;
            if drifts.iter().any(|d| !d.ok) {
                std::process::exit(1);
            }
        }

        Commands::Remind { tag } => orchestrator.remind(&tag).await?,

        Commands::Browser { trr_uri } => {
            let scope = BrowserScope::new(runner, profile_base).with_trr_uri(trr_uri);
            let name = format!("adhoc-{}", Uuid::new_v4());
            let (profile, pid) = scope.launch(&name).await?;
            println!(
                "{} hardened browser started (pid {}, profile {})",
                "✓".green(),
                pid.to_string().cyan(),
                profile.display().to_string().dimmed()
            );
        }

        Commands::ShellEnv { enable: _, disable } => {
            if disable {
                print!("{}", shell::restore_fragment());
            } else {
                print!("{}", shell::hygiene_fragment());
            }
        }
    }

    Ok(())
}

fn parse_yes_no(s: &str) -> std::result::Result<bool, String> {
    match s {
        "yes" | "y" | "true" => Ok(true),
        "no" | "n" | "false" => Ok(false),
        _ => Err(format!("expected yes or no, got '{s}'")),
    }
}

fn parse_mac(s: &str) -> std::result::Result<MacMode, String> {
    match s {
        "stable" => Ok(MacMode::Stable),
        "random" => Ok(MacMode::Random),
        "preserve" => Ok(MacMode::Preserve),
        _ => Err(format!("expected stable, random or preserve, got '{s}'")),
    }
}

fn parse_persist(s: &str) -> std::result::Result<PersistMode, String> {
    PersistMode::from_name(s).ok_or_else(|| format!("expected session, os or manual, got '{s}'"))
}

/// Bare seconds, or a single s/m/h/d suffix: `7200`, `90m`, `2h`.
fn parse_duration(s: &str) -> std::result::Result<chrono::Duration, String> {
    let (digits, unit) = match s.chars().last() {
        Some('s') => (&s[..s.len() - 1], 1),
        Some('m') => (&s[..s.len() - 1], 60),
        Some('h') => (&s[..s.len() - 1], 3600),
        Some('d') => (&s[..s.len() - 1], 86_400),
        Some(c) if c.is_ascii_digit() => (s, 1),
        _ => return Err(format!("cannot parse duration '{s}'")),
    };
    let n: i64 = digits
        .parse()
        .map_err(|_| format!("cannot parse duration '{s}'"))?;
    if n <= 0 {
        return Err("duration must be positive".to_string());
    }
    Ok(chrono::Duration::seconds(n * unit))
}

/// `HH:MM` (today, local time) or a full RFC 3339 timestamp.
fn parse_until(s: &str) -> std::result::Result<DateTime<Utc>, String> {
    if let Ok(t) = DateTime::parse_from_rfc3339(s) {
        return Ok(t.with_timezone(&Utc));
    }
    for fmt in ["%H:%M:%S", "%H:%M"] {
        if let Ok(t) = chrono::NaiveTime::parse_from_str(s, fmt) {
            let local = chrono::Local::now()
                .date_naive()
                .and_time(t)
                .and_local_timezone(chrono::Local)
                .single()
                .ok_or_else(|| format!("ambiguous local time '{s}'"))?;
            return Ok(local.with_timezone(&Utc));
        }
    }
    Err(format!("cannot parse time '{s}' — use HH:MM or RFC 3339"))
}
