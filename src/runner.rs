//! Collaborator process boundary.
//!
//! Every external tool the orchestrator talks to (nft, nmcli, wg-quick,
//! systemd-run, systemctl, ip, notify-send, the browser) goes through
//! [`CommandRunner`]. `SystemRunner` is the real thing; `RecordingRunner`
//! logs invocations and replays canned outputs so the whole lifecycle can
//! be tested without touching the host.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;

use crate::error::{Result, ShroudError};

/// Outcome of a synchronous collaborator invocation.
#[derive(Debug, Clone)]
pub struct CmdOutput {
    pub ok: bool,
    pub stdout: String,
    pub stderr: String,
}

impl CmdOutput {
    pub fn success(stdout: impl Into<String>) -> Self {
        Self {
            ok: true,
            stdout: stdout.into(),
            stderr: String::new(),
        }
    }

    pub fn failure(stderr: impl Into<String>) -> Self {
        Self {
            ok: false,
            stdout: String::new(),
            stderr: stderr.into(),
        }
    }
}

#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Run a collaborator to completion and capture its output.
    async fn run(&self, program: &str, args: &[&str]) -> Result<CmdOutput>;

    /// Launch a detached child (stdio nulled) and return its PID. The
    /// child outlives this process; we keep only the reference.
    async fn spawn_detached(&self, program: &str, args: &[&str]) -> Result<u32>;

    /// Send a signal to a tracked PID.
    fn signal(&self, pid: u32, sig: Signal) -> Result<()>;

    /// Probe whether a tracked PID is still alive.
    fn process_alive(&self, pid: u32) -> bool;
}

// ============================================================================
// System runner
// ============================================================================

pub struct SystemRunner;

#[async_trait]
impl CommandRunner for SystemRunner {
    async fn run(&self, program: &str, args: &[&str]) -> Result<CmdOutput> {
        let output = tokio::process::Command::new(program)
            .args(args)
            .output()
            .await
            .map_err(|e| map_spawn_error(program, e))?;

        Ok(CmdOutput {
            ok: output.status.success(),
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        })
    }

    async fn spawn_detached(&self, program: &str, args: &[&str]) -> Result<u32> {
        let child = std::process::Command::new(program)
            .args(args)
            .stdin(std::process::Stdio::null())
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::null())
            .spawn()
            .map_err(|e| map_spawn_error(program, e))?;

        Ok(child.id())
    }

    fn signal(&self, pid: u32, sig: Signal) -> Result<()> {
        kill(Pid::from_raw(pid as i32), sig)
            .map_err(|e| ShroudError::State(format!("signal pid {pid}: {e}")))
    }

    fn process_alive(&self, pid: u32) -> bool {
        // Signal 0 probes existence without delivering anything.
        kill(Pid::from_raw(pid as i32), None).is_ok()
    }
}

fn map_spawn_error(program: &str, e: std::io::Error) -> ShroudError {
    match e.kind() {
        std::io::ErrorKind::NotFound => ShroudError::ResourceMissing(program.to_string()),
        std::io::ErrorKind::PermissionDenied => {
            ShroudError::Privilege(format!("cannot execute {program}"))
        }
        _ => ShroudError::Io(e),
    }
}

// ============================================================================
// Recording runner (test double)
// ============================================================================

/// One recorded collaborator call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    pub program: String,
    pub args: Vec<String>,
}

impl Invocation {
    pub fn arg_line(&self) -> String {
        self.args.join(" ")
    }
}

/// In-memory runner: records every call, replays stubbed responses, and
/// defaults to success with empty output. Stubs match on program name
/// plus a substring of the joined argument line; the first match wins.
#[derive(Default)]
pub struct RecordingRunner {
    calls: Mutex<Vec<Invocation>>,
    stubs: Mutex<Vec<(String, String, CmdOutput)>>,
    missing: Mutex<Vec<String>>,
    alive_pids: Mutex<HashMap<u32, bool>>,
    /// PIDs that survive a SIGTERM for N further liveness probes.
    term_latency: Mutex<HashMap<u32, u32>>,
    next_pid: AtomicU32,
}

impl RecordingRunner {
    pub fn new() -> Self {
        Self {
            next_pid: AtomicU32::new(40_000),
            ..Default::default()
        }
    }

    /// Replay `output` for calls to `program` whose argument line
    /// contains `needle`.
    pub fn stub(&self, program: &str, needle: &str, output: CmdOutput) {
        self.stubs
            .lock()
            .unwrap()
            .push((program.to_string(), needle.to_string(), output));
    }

    /// Treat `program` as absent from the host.
    pub fn mark_missing(&self, program: &str) {
        self.missing.lock().unwrap().push(program.to_string());
    }

    /// Override liveness for a PID handed out by `spawn_detached`.
    pub fn set_alive(&self, pid: u32, alive: bool) {
        self.alive_pids.lock().unwrap().insert(pid, alive);
    }

    /// Model a child that needs a moment to exit: after SIGTERM the PID
    /// stays alive through `probes` more liveness checks.
    pub fn set_term_latency(&self, pid: u32, probes: u32) {
        self.term_latency.lock().unwrap().insert(pid, probes);
    }

    pub fn calls(&self) -> Vec<Invocation> {
        self.calls.lock().unwrap().clone()
    }

    pub fn calls_for(&self, program: &str) -> Vec<Invocation> {
        self.calls()
            .into_iter()
            .filter(|c| c.program == program)
            .collect()
    }

    /// Did any call to `program` have an argument line containing `needle`?
    pub fn saw(&self, program: &str, needle: &str) -> bool {
        self.calls_for(program)
            .iter()
            .any(|c| c.arg_line().contains(needle))
    }

    fn record(&self, program: &str, args: &[&str]) -> Result<()> {
        if self.missing.lock().unwrap().iter().any(|m| m == program) {
            return Err(ShroudError::ResourceMissing(program.to_string()));
        }
        self.calls.lock().unwrap().push(Invocation {
            program: program.to_string(),
            args: args.iter().map(|a| a.to_string()).collect(),
        });
        Ok(())
    }
}

#[async_trait]
impl CommandRunner for RecordingRunner {
    async fn run(&self, program: &str, args: &[&str]) -> Result<CmdOutput> {
        self.record(program, args)?;
        let line = args.join(" ");
        let stubs = self.stubs.lock().unwrap();
        for (prog, needle, output) in stubs.iter() {
            if prog == program && line.contains(needle.as_str()) {
                return Ok(output.clone());
            }
        }
        Ok(CmdOutput::success(""))
    }

    async fn spawn_detached(&self, program: &str, args: &[&str]) -> Result<u32> {
        self.record(program, args)?;
        let pid = self.next_pid.fetch_add(1, Ordering::SeqCst);
        self.alive_pids.lock().unwrap().insert(pid, true);
        Ok(pid)
    }

    fn signal(&self, pid: u32, sig: Signal) -> Result<()> {
        self.calls.lock().unwrap().push(Invocation {
            program: "signal".to_string(),
            args: vec![pid.to_string(), sig.to_string()],
        });
        // Delivering SIGTERM to a recorded PID marks it dead, unless a
        // term latency keeps it lingering for a few probes.
        if (sig == Signal::SIGTERM || sig == Signal::SIGKILL)
            && !self.term_latency.lock().unwrap().contains_key(&pid)
        {
            self.alive_pids.lock().unwrap().insert(pid, false);
        }
        Ok(())
    }

    fn process_alive(&self, pid: u32) -> bool {
        let mut latency = self.term_latency.lock().unwrap();
        if let Some(remaining) = latency.get_mut(&pid) {
            if *remaining == 0 {
                latency.remove(&pid);
                self.alive_pids.lock().unwrap().insert(pid, false);
            } else {
                *remaining -= 1;
                return true;
            }
        }
        self.alive_pids
            .lock()
            .unwrap()
            .get(&pid)
            .copied()
            .unwrap_or(false)
    }
}
