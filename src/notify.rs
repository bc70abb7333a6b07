//! Best-effort user-visible messages.
//!
//! Desktop notification via `notify-send`; anything that goes wrong
//! falls back to a plain text line. Notification is never allowed to
//! fail an operation.

use std::sync::Arc;

use colored::Colorize;
use tracing::debug;

use crate::runner::CommandRunner;

pub struct Notifier {
    runner: Arc<dyn CommandRunner>,
    enabled: bool,
}

impl Notifier {
    pub fn new(runner: Arc<dyn CommandRunner>, enabled: bool) -> Self {
        Self { runner, enabled }
    }

    pub async fn send(&self, title: &str, body: &str) {
        if !self.enabled {
            return;
        }

        match self.runner.run("notify-send", &[title, body]).await {
            Ok(out) if out.ok => {}
            Ok(out) => {
                debug!("notify-send failed: {}", out.stderr.trim());
                println!("{} {title}: {body}", "→".cyan());
            }
            Err(e) => {
                debug!("notify-send unavailable: {e}");
                println!("{} {title}: {body}", "→".cyan());
            }
        }
    }
}
