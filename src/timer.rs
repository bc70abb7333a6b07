//! Expiry and reminder scheduling.
//!
//! Background work is delegated entirely to transient systemd timer
//! units: each deferred invocation re-enters this binary's own `disable`
//! or `remind` entrypoint, so the scheduled job carries everything it
//! needs and nothing has to stay resident.

use std::path::PathBuf;
use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, info, warn};

use crate::error::{Result, ShroudError};
use crate::runner::CommandRunner;
use crate::session::Session;

/// Proportional reminder marks, each gated by a minimum total duration
/// so short sessions are not spammed with near-simultaneous pings.
const PROPORTIONAL_MARKS: [(u64, u64, &str); 3] = [
    // (percent, minimum total seconds, tag)
    (50, 1200, "50pct"),
    (75, 600, "75pct"),
    (90, 300, "90pct"),
];

/// Fixed "N remaining" marks, included only when they fit inside the
/// total duration.
const FIXED_MARKS: [(u64, &str); 5] = [
    (600, "10m"),
    (300, "5m"),
    (60, "1m"),
    (10, "10s"),
    (5, "5s"),
];

/// Offsets (seconds from session start) at which reminders fire, with
/// their tags. The result is strictly increasing, deduplicated, and
/// bounded by the total duration.
pub fn reminder_offsets(total_secs: u64) -> Vec<(u64, String)> {
    let mut offsets: Vec<(u64, String)> = Vec::new();

    for (percent, min_total, tag) in PROPORTIONAL_MARKS {
        if total_secs >= min_total {
            offsets.push((total_secs * percent / 100, tag.to_string()));
        }
    }
    for (before_end, tag) in FIXED_MARKS {
        if before_end < total_secs {
            offsets.push((total_secs - before_end, tag.to_string()));
        }
    }

    offsets.retain(|(off, _)| *off > 0 && *off < total_secs);
    offsets.sort_by_key(|(off, _)| *off);
    // Two marks landing on the same second keep only the first.
    offsets.dedup_by_key(|(off, _)| *off);
    offsets
}

pub struct TimerScheduler {
    runner: Arc<dyn CommandRunner>,
    /// Path of this binary, re-invoked by the deferred jobs.
    exe: PathBuf,
}

impl TimerScheduler {
    pub fn new(runner: Arc<dyn CommandRunner>, exe: PathBuf) -> Self {
        Self { runner, exe }
    }

    fn short_id(session: &Session) -> &str {
        session.id.get(..8).unwrap_or(&session.id)
    }

    async fn submit(&self, unit: &str, delay_secs: u64, subcommand: &[&str]) -> Result<()> {
        let on_active = format!("--on-active={delay_secs}");
        let exe = self.exe.display().to_string();
        let mut args = vec![
            "--user",
            "--collect",
            "--unit",
            unit,
            on_active.as_str(),
            exe.as_str(),
        ];
        args.extend_from_slice(subcommand);

        let out = self.runner.run("systemd-run", &args).await?;
        if !out.ok {
            return Err(ShroudError::State(format!(
                "schedule {unit}: {}",
                out.stderr.trim()
            )));
        }
        Ok(())
    }

    /// Schedule the one-shot expiry job when the session has a future
    /// end time; manual sessions get no timer.
    pub async fn schedule_expiry(&self, session: &mut Session) -> Result<()> {
        let Some(end) = session.end_time else {
            return Ok(());
        };
        let delay = (end - Utc::now()).num_seconds();
        if delay <= 0 {
            return Ok(());
        }

        let unit = format!("shroud-expire-{}", Self::short_id(session));
        self.submit(&unit, delay as u64, &["disable"]).await?;
        session.expire_job = Some(unit.clone());
        info!("expiry scheduled in {delay}s (unit {unit})");
        Ok(())
    }

    /// Schedule one reminder job per computed offset.
    pub async fn schedule_reminders(&self, session: &mut Session) -> Result<()> {
        if !session.remind {
            return Ok(());
        }
        let Some(total) = session.total_secs() else {
            return Ok(());
        };

        let elapsed = (Utc::now() - session.start_time).num_seconds().max(0) as u64;
        let short = Self::short_id(session).to_string();

        for (offset, tag) in reminder_offsets(total) {
            if offset <= elapsed {
                continue;
            }
            let unit = format!("shroud-remind-{short}-{tag}");
            self.submit(&unit, offset - elapsed, &["remind", "--tag", &tag])
                .await?;
            session.remind_jobs.push(unit);
        }

        if !session.remind_jobs.is_empty() {
            info!("{} reminder(s) scheduled", session.remind_jobs.len());
        }
        Ok(())
    }

    /// Stop every recorded job. Already-fired or already-removed units
    /// are expected and not worth a warning.
    pub async fn cancel_all(&self, session: &Session) -> Vec<String> {
        let mut warnings = Vec::new();

        let jobs = session
            .expire_job
            .iter()
            .chain(session.remind_jobs.iter());

        for unit in jobs {
            let timer = format!("{unit}.timer");
            match self.runner.run("systemctl", &["--user", "stop", &timer]).await {
                Ok(out) if out.ok => debug!("cancelled {timer}"),
                Ok(_) => debug!("{timer} already gone"),
                Err(e) => warnings.push(format!("cancel {timer}: {e}")),
            }
        }

        if !warnings.is_empty() {
            warn!("timer cancellation finished with {} warning(s)", warnings.len());
        }
        warnings
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runner::RecordingRunner;
    use crate::session::Scope;
    use chrono::Duration;

    #[test]
    fn test_offsets_two_hours() {
        let offsets = reminder_offsets(7200);
        let secs: Vec<u64> = offsets.iter().map(|(o, _)| *o).collect();
        // 50/75/90% plus all fixed marks
        assert_eq!(secs, vec![3600, 5400, 6480, 6600, 6900, 7140, 7190, 7195]);

        let tags: Vec<&str> = offsets.iter().map(|(_, t)| t.as_str()).collect();
        assert!(tags.contains(&"50pct"));
        assert!(tags.contains(&"90pct"));
        assert!(tags.contains(&"10m"));
        assert!(tags.contains(&"1m"));
    }

    #[test]
    fn test_offsets_strictly_increasing_and_bounded() {
        for total in [30u64, 90, 300, 600, 1200, 3600, 7200, 86_400] {
            let offsets = reminder_offsets(total);
            let mut prev = 0;
            for (off, _) in &offsets {
                assert!(*off > prev, "offsets not strictly increasing for {total}s");
                assert!(*off < total, "offset {off} exceeds total {total}");
                prev = *off;
            }
        }
    }

    #[test]
    fn test_offsets_short_session_suppresses_proportionals() {
        // 2 minutes: too short for any percent mark
        let tags: Vec<String> = reminder_offsets(120).into_iter().map(|(_, t)| t).collect();
        assert!(!tags.iter().any(|t| t.ends_with("pct")));
        assert!(tags.contains(&"1m".to_string()));
        assert!(tags.contains(&"10s".to_string()));
    }

    #[test]
    fn test_offsets_exclude_marks_beyond_duration() {
        // 8 seconds: only the 5s mark fits
        let offsets = reminder_offsets(8);
        assert_eq!(offsets.len(), 1);
        assert_eq!(offsets[0], (3, "5s".to_string()));
    }

    fn scheduler(runner: Arc<RecordingRunner>) -> TimerScheduler {
        TimerScheduler::new(runner, PathBuf::from("/usr/bin/shroud"))
    }

    #[tokio::test]
    async fn test_schedule_expiry_submits_disable_job() {
        let runner = Arc::new(RecordingRunner::new());
        let sched = scheduler(runner.clone());
        let mut session = Session::new(vec![Scope::Firewall], None);
        session.end_time = Some(session.start_time + Duration::seconds(3600));

        sched.schedule_expiry(&mut session).await.unwrap();

        assert!(session.expire_job.is_some());
        assert!(runner.saw("systemd-run", "/usr/bin/shroud disable"));
        assert!(runner.saw("systemd-run", "--on-active="));
    }

    #[tokio::test]
    async fn test_schedule_expiry_skips_manual_session() {
        let runner = Arc::new(RecordingRunner::new());
        let sched = scheduler(runner.clone());
        let mut session = Session::new(vec![Scope::Firewall], None);

        sched.schedule_expiry(&mut session).await.unwrap();
        assert!(session.expire_job.is_none());
        assert!(runner.calls_for("systemd-run").is_empty());
    }

    #[tokio::test]
    async fn test_schedule_reminders_tags_each_job() {
        let runner = Arc::new(RecordingRunner::new());
        let sched = scheduler(runner.clone());
        let mut session = Session::new(vec![Scope::Firewall], None);
        session.remind = true;
        session.end_time = Some(session.start_time + Duration::seconds(7200));

        sched.schedule_reminders(&mut session).await.unwrap();

        assert_eq!(session.remind_jobs.len(), 8);
        assert!(runner.saw("systemd-run", "remind --tag 50pct"));
        assert!(runner.saw("systemd-run", "remind --tag 5s"));
    }

    #[tokio::test]
    async fn test_schedule_reminders_disabled() {
        let runner = Arc::new(RecordingRunner::new());
        let sched = scheduler(runner.clone());
        let mut session = Session::new(vec![Scope::Firewall], None);
        session.end_time = Some(session.start_time + Duration::seconds(7200));

        sched.schedule_reminders(&mut session).await.unwrap();
        assert!(session.remind_jobs.is_empty());
    }

    #[tokio::test]
    async fn test_cancel_all_stops_every_job() {
        let runner = Arc::new(RecordingRunner::new());
        let sched = scheduler(runner.clone());
        let mut session = Session::new(vec![Scope::Firewall], None);
        session.expire_job = Some("shroud-expire-aaaa".into());
        session.remind_jobs = vec![
            "shroud-remind-aaaa-50pct".into(),
            "shroud-remind-aaaa-1m".into(),
        ];

        let warnings = sched.cancel_all(&session).await;
        assert!(warnings.is_empty());
        assert_eq!(runner.calls_for("systemctl").len(), 3);
        assert!(runner.saw("systemctl", "stop shroud-expire-aaaa.timer"));
    }
}
