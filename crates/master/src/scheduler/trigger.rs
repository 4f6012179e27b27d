use std::collections::HashMap;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, watch, Mutex};

use antcode_common::types::{ScheduleKind, ScheduledTask};
use antcode_common::{AntCodeError, Result};

/// How often the wheel scans for due entries.
const SCAN_PERIOD: Duration = Duration::from_millis(500);

/// Firings later than this past their due time are coalesced into one run.
const MISFIRE_GRACE: chrono::Duration = chrono::Duration::seconds(30);

/// A parsed trigger.
#[derive(Clone, Debug)]
pub enum Trigger {
    Cron(cron::Schedule),
    Interval(chrono::Duration),
    /// One-shot at an instant.
    Date(DateTime<Utc>),
}

impl Trigger {
    /// Build the trigger from a task's schedule fields, validating them.
    pub fn from_task(task: &ScheduledTask) -> Result<Self> {
        match task.schedule_kind {
            ScheduleKind::Cron => {
                let expr = task
                    .cron_expression
                    .as_deref()
                    .ok_or_else(|| AntCodeError::Validation("cron task without expression".into()))?;
                parse_cron(expr)
            }
            ScheduleKind::Interval => {
                let seconds = task.interval_seconds.ok_or_else(|| {
                    AntCodeError::Validation("interval task without interval_seconds".into())
                })?;
                if seconds == 0 {
                    return Err(AntCodeError::Validation(
                        "interval_seconds must be at least 1".into(),
                    ));
                }
                Ok(Trigger::Interval(chrono::Duration::seconds(seconds as i64)))
            }
            ScheduleKind::Date => {
                let at = task.scheduled_time.ok_or_else(|| {
                    AntCodeError::Validation("date task without scheduled_time".into())
                })?;
                Ok(Trigger::Date(at))
            }
            ScheduleKind::Once => Ok(Trigger::Date(task.scheduled_time.unwrap_or_else(Utc::now))),
        }
    }

    /// Next fire strictly after `after`; None means the trigger is spent.
    pub fn next_fire(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match self {
            Trigger::Cron(schedule) => schedule.after(&after).next(),
            Trigger::Interval(interval) => Some(after + *interval),
            Trigger::Date(at) => (*at > after).then_some(*at),
        }
    }
}

/// Parse a cron expression, accepting the common 5-field form by
/// prepending a seconds field.
pub fn parse_cron(expr: &str) -> Result<Trigger> {
    let normalized = if expr.split_whitespace().count() == 5 {
        format!("0 {}", expr)
    } else {
        expr.to_string()
    };

    cron::Schedule::from_str(&normalized)
        .map(Trigger::Cron)
        .map_err(|e| AntCodeError::Validation(format!("invalid cron expression '{}': {}", expr, e)))
}

/// What a wheel entry drives when it fires.
#[derive(Clone, Debug)]
pub enum JobKind {
    /// A scheduled task, by internal id.
    Task(i64),
    /// A retry attempt of a task. `attempt` becomes the new execution's
    /// retry count.
    Retry { task_id: i64, attempt: u32 },
    /// Named housekeeping job.
    Maintenance(String),
}

/// Emitted over the fire channel when an entry comes due.
#[derive(Clone, Debug)]
pub struct FireEvent {
    pub job_id: String,
    pub kind: JobKind,
    pub fired_at: DateTime<Utc>,
}

struct WheelEntry {
    kind: JobKind,
    trigger: Trigger,
    next_fire: Option<DateTime<Utc>>,
    paused: bool,
}

/// Owns every installed trigger and fires task ids through a channel when
/// they come due. Scanned on a short fixed period; late firings within the
/// misfire grace still run once, older ones are skipped to the next slot.
pub struct TriggerWheel {
    entries: Mutex<HashMap<String, WheelEntry>>,
    fire_tx: mpsc::UnboundedSender<FireEvent>,
}

impl TriggerWheel {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<FireEvent>) {
        let (fire_tx, fire_rx) = mpsc::unbounded_channel();
        (
            Self {
                entries: Mutex::new(HashMap::new()),
                fire_tx,
            },
            fire_rx,
        )
    }

    /// Install or replace a job.
    pub async fn add_job(&self, job_id: &str, kind: JobKind, trigger: Trigger) {
        let next_fire = match &trigger {
            // A date trigger at-or-before now should still fire once.
            Trigger::Date(at) => Some(*at),
            other => other.next_fire(Utc::now()),
        };

        let mut entries = self.entries.lock().await;
        entries.insert(
            job_id.to_string(),
            WheelEntry {
                kind,
                trigger,
                next_fire,
                paused: false,
            },
        );
        tracing::debug!(job_id = job_id, "Trigger installed");
    }

    /// Remove a job; absent jobs are treated as already removed.
    pub async fn remove_job(&self, job_id: &str) -> bool {
        let mut entries = self.entries.lock().await;
        let removed = entries.remove(job_id).is_some();
        if removed {
            tracing::debug!(job_id = job_id, "Trigger removed");
        } else {
            tracing::warn!(job_id = job_id, "Trigger absent, treating as removed");
        }
        removed
    }

    pub async fn pause_job(&self, job_id: &str) -> Result<()> {
        let mut entries = self.entries.lock().await;
        let entry = entries
            .get_mut(job_id)
            .ok_or_else(|| AntCodeError::NotFound(format!("trigger {}", job_id)))?;
        entry.paused = true;
        Ok(())
    }

    pub async fn resume_job(&self, job_id: &str) -> Result<()> {
        let mut entries = self.entries.lock().await;
        let entry = entries
            .get_mut(job_id)
            .ok_or_else(|| AntCodeError::NotFound(format!("trigger {}", job_id)))?;
        entry.paused = false;
        // Recompute from now so a long pause does not replay missed slots.
        entry.next_fire = entry.trigger.next_fire(Utc::now());
        Ok(())
    }

    /// Pull an existing job's next firing forward to now, or install a
    /// one-shot when the job is not scheduled.
    pub async fn fire_now(&self, job_id: &str, kind: JobKind) {
        let mut entries = self.entries.lock().await;
        match entries.get_mut(job_id) {
            Some(entry) => {
                entry.next_fire = Some(Utc::now());
            }
            None => {
                let temp_id = format!("{}:manual:{}", job_id, uuid::Uuid::new_v4());
                entries.insert(
                    temp_id,
                    WheelEntry {
                        kind,
                        trigger: Trigger::Date(Utc::now()),
                        next_fire: Some(Utc::now()),
                        paused: false,
                    },
                );
            }
        }
    }

    pub async fn next_run_time(&self, job_id: &str) -> Option<DateTime<Utc>> {
        let entries = self.entries.lock().await;
        entries.get(job_id).and_then(|e| e.next_fire)
    }

    pub async fn contains(&self, job_id: &str) -> bool {
        self.entries.lock().await.contains_key(job_id)
    }

    /// Scan loop; spawn on its own task.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        tracing::info!("Trigger wheel started");
        loop {
            tokio::select! {
                _ = tokio::time::sleep(SCAN_PERIOD) => {
                    self.scan(Utc::now()).await;
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        tracing::info!("Trigger wheel stopping");
                        break;
                    }
                }
            }
        }
    }

    /// One scan pass: fire due entries, advance or retire them.
    pub async fn scan(&self, now: DateTime<Utc>) {
        let mut entries = self.entries.lock().await;
        let mut spent = Vec::new();

        for (job_id, entry) in entries.iter_mut() {
            if entry.paused {
                continue;
            }
            let Some(due) = entry.next_fire else {
                spent.push(job_id.clone());
                continue;
            };
            if due > now {
                continue;
            }

            // Coalesce: a firing missed beyond the grace window is skipped
            // rather than replayed.
            let within_grace = now - due <= MISFIRE_GRACE;
            if within_grace {
                let event = FireEvent {
                    job_id: job_id.clone(),
                    kind: entry.kind.clone(),
                    fired_at: now,
                };
                if self.fire_tx.send(event).is_err() {
                    tracing::error!("Fire channel closed, trigger wheel idle");
                    return;
                }
            } else {
                tracing::warn!(
                    job_id = %job_id,
                    missed_by_s = (now - due).num_seconds(),
                    "Missed firing beyond grace, skipping to next slot"
                );
            }

            entry.next_fire = entry.trigger.next_fire(now);
            if entry.next_fire.is_none() {
                spent.push(job_id.clone());
            }
        }

        for job_id in spent {
            entries.remove(&job_id);
            tracing::debug!(job_id = %job_id, "One-shot trigger retired");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn five_field_cron_is_normalized() {
        let trigger = parse_cron("*/1 * * * *").unwrap();
        let after = Utc.with_ymd_and_hms(2025, 1, 1, 12, 0, 30).unwrap();
        let next = trigger.next_fire(after).unwrap();
        assert_eq!(next, Utc.with_ymd_and_hms(2025, 1, 1, 12, 1, 0).unwrap());
    }

    #[test]
    fn bad_cron_is_rejected() {
        assert!(parse_cron("not a cron").is_err());
    }

    #[test]
    fn interval_advances_from_reference() {
        let trigger = Trigger::Interval(chrono::Duration::seconds(30));
        let after = Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap();
        assert_eq!(
            trigger.next_fire(after).unwrap(),
            Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 30).unwrap()
        );
    }

    #[test]
    fn date_trigger_is_one_shot() {
        let at = Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap();
        let trigger = Trigger::Date(at);
        assert_eq!(trigger.next_fire(at - chrono::Duration::seconds(1)), Some(at));
        assert_eq!(trigger.next_fire(at), None);
    }

    #[tokio::test]
    async fn due_entries_fire_and_one_shots_retire() {
        let (wheel, mut rx) = TriggerWheel::new();
        let past = Utc::now() - chrono::Duration::seconds(1);
        wheel
            .add_job("once", JobKind::Task(7), Trigger::Date(past))
            .await;

        wheel.scan(Utc::now()).await;

        let event = rx.try_recv().unwrap();
        assert_eq!(event.job_id, "once");
        assert!(matches!(event.kind, JobKind::Task(7)));
        assert!(!wheel.contains("once").await);
    }

    #[tokio::test]
    async fn paused_jobs_do_not_fire() {
        let (wheel, mut rx) = TriggerWheel::new();
        wheel
            .add_job(
                "tick",
                JobKind::Task(1),
                Trigger::Interval(chrono::Duration::seconds(1)),
            )
            .await;
        wheel.pause_job("tick").await.unwrap();

        wheel.scan(Utc::now() + chrono::Duration::seconds(5)).await;
        assert!(rx.try_recv().is_err());

        wheel.resume_job("tick").await.unwrap();
        assert!(wheel.contains("tick").await);
    }

    #[tokio::test]
    async fn stale_firings_are_coalesced() {
        let (wheel, mut rx) = TriggerWheel::new();
        let long_ago = Utc::now() - chrono::Duration::minutes(10);
        wheel
            .add_job("stale", JobKind::Task(1), Trigger::Date(long_ago))
            .await;

        wheel.scan(Utc::now()).await;

        // Missed far beyond grace: skipped, and the one-shot retires.
        assert!(rx.try_recv().is_err());
        assert!(!wheel.contains("stale").await);
    }
}
