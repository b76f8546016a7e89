//! Reminder worker: scan due schedules, queue jobs, send with retry
//!
//! A tick loads every due schedule, turns it into a [`ReminderJob`] and
//! pushes it onto an mpsc queue drained by a fixed pool of threads. Each
//! job carries its own retry state; a failed send never blocks the others.

use crate::care::{self, CareTask, Urgency};
use crate::chat::{ChatService, MessageSource};
use crate::config::ReminderConfig;
use crate::db::{Database, DbError, SmsRecord};
use crate::sms::{self, SmsSender};
use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc, Mutex};
use tracing::{debug, error, info, warn};

/// Longest single backoff sleep
const MAX_BACKOFF: std::time::Duration = std::time::Duration::from_secs(3600);

#[derive(Debug, Clone, Serialize)]
pub struct ReminderJob {
    pub schedule_id: i32,
    pub user_plant_id: i32,
    pub phone: String,
    pub nickname: String,
    pub task: CareTask,
    pub urgency: Urgency,
    pub due: DateTime<Utc>,
    /// Tick time; stored as the schedule's `last_reminded_at` on success
    pub scanned_at: DateTime<Utc>,
}

/// Due schedules that were not reminded in the last `repeat_hours` and are
/// at least `min_urgency`, oldest due first
pub fn scan_due(db: &Database, now: DateTime<Utc>, config: &ReminderConfig) -> Result<Vec<ReminderJob>, DbError> {
    let cutoff = now - Duration::hours(config.repeat_hours.max(0));
    let due = db.due_schedules(now, cutoff)?;

    let jobs = due
        .into_iter()
        .filter_map(|row| {
            let task = row.schedule.task()?;
            let due = care::parse_timestamp(&row.schedule.next_due)?;
            let urgency = care::urgency(task, care::days_overdue(due, now));
            if urgency < config.min_urgency {
                debug!(schedule_id = row.schedule.id, urgency = %urgency, "below minimum urgency");
                return None;
            }
            Some(ReminderJob {
                schedule_id: row.schedule.id,
                user_plant_id: row.plant.id,
                phone: row.user.phone,
                nickname: row.plant.nickname,
                task,
                urgency,
                due,
                scanned_at: now,
            })
        })
        .collect();
    Ok(jobs)
}

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub base: std::time::Duration,
    pub max_retries: u32,
}

impl RetryPolicy {
    pub fn from_config(config: &ReminderConfig) -> Self {
        Self {
            base: std::time::Duration::from_secs(config.backoff_base_secs),
            max_retries: config.max_retries,
        }
    }

    /// `base * 2^attempt`, capped
    pub fn delay(&self, attempt: u32) -> std::time::Duration {
        let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
        self.base.checked_mul(factor).unwrap_or(MAX_BACKOFF).min(MAX_BACKOFF)
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum DispatchReport {
    Sent {
        schedule_id: i32,
        attempts: u32,
        source: MessageSource,
        message_id: String,
    },
    Failed {
        schedule_id: i32,
        attempts: u32,
        error: String,
    },
}

impl DispatchReport {
    pub fn is_sent(&self) -> bool {
        matches!(self, DispatchReport::Sent { .. })
    }
}

pub struct Dispatcher {
    db: Database,
    chat: ChatService,
    sender: Arc<dyn SmsSender>,
    retry: RetryPolicy,
}

impl Dispatcher {
    pub fn new(db: Database, chat: ChatService, sender: Arc<dyn SmsSender>, retry: RetryPolicy) -> Self {
        Self { db, chat, sender, retry }
    }

    /// Generate and send one reminder. Running a job twice overwrites the
    /// same `last_reminded_at`.
    pub fn dispatch(&self, job: &ReminderJob) -> DispatchReport {
        let message = match self.chat.generate_care_reminder(job.user_plant_id, job.task) {
            Ok(message) => message,
            Err(e) => {
                error!(schedule_id = job.schedule_id, plant_id = job.user_plant_id, error = %e, "could not build reminder");
                return DispatchReport::Failed {
                    schedule_id: job.schedule_id,
                    attempts: 0,
                    error: e.to_string(),
                };
            }
        };

        let mut attempts = 0;
        let mut last_error = String::new();
        while attempts <= self.retry.max_retries {
            attempts += 1;
            match self.sender.send(&job.phone, &message.text) {
                Ok(receipt) => match self.finish(job, &message.text, &receipt) {
                    Ok(()) => {
                        info!(
                            schedule_id = job.schedule_id,
                            plant_id = job.user_plant_id,
                            task = %job.task,
                            urgency = %job.urgency,
                            attempts,
                            "reminder sent"
                        );
                        return DispatchReport::Sent {
                            schedule_id: job.schedule_id,
                            attempts,
                            source: message.source,
                            message_id: receipt.message_id,
                        };
                    }
                    Err(e) => {
                        // the text went out; retrying would send it twice
                        error!(schedule_id = job.schedule_id, error = %e, "reminder sent but not recorded");
                        return DispatchReport::Failed {
                            schedule_id: job.schedule_id,
                            attempts,
                            error: e.to_string(),
                        };
                    }
                },
                Err(e) => {
                    last_error = e.to_string();
                    if attempts <= self.retry.max_retries {
                        let delay = self.retry.delay(attempts - 1);
                        warn!(
                            schedule_id = job.schedule_id,
                            phone = %job.phone,
                            attempt = attempts,
                            delay_ms = delay.as_millis() as u64,
                            error = %e,
                            "SMS send failed, retrying"
                        );
                        std::thread::sleep(delay);
                    }
                }
            }
        }

        error!(schedule_id = job.schedule_id, phone = %job.phone, attempts, error = %last_error, "reminder failed");
        if let Err(e) = self.db.record_sms(&SmsRecord {
            direction: "outbound",
            phone: &job.phone,
            body: &message.text,
            status: "failed",
            provider: Some(self.sender.provider()),
            provider_message_id: None,
            error: Some(last_error.as_str()),
        }) {
            error!(error = %e, "could not record failed SMS");
        }
        DispatchReport::Failed {
            schedule_id: job.schedule_id,
            attempts,
            error: last_error,
        }
    }

    fn finish(&self, job: &ReminderJob, body: &str, receipt: &sms::SmsReceipt) -> Result<(), DbError> {
        sms::record_outbound(&self.db, &job.phone, body, receipt)?;
        self.db.mark_reminded(job.schedule_id, job.scanned_at)?;
        if let Err(e) = self.chat.record_reminder(job.user_plant_id, body) {
            warn!(schedule_id = job.schedule_id, error = %e, "reminder missing from conversation history");
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct TickReport {
    pub scanned: usize,
    pub sent: usize,
    pub failed: usize,
}

pub struct ReminderWorker {
    db: Database,
    dispatcher: Arc<Dispatcher>,
    config: ReminderConfig,
}

impl ReminderWorker {
    pub fn new(db: Database, dispatcher: Dispatcher, config: ReminderConfig) -> Self {
        Self {
            db,
            dispatcher: Arc::new(dispatcher),
            config,
        }
    }

    /// One scan: queue every due job and wait for the pool to drain it
    pub fn run_once(&self, now: DateTime<Utc>) -> Result<TickReport, DbError> {
        let jobs = scan_due(&self.db, now, &self.config)?;
        let mut report = TickReport {
            scanned: jobs.len(),
            ..TickReport::default()
        };
        if jobs.is_empty() {
            debug!("no reminders due");
            return Ok(report);
        }

        let (job_tx, job_rx) = mpsc::channel::<ReminderJob>();
        let (done_tx, done_rx) = mpsc::channel::<DispatchReport>();
        let job_rx = Arc::new(Mutex::new(job_rx));
        let workers = self.config.workers.max(1).min(jobs.len());

        for job in jobs {
            // receiver lives until the scope below ends
            let _ = job_tx.send(job);
        }
        drop(job_tx);

        std::thread::scope(|scope| {
            for _ in 0..workers {
                let job_rx = Arc::clone(&job_rx);
                let done_tx = done_tx.clone();
                let dispatcher = Arc::clone(&self.dispatcher);
                scope.spawn(move || loop {
                    let next = match job_rx.lock() {
                        Ok(rx) => rx.recv(),
                        Err(_) => break,
                    };
                    let Ok(job) = next else { break };
                    if done_tx.send(dispatcher.dispatch(&job)).is_err() {
                        break;
                    }
                });
            }
        });
        drop(done_tx);

        for outcome in done_rx {
            if outcome.is_sent() {
                report.sent += 1;
            } else {
                report.failed += 1;
            }
        }
        info!(scanned = report.scanned, sent = report.sent, failed = report.failed, "reminder tick finished");
        Ok(report)
    }

    /// Tick every `tick_secs` until `stop` is set
    pub fn run_forever(&self, stop: Arc<AtomicBool>) {
        let tick = std::time::Duration::from_secs(self.config.tick_secs.max(1));
        info!(tick_secs = tick.as_secs(), workers = self.config.workers, "reminder worker started");

        while !stop.load(Ordering::Relaxed) {
            if let Err(e) = self.run_once(Utc::now()) {
                error!(error = %e, "reminder tick failed");
            }

            let started = std::time::Instant::now();
            while started.elapsed() < tick && !stop.load(Ordering::Relaxed) {
                std::thread::sleep(std::time::Duration::from_millis(250));
            }
        }
        info!("reminder worker stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chat::tests::FakeCompleter;
    use crate::db::tests::{catalog_id, seeded_db};
    use crate::db::UserSignup;
    use crate::llm::DisabledCompleter;
    use crate::sms::{LogSender, SmsError, SmsReceipt};
    use std::sync::atomic::AtomicU32;

    /// Fails the first `failures` sends, then succeeds
    struct FlakySender {
        failures: u32,
        calls: AtomicU32,
    }

    impl FlakySender {
        fn new(failures: u32) -> Self {
            Self { failures, calls: AtomicU32::new(0) }
        }
    }

    impl SmsSender for FlakySender {
        fn send(&self, _to: &str, _body: &str) -> Result<SmsReceipt, SmsError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.failures {
                return Err(SmsError::Transport("connection reset".to_string()));
            }
            Ok(SmsReceipt {
                provider: "fake".to_string(),
                message_id: format!("fake-{}", call),
                status: "queued".to_string(),
                recorded: false,
            })
        }

        fn provider(&self) -> &'static str {
            "fake"
        }
    }

    fn no_wait(max_retries: u32) -> RetryPolicy {
        RetryPolicy { base: std::time::Duration::ZERO, max_retries }
    }

    fn setup() -> (tempfile::TempDir, Database, i32) {
        let (dir, db) = seeded_db();
        let user = db.create_user(&UserSignup::with_phone("+15551234567")).unwrap();
        db.mark_phone_verified(user.id).unwrap();
        let (plant, _) = db.add_user_plant(user.id, catalog_id(&db, "Aloe vera"), "Spike").unwrap();
        (dir, db, plant.id)
    }

    fn worker(db: &Database, sender: Arc<dyn SmsSender>, retry: RetryPolicy) -> ReminderWorker {
        let chat = ChatService::new(db.clone(), Arc::new(DisabledCompleter), 100, 0.8);
        let dispatcher = Dispatcher::new(db.clone(), chat, sender, retry);
        ReminderWorker::new(db.clone(), dispatcher, ReminderConfig::default())
    }

    #[test]
    fn test_retry_delay_doubles() {
        let policy = RetryPolicy { base: std::time::Duration::from_secs(60), max_retries: 3 };
        assert_eq!(policy.delay(0).as_secs(), 60);
        assert_eq!(policy.delay(1).as_secs(), 120);
        assert_eq!(policy.delay(2).as_secs(), 240);
        assert_eq!(policy.delay(40), MAX_BACKOFF);
    }

    #[test]
    fn test_scan_due_orders_and_filters() {
        let (_dir, db, plant_id) = setup();
        let now = Utc::now();
        assert!(scan_due(&db, now, &ReminderConfig::default()).unwrap().is_empty());

        let later = now + Duration::days(400);
        let jobs = scan_due(&db, later, &ReminderConfig::default()).unwrap();
        assert!(!jobs.is_empty());
        assert!(jobs.iter().all(|j| j.user_plant_id == plant_id));
        assert!(jobs.windows(2).all(|w| w[0].due <= w[1].due));

        let strict = ReminderConfig { min_urgency: Urgency::Critical, ..ReminderConfig::default() };
        let critical = scan_due(&db, later, &strict).unwrap();
        assert!(critical.iter().all(|j| j.task == CareTask::Watering));
    }

    #[test]
    fn test_run_once_sends_and_suppresses_repeat() {
        let (_dir, db, _) = setup();
        let later = Utc::now() + Duration::days(400);
        let worker = worker(&db, Arc::new(LogSender::new(db.clone())), no_wait(0));

        let report = worker.run_once(later).unwrap();
        assert!(report.scanned > 0);
        assert_eq!(report.sent, report.scanned);
        assert_eq!(report.failed, 0);

        let logged = db.recent_sms(20).unwrap();
        assert_eq!(logged.len(), report.sent);
        assert!(logged.iter().all(|r| r.status == "logged"));

        let again = worker.run_once(later + Duration::hours(1)).unwrap();
        assert_eq!(again.scanned, 0);
    }

    #[test]
    fn test_dispatch_retries_then_succeeds() {
        let (_dir, db, _) = setup();
        let later = Utc::now() + Duration::days(400);
        let job = scan_due(&db, later, &ReminderConfig::default()).unwrap().remove(0);

        let sender = Arc::new(FlakySender::new(2));
        let chat = ChatService::new(db.clone(), Arc::new(FakeCompleter::new("Water. Now.")), 100, 0.8);
        let dispatcher = Dispatcher::new(db.clone(), chat, sender.clone(), no_wait(3));

        match dispatcher.dispatch(&job) {
            DispatchReport::Sent { attempts, source, .. } => {
                assert_eq!(attempts, 3);
                assert_eq!(source, MessageSource::Llm);
            }
            other => panic!("unexpected report {:?}", other),
        }
        assert_eq!(sender.calls.load(Ordering::SeqCst), 3);

        let schedule = db.get_schedule(job.schedule_id).unwrap();
        assert_eq!(schedule.last_reminded_at, Some(care::format_timestamp(later)));
        let row = &db.recent_sms(1).unwrap()[0];
        assert_eq!(row.provider.as_deref(), Some("fake"));
        assert_eq!(row.body, "Water. Now.");

        let history = db.recent_messages(job.user_plant_id, 10).unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].content, "Water. Now.");
    }

    #[test]
    fn test_dispatch_gives_up_and_records_failure() {
        let (_dir, db, _) = setup();
        let later = Utc::now() + Duration::days(400);
        let worker = worker(&db, Arc::new(FlakySender::new(u32::MAX)), no_wait(2));

        let report = worker.run_once(later).unwrap();
        assert_eq!(report.sent, 0);
        assert_eq!(report.failed, report.scanned);

        let rows = db.recent_sms(20).unwrap();
        assert_eq!(rows.len(), report.failed);
        assert!(rows.iter().all(|r| r.status == "failed" && r.error.is_some()));

        // nothing was marked, so the next tick tries again
        let again = scan_due(&db, later, &ReminderConfig::default()).unwrap();
        assert_eq!(again.len(), report.scanned);

        // undelivered reminders stay out of the conversation
        for job in &again {
            assert!(db.recent_messages(job.user_plant_id, 10).unwrap().is_empty());
        }
    }

    #[test]
    fn test_unverified_phone_gets_no_reminders() {
        let (_dir, db) = seeded_db();
        let user = db.create_user(&UserSignup::with_phone("+15559990000")).unwrap();
        db.add_user_plant(user.id, catalog_id(&db, "Aloe vera"), "Spike").unwrap();

        let later = Utc::now() + Duration::days(400);
        assert!(scan_due(&db, later, &ReminderConfig::default()).unwrap().is_empty());
    }

    #[test]
    fn test_opted_out_user_gets_no_reminders() {
        let (_dir, db, _) = setup();
        let user = db.find_user_by_phone("+15551234567", "+1").unwrap().unwrap();
        db.set_user_active(user.id, false).unwrap();

        let later = Utc::now() + Duration::days(400);
        assert!(scan_due(&db, later, &ReminderConfig::default()).unwrap().is_empty());
    }

    #[test]
    fn test_run_forever_stops_on_flag() {
        let (_dir, db, _) = setup();
        let worker = worker(&db, Arc::new(LogSender::new(db.clone())), no_wait(0));
        let stop = Arc::new(AtomicBool::new(true));
        worker.run_forever(stop);
    }
}
