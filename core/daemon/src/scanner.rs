//! Scan loop and control surface.
//!
//! One thread polls the reader while the session is active and drives the
//! user-then-tool pairing. Control calls, the poll loop and the auto-reset
//! timer all go through the same session mutex; events are published while
//! that mutex is held so observers see them in decision order.

use std::io;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use tracing::{debug, error, info, trace, warn};

use toolcrib_protocol::{LoanAction, ScanEvent, ScanEventKind, SessionStatus, TagKind};

use crate::backoff::FaultBackoff;
use crate::config::ScanConfig;
use crate::error::ReaderError;
use crate::gateway::LoanGateway;
use crate::notify::NotificationSink;
use crate::reader::{TagRead, TagReader};
use crate::session::{ArmOutcome, Classification, ScanSession};
use crate::tag::TagId;
use crate::timer::ResetTimer;

#[derive(Debug, Clone)]
pub struct ScanSettings {
    pub debounce: Duration,
    pub poll_timeout: Duration,
    pub reset_delay: Duration,
    pub idle_sleep: Duration,
    pub inactive_sleep: Duration,
    pub fault_backoff: Duration,
    pub fault_backoff_max: Duration,
}

impl ScanSettings {
    pub fn from_config(config: &ScanConfig) -> Self {
        Self {
            debounce: config.debounce(),
            poll_timeout: config.poll_timeout(),
            reset_delay: config.reset_delay(),
            idle_sleep: config.idle_sleep(),
            inactive_sleep: config.inactive_sleep(),
            fault_backoff: Duration::from_millis(config.fault_backoff_ms),
            fault_backoff_max: Duration::from_millis(config.fault_backoff_max_ms),
        }
    }
}

#[derive(Debug)]
pub enum PollOutcome {
    Inactive,
    NoTag,
    Debounced,
    UserScanned,
    TransactionComplete(LoanAction),
    TransactionFailed,
    Ignored,
    ReaderFault(ReaderError),
}

pub struct Scanner<R: TagReader, G: LoanGateway> {
    reader: Mutex<R>,
    reader_kind: &'static str,
    gateway: Arc<G>,
    session: Arc<Mutex<ScanSession>>,
    sink: NotificationSink,
    timer: ResetTimer,
    settings: ScanSettings,
}

impl<R: TagReader, G: LoanGateway> Scanner<R, G> {
    pub fn new(reader: R, gateway: Arc<G>, sink: NotificationSink, settings: ScanSettings) -> Self {
        Self {
            reader_kind: reader.kind(),
            reader: Mutex::new(reader),
            gateway,
            session: Arc::new(Mutex::new(ScanSession::new(settings.debounce))),
            sink,
            timer: ResetTimer::new(),
            settings,
        }
    }

    pub fn reader_kind(&self) -> &'static str {
        self.reader_kind
    }

    pub fn sink(&self) -> &NotificationSink {
        &self.sink
    }

    pub fn gateway(&self) -> &G {
        &self.gateway
    }

    // ─────────────────────────────────────────────────────────────────────
    // Control surface
    // ─────────────────────────────────────────────────────────────────────

    pub fn start(&self) -> (ArmOutcome, String) {
        let mut session = self.lock_session();
        self.timer.cancel();
        let outcome = session.arm();
        info!(
            outcome = ?outcome,
            pending_user = ?session.pending_user().map(TagId::as_str),
            "Scanning started"
        );
        (outcome, session.message().to_string())
    }

    pub fn stop(&self) -> String {
        let mut session = self.lock_session();
        session.disarm();
        info!("Scanning stopped");
        session.message().to_string()
    }

    pub fn reset(&self) {
        let mut session = self.lock_session();
        self.timer.cancel();
        session.reset();
        info!("Session reset");
    }

    pub fn status(&self) -> SessionStatus {
        let session = self.lock_session();
        session.snapshot(self.sink.last_sequence())
    }

    /// One read outside the session, e.g. to learn a tag's id before
    /// registering it. Waits for any in-flight poll read to finish first.
    pub fn manual_scan(&self, timeout: Duration) -> Result<TagRead, ReaderError> {
        let result = self.lock_reader().read(timeout);
        match &result {
            Ok(TagRead::Tag(tag)) => info!(tag = %tag, "Manual scan read tag"),
            Ok(TagRead::Timeout) => debug!("Manual scan timed out"),
            Err(err) => warn!(error = %err, "Manual scan failed"),
        }
        result
    }

    // ─────────────────────────────────────────────────────────────────────
    // Poll loop
    // ─────────────────────────────────────────────────────────────────────

    pub fn spawn(scanner: Arc<Self>) -> io::Result<JoinHandle<()>>
    where
        R: 'static,
        G: 'static,
    {
        thread::Builder::new()
            .name("toolcrib-scan".to_string())
            .spawn(move || scanner.run())
    }

    fn run(&self) {
        let mut backoff = FaultBackoff::new(
            self.settings.fault_backoff,
            self.settings.fault_backoff_max,
        );
        info!(
            reader = self.reader_kind,
            poll_timeout_ms = self.settings.poll_timeout.as_millis() as u64,
            "Scan loop running"
        );

        loop {
            let pause = match panic::catch_unwind(AssertUnwindSafe(|| self.tick(&mut backoff))) {
                Ok(pause) => pause,
                Err(payload) => {
                    error!(panic = %panic_message(&*payload), "Scan iteration panicked");
                    self.settings.fault_backoff
                }
            };
            thread::sleep(pause);
        }
    }

    /// One loop iteration. Returns how long to sleep before the next one.
    pub fn tick(&self, backoff: &mut FaultBackoff) -> Duration {
        match self.poll_once() {
            PollOutcome::Inactive => self.settings.inactive_sleep,
            PollOutcome::ReaderFault(err) => {
                let wait = backoff.on_fault();
                warn!(
                    error = %err,
                    consecutive = backoff.consecutive_faults(),
                    backoff_ms = wait.as_millis() as u64,
                    "Reader fault"
                );
                wait
            }
            _ => {
                backoff.on_success();
                self.settings.idle_sleep
            }
        }
    }

    pub fn poll_once(&self) -> PollOutcome {
        if !self.lock_session().is_active() {
            return PollOutcome::Inactive;
        }

        // The session lock is not held across the read; control calls stay
        // responsive while the reader waits.
        let read = self.lock_reader().read(self.settings.poll_timeout);
        match read {
            Ok(TagRead::Timeout) => {
                trace!("No tag within poll timeout");
                PollOutcome::NoTag
            }
            Ok(TagRead::Tag(tag)) => self.handle_tag(tag, Instant::now()),
            Err(err) => PollOutcome::ReaderFault(err),
        }
    }

    fn handle_tag(&self, tag: TagId, now: Instant) -> PollOutcome {
        let mut session = self.lock_session();
        if !session.observe(&tag, now) {
            debug!(tag = %tag, "Debounced repeat read");
            return PollOutcome::Debounced;
        }

        match session.classify(tag) {
            Classification::User(user) => {
                self.record_scan(&user, TagKind::User);
                let name = self.user_name(&user);
                let message = format!("User scanned: {} ({})", name, user);
                session.set_message(message.clone());
                self.sink.publish(
                    ScanEvent::new(ScanEventKind::UserScanned, message)
                        .with_user(user.as_str(), name.as_str()),
                );
                info!(user = %user, name = %name, "User tag accepted");
                PollOutcome::UserScanned
            }
            Classification::Tool { user, tool } => {
                self.record_scan(&tool, TagKind::Tool);
                self.settle(&mut session, &user, &tool)
            }
            Classification::ToolRetry { user, tool } => {
                info!(user = %user, tool = %tool, "Retrying failed transaction");
                self.record_scan(&tool, TagKind::Tool);
                self.settle(&mut session, &user, &tool)
            }
            Classification::Ignored => {
                debug!(phase = ?session.phase(), "Tag ignored while settling");
                PollOutcome::Ignored
            }
        }
    }

    fn settle(
        &self,
        session: &mut MutexGuard<'_, ScanSession>,
        user: &TagId,
        tool: &TagId,
    ) -> PollOutcome {
        let epoch = session.begin_settling();
        let user_name = self.user_name(user);
        let tool_name = self.tool_name(tool);
        session.set_message(format!("Tool scanned: {} ({})", tool_name, tool));

        let outcome = match self.gateway.borrow_or_return(user, tool) {
            Ok(outcome) => outcome,
            Err(err) => {
                session.mark_failed();
                let message = format!("Error: {}", err);
                session.set_message(message.clone());
                error!(error = %err, user = %user, tool = %tool, "Loan transaction failed");
                self.sink.publish(
                    ScanEvent::new(ScanEventKind::Error, message)
                        .with_user(user.as_str(), user_name.as_str())
                        .with_tool(tool.as_str(), tool_name.as_str()),
                );
                return PollOutcome::TransactionFailed;
            }
        };

        let mut event = ScanEvent::new(ScanEventKind::TransactionComplete, String::new())
            .with_user(user.as_str(), user_name.as_str())
            .with_tool(tool.as_str(), tool_name.as_str())
            .with_action(outcome.action);

        let message = match (outcome.action, outcome.prior_borrower_id) {
            (LoanAction::Return, Some(prior)) => {
                let prior_name = match TagId::parse(&prior) {
                    Some(id) => self.user_name(&id),
                    None => prior.clone(),
                };
                let message = format!(
                    "Returned: {} by {} (borrower: {})",
                    tool_name, user_name, prior_name
                );
                event = event.with_prior_borrower(prior, prior_name);
                message
            }
            (LoanAction::Return, None) => format!("Returned: {} by {}", tool_name, user_name),
            (LoanAction::Borrow, _) => format!("Borrowed: {} -> {}", tool_name, user_name),
        };
        event.message = message.clone();
        session.set_message(message);

        info!(
            action = outcome.action.as_str(),
            loan_id = outcome.loan_id,
            user = %user,
            tool = %tool,
            "Loan transaction complete"
        );
        self.sink.publish(event);
        self.schedule_reset(epoch);
        PollOutcome::TransactionComplete(outcome.action)
    }

    fn schedule_reset(&self, epoch: u64) {
        let session = Arc::clone(&self.session);
        let sink = self.sink.clone();
        self.timer.schedule(self.settings.reset_delay, move || {
            let mut session = session.lock().unwrap_or_else(PoisonError::into_inner);
            if session.auto_reset(epoch) {
                sink.publish(ScanEvent::new(
                    ScanEventKind::StateReset,
                    session.message().to_string(),
                ));
                info!("Session auto-reset; waiting for next user");
            } else {
                debug!(epoch, "Skipping stale auto-reset");
            }
        });
    }

    fn user_name(&self, id: &TagId) -> String {
        self.gateway.name_of_user(id).unwrap_or_else(|err| {
            warn!(error = %err, tag = %id, "User name lookup failed");
            id.to_string()
        })
    }

    fn tool_name(&self, id: &TagId) -> String {
        self.gateway.name_of_tool(id).unwrap_or_else(|err| {
            warn!(error = %err, tag = %id, "Tool name lookup failed");
            id.to_string()
        })
    }

    fn record_scan(&self, id: &TagId, role: TagKind) {
        if let Err(err) = self.gateway.record_scan(id, role) {
            warn!(error = %err, tag = %id, role = role.as_str(), "Failed to record scan");
        }
    }

    fn lock_session(&self) -> MutexGuard<'_, ScanSession> {
        self.session.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_reader(&self) -> MutexGuard<'_, R> {
        self.reader.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}
