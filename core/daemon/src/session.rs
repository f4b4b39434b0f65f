//! In-memory scan session.
//!
//! Pure state: no I/O and no clock reads. The scanner owns one instance behind
//! a mutex and feeds it tags, timestamps and transaction results.

use std::time::{Duration, Instant};

use toolcrib_protocol::{SessionPhase, SessionStatus};

use crate::tag::TagId;

pub const READY_MESSAGE: &str = "Ready: present a user tag";
pub const STOPPED_MESSAGE: &str = "Stopped";
const RESUMED_MESSAGE: &str = "Resumed: present a tool tag";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArmOutcome {
    Fresh,
    Resumed,
}

/// What an accepted tag means for the session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Classification {
    User(TagId),
    Tool { user: TagId, tool: TagId },
    /// A new tool tap after the previous transaction failed.
    ToolRetry { user: TagId, tool: TagId },
    Ignored,
}

#[derive(Debug)]
pub struct ScanSession {
    active: bool,
    pending_user: Option<TagId>,
    pending_tool: Option<TagId>,
    transaction_failed: bool,
    last_seen: Option<(TagId, Instant)>,
    debounce: Duration,
    message: String,
    epoch: u64,
}

impl ScanSession {
    pub fn new(debounce: Duration) -> Self {
        Self {
            active: false,
            pending_user: None,
            pending_tool: None,
            transaction_failed: false,
            last_seen: None,
            debounce,
            message: STOPPED_MESSAGE.to_string(),
            epoch: 0,
        }
    }

    /// Activates polling. A session left half-way by [`disarm`](Self::disarm)
    /// is resumed; otherwise pending ids are cleared.
    pub fn arm(&mut self) -> ArmOutcome {
        self.epoch += 1;
        let resumable = !self.active
            && self.pending_user.is_some()
            && (self.pending_tool.is_none() || self.transaction_failed);
        self.active = true;

        if resumable {
            self.message = RESUMED_MESSAGE.to_string();
            ArmOutcome::Resumed
        } else {
            self.clear_pending();
            self.message = READY_MESSAGE.to_string();
            ArmOutcome::Fresh
        }
    }

    pub fn disarm(&mut self) {
        self.active = false;
        self.message = STOPPED_MESSAGE.to_string();
    }

    pub fn reset(&mut self) {
        self.epoch += 1;
        self.clear_pending();
        self.message.clear();
    }

    /// Debounce gate. Returns `false` when `tag` repeats the last accepted tag
    /// inside the debounce window; the window is measured from the accepted read.
    pub fn observe(&mut self, tag: &TagId, now: Instant) -> bool {
        if let Some((last, at)) = &self.last_seen {
            if last == tag && now.saturating_duration_since(*at) < self.debounce {
                return false;
            }
        }
        self.last_seen = Some((tag.clone(), now));
        true
    }

    pub fn classify(&mut self, tag: TagId) -> Classification {
        let Some(user) = self.pending_user.clone() else {
            self.pending_user = Some(tag.clone());
            return Classification::User(tag);
        };

        if self.pending_tool.is_none() {
            self.pending_tool = Some(tag.clone());
            return Classification::Tool { user, tool: tag };
        }

        if self.transaction_failed {
            self.pending_tool = Some(tag.clone());
            return Classification::ToolRetry { user, tool: tag };
        }

        Classification::Ignored
    }

    /// Marks the start of a transaction and returns the epoch an auto-reset
    /// must match.
    pub fn begin_settling(&mut self) -> u64 {
        self.epoch += 1;
        self.transaction_failed = false;
        self.epoch
    }

    pub fn mark_failed(&mut self) {
        self.transaction_failed = true;
    }

    /// Clears the session if nothing happened since `epoch` was handed out.
    pub fn auto_reset(&mut self, epoch: u64) -> bool {
        if self.epoch != epoch {
            return false;
        }
        self.epoch += 1;
        self.clear_pending();
        self.message = if self.active {
            READY_MESSAGE
        } else {
            STOPPED_MESSAGE
        }
        .to_string();
        true
    }

    pub fn set_message(&mut self, message: impl Into<String>) {
        self.message = message.into();
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    pub fn pending_user(&self) -> Option<&TagId> {
        self.pending_user.as_ref()
    }

    #[cfg(test)]
    pub fn pending_tool(&self) -> Option<&TagId> {
        self.pending_tool.as_ref()
    }

    pub fn phase(&self) -> SessionPhase {
        if !self.active {
            return SessionPhase::Idle;
        }
        match (&self.pending_user, &self.pending_tool) {
            (None, _) => SessionPhase::AwaitingUser,
            (Some(_), None) => SessionPhase::AwaitingTool,
            (Some(_), Some(_)) => SessionPhase::Settling,
        }
    }

    pub fn snapshot(&self, last_sequence: u64) -> SessionStatus {
        SessionStatus {
            phase: self.phase(),
            active: self.active,
            pending_user_id: self.pending_user.as_ref().map(|id| id.to_string()),
            pending_tool_id: self.pending_tool.as_ref().map(|id| id.to_string()),
            transaction_failed: self.transaction_failed,
            message: self.message.clone(),
            last_sequence,
        }
    }

    fn clear_pending(&mut self) {
        self.pending_user = None;
        self.pending_tool = None;
        self.transaction_failed = false;
    }
}
