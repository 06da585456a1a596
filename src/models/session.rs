use std::path::PathBuf;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle state of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    /// Created, no sender yet.
    Waiting,
    /// A sender has joined at least once.
    Connected,
    /// Terminal.
    Closed,
}

/// Why a session was closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CloseReason {
    Sender,
    Receiver,
    Ttl,
    SenderGone,
    ReceiverGone,
}

/// One of the two parties of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Sender,
    Receiver,
}

impl From<Role> for CloseReason {
    fn from(role: Role) -> Self {
        match role {
            Role::Sender => CloseReason::Sender,
            Role::Receiver => CloseReason::Receiver,
        }
    }
}

/// Metadata of the file currently held for a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileMeta {
    /// Original filename as sent by the sender.
    pub name: String,
    /// Size in bytes.
    pub size: u64,
    /// MIME type.
    pub content_type: String,
    /// Where the blob lives on disk. Never leaves the server.
    pub storage_path: PathBuf,
    pub uploaded_at: DateTime<Utc>,
}

/// The client-safe projection of [`FileMeta`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FileSummary {
    pub name: String,
    pub size: u64,
    #[serde(rename = "type")]
    pub content_type: String,
}

impl From<&FileMeta> for FileSummary {
    fn from(meta: &FileMeta) -> Self {
        Self {
            name: meta.name.clone(),
            size: meta.size,
            content_type: meta.content_type.clone(),
        }
    }
}

/// Represents a pairing between one receiver and one sender.
///
/// `closed_at`/`closed_by` are set iff `status == Closed`, and a closed session
/// never holds a file. Both are maintained by [`Session::close`], which is the
/// only way into the closed state.
#[derive(Debug, Clone)]
pub struct Session {
    pub id: String,
    pub code: String,
    pub receiver_token: String,
    pub sender_token: String,
    pub status: SessionStatus,
    pub closed_by: Option<CloseReason>,
    pub closed_at: Option<DateTime<Utc>>,
    pub file: Option<FileMeta>,
    pub created_at: DateTime<Utc>,
    pub last_activity_at: DateTime<Utc>,
    /// `None` when TTL enforcement is disabled.
    pub expires_at: Option<DateTime<Utc>>,
    pub last_seen_sender: Option<DateTime<Utc>>,
    pub last_seen_receiver: Option<DateTime<Utc>>,
    pub sender_connected: bool,
}

/// `now + ttl_secs`, or `None` when the TTL is disabled or out of range.
fn deadline(ttl_secs: i64, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
    if ttl_secs <= 0 {
        return None;
    }
    Duration::try_seconds(ttl_secs).and_then(|ttl| now.checked_add_signed(ttl))
}

impl Session {
    /// Creates a waiting session. `ttl_secs <= 0` disables expiry.
    pub fn new(
        id: String,
        code: String,
        receiver_token: String,
        sender_token: String,
        ttl_secs: i64,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            code,
            receiver_token,
            sender_token,
            status: SessionStatus::Waiting,
            closed_by: None,
            closed_at: None,
            file: None,
            created_at: now,
            last_activity_at: now,
            expires_at: deadline(ttl_secs, now),
            last_seen_sender: None,
            last_seen_receiver: None,
            sender_connected: false,
        }
    }

    pub fn is_closed(&self) -> bool {
        self.status == SessionStatus::Closed
    }

    /// Whether the TTL deadline has passed, regardless of sweeper progress.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|deadline| deadline <= now)
    }

    /// Closed for every client-facing purpose: closed, or past its deadline.
    pub fn is_effectively_closed(&self, now: DateTime<Utc>) -> bool {
        self.is_closed() || self.is_expired(now)
    }

    /// Whole seconds until expiry, clamped at zero. `None` without TTL.
    pub fn seconds_left(&self, now: DateTime<Utc>) -> Option<i64> {
        self.expires_at
            .map(|deadline| (deadline - now).num_seconds().max(0))
    }

    /// Records activity and slides the deadline forward.
    ///
    /// The deadline never moves backward, even if called with an older `now`.
    pub fn touch(&mut self, ttl_secs: i64, now: DateTime<Utc>) {
        self.last_activity_at = now;
        if let Some(rolled) = deadline(ttl_secs, now) {
            self.expires_at = Some(match self.expires_at {
                Some(current) if current > rolled => current,
                _ => rolled,
            });
        }
    }

    /// Marks a role as alive.
    pub fn mark_seen(&mut self, role: Role, now: DateTime<Utc>) {
        match role {
            Role::Sender => {
                self.last_seen_sender = Some(now);
                self.sender_connected = true;
            }
            Role::Receiver => self.last_seen_receiver = Some(now),
        }
    }

    /// Sender joined (by code or by QR). Waiting sessions become connected.
    pub fn connect_sender(&mut self, now: DateTime<Utc>) {
        if self.status == SessionStatus::Waiting {
            self.status = SessionStatus::Connected;
        }
        self.mark_seen(Role::Sender, now);
    }

    /// Closes the session. The first reason wins; closing twice is a no-op.
    ///
    /// Returns the detached file, if any, so the caller can delete its bytes.
    pub fn close(&mut self, reason: CloseReason, now: DateTime<Utc>) -> Option<FileMeta> {
        if self.is_closed() {
            return self.file.take();
        }
        self.status = SessionStatus::Closed;
        self.closed_by = Some(reason);
        self.closed_at = Some(now);
        self.file.take()
    }

    pub fn file_summary(&self) -> Option<FileSummary> {
        self.file.as_ref().map(FileSummary::from)
    }
}
