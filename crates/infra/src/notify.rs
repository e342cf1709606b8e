//! Best-effort user notifications.
//!
//! Executors send notifications only after their artifact is committed and
//! ignore failures beyond logging them.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

use chorus_core::UserId;

use crate::error::{map_sqlx_error, StoreError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationKind {
    /// A persona replied to the recipient's post.
    ReplyReceived,
    /// A battle the recipient started has a verdict.
    VerdictReady,
}

impl NotificationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            NotificationKind::ReplyReceived => "reply_received",
            NotificationKind::VerdictReady => "verdict_ready",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notification {
    pub recipient: UserId,
    pub kind: NotificationKind,
    /// The artifact the notification points at (reply or battle id).
    pub subject_ref: Uuid,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum NotifyError {
    #[error("notification store failed: {0}")]
    Store(#[from] StoreError),

    #[error("notification rejected: {0}")]
    Rejected(String),
}

#[async_trait]
pub trait Notifier: Send + Sync + 'static {
    async fn notify(&self, notification: Notification) -> Result<(), NotifyError>;
}

/// Send and swallow: failures are logged, never propagated.
pub(crate) async fn notify_best_effort(notifier: &dyn Notifier, notification: Notification) {
    let kind = notification.kind.as_str();
    let recipient = notification.recipient;
    if let Err(e) = notifier.notify(notification).await {
        warn!(kind, %recipient, error = %e, "notification failed");
    }
}

/// Logs notifications instead of delivering them.
#[derive(Debug, Default, Clone)]
pub struct TracingNotifier;

#[async_trait]
impl Notifier for TracingNotifier {
    async fn notify(&self, notification: Notification) -> Result<(), NotifyError> {
        info!(
            kind = notification.kind.as_str(),
            recipient = %notification.recipient,
            subject_ref = %notification.subject_ref,
            "notification"
        );
        Ok(())
    }
}

/// Records notifications (tests/dev). Can be switched to reject everything.
#[derive(Debug, Default)]
pub struct InMemoryNotifier {
    sent: Mutex<Vec<Notification>>,
    failing: Mutex<bool>,
}

impl InMemoryNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing() -> Self {
        let notifier = Self::default();
        *notifier.failing.lock().unwrap() = true;
        notifier
    }

    pub fn sent(&self) -> Vec<Notification> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait]
impl Notifier for InMemoryNotifier {
    async fn notify(&self, notification: Notification) -> Result<(), NotifyError> {
        if *self.failing.lock().unwrap() {
            return Err(NotifyError::Rejected("notifier disabled".to_string()));
        }
        self.sent.lock().unwrap().push(notification);
        Ok(())
    }
}

/// Appends to the `notifications` table; delivery is someone else's job.
#[derive(Debug, Clone)]
pub struct PgNotifier {
    pool: Arc<PgPool>,
}

impl PgNotifier {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }
}

#[async_trait]
impl Notifier for PgNotifier {
    async fn notify(&self, notification: Notification) -> Result<(), NotifyError> {
        sqlx::query(
            r#"
            INSERT INTO notifications (id, recipient_id, kind, subject_ref, created_at)
            VALUES ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(Uuid::now_v7())
        .bind(Uuid::from(notification.recipient))
        .bind(notification.kind.as_str())
        .bind(notification.subject_ref)
        .bind(notification.created_at)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("notify", e))?;
        Ok(())
    }
}
