use chrono::Utc;
use log::{error, info, warn};
use std::ops::{Deref, DerefMut};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::domain::email::{FetchRange, MessageToken};
use crate::error::{IngestError, SkipReason};
use crate::mail::MailTransport;
use crate::mail::normalize::normalize_message;
use crate::store::repo::MailRepository;

/// Checked between messages; tripping it ends the batch at the next boundary.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageOutcome {
    Stored { message_id: String },
    Skipped(SkipReason),
}

#[derive(Debug, Default)]
pub struct BatchReport {
    /// Identifiers the server returned for the range.
    pub listed: usize,
    /// Message ids written, in ingestion order.
    pub stored: Vec<String>,
    pub skipped: Vec<(MessageToken, SkipReason)>,
    pub cancelled: bool,
}

impl BatchReport {
    pub fn processed(&self) -> usize {
        self.stored.len()
    }
}

/// Closes the wrapped session when dropped, whatever path got us there.
struct SessionGuard<T: MailTransport>(T);

impl<T: MailTransport> Deref for SessionGuard<T> {
    type Target = T;
    fn deref(&self) -> &T {
        &self.0
    }
}

impl<T: MailTransport> DerefMut for SessionGuard<T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.0
    }
}

impl<T: MailTransport> Drop for SessionGuard<T> {
    fn drop(&mut self) {
        self.0.close();
    }
}

/// Run one ingestion pass over `folder`.
///
/// Only failures to open the session, select the folder or list the range
/// are returned as errors. Every per-message problem is recorded in the
/// report and the loop moves on.
pub fn run_batch<T, F>(
    open: F,
    repo: &dyn MailRepository,
    folder: &str,
    range: &FetchRange,
    cancel: &CancelToken,
) -> Result<BatchReport, IngestError>
where
    T: MailTransport,
    F: FnOnce() -> Result<T, IngestError>,
{
    info!("starting batch on {folder} for {range}");
    let mut session = SessionGuard(open().inspect_err(|e| error!("cannot open session: {e}"))?);

    session
        .select_folder(folder)
        .inspect_err(|e| error!("cannot select {folder}: {e}"))?;
    let tokens = session
        .list_identifiers(range)
        .inspect_err(|e| error!("cannot list {folder}: {e}"))?;
    info!("found {} messages", tokens.len());

    let mut report = BatchReport {
        listed: tokens.len(),
        ..Default::default()
    };

    for token in tokens {
        if cancel.is_cancelled() {
            warn!("batch cancelled before message {token}");
            report.cancelled = true;
            break;
        }
        match process_message(&mut *session, repo, token) {
            MessageOutcome::Stored { message_id } => report.stored.push(message_id),
            MessageOutcome::Skipped(reason) => {
                error!("skipping message {token}: {reason}");
                report.skipped.push((token, reason));
            }
        }
    }

    session.close();
    info!(
        "batch done: {} stored, {} skipped of {} listed{}",
        report.processed(),
        report.skipped.len(),
        report.listed,
        if report.cancelled { " (cancelled)" } else { "" }
    );
    Ok(report)
}

/// Fetch, decode and store a single message.
pub fn process_message<T: MailTransport + ?Sized>(
    transport: &mut T,
    repo: &dyn MailRepository,
    token: MessageToken,
) -> MessageOutcome {
    let raw = match transport.fetch(token) {
        Ok(raw) => raw,
        Err(e) => return MessageOutcome::Skipped(SkipReason::Fetch(e.to_string())),
    };

    let record = normalize_message(raw, Utc::now());
    match repo.upsert(&record) {
        Ok(()) => {
            info!("stored {:?} (ID: {})", record.subject, record.message_id);
            MessageOutcome::Stored {
                message_id: record.message_id,
            }
        }
        Err(e) => MessageOutcome::Skipped(SkipReason::Storage(e.to_string())),
    }
}
