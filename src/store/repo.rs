use crate::domain::email::{EmailSummary, NormalizedEmailRecord};
use crate::error::IngestError;

pub trait MailRepository {
    /// Insert, or overwrite every field of the row with the same `message_id`.
    fn upsert(&self, record: &NormalizedEmailRecord) -> Result<(), IngestError>;

    /// Newest first.
    fn list_summaries(&self) -> Result<Vec<EmailSummary>, IngestError>;
    fn fetch_by_id(&self, message_id: &str) -> Result<Option<NormalizedEmailRecord>, IngestError>;

    fn count(&self) -> Result<usize, IngestError>;
}
