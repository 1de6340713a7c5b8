use chrono::{DateTime, Utc};
use rusqlite::types::Type;
use rusqlite::{Connection, OptionalExtension, Row, params};

use crate::domain::email::{EmailSummary, NormalizedEmailRecord};
use crate::error::IngestError;
use crate::store::repo::MailRepository;

pub struct SqliteRepo {
    conn: Connection,
}

impl SqliteRepo {
    pub fn open(path: &std::path::Path) -> Result<Self, IngestError> {
        let conn = Connection::open(path)?;
        let repo = Self { conn };
        repo.migrate()?;
        Ok(repo)
    }

    pub fn open_in_memory() -> Result<Self, IngestError> {
        let repo = Self {
            conn: Connection::open_in_memory()?,
        };
        repo.migrate()?;
        Ok(repo)
    }

    fn migrate(&self) -> Result<(), IngestError> {
        self.conn.execute_batch(
            r#"
            PRAGMA journal_mode=WAL;

            CREATE TABLE IF NOT EXISTS emails (
                message_id      TEXT PRIMARY KEY,
                subject         TEXT NOT NULL,
                sender          TEXT NOT NULL,
                recipients      TEXT NOT NULL,
                cc              TEXT NOT NULL,
                bcc             TEXT NOT NULL,
                content         TEXT NOT NULL,
                received_epoch  INTEGER NOT NULL
            );

            CREATE INDEX IF NOT EXISTS emails_received
                ON emails (received_epoch DESC);
            "#,
        )?;
        Ok(())
    }
}

fn epoch_column(r: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let epoch: i64 = r.get(idx)?;
    DateTime::from_timestamp(epoch, 0).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            idx,
            Type::Integer,
            format!("epoch {epoch} out of range").into(),
        )
    })
}

fn record_from_row(r: &Row<'_>) -> rusqlite::Result<NormalizedEmailRecord> {
    Ok(NormalizedEmailRecord {
        message_id: r.get(0)?,
        subject: r.get(1)?,
        sender: r.get(2)?,
        recipients: r.get(3)?,
        cc: r.get(4)?,
        bcc: r.get(5)?,
        content: r.get(6)?,
        received_at: epoch_column(r, 7)?,
    })
}

impl MailRepository for SqliteRepo {
    fn upsert(&self, record: &NormalizedEmailRecord) -> Result<(), IngestError> {
        let tx = self.conn.unchecked_transaction()?;
        tx.execute(
            r#"
            INSERT INTO emails
                (message_id, subject, sender, recipients, cc, bcc, content, received_epoch)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
            ON CONFLICT(message_id) DO UPDATE SET
              subject=excluded.subject,
              sender=excluded.sender,
              recipients=excluded.recipients,
              cc=excluded.cc,
              bcc=excluded.bcc,
              content=excluded.content,
              received_epoch=excluded.received_epoch
            "#,
            params![
                record.message_id,
                record.subject,
                record.sender,
                record.recipients,
                record.cc,
                record.bcc,
                record.content,
                record.received_at.timestamp(),
            ],
        )?;
        tx.commit()?;
        Ok(())
    }

    fn list_summaries(&self) -> Result<Vec<EmailSummary>, IngestError> {
        let mut stmt = self.conn.prepare(
            r#"
            SELECT message_id, subject, sender, received_epoch
            FROM emails
            ORDER BY received_epoch DESC, message_id DESC
            "#,
        )?;

        let mut rows = stmt.query([])?;
        let mut out = Vec::new();

        while let Some(r) = rows.next()? {
            out.push(EmailSummary {
                message_id: r.get(0)?,
                subject: r.get(1)?,
                sender: r.get(2)?,
                received_at: epoch_column(r, 3)?,
            });
        }
        Ok(out)
    }

    fn fetch_by_id(&self, message_id: &str) -> Result<Option<NormalizedEmailRecord>, IngestError> {
        let record = self
            .conn
            .query_row(
                r#"
                SELECT message_id, subject, sender, recipients, cc, bcc, content, received_epoch
                FROM emails WHERE message_id=?1
                "#,
                params![message_id],
                record_from_row,
            )
            .optional()?;
        Ok(record)
    }

    fn count(&self) -> Result<usize, IngestError> {
        let n: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM emails", [], |r| r.get(0))?;
        Ok(n as usize)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn record(id: &str, subject: &str, day: u32) -> NormalizedEmailRecord {
        NormalizedEmailRecord {
            message_id: id.to_string(),
            subject: subject.to_string(),
            sender: "billing@bank.example".to_string(),
            recipients: "me@example.com".to_string(),
            cc: String::new(),
            bcc: String::new(),
            content: format!("content of {subject}"),
            received_at: Utc.with_ymd_and_hms(2024, 3, day, 12, 0, 0).unwrap(),
        }
    }

    #[test]
    fn out_of_range_epoch_is_a_storage_error() {
        let repo = SqliteRepo::open_in_memory().unwrap();
        repo.conn
            .execute(
                "INSERT INTO emails VALUES ('<bad@x>', '', '', '', '', '', 'c', ?1)",
                params![i64::MAX],
            )
            .unwrap();

        assert!(matches!(
            repo.fetch_by_id("<bad@x>"),
            Err(IngestError::Storage(rusqlite::Error::FromSqlConversionFailure(7, ..)))
        ));
        assert!(matches!(
            repo.list_summaries(),
            Err(IngestError::Storage(_))
        ));
    }

    #[test]
    fn upsert_twice_keeps_one_row_with_latest_fields() {
        let repo = SqliteRepo::open_in_memory().unwrap();
        repo.upsert(&record("<a@x>", "first", 1)).unwrap();

        let mut second = record("<a@x>", "second", 2);
        second.cc = "boss@example.com".to_string();
        second.content = "rewritten".to_string();
        repo.upsert(&second).unwrap();

        assert_eq!(repo.count().unwrap(), 1);
        assert_eq!(repo.fetch_by_id("<a@x>").unwrap(), Some(second));
    }

    #[test]
    fn summaries_are_newest_first() {
        let repo = SqliteRepo::open_in_memory().unwrap();
        repo.upsert(&record("<old@x>", "old", 1)).unwrap();
        repo.upsert(&record("<new@x>", "new", 20)).unwrap();
        repo.upsert(&record("<mid@x>", "mid", 10)).unwrap();

        let ids: Vec<String> = repo
            .list_summaries()
            .unwrap()
            .into_iter()
            .map(|s| s.message_id)
            .collect();
        assert_eq!(ids, ["<new@x>", "<mid@x>", "<old@x>"]);
    }

    #[test]
    fn unknown_id_is_not_found() {
        let repo = SqliteRepo::open_in_memory().unwrap();
        assert_eq!(repo.fetch_by_id("<missing@x>").unwrap(), None);
    }

    #[test]
    fn failed_write_leaves_store_untouched() {
        let repo = SqliteRepo::open_in_memory().unwrap();
        let kept = record("<a@x>", "kept", 1);
        repo.upsert(&kept).unwrap();

        repo.conn
            .execute_batch(
                "CREATE TRIGGER reject BEFORE UPDATE ON emails
                 BEGIN SELECT RAISE(ABORT, 'read only'); END;",
            )
            .unwrap();

        let err = repo.upsert(&record("<a@x>", "lost", 2)).unwrap_err();
        assert!(matches!(err, IngestError::Storage(_)));
        assert_eq!(repo.fetch_by_id("<a@x>").unwrap(), Some(kept));
        assert_eq!(repo.count().unwrap(), 1);
    }
}
