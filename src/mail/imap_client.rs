use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use native_tls::{TlsConnector, TlsStream};
use std::net::TcpStream;

use crate::domain::email::{FetchRange, MessageToken, RawMessage};
use crate::error::IngestError;
use crate::mail::{Credentials, MailTransport};

type TlsSession = imap::Session<TlsStream<TcpStream>>;

pub struct ImapTransport {
    server: String,
    session: Option<TlsSession>,
}

impl ImapTransport {
    pub fn open(creds: &Credentials) -> Result<Self, IngestError> {
        let tls = TlsConnector::builder()
            .build()
            .map_err(|e| IngestError::Connection(format!("TLS setup: {e}")))?;
        let client = imap::connect((creds.host.as_str(), creds.port), creds.host.as_str(), &tls)
            .map_err(|e| {
                IngestError::Connection(format!("{}:{}: {e}", creds.host, creds.port))
            })?;

        let session = client
            .login(&creds.username, &creds.password)
            .map_err(|(e, _client)| IngestError::Connection(format!("login rejected: {e}")))?;

        info!("IMAP session open on {}:{}", creds.host, creds.port);
        Ok(Self {
            server: creds.host.clone(),
            session: Some(session),
        })
    }

    fn session(&mut self) -> Result<&mut TlsSession, IngestError> {
        self.session
            .as_mut()
            .ok_or_else(|| IngestError::Connection(format!("session to {} is closed", self.server)))
    }
}

impl MailTransport for ImapTransport {
    fn select_folder(&mut self, name: &str) -> Result<(), IngestError> {
        let mailbox = self
            .session()?
            .select(name)
            .map_err(|e| IngestError::Protocol(format!("cannot select {name:?}: {e}")))?;
        info!("{name} has {} messages", mailbox.exists);
        Ok(())
    }

    fn list_identifiers(&mut self, range: &FetchRange) -> Result<Vec<MessageToken>, IngestError> {
        let query = search_query(range);
        debug!("UID SEARCH {query}");
        let mut uids: Vec<u32> = self
            .session()?
            .uid_search(&query)
            .map_err(|e| IngestError::Protocol(format!("search {query:?} failed: {e}")))?
            .into_iter()
            .collect();
        uids.sort_unstable();
        Ok(uids.into_iter().map(MessageToken).collect())
    }

    fn fetch(&mut self, token: MessageToken) -> Result<RawMessage, IngestError> {
        let fetch_err = |reason: String| IngestError::Fetch { token, reason };
        let session = self.session()?;

        let uid = token.to_string();
        let fetches = session
            .uid_fetch(&uid, "BODY.PEEK[]")
            .map_err(|e| fetch_err(e.to_string()))?;
        if let Some(body) = fetches.iter().next().and_then(|f| f.body()) {
            return Ok(RawMessage {
                token,
                bytes: body.to_vec(),
            });
        }

        // Some servers answer the first fetch without a body; retry once.
        warn!("UID {uid} returned no body; retrying once");
        let retry = session
            .uid_fetch(&uid, "BODY.PEEK[]")
            .map_err(|e| fetch_err(e.to_string()))?;
        let body = retry
            .iter()
            .next()
            .and_then(|f| f.body())
            .ok_or_else(|| fetch_err("no body even after retry".to_string()))?;
        Ok(RawMessage {
            token,
            bytes: body.to_vec(),
        })
    }

    fn close(&mut self) {
        if let Some(mut session) = self.session.take() {
            match session.logout() {
                Ok(()) => debug!("IMAP session to {} closed", self.server),
                Err(e) => warn!("IMAP logout from {} failed: {e}", self.server),
            }
        }
    }
}

impl Drop for ImapTransport {
    fn drop(&mut self) {
        self.close();
    }
}

/// `UID SEARCH` criteria for `range`. IMAP dates have day granularity and
/// `BEFORE` is exclusive, so the end day is bumped by one.
pub fn search_query(range: &FetchRange) -> String {
    let mut terms = Vec::new();
    if let Some(start) = range.start {
        terms.push(format!("SINCE {}", imap_date(start)));
    }
    if let Some(end) = range.end {
        let day_after = end
            .date_naive()
            .succ_opt()
            .unwrap_or_else(|| end.date_naive());
        terms.push(format!("BEFORE {}", day_after.format("%-d-%b-%Y")));
    }
    if terms.is_empty() {
        "ALL".to_string()
    } else {
        terms.join(" ")
    }
}

fn imap_date(at: DateTime<Utc>) -> String {
    at.format("%-d-%b-%Y").to_string()
}
