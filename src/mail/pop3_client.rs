//! Minimal POP3 client (RFC 1939) over TLS.
//!
//! POP3 has no server-side search, so a bounded [`FetchRange`] is applied by
//! pulling each candidate's headers with `TOP n 0` and filtering on `Date`.
//! That costs one round trip per message in the mailbox.

use log::{debug, info, warn};
use mailparse::MailHeaderMap;
use native_tls::{TlsConnector, TlsStream};
use std::io::{self, BufRead, BufReader, Read, Write};
use std::net::TcpStream;
use std::time::Duration;
use thiserror::Error;

use crate::domain::email::{FetchRange, MessageToken, RawMessage};
use crate::error::IngestError;
use crate::mail::dates::parse_mail_date;
use crate::mail::{Credentials, MailTransport};

const IO_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, Error)]
enum Pop3Error {
    #[error("server replied -ERR {0}")]
    Negative(String),

    #[error("unexpected reply {0:?}")]
    Malformed(String),

    #[error(transparent)]
    Io(#[from] io::Error),
}

pub struct Pop3Session<S: Read + Write> {
    stream: Option<BufReader<S>>,
}

impl Pop3Session<TlsStream<TcpStream>> {
    pub fn open(creds: &Credentials) -> Result<Self, IngestError> {
        let conn_err = |e: &dyn std::fmt::Display| {
            IngestError::Connection(format!("{}:{}: {e}", creds.host, creds.port))
        };

        let tcp = TcpStream::connect((creds.host.as_str(), creds.port)).map_err(|e| conn_err(&e))?;
        tcp.set_read_timeout(Some(IO_TIMEOUT))
            .map_err(|e| conn_err(&e))?;
        let tls = TlsConnector::new().map_err(|e| conn_err(&e))?;
        let stream = tls
            .connect(&creds.host, tcp)
            .map_err(|e| conn_err(&e))?;

        let session = Self::login(stream, &creds.username, &creds.password)?;
        info!("POP3 session open on {}:{}", creds.host, creds.port);
        Ok(session)
    }
}

impl<S: Read + Write> Pop3Session<S> {
    /// Read the greeting and authenticate with `USER`/`PASS`.
    pub fn login(stream: S, username: &str, password: &str) -> Result<Self, IngestError> {
        let mut session = Self {
            stream: Some(BufReader::new(stream)),
        };
        let auth_err = |e: Pop3Error| IngestError::Connection(e.to_string());

        session.read_status().map_err(auth_err)?;
        session
            .command(&format!("USER {username}"))
            .map_err(auth_err)?;
        session
            .command(&format!("PASS {password}"))
            .map_err(auth_err)?;
        Ok(session)
    }

    fn stream(&mut self) -> Result<&mut BufReader<S>, Pop3Error> {
        self.stream
            .as_mut()
            .ok_or_else(|| Pop3Error::Io(io::Error::new(io::ErrorKind::NotConnected, "closed")))
    }

    fn command(&mut self, line: &str) -> Result<String, Pop3Error> {
        if line.starts_with("PASS ") {
            debug!("POP3 > PASS ****");
        } else {
            debug!("POP3 > {line}");
        }
        let stream = self.stream()?;
        stream.get_mut().write_all(format!("{line}\r\n").as_bytes())?;
        stream.get_mut().flush()?;
        self.read_status()
    }

    fn read_status(&mut self) -> Result<String, Pop3Error> {
        let mut line = Vec::new();
        if self.stream()?.read_until(b'\n', &mut line)? == 0 {
            return Err(io::Error::from(io::ErrorKind::UnexpectedEof).into());
        }
        let line = String::from_utf8_lossy(&line);
        let line = line.trim_end();
        if let Some(rest) = line.strip_prefix("+OK") {
            Ok(rest.trim().to_string())
        } else if let Some(rest) = line.strip_prefix("-ERR") {
            Err(Pop3Error::Negative(rest.trim().to_string()))
        } else {
            Err(Pop3Error::Malformed(line.to_string()))
        }
    }

    /// Body of a multi-line reply, dot-unstuffed, terminator removed.
    fn read_multiline(&mut self) -> Result<Vec<u8>, Pop3Error> {
        let stream = self.stream()?;
        let mut out = Vec::new();
        loop {
            let mut line = Vec::new();
            if stream.read_until(b'\n', &mut line)? == 0 {
                return Err(io::Error::from(io::ErrorKind::UnexpectedEof).into());
            }
            let content = line
                .strip_suffix(b"\r\n")
                .or_else(|| line.strip_suffix(b"\n"))
                .unwrap_or(&line[..]);
            if content == b"." {
                return Ok(out);
            }
            match line.strip_prefix(b".") {
                Some(unstuffed) => out.extend_from_slice(unstuffed),
                None => out.extend_from_slice(&line),
            }
        }
    }

    fn list(&mut self) -> Result<Vec<u32>, Pop3Error> {
        self.command("LIST")?;
        let listing = self.read_multiline()?;
        let mut ids = Vec::new();
        for line in String::from_utf8_lossy(&listing).lines() {
            let Some(first) = line.split_whitespace().next() else {
                continue;
            };
            let id = first
                .parse::<u32>()
                .map_err(|_| Pop3Error::Malformed(line.to_string()))?;
            ids.push(id);
        }
        Ok(ids)
    }

    fn top_headers(&mut self, id: u32) -> Result<Vec<u8>, Pop3Error> {
        self.command(&format!("TOP {id} 0"))?;
        self.read_multiline()
    }

    fn retr(&mut self, id: u32) -> Result<Vec<u8>, Pop3Error> {
        self.command(&format!("RETR {id}"))?;
        self.read_multiline()
    }

    /// Whether message `id` falls in `range`. Messages without a usable
    /// `Date` are kept so they are not silently lost.
    fn in_range(&mut self, id: u32, range: &FetchRange) -> Result<bool, Pop3Error> {
        let headers = match self.top_headers(id) {
            Ok(h) => h,
            Err(Pop3Error::Negative(reason)) => {
                warn!("TOP {id} refused ({reason}); keeping message");
                return Ok(true);
            }
            Err(e) => return Err(e),
        };
        let date = mailparse::parse_headers(&headers)
            .ok()
            .and_then(|(h, _)| h.get_first_value("Date"))
            .and_then(|d| parse_mail_date(&d));
        match date {
            Some(at) => Ok(range.contains(at)),
            None => {
                debug!("message {id} has no usable Date; keeping it");
                Ok(true)
            }
        }
    }
}

impl<S: Read + Write> MailTransport for Pop3Session<S> {
    fn select_folder(&mut self, name: &str) -> Result<(), IngestError> {
        if name.eq_ignore_ascii_case("INBOX") {
            Ok(())
        } else {
            Err(IngestError::Protocol(format!(
                "POP3 only exposes INBOX, not {name:?}"
            )))
        }
    }

    fn list_identifiers(&mut self, range: &FetchRange) -> Result<Vec<MessageToken>, IngestError> {
        let protocol_err = |e: Pop3Error| IngestError::Protocol(format!("listing failed: {e}"));
        let candidates = self.list().map_err(protocol_err)?;
        if range.is_unbounded() {
            return Ok(candidates.into_iter().map(MessageToken).collect());
        }

        debug!("filtering {} POP3 messages by Date", candidates.len());
        let mut out = Vec::new();
        for id in candidates {
            if self.in_range(id, range).map_err(protocol_err)? {
                out.push(MessageToken(id));
            }
        }
        Ok(out)
    }

    fn fetch(&mut self, token: MessageToken) -> Result<RawMessage, IngestError> {
        let bytes = self.retr(token.0).map_err(|e| IngestError::Fetch {
            token,
            reason: e.to_string(),
        })?;
        Ok(RawMessage { token, bytes })
    }

    fn close(&mut self) {
        if self.stream.is_none() {
            return;
        }
        if let Err(e) = self.command("QUIT") {
            warn!("POP3 QUIT failed: {e}");
        }
        self.stream = None;
    }
}

impl<S: Read + Write> Drop for Pop3Session<S> {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use std::cell::RefCell;
    use std::io::Cursor;
    use std::rc::Rc;

    /// Replays canned server output and records what the client sent.
    struct Scripted {
        input: Cursor<Vec<u8>>,
        sent: Rc<RefCell<Vec<u8>>>,
    }

    impl Read for Scripted {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            self.input.read(buf)
        }
    }

    impl Write for Scripted {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.sent.borrow_mut().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    fn scripted(server: &str) -> (Scripted, Rc<RefCell<Vec<u8>>>) {
        let sent = Rc::new(RefCell::new(Vec::new()));
        let stream = Scripted {
            input: Cursor::new(server.as_bytes().to_vec()),
            sent: Rc::clone(&sent),
        };
        (stream, sent)
    }

    const LOGIN: &str = "+OK POP3 ready\r\n+OK\r\n+OK logged in\r\n";

    #[test]
    fn filters_by_header_date_and_keeps_undated() {
        let server = [
            LOGIN,
            "+OK 3 messages\r\n1 120\r\n2 200\r\n3 300\r\n.\r\n",
            "+OK\r\nDate: Mon, 04 Mar 2024 10:00:00 +0000\r\nSubject: old\r\n\r\n.\r\n",
            "+OK\r\nDate: Tue, 05 Mar 2024 10:00:00 +0000\r\nSubject: new\r\n\r\n.\r\n",
            "+OK\r\nDate: sometime\r\nSubject: undated\r\n\r\n.\r\n",
            "+OK bye\r\n",
        ]
        .concat();
        let (stream, sent) = scripted(&server);
        let mut session = Pop3Session::login(stream, "alice", "secret").unwrap();

        let range = FetchRange::from_days(
            NaiveDate::from_ymd_opt(2024, 3, 5),
            NaiveDate::from_ymd_opt(2024, 3, 6),
        );
        let ids = session.list_identifiers(&range).unwrap();
        assert_eq!(ids, vec![MessageToken(2), MessageToken(3)]);

        session.close();
        let sent = String::from_utf8(sent.borrow().clone()).unwrap();
        assert_eq!(
            sent,
            "USER alice\r\nPASS secret\r\nLIST\r\nTOP 1 0\r\nTOP 2 0\r\nTOP 3 0\r\nQUIT\r\n"
        );
    }

    #[test]
    fn refused_top_keeps_the_candidate() {
        let server = [
            LOGIN,
            "+OK 2 messages\r\n1 120\r\n2 200\r\n.\r\n",
            "-ERR TOP not supported\r\n",
            "+OK\r\nDate: Mon, 04 Mar 2024 10:00:00 +0000\r\n\r\n.\r\n",
        ]
        .concat();
        let (stream, _sent) = scripted(&server);
        let mut session = Pop3Session::login(stream, "alice", "secret").unwrap();

        let range = FetchRange::from_days(
            NaiveDate::from_ymd_opt(2024, 3, 5),
            NaiveDate::from_ymd_opt(2024, 3, 6),
        );
        let ids = session.list_identifiers(&range).unwrap();
        assert_eq!(ids, vec![MessageToken(1)]);
    }

    #[test]
    fn unbounded_listing_skips_header_fetches() {
        let server = [LOGIN, "+OK\r\n1 10\r\n2 20\r\n.\r\n"].concat();
        let (stream, sent) = scripted(&server);
        let mut session = Pop3Session::login(stream, "alice", "secret").unwrap();

        let ids = session.list_identifiers(&FetchRange::unbounded()).unwrap();
        assert_eq!(ids, vec![MessageToken(1), MessageToken(2)]);
        assert!(!String::from_utf8_lossy(&sent.borrow()).contains("TOP"));
    }

    #[test]
    fn retr_unstuffs_leading_dots() {
        let server = [
            LOGIN,
            "+OK 40 octets\r\nSubject: x\r\n\r\n..hidden line\r\nbody\r\n.\r\n",
        ]
        .concat();
        let (stream, _sent) = scripted(&server);
        let mut session = Pop3Session::login(stream, "alice", "secret").unwrap();

        let raw = session.fetch(MessageToken(4)).unwrap();
        assert_eq!(raw.token, MessageToken(4));
        assert_eq!(raw.bytes, b"Subject: x\r\n\r\n.hidden line\r\nbody\r\n");
    }

    #[test]
    fn refused_retr_is_a_fetch_error() {
        let server = [LOGIN, "-ERR no such message\r\n"].concat();
        let (stream, _sent) = scripted(&server);
        let mut session = Pop3Session::login(stream, "alice", "secret").unwrap();

        match session.fetch(MessageToken(9)) {
            Err(IngestError::Fetch { token, reason }) => {
                assert_eq!(token, MessageToken(9));
                assert!(reason.contains("no such message"));
            }
            other => panic!("expected fetch error, got {other:?}"),
        }
    }

    #[test]
    fn rejected_password_is_a_connection_error() {
        let (stream, _sent) = scripted("+OK ready\r\n+OK\r\n-ERR invalid credentials\r\n");
        let err = Pop3Session::login(stream, "alice", "wrong").err().unwrap();
        assert!(matches!(err, IngestError::Connection(_)));
        assert!(err.is_fatal());
    }

    #[test]
    fn only_inbox_can_be_selected() {
        let (stream, _sent) = scripted(LOGIN);
        let mut session = Pop3Session::login(stream, "alice", "secret").unwrap();
        assert!(session.select_folder("inbox").is_ok());
        assert!(matches!(
            session.select_folder("Archive"),
            Err(IngestError::Protocol(_))
        ));
    }

    #[test]
    fn truncated_listing_is_a_protocol_error() {
        let server = [LOGIN, "+OK\r\n1 10\r\n"].concat();
        let (stream, _sent) = scripted(&server);
        let mut session = Pop3Session::login(stream, "alice", "secret").unwrap();
        assert!(matches!(
            session.list_identifiers(&FetchRange::unbounded()),
            Err(IngestError::Protocol(_))
        ));
    }
}
