pub mod body;
pub mod dates;
pub mod decoders;
pub mod imap_client;
pub mod mime;
pub mod normalize;
pub mod pop3_client;

use std::fmt;

use crate::domain::email::{FetchRange, MessageToken, Protocol, RawMessage};
use crate::error::IngestError;
use crate::mail::imap_client::ImapTransport;
use crate::mail::pop3_client::Pop3Session;

/// Everything needed to reach one mailbox. Treated as opaque here.
#[derive(Clone)]
pub struct Credentials {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    pub protocol: Protocol,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .field("protocol", &self.protocol)
            .finish()
    }
}

/// An authenticated session with a mail store.
///
/// `close` must be safe to call more than once; implementations also call it
/// from `Drop`.
pub trait MailTransport {
    fn select_folder(&mut self, name: &str) -> Result<(), IngestError>;

    /// Tokens of the messages inside `range`, in server order.
    fn list_identifiers(&mut self, range: &FetchRange) -> Result<Vec<MessageToken>, IngestError>;

    fn fetch(&mut self, token: MessageToken) -> Result<RawMessage, IngestError>;

    fn close(&mut self);
}

impl<T: MailTransport + ?Sized> MailTransport for Box<T> {
    fn select_folder(&mut self, name: &str) -> Result<(), IngestError> {
        (**self).select_folder(name)
    }

    fn list_identifiers(&mut self, range: &FetchRange) -> Result<Vec<MessageToken>, IngestError> {
        (**self).list_identifiers(range)
    }

    fn fetch(&mut self, token: MessageToken) -> Result<RawMessage, IngestError> {
        (**self).fetch(token)
    }

    fn close(&mut self) {
        (**self).close()
    }
}

pub fn open_transport(creds: &Credentials) -> Result<Box<dyn MailTransport>, IngestError> {
    match creds.protocol {
        Protocol::Imap => Ok(Box::new(ImapTransport::open(creds)?)),
        Protocol::Pop3 => Ok(Box::new(Pop3Session::open(creds)?)),
    }
}
