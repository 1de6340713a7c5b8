//! Mailbox ingestion: fetch over IMAP or POP3, decode, normalise, and upsert
//! into SQLite.

pub mod auth;
pub mod config;
pub mod domain;
pub mod error;
pub mod ingest;
pub mod mail;
pub mod store;
