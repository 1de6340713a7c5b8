use anyhow::{Result, anyhow};
use chrono::NaiveDate;
use clap::{Parser, Subcommand};
use log::error;

use rs_mail_ingest::auth::password_store;
use rs_mail_ingest::config::{load_config, resolve_db_path};
use rs_mail_ingest::domain::email::{FetchRange, Protocol};
use rs_mail_ingest::ingest::{CancelToken, run_batch};
use rs_mail_ingest::mail::open_transport;
use rs_mail_ingest::store::repo::MailRepository;
use rs_mail_ingest::store::sqlite::SqliteRepo;

#[derive(Parser)]
#[command(name = "rs_mail_ingest")]
#[command(about = "Ingest a mailbox into a local SQLite store", long_about = None)]
struct Cli {
    #[command(subcommand)]
    cmd: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Fetch, decode and store every message in a date range
    Ingest {
        /// First day to include (YYYY-MM-DD, UTC)
        #[arg(long)]
        since: Option<NaiveDate>,

        /// Last day to include (YYYY-MM-DD, UTC)
        #[arg(long)]
        until: Option<NaiveDate>,

        /// imap or pop3; defaults to the configured protocol
        #[arg(long)]
        protocol: Option<Protocol>,

        /// Mailbox folder; defaults to the configured folder or INBOX
        #[arg(long)]
        folder: Option<String>,
    },

    /// List stored messages, newest first
    List {
        #[arg(long)]
        json: bool,
    },

    /// Print one stored message
    Show {
        message_id: String,

        #[arg(long)]
        json: bool,
    },

    /// Store the mailbox password in the keyring
    SetPassword,
}

fn main() -> Result<()> {
    env_logger::init();

    let cli = Cli::parse();
    let cfg = load_config().map_err(|e| anyhow!("Configuration error: {e}"))?;

    match cli.cmd {
        Command::SetPassword => {
            eprintln!("Paste password for {} (end with Ctrl-D):", cfg.username);
            let mut secret = String::new();
            std::io::Read::read_to_string(&mut std::io::stdin(), &mut secret)?;
            password_store::save_password(&cfg.username, secret.trim())?;
            println!("Saved password for {}", cfg.username);
            Ok(())
        }

        Command::Ingest {
            since,
            until,
            protocol,
            folder,
        } => {
            let creds = cfg.credentials(protocol)?;
            let folder = folder.unwrap_or_else(|| cfg.folder().to_string());
            let range = FetchRange::from_days(since, until);

            let cancel = CancelToken::new();
            let on_signal = cancel.clone();
            ctrlc::set_handler(move || on_signal.cancel())?;

            let repo = SqliteRepo::open(&resolve_db_path(&cfg)?)?;
            println!("Ingesting {folder} over {} {range}", creds.protocol);

            let report = run_batch(|| open_transport(&creds), &repo, &folder, &range, &cancel)
                .inspect_err(|e| error!("batch aborted: {e}"))?;

            println!(
                "Processed {} of {} messages, {} skipped{}",
                report.processed(),
                report.listed,
                report.skipped.len(),
                if report.cancelled { ", cancelled" } else { "" }
            );
            for (token, reason) in &report.skipped {
                println!("  skipped {token}: {reason}");
            }
            println!("Store now holds {} messages", repo.count()?);
            Ok(())
        }

        Command::List { json } => {
            let repo = SqliteRepo::open(&resolve_db_path(&cfg)?)?;
            let items = repo.list_summaries()?;
            if json {
                println!("{}", serde_json::to_string_pretty(&items)?);
                return Ok(());
            }
            for it in items {
                println!(
                    "{}  {:<40}  {:<30}  {}",
                    it.received_at.format("%Y-%m-%d %H:%M"),
                    it.subject,
                    it.sender,
                    it.message_id
                );
            }
            Ok(())
        }

        Command::Show { message_id, json } => {
            let repo = SqliteRepo::open(&resolve_db_path(&cfg)?)?;
            let Some(rec) = repo.fetch_by_id(&message_id)? else {
                return Err(anyhow!("message {message_id} not found"));
            };
            if json {
                println!("{}", serde_json::to_string_pretty(&rec)?);
                return Ok(());
            }
            println!("From:    {}", rec.sender);
            println!("To:      {}", rec.recipients);
            if !rec.cc.is_empty() {
                println!("Cc:      {}", rec.cc);
            }
            println!("Subject: {}", rec.subject);
            println!("Date:    {}", rec.received_at.format("%Y-%m-%d %H:%M:%S"));
            println!();
            println!("{}", rec.content);
            Ok(())
        }
    }
}
