//! Dispatch Admin CLI: queue status and dead-letter operations against a
//! running dispatch engine.

use anyhow::Context;
use clap::{Parser, Subcommand};
use dispatch_core::{DeadLetterEntry, QueueStatus, SendReceipt};
use serde::Deserialize;

#[derive(Parser)]
#[command(name = "dispatch-admin")]
#[command(about = "Dispatch Engine Administration Tool")]
#[command(version)]
struct Cli {
    /// Base URL of the dispatch engine API
    #[arg(long, env = "DISPATCH_ADMIN_URL", default_value = "http://localhost:8080")]
    url: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show queue depth, in-flight and dead-letter counts, and latency
    Status,

    /// Dead-letter queue operations
    Dlq {
        #[command(subcommand)]
        action: DlqAction,
    },
}

#[derive(Subcommand)]
enum DlqAction {
    /// List dead-lettered messages
    List {
        /// Print full entries as JSON
        #[arg(long, default_value_t = false)]
        json: bool,
    },

    /// Re-enqueue a dead-lettered message with attempts reset
    Replay {
        /// Message id
        message_id: String,
    },

    /// Permanently drop a dead-lettered message
    Purge {
        /// Message id
        message_id: String,
    },
}

#[derive(Deserialize)]
struct DeadLetterList {
    count: usize,
    entries: Vec<DeadLetterEntry>,
}

#[derive(Deserialize)]
struct ErrorBody {
    error: String,
    message: String,
}

struct Admin {
    http: reqwest::Client,
    base: String,
}

impl Admin {
    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base.trim_end_matches('/'), path)
    }

    async fn check(response: reqwest::Response) -> anyhow::Result<reqwest::Response> {
        if response.status().is_success() {
            return Ok(response);
        }
        let status = response.status();
        match response.json::<ErrorBody>().await {
            Ok(body) => anyhow::bail!("{status}: {} ({})", body.message, body.error),
            Err(_) => anyhow::bail!("request failed with {status}"),
        }
    }

    async fn status(&self) -> anyhow::Result<()> {
        let response = self.http.get(self.url("/v1/queue/status")).send().await?;
        let status: QueueStatus = Self::check(response).await?.json().await?;

        let ms = |v: Option<u64>| v.map(|m| format!("{m} ms")).unwrap_or_else(|| "n/a".to_string());
        println!("Queue status");
        println!();
        println!("  Depth:          {}", status.depth);
        println!("  In flight:      {}", status.in_flight_count);
        println!("  Dead letters:   {}", status.dead_letter_count);
        println!("  p50 latency:    {}", ms(status.p50_latency_ms));
        println!("  p99 latency:    {}", ms(status.p99_latency_ms));
        Ok(())
    }

    async fn list(&self, json: bool) -> anyhow::Result<()> {
        let response = self.http.get(self.url("/v1/dead-letters")).send().await?;
        let list: DeadLetterList = Self::check(response).await?.json().await?;

        if json {
            println!("{}", serde_json::to_string_pretty(&list.entries)?);
            return Ok(());
        }

        println!("Dead letters ({}):", list.count);
        println!();
        for entry in &list.entries {
            let last = entry
                .failure_history
                .last()
                .map(|f| format!("{:?} {}", f.class, f.code))
                .unwrap_or_else(|| "-".to_string());
            println!(
                "  {:<38} {:<24} attempts={:<2} {}  {}",
                entry.message.message_id,
                entry.message.sender_identity,
                entry.message.attempt_count,
                entry.dead_lettered_at.format("%Y-%m-%d %H:%M:%S"),
                last
            );
            println!("    reason: {}", entry.reason);
        }
        Ok(())
    }

    async fn replay(&self, message_id: &str) -> anyhow::Result<()> {
        let response = self
            .http
            .post(self.url(&format!("/v1/dead-letters/{message_id}/replay")))
            .send()
            .await?;
        let receipt: SendReceipt = Self::check(response).await?.json().await?;
        println!("Replayed {} (queued at {})", receipt.message_id, receipt.queued_at);
        Ok(())
    }

    async fn purge(&self, message_id: &str) -> anyhow::Result<()> {
        let response = self
            .http
            .delete(self.url(&format!("/v1/dead-letters/{message_id}")))
            .send()
            .await?;
        Self::check(response).await?;
        println!("Purged {message_id}");
        Ok(())
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let admin = match reqwest::Client::builder()
        .build()
        .context("failed to build HTTP client")
    {
        Ok(http) => Admin { http, base: cli.url },
        Err(e) => {
            eprintln!("{e:#}");
            std::process::exit(1);
        }
    };

    let result = match cli.command {
        Commands::Status => admin.status().await,
        Commands::Dlq { action } => match action {
            DlqAction::List { json } => admin.list(json).await,
            DlqAction::Replay { message_id } => admin.replay(&message_id).await,
            DlqAction::Purge { message_id } => admin.purge(&message_id).await,
        },
    };

    if let Err(e) = result {
        eprintln!("Error: {e:#}");
        std::process::exit(1);
    }
}
