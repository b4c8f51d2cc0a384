// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

use clap::{Parser, Subcommand};
use std::env;
use std::io::{self, BufRead, Write};
use std::process::ExitCode;
use tracing::debug;
use tracing_subscriber::EnvFilter;

use notifyfree::{
    logger, Client, Config, FallbackStats, FallbackStore, Formatter, Level, LogRecord, LogSender,
};

const BYTE_UNITS: [&str; 4] = ["B", "KB", "MB", "GB"];

/// Inspect, replay and clear the NotifyFree fallback store.
///
/// Configuration is read from NOTIFYFREE_* environment variables.
#[derive(Debug, Parser)]
#[command(name = "notifyfree-cache", version)]
struct Cli {
    #[command(subcommand)]
    action: Action,
}

#[derive(Debug, Subcommand)]
enum Action {
    /// Show the size and entry count of the fallback file
    Stats {
        /// Print the stats as JSON
        #[arg(long)]
        json: bool,
    },
    /// Re-send every stored entry and keep only those that still fail
    Retry,
    /// Delete the fallback file
    Clear {
        /// Skip the confirmation prompt
        #[arg(long, short)]
        yes: bool,
    },
    /// Probe the endpoint and send a test record
    Test,
}

#[tokio::main]
async fn main() -> ExitCode {
    let log_level = env::var("NOTIFYFREE_LOG_LEVEL")
        .map(|val| val.to_lowercase())
        .unwrap_or_else(|_| "info".to_string());
    let env_filter = format!("h2=off,hyper=off,rustls=off,reqwest=off,{log_level}");

    let subscriber = tracing_subscriber::fmt::Subscriber::builder()
        .with_env_filter(
            EnvFilter::try_new(env_filter).unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .event_format(logger::Formatter::default())
        .with_writer(io::stderr)
        .finish();
    if let Err(e) = tracing::subscriber::set_global_default(subscriber) {
        eprintln!("Failed to install log subscriber: {e}");
    }
    debug!("NOTIFYFREE | Logging subsystem enabled");

    let cli = Cli::parse();
    let config = Config::from_env();

    let result = match cli.action {
        Action::Stats { json } => stats(&config, json),
        Action::Retry => retry(&config).await,
        Action::Clear { yes } => clear(&config, yes),
        Action::Test => test(&config).await,
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(message) => {
            eprintln!("Error: {message}");
            ExitCode::FAILURE
        }
    }
}

fn stats(config: &Config, json: bool) -> Result<(), String> {
    let store = FallbackStore::from_config(&config.fallback);
    let stats = store.stats().map_err(|e| e.to_string())?;

    if json {
        println!("{}", stats_json(&stats)?);
        return Ok(());
    }

    println!("Fallback file: {}", stats.path.display());
    if !stats.exists {
        println!("No cached entries.");
        return Ok(());
    }
    println!("Entries:       {}", stats.count);
    println!(
        "Size:          {} / {}",
        format_bytes(stats.size_bytes),
        format_bytes(stats.max_size)
    );
    Ok(())
}

async fn retry(config: &Config) -> Result<(), String> {
    let store = FallbackStore::from_config(&config.fallback);
    let before = store.stats().map_err(|e| e.to_string())?;
    if !before.exists || before.count == 0 {
        println!("No cached entries to retry.");
        return Ok(());
    }

    let client = Client::new(config).map_err(|e| e.to_string())?;
    println!("Retrying {} cached entries...", before.count);
    let delivered = store.retry(&client).await.map_err(|e| e.to_string())?;
    let remaining = store.stats().map_err(|e| e.to_string())?.count;

    println!("Delivered: {delivered}");
    println!("Remaining: {remaining}");
    if remaining > 0 && delivered == 0 {
        return Err("no cached entries could be delivered".to_string());
    }
    Ok(())
}

fn clear(config: &Config, yes: bool) -> Result<(), String> {
    let store = FallbackStore::from_config(&config.fallback);
    if !yes {
        let count = store.stats().map_err(|e| e.to_string())?.count;
        print!(
            "Delete {count} cached entries in {}? [y/N] ",
            store.path().display()
        );
        io::stdout().flush().map_err(|e| e.to_string())?;

        let mut answer = String::new();
        io::stdin()
            .lock()
            .read_line(&mut answer)
            .map_err(|e| e.to_string())?;
        if !matches!(answer.trim().to_lowercase().as_str(), "y" | "yes") {
            println!("Aborted.");
            return Ok(());
        }
    }

    if store.clear().map_err(|e| e.to_string())? {
        println!("Fallback file removed.");
    } else {
        println!("No fallback file to remove.");
    }
    Ok(())
}

async fn test(config: &Config) -> Result<(), String> {
    let client = Client::new(config).map_err(|e| e.to_string())?;
    println!("Endpoint: {}", client.endpoint());

    if client.test_connection().await {
        println!("Connection: reachable");
    } else {
        println!("Connection: unreachable");
    }

    let record = LogRecord::new(Level::Info, "NotifyFree connection test")
        .with_channel("notifyfree-cache");
    let entry = Formatter::new(&config.format).format(&record);
    client
        .send(&entry)
        .await
        .map_err(|e| format!("test record was not delivered: {e}"))?;
    println!("Test record delivered.");
    Ok(())
}

fn stats_json(stats: &FallbackStats) -> Result<String, String> {
    serde_json::to_string_pretty(stats).map_err(|e| e.to_string())
}

#[allow(clippy::cast_precision_loss)]
fn format_bytes(bytes: u64) -> String {
    let mut size = bytes as f64;
    let mut unit = 0;
    while size >= 1024.0 && unit < BYTE_UNITS.len() - 1 {
        size /= 1024.0;
        unit += 1;
    }
    format!("{size:.2} {}", BYTE_UNITS[unit])
}
