use anyhow::Context;
use futures::StreamExt;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use threadsync::{Config, Session, User};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let config = Config::from_env()?;
    let user = User {
        username: std::env::var("AUTH_USERNAME").context("AUTH_USERNAME must be set")?,
        token: std::env::var("AUTH_TOKEN").context("AUTH_TOKEN must be set")?,
        known_as: None,
        gender: std::env::var("AUTH_GENDER").ok(),
        photo_url: None,
    };
    let peer = std::env::var("CHAT_PEER").context("CHAT_PEER must be set")?;

    let session = Session::connect(&config, user);
    session.conversations.switch_to(&peer).await;

    // print every snapshot as it changes
    let mut snapshots = session.thread().subscribe();
    let printer = tokio::spawn(async move {
        while let Some(thread) = snapshots.next().await {
            println!("--- {} message(s)", thread.len());
            for m in thread.iter() {
                let read = if m.read_at.is_some() { "read" } else { "unread" };
                println!("[{}] {}: {} ({read})", m.sent_at, m.sender_username, m.content);
            }
        }
    });

    if let Some(conn) = session.conversations.current().await {
        match conn.wait_connected().await {
            Ok(()) => info!(%peer, "conversation open"),
            Err(e) => warn!(%peer, error = %e, "hub not connected yet"),
        }
    }

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => match line? {
                Some(text) if text.trim().is_empty() => {}
                Some(text) => {
                    if let Err(e) = session.conversations.send(&peer, &text).await {
                        error!(error = %e, "message not sent");
                    }
                }
                None => break,
            },
            _ = shutdown_signal() => break,
        }
    }

    session.end().await;
    printer.abort();
    Ok(())
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    info!("shutdown signal received");
}
