use std::{
    path::PathBuf,
    sync::{Arc, Weak},
    time::Duration,
};

use anyhow::Result;
use clap::Parser;
use client_core::{load_settings, ChatSession, Credential, SessionEvent};
use shared::domain::ConversationId;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
struct Args {
    /// Overrides `server_url` from the config file and environment.
    #[arg(long)]
    server_url: Option<String>,
    #[arg(long)]
    token: String,
    #[arg(long)]
    user_id: String,
    /// Conversation to open; repeat for several. Typed lines go to the first.
    #[arg(long = "conversation")]
    conversations: Vec<String>,
    #[arg(long)]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();
    let args = Args::parse();

    let mut config = load_settings(args.config.as_deref());
    if let Some(server_url) = args.server_url {
        config.server_url = server_url;
    }
    let session = Arc::new(ChatSession::with_defaults(
        config,
        Credential::new(args.user_id, args.token),
    )?);

    let _listeners = install_listeners(&session);
    spawn_event_log(&session);

    session.connect();
    if let Err(err) = session.wait_connected(Duration::from_secs(10)).await {
        warn!("terminal: {err}; history and sends still go over HTTP");
    }

    let conversations: Vec<ConversationId> = args
        .conversations
        .into_iter()
        .map(ConversationId::from)
        .collect();
    for conversation_id in &conversations {
        match session.open_conversation(conversation_id.clone()).await {
            Ok(history) => {
                println!("== {conversation_id} ({} messages)", history.len());
                for message in history {
                    println!("[{conversation_id}] {}: {}", message.sender_id, message.text);
                }
            }
            Err(err) => warn!(conversation_id = %conversation_id, "terminal: {err}"),
        }
    }

    let target = conversations.first().cloned();
    session.set_active_conversation(target.clone());
    if let Some(conversation_id) = &target {
        let marked = session.mark_conversation_read(conversation_id.clone());
        info!(conversation_id = %conversation_id, marked, "terminal: caught up");
    }

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line? else { break };
                if line.trim().is_empty() {
                    continue;
                }
                let Some(conversation_id) = target.clone() else {
                    warn!("terminal: no --conversation given; nothing to send to");
                    continue;
                };
                match session.send(conversation_id, &line).await {
                    Ok(message) => info!(message_id = %message.id, "terminal: sent"),
                    Err(err) if err.is_send_failure() => println!("! not sent: {err}"),
                    Err(err) => warn!("terminal: {err}"),
                }
            }
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    session.disconnect().await;
    Ok(())
}

fn install_listeners(session: &Arc<ChatSession>) -> Vec<client_core::Subscription> {
    let reader: Weak<ChatSession> = Arc::downgrade(session);
    let messages = session.add_global_message_listener(move |event| {
        let message = &event.message;
        let sender = event
            .sender_email
            .clone()
            .unwrap_or_else(|| message.sender_id.to_string());
        println!("[{}] {sender}: {}", message.conversation_id, message.text);
        if let Some(session) = reader.upgrade() {
            session.mark_read(message.conversation_id.clone(), message.id.clone());
        }
    });
    let statuses = session.add_global_status_listener(|event| {
        println!(
            "[{}] message {} is {}",
            event.conversation_id, event.message_id, event.status
        );
    });
    vec![messages, statuses]
}

fn spawn_event_log(session: &ChatSession) {
    let mut events = session.subscribe_events();
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(SessionEvent::ConnectionChanged(state)) => info!(?state, "terminal: connection"),
                Ok(SessionEvent::Error(message)) => warn!("terminal: {message}"),
                Ok(SessionEvent::TimelineChanged { .. }) => {}
                Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "terminal: event log lagged")
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
    });
}
