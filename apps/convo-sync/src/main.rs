use anyhow::{Context, Result};
use clap::Parser;
use convo_api::{ConversationId, HttpMessageApi, Message, MessageId};
use convo_sync::telemetry::logging::{self, LogConfig, LogLevel};
use convo_sync::transport::WebSocketConnector;
use convo_sync::{
    Connection, ConversationStore, LoadOutcome, StoreEvent, SubscriptionRegistry, SyncConfig,
};
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "convo-tail", about = "Print a conversation and follow it live")]
struct Cli {
    /// Conversation identifier
    conversation: String,

    #[arg(long, env = "CONVO_CONFIG", help = "TOML config file")]
    config: Option<PathBuf>,

    #[arg(long, env = "CONVO_API_URL")]
    api_url: Option<String>,

    #[arg(long, env = "CONVO_BROKER_URL")]
    broker_url: Option<String>,

    #[arg(long, env = "CONVO_TOKEN", hide_env_values = true)]
    token: Option<String>,

    #[arg(long, default_value_t = 0, help = "Older pages to load before following")]
    older_pages: usize,

    #[arg(long, help = "Send this text once the conversation is loaded")]
    send: Option<String>,

    #[arg(long, value_enum, default_value_t = LogLevel::Warn)]
    log_level: LogLevel,

    #[arg(long, help = "Write logs to a file instead of stderr")]
    log_file: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    logging::init(&LogConfig {
        level: cli.log_level,
        file: cli.log_file.clone(),
    })?;

    let mut config = SyncConfig::load(cli.config.as_deref()).context("loading configuration")?;
    if let Some(url) = cli.api_url {
        config.api.base_url = url;
    }
    if let Some(url) = cli.broker_url {
        config.broker.url = url;
    }
    if let Some(token) = cli.token {
        config.api.token = Some(token);
    }
    config.validate()?;

    let connector = WebSocketConnector::new(&config.broker.url)?;
    let (connection, frames) = Connection::new(connector, config.connection_config());
    let registry = SubscriptionRegistry::spawn(connection.clone(), frames);
    let api = Arc::new(HttpMessageApi::new(
        config.api.base_url.clone(),
        config.api.token.clone(),
    ));
    let store = ConversationStore::new(
        api.clone(),
        registry,
        connection.clone(),
        config.store_config(),
    );
    connection.connect();

    let conversation = ConversationId::new(cli.conversation);
    match api.fetch_conversation(&conversation).await {
        Ok(meta) => println!(
            "# {} ({} participants)",
            meta.name.as_deref().unwrap_or(conversation.as_str()),
            meta.participants.len()
        ),
        Err(err) => warn!(error = %err, "conversation metadata unavailable"),
    }

    let mut events = store.events();
    store
        .initialize(conversation.clone())
        .await
        .context("loading conversation")?;
    for _ in 0..cli.older_pages {
        if let LoadOutcome::Skipped = store.load_older().await? {
            break;
        }
    }

    let mut printed = HashSet::new();
    for message in store.messages() {
        print_message(&message, &mut printed);
    }
    info!(
        count = printed.len(),
        has_more = store.has_more(),
        connected = store.connected(),
        "history printed"
    );

    if let Some(text) = cli.send {
        let sent = store.send(&text, None).await.context("sending message")?;
        print_message(&sent, &mut printed);
    }

    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);
    loop {
        tokio::select! {
            _ = &mut shutdown => break,
            event = events.recv() => match event {
                Ok(StoreEvent::Appended { id }) | Ok(StoreEvent::Inserted { id, .. }) => {
                    if let Some(message) = find(&store, &id) {
                        print_message(&message, &mut printed);
                    }
                }
                Ok(_) => {}
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped, "output fell behind; catching up");
                    for message in store.messages() {
                        print_message(&message, &mut printed);
                    }
                }
                Err(RecvError::Closed) => break,
            }
        }
    }

    store.teardown().await?;
    connection.disconnect().await;
    Ok(())
}

fn find(store: &ConversationStore, id: &MessageId) -> Option<Message> {
    store.messages().into_iter().find(|message| &message.id == id)
}

fn print_message(message: &Message, printed: &mut HashSet<MessageId>) {
    if !printed.insert(message.id.clone()) {
        return;
    }
    let body = match (&message.text, &message.attachment) {
        (Some(text), Some(attachment)) => format!("{text} [{}]", attachment.filename),
        (Some(text), None) => text.clone(),
        (None, Some(attachment)) => format!("[{}]", attachment.filename),
        (None, None) => String::new(),
    };
    println!(
        "{} {:>8} {}",
        message.created_at.format("%Y-%m-%d %H:%M:%S"),
        message.sender_id.as_str(),
        body
    );
}
