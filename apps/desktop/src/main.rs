use std::{sync::Arc, time::Duration};

use anyhow::{Context, Result};
use clap::Parser;
use client_core::{
    config::{load_settings, ClientSettings},
    memory::InMemoryBackend,
    realtime_ws::{WsRealtimeHub, DEFAULT_HEARTBEAT},
    rest::RestBackend,
    ChatClient, ClientDeps, ClientEvent, MissingMediaDevices, MissingPeerConnectionFactory,
};
use shared::{
    domain::{RoomId, Table, UserId},
    protocol::{Message, Profile},
};
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
struct Args {
    /// Profile id of the signed-in user. A random one is used when omitted.
    #[arg(long)]
    user_id: Option<UserId>,
    #[arg(long)]
    username: String,
    /// Overrides `server_url` from client.toml / APP__SERVER_URL.
    #[arg(long)]
    server_url: Option<String>,
    /// Access token of the signed-in user; the anonymous key is used otherwise.
    #[arg(long)]
    access_token: Option<String>,
    /// Runs against a process-local backend instead of the service.
    #[arg(long)]
    offline: bool,
    #[arg(long)]
    room: Option<RoomId>,
    /// Opens (or creates) the private room with this user.
    #[arg(long)]
    with_user: Option<UserId>,
    #[arg(long)]
    message: Option<String>,
    /// Keeps printing live events for this many seconds before exiting.
    #[arg(long, default_value_t = 0)]
    listen_secs: u64,
}

fn log_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
}

async fn build_deps(args: &Args, settings: &ClientSettings, viewer: &Profile) -> Result<ClientDeps> {
    if args.offline {
        let backend = InMemoryBackend::new();
        backend
            .seed(Table::Profiles, [serde_json::to_value(viewer)?])
            .await;
        return Ok(ClientDeps::in_memory(&backend));
    }

    let mut rest = RestBackend::new(settings.server_url.clone(), settings.api_key.clone());
    if let Some(token) = &args.access_token {
        rest = rest.with_access_token(token.clone());
    }
    let hub = WsRealtimeHub::connect(&settings.realtime_url()?, DEFAULT_HEARTBEAT)
        .await
        .context("connect realtime")?;
    let rest = Arc::new(rest);
    Ok(ClientDeps {
        store: rest.clone(),
        hub: Arc::new(hub),
        storage: rest,
        media_devices: Arc::new(MissingMediaDevices),
        peers: Arc::new(MissingPeerConnectionFactory),
    })
}

async fn print_message(client: &ChatClient, message: &Message) {
    let sender = client.username(message.sender_id).await;
    let attachment = message
        .file
        .as_ref()
        .map(|file| format!(" [{}]", file.url))
        .unwrap_or_default();
    println!(
        "  {} {sender}: {}{attachment} ({})",
        message.created_at.format("%H:%M"),
        message.content,
        message.status.as_str()
    );
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt().with_env_filter(log_filter()).init();
    let args = Args::parse();

    let viewer = Profile {
        id: args.user_id.unwrap_or_else(UserId::random),
        username: args.username.clone(),
        avatar_url: None,
        last_seen: None,
    };
    let mut settings = load_settings();
    if let Some(url) = &args.server_url {
        settings.server_url = url.clone();
    }
    let deps = build_deps(&args, &settings, &viewer).await?;
    let client = ChatClient::new(viewer.clone(), &settings, deps);
    let mut events = client.subscribe_events();

    let rooms = client.start().await?;
    println!("Signed in as {} ({})", viewer.username, viewer.id);
    for room in &rooms {
        println!(
            "{} {} unread={}",
            room.id,
            room.display_name(viewer.id),
            room.unread_count
        );
    }

    let mut room_id = args.room;
    if let Some(other) = args.with_user {
        let room = client.start_or_get_private_room(other).await?;
        info!(room_id = %room.id, "opened private room");
        room_id = Some(room.id);
    }

    if let Some(room_id) = room_id {
        let history = client.select_room(room_id).await;
        println!("Room {room_id}: {} messages", history.len());
        for message in &history {
            print_message(&client, message).await;
        }
        if let Some(text) = &args.message {
            let sent = client.send_message(text, None).await?;
            print_message(&client, &sent).await;
        }
    }

    let listen = tokio::time::sleep(Duration::from_secs(args.listen_secs));
    tokio::pin!(listen);
    loop {
        tokio::select! {
            _ = &mut listen => break,
            _ = tokio::signal::ctrl_c() => break,
            event = events.recv() => match event {
                Ok(ClientEvent::MessagesUpdated { room_id }) if Some(room_id) == client.active_room() => {
                    if let Some(last) = client.messages().await.last() {
                        print_message(&client, last).await;
                    }
                }
                Ok(ClientEvent::TypingUpdated { .. }) => {
                    let typing = client.typing_users().await;
                    if !typing.is_empty() {
                        println!("  {} typing...", typing.join(", "));
                    }
                }
                Ok(ClientEvent::CallStateChanged(snapshot)) => {
                    println!("call: {:?}", snapshot.state);
                }
                Ok(ClientEvent::Error(err)) => warn!("{err}"),
                Ok(_) => {}
                Err(RecvError::Lagged(_)) => continue,
                Err(RecvError::Closed) => break,
            },
        }
    }

    client.shutdown().await;
    Ok(())
}

#[cfg(test)]
#[path = "tests/main_tests.rs"]
mod tests;
