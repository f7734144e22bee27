//! Developer agent binary: watch a project, relay its changes to a room.
//!
//! Environment: `RELAY_HOST`, `RELAY_PORT`, `DEV_NAME`, `PROJECT` (watched
//! directory, default `.`). Set `ROOM_CODE` (and `ROOM_PASSWORD`) to join
//! an existing room; otherwise a new public room is created and its invite
//! link printed.

use codehive::{
    AgentClient, AgentConfig, AgentEvent, FileWatcher, ServerBody, WatcherConfig,
};

#[tokio::main]
async fn main() {
    env_logger::init();

    let config = AgentConfig::from_env();
    let project = std::env::var("PROJECT").unwrap_or_else(|_| ".".to_string());
    let room_code = std::env::var("ROOM_CODE").ok().filter(|c| !c.is_empty());
    let room_password = std::env::var("ROOM_PASSWORD").ok().filter(|p| !p.is_empty());

    let client = AgentClient::new(config);
    let mut events = client.take_events().await.expect("fresh event stream");
    if let Err(e) = client.connect().await {
        log::error!("Could not reach relay: {e}");
        std::process::exit(1);
    }

    match room_code {
        Some(code) => match client.join_room(&code, room_password).await {
            Ok(room) => log::info!("Joined {} with {} members", room.code, room.members.len()),
            Err(reason) => {
                log::error!("Join failed: {reason}");
                std::process::exit(1);
            }
        },
        None => match client.create_room(room_password, true, 0).await {
            Some((room, invite)) => {
                log::info!("Created room {}", room.code);
                println!("Invite link: {invite}");
            }
            None => {
                log::error!("Room creation timed out");
                std::process::exit(1);
            }
        },
    }

    let watcher_config = WatcherConfig::new(
        &project,
        client.name().to_string(),
        client.device_id().to_string(),
    );
    let (watcher, mut changes) = match FileWatcher::start(watcher_config).await {
        Ok(started) => started,
        Err(e) => {
            log::error!("Could not watch {project}: {e}");
            std::process::exit(1);
        }
    };
    log::info!("Watching {}", watcher.root().display());

    loop {
        tokio::select! {
            Some(change) = changes.recv() => {
                log::debug!("{} {:?} (+{} -{})", change.path, change.kind, change.lines_added, change.lines_removed);
                client.report_file_change(change).await;
            }
            Some(event) = events.recv() => {
                match event {
                    AgentEvent::Frame(frame) => log_frame(&frame.body),
                    AgentEvent::Disconnected => log::warn!("Relay connection lost"),
                    AgentEvent::Reconnecting { attempt } => log::info!("Reconnecting (attempt {attempt})"),
                    AgentEvent::ReconnectGaveUp => {
                        log::error!("Relay unreachable, giving up");
                        break;
                    }
                    AgentEvent::Connected => {}
                }
            }
            _ = tokio::signal::ctrl_c() => {
                log::info!("Leaving room");
                client.disconnect().await;
                break;
            }
        }
    }
}

fn log_frame(body: &ServerBody) {
    match body {
        ServerBody::MemberJoined { member, .. } => log::info!("{} joined", member.name),
        ServerBody::MemberLeft { name, .. } => log::info!("{name} left"),
        ServerBody::ChatReceived { author, content, .. } => log::info!("<{author}> {content}"),
        ServerBody::FileChanged { change, .. } => {
            log::info!("{} touched {}", change.author, change.path);
        }
        ServerBody::ConflictWarning { file, authors, .. } => {
            log::warn!("Conflict on {file}: {}", authors.join(", "));
        }
        ServerBody::BranchWarning { message, .. } => log::warn!("{message}"),
        ServerBody::FileLocked { lock, .. } => {
            log::info!("{} locked {}", lock.locked_by, lock.file);
        }
        ServerBody::FileUnlocked { file, name, .. } => log::info!("{name} unlocked {file}"),
        _ => {}
    }
}
