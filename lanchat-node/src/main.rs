// LAN chat node: broker daemon plus a line-oriented console on stdin.

use std::sync::Arc;
use std::time::Duration;

use lanchat_core::Identity;
use lanchat_node::log::{self, ChannelSink, Logger};
use lanchat_node::{config, Broker, Directory, Room, SendError};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio_util::sync::CancellationToken;
use tracing::Level;
use tracing_subscriber::{filter, layer::SubscriberExt, util::SubscriberInitExt};

const VERSION: &str = env!("CARGO_PKG_VERSION");
const FLUSH_TIMEOUT: Duration = Duration::from_millis(500);

const HELP: &str = "\
commands:
  <text>            say in General
  /rooms            list rooms
  /to <n> <text>    say in room n (encrypted for peers)
  /history [n]      show room n (default General)
  /quit";

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let mut args: Vec<String> = std::env::args().skip(1).collect();
    if args.iter().any(|a| a == "--version" || a == "-V") {
        println!("lanchat {}", VERSION);
        return Ok(());
    }
    let verbose = args.iter().any(|a| a == "--verbose" || a == "-v");
    args.retain(|a| a != "--verbose" && a != "-v");

    let mut cfg = config::load();
    cfg.apply_args(args)?;
    cfg.validate()?;

    let level = if verbose { Level::DEBUG } else { Level::INFO };
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(filter::LevelFilter::from_level(level))
        .init();

    let rt = tokio::runtime::Runtime::new()?;
    let result = rt.block_on(async {
        let (sink, events) = ChannelSink::new();
        let log: Logger = Arc::new(sink);
        // Stops once every Logger clone is gone.
        let renderer = tokio::spawn(log::forward_to_tracing(events, CancellationToken::new()));

        let identity = Arc::new(Identity::new(cfg.name.clone(), cfg.port));
        let directory = Arc::new(Directory::new(log.clone()));
        directory.add(Arc::new(Room::general(cfg.general_queue))).await;

        let broker = Broker::bind(identity.clone(), directory.clone(), &cfg, log.clone()).await?;
        println!("Hello: {} - {}", identity.name(), identity.id());
        println!("{}", HELP);

        let cancel = CancellationToken::new();
        let node = tokio::spawn(broker.run(cancel.clone()));
        let departures = tokio::spawn(print_departures(directory.clone(), cancel.clone()));

        tokio::select! {
            r = console(identity, directory, log.clone()) => r?,
            r = shutdown_signal() => r?,
        }
        cancel.cancel();
        node.await?;
        departures.await?;
        drop(log);
        let _ = tokio::time::timeout(FLUSH_TIMEOUT, renderer).await;
        Ok::<(), Box<dyn std::error::Error>>(())
    });
    // The stdin reader may still be parked on a blocking read.
    rt.shutdown_timeout(FLUSH_TIMEOUT);
    result
}

async fn print_departures(directory: Arc<Directory>, cancel: CancellationToken) {
    let mut removed = directory.subscribe_removed();
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            id = removed.recv() => match id {
                Ok(id) => println!("* {} left", id),
                Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                Err(_) => break,
            },
        }
    }
}

async fn room_at(directory: &Directory, index: &str) -> Option<Arc<Room>> {
    let n: usize = index.parse().ok()?;
    directory.list_all().await.into_iter().nth(n)
}

async fn say(identity: &Identity, directory: &Directory, room: &Room, text: &str, log: &Logger) {
    match room.post(identity, text).await {
        Ok(()) => {}
        Err(SendError::Disconnected) => {
            println!("! {} is gone", room.name());
            directory.evict(room.id()).await;
        }
        Err(e @ SendError::TooLong { .. }) => println!("! {}", e),
        Err(e) => log.error(format!("SendMessage: {}", e)),
    }
}

/// Read commands from stdin until EOF or `/quit`.
async fn console(
    identity: Arc<Identity>,
    directory: Arc<Directory>,
    log: Logger,
) -> std::io::Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let (cmd, rest) = line.split_once(' ').unwrap_or((line, ""));
        match cmd {
            "/quit" => break,
            "/help" => println!("{}", HELP),
            "/rooms" => {
                for (i, room) in directory.list_all().await.iter().enumerate() {
                    match room.host() {
                        Some(host) => println!("{:>3}  {} (Addr: {})", i, room.name(), host),
                        None => println!("{:>3}  {}", i, room.name()),
                    }
                }
            }
            "/history" => {
                let room = if rest.is_empty() {
                    directory.get(lanchat_core::GENERAL_ROOM_ID).await
                } else {
                    room_at(&directory, rest.trim()).await
                };
                let Some(room) = room else {
                    println!("no such room");
                    continue;
                };
                for m in room.messages().await {
                    println!("{} {}: {}", m.rfc3339(), m.author, m.content);
                }
            }
            "/to" => {
                let (index, text) = rest.split_once(' ').unwrap_or((rest, ""));
                match room_at(&directory, index).await {
                    Some(room) if !text.trim().is_empty() => {
                        say(&identity, &directory, &room, text.trim(), &log).await
                    }
                    Some(_) => println!("nothing to send"),
                    None => println!("no such room"),
                }
            }
            _ if cmd.starts_with('/') => println!("{}", HELP),
            _ => match directory.get(lanchat_core::GENERAL_ROOM_ID).await {
                Some(general) => say(&identity, &directory, &general, line, &log).await,
                None => log.warn("console: no general room".to_string()),
            },
        }
    }
    Ok(())
}

/// Wait for Ctrl+C or SIGTERM (Unix).
async fn shutdown_signal() -> std::io::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())?;
        tokio::select! {
            r = tokio::signal::ctrl_c() => r?,
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
    }
    Ok(())
}
