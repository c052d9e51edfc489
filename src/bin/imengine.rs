//! imengine CLI binary.
//!
//! Signs an account in and prints every session event as one JSON line.
//!
//! # Commands
//!
//! - `login` - Sign in and stay online until interrupted
//! - `config` - Print the effective configuration
//!
//! While `login` runs, stdin accepts:
//!
//! ```text
//! /msg <peer> <text>      chat message over a peer stream
//! /join <peer>            open a peer stream
//! /leave <peer>           close a peer stream
//! /status <code>          change presence (NLN, BSY, AWY, ...)
//! /add <list> <account>   add a contact
//! /rem <list> <account>   remove a contact
//! /quit                   sign off
//! ```

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use imengine::{
    runtime::{Driver, SessionCommand, SessionHandle},
    Config, LoginStep, NexusClient, Session, VERSION,
};
use tokio::io::AsyncBufReadExt;
use tokio::sync::mpsc;

#[derive(Parser)]
#[command(name = "imengine")]
#[command(version = VERSION)]
#[command(about = "Instant messaging session engine", long_about = None)]
struct Cli {
    /// Config file (default: <config dir>/imengine/config.toml)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Sign in and print session events as JSON lines
    Login {
        /// Account name (overrides config)
        #[arg(short, long)]
        account: Option<String>,

        /// Server as host:port (overrides config)
        #[arg(short, long)]
        server: Option<String>,

        /// Accept inbound peer streams on the configured port
        #[arg(long)]
        listen: bool,

        /// Known peer as identity=ip:port (repeatable)
        #[arg(long = "peer")]
        peers: Vec<String>,

        /// Enable verbose logging
        #[arg(short, long)]
        verbose: bool,
    },

    /// Print the effective configuration as TOML
    Config,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = load_config(cli.config)?;

    match cli.command {
        Commands::Login {
            account,
            server,
            listen,
            peers,
            verbose,
        } => cmd_login(config, account, server, listen, peers, verbose),
        Commands::Config => {
            println!("{}", toml::to_string_pretty(&config)?);
            Ok(())
        }
    }
}

fn load_config(path: Option<PathBuf>) -> anyhow::Result<Config> {
    let file = match path.or_else(Config::default_path) {
        Some(path) if path.exists() => Config::from_file(&path)?,
        _ => Config::default(),
    };
    Ok(file.merge(Config::from_env()))
}

fn cmd_login(
    mut config: Config,
    account: Option<String>,
    server: Option<String>,
    listen: bool,
    peers: Vec<String>,
    verbose: bool,
) -> anyhow::Result<()> {
    // Initialize logging (stderr, so stdout stays JSON)
    let log_level = if verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(log_level)),
        )
        .init();

    if let Some(account) = account {
        config.account.account = account;
    }
    if let Some(server) = server {
        let (host, port) = server
            .rsplit_once(':')
            .ok_or_else(|| anyhow::anyhow!("Invalid server: {server}. Use host:port"))?;
        config.server.host = host.to_string();
        config.server.port = port.parse()?;
    }
    if config.account.password.is_empty() {
        tracing::warn!("No password configured; set IMENGINE_PASSWORD or account.password");
    }
    let peers = peers
        .iter()
        .map(|p| parse_peer(p))
        .collect::<anyhow::Result<Vec<_>>>()?;

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;
    runtime.block_on(async move {
        let listener = if listen {
            let addr = SocketAddr::from(([0, 0, 0, 0], config.peer.listen_port));
            tracing::info!("Accepting peer streams on {}", addr);
            Some(tokio::net::TcpListener::bind(addr).await?)
        } else {
            None
        };

        let tickets = Arc::new(NexusClient::new(&config.nexus)?);
        let (events_tx, mut events) = mpsc::unbounded_channel();
        let (driver, handle) = Driver::new(Session::new(config), tickets, events_tx);

        for (identity, addr) in peers {
            handle.peer_appeared(&identity, vec![addr.ip()], addr.port())?;
        }

        let printer = tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                match serde_json::to_string(&event) {
                    Ok(line) => println!("{line}"),
                    Err(e) => tracing::warn!("Unprintable event: {}", e),
                }
            }
        });
        tokio::spawn(read_stdin(handle.clone()));
        let interrupt = handle.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                let _ = interrupt.shutdown();
            }
        });

        let session = driver.run(listener).await?;
        drop(handle);
        let _ = printer.await;
        if matches!(session.login_step(), LoginStep::Failed(_)) {
            std::process::exit(1);
        }
        Ok::<_, anyhow::Error>(())
    })
}

fn parse_peer(arg: &str) -> anyhow::Result<(String, SocketAddr)> {
    let (identity, addr) = arg
        .split_once('=')
        .ok_or_else(|| anyhow::anyhow!("Invalid peer: {arg}. Use identity=ip:port"))?;
    Ok((identity.to_string(), addr.parse()?))
}

async fn read_stdin(handle: SessionHandle) {
    let mut lines = tokio::io::BufReader::new(tokio::io::stdin()).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        let command = match parse_line(&line) {
            Some(command) => command,
            None => {
                eprintln!("Unknown input: {line}");
                continue;
            }
        };
        let quit = matches!(command, SessionCommand::Shutdown);
        if handle.send(command).is_err() || quit {
            return;
        }
    }
}

fn parse_line(line: &str) -> Option<SessionCommand> {
    let mut parts = line.trim().splitn(3, ' ');
    let command = match (parts.next()?, parts.next(), parts.next()) {
        ("/msg", Some(peer), Some(body)) => SessionCommand::SendMessage {
            peer: peer.to_string(),
            body: body.to_string(),
        },
        ("/join", Some(peer), None) => SessionCommand::Join(peer.to_string()),
        ("/leave", Some(peer), None) => SessionCommand::Leave(peer.to_string()),
        ("/status", Some(status), None) => SessionCommand::SetStatus(status.to_string()),
        ("/add", Some(list), Some(account)) => SessionCommand::AddContact {
            list: list.to_string(),
            account: account.to_string(),
            friendly_name: account.to_string(),
        },
        ("/rem", Some(list), Some(account)) => SessionCommand::RemoveContact {
            list: list.to_string(),
            account: account.to_string(),
        },
        ("/quit", None, None) => SessionCommand::Shutdown,
        _ => return None,
    };
    Some(command)
}
