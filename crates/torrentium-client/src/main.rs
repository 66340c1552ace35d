//! Torrentium - peer-to-peer content distribution node

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::io::Write;
use std::path::Path;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio_util::sync::CancellationToken;
use torrentium_client::catalog::Catalog;
use torrentium_client::config::{expand_path, Config};
use torrentium_client::repository::SqliteRepository;
use torrentium_client::Node;
use torrentium_core::{ContentId, FileRecord, PeerId, TcpHost};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser)]
#[command(name = "torrentium")]
#[command(about = "Peer-to-peer content distribution", long_about = None)]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "~/.torrentium/config.toml")]
    config: String,

    /// Enable verbose output
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize configuration
    Init,

    /// Add a file to the local catalog
    Share {
        /// Path to the file to share
        #[arg(required = true)]
        file: String,
    },

    /// List locally shared files
    List,

    /// Start a node and read commands from stdin
    Shell,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Set up logging
    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("info")
    };

    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(filter)
        .init();

    let config_path = expand_path(&cli.config);
    match cli.command {
        Commands::Init => init_config(&config_path),
        Commands::Share { file } => share_file(&load_config(&config_path)?, &file).await,
        Commands::List => list_files(&load_config(&config_path)?).await,
        Commands::Shell => run_shell(load_config(&config_path)?).await,
    }
}

fn load_config(path: &Path) -> Result<Config> {
    if !path.exists() {
        tracing::debug!("No config at {}, using defaults", path.display());
        return Ok(Config::default());
    }
    Config::load(path).with_context(|| format!("Failed to load {}", path.display()))
}

fn init_config(path: &Path) -> Result<()> {
    if path.exists() {
        println!("Config already exists at: {}", path.display());
        return Ok(());
    }
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir)?;
    }

    let mut config = Config::default();
    config.node.peer_id = Some(PeerId::random().to_string());
    std::fs::write(path, toml::to_string_pretty(&config)?)?;

    std::fs::create_dir_all(config.data_dir())?;
    std::fs::create_dir_all(config.download_dir())?;

    println!("Initialized Torrentium at: {}", config.data_dir().display());
    println!("Config: {}", path.display());
    Ok(())
}

fn open_catalog(config: &Config) -> Result<Catalog> {
    let repo = SqliteRepository::open(&config.database_path())?;
    Ok(Catalog::new(Arc::new(repo), config.transfer.chunk_size))
}

async fn share_file(config: &Config, file: &str) -> Result<()> {
    let path = Path::new(file);
    if !path.exists() {
        anyhow::bail!("File not found: {}", path.display());
    }

    let record = open_catalog(config)?.publish(path).await?;
    print_record(&record);
    println!();
    println!("File is recorded locally. It is announced the next time a node runs:");
    println!("  torrentium shell");
    Ok(())
}

async fn list_files(config: &Config) -> Result<()> {
    let records = open_catalog(config)?.list_local().await?;
    if records.is_empty() {
        println!("No shared files. Use `torrentium share <file>` to add one.");
        return Ok(());
    }
    for record in &records {
        print_record(record);
        println!();
    }
    Ok(())
}

fn print_record(record: &FileRecord) {
    println!("{}", record.name);
    println!("  Id: {}", record.id);
    println!("  Size: {} bytes ({} chunks)", record.size, record.chunk_count());
    if let Some(path) = record.local_path() {
        println!("  Path: {}", path.display());
    }
}

async fn run_shell(config: Config) -> Result<()> {
    let peer_id = config
        .node
        .peer_id
        .as_deref()
        .map(PeerId::new)
        .unwrap_or_else(PeerId::random);
    let host = TcpHost::bind(
        peer_id,
        &config.node.listen_address,
        config.node.advertise_address.clone(),
    )
    .await
    .with_context(|| format!("Failed to listen on {}", config.node.listen_address))?;
    let repo = SqliteRepository::open(&config.database_path())?;

    let node = Node::new(Arc::new(host), Arc::new(repo), &config);
    node.start()?;

    let cancel = node.cancellation_token();
    match node.bootstrap(&cancel).await {
        Ok(n) => tracing::info!("Joined the overlay via {} bootstrap node(s)", n),
        Err(e) => tracing::warn!("Bootstrap failed, continuing standalone: {}", e),
    }
    node.start_maintenance();

    // Anything published while offline gets announced now
    for record in node.list_local().await? {
        if let Err(e) = node.dht().announce(&record.id).await {
            tracing::debug!("Initial announce of {} failed: {}", record.id.short(), e);
        }
    }

    println!("Node {} ready. Type `help` for commands.", node.local_peer());
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        print!("> ");
        let _ = std::io::stdout().flush();
        let line = tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            line = lines.next_line() => match line? {
                Some(line) => line,
                None => break,
            },
        };

        let command_cancel = node.cancellation_token();
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                command_cancel.cancel();
                break;
            }
            keep_going = run_command(&node, line.trim(), &command_cancel) => {
                if !keep_going {
                    break;
                }
            }
        }
    }

    node.shutdown().await?;
    println!("Bye");
    Ok(())
}

/// Execute one shell command; `false` means exit
async fn run_command(node: &Node<TcpHost>, line: &str, cancel: &CancellationToken) -> bool {
    let (command, arg) = match line.split_once(char::is_whitespace) {
        Some((c, rest)) => (c, rest.trim()),
        None => (line, ""),
    };

    let result = match command {
        "" => Ok(()),
        "add" => shell_add(node, arg, cancel).await,
        "list" => shell_list(node).await,
        "search" => shell_search(node, arg, cancel).await,
        "download" => shell_download(node, arg, cancel).await,
        "peers" => {
            shell_peers(node);
            Ok(())
        }
        "health" => {
            shell_health(node).await;
            Ok(())
        }
        "debug" => {
            shell_debug(node).await;
            Ok(())
        }
        "help" => {
            print_help();
            Ok(())
        }
        "exit" | "quit" => return false,
        other => {
            println!("Unknown command '{}'. Type `help` for commands.", other);
            Ok(())
        }
    };

    if let Err(e) = result {
        println!("Error: {}", e);
    }
    true
}

async fn shell_add(node: &Node<TcpHost>, arg: &str, cancel: &CancellationToken) -> Result<()> {
    if arg.is_empty() {
        anyhow::bail!("usage: add <path>");
    }
    let record = node.publish(&expand_path(arg), cancel).await?;
    print_record(&record);
    Ok(())
}

async fn shell_list(node: &Node<TcpHost>) -> Result<()> {
    let records = node.list_local().await?;
    if records.is_empty() {
        println!("Nothing shared yet");
    }
    for record in &records {
        print_record(record);
    }
    Ok(())
}

async fn shell_search(node: &Node<TcpHost>, arg: &str, cancel: &CancellationToken) -> Result<()> {
    if arg.is_empty() {
        anyhow::bail!("usage: search <id|text>");
    }

    if let Ok(id) = arg.parse::<ContentId>() {
        let providers = node.search_by_identifier(&id, cancel).await?;
        if providers.is_empty() {
            println!("No providers for {}", id);
        }
        for p in &providers {
            println!("  {} (last seen {})", p.peer, p.last_seen);
        }
        return Ok(());
    }

    let results = node.search_by_text(arg, cancel).await?;
    if results.is_empty() {
        println!("No results found for '{}'", arg);
        return Ok(());
    }
    println!("Found {} results for '{}':", results.len(), arg);
    for (i, record) in results.iter().enumerate() {
        let origin = if record.is_local() { "local" } else { "remote" };
        println!(
            "{}. {} ({} bytes, {} chunks, {})",
            i + 1,
            record.name,
            record.size,
            record.chunk_count(),
            origin
        );
        println!("   Id: {}", record.id);
    }
    Ok(())
}

async fn shell_download(node: &Node<TcpHost>, arg: &str, cancel: &CancellationToken) -> Result<()> {
    let id: ContentId = arg
        .parse()
        .map_err(|e| anyhow::anyhow!("usage: download <id> ({})", e))?;
    println!("Downloading {}...", id.short());
    let record = node.download(&id, cancel).await?;
    println!("Downloaded successfully:");
    print_record(&record);
    Ok(())
}

fn shell_peers(node: &Node<TcpHost>) {
    let peers = node.list_connected_peers();
    if peers.is_empty() {
        println!("No connected peers");
    }
    for state in &peers {
        match state.last_latency {
            Some(latency) => println!("  {} ({:?})", state.peer, latency),
            None => println!("  {}", state.peer),
        }
    }
}

/// Re-probe every tracked peer, then print the results
async fn shell_health(node: &Node<TcpHost>) {
    let tracked = node.debug_snapshot().peers;
    for state in &tracked {
        let _ = node.health().probe(&state.peer).await;
    }

    let snapshot = node.debug_snapshot();
    if snapshot.peers.is_empty() {
        println!("No peers tracked yet");
    }
    for state in &snapshot.peers {
        print!(
            "  {} {} failures={}",
            state.peer, state.status, state.consecutive_failures
        );
        if let Some(err) = &state.last_error {
            print!(" last_error=\"{}\"", err);
        }
        println!();
    }
}

async fn shell_debug(node: &Node<TcpHost>) {
    use torrentium_client::health::PeerStatus;

    let snapshot = node.debug_snapshot();
    println!("Torrentium v{}", env!("CARGO_PKG_VERSION"));
    println!("Protocol version: {}", torrentium_core::PROTOCOL_VERSION);
    println!("Local: {}", snapshot.local);
    println!("DHT: {:?}, {} node(s) in routing table", snapshot.dht_state, snapshot.routing_table_size);
    println!(
        "Peers: {} connected, {} connecting, {} disconnected, {} unhealthy",
        snapshot.count(PeerStatus::Connected),
        snapshot.count(PeerStatus::Connecting),
        snapshot.count(PeerStatus::Disconnected),
        snapshot.count(PeerStatus::Unhealthy)
    );
    match node.list_local().await {
        Ok(records) => println!("Shared files: {}", records.len()),
        Err(e) => println!("Shared files: unavailable ({})", e),
    }
}

fn print_help() {
    println!("Commands:");
    println!("  add <path>         share a local file");
    println!("  list               list shared files");
    println!("  search <id|text>   find providers of an id, or files by name");
    println!("  download <id>      fetch a file by id");
    println!("  peers              connected peers");
    println!("  health             health of every tracked peer");
    println!("  debug              node and DHT status");
    println!("  exit               shut down");
}
