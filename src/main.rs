//! NanoServe - binary-framed TCP reactors
//!
//! Runs the demo game server, a headless game client, or config helpers.

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use nanoserve::config::{self, Config};
use nanoserve::game::{self, GameClient, GameServerHooks, World};
use nanoserve::network::{Client, Router, Server};
use nanoserve::protocol;

/// NanoServe - binary-framed TCP reactors
#[derive(Parser)]
#[command(name = "nanoserve")]
#[command(author = "NanoServe Contributors")]
#[command(version = "0.1.0")]
#[command(about = "Run a NanoServe game server or client", long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the game server
    Server {
        /// Interface to bind to
        #[arg(long)]
        host: Option<String>,

        /// Port to listen on
        #[arg(short, long)]
        port: Option<u16>,

        /// Server name shown in logs
        #[arg(short, long)]
        name: Option<String>,
    },

    /// Run a headless game client
    Client {
        /// Server address to connect to
        #[arg(short, long)]
        server: Option<String>,

        /// Server port
        #[arg(short, long)]
        port: Option<u16>,

        /// Name to join with
        #[arg(short, long)]
        username: Option<String>,

        /// Number of random moves to play
        #[arg(short, long, default_value_t = 10)]
        moves: usize,
    },

    /// Show current configuration
    Config {
        /// Generate sample configuration
        #[arg(long)]
        generate: bool,

        /// Output path for generated config
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Show protocol information
    Info,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Load configuration
    let config = if let Some(config_path) = &cli.config {
        Config::load(config_path)?
    } else {
        Config::load_default().unwrap_or_default()
    };

    // Initialize logging; RUST_LOG wins over the flags
    let level = if cli.verbose || config.general.verbose {
        "debug"
    } else {
        "info"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(filter)
        .init();

    match cli.command {
        Commands::Server { host, port, name } => {
            run_server(config, host, port, name)?;
        }
        Commands::Client {
            server,
            port,
            username,
            moves,
        } => {
            run_client(config, server, port, username, moves)?;
        }
        Commands::Config { generate, output } => {
            if generate {
                let sample = config::generate_sample_config()?;
                if let Some(path) = output {
                    std::fs::write(&path, &sample)?;
                    println!("Configuration written to: {}", path.display());
                } else {
                    println!("{}", sample);
                }
            } else {
                println!("{}", toml::to_string_pretty(&config)?);
            }
        }
        Commands::Info => {
            print_protocol_info();
        }
    }

    Ok(())
}

/// Run the game server until Ctrl+C
fn run_server(
    mut config: Config,
    host: Option<String>,
    port: Option<u16>,
    name: Option<String>,
) -> anyhow::Result<()> {
    if let Some(host) = host {
        config.server.host = host;
    }
    if let Some(port) = port {
        config.server.port = port;
    }
    let name = name.unwrap_or(config.general.name.clone());

    let world = World::new().shared();
    let mut router = Router::new();
    game::register_routes(&mut router, &world)?;

    let mut server = Server::new(
        name.clone(),
        config.server.reactor_config(),
        router,
        GameServerHooks::new(&world),
    );
    let local_addr = server.start(&config.server.bind_address())?;

    println!("\n========================================");
    println!("  NanoServe Server Running");
    println!("========================================");
    println!("  Name: {}", name);
    println!("  Address: {}", local_addr);
    println!("========================================");
    println!("\nWaiting for players to join...");
    println!("Press Ctrl+C to stop.\n");

    server.run()?;

    println!("\nServer stopped.");
    Ok(())
}

/// Join the game and play a few random moves
fn run_client(
    mut config: Config,
    server: Option<String>,
    port: Option<u16>,
    username: Option<String>,
    moves: usize,
) -> anyhow::Result<()> {
    if let Some(server) = server {
        config.client.host = server;
    }
    if let Some(port) = port {
        config.client.port = port;
    }
    let username = username.unwrap_or(config.client.username.clone());

    let hooks = GameClient::with_random_moves(username.as_str(), moves, &mut rand::thread_rng());
    let mut client = Client::new(config.client.reactor_config(), hooks)?;

    println!("Connecting to {}:{}...", config.client.host, config.client.port);
    let server_addr = client.connect(&config.client.host, config.client.port)?;

    println!("\n========================================");
    println!("  NanoServe Client Connected");
    println!("========================================");
    println!("  Player: {}", username);
    println!("  Server: {}", server_addr);
    println!("  Moves: {}", moves);
    println!("========================================\n");

    client.run()?;

    let hooks = client.hooks();
    println!("Received {} state updates.", hooks.updates());
    for (id, [x, y]) in &hooks.players().players {
        println!("  player {:>3} at ({}, {})", id, x, y);
    }

    Ok(())
}

fn print_protocol_info() {
    println!("NanoServe Protocol Information");
    println!("==============================\n");

    println!("Protocol Version: {}", protocol::PROTOCOL_VERSION);
    println!("Default Port: {}", protocol::DEFAULT_PORT);
    println!("Header Size: {} bytes", protocol::HEADER_SIZE);
    println!(
        "Max Frame Size: {} bytes (default)",
        protocol::DEFAULT_MAX_FRAME_SIZE
    );

    println!("\nHeader layout (big-endian):");
    println!("  [version:1][flags:1][A:2][B:4]");
    println!("  flags & 0x01 set:   A = method (16 bits), B = length (32 bits)");
    println!("  flags & 0x01 clear: A = length (16 bits), B = method (32 bits)");

    println!("\nGame methods:");
    println!("  {} join (payload: username)", game::METHOD_JOIN);
    println!("  {} move (payload: {{\"dx\":..,\"dy\":..}})", game::METHOD_MOVE);
    println!("  {} state broadcast (payload: {{\"players\":{{..}}}})", game::METHOD_STATE);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_parsing() {
        let cli = Cli::try_parse_from(["nanoserve", "info"]);
        assert!(cli.is_ok());
    }

    #[test]
    fn test_client_args() {
        let cli = Cli::try_parse_from([
            "nanoserve", "-v", "client", "--server", "10.0.0.2", "--port", "6000", "--moves", "3",
        ])
        .unwrap();
        assert!(cli.verbose);
        match cli.command {
            Commands::Client {
                server,
                port,
                username,
                moves,
            } => {
                assert_eq!(server.as_deref(), Some("10.0.0.2"));
                assert_eq!(port, Some(6000));
                assert_eq!(username, None);
                assert_eq!(moves, 3);
            }
            _ => panic!("expected client subcommand"),
        }
    }
}
