use std::error::Error;
use std::net::IpAddr;
use std::path::PathBuf;

use clap::{Parser, Subcommand};

use peerdrop::config::{ClientConfig, RelayConfig};
use peerdrop::transport::tcp::TcpConnector;
use peerdrop::{CHUNK_SIZE, DEFAULT_RELAY_ADDR, DEFAULT_RELAY_PORT};

#[derive(Parser)]
#[command(name = "peerdrop")]
#[command(about = "Peer-to-peer file transfer with a signaling relay", long_about = None)]
#[command(version)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Relay address (host:port)
    #[arg(long, global = true, env = "PEERDROP_RELAY", default_value = DEFAULT_RELAY_ADDR)]
    relay: String,

    /// Display name shown to other peers
    #[arg(long, global = true, env = "PEERDROP_NAME", default_value = "anonymous")]
    name: String,

    /// Address other peers should dial for direct channels. Without it the
    /// loopback address is advertised, which only works on this machine.
    #[arg(long, global = true)]
    advertise_ip: Option<IpAddr>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the signaling relay
    Relay {
        /// Port to bind to
        #[arg(short, long, default_value_t = DEFAULT_RELAY_PORT)]
        port: u16,
    },
    /// List peers currently online
    Peers,
    /// Send a file to a peer
    Send {
        /// Path to the file to send
        file_path: PathBuf,
        /// Display name or connection id of the recipient
        #[arg(long)]
        to: String,
        /// Bytes per chunk on the direct channel
        #[arg(long, default_value_t = CHUNK_SIZE)]
        chunk_size: usize,
    },
    /// Wait for incoming files
    Receive {
        /// Directory to save received files in
        #[arg(short, long, default_value = ".")]
        output_dir: PathBuf,
        /// Accept every request without asking
        #[arg(short, long)]
        yes: bool,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    let cli = Cli::parse();

    if cli.verbose {
        env_logger::Builder::from_default_env()
            .filter_level(log::LevelFilter::Debug)
            .init();
        log::info!("Verbose logging enabled");
    } else {
        env_logger::Builder::from_default_env()
            .filter_level(log::LevelFilter::Info)
            .init();
    }

    let client_config = ClientConfig::new(cli.relay.clone(), cli.name.clone());
    let connector = TcpConnector {
        advertise_ip: cli.advertise_ip,
        ..TcpConnector::default()
    };

    match cli.command {
        Commands::Relay { port } => {
            peerdrop::commands::relay::run(RelayConfig::on_port(port)).await?;
        }
        Commands::Peers => {
            peerdrop::commands::peers::run(client_config).await?;
        }
        Commands::Send {
            file_path,
            to,
            chunk_size,
        } => {
            let config = client_config.with_chunk_size(chunk_size);
            peerdrop::commands::send::run(config, connector, &file_path, &to).await?;
        }
        Commands::Receive { output_dir, yes } => {
            peerdrop::commands::receive::run(client_config, connector, output_dir, yes).await?;
        }
    }

    Ok(())
}
