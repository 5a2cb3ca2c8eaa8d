use std::io::Read;
use std::path::PathBuf;

use anyhow::anyhow;
use bytes::Bytes;
use clap::Parser;
use clap_derive::{Parser, Subcommand};
use netplug::blit::blit_client::BlitClient;
use netplug::blit::blit_messages::BlitCommand;
use netplug::plug::peer::Transport;
use netplug::plug::plug_config::{default_blit_addr, resolve_addr, DEFAULT_BLIT_IPADDR};
use tracing::{info, Level};

/// Sends a command to a running plug's Blit control listener
#[derive(Parser)]
struct Args {
    /// host:port of the Blit control listener; a bare port means localhost
    #[clap(short, long)]
    blit: Option<String>,

    /// send the command as a single datagram
    #[clap(short, long, default_value_t = false)]
    udp: bool,

    #[clap(short, long, default_value_t = false)]
    verbose: bool,

    #[clap(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Injects a message, taken from the command line, a file or stdin
    Send {
        #[clap(short, long, default_value_t = 0)]
        peer: u16,

        #[clap(short, long, conflicts_with = "message")]
        file: Option<PathBuf>,

        message: Option<String>,
    },
    /// Has the plug log its peers
    List,
    /// Stops the plug
    Kill,
    /// Disconnects and forgets all peers
    Clear,
    /// Ignores data from a peer
    Squelch { peer: u16 },
    Unsquelch { peer: u16 },
    Delete { peer: u16 },
}

#[tokio::main(flavor = "current_thread")]
pub async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_max_level(if args.verbose { Level::DEBUG } else { Level::INFO })
        .with_writer(std::io::stderr)
        .try_init()
        .ok();

    let addr = match &args.blit {
        Some(blit) => resolve_addr(blit, DEFAULT_BLIT_IPADDR).await?,
        None => default_blit_addr(),
    };
    let transport = if args.udp { Transport::Udp } else { Transport::Tcp };

    let command = blit_command(args.command)?;
    let sent = BlitClient::new(addr, transport)
        .send(&command).await?;
    info!("sent {:?} ({} bytes) to {}({})", command.opcode(), sent, addr, transport);
    Ok(())
}

fn blit_command(command: Command) -> anyhow::Result<BlitCommand> {
    Ok(match command {
        Command::Send { peer, file, message } => {
            let data = match (file, message) {
                (_, Some(message)) => message.into_bytes(),
                (Some(path), None) => std::fs::read(&path)
                    .map_err(|e| anyhow!("cannot read {:?}: {}", path, e))?,
                (None, None) => {
                    let mut data = Vec::new();
                    std::io::stdin().read_to_end(&mut data)?;
                    data
                }
            };
            BlitCommand::SendMsg { peer, data: Bytes::from(data) }
        }
        Command::List => BlitCommand::ListPeers,
        Command::Kill => BlitCommand::Kill,
        Command::Clear => BlitCommand::Clear,
        Command::Squelch { peer } => BlitCommand::Squelch { peer },
        Command::Unsquelch { peer } => BlitCommand::Unsquelch { peer },
        Command::Delete { peer } => BlitCommand::Delete { peer },
    })
}
