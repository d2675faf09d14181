//! Triple Ratchet CLI
//!
//! Runs the in-process demo or an interactive hex-over-stdin chat.

use std::io;
use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing::info;

use triple_ratchet_cli::chat::Chat;
use triple_ratchet_cli::demo::{self, DemoConfig};
use triple_ratchet_cli::tracing_init::init_tracing;

#[derive(Parser, Debug)]
#[command(name = "triple-ratchet")]
#[command(version, about = "Triple ratchet demo and chat", long_about = None)]
struct Cli {
    /// JSON session config file (defaults apply to missing fields)
    #[arg(long, global = true, env = "TRIPLE_RATCHET_CONFIG")]
    config: Option<PathBuf>,

    /// Emit logs as JSON lines on stderr
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run Alice and Bob in-process and print the transcript.
    Demo {
        /// Number of messages Alice sends
        #[arg(long, default_value_t = 10)]
        messages: usize,

        /// Force a macro rotation on every n-th message (0 = never)
        #[arg(long, default_value_t = 3)]
        rotate_every: usize,

        /// Lose every n-th message in transit
        #[arg(long)]
        drop_every: Option<usize>,
    },
    /// Interactive chat; exchange `recv` lines with a peer by copy and paste.
    Chat {
        /// Name shown in the prompt and status
        #[arg(long, default_value = "me")]
        name: String,

        /// Peer's macro public key (hex)
        #[arg(long)]
        peer_key: Option<String>,

        /// Rotate the macro ratchet on the first send, then only on demand
        #[arg(long)]
        rotate: bool,
    },
}

#[allow(clippy::print_stdout)]
fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing("triple_ratchet=warn", cli.log_json);

    let config = triple_ratchet::load_config(cli.config.as_deref())
        .context("Failed to load session configuration")?;
    info!(
        version = env!("CARGO_PKG_VERSION"),
        rotation_interval_secs = config.rotation_interval_secs,
        "Starting triple-ratchet"
    );

    match cli.command {
        Command::Demo {
            messages,
            rotate_every,
            drop_every,
        } => {
            let summary = demo::run(
                &DemoConfig {
                    messages,
                    rotate_every,
                    drop_every,
                },
                &config,
            )?;
            for line in summary.transcript {
                println!("{line}");
            }
        }
        Command::Chat {
            name,
            peer_key,
            rotate,
        } => {
            let mut chat = Chat::new(name, config, peer_key.as_deref(), rotate)?;
            chat.run(io::stdin().lock(), io::stdout().lock())?;
        }
    }
    Ok(())
}
