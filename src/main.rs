//! protonet - Protocol Buffers wire inspection tool
//!
//! Decodes, validates and explains protobuf binary data without a schema.

mod commands;
mod config;
mod dump;

use clap::{Parser, Subcommand};
use colored::Colorize;
use config::Config;
use protonet_wire::ProtoError;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "protonet")]
#[command(about = "Inspect Protocol Buffers binary data without a schema")]
#[command(version)]
struct Cli {
    /// Path to a YAML config file
    #[arg(short, long, env = "PROTONET_CONFIG")]
    config: Option<PathBuf>,

    /// Maximum nesting depth while decoding
    #[arg(long)]
    max_depth: Option<usize>,

    /// Maximum number of bytes to decode
    #[arg(long)]
    max_message_size: Option<u64>,

    /// Disable coloured output
    #[arg(long)]
    no_color: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Decode a message and print its field tree
    Dump {
        /// Input file, or - for stdin
        input: PathBuf,

        /// Input is hex text rather than raw bytes
        #[arg(long)]
        hex: bool,
    },

    /// Validate framing and report the message size
    Check {
        /// Input file, or - for stdin
        input: PathBuf,

        /// Input is hex text rather than raw bytes
        #[arg(long)]
        hex: bool,
    },

    /// Show the wire encodings of an integer
    Varint {
        /// Value to encode
        #[arg(allow_hyphen_values = true)]
        value: i64,
    },
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let mut config = match Config::load(cli.config.as_deref()) {
        Ok(c) => c,
        Err(e) => {
            tracing::error!("Failed to load config: {}", e);
            return Err(e.into());
        }
    };
    if let Some(depth) = cli.max_depth {
        config.reader.max_depth = depth;
    }
    if let Some(size) = cli.max_message_size {
        config.reader.max_message_size = size;
    }
    if cli.no_color {
        config.output.color = false;
    }
    config.validate()?;

    if !config.output.color {
        colored::control::set_override(false);
    }

    match commands::execute(cli.command, &config) {
        Ok(output) => {
            println!("{}", output);
            Ok(())
        }
        Err(e) => {
            match e.downcast_ref::<ProtoError>() {
                Some(proto) => eprintln!("{} [{}]: {}", "Error".red(), proto.category(), proto),
                None => eprintln!("{}: {}", "Error".red(), e),
            }
            std::process::exit(1);
        }
    }
}
