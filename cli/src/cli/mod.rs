pub mod commands;

use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "nutrik-server")]
#[command(author, version, about = "Nutrik CLI - nutrition chat API backed by Google Gemini")]
pub struct Cli {
    /// Path to config file (checked in order: local config.toml, ~/.config/nutrik/config.toml)
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Start the chat server
    Start {
        /// Port to listen on (overrides config)
        #[arg(short, long)]
        port: Option<u16>,
    },

    /// Show resolved configuration and server status
    Status,

    /// Send one message through the chat pipeline without starting the server
    Ask {
        /// Message text
        message: String,

        /// Image file to attach (jpeg, png, webp, gif, heic)
        #[arg(short, long)]
        image: Option<PathBuf>,

        /// Print the reply as it streams in
        #[arg(short, long)]
        stream: bool,
    },
}
