//! overlay-keytool — key-pair generation and token-minting utility for
//! the overlay runtime's Notary.

mod commands;

use clap::{Parser, Subcommand};

/// overlay-keytool — Notary key and token utility
#[derive(Parser)]
#[command(name = "overlay-keytool", version, about = "Notary key-pair generation and token minting")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Generate an Ed25519 key pair
    Keygen,

    /// Mint a signed token for a payload
    Tokengen {
        /// Raw payload bytes, given as a UTF-8 string
        payload: String,

        /// Statement domain the token is scoped to
        #[arg(long, default_value = "")]
        domain: String,

        /// Signing algorithm (ed25519 or none)
        #[arg(long = "alg", default_value = "ed25519")]
        algorithm: String,

        /// Base64url-encoded signing key
        #[arg(long)]
        signkey: String,

        /// Base64url-encoded verify key to rotate in (omit to keep the current one)
        #[arg(long)]
        verifykey: Option<String>,
    },
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter("warn")
        .with_target(false)
        .init();

    let cli = Cli::parse();

    let result = match cli.command {
        Command::Keygen => commands::keygen::run(),
        Command::Tokengen {
            payload,
            domain,
            algorithm,
            signkey,
            verifykey,
        } => commands::tokengen::run(&payload, &domain, &algorithm, &signkey, verifykey.as_deref()),
    };

    if let Err(e) = result {
        eprintln!("overlay-keytool: {e:#}");
        std::process::exit(1);
    }
}
