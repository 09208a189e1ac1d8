use clap::{Parser, Subcommand};

/// authgate: authenticated forwarding gateway for token-protected REST backends
#[derive(Parser)]
#[command(name = "authgate", version, about)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Start the gateway server
    Serve {
        /// Port to bind (overrides AUTHGATE_PORT)
        #[arg(short, long)]
        port: Option<u16>,
    },

    /// Inspect or maintain the response cache
    Cache {
        #[command(subcommand)]
        command: CacheCommands,
    },

    /// Inspect configured backend targets
    Targets {
        #[command(subcommand)]
        command: TargetCommands,
    },
}

#[derive(Subcommand)]
pub enum CacheCommands {
    /// Remove expired entries now
    Sweep,
    /// Print entry and hit counts
    Stats,
}

#[derive(Subcommand)]
pub enum TargetCommands {
    /// List configured targets
    List,
    /// Authenticate against a target and issue one GET to its root
    Probe { name: String },
}
