pub mod commands;

use clap::{Parser, Subcommand};

use havoc::error::Result;

#[derive(Parser)]
#[command(name = "havoc")]
#[command(version)]
#[command(about = "Drive havoc agents across a fleet of nodes")]
#[command(long_about = "Send fault-injection commands to havoc agents.\n\nCommands are written as words with --flag=value arguments:\n\n    havoc run --groups=db kill process --names=postgres\n    havoc send -a 10.0.0.5:6969 -k SECRET burn cpu --timeout=60")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Manage the fleet file
    Node {
        #[command(subcommand)]
        command: NodeCommands,
    },

    /// Dispatch a command to nodes from the fleet file
    Run {
        /// Target nodes by name (comma-separated)
        #[arg(long, value_delimiter = ',')]
        nodes: Vec<String>,

        /// Target every node of these groups (comma-separated)
        #[arg(long, value_delimiter = ',')]
        groups: Vec<String>,

        /// Command words followed by --flag=value arguments
        #[arg(required = true, trailing_var_arg = true, allow_hyphen_values = true)]
        words: Vec<String>,
    },

    /// Send a command straight to one agent
    Send {
        /// Agent address (host:port or URL)
        #[arg(short, long, env = "HAVOC_AGENT")]
        address: String,

        /// Agent secret
        #[arg(short, long, env = "HAVOC_KEY", hide_env_values = true)]
        key: String,

        /// Command words followed by --flag=value arguments
        #[arg(required = true, trailing_var_arg = true, allow_hyphen_values = true)]
        words: Vec<String>,
    },
}

#[derive(Subcommand)]
pub enum NodeCommands {
    /// Register a node (re-adding updates its endpoint and secret)
    Add {
        /// Node name
        name: String,

        /// Agent address (host:port or URL)
        endpoint: String,

        /// Group the node belongs to
        #[arg(short, long, default_value = "")]
        group: String,

        /// Agent secret
        #[arg(short, long, env = "HAVOC_KEY", hide_env_values = true)]
        secret: String,
    },

    /// Show registered nodes
    List,
}

impl Cli {
    pub async fn execute(self) -> Result<()> {
        match self.command {
            Commands::Node { command } => match command {
                NodeCommands::Add {
                    name,
                    endpoint,
                    group,
                    secret,
                } => commands::node::add(name, endpoint, group, secret),
                NodeCommands::List => commands::node::list(),
            },
            Commands::Run {
                nodes,
                groups,
                words,
            } => commands::remote::run(nodes, groups, words).await,
            Commands::Send {
                address,
                key,
                words,
            } => commands::remote::send(address, key, words).await,
        }
    }
}
