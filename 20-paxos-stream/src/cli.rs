use std::{net::SocketAddr, time::Duration};

use clap::{Args, Parser, Subcommand};

use crate::{paxos::proposer::ProposerOptions, runtime::NodeConfig};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub mode: Mode,
}

#[derive(Subcommand, Debug)]
pub enum Mode {
    /// Run a replica serving the line protocol.
    Serve(ServeArgs),
    /// Send one command line to a replica and print the response.
    Client(ClientArgs),
}

#[derive(Args, Debug, Clone)]
pub struct ServeArgs {
    /// Socket address to accept connections on. Use port 0 for an ephemeral port.
    #[arg(long, default_value = "127.0.0.1:7000")]
    pub listen: SocketAddr,

    /// Address the other replicas use to reach this one. Defaults to --listen.
    #[arg(long)]
    pub advertise: Option<SocketAddr>,

    /// Comma-separated addresses of every replica. This replica's own
    /// address may be included; it is skipped.
    #[arg(long, value_delimiter = ',')]
    pub peer: Vec<SocketAddr>,

    /// Timeout for each request sent to a peer, in milliseconds.
    #[arg(long, default_value_t = 500)]
    pub rpc_timeout_ms: u64,

    /// Agreement rounds a push may take before failing.
    #[arg(long, default_value_t = 8)]
    pub max_rounds: usize,

    /// Base pause between failed rounds, in milliseconds.
    #[arg(long, default_value_t = 25)]
    pub backoff_ms: u64,
}

impl ServeArgs {
    pub fn node_config(&self) -> NodeConfig {
        let advertise = self.advertise.unwrap_or(self.listen);
        NodeConfig {
            name: advertise.to_string(),
            peers: self
                .peer
                .iter()
                .copied()
                .filter(|peer| *peer != advertise)
                .collect(),
            rpc_timeout: Duration::from_millis(self.rpc_timeout_ms),
            proposer: ProposerOptions {
                max_rounds: self.max_rounds.max(1),
                backoff: Duration::from_millis(self.backoff_ms),
            },
        }
    }
}

#[derive(Args, Debug, Clone)]
pub struct ClientArgs {
    /// Address of the replica to talk to.
    #[arg(long, default_value = "127.0.0.1:7000")]
    pub server: SocketAddr,

    /// Command and arguments, e.g. `push hello` or `pull 0`.
    #[arg(required = true, num_args = 1.., trailing_var_arg = true)]
    pub line: Vec<String>,
}
