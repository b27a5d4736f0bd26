use anyhow::Result;
use clap::Parser;
use tokio::net::TcpListener;
use tracing::{info, warn};

use paxos_stream::{
    cli::{Cli, Mode},
    client,
    runtime::NodeParts,
    server::Server,
};

fn init_tracing() {
    use tracing_subscriber::{EnvFilter, fmt};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .try_init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let cli = Cli::parse();
    match cli.mode {
        Mode::Serve(args) => {
            let config = args.node_config();
            let listener = TcpListener::bind(args.listen).await?;
            let parts = NodeParts::new(&config);
            let server = Server::new(listener, parts.handler());
            let addr = server.local_addr()?;
            info!(
                name = %config.name,
                peers = config.peers.len(),
                "replica listening on {}",
                addr
            );
            if let Err(err) = server.run_until_ctrl_c().await {
                warn!("server exited with error: {err:?}");
                return Err(err);
            }
        }
        Mode::Client(args) => client::run(args).await?,
    }

    Ok(())
}
