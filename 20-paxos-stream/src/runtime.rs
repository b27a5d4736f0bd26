//! Wiring of a replica: log, consensus node, handler and server.

use std::{net::SocketAddr, sync::Arc, time::Duration};

use anyhow::{Context as _, Result};
use tokio::{net::TcpListener, sync::oneshot, task::JoinHandle};

use crate::{
    handler::Handler,
    log::MemoryLog,
    paxos::{
        node::Node,
        proposer::ProposerOptions,
        replica::{RemoteReplica, Replica},
    },
    server::Server,
};

/// Everything a replica needs to know about itself and its cluster.
#[derive(Debug, Clone)]
pub struct NodeConfig {
    /// Used in proposal ids. Peers know this replica by the same name.
    pub name: String,
    /// The other replicas, excluding this one.
    pub peers: Vec<SocketAddr>,
    pub rpc_timeout: Duration,
    pub proposer: ProposerOptions,
}

/// The collaborators of one replica.
pub struct NodeParts {
    pub log: Arc<MemoryLog>,
    pub node: Arc<Node<MemoryLog>>,
}

impl NodeParts {
    pub fn new(config: &NodeConfig) -> Self {
        let log = Arc::new(MemoryLog::new());
        let peers = config
            .peers
            .iter()
            .map(|addr| Arc::new(RemoteReplica::new(*addr, config.rpc_timeout)) as Arc<dyn Replica>)
            .collect();
        let node = Arc::new(Node::new(
            config.name.clone(),
            Arc::clone(&log),
            peers,
            config.proposer.clone(),
        ));
        Self { log, node }
    }

    pub fn handler(&self) -> Handler<MemoryLog, Node<MemoryLog>> {
        Handler::new(Arc::clone(&self.log), Arc::clone(&self.node))
    }
}

/// A replica serving on a background task.
pub struct NodeHandle {
    addr: SocketAddr,
    parts: NodeParts,
    shutdown_tx: oneshot::Sender<()>,
    task: JoinHandle<Result<()>>,
}

impl NodeHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn log(&self) -> &Arc<MemoryLog> {
        &self.parts.log
    }

    pub fn node(&self) -> &Arc<Node<MemoryLog>> {
        &self.parts.node
    }

    /// Stops accepting connections, cancels open ones and waits for the
    /// server task.
    pub async fn shutdown(self) -> Result<()> {
        let _ = self.shutdown_tx.send(());
        self.task.await.context("server task panicked")?
    }
}

/// Builds a replica from `config` and serves it on `listener` until the
/// returned handle is shut down.
pub fn spawn_node(listener: TcpListener, config: &NodeConfig) -> Result<NodeHandle> {
    let parts = NodeParts::new(config);
    let server = Server::new(listener, parts.handler());
    let addr = server.local_addr()?;
    let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();

    let task = tokio::spawn(async move {
        let shutdown = async move {
            let _ = shutdown_rx.await;
        };
        server.run_until(shutdown).await
    });

    Ok(NodeHandle {
        addr,
        parts,
        shutdown_tx,
        task,
    })
}
