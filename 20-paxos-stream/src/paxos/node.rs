use std::sync::Arc;

use async_trait::async_trait;

use super::{
    AcceptMessage, NodeStatus, Promise,
    proposer::{Proposer, ProposerOptions},
    replica::{LocalReplica, Replica},
};
use crate::{context::Context, error::Result, handler::Log, handler::Paxos};

/// A cluster member: the local acceptor answering peers plus the proposer
/// that serves this node's `push` requests.
pub struct Node<L: ?Sized> {
    local: Arc<LocalReplica<L>>,
    proposer: Proposer<L>,
}

impl<L: Log + ?Sized + 'static> Node<L> {
    pub fn new(
        name: impl Into<String>,
        log: Arc<L>,
        peers: Vec<Arc<dyn Replica>>,
        options: ProposerOptions,
    ) -> Self {
        Self::from_local(Arc::new(LocalReplica::new(name, log)), peers, options)
    }

    /// Builds a node around an existing acceptor, for clusters whose members
    /// share a process and reach each other through [`LocalReplica`]s.
    pub fn from_local(
        local: Arc<LocalReplica<L>>,
        peers: Vec<Arc<dyn Replica>>,
        options: ProposerOptions,
    ) -> Self {
        let proposer = Proposer::new(Arc::clone(&local), peers, options);
        Self { local, proposer }
    }

    /// The in-process acceptor, usable as a peer by other nodes living in
    /// the same process.
    pub fn local(&self) -> &Arc<LocalReplica<L>> {
        &self.local
    }

    pub fn name(&self) -> &str {
        self.local.name()
    }
}

#[async_trait]
impl<L: Log + ?Sized + 'static> Paxos for Node<L> {
    async fn commit(&self, ctx: &Context, v: &str) -> Result<Vec<AcceptMessage>> {
        self.proposer.commit(ctx, v).await
    }

    async fn prepare(&self, _ctx: &Context, n: u64) -> Promise {
        self.local.promise(n)
    }

    async fn accept(&self, _ctx: &Context, n: u64, v: &str, id: &str) -> bool {
        self.local.vote(n, id, v)
    }

    fn set(&self, id: &str) {
        self.local.learned(id);
    }

    fn status(&self) -> NodeStatus {
        let acceptor = self.local.acceptor();
        NodeStatus {
            name: self.name().to_string(),
            replicas: self.proposer.replicas(),
            quorum: self.proposer.quorum(),
            promised: acceptor.promised(),
            accepted: acceptor.accepted(),
            head: self.local.head(),
        }
    }
}
