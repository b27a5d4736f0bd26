//! The acceptors a proposer talks to.
//!
//! [`LocalReplica`] answers from this process's acceptor and log.
//! [`RemoteReplica`] sends the same requests to a peer over the line
//! protocol, one short-lived connection per call.

use std::{
    collections::BTreeMap,
    net::SocketAddr,
    sync::{Arc, Mutex, PoisonError},
    time::Duration,
};

use async_trait::async_trait;
use tracing::debug;

use super::{AcceptMessage, Promise, ProposalId, acceptor::Acceptor, parse_flag};
use crate::{
    client::Client,
    context::Context,
    error::{Error, Result},
    handler::{Log, RESPONSE_OK},
};

#[async_trait]
pub trait Replica: Send + Sync {
    fn name(&self) -> &str;

    async fn prepare(&self, ctx: &Context, n: u64) -> Result<Promise>;

    async fn accept(&self, ctx: &Context, n: u64, id: &str, v: &str) -> Result<bool>;

    /// Tells the replica that `v` was chosen for `slot` under proposal `id`.
    async fn learn(&self, ctx: &Context, slot: u64, id: &str, v: &str) -> Result<()>;

    /// Learned values from `from` up to the replica's head.
    async fn entries(&self, ctx: &Context, from: u64) -> Result<Vec<String>>;
}

/// This process's acceptor together with the log it learns into.
///
/// Accepts are only granted for the slot right after the local head: a
/// replica that already learned a slot never votes on it again, and one
/// that is behind has to catch up before it can vote.
///
/// The replica also remembers which proposal id each slot was learned
/// under, so a proposer can tell its own proposals from equal values pushed
/// by someone else.
pub struct LocalReplica<L: ?Sized> {
    name: String,
    acceptor: Acceptor,
    chosen: Mutex<BTreeMap<u64, String>>,
    log: Arc<L>,
}

impl<L: Log + ?Sized> LocalReplica<L> {
    pub fn new(name: impl Into<String>, log: Arc<L>) -> Self {
        Self {
            name: name.into(),
            acceptor: Acceptor::new(),
            chosen: Mutex::new(BTreeMap::new()),
            log,
        }
    }

    pub fn acceptor(&self) -> &Acceptor {
        &self.acceptor
    }

    pub fn log(&self) -> &Arc<L> {
        &self.log
    }

    pub fn head(&self) -> u64 {
        self.log.head()
    }

    pub fn promise(&self, n: u64) -> Promise {
        self.acceptor.prepare(n)
    }

    pub fn vote(&self, n: u64, id: &str, v: &str) -> bool {
        let head = self.log.head();
        match id.parse::<ProposalId>() {
            Ok(proposal) if proposal.slot == head => self.acceptor.accept(n, v, id),
            Ok(proposal) => {
                debug!(n, slot = proposal.slot, head, "accept for another slot refused");
                false
            }
            Err(_) => {
                debug!(n, id, "accept with unrecognised id refused");
                false
            }
        }
    }

    /// Drops accepted messages made obsolete by learning proposal `id`.
    pub fn learned(&self, id: &str) {
        match id.parse::<ProposalId>() {
            Ok(learned) => {
                self.record_chosen(learned.slot, id);
                self.forget_through(learned.slot);
            }
            Err(_) => self.acceptor.set(id),
        }
    }

    /// The proposal id `slot` was learned under, if this replica saw it.
    /// Slots copied during catch-up have none.
    pub fn chosen_id(&self, slot: u64) -> Option<String> {
        self.lock_chosen().get(&slot).cloned()
    }

    fn record_chosen(&self, slot: u64, id: &str) {
        self.lock_chosen()
            .entry(slot)
            .or_insert_with(|| id.to_string());
    }

    fn lock_chosen(&self) -> std::sync::MutexGuard<'_, BTreeMap<u64, String>> {
        self.chosen.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn forget_through(&self, slot: u64) {
        self.acceptor.forget(|accepted: &AcceptMessage| {
            accepted
                .id
                .parse::<ProposalId>()
                .map_or(true, |proposal| proposal.slot <= slot)
        });
    }
}

#[async_trait]
impl<L: Log + ?Sized + 'static> Replica for LocalReplica<L> {
    fn name(&self) -> &str {
        &self.name
    }

    async fn prepare(&self, _ctx: &Context, n: u64) -> Result<Promise> {
        Ok(self.promise(n))
    }

    async fn accept(&self, _ctx: &Context, n: u64, id: &str, v: &str) -> Result<bool> {
        Ok(self.vote(n, id, v))
    }

    async fn learn(&self, ctx: &Context, slot: u64, id: &str, v: &str) -> Result<()> {
        self.log.set(ctx, slot, v).await?;
        if id.parse::<ProposalId>().is_ok_and(|proposal| proposal.slot == slot) {
            self.record_chosen(slot, id);
        }
        self.forget_through(slot);
        debug!(slot, id, "learned locally");
        Ok(())
    }

    async fn entries(&self, ctx: &Context, from: u64) -> Result<Vec<String>> {
        self.log.get(ctx, from).await
    }
}

/// A peer reached over TCP. Every call is bounded by `timeout` on top of
/// the caller's context.
#[derive(Debug, Clone)]
pub struct RemoteReplica {
    name: String,
    addr: SocketAddr,
    timeout: Duration,
}

impl RemoteReplica {
    pub fn new(addr: SocketAddr, timeout: Duration) -> Self {
        Self {
            name: addr.to_string(),
            addr,
            timeout,
        }
    }

    async fn call(&self, ctx: &Context, line: String) -> Result<String> {
        let ctx = ctx.with_timeout(self.timeout);
        let reply = ctx
            .run(async {
                let mut client = Client::connect(self.addr).await?;
                client.request(&line).await
            })
            .await??;
        Ok(reply)
    }
}

#[async_trait]
impl Replica for RemoteReplica {
    fn name(&self) -> &str {
        &self.name
    }

    async fn prepare(&self, ctx: &Context, n: u64) -> Result<Promise> {
        self.call(ctx, format!("prepare {n}")).await?.parse()
    }

    async fn accept(&self, ctx: &Context, n: u64, id: &str, v: &str) -> Result<bool> {
        let reply = self.call(ctx, format!("accept {n} {id} {v}")).await?;
        parse_flag(Some(reply.trim()))
    }

    async fn learn(&self, ctx: &Context, slot: u64, id: &str, v: &str) -> Result<()> {
        let reply = self.call(ctx, format!("set {slot} {id} {v}")).await?;
        if reply == RESPONSE_OK {
            Ok(())
        } else {
            Err(Error::Remote(format!("unexpected reply to set: {reply:?}")))
        }
    }

    async fn entries(&self, ctx: &Context, from: u64) -> Result<Vec<String>> {
        let reply = self.call(ctx, format!("get {from}")).await?;
        Ok(reply.split_whitespace().map(str::to_string).collect())
    }
}
