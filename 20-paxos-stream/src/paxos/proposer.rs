//! Proposer side of the protocol: the `commit` orchestration.
//!
//! One round targets the slot right after the local head:
//!
//! 1. catch up on slots other replicas have already learned,
//! 2. `prepare n` on every replica and wait for a majority of promises,
//! 3. adopt the highest-numbered value already accepted for the slot, if any,
//! 4. `accept n id v` on every replica and wait for a majority of votes,
//! 5. `set slot id v` on every replica.
//!
//! When the slot went to an adopted value the proposer moves on to the next
//! slot with its own value. Failed rounds are retried with a higher proposal
//! number after a jittered pause, up to `max_rounds` attempts in total.

use std::{
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use futures::future::join_all;
use rand::Rng;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use super::{
    AcceptMessage, Promise, ProposalId,
    replica::{LocalReplica, Replica},
};
use crate::{
    context::Context,
    error::{Error, Result},
    handler::Log,
};

#[derive(Debug, Clone)]
pub struct ProposerOptions {
    /// Agreement rounds `commit` may run before giving up.
    pub max_rounds: usize,
    /// Base pause between failed rounds; up to the same amount again is
    /// added as jitter.
    pub backoff: Duration,
}

impl Default for ProposerOptions {
    fn default() -> Self {
        Self {
            max_rounds: 8,
            backoff: Duration::from_millis(25),
        }
    }
}

struct Chosen {
    message: AcceptMessage,
    ours: bool,
}

pub struct Proposer<L: ?Sized> {
    local: Arc<LocalReplica<L>>,
    replicas: Vec<Arc<dyn Replica>>,
    rank: u64,
    last: AtomicU64,
    options: ProposerOptions,
}

impl<L: Log + ?Sized + 'static> Proposer<L> {
    /// `peers` are the other members of the cluster. Every member must be
    /// configured with the same set of names so ranks are unique.
    pub fn new(
        local: Arc<LocalReplica<L>>,
        peers: Vec<Arc<dyn Replica>>,
        options: ProposerOptions,
    ) -> Self {
        let mut replicas: Vec<Arc<dyn Replica>> = Vec::with_capacity(peers.len() + 1);
        replicas.push(Arc::clone(&local) as Arc<dyn Replica>);
        replicas.extend(peers);

        let mut names: Vec<&str> = replicas.iter().map(|replica| replica.name()).collect();
        names.sort_unstable();
        let rank = names
            .iter()
            .position(|name| *name == local.name())
            .unwrap_or_default() as u64;

        Self {
            local,
            replicas,
            rank,
            last: AtomicU64::new(0),
            options,
        }
    }

    pub fn replicas(&self) -> usize {
        self.replicas.len()
    }

    pub fn quorum(&self) -> usize {
        self.replicas.len() / 2 + 1
    }

    /// Runs rounds until `v` is chosen for some slot.
    ///
    /// Returns every message chosen along the way; the last one carries
    /// `v`. Rounds in which another proposal wins the slot move on to the
    /// next slot. Gives up with [`Error::NoQuorum`] after `max_rounds`
    /// rounds without a quorum.
    pub async fn commit(&self, ctx: &Context, v: &str) -> Result<Vec<AcceptMessage>> {
        let mut chosen = Vec::new();
        let mut proposed = Vec::new();
        let mut failures = 0;

        loop {
            if ctx.is_cancelled() {
                return Err(Error::Cancelled);
            }

            let slot = self.catch_up(ctx).await?;
            if let Some(message) = self.chosen_elsewhere(&proposed, slot, v) {
                debug!(id = %message.id, "proposal chosen by another proposer");
                chosen.push(message);
                return Ok(chosen);
            }

            let n = self.next_number();
            match self.round(ctx, slot, n, v, &mut proposed).await {
                Ok(Chosen { message, ours }) => {
                    chosen.push(message);
                    if ours {
                        return Ok(chosen);
                    }
                    debug!(slot, "slot went to another proposal");
                }
                Err(Error::NoQuorum { reason }) => {
                    failures += 1;
                    debug!(slot, n, failures, %reason, "round failed");
                    if failures >= self.options.max_rounds {
                        warn!(failures, %reason, "giving up on commit");
                        return Err(Error::NoQuorum {
                            reason: format!("{reason}; gave up after {failures} failed rounds"),
                        });
                    }
                    self.back_off(ctx).await?;
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// One prepare/accept/learn pass over `slot` with number `n`.
    ///
    /// `proposed` collects every id `v` has been sent out under during this
    /// commit. An adopted message keeps its original id, so a value is only
    /// ours when that id is one of them.
    async fn round(
        &self,
        ctx: &Context,
        slot: u64,
        n: u64,
        v: &str,
        proposed: &mut Vec<ProposalId>,
    ) -> Result<Chosen> {
        let quorum = self.quorum();

        let replies = join_all(self.replicas.iter().map(|replica| replica.prepare(ctx, n))).await;
        let mut promises: Vec<Promise> = Vec::with_capacity(replies.len());
        for (replica, reply) in self.replicas.iter().zip(replies) {
            match reply {
                Ok(promise) if promise.promised => promises.push(promise),
                Ok(refusal) => {
                    if let Some(highest) = refusal.highest {
                        self.last.fetch_max(highest, Ordering::SeqCst);
                    }
                }
                Err(err) => debug!(replica = replica.name(), n, error = %err, "prepare failed"),
            }
        }
        if promises.len() < quorum {
            return Err(Error::NoQuorum {
                reason: format!(
                    "prepare {n} promised by {}/{} replicas",
                    promises.len(),
                    self.replicas.len()
                ),
            });
        }

        let adopted = promises
            .into_iter()
            .filter_map(|promise| promise.accepted)
            .filter(|accepted| {
                accepted
                    .id
                    .parse::<ProposalId>()
                    .is_ok_and(|proposal| proposal.slot == slot)
            })
            .max_by_key(|accepted| accepted.n);
        let (id, value, ours) = match adopted {
            Some(accepted) => {
                let ours = proposed
                    .iter()
                    .any(|proposal| proposal.to_string() == accepted.id);
                (accepted.id, accepted.v, ours)
            }
            None => {
                let proposal = ProposalId {
                    slot,
                    proposer: self.local.name().to_string(),
                    n,
                };
                let id = proposal.to_string();
                proposed.push(proposal);
                (id, v.to_string(), true)
            }
        };

        let votes = join_all(
            self.replicas
                .iter()
                .map(|replica| replica.accept(ctx, n, &id, &value)),
        )
        .await;
        let granted = votes.iter().filter(|vote| matches!(vote, Ok(true))).count();
        if granted < quorum {
            return Err(Error::NoQuorum {
                reason: format!(
                    "accept {n} granted by {granted}/{} replicas",
                    self.replicas.len()
                ),
            });
        }

        let learned = join_all(
            self.replicas
                .iter()
                .map(|replica| replica.learn(ctx, slot, &id, &value)),
        )
        .await;
        for (replica, result) in self.replicas.iter().zip(learned) {
            if let Err(err) = result {
                warn!(replica = replica.name(), slot, error = %err, "learn failed");
            }
        }

        info!(slot, n, %id, ours, "slot chosen");
        Ok(Chosen {
            message: AcceptMessage::new(n, id, value),
            ours,
        })
    }

    /// A failed round may leave `v` accepted by a minority, and a later
    /// proposer may adopt it and get it chosen. Finds a slot learned under
    /// one of our own ids so `v` is not appended twice.
    ///
    /// Slots copied during catch-up carry no id, so a proposal chosen while
    /// this replica was unreachable is not recognised and `v` is proposed
    /// again.
    fn chosen_elsewhere(
        &self,
        proposed: &[ProposalId],
        head: u64,
        v: &str,
    ) -> Option<AcceptMessage> {
        proposed
            .iter()
            .filter(|proposal| proposal.slot < head)
            .find_map(|proposal| {
                let id = proposal.to_string();
                let learned = self.local.chosen_id(proposal.slot)?;
                (learned == id).then(|| AcceptMessage::new(proposal.n, id, v))
            })
    }

    /// Copies values other replicas have learned beyond the local head and
    /// returns the new head.
    async fn catch_up(&self, ctx: &Context) -> Result<u64> {
        let head = self.local.head();
        let fetched = join_all(
            self.replicas
                .iter()
                .map(|replica| replica.entries(ctx, head)),
        )
        .await;
        let longest = fetched
            .into_iter()
            .filter_map(Result::ok)
            .max_by_key(Vec::len)
            .unwrap_or_default();

        if !longest.is_empty() {
            debug!(from = head, count = longest.len(), "catching up");
        }
        for (slot, v) in (head..).zip(&longest) {
            self.local.learn(ctx, slot, "catch-up", v).await?;
        }
        Ok(self.local.head())
    }

    /// Next proposal number above our last one, the highest number any
    /// refusal reported and the local acceptor's promise. Numbers are
    /// congruent to the rank modulo the cluster size, so no two proposers
    /// share one.
    fn next_number(&self) -> u64 {
        let size = self.replicas.len() as u64;
        let floor = self.local.acceptor().promised().unwrap_or_default();
        let above = |base: u64| (base / size + 1) * size + self.rank;
        let previous = self
            .last
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |last| {
                Some(above(last.max(floor)))
            })
            .unwrap_or_else(|last| last);
        above(previous.max(floor))
    }

    async fn back_off(&self, ctx: &Context) -> Result<()> {
        let base = self.options.backoff;
        let jitter = {
            let max = u64::try_from(base.as_millis()).unwrap_or(u64::MAX);
            Duration::from_millis(rand::thread_rng().gen_range(0..=max))
        };
        ctx.run(sleep(base + jitter)).await
    }
}
