//! Single-decree Paxos per log slot.
//!
//! - [`acceptor`] holds the promised number and the last accepted value.
//! - [`proposer`] drives prepare, accept and learn across a quorum.
//! - [`replica`] abstracts over the local acceptor and remote peers.
//! - [`node`] ties them together behind the [`crate::handler::Paxos`] trait.

pub mod acceptor;
pub mod node;
pub mod proposer;
pub mod replica;

use std::{fmt, str::FromStr};

use serde::Serialize;

use crate::error::{Error, Result};

/// A value accepted under proposal number `n`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AcceptMessage {
    pub n: u64,
    pub id: String,
    pub v: String,
}

impl AcceptMessage {
    pub fn new(n: u64, id: impl Into<String>, v: impl Into<String>) -> Self {
        Self {
            n,
            id: id.into(),
            v: v.into(),
        }
    }
}

/// Answer to a phase 1 `prepare`.
///
/// On the wire this is `true`, or `false <promised>` carrying the number the
/// acceptor already promised, optionally followed by `<n> <id> <v>` of the
/// highest message the acceptor has accepted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Promise {
    pub promised: bool,
    /// On refusal, the number that outranked the prepare.
    pub highest: Option<u64>,
    pub accepted: Option<AcceptMessage>,
}

impl Promise {
    pub fn granted(accepted: Option<AcceptMessage>) -> Self {
        Self {
            promised: true,
            highest: None,
            accepted,
        }
    }

    pub fn refused(highest: u64, accepted: Option<AcceptMessage>) -> Self {
        Self {
            promised: false,
            highest: Some(highest),
            accepted,
        }
    }
}

impl fmt::Display for Promise {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.promised)?;
        if let Some(highest) = self.highest {
            write!(f, " {highest}")?;
        }
        if let Some(AcceptMessage { n, id, v }) = &self.accepted {
            write!(f, " {n} {id} {v}")?;
        }
        Ok(())
    }
}

impl FromStr for Promise {
    type Err = Error;

    fn from_str(line: &str) -> Result<Self> {
        let parts: Vec<&str> = line.split_whitespace().collect();
        let promised = parse_flag(parts.first().copied())?;
        let (highest, accepted) = match parts.as_slice() {
            [_] => (None, None),
            [_, highest] => (Some(parse_int(highest)?), None),
            [_, n, id, v] => (None, Some(AcceptMessage::new(parse_int(n)?, *id, *v))),
            [_, highest, n, id, v] => (
                Some(parse_int(highest)?),
                Some(AcceptMessage::new(parse_int(n)?, *id, *v)),
            ),
            _ => return Err(Error::Remote(format!("malformed promise {line:?}"))),
        };
        Ok(Self {
            promised,
            highest,
            accepted,
        })
    }
}

pub(crate) fn parse_flag(token: Option<&str>) -> Result<bool> {
    match token {
        Some("true") => Ok(true),
        Some("false") => Ok(false),
        other => Err(Error::Remote(format!("expected true or false, got {other:?}"))),
    }
}

/// Numbers inside peer replies and proposal ids. A bad one is the peer's
/// fault, not the client's.
fn parse_int(token: &str) -> Result<u64> {
    token
        .parse()
        .map_err(|err| Error::Remote(format!("bad number {token:?}: {err}")))
}

/// Identity of a proposal: the log slot it targets, the proposer that made
/// it and its proposal number. Rendered as `<slot>.<proposer>.<n>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProposalId {
    pub slot: u64,
    pub proposer: String,
    pub n: u64,
}

impl fmt::Display for ProposalId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.slot, self.proposer, self.n)
    }
}

impl FromStr for ProposalId {
    type Err = Error;

    fn from_str(id: &str) -> Result<Self> {
        let malformed = || Error::Remote(format!("malformed proposal id {id:?}"));
        let (slot, rest) = id.split_once('.').ok_or_else(malformed)?;
        let (proposer, n) = rest.rsplit_once('.').ok_or_else(malformed)?;
        Ok(Self {
            slot: parse_int(slot)?,
            proposer: proposer.to_string(),
            n: parse_int(n)?,
        })
    }
}

/// Liveness and role report returned by `status`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NodeStatus {
    pub name: String,
    pub replicas: usize,
    pub quorum: usize,
    pub promised: Option<u64>,
    pub accepted: Option<AcceptMessage>,
    pub head: u64,
}
