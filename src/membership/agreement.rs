//! Cloud agreement: lock, propose, accept, commit.
//!
//! The lowest `NodeId` in a node's live view acts as proposer. A member accepts
//! a ballot only if it is not older than anything it already promised and the
//! proposed member set matches its own live view. Accepting locks the member's
//! cloud (unsettled) until the commit arrives. This type holds no sockets so
//! the whole exchange can be driven directly from tests.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::time::{Duration, Instant};

use super::types::{Node, NodeId};

/// Ballots order by round first, then by proposer id.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Ballot {
    pub round: u64,
    pub proposer: NodeId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Proposal {
    pub ballot: Ballot,
    /// Version the cloud will carry once committed.
    pub version: u64,
    pub members: Vec<Node>,
}

impl Proposal {
    pub fn member_ids(&self) -> Vec<NodeId> {
        let mut ids: Vec<NodeId> = self.members.iter().map(|n| n.id.clone()).collect();
        ids.sort();
        ids
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Vote {
    Accept { ballot: Ballot, from: NodeId },
    Reject { ballot: Ballot, from: NodeId, promised: Option<Ballot> },
}

struct Pending {
    proposal: Proposal,
    accepted: HashSet<NodeId>,
    started: Instant,
}

pub struct Agreement {
    local: NodeId,
    next_round: u64,
    promised: Option<(Ballot, Instant)>,
    pending: Option<Pending>,
}

impl Agreement {
    pub fn new(local: NodeId) -> Self {
        Self {
            local,
            next_round: 1,
            promised: None,
            pending: None,
        }
    }

    pub fn is_proposing(&self) -> bool {
        self.pending.is_some()
    }

    /// The node that should drive agreement for a given view.
    pub fn leader_of(view: &[NodeId]) -> Option<&NodeId> {
        view.iter().min()
    }

    /// Opens a new ballot for `members`. Any earlier pending proposal is dropped.
    pub fn propose(&mut self, members: Vec<Node>, version: u64) -> Proposal {
        if let Some((promised, _)) = &self.promised {
            self.next_round = self.next_round.max(promised.round + 1);
        }
        let ballot = Ballot {
            round: self.next_round,
            proposer: self.local.clone(),
        };
        self.next_round += 1;

        let proposal = Proposal {
            ballot,
            version,
            members,
        };
        self.pending = Some(Pending {
            proposal: proposal.clone(),
            accepted: HashSet::new(),
            started: Instant::now(),
        });
        proposal
    }

    /// Member side: promise and accept, or reject with the current promise.
    pub fn on_propose(&mut self, proposal: &Proposal, local_view: &[NodeId]) -> Vote {
        let stale = self
            .promised
            .as_ref()
            .map(|(b, _)| proposal.ballot < *b)
            .unwrap_or(false);

        let mut view = local_view.to_vec();
        view.sort();
        view.dedup();

        if stale || view != proposal.member_ids() {
            return Vote::Reject {
                ballot: proposal.ballot.clone(),
                from: self.local.clone(),
                promised: self.promised.as_ref().map(|(b, _)| b.clone()),
            };
        }

        self.promised = Some((proposal.ballot.clone(), Instant::now()));
        self.next_round = self.next_round.max(proposal.ballot.round + 1);
        Vote::Accept {
            ballot: proposal.ballot.clone(),
            from: self.local.clone(),
        }
    }

    /// Proposer side: returns the proposal to commit once every member accepted.
    pub fn on_vote(&mut self, vote: Vote) -> Option<Proposal> {
        let pending = self.pending.as_mut()?;
        match vote {
            Vote::Accept { ballot, from } => {
                if ballot != pending.proposal.ballot {
                    return None;
                }
                pending.accepted.insert(from);
                let all = pending
                    .proposal
                    .members
                    .iter()
                    .all(|m| pending.accepted.contains(&m.id));
                if all {
                    let done = self.pending.take().map(|p| p.proposal);
                    return done;
                }
                None
            }
            Vote::Reject {
                ballot, promised, ..
            } => {
                if ballot != pending.proposal.ballot {
                    return None;
                }
                if let Some(p) = promised {
                    self.next_round = self.next_round.max(p.round + 1);
                }
                // A rejected ballot is abandoned; the next tick re-proposes.
                self.pending = None;
                None
            }
        }
    }

    /// Returns true if the commit should be applied (it is not older than our promise).
    pub fn on_commit(&mut self, proposal: &Proposal) -> bool {
        let apply = match &self.promised {
            Some((b, _)) => proposal.ballot >= *b,
            None => true,
        };
        if apply {
            self.promised = None;
        }
        apply
    }

    /// Drops promises and proposals older than `timeout`. Returns true if a
    /// promise expired, i.e. the local cloud was left unsettled.
    pub fn expire(&mut self, timeout: Duration) -> bool {
        let now = Instant::now();
        if let Some(p) = &self.pending {
            if now.duration_since(p.started) > timeout {
                tracing::debug!("Proposal {:?} timed out", p.proposal.ballot);
                self.pending = None;
            }
        }
        if let Some((b, at)) = &self.promised {
            if now.duration_since(*at) > timeout {
                tracing::debug!("Promise for {:?} expired without commit", b);
                self.promised = None;
                return true;
            }
        }
        false
    }
}
