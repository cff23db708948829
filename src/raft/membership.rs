//! Membership change planning.
//!
//! A join is idempotent for an exact `(id, addr)` voter. Otherwise any member that
//! holds the id under another address, or the address under another id, is removed
//! before the node is re-added as a learner and promoted.

use std::collections::BTreeSet;

use openraft::{BasicNode, Membership};

use super::types::NodeId;

/// Steps the leader takes to admit a node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JoinPlan {
    /// Already a voter at this address.
    AlreadyMember,
    /// Remove stale entries, then add as learner and promote.
    Admit {
        /// Stale voters to drop.
        remove_voters: BTreeSet<NodeId>,
        /// Stale learners to drop.
        remove_learners: BTreeSet<NodeId>,
    },
}

/// Steps the leader takes to remove a node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LeavePlan {
    /// Not in the membership; nothing to do.
    NotMember,
    /// Drop the voter, then its node entry.
    RemoveVoter,
    /// Drop the learner.
    RemoveLearner,
}

/// Decides how to admit `node_id` at `addr`, evicting entries that share either
/// the id or the address with a different partner.
pub fn plan_join(membership: &Membership<NodeId, BasicNode>, node_id: NodeId, addr: &str) -> JoinPlan {
    let voters: BTreeSet<NodeId> = membership.voter_ids().collect();
    let current = membership.get_node(&node_id);
    if voters.contains(&node_id) && current.is_some_and(|node| node.addr == addr) {
        return JoinPlan::AlreadyMember;
    }

    let mut remove_voters = BTreeSet::new();
    let mut remove_learners = BTreeSet::new();
    for (id, node) in membership.nodes() {
        let stale = if *id == node_id {
            node.addr != addr
        } else {
            node.addr == addr
        };
        if !stale {
            continue;
        }
        if voters.contains(id) {
            remove_voters.insert(*id);
        } else {
            remove_learners.insert(*id);
        }
    }
    JoinPlan::Admit {
        remove_voters,
        remove_learners,
    }
}

/// Decides how to remove `node_id`.
pub fn plan_leave(membership: &Membership<NodeId, BasicNode>, node_id: NodeId) -> LeavePlan {
    if membership.voter_ids().any(|id| id == node_id) {
        LeavePlan::RemoveVoter
    } else if membership.get_node(&node_id).is_some() {
        LeavePlan::RemoveLearner
    } else {
        LeavePlan::NotMember
    }
}
