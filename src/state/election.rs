//! Pre-vote and leader election.

use std::collections::HashSet;
use std::time::Instant;

use tracing::{debug, info, warn};

use super::{RaftState, RoleState};
use crate::identity::StoreIdentity;
use crate::message::{RaftMessage, VoteRequest, VoteResponse};
use crate::types::MemberId;

impl RaftState {
    /// Only healthy voters that carry a store identity may stand for election.
    pub(crate) fn can_campaign(&self) -> bool {
        self.membership.current().is_voter(&self.id)
            && self.store_id.is_some()
            && self.health.is_healthy()
    }

    pub(crate) fn tick_election(&mut self, now: Instant) {
        if now < self.election_deadline {
            return;
        }
        self.reset_election_deadline(now);
        if !self.can_campaign() {
            debug!(
                "Member {} election timeout ignored (voter: {}, identified: {}, healthy: {})",
                self.id,
                self.membership.current().is_voter(&self.id),
                self.store_id.is_some(),
                self.health.is_healthy()
            );
            return;
        }
        if self.options.pre_vote {
            self.start_pre_vote(now);
        } else {
            self.start_election(now);
        }
    }

    fn vote_request(&self, term: u64) -> VoteRequest {
        let (last_log_index, last_log_term) = self.last_log();
        VoteRequest {
            term,
            candidate: self.id.clone(),
            last_log_index,
            last_log_term,
            store_id: self.store_id,
        }
    }

    fn other_voters(&self) -> Vec<MemberId> {
        self.membership
            .current_voters()
            .into_iter()
            .filter(|m| *m != self.id)
            .collect()
    }

    /// Asks the voters whether they would vote for us in the next term,
    /// without touching anyone's term.
    fn start_pre_vote(&mut self, now: Instant) {
        debug!(
            "Member {} starting pre-vote for term {}",
            self.id,
            self.current_term + 1
        );
        let mut granted = HashSet::new();
        granted.insert(self.id.clone());
        self.role = RoleState::Follower {
            leader: None,
            pre_votes: Some(granted),
        };
        let request = self.vote_request(self.current_term + 1);
        for peer in self.other_voters() {
            self.send(&peer, RaftMessage::PreVoteRequest(request.clone()));
        }
        self.check_pre_vote_quorum(now);
    }

    fn check_pre_vote_quorum(&mut self, now: Instant) {
        let won = match &self.role {
            RoleState::Follower {
                pre_votes: Some(granted),
                ..
            } => self.membership.current().has_majority(granted),
            _ => false,
        };
        if won {
            self.start_election(now);
        }
    }

    pub(crate) fn start_election(&mut self, now: Instant) {
        self.current_term += 1;
        self.voted_for = Some(self.id.clone());
        self.reset_election_deadline(now);
        if !self.persist_hard_state() {
            warn!(
                "Member {} could not persist its vote for term {}, not campaigning",
                self.id, self.current_term
            );
            return;
        }
        info!(
            "Member {} starting election for term {}",
            self.id, self.current_term
        );

        let mut votes = HashSet::new();
        votes.insert(self.id.clone());
        self.role = RoleState::Candidate { votes };
        let request = self.vote_request(self.current_term);
        for peer in self.other_voters() {
            self.send(&peer, RaftMessage::VoteRequest(request.clone()));
        }
        self.check_vote_quorum(now);
    }

    fn check_vote_quorum(&mut self, now: Instant) {
        let won = match &self.role {
            RoleState::Candidate { votes } => self.membership.current().has_majority(votes),
            _ => false,
        };
        if won {
            self.become_leader(now);
        }
    }

    pub(crate) fn is_log_up_to_date(&self, last_log_index: u64, last_log_term: u64) -> bool {
        let (index, term) = self.last_log();
        last_log_term > term || (last_log_term == term && last_log_index >= index)
    }

    /// Whether we heard from a live leader recently enough that an election
    /// would be disruptive.
    fn leader_is_alive(&self, now: Instant) -> bool {
        if self.is_leader() {
            return true;
        }
        self.last_leader_contact
            .is_some_and(|at| now.duration_since(at) < self.options.election_timeout_min)
    }

    /// With pre-vote on, a follower that still hears its leader ignores real
    /// vote requests too. A leader always yields to a higher term.
    fn rejects_disruptive_vote(&self, now: Instant) -> bool {
        self.options.pre_vote && !self.is_leader() && self.leader_is_alive(now)
    }

    fn identity_allows(&self, remote: Option<&StoreIdentity>) -> bool {
        match (self.store_id.as_ref(), remote) {
            (Some(local), Some(remote)) => local.to_bytes() == remote.to_bytes(),
            _ => true,
        }
    }

    pub(crate) fn handle_pre_vote_request(&mut self, from: MemberId, req: VoteRequest, now: Instant) {
        let vote_granted = req.term > self.current_term
            && !self.leader_is_alive(now)
            && self.is_log_up_to_date(req.last_log_index, req.last_log_term)
            && self.identity_allows(req.store_id.as_ref());
        debug!(
            "Member {} pre-vote for {} in term {}: {}",
            self.id, req.candidate, req.term, vote_granted
        );
        // a grant echoes the proposed term so the candidate can match it to its round
        let response = VoteResponse {
            term: if vote_granted { req.term } else { self.current_term },
            vote_granted,
        };
        self.send(&from, RaftMessage::PreVoteResponse(response));
    }

    pub(crate) fn handle_pre_vote_response(&mut self, from: MemberId, resp: VoteResponse, now: Instant) {
        if resp.term > self.current_term && !resp.vote_granted {
            self.become_follower(resp.term, None, now);
            return;
        }
        if !resp.vote_granted {
            return;
        }
        if resp.term != self.current_term + 1 {
            debug!(
                "Member {} ignores pre-vote from {} for term {} (proposing {})",
                self.id,
                from,
                resp.term,
                self.current_term + 1
            );
            return;
        }
        if let RoleState::Follower {
            pre_votes: Some(granted),
            ..
        } = &mut self.role
        {
            granted.insert(from);
            self.check_pre_vote_quorum(now);
        }
    }

    pub(crate) fn handle_vote_request(&mut self, from: MemberId, req: VoteRequest, now: Instant) {
        if req.term > self.current_term && self.rejects_disruptive_vote(now) {
            debug!(
                "Member {} ignores vote request from {} for term {}: leader is alive",
                self.id, req.candidate, req.term
            );
            let response = VoteResponse {
                term: self.current_term,
                vote_granted: false,
            };
            self.send(&from, RaftMessage::VoteResponse(response));
            return;
        }
        if req.term > self.current_term {
            self.become_follower(req.term, None, now);
        }

        let mut vote_granted = req.term == self.current_term
            && self
                .voted_for
                .as_ref()
                .is_none_or(|voted| *voted == req.candidate)
            && self.is_log_up_to_date(req.last_log_index, req.last_log_term)
            && self.identity_allows(req.store_id.as_ref());
        if vote_granted {
            self.voted_for = Some(req.candidate.clone());
            if self.persist_hard_state() {
                self.reset_election_deadline(now);
            } else {
                vote_granted = false;
            }
        }
        info!(
            "Member {} {} vote to {} for term {}",
            self.id,
            if vote_granted { "granted" } else { "denied" },
            req.candidate,
            req.term
        );
        let response = VoteResponse {
            term: self.current_term,
            vote_granted,
        };
        self.send(&from, RaftMessage::VoteResponse(response));
    }

    pub(crate) fn handle_vote_response(&mut self, from: MemberId, resp: VoteResponse, now: Instant) {
        if resp.term > self.current_term {
            self.become_follower(resp.term, None, now);
            return;
        }
        if resp.term < self.current_term || !resp.vote_granted {
            return;
        }
        if let RoleState::Candidate { votes } = &mut self.role {
            votes.insert(from);
            self.check_vote_quorum(now);
        }
    }
}
