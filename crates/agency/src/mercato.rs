//! Mercato: quorum-gated roster decisions.
//!
//! A request starts `Pending` and ends `Approved` or `Rejected`; both are
//! terminal. Quorum is evaluated after every vote against the members present
//! at that moment, and an approval carries its roster change in the same event
//! batch as the status flip.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use studio_core::{RequestId, StudentId};

use crate::rules::GameRules;
use crate::student::Student;

/// What the request asks for. Each variant carries the fields it needs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RequestKind {
    /// The candidate is named only; their record comes from their current roster.
    Hire { student_id: StudentId },
    Fire { student_id: StudentId },
    FoundAgency { founder_id: StudentId, agency_name: String },
}

impl RequestKind {
    /// The student whose position the request changes.
    pub fn subject(&self) -> StudentId {
        match self {
            RequestKind::Hire { student_id } => *student_id,
            RequestKind::Fire { student_id } => *student_id,
            RequestKind::FoundAgency { founder_id, .. } => *founder_id,
        }
    }

    pub fn quorum_pct(&self, rules: &GameRules) -> u32 {
        match self {
            RequestKind::Hire { .. } => rules.hire_quorum_pct,
            RequestKind::Fire { .. } => rules.fire_quorum_pct,
            RequestKind::FoundAgency { .. } => rules.found_agency_quorum_pct,
        }
    }

    /// Whether the subject is excluded from voting on this request.
    fn excludes_subject(&self) -> bool {
        !matches!(self, RequestKind::Hire { .. })
    }

    pub fn name(&self) -> &'static str {
        match self {
            RequestKind::Hire { .. } => "hire",
            RequestKind::Fire { .. } => "fire",
            RequestKind::FoundAgency { .. } => "found_agency",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RequestStatus {
    Pending,
    Approved,
    Rejected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Vote {
    Approve,
    Reject,
}

/// Final outcome chosen by a teacher override.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Decision {
    Approve,
    Reject,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionReason {
    QuorumReached,
    QuorumUnreachable,
    AdminOverride,
    /// The subject left the agency through another decision.
    SubjectLeft,
    /// The hire candidate is not on any agency roster.
    CandidateUnavailable,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MercatoRequest {
    pub id: RequestId,
    pub requester_id: StudentId,
    pub kind: RequestKind,
    pub status: RequestStatus,
    pub votes: BTreeMap<StudentId, Vote>,
    pub opened_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
}

impl MercatoRequest {
    pub fn pending(
        id: RequestId,
        requester_id: StudentId,
        kind: RequestKind,
        opened_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            requester_id,
            kind,
            status: RequestStatus::Pending,
            votes: BTreeMap::new(),
            opened_at,
            resolved_at: None,
        }
    }

    pub fn is_pending(&self) -> bool {
        self.status == RequestStatus::Pending
    }

    pub fn is_eligible(&self, voter: StudentId, members: &[Student]) -> bool {
        members.iter().any(|m| m.id == voter)
            && !(self.kind.excludes_subject() && self.kind.subject() == voter)
    }

    pub fn eligible_voters(&self, members: &[Student]) -> Vec<StudentId> {
        members
            .iter()
            .map(|m| m.id)
            .filter(|id| self.is_eligible(*id, members))
            .collect()
    }

    /// Count the ballots of currently eligible voters.
    pub fn tally(&self, members: &[Student], rules: &GameRules) -> Tally {
        let eligible = self.eligible_voters(members);
        let mut approvals = 0;
        let mut rejections = 0;
        for voter in &eligible {
            match self.votes.get(voter) {
                Some(Vote::Approve) => approvals += 1,
                Some(Vote::Reject) => rejections += 1,
                None => {}
            }
        }
        Tally::new(eligible.len(), approvals, rejections, self.kind.quorum_pct(rules))
    }
}

/// Ballot count for one request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Tally {
    /// Real number of eligible voters (may be zero).
    pub voters: usize,
    pub approvals: usize,
    pub rejections: usize,
    /// Approvals needed; computed against `max(1, voters)`.
    pub needed: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Pending,
    Approved,
    Rejected,
}

impl Tally {
    pub fn new(voters: usize, approvals: usize, rejections: usize, quorum_pct: u32) -> Self {
        Self {
            voters,
            approvals,
            rejections,
            needed: required_approvals(voters, quorum_pct),
        }
    }

    pub fn outstanding(&self) -> usize {
        self.voters.saturating_sub(self.approvals + self.rejections)
    }

    pub fn verdict(&self) -> Verdict {
        if self.approvals >= self.needed {
            Verdict::Approved
        } else if self.approvals + self.outstanding() < self.needed {
            Verdict::Rejected
        } else {
            Verdict::Pending
        }
    }
}

/// Smallest approval count whose share of `max(1, voters)` reaches `quorum_pct`.
///
/// Integer form of `approvals / eligible >= pct / 100`.
pub fn required_approvals(voters: usize, quorum_pct: u32) -> usize {
    let eligible = voters.max(1);
    (quorum_pct as usize * eligible).div_ceil(100)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roster(n: usize) -> Vec<Student> {
        (0..n)
            .map(|i| Student::new(StudentId::new(), format!("m{i}"), 50, 0))
            .collect()
    }

    fn fire(target: StudentId, requester: StudentId) -> MercatoRequest {
        MercatoRequest::pending(
            RequestId::new(),
            requester,
            RequestKind::Fire { student_id: target },
            Utc::now(),
        )
    }

    #[test]
    fn fire_excludes_target_from_the_electorate() {
        let members = roster(4);
        let req = fire(members[0].id, members[1].id);
        let voters = req.eligible_voters(&members);
        assert_eq!(voters.len(), 3);
        assert!(!voters.contains(&members[0].id));
    }

    #[test]
    fn hire_lets_everyone_vote() {
        let members = roster(3);
        let req = MercatoRequest::pending(
            RequestId::new(),
            members[0].id,
            RequestKind::Hire {
                student_id: StudentId::new(),
            },
            Utc::now(),
        );
        assert_eq!(req.eligible_voters(&members).len(), 3);
        // Two thirds clears the 66% bar.
        assert_eq!(required_approvals(3, 66), 2);
    }

    #[test]
    fn fire_quorum_boundary() {
        // 5 members, target excluded: 4 voters, needs ceil(0.75 * 4) = 3.
        let members = roster(5);
        let rules = GameRules::default();
        let mut req = fire(members[0].id, members[1].id);

        req.votes.insert(members[1].id, Vote::Approve);
        req.votes.insert(members[2].id, Vote::Approve);
        assert_eq!(req.tally(&members, &rules).verdict(), Verdict::Pending);

        req.votes.insert(members[3].id, Vote::Approve);
        assert_eq!(req.tally(&members, &rules).verdict(), Verdict::Approved);
    }

    #[test]
    fn rejects_once_quorum_is_out_of_reach() {
        let members = roster(5);
        let rules = GameRules::default();
        let mut req = fire(members[0].id, members[1].id);
        req.votes.insert(members[1].id, Vote::Reject);
        assert_eq!(req.tally(&members, &rules).verdict(), Verdict::Pending);
        req.votes.insert(members[2].id, Vote::Reject);
        assert_eq!(req.tally(&members, &rules).verdict(), Verdict::Rejected);
    }

    #[test]
    fn empty_electorate_floors_denominator_at_one() {
        let members = roster(1);
        let req = fire(members[0].id, members[0].id);
        let tally = req.tally(&members, &GameRules::default());
        assert_eq!(tally.voters, 0);
        assert_eq!(tally.needed, 1);
    }

    #[test]
    fn votes_from_departed_members_do_not_count() {
        let mut members = roster(4);
        let rules = GameRules::default();
        let mut req = fire(members[0].id, members[1].id);
        req.votes.insert(members[3].id, Vote::Approve);
        members.pop();
        assert_eq!(req.tally(&members, &rules).approvals, 0);
    }

    #[test]
    fn departure_can_bring_a_request_to_quorum() {
        // Fire m0 with m1..m3 voting: 3 of 3 needed, two approvals so far.
        let mut members = roster(4);
        let rules = GameRules::default();
        let mut req = fire(members[0].id, members[1].id);
        req.votes.insert(members[1].id, Vote::Approve);
        req.votes.insert(members[2].id, Vote::Approve);
        assert_eq!(req.tally(&members, &rules).verdict(), Verdict::Pending);

        members.pop();
        assert_eq!(req.tally(&members, &rules).verdict(), Verdict::Approved);
    }

    #[test]
    fn hire_names_the_candidate_by_id_only() {
        let kind = RequestKind::Hire {
            student_id: StudentId::new(),
        };
        let json = serde_json::to_value(&kind).unwrap();
        assert_eq!(json["type"], "HIRE");
        assert!(json.get("candidate").is_none());
    }

    #[test]
    fn request_kind_serializes_with_type_tag() {
        let kind = RequestKind::Fire {
            student_id: StudentId::new(),
        };
        let json = serde_json::to_value(&kind).unwrap();
        assert_eq!(json["type"], "FIRE");
    }
}
