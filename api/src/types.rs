use alloy::primitives::U256;
use chrono::{DateTime, Utc};
use lifecycle::{Bid, BidStatus, Job, NewJob, Outcome, UserId, Verdict};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateJobRequest {
    pub title: String,
    pub description: String,
    /// Wei.
    pub budget: U256,
    pub deadline: DateTime<Utc>,
    pub category: String,
    #[serde(default)]
    pub skills: Vec<String>,
}

impl CreateJobRequest {
    pub fn into_new_job(self, client_id: UserId) -> NewJob {
        NewJob {
            client_id,
            title: self.title,
            description: self.description,
            budget: self.budget,
            deadline: self.deadline,
            category: self.category,
            skills: self
                .skills
                .into_iter()
                .map(|s| s.trim().to_lowercase())
                .filter(|s| !s.is_empty())
                .collect::<BTreeSet<_>>(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandStatus {
    Committed,
    /// The ledger has not confirmed yet; the job updates on its own.
    Pending,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandResponse {
    pub status: CommandStatus,
    pub job: Job,
}

impl From<Outcome> for CommandResponse {
    fn from(outcome: Outcome) -> Self {
        match outcome {
            Outcome::Committed(job) => Self {
                status: CommandStatus::Committed,
                job,
            },
            Outcome::Pending(job) => Self {
                status: CommandStatus::Pending,
                job,
            },
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BidView {
    pub bid: Bid,
    pub status: BidStatus,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconcileResponse {
    pub verdict: String,
    pub job: Option<Job>,
}

impl From<Verdict> for ReconcileResponse {
    fn from(verdict: Verdict) -> Self {
        Self {
            verdict: verdict.label().to_string(),
            job: verdict.job().cloned(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lifecycle::test_utils::fixture_open_job_with_bids;
    use serde_json::json;

    #[test]
    fn skills_are_normalised_into_a_set() {
        let request: CreateJobRequest = serde_json::from_value(json!({
            "title": "Audit",
            "description": "Review the escrow contract",
            "budget": "0x1bc16d674ec80000",
            "deadline": "2030-01-01T00:00:00Z",
            "category": "security",
            "skills": ["Solidity", " solidity ", "", "Rust"],
        }))
        .unwrap();
        let job = request.into_new_job("client".into());
        assert_eq!(job.budget, U256::from(2_000_000_000_000_000_000u128));
        assert_eq!(
            job.skills.into_iter().collect::<Vec<_>>(),
            vec!["rust".to_string(), "solidity".to_string()]
        );
    }

    #[test]
    fn pending_outcomes_are_flagged_on_the_wire() {
        let job = fixture_open_job_with_bids(&["f1"]);
        let response = CommandResponse::from(Outcome::Pending(job));
        let value = serde_json::to_value(&response).unwrap();
        assert_eq!(value["status"], "pending");
        assert_eq!(value["job"]["status"], "OPEN");
    }
}
