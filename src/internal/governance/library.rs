use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use crate::internal::ledger::store::{Ledger, LedgerError, TxContext};

const FUNCTION_PREFIX: &str = "libfn/";
const PARTICIPANT_PREFIX: &str = "participant/";

fn function_key(name: &str) -> String {
    format!("{}{}", FUNCTION_PREFIX, name)
}

/// Names become ledger keys and a URL path segment, so they must be non-empty and free of `/`.
fn is_valid_name(name: &str) -> bool {
    !name.is_empty() && !name.contains('/')
}

fn participant_key(identity: &str) -> String {
    format!("{}{}", PARTICIPANT_PREFIX, identity)
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ProposalStatus {
    Pending,
    Accepted,
    Rejected,
}

impl fmt::Display for ProposalStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ProposalStatus::Pending => "Pending",
            ProposalStatus::Accepted => "Accepted",
            ProposalStatus::Rejected => "Rejected",
        };
        f.write_str(label)
    }
}

/// An organization that takes part in library votes.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Participant {
    pub identity: String,
    pub joined_at: DateTime<Utc>,
}

/// A proposed shared-library function and its ballot.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LibraryFunction {
    pub name: String,
    pub source_body: String,
    pub proposed_at: DateTime<Utc>,
    pub proposed_by: String,
    pub status: ProposalStatus,
    /// Fixed at proposal time to the participants known then.
    pub votes: BTreeMap<String, bool>,
    pub accepted_at: Option<DateTime<Utc>>,
}

impl LibraryFunction {
    /// Unanimous approval by a non-empty ballot.
    pub fn has_unanimous_approval(&self) -> bool {
        !self.votes.is_empty() && self.votes.values().all(|approved| *approved)
    }

    fn apply_vote(&mut self, identity: &str, approve: bool, at: DateTime<Utc>) -> Result<(), GovernanceError> {
        if self.status == ProposalStatus::Rejected {
            return Err(GovernanceError::AlreadyRejected(self.name.clone()));
        }
        if !self.votes.contains_key(identity) {
            return Err(GovernanceError::NotOnBallot {
                name: self.name.clone(),
                identity: identity.to_string(),
            });
        }
        if self.status == ProposalStatus::Accepted {
            return Ok(());
        }

        if approve {
            self.votes.insert(identity.to_string(), true);
            if self.has_unanimous_approval() {
                self.status = ProposalStatus::Accepted;
                self.accepted_at = Some(at);
            }
        } else {
            self.status = ProposalStatus::Rejected;
        }
        Ok(())
    }
}

/// Outcome of a vote, as recorded on the ledger.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct VoteOutcome {
    pub name: String,
    pub status: ProposalStatus,
    pub accepted_at: Option<DateTime<Utc>>,
}

/// Unanimous-consent governance over the shared function library.
#[derive(Clone)]
pub struct LibraryGovernance {
    ledger: Ledger,
}

impl LibraryGovernance {
    pub fn new(ledger: Ledger) -> Self {
        Self { ledger }
    }

    /// Adds the caller to the participant set. Joining twice keeps the first record.
    #[tracing::instrument(skip(self))]
    pub async fn register_participant(&self, identity: &str) -> Result<Participant, GovernanceError> {
        let mut tx = self.ledger.begin(identity);
        let key = participant_key(identity);
        if let Some(existing) = tx.get_json::<Participant>(&key).await? {
            return Ok(existing);
        }

        let participant = Participant {
            identity: identity.to_string(),
            joined_at: tx.tx_timestamp(),
        };
        tx.put_json(&key, &participant)?;
        tx.commit().await?;

        tracing::info!(%identity, "participant joined");
        Ok(participant)
    }

    pub async fn list_participants(&self, caller: &str) -> Result<Vec<Participant>, GovernanceError> {
        let mut tx = self.ledger.begin(caller);
        Ok(tx.scan_json(PARTICIPANT_PREFIX).await?)
    }

    #[tracing::instrument(skip(self, source_body))]
    pub async fn propose_function(
        &self,
        caller: &str,
        name: &str,
        source_body: &str,
    ) -> Result<LibraryFunction, GovernanceError> {
        if !is_valid_name(name) {
            return Err(GovernanceError::InvalidName(name.to_string()));
        }
        if source_body.trim().is_empty() {
            return Err(GovernanceError::EmptyBody(name.to_string()));
        }

        let mut tx = self.ledger.begin(caller);
        let key = function_key(name);
        if tx.get_state(&key).await?.is_some() {
            return Err(GovernanceError::Duplicate(name.to_string()));
        }

        let votes = tx
            .scan_json::<Participant>(PARTICIPANT_PREFIX)
            .await?
            .into_iter()
            .map(|participant| (participant.identity, false))
            .collect();

        let function = LibraryFunction {
            name: name.to_string(),
            source_body: source_body.to_string(),
            proposed_at: tx.tx_timestamp(),
            proposed_by: tx.caller_identity().to_string(),
            status: ProposalStatus::Pending,
            votes,
            accepted_at: None,
        };
        tx.put_json(&key, &function)?;
        tx.commit().await?;

        tracing::info!(%name, ballot = function.votes.len(), "library function proposed");
        Ok(function)
    }

    pub async fn get_proposal(&self, caller: &str, name: &str) -> Result<LibraryFunction, GovernanceError> {
        let mut tx = self.ledger.begin(caller);
        load_function(&mut tx, name).await
    }

    /// Records the caller's vote. The read, the status computation and the
    /// write commit as one transaction; a concurrent vote on the same function
    /// surfaces as a ledger conflict.
    #[tracing::instrument(skip(self))]
    pub async fn vote(&self, identity: &str, name: &str, approve: bool) -> Result<VoteOutcome, GovernanceError> {
        let mut tx = self.ledger.begin(identity);
        let mut function = load_function(&mut tx, name).await?;
        let before = function.clone();

        if let Err(e) = function.apply_vote(identity, approve, tx.tx_timestamp()) {
            tracing::warn!(%name, %identity, error = %e, "vote refused");
            return Err(e);
        }

        if function != before {
            tx.put_json(&function_key(name), &function)?;
            tx.commit().await?;
            tracing::info!(%name, %identity, approve, status = %function.status, "vote recorded");
        }

        Ok(VoteOutcome {
            name: function.name,
            status: function.status,
            accepted_at: function.accepted_at,
        })
    }

    pub async fn list_proposals(&self, caller: &str) -> Result<Vec<LibraryFunction>, GovernanceError> {
        let mut tx = self.ledger.begin(caller);
        Ok(tx.scan_json(FUNCTION_PREFIX).await?)
    }

    /// Concatenated bodies of every accepted function, in key order.
    pub async fn current_library_bundle(&self, caller: &str) -> Result<String, GovernanceError> {
        let proposals = self.list_proposals(caller).await?;
        Ok(bundle(proposals.iter().filter(|f| f.status == ProposalStatus::Accepted)))
    }

    /// The library as it stood just before `cutoff`: functions accepted strictly earlier.
    pub async fn library_bundle_as_of(
        &self,
        caller: &str,
        cutoff: DateTime<Utc>,
    ) -> Result<String, GovernanceError> {
        let proposals = self.list_proposals(caller).await?;
        Ok(bundle(proposals.iter().filter(|f| {
            f.status == ProposalStatus::Accepted && f.accepted_at.map_or(false, |at| at < cutoff)
        })))
    }
}

async fn load_function(tx: &mut TxContext, name: &str) -> Result<LibraryFunction, GovernanceError> {
    tx.get_json(&function_key(name))
        .await?
        .ok_or_else(|| GovernanceError::NotFound(name.to_string()))
}

fn bundle<'a>(functions: impl Iterator<Item = &'a LibraryFunction>) -> String {
    functions.map(|f| f.source_body.as_str()).collect()
}

#[derive(Debug, thiserror::Error)]
pub enum GovernanceError {
    #[error("Library function {0} does not exist")]
    NotFound(String),
    #[error("Library function {0} has already been proposed")]
    Duplicate(String),
    #[error("Library function {0} is already rejected")]
    AlreadyRejected(String),
    #[error("{identity} is not on the ballot for {name}")]
    NotOnBallot { name: String, identity: String },
    #[error("Invalid library function name: {0:?}")]
    InvalidName(String),
    #[error("Library function {0} has an empty body")]
    EmptyBody(String),
    #[error(transparent)]
    Ledger(#[from] LedgerError),
}
