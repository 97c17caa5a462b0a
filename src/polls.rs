//! Poll documents, the vote ledger, and the vote transaction.
//!
//! The poll record is the single source of truth: per-option tallies, the
//! one-entry-per-uid ledger, and `total_votes` must agree whenever no
//! transaction is in flight. A user profile's `voted_polls` is a derived
//! index that may drift without breaking poll correctness.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::store::{DocStore, StoreError};

pub const POLLS: &str = "polls";
pub const PROFILES: &str = "user_profiles";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PollOption {
    pub id: String,
    pub text: String,
    #[serde(default)]
    pub votes: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VoteEntry {
    pub uid: String,
    pub name: String,
    pub option_id: String,
    pub timestamp: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Poll {
    pub id: String,
    pub question: String,
    pub options: Vec<PollOption>,
    #[serde(default)]
    pub is_active: bool,
    #[serde(default)]
    pub total_votes: u64,
    #[serde(default)]
    pub votes: Vec<VoteEntry>,
    pub created_at: String,
}

impl Poll {
    pub fn new(question: &str, option_texts: &[String]) -> Poll {
        Poll {
            id: Uuid::new_v4().to_string(),
            question: question.to_string(),
            options: option_texts
                .iter()
                .map(|text| PollOption {
                    id: Uuid::new_v4().to_string(),
                    text: text.clone(),
                    votes: 0,
                })
                .collect(),
            is_active: true,
            total_votes: 0,
            votes: Vec::new(),
            created_at: Utc::now().to_rfc3339(),
        }
    }

    /// The caller's current ledger entry, if any.
    pub fn entry_for(&self, uid: &str) -> Option<&VoteEntry> {
        self.votes.iter().find(|entry| entry.uid == uid)
    }

    pub fn has_option(&self, option_id: &str) -> bool {
        self.options.iter().any(|opt| opt.id == option_id)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserProfile {
    pub uid: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub voted_polls: Vec<String>,
    #[serde(default = "default_role")]
    pub role: String,
    #[serde(default = "default_can_vote")]
    pub can_vote: bool,
}

fn default_role() -> String {
    "student".to_string()
}

fn default_can_vote() -> bool {
    true
}

impl UserProfile {
    pub fn new(uid: &str, name: &str) -> UserProfile {
        UserProfile {
            uid: uid.to_string(),
            name: name.to_string(),
            voted_polls: Vec::new(),
            role: default_role(),
            can_vote: default_can_vote(),
        }
    }
}

/// Authenticated caller of the voting flow.
#[derive(Debug, Clone)]
pub struct Identity {
    pub uid: String,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VoteOutcome {
    /// The caller's ledger entry already targets this option; no state changed.
    Unchanged,
    /// Vote recorded. `previous` holds the option the entry moved away from.
    Recorded { previous: Option<String> },
}

#[derive(Debug, thiserror::Error)]
pub enum VoteError {
    #[error("poll not found: {0}")]
    PollNotFound(String),
    #[error("option {option_id} is not part of poll {poll_id}")]
    InvalidOption { poll_id: String, option_id: String },
    #[error("{0}")]
    PermissionDenied(String),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Reconcile a vote against a poll in place: the same branching runs inside
/// the store transaction and on the dashboard's optimistic copy, so the two
/// can never disagree about what a click does.
///
/// Decrements are floored at zero; they never underflow even if the counts
/// were inconsistent to begin with.
pub fn apply_vote_diff(
    poll: &mut Poll,
    uid: &str,
    name: &str,
    option_id: &str,
    timestamp: &str,
) -> Result<VoteOutcome, VoteError> {
    if !poll.has_option(option_id) {
        return Err(VoteError::InvalidOption {
            poll_id: poll.id.clone(),
            option_id: option_id.to_string(),
        });
    }

    let existing = poll.votes.iter().position(|entry| entry.uid == uid);
    if let Some(idx) = existing {
        if poll.votes[idx].option_id == option_id {
            return Ok(VoteOutcome::Unchanged);
        }
    }

    let mut previous = None;
    if let Some(idx) = existing {
        let old = poll.votes.remove(idx);
        if let Some(opt) = poll.options.iter_mut().find(|o| o.id == old.option_id) {
            opt.votes = opt.votes.saturating_sub(1);
        }
        poll.total_votes = poll.total_votes.saturating_sub(1);
        previous = Some(old.option_id);
    }

    if let Some(opt) = poll.options.iter_mut().find(|o| o.id == option_id) {
        opt.votes += 1;
    }
    poll.votes.push(VoteEntry {
        uid: uid.to_string(),
        name: name.to_string(),
        option_id: option_id.to_string(),
        timestamp: timestamp.to_string(),
    });
    poll.total_votes += 1;

    Ok(VoteOutcome::Recorded { previous })
}

/// Atomically move the caller's vote to `option_id`: both reads happen fresh
/// inside the transaction, writes are staged only after both reads, and a
/// same-option re-click stages nothing at all.
pub fn cast_vote(
    store: &DocStore,
    who: &Identity,
    poll_id: &str,
    option_id: &str,
) -> Result<VoteOutcome, VoteError> {
    store.run_transaction(|tx| {
        let Some(poll_snap) = tx.read(POLLS, poll_id)? else {
            return Err(VoteError::PollNotFound(poll_id.to_string()));
        };
        let profile_snap = tx.read(PROFILES, &who.uid)?;

        let mut poll: Poll = poll_snap.parse(POLLS)?;
        let now = Utc::now().to_rfc3339();
        let outcome = apply_vote_diff(&mut poll, &who.uid, &who.name, option_id, &now)?;
        if outcome == VoteOutcome::Unchanged {
            return Ok(outcome);
        }

        tx.write(
            POLLS,
            poll_id,
            serde_json::to_value(&poll).map_err(StoreError::from)?,
        );

        let mut profile = match &profile_snap {
            Some(snap) => snap.parse::<UserProfile>(PROFILES)?,
            None => UserProfile::new(&who.uid, &who.name),
        };
        let index_stale = !profile.voted_polls.iter().any(|p| p == poll_id);
        if index_stale {
            profile.voted_polls.push(poll_id.to_string());
        }
        if index_stale || profile_snap.is_none() {
            tx.write(
                PROFILES,
                &who.uid,
                serde_json::to_value(&profile).map_err(StoreError::from)?,
            );
        }

        Ok(outcome)
    })
}

/// Access-control gate in front of the transaction: an inactive poll or a
/// profile with voting revoked is rejected before any transactional work.
fn ensure_vote_access(store: &DocStore, who: &Identity, poll_id: &str) -> Result<(), VoteError> {
    let snap = store
        .get(POLLS, poll_id)?
        .ok_or_else(|| VoteError::PollNotFound(poll_id.to_string()))?;
    let poll: Poll = snap.parse(POLLS)?;
    if !poll.is_active {
        return Err(VoteError::PermissionDenied(
            "this poll is not currently accepting votes".to_string(),
        ));
    }
    if let Some(profile_snap) = store.get(PROFILES, &who.uid)? {
        let profile: UserProfile = profile_snap.parse(PROFILES)?;
        if !profile.can_vote {
            return Err(VoteError::PermissionDenied(
                "you do not have permission to vote in this poll".to_string(),
            ));
        }
    }
    Ok(())
}

/// What handlers and dashboard sessions call: the access check, then the
/// transaction.
pub fn submit_vote(
    store: &DocStore,
    who: &Identity,
    poll_id: &str,
    option_id: &str,
) -> Result<VoteOutcome, VoteError> {
    ensure_vote_access(store, who, poll_id)?;
    cast_vote(store, who, poll_id, option_id)
}
