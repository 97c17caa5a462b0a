//! Student-dashboard session state: the optimistic poll reconciler and the
//! version-keyed course cache.
//!
//! A `PollSession` owns a local copy of one poll plus a subscription to its
//! document. Votes are applied to the local copy first, then pushed through
//! the vote transaction; on failure the local copy is restored exactly and
//! the rejection carries whether it was a permission problem or a generic
//! one.

use chrono::Utc;
use serde_json::Value;

use crate::courses;
use crate::polls::{apply_vote_diff, submit_vote, Identity, Poll, VoteError, VoteOutcome, POLLS};
use crate::store::{DocEvent, DocStore, StoreError, Watch};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectionKind {
    Permission,
    Generic,
}

/// A vote that did not stick. Local state has already been rolled back to
/// the pre-click snapshot when this is returned.
#[derive(Debug, Clone)]
pub struct VoteRejected {
    pub kind: RejectionKind,
    pub message: String,
}

fn rejection(err: VoteError) -> VoteRejected {
    match err {
        VoteError::PermissionDenied(message) => VoteRejected {
            kind: RejectionKind::Permission,
            message,
        },
        VoteError::PollNotFound(_) => VoteRejected {
            kind: RejectionKind::Generic,
            message: "this poll no longer exists".to_string(),
        },
        other => VoteRejected {
            kind: RejectionKind::Generic,
            message: other.to_string(),
        },
    }
}

pub struct PollSession {
    store: DocStore,
    who: Identity,
    poll_id: String,
    watch: Watch,
    poll: Option<Poll>,
    selected: Option<String>,
}

impl PollSession {
    /// Subscribe first, then read, so no commit can slip between the two.
    pub fn open(store: &DocStore, who: Identity, poll_id: &str) -> Result<PollSession, VoteError> {
        let watch = store.subscribe(POLLS, poll_id);
        let snap = store
            .get(POLLS, poll_id)?
            .ok_or_else(|| VoteError::PollNotFound(poll_id.to_string()))?;
        let poll: Poll = snap.parse(POLLS)?;
        // The ledger is authoritative for the "voted" marker; the profile
        // index may drift.
        let selected = poll.entry_for(&who.uid).map(|e| e.option_id.clone());
        Ok(PollSession {
            store: store.clone(),
            who,
            poll_id: poll_id.to_string(),
            watch,
            poll: Some(poll),
            selected,
        })
    }

    pub fn poll_id(&self) -> &str {
        &self.poll_id
    }

    /// Local copy of the poll; `None` once a delete has been observed.
    pub fn poll(&self) -> Option<&Poll> {
        self.poll.as_ref()
    }

    pub fn selected(&self) -> Option<&str> {
        self.selected.as_deref()
    }

    /// Optimistically apply the click, then run the vote transaction.
    /// Clicking the currently-selected option never touches the store.
    pub fn vote(&mut self, option_id: &str) -> Result<VoteOutcome, VoteRejected> {
        if self.selected.as_deref() == Some(option_id) {
            return Ok(VoteOutcome::Unchanged);
        }
        let Some(poll) = self.poll.as_mut() else {
            return Err(VoteRejected {
                kind: RejectionKind::Generic,
                message: "this poll no longer exists".to_string(),
            });
        };

        let undo_poll = poll.clone();
        let undo_selected = self.selected.clone();

        let now = Utc::now().to_rfc3339();
        match apply_vote_diff(poll, &self.who.uid, &self.who.name, option_id, &now) {
            Ok(VoteOutcome::Unchanged) => {
                // The ledger already carries this vote; realign the marker.
                self.selected = Some(option_id.to_string());
                return Ok(VoteOutcome::Unchanged);
            }
            Ok(VoteOutcome::Recorded { .. }) => {}
            Err(err) => return Err(rejection(err)),
        }
        self.selected = Some(option_id.to_string());

        match submit_vote(&self.store, &self.who, &self.poll_id, option_id) {
            Ok(outcome) => Ok(outcome),
            Err(err) => {
                self.poll = Some(undo_poll);
                self.selected = undo_selected;
                Err(rejection(err))
            }
        }
    }

    /// Apply pending live updates from the subscription. Replaces the local
    /// copy wholesale; any leftover optimistic divergence is reconciled here.
    pub fn pump(&mut self) -> Result<(), StoreError> {
        for event in self.watch.drain() {
            match event {
                DocEvent::Updated(snap) => {
                    let poll: Poll = snap.parse(POLLS)?;
                    self.selected = poll.entry_for(&self.who.uid).map(|e| e.option_id.clone());
                    self.poll = Some(poll);
                }
                DocEvent::Deleted { .. } => {
                    self.poll = None;
                    self.selected = None;
                }
            }
        }
        Ok(())
    }
}

/// Cached public course view, rebuilt only when the catalog version moves.
pub struct CourseCache {
    version: Option<i64>,
    view: Value,
}

impl Default for CourseCache {
    fn default() -> Self {
        CourseCache::new()
    }
}

impl CourseCache {
    pub fn new() -> CourseCache {
        CourseCache {
            version: None,
            view: Value::Null,
        }
    }

    /// Returns `true` when the view was rebuilt.
    pub fn refresh(&mut self, store: &DocStore) -> Result<bool, StoreError> {
        let catalog = courses::load_catalog(store)?;
        let version = courses::course_version(&catalog);
        if self.version == Some(version) {
            return Ok(false);
        }
        self.view = courses::public_course_view(&catalog);
        self.version = Some(version);
        Ok(true)
    }

    pub fn version(&self) -> Option<i64> {
        self.version
    }

    pub fn view(&self) -> &Value {
        &self.view
    }
}
