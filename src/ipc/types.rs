use std::collections::HashMap;
use std::path::PathBuf;

use serde::Deserialize;

use crate::auth::AuthService;
use crate::dashboard::{CourseCache, PollSession};
use crate::roster::ClassLocks;
use crate::store::DocStore;

#[derive(Debug, Deserialize, Clone)]
pub struct Request {
    pub id: String,
    pub method: String,
    #[serde(default)]
    pub params: serde_json::Value,
}

pub struct AppState {
    pub workspace: Option<PathBuf>,
    pub store: Option<DocStore>,
    pub auth: AuthService,
    pub sessions: HashMap<String, PollSession>,
    pub course_cache: CourseCache,
    pub class_locks: ClassLocks,
}

impl AppState {
    pub fn new() -> AppState {
        AppState {
            workspace: None,
            store: None,
            auth: AuthService::from_env(),
            sessions: HashMap::new(),
            course_cache: CourseCache::new(),
            class_locks: ClassLocks::new(),
        }
    }

    /// Open poll sessions and the course cache hold snapshots of the
    /// previous database; both are discarded whenever the workspace (or its
    /// database file) is replaced.
    pub fn reset_workspace_state(&mut self) {
        self.sessions.clear();
        self.course_cache = CourseCache::new();
    }
}
