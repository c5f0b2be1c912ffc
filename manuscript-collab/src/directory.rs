//! User directory: resolves portal user ids to display names and roles.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::ids::UserId;
use crate::session::Role;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserProfile {
    pub user_id: UserId,
    pub name: String,
    #[serde(default)]
    pub role: Role,
}

/// Lookup of user profiles. Unknown users fall back to what the client sent.
pub trait UserDirectory: Send + Sync {
    fn lookup(&self, user_id: &UserId) -> Option<UserProfile>;
}

/// Fixed set of profiles, usually loaded from the server config.
#[derive(Debug, Default, Clone)]
pub struct StaticDirectory {
    profiles: HashMap<UserId, UserProfile>,
}

impl StaticDirectory {
    pub fn new(profiles: impl IntoIterator<Item = UserProfile>) -> Self {
        Self {
            profiles: profiles
                .into_iter()
                .map(|p| (p.user_id.clone(), p))
                .collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.profiles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.profiles.is_empty()
    }
}

impl UserDirectory for StaticDirectory {
    fn lookup(&self, user_id: &UserId) -> Option<UserProfile> {
        self.profiles.get(user_id).cloned()
    }
}
