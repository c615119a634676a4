//! Group membership lookup.
//!
//! Membership is owned by the persistence layer; the core only asks for the
//! current members of a group when a group message has to be fanned out.

use async_trait::async_trait;
use courier_protocol::UserId;
use dashmap::DashMap;
use std::collections::BTreeSet;
use thiserror::Error;

/// Directory errors.
#[derive(Debug, Error)]
pub enum DirectoryError {
    /// No such group.
    #[error("Group not found: {0}")]
    GroupNotFound(i64),

    /// The backing store could not be queried.
    #[error("Directory unavailable: {0}")]
    Unavailable(String),
}

/// Resolves group ids to member user ids.
#[async_trait]
pub trait GroupDirectory: Send + Sync {
    /// Current members of a group.
    async fn members(&self, group_id: i64) -> Result<Vec<UserId>, DirectoryError>;
}

/// Membership held in memory.
#[derive(Debug, Default)]
pub struct InMemoryGroupDirectory {
    groups: DashMap<i64, BTreeSet<UserId>>,
}

impl InMemoryGroupDirectory {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the members of a group.
    pub fn set_members(&self, group_id: i64, members: impl IntoIterator<Item = UserId>) {
        self.groups.insert(group_id, members.into_iter().collect());
    }

    /// Add a member, creating the group if needed.
    pub fn add_member(&self, group_id: i64, user_id: UserId) {
        self.groups.entry(group_id).or_default().insert(user_id);
    }

    /// Remove a member. Returns `true` if they were a member.
    pub fn remove_member(&self, group_id: i64, user_id: UserId) -> bool {
        self.groups
            .get_mut(&group_id)
            .map(|mut members| members.remove(&user_id))
            .unwrap_or(false)
    }

    /// Forget a group entirely.
    pub fn remove_group(&self, group_id: i64) -> bool {
        self.groups.remove(&group_id).is_some()
    }
}

#[async_trait]
impl GroupDirectory for InMemoryGroupDirectory {
    async fn members(&self, group_id: i64) -> Result<Vec<UserId>, DirectoryError> {
        self.groups
            .get(&group_id)
            .map(|members| members.iter().copied().collect())
            .ok_or(DirectoryError::GroupNotFound(group_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_membership_changes() {
        let directory = InMemoryGroupDirectory::new();
        directory.set_members(1, [3, 1, 2]);
        directory.add_member(1, 4);

        assert_eq!(directory.members(1).await.unwrap(), vec![1, 2, 3, 4]);

        assert!(directory.remove_member(1, 2));
        assert!(!directory.remove_member(1, 2));
        assert_eq!(directory.members(1).await.unwrap(), vec![1, 3, 4]);
    }

    #[tokio::test]
    async fn test_unknown_group() {
        let directory = InMemoryGroupDirectory::new();
        assert!(matches!(
            directory.members(9).await,
            Err(DirectoryError::GroupNotFound(9))
        ));

        directory.add_member(9, 1);
        assert!(directory.remove_group(9));
        assert!(directory.members(9).await.is_err());
    }
}
