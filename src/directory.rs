use async_trait::async_trait;
use dashmap::DashMap;

use crate::model::MemberId;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemberProfile {
    pub member_id: MemberId,
    pub display_name: Option<String>,
}

/// Read-only view of the member directory. Membership is managed elsewhere;
/// the engine only needs to confirm a member exists and how to name them.
#[async_trait]
pub trait MemberDirectory: Send + Sync {
    async fn lookup(&self, member_id: &str) -> Option<MemberProfile>;
}

/// Directory backed by a concurrent map. Used by the server binary and tests.
#[derive(Debug, Default)]
pub struct InMemoryDirectory {
    members: DashMap<MemberId, MemberProfile>,
}

impl InMemoryDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, member_id: &str, display_name: Option<&str>) {
        self.members.insert(
            member_id.to_string(),
            MemberProfile {
                member_id: member_id.to_string(),
                display_name: display_name.map(str::to_string),
            },
        );
    }

    pub fn remove(&self, member_id: &str) -> bool {
        self.members.remove(member_id).is_some()
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }
}

#[async_trait]
impl MemberDirectory for InMemoryDirectory {
    async fn lookup(&self, member_id: &str) -> Option<MemberProfile> {
        self.members.get(member_id).map(|p| p.value().clone())
    }
}
