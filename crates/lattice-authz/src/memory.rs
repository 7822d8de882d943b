use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use lattice_core::{
    BlockedUser, ChannelId, DmFilter, DmRequest, DmSnapshot, FriendRequest, Friendship,
    Membership, PermissionSet, RequestId, RequestStatus, Role, RoleId, RoleName, ServerId, UserId,
    canonical_pair, MAX_MEMBER_ROLE_ASSIGNMENTS, MAX_ROLES_PER_SERVER,
};
use tokio::sync::RwLock;

use crate::store::{
    now_unix, DirectoryStore, GraphWrite, RelationshipStore, StoreError, StoreResult, WriteBatch,
};

/// In-process backend for tests and single-node deployments. Batches
/// commit under one write lock, so readers observe either none or all
/// of a transition.
#[derive(Clone, Default)]
pub struct MemoryStore {
    inner: Arc<RwLock<MemoryInner>>,
}

#[derive(Default)]
struct MemoryInner {
    users: HashSet<UserId>,
    servers: HashSet<ServerId>,
    channels: HashMap<ChannelId, ServerId>,
    roles: HashMap<ServerId, Vec<Role>>,
    memberships: HashMap<(UserId, ServerId), MembershipRecord>,
    friend_requests: HashMap<(UserId, UserId), FriendRequest>,
    dm_requests: HashMap<(UserId, UserId), DmRequest>,
    friendships: HashMap<(UserId, UserId), Friendship>,
    blocks: HashMap<(UserId, UserId), BlockedUser>,
    dm_filters: HashMap<UserId, DmFilter>,
}

struct MembershipRecord {
    role_ids: HashSet<RoleId>,
    joined_at_unix: i64,
}

/// Handles returned by [`MemoryStore::create_server`] so callers can
/// reference the bootstrap roles directly.
#[derive(Debug, Clone)]
pub struct ServerFixture {
    pub server_id: ServerId,
    pub everyone_role: Role,
    pub admin_role: Role,
}

impl MemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn register_user(&self) -> UserId {
        let user_id = UserId::new();
        self.inner.write().await.users.insert(user_id);
        user_id
    }

    /// Creates a server with its `@everyone` and `Admin` roles and an
    /// owner membership carrying both.
    pub async fn create_server(&self, owner_id: UserId) -> StoreResult<ServerFixture> {
        let mut inner = self.inner.write().await;
        if !inner.users.contains(&owner_id) {
            return Err(StoreError::MissingReference("user"));
        }
        let now = now_unix();
        let server_id = ServerId::new();
        let everyone_role = Role::everyone(server_id, now);
        let admin_role = Role::admin(server_id, now);
        inner.servers.insert(server_id);
        inner
            .roles
            .insert(server_id, vec![everyone_role.clone(), admin_role.clone()]);
        inner.memberships.insert(
            (owner_id, server_id),
            MembershipRecord {
                role_ids: HashSet::from([everyone_role.id, admin_role.id]),
                joined_at_unix: now,
            },
        );
        Ok(ServerFixture {
            server_id,
            everyone_role,
            admin_role,
        })
    }

    pub async fn create_channel(&self, server_id: ServerId) -> StoreResult<ChannelId> {
        let mut inner = self.inner.write().await;
        if !inner.servers.contains(&server_id) {
            return Err(StoreError::MissingReference("server"));
        }
        let channel_id = ChannelId::new();
        inner.channels.insert(channel_id, server_id);
        Ok(channel_id)
    }

    pub async fn create_role(
        &self,
        server_id: ServerId,
        name: RoleName,
        permissions: PermissionSet,
    ) -> StoreResult<Role> {
        let mut inner = self.inner.write().await;
        let roles = inner
            .roles
            .get_mut(&server_id)
            .ok_or(StoreError::MissingReference("server"))?;
        if roles.len() >= MAX_ROLES_PER_SERVER {
            return Err(StoreError::LimitExceeded("roles per server"));
        }
        let position = roles.iter().map(|role| role.position).max().unwrap_or(0) + 1;
        let role = Role {
            id: RoleId::new(),
            server_id,
            name,
            color: lattice_core::RoleColor::neutral(),
            permissions,
            position,
            is_hoisted: false,
            is_mentionable: true,
            created_at_unix: now_unix(),
        };
        roles.push(role.clone());
        Ok(role)
    }

    pub async fn set_role_permissions(
        &self,
        server_id: ServerId,
        role_id: RoleId,
        permissions: PermissionSet,
    ) -> StoreResult<()> {
        let mut inner = self.inner.write().await;
        let roles = inner
            .roles
            .get_mut(&server_id)
            .ok_or(StoreError::MissingReference("server"))?;
        let role = roles
            .iter_mut()
            .find(|role| role.id == role_id)
            .ok_or(StoreError::MissingReference("role"))?;
        role.permissions = permissions;
        Ok(())
    }

    /// Joins with the `@everyone` role only; further roles are granted
    /// through [`MemoryStore::replace_member_roles`].
    pub async fn join_server(&self, user_id: UserId, server_id: ServerId) -> StoreResult<()> {
        let mut inner = self.inner.write().await;
        if !inner.users.contains(&user_id) {
            return Err(StoreError::MissingReference("user"));
        }
        let everyone_id = everyone_role_id(&inner, server_id)?;
        inner.memberships.insert(
            (user_id, server_id),
            MembershipRecord {
                role_ids: HashSet::from([everyone_id]),
                joined_at_unix: now_unix(),
            },
        );
        Ok(())
    }

    /// Replaces the member's role set. The `@everyone` role is re-added
    /// when absent from the replacement set.
    pub async fn replace_member_roles(
        &self,
        user_id: UserId,
        server_id: ServerId,
        role_ids: Vec<RoleId>,
    ) -> StoreResult<()> {
        let mut inner = self.inner.write().await;
        let known: HashSet<RoleId> = inner
            .roles
            .get(&server_id)
            .ok_or(StoreError::MissingReference("server"))?
            .iter()
            .map(|role| role.id)
            .collect();
        if role_ids.iter().any(|role_id| !known.contains(role_id)) {
            return Err(StoreError::MissingReference("role"));
        }
        if role_ids.len() > MAX_MEMBER_ROLE_ASSIGNMENTS {
            return Err(StoreError::LimitExceeded("role assignments per member"));
        }
        let everyone_id = everyone_role_id(&inner, server_id)?;
        let record = inner
            .memberships
            .get_mut(&(user_id, server_id))
            .ok_or(StoreError::MissingReference("membership"))?;
        record.role_ids = role_ids.into_iter().collect();
        record.role_ids.insert(everyone_id);
        Ok(())
    }

    pub async fn remove_membership(&self, user_id: UserId, server_id: ServerId) -> bool {
        self.inner
            .write()
            .await
            .memberships
            .remove(&(user_id, server_id))
            .is_some()
    }
}

fn everyone_role_id(inner: &MemoryInner, server_id: ServerId) -> StoreResult<RoleId> {
    inner
        .roles
        .get(&server_id)
        .and_then(|roles| roles.iter().find(|role| role.is_everyone()))
        .map(|role| role.id)
        .ok_or(StoreError::MissingReference("server"))
}

#[async_trait]
impl DirectoryStore for MemoryStore {
    async fn server_exists(&self, server_id: ServerId) -> StoreResult<bool> {
        Ok(self.inner.read().await.servers.contains(&server_id))
    }

    async fn channel_server(&self, channel_id: ChannelId) -> StoreResult<Option<ServerId>> {
        Ok(self.inner.read().await.channels.get(&channel_id).copied())
    }

    async fn membership(
        &self,
        user_id: UserId,
        server_id: ServerId,
    ) -> StoreResult<Option<Membership>> {
        let inner = self.inner.read().await;
        let Some(record) = inner.memberships.get(&(user_id, server_id)) else {
            return Ok(None);
        };
        let mut roles: Vec<Role> = inner
            .roles
            .get(&server_id)
            .map(|roles| {
                roles
                    .iter()
                    .filter(|role| record.role_ids.contains(&role.id))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        roles.sort_by_key(|role| role.position);
        Ok(Some(Membership {
            user_id,
            server_id,
            roles,
            joined_at_unix: record.joined_at_unix,
        }))
    }
}

#[async_trait]
impl RelationshipStore for MemoryStore {
    async fn user_exists(&self, user_id: UserId) -> StoreResult<bool> {
        Ok(self.inner.read().await.users.contains(&user_id))
    }

    async fn friend_request(&self, request_id: RequestId) -> StoreResult<Option<FriendRequest>> {
        Ok(self
            .inner
            .read()
            .await
            .friend_requests
            .values()
            .find(|request| request.id == request_id)
            .cloned())
    }

    async fn friend_request_between(
        &self,
        sender_id: UserId,
        recipient_id: UserId,
    ) -> StoreResult<Option<FriendRequest>> {
        Ok(self
            .inner
            .read()
            .await
            .friend_requests
            .get(&(sender_id, recipient_id))
            .cloned())
    }

    async fn dm_request_between(
        &self,
        sender_id: UserId,
        recipient_id: UserId,
    ) -> StoreResult<Option<DmRequest>> {
        Ok(self
            .inner
            .read()
            .await
            .dm_requests
            .get(&(sender_id, recipient_id))
            .cloned())
    }

    async fn friendship_between(
        &self,
        user_a: UserId,
        user_b: UserId,
    ) -> StoreResult<Option<Friendship>> {
        let pair = canonical_pair(user_a, user_b);
        Ok(self.inner.read().await.friendships.get(&pair).copied())
    }

    async fn block(
        &self,
        blocker_id: UserId,
        blocked_id: UserId,
    ) -> StoreResult<Option<BlockedUser>> {
        Ok(self
            .inner
            .read()
            .await
            .blocks
            .get(&(blocker_id, blocked_id))
            .copied())
    }

    async fn dm_filter(&self, user_id: UserId) -> StoreResult<DmFilter> {
        Ok(self
            .inner
            .read()
            .await
            .dm_filters
            .get(&user_id)
            .copied()
            .unwrap_or_default())
    }

    async fn dm_snapshot(
        &self,
        sender_id: UserId,
        recipient_id: UserId,
    ) -> StoreResult<DmSnapshot> {
        let inner = self.inner.read().await;
        let blocked_either_direction = inner.blocks.contains_key(&(sender_id, recipient_id))
            || inner.blocks.contains_key(&(recipient_id, sender_id));
        let are_friends = inner
            .friendships
            .contains_key(&canonical_pair(sender_id, recipient_id));
        let has_accepted_dm_request = [
            (sender_id, recipient_id),
            (recipient_id, sender_id),
        ]
        .iter()
        .any(|key| {
            inner
                .dm_requests
                .get(key)
                .is_some_and(|request| request.status == RequestStatus::Accepted)
        });
        let recipient_filter = inner
            .dm_filters
            .get(&recipient_id)
            .copied()
            .unwrap_or_default();
        Ok(DmSnapshot {
            blocked_either_direction,
            are_friends,
            has_accepted_dm_request,
            recipient_filter,
        })
    }

    async fn friends_of(&self, user_id: UserId) -> StoreResult<Vec<Friendship>> {
        let inner = self.inner.read().await;
        let mut friendships: Vec<Friendship> = inner
            .friendships
            .values()
            .filter(|friendship| friendship.involves(user_id))
            .copied()
            .collect();
        friendships.sort_by(|left, right| right.created_at_unix.cmp(&left.created_at_unix));
        Ok(friendships)
    }

    async fn pending_requests_for(&self, user_id: UserId) -> StoreResult<Vec<FriendRequest>> {
        let inner = self.inner.read().await;
        let mut requests: Vec<FriendRequest> = inner
            .friend_requests
            .values()
            .filter(|request| {
                request.status == RequestStatus::Pending
                    && (request.sender_id == user_id || request.recipient_id == user_id)
            })
            .cloned()
            .collect();
        requests.sort_by(|left, right| right.created_at_unix.cmp(&left.created_at_unix));
        Ok(requests)
    }

    async fn apply(&self, batch: WriteBatch) -> StoreResult<()> {
        let mut inner = self.inner.write().await;
        for write in batch.into_writes() {
            match write {
                GraphWrite::UpsertFriendRequest(mut request) => {
                    let key = (request.sender_id, request.recipient_id);
                    if let Some(existing) = inner.friend_requests.get(&key) {
                        // Pair uniqueness: the logical request keeps its
                        // original id across reopens and racing sends.
                        request.id = existing.id;
                    }
                    inner.friend_requests.insert(key, request);
                }
                GraphWrite::UpsertDmRequest(mut request) => {
                    let key = (request.sender_id, request.recipient_id);
                    if let Some(existing) = inner.dm_requests.get(&key) {
                        request.id = existing.id;
                    }
                    inner.dm_requests.insert(key, request);
                }
                GraphWrite::InsertFriendship(friendship) => {
                    inner
                        .friendships
                        .entry((friendship.user_a_id, friendship.user_b_id))
                        .or_insert(friendship);
                }
                GraphWrite::DeleteFriendship {
                    user_a_id,
                    user_b_id,
                } => {
                    inner
                        .friendships
                        .remove(&canonical_pair(user_a_id, user_b_id));
                }
                GraphWrite::InsertBlock(block) => {
                    inner
                        .blocks
                        .entry((block.blocker_id, block.blocked_id))
                        .or_insert(block);
                }
                GraphWrite::DeleteBlock {
                    blocker_id,
                    blocked_id,
                } => {
                    inner.blocks.remove(&(blocker_id, blocked_id));
                }
                GraphWrite::SetDmFilter { user_id, filter } => {
                    inner.dm_filters.insert(user_id, filter);
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::MemoryStore;
    use crate::store::{DirectoryStore, GraphWrite, RelationshipStore, WriteBatch};
    use lattice_core::{FriendRequest, Permission, PermissionSet, RoleName};

    #[tokio::test]
    async fn request_upsert_keeps_the_existing_row_id() {
        let store = MemoryStore::new();
        let sender = store.register_user().await;
        let recipient = store.register_user().await;

        let first = FriendRequest::pending(sender, recipient, 1);
        let mut batch = WriteBatch::new();
        batch.push(GraphWrite::UpsertFriendRequest(first.clone()));
        store.apply(batch).await.unwrap();

        let racing = FriendRequest::pending(sender, recipient, 2);
        let mut batch = WriteBatch::new();
        batch.push(GraphWrite::UpsertFriendRequest(racing));
        store.apply(batch).await.unwrap();

        let stored = store
            .friend_request_between(sender, recipient)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.id, first.id);
        assert_eq!(stored.created_at_unix, 2);
    }

    #[tokio::test]
    async fn join_and_role_replacement_keep_everyone() {
        let store = MemoryStore::new();
        let owner = store.register_user().await;
        let member = store.register_user().await;
        let server = store.create_server(owner).await.unwrap();
        store.join_server(member, server.server_id).await.unwrap();

        let role = store
            .create_role(
                server.server_id,
                RoleName::try_from(String::from("Helpers")).unwrap(),
                PermissionSet::of(&[Permission::ManageMessages]),
            )
            .await
            .unwrap();
        store
            .replace_member_roles(member, server.server_id, vec![role.id])
            .await
            .unwrap();

        let membership = store
            .membership(member, server.server_id)
            .await
            .unwrap()
            .unwrap();
        assert!(membership.has_everyone());
        assert!(membership.roles.iter().any(|r| r.id == role.id));
    }
}
