use std::sync::Arc;

use lattice_core::{
    plan_friend_request, BlockedUser, ConflictReason, DmFilter, DmRequest, DmSetting,
    FriendRequest, Friendship, PairState, RequestId, RequestStatus, SendPlan, UserId,
};

use crate::errors::{AuthzError, Missing};
use crate::store::{now_unix, GraphWrite, RelationshipStore, WriteBatch};

/// The only writer of relationship-graph state. Every transition is
/// validated against a fresh snapshot and committed as one atomic
/// batch; the returned outcome carries the before/after facts the
/// caller needs for audit logging and broadcast.
#[derive(Clone)]
pub struct RelationshipMutator<S> {
    store: Arc<S>,
}

#[derive(Debug, Clone)]
pub struct SendOutcome {
    pub request: FriendRequest,
    /// True when an earlier resolved row was reset to pending rather
    /// than a fresh row inserted.
    pub reopened: bool,
}

#[derive(Debug, Clone)]
pub struct AcceptOutcome {
    pub request: FriendRequest,
    pub friendship: Friendship,
    /// The DM consent record mirrored alongside the friendship.
    pub dm_consent: DmRequest,
}

#[derive(Debug, Clone, Default)]
pub struct RemoveFriendOutcome {
    pub removed_friendship: Option<Friendship>,
    pub declined_friend_requests: usize,
    pub declined_dm_requests: usize,
}

#[derive(Debug, Clone)]
pub struct BlockOutcome {
    pub block: BlockedUser,
    pub already_blocked: bool,
    pub removed_friendship: Option<Friendship>,
    pub declined_friend_requests: usize,
    pub declined_dm_requests: usize,
}

#[derive(Debug, Clone, Copy)]
pub struct UnblockOutcome {
    pub removed: bool,
}

impl<S: RelationshipStore> RelationshipMutator<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self { store }
    }

    pub async fn send_friend_request(
        &self,
        sender_id: UserId,
        recipient_id: UserId,
    ) -> Result<SendOutcome, AuthzError> {
        if sender_id == recipient_id {
            return Err(AuthzError::Conflict(ConflictReason::SelfTarget));
        }
        if !self.store.user_exists(recipient_id).await? {
            return Err(AuthzError::NotFound(Missing::User));
        }

        let outgoing = self
            .store
            .friend_request_between(sender_id, recipient_id)
            .await?;
        let incoming = self
            .store
            .friend_request_between(recipient_id, sender_id)
            .await?;
        let state = PairState {
            blocked_by_sender: self.store.block(sender_id, recipient_id).await?.is_some(),
            blocked_by_recipient: self.store.block(recipient_id, sender_id).await?.is_some(),
            are_friends: self
                .store
                .friendship_between(sender_id, recipient_id)
                .await?
                .is_some(),
            outgoing_status: outgoing.as_ref().map(|request| request.status),
            incoming_status: incoming.as_ref().map(|request| request.status),
        };

        let plan = plan_friend_request(&state).map_err(AuthzError::Conflict)?;
        let now = now_unix();
        let (request, reopened) = match plan {
            SendPlan::AlreadyPending => {
                let request = outgoing.ok_or(AuthzError::NotFound(Missing::Request))?;
                return Ok(SendOutcome {
                    request,
                    reopened: false,
                });
            }
            SendPlan::Create => (FriendRequest::pending(sender_id, recipient_id, now), false),
            SendPlan::Reopen => {
                let mut request = outgoing.ok_or(AuthzError::NotFound(Missing::Request))?;
                request.status = RequestStatus::Pending;
                request.created_at_unix = now;
                request.responded_at_unix = None;
                (request, true)
            }
        };

        let mut batch = WriteBatch::new();
        batch.push(GraphWrite::UpsertFriendRequest(request));
        self.store.apply(batch).await?;
        // A racing send for the same ordered pair resolves at the
        // storage boundary, which keeps the first row's id. Re-read so
        // the outcome carries the id the store actually holds.
        let request = self
            .store
            .friend_request_between(sender_id, recipient_id)
            .await?
            .ok_or(AuthzError::NotFound(Missing::Request))?;
        tracing::info!(
            event = "relationship.friend_request.send",
            sender_id = %sender_id,
            recipient_id = %recipient_id,
            request_id = %request.id,
            reopened,
        );
        Ok(SendOutcome { request, reopened })
    }

    /// Accepting creates the friendship and keeps the DM consent
    /// mirror current in the same commit, so a `FriendsOnly` gate sees
    /// both or neither.
    pub async fn accept_friend_request(
        &self,
        actor_id: UserId,
        request_id: RequestId,
    ) -> Result<AcceptOutcome, AuthzError> {
        let mut request = self.pending_request_for_recipient(actor_id, request_id).await?;
        let now = now_unix();
        request.status = RequestStatus::Accepted;
        request.responded_at_unix = Some(now);

        let friendship = Friendship::new(request.sender_id, request.recipient_id, now);
        let dm_consent = match self
            .existing_dm_request(request.sender_id, request.recipient_id)
            .await?
        {
            Some(mut existing) => {
                existing.status = RequestStatus::Accepted;
                existing.responded_at_unix = Some(now);
                existing
            }
            None => DmRequest::accepted(request.sender_id, request.recipient_id, now),
        };

        let mut batch = WriteBatch::new();
        batch.push(GraphWrite::UpsertFriendRequest(request.clone()));
        batch.push(GraphWrite::InsertFriendship(friendship));
        batch.push(GraphWrite::UpsertDmRequest(dm_consent.clone()));
        self.store.apply(batch).await?;
        tracing::info!(
            event = "relationship.friend_request.accept",
            request_id = %request.id,
            sender_id = %request.sender_id,
            recipient_id = %request.recipient_id,
        );
        Ok(AcceptOutcome {
            request,
            friendship,
            dm_consent,
        })
    }

    pub async fn decline_friend_request(
        &self,
        actor_id: UserId,
        request_id: RequestId,
    ) -> Result<FriendRequest, AuthzError> {
        let mut request = self.pending_request_for_recipient(actor_id, request_id).await?;
        request.status = RequestStatus::Declined;
        request.responded_at_unix = Some(now_unix());

        let mut batch = WriteBatch::new();
        batch.push(GraphWrite::UpsertFriendRequest(request.clone()));
        self.store.apply(batch).await?;
        tracing::info!(
            event = "relationship.friend_request.decline",
            request_id = %request.id,
            sender_id = %request.sender_id,
            recipient_id = %request.recipient_id,
        );
        Ok(request)
    }

    /// Idempotent: removing an absent friendship succeeds. Any request
    /// between the pair is set to declined so a later send starts
    /// clean instead of resurrecting the old acceptance.
    pub async fn remove_friend(
        &self,
        actor_id: UserId,
        friend_id: UserId,
    ) -> Result<RemoveFriendOutcome, AuthzError> {
        if actor_id == friend_id {
            return Err(AuthzError::Conflict(ConflictReason::SelfTarget));
        }

        let removed_friendship = self.store.friendship_between(actor_id, friend_id).await?;
        let mut batch = WriteBatch::new();
        if removed_friendship.is_some() {
            batch.push(GraphWrite::DeleteFriendship {
                user_a_id: actor_id,
                user_b_id: friend_id,
            });
        }
        let now = now_unix();
        let declined_friend_requests = self
            .decline_friend_requests_between(actor_id, friend_id, now, false, &mut batch)
            .await?;
        let declined_dm_requests = self
            .decline_dm_requests_between(actor_id, friend_id, now, &mut batch)
            .await?;

        if !batch.is_empty() {
            self.store.apply(batch).await?;
        }
        tracing::info!(
            event = "relationship.friend.remove",
            actor_id = %actor_id,
            friend_id = %friend_id,
            removed = removed_friendship.is_some(),
        );
        Ok(RemoveFriendOutcome {
            removed_friendship,
            declined_friend_requests,
            declined_dm_requests,
        })
    }

    /// No-op when the directed edge already exists. The block edge is
    /// the last write in the batch: a reader can never observe the
    /// block without the friendship and request cleanup that precedes
    /// it.
    pub async fn block_user(
        &self,
        blocker_id: UserId,
        blocked_id: UserId,
    ) -> Result<BlockOutcome, AuthzError> {
        if blocker_id == blocked_id {
            return Err(AuthzError::Conflict(ConflictReason::SelfTarget));
        }
        if !self.store.user_exists(blocked_id).await? {
            return Err(AuthzError::NotFound(Missing::User));
        }
        if let Some(existing) = self.store.block(blocker_id, blocked_id).await? {
            return Ok(BlockOutcome {
                block: existing,
                already_blocked: true,
                removed_friendship: None,
                declined_friend_requests: 0,
                declined_dm_requests: 0,
            });
        }

        let now = now_unix();
        let removed_friendship = self.store.friendship_between(blocker_id, blocked_id).await?;
        let mut batch = WriteBatch::new();
        if removed_friendship.is_some() {
            batch.push(GraphWrite::DeleteFriendship {
                user_a_id: blocker_id,
                user_b_id: blocked_id,
            });
        }
        let declined_friend_requests = self
            .decline_friend_requests_between(blocker_id, blocked_id, now, true, &mut batch)
            .await?;
        let declined_dm_requests = self
            .decline_dm_requests_between(blocker_id, blocked_id, now, &mut batch)
            .await?;
        let block = BlockedUser {
            blocker_id,
            blocked_id,
            created_at_unix: now,
        };
        batch.push(GraphWrite::InsertBlock(block));
        self.store.apply(batch).await?;
        tracing::info!(
            event = "relationship.block",
            blocker_id = %blocker_id,
            blocked_id = %blocked_id,
            removed_friendship = removed_friendship.is_some(),
            declined_friend_requests,
            declined_dm_requests,
        );
        Ok(BlockOutcome {
            block,
            already_blocked: false,
            removed_friendship,
            declined_friend_requests,
            declined_dm_requests,
        })
    }

    /// Removes only the directed edge. Friendship and requests stay
    /// gone; the relationship is rebuilt from a fresh send.
    pub async fn unblock_user(
        &self,
        blocker_id: UserId,
        blocked_id: UserId,
    ) -> Result<UnblockOutcome, AuthzError> {
        if blocker_id == blocked_id {
            return Err(AuthzError::Conflict(ConflictReason::SelfTarget));
        }
        if self.store.block(blocker_id, blocked_id).await?.is_none() {
            return Ok(UnblockOutcome { removed: false });
        }
        let mut batch = WriteBatch::new();
        batch.push(GraphWrite::DeleteBlock {
            blocker_id,
            blocked_id,
        });
        self.store.apply(batch).await?;
        tracing::info!(
            event = "relationship.unblock",
            blocker_id = %blocker_id,
            blocked_id = %blocked_id,
        );
        Ok(UnblockOutcome { removed: true })
    }

    pub async fn set_dm_filter(
        &self,
        user_id: UserId,
        filter: DmFilter,
    ) -> Result<DmSetting, AuthzError> {
        if !self.store.user_exists(user_id).await? {
            return Err(AuthzError::NotFound(Missing::User));
        }
        let mut batch = WriteBatch::new();
        batch.push(GraphWrite::SetDmFilter { user_id, filter });
        self.store.apply(batch).await?;
        tracing::info!(
            event = "relationship.dm_filter.set",
            user_id = %user_id,
            filter = filter.as_str(),
        );
        Ok(DmSetting { user_id, filter })
    }

    /// A pending request addressed to the actor. A request that exists
    /// but belongs to someone else is reported as absent, not
    /// forbidden.
    async fn pending_request_for_recipient(
        &self,
        actor_id: UserId,
        request_id: RequestId,
    ) -> Result<FriendRequest, AuthzError> {
        let request = self
            .store
            .friend_request(request_id)
            .await?
            .ok_or(AuthzError::NotFound(Missing::Request))?;
        if request.recipient_id != actor_id {
            return Err(AuthzError::NotFound(Missing::Request));
        }
        if request.status != RequestStatus::Pending {
            return Err(AuthzError::Conflict(ConflictReason::RequestNotPending));
        }
        Ok(request)
    }

    async fn existing_dm_request(
        &self,
        user_a: UserId,
        user_b: UserId,
    ) -> Result<Option<DmRequest>, AuthzError> {
        if let Some(request) = self.store.dm_request_between(user_a, user_b).await? {
            return Ok(Some(request));
        }
        Ok(self.store.dm_request_between(user_b, user_a).await?)
    }

    /// Queues declines for the friend-request rows between a pair.
    /// `pending_only` mirrors the block cascade, which downgrades only
    /// pending rows; the unfriend cascade declines accepted ones too.
    async fn decline_friend_requests_between(
        &self,
        user_a: UserId,
        user_b: UserId,
        now: i64,
        pending_only: bool,
        batch: &mut WriteBatch,
    ) -> Result<usize, AuthzError> {
        let mut declined = 0;
        for (sender, recipient) in [(user_a, user_b), (user_b, user_a)] {
            let Some(mut request) = self.store.friend_request_between(sender, recipient).await?
            else {
                continue;
            };
            let eligible = if pending_only {
                request.status == RequestStatus::Pending
            } else {
                request.status != RequestStatus::Declined
            };
            if !eligible {
                continue;
            }
            request.status = RequestStatus::Declined;
            request.responded_at_unix = Some(now);
            batch.push(GraphWrite::UpsertFriendRequest(request));
            declined += 1;
        }
        Ok(declined)
    }

    async fn decline_dm_requests_between(
        &self,
        user_a: UserId,
        user_b: UserId,
        now: i64,
        batch: &mut WriteBatch,
    ) -> Result<usize, AuthzError> {
        let mut declined = 0;
        for (sender, recipient) in [(user_a, user_b), (user_b, user_a)] {
            let Some(mut request) = self.store.dm_request_between(sender, recipient).await? else {
                continue;
            };
            if request.status == RequestStatus::Declined {
                continue;
            }
            request.status = RequestStatus::Declined;
            request.responded_at_unix = Some(now);
            batch.push(GraphWrite::UpsertDmRequest(request));
            declined += 1;
        }
        Ok(declined)
    }
}
