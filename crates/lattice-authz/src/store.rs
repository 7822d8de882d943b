use async_trait::async_trait;
use lattice_core::{
    BlockedUser, ChannelId, DmFilter, DmRequest, DmSnapshot, FriendRequest, Friendship,
    Membership, RequestId, ServerId, UserId,
};

pub type StoreResult<T> = Result<T, StoreError>;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("referenced row is missing: {0}")]
    MissingReference(&'static str),
    #[error("store holds invalid data: {0}")]
    Corrupt(String),
    #[error("limit exceeded: {0}")]
    LimitExceeded(&'static str),
}

pub(crate) fn now_unix() -> i64 {
    let now = std::time::SystemTime::now();
    let seconds = now
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_else(|_| std::time::Duration::from_secs(0))
        .as_secs();
    i64::try_from(seconds).unwrap_or(i64::MAX)
}

/// Membership and channel lookups the permission resolver reads from.
/// The resolver never writes; role and membership maintenance belong
/// to the surrounding system.
#[async_trait]
pub trait DirectoryStore: Send + Sync {
    async fn server_exists(&self, server_id: ServerId) -> StoreResult<bool>;

    /// The owning server of a channel, if the channel exists. Channels
    /// carry no permission overlay of their own.
    async fn channel_server(&self, channel_id: ChannelId) -> StoreResult<Option<ServerId>>;

    /// A membership with its full role set, fetched as one snapshot.
    async fn membership(
        &self,
        user_id: UserId,
        server_id: ServerId,
    ) -> StoreResult<Option<Membership>>;
}

/// One write against the relationship graph. Batches are applied in
/// order and atomically; a reader never observes a half-applied batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GraphWrite {
    /// Keyed on the ordered (sender, recipient) pair. When a row for
    /// the pair already exists its request id is kept, so concurrent
    /// sends collapse into one logical request.
    UpsertFriendRequest(FriendRequest),
    UpsertDmRequest(DmRequest),
    /// No-op when the canonical pair is already present.
    InsertFriendship(Friendship),
    DeleteFriendship { user_a_id: UserId, user_b_id: UserId },
    /// No-op when the directed edge is already present.
    InsertBlock(BlockedUser),
    DeleteBlock { blocker_id: UserId, blocked_id: UserId },
    SetDmFilter { user_id: UserId, filter: DmFilter },
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WriteBatch {
    writes: Vec<GraphWrite>,
}

impl WriteBatch {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, write: GraphWrite) {
        self.writes.push(write);
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.writes.is_empty()
    }

    #[must_use]
    pub fn into_writes(self) -> Vec<GraphWrite> {
        self.writes
    }
}

/// The relationship graph behind the gate and the mutator. Reads are
/// point lookups over ordered pairs; all writes go through
/// [`RelationshipStore::apply`].
#[async_trait]
pub trait RelationshipStore: Send + Sync {
    async fn user_exists(&self, user_id: UserId) -> StoreResult<bool>;

    async fn friend_request(&self, request_id: RequestId) -> StoreResult<Option<FriendRequest>>;

    /// The row for the ordered (sender, recipient) pair only; the
    /// reverse direction is a distinct row.
    async fn friend_request_between(
        &self,
        sender_id: UserId,
        recipient_id: UserId,
    ) -> StoreResult<Option<FriendRequest>>;

    async fn dm_request_between(
        &self,
        sender_id: UserId,
        recipient_id: UserId,
    ) -> StoreResult<Option<DmRequest>>;

    /// Order-insensitive friendship lookup.
    async fn friendship_between(
        &self,
        user_a: UserId,
        user_b: UserId,
    ) -> StoreResult<Option<Friendship>>;

    /// Directed block edge lookup.
    async fn block(
        &self,
        blocker_id: UserId,
        blocked_id: UserId,
    ) -> StoreResult<Option<BlockedUser>>;

    /// The user's DM filter, defaulting when none is stored.
    async fn dm_filter(&self, user_id: UserId) -> StoreResult<DmFilter>;

    /// Everything the DM gate needs about one pair, read from a single
    /// consistent snapshot.
    async fn dm_snapshot(
        &self,
        sender_id: UserId,
        recipient_id: UserId,
    ) -> StoreResult<DmSnapshot>;

    async fn friends_of(&self, user_id: UserId) -> StoreResult<Vec<Friendship>>;

    /// Pending requests involving the user, newest first.
    async fn pending_requests_for(&self, user_id: UserId) -> StoreResult<Vec<FriendRequest>>;

    /// Commits the batch atomically. On failure the graph is left
    /// unchanged, never half-written.
    async fn apply(&self, batch: WriteBatch) -> StoreResult<()>;
}
