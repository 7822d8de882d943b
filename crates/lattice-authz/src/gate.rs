use std::sync::Arc;

use lattice_core::{evaluate_dm_gate, DmFilter, DmVerdict, FriendRequest, Friendship, UserId};

use crate::errors::AuthzError;
use crate::store::RelationshipStore;

/// Decides whether one user may open a direct message to another. The
/// verdict is recomputed from a fresh store snapshot on every call, so
/// a block, unfriend, or filter change takes effect on the next send.
#[derive(Clone)]
pub struct RelationshipGate<S> {
    store: Arc<S>,
}

impl<S: RelationshipStore> RelationshipGate<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self { store }
    }

    pub async fn can_message(
        &self,
        sender_id: UserId,
        recipient_id: UserId,
    ) -> Result<DmVerdict, AuthzError> {
        if sender_id == recipient_id {
            // A user always reaches their own notes; no edge can exist
            // for the degenerate pair.
            return Ok(DmVerdict::Allowed);
        }
        let snapshot = self.store.dm_snapshot(sender_id, recipient_id).await?;
        let verdict = evaluate_dm_gate(&snapshot);
        tracing::debug!(
            event = "authz.dm_gate.verdict",
            sender_id = %sender_id,
            recipient_id = %recipient_id,
            verdict = ?verdict,
        );
        Ok(verdict)
    }

    pub async fn friends_of(&self, user_id: UserId) -> Result<Vec<Friendship>, AuthzError> {
        Ok(self.store.friends_of(user_id).await?)
    }

    /// The user's own filter setting, defaulting when none is stored.
    pub async fn dm_filter(&self, user_id: UserId) -> Result<DmFilter, AuthzError> {
        Ok(self.store.dm_filter(user_id).await?)
    }

    /// Pending friend requests involving the user, newest first, split
    /// into incoming and outgoing.
    pub async fn requests_for(
        &self,
        user_id: UserId,
    ) -> Result<(Vec<FriendRequest>, Vec<FriendRequest>), AuthzError> {
        let requests = self.store.pending_requests_for(user_id).await?;
        let (incoming, outgoing) = requests
            .into_iter()
            .partition(|request| request.recipient_id == user_id);
        Ok((incoming, outgoing))
    }
}
