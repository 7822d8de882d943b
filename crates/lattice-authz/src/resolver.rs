use std::sync::Arc;

use lattice_core::{permits, ChannelId, PermissionSet, ServerId, UserId};

use crate::errors::{AuthzError, ForbiddenReason, Missing};
use crate::store::DirectoryStore;

/// The two-part answer every permission check produces. Membership and
/// permission failures are distinct client-visible outcomes, so both
/// facts travel together.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PermissionDecision {
    pub is_member: bool,
    pub allowed: bool,
}

impl PermissionDecision {
    /// The refusal to surface, if any.
    #[must_use]
    pub const fn forbidden_reason(self) -> Option<ForbiddenReason> {
        if !self.is_member {
            Some(ForbiddenReason::NotAMember)
        } else if !self.allowed {
            Some(ForbiddenReason::MissingPermission)
        } else {
            None
        }
    }
}

/// Stateless permission checks over directory snapshots. Each call
/// fetches the membership once and evaluates it without locking.
#[derive(Clone)]
pub struct PermissionResolver<S> {
    store: Arc<S>,
}

impl<S: DirectoryStore> PermissionResolver<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self { store }
    }

    /// Membership existence, separate from any specific permission.
    /// Fails with `NotFound` when the server itself is gone, which is
    /// never folded into a "no" answer.
    pub async fn is_member(&self, user_id: UserId, server_id: ServerId) -> Result<bool, AuthzError> {
        if !self.store.server_exists(server_id).await? {
            return Err(AuthzError::NotFound(Missing::Server));
        }
        Ok(self.store.membership(user_id, server_id).await?.is_some())
    }

    pub async fn resolve_server(
        &self,
        user_id: UserId,
        server_id: ServerId,
        required: PermissionSet,
    ) -> Result<PermissionDecision, AuthzError> {
        if !self.store.server_exists(server_id).await? {
            return Err(AuthzError::NotFound(Missing::Server));
        }
        let Some(membership) = self.store.membership(user_id, server_id).await? else {
            return Ok(PermissionDecision {
                is_member: false,
                allowed: false,
            });
        };
        let allowed = permits(membership.effective_permissions(), required);
        tracing::debug!(
            event = "authz.permission.resolve",
            user_id = %user_id,
            server_id = %server_id,
            required_bits = required.bits(),
            allowed,
        );
        Ok(PermissionDecision {
            is_member: true,
            allowed,
        })
    }

    /// Channels carry no permission overlay: the check resolves the
    /// owning server, then proceeds as a server check.
    pub async fn resolve_channel(
        &self,
        user_id: UserId,
        channel_id: ChannelId,
        required: PermissionSet,
    ) -> Result<PermissionDecision, AuthzError> {
        let Some(server_id) = self.store.channel_server(channel_id).await? else {
            return Err(AuthzError::NotFound(Missing::Channel));
        };
        self.resolve_server(user_id, server_id, required).await
    }

    /// Convenience guard: `Ok` only when the user is a member holding
    /// every required bit, otherwise the matching `Forbidden` reason.
    pub async fn require_server(
        &self,
        user_id: UserId,
        server_id: ServerId,
        required: PermissionSet,
    ) -> Result<(), AuthzError> {
        let decision = self.resolve_server(user_id, server_id, required).await?;
        match decision.forbidden_reason() {
            None => Ok(()),
            Some(reason) => Err(AuthzError::Forbidden(reason)),
        }
    }
}
