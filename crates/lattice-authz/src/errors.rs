use lattice_core::ConflictReason;

use crate::store::StoreError;

/// Which referenced entity was absent. Surfaced separately from
/// permission failures so callers can render "gone" vs "forbidden".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Missing {
    Server,
    Channel,
    User,
    Request,
}

impl core::fmt::Display for Missing {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let name = match self {
            Self::Server => "server",
            Self::Channel => "channel",
            Self::User => "user",
            Self::Request => "request",
        };
        write!(f, "{name}")
    }
}

/// Not-a-member and lacks-permission map to different client-visible
/// reason codes even though both are forbidden.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForbiddenReason {
    NotAMember,
    MissingPermission,
}

impl ForbiddenReason {
    #[must_use]
    pub const fn code(self) -> &'static str {
        match self {
            Self::NotAMember => "NOT_A_MEMBER",
            Self::MissingPermission => "MISSING_PERMISSION",
        }
    }
}

impl core::fmt::Display for ForbiddenReason {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}", self.code())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum AuthzError {
    #[error("{0} not found")]
    NotFound(Missing),
    #[error("forbidden: {0}")]
    Forbidden(ForbiddenReason),
    #[error("conflict: {0}")]
    Conflict(ConflictReason),
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl AuthzError {
    /// Stable reason code for the failures callers surface verbatim.
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::NotFound(_) => "NOT_FOUND",
            Self::Forbidden(reason) => reason.code(),
            Self::Conflict(reason) => reason.code(),
            Self::Store(_) => "STORE_ERROR",
        }
    }
}

pub fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .json()
        .with_env_filter(filter)
        .with_current_span(true)
        .with_span_list(true)
        .init();
}
