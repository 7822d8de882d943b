#![forbid(unsafe_code)]

pub mod errors;
pub mod gate;
pub mod memory;
pub mod mutator;
pub mod postgres;
pub mod resolver;
pub mod store;

pub use errors::{init_tracing, AuthzError, ForbiddenReason, Missing};
pub use gate::RelationshipGate;
pub use memory::MemoryStore;
pub use mutator::{
    AcceptOutcome, BlockOutcome, RelationshipMutator, RemoveFriendOutcome, SendOutcome,
    UnblockOutcome,
};
pub use postgres::{ConfigError, PostgresStore, StoreConfig};
pub use resolver::{PermissionDecision, PermissionResolver};
pub use store::{DirectoryStore, GraphWrite, RelationshipStore, StoreError, StoreResult, WriteBatch};
