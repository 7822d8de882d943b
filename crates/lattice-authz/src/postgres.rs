use async_trait::async_trait;
use lattice_core::{
    canonical_pair, mask_permissions, BlockedUser, ChannelId, DmFilter, DmRequest, DmSnapshot,
    FriendRequest, Friendship, Membership, RequestId, RequestStatus, Role, RoleColor, RoleId,
    RoleName, ServerId, UserId,
};
use sqlx::{postgres::PgPoolOptions, PgPool, Row};
use tokio::sync::OnceCell;

use crate::store::{
    DirectoryStore, GraphWrite, RelationshipStore, StoreError, StoreResult, WriteBatch,
};

pub const DEFAULT_MAX_CONNECTIONS: u32 = 10;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("LATTICE_DATABASE_URL is required")]
    MissingDatabaseUrl,
    #[error("invalid LATTICE_DATABASE_MAX_CONNECTIONS value {value:?}: {source}")]
    InvalidMaxConnections {
        value: String,
        source: std::num::ParseIntError,
    },
}

#[derive(Debug, Clone)]
pub struct StoreConfig {
    pub database_url: String,
    pub max_connections: u32,
}

impl StoreConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let database_url =
            std::env::var("LATTICE_DATABASE_URL").map_err(|_| ConfigError::MissingDatabaseUrl)?;
        let max_connections = match std::env::var("LATTICE_DATABASE_MAX_CONNECTIONS") {
            Ok(value) => value
                .parse::<u32>()
                .map_err(|source| ConfigError::InvalidMaxConnections { value, source })?,
            Err(_) => DEFAULT_MAX_CONNECTIONS,
        };
        Ok(Self {
            database_url,
            max_connections,
        })
    }
}

/// Postgres backend. The pool connects lazily and the schema is
/// bootstrapped once, under an advisory lock so concurrent instances
/// do not race the DDL.
#[derive(Clone)]
pub struct PostgresStore {
    pool: PgPool,
    init: std::sync::Arc<OnceCell<()>>,
}

impl PostgresStore {
    pub fn connect_lazy(config: &StoreConfig) -> StoreResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .connect_lazy(&config.database_url)?;
        Ok(Self {
            pool,
            init: std::sync::Arc::new(OnceCell::new()),
        })
    }

    async fn ready(&self) -> StoreResult<&PgPool> {
        self.init
            .get_or_try_init(|| ensure_schema(&self.pool))
            .await?;
        Ok(&self.pool)
    }
}

#[allow(clippy::too_many_lines)]
async fn ensure_schema(pool: &PgPool) -> StoreResult<()> {
    const SCHEMA_INIT_LOCK_ID: i64 = 0x004c_4154_5449_4345;

    let mut tx = pool.begin().await?;
    sqlx::query("SELECT pg_advisory_xact_lock($1)")
        .bind(SCHEMA_INIT_LOCK_ID)
        .execute(&mut *tx)
        .await?;

    sqlx::query(
        "CREATE TABLE IF NOT EXISTS users (
            user_id TEXT PRIMARY KEY,
            created_at_unix BIGINT NOT NULL
        )",
    )
    .execute(&mut *tx)
    .await?;

    sqlx::query(
        "CREATE TABLE IF NOT EXISTS servers (
            server_id TEXT PRIMARY KEY,
            created_at_unix BIGINT NOT NULL
        )",
    )
    .execute(&mut *tx)
    .await?;

    sqlx::query(
        "CREATE TABLE IF NOT EXISTS channels (
            channel_id TEXT PRIMARY KEY,
            server_id TEXT NOT NULL REFERENCES servers(server_id) ON DELETE CASCADE
        )",
    )
    .execute(&mut *tx)
    .await?;

    sqlx::query(
        "CREATE TABLE IF NOT EXISTS roles (
            role_id TEXT PRIMARY KEY,
            server_id TEXT NOT NULL REFERENCES servers(server_id) ON DELETE CASCADE,
            name TEXT NOT NULL,
            color_hex TEXT NOT NULL,
            permission_bits BIGINT NOT NULL,
            role_position INT NOT NULL,
            is_hoisted BOOLEAN NOT NULL DEFAULT FALSE,
            is_mentionable BOOLEAN NOT NULL DEFAULT FALSE,
            created_at_unix BIGINT NOT NULL
        )",
    )
    .execute(&mut *tx)
    .await?;

    sqlx::query(
        "CREATE TABLE IF NOT EXISTS memberships (
            user_id TEXT NOT NULL REFERENCES users(user_id) ON DELETE CASCADE,
            server_id TEXT NOT NULL REFERENCES servers(server_id) ON DELETE CASCADE,
            joined_at_unix BIGINT NOT NULL,
            PRIMARY KEY (user_id, server_id)
        )",
    )
    .execute(&mut *tx)
    .await?;

    sqlx::query(
        "CREATE TABLE IF NOT EXISTS membership_roles (
            user_id TEXT NOT NULL,
            server_id TEXT NOT NULL,
            role_id TEXT NOT NULL REFERENCES roles(role_id) ON DELETE CASCADE,
            PRIMARY KEY (user_id, server_id, role_id),
            FOREIGN KEY (user_id, server_id)
                REFERENCES memberships(user_id, server_id) ON DELETE CASCADE
        )",
    )
    .execute(&mut *tx)
    .await?;

    sqlx::query(
        "CREATE TABLE IF NOT EXISTS friend_requests (
            request_id TEXT PRIMARY KEY,
            sender_user_id TEXT NOT NULL REFERENCES users(user_id) ON DELETE CASCADE,
            recipient_user_id TEXT NOT NULL REFERENCES users(user_id) ON DELETE CASCADE,
            status TEXT NOT NULL,
            created_at_unix BIGINT NOT NULL,
            responded_at_unix BIGINT NULL
        )",
    )
    .execute(&mut *tx)
    .await?;
    sqlx::query(
        "CREATE UNIQUE INDEX IF NOT EXISTS idx_friend_requests_pair_unique
            ON friend_requests(sender_user_id, recipient_user_id)",
    )
    .execute(&mut *tx)
    .await?;
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_friend_requests_recipient_created
            ON friend_requests(recipient_user_id, created_at_unix DESC)",
    )
    .execute(&mut *tx)
    .await?;

    sqlx::query(
        "CREATE TABLE IF NOT EXISTS dm_requests (
            request_id TEXT PRIMARY KEY,
            sender_user_id TEXT NOT NULL REFERENCES users(user_id) ON DELETE CASCADE,
            recipient_user_id TEXT NOT NULL REFERENCES users(user_id) ON DELETE CASCADE,
            status TEXT NOT NULL,
            created_at_unix BIGINT NOT NULL,
            responded_at_unix BIGINT NULL
        )",
    )
    .execute(&mut *tx)
    .await?;
    sqlx::query(
        "CREATE UNIQUE INDEX IF NOT EXISTS idx_dm_requests_pair_unique
            ON dm_requests(sender_user_id, recipient_user_id)",
    )
    .execute(&mut *tx)
    .await?;

    sqlx::query(
        "CREATE TABLE IF NOT EXISTS friendships (
            user_a_id TEXT NOT NULL REFERENCES users(user_id) ON DELETE CASCADE,
            user_b_id TEXT NOT NULL REFERENCES users(user_id) ON DELETE CASCADE,
            created_at_unix BIGINT NOT NULL,
            PRIMARY KEY (user_a_id, user_b_id)
        )",
    )
    .execute(&mut *tx)
    .await?;

    sqlx::query(
        "CREATE TABLE IF NOT EXISTS blocked_users (
            blocker_id TEXT NOT NULL REFERENCES users(user_id) ON DELETE CASCADE,
            blocked_id TEXT NOT NULL REFERENCES users(user_id) ON DELETE CASCADE,
            created_at_unix BIGINT NOT NULL,
            PRIMARY KEY (blocker_id, blocked_id)
        )",
    )
    .execute(&mut *tx)
    .await?;

    sqlx::query(
        "CREATE TABLE IF NOT EXISTS dm_settings (
            user_id TEXT PRIMARY KEY REFERENCES users(user_id) ON DELETE CASCADE,
            filter TEXT NOT NULL
        )",
    )
    .execute(&mut *tx)
    .await?;

    tx.commit().await?;
    Ok(())
}

fn corrupt(error: impl std::fmt::Display) -> StoreError {
    StoreError::Corrupt(error.to_string())
}

fn parse_user_id(value: String) -> StoreResult<UserId> {
    UserId::try_from(value).map_err(corrupt)
}

fn parse_request_id(value: String) -> StoreResult<RequestId> {
    RequestId::try_from(value).map_err(corrupt)
}

/// Unrecognized stored filter values fail closed to the most
/// restrictive setting.
fn parse_filter(value: Option<String>) -> DmFilter {
    match value {
        None => DmFilter::default(),
        Some(raw) => DmFilter::try_from(raw).unwrap_or(DmFilter::Nobody),
    }
}

fn request_fields(
    row: &sqlx::postgres::PgRow,
) -> StoreResult<(RequestId, UserId, UserId, RequestStatus, i64, Option<i64>)> {
    let id = parse_request_id(row.try_get("request_id")?)?;
    let sender_id = parse_user_id(row.try_get("sender_user_id")?)?;
    let recipient_id = parse_user_id(row.try_get("recipient_user_id")?)?;
    let status = RequestStatus::try_from(row.try_get::<String, _>("status")?).map_err(corrupt)?;
    let created_at_unix = row.try_get("created_at_unix")?;
    let responded_at_unix = row.try_get("responded_at_unix")?;
    Ok((
        id,
        sender_id,
        recipient_id,
        status,
        created_at_unix,
        responded_at_unix,
    ))
}

fn friend_request_from_row(row: &sqlx::postgres::PgRow) -> StoreResult<FriendRequest> {
    let (id, sender_id, recipient_id, status, created_at_unix, responded_at_unix) =
        request_fields(row)?;
    Ok(FriendRequest {
        id,
        sender_id,
        recipient_id,
        status,
        created_at_unix,
        responded_at_unix,
    })
}

fn dm_request_from_row(row: &sqlx::postgres::PgRow) -> StoreResult<DmRequest> {
    let (id, sender_id, recipient_id, status, created_at_unix, responded_at_unix) =
        request_fields(row)?;
    Ok(DmRequest {
        id,
        sender_id,
        recipient_id,
        status,
        created_at_unix,
        responded_at_unix,
    })
}

fn friendship_from_row(row: &sqlx::postgres::PgRow) -> StoreResult<Friendship> {
    Ok(Friendship {
        user_a_id: parse_user_id(row.try_get("user_a_id")?)?,
        user_b_id: parse_user_id(row.try_get("user_b_id")?)?,
        created_at_unix: row.try_get("created_at_unix")?,
    })
}

#[async_trait]
impl DirectoryStore for PostgresStore {
    async fn server_exists(&self, server_id: ServerId) -> StoreResult<bool> {
        let pool = self.ready().await?;
        let row = sqlx::query("SELECT 1 FROM servers WHERE server_id = $1")
            .bind(server_id.to_string())
            .fetch_optional(pool)
            .await?;
        Ok(row.is_some())
    }

    async fn channel_server(&self, channel_id: ChannelId) -> StoreResult<Option<ServerId>> {
        let pool = self.ready().await?;
        let row = sqlx::query("SELECT server_id FROM channels WHERE channel_id = $1")
            .bind(channel_id.to_string())
            .fetch_optional(pool)
            .await?;
        let Some(row) = row else {
            return Ok(None);
        };
        let server_id = ServerId::try_from(row.try_get::<String, _>("server_id")?)
            .map_err(corrupt)?;
        Ok(Some(server_id))
    }

    async fn membership(
        &self,
        user_id: UserId,
        server_id: ServerId,
    ) -> StoreResult<Option<Membership>> {
        let pool = self.ready().await?;
        let membership_row = sqlx::query(
            "SELECT joined_at_unix FROM memberships WHERE user_id = $1 AND server_id = $2",
        )
        .bind(user_id.to_string())
        .bind(server_id.to_string())
        .fetch_optional(pool)
        .await?;
        let Some(membership_row) = membership_row else {
            return Ok(None);
        };
        let joined_at_unix: i64 = membership_row.try_get("joined_at_unix")?;

        let role_rows = sqlx::query(
            "SELECT r.role_id, r.name, r.color_hex, r.permission_bits, r.role_position,
                    r.is_hoisted, r.is_mentionable, r.created_at_unix
             FROM membership_roles mr
             JOIN roles r ON r.role_id = mr.role_id
             WHERE mr.user_id = $1 AND mr.server_id = $2
             ORDER BY r.role_position",
        )
        .bind(user_id.to_string())
        .bind(server_id.to_string())
        .fetch_all(pool)
        .await?;

        let mut roles = Vec::with_capacity(role_rows.len());
        for row in role_rows {
            let raw_bits: i64 = row.try_get("permission_bits")?;
            let (permissions, _unknown) =
                mask_permissions(u64::try_from(raw_bits).map_err(corrupt)?);
            roles.push(Role {
                id: RoleId::try_from(row.try_get::<String, _>("role_id")?).map_err(corrupt)?,
                server_id,
                name: RoleName::try_from(row.try_get::<String, _>("name")?).map_err(corrupt)?,
                color: RoleColor::try_from(row.try_get::<String, _>("color_hex")?)
                    .map_err(corrupt)?,
                permissions,
                position: row.try_get("role_position")?,
                is_hoisted: row.try_get("is_hoisted")?,
                is_mentionable: row.try_get("is_mentionable")?,
                created_at_unix: row.try_get("created_at_unix")?,
            });
        }
        Ok(Some(Membership {
            user_id,
            server_id,
            roles,
            joined_at_unix,
        }))
    }
}

#[async_trait]
impl RelationshipStore for PostgresStore {
    async fn user_exists(&self, user_id: UserId) -> StoreResult<bool> {
        let pool = self.ready().await?;
        let row = sqlx::query("SELECT 1 FROM users WHERE user_id = $1")
            .bind(user_id.to_string())
            .fetch_optional(pool)
            .await?;
        Ok(row.is_some())
    }

    async fn friend_request(&self, request_id: RequestId) -> StoreResult<Option<FriendRequest>> {
        let pool = self.ready().await?;
        let row = sqlx::query(
            "SELECT request_id, sender_user_id, recipient_user_id, status,
                    created_at_unix, responded_at_unix
             FROM friend_requests WHERE request_id = $1",
        )
        .bind(request_id.to_string())
        .fetch_optional(pool)
        .await?;
        row.as_ref().map(friend_request_from_row).transpose()
    }

    async fn friend_request_between(
        &self,
        sender_id: UserId,
        recipient_id: UserId,
    ) -> StoreResult<Option<FriendRequest>> {
        let pool = self.ready().await?;
        let row = sqlx::query(
            "SELECT request_id, sender_user_id, recipient_user_id, status,
                    created_at_unix, responded_at_unix
             FROM friend_requests
             WHERE sender_user_id = $1 AND recipient_user_id = $2",
        )
        .bind(sender_id.to_string())
        .bind(recipient_id.to_string())
        .fetch_optional(pool)
        .await?;
        row.as_ref().map(friend_request_from_row).transpose()
    }

    async fn dm_request_between(
        &self,
        sender_id: UserId,
        recipient_id: UserId,
    ) -> StoreResult<Option<DmRequest>> {
        let pool = self.ready().await?;
        let row = sqlx::query(
            "SELECT request_id, sender_user_id, recipient_user_id, status,
                    created_at_unix, responded_at_unix
             FROM dm_requests
             WHERE sender_user_id = $1 AND recipient_user_id = $2",
        )
        .bind(sender_id.to_string())
        .bind(recipient_id.to_string())
        .fetch_optional(pool)
        .await?;
        row.as_ref().map(dm_request_from_row).transpose()
    }

    async fn friendship_between(
        &self,
        user_a: UserId,
        user_b: UserId,
    ) -> StoreResult<Option<Friendship>> {
        let pool = self.ready().await?;
        let (pair_a, pair_b) = canonical_pair(user_a, user_b);
        let row = sqlx::query(
            "SELECT user_a_id, user_b_id, created_at_unix
             FROM friendships WHERE user_a_id = $1 AND user_b_id = $2",
        )
        .bind(pair_a.to_string())
        .bind(pair_b.to_string())
        .fetch_optional(pool)
        .await?;
        row.as_ref().map(friendship_from_row).transpose()
    }

    async fn block(
        &self,
        blocker_id: UserId,
        blocked_id: UserId,
    ) -> StoreResult<Option<BlockedUser>> {
        let pool = self.ready().await?;
        let row = sqlx::query(
            "SELECT created_at_unix FROM blocked_users
             WHERE blocker_id = $1 AND blocked_id = $2",
        )
        .bind(blocker_id.to_string())
        .bind(blocked_id.to_string())
        .fetch_optional(pool)
        .await?;
        let Some(row) = row else {
            return Ok(None);
        };
        Ok(Some(BlockedUser {
            blocker_id,
            blocked_id,
            created_at_unix: row.try_get("created_at_unix")?,
        }))
    }

    async fn dm_filter(&self, user_id: UserId) -> StoreResult<DmFilter> {
        let pool = self.ready().await?;
        let row = sqlx::query("SELECT filter FROM dm_settings WHERE user_id = $1")
            .bind(user_id.to_string())
            .fetch_optional(pool)
            .await?;
        let stored = row
            .map(|row| row.try_get::<String, _>("filter"))
            .transpose()?;
        Ok(parse_filter(stored))
    }

    async fn dm_snapshot(
        &self,
        sender_id: UserId,
        recipient_id: UserId,
    ) -> StoreResult<DmSnapshot> {
        let pool = self.ready().await?;
        let (pair_a, pair_b) = canonical_pair(sender_id, recipient_id);
        // One statement, one snapshot: the gate never sees a block
        // without the cleanup that was committed alongside it.
        let row = sqlx::query(
            "SELECT
                EXISTS(
                    SELECT 1 FROM blocked_users
                    WHERE (blocker_id = $1 AND blocked_id = $2)
                       OR (blocker_id = $2 AND blocked_id = $1)
                ) AS blocked,
                EXISTS(
                    SELECT 1 FROM friendships
                    WHERE user_a_id = $3 AND user_b_id = $4
                ) AS friends,
                EXISTS(
                    SELECT 1 FROM dm_requests
                    WHERE status = 'accepted'
                      AND ((sender_user_id = $1 AND recipient_user_id = $2)
                        OR (sender_user_id = $2 AND recipient_user_id = $1))
                ) AS consent,
                (SELECT filter FROM dm_settings WHERE user_id = $2) AS filter",
        )
        .bind(sender_id.to_string())
        .bind(recipient_id.to_string())
        .bind(pair_a.to_string())
        .bind(pair_b.to_string())
        .fetch_one(pool)
        .await?;
        Ok(DmSnapshot {
            blocked_either_direction: row.try_get("blocked")?,
            are_friends: row.try_get("friends")?,
            has_accepted_dm_request: row.try_get("consent")?,
            recipient_filter: parse_filter(row.try_get("filter")?),
        })
    }

    async fn friends_of(&self, user_id: UserId) -> StoreResult<Vec<Friendship>> {
        let pool = self.ready().await?;
        let rows = sqlx::query(
            "SELECT user_a_id, user_b_id, created_at_unix
             FROM friendships
             WHERE user_a_id = $1 OR user_b_id = $1
             ORDER BY created_at_unix DESC",
        )
        .bind(user_id.to_string())
        .fetch_all(pool)
        .await?;
        rows.iter().map(friendship_from_row).collect()
    }

    async fn pending_requests_for(&self, user_id: UserId) -> StoreResult<Vec<FriendRequest>> {
        let pool = self.ready().await?;
        let rows = sqlx::query(
            "SELECT request_id, sender_user_id, recipient_user_id, status,
                    created_at_unix, responded_at_unix
             FROM friend_requests
             WHERE status = 'pending'
               AND (sender_user_id = $1 OR recipient_user_id = $1)
             ORDER BY created_at_unix DESC",
        )
        .bind(user_id.to_string())
        .fetch_all(pool)
        .await?;
        rows.iter().map(friend_request_from_row).collect()
    }

    async fn apply(&self, batch: WriteBatch) -> StoreResult<()> {
        let pool = self.ready().await?;
        let mut tx = pool.begin().await?;
        for write in batch.into_writes() {
            match write {
                GraphWrite::UpsertFriendRequest(request) => {
                    // The pair index keeps the original request_id when
                    // a concurrent send already inserted the row.
                    sqlx::query(
                        "INSERT INTO friend_requests
                            (request_id, sender_user_id, recipient_user_id, status,
                             created_at_unix, responded_at_unix)
                         VALUES ($1, $2, $3, $4, $5, $6)
                         ON CONFLICT (sender_user_id, recipient_user_id) DO UPDATE
                         SET status = EXCLUDED.status,
                             created_at_unix = EXCLUDED.created_at_unix,
                             responded_at_unix = EXCLUDED.responded_at_unix",
                    )
                    .bind(request.id.to_string())
                    .bind(request.sender_id.to_string())
                    .bind(request.recipient_id.to_string())
                    .bind(request.status.as_str())
                    .bind(request.created_at_unix)
                    .bind(request.responded_at_unix)
                    .execute(&mut *tx)
                    .await?;
                }
                GraphWrite::UpsertDmRequest(request) => {
                    sqlx::query(
                        "INSERT INTO dm_requests
                            (request_id, sender_user_id, recipient_user_id, status,
                             created_at_unix, responded_at_unix)
                         VALUES ($1, $2, $3, $4, $5, $6)
                         ON CONFLICT (sender_user_id, recipient_user_id) DO UPDATE
                         SET status = EXCLUDED.status,
                             created_at_unix = EXCLUDED.created_at_unix,
                             responded_at_unix = EXCLUDED.responded_at_unix",
                    )
                    .bind(request.id.to_string())
                    .bind(request.sender_id.to_string())
                    .bind(request.recipient_id.to_string())
                    .bind(request.status.as_str())
                    .bind(request.created_at_unix)
                    .bind(request.responded_at_unix)
                    .execute(&mut *tx)
                    .await?;
                }
                GraphWrite::InsertFriendship(friendship) => {
                    sqlx::query(
                        "INSERT INTO friendships (user_a_id, user_b_id, created_at_unix)
                         VALUES ($1, $2, $3)
                         ON CONFLICT (user_a_id, user_b_id) DO NOTHING",
                    )
                    .bind(friendship.user_a_id.to_string())
                    .bind(friendship.user_b_id.to_string())
                    .bind(friendship.created_at_unix)
                    .execute(&mut *tx)
                    .await?;
                }
                GraphWrite::DeleteFriendship {
                    user_a_id,
                    user_b_id,
                } => {
                    let (pair_a, pair_b) = canonical_pair(user_a_id, user_b_id);
                    sqlx::query(
                        "DELETE FROM friendships WHERE user_a_id = $1 AND user_b_id = $2",
                    )
                    .bind(pair_a.to_string())
                    .bind(pair_b.to_string())
                    .execute(&mut *tx)
                    .await?;
                }
                GraphWrite::InsertBlock(block) => {
                    sqlx::query(
                        "INSERT INTO blocked_users (blocker_id, blocked_id, created_at_unix)
                         VALUES ($1, $2, $3)
                         ON CONFLICT (blocker_id, blocked_id) DO NOTHING",
                    )
                    .bind(block.blocker_id.to_string())
                    .bind(block.blocked_id.to_string())
                    .bind(block.created_at_unix)
                    .execute(&mut *tx)
                    .await?;
                }
                GraphWrite::DeleteBlock {
                    blocker_id,
                    blocked_id,
                } => {
                    sqlx::query(
                        "DELETE FROM blocked_users WHERE blocker_id = $1 AND blocked_id = $2",
                    )
                    .bind(blocker_id.to_string())
                    .bind(blocked_id.to_string())
                    .execute(&mut *tx)
                    .await?;
                }
                GraphWrite::SetDmFilter { user_id, filter } => {
                    sqlx::query(
                        "INSERT INTO dm_settings (user_id, filter)
                         VALUES ($1, $2)
                         ON CONFLICT (user_id) DO UPDATE SET filter = EXCLUDED.filter",
                    )
                    .bind(user_id.to_string())
                    .bind(filter.as_str())
                    .execute(&mut *tx)
                    .await?;
                }
            }
        }
        tx.commit().await?;
        Ok(())
    }
}
