#![forbid(unsafe_code)]

use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Returns the project code name.
#[must_use]
pub const fn project_name() -> &'static str {
    "lattice"
}

pub const EVERYONE_ROLE_NAME: &str = "@everyone";
pub const ADMIN_ROLE_NAME: &str = "Admin";

pub const MAX_ROLES_PER_SERVER: usize = 64;
pub const MAX_MEMBER_ROLE_ASSIGNMENTS: usize = 16;
pub const MAX_ROLE_NAME_CHARS: usize = 32;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum DomainError {
    #[error("role name is invalid")]
    InvalidRoleName,
    #[error("role color is invalid")]
    InvalidRoleColor,
    #[error("user id is invalid")]
    InvalidUserId,
    #[error("server id is invalid")]
    InvalidServerId,
    #[error("channel id is invalid")]
    InvalidChannelId,
    #[error("role id is invalid")]
    InvalidRoleId,
    #[error("request id is invalid")]
    InvalidRequestId,
    #[error("request status is invalid")]
    InvalidRequestStatus,
    #[error("dm filter is invalid")]
    InvalidDmFilter,
}

macro_rules! ulid_id {
    ($name:ident, $error:ident) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
        pub struct $name(Ulid);

        impl $name {
            #[must_use]
            pub fn new() -> Self {
                Self(Ulid::new())
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl TryFrom<String> for $name {
            type Error = DomainError;

            fn try_from(value: String) -> Result<Self, Self::Error> {
                let parsed = Ulid::from_string(&value).map_err(|_| DomainError::$error)?;
                Ok(Self(parsed))
            }
        }

        impl core::fmt::Display for $name {
            fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

ulid_id!(UserId, InvalidUserId);
ulid_id!(ServerId, InvalidServerId);
ulid_id!(ChannelId, InvalidChannelId);
ulid_id!(RoleId, InvalidRoleId);
ulid_id!(RequestId, InvalidRequestId);

/// One independent capability. Bit values are assigned once in
/// `permission_mask` and are persisted; they are never renumbered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Permission {
    ViewChannels,
    SendMessages,
    AttachFiles,
    CreateInvite,
    ManageMessages,
    KickMembers,
    BanMembers,
    ManageChannels,
    ManageRoles,
    ManageServer,
    ViewAuditLog,
    Administrator,
}

const KNOWN_PERMISSIONS: [Permission; 12] = [
    Permission::ViewChannels,
    Permission::SendMessages,
    Permission::AttachFiles,
    Permission::CreateInvite,
    Permission::ManageMessages,
    Permission::KickMembers,
    Permission::BanMembers,
    Permission::ManageChannels,
    Permission::ManageRoles,
    Permission::ManageServer,
    Permission::ViewAuditLog,
    Permission::Administrator,
];

const fn permission_mask(permission: Permission) -> u64 {
    match permission {
        Permission::ViewChannels => 1 << 0,
        Permission::SendMessages => 1 << 1,
        Permission::AttachFiles => 1 << 2,
        Permission::CreateInvite => 1 << 3,
        Permission::ManageMessages => 1 << 4,
        Permission::KickMembers => 1 << 5,
        Permission::BanMembers => 1 << 6,
        Permission::ManageChannels => 1 << 7,
        Permission::ManageRoles => 1 << 8,
        Permission::ManageServer => 1 << 9,
        Permission::ViewAuditLog => 1 << 10,
        Permission::Administrator => 1 << 11,
    }
}

#[must_use]
pub fn known_permission_mask() -> u64 {
    KNOWN_PERMISSIONS
        .into_iter()
        .fold(0_u64, |bits, permission| bits | permission_mask(permission))
}

/// Splits raw persisted bits into the recognized set and the unknown
/// remainder. Unknown bits never take part in evaluation.
#[must_use]
pub fn mask_permissions(raw_bits: u64) -> (PermissionSet, u64) {
    let mask = known_permission_mask();
    let masked = raw_bits & mask;
    let unknown = raw_bits & !mask;
    (PermissionSet::from_bits(masked), unknown)
}

#[must_use]
pub fn all_permissions() -> PermissionSet {
    PermissionSet::from_bits(known_permission_mask())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PermissionSet(u64);

impl PermissionSet {
    #[must_use]
    pub const fn empty() -> Self {
        Self(0)
    }

    #[must_use]
    pub const fn from_bits(bits: u64) -> Self {
        Self(bits)
    }

    #[must_use]
    pub fn of(permissions: &[Permission]) -> Self {
        let mut set = Self::empty();
        for permission in permissions {
            set.insert(*permission);
        }
        set
    }

    #[must_use]
    pub const fn bits(self) -> u64 {
        self.0
    }

    #[must_use]
    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    #[must_use]
    pub const fn contains(self, permission: Permission) -> bool {
        self.0 & permission_mask(permission) != 0
    }

    pub fn insert(&mut self, permission: Permission) {
        self.0 |= permission_mask(permission);
    }

    pub fn remove(&mut self, permission: Permission) {
        self.0 &= !permission_mask(permission);
    }

    #[must_use]
    pub const fn union(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }
}

/// OR-fold of role bitmasks. An empty slice yields the empty set, so a
/// membership without roles satisfies no non-trivial permission.
#[must_use]
pub fn effective_permissions(role_permissions: &[PermissionSet]) -> PermissionSet {
    let mut bits = 0;
    for set in role_permissions {
        bits |= set.bits();
    }
    PermissionSet::from_bits(bits)
}

/// Administrator satisfies every check; otherwise every required bit
/// must be present.
#[must_use]
pub const fn permits(effective: PermissionSet, required: PermissionSet) -> bool {
    if effective.contains(Permission::Administrator) {
        return true;
    }
    effective.bits() & required.bits() == required.bits()
}

#[must_use]
pub fn default_everyone_permissions() -> PermissionSet {
    PermissionSet::of(&[Permission::ViewChannels, Permission::SendMessages])
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RoleName(String);

impl RoleName {
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for RoleName {
    type Error = DomainError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        if !(1..=MAX_ROLE_NAME_CHARS).contains(&value.len()) {
            return Err(DomainError::InvalidRoleName);
        }
        if value.chars().all(|c| c.is_ascii_graphic() || c == ' ') {
            return Ok(Self(value));
        }
        Err(DomainError::InvalidRoleName)
    }
}

/// `#RRGGBB`, uppercase or lowercase hex digits.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RoleColor(String);

impl RoleColor {
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    #[must_use]
    pub fn neutral() -> Self {
        Self(String::from("#99aab5"))
    }
}

impl TryFrom<String> for RoleColor {
    type Error = DomainError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        let rest = value.strip_prefix('#').ok_or(DomainError::InvalidRoleColor)?;
        if rest.len() == 6 && rest.chars().all(|c| c.is_ascii_hexdigit()) {
            return Ok(Self(value));
        }
        Err(DomainError::InvalidRoleColor)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Role {
    pub id: RoleId,
    pub server_id: ServerId,
    pub name: RoleName,
    pub color: RoleColor,
    pub permissions: PermissionSet,
    pub position: i32,
    pub is_hoisted: bool,
    pub is_mentionable: bool,
    pub created_at_unix: i64,
}

impl Role {
    /// The default role every server is created with. Its name and
    /// position are fixed; only its permission bits may change.
    #[must_use]
    pub fn everyone(server_id: ServerId, created_at_unix: i64) -> Self {
        Self {
            id: RoleId::new(),
            server_id,
            name: RoleName(String::from(EVERYONE_ROLE_NAME)),
            color: RoleColor::neutral(),
            permissions: default_everyone_permissions(),
            position: 0,
            is_hoisted: false,
            is_mentionable: false,
            created_at_unix,
        }
    }

    /// The creation-time administrator role. Any role may be granted
    /// `Administrator` later; this is only the conventional one.
    #[must_use]
    pub fn admin(server_id: ServerId, created_at_unix: i64) -> Self {
        Self {
            id: RoleId::new(),
            server_id,
            name: RoleName(String::from(ADMIN_ROLE_NAME)),
            color: RoleColor::neutral(),
            permissions: PermissionSet::of(&[Permission::Administrator]),
            position: 1,
            is_hoisted: true,
            is_mentionable: false,
            created_at_unix,
        }
    }

    #[must_use]
    pub fn is_everyone(&self) -> bool {
        self.name.as_str() == EVERYONE_ROLE_NAME
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Membership {
    pub user_id: UserId,
    pub server_id: ServerId,
    pub roles: Vec<Role>,
    pub joined_at_unix: i64,
}

impl Membership {
    #[must_use]
    pub fn effective_permissions(&self) -> PermissionSet {
        let sets: Vec<PermissionSet> = self.roles.iter().map(|role| role.permissions).collect();
        effective_permissions(&sets)
    }

    #[must_use]
    pub fn has_everyone(&self) -> bool {
        self.roles.iter().any(Role::is_everyone)
    }

    #[must_use]
    pub fn highest_position(&self) -> i32 {
        self.roles.iter().map(|role| role.position).max().unwrap_or(0)
    }
}

/// Restores the `@everyone` membership invariant over a replacement
/// role set. Applied at creation, join, and every role-set replacement.
#[must_use]
pub fn role_set_with_everyone(mut roles: Vec<Role>, everyone: Role) -> Vec<Role> {
    roles.retain(|role| !role.is_everyone());
    roles.insert(0, everyone);
    roles
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestStatus {
    Pending,
    Accepted,
    Declined,
}

impl RequestStatus {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Accepted => "accepted",
            Self::Declined => "declined",
        }
    }
}

impl TryFrom<String> for RequestStatus {
    type Error = DomainError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        match value.as_str() {
            "pending" => Ok(Self::Pending),
            "accepted" => Ok(Self::Accepted),
            "declined" => Ok(Self::Declined),
            _ => Err(DomainError::InvalidRequestStatus),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FriendRequest {
    pub id: RequestId,
    pub sender_id: UserId,
    pub recipient_id: UserId,
    pub status: RequestStatus,
    pub created_at_unix: i64,
    pub responded_at_unix: Option<i64>,
}

impl FriendRequest {
    #[must_use]
    pub fn pending(sender_id: UserId, recipient_id: UserId, created_at_unix: i64) -> Self {
        Self {
            id: RequestId::new(),
            sender_id,
            recipient_id,
            status: RequestStatus::Pending,
            created_at_unix,
            responded_at_unix: None,
        }
    }
}

/// Consent record that two non-friend users may exchange direct
/// messages. Mirrors `FriendRequest` and is kept current on accept.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DmRequest {
    pub id: RequestId,
    pub sender_id: UserId,
    pub recipient_id: UserId,
    pub status: RequestStatus,
    pub created_at_unix: i64,
    pub responded_at_unix: Option<i64>,
}

impl DmRequest {
    #[must_use]
    pub fn accepted(sender_id: UserId, recipient_id: UserId, at_unix: i64) -> Self {
        Self {
            id: RequestId::new(),
            sender_id,
            recipient_id,
            status: RequestStatus::Accepted,
            created_at_unix: at_unix,
            responded_at_unix: Some(at_unix),
        }
    }
}

/// Orders a user pair so the symmetric edges store each pair exactly
/// once, regardless of which side initiated.
#[must_use]
pub fn canonical_pair(user_a: UserId, user_b: UserId) -> (UserId, UserId) {
    if user_a <= user_b {
        (user_a, user_b)
    } else {
        (user_b, user_a)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Friendship {
    pub user_a_id: UserId,
    pub user_b_id: UserId,
    pub created_at_unix: i64,
}

impl Friendship {
    #[must_use]
    pub fn new(user_a: UserId, user_b: UserId, created_at_unix: i64) -> Self {
        let (user_a_id, user_b_id) = canonical_pair(user_a, user_b);
        Self {
            user_a_id,
            user_b_id,
            created_at_unix,
        }
    }

    #[must_use]
    pub fn involves(&self, user_id: UserId) -> bool {
        self.user_a_id == user_id || self.user_b_id == user_id
    }

    #[must_use]
    pub fn peer_of(&self, user_id: UserId) -> Option<UserId> {
        if self.user_a_id == user_id {
            Some(self.user_b_id)
        } else if self.user_b_id == user_id {
            Some(self.user_a_id)
        } else {
            None
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockedUser {
    pub blocker_id: UserId,
    pub blocked_id: UserId,
    pub created_at_unix: i64,
}

/// Recipient-controlled setting restricting who may open a DM.
/// `Nobody` is the most restrictive value; unrecognized stored values
/// are treated the same way.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DmFilter {
    #[default]
    Everyone,
    FriendsOnly,
    Nobody,
}

impl DmFilter {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Everyone => "everyone",
            Self::FriendsOnly => "friends_only",
            Self::Nobody => "nobody",
        }
    }
}

impl TryFrom<String> for DmFilter {
    type Error = DomainError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        match value.as_str() {
            "everyone" => Ok(Self::Everyone),
            "friends_only" => Ok(Self::FriendsOnly),
            "nobody" => Ok(Self::Nobody),
            _ => Err(DomainError::InvalidDmFilter),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DmSetting {
    pub user_id: UserId,
    pub filter: DmFilter,
}

/// Everything the DM gate needs to know about one (sender, recipient)
/// pair, read from a single consistent snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DmSnapshot {
    pub blocked_either_direction: bool,
    pub are_friends: bool,
    pub has_accepted_dm_request: bool,
    pub recipient_filter: DmFilter,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DmVerdict {
    Allowed,
    Blocked,
    FilteredOut,
}

/// Block edges override everything else, including friendship. The
/// recipient's filter only applies when neither side blocks the other.
#[must_use]
pub const fn evaluate_dm_gate(snapshot: &DmSnapshot) -> DmVerdict {
    if snapshot.blocked_either_direction {
        return DmVerdict::Blocked;
    }
    match snapshot.recipient_filter {
        DmFilter::Everyone => DmVerdict::Allowed,
        DmFilter::FriendsOnly => {
            if snapshot.are_friends || snapshot.has_accepted_dm_request {
                DmVerdict::Allowed
            } else {
                DmVerdict::FilteredOut
            }
        }
        DmFilter::Nobody => DmVerdict::FilteredOut,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConflictReason {
    SelfTarget,
    AlreadyFriends,
    RequestPendingReverse,
    RequestNotPending,
    BlockedByYou,
    BlockedByOther,
}

impl ConflictReason {
    /// Stable wire code surfaced verbatim to clients.
    #[must_use]
    pub const fn code(self) -> &'static str {
        match self {
            Self::SelfTarget => "SELF",
            Self::AlreadyFriends => "ALREADY_FRIENDS",
            Self::RequestPendingReverse => "REQUEST_PENDING_REVERSE",
            Self::RequestNotPending => "REQUEST_NOT_PENDING",
            Self::BlockedByYou => "BLOCKED_BY_YOU",
            Self::BlockedByOther => "BLOCKED_BY_OTHER",
        }
    }
}

impl core::fmt::Display for ConflictReason {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}", self.code())
    }
}

/// Edge state between an ordered (sender, recipient) pair, as read by
/// the send-request planner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PairState {
    pub blocked_by_sender: bool,
    pub blocked_by_recipient: bool,
    pub are_friends: bool,
    pub outgoing_status: Option<RequestStatus>,
    pub incoming_status: Option<RequestStatus>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendPlan {
    /// No row exists for the ordered pair; insert a fresh pending one.
    Create,
    /// A resolved row exists; reset it to pending with new timestamps.
    Reopen,
    /// The sender's own request is already pending; leave it untouched.
    AlreadyPending,
}

/// The send-request state machine. A reverse pending request is never
/// auto-accepted by symmetry; its recipient must resolve it
/// explicitly. An accepted row only reopens once the friendship it
/// produced is gone, so a stale acceptance cannot silently resurrect.
pub fn plan_friend_request(state: &PairState) -> Result<SendPlan, ConflictReason> {
    if state.blocked_by_sender {
        return Err(ConflictReason::BlockedByYou);
    }
    if state.blocked_by_recipient {
        return Err(ConflictReason::BlockedByOther);
    }
    if state.are_friends {
        return Err(ConflictReason::AlreadyFriends);
    }
    if state.incoming_status == Some(RequestStatus::Pending) {
        return Err(ConflictReason::RequestPendingReverse);
    }
    match state.outgoing_status {
        None => Ok(SendPlan::Create),
        Some(RequestStatus::Pending) => Ok(SendPlan::AlreadyPending),
        Some(RequestStatus::Declined | RequestStatus::Accepted) => Ok(SendPlan::Reopen),
    }
}

#[cfg(test)]
mod tests {
    use super::{
        all_permissions, canonical_pair, default_everyone_permissions, effective_permissions,
        evaluate_dm_gate, mask_permissions, permits, plan_friend_request, role_set_with_everyone,
        ConflictReason, DmFilter, DmSnapshot, DmVerdict, DomainError, Friendship, Membership,
        PairState, Permission, PermissionSet, RequestStatus, Role, RoleColor, RoleName, SendPlan,
        ServerId, UserId, EVERYONE_ROLE_NAME,
    };

    fn sample_membership(role_sets: &[PermissionSet]) -> Membership {
        let server_id = ServerId::new();
        let mut roles = vec![Role::everyone(server_id, 0)];
        for (index, set) in role_sets.iter().enumerate() {
            let mut role = Role::admin(server_id, 0);
            role.name = RoleName::try_from(format!("role-{index}")).unwrap();
            role.permissions = *set;
            role.position = i32::try_from(index).unwrap() + 1;
            roles.push(role);
        }
        Membership {
            user_id: UserId::new(),
            server_id,
            roles,
            joined_at_unix: 0,
        }
    }

    #[test]
    fn administrator_satisfies_every_permission() {
        let membership =
            sample_membership(&[PermissionSet::of(&[Permission::Administrator])]);
        let effective = membership.effective_permissions();
        for permission in [
            Permission::ViewChannels,
            Permission::ManageRoles,
            Permission::BanMembers,
            Permission::ManageServer,
            Permission::ViewAuditLog,
        ] {
            assert!(permits(effective, PermissionSet::of(&[permission])));
        }
        assert!(permits(effective, all_permissions()));
    }

    #[test]
    fn non_administrator_requires_every_bit() {
        let membership = sample_membership(&[PermissionSet::of(&[
            Permission::ManageMessages,
            Permission::KickMembers,
        ])]);
        let effective = membership.effective_permissions();
        assert!(permits(
            effective,
            PermissionSet::of(&[Permission::ManageMessages])
        ));
        assert!(permits(
            effective,
            PermissionSet::of(&[Permission::ManageMessages, Permission::SendMessages])
        ));
        assert!(!permits(
            effective,
            PermissionSet::of(&[Permission::ManageMessages, Permission::ManageRoles])
        ));
    }

    #[test]
    fn effective_permissions_is_the_or_fold_of_role_masks() {
        let sets = [
            PermissionSet::of(&[Permission::ViewChannels]),
            PermissionSet::of(&[Permission::SendMessages, Permission::AttachFiles]),
        ];
        let effective = effective_permissions(&sets);
        assert_eq!(
            effective.bits(),
            sets[0].bits() | sets[1].bits()
        );
        assert!(effective_permissions(&[]).is_empty());
    }

    #[test]
    fn empty_role_set_satisfies_no_permission() {
        let effective = effective_permissions(&[]);
        assert!(!permits(
            effective,
            PermissionSet::of(&[Permission::ViewChannels])
        ));
        assert!(permits(effective, PermissionSet::empty()));
    }

    #[test]
    fn everyone_only_member_cannot_manage_roles() {
        let membership = sample_membership(&[]);
        let effective = membership.effective_permissions();
        assert_eq!(effective, default_everyone_permissions());
        assert!(permits(
            effective,
            PermissionSet::of(&[Permission::ViewChannels, Permission::SendMessages])
        ));
        assert!(!permits(
            effective,
            PermissionSet::of(&[Permission::ManageRoles])
        ));
    }

    #[test]
    fn unknown_permission_bits_are_masked_off() {
        let (masked, unknown) = mask_permissions((1 << 40) | (1 << 4));
        assert!(masked.contains(Permission::ManageMessages));
        assert_eq!(unknown, 1 << 40);
    }

    #[test]
    fn role_set_replacement_restores_everyone() {
        let server_id = ServerId::new();
        let everyone = Role::everyone(server_id, 0);
        let admin = Role::admin(server_id, 0);

        let replaced = role_set_with_everyone(vec![admin.clone()], everyone.clone());
        assert!(replaced.iter().any(Role::is_everyone));
        assert!(replaced.contains(&admin));

        // A stray duplicate also collapses to exactly one @everyone.
        let replaced = role_set_with_everyone(vec![everyone.clone(), admin], everyone);
        assert_eq!(
            replaced.iter().filter(|role| role.is_everyone()).count(),
            1
        );
    }

    #[test]
    fn role_names_and_colors_are_validated() {
        assert!(RoleName::try_from(String::from("Moderators")).is_ok());
        assert_eq!(
            RoleName::try_from(String::new()).unwrap_err(),
            DomainError::InvalidRoleName
        );
        assert_eq!(
            RoleName::try_from("x".repeat(33)).unwrap_err(),
            DomainError::InvalidRoleName
        );
        assert!(RoleColor::try_from(String::from("#1abc9c")).is_ok());
        assert_eq!(
            RoleColor::try_from(String::from("1abc9c")).unwrap_err(),
            DomainError::InvalidRoleColor
        );
        assert_eq!(
            RoleColor::try_from(String::from("#1abc9")).unwrap_err(),
            DomainError::InvalidRoleColor
        );
    }

    #[test]
    fn everyone_role_name_is_stable() {
        let everyone = Role::everyone(ServerId::new(), 0);
        assert!(everyone.is_everyone());
        assert_eq!(everyone.name.as_str(), EVERYONE_ROLE_NAME);
        assert_eq!(everyone.permissions, default_everyone_permissions());
    }

    #[test]
    fn canonical_pair_is_order_insensitive() {
        let a = UserId::new();
        let b = UserId::new();
        assert_eq!(canonical_pair(a, b), canonical_pair(b, a));

        let friendship = Friendship::new(b, a, 7);
        assert!(friendship.involves(a));
        assert!(friendship.involves(b));
        assert_eq!(friendship.peer_of(a), Some(b));
        assert_eq!(friendship.peer_of(b), Some(a));
        assert_eq!(friendship.peer_of(UserId::new()), None);
    }

    #[test]
    fn block_verdict_overrides_friendship_and_filter() {
        let snapshot = DmSnapshot {
            blocked_either_direction: true,
            are_friends: true,
            has_accepted_dm_request: true,
            recipient_filter: DmFilter::Everyone,
        };
        assert_eq!(evaluate_dm_gate(&snapshot), DmVerdict::Blocked);
    }

    #[test]
    fn friends_only_filter_requires_friendship_or_consent() {
        let mut snapshot = DmSnapshot {
            blocked_either_direction: false,
            are_friends: false,
            has_accepted_dm_request: false,
            recipient_filter: DmFilter::FriendsOnly,
        };
        assert_eq!(evaluate_dm_gate(&snapshot), DmVerdict::FilteredOut);

        snapshot.are_friends = true;
        assert_eq!(evaluate_dm_gate(&snapshot), DmVerdict::Allowed);

        snapshot.are_friends = false;
        snapshot.has_accepted_dm_request = true;
        assert_eq!(evaluate_dm_gate(&snapshot), DmVerdict::Allowed);
    }

    #[test]
    fn nobody_filter_rejects_everyone() {
        let snapshot = DmSnapshot {
            blocked_either_direction: false,
            are_friends: true,
            has_accepted_dm_request: true,
            recipient_filter: DmFilter::Nobody,
        };
        assert_eq!(evaluate_dm_gate(&snapshot), DmVerdict::FilteredOut);
    }

    #[test]
    fn dm_filter_round_trips_and_rejects_unknown_values() {
        assert_eq!(
            DmFilter::try_from(String::from("friends_only")).unwrap(),
            DmFilter::FriendsOnly
        );
        assert_eq!(DmFilter::default(), DmFilter::Everyone);
        assert_eq!(
            DmFilter::try_from(String::from("all_requests")).unwrap_err(),
            DomainError::InvalidDmFilter
        );
    }

    #[test]
    fn send_plan_rejects_blocks_friendship_and_reverse_pending() {
        let blocked = PairState {
            blocked_by_sender: true,
            ..PairState::default()
        };
        assert_eq!(
            plan_friend_request(&blocked).unwrap_err(),
            ConflictReason::BlockedByYou
        );

        let blocked_back = PairState {
            blocked_by_recipient: true,
            ..PairState::default()
        };
        assert_eq!(
            plan_friend_request(&blocked_back).unwrap_err(),
            ConflictReason::BlockedByOther
        );

        let friends = PairState {
            are_friends: true,
            ..PairState::default()
        };
        assert_eq!(
            plan_friend_request(&friends).unwrap_err(),
            ConflictReason::AlreadyFriends
        );

        let reverse_pending = PairState {
            incoming_status: Some(RequestStatus::Pending),
            ..PairState::default()
        };
        assert_eq!(
            plan_friend_request(&reverse_pending).unwrap_err(),
            ConflictReason::RequestPendingReverse
        );
    }

    #[test]
    fn send_plan_reopens_resolved_rows_and_keeps_pending_ones() {
        assert_eq!(
            plan_friend_request(&PairState::default()).unwrap(),
            SendPlan::Create
        );
        assert_eq!(
            plan_friend_request(&PairState {
                outgoing_status: Some(RequestStatus::Pending),
                ..PairState::default()
            })
            .unwrap(),
            SendPlan::AlreadyPending
        );
        assert_eq!(
            plan_friend_request(&PairState {
                outgoing_status: Some(RequestStatus::Declined),
                ..PairState::default()
            })
            .unwrap(),
            SendPlan::Reopen
        );
        // Accepted but no longer friends: the stale acceptance must not
        // silently resurrect friendship, so the row reopens to pending.
        assert_eq!(
            plan_friend_request(&PairState {
                outgoing_status: Some(RequestStatus::Accepted),
                ..PairState::default()
            })
            .unwrap(),
            SendPlan::Reopen
        );
    }

    #[test]
    fn conflict_codes_are_stable() {
        assert_eq!(ConflictReason::SelfTarget.code(), "SELF");
        assert_eq!(ConflictReason::AlreadyFriends.code(), "ALREADY_FRIENDS");
        assert_eq!(
            ConflictReason::RequestPendingReverse.code(),
            "REQUEST_PENDING_REVERSE"
        );
        assert_eq!(ConflictReason::BlockedByYou.code(), "BLOCKED_BY_YOU");
        assert_eq!(ConflictReason::BlockedByOther.code(), "BLOCKED_BY_OTHER");
    }

    #[test]
    fn user_id_round_trip_and_parse_validation() {
        let id = UserId::new();
        let parsed = UserId::try_from(id.to_string()).unwrap();
        assert_eq!(id, parsed);

        let invalid = UserId::try_from(String::from("not-a-ulid")).unwrap_err();
        assert_eq!(invalid, DomainError::InvalidUserId);
    }
}
