use std::sync::Arc;

use lattice_authz::{
    AuthzError, ForbiddenReason, MemoryStore, Missing, PermissionResolver,
};
use lattice_core::{ChannelId, Permission, PermissionSet, RoleName, ServerId, UserId};

fn role_name(name: &str) -> RoleName {
    RoleName::try_from(String::from(name)).unwrap()
}

async fn harness() -> (Arc<MemoryStore>, PermissionResolver<MemoryStore>) {
    let store = Arc::new(MemoryStore::new());
    let resolver = PermissionResolver::new(store.clone());
    (store, resolver)
}

#[tokio::test]
async fn the_admin_role_short_circuits_every_permission() {
    let (store, resolver) = harness().await;
    let owner = store.register_user().await;
    let server = store.create_server(owner).await.unwrap();

    for permission in [
        Permission::ManageServer,
        Permission::BanMembers,
        Permission::ViewAuditLog,
    ] {
        let decision = resolver
            .resolve_server(owner, server.server_id, PermissionSet::of(&[permission]))
            .await
            .unwrap();
        assert!(decision.allowed, "owner denied {permission:?}");
    }
}

#[tokio::test]
async fn an_everyone_member_sends_but_does_not_manage() {
    let (store, resolver) = harness().await;
    let owner = store.register_user().await;
    let member = store.register_user().await;
    let server = store.create_server(owner).await.unwrap();
    store.join_server(member, server.server_id).await.unwrap();

    let send = resolver
        .resolve_server(
            member,
            server.server_id,
            PermissionSet::of(&[Permission::ViewChannels, Permission::SendMessages]),
        )
        .await
        .unwrap();
    assert!(send.is_member);
    assert!(send.allowed);
    assert_eq!(send.forbidden_reason(), None);

    let manage = resolver
        .resolve_server(
            member,
            server.server_id,
            PermissionSet::of(&[Permission::ManageRoles]),
        )
        .await
        .unwrap();
    assert!(manage.is_member);
    assert!(!manage.allowed);
    assert_eq!(
        manage.forbidden_reason(),
        Some(ForbiddenReason::MissingPermission)
    );
}

#[tokio::test]
async fn a_non_member_is_refused_before_permissions_are_considered() {
    let (store, resolver) = harness().await;
    let owner = store.register_user().await;
    let outsider = store.register_user().await;
    let server = store.create_server(owner).await.unwrap();

    let decision = resolver
        .resolve_server(
            outsider,
            server.server_id,
            PermissionSet::of(&[Permission::ViewChannels]),
        )
        .await
        .unwrap();
    assert!(!decision.is_member);
    assert!(!decision.allowed);
    assert_eq!(
        decision.forbidden_reason(),
        Some(ForbiddenReason::NotAMember)
    );
    assert!(!resolver.is_member(outsider, server.server_id).await.unwrap());
}

#[tokio::test]
async fn unknown_targets_are_not_found_rather_than_denied() {
    let (store, resolver) = harness().await;
    let user = store.register_user().await;

    let err = resolver
        .resolve_server(user, ServerId::new(), PermissionSet::empty())
        .await
        .unwrap_err();
    assert!(matches!(err, AuthzError::NotFound(Missing::Server)));

    let err = resolver
        .resolve_channel(user, ChannelId::new(), PermissionSet::empty())
        .await
        .unwrap_err();
    assert!(matches!(err, AuthzError::NotFound(Missing::Channel)));

    let err = resolver
        .is_member(UserId::new(), ServerId::new())
        .await
        .unwrap_err();
    assert!(matches!(err, AuthzError::NotFound(Missing::Server)));
}

#[tokio::test]
async fn a_channel_check_resolves_through_its_owning_server() {
    let (store, resolver) = harness().await;
    let owner = store.register_user().await;
    let member = store.register_user().await;
    let server = store.create_server(owner).await.unwrap();
    let channel = store.create_channel(server.server_id).await.unwrap();
    store.join_server(member, server.server_id).await.unwrap();

    let decision = resolver
        .resolve_channel(
            member,
            channel,
            PermissionSet::of(&[Permission::SendMessages]),
        )
        .await
        .unwrap();
    assert!(decision.is_member);
    assert!(decision.allowed);

    let denied = resolver
        .resolve_channel(
            member,
            channel,
            PermissionSet::of(&[Permission::ManageChannels]),
        )
        .await
        .unwrap();
    assert!(!denied.allowed);
}

#[tokio::test]
async fn a_granted_role_unions_with_the_everyone_baseline() {
    let (store, resolver) = harness().await;
    let owner = store.register_user().await;
    let member = store.register_user().await;
    let server = store.create_server(owner).await.unwrap();
    store.join_server(member, server.server_id).await.unwrap();

    let moderators = store
        .create_role(
            server.server_id,
            role_name("Moderators"),
            PermissionSet::of(&[Permission::ManageMessages, Permission::KickMembers]),
        )
        .await
        .unwrap();
    store
        .replace_member_roles(member, server.server_id, vec![moderators.id])
        .await
        .unwrap();

    // Baseline bits from @everyone and granted bits from the new role
    // both hold at once.
    let combined = resolver
        .resolve_server(
            member,
            server.server_id,
            PermissionSet::of(&[
                Permission::SendMessages,
                Permission::ManageMessages,
                Permission::KickMembers,
            ]),
        )
        .await
        .unwrap();
    assert!(combined.allowed);

    let beyond = resolver
        .resolve_server(
            member,
            server.server_id,
            PermissionSet::of(&[Permission::BanMembers]),
        )
        .await
        .unwrap();
    assert!(!beyond.allowed);
}

#[tokio::test]
async fn require_server_surfaces_the_matching_refusal() {
    let (store, resolver) = harness().await;
    let owner = store.register_user().await;
    let member = store.register_user().await;
    let outsider = store.register_user().await;
    let server = store.create_server(owner).await.unwrap();
    store.join_server(member, server.server_id).await.unwrap();

    resolver
        .require_server(
            member,
            server.server_id,
            PermissionSet::of(&[Permission::SendMessages]),
        )
        .await
        .unwrap();

    let err = resolver
        .require_server(
            member,
            server.server_id,
            PermissionSet::of(&[Permission::ManageServer]),
        )
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        AuthzError::Forbidden(ForbiddenReason::MissingPermission)
    ));

    let err = resolver
        .require_server(
            outsider,
            server.server_id,
            PermissionSet::of(&[Permission::SendMessages]),
        )
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        AuthzError::Forbidden(ForbiddenReason::NotAMember)
    ));
    assert_eq!(err.code(), "NOT_A_MEMBER");
}

#[tokio::test]
async fn leaving_a_server_revokes_membership() {
    let (store, resolver) = harness().await;
    let owner = store.register_user().await;
    let member = store.register_user().await;
    let server = store.create_server(owner).await.unwrap();
    store.join_server(member, server.server_id).await.unwrap();
    assert!(resolver.is_member(member, server.server_id).await.unwrap());

    assert!(store.remove_membership(member, server.server_id).await);
    let decision = resolver
        .resolve_server(
            member,
            server.server_id,
            PermissionSet::of(&[Permission::ViewChannels]),
        )
        .await
        .unwrap();
    assert!(!decision.is_member);
}
