use asset_hub_core::broker::MemoryBroker;
use asset_hub_core::cache::MemoryCacheStore;
use asset_hub_core::emitter::EventEmitter;
use asset_hub_core::events::{DomainEvent, EventRecord, Topic};
use asset_hub_core::deadletter::MemoryDeadLetters;
use asset_hub_core::grants::{GrantStore, MemoryGrantStore, RosterCheck};
use asset_hub_core::identity::StaticDirectory;
use asset_hub_core::model::{
    AssetListing, Folder, FolderPatch, NewTeam, Note, PrincipalId, ShareGrant, Team,
    TeamCandidate, TeamRole, TeamRoleEntry,
};
use asset_hub_core::permission::AccessFacts;
use asset_hub_core::retry::RetryPolicy;
use asset_hub_core::{
    AccessError, AccessResult, AccessService, CacheProjector, Operation, Permission, Principal,
    ResourceRef, Role,
};
use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use std::sync::Arc;
use uuid::Uuid;

struct Harness {
    service: AccessService,
    broker: Arc<MemoryBroker>,
    cache: Arc<MemoryCacheStore>,
}

fn harness() -> Harness {
    harness_with(Arc::new(MemoryGrantStore::new()))
}

fn harness_with(grants: Arc<dyn GrantStore>) -> Harness {
    let directory = StaticDirectory::with_users([
        ("owner", Role::Member),
        ("u", Role::Member),
        ("u2", Role::Member),
        ("x", Role::Member),
        ("m1", Role::Manager),
        ("m2", Role::Manager),
    ]);
    let broker = Arc::new(MemoryBroker::new(4));
    let cache = Arc::new(MemoryCacheStore::new());
    let service = AccessService::new(
        grants,
        Arc::new(directory),
        Arc::new(EventEmitter::new(broker.clone(), 100)),
        cache.clone(),
    );
    Harness {
        service,
        broker,
        cache,
    }
}

/// Apply everything published on `topic` to the harness cache, in order.
async fn project(h: &Harness, topic: Topic) {
    let projector = CacheProjector::new(
        h.cache.clone(),
        Arc::new(MemoryDeadLetters::new(10)),
        RetryPolicy::default(),
    );
    for event in events(&h.broker, topic) {
        projector.apply(&event).await.unwrap();
    }
}

fn events(broker: &MemoryBroker, topic: Topic) -> Vec<DomainEvent> {
    broker
        .published(topic.as_str())
        .iter()
        .map(|r| EventRecord::decode(&r.payload).unwrap().event)
        .collect()
}

#[tokio::test]
async fn share_lifecycle_controls_folder_access() {
    let h = harness();
    let owner = Principal::member("owner");
    let u = Principal::member("u");

    let folder = h.service.create_folder(&owner, "Plans", "").await.unwrap();
    let f = ResourceRef::folder(folder.id);

    h.service.share(&owner, f, "u", Permission::Read).await.unwrap();
    h.service.authorize(&u, f, Operation::Read).await.unwrap();
    let err = h.service.authorize(&u, f, Operation::Write).await.unwrap_err();
    assert!(matches!(err, AccessError::Forbidden(_)));

    h.service.share(&owner, f, "u", Permission::Write).await.unwrap();
    h.service.authorize(&u, f, Operation::Write).await.unwrap();
    assert_eq!(h.service.list_shares(&owner, f).await.unwrap().len(), 1);

    h.service.revoke_share(&owner, f, "u").await.unwrap();
    let err = h.service.authorize(&u, f, Operation::Read).await.unwrap_err();
    assert_eq!(err, AccessError::NotFoundOrDenied);
}

#[tokio::test]
async fn every_mutation_emits_one_event() {
    let h = harness();
    let owner = Principal::member("owner");

    let folder = h.service.create_folder(&owner, "Plans", "").await.unwrap();
    let f = ResourceRef::folder(folder.id);
    h.service.share(&owner, f, "u", Permission::Read).await.unwrap();
    h.service.revoke_share(&owner, f, "u").await.unwrap();
    // nothing to revoke, still announced so a stale cache entry goes away
    h.service.revoke_share(&owner, f, "u").await.unwrap();

    let kinds: Vec<&str> = events(&h.broker, Topic::AssetChanges)
        .iter()
        .map(|e| e.kind())
        .collect();
    assert_eq!(
        kinds,
        vec!["FOLDER_CREATED", "FOLDER_SHARED", "FOLDER_UNSHARED", "FOLDER_UNSHARED"]
    );
}

#[tokio::test]
async fn notes_inherit_folder_grants() {
    let h = harness();
    let owner = Principal::member("owner");
    let u = Principal::member("u");

    let folder = h.service.create_folder(&owner, "Plans", "").await.unwrap();
    let note = h
        .service
        .create_note(&owner, folder.id, "Q3", "draft")
        .await
        .unwrap();

    assert_eq!(
        h.service.get_note(&u, note.id).await.unwrap_err(),
        AccessError::NotFoundOrDenied
    );
    h.service
        .share(&owner, ResourceRef::folder(folder.id), "u", Permission::Write)
        .await
        .unwrap();
    assert_eq!(h.service.get_note(&u, note.id).await.unwrap().title, "Q3");
    // write on the folder lets u add notes, but only the owner deletes
    h.service.create_note(&u, folder.id, "Q4", "").await.unwrap();
    let err = h.service.delete_note(&u, note.id).await.unwrap_err();
    assert!(matches!(err, AccessError::Forbidden(_)));
}

#[tokio::test]
async fn share_validates_grantee() {
    let h = harness();
    let owner = Principal::member("owner");
    let folder = h.service.create_folder(&owner, "Plans", "").await.unwrap();
    let f = ResourceRef::folder(folder.id);

    let err = h.service.share(&owner, f, "ghost", Permission::Read).await.unwrap_err();
    assert!(matches!(err, AccessError::ValidationFailed(_)));
    let err = h.service.share(&owner, f, "owner", Permission::Read).await.unwrap_err();
    assert!(matches!(err, AccessError::ValidationFailed(_)));

    let stranger = Principal::member("x");
    let err = h.service.share(&stranger, f, "u", Permission::Read).await.unwrap_err();
    assert_eq!(err, AccessError::NotFoundOrDenied);
}

#[tokio::test]
async fn folder_update_and_delete() {
    let h = harness();
    let owner = Principal::member("owner");
    let manager = Principal::manager("m1");
    let folder = h.service.create_folder(&owner, "Plans", "old").await.unwrap();
    let note = h.service.create_note(&owner, folder.id, "n", "").await.unwrap();

    let updated = h
        .service
        .update_folder(
            &manager,
            folder.id,
            FolderPatch {
                name: String::new(),
                description: "new".into(),
            },
        )
        .await
        .unwrap();
    assert_eq!(updated.name, "Plans");
    assert_eq!(updated.description, "new");

    // managers may do everything except delete what they do not own
    let err = h.service.delete_folder(&manager, folder.id).await.unwrap_err();
    assert!(matches!(err, AccessError::Forbidden(_)));

    h.service.delete_folder(&owner, folder.id).await.unwrap();
    assert_eq!(
        h.service.get_note(&owner, note.id).await.unwrap_err(),
        AccessError::NotFoundOrDenied
    );
    let last = events(&h.broker, Topic::AssetChanges).pop().unwrap();
    assert_eq!(
        last,
        DomainEvent::FolderDeleted {
            folder_id: folder.id,
            cascaded_notes: vec![note.id],
        }
    );
}

#[tokio::test]
async fn team_hierarchy_is_enforced() {
    let h = harness();
    let m1 = Principal::manager("m1");
    let m2 = Principal::manager("m2");
    let x = Principal::member("x");

    let team = h
        .service
        .create_team(
            &m1,
            NewTeam {
                name: "core".into(),
                managers: vec![TeamCandidate::new("m1", "Mia")],
                members: vec![TeamCandidate::new("x", "Xi")],
            },
        )
        .await
        .unwrap();

    h.service
        .add_manager(&m1, team.id, TeamCandidate::new("m2", "Mo"))
        .await
        .unwrap();

    let err = h.service.remove_manager(&m2, team.id, "m1").await.unwrap_err();
    assert!(matches!(err, AccessError::Conflict(_)));

    let err = h
        .service
        .add_manager(&x, team.id, TeamCandidate::new("u", "U"))
        .await
        .unwrap_err();
    assert!(matches!(err, AccessError::Forbidden(_)));

    // m2 is a manager now, so may manage plain members
    h.service
        .add_member(&m2, team.id, TeamCandidate::new("u", "U"))
        .await
        .unwrap();
    h.service.remove_member(&m2, team.id, "x").await.unwrap();

    let team = h.service.get_team(&m1, team.id).await.unwrap();
    let ids = team.principal_ids();
    assert_eq!(ids, vec!["m1", "m2", "u"]);

    let activity = events(&h.broker, Topic::TeamActivity);
    assert_eq!(
        activity.iter().map(|e| e.kind()).collect::<Vec<_>>(),
        vec!["MEMBER_ADDED", "MEMBER_ADDED", "MEMBER_ADDED", "MEMBER_ADDED", "MEMBER_REMOVED"]
    );
}

#[tokio::test]
async fn team_creation_validates_every_principal() {
    let h = harness();
    let m1 = Principal::manager("m1");

    // "x" is not a manager in the directory
    let err = h
        .service
        .create_team(
            &m1,
            NewTeam {
                name: "core".into(),
                managers: vec![TeamCandidate::new("m1", "Mia"), TeamCandidate::new("x", "Xi")],
                members: vec![],
            },
        )
        .await
        .unwrap_err();
    assert!(matches!(err, AccessError::ValidationFailed(_)));
    assert!(h.service.list_teams(&m1).await.unwrap().is_empty());
    assert!(events(&h.broker, Topic::TeamActivity).is_empty());

    let err = h
        .service
        .create_team(
            &Principal::member("x"),
            NewTeam {
                name: "mine".into(),
                managers: vec![TeamCandidate::new("m1", "Mia")],
                members: vec![],
            },
        )
        .await
        .unwrap_err();
    assert!(matches!(err, AccessError::Forbidden(_)));
}

#[tokio::test]
async fn bulk_listings_are_for_managers() {
    let h = harness();
    let m1 = Principal::manager("m1");
    let owner = Principal::member("owner");

    let team = h
        .service
        .create_team(
            &m1,
            NewTeam {
                name: "core".into(),
                managers: vec![TeamCandidate::new("m1", "Mia")],
                members: vec![TeamCandidate::new("owner", "Ow")],
            },
        )
        .await
        .unwrap();
    let folder = h.service.create_folder(&owner, "Plans", "").await.unwrap();

    let listing = h.service.team_assets(&m1, team.id).await.unwrap();
    assert_eq!(listing.folders, vec![folder.clone()]);
    let listing = h.service.user_assets(&m1, "owner").await.unwrap();
    assert_eq!(listing.folders.len(), 1);

    let err = h.service.user_assets(&owner, "owner").await.unwrap_err();
    assert!(matches!(err, AccessError::Forbidden(_)));
    let err = h
        .service
        .team_assets(&m1, uuid::Uuid::new_v4())
        .await
        .unwrap_err();
    assert_eq!(err, AccessError::NotFoundOrDenied);
}

#[tokio::test]
async fn mutations_survive_broker_outage() {
    let h = harness();
    let owner = Principal::member("owner");

    h.broker.set_unavailable(true);
    let folder = h.service.create_folder(&owner, "Plans", "").await.unwrap();
    assert_eq!(h.service.get_folder(&owner, folder.id).await.unwrap(), folder);
    assert_eq!(h.service.emitter().pending(), 1);

    h.broker.set_unavailable(false);
    assert_eq!(h.service.emitter().flush_outbox().await.unwrap(), 1);
    assert_eq!(events(&h.broker, Topic::AssetChanges).len(), 1);
}

#[tokio::test]
async fn promoted_member_is_listed_once_as_manager() {
    let h = harness();
    let m1 = Principal::manager("m1");

    let team = h
        .service
        .create_team(
            &m1,
            NewTeam {
                name: "core".into(),
                managers: vec![TeamCandidate::new("m1", "Mia")],
                members: vec![TeamCandidate::new("m2", "Mo"), TeamCandidate::new("u", "U")],
            },
        )
        .await
        .unwrap();
    h.service
        .add_manager(&m1, team.id, TeamCandidate::new("m2", "Mo"))
        .await
        .unwrap();

    let team = h.service.get_team(&m1, team.id).await.unwrap();
    assert_eq!(team.role_of("m2"), Some(TeamRole::Manager));
    assert_eq!(team.roster.iter().filter(|e| e.principal_id == "m2").count(), 1);
    assert!(team.members().all(|e| e.principal_id != "m2"));
    assert!(team.managers().any(|e| e.principal_id == "m2"));

    // promotion is announced as a second MEMBER_ADDED for the same principal
    project(&h, Topic::TeamActivity).await;
    assert_eq!(
        h.service.cached_team_members(team.id).await.unwrap(),
        Some(vec!["m1".to_string(), "m2".to_string(), "u".to_string()])
    );
}

fn unchecked(_: &Team) -> AccessResult<()> {
    Ok(())
}

/// Grant store that promotes one principal to manager right after the next
/// team read, standing in for a concurrent `add_manager`.
struct PromoteAfterRead {
    inner: MemoryGrantStore,
    promote: Mutex<Option<PrincipalId>>,
}

#[async_trait]
impl GrantStore for PromoteAfterRead {
    async fn insert_folder(&self, folder: &Folder) -> AccessResult<()> {
        self.inner.insert_folder(folder).await
    }
    async fn update_folder(&self, folder: &Folder) -> AccessResult<()> {
        self.inner.update_folder(folder).await
    }
    async fn get_folder(&self, id: Uuid) -> AccessResult<Option<Folder>> {
        self.inner.get_folder(id).await
    }
    async fn delete_folder(&self, id: Uuid) -> AccessResult<Option<Vec<Uuid>>> {
        self.inner.delete_folder(id).await
    }
    async fn insert_note(&self, note: &Note) -> AccessResult<()> {
        self.inner.insert_note(note).await
    }
    async fn update_note(&self, note: &Note) -> AccessResult<()> {
        self.inner.update_note(note).await
    }
    async fn get_note(&self, id: Uuid) -> AccessResult<Option<Note>> {
        self.inner.get_note(id).await
    }
    async fn delete_note(&self, id: Uuid) -> AccessResult<bool> {
        self.inner.delete_note(id).await
    }
    async fn access_facts(
        &self,
        resource: ResourceRef,
        principal_id: &str,
    ) -> AccessResult<Option<AccessFacts>> {
        self.inner.access_facts(resource, principal_id).await
    }
    async fn upsert_share(&self, grant: &ShareGrant) -> AccessResult<ShareGrant> {
        self.inner.upsert_share(grant).await
    }
    async fn revoke_share(&self, resource: ResourceRef, grantee_id: &str) -> AccessResult<bool> {
        self.inner.revoke_share(resource, grantee_id).await
    }
    async fn list_shares(&self, resource: ResourceRef) -> AccessResult<Vec<ShareGrant>> {
        self.inner.list_shares(resource).await
    }
    async fn assets_for(&self, principals: &[PrincipalId]) -> AccessResult<AssetListing> {
        self.inner.assets_for(principals).await
    }
    async fn create_team(&self, name: &str, roster: &[TeamRoleEntry]) -> AccessResult<Team> {
        self.inner.create_team(name, roster).await
    }
    async fn get_team(&self, id: Uuid) -> AccessResult<Option<Team>> {
        let team = self.inner.get_team(id).await?;
        let promote = self.promote.lock().take();
        if let Some(principal_id) = promote {
            let entry = TeamRoleEntry {
                principal_id: principal_id.clone(),
                display_name: principal_id,
                role: TeamRole::Manager,
                added_at: Utc::now(),
            };
            self.inner.upsert_team_role(id, &entry, &unchecked).await?;
        }
        Ok(team)
    }
    async fn list_teams(&self) -> AccessResult<Vec<Team>> {
        self.inner.list_teams().await
    }
    async fn upsert_team_role(
        &self,
        team_id: Uuid,
        entry: &TeamRoleEntry,
        check: &RosterCheck<'_>,
    ) -> AccessResult<()> {
        self.inner.upsert_team_role(team_id, entry, check).await
    }
    async fn remove_team_role(
        &self,
        team_id: Uuid,
        principal_id: &str,
        check: &RosterCheck<'_>,
    ) -> AccessResult<bool> {
        self.inner.remove_team_role(team_id, principal_id, check).await
    }
}

#[tokio::test]
async fn role_change_rechecked_after_concurrent_promotion() {
    let store = Arc::new(PromoteAfterRead {
        inner: MemoryGrantStore::new(),
        promote: Mutex::new(None),
    });
    let h = harness_with(store.clone());
    let m1 = Principal::manager("m1");
    let m2 = Principal::manager("m2");

    let team = h
        .service
        .create_team(
            &m1,
            NewTeam {
                name: "core".into(),
                managers: vec![TeamCandidate::new("m1", "Mia"), TeamCandidate::new("m2", "Mo")],
                members: vec![TeamCandidate::new("x", "Xi")],
            },
        )
        .await
        .unwrap();
    let announced = events(&h.broker, Topic::TeamActivity).len();

    // m2 may remove plain members, but x becomes a manager before the write
    *store.promote.lock() = Some("x".to_string());
    let err = h.service.remove_member(&m2, team.id, "x").await.unwrap_err();
    assert!(matches!(err, AccessError::Conflict(_)));

    let team = h.service.get_team(&m1, team.id).await.unwrap();
    assert_eq!(team.role_of("x"), Some(TeamRole::Manager));
    assert_eq!(events(&h.broker, Topic::TeamActivity).len(), announced);

    // the same race cannot demote a manager back through add_member
    *store.promote.lock() = Some("u".to_string());
    let err = h
        .service
        .add_member(&m2, team.id, TeamCandidate::new("u", "U"))
        .await
        .unwrap_err();
    assert!(matches!(err, AccessError::Conflict(_)));
    let team = h.service.get_team(&m1, team.id).await.unwrap();
    assert_eq!(team.role_of("u"), Some(TeamRole::Manager));
}
