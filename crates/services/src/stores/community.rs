//! # Community Store
//!
//! Communities are cached like any other family, plus a membership table
//! mapping `(community, user)` to exactly one [`Role`]. Join and leave are
//! optimistic with rollback. Ownership moves only through
//! [`CommunityStore::transfer_ownership`], which has no backend route and
//! stays local.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use domains::{
    Community, Draft, EntityFamily, Membership, PageParams, Record, Result, Role, SyncError,
};
use serde_json::{json, Value};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::endpoints::{Operation, RequestContext};
use crate::normalize::{extract_list, liker_id};
use crate::persist::{load_versioned, save_versioned};
use crate::stores::entity::{EntityStore, FetchOutcome, StoreDeps};

const MEMBERSHIP_KEY: &str = "community-memberships";
const MEMBERSHIP_VERSION: u32 = 1;

type Roster = BTreeMap<String, Role>;

pub struct CommunityStore {
    entities: Arc<EntityStore<Community>>,
    /// community id -> user id -> role
    members: RwLock<HashMap<String, Roster>>,
    persisting: Mutex<()>,
}

impl CommunityStore {
    pub fn new(entities: Arc<EntityStore<Community>>) -> Self {
        Self { entities, members: RwLock::new(HashMap::new()), persisting: Mutex::new(()) }
    }

    /// The underlying community collection.
    pub fn entities(&self) -> &Arc<EntityStore<Community>> {
        &self.entities
    }

    fn deps(&self) -> &StoreDeps {
        self.entities.deps()
    }

    pub async fn fetch_all(&self, params: PageParams) -> Result<FetchOutcome> {
        self.entities.fetch_all(params).await
    }

    pub async fn get(&self, id: &str) -> Option<Community> {
        self.entities.get(id).await
    }

    pub async fn error(&self) -> Option<String> {
        self.entities.error().await
    }

    /// Creates a community owned by the current user.
    pub async fn create(&self, draft: Draft) -> Result<Community> {
        let created = self.entities.create(draft).await?;
        let id = created.id().to_string();

        let created = if created.my_role.is_none() {
            self.entities
                .update(&id, |c| {
                    c.my_role = Some(Role::Owner);
                    c.member_count = c.member_count.max(1);
                })
                .await?
        } else {
            created
        };
        if let Some(uid) = self.deps().current_user_id() {
            self.set_local_role(&id, &uid, Some(Role::Owner)).await;
        }
        Ok(created)
    }

    pub async fn role_of(&self, community_id: &str, user_id: &str) -> Option<Role> {
        self.members
            .read()
            .await
            .get(community_id)
            .and_then(|roster| roster.get(user_id).copied())
    }

    pub async fn members(&self, community_id: &str) -> Vec<Membership> {
        self.members
            .read()
            .await
            .get(community_id)
            .map(|roster| to_memberships(community_id, roster))
            .unwrap_or_default()
    }

    /// Joins as a member. Already being a member is a no-op.
    pub async fn join(&self, community_id: &str) -> Result<Role> {
        self.entities.require_session().await?;
        let uid = self.current_user().await?;

        // 1. Optimistic membership
        let staged = self
            .entities
            .update_record(community_id, |c| match c.my_role {
                Some(role) => Err(role),
                None => {
                    c.my_role = Some(Role::Member);
                    c.member_count += 1;
                    Ok(())
                }
            })
            .await;
        match staged {
            None => {
                return self
                    .entities
                    .fail(SyncError::not_found(EntityFamily::Community.as_str(), community_id))
                    .await
            }
            Some(Err(role)) => return Ok(role),
            Some(Ok(())) => {}
        }
        self.set_local_role(community_id, &uid, Some(Role::Member)).await;
        self.entities.persist().await;

        // 2. Confirm
        let cx = RequestContext::for_entity(community_id).with_user(Some(uid.clone()));
        match self.deps().prober.probe(EntityFamily::Community, Operation::Join, &cx).await {
            Ok(success) => {
                let role = success
                    .response
                    .body
                    .as_ref()
                    .and_then(role_in_response)
                    .unwrap_or(Role::Member);
                if role != Role::Member {
                    self.entities.update_record(community_id, |c| c.my_role = Some(role)).await;
                    self.set_local_role(community_id, &uid, Some(role)).await;
                    self.entities.persist().await;
                }
                info!(community = community_id, %role, "joined community");
                Ok(role)
            }
            Err(e) => {
                self.entities
                    .update_record(community_id, |c| {
                        c.my_role = None;
                        c.member_count = c.member_count.saturating_sub(1);
                    })
                    .await;
                self.set_local_role(community_id, &uid, None).await;
                self.deps().metrics.record_rollback(EntityFamily::Community.as_str());
                warn!(community = community_id, error = %e, "join rolled back");
                self.entities.persist().await;
                self.entities.fail(e).await
            }
        }
    }

    /// Leaves the community. The owner must transfer ownership first.
    pub async fn leave(&self, community_id: &str) -> Result<()> {
        self.entities.require_session().await?;
        let uid = self.current_user().await?;

        let staged = self
            .entities
            .update_record(community_id, |c| match c.my_role {
                Some(Role::Owner) => Err(true),
                None => Err(false),
                Some(role) => {
                    c.my_role = None;
                    c.member_count = c.member_count.saturating_sub(1);
                    Ok(role)
                }
            })
            .await;
        let prior = match staged {
            None => {
                return self
                    .entities
                    .fail(SyncError::not_found(EntityFamily::Community.as_str(), community_id))
                    .await
            }
            Some(Err(true)) => {
                return self
                    .entities
                    .fail(SyncError::Validation(
                        "the owner must transfer ownership before leaving".into(),
                    ))
                    .await
            }
            Some(Err(false)) => return Ok(()),
            Some(Ok(role)) => role,
        };
        self.set_local_role(community_id, &uid, None).await;
        self.entities.persist().await;

        let cx = RequestContext::for_entity(community_id).with_user(Some(uid.clone()));
        match self.deps().prober.probe(EntityFamily::Community, Operation::Leave, &cx).await {
            Ok(_) => {
                info!(community = community_id, "left community");
                Ok(())
            }
            Err(e) => {
                self.entities
                    .update_record(community_id, |c| {
                        c.my_role = Some(prior);
                        c.member_count += 1;
                    })
                    .await;
                self.set_local_role(community_id, &uid, Some(prior)).await;
                self.deps().metrics.record_rollback(EntityFamily::Community.as_str());
                warn!(community = community_id, error = %e, "leave rolled back");
                self.entities.persist().await;
                self.entities.fail(e).await
            }
        }
    }

    /// Replaces the cached roster with the server's.
    pub async fn fetch_members(&self, community_id: &str) -> Result<Vec<Membership>> {
        let cx = RequestContext::for_entity(community_id);
        let success = match self
            .deps()
            .prober
            .probe(EntityFamily::Community, Operation::FetchMembers, &cx)
            .await
        {
            Ok(s) => s,
            Err(e) => return self.entities.fail(e).await,
        };

        let body = success.response.body.unwrap_or(Value::Null);
        let roster: Roster = extract_list(&body, "members")
            .iter()
            .filter_map(member_entry)
            .collect();
        let memberships = to_memberships(community_id, &roster);

        let my_role = self
            .deps()
            .current_user_id()
            .and_then(|uid| roster.get(&uid).copied());
        let count = roster.len() as u64;
        self.members
            .write()
            .await
            .insert(community_id.to_string(), roster);
        self.entities
            .update_record(community_id, |c| {
                c.my_role = my_role;
                c.member_count = count;
            })
            .await;
        self.persist_members().await;
        self.entities.persist().await;

        debug!(community = community_id, members = memberships.len(), "members loaded");
        Ok(memberships)
    }

    /// Changes a member's role. Ownership cannot be granted or revoked here.
    pub async fn set_member_role(&self, community_id: &str, user_id: &str, role: Role) -> Result<()> {
        self.entities.require_session().await?;
        let uid = self.current_user().await?;

        if role == Role::Owner {
            return self
                .entities
                .fail(SyncError::Validation("ownership moves only by transfer".into()))
                .await;
        }
        let actor = self.role_of(community_id, &uid).await;
        if actor < Some(Role::Admin) {
            return self
                .entities
                .fail(SyncError::Validation("only admins and owners can change roles".into()))
                .await;
        }
        let prior = match self.role_of(community_id, user_id).await {
            None => return self.entities.fail(SyncError::not_found("member", user_id)).await,
            Some(Role::Owner) => {
                return self
                    .entities
                    .fail(SyncError::Validation("the owner's role cannot be changed".into()))
                    .await
            }
            Some(prior) if prior == role => return Ok(()),
            Some(prior) => prior,
        };

        let is_self = user_id == uid;
        self.set_local_role(community_id, user_id, Some(role)).await;
        if is_self {
            self.set_my_role(community_id, Some(role)).await;
        }
        let cx = RequestContext::for_entity(community_id)
            .with_target(user_id)
            .with_body(json!({ "role": role.to_string() }));
        match self
            .deps()
            .prober
            .probe(EntityFamily::Community, Operation::UpdateRole, &cx)
            .await
        {
            Ok(_) => Ok(()),
            Err(e) => {
                self.set_local_role(community_id, user_id, Some(prior)).await;
                if is_self {
                    self.set_my_role(community_id, Some(prior)).await;
                }
                self.deps().metrics.record_rollback(EntityFamily::Community.as_str());
                warn!(community = community_id, member = user_id, error = %e, "role change rolled back");
                self.entities.fail(e).await
            }
        }
    }

    /// Makes `new_owner` the owner; the previous owner becomes an admin.
    /// Only the current owner may hand the community over.
    pub async fn transfer_ownership(&self, community_id: &str, new_owner: &str) -> Result<()> {
        self.entities.require_session().await?;
        let uid = self.current_user().await?;
        let record_role = self.entities.get(community_id).await.and_then(|c| c.my_role);

        let transferred = {
            let mut members = self.members.write().await;
            match members.get_mut(community_id) {
                None => Err(SyncError::not_found(EntityFamily::Community.as_str(), community_id)),
                Some(roster) if roster.get(&uid).copied().or(record_role) != Some(Role::Owner) => {
                    Err(SyncError::Validation("only the owner can transfer ownership".into()))
                }
                Some(roster) if !roster.contains_key(new_owner) => {
                    Err(SyncError::not_found("member", new_owner))
                }
                Some(roster) => {
                    let previous: Vec<String> = roster
                        .iter()
                        .filter(|(_, r)| **r == Role::Owner)
                        .map(|(u, _)| u.clone())
                        .collect();
                    for user in &previous {
                        roster.insert(user.clone(), Role::Admin);
                    }
                    roster.insert(new_owner.to_string(), Role::Owner);
                    Ok(previous)
                }
            }
        };
        let previous = match transferred {
            Ok(previous) => previous,
            Err(e) => return self.entities.fail(e).await,
        };

        let mine = if uid == new_owner {
            Some(Role::Owner)
        } else if previous.contains(&uid) {
            Some(Role::Admin)
        } else {
            None
        };
        if mine.is_some() {
            self.set_my_role(community_id, mine).await;
        }
        self.persist_members().await;
        info!(community = community_id, new_owner, "ownership transferred");
        Ok(())
    }

    pub async fn rehydrate(&self) -> Result<usize> {
        let count = self.entities.rehydrate().await?;
        let restored: Option<Vec<Membership>> =
            match load_versioned(self.deps().blobs.as_ref(), MEMBERSHIP_KEY, MEMBERSHIP_VERSION).await {
                Ok(restored) => restored,
                Err(e) => return self.entities.fail(e).await,
            };
        let mut members = self.members.write().await;
        members.clear();
        for m in restored.unwrap_or_default() {
            members.entry(m.community_id).or_default().insert(m.user_id, m.role);
        }
        Ok(count)
    }

    pub async fn clear(&self) {
        self.entities.clear().await;
        self.members.write().await.clear();
        if let Err(e) = self.deps().blobs.remove(MEMBERSHIP_KEY).await {
            warn!(error = %e, "failed to remove persisted memberships");
        }
    }

    async fn current_user(&self) -> Result<String> {
        match self.deps().current_user_id() {
            Some(uid) => Ok(uid),
            None => self.entities.fail(SyncError::NotAuthenticated).await,
        }
    }

    async fn set_local_role(&self, community_id: &str, user_id: &str, role: Option<Role>) {
        {
            let mut members = self.members.write().await;
            let roster = members.entry(community_id.to_string()).or_default();
            match role {
                Some(role) => roster.insert(user_id.to_string(), role),
                None => roster.remove(user_id),
            };
        }
        self.persist_members().await;
    }

    /// Keeps the cached community's `my_role` in step with the roster.
    async fn set_my_role(&self, community_id: &str, role: Option<Role>) {
        self.entities.update_record(community_id, |c| c.my_role = role).await;
        self.entities.persist().await;
    }

    async fn persist_members(&self) {
        let _order = self.persisting.lock().await;
        let snapshot: Vec<Membership> = self
            .members
            .read()
            .await
            .iter()
            .flat_map(|(cid, roster)| to_memberships(cid, roster))
            .collect();
        if let Err(e) =
            save_versioned(self.deps().blobs.as_ref(), MEMBERSHIP_KEY, MEMBERSHIP_VERSION, &snapshot).await
        {
            warn!(error = %e, "failed to persist memberships");
        }
    }
}

fn to_memberships(community_id: &str, roster: &Roster) -> Vec<Membership> {
    roster
        .iter()
        .map(|(user_id, role)| Membership {
            community_id: community_id.to_string(),
            user_id: user_id.clone(),
            role: *role,
        })
        .collect()
}

/// `(user id, role)` from one roster entry; unknown roles read as member.
fn member_entry(v: &Value) -> Option<(String, Role)> {
    let user = v
        .get("userId")
        .or_else(|| v.get("user"))
        .and_then(liker_id)
        .or_else(|| liker_id(v))?;
    let role = v
        .get("role")
        .and_then(Value::as_str)
        .and_then(Role::parse)
        .unwrap_or(Role::Member);
    Some((user, role))
}

fn role_in_response(v: &Value) -> Option<Role> {
    [v.get("role"), v.get("data").and_then(|d| d.get("role"))]
        .into_iter()
        .flatten()
        .find_map(|r| r.as_str().and_then(Role::parse))
}
