// Copyright (C) 2026 Stratus Cloud Services
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Image access-list reconciliation.
//!
//! Cloud-side image membership is folded into the store's membership join
//! tables, and (when enforcing) store-known grants missing cloud-side are
//! pushed back. Reconciliation is additive: the only removal path is the
//! corrupted-set repair in [`clean_memberships`], which resets an
//! oversized set to the last completed machine request's access list.

use std::collections::{BTreeSet, HashSet};

use tracing::{debug, info, warn};

use stratus_core::persistence::{
    GroupRecord, MachineRecord, PatternMatchRecord, UserRecord,
};

use crate::MonitorContext;
use crate::cache::SnapshotCache;
use crate::error::Result;
use crate::snapshot::{CloudImage, SnapshotError};

/// Usernames selected by an application's access-list patterns.
///
/// A pattern is a single name, a comma-separated list of names, or a `*`
/// wildcard (substring match). Patterns match the username or the email
/// depending on their type; deny patterns are applied after all grants.
pub fn matching_usernames(
    patterns: &[PatternMatchRecord],
    users: &[UserRecord],
) -> BTreeSet<String> {
    let mut allowed = BTreeSet::new();
    let mut denied = BTreeSet::new();

    for record in patterns {
        let matched = users
            .iter()
            .filter(|user| pattern_matches(record, user))
            .map(|user| user.username.clone());
        if record.allow_access {
            allowed.extend(matched);
        } else {
            denied.extend(matched);
        }
    }

    for name in denied {
        allowed.remove(&name);
    }
    allowed
}

fn pattern_matches(record: &PatternMatchRecord, user: &UserRecord) -> bool {
    let term = if record.match_type == "email" {
        match user.email.as_deref() {
            Some(email) => email,
            None => return false,
        }
    } else {
        user.username.as_str()
    };

    if record.pattern.contains(',') {
        record
            .pattern
            .split(',')
            .map(str::trim)
            .any(|name| !name.is_empty() && name == term)
    } else if record.pattern.contains('*') {
        let fragment = record.pattern.replace('*', "");
        fragment.is_empty() || term.contains(&fragment)
    } else {
        record.pattern == term
    }
}

/// Every project name that should have access to a cloud image:
/// the application owner, projects the cloud already granted, the last
/// completed machine request's access list, and the application's
/// pattern-matched usernames.
pub async fn all_access_list(
    ctx: &MonitorContext,
    cache: &mut SnapshotCache,
    machine: &MachineRecord,
    image: &CloudImage,
) -> Result<Vec<String>> {
    let mut names: BTreeSet<String> = BTreeSet::new();

    let tenant_map = cache
        .tenant_name_map(ctx.snapshots.as_ref(), machine.provider_id)
        .await?;

    // The application owner is always included.
    if let Some(owner) = &image.owner_username {
        names.insert(owner.clone());
    } else if let Some(project_id) = &image.owner_project_id
        && let Some(project_name) = tenant_map.get(project_id)
    {
        names.insert(project_name.clone());
    }

    // Projects the cloud has already granted member access.
    let member_ids = ctx
        .snapshots
        .get_image_members(machine.provider_id, &image.id)
        .await?;
    for member_id in member_ids {
        match tenant_map.get(&member_id) {
            Some(project_name) => {
                names.insert(project_name.clone());
            }
            None => debug!(
                image_id = %image.id,
                member_id = %member_id,
                "Cloud member project is unknown, skipping"
            ),
        }
    }

    // The last completed machine request is the build-time access list.
    if let Some(request) = ctx
        .store
        .last_completed_machine_request(&machine.identifier)
        .await?
    {
        names.extend(request.access_list());
    }

    // Names found by the application's access-list patterns.
    let patterns = ctx
        .store
        .list_application_pattern_matches(machine.application_id)
        .await?;
    if !patterns.is_empty() {
        let users = ctx.store.list_users().await?;
        names.extend(matching_usernames(&patterns, &users));
    }

    Ok(names.into_iter().collect())
}

/// Create any missing membership rows for a group at all three
/// granularities (machine, version, application). Additive only.
async fn update_db_membership_for_group(
    ctx: &MonitorContext,
    machine: &MachineRecord,
    group: &GroupRecord,
) -> Result<()> {
    let added_machine = ctx
        .store
        .add_machine_membership(machine.id, group.id)
        .await?;
    let added_version = ctx
        .store
        .add_version_membership(machine.version_id, group.id)
        .await?;
    let added_application = ctx
        .store
        .add_application_membership(machine.application_id, group.id)
        .await?;
    if added_machine || added_version || added_application {
        info!(
            group = %group.name,
            identifier = %machine.identifier,
            "Added membership for group"
        );
    }
    Ok(())
}

/// Reconcile a private image's cloud-side access into the store's
/// membership tables. Returns the groups granted access.
///
/// Grants are never removed here. An access set larger than the
/// configured limit is treated as corrupted: reconciliation falls back to
/// the last completed machine request's access list, or bails out with a
/// warning when no request exists.
pub async fn update_image_membership(
    ctx: &MonitorContext,
    cache: &mut SnapshotCache,
    machine: &MachineRecord,
    image: &CloudImage,
) -> Result<Vec<GroupRecord>> {
    if image.is_public() {
        return Ok(Vec::new());
    }

    let mut shared_project_names = all_access_list(ctx, cache, machine, image).await?;

    if shared_project_names.len() as i64 > ctx.settings.membership_limit {
        warn!(
            identifier = %machine.identifier,
            count = shared_project_names.len(),
            limit = ctx.settings.membership_limit,
            "Image has too many shared users; consider running the prune pass"
        );
        match ctx
            .store
            .last_completed_machine_request(&machine.identifier)
            .await?
        {
            Some(request) => shared_project_names = request.access_list(),
            None => return Ok(Vec::new()),
        }
    }

    let groups = ctx
        .store
        .groups_for_project_names(machine.provider_id, &shared_project_names)
        .await?;
    for group in &groups {
        update_db_membership_for_group(ctx, machine, group).await?;
    }
    Ok(groups)
}

/// Push store-known groups missing from the cloud's member list back onto
/// the cloud image. One-directional repair (store -> cloud); removals are
/// always explicit, elsewhere.
///
/// Per-grant failures are tolerated: a conflict that says the member is
/// already associated counts as satisfied, everything else is a warning.
pub async fn distribute_image_membership(
    ctx: &MonitorContext,
    cache: &mut SnapshotCache,
    machine: &MachineRecord,
    image: &CloudImage,
) -> Result<Vec<GroupRecord>> {
    let groups = ctx.store.list_machine_membership_groups(machine.id).await?;
    if groups.is_empty() {
        return Ok(groups);
    }

    let tenant_map = cache
        .tenant_name_map(ctx.snapshots.as_ref(), machine.provider_id)
        .await?;
    let member_ids = ctx
        .snapshots
        .get_image_members(machine.provider_id, &image.id)
        .await?;
    let cloud_member_names: HashSet<&String> = member_ids
        .iter()
        .filter_map(|member_id| tenant_map.get(member_id))
        .collect();

    for group in &groups {
        let project_names = ctx
            .store
            .project_names_for_group(machine.provider_id, group.id)
            .await?;
        for project_name in project_names {
            if cloud_member_names.contains(&project_name) {
                continue;
            }
            info!(
                group = %group.name,
                project = %project_name,
                identifier = %machine.identifier,
                "Adding group to cloud membership"
            );
            match ctx
                .snapshots
                .share_image(machine.provider_id, &image.id, &project_name)
                .await
            {
                Ok(()) => {}
                Err(SnapshotError::Conflict(message))
                    if message.contains("already associated") =>
                {
                    debug!(
                        project = %project_name,
                        identifier = %machine.identifier,
                        "Already shared, nothing to do"
                    );
                }
                Err(SnapshotError::Timeout) => {
                    warn!(
                        group = %group.name,
                        identifier = %machine.identifier,
                        "Failed to add cloud membership, operation timed out"
                    );
                }
                Err(SnapshotError::Forbidden(message)) => {
                    warn!(
                        identifier = %machine.identifier,
                        %message,
                        "Conflict: this image should have been marked shared"
                    );
                }
                Err(err) => {
                    warn!(
                        group = %group.name,
                        identifier = %machine.identifier,
                        error = %err,
                        "Failed to add cloud membership"
                    );
                }
            }
        }
    }
    Ok(groups)
}

/// Membership-set integrity check over a provider's machines.
///
/// The shared-access set is checked at three cascading granularities:
/// machine members, then the version's, then the application's. A set at
/// or above the configured limit marks the image as corrupted and resets
/// all three levels to the last completed machine request's access list.
/// With no machine request to fall back on, the set is left alone and
/// only logged. Returns membership rows removed.
pub async fn clean_memberships(
    ctx: &MonitorContext,
    machines: &[MachineRecord],
) -> Result<u64> {
    let limit = ctx.settings.membership_limit;
    let mut removed = 0u64;

    for machine in machines {
        let mut count = ctx.store.count_machine_memberships(machine.id).await?;
        if count < limit {
            count = ctx.store.count_version_memberships(machine.version_id).await?;
        }
        if count < limit {
            count = ctx
                .store
                .count_application_memberships(machine.application_id)
                .await?;
        }
        if count < limit {
            continue;
        }

        let request = match ctx
            .store
            .last_completed_machine_request(&machine.identifier)
            .await?
        {
            Some(request) => request,
            None => {
                warn!(
                    identifier = %machine.identifier,
                    count,
                    "Membership set exceeds the limit but no completed machine \
                     request exists to restore from; leaving it alone"
                );
                continue;
            }
        };

        let keep_names = request.access_list();
        let keep_groups = ctx
            .store
            .groups_for_project_names(machine.provider_id, &keep_names)
            .await?;
        let keep_ids: Vec<i64> = keep_groups.iter().map(|group| group.id).collect();
        let reset = ctx.store.reset_memberships_to(machine, &keep_ids).await?;
        warn!(
            identifier = %machine.identifier,
            count,
            kept = keep_ids.len(),
            removed = reset,
            "Membership set exceeded the limit; reset to the last completed \
             machine request's access list"
        );
        removed += reset;
    }
    Ok(removed)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn user(id: i64, username: &str, email: Option<&str>) -> UserRecord {
        UserRecord {
            id,
            username: username.to_string(),
            email: email.map(|e| e.to_string()),
        }
    }

    fn pattern(pattern: &str, match_type: &str, allow: bool) -> PatternMatchRecord {
        PatternMatchRecord {
            id: 0,
            pattern: pattern.to_string(),
            match_type: match_type.to_string(),
            allow_access: allow,
        }
    }

    fn sample_users() -> Vec<UserRecord> {
        vec![
            user(1, "dnademo1", Some("demo1@lab.edu")),
            user(2, "dnademo2", Some("demo2@lab.edu")),
            user(3, "alice", Some("alice@example.org")),
        ]
    }

    #[test]
    fn test_exact_username_match() {
        let matched = matching_usernames(&[pattern("alice", "username", true)], &sample_users());
        assert_eq!(matched.into_iter().collect::<Vec<_>>(), vec!["alice"]);
    }

    #[test]
    fn test_comma_separated_names() {
        let matched = matching_usernames(
            &[pattern("dnademo1, dnademo2", "username", true)],
            &sample_users(),
        );
        assert_eq!(
            matched.into_iter().collect::<Vec<_>>(),
            vec!["dnademo1", "dnademo2"]
        );
    }

    #[test]
    fn test_wildcard_username() {
        let matched =
            matching_usernames(&[pattern("dnademo*", "username", true)], &sample_users());
        assert_eq!(
            matched.into_iter().collect::<Vec<_>>(),
            vec!["dnademo1", "dnademo2"]
        );
    }

    #[test]
    fn test_wildcard_email_domain() {
        let matched = matching_usernames(&[pattern("*@lab.edu", "email", true)], &sample_users());
        assert_eq!(
            matched.into_iter().collect::<Vec<_>>(),
            vec!["dnademo1", "dnademo2"]
        );
    }

    #[test]
    fn test_deny_pattern_removes_grants() {
        let matched = matching_usernames(
            &[
                pattern("dnademo*", "username", true),
                pattern("dnademo2", "username", false),
            ],
            &sample_users(),
        );
        assert_eq!(matched.into_iter().collect::<Vec<_>>(), vec!["dnademo1"]);
    }

    #[test]
    fn test_email_pattern_skips_users_without_email() {
        let users = vec![user(1, "noemail", None)];
        let matched = matching_usernames(&[pattern("*", "email", true)], &users);
        assert!(matched.is_empty());
    }
}
