// Copyright (C) 2026 Stratus Cloud Services
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Allocation enforcement engine.
//!
//! Iterates allocation sources and their users in deterministic order
//! (source name, then username), consults the override policy, and
//! dispatches enforcement as an independent unit per (source, user) pair.
//! Enforcement against the cloud is delegated to an [`InstanceEnforcer`]
//! per identity; per-identity failures are isolated and aggregated.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, error, info, instrument, warn};

use stratus_core::error::CoreError;
use stratus_core::persistence::{
    AllocationSourceRecord, IdentityRecord, Persistence, UserRecord,
};

use crate::error::{Error, Result};

/// Verdict of the pluggable override policy for a (user, source) pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnforcementOverride {
    /// Follow the usage evaluation.
    NoOverride,
    /// Enforce even when the source is under allocation.
    AlwaysEnforce,
    /// Never enforce, regardless of usage.
    NeverEnforce,
}

/// Pluggable override policy consulted before dispatching enforcement.
#[async_trait]
pub trait AllocationOverridePolicy: Send + Sync {
    /// The override for this (user, source) pair.
    async fn get_override(
        &self,
        user: &UserRecord,
        source: &AllocationSourceRecord,
    ) -> EnforcementOverride;
}

/// Policy that never overrides the usage evaluation.
pub struct NoOverridePolicy;

#[async_trait]
impl AllocationOverridePolicy for NoOverridePolicy {
    async fn get_override(
        &self,
        _user: &UserRecord,
        _source: &AllocationSourceRecord,
    ) -> EnforcementOverride {
        EnforcementOverride::NoOverride
    }
}

/// External collaborator that acts on a user's running resources under
/// one identity (suspend/stop/shelve/terminate per the provider's
/// configured action). Returns the affected instance identifiers.
#[async_trait]
pub trait InstanceEnforcer: Send + Sync {
    /// Apply `action` to the user's instances under `identity`.
    async fn enforce(
        &self,
        user: &UserRecord,
        identity: &IdentityRecord,
        action: &str,
    ) -> Result<Vec<String>>;
}

/// Shared state for the enforcement engine.
pub struct EnforcementContext {
    /// Lifecycle store.
    pub store: Arc<dyn Persistence>,
    /// Override policy.
    pub policy: Arc<dyn AllocationOverridePolicy>,
    /// Per-identity enforcement collaborator.
    pub enforcer: Arc<dyn InstanceEnforcer>,
    /// Global enforcement gate; when off, dispatch decisions are still
    /// made (and logged) but no cloud action is taken.
    pub enforcing: bool,
}

/// The dispatch decision table.
///
/// | over_allocation | override | action |
/// |---|---|---|
/// | true  | NeverEnforce | skip |
/// | false | AlwaysEnforce | enforce anyway |
/// | true  | NoOverride / AlwaysEnforce | enforce |
/// | false | NoOverride / NeverEnforce | skip |
pub fn should_enforce(over_allocation: bool, override_choice: EnforcementOverride) -> bool {
    match (over_allocation, override_choice) {
        (true, EnforcementOverride::NeverEnforce) => false,
        (false, EnforcementOverride::AlwaysEnforce) => true,
        (true, _) => true,
        (false, _) => false,
    }
}

/// Evaluate every (allocation source, user) pair and dispatch enforcement
/// for the ones the decision table selects.
///
/// Each selected pair is spawned as an independent unit: a failure for
/// one user is logged with full context and never blocks the others.
/// Returns the (source name, username) pairs dispatched, in evaluation
/// order.
#[instrument(skip(ctx, usernames))]
pub async fn monitor_allocation_sources(
    ctx: Arc<EnforcementContext>,
    usernames: &[String],
) -> Result<Vec<(String, String)>> {
    let mut dispatched = Vec::new();

    for source in ctx.store.list_allocation_sources().await? {
        debug!(source = %source.name, "Evaluating allocation source");
        for user in ctx
            .store
            .list_users_for_allocation_source(source.id)
            .await?
        {
            if !usernames.is_empty() && !usernames.contains(&user.username) {
                info!(username = %user.username, "Skipping user, not in the list");
                continue;
            }

            let over_allocation = source.is_over_allocation();
            let override_choice = ctx.policy.get_override(&user, &source).await;
            debug!(
                source = %source.name,
                username = %user.username,
                over_allocation,
                ?override_choice,
                "Evaluated user against allocation source"
            );

            if over_allocation && override_choice == EnforcementOverride::NeverEnforce {
                debug!(
                    source = %source.name,
                    username = %user.username,
                    "Over allocation, but override says never enforce; skipping"
                );
                continue;
            }
            if !over_allocation && override_choice == EnforcementOverride::AlwaysEnforce {
                debug!(
                    source = %source.name,
                    username = %user.username,
                    "Not over allocation, but override says always enforce"
                );
            }
            if !should_enforce(over_allocation, override_choice) {
                continue;
            }

            debug!(username = %user.username, "Dispatching enforcement");
            dispatched.push((source.name.clone(), user.username.clone()));
            let ctx = ctx.clone();
            let source = source.clone();
            tokio::spawn(async move {
                let affected = overage_enforcement_for_user(&ctx, &source, &user).await;
                info!(
                    source = %source.name,
                    username = %user.username,
                    affected = affected.len(),
                    "Enforcement unit finished"
                );
            });
        }
    }

    Ok(dispatched)
}

/// Enforce one user's overage across every identity they own.
///
/// Per-identity failures are caught, logged with full context, and do
/// not propagate; the affected-instance lists of the identities that
/// succeeded are aggregated.
pub async fn overage_enforcement_for_user(
    ctx: &EnforcementContext,
    source: &AllocationSourceRecord,
    user: &UserRecord,
) -> Vec<String> {
    debug!(
        source = %source.name,
        username = %user.username,
        "Enforcing overage for user"
    );
    let identities = match ctx.store.list_identities_for_user(user.id).await {
        Ok(identities) => identities,
        Err(err) => {
            error!(
                source = %source.name,
                username = %user.username,
                error = %err,
                "Could not list identities for enforcement"
            );
            return Vec::new();
        }
    };

    let mut affected = Vec::new();
    for identity in identities {
        match overage_enforcement_for(ctx, source, user, &identity).await {
            Ok(instances) => affected.extend(instances),
            Err(err) => {
                error!(
                    source = %source.name,
                    username = %user.username,
                    identity = %identity.uuid,
                    error = %err,
                    "Enforcement failed for identity"
                );
            }
        }
    }
    affected
}

/// Enforce one user's overage under a single identity.
///
/// The provider's `over_allocation_action` selects the action; a provider
/// without one takes no action. A disabled global `enforcing` gate
/// short-circuits before any cloud call.
pub async fn overage_enforcement_for(
    ctx: &EnforcementContext,
    source: &AllocationSourceRecord,
    user: &UserRecord,
    identity: &IdentityRecord,
) -> Result<Vec<String>> {
    let provider = ctx
        .store
        .get_provider(identity.provider_id)
        .await?
        .ok_or(CoreError::ProviderNotFound {
            provider_id: identity.provider_id,
        })?;

    let Some(action) = provider.over_allocation_action.as_deref() else {
        debug!(provider = %provider.name, "No over-allocation action configured");
        return Ok(Vec::new());
    };
    if !ctx.enforcing {
        info!("Settings dictate that enforcing is off; returning");
        return Ok(Vec::new());
    }

    info!(
        username = %user.username,
        source = %source.name,
        provider = %provider.name,
        action,
        "User has gone over their allocation; applying enforcement action"
    );
    ctx.enforcer
        .enforce(user, identity, action)
        .await
        .map_err(|err| {
            warn!(
                username = %user.username,
                identity = %identity.uuid,
                error = %err,
                "Enforcement collaborator failed"
            );
            Error::Other(format!(
                "enforcement failed for {} on identity {}: {}",
                user.username, identity.uuid, err
            ))
        })
}
