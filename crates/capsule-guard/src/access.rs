//! Capability-scoped access resolver.
//!
//! Pure functions of (record, related rows, viewer). A denial carries no
//! information about why: private, quarantined and policy-blocked targets
//! all resolve to the same [`AccessDecision`] shape as a missing one, and
//! the HTTP layer maps every denial to the same 404.

use serde::{Deserialize, Serialize};

use capsule_core::{ArtifactStatus, Quarantine, QuarantineSource, UserId, Visibility};
use capsule_state::{ArtifactLink, ArtifactRecord, CapsuleRecord, PostReference};

/// The caller, as established by the identity verifier.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Viewer {
    /// `None` for anonymous callers.
    pub user: Option<UserId>,
    pub moderator: bool,
}

impl Viewer {
    pub fn anonymous() -> Self {
        Self::default()
    }

    pub fn user(id: impl Into<UserId>) -> Self {
        Self {
            user: Some(id.into()),
            moderator: false,
        }
    }

    pub fn moderator(id: impl Into<UserId>) -> Self {
        Self {
            user: Some(id.into()),
            moderator: true,
        }
    }

    pub fn is(&self, owner: &str) -> bool {
        self.user.as_deref() == Some(owner)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModerationState {
    Allow,
    Quarantine,
}

/// Which rule decided. Internal: never serialized to unauthorized callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessReason {
    Owner,
    Moderator,
    PublicReference,
    PublicVisibility,
    Quarantined,
    PolicyBlocked,
    NotActive,
    NotPublic,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccessDecision {
    pub allowed: bool,
    pub is_owner: bool,
    pub is_moderator: bool,
    pub moderation: ModerationState,
    pub reason: AccessReason,
}

impl AccessDecision {
    /// Owners and moderators see the moderation block.
    pub fn privileged(&self) -> bool {
        self.allowed && (self.is_owner || self.is_moderator)
    }
}

/// Moderation block returned to privileged viewers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModerationInfo {
    pub state: ModerationState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<QuarantineSource>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub quarantined_at: Option<u64>,
}

pub fn moderation_info(quarantine: Option<&Quarantine>) -> ModerationInfo {
    match quarantine {
        Some(q) => ModerationInfo {
            state: ModerationState::Quarantine,
            reason: Some(q.reason.clone()),
            source: Some(q.source),
            quarantined_at: Some(q.quarantined_at),
        },
        None => ModerationInfo {
            state: ModerationState::Allow,
            reason: None,
            source: None,
            quarantined_at: None,
        },
    }
}

/// Decide whether `viewer` may read `capsule`.
///
/// In order: (a) a quarantined capsule is visible to owner and moderators
/// only; (b) so is one with any policy-blocked derived artifact; (c)
/// otherwise a public, non-quarantined reference or ownership/moderation is
/// required.
pub fn resolve_capsule(
    capsule: &CapsuleRecord,
    artifacts: &[ArtifactLink],
    references: &[PostReference],
    viewer: &Viewer,
) -> AccessDecision {
    let is_owner = viewer.is(&capsule.owner);
    let is_moderator = viewer.moderator;
    let moderation = if capsule.is_quarantined() {
        ModerationState::Quarantine
    } else {
        ModerationState::Allow
    };
    let decide = |allowed, reason| AccessDecision {
        allowed,
        is_owner,
        is_moderator,
        moderation,
        reason,
    };
    let privileged = || {
        if is_owner {
            decide(true, AccessReason::Owner)
        } else {
            decide(true, AccessReason::Moderator)
        }
    };

    if capsule.is_quarantined() {
        return if is_owner || is_moderator {
            privileged()
        } else {
            decide(false, AccessReason::Quarantined)
        };
    }
    if artifacts.iter().any(|a| a.policy.is_blocking()) {
        return if is_owner || is_moderator {
            privileged()
        } else {
            decide(false, AccessReason::PolicyBlocked)
        };
    }
    if is_owner || is_moderator {
        return privileged();
    }
    if references.iter().any(PostReference::is_public) {
        return decide(true, AccessReason::PublicReference);
    }
    decide(false, AccessReason::NotPublic)
}

/// Decide whether `viewer` may read `artifact`. Non-owners only ever see
/// active, unblocked artifacts that are public or unlisted.
pub fn resolve_artifact(artifact: &ArtifactRecord, viewer: &Viewer) -> AccessDecision {
    let is_owner = viewer.is(&artifact.owner);
    let is_moderator = viewer.moderator;
    let blocked = artifact.policy.is_blocking() || artifact.quarantine.is_some();
    let moderation = if blocked {
        ModerationState::Quarantine
    } else {
        ModerationState::Allow
    };
    let decide = |allowed, reason| AccessDecision {
        allowed,
        is_owner,
        is_moderator,
        moderation,
        reason,
    };

    if is_owner {
        return decide(true, AccessReason::Owner);
    }
    if is_moderator {
        return decide(true, AccessReason::Moderator);
    }
    if blocked {
        return decide(false, AccessReason::PolicyBlocked);
    }
    if artifact.status != ArtifactStatus::Active {
        return decide(false, AccessReason::NotActive);
    }
    match artifact.visibility {
        Visibility::Public | Visibility::Unlisted => decide(true, AccessReason::PublicVisibility),
        Visibility::Private => decide(false, AccessReason::NotPublic),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use capsule_core::{FileMap, GenerateInput, Manifest, PlanTier, PolicyStatus, RunnerType};

    fn capsule(owner: &str, quarantined: bool) -> CapsuleRecord {
        let mut files = FileMap::new();
        files.insert("index.html".into(), b"x".to_vec());
        let manifest = Manifest::generate(
            None,
            GenerateInput {
                runner: RunnerType::ClientStatic,
                entry: "index.html",
                files: &files,
                detected_license: None,
            },
        )
        .unwrap();
        CapsuleRecord {
            id: "cap".into(),
            owner: owner.into(),
            hash: "cafe".into(),
            manifest,
            modules: vec![],
            warnings: vec![],
            quarantine: quarantined.then(|| Quarantine {
                reason: "crypto_miner".into(),
                source: QuarantineSource::Scanner,
                quarantined_at: 7,
            }),
            created_at: 0,
        }
    }

    fn public_ref() -> PostReference {
        PostReference {
            capsule_id: "cap".into(),
            post_id: "p1".into(),
            owner: "alice".into(),
            visibility: Visibility::Public,
            quarantined: false,
            created_at: 0,
        }
    }

    fn artifact(visibility: Visibility, status: ArtifactStatus, policy: PolicyStatus) -> ArtifactRecord {
        ArtifactRecord {
            id: "art".into(),
            owner: "alice".into(),
            plan: PlanTier::Free,
            capsule_id: Some("cap".into()),
            runner: RunnerType::ReactComponent,
            runtime_version: "1.0.0".into(),
            bundle_digest: None,
            status,
            policy,
            visibility,
            declared_size: 1,
            source_key: None,
            quarantine: None,
            error: None,
            created_at: 0,
            updated_at: 0,
        }
    }

    fn blocked_link() -> ArtifactLink {
        ArtifactLink {
            artifact_id: "art".into(),
            policy: PolicyStatus::Quarantined,
        }
    }

    #[test]
    fn quarantined_denial_matches_private_denial() {
        let quarantined = resolve_capsule(&capsule("alice", true), &[], &[public_ref()], &Viewer::anonymous());
        let private = resolve_capsule(&capsule("alice", false), &[], &[], &Viewer::anonymous());
        assert!(!quarantined.allowed);
        assert!(!private.allowed);
        assert!(!quarantined.privileged());
        assert!(!private.privileged());
    }

    #[test]
    fn owner_and_moderator_see_quarantined() {
        let c = capsule("alice", true);
        let owner = resolve_capsule(&c, &[], &[], &Viewer::user("alice"));
        assert!(owner.allowed && owner.is_owner && owner.privileged());
        assert_eq!(owner.moderation, ModerationState::Quarantine);

        let moderator = resolve_capsule(&c, &[], &[], &Viewer::moderator("mod"));
        assert_eq!(moderator.reason, AccessReason::Moderator);

        let stranger = resolve_capsule(&c, &[], &[], &Viewer::user("bob"));
        assert_eq!(stranger.reason, AccessReason::Quarantined);
    }

    #[test]
    fn blocked_artifact_hides_capsule() {
        let c = capsule("alice", false);
        let d = resolve_capsule(&c, &[blocked_link()], &[public_ref()], &Viewer::user("bob"));
        assert!(!d.allowed);
        assert_eq!(d.reason, AccessReason::PolicyBlocked);
        assert!(resolve_capsule(&c, &[blocked_link()], &[], &Viewer::user("alice")).allowed);
    }

    #[test]
    fn public_reference_grants_read() {
        let c = capsule("alice", false);
        let d = resolve_capsule(&c, &[], &[public_ref()], &Viewer::anonymous());
        assert!(d.allowed);
        assert!(!d.privileged());

        let mut hidden = public_ref();
        hidden.quarantined = true;
        assert!(!resolve_capsule(&c, &[], &[hidden], &Viewer::anonymous()).allowed);

        let mut unlisted = public_ref();
        unlisted.visibility = Visibility::Unlisted;
        assert!(!resolve_capsule(&c, &[], &[unlisted], &Viewer::anonymous()).allowed);
    }

    #[test]
    fn artifact_rules() {
        let viewer = Viewer::user("bob");
        let ok = artifact(Visibility::Public, ArtifactStatus::Active, PolicyStatus::Active);
        assert!(resolve_artifact(&ok, &viewer).allowed);

        let draft = artifact(Visibility::Public, ArtifactStatus::Draft, PolicyStatus::Active);
        assert_eq!(resolve_artifact(&draft, &viewer).reason, AccessReason::NotActive);

        let blocked = artifact(Visibility::Public, ArtifactStatus::Active, PolicyStatus::Quarantined);
        assert!(!resolve_artifact(&blocked, &viewer).allowed);
        assert!(resolve_artifact(&blocked, &Viewer::user("alice")).allowed);

        let private = artifact(Visibility::Private, ArtifactStatus::Active, PolicyStatus::Active);
        assert!(!resolve_artifact(&private, &viewer).allowed);
        assert!(resolve_artifact(&private, &Viewer::moderator("m")).allowed);
    }

    #[test]
    fn moderation_block_serializes() {
        let c = capsule("alice", true);
        let info = moderation_info(c.quarantine.as_ref());
        let json = serde_json::to_value(&info).unwrap();
        assert_eq!(json["state"], "quarantine");
        assert_eq!(json["reason"], "crypto_miner");
        assert_eq!(json["quarantinedAt"], 7);

        let clear = serde_json::to_value(moderation_info(None)).unwrap();
        assert_eq!(clear, serde_json::json!({ "state": "allow" }));
    }
}
