//! Token verification.

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use jsonwebtoken::{decode, decode_header, Algorithm, DecodingKey, Validation};
use serde::Deserialize;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use capsule_core::{CapsuleConfig, PlanTier, UserId};

use crate::error::{AuthError, AuthResult};
use crate::jwks::{HttpKeySetSource, JwksCache, KeySetSource};

/// Asymmetric algorithms only; shared-secret algorithms never verify
/// against a published key set.
pub const ALLOWED_ALGORITHMS: &[Algorithm] = &[
    Algorithm::RS256,
    Algorithm::RS384,
    Algorithm::RS512,
    Algorithm::PS256,
    Algorithm::ES256,
    Algorithm::ES384,
    Algorithm::EdDSA,
];

const MODERATOR_ROLE: &str = "moderator";

#[derive(Debug, Clone)]
pub struct VerifierSettings {
    pub issuer: String,
    /// Empty: audience is not checked.
    pub audiences: Vec<String>,
    pub jwks_url: String,
    pub jwks_ttl: Duration,
    pub clock_skew: Duration,
}

impl VerifierSettings {
    pub fn from_config(config: &CapsuleConfig) -> Self {
        Self {
            issuer: config.auth.issuer.clone(),
            audiences: config.auth.audiences.clone(),
            jwks_url: config.jwks_url(),
            jwks_ttl: Duration::from_secs(config.auth.jwks_ttl_secs),
            clock_skew: Duration::from_secs(config.auth.clock_skew_secs),
        }
    }
}

/// The verified caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub user_id: UserId,
    pub moderator: bool,
    pub plan: PlanTier,
}

#[derive(Debug, Deserialize)]
struct Claims {
    sub: Option<String>,
    iss: Option<String>,
    #[serde(default)]
    roles: Option<Value>,
    #[serde(default)]
    role: Option<Value>,
    #[serde(default)]
    plan: Option<String>,
}

pub struct IdentityVerifier {
    settings: VerifierSettings,
    keys: JwksCache,
}

impl IdentityVerifier {
    pub fn new(settings: VerifierSettings, source: Arc<dyn KeySetSource>) -> Self {
        let keys = JwksCache::new(source, settings.jwks_ttl);
        Self { settings, keys }
    }

    /// Verifier fetching keys over HTTPS.
    pub fn from_config(config: &CapsuleConfig) -> AuthResult<Self> {
        let source = HttpKeySetSource::new(Duration::from_secs(10))?;
        Ok(Self::new(VerifierSettings::from_config(config), Arc::new(source)))
    }

    pub fn is_configured(&self) -> bool {
        !self.settings.issuer.trim().is_empty()
    }

    /// Validate `token` and return the caller it identifies.
    pub async fn verify(&self, token: &str) -> AuthResult<Identity> {
        if !self.is_configured() {
            return Err(AuthError::NotConfigured);
        }
        check_structure(token)?;

        let header = decode_header(token)?;
        if !ALLOWED_ALGORITHMS.contains(&header.alg) {
            return Err(AuthError::UnsupportedAlgorithm(format!("{:?}", header.alg)));
        }
        let kid = header.kid.ok_or(AuthError::MissingKeyId)?;

        let jwk = self.keys.find(&self.settings.jwks_url, &kid).await?;
        let key = DecodingKey::from_jwk(&jwk).map_err(|e| AuthError::KeySet(e.to_string()))?;

        let mut validation = Validation::new(header.alg);
        validation.leeway = self.settings.clock_skew.as_secs();
        validation.validate_nbf = true;
        validation.set_required_spec_claims(&["exp", "sub"]);
        if self.settings.audiences.is_empty() {
            validation.validate_aud = false;
        } else {
            validation.set_audience(&self.settings.audiences);
        }

        let claims = decode::<Claims>(token, &key, &validation)
            .inspect_err(|e| debug!(kid = %kid, error = %e, "token rejected"))?
            .claims;

        let subject = claims
            .sub
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .ok_or(AuthError::MissingSubject)?
            .to_string();

        let issuer = claims.iss.as_deref().unwrap_or_default();
        if normalize_issuer(issuer) != normalize_issuer(&self.settings.issuer) {
            warn!(issuer, "token issuer mismatch");
            return Err(AuthError::IssuerMismatch(issuer.to_string()));
        }

        let moderator =
            has_role(claims.roles.as_ref(), MODERATOR_ROLE) || has_role(claims.role.as_ref(), MODERATOR_ROLE);
        let plan = claims
            .plan
            .as_deref()
            .and_then(|p| p.parse().ok())
            .unwrap_or_default();

        Ok(Identity {
            user_id: subject,
            moderator,
            plan,
        })
    }
}

/// Three non-empty base64url segments.
fn check_structure(token: &str) -> AuthResult<()> {
    let segments: Vec<&str> = token.split('.').collect();
    if segments.len() != 3 {
        return Err(AuthError::Malformed(format!(
            "expected 3 segments, found {}",
            segments.len()
        )));
    }
    for (name, segment) in ["header", "payload", "signature"].iter().zip(&segments) {
        if segment.is_empty() {
            return Err(AuthError::Malformed(format!("empty {name}")));
        }
        URL_SAFE_NO_PAD
            .decode(segment)
            .map_err(|_| AuthError::Malformed(format!("{name} is not base64url")))?;
    }
    Ok(())
}

fn normalize_issuer(issuer: &str) -> &str {
    issuer.trim().trim_end_matches('/')
}

/// `roles` may be an array or a space/comma separated string.
fn has_role(claim: Option<&Value>, role: &str) -> bool {
    match claim {
        Some(Value::String(s)) => s
            .split(|c: char| c == ',' || c.is_whitespace())
            .any(|r| r.eq_ignore_ascii_case(role)),
        Some(Value::Array(items)) => items
            .iter()
            .filter_map(Value::as_str)
            .any(|r| r.eq_ignore_ascii_case(role)),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use ed25519_dalek::SigningKey;
    use ed25519_dalek::pkcs8::EncodePrivateKey;
    use jsonwebtoken::jwk::JwkSet;
    use jsonwebtoken::{encode, EncodingKey, Header};
    use serde_json::json;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    const ISSUER: &str = "https://id.example.com/";
    const JWKS: &str = "https://id.example.com/.well-known/jwks.json";

    struct TestKeys {
        sets: Mutex<Vec<JwkSet>>,
        fetches: AtomicUsize,
    }

    impl TestKeys {
        /// Serves `sets` in order, repeating the last.
        fn new(sets: Vec<JwkSet>) -> Arc<Self> {
            Arc::new(Self {
                sets: Mutex::new(sets),
                fetches: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl KeySetSource for TestKeys {
        async fn fetch(&self, url: &str) -> AuthResult<JwkSet> {
            assert_eq!(url, JWKS);
            self.fetches.fetch_add(1, Ordering::SeqCst);
            let mut sets = self.sets.lock().unwrap();
            if sets.len() > 1 {
                Ok(sets.remove(0))
            } else {
                Ok(sets[0].clone())
            }
        }
    }

    fn signing_key(seed: u8) -> SigningKey {
        SigningKey::from_bytes(&[seed; 32])
    }

    fn jwk_set(entries: &[(&str, &SigningKey)]) -> JwkSet {
        let keys: Vec<Value> = entries
            .iter()
            .map(|(kid, key)| {
                json!({
                    "kty": "OKP",
                    "crv": "Ed25519",
                    "alg": "EdDSA",
                    "kid": kid,
                    "x": URL_SAFE_NO_PAD.encode(key.verifying_key().as_bytes()),
                })
            })
            .collect();
        serde_json::from_value(json!({ "keys": keys })).unwrap()
    }

    fn token(key: &SigningKey, kid: Option<&str>, claims: Value) -> String {
        let mut header = Header::new(Algorithm::EdDSA);
        header.kid = kid.map(String::from);
        let der = key.to_pkcs8_der().unwrap();
        encode(&header, &claims, &EncodingKey::from_ed_der(der.as_bytes())).unwrap()
    }

    fn now() -> u64 {
        capsule_core::unix_now()
    }

    fn settings(audiences: &[&str]) -> VerifierSettings {
        VerifierSettings {
            issuer: "https://id.example.com".into(),
            audiences: audiences.iter().map(|s| s.to_string()).collect(),
            jwks_url: JWKS.into(),
            jwks_ttl: Duration::from_secs(600),
            clock_skew: Duration::from_secs(60),
        }
    }

    fn verifier(source: Arc<TestKeys>, audiences: &[&str]) -> IdentityVerifier {
        IdentityVerifier::new(settings(audiences), source)
    }

    #[tokio::test]
    async fn accepts_valid_token_with_roles_and_plan() {
        let key = signing_key(1);
        let v = verifier(TestKeys::new(vec![jwk_set(&[("k1", &key)])]), &[]);
        let t = token(
            &key,
            Some("k1"),
            json!({ "sub": "alice", "iss": ISSUER, "exp": now() + 3600, "roles": ["user", "moderator"], "plan": "pro" }),
        );
        let id = v.verify(&t).await.unwrap();
        assert_eq!(id.user_id, "alice");
        assert!(id.moderator);
        assert_eq!(id.plan, PlanTier::Pro);
    }

    #[tokio::test]
    async fn rejects_structural_problems_before_fetching() {
        let source = TestKeys::new(vec![jwk_set(&[])]);
        let v = verifier(source.clone(), &[]);
        assert!(matches!(v.verify("a.b").await, Err(AuthError::Malformed(_))));
        assert!(matches!(v.verify("a..c").await, Err(AuthError::Malformed(_))));
        assert!(matches!(v.verify("a.b.c!").await, Err(AuthError::Malformed(_))));

        let key = signing_key(1);
        let no_kid = token(&key, None, json!({ "sub": "a", "iss": ISSUER, "exp": now() + 60 }));
        assert!(matches!(v.verify(&no_kid).await, Err(AuthError::MissingKeyId)));
        assert_eq!(source.fetches.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn rejects_shared_secret_algorithms() {
        let v = verifier(TestKeys::new(vec![jwk_set(&[])]), &[]);
        let mut header = Header::new(Algorithm::HS256);
        header.kid = Some("k1".into());
        let t = encode(
            &header,
            &json!({ "sub": "a", "iss": ISSUER, "exp": now() + 60 }),
            &EncodingKey::from_secret(b"secret"),
        )
        .unwrap();
        assert!(matches!(v.verify(&t).await, Err(AuthError::UnsupportedAlgorithm(_))));
    }

    #[tokio::test]
    async fn issuer_trailing_slash_is_normalized() {
        let key = signing_key(2);
        let v = verifier(TestKeys::new(vec![jwk_set(&[("k", &key)])]), &[]);
        let ok = token(&key, Some("k"), json!({ "sub": "a", "iss": "https://id.example.com//", "exp": now() + 60 }));
        assert!(v.verify(&ok).await.is_ok());

        let other = token(&key, Some("k"), json!({ "sub": "a", "iss": "https://evil.example.com", "exp": now() + 60 }));
        assert!(matches!(v.verify(&other).await, Err(AuthError::IssuerMismatch(_))));
    }

    #[tokio::test]
    async fn expiry_honours_clock_skew() {
        let key = signing_key(3);
        let v = verifier(TestKeys::new(vec![jwk_set(&[("k", &key)])]), &[]);
        let within = token(&key, Some("k"), json!({ "sub": "a", "iss": ISSUER, "exp": now() - 30 }));
        assert!(v.verify(&within).await.is_ok());
        let expired = token(&key, Some("k"), json!({ "sub": "a", "iss": ISSUER, "exp": now() - 600 }));
        assert!(matches!(v.verify(&expired).await, Err(AuthError::Invalid(_))));
        let future = token(&key, Some("k"), json!({ "sub": "a", "iss": ISSUER, "exp": now() + 900, "nbf": now() + 600 }));
        assert!(matches!(v.verify(&future).await, Err(AuthError::Invalid(_))));
    }

    #[tokio::test]
    async fn audience_checked_only_when_configured() {
        let key = signing_key(4);
        let claims = json!({ "sub": "a", "iss": ISSUER, "exp": now() + 60, "aud": "other" });
        let t = token(&key, Some("k"), claims);

        let open = verifier(TestKeys::new(vec![jwk_set(&[("k", &key)])]), &[]);
        assert!(open.verify(&t).await.is_ok());

        let strict = verifier(TestKeys::new(vec![jwk_set(&[("k", &key)])]), &["capsule"]);
        assert!(matches!(strict.verify(&t).await, Err(AuthError::Invalid(_))));
    }

    #[tokio::test]
    async fn missing_subject_is_rejected() {
        let key = signing_key(5);
        let v = verifier(TestKeys::new(vec![jwk_set(&[("k", &key)])]), &[]);
        let t = token(&key, Some("k"), json!({ "iss": ISSUER, "exp": now() + 60 }));
        assert!(matches!(v.verify(&t).await, Err(AuthError::MissingSubject)));
    }

    #[tokio::test]
    async fn unknown_kid_refreshes_exactly_once() {
        let old = signing_key(6);
        let rotated = signing_key(7);
        let source = TestKeys::new(vec![
            jwk_set(&[("old", &old)]),
            jwk_set(&[("old", &old), ("new", &rotated)]),
        ]);
        let v = verifier(source.clone(), &[]);

        let t = token(&old, Some("old"), json!({ "sub": "a", "iss": ISSUER, "exp": now() + 60 }));
        v.verify(&t).await.unwrap();
        v.verify(&t).await.unwrap();
        assert_eq!(source.fetches.load(Ordering::SeqCst), 1);

        let t = token(&rotated, Some("new"), json!({ "sub": "a", "iss": ISSUER, "exp": now() + 60 }));
        v.verify(&t).await.unwrap();
        assert_eq!(source.fetches.load(Ordering::SeqCst), 2);

        let t = token(&rotated, Some("gone"), json!({ "sub": "a", "iss": ISSUER, "exp": now() + 60 }));
        assert!(matches!(v.verify(&t).await, Err(AuthError::UnknownKey(_))));
        assert_eq!(source.fetches.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn unconfigured_verifier_rejects_everything() {
        let mut s = settings(&[]);
        s.issuer = String::new();
        let v = IdentityVerifier::new(s, TestKeys::new(vec![jwk_set(&[])]));
        assert!(matches!(v.verify("a.b.c").await, Err(AuthError::NotConfigured)));
    }

    #[test]
    fn role_claims_accept_strings_and_arrays() {
        assert!(has_role(Some(&json!("user moderator")), "moderator"));
        assert!(has_role(Some(&json!(["Moderator"])), "moderator"));
        assert!(!has_role(Some(&json!("moderators")), "moderator"));
        assert!(!has_role(None, "moderator"));
    }
}
