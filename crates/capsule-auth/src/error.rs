use thiserror::Error;

pub type AuthResult<T> = Result<T, AuthError>;

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("missing bearer token")]
    MissingToken,

    #[error("malformed token: {0}")]
    Malformed(String),

    #[error("unsupported signature algorithm: {0}")]
    UnsupportedAlgorithm(String),

    #[error("token has no key id")]
    MissingKeyId,

    #[error("token has no subject")]
    MissingSubject,

    #[error("no key {0} in the issuer key set")]
    UnknownKey(String),

    #[error("issuer mismatch: {0}")]
    IssuerMismatch(String),

    #[error("token rejected: {0}")]
    Invalid(String),

    #[error("key set unavailable: {0}")]
    KeySet(String),

    #[error("identity verification is not configured")]
    NotConfigured,
}

impl AuthError {
    /// Failures caused by the key set service rather than the token.
    pub fn is_upstream(&self) -> bool {
        matches!(self, AuthError::KeySet(_))
    }
}

impl From<jsonwebtoken::errors::Error> for AuthError {
    fn from(e: jsonwebtoken::errors::Error) -> Self {
        use jsonwebtoken::errors::ErrorKind;
        match e.kind() {
            ErrorKind::InvalidToken | ErrorKind::Base64(_) | ErrorKind::Json(_) | ErrorKind::Utf8(_) => {
                AuthError::Malformed(e.to_string())
            }
            ErrorKind::ExpiredSignature => AuthError::Invalid("token expired".into()),
            ErrorKind::ImmatureSignature => AuthError::Invalid("token not yet valid".into()),
            ErrorKind::InvalidAudience => AuthError::Invalid("audience not accepted".into()),
            ErrorKind::InvalidSignature => AuthError::Invalid("bad signature".into()),
            ErrorKind::MissingRequiredClaim(claim) => {
                if claim == "sub" {
                    AuthError::MissingSubject
                } else {
                    AuthError::Invalid(format!("missing claim {claim}"))
                }
            }
            _ => AuthError::Invalid(e.to_string()),
        }
    }
}
