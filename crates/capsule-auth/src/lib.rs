//! capsule-auth — identity verifier.
//!
//! Bearer tokens are `header.payload.signature` JWTs signed with an
//! asymmetric key from the issuer's published key set. Key sets are cached
//! per URL with a TTL; an unknown key id forces one refresh before the
//! token is rejected.

mod error;
mod jwks;
mod verifier;

pub use error::{AuthError, AuthResult};
pub use jwks::{HttpKeySetSource, JwksCache, KeySetSource};
pub use verifier::{Identity, IdentityVerifier, VerifierSettings, ALLOWED_ALGORITHMS};
