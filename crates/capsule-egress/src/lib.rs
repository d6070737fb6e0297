//! capsule-egress — mediates outbound calls made on behalf of running
//! capsules.
//!
//! A call passes, in order: URL and scheme validation, the literal
//! address-class check ([`address`]), the effective allowlist
//! (manifest ∩ deployment, [`policy`]), resolution with every address
//! re-checked and pinned ([`client`]). Headers are filtered both ways
//! ([`headers`]). Rate limiting and ownership are applied by the caller.

pub mod address;
pub mod client;
pub mod error;
pub mod headers;
pub mod policy;

pub use address::{check_host, classify_ip, BlockReason};
pub use client::{EgressClient, EgressRequest, EgressResponse, SystemResolver};
pub use error::{EgressError, EgressResult};
pub use headers::{apply_cors, filter_request_headers, filter_response_headers};
pub use policy::{parse_target, EffectiveAllowlist, EgressTarget};
