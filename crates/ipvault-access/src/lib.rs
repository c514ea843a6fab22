//! ipvault-access: policy-gated release of manifest keys
//!
//! [`AccessControlService`] is the seam the pipeline talks to.
//! [`LocalAccessControl`] implements it in-process, resolving policy
//! conditions through an [`AttributeResolver`] such as [`BalanceLedger`].
//! Callers prove their subject with a bearer token checked by an
//! [`IdentityVerifier`] before any condition is evaluated.

pub mod error;
pub mod identity;
pub mod ledger;
pub mod local;
pub mod service;

pub use error::AccessError;
pub use identity::{IdentityVerifier, SessionTokens};
pub use ledger::{AttributeResolver, BalanceLedger, LedgerEntry};
pub use local::LocalAccessControl;
pub use service::{AccessControlService, KeyPayload};
