//! Renewal scheduling
//!
//! One recurring check drives all certificate renewals: the wildcard
//! certificate through [`crate::acme::WildcardCertManager`] and agent
//! leaves through [`crate::pki::AgentCertIssuer`]. Runs are serialized
//! across processes by a named file lock; overlap avoidance wins over
//! exhaustiveness, so a contended check is skipped and the next interval
//! tries again.

mod scheduler;

pub use scheduler::{CheckOutcome, RenewalScheduler};
