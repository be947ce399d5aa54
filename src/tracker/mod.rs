//! The injected runtime tracker: template definition and injection.
//!
//! Each instrumented module receives a private copy of the tracker type:
//! a static counter array sized to the module's hit count, a hit-file
//! path, and the machinery that aggregates per-thread counts and
//! persists them when the hosting process (or an isolation domain)
//! unloads. The template is held as pre-processed instruction data with
//! role-keyed operands; cloning it into a target module is a total
//! rewrite of those roles into concrete metadata tokens, so a template
//! edit can never leave a dangling cross-reference behind.

mod inject;
mod template;

pub(crate) use inject::{ImportCache, TrackerInjector};
pub(crate) use template::ExternalRef;

/// Namespace reserved for injected tracker types; the filter refuses to
/// instrument anything living under it.
pub(crate) const TRACKER_NAMESPACE: &str = "ILCover.Runtime";
