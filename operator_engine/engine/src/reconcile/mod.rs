//! Reconciliation of stored keystores against the keys that should be served.
//!
//! The plan is computed from plain values; backends apply it separately, so a
//! failed check never leaves a store half-updated.

pub mod cache;
pub mod desired;
pub mod engine;
pub mod plan;

pub use cache::RunCache;
pub use desired::{DesiredState, DesiredStateBuilder};
pub use engine::{
    Collaborators, ReconcileSettings, ReconciliationEngine, RunOutcome, deposit_public_keys,
};
pub use plan::{
    CurrentState, PlannedAddition, ReconciliationPlan, apply_plan, check_binding_with,
    check_mnemonic_binding, reconcile, reconcile_with_limit,
};
