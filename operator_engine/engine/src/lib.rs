//! Operator engine core library
//!
//! Validator key derivation, deposit data, committee shares and keystore
//! reconciliation for a staking operator.

pub mod audit;
pub mod bls;
pub mod collaborators;
pub mod config;
pub mod deposit;
pub mod derivation;
pub mod error;
pub mod logging;
pub mod reconcile;
pub mod shares;
pub mod store;
pub mod types;

pub use error::{EngineError, EngineResult};
