//! Statistical engine: stopping rules (SPRT, SPSA), Elo estimates and the chi-square test
//! behind result purging. Everything in here is pure computation on [`crate::model::Stats`].

pub mod chi2;
pub mod elo;
pub mod spsa;
pub mod sprt;

pub use elo::EloEstimate;
pub use spsa::{SpsaBatch, SpsaRun};
pub use sprt::{EloModel, SprtDecision, SprtState};
