//! Core pipeline orchestration and domain logic for the alumni enrichment.
//!
//! This crate ties together registry preparation, roster loading, the
//! founder/partner join and the partitioned writer into the two entry
//! operations (`prepare_socios`, `run_pipeline`).

pub mod enrichment;
pub mod pipeline;
pub mod roster;
pub mod writer;
