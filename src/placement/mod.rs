//! Choosing which worker should host a newly opened document.
//!
//! A fleet controller collects one [`WorkerLoadReport`] per candidate worker
//! and calls [`pick_worker`]. Scoring is pure and keeps no state, so it can be
//! called from any number of tasks at once.

pub mod load;
pub mod scorer;

pub use load::{load_reports, load_reports_file, WorkerLoad, WorkerLoadReport};
pub use scorer::{pick_worker, pick_worker_with_rng, rank_workers, score_load, ScoredWorker};
