//! §4.1–§4.3: the abstract media-engine contract and the pieces built on
//! top of it (worker pool, per-room router cluster, active-speaker
//! detection).

pub mod cluster;
pub mod detector;
pub mod engine;
pub mod worker_pool;
