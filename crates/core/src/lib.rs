//! Long-video diffusion generation engine.
//!
//! Clips longer than a model's native span are produced by a sliding
//! window of overlapping generation passes whose seams are cross-faded.
//! Around that loop sit a descriptor registry with override chains, a
//! budgeted resource manager with LRU eviction and tiled execution, an
//! additive LoRA composer, a per-branch step-skip cache, and a FIFO job
//! queue with one device lane and concurrent CPU preprocessing.

pub mod adapters;
pub mod backend;
pub mod config;
pub mod error;
pub mod job;
pub mod logging;
pub mod media;
pub mod persistence;
pub mod queue;
pub mod registry;
pub mod resources;
pub mod stepcache;
pub mod window;

pub use error::{EngineError, Result};
