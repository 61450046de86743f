//! Nomad Pack render filesystem core
//!
//! This crate renders Nomad Pack jobs and exposes the results as a
//! read-only filesystem:
//! - Configuration decoding (packs, jobs, template variables)
//! - Rendering through `nomad-pack` on a pseudo-terminal
//! - Transcript parsing into per-job file sets
//! - An immutable path tree and its FUSE adapter
//!
//! # Architecture
//!
//! The pipeline runs once, before mounting:
//! - `PackConfig`: decoded pack document
//! - `JobOrchestrator`: renders every job with bounded parallelism
//! - `PackRenderer` trait: one render of one job (`NomadPackRenderer`)
//! - `RenderTree`: the aggregate as a path tree
//! - `RenderFs`: serves the tree through `fuser`

pub mod config;
pub mod error;
pub mod fs;
pub mod orchestrator;
pub mod render;

pub use config::{JobVars, PackConfig, PackSettings};
pub use error::{PackFsError, PackFsResult};
pub use fs::{check_mountpoint, spawn_mount, NodeKind, NodeStat, RenderFs, RenderTree};
pub use orchestrator::{
    composite_key, plan_jobs, AggregateResult, JobOrchestrator, JobOutcome, PlannedJob,
    DEFAULT_MAX_CONCURRENT_RENDERS, JOB_NAME_VAR,
};
pub use render::{
    parse_rendered_output, JobFiles, NomadPackRenderer, PackRenderer, RenderRequest,
    RendererConfig, TerminalSize, DEFAULT_TIMEOUT_SECS,
};
