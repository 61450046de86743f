//! Filesystem view of rendered jobs.
//!
//! - `tree`: immutable path tree built from the render results
//! - `fuse`: read-only FUSE adapter serving that tree

mod fuse;
mod tree;

pub use fuse::{
    check_mountpoint, mount_options, spawn_mount, RenderFs, StatFs, DIR_PERM, FILE_PERM,
    FS_NAME, FS_SUBTYPE,
};
pub use tree::{NodeKind, NodeStat, RenderTree, ROOT_INO};
