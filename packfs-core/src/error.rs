//! Error types for packfs.

use thiserror::Error;

/// Errors that can occur while rendering packs or serving the tree.
#[derive(Error, Debug)]
pub enum PackFsError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("Failed to start renderer for {pack}: {source}")]
    Spawn {
        pack: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to render pack {pack} (exit status {status}): {stderr}")]
    Render {
        pack: String,
        status: i32,
        stderr: String,
    },

    #[error("Render timed out after {seconds}s")]
    RenderTimeout { seconds: u64 },

    #[error("No bold filenames found in rendered output")]
    Parse,

    #[error("Path is both a file and a directory: {path}")]
    TreeConflict { path: String },

    #[error("Invalid path: {0}")]
    InvalidPath(String),

    #[error("No such file or directory: {0}")]
    NotFound(String),

    #[error("Not a directory: {0}")]
    NotADirectory(String),

    #[error("Is a directory: {0}")]
    IsADirectory(String),

    #[error("Read-only filesystem")]
    ReadOnly,

    #[error("Mount failed: {0}")]
    Mount(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl PackFsError {
    /// The errno reported to the kernel when this error ends a FUSE call.
    pub fn errno(&self) -> i32 {
        match self {
            PackFsError::NotFound(_) => libc::ENOENT,
            PackFsError::NotADirectory(_) => libc::ENOTDIR,
            PackFsError::IsADirectory(_) => libc::EISDIR,
            PackFsError::ReadOnly => libc::EROFS,
            PackFsError::InvalidPath(_) => libc::EINVAL,
            _ => libc::EIO,
        }
    }
}

/// Result type for packfs operations.
pub type PackFsResult<T> = Result<T, PackFsError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_errno_mapping() {
        assert_eq!(PackFsError::NotFound("/x".into()).errno(), libc::ENOENT);
        assert_eq!(PackFsError::NotADirectory("/x".into()).errno(), libc::ENOTDIR);
        assert_eq!(PackFsError::IsADirectory("/x".into()).errno(), libc::EISDIR);
        assert_eq!(PackFsError::ReadOnly.errno(), libc::EROFS);
        assert_eq!(PackFsError::Parse.errno(), libc::EIO);
    }

    #[test]
    fn test_render_error_carries_stderr() {
        let err = PackFsError::Render {
            pack: "hello".into(),
            status: 1,
            stderr: "bad variable".into(),
        };
        assert_eq!(
            err.to_string(),
            "Failed to render pack hello (exit status 1): bad variable"
        );
    }
}
