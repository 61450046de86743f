//! FUSE adapter over [`RenderTree`].
//!
//! Every callback is answered from the tree; nothing here changes after
//! construction. Mutating calls are refused with `EROFS`.

use std::ffi::OsStr;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use fuser::{
    FileAttr, FileType, Filesystem, MountOption, ReplyAttr, ReplyCreate, ReplyData,
    ReplyDirectory, ReplyEmpty, ReplyEntry, ReplyOpen, ReplyStatfs, ReplyWrite, Request,
};
use tracing::{debug, info};

use super::tree::{NodeKind, NodeStat, RenderTree};
use crate::error::{PackFsError, PackFsResult};

/// Attribute cache lifetime handed to the kernel.
const TTL: Duration = Duration::from_secs(1);

/// Permission bits of directories (r-x for everyone).
pub const DIR_PERM: u16 = 0o555;
/// Permission bits of files (r-- for everyone).
pub const FILE_PERM: u16 = 0o444;
/// Size reported for directories.
const DIR_SIZE: u64 = 4096;
const BLOCK_SIZE: u32 = 512;

/// Name the mount shows up under in the mount table.
pub const FS_NAME: &str = "nomad-pack-fs";
pub const FS_SUBTYPE: &str = "packfs";

/// Nominal values for `statfs`; the tree has no real block allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatFs {
    pub blocks: u64,
    pub bfree: u64,
    pub bavail: u64,
    pub files: u64,
    pub ffree: u64,
    pub bsize: u32,
    pub namelen: u32,
    pub frsize: u32,
}

/// Read-only filesystem serving a [`RenderTree`].
pub struct RenderFs {
    tree: Arc<RenderTree>,
    uid: u32,
    gid: u32,
    built: SystemTime,
}

impl RenderFs {
    /// Serve `tree`, owned by the current user.
    pub fn new(tree: Arc<RenderTree>) -> Self {
        let (uid, gid) = unsafe { (libc::getuid(), libc::getgid()) };
        Self::with_owner(tree, uid, gid)
    }

    pub fn with_owner(tree: Arc<RenderTree>, uid: u32, gid: u32) -> Self {
        Self {
            tree,
            uid,
            gid,
            built: SystemTime::now(),
        }
    }

    pub fn tree(&self) -> &RenderTree {
        &self.tree
    }

    fn to_file_attr(&self, stat: NodeStat) -> FileAttr {
        let (kind, perm, size) = match stat.kind {
            NodeKind::Directory => (FileType::Directory, DIR_PERM, DIR_SIZE),
            NodeKind::File => (FileType::RegularFile, FILE_PERM, stat.size),
        };

        FileAttr {
            ino: stat.ino,
            size,
            blocks: size.div_ceil(BLOCK_SIZE as u64),
            atime: self.built,
            mtime: self.built,
            ctime: self.built,
            crtime: self.built,
            kind,
            perm,
            nlink: 2,
            uid: self.uid,
            gid: self.gid,
            rdev: 0,
            blksize: BLOCK_SIZE,
            flags: 0,
        }
    }

    /// Attributes of an inode.
    pub fn attr(&self, ino: u64) -> PackFsResult<FileAttr> {
        Ok(self.to_file_attr(self.tree.stat_ino(ino)?))
    }

    /// Attributes of `name` inside directory `parent`.
    pub fn lookup_attr(&self, parent: u64, name: &OsStr) -> PackFsResult<FileAttr> {
        let name = name
            .to_str()
            .ok_or_else(|| PackFsError::NotFound(name.to_string_lossy().into_owned()))?;
        let parent_path = self
            .tree
            .path_of(parent)
            .ok_or_else(|| PackFsError::NotFound(format!("inode {}", parent)))?;
        if self.tree.stat(parent_path)?.kind != NodeKind::Directory {
            return Err(PackFsError::NotADirectory(parent_path.to_string()));
        }
        let stat = self.tree.stat(&RenderTree::child_path(parent_path, name))?;
        Ok(self.to_file_attr(stat))
    }

    /// Directory entries as (inode, kind, name), `.` and `..` first.
    pub fn dir_entries(&self, ino: u64) -> PackFsResult<Vec<(u64, FileType, String)>> {
        let path = self
            .tree
            .path_of(ino)
            .ok_or_else(|| PackFsError::NotFound(format!("inode {}", ino)))?;
        let parent = self.tree.parent_ino(ino).unwrap_or(ino);

        self.tree
            .list_children(path)?
            .into_iter()
            .map(|name| match name.as_str() {
                "." => Ok((ino, FileType::Directory, name)),
                ".." => Ok((parent, FileType::Directory, name)),
                _ => {
                    let stat = self.tree.stat(&RenderTree::child_path(path, &name))?;
                    let kind = match stat.kind {
                        NodeKind::Directory => FileType::Directory,
                        NodeKind::File => FileType::RegularFile,
                    };
                    Ok((stat.ino, kind, name))
                }
            })
            .collect()
    }

    /// Bytes of file `ino` for a read of `size` at `offset`.
    pub fn read_bytes(&self, ino: u64, offset: i64, size: u32) -> PackFsResult<&[u8]> {
        let path = self
            .tree
            .path_of(ino)
            .ok_or_else(|| PackFsError::NotFound(format!("inode {}", ino)))?;
        let offset = u64::try_from(offset).map_err(|_| PackFsError::InvalidPath(path.to_string()))?;
        self.tree.read_range(path, offset, size as usize)
    }

    /// Check that an open is read-only and targets a file.
    pub fn check_open(&self, ino: u64, flags: i32) -> PackFsResult<()> {
        if flags & libc::O_ACCMODE != libc::O_RDONLY {
            return Err(PackFsError::ReadOnly);
        }
        let stat = self.tree.stat_ino(ino)?;
        if stat.kind == NodeKind::Directory {
            let path = self.tree.path_of(ino).unwrap_or_default();
            return Err(PackFsError::IsADirectory(path.to_string()));
        }
        Ok(())
    }

    pub fn statfs_values(&self) -> StatFs {
        StatFs {
            blocks: 4096,
            bfree: 2048,
            bavail: 2048,
            files: self.tree.node_count() as u64,
            ffree: 0,
            bsize: BLOCK_SIZE,
            namelen: 255,
            frsize: BLOCK_SIZE,
        }
    }
}

impl Filesystem for RenderFs {
    fn lookup(&mut self, _req: &Request, parent: u64, name: &OsStr, reply: ReplyEntry) {
        match self.lookup_attr(parent, name) {
            Ok(attr) => reply.entry(&TTL, &attr, 0),
            Err(e) => reply.error(e.errno()),
        }
    }

    fn getattr(&mut self, _req: &Request, ino: u64, reply: ReplyAttr) {
        match self.attr(ino) {
            Ok(attr) => reply.attr(&TTL, &attr),
            Err(e) => reply.error(e.errno()),
        }
    }

    fn readdir(
        &mut self,
        _req: &Request,
        ino: u64,
        _fh: u64,
        offset: i64,
        mut reply: ReplyDirectory,
    ) {
        let entries = match self.dir_entries(ino) {
            Ok(entries) => entries,
            Err(e) => {
                reply.error(e.errno());
                return;
            }
        };

        for (i, (e_ino, kind, name)) in entries.iter().enumerate().skip(offset.max(0) as usize) {
            if reply.add(*e_ino, (i + 1) as i64, *kind, name) {
                break;
            }
        }
        reply.ok();
    }

    fn open(&mut self, _req: &Request, ino: u64, flags: i32, reply: ReplyOpen) {
        match self.check_open(ino, flags) {
            Ok(()) => reply.opened(0, 0),
            Err(e) => reply.error(e.errno()),
        }
    }

    fn read(
        &mut self,
        _req: &Request,
        ino: u64,
        _fh: u64,
        offset: i64,
        size: u32,
        _flags: i32,
        _lock: Option<u64>,
        reply: ReplyData,
    ) {
        match self.read_bytes(ino, offset, size) {
            Ok(data) => reply.data(data),
            Err(e) => {
                debug!(ino, offset, error = %e, "read failed");
                reply.error(e.errno());
            }
        }
    }

    fn statfs(&mut self, _req: &Request, _ino: u64, reply: ReplyStatfs) {
        let s = self.statfs_values();
        reply.statfs(
            s.blocks, s.bfree, s.bavail, s.files, s.ffree, s.bsize, s.namelen, s.frsize,
        );
    }

    fn setattr(
        &mut self,
        _req: &Request,
        _ino: u64,
        _mode: Option<u32>,
        _uid: Option<u32>,
        _gid: Option<u32>,
        _size: Option<u64>,
        _atime: Option<fuser::TimeOrNow>,
        _mtime: Option<fuser::TimeOrNow>,
        _ctime: Option<SystemTime>,
        _fh: Option<u64>,
        _crtime: Option<SystemTime>,
        _chgtime: Option<SystemTime>,
        _bkuptime: Option<SystemTime>,
        _flags: Option<u32>,
        reply: ReplyAttr,
    ) {
        reply.error(PackFsError::ReadOnly.errno());
    }

    fn write(
        &mut self,
        _req: &Request,
        _ino: u64,
        _fh: u64,
        _offset: i64,
        _data: &[u8],
        _write_flags: u32,
        _flags: i32,
        _lock: Option<u64>,
        reply: ReplyWrite,
    ) {
        reply.error(PackFsError::ReadOnly.errno());
    }

    fn create(
        &mut self,
        _req: &Request,
        _parent: u64,
        _name: &OsStr,
        _mode: u32,
        _umask: u32,
        _flags: i32,
        reply: ReplyCreate,
    ) {
        reply.error(PackFsError::ReadOnly.errno());
    }

    fn mknod(
        &mut self,
        _req: &Request,
        _parent: u64,
        _name: &OsStr,
        _mode: u32,
        _umask: u32,
        _rdev: u32,
        reply: ReplyEntry,
    ) {
        reply.error(PackFsError::ReadOnly.errno());
    }

    fn mkdir(
        &mut self,
        _req: &Request,
        _parent: u64,
        _name: &OsStr,
        _mode: u32,
        _umask: u32,
        reply: ReplyEntry,
    ) {
        reply.error(PackFsError::ReadOnly.errno());
    }

    fn unlink(&mut self, _req: &Request, _parent: u64, _name: &OsStr, reply: ReplyEmpty) {
        reply.error(PackFsError::ReadOnly.errno());
    }

    fn rmdir(&mut self, _req: &Request, _parent: u64, _name: &OsStr, reply: ReplyEmpty) {
        reply.error(PackFsError::ReadOnly.errno());
    }

    fn symlink(
        &mut self,
        _req: &Request,
        _parent: u64,
        _link_name: &OsStr,
        _target: &Path,
        reply: ReplyEntry,
    ) {
        reply.error(PackFsError::ReadOnly.errno());
    }

    fn rename(
        &mut self,
        _req: &Request,
        _parent: u64,
        _name: &OsStr,
        _newparent: u64,
        _newname: &OsStr,
        _flags: u32,
        reply: ReplyEmpty,
    ) {
        reply.error(PackFsError::ReadOnly.errno());
    }

    fn link(
        &mut self,
        _req: &Request,
        _ino: u64,
        _newparent: u64,
        _newname: &OsStr,
        reply: ReplyEntry,
    ) {
        reply.error(PackFsError::ReadOnly.errno());
    }

    fn setxattr(
        &mut self,
        _req: &Request,
        _ino: u64,
        _name: &OsStr,
        _value: &[u8],
        _flags: i32,
        _position: u32,
        reply: ReplyEmpty,
    ) {
        reply.error(PackFsError::ReadOnly.errno());
    }

    fn removexattr(&mut self, _req: &Request, _ino: u64, _name: &OsStr, reply: ReplyEmpty) {
        reply.error(PackFsError::ReadOnly.errno());
    }
}

/// Mount options for a read-only render tree.
pub fn mount_options(auto_unmount: bool) -> Vec<MountOption> {
    let mut options = vec![
        MountOption::RO,
        MountOption::FSName(FS_NAME.to_string()),
        MountOption::Subtype(FS_SUBTYPE.to_string()),
        MountOption::DefaultPermissions,
    ];
    if auto_unmount {
        options.push(MountOption::AutoUnmount);
    }
    options
}

/// Mount in a background thread. Dropping the session unmounts.
pub fn spawn_mount(
    fs: RenderFs,
    mountpoint: &Path,
    auto_unmount: bool,
) -> PackFsResult<fuser::BackgroundSession> {
    info!(
        mountpoint = %mountpoint.display(),
        nodes = fs.tree().node_count(),
        "mounting render tree"
    );
    fuser::spawn_mount2(fs, mountpoint, &mount_options(auto_unmount))
        .map_err(|e| PackFsError::Mount(e.to_string()))
}

/// Check that `path` is an existing, empty directory.
pub fn check_mountpoint(path: &Path) -> PackFsResult<()> {
    let meta = std::fs::metadata(path).map_err(|e| {
        PackFsError::Config(format!("Mount point {}: {}", path.display(), e))
    })?;
    if !meta.is_dir() {
        return Err(PackFsError::Config(format!(
            "Mount point {} is not a directory",
            path.display()
        )));
    }
    if std::fs::read_dir(path)?.next().is_some() {
        return Err(PackFsError::Config(format!(
            "Mount point {} is not empty",
            path.display()
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::tree::ROOT_INO;
    use crate::orchestrator::{AggregateResult, JobOutcome};
    use crate::render::JobFiles;

    fn fs() -> RenderFs {
        let files: JobFiles = [
            ("README".to_string(), "hi there\n".to_string()),
            ("sub/dir/file.txt".to_string(), "nested\n".to_string()),
        ]
        .into_iter()
        .collect();
        let mut aggregate = AggregateResult::new();
        aggregate.insert("hello:job1".to_string(), JobOutcome::Rendered(files));
        let tree = RenderTree::build(&aggregate).unwrap();
        RenderFs::with_owner(Arc::new(tree), 1000, 1000)
    }

    fn ino(fs: &RenderFs, path: &str) -> u64 {
        fs.tree().stat(path).unwrap().ino
    }

    #[test]
    fn test_root_attr() {
        let fs = fs();
        let attr = fs.attr(ROOT_INO).unwrap();
        assert_eq!(attr.kind, FileType::Directory);
        assert_eq!(attr.perm, DIR_PERM);
        assert_eq!(attr.nlink, 2);
        assert_eq!(attr.uid, 1000);
    }

    #[test]
    fn test_file_attr() {
        let fs = fs();
        let attr = fs.attr(ino(&fs, "hello:job1/README")).unwrap();
        assert_eq!(attr.kind, FileType::RegularFile);
        assert_eq!(attr.perm, FILE_PERM);
        assert_eq!(attr.size, 9);
        assert_eq!(attr.nlink, 2);
        assert_eq!(attr.blocks, 1);
    }

    #[test]
    fn test_lookup() {
        let fs = fs();
        let job = fs
            .lookup_attr(ROOT_INO, OsStr::new("hello:job1"))
            .unwrap();
        assert_eq!(job.kind, FileType::Directory);

        let readme = fs.lookup_attr(job.ino, OsStr::new("README")).unwrap();
        assert_eq!(readme.size, 9);

        let err = fs.lookup_attr(job.ino, OsStr::new("missing")).unwrap_err();
        assert_eq!(err.errno(), libc::ENOENT);
        let err = fs.lookup_attr(readme.ino, OsStr::new("x")).unwrap_err();
        assert_eq!(err.errno(), libc::ENOTDIR);
    }

    #[test]
    fn test_dir_entries() {
        let fs = fs();
        let job_ino = ino(&fs, "hello:job1");
        let entries = fs.dir_entries(job_ino).unwrap();
        let names: Vec<&str> = entries.iter().map(|(_, _, n)| n.as_str()).collect();
        assert_eq!(names, vec![".", "..", "README", "sub"]);
        assert_eq!(entries[0].0, job_ino);
        assert_eq!(entries[1].0, ROOT_INO);
        assert_eq!(entries[2].1, FileType::RegularFile);
        assert_eq!(entries[3].1, FileType::Directory);

        assert_eq!(fs.dir_entries(999).unwrap_err().errno(), libc::ENOENT);
    }

    #[test]
    fn test_read_bytes() {
        let fs = fs();
        let file = ino(&fs, "hello:job1/sub/dir/file.txt");
        assert_eq!(fs.read_bytes(file, 0, 7).unwrap(), b"nested\n");
        assert_eq!(fs.read_bytes(file, 3, 100).unwrap(), b"ted\n");
        assert!(fs.read_bytes(file, 7, 10).unwrap().is_empty());
        assert_eq!(fs.read_bytes(file, -1, 1).unwrap_err().errno(), libc::EINVAL);
        assert_eq!(
            fs.read_bytes(ino(&fs, "hello:job1/sub"), 0, 1).unwrap_err().errno(),
            libc::EISDIR
        );
    }

    #[test]
    fn test_open_is_read_only() {
        let fs = fs();
        let file = ino(&fs, "hello:job1/README");
        assert!(fs.check_open(file, libc::O_RDONLY).is_ok());
        assert_eq!(fs.check_open(file, libc::O_WRONLY).unwrap_err().errno(), libc::EROFS);
        assert_eq!(fs.check_open(file, libc::O_RDWR).unwrap_err().errno(), libc::EROFS);
        assert_eq!(
            fs.check_open(ROOT_INO, libc::O_RDONLY).unwrap_err().errno(),
            libc::EISDIR
        );
    }

    #[test]
    fn test_statfs_values() {
        let s = fs().statfs_values();
        assert_eq!(s.bsize, 512);
        assert_eq!(s.blocks, 4096);
        assert_eq!(s.bavail, 2048);
        // root, hello:job1, README, sub, sub/dir, file.txt
        assert_eq!(s.files, 6);
    }

    #[test]
    fn test_mount_options() {
        let options = mount_options(false);
        assert!(options.contains(&MountOption::RO));
        assert!(!options.contains(&MountOption::AutoUnmount));
        assert!(mount_options(true).contains(&MountOption::AutoUnmount));
    }

    #[test]
    fn test_check_mountpoint() {
        let dir = tempfile::tempdir().unwrap();
        assert!(check_mountpoint(dir.path()).is_ok());

        let file = dir.path().join("occupied");
        std::fs::write(&file, b"x").unwrap();
        assert!(matches!(check_mountpoint(dir.path()), Err(PackFsError::Config(_))));
        assert!(matches!(check_mountpoint(&file), Err(PackFsError::Config(_))));
        assert!(matches!(
            check_mountpoint(&dir.path().join("missing")),
            Err(PackFsError::Config(_))
        ));
    }
}
