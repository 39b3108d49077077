//! Host filesystem and mount table primitives.
//!
//! Every cgroup control-file interaction and every sandbox mount goes
//! through this module, so failures keep their precise cause: opening a
//! control file and half-writing it are different errors, and so are the
//! initial bind mount and the read-only remount that follows it. The spawn
//! pipeline switches on these distinctions.
//!
//! Files are opened through `std::fs`, which sets `O_CLOEXEC` on every fd -
//! nothing opened here can leak across an `execve`.

use std::ffi::CString;
use std::fs::{DirBuilder, File};
use std::io::{self, Read, Write as _};
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::{DirBuilderExt, PermissionsExt};
use std::path::{Path, PathBuf};

use rustix::io::Errno;
use thiserror::Error;

use judgebox_sys::mount;

/// Kernel mount table, one mount per line: `source target fstype options …`.
pub const MOUNTS_PATH: &str = "/proc/mounts";

/// Filesystem operation failure. Mount errors keep the two-phase bind
/// distinction callers rely on.
#[derive(Debug, Error)]
pub enum FsError {
    #[error("open {path}: {source}")]
    Open { path: PathBuf, source: io::Error },

    /// The write syscall itself failed - how the kernel rejects an invalid
    /// control-file value.
    #[error("write {path}: {source}")]
    Write { path: PathBuf, source: io::Error },

    #[error("short write to {path}: {written} of {expected} bytes")]
    ShortWrite {
        path: PathBuf,
        written: usize,
        expected: usize,
    },

    #[error("mkdir {path}: {source}")]
    Mkdir { path: PathBuf, source: io::Error },

    #[error("remove {path}: {source}")]
    Remove { path: PathBuf, source: io::Error },

    #[error("chmod {path}: {source}")]
    Chmod { path: PathBuf, source: io::Error },

    #[error("bind mount {dest}: {errno}")]
    BindMount { dest: PathBuf, errno: Errno },

    #[error("readonly remount {dest}: {errno}")]
    BindRemount { dest: PathBuf, errno: Errno },

    #[error("tmpfs mount {dest}: {errno}")]
    TmpfsMount { dest: PathBuf, errno: Errno },

    #[error("umount {dest}: {errno}")]
    Umount { dest: PathBuf, errno: Errno },

    #[error("read {path}: {source}")]
    MountTable { path: PathBuf, source: io::Error },

    #[error("path contains NUL byte: {path}")]
    BadPath { path: PathBuf },
}

/// Write `content` to `path` in a single write(2).
///
/// Cgroup control files reject partial writes, so a short write is reported
/// as its own error rather than retried.
pub fn write(path: &Path, content: &str) -> Result<(), FsError> {
    let mut file = File::create(path).map_err(|source| FsError::Open {
        path: path.to_path_buf(),
        source,
    })?;
    let written = file.write(content.as_bytes()).map_err(|source| FsError::Write {
        path: path.to_path_buf(),
        source,
    })?;
    if written != content.len() {
        return Err(FsError::ShortWrite {
            path: path.to_path_buf(),
            written,
            expected: content.len(),
        });
    }
    Ok(())
}

/// Read up to `max_len` bytes from `path` as a string.
///
/// Returns the empty string on any error; callers that need to distinguish
/// "empty file" from "unreadable" check existence first.
pub fn read(path: &Path, max_len: usize) -> String {
    let Ok(file) = File::open(path) else {
        return String::new();
    };
    let mut buf = Vec::with_capacity(max_len.min(4096));
    match file.take(max_len as u64).read_to_end(&mut buf) {
        Ok(_) => String::from_utf8_lossy(&buf).into_owned(),
        Err(_) => String::new(),
    }
}

/// Whether `path` is an existing directory.
#[inline]
pub fn is_dir(path: &Path) -> bool {
    path.is_dir()
}

/// `mkdir -p` with an explicit mode. Returns the number of directories
/// actually created; components that already exist are not counted.
pub fn mkdir_p(path: &Path, mode: u32) -> Result<usize, FsError> {
    let mut created = 0;
    let mut current = PathBuf::new();
    for component in path.components() {
        current.push(component);
        if current.as_os_str() == "/" || current.is_dir() {
            continue;
        }
        match DirBuilder::new().mode(mode).create(&current) {
            Ok(()) => created += 1,
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {}
            Err(source) => {
                return Err(FsError::Mkdir {
                    path: current,
                    source,
                });
            }
        }
    }
    Ok(created)
}

/// Recursively delete `path`, whatever its entries are.
///
/// Does not unmount anything: callers must umount first, or entries that
/// were mount points will be traversed into. A missing path is success.
pub fn rm_rf(path: &Path) -> Result<(), FsError> {
    let meta = match std::fs::symlink_metadata(path) {
        Ok(meta) => meta,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
        Err(source) => {
            return Err(FsError::Remove {
                path: path.to_path_buf(),
                source,
            });
        }
    };

    if meta.is_dir() {
        let entries = std::fs::read_dir(path).map_err(|source| FsError::Remove {
            path: path.to_path_buf(),
            source,
        })?;
        for entry in entries {
            let entry = entry.map_err(|source| FsError::Remove {
                path: path.to_path_buf(),
                source,
            })?;
            rm_rf(&entry.path())?;
        }
        std::fs::remove_dir(path).map_err(|source| FsError::Remove {
            path: path.to_path_buf(),
            source,
        })
    } else {
        std::fs::remove_file(path).map_err(|source| FsError::Remove {
            path: path.to_path_buf(),
            source,
        })
    }
}

/// chmod(2).
pub fn chmod(path: &Path, mode: u32) -> Result<(), FsError> {
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode)).map_err(|source| {
        FsError::Chmod {
            path: path.to_path_buf(),
            source,
        }
    })
}

/// Bind `src` onto `dest` read-only with `nosuid`.
///
/// Two kernel operations: the bind itself, then the read-only remount.
/// Each failure keeps its own variant so callers can tell which step broke.
pub fn mount_bind(src: &Path, dest: &Path) -> Result<(), FsError> {
    let src_c = path_to_cstring(src)?;
    let dest_c = path_to_cstring(dest)?;
    mount::bind(&src_c, &dest_c).map_err(|errno| FsError::BindMount {
        dest: dest.to_path_buf(),
        errno,
    })?;
    mount::remount_readonly(&dest_c).map_err(|errno| FsError::BindRemount {
        dest: dest.to_path_buf(),
        errno,
    })
}

/// Mount a `nosuid` tmpfs at `dest`, capped at `max_size` bytes (the kernel
/// may round the cap up to its block size).
pub fn mount_tmpfs(dest: &Path, max_size: u64, mode: u32) -> Result<(), FsError> {
    let dest_c = path_to_cstring(dest)?;
    let data = tmpfs_data(max_size, mode);
    mount::tmpfs(&dest_c, &data).map_err(|errno| FsError::TmpfsMount {
        dest: dest.to_path_buf(),
        errno,
    })
}

/// Unmount `dest`. `lazy` selects `MNT_DETACH`, so busy mounts succeed.
pub fn umount(dest: &Path, lazy: bool) -> Result<(), FsError> {
    let dest_c = path_to_cstring(dest)?;
    mount::umount(&dest_c, lazy).map_err(|errno| FsError::Umount {
        dest: dest.to_path_buf(),
        errno,
    })
}

/// One line of the kernel mount table.
#[derive(Debug, Clone)]
pub struct MountEntry {
    pub source: String,
    pub target: String,
    pub fstype: String,
    pub options: Vec<String>,
}

impl MountEntry {
    /// Whether the comma-separated option list carries `name` exactly.
    pub fn has_option(&self, name: &str) -> bool {
        self.options.iter().any(|o| o == name)
    }
}

/// Enumerate current mount points from [`MOUNTS_PATH`].
pub fn mounts() -> Result<Vec<MountEntry>, FsError> {
    let path = Path::new(MOUNTS_PATH);
    let content = std::fs::read_to_string(path).map_err(|source| FsError::MountTable {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(parse_mounts(&content))
}

fn parse_mounts(content: &str) -> Vec<MountEntry> {
    content
        .lines()
        .filter_map(|line| {
            let mut fields = line.split_whitespace();
            Some(MountEntry {
                source: fields.next()?.to_string(),
                target: fields.next()?.to_string(),
                fstype: fields.next()?.to_string(),
                options: fields
                    .next()
                    .map(|o| o.split(',').map(str::to_string).collect())
                    .unwrap_or_default(),
            })
        })
        .collect()
}

/// Build the tmpfs mount data string. Pure so the spawn pipeline can
/// pre-allocate it in the parent before forking.
pub(crate) fn tmpfs_data(max_size: u64, mode: u32) -> CString {
    // A u64 size and an octal mode never contain NUL.
    CString::new(format!("size={max_size},mode=0{mode:o}")).unwrap()
}

pub(crate) fn path_to_cstring(path: &Path) -> Result<CString, FsError> {
    CString::new(path.as_os_str().as_bytes()).map_err(|_| FsError::BadPath {
        path: path.to_path_buf(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_then_read_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("value");
        write(&path, "4194304\n").unwrap();
        assert_eq!(read(&path, 1024), "4194304\n");
    }

    #[test]
    fn read_caps_at_max_len() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("long");
        write(&path, "abcdefgh").unwrap();
        assert_eq!(read(&path, 3), "abc");
    }

    #[test]
    fn read_missing_file_is_empty() {
        assert_eq!(read(Path::new("/nonexistent/property"), 255), "");
    }

    #[test]
    fn write_to_unopenable_path_is_open_error() {
        let err = write(Path::new("/nonexistent/dir/file"), "x").unwrap_err();
        assert!(matches!(err, FsError::Open { .. }));
    }

    #[test]
    fn mkdir_p_counts_created_dirs() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("a/b/c");
        assert_eq!(mkdir_p(&target, 0o755).unwrap(), 3);
        // Second call creates nothing.
        assert_eq!(mkdir_p(&target, 0o755).unwrap(), 0);
        assert!(target.is_dir());
    }

    #[test]
    fn rm_rf_removes_tree() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("tree");
        mkdir_p(&root.join("x/y"), 0o755).unwrap();
        write(&root.join("x/file"), "data").unwrap();
        rm_rf(&root).unwrap();
        assert!(!root.exists());
    }

    #[test]
    fn rm_rf_missing_path_is_ok() {
        assert!(rm_rf(Path::new("/nonexistent/tree")).is_ok());
    }

    #[test]
    fn chmod_applies_mode() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("f");
        write(&path, "").unwrap();
        chmod(&path, 0o600).unwrap();
        let mode = std::fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[test]
    fn parse_mounts_extracts_fields() {
        let table = "\
cgroup /sys/fs/cgroup/memory cgroup rw,nosuid,nodev,noexec,relatime,memory,cpuacct 0 0
proc /proc proc rw,nosuid,nodev,noexec,relatime 0 0
tmpfs /run tmpfs rw,nosuid,nodev,size=402936k,mode=755 0 0
";
        let entries = parse_mounts(table);
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[0].fstype, "cgroup");
        assert_eq!(entries[0].target, "/sys/fs/cgroup/memory");
        assert!(entries[0].has_option("memory"));
        assert!(entries[0].has_option("cpuacct"));
        assert!(!entries[0].has_option("mem"));
        assert!(!entries[1].has_option("memory"));
    }

    #[test]
    fn parse_mounts_skips_malformed_lines() {
        let entries = parse_mounts("too short\n\n");
        assert!(entries.is_empty());
    }

    #[test]
    fn tmpfs_data_format() {
        let data = tmpfs_data(1 << 20, 0o777);
        assert_eq!(data.to_str().unwrap(), "size=1048576,mode=0777");
    }
}
