//! Subvolume drivers.

use crate::error::{ExecError, ExecResult};
use crate::process::run_checked;
use clonedb_core::config::SubvolumeDriverKind;
use std::ffi::OsStr;
use std::fs::Permissions;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Upper bound on a single btrfs subvolume command.
const BTRFS_TIMEOUT: Duration = Duration::from_secs(300);

/// Directory mode for copied trees. The database refuses group or world
/// access to its data directory.
const DIR_MODE: u32 = 0o700;
const FILE_MODE_WRITABLE: u32 = 0o600;
const FILE_MODE_READ_ONLY: u32 = 0o400;

/// How subvolumes and snapshots are materialised.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SubvolumeDriver {
    /// `btrfs subvolume` commands. Snapshots are copy-on-write and instant.
    Btrfs,
    /// Plain directories and recursive copies. Copies are private to the
    /// owner and read-only snapshots drop the owner write bit on files.
    Directory,
}

impl From<SubvolumeDriverKind> for SubvolumeDriver {
    fn from(kind: SubvolumeDriverKind) -> Self {
        match kind {
            SubvolumeDriverKind::Btrfs => Self::Btrfs,
            SubvolumeDriverKind::Directory => Self::Directory,
        }
    }
}

impl SubvolumeDriver {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Btrfs => "btrfs",
            Self::Directory => "directory",
        }
    }

    /// Create an empty writable subvolume at `path`.
    pub async fn create(&self, path: &Path) -> ExecResult<()> {
        if tokio::fs::try_exists(path).await? {
            return Err(ExecError::AlreadyExists(path.display().to_string()));
        }
        match self {
            Self::Btrfs => {
                run_checked(
                    "btrfs",
                    [OsStr::new("subvolume"), OsStr::new("create"), path.as_os_str()],
                    BTRFS_TIMEOUT,
                )
                .await?;
            }
            Self::Directory => tokio::fs::create_dir(path).await?,
        }
        Ok(())
    }

    /// Snapshot `source` to `dest`.
    pub async fn snapshot(&self, source: &Path, dest: &Path, read_only: bool) -> ExecResult<()> {
        if !tokio::fs::try_exists(source).await? {
            return Err(ExecError::NotFound(source.display().to_string()));
        }
        if tokio::fs::try_exists(dest).await? {
            return Err(ExecError::AlreadyExists(dest.display().to_string()));
        }
        match self {
            Self::Btrfs => {
                let mut args = vec![OsStr::new("subvolume"), OsStr::new("snapshot")];
                if read_only {
                    args.push(OsStr::new("-r"));
                }
                args.push(source.as_os_str());
                args.push(dest.as_os_str());
                run_checked("btrfs", args, BTRFS_TIMEOUT).await?;
            }
            Self::Directory => {
                let source = source.to_path_buf();
                let dest = dest.to_path_buf();
                tokio::task::spawn_blocking(move || copy_tree(&source, &dest, read_only))
                    .await
                    .map_err(|e| {
                        ExecError::Io(std::io::Error::other(format!("spawn_blocking failed: {e}")))
                    })??;
            }
        }
        Ok(())
    }

    /// Delete a subvolume. Deleting a missing path is not an error.
    pub async fn delete(&self, path: &Path) -> ExecResult<()> {
        if !tokio::fs::try_exists(path).await? {
            return Ok(());
        }
        match self {
            Self::Btrfs => {
                run_checked(
                    "btrfs",
                    [OsStr::new("subvolume"), OsStr::new("delete"), path.as_os_str()],
                    BTRFS_TIMEOUT,
                )
                .await?;
            }
            Self::Directory => tokio::fs::remove_dir_all(path).await?,
        }
        Ok(())
    }
}

/// Recursively copy `source` to `dest` with owner-only permissions, file
/// modes matching `read_only`. Symlinks are recreated, not followed.
fn copy_tree(source: &Path, dest: &Path, read_only: bool) -> std::io::Result<()> {
    let file_mode = if read_only {
        FILE_MODE_READ_ONLY
    } else {
        FILE_MODE_WRITABLE
    };
    let mut pending: Vec<(PathBuf, PathBuf)> = vec![(source.to_path_buf(), dest.to_path_buf())];

    while let Some((from, to)) = pending.pop() {
        std::fs::create_dir(&to)?;
        std::fs::set_permissions(&to, Permissions::from_mode(DIR_MODE))?;
        for entry in std::fs::read_dir(&from)? {
            let entry = entry?;
            let file_type = entry.file_type()?;
            let target = to.join(entry.file_name());

            if file_type.is_dir() {
                pending.push((entry.path(), target));
            } else if file_type.is_symlink() {
                let link = std::fs::read_link(entry.path())?;
                std::os::unix::fs::symlink(link, &target)?;
            } else {
                std::fs::copy(entry.path(), &target)?;
                std::fs::set_permissions(&target, Permissions::from_mode(file_mode))?;
            }
        }
    }
    Ok(())
}
