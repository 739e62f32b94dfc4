// sbak_common is the main sbak library implementing the backup engine logic.
// Copyright (C) 2024  Himbeer <himbeerserverde@gmail.com>
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program.  If not, see <https://www.gnu.org/licenses/>.

use crate::subprocess;
use crate::BackupError;

use std::fs::{self, File};
use std::io;
use std::path::{Component, Path, PathBuf};

use log::warn;
use nix::unistd::AccessFlags;

/// Name of the mutable staging subvolume inside a backup volume.
pub const SYNC_DIR: &str = ".sync";
/// Name of the lock sentinel file inside a backup volume.
pub const SYNC_LOCKFILE: &str = ".sync_lock";

/// A `BtrfsVolume` represents one backup directory on a btrfs filesystem.
/// It provides subvolume operations relative to its base path and confines
/// every resolved path to that base.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct BtrfsVolume {
    path: PathBuf,
    sync_path: PathBuf,
    lockfile: PathBuf,
}

impl BtrfsVolume {
    /// Constructs a new `BtrfsVolume` rooted at the given path.
    /// Relative paths are resolved against the current working directory.
    /// No filesystem checks happen here, see the `assure_*` methods.
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self, BackupError> {
        let path = path.as_ref();
        let path = if path.is_absolute() {
            normalize(path)
        } else {
            normalize(&std::env::current_dir()?.join(path))
        };

        let sync_path = path.join(SYNC_DIR);
        let lockfile = path.join(SYNC_LOCKFILE);

        Ok(Self {
            path,
            sync_path,
            lockfile,
        })
    }

    /// Returns the absolute base path of the volume.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns the absolute path of the sync dir of the volume.
    pub fn sync_path(&self) -> &Path {
        &self.sync_path
    }

    /// Resolves a path relative to the volume and returns it absolute.
    /// An absolute input is accepted if it already points inside the volume.
    ///
    /// # Panics
    ///
    /// Panics if the normalized result escapes the volume. Escaping paths
    /// are a programming error, user input never reaches this unchecked.
    pub fn path_join<P: AsRef<Path>>(&self, path: P) -> PathBuf {
        let path = path.as_ref();
        let joined = normalize(&self.path.join(path));

        assert!(
            joined.starts_with(&self.path),
            "invalid path, join `{}` with `{}`",
            self.path.display(),
            path.display()
        );

        joined
    }

    /// Fails unless the base path exists and is a directory.
    pub fn assure_path(&self) -> Result<(), BackupError> {
        if !self.path.exists() {
            return Err(BackupError::BackupDirNotFound(self.path.clone()));
        }
        if !self.path.is_dir() {
            return Err(BackupError::BackupDirError {
                message: "not a directory",
                path: self.path.clone(),
            });
        }

        Ok(())
    }

    /// Fails unless the base path is a directory
    /// writable by the current process.
    pub fn assure_writable(&self) -> Result<(), BackupError> {
        self.assure_path()?;

        if nix::unistd::access(&self.path, AccessFlags::W_OK).is_err() {
            return Err(BackupError::BackupDirError {
                message: "not writable",
                path: self.path.clone(),
            });
        }

        Ok(())
    }

    /// Fails unless the base path is on a btrfs filesystem.
    pub fn assure_btrfs(&self) -> Result<(), BackupError> {
        if !subprocess::is_btrfs(&self.path)? {
            return Err(BackupError::BackupDirError {
                message: "not a btrfs",
                path: self.path.clone(),
            });
        }

        Ok(())
    }

    /// Creates the base directory of the volume. Idempotent.
    pub fn setup(&self) -> Result<(), BackupError> {
        fs::create_dir_all(&self.path)?;
        Ok(())
    }

    /// Creates the subvolume `name` in this volume.
    pub fn create_subvolume(&self, name: &str) -> Result<(), BackupError> {
        subprocess::create_subvolume(&self.path_join(name))
    }

    /// Deletes the subvolume `name` in this volume.
    pub fn delete_subvolume(&self, name: &str) -> Result<(), BackupError> {
        subprocess::delete_subvolume(&self.path_join(name))
    }

    /// Makes a snapshot of `source` at `target`, both inside this volume.
    pub fn make_snapshot(&self, source: &str, target: &str, readonly: bool) -> Result<(), BackupError> {
        subprocess::make_snapshot(&self.path_join(source), &self.path_join(target), readonly)
    }

    /// Acquires the sync lock of this volume.
    /// The lock is released when the returned guard is dropped.
    pub fn lock(&self) -> Result<Lock, BackupError> {
        Lock::acquire(self.lockfile.clone())
    }
}

/// Lexically normalizes a path: `.` components are dropped
/// and `..` components pop their parent without touching the filesystem.
fn normalize(path: &Path) -> PathBuf {
    let mut normalized = PathBuf::new();

    for component in path.components() {
        match component {
            Component::Prefix(prefix) => normalized.push(prefix.as_os_str()),
            Component::RootDir => normalized.push(component.as_os_str()),
            Component::CurDir => {}
            Component::ParentDir => {
                normalized.pop();
            }
            Component::Normal(part) => normalized.push(part),
        }
    }

    normalized
}

/// A `Lock` holds the presence-based sync lock of a backup volume.
/// Dropping it deletes the lockfile.
///
/// The probe-then-create acquisition is advisory: two engines racing
/// the creation may both succeed. Scheduled single-host jobs do not
/// contend; a lockfile left behind by a crash must be removed manually.
#[derive(Debug)]
pub struct Lock {
    lockfile: PathBuf,
}

impl Lock {
    fn acquire(lockfile: PathBuf) -> Result<Self, BackupError> {
        match File::open(&lockfile) {
            Ok(_) => Err(BackupError::Locked(lockfile)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                File::create(&lockfile)?;
                Ok(Self { lockfile })
            }
            Err(e) => Err(e.into()),
        }
    }
}

impl Drop for Lock {
    fn drop(&mut self) {
        if let Err(e) = fs::remove_file(&self.lockfile) {
            warn!("cannot remove lockfile `{}`: {}", self.lockfile.display(), e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn path_join_confines_to_the_volume() {
        let volume = BtrfsVolume::new("/foo/bar").unwrap();

        assert_eq!(volume.path_join("baz"), PathBuf::from("/foo/bar/baz"));
        assert_eq!(
            volume.path_join("/foo/bar/baz"),
            PathBuf::from("/foo/bar/baz")
        );
        assert_eq!(
            volume.path_join("../bar/baz"),
            PathBuf::from("/foo/bar/baz")
        );
    }

    #[test]
    #[should_panic(expected = "invalid path")]
    fn path_join_rejects_absolute_escapes() {
        BtrfsVolume::new("/foo/bar").unwrap().path_join("/elsewhere/baz");
    }

    #[test]
    #[should_panic(expected = "invalid path")]
    fn path_join_rejects_parent_escapes() {
        BtrfsVolume::new("/foo/bar").unwrap().path_join("../elsewhere/baz");
    }

    #[test]
    fn derived_paths_use_the_fixed_hidden_names() {
        let volume = BtrfsVolume::new("/v").unwrap();

        assert_eq!(volume.sync_path(), Path::new("/v/.sync"));
        assert_eq!(volume.lockfile, Path::new("/v/.sync_lock"));
    }

    #[test]
    fn assure_path_reports_missing_and_non_directories() {
        let dir = tempfile::tempdir().unwrap();

        let volume = BtrfsVolume::new(dir.path()).unwrap();
        volume.assure_path().unwrap();

        let volume = BtrfsVolume::new(dir.path().join("nope")).unwrap();
        assert!(matches!(
            volume.assure_path(),
            Err(BackupError::BackupDirNotFound(_))
        ));

        let file = dir.path().join("file");
        File::create(&file).unwrap();
        let volume = BtrfsVolume::new(&file).unwrap();
        assert!(matches!(
            volume.assure_path(),
            Err(BackupError::BackupDirError {
                message: "not a directory",
                ..
            })
        ));
    }

    #[test]
    fn assure_writable_reports_readonly_directories() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let volume = BtrfsVolume::new(dir.path()).unwrap();

        volume.assure_writable().unwrap();

        // access(2) always grants W_OK to root.
        if nix::unistd::geteuid().is_root() {
            return;
        }

        fs::set_permissions(dir.path(), fs::Permissions::from_mode(0o500)).unwrap();
        assert!(matches!(
            volume.assure_writable(),
            Err(BackupError::BackupDirError {
                message: "not writable",
                ..
            })
        ));
        fs::set_permissions(dir.path(), fs::Permissions::from_mode(0o700)).unwrap();
    }

    #[test]
    fn lock_conflicts_and_releases_on_drop() {
        let dir = tempfile::tempdir().unwrap();
        let volume = BtrfsVolume::new(dir.path()).unwrap();

        let lock = volume.lock().unwrap();
        assert!(dir.path().join(SYNC_LOCKFILE).is_file());

        assert!(matches!(volume.lock(), Err(BackupError::Locked(_))));

        drop(lock);
        assert!(!dir.path().join(SYNC_LOCKFILE).exists());

        // Relocking after release succeeds.
        drop(volume.lock().unwrap());
    }

    #[test]
    fn lock_fails_in_missing_directories() {
        let dir = tempfile::tempdir().unwrap();
        let volume = BtrfsVolume::new(dir.path().join("nope")).unwrap();

        assert!(matches!(volume.lock(), Err(BackupError::Io(_))));
    }
}
