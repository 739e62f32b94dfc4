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

use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// A `BackupError` indicates an error condition in the backup engine.
#[derive(Debug, Error)]
pub enum BackupError {
    /// The backup directory does not exist. Running setup creates it.
    #[error("Backup directory `{}` not found, run setup", .0.display())]
    BackupDirNotFound(PathBuf),
    /// The backup directory exists but cannot be used as a backup volume.
    /// The message names the failed assertion
    /// (not a directory, not writable, not a btrfs).
    #[error("Backup directory error: {} `{}`", .message, .path.display())]
    BackupDirError {
        /// The assertion that failed.
        message: &'static str,
        /// The backup directory the assertion was checked on.
        path: PathBuf,
    },

    /// The reachability probe for the backup source failed.
    #[error("Source `{0}` is not reachable")]
    SourceNotReachable(String),

    /// An external binary is not installed or not in `PATH`.
    #[error("Command not found: `{0}`")]
    CommandNotFound(String),
    /// An external tool exited with a non-zero exit code.
    ///
    /// The wrappers of the subprocess gateway translate this variant
    /// into a domain error wherever the exit code has a meaning
    /// ([`BackupError::SyncFailed`], [`BackupError::BtrfsSync`],
    /// [`BackupError::SourceNotReachable`]).
    #[error("`{}` exited with code {}", .argv.join(" "), .exit_code)]
    Subprocess {
        /// The full argument vector of the failed invocation.
        argv: Vec<String>,
        /// The exit code, `-1` if the process was terminated by a signal.
        exit_code: i32,
    },

    /// rsync failed or was interrupted. The sync dir may be inconsistent
    /// and will be reused incrementally by the next backup.
    #[error("Sync of `{}` interrupted: {} (rsync exit code {})", .target.display(), .message, .errno)]
    SyncFailed {
        /// The sync dir rsync was writing to.
        target: PathBuf,
        /// The rsync exit code.
        errno: i32,
        /// Human-readable meaning of the exit code.
        message: &'static str,
    },

    /// The btrfs filesystem sync fence after a subvolume mutation failed.
    #[error("Btrfs filesystem sync of `{}` failed", .0.display())]
    BtrfsSync(PathBuf),

    /// The sync lockfile already exists,
    /// another backup is running on this volume.
    #[error("Cannot lock, `{}` already exists", .0.display())]
    Locked(PathBuf),

    /// A timestamp or relative date could not be parsed.
    #[error("Unable to parse timestamp: {message}")]
    TimestampParse {
        /// String representation of the parse failure.
        message: String,
        /// The error of the underlying parser, if any.
        #[source]
        cause: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// A `std::io::Error` I/O error occured.
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// A `toml::de::Error` TOML deserialization error occured.
    #[error("TOML deserialization error: {0}")]
    TomlDe(#[from] toml::de::Error),
}
