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

use crate::BackupError;

use std::io::{self, BufRead, BufReader};
use std::path::Path;
use std::process::{Command, Stdio};
use std::thread;

use log::{info, trace};

/// Log target of the shell-debug level. Child process output only shows
/// up at trace verbosity under this target.
pub const SHELL_TARGET: &str = "shell";

/// Executes the given argument vector in a consistent way for this crate.
///
/// Empty elements are filtered out before spawning, allowing callers
/// to splice optional flags in place. The child's stdout and stderr are
/// captured line by line and logged at the shell-debug level; with
/// `show_output` stdout lines are additionally forwarded to the engine's
/// stdout and stderr lines to its stderr.
///
/// Fails with [`BackupError::CommandNotFound`] if the binary is absent
/// and with [`BackupError::Subprocess`] on a non-zero exit code.
pub fn run<I, S>(argv: I, show_output: bool) -> Result<(), BackupError>
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    let argv: Vec<String> = argv
        .into_iter()
        .map(Into::into)
        .filter(|arg| !arg.is_empty())
        .collect();

    trace!(target: SHELL_TARGET, "run {:?}, show_output={}", argv, show_output);

    let (program, args) = argv
        .split_first()
        .expect("argument vector contains a program name");

    let mut child = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|e| match e.kind() {
            io::ErrorKind::NotFound => BackupError::CommandNotFound(program.clone()),
            _ => BackupError::Io(e),
        })?;

    let stderr = child.stderr.take().expect("child stderr is piped");
    let stderr_reader =
        thread::spawn(move || -> io::Result<Vec<String>> { BufReader::new(stderr).lines().collect() });

    let stdout = child.stdout.take().expect("child stdout is piped");
    for line in BufReader::new(stdout).lines() {
        let line = line?;
        trace!(target: SHELL_TARGET, "stdout: {}", line);
        if show_output {
            println!("{}", line);
        }
    }

    let status = child.wait()?;

    for line in stderr_reader
        .join()
        .expect("stderr reader does not panic")?
    {
        trace!(target: SHELL_TARGET, "stderr: {}", line);
        if show_output {
            eprintln!("{}", line);
        }
    }

    if status.success() {
        Ok(())
    } else {
        Err(BackupError::Subprocess {
            argv,
            exit_code: status.code().unwrap_or(-1),
        })
    }
}

/// Runs `rsync` from `source` into the sync dir `target`.
///
/// On success the btrfs sync fence is issued on `target` before
/// returning. A non-zero rsync exit translates into
/// [`BackupError::SyncFailed`] carrying the meaning of the exit code.
pub fn rsync(
    source: &str,
    target: &Path,
    excludes: &[String],
    checksum: bool,
    progress: bool,
    dry_run: bool,
) -> Result<(), BackupError> {
    info!("sync `{}` to `{}`", source, target.display());

    match run(rsync_argv(source, target, excludes, checksum, dry_run), progress) {
        Ok(()) => {}
        Err(BackupError::Subprocess { exit_code, .. }) => {
            return Err(BackupError::SyncFailed {
                target: target.to_path_buf(),
                errno: exit_code,
                message: rsync_error_message(exit_code),
            });
        }
        Err(e) => return Err(e),
    }

    btrfs_sync(target)
}

fn rsync_argv(
    source: &str,
    target: &Path,
    excludes: &[String],
    checksum: bool,
    dry_run: bool,
) -> Vec<String> {
    let mut argv: Vec<String> = [
        "rsync",
        "--human-readable",
        "--itemize-changes",
        "--stats",
        "-a",
        "-z",
        "-v",
        "--sparse",
        "--delete",
        "--delete-excluded",
    ]
    .into_iter()
    .map(String::from)
    .collect();

    if checksum {
        argv.push("--checksum".to_string());
    }
    if dry_run {
        argv.push("--dry-run".to_string());
    }
    argv.extend(excludes.iter().map(|pattern| format!("--exclude={pattern}")));

    // The trailing slash makes rsync transfer the contents of `source`
    // rather than the directory itself.
    argv.push(format!("{source}/"));
    argv.push(target.display().to_string());

    argv
}

/// Looks up the meaning of an rsync exit code, `rsync(1)` EXIT VALUES.
fn rsync_error_message(exit_code: i32) -> &'static str {
    match exit_code {
        1 => "syntax or usage error",
        2 => "protocol incompatibility",
        3 => "errors selecting input/output files, dirs",
        4 => "requested action not supported",
        5 => "error starting client-server protocol",
        6 => "daemon unable to append to log-file",
        10 => "error in socket I/O",
        11 => "error in file I/O",
        12 => "error in rsync protocol data stream",
        13 => "errors with program diagnostics",
        14 => "error in IPC code",
        20 => "received SIGUSR1 or SIGINT",
        21 => "some error returned by waitpid()",
        22 => "error allocating core memory buffers",
        23 => "partial transfer due to error",
        24 => "partial transfer due to vanished source files",
        25 => "the --max-delete limit stopped deletions",
        30 => "timeout in data send/receive",
        35 => "timeout waiting for daemon connection",
        _ => "unknown rsync error",
    }
}

/// Creates a btrfs subvolume at the given path, followed by the sync fence.
pub fn create_subvolume(path: &Path) -> Result<(), BackupError> {
    info!("create subvolume `{}`", path.display());

    let path_arg = path.display().to_string();
    run(["btrfs", "subvolume", "create", path_arg.as_str()], false)?;

    btrfs_sync(path)
}

/// Deletes the btrfs subvolume at the given path.
/// The sync fence is issued on the parent directory,
/// the mutation site of the delete.
pub fn delete_subvolume(path: &Path) -> Result<(), BackupError> {
    info!("delete subvolume `{}`", path.display());

    let path_arg = path.display().to_string();
    run(["sudo", "btrfs", "subvolume", "delete", path_arg.as_str()], false)?;

    btrfs_sync(path.parent().unwrap_or(path))
}

/// Makes a btrfs snapshot of `source` at `target`,
/// followed by the sync fence on `target`.
pub fn make_snapshot(source: &Path, target: &Path, readonly: bool) -> Result<(), BackupError> {
    info!("create snapshot `{}`", target.display());

    let source_arg = source.display().to_string();
    let target_arg = target.display().to_string();
    run(
        [
            "btrfs",
            "subvolume",
            "snapshot",
            if readonly { "-r" } else { "" },
            source_arg.as_str(),
            target_arg.as_str(),
        ],
        false,
    )?;

    btrfs_sync(target)
}

/// Reports whether the given path is on a btrfs filesystem.
/// A failing probe means "no", it is not an error.
pub fn is_btrfs(path: &Path) -> Result<bool, BackupError> {
    let path_arg = path.display().to_string();

    match run(["btrfs", "filesystem", "df", path_arg.as_str()], false) {
        Ok(()) => Ok(true),
        Err(BackupError::Subprocess { .. }) => Ok(false),
        Err(e) => Err(e),
    }
}

/// Forces a sync of the btrfs filesystem at the given path,
/// a btrfs-aware `sync`. This is the fence establishing a happens-before
/// between a subvolume mutation and subsequent operations on the volume.
pub fn btrfs_sync(path: &Path) -> Result<(), BackupError> {
    let path_arg = path.display().to_string();

    match run(["btrfs", "filesystem", "sync", path_arg.as_str()], false) {
        Ok(()) => Ok(()),
        Err(BackupError::Subprocess { .. }) => Err(BackupError::BtrfsSync(path.to_path_buf())),
        Err(e) => Err(e),
    }
}

/// Probes whether the backup source can be listed. Sources of the form
/// `user@host:path` are probed remotely over SSH, everything else locally.
pub fn is_reachable(source: &str) -> Result<(), BackupError> {
    let result = match source.split_once(':') {
        Some((login, path)) if login.contains('@') => run(["ssh", login, "ls", path], false),
        _ => run(["ls", source], false),
    };

    match result {
        Ok(()) => Ok(()),
        Err(BackupError::Subprocess { .. }) => {
            Err(BackupError::SourceNotReachable(source.to_string()))
        }
        Err(e) => Err(e),
    }
}
