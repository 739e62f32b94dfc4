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
use crate::timestamps;
use crate::volume::{BtrfsVolume, SYNC_DIR};
use crate::BackupError;

use std::fs;
use std::path::Path;

use chrono::{DateTime, FixedOffset};
use log::{info, warn};

/// The retention and decay thresholds of a backup volume.
///
/// The default thresholds are the earliest representable instant:
/// every snapshot is then inside both retain intervals and none decays.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct RetentionPolicy {
    /// Snapshots at or after this instant are all kept.
    pub retain_all_after: DateTime<FixedOffset>,
    /// Snapshots at or after this instant are kept one per day.
    pub retain_daily_after: DateTime<FixedOffset>,
    /// Snapshots before this instant may decay, except the latest one.
    pub decay_before: DateTime<FixedOffset>,
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self {
            retain_all_after: timestamps::earliest_time(),
            retain_daily_after: timestamps::earliest_time(),
            decay_before: timestamps::earliest_time(),
        }
    }
}

/// Options of a single backup run.
#[derive(Clone, Debug, Default)]
pub struct BackupOptions {
    /// rsync exclude patterns.
    pub exclude: Vec<String>,
    /// Delete decayed snapshots after a successful backup.
    pub autodecay: bool,
    /// Delete pruned snapshots after a successful backup.
    pub autoprune: bool,
    /// Force rsync to verify file contents by checksum.
    pub checksum: bool,
    /// Run rsync without applying changes and skip the snapshot.
    pub dry_run: bool,
    /// Forward rsync output to stdout while it runs.
    pub progress: bool,
}

/// A `Backup` is the immutable descriptor of one completed snapshot,
/// classified against the retention thresholds and its predecessor.
/// Records are value objects reconstructed from the filesystem
/// on every enumeration.
#[derive(Clone, Debug)]
pub struct Backup {
    name: String,
    when: DateTime<FixedOffset>,
    is_last: bool,
    is_daily: bool,
    is_weekly: bool,
    is_retain_all: bool,
    is_retain_daily: bool,
    decay: bool,
    prune: bool,
}

impl Backup {
    fn new(
        name: &str,
        policy: &RetentionPolicy,
        previous: Option<&Backup>,
        is_last: bool,
    ) -> Result<Self, BackupError> {
        let when = timestamps::parse_timestamp(name)?;

        let (is_daily, is_weekly) = match previous {
            None => (true, true),
            Some(previous) => (
                !timestamps::is_same_day(previous.when, when),
                !timestamps::is_same_week(previous.when, when),
            ),
        };

        let mut backup = Self {
            name: name.to_string(),
            when,
            is_last,
            is_daily,
            is_weekly,
            is_retain_all: when >= policy.retain_all_after,
            is_retain_daily: when >= policy.retain_daily_after,
            decay: when < policy.decay_before && !is_last,
            prune: false,
        };
        backup.prune = !backup.retain();

        Ok(backup)
    }

    fn retain(&self) -> bool {
        if self.is_last {
            return true;
        }
        if self.is_retain_all {
            return true;
        }
        if self.is_retain_daily {
            return self.is_daily;
        }
        self.is_weekly
    }

    /// Returns the name of the snapshot directory,
    /// coincidently also its ISO-8601 completion timestamp.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the instant the snapshot was completed at.
    pub fn when(&self) -> DateTime<FixedOffset> {
        self.when
    }

    /// Reports whether this is the chronologically latest snapshot.
    pub fn is_last(&self) -> bool {
        self.is_last
    }

    /// Reports whether this is the first snapshot of its calendar day.
    pub fn is_daily(&self) -> bool {
        self.is_daily
    }

    /// Reports whether this is the first snapshot of its ISO week.
    pub fn is_weekly(&self) -> bool {
        self.is_weekly
    }

    /// Reports whether the snapshot is inside the retain-all interval.
    pub fn is_retain_all(&self) -> bool {
        self.is_retain_all
    }

    /// Reports whether the snapshot is inside the retain-daily interval.
    pub fn is_retain_daily(&self) -> bool {
        self.is_retain_daily
    }

    /// Reports whether the snapshot may decay by age.
    pub fn decay(&self) -> bool {
        self.decay
    }

    /// Reports whether the retention policy does not hold the snapshot.
    pub fn prune(&self) -> bool {
        self.prune
    }
}

/// A `Worker` orchestrates the backup lifecycle of one named job's volume:
/// sync transfer, snapshot freeze, enumeration, classification and deletion.
#[derive(Clone, Debug)]
pub struct Worker {
    volume: BtrfsVolume,
    policy: RetentionPolicy,
}

impl Worker {
    /// Returns a new `Worker` over the backup directory at `path`,
    /// classifying snapshots against the given thresholds.
    pub fn new<P: AsRef<Path>>(path: P, policy: RetentionPolicy) -> Result<Self, BackupError> {
        Ok(Self {
            volume: BtrfsVolume::new(path)?,
            policy,
        })
    }

    /// Returns the [`BtrfsVolume`] the `Worker` operates on.
    pub fn volume(&self) -> &BtrfsVolume {
        &self.volume
    }

    /// Creates the backup directory. Idempotent.
    pub fn setup(&self) -> Result<(), BackupError> {
        self.volume.setup()
    }

    /// Makes sure the sync dir exists: if any snapshot is present the
    /// latest one is snapshotted writable into the sync dir, preserving
    /// rsync's incremental state; otherwise a fresh subvolume is created.
    fn assert_syncdir(&self) -> Result<(), BackupError> {
        self.volume.assure_writable()?;
        self.volume.assure_btrfs()?;

        if !self.volume.sync_path().is_dir() {
            match self.get_last()? {
                Some(last) => {
                    info!("resume sync dir from snapshot `{}`", last.name());
                    self.volume.make_snapshot(last.name(), SYNC_DIR, false)?;
                }
                None => self.volume.create_subvolume(SYNC_DIR)?,
            }
        }

        Ok(())
    }

    /// Runs a full backup of `source`: reachability probe, sync dir
    /// assertion, locked rsync transfer and, unless this is a dry run,
    /// a read-only snapshot of the result named by the current time.
    ///
    /// The sync lock is released on every exit path. After a successful
    /// transfer the autodecay and autoprune deletions requested by
    /// `options` run outside the critical section.
    pub fn backup(&self, source: &str, options: &BackupOptions) -> Result<(), BackupError> {
        subprocess::is_reachable(source)?;
        self.assert_syncdir()?;

        {
            let _lock = self.volume.lock()?;

            if let Err(e) = subprocess::rsync(
                source,
                self.volume.sync_path(),
                &options.exclude,
                options.checksum,
                options.progress,
                options.dry_run,
            ) {
                warn!(
                    "backup interrupted, `{}` may be inconsistent",
                    self.volume.sync_path().display()
                );
                return Err(e);
            }

            if !options.dry_run {
                let name = timestamps::format_timestamp(&timestamps::get_timestamp());
                self.volume.make_snapshot(SYNC_DIR, &name, true)?;
            }
        }

        if options.autodecay {
            self.decay(|_| true)?;
        }
        if options.autoprune {
            self.prune(|_| true)?;
        }

        Ok(())
    }

    /// Returns all snapshots of the volume in chronological order,
    /// classified against the thresholds and their predecessors.
    /// Directory entries whose name is not a timestamp are ignored.
    pub fn get_backups(&self) -> Result<Vec<Backup>, BackupError> {
        self.volume.assure_path()?;

        let mut names = Vec::new();
        for entry in fs::read_dir(self.volume.path())? {
            let entry = entry?;

            if !entry.file_type()?.is_dir() {
                continue;
            }
            if let Some(name) = entry.file_name().to_str() {
                if timestamps::is_timestamp(name) {
                    names.push(name.to_string());
                }
            }
        }

        names.sort();

        let mut backups = Vec::with_capacity(names.len());
        for (index, name) in names.iter().enumerate() {
            let backup = Backup::new(
                name,
                &self.policy,
                backups.last(),
                index == names.len() - 1,
            )?;
            backups.push(backup);
        }

        Ok(backups)
    }

    /// Returns the latest snapshot of the volume, if any.
    pub fn get_last(&self) -> Result<Option<Backup>, BackupError> {
        Ok(self.get_backups()?.pop())
    }

    /// Deletes the sync dir when found, otherwise does nothing.
    pub fn delete_syncdir(&self) -> Result<(), BackupError> {
        self.volume.assure_writable()?;

        if self.volume.sync_path().is_dir() {
            self.volume.delete_subvolume(SYNC_DIR)?;
        }

        Ok(())
    }

    /// Deletes every snapshot marked for decay that `prompt` confirms.
    pub fn decay<F>(&self, mut prompt: F) -> Result<(), BackupError>
    where
        F: FnMut(&Backup) -> bool,
    {
        self.volume.assure_writable()?;

        for backup in self.get_backups()?.iter().filter(|backup| backup.decay()) {
            if prompt(backup) {
                info!("decay snapshot `{}`", backup.name());
                self.volume.delete_subvolume(backup.name())?;
            }
        }

        Ok(())
    }

    /// Deletes every snapshot not held by the retention policy
    /// that `prompt` confirms.
    pub fn prune<F>(&self, mut prompt: F) -> Result<(), BackupError>
    where
        F: FnMut(&Backup) -> bool,
    {
        self.volume.assure_writable()?;

        for backup in self.get_backups()?.iter().filter(|backup| backup.prune()) {
            if prompt(backup) {
                info!("prune snapshot `{}`", backup.name());
                self.volume.delete_subvolume(backup.name())?;
            }
        }

        Ok(())
    }

    /// Deletes the sync dir, every snapshot that `prompt` confirms and
    /// finally the backup directory itself.
    ///
    /// If `prompt` declines a snapshot it stays in place and the final
    /// directory removal fails, leaving the volume partially destroyed.
    pub fn destroy<F>(&self, mut prompt: F) -> Result<(), BackupError>
    where
        F: FnMut(&Backup) -> bool,
    {
        warn!("destroy backup volume `{}`", self.volume.path().display());

        self.delete_syncdir()?;

        for backup in self.get_backups()? {
            if prompt(&backup) {
                self.volume.delete_subvolume(backup.name())?;
            }
        }

        fs::remove_dir(self.volume.path())?;
        Ok(())
    }
}
