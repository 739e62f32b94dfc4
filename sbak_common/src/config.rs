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

use crate::timestamps;
use crate::worker::RetentionPolicy;
use crate::BackupError;

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, FixedOffset};
use serde::Deserialize;

/// A `JobConfig` describes one named backup job: where to transfer from,
/// where the backup volume lives and how long snapshots are retained.
/// Thresholds are relative dates resolved against now on every run.
#[derive(Clone, Debug, Deserialize)]
pub struct JobConfig {
    /// Path or `user@host:path` to transfer from.
    pub source: String,
    /// Absolute path to the backup volume.
    pub backups: PathBuf,
    /// rsync exclude patterns.
    #[serde(default)]
    pub ignore: Vec<String>,
    /// Relative date after which all snapshots are kept.
    #[serde(default = "default_retain_all")]
    pub retain_all: String,
    /// Relative date after which one snapshot per day is kept.
    #[serde(default = "default_retain_daily")]
    pub retain_daily: String,
    /// Relative date before which snapshots decay. No decay if unset.
    pub decay: Option<String>,
    /// Delete decayed snapshots after every successful backup.
    #[serde(default)]
    pub autodecay: bool,
    /// Delete pruned snapshots after every successful backup.
    #[serde(default)]
    pub autoprune: bool,
    /// Skip the failure notification if the last backup
    /// is newer than this relative date.
    pub silent_fail_threshold: Option<String>,
    /// SSH target to send notifications to instead of the local display.
    pub notify_remote: Option<String>,
}

fn default_retain_all() -> String {
    "1 day".to_string()
}

fn default_retain_daily() -> String {
    "1 month".to_string()
}

impl JobConfig {
    /// Resolves the relative-date thresholds of this job
    /// into a [`RetentionPolicy`] anchored at now.
    pub fn retention(&self) -> Result<RetentionPolicy, BackupError> {
        Ok(RetentionPolicy {
            retain_all_after: timestamps::parse_relative(&self.retain_all)?,
            retain_daily_after: timestamps::parse_relative(&self.retain_daily)?,
            decay_before: match &self.decay {
                Some(decay) => timestamps::parse_relative(decay)?,
                None => timestamps::earliest_time(),
            },
        })
    }

    /// Resolves the silent-fail threshold of this job, if configured.
    pub fn silent_fail_after(&self) -> Result<Option<DateTime<FixedOffset>>, BackupError> {
        self.silent_fail_threshold
            .as_ref()
            .map(|threshold| timestamps::parse_relative(threshold))
            .transpose()
    }
}

/// A `Config` is a TOML file with one table per backup job.
#[derive(Clone, Debug, Deserialize)]
pub struct Config {
    #[serde(flatten)]
    jobs: BTreeMap<String, JobConfig>,
}

impl Config {
    /// Loads a configuration file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, BackupError> {
        let s = fs::read_to_string(path)?;
        Ok(toml::from_str(&s)?)
    }

    /// Returns the configuration of the named job, if present.
    pub fn job(&self, name: &str) -> Option<&JobConfig> {
        self.jobs.get(name)
    }

    /// Returns the names of all configured jobs in sorted order.
    pub fn job_names(&self) -> impl Iterator<Item = &str> {
        self.jobs.keys().map(String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CONFIG: &str = r#"
[home]
source = "/home"
backups = "/backups/home"
ignore = [".cache", "Downloads"]
retain_all = "2 days"
retain_daily = "2 weeks"
decay = "1 year"
autodecay = true
silent_fail_threshold = "3 days"
notify_remote = "user@desktop"

[etc]
source = "root@server:/etc"
backups = "/backups/etc"
"#;

    #[test]
    fn jobs_parse_with_their_keys() {
        let config: Config = toml::from_str(CONFIG).unwrap();
        let home = config.job("home").unwrap();

        assert_eq!(home.source, "/home");
        assert_eq!(home.backups, PathBuf::from("/backups/home"));
        assert_eq!(home.ignore, vec![".cache", "Downloads"]);
        assert!(home.autodecay);
        assert!(!home.autoprune);
        assert_eq!(home.notify_remote.as_deref(), Some("user@desktop"));

        assert!(config.job("nope").is_none());
        assert_eq!(config.job_names().collect::<Vec<_>>(), vec!["etc", "home"]);
    }

    #[test]
    fn omitted_keys_fall_back_to_defaults() {
        let config: Config = toml::from_str(CONFIG).unwrap();
        let etc = config.job("etc").unwrap();

        assert_eq!(etc.retain_all, "1 day");
        assert_eq!(etc.retain_daily, "1 month");
        assert!(etc.decay.is_none());
        assert!(etc.ignore.is_empty());
        assert!(!etc.autodecay);
        assert!(etc.silent_fail_threshold.is_none());
    }

    #[test]
    fn thresholds_resolve_in_order() {
        let config: Config = toml::from_str(CONFIG).unwrap();
        let policy = config.job("home").unwrap().retention().unwrap();

        assert!(policy.decay_before < policy.retain_daily_after);
        assert!(policy.retain_daily_after < policy.retain_all_after);
        assert!(policy.retain_all_after < timestamps::get_timestamp());
    }

    #[test]
    fn missing_decay_never_decays() {
        let config: Config = toml::from_str(CONFIG).unwrap();
        let policy = config.job("etc").unwrap().retention().unwrap();

        assert_eq!(policy.decay_before, timestamps::earliest_time());
    }

    #[test]
    fn silent_fail_threshold_is_optional() {
        let config: Config = toml::from_str(CONFIG).unwrap();

        assert!(config
            .job("home")
            .unwrap()
            .silent_fail_after()
            .unwrap()
            .is_some());
        assert!(config
            .job("etc")
            .unwrap()
            .silent_fail_after()
            .unwrap()
            .is_none());
    }

    #[test]
    fn missing_source_is_a_parse_error() {
        assert!(toml::from_str::<Config>("[broken]\nbackups = \"/b\"").is_err());
    }
}
