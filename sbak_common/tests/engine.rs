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

use sbak_common::config::Config;
use sbak_common::timestamps::parse_timestamp;
use sbak_common::worker::{RetentionPolicy, Worker};
use sbak_common::BackupError;

use std::fs;
use std::path::Path;

const SNAPSHOTS: &[&str] = &[
    "1970-01-01",
    "1970-01-02",
    "1970-02-02",
    "1970-03-02",
    "1970-04-02",
];

fn populate(path: &Path) {
    for name in SNAPSHOTS {
        fs::create_dir(path.join(name)).unwrap();
    }
}

fn policy_1970() -> RetentionPolicy {
    RetentionPolicy {
        retain_all_after: parse_timestamp("1970-03-01").unwrap(),
        retain_daily_after: parse_timestamp("1970-02-01").unwrap(),
        decay_before: parse_timestamp("1970-01-01T01:00").unwrap(),
    }
}

#[test]
fn enumeration_classifies_a_populated_volume() {
    let dir = tempfile::tempdir().unwrap();
    populate(dir.path());

    let worker = Worker::new(dir.path(), policy_1970()).unwrap();
    let backups = worker.get_backups().unwrap();

    assert_eq!(
        backups.iter().map(|b| b.name()).collect::<Vec<_>>(),
        SNAPSHOTS
    );

    let pruned: Vec<&str> = backups
        .iter()
        .filter(|b| b.prune())
        .map(|b| b.name())
        .collect();
    let decayed: Vec<&str> = backups
        .iter()
        .filter(|b| b.decay())
        .map(|b| b.name())
        .collect();

    assert_eq!(pruned, vec!["1970-01-02"]);
    assert_eq!(decayed, vec!["1970-01-01"]);
    assert_eq!(worker.get_last().unwrap().unwrap().name(), "1970-04-02");
}

#[test]
fn declined_prompts_delete_nothing() {
    let dir = tempfile::tempdir().unwrap();
    populate(dir.path());

    let worker = Worker::new(dir.path(), policy_1970()).unwrap();

    let mut asked = Vec::new();
    worker
        .decay(|backup| {
            asked.push(backup.name().to_string());
            false
        })
        .unwrap();
    assert_eq!(asked, vec!["1970-01-01"]);

    asked.clear();
    worker
        .prune(|backup| {
            asked.push(backup.name().to_string());
            false
        })
        .unwrap();
    assert_eq!(asked, vec!["1970-01-02"]);

    assert_eq!(worker.get_backups().unwrap().len(), SNAPSHOTS.len());
}

#[test]
fn partial_destroy_leaves_the_volume_in_place() {
    let dir = tempfile::tempdir().unwrap();
    populate(dir.path());

    let worker = Worker::new(dir.path(), policy_1970()).unwrap();

    // Declining every snapshot makes the final rmdir fail.
    assert!(matches!(
        worker.destroy(|_| false),
        Err(BackupError::Io(_))
    ));
    assert_eq!(worker.get_backups().unwrap().len(), SNAPSHOTS.len());
}

#[test]
fn config_drives_worker_construction() {
    let dir = tempfile::tempdir().unwrap();
    let volume = dir.path().join("volume");
    fs::create_dir(&volume).unwrap();

    let config_file = dir.path().join("sbak.toml");
    fs::write(
        &config_file,
        format!(
            "[home]\nsource = \"/home\"\nbackups = \"{}\"\n",
            volume.display()
        ),
    )
    .unwrap();

    let config = Config::load(&config_file).unwrap();
    let job = config.job("home").unwrap();
    let worker = Worker::new(&job.backups, job.retention().unwrap()).unwrap();

    assert!(worker.get_backups().unwrap().is_empty());
    assert!(worker.get_last().unwrap().is_none());
}
