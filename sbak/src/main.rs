// sbak is a tool for rsync-driven incremental backups on btrfs snapshots.
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

mod error;
use error::*;

use sbak_common::config::{Config, JobConfig};
use sbak_common::notify;
use sbak_common::worker::{Backup, BackupOptions, Worker};

use std::io::{self, Write};
use std::path::PathBuf;
use std::process::ExitCode;

use clap::{ArgAction, Parser, Subcommand};
use log::{debug, warn, LevelFilter};

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Use the given configuration file.
    #[arg(short, long, value_name = "filename")]
    config: PathBuf,
    /// Increase verbosity, may be used up to three times.
    #[arg(short, long, action = ArgAction::Count)]
    verbose: u8,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create the backup directory of the named job.
    Setup {
        /// The name of the job in the config file.
        name: String,
    },
    /// Transfer the source of the named job and freeze a new snapshot.
    Backup {
        /// The name of the job in the config file.
        name: String,
        /// Force rsync to verify file contents by checksum.
        #[arg(long)]
        checksum: bool,
        /// Run rsync without applying changes and skip the snapshot.
        #[arg(short = 'n', long)]
        dry_run: bool,
        /// Show rsync output while it runs.
        #[arg(short, long)]
        progress: bool,
        /// Do not send a desktop notification about the result.
        #[arg(short, long)]
        silent: bool,
    },
    /// List the snapshots of the named job with their classification.
    List {
        /// The name of the job in the config file.
        name: String,
    },
    /// Delete snapshots older than the decay threshold.
    Decay {
        /// The name of the job in the config file.
        name: String,
        /// Delete without asking.
        #[arg(short, long)]
        yes: bool,
    },
    /// Delete snapshots not held by the retention policy.
    Prune {
        /// The name of the job in the config file.
        name: String,
        /// Delete without asking.
        #[arg(short, long)]
        yes: bool,
    },
    /// Delete all snapshots, the sync dir and the backup directory itself.
    Destroy {
        /// The name of the job in the config file.
        name: String,
        /// Delete without asking.
        #[arg(short, long)]
        yes: bool,
    },
    /// Delete the sync dir of the named job.
    Clean {
        /// The name of the job in the config file.
        name: String,
    },
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logger(cli.verbose);

    match logic(cli) {
        Ok(_) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {}", e);
            ExitCode::FAILURE
        }
    }
}

fn init_logger(verbosity: u8) {
    let level = match verbosity {
        0 => LevelFilter::Warn,
        1 => LevelFilter::Info,
        2 => LevelFilter::Debug,
        _ => LevelFilter::Trace,
    };

    env_logger::Builder::new().filter_level(level).init();
}

fn logic(cli: Cli) -> Result<()> {
    let config = Config::load(&cli.config)?;

    match cli.command {
        Commands::Setup { name } => {
            let (job, worker) = job_worker(&config, &name)?;

            debug!("setup `{}`", job.backups.display());
            worker.setup()?;
        }
        Commands::Backup {
            name,
            checksum,
            dry_run,
            progress,
            silent,
        } => {
            let (job, worker) = job_worker(&config, &name)?;

            let options = BackupOptions {
                exclude: job.ignore.clone(),
                autodecay: job.autodecay,
                autoprune: job.autoprune,
                checksum,
                dry_run,
                progress,
            };

            match worker.backup(&job.source, &options) {
                Ok(()) => {
                    if !silent && !dry_run {
                        send_notification(
                            job,
                            &format!("backup `{name}` finished"),
                            false,
                        );
                    }
                }
                Err(e) => {
                    if !silent && !suppress_failure_notification(&worker, job) {
                        send_notification(job, &format!("backup `{name}` failed: {e}"), true);
                    }

                    return Err(e.into());
                }
            }
        }
        Commands::List { name } => {
            let (_, worker) = job_worker(&config, &name)?;

            for backup in worker.get_backups()? {
                println!("{}", render(&backup));
            }
        }
        Commands::Decay { name, yes } => {
            let (_, worker) = job_worker(&config, &name)?;

            worker.decay(|backup| yes || confirm(&format!("decay `{}`?", backup.name())))?;
        }
        Commands::Prune { name, yes } => {
            let (_, worker) = job_worker(&config, &name)?;

            worker.prune(|backup| yes || confirm(&format!("prune `{}`?", backup.name())))?;
        }
        Commands::Destroy { name, yes } => {
            let (_, worker) = job_worker(&config, &name)?;

            worker.destroy(|backup| yes || confirm(&format!("delete `{}`?", backup.name())))?;
        }
        Commands::Clean { name } => {
            let (_, worker) = job_worker(&config, &name)?;

            worker.delete_syncdir()?;
        }
    }

    Ok(())
}

fn job_worker<'a>(config: &'a Config, name: &str) -> Result<(&'a JobConfig, Worker)> {
    let job = config
        .job(name)
        .ok_or_else(|| Error::NoSuchJob(name.to_string()))?;
    let worker = Worker::new(&job.backups, job.retention()?)?;

    Ok((job, worker))
}

/// One line per snapshot:
/// name, retain interval, daily/weekly bucket, prune and decay marks.
fn render(backup: &Backup) -> String {
    let interval = if backup.is_retain_all() {
        "retain_all"
    } else if backup.is_retain_daily() {
        "retain_daily"
    } else {
        "-"
    };
    let bucket = if backup.is_weekly() {
        "weekly"
    } else if backup.is_daily() {
        "daily"
    } else {
        "-"
    };

    format!(
        "{} | {:12} | {:6} | {:5} | {}",
        backup.name(),
        interval,
        bucket,
        if backup.prune() { "prune" } else { "" },
        if backup.decay() { "decay" } else { "" },
    )
}

fn confirm(question: &str) -> bool {
    print!("{} [y/N] ", question);
    if io::stdout().flush().is_err() {
        return false;
    }

    let mut answer = String::new();
    if io::stdin().read_line(&mut answer).is_err() {
        return false;
    }

    matches!(answer.trim(), "y" | "Y" | "yes")
}

/// Reports whether the failure notification should be skipped because the
/// last successful backup is newer than the job's silent-fail threshold.
fn suppress_failure_notification(worker: &Worker, job: &JobConfig) -> bool {
    let threshold = match job.silent_fail_after() {
        Ok(Some(threshold)) => threshold,
        _ => return false,
    };

    match worker.get_last() {
        Ok(Some(last)) => last.when() >= threshold,
        _ => false,
    }
}

fn send_notification(job: &JobConfig, message: &str, error: bool) {
    if let Err(e) =
        notify::send_notification("sbak", message, error, job.notify_remote.as_deref())
    {
        warn!("could not send notification \"{}\": {}", message, e);
    }
}
