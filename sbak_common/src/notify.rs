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

use log::warn;

const NOTIFY_SEND: &str = "notify-send";
const SSH: &str = "ssh";
const OK_ICON: &str = "ok";
const ERROR_ICON: &str = "error";

/// Sends a desktop notification via `notify-send` to the local display
/// or, if `notify_remote` is given, to a remote host over SSH.
///
/// A missing `notify-send` binary is logged and ignored:
/// notifications are best-effort and never fail an operation.
pub fn send_notification(
    title: &str,
    message: &str,
    error: bool,
    notify_remote: Option<&str>,
) -> Result<(), BackupError> {
    let argv = vec![
        NOTIFY_SEND.to_string(),
        title.to_string(),
        message.to_string(),
        "-i".to_string(),
        (if error { ERROR_ICON } else { OK_ICON }).to_string(),
    ];

    let argv = match notify_remote {
        Some(remote) => vec![
            SSH.to_string(),
            remote.to_string(),
            argv.iter()
                .map(|arg| quote(arg))
                .collect::<Vec<_>>()
                .join(" "),
        ],
        None => argv,
    };

    match subprocess::run(argv, false) {
        Ok(()) => Ok(()),
        Err(e @ BackupError::CommandNotFound(_)) => {
            warn!("{e}, could not send notification \"{title} {message}\"");
            Ok(())
        }
        Err(e) => Err(e),
    }
}

/// Quotes a string for use in a remote shell command line,
/// `shlex.quote` style.
fn quote(arg: &str) -> String {
    let safe = !arg.is_empty()
        && arg
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "@%+=:,./-_".contains(c));

    if safe {
        arg.to_string()
    } else {
        format!("'{}'", arg.replace('\'', r#"'\''"#))
    }
}
