//! Host ceilings for message queue geometry.
//!
//! The kernel refuses to create a queue deeper than `msg_max` or with
//! messages larger than `msgsize_max`. Checking both before creating
//! anything lets channel add fail with a precise cause instead of a bare
//! `EINVAL` from the queue open.
//!
//! Ceilings are re-read on every check; an administrator may raise them
//! while engines are running.

use crate::config::LimitsConfig;
use crate::error::{IpcError, Result};
use std::fs::File;
use std::io::{self, BufRead, BufReader};
use std::path::{Path, PathBuf};

/// Where to read the queue ceilings from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueLimits {
    msg_max_path: PathBuf,
    msgsize_max_path: PathBuf,
}

impl QueueLimits {
    /// Read ceilings from custom locations.
    pub fn at(msg_max_path: impl Into<PathBuf>, msgsize_max_path: impl Into<PathBuf>) -> Self {
        Self {
            msg_max_path: msg_max_path.into(),
            msgsize_max_path: msgsize_max_path.into(),
        }
    }

    pub fn msg_max_path(&self) -> &Path {
        &self.msg_max_path
    }

    pub fn msgsize_max_path(&self) -> &Path {
        &self.msgsize_max_path
    }

    /// Current ceiling on queued messages per queue.
    pub fn max_messages(&self) -> Result<usize> {
        read_ceiling(&self.msg_max_path)
    }

    /// Current ceiling on message size in bytes.
    pub fn max_message_size(&self) -> Result<usize> {
        read_ceiling(&self.msgsize_max_path)
    }

    /// Validate requested queue geometry against the current ceilings.
    ///
    /// # Errors
    /// `CeilingUnreadable` or `CeilingInvalid` if a ceiling can't be
    /// obtained, `CeilingExceeded` if a requested value is above it.
    pub fn check(&self, max_messages: usize, max_message_size: usize) -> Result<()> {
        let ceiling = self.max_messages()?;
        if max_messages > ceiling {
            return Err(IpcError::CeilingExceeded {
                setting: "max_messages",
                requested: max_messages,
                ceiling,
            });
        }

        let ceiling = self.max_message_size()?;
        if max_message_size > ceiling {
            return Err(IpcError::CeilingExceeded {
                setting: "max_message_size",
                requested: max_message_size,
                ceiling,
            });
        }

        Ok(())
    }
}

impl Default for QueueLimits {
    fn default() -> Self {
        Self::at(LimitsConfig::MSG_MAX_PATH, LimitsConfig::MSGSIZE_MAX_PATH)
    }
}

/// Read the first line of a text file, without the line terminator.
pub fn read_first_line(path: &Path) -> io::Result<String> {
    let mut reader = BufReader::new(File::open(path)?);
    let mut line = String::new();
    if reader.read_line(&mut line)? == 0 {
        return Err(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            "file is empty",
        ));
    }
    Ok(line.trim_end_matches(&['\n', '\r'][..]).to_string())
}

fn read_ceiling(path: &Path) -> Result<usize> {
    let line = read_first_line(path).map_err(|source| IpcError::CeilingUnreadable {
        path: path.to_path_buf(),
        source,
    })?;

    let value = line
        .trim()
        .parse::<usize>()
        .map_err(|_| IpcError::CeilingInvalid {
            path: path.to_path_buf(),
            value: line.clone(),
        })?;
    Ok(value)
}
