/*
 * pacsmith - Package resolution and build orchestration for Arch Linux.
 * Copyright (C) 2025  pacsmith contributors
 *
 * This program is free software: you can redistribute it and/or modify
 * it under the terms of the GNU General Public License as published by
 * the Free Software Foundation, either version 3 of the License, or
 * (at your option) any later version.
 *
 * This program is distributed in the hope that it will be useful,
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
 * GNU General Public License for more details.
 *
 * You should have received a copy of the GNU General Public License
 * along with this program.  If not, see <https://www.gnu.org/licenses/>.
 */

//! System-wide advisory locking around installs.

use fs2::FileExt;
use std::fs::{File, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::time::Instant;

use crate::error::{PacsmithError, PacsmithResult};

const POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Exclusive `flock` held until dropped
#[derive(Debug)]
pub struct AdvisoryLock {
    file: File,
    path: PathBuf,
}

impl AdvisoryLock {
    /// Acquire the lock, polling until `wait` elapses
    pub async fn acquire(path: &Path, wait: Duration) -> PacsmithResult<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| PacsmithError::filesystem(parent, "cannot create lock directory", e))?;
        }
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(path)
            .map_err(|e| PacsmithError::filesystem(path, "cannot open lock file", e))?;

        let deadline = Instant::now() + wait;
        loop {
            match file.try_lock_exclusive() {
                Ok(()) => break,
                Err(e) if e.kind() == ErrorKind::WouldBlock => {}
                Err(e) => return Err(PacsmithError::filesystem(path, "cannot lock", e)),
            }
            if Instant::now() >= deadline {
                return Err(PacsmithError::DatabaseLocked {
                    path: path.display().to_string(),
                });
            }
            tracing::debug!(path = %path.display(), "waiting for transaction lock");
            tokio::time::sleep(POLL_INTERVAL).await;
        }

        let mut lock = Self {
            file,
            path: path.to_path_buf(),
        };
        lock.write_owner();
        Ok(lock)
    }

    /// Record our pid for humans inspecting the lock file
    fn write_owner(&mut self) {
        let _ = self.file.set_len(0);
        let _ = writeln!(self.file, "{}", std::process::id());
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for AdvisoryLock {
    fn drop(&mut self) {
        if let Err(e) = self.file.unlock() {
            tracing::warn!(path = %self.path.display(), "failed to release transaction lock: {}", e);
        }
    }
}

/// Wait for pacman's own database lock to disappear.
///
/// A lock whose owner pid is gone is reported stale but never removed;
/// deleting it is the administrator's call.
pub async fn wait_for_db_unlock(path: &Path, wait: Duration) -> PacsmithResult<()> {
    let deadline = Instant::now() + wait;
    let mut warned = false;

    while path.exists() {
        if !warned {
            match lock_owner(path) {
                Some(pid) if !process_alive(pid) => {
                    tracing::warn!(path = %path.display(), pid, "package database lock looks stale")
                }
                owner => tracing::info!(path = %path.display(), ?owner, "waiting for package database lock"),
            }
            warned = true;
        }
        if Instant::now() >= deadline {
            return Err(PacsmithError::DatabaseLocked {
                path: path.display().to_string(),
            });
        }
        tokio::time::sleep(POLL_INTERVAL).await;
    }
    Ok(())
}

fn lock_owner(path: &Path) -> Option<i32> {
    std::fs::read_to_string(path).ok()?.trim().parse().ok()
}

fn process_alive(pid: i32) -> bool {
    Path::new(&format!("/proc/{}", pid)).exists()
}
