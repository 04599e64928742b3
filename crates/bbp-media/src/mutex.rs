//! Lock-file mutual exclusion between process instances.
//!
//! The lock is a file created exclusively and holding the holder's token.
//! A waiter polls; if the same holder token stays in place for longer than
//! the timeout, the holder is presumed dead and the lock is stolen by
//! overwriting the token.

use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use tracing::{debug, warn};

/// Exclusive lock shared through the file system.
#[derive(Debug)]
pub struct FileMutex {
    path: PathBuf,
    token: String,
    timeout: Duration,
    poll: Duration,
    held: bool,
}

impl FileMutex {
    pub fn new(dir: &Path, name: &str, token: impl Into<String>, timeout: Duration) -> Self {
        let poll = (timeout / 20).clamp(Duration::from_millis(5), Duration::from_millis(250));
        Self {
            path: dir.join(name),
            token: token.into(),
            timeout,
            poll,
            held: false,
        }
    }

    pub fn with_poll_interval(mut self, poll: Duration) -> Self {
        self.poll = poll;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn token(&self) -> &str {
        &self.token
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn is_held(&self) -> bool {
        self.held
    }

    /// Token of the current holder, if the lock file exists.
    pub fn holder(&self) -> io::Result<Option<String>> {
        match fs::read_to_string(&self.path) {
            Ok(token) => Ok(Some(token)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Acquire without waiting.
    pub fn try_lock(&mut self) -> io::Result<bool> {
        if self.held {
            return Ok(true);
        }
        let created = OpenOptions::new().write(true).create_new(true).open(&self.path);
        match created {
            Ok(mut file) => {
                file.write_all(self.token.as_bytes())?;
                file.sync_all()?;
                self.held = true;
                Ok(true)
            }
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Acquire, waiting as long as the holder changes and stealing the lock
    /// once one holder has kept it unchanged for the timeout.
    pub fn lock(&mut self) -> io::Result<()> {
        let mut observed: Option<(String, Instant)> = None;
        loop {
            if self.try_lock()? {
                debug!(path = %self.path.display(), "lock acquired");
                return Ok(());
            }
            let Some(holder) = self.holder()? else {
                continue;
            };
            match &observed {
                Some((prev, since)) if *prev == holder => {
                    if since.elapsed() >= self.timeout {
                        if self.steal(&holder)? {
                            return Ok(());
                        }
                        observed = None;
                    }
                }
                _ => observed = Some((holder, Instant::now())),
            }
            std::thread::sleep(self.poll);
        }
    }

    /// Release. A lock that was stolen meanwhile is left to its new holder.
    pub fn unlock(&mut self) -> io::Result<()> {
        if !self.held {
            return Ok(());
        }
        self.held = false;
        match self.holder()? {
            Some(holder) if holder == self.token => fs::remove_file(&self.path),
            Some(holder) => {
                warn!(path = %self.path.display(), %holder, "lock was stolen while held");
                Ok(())
            }
            None => {
                warn!(path = %self.path.display(), "lock file vanished while held");
                Ok(())
            }
        }
    }

    fn steal(&mut self, stale: &str) -> io::Result<bool> {
        warn!(
            path = %self.path.display(),
            holder = stale,
            timeout_ms = self.timeout.as_millis() as u64,
            "stealing stale lock"
        );
        fs::write(&self.path, self.token.as_bytes())?;
        // Another waiter may have stolen at the same moment.
        if self.holder()?.as_deref() == Some(self.token.as_str()) {
            self.held = true;
            return Ok(true);
        }
        Ok(false)
    }
}

impl Drop for FileMutex {
    fn drop(&mut self) {
        if let Err(e) = self.unlock() {
            warn!(path = %self.path.display(), error = %e, "failed to release lock");
        }
    }
}
