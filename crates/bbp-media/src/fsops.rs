//! File primitives shared by the file media.

use std::fs::{self, File};
use std::io::{self, BufWriter, Read, Write};
use std::path::Path;

use crate::medium::DeltaSink;

/// How a file medium touches the disk.
pub trait FileOps: Send + Sync {
    fn create(&self, path: &Path) -> io::Result<Box<dyn DeltaSink>>;

    /// Open for reading. Pending writes and renames are visible first.
    fn open(&self, path: &Path) -> io::Result<Box<dyn Read + Send>>;

    fn rename(&self, from: &Path, to: &Path) -> io::Result<()>;

    fn remove(&self, path: &Path) -> io::Result<()>;

    /// Block until everything issued so far has reached the disk.
    fn barrier(&self) {}
}

/// Synchronous writes straight to the file system.
#[derive(Debug, Default, Clone, Copy)]
pub struct DirectFs;

struct DirectSink {
    inner: BufWriter<File>,
}

impl Write for DirectSink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.inner.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

impl DeltaSink for DirectSink {
    fn close(self: Box<Self>) -> io::Result<()> {
        let file = self.inner.into_inner().map_err(|e| e.into_error())?;
        file.sync_all()
    }
}

impl FileOps for DirectFs {
    fn create(&self, path: &Path) -> io::Result<Box<dyn DeltaSink>> {
        let file = File::create(path)?;
        Ok(Box::new(DirectSink {
            inner: BufWriter::new(file),
        }))
    }

    fn open(&self, path: &Path) -> io::Result<Box<dyn Read + Send>> {
        Ok(Box::new(File::open(path)?))
    }

    fn rename(&self, from: &Path, to: &Path) -> io::Result<()> {
        fs::rename(from, to)
    }

    fn remove(&self, path: &Path) -> io::Result<()> {
        fs::remove_file(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_close_read() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("f");
        let mut sink = DirectFs.create(&path).unwrap();
        sink.write_all(b"hello").unwrap();
        sink.close().unwrap();
        let mut out = String::new();
        DirectFs.open(&path).unwrap().read_to_string(&mut out).unwrap();
        assert_eq!(out, "hello");
        DirectFs.rename(&path, &dir.path().join("g")).unwrap();
        DirectFs.remove(&dir.path().join("g")).unwrap();
        assert!(!path.exists());
    }
}
