use anyhow::{Context, Result};
use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};

/// Mirrors every write to a log file and a console writer.
///
/// The log file is created (or truncated) on acquisition and both
/// destinations are flushed when the sink is finished or dropped.
#[derive(Debug)]
pub struct TeeSink<C: Write> {
    log_path: PathBuf,
    file: File,
    console: C,
    bytes_written: u64,
    finished: bool,
}

impl<C: Write> TeeSink<C> {
    pub fn create(log_path: &Path, console: C) -> Result<Self> {
        if let Some(parent) = log_path.parent() {
            fs::create_dir_all(parent)?;
        }
        let file = File::create(log_path)
            .with_context(|| format!("failed to create log file {}", log_path.display()))?;
        Ok(Self {
            log_path: log_path.to_path_buf(),
            file,
            console,
            bytes_written: 0,
            finished: false,
        })
    }

    pub fn log_path(&self) -> &Path {
        &self.log_path
    }

    pub fn bytes_written(&self) -> u64 {
        self.bytes_written
    }

    /// Flushes both sides and returns the number of bytes logged.
    pub fn finish(mut self) -> io::Result<u64> {
        self.flush_all()?;
        self.finished = true;
        Ok(self.bytes_written)
    }

    fn flush_all(&mut self) -> io::Result<()> {
        self.file.flush()?;
        self.file.sync_all()?;
        self.console.flush()
    }
}

impl<C: Write> Write for TeeSink<C> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.file.write_all(buf)?;
        // A closed terminal must not cost us the transcript.
        let _ = self.console.write_all(buf);
        self.bytes_written += buf.len() as u64;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.file.flush()?;
        let _ = self.console.flush();
        Ok(())
    }
}

impl<C: Write> Drop for TeeSink<C> {
    fn drop(&mut self) {
        if !self.finished {
            let _ = self.flush_all();
        }
    }
}

/// Copies `reader` into the sink until EOF. The reader is the single pipe
/// both child streams write to, so bytes land in the order they were written.
pub(crate) fn drain<R, C>(reader: &mut R, sink: &mut TeeSink<C>) -> io::Result<u64>
where
    R: Read,
    C: Write,
{
    io::copy(reader, sink)
}
