//! Stage-local progress reporting
//!
//! Stages report cumulative byte counts through a shared callback; the CLI
//! turns them into progress bars. Observation is intentionally loose — the
//! counters are stage-local and the UI accepts unsynchronized reads.

use std::io::{Read, Write};

/// Callback invoked with (stage name, cumulative bytes through that stage).
pub type ProgressFn = dyn Fn(&'static str, u64) + Send + Sync;

/// `Write` adapter counting bytes into a [`ProgressFn`].
pub struct ProgressWriter<'a, W: Write> {
    inner: W,
    stage: &'static str,
    total: u64,
    progress: Option<&'a ProgressFn>,
}

impl<'a, W: Write> ProgressWriter<'a, W> {
    pub fn new(inner: W, stage: &'static str, progress: Option<&'a ProgressFn>) -> Self {
        Self {
            inner,
            stage,
            total: 0,
            progress,
        }
    }

    pub fn into_inner(self) -> W {
        self.inner
    }
}

impl<W: Write> Write for ProgressWriter<'_, W> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.total += n as u64;
        if let Some(progress) = self.progress {
            progress(self.stage, self.total);
        }
        Ok(n)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.inner.flush()
    }
}

/// `Read` adapter counting bytes into a [`ProgressFn`].
pub struct ProgressReader<'a, R: Read> {
    inner: R,
    stage: &'static str,
    total: u64,
    progress: Option<&'a ProgressFn>,
}

impl<'a, R: Read> ProgressReader<'a, R> {
    pub fn new(inner: R, stage: &'static str, progress: Option<&'a ProgressFn>) -> Self {
        Self {
            inner,
            stage,
            total: 0,
            progress,
        }
    }
}

impl<R: Read> Read for ProgressReader<'_, R> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.total += n as u64;
        if let Some(progress) = self.progress {
            progress(self.stage, self.total);
        }
        Ok(n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[test]
    fn test_progress_writer_counts() {
        let seen: std::sync::Arc<Mutex<Vec<(&'static str, u64)>>> =
            std::sync::Arc::new(Mutex::new(Vec::new()));
        let seen_cb = seen.clone();
        let callback = move |stage: &'static str, total: u64| {
            seen_cb.lock().unwrap().push((stage, total));
        };

        let mut out = Vec::new();
        let mut writer = ProgressWriter::new(&mut out, "archive", Some(&callback));
        writer.write_all(b"hello").unwrap();
        writer.write_all(b" world").unwrap();

        let seen = seen.lock().unwrap();
        assert_eq!(seen.last(), Some(&("archive", 11)));
        assert_eq!(out, b"hello world");
    }

    #[test]
    fn test_progress_reader_counts() {
        let seen: std::sync::Arc<Mutex<u64>> = std::sync::Arc::new(Mutex::new(0));
        let seen_cb = seen.clone();
        let callback = move |_: &'static str, total: u64| {
            *seen_cb.lock().unwrap() = total;
        };

        let data = vec![3u8; 1000];
        let mut reader = ProgressReader::new(&data[..], "upload", Some(&callback));
        let mut sink = Vec::new();
        reader.read_to_end(&mut sink).unwrap();

        assert_eq!(*seen.lock().unwrap(), 1000);
        assert_eq!(sink, data);
    }
}
