//! Stage runtime and in-memory byte pipes
//!
//! A [`Stage`] is a computation from an optional pipe reader to an optional
//! pipe writer, driven to completion on its own OS thread. The runtime
//! creates N-1 bounded pipes between N stages, runs them all in parallel,
//! and on the first error closes every pipe with that error so blocked peers
//! unblock promptly. Back-pressure is the pipe's bounded buffer: a slow
//! consumer blocks the producer on write, a slow producer blocks the
//! consumer on read.

use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::sync::{Arc, Condvar, Mutex};

use burrow_core::BurrowResult;

/// Bytes buffered per pipe before writers block.
const PIPE_CAPACITY: usize = 256 * 1024;

#[derive(Default)]
struct PipeState {
    buf: VecDeque<u8>,
    write_closed: bool,
    read_closed: bool,
    error: Option<String>,
}

struct PipeInner {
    state: Mutex<PipeState>,
    readable: Condvar,
    writable: Condvar,
}

/// Runtime-side handle used to poison a pipe from outside either half.
#[derive(Clone)]
pub(crate) struct PipeHandle {
    inner: Arc<PipeInner>,
}

impl PipeHandle {
    pub(crate) fn close_with_error(&self, msg: &str) {
        let mut state = self.inner.state.lock().expect("pipe lock");
        if state.error.is_none() {
            state.error = Some(msg.to_owned());
        }
        state.write_closed = true;
        state.read_closed = true;
        self.inner.readable.notify_all();
        self.inner.writable.notify_all();
    }
}

/// Reading half of an in-memory pipe. EOF after the writer closes cleanly;
/// an error if the pipe was closed with one.
pub struct PipeReader {
    inner: Arc<PipeInner>,
}

/// Writing half of an in-memory pipe. Dropping it closes the pipe cleanly,
/// so a stage that returns success delivers EOF downstream.
pub struct PipeWriter {
    inner: Arc<PipeInner>,
}

/// Create a connected pipe pair.
pub fn pipe() -> (PipeReader, PipeWriter) {
    let inner = Arc::new(PipeInner {
        state: Mutex::new(PipeState::default()),
        readable: Condvar::new(),
        writable: Condvar::new(),
    });
    (
        PipeReader {
            inner: Arc::clone(&inner),
        },
        PipeWriter { inner },
    )
}

impl PipeReader {
    pub(crate) fn handle(&self) -> PipeHandle {
        PipeHandle {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl Read for PipeReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        let mut state = self.inner.state.lock().expect("pipe lock");
        loop {
            if let Some(err) = &state.error {
                return Err(io::Error::other(err.clone()));
            }
            if !state.buf.is_empty() {
                let n = buf.len().min(state.buf.len());
                let (front, back) = state.buf.as_slices();
                let from_front = front.len().min(n);
                buf[..from_front].copy_from_slice(&front[..from_front]);
                if n > from_front {
                    buf[from_front..n].copy_from_slice(&back[..n - from_front]);
                }
                state.buf.drain(..n);
                self.inner.writable.notify_all();
                return Ok(n);
            }
            if state.write_closed {
                return Ok(0);
            }
            state = self.inner.readable.wait(state).expect("pipe lock");
        }
    }
}

impl Drop for PipeReader {
    fn drop(&mut self) {
        let mut state = self.inner.state.lock().expect("pipe lock");
        state.read_closed = true;
        self.inner.writable.notify_all();
    }
}

impl Write for PipeWriter {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        if data.is_empty() {
            return Ok(0);
        }
        let mut state = self.inner.state.lock().expect("pipe lock");
        loop {
            if let Some(err) = &state.error {
                return Err(io::Error::other(err.clone()));
            }
            if state.read_closed {
                return Err(io::Error::new(
                    io::ErrorKind::BrokenPipe,
                    "pipe reader closed",
                ));
            }
            let space = PIPE_CAPACITY - state.buf.len();
            if space > 0 {
                let n = space.min(data.len());
                state.buf.extend(data[..n].iter().copied());
                self.inner.readable.notify_all();
                return Ok(n);
            }
            state = self.inner.writable.wait(state).expect("pipe lock");
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Drop for PipeWriter {
    fn drop(&mut self) {
        let mut state = self.inner.state.lock().expect("pipe lock");
        state.write_closed = true;
        self.inner.readable.notify_all();
    }
}

/// One pipeline stage: a named computation over its pipe ends.
///
/// The first stage receives no reader and the last stage may ignore its
/// writer; both read from or write to their own sources instead.
pub struct Stage<'a> {
    name: &'static str,
    run: Box<dyn FnOnce(Option<PipeReader>, Option<PipeWriter>) -> BurrowResult<()> + Send + 'a>,
}

impl<'a> Stage<'a> {
    pub fn new<F>(name: &'static str, run: F) -> Self
    where
        F: FnOnce(Option<PipeReader>, Option<PipeWriter>) -> BurrowResult<()> + Send + 'a,
    {
        Self {
            name,
            run: Box::new(run),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }
}

/// Run the stages in parallel, connected by pipes, and return after all have
/// finished. The first error is returned verbatim; the failing stage is
/// recorded in the log.
pub fn run_pipeline(stages: Vec<Stage<'_>>) -> BurrowResult<()> {
    if stages.is_empty() {
        return Ok(());
    }

    let n = stages.len();
    let mut inputs: Vec<Option<PipeReader>> = Vec::with_capacity(n);
    let mut outputs: Vec<Option<PipeWriter>> = Vec::with_capacity(n);
    let mut handles: Vec<PipeHandle> = Vec::with_capacity(n - 1);

    inputs.push(None);
    for _ in 1..n {
        let (reader, writer) = pipe();
        handles.push(reader.handle());
        outputs.push(Some(writer));
        inputs.push(Some(reader));
    }
    outputs.push(None);

    let first_error: Mutex<Option<burrow_core::BurrowError>> = Mutex::new(None);

    std::thread::scope(|scope| {
        let handles = &handles;
        let first_error = &first_error;

        for ((stage, input), output) in stages.into_iter().zip(inputs).zip(outputs) {
            scope.spawn(move || {
                let name = stage.name;
                tracing::debug!(stage = name, "stage started");
                match (stage.run)(input, output) {
                    Ok(()) => tracing::debug!(stage = name, "stage finished"),
                    Err(err) => {
                        tracing::error!(stage = name, error = %err, "stage failed");
                        let mut slot = first_error.lock().expect("error slot");
                        if slot.is_none() {
                            // Unblock every peer with the failure.
                            for handle in handles {
                                handle.close_with_error(&err.to_string());
                            }
                            *slot = Some(err);
                        }
                    }
                }
            });
        }
    });

    match first_error.into_inner().expect("error slot") {
        Some(err) => Err(err),
        None => Ok(()),
    }
}
