// Purpose: Install the process subscriber: human logs on stderr plus an in-memory capture sink.
// Inputs/Outputs: Level string + LogCapture handle -> global tracing subscriber.
// Invariants: The capture sink always records debug and above, independent of the stderr level.
// Gotchas: The orchestrator drains the sink per manifest; anything logged between manifests
//          lands in the next manifest's bundle.

use anyhow::Context;
use std::io;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::fmt::{self, MakeWriter};
use tracing_subscriber::prelude::*;

#[derive(Debug, Clone, Default)]
pub struct LogCapture {
    buf: Arc<Mutex<Vec<u8>>>,
}

fn lock(buf: &Mutex<Vec<u8>>) -> MutexGuard<'_, Vec<u8>> {
    match buf.lock() {
        Ok(g) => g,
        Err(poisoned) => poisoned.into_inner(),
    }
}

impl LogCapture {
    pub fn new() -> Self {
        Self::default()
    }

    /// Everything recorded since the last call.
    pub fn take(&self) -> String {
        let bytes = std::mem::take(&mut *lock(&self.buf));
        String::from_utf8_lossy(&bytes).into_owned()
    }
}

pub struct CaptureWriter {
    buf: Arc<Mutex<Vec<u8>>>,
}

impl io::Write for CaptureWriter {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        lock(&self.buf).extend_from_slice(data);
        Ok(data.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl<'a> MakeWriter<'a> for LogCapture {
    type Writer = CaptureWriter;

    fn make_writer(&'a self) -> Self::Writer {
        CaptureWriter {
            buf: Arc::clone(&self.buf),
        }
    }
}

pub fn parse_level(level: &str) -> anyhow::Result<LevelFilter> {
    level
        .trim()
        .parse::<LevelFilter>()
        .with_context(|| format!("invalid log level {:?}", level))
}

pub fn init(level: &str, capture: &LogCapture) -> anyhow::Result<()> {
    let level = parse_level(level)?;
    let stderr_layer = fmt::layer()
        .with_writer(io::stderr)
        .with_target(false)
        .with_filter(level);
    let capture_layer = fmt::layer()
        .with_writer(capture.clone())
        .with_ansi(false)
        .with_target(false)
        .with_filter(LevelFilter::DEBUG);
    tracing_subscriber::registry()
        .with(stderr_layer)
        .with(capture_layer)
        .try_init()
        .context("install log subscriber")?;
    Ok(())
}
