use std::collections::BTreeMap;
use std::io::Write;
use std::sync::{Condvar, Mutex, MutexGuard};
use std::time::Duration;

use super::config::WriterParameters;
use super::error::WriterError;

#[derive(Debug)]
struct WriterState<W: Write> {
    next_expected: usize,
    pending: BTreeMap<usize, String>,
    sink: W,
    written: usize,
}

impl<W: Write> WriterState<W> {
    fn is_duplicate(&self, index: usize) -> bool {
        index < self.next_expected || self.pending.contains_key(&index)
    }

    /// Write every payload from next_expected onwards until a gap is found
    fn drain(&mut self) -> Result<(), WriterError> {
        while let Some(payload) = self.pending.remove(&self.next_expected) {
            self.sink.write_all(payload.as_bytes())?;
            self.next_expected += 1;
            self.written += 1;
        }
        Ok(())
    }
}

/// Persists payloads submitted by parallel workers strictly in index order, each exactly once.
///
/// Indices are dense and assigned before dispatch. Payloads which arrive early are buffered until
/// every lower index has been written. Small bursts are collected until `batch_threshold` payloads
/// are buffered before any write happens. A worker which cannot produce its payload should submit a
/// placeholder for its index; an index that never arrives is reported as a gap by
/// [`OrderedWriter::finish`], which never blocks on it.
#[derive(Debug)]
pub struct OrderedWriter<W: Write + Send> {
    state: Mutex<WriterState<W>>,
    space_available: Condvar,
    batch_threshold: usize,
    max_pending: Option<usize>,
    submit_timeout: Duration,
}

impl<W: Write + Send> OrderedWriter<W> {
    /// Create the writer, writing the header (if any) to the sink immediately
    pub fn new(
        mut sink: W,
        header: Option<&str>,
        parameters: &WriterParameters,
    ) -> Result<Self, WriterError> {
        if let Some(header) = header {
            sink.write_all(header.as_bytes())?;
        }
        Ok(Self {
            state: Mutex::new(WriterState {
                next_expected: 0,
                pending: BTreeMap::new(),
                sink,
                written: 0,
            }),
            space_available: Condvar::new(),
            batch_threshold: parameters.batch_threshold.max(1),
            max_pending: parameters.max_pending,
            submit_timeout: parameters.submit_timeout(),
        })
    }

    fn lock(&self) -> Result<MutexGuard<'_, WriterState<W>>, WriterError> {
        self.state.lock().map_err(|_| WriterError::Poisoned)
    }

    /// Hand the payload for `index` to the writer.
    ///
    /// If a buffer bound is configured and the buffer is full, waits for space unless `index` is the
    /// next one to be written.
    pub fn submit(&self, index: usize, payload: String) -> Result<(), WriterError> {
        let mut state = self.lock()?;
        if state.is_duplicate(index) {
            return Err(WriterError::DuplicateIndex(index));
        }

        if let Some(max_pending) = self.max_pending {
            if index != state.next_expected && state.pending.len() >= max_pending {
                let (guard, result) = self
                    .space_available
                    .wait_timeout_while(state, self.submit_timeout, |s| {
                        index != s.next_expected && s.pending.len() >= max_pending
                    })
                    .map_err(|_| WriterError::Poisoned)?;
                state = guard;
                if result.timed_out() {
                    return Err(WriterError::SubmitTimeout {
                        index,
                        waiting_on: state.next_expected,
                    });
                }
                // Another submitter may have raced us in while we waited
                if state.is_duplicate(index) {
                    return Err(WriterError::DuplicateIndex(index));
                }
            }
        }

        state.pending.insert(index, payload);
        if state.pending.len() < self.batch_threshold {
            return Ok(());
        }

        let before = state.pending.len();
        state.drain()?;
        if state.pending.len() < before {
            self.space_available.notify_all();
        }
        Ok(())
    }

    /// Write everything still buffered in ascending order, skipping over missing indices, and flush
    /// the sink. Returns the missing indices. When `expected_count` is given, indices past the last
    /// submission up to it are missing as well.
    pub fn finish(&self, expected_count: Option<usize>) -> Result<Vec<usize>, WriterError> {
        let mut state = self.lock()?;
        let mut gaps = Vec::new();
        let pending = std::mem::take(&mut state.pending);
        for (index, payload) in pending {
            while state.next_expected < index {
                spdlog::warn!(
                    "OrderedWriter never received index {}; skipping it",
                    state.next_expected
                );
                gaps.push(state.next_expected);
                state.next_expected += 1;
            }
            state.sink.write_all(payload.as_bytes())?;
            state.next_expected += 1;
            state.written += 1;
        }
        if let Some(expected) = expected_count {
            while state.next_expected < expected {
                spdlog::warn!(
                    "OrderedWriter never received index {}; skipping it",
                    state.next_expected
                );
                gaps.push(state.next_expected);
                state.next_expected += 1;
            }
        }
        state.sink.flush()?;
        self.space_available.notify_all();
        Ok(gaps)
    }

    /// Number of payloads written to the sink so far
    pub fn written(&self) -> Result<usize, WriterError> {
        Ok(self.lock()?.written)
    }

    pub fn next_expected(&self) -> Result<usize, WriterError> {
        Ok(self.lock()?.next_expected)
    }

    /// Consume the writer and return the sink
    pub fn into_inner(self) -> Result<W, WriterError> {
        self.state
            .into_inner()
            .map(|state| state.sink)
            .map_err(|_| WriterError::Poisoned)
    }
}
