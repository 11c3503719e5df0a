// Copyright 2025-2026 CEMAXECUTER LLC

//! Overlapped block assembly on top of a raw sample source.
//!
//! The source streams arbitrarily-sized chunks from its own thread; the
//! reader reassembles them into fixed-size blocks of `block_len` samples
//! where consecutive blocks share `history_len` samples. The pipeline
//! pulls one block at a time and owns the buffer, so the per-block path
//! allocates nothing.

use std::thread::JoinHandle;
use std::time::Instant;

use crossbeam::channel::{bounded, Receiver};
use num_complex::Complex32;

use crate::{BiasTeeControl, CancelToken, SampleChunk, SampleSource, SourceError, Timestamp};

const CHANNEL_DEPTH: usize = 16;

/// One assembled IQ block.
pub struct Block {
    pub samples: Vec<Complex32>,
    pub timestamp: Timestamp,
}

impl Block {
    pub fn new(block_len: usize) -> Self {
        Self {
            samples: vec![Complex32::new(0.0, 0.0); block_len],
            timestamp: Timestamp::default(),
        }
    }
}

/// Pull interface over a sample source: overlapped fixed-size blocks.
pub struct BlockReader {
    source: Option<Box<dyn SampleSource>>,
    sample_rate: u32,
    center_freq: u64,
    block_len: usize,
    history_len: usize,
    rx: Option<Receiver<SampleChunk>>,
    handle: Option<JoinHandle<Result<(), SourceError>>>,
    chunk: Vec<Complex32>,
    chunk_pos: usize,
    chunk_ts: Timestamp,
    /// False until the first full block has been assembled.
    primed: bool,
    cancel: CancelToken,
    bias: Option<BiasTeeControl>,
    blocks_read: u64,
    started_at: Option<Instant>,
    error: Option<SourceError>,
}

impl BlockReader {
    pub fn new(
        source: Box<dyn SampleSource>,
        block_len: usize,
        history_len: usize,
    ) -> Result<Self, String> {
        if block_len == 0 {
            return Err("block length must be non-zero".into());
        }
        if history_len >= block_len {
            return Err(format!(
                "history length {} must be smaller than block length {}",
                history_len, block_len
            ));
        }
        let sample_rate = source.sample_rate();
        let center_freq = source.center_freq();
        let bias = source.bias_tee();
        Ok(Self {
            source: Some(source),
            sample_rate,
            center_freq,
            block_len,
            history_len,
            rx: None,
            handle: None,
            chunk: Vec::new(),
            chunk_pos: 0,
            chunk_ts: Timestamp::default(),
            primed: false,
            cancel: CancelToken::new(),
            bias,
            blocks_read: 0,
            started_at: None,
            error: None,
        })
    }

    /// Spawn the reader thread and begin streaming.
    pub fn start(&mut self) -> Result<(), String> {
        let mut source = self
            .source
            .take()
            .ok_or_else(|| "block reader already started".to_string())?;
        let (tx, rx) = bounded(CHANNEL_DEPTH);
        let cancel = self.cancel.clone();
        let handle = std::thread::Builder::new()
            .name("corx-source".into())
            .spawn(move || source.start(tx, &cancel))
            .map_err(|e| format!("failed to spawn source thread: {}", e))?;
        self.rx = Some(rx);
        self.handle = Some(handle);
        self.started_at = Some(Instant::now());
        Ok(())
    }

    /// Assemble the next block into `block`. Returns false on EOF or
    /// cancellation; a source failure is retrievable via `take_error`.
    pub fn next_into(&mut self, block: &mut Block) -> bool {
        if self.cancel.is_cancelled() {
            self.shutdown();
            return false;
        }
        assert_eq!(block.samples.len(), self.block_len);

        let mut write_pos = if self.primed {
            block
                .samples
                .copy_within(self.block_len - self.history_len.., 0);
            self.history_len
        } else {
            0
        };

        while write_pos < self.block_len {
            if self.chunk_pos >= self.chunk.len() {
                let Some(rx) = self.rx.as_ref() else {
                    return false;
                };
                match rx.recv() {
                    Ok(chunk) => {
                        self.chunk = chunk.samples;
                        self.chunk_pos = 0;
                        self.chunk_ts = chunk.timestamp;
                    }
                    Err(_) => {
                        // Source finished; a partial block is discarded.
                        self.shutdown();
                        return false;
                    }
                }
                continue;
            }
            let n = (self.block_len - write_pos).min(self.chunk.len() - self.chunk_pos);
            block.samples[write_pos..write_pos + n]
                .copy_from_slice(&self.chunk[self.chunk_pos..self.chunk_pos + n]);
            write_pos += n;
            self.chunk_pos += n;
        }

        block.timestamp = self.chunk_ts;
        self.primed = true;
        self.blocks_read += 1;
        true
    }

    /// Drop the channel and join the reader thread, capturing its error.
    fn shutdown(&mut self) {
        self.rx = None;
        if let Some(handle) = self.handle.take() {
            match handle.join() {
                Ok(Ok(())) => {}
                Ok(Err(e)) => self.error = Some(e),
                Err(_) => {
                    self.error = Some(SourceError::read("source thread panicked"));
                }
            }
        }
    }

    /// Source error that terminated the stream, if any.
    pub fn take_error(&mut self) -> Option<SourceError> {
        self.error.take()
    }

    /// Handle for requesting cancellation, safe to use from a signal
    /// handler.
    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    /// Request a bias-tee switch. Returns true iff the source supports it.
    pub fn set_bias_tee(&self, on: bool) -> bool {
        match &self.bias {
            Some(ctl) => {
                ctl.request(on);
                log::info!("{} bias tee", if on { "enabling" } else { "disabling" });
                true
            }
            None => false,
        }
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn center_freq(&self) -> u64 {
        self.center_freq
    }

    pub fn block_len(&self) -> usize {
        self.block_len
    }

    pub fn history_len(&self) -> usize {
        self.history_len
    }

    pub fn blocks_read(&self) -> u64 {
        self.blocks_read
    }

    pub fn print_stats(&self) {
        let stride = (self.block_len - self.history_len) as u64;
        let captured = self.blocks_read * stride;
        let seconds = captured as f64 / self.sample_rate as f64;
        match self.started_at {
            Some(t0) => log::info!(
                "read {} blocks ({:.1} s of samples) in {:.1} s",
                self.blocks_read,
                seconds,
                t0.elapsed().as_secs_f64()
            ),
            None => log::info!("read {} blocks ({:.1} s of samples)", self.blocks_read, seconds),
        }
    }
}

impl Drop for BlockReader {
    fn drop(&mut self) {
        self.cancel.cancel();
        self.shutdown();
    }
}
