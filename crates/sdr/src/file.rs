// Copyright 2025-2026 CEMAXECUTER LLC

use std::fs::File;
use std::io::{BufReader, Read};

use crossbeam::channel::Sender;
use num_complex::Complex32;

use crate::{CancelToken, SampleChunk, SampleSource, SourceError, Timestamp};

/// IQ sample format for file and stdin input.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SampleFormat {
    /// Complex unsigned 8-bit (RTL-SDR native): pairs of u8
    Cu8,
    /// Complex int16: pairs of i16, little-endian
    Cs16,
    /// Complex float32: pairs of f32, little-endian
    Cf32,
}

impl SampleFormat {
    pub fn bytes_per_sample(self) -> usize {
        match self {
            SampleFormat::Cu8 => 2,
            SampleFormat::Cs16 => 4,
            SampleFormat::Cf32 => 8,
        }
    }
}

/// Convert raw interleaved IQ bytes to complex samples. Trailing partial
/// samples are dropped.
pub fn convert_to_complex(format: SampleFormat, bytes: &[u8]) -> Vec<Complex32> {
    match format {
        SampleFormat::Cu8 => bytes
            .chunks_exact(2)
            .map(|c| {
                Complex32::new(
                    (c[0] as f32 - 127.5) / 128.0,
                    (c[1] as f32 - 127.5) / 128.0,
                )
            })
            .collect(),
        SampleFormat::Cs16 => bytes
            .chunks_exact(4)
            .map(|c| {
                Complex32::new(
                    i16::from_le_bytes([c[0], c[1]]) as f32 / 32768.0,
                    i16::from_le_bytes([c[2], c[3]]) as f32 / 32768.0,
                )
            })
            .collect(),
        SampleFormat::Cf32 => bytes
            .chunks_exact(8)
            .map(|c| {
                Complex32::new(
                    f32::from_le_bytes([c[0], c[1], c[2], c[3]]),
                    f32::from_le_bytes([c[4], c[5], c[6], c[7]]),
                )
            })
            .collect(),
    }
}

/// IQ file reader: reads raw samples from a file (or stdin for `-`) and
/// sends them as timestamped chunks.
pub struct FileSource {
    path: String,
    format: SampleFormat,
    sample_rate: u32,
    center_freq: u64,
    /// Number of complex samples per chunk
    chunk_size: usize,
}

impl FileSource {
    pub fn new(
        path: impl Into<String>,
        format: SampleFormat,
        sample_rate: u32,
        center_freq: u64,
    ) -> Self {
        Self {
            path: path.into(),
            format,
            sample_rate,
            center_freq,
            chunk_size: 65536,
        }
    }

    pub fn set_chunk_size(&mut self, size: usize) {
        self.chunk_size = size;
    }

    fn stream(
        &self,
        mut reader: impl Read,
        tx: Sender<SampleChunk>,
        cancel: &CancelToken,
    ) -> Result<(), SourceError> {
        let bytes_per_chunk = self.chunk_size * self.format.bytes_per_sample();
        let mut buf = vec![0u8; bytes_per_chunk];

        while !cancel.is_cancelled() {
            let mut filled = 0usize;
            while filled < buf.len() {
                let n = reader
                    .read(&mut buf[filled..])
                    .map_err(|e| SourceError::read(format!("{}: read error: {}", self.path, e)))?;
                if n == 0 {
                    break;
                }
                filled += n;
            }
            if filled == 0 {
                log::info!("end of input: {}", self.path);
                break;
            }
            let samples = convert_to_complex(self.format, &buf[..filled]);
            let chunk = SampleChunk {
                samples,
                timestamp: Timestamp::now(),
            };
            if tx.send(chunk).is_err() {
                break; // receiver dropped
            }
        }
        Ok(())
    }
}

impl SampleSource for FileSource {
    fn start(
        &mut self,
        tx: Sender<SampleChunk>,
        cancel: &CancelToken,
    ) -> Result<(), SourceError> {
        log::info!(
            "reading IQ from {} ({:?}, {} Hz)",
            self.path,
            self.format,
            self.sample_rate
        );
        if self.path == "-" {
            let stdin = std::io::stdin();
            self.stream(stdin.lock(), tx, cancel)
        } else {
            let file = File::open(&self.path)
                .map_err(|e| SourceError::device(format!("failed to open {}: {}", self.path, e)))?;
            let reader = BufReader::with_capacity(1024 * 1024, file);
            self.stream(reader, tx, cancel)
        }
    }

    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn center_freq(&self) -> u64 {
        self.center_freq
    }
}
