// Copyright 2025-2026 CEMAXECUTER LLC

use crossbeam::channel::Sender;
use rtl_sdr_rs::{RtlSdr, TunerGain, DEFAULT_BUF_LENGTH};

use crate::file::{convert_to_complex, SampleFormat};
use crate::{BiasTeeControl, CancelToken, SampleChunk, SampleSource, SourceError, Timestamp};

#[derive(Debug, Clone)]
pub struct RtlSdrConfig {
    /// Device index (0 for first device)
    pub device_index: usize,
    /// Centre frequency in Hz
    pub center_freq: u32,
    /// Sample rate in Hz
    pub sample_rate: u32,
    /// Tuner gain in tenths of dB (None for AGC)
    pub gain: Option<i32>,
}

/// RTL-SDR sample source.
///
/// The tuner handle lives entirely on the reader thread; bias-tee
/// requests from the pipeline arrive through the mailbox and are applied
/// between reads.
pub struct RtlSdrSource {
    config: RtlSdrConfig,
    bias: BiasTeeControl,
}

impl RtlSdrSource {
    pub fn new(config: RtlSdrConfig) -> Self {
        Self {
            config,
            bias: BiasTeeControl::new(),
        }
    }
}

impl SampleSource for RtlSdrSource {
    fn start(
        &mut self,
        tx: Sender<SampleChunk>,
        cancel: &CancelToken,
    ) -> Result<(), SourceError> {
        let cfg = &self.config;
        let mut rtl = RtlSdr::open_with_index(cfg.device_index)
            .map_err(|e| SourceError::device(format!("failed to open RTL-SDR: {}", e)))?;
        rtl.set_sample_rate(cfg.sample_rate)
            .map_err(|e| SourceError::device(format!("failed to set sample rate: {}", e)))?;
        rtl.set_center_freq(cfg.center_freq)
            .map_err(|e| SourceError::device(format!("failed to set frequency: {}", e)))?;
        match cfg.gain {
            Some(gain) => rtl
                .set_tuner_gain(TunerGain::Manual(gain))
                .map_err(|e| SourceError::device(format!("failed to set gain: {}", e)))?,
            None => rtl
                .set_tuner_gain(TunerGain::Auto)
                .map_err(|e| SourceError::device(format!("failed to set AGC: {}", e)))?,
        }
        rtl.reset_buffer()
            .map_err(|e| SourceError::device(format!("failed to reset buffer: {}", e)))?;

        log::info!(
            "RTL-SDR #{}: {} Hz @ {} sps",
            cfg.device_index,
            cfg.center_freq,
            cfg.sample_rate
        );

        let mut buf = vec![0u8; DEFAULT_BUF_LENGTH];
        while !cancel.is_cancelled() {
            if let Some(on) = self.bias.take() {
                match rtl.set_bias_tee(on) {
                    Ok(()) => log::info!("{} bias tee", if on { "enabled" } else { "disabled" }),
                    Err(e) => log::warn!("bias tee switch failed: {}", e),
                }
            }
            let n = rtl
                .read_sync(&mut buf)
                .map_err(|e| SourceError::read(format!("RTL-SDR read failed: {}", e)))?;
            if n == 0 {
                break;
            }
            let chunk = SampleChunk {
                samples: convert_to_complex(SampleFormat::Cu8, &buf[..n]),
                timestamp: Timestamp::now(),
            };
            if tx.send(chunk).is_err() {
                break;
            }
        }
        Ok(())
    }

    fn sample_rate(&self) -> u32 {
        self.config.sample_rate
    }

    fn center_freq(&self) -> u64 {
        self.config.center_freq as u64
    }

    fn bias_tee(&self) -> Option<BiasTeeControl> {
        Some(self.bias.clone())
    }
}
