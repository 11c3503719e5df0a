//! The receiver state machine: carrier recovery, beacon acquisition,
//! cycle extraction and the capture schedule.
//!
//! One call to [`Receiver::next`] processes exactly one IQ block. The
//! carrier is acquired from the block power spectrum and then tracked by
//! observing the phase step of the DC bin of the frequency-shifted
//! signal. A dip in the DC amplitude marks a candidate beacon pulse,
//! which is confirmed by matched-filter correlation; every confirmed
//! beacon anchors a run of fixed-size correlation windows that are
//! FFT'd, phase-corrected and written to the trace.

use std::io::Write;

use log::{debug, info, warn};
use num_complex::Complex32;

use corx_dsp::angle::{arg_to_deciangle, normalize_deciangle, DeciAngle};
use corx_dsp::carrier::CarrierDetector;
use corx_dsp::correlate::{interpolate_parabolic, CorrDetection, CorrDetector};
use corx_dsp::fft::Fft;
use corx_dsp::nco::{fft_shift, freq_shift_into};
use corx_output::corx::{CorxBeaconHeader, CorxFileHeader, CorxWriter};
use corx_sdr::blocks::{Block, BlockReader};
use corx_sdr::CancelToken;

use crate::error::RxError;

/// Tracking is abandoned when the per-block phase step exceeds this many
/// degrees.
const MAX_TRACKING_ANGLE_DIFF_DEG: f32 = 50.0;
/// Fraction of the observed phase step fed back into the carrier
/// position estimate.
const TRACKING_ANGLE_DIFF_FACTOR: f32 = 0.2;
const AVG_ANGLE_WEIGHT: f32 = 0.1;
const AVG_DC_AMPL_WEIGHT: f32 = 0.1;
/// A beacon pulse suppresses the carrier; a DC amplitude below this
/// fraction of the running average triggers a correlation pass.
const BEACON_CARRIER_TRIGGER_FACTOR: f32 = 0.8;
/// Cycles whose residual phase exceeds this many turns are counted.
const PHASE_ERROR_LIMIT: DeciAngle = 0.2;

/// Receiver tuning knobs. Times are in seconds, converted to block
/// counts once the first beacon fixes the capture schedule.
#[derive(Debug, Clone)]
pub struct ReceiverConfig {
    /// Correlation window length W.
    pub corr_size: usize,
    /// Samples skipped between a beacon pulse and the first correlation
    /// window (and reserved again before the next pulse).
    pub skip_beacon_padding: usize,
    /// Expected carrier offset from the tuner centre frequency, Hz.
    /// Reference for the clock-error estimate.
    pub carrier_ref: f32,
    /// Nominal beacon repetition interval.
    pub beacon_interval: f32,
    /// Capture time after the first beacon, before the preamp switch.
    pub max_capture_time: f32,
    /// Noise-capture time with the preamp off.
    pub preamp_off_time: f32,
    /// Data discarded after the preamp switch transient.
    pub preamp_off_skip: f32,
    /// Blocks discarded at startup.
    pub skip_blocks: u32,
    /// First FFT bin of each correlation window written to the trace.
    pub slice_start: usize,
    /// Number of bins written; None writes the whole window.
    pub slice_len: Option<usize>,
}

impl Default for ReceiverConfig {
    fn default() -> Self {
        Self {
            corr_size: 1024,
            skip_beacon_padding: 6000,
            carrier_ref: -277_800.0,
            beacon_interval: 1.0,
            max_capture_time: 10.1,
            preamp_off_time: 2.0,
            preamp_off_skip: 0.2,
            skip_blocks: 1,
            slice_start: 0,
            slice_len: None,
        }
    }
}

#[derive(Debug, Default)]
struct CarrierState {
    locked: bool,
    /// Carrier position in FFT bins, fractional, signed about zero.
    pos: f32,
    /// Phase of the first sample of the current block. Advanced by the
    /// block stride every block so the shifted waveform stays
    /// phase-continuous across block boundaries.
    sample_phase: DeciAngle,
    dc_angle: DeciAngle,
    prev_dc_angle: DeciAngle,
    dc_ampl: f32,
    avg_dc_angle: DeciAngle,
    avg_dc_ampl: f32,
}

pub struct Receiver<W: Write> {
    cfg: ReceiverConfig,
    reader: BlockReader,
    carrier_det: CarrierDetector,
    corr_det: CorrDetector,
    writer: CorxWriter<W>,

    block: Block,
    synced: Vec<Complex32>,
    synced_fft: Vec<Complex32>,
    fft_block: Fft,
    corr_buf: Vec<Complex32>,
    fft_corr: Fft,

    num_cycles: i32,
    slice_start: usize,
    slice_len: usize,

    carrier: CarrierState,
    block_idx: u32,
    blocks_to_skip: u32,
    /// Stop at this block index (0 = not scheduled).
    last_block: u32,
    /// Switch the preamp off at this block index (0 = not scheduled).
    preamp_off_block: u32,
    /// Number of beacon pulses received; -1 until the first detection.
    beacon_count: i32,
    /// Beacon sample-of-arrival, fractional samples from stream origin.
    soa: f64,
    prev_soa: f64,
    clock_error: f32,
    /// Correlation window index within the current beacon cycle;
    /// -1 = not inside a cycle.
    cycle: i32,
    num_phase_errors: u32,
    tracking_losses: u32,
}

impl<W: Write> Receiver<W> {
    pub fn new(
        cfg: ReceiverConfig,
        reader: BlockReader,
        carrier_det: CarrierDetector,
        corr_det: CorrDetector,
        writer: CorxWriter<W>,
    ) -> Result<Self, RxError> {
        let block_len = reader.block_len();
        let sample_rate = reader.sample_rate() as usize;
        if cfg.corr_size == 0 || cfg.corr_size > block_len {
            return Err(RxError::Config(format!(
                "correlation size {} must be in 1..={}",
                cfg.corr_size, block_len
            )));
        }
        if 2 * cfg.skip_beacon_padding >= sample_rate {
            return Err(RxError::Config(format!(
                "beacon padding {} too large for sample rate {}",
                cfg.skip_beacon_padding, sample_rate
            )));
        }
        let num_cycles = ((sample_rate - 2 * cfg.skip_beacon_padding) / cfg.corr_size) as i32;
        if num_cycles < 1 {
            return Err(RxError::Config(
                "beacon interval leaves no room for correlation windows".into(),
            ));
        }
        let slice_start = cfg.slice_start;
        let slice_len = cfg.slice_len.unwrap_or(cfg.corr_size);
        if slice_start + slice_len > cfg.corr_size {
            return Err(RxError::Config(format!(
                "output slice {}+{} exceeds correlation size {}",
                slice_start, slice_len, cfg.corr_size
            )));
        }

        Ok(Self {
            blocks_to_skip: cfg.skip_blocks,
            block: Block::new(block_len),
            synced: vec![Complex32::new(0.0, 0.0); block_len],
            synced_fft: vec![Complex32::new(0.0, 0.0); block_len],
            fft_block: Fft::forward(block_len),
            corr_buf: vec![Complex32::new(0.0, 0.0); cfg.corr_size],
            fft_corr: Fft::forward(cfg.corr_size),
            num_cycles,
            slice_start,
            slice_len,
            carrier: CarrierState::default(),
            block_idx: 0,
            last_block: 0,
            preamp_off_block: 0,
            beacon_count: -1,
            soa: 0.0,
            prev_soa: 0.0,
            clock_error: 0.0,
            cycle: -1,
            num_phase_errors: 0,
            tracking_losses: 0,
            cfg,
            reader,
            carrier_det,
            corr_det,
            writer,
        })
    }

    /// Start the source, power the preamp and write the trace header.
    pub fn start(&mut self) -> Result<(), RxError> {
        self.reader
            .start()
            .map_err(|e| RxError::Config(e.to_string()))?;
        self.reader.set_bias_tee(true);
        self.writer.write_file_header(&CorxFileHeader {
            slice_start_idx: self.slice_start as u16,
            slice_size: self.slice_len as u16,
        })?;
        Ok(())
    }

    /// Process one IQ block. Returns Ok(false) on EOF or cancellation;
    /// any source error is surfaced afterwards by [`Self::run`].
    pub fn next(&mut self) -> Result<bool, RxError> {
        let stride = (self.reader.block_len() - self.reader.history_len()) as u32;
        let sample_rate = self.reader.sample_rate() as f32;

        if self.preamp_off_block > 0 && self.block_idx == self.preamp_off_block {
            info!("block #{}: switching off preamp", self.block_idx);
            if self.cycle >= 0 {
                self.cycle = -1;
                self.writer.write_cycle_stop()?;
            }
            self.reader.set_bias_tee(false);
            self.blocks_to_skip = (self.cfg.preamp_off_skip * sample_rate / stride as f32) as u32;
            info!("skipping {} blocks", self.blocks_to_skip);
        }

        if self.last_block > 0 && self.block_idx == self.last_block {
            self.reader.cancel_token().cancel();
        }

        let ok = self.reader.next_into(&mut self.block);
        if !ok {
            if self.cycle >= 0 {
                self.cycle = -1;
                self.writer.write_cycle_stop()?;
            }
            self.reader.print_stats();
            return Ok(false);
        }

        self.block_idx += 1;

        if self.blocks_to_skip > 0 {
            self.blocks_to_skip -= 1;
            return Ok(true);
        }

        if self.preamp_off_block > 0 && self.block_idx > self.preamp_off_block {
            self.capture_noise()?;
            return Ok(true);
        }

        self.recover_carrier();

        let history_frac =
            self.reader.history_len() as f32 / self.reader.block_len() as f32;
        self.carrier.sample_phase = normalize_deciangle(
            self.carrier.sample_phase - self.carrier.pos * (1.0 - history_frac),
        );
        self.carrier.avg_dc_angle = self.carrier.dc_angle * AVG_ANGLE_WEIGHT
            + self.carrier.avg_dc_angle * (1.0 - AVG_ANGLE_WEIGHT);
        self.carrier.avg_dc_ampl = self.carrier.dc_ampl * AVG_DC_AMPL_WEIGHT
            + self.carrier.avg_dc_ampl * (1.0 - AVG_DC_AMPL_WEIGHT);

        if !self.carrier.locked {
            return Ok(true);
        }

        if self.cycle == -1
            && self.carrier.dc_ampl < self.carrier.avg_dc_ampl * BEACON_CARRIER_TRIGGER_FACTOR
        {
            debug!(
                "block #{}: DC dip: {:.1} vs avg {:.1}",
                self.block_idx, self.carrier.dc_ampl, self.carrier.avg_dc_ampl
            );
            if let Some(corr) = self.find_beacon() {
                self.clock_error = self.estimate_clock_error();
                info!(
                    "beacon #{}: ppm = {:.3}",
                    self.beacon_count,
                    self.clock_error * 1e6
                );

                self.cycle = 0;
                self.num_phase_errors = 0;

                if self.beacon_count == 0 {
                    let capture_blocks = ((self.cfg.max_capture_time + self.cfg.preamp_off_time)
                        * sample_rate
                        / stride as f32) as u32;
                    self.last_block = self.block_idx + capture_blocks;
                    self.preamp_off_block = self.block_idx
                        + (self.cfg.max_capture_time * sample_rate / stride as f32) as u32;
                    info!(
                        "block #{}: found first beacon; stopping after {:.1} s (at block #{})",
                        self.block_idx,
                        self.cfg.max_capture_time + self.cfg.preamp_off_time,
                        self.last_block
                    );
                }

                let ts = self.block.timestamp;
                self.writer.write_cycle_start(&CorxBeaconHeader {
                    soa: self.soa,
                    timestamp_sec: ts.sec,
                    timestamp_msec: (ts.usec / 1000) as u16,
                    beacon_amplitude: corr.peak_power.sqrt() as u32,
                    beacon_noise: corr.noise_power.sqrt() as u32,
                    clock_error: self.clock_error,
                    carrier_pos: self.carrier.pos,
                    carrier_amplitude: self.carrier.dc_ampl as u32,
                    preamp_on: true,
                })?;
            }
        }

        if self.cycle >= 0 {
            self.extract_corr_blocks()?;
        }

        Ok(true)
    }

    /// Run the pipeline to completion, closing the trace on every exit
    /// path.
    pub fn run(&mut self) -> Result<(), RxError> {
        loop {
            match self.next() {
                Ok(true) => {}
                Ok(false) => break,
                Err(e) => {
                    self.abort();
                    return Err(e);
                }
            }
        }
        self.writer.flush()?;
        if let Some(e) = self.reader.take_error() {
            return Err(RxError::Source(e));
        }
        Ok(())
    }

    /// Close any open cycle and flush, ignoring secondary failures.
    pub fn abort(&mut self) {
        if self.writer.cycle_open() {
            let _ = self.writer.write_cycle_stop();
        }
        self.cycle = -1;
        let _ = self.writer.flush();
    }

    /// Noise-capture mode: the preamp is off and the carrier estimate is
    /// frozen; keep shifting and slicing so the trace gains
    /// noise-reference cycles.
    fn capture_noise(&mut self) -> Result<(), RxError> {
        freq_shift_into(
            &mut self.synced,
            &self.block.samples,
            -self.carrier.pos,
            self.carrier.sample_phase,
        );

        if self.cycle == -1 {
            info!("block #{}: capture noise: next cycle", self.block_idx);
            let stride = (self.reader.block_len() - self.reader.history_len()) as u32;
            self.soa = (stride as u64 * self.block_idx as u64) as f64;
            self.cycle = 0;
            self.num_phase_errors = 0;

            let ts = self.block.timestamp;
            self.writer.write_cycle_start(&CorxBeaconHeader {
                soa: self.soa,
                timestamp_sec: ts.sec,
                timestamp_msec: (ts.usec / 1000) as u16,
                beacon_amplitude: 0,
                beacon_noise: 0,
                clock_error: self.clock_error,
                carrier_pos: self.carrier.pos,
                carrier_amplitude: 0,
                preamp_on: false,
            })?;
        }

        self.extract_corr_blocks()
    }

    /// Synchronise to / track the carrier. Sets the lock flag, the
    /// synced signal and the DC measurements.
    fn recover_carrier(&mut self) {
        if self.carrier.locked {
            freq_shift_into(
                &mut self.synced,
                &self.block.samples,
                -self.carrier.pos,
                self.carrier.sample_phase,
            );

            self.carrier.prev_dc_angle = self.carrier.dc_angle;
            let dc: Complex32 = self.synced.iter().sum();
            self.carrier.dc_ampl = dc.norm();
            self.carrier.dc_angle = arg_to_deciangle(dc);

            let angle_diff =
                normalize_deciangle(self.carrier.dc_angle - self.carrier.prev_dc_angle);

            if angle_diff.abs() * 360.0 > MAX_TRACKING_ANGLE_DIFF_DEG {
                self.carrier.locked = false;
                self.tracking_losses += 1;
                warn!("block #{}: tracking loop failed", self.block_idx);
            } else {
                self.carrier.pos += angle_diff * TRACKING_ANGLE_DIFF_FACTOR;
            }
        }

        if !self.carrier.locked {
            let det = self.carrier_det.process(&self.block.samples);
            if det.detected {
                let triplet = self.carrier_det.power_triplet(det.argmax);
                let offset = interpolate_parabolic(&triplet);
                let mut pos = det.argmax as f32 + offset;
                let block_len = self.reader.block_len();
                if pos > block_len as f32 / 2.0 {
                    pos -= block_len as f32;
                }
                self.carrier.pos = pos;
                self.carrier.locked = true;

                info!(
                    "block #{}: detected carrier @ {:.3}; SNR: {:.1} / {:.1}",
                    self.block_idx, pos, det.peak, det.noise
                );

                freq_shift_into(
                    &mut self.synced,
                    &self.block.samples,
                    -self.carrier.pos,
                    self.carrier.sample_phase,
                );
                let dc: Complex32 = self.synced.iter().sum();
                self.carrier.dc_ampl = dc.norm();
                self.carrier.dc_angle = arg_to_deciangle(dc);
            } else {
                debug!("block #{}: no carrier detected", self.block_idx);
            }
        }
    }

    /// Correlate the synced block against the beacon template and update
    /// the SOA / beacon bookkeeping on detection.
    fn find_beacon(&mut self) -> Option<CorrDetection> {
        self.synced_fft.copy_from_slice(&self.synced);
        self.fft_block.process(&mut self.synced_fft);
        let corr = self.corr_det.detect(&self.synced_fft, 0.0);
        if !corr.detected {
            return None;
        }

        debug!(
            "block #{}: detected beacon (power {:.0})",
            self.block_idx, corr.peak_power
        );

        let stride = (self.reader.block_len() - self.reader.history_len()) as u64;
        self.prev_soa = self.soa;
        self.soa = (stride * self.block_idx as u64) as f64
            + corr.peak_idx as f64
            + corr.peak_offset as f64;
        let time_step = (self.soa - self.prev_soa) / self.reader.sample_rate() as f64;

        if self.beacon_count > 0 && time_step > 1.5 * self.cfg.beacon_interval as f64 {
            // Pulses were missed; recover the beacon index from the
            // elapsed time.
            warn!("large time step ({:.1} s)", time_step);
            self.beacon_count += time_step.round() as i32;
        } else {
            self.beacon_count += 1;
        }

        info!(
            "beacon #{}: soa = {:.3}; timestep = {:.3}",
            self.beacon_count, self.soa, time_step
        );

        Some(corr)
    }

    /// Slice, FFT and phase-correct the correlation windows that fall
    /// inside the current block.
    fn extract_corr_blocks(&mut self) -> Result<(), RxError> {
        let block_len = self.reader.block_len();
        let stride = (block_len - self.reader.history_len()) as u64;
        let w = self.cfg.corr_size;

        while self.cycle < self.num_cycles {
            let start = self.soa
                + (self.cfg.skip_beacon_padding + self.cycle as usize * w) as f64
                    * (1.0 - self.clock_error as f64)
                - (stride * self.block_idx as u64) as f64;
            let start_idx = start.round() as i64;
            if start_idx < 0 || start_idx as usize + w > block_len {
                // The remaining windows lie in future blocks.
                break;
            }
            let start_idx = start_idx as usize;

            self.corr_buf
                .copy_from_slice(&self.synced[start_idx..start_idx + w]);
            self.fft_corr.process(&mut self.corr_buf);

            // Correct the fractional-sample time offset and the residual
            // carrier phase.
            let carrier_offset =
                (-(self.carrier.pos as f64) * w as f64 / block_len as f64).round() as isize;
            fft_shift(
                &mut self.corr_buf,
                (start - start_idx as f64) as f32,
                -self.carrier.avg_dc_angle,
                carrier_offset,
            );

            let error = arg_to_deciangle(self.corr_buf[0]);
            if error.abs() > PHASE_ERROR_LIMIT {
                self.num_phase_errors += 1;
            }
            let error_fp = (error / 0.5 * 127.0).round().clamp(-127.0, 127.0) as i8;

            self.writer.write_cycle_block(
                error_fp,
                &self.corr_buf[self.slice_start..self.slice_start + self.slice_len],
            )?;
            self.cycle += 1;
        }

        if self.cycle >= self.num_cycles {
            self.cycle = -1;
            self.writer.write_cycle_stop()?;
            if self.num_phase_errors > 0 {
                warn!(
                    "beacon {}: {} / {} corr blocks have large phase error",
                    self.beacon_count, self.num_phase_errors, self.num_cycles
                );
            }
        }

        Ok(())
    }

    /// Receiver clock error estimated from the recovered carrier offset.
    /// Assumes the downconverter and ADC share a local oscillator.
    fn estimate_clock_error(&self) -> f32 {
        let center_freq = self.reader.center_freq();
        if center_freq == 0 {
            return 0.0;
        }
        let carrier_freq = self.carrier.pos as f64 * self.reader.sample_rate() as f64
            / self.reader.block_len() as f64;
        ((carrier_freq - self.cfg.carrier_ref as f64) / center_freq as f64) as f32
    }

    pub fn cancel_token(&self) -> CancelToken {
        self.reader.cancel_token()
    }

    pub fn carrier_locked(&self) -> bool {
        self.carrier.locked
    }

    pub fn carrier_pos(&self) -> f32 {
        self.carrier.pos
    }

    pub fn beacon_count(&self) -> i32 {
        self.beacon_count
    }

    pub fn soa(&self) -> f64 {
        self.soa
    }

    pub fn clock_error(&self) -> f32 {
        self.clock_error
    }

    pub fn block_index(&self) -> u32 {
        self.block_idx
    }

    pub fn tracking_losses(&self) -> u32 {
        self.tracking_losses
    }

    pub fn num_phase_errors(&self) -> u32 {
        self.num_phase_errors
    }

    pub fn writer(&self) -> &CorxWriter<W> {
        &self.writer
    }

    pub fn into_writer(self) -> CorxWriter<W> {
        self.writer
    }
}
