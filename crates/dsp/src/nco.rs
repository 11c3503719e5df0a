//! Sine-lookup NCO and the frequency-shift primitives built on it.
//!
//! The hot path of the receiver multiplies every incoming block by a
//! complex sinusoid, so the oscillator uses a shared full-turn sine table
//! with linear interpolation instead of calling `sin`/`cos` per sample.
//! The phase accumulator is kept in f64 turns and re-wrapped every step,
//! which holds the drift over a block well below a milliradian even for
//! blocks of 2^20 samples.

use std::f64::consts::TAU;
use std::sync::OnceLock;

use num_complex::Complex32;

use crate::angle::DeciAngle;

const TABLE_SIZE: usize = 4096;

struct SineTable {
    /// One full turn plus a guard entry for interpolation.
    table: Vec<f32>,
}

impl SineTable {
    fn new() -> Self {
        let mut table = Vec::with_capacity(TABLE_SIZE + 1);
        for i in 0..=TABLE_SIZE {
            table.push((TAU * i as f64 / TABLE_SIZE as f64).sin() as f32);
        }
        Self { table }
    }

    /// sin(2*pi*turns) for turns in [0, 1).
    #[inline]
    fn sin_turns(&self, turns: f64) -> f32 {
        let pos = turns * TABLE_SIZE as f64;
        let idx = pos as usize;
        let frac = (pos - idx as f64) as f32;
        let a = self.table[idx];
        let b = self.table[idx + 1];
        a + (b - a) * frac
    }

    /// exp(j*2*pi*turns) for turns in [0, 1).
    #[inline]
    fn expj_turns(&self, turns: f64) -> Complex32 {
        let mut cos_arg = turns + 0.25;
        if cos_arg >= 1.0 {
            cos_arg -= 1.0;
        }
        Complex32::new(self.sin_turns(cos_arg), self.sin_turns(turns))
    }
}

fn sine_table() -> &'static SineTable {
    static TABLE: OnceLock<SineTable> = OnceLock::new();
    TABLE.get_or_init(SineTable::new)
}

/// Numerically controlled oscillator generating `exp(j*(phi + n*dphi))`.
pub struct Nco {
    /// Current phase in turns, kept in [0, 1).
    phase: f64,
    /// Phase increment per sample, in turns.
    step: f64,
}

impl Nco {
    /// Create an oscillator with initial phase `phase_rad` and per-sample
    /// increment `step_rad`, both in radians.
    pub fn new(phase_rad: f32, step_rad: f32) -> Self {
        let phase = phase_rad as f64 / TAU;
        Self {
            phase: phase - phase.floor(),
            step: step_rad as f64 / TAU,
        }
    }

    /// Advance the phase by `extra_rad` radians without emitting samples.
    pub fn adjust_phase(&mut self, extra_rad: f32) {
        self.phase += extra_rad as f64 / TAU;
        self.phase -= self.phase.floor();
    }

    /// `dst[i] = src[i] * exp(j*(phi + i*dphi))`, then advance the phase
    /// past the end of the buffer.
    pub fn mix_into(&mut self, dst: &mut [Complex32], src: &[Complex32]) {
        assert_eq!(dst.len(), src.len());
        let table = sine_table();
        let mut phase = self.phase;
        for (d, s) in dst.iter_mut().zip(src.iter()) {
            *d = s * table.expj_turns(phase);
            phase += self.step;
            phase -= phase.floor();
        }
        self.phase = phase;
    }

    /// In-place variant of [`mix_into`](Self::mix_into).
    pub fn mix_in_place(&mut self, buf: &mut [Complex32]) {
        let table = sine_table();
        let mut phase = self.phase;
        for s in buf.iter_mut() {
            *s *= table.expj_turns(phase);
            phase += self.step;
            phase -= phase.floor();
        }
        self.phase = phase;
    }
}

/// Shift `src` by `shift_freq / len` cycles per sample with initial phase
/// `shift_phase` (in turns), writing into `dst`.
pub fn freq_shift_into(
    dst: &mut [Complex32],
    src: &[Complex32],
    shift_freq: f32,
    shift_phase: DeciAngle,
) {
    let len = src.len();
    let mut nco = Nco::new(
        2.0 * std::f32::consts::PI * shift_phase,
        2.0 * std::f32::consts::PI * shift_freq / len as f32,
    );
    nco.mix_into(dst, src);
}

/// In-place variant of [`freq_shift_into`].
pub fn freq_shift(buf: &mut [Complex32], shift_freq: f32, shift_phase: DeciAngle) {
    let len = buf.len();
    let mut nco = Nco::new(
        2.0 * std::f32::consts::PI * shift_phase,
        2.0 * std::f32::consts::PI * shift_freq / len as f32,
    );
    nco.mix_in_place(buf);
}

/// Like [`freq_shift`], but for a frequency-domain buffer in
/// zero-at-index-0 ordering.
///
/// The first `pos_len = ceil(len/2) + carrier_offset` samples carry the
/// positive-frequency phase ramp; the remaining (negative-frequency)
/// samples get an additional `-2*pi*shift_freq` phase to account for the
/// wrap of the FFT frequency axis after a non-integer time shift.
pub fn fft_shift(
    buf: &mut [Complex32],
    shift_freq: f32,
    shift_phase: DeciAngle,
    carrier_offset: isize,
) {
    let len = buf.len();
    let mut nco = Nco::new(
        2.0 * std::f32::consts::PI * shift_phase,
        2.0 * std::f32::consts::PI * shift_freq / len as f32,
    );
    let pos_len = ((len + 1) / 2) as isize + carrier_offset;
    let pos_len = pos_len.clamp(0, len as isize) as usize;
    nco.mix_in_place(&mut buf[..pos_len]);
    nco.adjust_phase(-2.0 * std::f32::consts::PI * shift_freq);
    nco.mix_in_place(&mut buf[pos_len..]);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fft::Fft;

    fn naive_shift(src: &[Complex32], shift_freq: f32, shift_phase: f32) -> Vec<Complex32> {
        let len = src.len() as f64;
        src.iter()
            .enumerate()
            .map(|(i, &s)| {
                let turns = shift_freq as f64 * i as f64 / len + shift_phase as f64;
                let w = Complex32::new(
                    (TAU * turns).cos() as f32,
                    (TAU * turns).sin() as f32,
                );
                s * w
            })
            .collect()
    }

    fn tone(len: usize, bin: f64) -> Vec<Complex32> {
        (0..len)
            .map(|i| {
                let turns = bin * i as f64 / len as f64;
                Complex32::new((TAU * turns).cos() as f32, (TAU * turns).sin() as f32)
            })
            .collect()
    }

    #[test]
    fn test_nco_matches_naive_exp() {
        let src = tone(4096, 3.25);
        let mut dst = vec![Complex32::default(); src.len()];
        freq_shift_into(&mut dst, &src, -17.7, 0.3);
        let expected = naive_shift(&src, -17.7, 0.3);
        for (got, want) in dst.iter().zip(expected.iter()) {
            assert!(
                (got - want).norm() < 1e-4,
                "NCO output {} differs from naive {}",
                got,
                want
            );
        }
    }

    #[test]
    fn test_nco_phase_drift_over_long_block() {
        // A large block must stay phase-accurate to well under a
        // milliradian at the far end. The reference phase is derived
        // from the same rounded step the oscillator was constructed
        // with, so this measures accumulation error, not f32 input
        // quantisation.
        let len: usize = 1 << 20;
        let step_rad = 2.0 * std::f32::consts::PI * 12345.5 / len as f32;
        let src = vec![Complex32::new(1.0, 0.0); len];
        let mut dst = vec![Complex32::default(); len];
        let mut nco = Nco::new(0.0, step_rad);
        nco.mix_into(&mut dst, &src);
        let i = len - 1;
        let turns = step_rad as f64 / TAU * i as f64;
        let want = Complex32::new((TAU * turns).cos() as f32, (TAU * turns).sin() as f32);
        let phase_err = (dst[i] * want.conj()).arg().abs();
        assert!(phase_err < 1e-3, "phase error {} rad", phase_err);
    }

    #[test]
    fn test_freq_shift_in_place_matches_into() {
        let src = tone(1024, 5.4);
        let mut a = vec![Complex32::default(); src.len()];
        freq_shift_into(&mut a, &src, 2.5, -0.1);
        let mut b = src.clone();
        freq_shift(&mut b, 2.5, -0.1);
        for (x, y) in a.iter().zip(b.iter()) {
            assert!((x - y).norm() < 1e-6);
        }
    }

    #[test]
    fn test_freq_shift_additive() {
        // Shifting by (f, phi) then (g, psi) equals shifting by
        // (f + g, phi + psi).
        let src = tone(2048, 7.3);
        let mut once = src.clone();
        freq_shift(&mut once, 3.7 + 1.8, 0.15 + 0.05);
        let mut twice = src.clone();
        freq_shift(&mut twice, 3.7, 0.15);
        freq_shift(&mut twice, 1.8, 0.05);
        let rms: f32 = once
            .iter()
            .zip(twice.iter())
            .map(|(x, y)| (x - y).norm_sqr())
            .sum::<f32>()
            .sqrt()
            / (src.len() as f32).sqrt();
        assert!(rms < 1e-4, "RMS error {}", rms);
    }

    #[test]
    fn test_adjust_phase() {
        let src = vec![Complex32::new(1.0, 0.0); 8];
        let mut nco = Nco::new(0.0, 0.0);
        nco.adjust_phase(std::f32::consts::FRAC_PI_2);
        let mut dst = vec![Complex32::default(); 8];
        nco.mix_into(&mut dst, &src);
        for d in &dst {
            assert!((d - Complex32::new(0.0, 1.0)).norm() < 1e-4);
        }
    }

    #[test]
    fn test_fft_shift_integer_time_shift() {
        // fft_shift(FFT(x), -t, 0, 0) must equal FFT(x delayed by t
        // samples, circularly) for integer t.
        let len = 256;
        let x = tone(len, 9.0);
        for &t in &[1usize, 5, 100] {
            let mut fft = Fft::forward(len);
            let mut shifted_spec = x.clone();
            fft.process(&mut shifted_spec);
            fft_shift(&mut shifted_spec, -(t as f32), 0.0, 0);

            let delayed: Vec<Complex32> =
                (0..len).map(|i| x[(i + len - t) % len]).collect();
            let mut delayed_spec = delayed;
            fft.process(&mut delayed_spec);

            for (a, b) in shifted_spec.iter().zip(delayed_spec.iter()) {
                assert!(
                    (a - b).norm() < 1e-2,
                    "t={}: {} vs {}",
                    t,
                    a,
                    b
                );
            }
        }
    }

    #[test]
    fn test_fft_shift_carrier_offset_moves_split() {
        // With a carrier offset the split between positive and negative
        // frequencies moves; the two halves still get a consistent ramp.
        let len = 64;
        let src = vec![Complex32::new(1.0, 0.0); len];
        let mut a = src.clone();
        fft_shift(&mut a, 0.5, 0.0, -4);
        let mut b = src.clone();
        fft_shift(&mut b, 0.5, 0.0, 0);
        // Bins below the lower split match; bins between the two splits
        // differ by the negative-frequency phase fix.
        let split_a = (len + 1) / 2 - 4;
        for i in 0..split_a {
            assert!((a[i] - b[i]).norm() < 1e-5);
        }
        let fix = Complex32::from_polar(1.0, -2.0 * std::f32::consts::PI * 0.5);
        for i in split_a..(len + 1) / 2 {
            assert!((a[i] - b[i] * fix).norm() < 1e-4);
        }
    }
}
