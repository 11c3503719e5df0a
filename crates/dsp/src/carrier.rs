use num_complex::Complex32;

use crate::fft::Fft;

/// Detection threshold: a signal passes when its peak power exceeds
/// `constant + snr * noise`.
#[derive(Debug, Clone, Copy, Default)]
pub struct Threshold {
    pub constant: f32,
    pub snr: f32,
}

impl Threshold {
    pub fn new(constant: f32, snr: f32) -> Self {
        Self { constant, snr }
    }
}

/// Result of a carrier-peak search over one block's power spectrum.
#[derive(Debug, Clone, Copy)]
pub struct CarrierDetection {
    pub detected: bool,
    /// FFT bin of the peak (unsigned, zero-frequency at index 0).
    pub argmax: usize,
    pub peak: f32,
    pub noise: f32,
}

/// Carrier-peak detector.
///
/// Computes the power spectrum of a raw IQ block and searches for a
/// dominant narrow-band peak, optionally restricted to a signed bin
/// window. All buffers are allocated up front; `process` does not
/// allocate.
pub struct CarrierDetector {
    fft: Fft,
    buf: Vec<Complex32>,
    power: Vec<f32>,
    /// Signed bin range (inclusive) to search, wrap-aware. None = all bins.
    window: Option<(i32, i32)>,
    threshold: Threshold,
}

impl CarrierDetector {
    pub fn new(block_len: usize, window: Option<(i32, i32)>, threshold: Threshold) -> Self {
        Self {
            fft: Fft::forward(block_len),
            buf: vec![Complex32::new(0.0, 0.0); block_len],
            power: vec![0.0; block_len],
            window,
            threshold,
        }
    }

    /// Run carrier detection on one block of raw samples.
    pub fn process(&mut self, samples: &[Complex32]) -> CarrierDetection {
        let n = self.buf.len();
        assert_eq!(samples.len(), n);
        self.buf.copy_from_slice(samples);
        self.fft.process(&mut self.buf);
        for (p, s) in self.power.iter_mut().zip(self.buf.iter()) {
            *p = s.norm_sqr();
        }

        let mut argmax = 0usize;
        let mut peak = f32::MIN;
        match self.window {
            Some((lo, hi)) => {
                for bin in lo..=hi {
                    let idx = bin.rem_euclid(n as i32) as usize;
                    if self.power[idx] > peak {
                        peak = self.power[idx];
                        argmax = idx;
                    }
                }
            }
            None => {
                for (idx, &p) in self.power.iter().enumerate() {
                    if p > peak {
                        peak = p;
                        argmax = idx;
                    }
                }
            }
        }

        let total: f32 = self.power.iter().sum();
        let noise = if n > 1 {
            (total - peak) / (n - 1) as f32
        } else {
            0.0
        };
        let detected = peak > self.threshold.constant + self.threshold.snr * noise;

        CarrierDetection {
            detected,
            argmax,
            peak,
            noise,
        }
    }

    /// Power spectrum of the most recent block.
    pub fn fft_power(&self) -> &[f32] {
        &self.power
    }

    /// Power triplet `[bin-1, bin, bin+1]` with circular wrap, for
    /// parabolic peak interpolation.
    pub fn power_triplet(&self, bin: usize) -> [f32; 3] {
        let n = self.power.len();
        [
            self.power[(bin + n - 1) % n],
            self.power[bin],
            self.power[(bin + 1) % n],
        ]
    }
}
