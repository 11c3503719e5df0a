// Copyright 2025-2026 CEMAXECUTER LLC

//! Matched-filter beacon detection.
//!
//! The detector cross-correlates the frequency-domain representation of a
//! synced block against a known pulse template and reports the strongest
//! correlation lag with sub-sample resolution. Only lags that fall into
//! the block's fresh (non-history) samples are searched, so a pulse is
//! reported exactly once even though consecutive blocks overlap.

use std::fs::File;
use std::io::{self, BufRead, BufReader};
use std::path::Path;

use num_complex::Complex32;

use crate::fft::Fft;

/// Number of lags around the peak excluded from the noise estimate.
const PEAK_GUARD: usize = 3;

/// Result of one correlation pass.
#[derive(Debug, Clone, Copy)]
pub struct CorrDetection {
    pub detected: bool,
    /// Lag of the correlation peak within the block.
    pub peak_idx: usize,
    /// Sub-sample offset of the true peak, in (-0.5, 0.5).
    pub peak_offset: f32,
    pub peak_power: f32,
    pub noise_power: f32,
}

/// Matched-filter correlation detector for the beacon template.
pub struct CorrDetector {
    /// Conjugated template spectrum, pre-scaled by 1/N.
    template_fft: Vec<Complex32>,
    ifft: Fft,
    corr: Vec<Complex32>,
    power: Vec<f32>,
    /// Number of lags searched: the block's fresh samples only.
    corr_len: usize,
    thresh_const: f32,
    thresh_snr: f32,
}

impl CorrDetector {
    pub fn new(
        template: &[f32],
        block_len: usize,
        history_len: usize,
        thresh_const: f32,
        thresh_snr: f32,
    ) -> Self {
        assert!(!template.is_empty(), "empty correlation template");
        assert!(
            template.len() <= block_len,
            "template length {} exceeds block length {}",
            template.len(),
            block_len
        );
        assert!(history_len < block_len);

        let mut template_fft: Vec<Complex32> = template
            .iter()
            .map(|&t| Complex32::new(t, 0.0))
            .chain(std::iter::repeat(Complex32::new(0.0, 0.0)))
            .take(block_len)
            .collect();
        Fft::forward(block_len).process(&mut template_fft);
        let scale = 1.0 / block_len as f32;
        for t in template_fft.iter_mut() {
            *t = t.conj() * scale;
        }

        Self {
            template_fft,
            ifft: Fft::inverse(block_len),
            corr: vec![Complex32::new(0.0, 0.0); block_len],
            power: vec![0.0; block_len],
            corr_len: block_len - history_len + 1,
            thresh_const,
            thresh_snr,
        }
    }

    /// Correlate one block (given as its forward FFT) against the
    /// template.
    ///
    /// `signal_energy` is accepted for interface compatibility and not
    /// used by the threshold computation.
    pub fn detect(&mut self, block_fft: &[Complex32], signal_energy: f32) -> CorrDetection {
        let _ = signal_energy;
        let n = self.corr.len();
        assert_eq!(block_fft.len(), n);

        for ((c, &x), &t) in self
            .corr
            .iter_mut()
            .zip(block_fft.iter())
            .zip(self.template_fft.iter())
        {
            *c = x * t;
        }
        self.ifft.process(&mut self.corr);
        for (p, c) in self.power.iter_mut().zip(self.corr.iter()) {
            *p = c.norm_sqr();
        }

        let mut peak_idx = 0usize;
        let mut peak_power = f32::MIN;
        for (idx, &p) in self.power[..self.corr_len].iter().enumerate() {
            if p > peak_power {
                peak_power = p;
                peak_idx = idx;
            }
        }

        // Mean correlation power over the searched lags, leaving out the
        // peak and a small guard region around it.
        let mut noise_sum = 0.0f32;
        let mut noise_count = 0usize;
        for (idx, &p) in self.power[..self.corr_len].iter().enumerate() {
            let dist = idx.abs_diff(peak_idx);
            if dist > PEAK_GUARD {
                noise_sum += p;
                noise_count += 1;
            }
        }
        let noise_power = if noise_count > 0 {
            noise_sum / noise_count as f32
        } else {
            0.0
        };

        let triplet = [
            self.power[(peak_idx + n - 1) % n],
            self.power[peak_idx],
            self.power[(peak_idx + 1) % n],
        ];
        let peak_offset = interpolate_parabolic(&triplet);

        let detected = peak_power > self.thresh_const + self.thresh_snr * noise_power;

        CorrDetection {
            detected,
            peak_idx,
            peak_offset,
            peak_power,
            noise_power,
        }
    }
}

/// Fractional peak position from a power triplet `[y(-1), y(0), y(+1)]`.
///
/// Exact for quadratic profiles; returns 0 when the curvature vanishes.
pub fn interpolate_parabolic(power: &[f32; 3]) -> f32 {
    let denom = power[0] - 2.0 * power[1] + power[2];
    if denom == 0.0 {
        0.0
    } else {
        0.5 * (power[0] - power[2]) / denom
    }
}

/// Load a beacon template: one real sample per line, `#` comments and
/// blank lines ignored.
pub fn load_template<P: AsRef<Path>>(path: P) -> io::Result<Vec<f32>> {
    let path = path.as_ref();
    let file = File::open(path)?;
    let reader = BufReader::new(file);
    let mut samples = Vec::new();
    for (lineno, line) in reader.lines().enumerate() {
        let line = line?;
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        let value: f32 = trimmed.parse().map_err(|_| {
            io::Error::new(
                io::ErrorKind::InvalidData,
                format!("{}:{}: invalid template sample", path.display(), lineno + 1),
            )
        })?;
        samples.push(value);
    }
    if samples.is_empty() {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("{}: template contains no samples", path.display()),
        ));
    }
    Ok(samples)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fft_of(samples: &[Complex32]) -> Vec<Complex32> {
        let mut buf = samples.to_vec();
        Fft::forward(samples.len()).process(&mut buf);
        buf
    }

    /// Pseudo-random +/-1 sequence (xorshift), zero-ish mean.
    fn prbs(len: usize, mut seed: u32) -> Vec<f32> {
        (0..len)
            .map(|_| {
                seed ^= seed << 13;
                seed ^= seed >> 17;
                seed ^= seed << 5;
                if seed & 1 == 0 {
                    1.0
                } else {
                    -1.0
                }
            })
            .collect()
    }

    #[test]
    fn test_parabolic_exact_on_quadratic() {
        for &x0 in &[-0.4f32, -0.1, 0.0, 0.2, 0.45] {
            let y = |x: f32| -2.0 * (x - x0) * (x - x0) + 5.0;
            let got = interpolate_parabolic(&[y(-1.0), y(0.0), y(1.0)]);
            assert!((got - x0).abs() < 1e-5, "x0={}: got {}", x0, got);
        }
    }

    #[test]
    fn test_parabolic_flat_triplet() {
        assert_eq!(interpolate_parabolic(&[1.0, 1.0, 1.0]), 0.0);
    }

    #[test]
    fn test_detects_embedded_template() {
        let block_len = 4096;
        let history_len = 1024;
        let template = prbs(512, 0xdead_beef);

        let pos = 1000;
        let mut block = vec![Complex32::new(0.0, 0.0); block_len];
        for (i, &t) in template.iter().enumerate() {
            block[pos + i] = Complex32::new(3.0 * t, 0.0);
        }

        let mut det = CorrDetector::new(&template, block_len, history_len, 0.0, 15.0);
        let corr = det.detect(&fft_of(&block), 0.0);
        assert!(corr.detected);
        assert_eq!(corr.peak_idx, pos);
        assert!(corr.peak_offset.abs() < 0.5);
        assert!(corr.peak_power > corr.noise_power * 15.0);
    }

    #[test]
    fn test_rotated_template_still_detected() {
        // The beacon arrives with an arbitrary carrier phase; correlation
        // power must not depend on it.
        let block_len = 4096;
        let template = prbs(512, 0x1234_5678);
        let rot = Complex32::from_polar(3.0, 1.1);

        let pos = 700;
        let mut block = vec![Complex32::new(0.0, 0.0); block_len];
        for (i, &t) in template.iter().enumerate() {
            block[pos + i] = rot * t;
        }

        let mut det = CorrDetector::new(&template, block_len, 1024, 0.0, 15.0);
        let corr = det.detect(&fft_of(&block), 0.0);
        assert!(corr.detected);
        assert_eq!(corr.peak_idx, pos);
    }

    #[test]
    fn test_peak_outside_fresh_samples_ignored() {
        // corr_len = block_len - history_len + 1; a pulse whose start lag
        // lies in the history tail must not be reported.
        let block_len = 4096;
        let history_len = 1024;
        let template = prbs(256, 0xcafe_f00d);

        let pos = block_len - history_len + 200;
        let mut block = vec![Complex32::new(0.0, 0.0); block_len];
        for (i, &t) in template.iter().enumerate() {
            block[(pos + i) % block_len] = Complex32::new(3.0 * t, 0.0);
        }

        // Constant threshold: most lags of this noise-free block are
        // exactly zero, which makes an SNR threshold degenerate.
        let mut det = CorrDetector::new(&template, block_len, history_len, 1e6, 0.0);
        let corr = det.detect(&fft_of(&block), 0.0);
        assert!(corr.peak_idx < block_len - history_len + 1);
        // Only partial-overlap sidelobes fall inside the searched lags;
        // the true peak power for this pulse would be (3 * 256)^2.
        assert!(corr.peak_power < 1e5);
        assert!(!corr.detected);
    }

    #[test]
    fn test_fractional_offset_recovered() {
        // A smooth pulse sampled off-grid: the parabolic interpolation
        // should place the peak between samples, on the right side.
        let block_len = 2048;
        let width = 6.0f32;
        let pulse = |center: f32, i: usize| {
            let d = (i as f32 - center) / width;
            (-d * d).exp()
        };
        let template: Vec<f32> = (0..64).map(|i| pulse(32.0, i)).collect();

        let frac = 0.3f32;
        let pos = 500usize;
        let mut block = vec![Complex32::new(0.0, 0.0); block_len];
        for i in 0..64 {
            block[pos + i] = Complex32::new(pulse(32.0 + frac, i), 0.0);
        }

        let mut det = CorrDetector::new(&template, block_len, 512, 0.0, 5.0);
        let corr = det.detect(&fft_of(&block), 0.0);
        assert!(corr.detected);
        assert_eq!(corr.peak_idx, pos);
        assert!(
            (corr.peak_offset - frac).abs() < 0.2,
            "offset {} vs {}",
            corr.peak_offset,
            frac
        );
    }

    #[test]
    fn test_load_template() {
        let path = std::env::temp_dir().join(format!(
            "corx-template-test-{}.tpl",
            std::process::id()
        ));
        std::fs::write(&path, "# beacon template\n1.0\n-0.5\n\n0.25\n").unwrap();
        let template = load_template(&path).unwrap();
        std::fs::remove_file(&path).unwrap();
        assert_eq!(template, vec![1.0, -0.5, 0.25]);
    }

    #[test]
    fn test_load_template_rejects_garbage() {
        let path = std::env::temp_dir().join(format!(
            "corx-template-bad-{}.tpl",
            std::process::id()
        ));
        std::fs::write(&path, "1.0\nnot-a-number\n").unwrap();
        let result = load_template(&path);
        std::fs::remove_file(&path).unwrap();
        assert!(result.is_err());
    }
}
