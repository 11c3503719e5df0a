use std::sync::Arc;

use num_complex::Complex32;
use rustfft::FftPlanner;

/// Planned FFT with a reusable scratch buffer.
///
/// The receiver runs the same two transform sizes (block length and
/// correlation length) on every block, so the plan and scratch are
/// allocated once and reused for every call.
pub struct Fft {
    fft: Arc<dyn rustfft::Fft<f32>>,
    size: usize,
    scratch: Vec<Complex32>,
}

impl Fft {
    /// Plan a forward FFT of the given size.
    pub fn forward(size: usize) -> Self {
        let mut planner = FftPlanner::new();
        let fft = planner.plan_fft_forward(size);
        let scratch_len = fft.get_inplace_scratch_len();
        Self {
            fft,
            size,
            scratch: vec![Complex32::new(0.0, 0.0); scratch_len],
        }
    }

    /// Plan an inverse FFT of the given size. Output is unnormalised;
    /// rustfft leaves the 1/N scaling to the caller.
    pub fn inverse(size: usize) -> Self {
        let mut planner = FftPlanner::new();
        let fft = planner.plan_fft_inverse(size);
        let scratch_len = fft.get_inplace_scratch_len();
        Self {
            fft,
            size,
            scratch: vec![Complex32::new(0.0, 0.0); scratch_len],
        }
    }

    /// Transform a buffer of exactly `size` complex samples in place.
    pub fn process(&mut self, buffer: &mut [Complex32]) {
        assert_eq!(
            buffer.len(),
            self.size,
            "buffer length {} != FFT size {}",
            buffer.len(),
            self.size
        );
        self.fft.process_with_scratch(buffer, &mut self.scratch);
    }

    pub fn size(&self) -> usize {
        self.size
    }
}
