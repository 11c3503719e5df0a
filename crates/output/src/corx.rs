// Copyright 2025-2026 CEMAXECUTER LLC

//! Append-only writer for the `.corx` trace format.
//!
//! Layout (little-endian, packed):
//!
//! ```text
//! "CORX"            4 B   magic
//! version           1 B   0x01
//! slice_start_idx   u16
//! slice_size        u16
//! then per beacon cycle:
//!   CorxBeaconHeader
//!   repeated { phase_error: i8, samples: complex<f32>[slice_size] }
//!   phase_error -128 terminates the cycle (no samples follow)
//! ```

use std::io::{self, Write};

use byteorder::{LittleEndian, WriteBytesExt};
use num_complex::Complex32;

const CORX_MAGIC: &[u8; 4] = b"CORX";
const CORX_VERSION: u8 = 0x01;

/// Phase-error sentinel marking the end of a cycle.
pub const END_OF_CYCLE: i8 = -128;

/// Trace-level header: which FFT-bin sub-range of each correlation block
/// is written.
#[derive(Debug, Clone, Copy)]
pub struct CorxFileHeader {
    pub slice_start_idx: u16,
    pub slice_size: u16,
}

/// Per-beacon header preceding a run of correlation blocks.
#[derive(Debug, Clone, Copy)]
pub struct CorxBeaconHeader {
    /// Beacon sample-of-arrival, fractional samples from stream origin.
    pub soa: f64,
    pub timestamp_sec: u64,
    pub timestamp_msec: u16,
    pub beacon_amplitude: u32,
    pub beacon_noise: u32,
    pub clock_error: f32,
    pub carrier_pos: f32,
    pub carrier_amplitude: u32,
    pub preamp_on: bool,
}

/// Writer for `.corx` traces.
///
/// Constructed with `None` it becomes a void writer: every operation is
/// accepted and silently dropped, but cycle bookkeeping still runs so the
/// pipeline behaves identically with and without an output file.
pub struct CorxWriter<W: Write> {
    out: Option<W>,
    slice_size: u16,
    cycle_open: bool,
    cycles_started: u64,
    cycles_stopped: u64,
}

impl<W: Write> CorxWriter<W> {
    pub fn new(out: Option<W>) -> Self {
        Self {
            out,
            slice_size: 0,
            cycle_open: false,
            cycles_started: 0,
            cycles_stopped: 0,
        }
    }

    pub fn is_void(&self) -> bool {
        self.out.is_none()
    }

    pub fn cycle_open(&self) -> bool {
        self.cycle_open
    }

    pub fn cycles_started(&self) -> u64 {
        self.cycles_started
    }

    pub fn cycles_stopped(&self) -> u64 {
        self.cycles_stopped
    }

    /// Write the file signature, format version and trace header.
    /// Must be called exactly once, before any other write.
    pub fn write_file_header(&mut self, header: &CorxFileHeader) -> io::Result<()> {
        self.slice_size = header.slice_size;
        let Some(out) = self.out.as_mut() else {
            return Ok(());
        };
        out.write_all(CORX_MAGIC)?;
        out.write_u8(CORX_VERSION)?;
        out.write_u16::<LittleEndian>(header.slice_start_idx)?;
        out.write_u16::<LittleEndian>(header.slice_size)?;
        Ok(())
    }

    /// Open a new beacon cycle.
    pub fn write_cycle_start(&mut self, header: &CorxBeaconHeader) -> io::Result<()> {
        self.cycle_open = true;
        self.cycles_started += 1;
        let Some(out) = self.out.as_mut() else {
            return Ok(());
        };
        out.write_f64::<LittleEndian>(header.soa)?;
        out.write_u64::<LittleEndian>(header.timestamp_sec)?;
        out.write_u16::<LittleEndian>(header.timestamp_msec)?;
        out.write_u32::<LittleEndian>(header.beacon_amplitude)?;
        out.write_u32::<LittleEndian>(header.beacon_noise)?;
        out.write_f32::<LittleEndian>(header.clock_error)?;
        out.write_f32::<LittleEndian>(header.carrier_pos)?;
        out.write_u32::<LittleEndian>(header.carrier_amplitude)?;
        out.write_u8(header.preamp_on as u8)?;
        Ok(())
    }

    /// Write one correlation-block record.
    pub fn write_cycle_block(&mut self, phase_error: i8, data: &[Complex32]) -> io::Result<()> {
        assert_ne!(phase_error, END_OF_CYCLE, "-128 is reserved for the cycle terminator");
        assert_eq!(
            data.len(),
            self.slice_size as usize,
            "cycle block length {} != slice size {}",
            data.len(),
            self.slice_size
        );
        let Some(out) = self.out.as_mut() else {
            return Ok(());
        };
        out.write_i8(phase_error)?;
        for sample in data {
            out.write_f32::<LittleEndian>(sample.re)?;
            out.write_f32::<LittleEndian>(sample.im)?;
        }
        Ok(())
    }

    /// Close the current cycle.
    pub fn write_cycle_stop(&mut self) -> io::Result<()> {
        self.cycle_open = false;
        self.cycles_stopped += 1;
        let Some(out) = self.out.as_mut() else {
            return Ok(());
        };
        out.write_i8(END_OF_CYCLE)?;
        Ok(())
    }

    pub fn flush(&mut self) -> io::Result<()> {
        match self.out.as_mut() {
            Some(out) => out.flush(),
            None => Ok(()),
        }
    }

    /// Get the inner writer, if any.
    pub fn into_inner(self) -> Option<W> {
        self.out
    }
}
