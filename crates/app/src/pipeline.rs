use std::fs::File;
use std::io::{self, BufWriter, Write};

use log::{info, warn};

use corx_dsp::carrier::{CarrierDetector, Threshold};
use corx_dsp::correlate::{load_template, CorrDetector};
use corx_output::corx::CorxWriter;
use corx_sdr::blocks::BlockReader;
use corx_sdr::file::{FileSource, SampleFormat};
use corx_sdr::SampleSource;

use crate::error::RxError;
use crate::receiver::{Receiver, ReceiverConfig};
use crate::Cli;

/// Build the full pipeline from the CLI arguments and run it to
/// completion.
pub fn run(cli: &Cli) -> Result<(), RxError> {
    let (corr_const, corr_snr) = parse_threshold(&cli.corr_threshold).map_err(RxError::Config)?;
    let (carrier_const, carrier_snr) =
        parse_threshold(&cli.carrier_threshold).map_err(RxError::Config)?;
    let carrier_window = match &cli.carrier_window {
        Some(spec) => Some(parse_window(spec).map_err(RxError::Config)?),
        None => None,
    };

    let template = load_template(&cli.template)
        .map_err(|e| RxError::Config(format!("template: {}", e)))?;
    if template.len() > cli.block_len {
        return Err(RxError::Config(format!(
            "template length {} exceeds block length {}",
            template.len(),
            cli.block_len
        )));
    }
    info!(
        "loaded template {} ({} samples)",
        cli.template,
        template.len()
    );

    let source = build_source(cli)?;
    let reader =
        BlockReader::new(source, cli.block_len, cli.history_len).map_err(RxError::Config)?;
    let carrier_det = CarrierDetector::new(
        cli.block_len,
        carrier_window,
        Threshold::new(carrier_const, carrier_snr),
    );
    let corr_det = CorrDetector::new(
        &template,
        cli.block_len,
        cli.history_len,
        corr_const,
        corr_snr,
    );

    let sink: Option<Box<dyn Write>> = match cli.output.as_deref() {
        None => None,
        Some("-") => Some(Box::new(io::stdout())),
        Some(path) => {
            let file = File::create(path).map_err(RxError::Format)?;
            Some(Box::new(BufWriter::new(file)))
        }
    };
    if sink.is_none() {
        info!("no output file; detections will only be logged");
    }
    let writer = CorxWriter::new(sink);

    let cfg = ReceiverConfig {
        corr_size: cli.corr_size,
        skip_beacon_padding: cli.beacon_padding,
        carrier_ref: cli.carrier_ref,
        skip_blocks: cli.skip,
        slice_start: cli.slice_start,
        slice_len: cli.slice_len,
        ..ReceiverConfig::default()
    };

    if cli.rxid >= 0 {
        info!("receiver id: {}", cli.rxid);
    }

    let mut rx = Receiver::new(cfg, reader, carrier_det, corr_det, writer)?;

    // INT and TERM only flip the cancel flag; the pipeline drains and
    // closes the trace on its own thread.
    let cancel = rx.cancel_token();
    if let Err(e) = ctrlc::set_handler(move || cancel.cancel()) {
        warn!("failed to install signal handler: {}", e);
    }

    rx.start()?;
    let result = rx.run();

    info!(
        "capture finished at block #{}: last beacon #{} (soa {:.0}), \
         clock error {:.3} ppm, {} cycles written, {} tracking losses",
        rx.block_index(),
        rx.beacon_count(),
        rx.soa(),
        rx.clock_error() * 1e6,
        rx.writer().cycles_stopped(),
        rx.tracking_losses()
    );

    result
}

fn build_source(cli: &Cli) -> Result<Box<dyn SampleSource>, RxError> {
    if cli.input == "rtlsdr" {
        #[cfg(feature = "rtlsdr")]
        {
            let config = corx_sdr::rtlsdr::RtlSdrConfig {
                device_index: cli.device_index,
                center_freq: cli.freq,
                sample_rate: cli.sample_rate,
                gain: cli.gain,
            };
            return Ok(Box::new(corx_sdr::rtlsdr::RtlSdrSource::new(config)));
        }
        #[cfg(not(feature = "rtlsdr"))]
        {
            return Err(RxError::Config(
                "RTL-SDR support not compiled in (rebuild with --features rtlsdr)".into(),
            ));
        }
    }

    let format = parse_format(&cli.format).map_err(RxError::Config)?;
    Ok(Box::new(FileSource::new(
        cli.input.clone(),
        format,
        cli.sample_rate,
        cli.freq as u64,
    )))
}

fn parse_format(s: &str) -> Result<SampleFormat, String> {
    match s {
        "cu8" => Ok(SampleFormat::Cu8),
        "cs16" => Ok(SampleFormat::Cs16),
        "cf32" => Ok(SampleFormat::Cf32),
        other => Err(format!(
            "unknown sample format: {} (use cu8, cs16 or cf32)",
            other
        )),
    }
}

/// Parse a detection threshold of the form `<constant>c<snr>s`, where
/// both parts are optional: `15s`, `100c`, `100c2s`. A bare number is a
/// constant threshold.
pub fn parse_threshold(spec: &str) -> Result<(f32, f32), String> {
    let mut constant = 0.0f32;
    let mut snr = 0.0f32;
    let mut rest = spec.trim();
    if rest.is_empty() {
        return Err("empty threshold".into());
    }
    while !rest.is_empty() {
        let end = rest
            .find(|c: char| c == 'c' || c == 's')
            .unwrap_or(rest.len());
        let value: f32 = rest[..end]
            .parse()
            .map_err(|_| format!("invalid threshold: {}", spec))?;
        match rest.as_bytes().get(end) {
            Some(b'c') => constant = value,
            Some(b's') => snr = value,
            None => constant = value,
            _ => unreachable!(),
        }
        rest = &rest[(end + 1).min(rest.len())..];
    }
    Ok((constant, snr))
}

/// Parse a signed bin range `lo:hi`.
pub fn parse_window(spec: &str) -> Result<(i32, i32), String> {
    let (lo, hi) = spec
        .split_once(':')
        .ok_or_else(|| format!("invalid window: {} (expected lo:hi)", spec))?;
    let lo: i32 = lo
        .trim()
        .parse()
        .map_err(|_| format!("invalid window bound: {}", spec))?;
    let hi: i32 = hi
        .trim()
        .parse()
        .map_err(|_| format!("invalid window bound: {}", spec))?;
    if lo > hi {
        return Err(format!("empty window: {}", spec));
    }
    Ok((lo, hi))
}
