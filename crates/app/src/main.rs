mod error;
mod pipeline;
mod receiver;

use clap::{ArgAction, Parser};

#[derive(Parser, Debug)]
#[command(name = "corx")]
#[command(about = "Beacon-correlation SDR receiver for multi-receiver TDOA capture")]
pub struct Cli {
    /// Output trace file ('-' for stdout) [default: no output]
    #[arg(short = 'o', long)]
    output: Option<String>,

    /// Correlation detection threshold, e.g. 15s or 100c2s
    #[arg(short = 'u', long, default_value = "15s")]
    corr_threshold: String,

    /// Beacon template file
    #[arg(short = 'z', long, default_value = "template.tpl")]
    template: String,

    /// This receiver's unique identifier
    #[arg(short = 'r', long, default_value_t = -1)]
    rxid: i32,

    /// Input: file path, '-' for stdin, or 'rtlsdr'
    #[arg(short = 'i', long, default_value = "rtlsdr")]
    input: String,

    /// Sample format for file input: cu8, cs16, cf32
    #[arg(long, default_value = "cu8")]
    format: String,

    /// Sample rate in Hz
    #[arg(short = 's', long, default_value_t = 2_400_000)]
    sample_rate: u32,

    /// Tuner centre frequency in Hz
    #[arg(short = 'f', long, default_value_t = 433_830_000)]
    freq: u32,

    /// Tuner gain in tenths of dB [default: AGC]
    #[arg(short = 'g', long)]
    gain: Option<i32>,

    /// Samples per block
    #[arg(short = 'b', long, default_value_t = 16384)]
    block_len: usize,

    /// Overlap between consecutive blocks, in samples
    #[arg(long, default_value_t = 4096)]
    history_len: usize,

    /// Carrier detection threshold, e.g. 15s or 100c2s
    #[arg(short = 't', long, default_value = "15s")]
    carrier_threshold: String,

    /// Restrict the carrier search to a signed bin range 'lo:hi'
    #[arg(long)]
    carrier_window: Option<String>,

    /// Expected carrier offset from the tuner centre, in Hz
    #[arg(long, default_value_t = -277_800.0, allow_hyphen_values = true)]
    carrier_ref: f32,

    /// Correlation window length
    #[arg(long, default_value_t = 1024)]
    corr_size: usize,

    /// Samples skipped between a beacon pulse and the first correlation
    /// window
    #[arg(long, default_value_t = 6000)]
    beacon_padding: usize,

    /// Blocks to discard at startup
    #[arg(short = 'k', long, default_value_t = 1)]
    skip: u32,

    /// First FFT bin of each correlation window written to the trace
    #[arg(long, default_value_t = 0)]
    slice_start: usize,

    /// Number of bins written per correlation window [default: all]
    #[arg(long)]
    slice_len: Option<usize>,

    /// RTL-SDR device index
    #[arg(long, default_value_t = 0)]
    device_index: usize,

    /// Verbosity (-v = debug, -vv = trace)
    #[arg(short = 'v', long, action = ArgAction::Count)]
    verbose: u8,
}

fn main() {
    let cli = Cli::parse();

    let level = match cli.verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();

    if let Err(e) = pipeline::run(&cli) {
        log::error!("{}", e);
        std::process::exit(e.exit_code());
    }
}
