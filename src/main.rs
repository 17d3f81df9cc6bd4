use std::io::{self, BufRead, Write};
use std::process::exit;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use log::info;

use photoboard_cal::{
    logging, parse_square_list, AutoDetectParams, Board, CalibrationSession, CancelToken,
    DetectionStrategy, FeedbackCue, Prompter, SerialTransport, SessionConfig,
};

#[derive(Parser, Debug)]
#[command(
    name = "photoboard-cal",
    about = "Calibrate photoresistor occupancy thresholds over serial"
)]
struct Args {
    /// Serial port the board is connected to
    #[arg(short, long, default_value = "/dev/ttyACM0")]
    port: String,
    /// Board baud rate
    #[arg(short, long, default_value_t = 9600)]
    baud_rate: u32,
    /// Comma-separated squares to calibrate (e.g. "a1,c4,d5"); whole board if omitted
    #[arg(short, long)]
    squares: Option<String>,
    /// Snapshots averaged into the baseline
    #[arg(long, default_value_t = 15, value_parser = clap::value_parser!(u32).range(1..))]
    samples: u32,
    /// Delay between baseline snapshots, in milliseconds
    #[arg(long, default_value_t = 50)]
    delay_ms: u64,
    /// Detect placed pieces automatically instead of prompting per group
    #[arg(long)]
    auto: bool,
    /// ADC drop below baseline that counts as a placed piece (auto mode)
    #[arg(long, default_value_t = 50)]
    drop_threshold: u16,
    /// ADC distance from baseline that counts as removed (auto mode)
    #[arg(long, default_value_t = 30)]
    removal_tolerance: u16,
    /// Print the per-channel thresholds as a firmware source array
    #[arg(long)]
    print_array: bool,
    /// Print the calibration report as JSON
    #[arg(long)]
    report: bool,
}

/// Blocks on stdin for each confirmation.
struct StdinPrompter;

impl Prompter for StdinPrompter {
    fn confirm(&mut self, message: &str) -> io::Result<()> {
        print!("{message} ");
        io::stdout().flush()?;
        let mut line = String::new();
        io::stdin().lock().read_line(&mut line)?;
        Ok(())
    }
}

/// Rings the terminal bell after each capture.
struct TerminalBell;

impl FeedbackCue for TerminalBell {
    fn capture_complete(&mut self) {
        print!("\x07");
        let _ = io::stdout().flush();
    }
}

fn main() {
    logging::init();
    if let Err(e) = run() {
        eprintln!("Error: {e}");
        exit(1);
    }
}

fn run() -> Result<()> {
    let args = Args::parse();

    let restrict = match &args.squares {
        Some(raw) => parse_square_list(raw)?,
        None => Vec::new(),
    };
    let strategy = if args.auto {
        DetectionStrategy::Auto(AutoDetectParams {
            drop_threshold: args.drop_threshold,
            removal_tolerance: args.removal_tolerance,
            ..AutoDetectParams::default()
        })
    } else {
        DetectionStrategy::Manual
    };
    let config = SessionConfig {
        samples: args.samples,
        sample_delay: Duration::from_millis(args.delay_ms),
        restrict,
        strategy,
    };

    info!("connecting to board on {} at {} baud", args.port, args.baud_rate);
    let transport = SerialTransport::open(&args.port, args.baud_rate)
        .with_context(|| format!("could not open port {}", args.port))?;
    let board = Board::new(transport);

    let mut prompter = StdinPrompter;
    let mut cue = TerminalBell;
    let mut session =
        CalibrationSession::new(board, config, CancelToken::new(), &mut prompter, &mut cue);
    let report = session.run()?;

    println!("\nCalibration complete.");
    if let Some(global) = report.global {
        println!("Global threshold: {global}");
    }
    if args.print_array {
        print_firmware_array(&report.thresholds);
    }
    if args.report {
        println!("{}", serde_json::to_string_pretty(&report)?);
    }
    Ok(())
}

/// Render the thresholds as a C array for pasting into firmware sources.
fn print_firmware_array(thresholds: &[u16]) {
    println!("unsigned short THRESHOLD[64] = {{");
    for rank in 1..=8usize {
        let row = thresholds[(rank - 1) * 8..rank * 8]
            .iter()
            .map(|t| format!("{t:4}"))
            .collect::<Vec<_>>()
            .join(", ");
        println!("  {row}, // A{rank}-H{rank}");
    }
    println!("}};");
}
