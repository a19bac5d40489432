use anyhow::{Context, Result};
use clap::Parser;
use owo_colors::{OwoColorize, Stream};
use std::fs::File;
use std::io::{self, BufRead, BufReader, BufWriter, Write};
use std::path::PathBuf;
use std::process;
use tracing::{error, info, Level};
use tracing_subscriber::FmtSubscriber;

mod error;
mod event;
mod replay;
mod report;

use event::Scanner;
use replay::{Anomaly, Replayer};
use report::Format;

/// Analyse io_buffer allocations from a debug log
///
/// Reads `IOBAlloc <caller> <buffer> <size>` and `IOBFree <caller> <buffer>` lines and
/// reports the buffers still allocated and the call sites holding them.
#[derive(Debug, Parser)]
#[clap(author, version, about, long_about = None)]
struct Args {
    /// Log to read, `-` for stdin
    #[clap(default_value = "-")]
    input: String,
    /// Stop before this line index, negative for no limit
    #[clap(long, default_value_t = -1, allow_hyphen_values = true)]
    limit: i64,
    /// Report encoding: json, pjson or yaml
    #[clap(long, default_value = "pjson")]
    serializer: String,
    /// Remove terminal escape sequences before parsing lines
    #[clap(long)]
    strip_ansi: bool,
    /// Write the report here instead of stdout
    #[clap(short, long)]
    output: Option<PathBuf>,
    /// Don't print double free and unknown free diagnostics
    #[clap(short, long)]
    quiet: bool,
    /// More logging, repeat for more
    #[clap(short, long, parse(from_occurrences))]
    verbose: usize,
}

impl Args {
    fn limit(&self) -> Option<usize> {
        usize::try_from(self.limit).ok()
    }
}

fn log_level(verbose: usize) -> Level {
    match verbose {
        0 => Level::WARN,
        1 => Level::INFO,
        2 => Level::DEBUG,
        _ => Level::TRACE,
    }
}

fn open_input(input: &str) -> Result<Box<dyn BufRead>> {
    if input == "-" {
        return Ok(Box::new(io::stdin().lock()));
    }
    let file = File::open(input).with_context(|| format!("failed to open {input}"))?;
    Ok(Box::new(BufReader::new(file)))
}

fn print_anomalies(anomalies: &[Anomaly]) {
    let stderr = io::stderr();
    let mut stderr = stderr.lock();
    for anomaly in anomalies {
        let line = anomaly.to_string();
        // a closed stderr is not worth failing the report over
        let _ = writeln!(
            stderr,
            "{}",
            line.if_supports_color(Stream::Stderr, |text| text.yellow())
        );
    }
}

fn run(args: &Args) -> Result<()> {
    let format: Format = args.serializer.parse()?;

    let mut scanner = Scanner::new(open_input(&args.input)?).strip_ansi(args.strip_ansi);
    let mut replayer = Replayer::new();
    replayer.replay(scanner.by_ref(), args.limit());
    let lines = scanner
        .finish()
        .with_context(|| format!("failed to read {}", args.input))?;

    if !args.quiet {
        print_anomalies(replayer.anomalies());
    }

    let report = replayer.snapshot();
    let stats = replayer.stats();
    info!(
        "{lines} lines scanned, {} allocations, {} frees, {} anomalies",
        stats.allocations, stats.frees, stats.anomalies
    );
    info!(
        "{} live buffers, {} call sites with outstanding allocations",
        report.status.len(),
        report.callers.len()
    );

    match &args.output {
        Some(path) => {
            let file = File::create(path)
                .with_context(|| format!("failed to create {}", path.display()))?;
            let mut writer = BufWriter::new(file);
            report.write(format, &mut writer)?;
            writer
                .flush()
                .with_context(|| format!("failed to write {}", path.display()))?;
        }
        None => {
            let stdout = io::stdout();
            let mut stdout = stdout.lock();
            report.write(format, &mut stdout)?;
            stdout.flush()?;
        }
    }
    Ok(())
}

/// Logs a failed run and returns the exit status for it.
fn failure_status(err: &anyhow::Error) -> i32 {
    error!("{err:#}");
    1
}

fn main() {
    let args = Args::parse();

    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level(args.verbose))
        .with_writer(io::stderr)
        .finish();
    if tracing::subscriber::set_global_default(subscriber).is_err() {
        eprintln!("a global tracing subscriber is already installed");
    }

    if let Err(err) = run(&args) {
        process::exit(failure_status(&err));
    }
}
