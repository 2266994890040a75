//! # scribe-cli
//!
//! Binary entry point for Scribe.
//!
//! This crate provides:
//! - CLI argument parsing using `clap`
//! - `scribe rec`: record a command (or the configured shell) in a PTY
//! - `scribe play`: replay a recorded or still-growing session

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use scribe_adapters::{CaptureLoop, CaptureOptions, Termination, local_session};
use scribe_core::sink::{build_source, build_writer, supports_reading};
use scribe_core::{
    ControlCommand, FieldMatch, LimitAction, PlaybackEngine, PlaybackOptions, PlayerConfig,
    ReaderKind, RecordReader, RecorderConfig, WriterKind,
};
use std::io::{IsTerminal, stdin};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::signal::unix::{SignalKind, signal};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

/// Scribe - terminal session recording and playback
#[derive(Parser, Debug)]
#[command(name = "scribe", version, about)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Record a terminal session
    Rec(RecArgs),

    /// Play back a recorded session
    Play(PlayArgs),
}

/// Arguments for the rec subcommand.
#[derive(Args, Debug)]
struct RecArgs {
    /// Path to a YAML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Sink to write records to (file, journal, syslog)
    #[arg(short, long)]
    writer: Option<WriterKind>,

    /// Output file for the file writer
    #[arg(short = 'o', long)]
    file_path: Option<PathBuf>,

    /// Maximum encoded payload of one record, in bytes
    #[arg(long)]
    payload: Option<usize>,

    /// Coalescing window, in seconds
    #[arg(long)]
    latency: Option<f64>,

    /// Sustained logging rate, in bytes per second
    #[arg(long)]
    limit_rate: Option<u64>,

    /// Logging burst, in bytes
    #[arg(long)]
    limit_burst: Option<u64>,

    /// What to do with I/O above the limit (pass, drop, delay)
    #[arg(long)]
    limit_action: Option<LimitAction>,

    /// Record user input
    #[arg(long, value_name = "BOOL")]
    log_input: Option<bool>,

    /// Record terminal output
    #[arg(long, value_name = "BOOL")]
    log_output: Option<bool>,

    /// Record window size changes
    #[arg(long, value_name = "BOOL")]
    log_window: Option<bool>,

    /// Journal priority (0-7)
    #[arg(long)]
    journal_priority: Option<u8>,

    /// Attach session match fields to journal entries
    #[arg(long, value_name = "BOOL")]
    journal_augment: Option<bool>,

    /// Syslog facility code
    #[arg(long)]
    syslog_facility: Option<u8>,

    /// Syslog priority (0-7)
    #[arg(long)]
    syslog_priority: Option<u8>,

    /// Message shown before recording starts
    #[arg(long)]
    notice: Option<String>,

    /// Print the effective configuration as JSON and exit
    #[arg(long)]
    configuration: bool,

    /// Command to record (defaults to the configured shell)
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    command: Vec<String>,
}

/// Arguments for the play subcommand.
#[derive(Args, Debug)]
struct PlayArgs {
    /// Path to a YAML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Sink to read records from (file, journal)
    #[arg(short, long)]
    reader: Option<ReaderKind>,

    /// Input file for the file reader
    #[arg(short = 'i', long)]
    file_path: Option<PathBuf>,

    /// Journal field match (FIELD=VALUE), repeatable
    #[arg(short = 'M', long = "match")]
    matches: Vec<FieldMatch>,

    /// Session identifier to play
    #[arg(long)]
    rec: Option<String>,

    /// Jump to a position first: start, end, #ID or [[HH:]MM:]SS[.sss]
    #[arg(short, long)]
    goto: Option<String>,

    /// Playback speed multiplier
    #[arg(short, long)]
    speed: Option<f64>,

    /// Keep waiting for new records until the session ends
    #[arg(short, long)]
    follow: bool,

    /// Stay at the end of the recording until quit
    #[arg(short, long)]
    persist: bool,

    /// Poll interval in follow mode, in milliseconds
    #[arg(long)]
    poll_interval: Option<u64>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging; stdout belongs to the recorded terminal
    let default_level = if cli.verbose { "debug" } else { "warn" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .with_writer(std::io::stderr)
        .init();

    let code = match cli.command {
        Commands::Rec(args) => rec_command(args).await?,
        Commands::Play(args) => {
            play_command(args).await?;
            0
        }
    };
    std::process::exit(code);
}

fn load_recorder_config(args: &RecArgs) -> Result<RecorderConfig> {
    let mut config = match &args.config {
        Some(path) => RecorderConfig::from_file(path)
            .with_context(|| format!("Failed to load config from {}", path.display()))?,
        None => RecorderConfig::default(),
    };

    if let Some(writer) = args.writer {
        config.writer = writer;
    }
    if let Some(path) = &args.file_path {
        config.file.path = Some(path.clone());
    }
    if let Some(payload) = args.payload {
        config.payload = payload;
    }
    if let Some(latency) = args.latency {
        config.latency = latency;
    }
    if let Some(rate) = args.limit_rate {
        config.limit.rate = rate;
    }
    if let Some(burst) = args.limit_burst {
        config.limit.burst = burst;
    }
    if let Some(action) = args.limit_action {
        config.limit.action = action;
    }
    if let Some(input) = args.log_input {
        config.log.input = input;
    }
    if let Some(output) = args.log_output {
        config.log.output = output;
    }
    if let Some(window) = args.log_window {
        config.log.window = window;
    }
    if let Some(priority) = args.journal_priority {
        config.journal.priority = priority;
    }
    if let Some(augment) = args.journal_augment {
        config.journal.augment = augment;
    }
    if let Some(facility) = args.syslog_facility {
        config.syslog.facility = facility;
    }
    if let Some(priority) = args.syslog_priority {
        config.syslog.priority = priority;
    }
    if let Some(notice) = &args.notice {
        config.notice = Some(notice.clone());
    }
    Ok(config)
}

async fn rec_command(args: RecArgs) -> Result<i32> {
    use crossterm::terminal::{disable_raw_mode, enable_raw_mode};

    let config = load_recorder_config(&args)?;
    if args.configuration {
        println!("{}", serde_json::to_string_pretty(&config)?);
        return Ok(0);
    }
    config.validate().context("Configuration validation failed")?;
    if !supports_reading(config.writer) {
        debug!(writer = %config.writer, "Records written to this sink cannot be played back");
    }

    // Fail on a misconfigured writer before anything is spawned
    let writer = build_writer(&config).context("Failed to create record writer")?;

    let (program, program_args) = match args.command.split_first() {
        Some((program, rest)) => (program.clone(), rest.to_vec()),
        None => (config.shell.clone(), Vec::new()),
    };

    let interactive = stdin().is_terminal();
    let mut options = CaptureOptions::interactive(program, program_args);
    options.follow_resize = interactive;
    let session = local_session(&options.term);

    if let Some(notice) = &config.notice {
        println!("{notice}");
    }

    let (interrupt_tx, interrupt_rx) = watch::channel(false);
    spawn_signal_forwarder(SignalKind::terminate(), "SIGTERM", interrupt_tx.clone());
    spawn_signal_forwarder(SignalKind::hangup(), "SIGHUP", interrupt_tx.clone());
    if !interactive {
        // In raw mode Ctrl+C reaches the child as input instead
        spawn_signal_forwarder(SignalKind::interrupt(), "SIGINT", interrupt_tx.clone());
    }

    if interactive {
        enable_raw_mode().context("Failed to enable raw mode")?;
    }
    // Use scopeguard to ensure raw mode is restored on any exit path
    let guard = scopeguard::guard(interactive, |interactive| {
        if interactive {
            let _ = disable_raw_mode();
        }
    });

    let result = CaptureLoop::new(config, options)
        .run(session, writer, interrupt_rx)
        .await;
    drop(guard);
    drop(interrupt_tx);

    let outcome = result.context("Recording failed")?;
    info!(
        rec = %outcome.rec,
        exit_code = ?outcome.exit_code,
        written = outcome.dispatch.written,
        "Session recorded"
    );
    if outcome.capture.dropped > 0 {
        warn!(
            dropped = outcome.capture.dropped,
            "Output above the rate limit was not recorded"
        );
    }

    Ok(match (outcome.termination, outcome.exit_code) {
        (_, Some(code)) => code,
        (Termination::Interrupted, None) => 130,
        (Termination::Natural, None) => 1,
    })
}

fn load_player_config(args: &PlayArgs) -> Result<PlayerConfig> {
    let mut config = match &args.config {
        Some(path) => PlayerConfig::from_file(path)
            .with_context(|| format!("Failed to load config from {}", path.display()))?,
        None => PlayerConfig::default(),
    };

    if let Some(reader) = args.reader {
        config.reader = reader;
    }
    if let Some(path) = &args.file_path {
        config.file.path = Some(path.clone());
    }
    config
        .journal
        .matches
        .extend(args.matches.iter().map(ToString::to_string));
    if let Some(rec) = &args.rec {
        config.rec = Some(rec.clone());
    }
    if let Some(goto) = &args.goto {
        config.goto = Some(goto.clone());
    }
    if let Some(speed) = args.speed {
        config.speed = speed;
    }
    if args.follow {
        config.follow = true;
    }
    if args.persist {
        config.persist = true;
    }
    if let Some(interval) = args.poll_interval {
        config.poll_interval_ms = interval;
    }
    Ok(config)
}

async fn play_command(args: PlayArgs) -> Result<()> {
    use crossterm::terminal::{disable_raw_mode, enable_raw_mode};

    let config = load_player_config(&args)?;
    config.validate().context("Configuration validation failed")?;

    let options = PlaybackOptions::from_config(&config).context("Invalid playback options")?;
    let source = build_source(&config).context("Failed to create record source")?;
    let reader = RecordReader::new(source, config.filter()?, config.retry);

    let (cancel_tx, cancel_rx) = watch::channel(false);
    spawn_signal_forwarder(SignalKind::terminate(), "SIGTERM", cancel_tx.clone());
    spawn_signal_forwarder(SignalKind::hangup(), "SIGHUP", cancel_tx.clone());

    let interactive = stdin().is_terminal();
    let (commands_tx, commands_rx) = mpsc::unbounded_channel();
    let shutdown = Arc::new(AtomicBool::new(false));
    let key_thread = if interactive {
        enable_raw_mode().context("Failed to enable raw mode")?;
        Some(spawn_key_reader(commands_tx, Arc::clone(&shutdown)))
    } else {
        // Without a terminal for keys, Ctrl+C quits like `q`
        spawn_signal_forwarder(SignalKind::interrupt(), "SIGINT", cancel_tx.clone());
        drop(commands_tx);
        None
    };
    let guard = scopeguard::guard(interactive, |interactive| {
        if interactive {
            let _ = disable_raw_mode();
        }
    });

    let mut out = std::io::stdout();
    let result = PlaybackEngine::new(options)
        .run(reader, &mut out, commands_rx, cancel_rx)
        .await;

    shutdown.store(true, Ordering::SeqCst);
    if let Some(handle) = key_thread {
        let _ = handle.join();
    }
    drop(guard);
    drop(cancel_tx);

    let summary = result.context("Playback failed")?;
    debug!(
        rendered = summary.rendered,
        skipped = summary.skipped,
        bytes = summary.bytes,
        quit = summary.quit,
        "Playback finished"
    );
    if summary.skipped > 0 {
        warn!(skipped = summary.skipped, "Some records could not be played");
    }
    Ok(())
}

/// Flips `tx` to `true` when the signal arrives.
fn spawn_signal_forwarder(kind: SignalKind, name: &'static str, tx: watch::Sender<bool>) {
    let mut stream = match signal(kind) {
        Ok(stream) => stream,
        Err(e) => {
            warn!(signal = name, error = %e, "Failed to register signal handler");
            return;
        }
    };
    tokio::spawn(async move {
        if stream.recv().await.is_some() {
            warn!(signal = name, "Signal received, stopping");
            let _ = tx.send(true);
        }
    });
}

/// Reads playback keys on a dedicated thread until `shutdown` is set.
fn spawn_key_reader(
    tx: mpsc::UnboundedSender<ControlCommand>,
    shutdown: Arc<AtomicBool>,
) -> std::thread::JoinHandle<()> {
    use crossterm::event::{self, Event};

    std::thread::spawn(move || {
        while !shutdown.load(Ordering::SeqCst) {
            match event::poll(Duration::from_millis(100)) {
                Ok(true) => {}
                Ok(false) => continue,
                Err(e) => {
                    debug!(error = %e, "Key polling failed");
                    break;
                }
            }
            match event::read() {
                Ok(Event::Key(key)) => {
                    if let Some(command) = ControlCommand::from_key(key)
                        && tx.send(command).is_err()
                    {
                        break;
                    }
                }
                Ok(_) => {}
                Err(e) => {
                    debug!(error = %e, "Key read failed");
                    break;
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rec_overrides_applied() {
        let cli = Cli::try_parse_from([
            "scribe",
            "rec",
            "-w",
            "file",
            "-o",
            "/tmp/s.log",
            "--limit-rate",
            "10",
            "--limit-action",
            "drop",
            "--log-input",
            "true",
            "--",
            "ls",
            "-la",
        ])
        .unwrap();
        let Commands::Rec(args) = cli.command else {
            panic!("expected rec");
        };
        let config = load_recorder_config(&args).unwrap();
        assert_eq!(config.writer, WriterKind::File);
        assert_eq!(config.file.path, Some(PathBuf::from("/tmp/s.log")));
        assert_eq!(config.limit.rate, 10);
        assert_eq!(config.limit.action, LimitAction::Drop);
        assert!(config.log.input);
        assert_eq!(args.command, vec!["ls".to_string(), "-la".to_string()]);
        config.validate().unwrap();
    }

    #[test]
    fn test_unknown_writer_rejected_by_parser() {
        let result = Cli::try_parse_from(["scribe", "rec", "-w", "tape", "true"]);
        assert!(result.is_err());
    }

    #[test]
    fn test_play_overrides_applied() {
        let cli = Cli::try_parse_from([
            "scribe",
            "play",
            "-r",
            "journal",
            "-M",
            "USER=alice",
            "--rec",
            "abc",
            "-g",
            "1:30",
            "-s",
            "2",
            "-f",
        ])
        .unwrap();
        let Commands::Play(args) = cli.command else {
            panic!("expected play");
        };
        let config = load_player_config(&args).unwrap();
        assert_eq!(config.reader, ReaderKind::Journal);
        assert_eq!(config.journal.matches, vec!["USER=alice".to_string()]);
        assert_eq!(config.goto.as_deref(), Some("1:30"));
        assert!(config.follow);
        assert!((config.speed - 2.0).abs() < f64::EPSILON);
        config.validate().unwrap();
        assert_eq!(config.filter().unwrap().to_string(), "rec=abc USER=alice");
    }
}
