//! PTY capture loop.
//!
//! Runs a command in a pseudo-terminal, mirrors its output to the user,
//! forwards user input to it and records both through a
//! [`CapturePipeline`] into a [`Dispatcher`].
//!
//! Architecture:
//! - A dedicated thread performs blocking PTY reads and stamps every chunk
//!   with its arrival instant before sending it over a bounded channel, so a
//!   stalled capture path (the `delay` policy) back-pressures the child
//! - A second thread reads stdin and forwards it to the PTY via the loop
//! - `tokio::select!` multiplexes output, input, SIGWINCH, latency
//!   deadlines, writer failure and interrupts

// Exit codes and PIDs are always within i32 range in practice
#![allow(clippy::cast_possible_wrap)]

use crate::pipeline::{CapturePipeline, CaptureStats, Ingest};
use nix::sys::signal::{Signal, kill};
use nix::unistd::Pid;
use portable_pty::{Child, CommandBuilder, PtyPair, PtySize, native_pty_system};
use scribe_core::{DispatchStats, Dispatcher, RecordWriter, RecorderConfig};
use scribe_proto::{Error, Record, Result, SessionContext, Stream};
use std::io::{self, Read, Write};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::signal::unix::{SignalKind, signal};
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

const DEFAULT_SIZE: (u16, u16) = (80, 24);
const EXIT_POLL: Duration = Duration::from_millis(100);
const GRACE_PERIOD: Duration = Duration::from_secs(2);
const EXIT_CHECK: Duration = Duration::from_millis(50);

/// What to run and how the terminal is attached.
#[derive(Debug, Clone)]
pub struct CaptureOptions {
    pub program: String,
    pub args: Vec<String>,

    /// `TERM` passed to the child and stamped on every record.
    pub term: String,

    /// Initial `(cols, rows)`. `None` queries the controlling terminal.
    pub size: Option<(u16, u16)>,

    /// Forward stdin to the child.
    pub forward_input: bool,

    /// Copy child output to stdout.
    pub echo_output: bool,

    /// Follow SIGWINCH and resize the PTY.
    pub follow_resize: bool,
}

impl CaptureOptions {
    /// Options for an interactive session attached to the current terminal.
    pub fn interactive(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
            term: std::env::var("TERM").unwrap_or_else(|_| "xterm".to_string()),
            size: None,
            forward_input: true,
            echo_output: true,
            follow_resize: true,
        }
    }

    /// Options for a detached session with a fixed terminal size.
    pub fn detached(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
            term: "xterm".to_string(),
            size: Some(DEFAULT_SIZE),
            forward_input: false,
            echo_output: false,
            follow_resize: false,
        }
    }
}

/// How the capture ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    /// The child exited on its own.
    Natural,
    /// An interrupt (signal or caller) stopped the child.
    Interrupted,
}

/// Result of a completed capture.
#[derive(Debug, Clone)]
pub struct CaptureOutcome {
    pub rec: String,
    pub exit_code: Option<i32>,
    pub success: bool,
    pub termination: Termination,
    pub capture: CaptureStats,
    pub dispatch: DispatchStats,
}

/// Builds the session context for the local user and host.
pub fn local_session(term: &str) -> SessionContext {
    let host = nix::unistd::gethostname()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "localhost".to_string());
    let user = nix::unistd::User::from_uid(nix::unistd::getuid())
        .ok()
        .flatten()
        .map(|u| u.name)
        .or_else(|| std::env::var("USER").ok())
        .unwrap_or_else(|| "unknown".to_string());
    SessionContext::new(host, user, term)
}

/// Records one PTY session.
pub struct CaptureLoop {
    config: RecorderConfig,
    options: CaptureOptions,
}

impl CaptureLoop {
    pub fn new(config: RecorderConfig, options: CaptureOptions) -> Self {
        Self { config, options }
    }

    fn spawn_pty(&self, size: (u16, u16)) -> Result<(PtyPair, Box<dyn Child + Send + Sync>)> {
        let pty_system = native_pty_system();
        let pair = pty_system
            .openpty(PtySize {
                rows: size.1,
                cols: size.0,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|e| Error::Pty(format!("failed to open PTY: {e}")))?;

        let mut cmd = CommandBuilder::new(&self.options.program);
        cmd.args(&self.options.args);
        let cwd = std::env::current_dir()?;
        cmd.cwd(&cwd);
        cmd.env("TERM", &self.options.term);

        let child = pair
            .slave
            .spawn_command(cmd)
            .map_err(|e| Error::Pty(format!("failed to spawn {}: {e}", self.options.program)))?;
        Ok((pair, child))
    }

    /// Runs the command to completion while recording it through `writer`.
    ///
    /// PTY and spawn failures are reported before the writer is opened. If
    /// the writer fails fatally mid-session the child is terminated, what
    /// was already accepted is flushed, and the writer error is returned.
    pub async fn run(
        &self,
        session: SessionContext,
        writer: Box<dyn RecordWriter>,
        mut interrupt_rx: watch::Receiver<bool>,
    ) -> Result<CaptureOutcome> {
        let size = match self.options.size {
            Some(size) => size,
            None => crossterm::terminal::size().unwrap_or(DEFAULT_SIZE),
        };
        let (pair, mut child) = self.spawn_pty(size)?;

        let reader = pair
            .master
            .try_clone_reader()
            .map_err(|e| Error::Pty(e.to_string()))?;
        let mut pty_writer = pair
            .master
            .take_writer()
            .map_err(|e| Error::Pty(e.to_string()))?;
        let master = pair.master;
        // Drop the slave to signal EOF when the child exits
        drop(pair.slave);

        let dispatcher = match Dispatcher::start(writer, &session, self.config.retry).await {
            Ok(d) => d,
            Err(e) => {
                stop_child(&mut child, None).await?;
                return Err(e);
            }
        };
        let mut writer_failed = dispatcher.failed();
        info!(rec = %session.rec, program = %self.options.program, "Recording started");

        let started = Instant::now();
        let mut pipeline = CapturePipeline::new(&self.config, session.clone(), started);
        let mut emit = |records: Vec<Record>| dispatcher.send(records);
        if let Err(e) = emit(pipeline.window(started, size.0, size.1)) {
            stop_child(&mut child, None).await?;
            dispatcher.finish().await?;
            return Err(e);
        }

        let should_terminate = Arc::new(AtomicBool::new(false));
        let mut output_rx = spawn_output_reader(reader, Arc::clone(&should_terminate));
        let mut input_rx = if self.options.forward_input {
            Some(spawn_input_reader(Arc::clone(&should_terminate)))
        } else {
            None
        };
        let mut winch = if self.options.follow_resize {
            Some(signal(SignalKind::window_change())?)
        } else {
            None
        };

        let mut termination = Termination::Natural;
        let mut failure = false;
        let mut watch_writer = true;
        let mut watch_interrupt = true;

        loop {
            if child.try_wait()?.is_some() {
                debug!("Child process exited, draining output");
                self.drain_output(
                    &mut output_rx,
                    &mut pipeline,
                    &mut emit,
                    &mut interrupt_rx,
                    &mut writer_failed,
                )
                .await;
                break;
            }

            let deadline = pipeline.deadline();
            let step = tokio::select! {
                event = output_rx.recv() => match event {
                    Some(OutputEvent::Data { bytes, at }) => {
                        if self.options.echo_output {
                            echo(&bytes);
                        }
                        let stop = stop_requested(&mut interrupt_rx, &mut writer_failed);
                        let result = pipeline
                            .ingest(Stream::Output, at, &bytes, &mut emit, stop)
                            .await;
                        ingest_step(result, *interrupt_rx.borrow())
                    }
                    Some(OutputEvent::Eof) => {
                        debug!("PTY EOF received");
                        Step::Stop
                    }
                    Some(OutputEvent::Error(e)) => {
                        debug!(error = %e, "PTY read error");
                        Step::Stop
                    }
                    None => Step::Stop,
                },

                input = recv_opt(&mut input_rx) => match input {
                    Some(bytes) => {
                        if let Err(e) = pty_writer.write_all(&bytes).and_then(|()| pty_writer.flush()) {
                            debug!(error = %e, "Failed to forward input to PTY");
                        }
                        let stop = stop_requested(&mut interrupt_rx, &mut writer_failed);
                        let result = pipeline
                            .ingest(Stream::Input, Instant::now(), &bytes, &mut emit, stop)
                            .await;
                        ingest_step(result, *interrupt_rx.borrow())
                    }
                    None => {
                        debug!("Input channel closed");
                        input_rx = None;
                        Step::Continue
                    }
                },

                () = next_winch(&mut winch) => {
                    let (cols, rows) = crossterm::terminal::size().unwrap_or(DEFAULT_SIZE);
                    debug!(cols, rows, "Terminal resized");
                    if let Err(e) = master.resize(PtySize {
                        rows,
                        cols,
                        pixel_width: 0,
                        pixel_height: 0,
                    }) {
                        warn!("Failed to resize PTY: {}", e);
                    }
                    step_on(emit(pipeline.window(Instant::now(), cols, rows)))
                }

                () = sleep_until_opt(deadline) => {
                    step_on(emit(pipeline.expire(Instant::now())))
                }

                changed = writer_failed.changed(), if watch_writer => {
                    if changed.is_err() {
                        watch_writer = false;
                    }
                    if *writer_failed.borrow() {
                        Step::WriterFailed
                    } else {
                        Step::Continue
                    }
                }

                changed = interrupt_rx.changed(), if watch_interrupt => {
                    if changed.is_err() {
                        watch_interrupt = false;
                    }
                    if *interrupt_rx.borrow() {
                        info!("Interrupt received, terminating recorded command");
                        Step::Interrupted
                    } else {
                        Step::Continue
                    }
                }

                () = tokio::time::sleep(EXIT_POLL) => Step::Continue,
            };

            match step {
                Step::Continue => {}
                Step::Stop => break,
                Step::Interrupted => {
                    termination = Termination::Interrupted;
                    should_terminate.store(true, Ordering::SeqCst);
                    stop_child(&mut child, Some(GRACE_PERIOD)).await?;
                    break;
                }
                Step::WriterFailed => {
                    error!("Record writer failed, terminating recorded command");
                    failure = true;
                    should_terminate.store(true, Ordering::SeqCst);
                    stop_child(&mut child, Some(GRACE_PERIOD)).await?;
                    break;
                }
            }
        }

        should_terminate.store(true, Ordering::SeqCst);

        let status = wait_for_exit(&mut child, GRACE_PERIOD, &mut interrupt_rx).await?;
        let (success, exit_code) = match status {
            Some(s) => (s.success(), Some(s.exit_code() as i32)),
            None => {
                warn!("Timed out waiting for child to exit after termination");
                (false, None)
            }
        };

        if !failure && !dispatcher.has_failed() {
            let tail = pipeline.finish(Instant::now());
            if let Err(e) = emit(tail) {
                warn!(error = %e, "Could not queue final records");
            }
        }

        let dispatch = dispatcher.finish().await?;
        let capture = pipeline.stats();
        info!(
            rec = %session.rec,
            exit_code,
            records = capture.records,
            written = dispatch.written,
            dropped = capture.dropped,
            "Recording finished"
        );

        Ok(CaptureOutcome {
            rec: session.rec,
            exit_code,
            success,
            termination,
            capture,
            dispatch,
        })
    }

    /// Collects output still in flight after the child exited.
    ///
    /// Stops at EOF or after a quiet period, since background processes may
    /// keep the PTY open past the child's exit. An interrupt or writer
    /// failure ends a rate limit wait and the drain with it.
    async fn drain_output<F>(
        &self,
        output_rx: &mut mpsc::Receiver<OutputEvent>,
        pipeline: &mut CapturePipeline,
        emit: &mut F,
        interrupt_rx: &mut watch::Receiver<bool>,
        writer_failed: &mut watch::Receiver<bool>,
    ) where
        F: FnMut(Vec<Record>) -> Result<()>,
    {
        while let Ok(Some(OutputEvent::Data { bytes, at })) =
            tokio::time::timeout(EXIT_POLL, output_rx.recv()).await
        {
            if self.options.echo_output {
                echo(&bytes);
            }
            let stop = stop_requested(interrupt_rx, writer_failed);
            match pipeline.ingest(Stream::Output, at, &bytes, emit, stop).await {
                Ok(Ingest::Complete) => {}
                Ok(Ingest::Cancelled) => {
                    debug!("Stopped draining output while rate limited");
                    break;
                }
                Err(e) => {
                    warn!(error = %e, "Dropping trailing output");
                    break;
                }
            }
        }
    }
}

enum Step {
    Continue,
    Stop,
    Interrupted,
    WriterFailed,
}

fn step_on(result: Result<()>) -> Step {
    match result {
        Ok(()) => Step::Continue,
        Err(e) => {
            debug!(error = %e, "Record dispatch rejected");
            Step::WriterFailed
        }
    }
}

fn ingest_step(result: Result<Ingest>, interrupted: bool) -> Step {
    match result {
        Ok(Ingest::Complete) => Step::Continue,
        Ok(Ingest::Cancelled) if interrupted => {
            info!("Interrupt received while rate limited, terminating recorded command");
            Step::Interrupted
        }
        Ok(Ingest::Cancelled) => Step::WriterFailed,
        Err(e) => step_on(Err(e)),
    }
}

/// Resolves once `flag` is raised. Stays pending after its sender is gone.
async fn raised(flag: &mut watch::Receiver<bool>) {
    if flag.wait_for(|raised| *raised).await.is_err() {
        std::future::pending::<()>().await;
    }
}

/// Resolves when a rate limit wait has to be abandoned.
async fn stop_requested(
    interrupt_rx: &mut watch::Receiver<bool>,
    writer_failed: &mut watch::Receiver<bool>,
) {
    tokio::select! {
        () = raised(interrupt_rx) => {}
        () = raised(writer_failed) => {}
    }
}

fn echo(bytes: &[u8]) {
    let mut stdout = io::stdout();
    if let Err(e) = stdout.write_all(bytes).and_then(|()| stdout.flush()) {
        debug!(error = %e, "Failed to echo output");
    }
}

/// Output events from the PTY reader thread.
#[derive(Debug)]
enum OutputEvent {
    /// Bytes read from the PTY and the instant they were read.
    Data { bytes: Vec<u8>, at: Instant },
    /// PTY reached EOF.
    Eof,
    /// Error reading from the PTY.
    Error(String),
}

fn spawn_output_reader(
    mut reader: Box<dyn Read + Send>,
    should_terminate: Arc<AtomicBool>,
) -> mpsc::Receiver<OutputEvent> {
    let (tx, rx) = mpsc::channel::<OutputEvent>(256);
    std::thread::spawn(move || {
        debug!("PTY output reader thread started");
        let mut buf = [0u8; 4096];
        loop {
            if should_terminate.load(Ordering::SeqCst) {
                break;
            }
            match reader.read(&mut buf) {
                Ok(0) => {
                    let _ = tx.blocking_send(OutputEvent::Eof);
                    break;
                }
                Ok(n) => {
                    let event = OutputEvent::Data {
                        bytes: buf[..n].to_vec(),
                        at: Instant::now(),
                    };
                    if tx.blocking_send(event).is_err() {
                        break;
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    std::thread::sleep(Duration::from_millis(1));
                }
                Err(e) => {
                    // EIO is how Linux reports a hung-up PTY
                    let _ = tx.blocking_send(OutputEvent::Error(e.to_string()));
                    break;
                }
            }
        }
        debug!("PTY output reader thread exiting");
    });
    rx
}

fn spawn_input_reader(should_terminate: Arc<AtomicBool>) -> mpsc::UnboundedReceiver<Vec<u8>> {
    let (tx, rx) = mpsc::unbounded_channel();
    std::thread::spawn(move || {
        let mut stdin = io::stdin();
        let mut buf = [0u8; 1024];
        loop {
            if should_terminate.load(Ordering::SeqCst) {
                break;
            }
            match stdin.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => {
                    if tx.send(buf[..n].to_vec()).is_err() {
                        break;
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(_) => break,
            }
        }
    });
    rx
}

async fn recv_opt(rx: &mut Option<mpsc::UnboundedReceiver<Vec<u8>>>) -> Option<Vec<u8>> {
    match rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

async fn next_winch(winch: &mut Option<tokio::signal::unix::Signal>) {
    match winch {
        Some(s) => {
            if s.recv().await.is_none() {
                std::future::pending::<()>().await;
            }
        }
        None => std::future::pending().await,
    }
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}

/// Stops the recorded command.
///
/// With a `grace` period the command gets SIGTERM and that long to exit by
/// itself before it is killed; without one it is killed right away.
async fn stop_child(
    child: &mut Box<dyn Child + Send + Sync>,
    grace: Option<Duration>,
) -> Result<()> {
    let Some(pid) = child.process_id().map(|id| Pid::from_raw(id as i32)) else {
        return Ok(());
    };

    if let Some(grace) = grace {
        signal_child(pid, Signal::SIGTERM);
        let deadline = Instant::now() + grace;
        while Instant::now() < deadline {
            if child.try_wait()?.is_some() {
                debug!(%pid, "Recorded command exited after SIGTERM");
                return Ok(());
            }
            tokio::time::sleep(EXIT_CHECK).await;
        }
        debug!(%pid, ?grace, "Recorded command outlived SIGTERM");
    }

    signal_child(pid, Signal::SIGKILL);
    Ok(())
}

fn signal_child(pid: Pid, signal: Signal) {
    if let Err(e) = kill(pid, signal) {
        debug!(%pid, signal = signal.as_str(), error = %e, "Could not signal recorded command");
    }
}

/// Collects the exit status of the recorded command, giving up after
/// `max_wait` or on a fresh interrupt.
///
/// Once the interrupt sender is gone only the time limit applies.
async fn wait_for_exit(
    child: &mut Box<dyn Child + Send + Sync>,
    max_wait: Duration,
    interrupt_rx: &mut watch::Receiver<bool>,
) -> Result<Option<portable_pty::ExitStatus>> {
    let deadline = Instant::now() + max_wait;
    let mut watch_interrupt = true;
    loop {
        if let Some(status) = child.try_wait()? {
            return Ok(Some(status));
        }
        if Instant::now() >= deadline {
            return Ok(None);
        }
        tokio::select! {
            changed = interrupt_rx.changed(), if watch_interrupt => {
                watch_interrupt = changed.is_ok();
                if watch_interrupt && *interrupt_rx.borrow() {
                    debug!("Interrupted while collecting exit status");
                    return Ok(None);
                }
            }
            () = tokio::time::sleep(EXIT_CHECK) => {}
        }
    }
}
