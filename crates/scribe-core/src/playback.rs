//! Timed playback of a recorded session.
//!
//! The engine renders output records to a writer, sleeping between records
//! for the recorded gap divided by the current speed. While waiting it
//! reacts to viewer commands, cancellation and, in follow mode, records that
//! keep arriving from the sink. Changing speed mid-wait re-times only the part
//! of the gap still outstanding; pausing keeps it for when playback resumes.

use scribe_proto::{Error, Frame, Record, Result};
use std::io::Write;
use std::str::FromStr;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::PlayerConfig;
use crate::controller::{ControlCommand, Controller, Effect};
use crate::reader::RecordReader;

/// Where playback jumps to before timed rendering starts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GotoPoint {
    Start,
    /// Render everything known and stop at the end.
    End,
    /// Render everything recorded up to this offset.
    Offset(Duration),
    /// Render everything before the record with this id.
    Record(u64),
}

impl FromStr for GotoPoint {
    type Err = Error;

    /// Accepts `start`, `end`, `#ID` or a time as `[[HH:]MM:]SS[.sss]`.
    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        let invalid = || Error::InvalidConfig(format!("invalid goto position '{s}'"));
        match s {
            "start" => Ok(GotoPoint::Start),
            "end" => Ok(GotoPoint::End),
            _ => {
                if let Some(id) = s.strip_prefix('#') {
                    return match id.parse::<u64>() {
                        Ok(id) if id > 0 => Ok(GotoPoint::Record(id)),
                        _ => Err(invalid()),
                    };
                }
                parse_time(s).map(GotoPoint::Offset).ok_or_else(invalid)
            }
        }
    }
}

fn parse_time(s: &str) -> Option<Duration> {
    let parts: Vec<&str> = s.split(':').collect();
    if parts.len() > 3 || parts.iter().any(|p| p.is_empty()) {
        return None;
    }
    let (whole, last) = parts.split_at(parts.len() - 1);
    let seconds: f64 = last[0].parse().ok()?;
    if !seconds.is_finite() || seconds < 0.0 {
        return None;
    }
    let mut total: u64 = 0;
    for part in whole {
        total = total.checked_mul(60)?.checked_add(part.parse::<u64>().ok()?)?;
    }
    let minutes_in_secs = Duration::from_secs(total.checked_mul(60)?);
    minutes_in_secs.checked_add(Duration::try_from_secs_f64(seconds).ok()?)
}

/// Playback settings.
#[derive(Debug, Clone, PartialEq)]
pub struct PlaybackOptions {
    pub speed: f64,
    pub goto: Option<GotoPoint>,
    pub follow: bool,
    pub persist: bool,
    pub poll_interval: Duration,
}

impl Default for PlaybackOptions {
    fn default() -> Self {
        Self {
            speed: 1.0,
            goto: None,
            follow: false,
            persist: false,
            poll_interval: Duration::from_millis(250),
        }
    }
}

impl PlaybackOptions {
    pub fn from_config(config: &PlayerConfig) -> Result<Self> {
        Ok(Self {
            speed: config.speed,
            goto: config.goto.as_deref().map(str::parse).transpose()?,
            follow: config.follow,
            persist: config.persist,
            poll_interval: config.poll_interval(),
        })
    }
}

/// Position of playback within the session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PlaybackCursor {
    /// Number of records rendered so far.
    pub rendered: usize,
    /// Id of the last rendered record.
    pub last_id: u64,
    /// Recorded offset playback has reached, in milliseconds.
    pub pos_ms: u64,
}

/// Outcome of a playback run.
#[derive(Debug, Clone, PartialEq)]
pub struct PlaybackSummary {
    pub rendered: usize,
    /// Records whose payload could not be decoded.
    pub skipped: usize,
    /// Output bytes written.
    pub bytes: u64,
    /// Every record of the session was rendered.
    pub reached_end: bool,
    /// Playback stopped on a quit command or cancellation.
    pub quit: bool,
    pub final_speed: f64,
}

enum Wake {
    Timer,
    Command(ControlCommand),
    Incoming(Option<Result<Vec<Record>>>),
    Cancelled,
    /// The command or cancel channel closed.
    Closed,
}

enum Step {
    Render,
    ToEnd,
    Quit,
}

/// Event sources the engine waits on.
struct Inputs {
    commands: mpsc::UnboundedReceiver<ControlCommand>,
    commands_open: bool,
    cancel: watch::Receiver<bool>,
    cancel_open: bool,
    incoming: Option<mpsc::Receiver<Result<Vec<Record>>>>,
}

impl Inputs {
    /// True while something can still end an indefinite wait.
    fn can_wake(&self) -> bool {
        self.commands_open || self.cancel_open || self.incoming.is_some()
    }

    async fn next(&mut self, deadline: Option<Instant>) -> Wake {
        loop {
            let wake = tokio::select! {
                biased;
                changed = self.cancel.changed(), if self.cancel_open => {
                    self.cancel_open = changed.is_ok();
                    if self.cancel_open {
                        (*self.cancel.borrow()).then_some(Wake::Cancelled)
                    } else {
                        Some(Wake::Closed)
                    }
                }
                command = self.commands.recv(), if self.commands_open => {
                    self.commands_open = command.is_some();
                    Some(command.map_or(Wake::Closed, Wake::Command))
                }
                batch = recv_incoming(&mut self.incoming) => Some(Wake::Incoming(batch)),
                () = sleep_until_opt(deadline) => Some(Wake::Timer),
            };
            if let Some(wake) = wake {
                return wake;
            }
        }
    }
}

async fn recv_incoming(
    incoming: &mut Option<mpsc::Receiver<Result<Vec<Record>>>>,
) -> Option<Result<Vec<Record>>> {
    match incoming {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

/// Polls the reader in the background and forwards new records until the
/// session ends, the engine goes away or playback is cancelled.
fn spawn_follower(
    mut reader: RecordReader,
    interval: Duration,
    mut cancel: watch::Receiver<bool>,
) -> mpsc::Receiver<Result<Vec<Record>>> {
    let (tx, rx) = mpsc::channel(16);
    tokio::spawn(async move {
        let mut cancel_open = true;
        loop {
            let stop = tokio::select! {
                biased;
                () = tx.closed() => true,
                changed = cancel.changed(), if cancel_open => {
                    cancel_open = changed.is_ok();
                    cancel_open && *cancel.borrow()
                }
                () = tokio::time::sleep(interval) => false,
            };
            if stop {
                break;
            }

            match reader.fetch_new().await {
                Ok(batch) => {
                    let ended = reader.is_ended();
                    if !batch.is_empty() && tx.send(Ok(batch)).await.is_err() {
                        break;
                    }
                    if ended {
                        break;
                    }
                }
                Err(e) => {
                    warn!(error = %e, "Follow poll failed");
                    let _ = tx.send(Err(e)).await;
                    break;
                }
            }
        }
        debug!(last_id = reader.last_id(), "Follower stopped");
    });
    rx
}

/// Renders one session.
pub struct PlaybackEngine {
    options: PlaybackOptions,
    controller: Controller,
    records: Vec<Record>,
    cursor: PlaybackCursor,
    session_ended: bool,
    /// Recorded time already spent idle waiting for new records.
    credit: Duration,
    skipped: usize,
    bytes: u64,
}

impl PlaybackEngine {
    pub fn new(options: PlaybackOptions) -> Self {
        let controller = Controller::new(options.speed);
        Self {
            options,
            controller,
            records: Vec::new(),
            cursor: PlaybackCursor::default(),
            session_ended: false,
            credit: Duration::ZERO,
            skipped: 0,
            bytes: 0,
        }
    }

    pub fn cursor(&self) -> PlaybackCursor {
        self.cursor
    }

    pub fn controller(&self) -> &Controller {
        &self.controller
    }

    /// Plays the session read by `reader` into `out`.
    ///
    /// `commands` carries viewer key commands; `cancel` flipping to `true`
    /// stops playback like a quit command.
    ///
    /// `out` is a blocking writer used directly on the runtime thread. That
    /// suits a terminal or an in-memory buffer; a sink that can stall (a
    /// pipe nobody drains) stalls the engine along with it.
    pub async fn run<W: Write>(
        mut self,
        mut reader: RecordReader,
        out: &mut W,
        commands: mpsc::UnboundedReceiver<ControlCommand>,
        cancel: watch::Receiver<bool>,
    ) -> Result<PlaybackSummary> {
        let initial = reader.open(self.options.follow).await?;
        info!(
            records = initial.len(),
            filter = %reader.filter(),
            follow = self.options.follow,
            speed = self.controller.speed(),
            "Starting playback"
        );
        self.absorb(initial);

        let mut inputs = Inputs {
            commands,
            commands_open: true,
            cancel_open: true,
            incoming: None,
            cancel,
        };
        if self.options.follow && !reader.is_ended() {
            let follower_cancel = inputs.cancel.clone();
            inputs.incoming = Some(spawn_follower(
                reader,
                self.options.poll_interval,
                follower_cancel,
            ));
        }

        if let Some(goto) = self.options.goto.clone() {
            self.seek(&goto, out)?;
        }

        let mut quit = false;
        loop {
            if self.controller.is_quit() {
                quit = true;
                break;
            }

            if self.cursor.rendered < self.records.len() {
                match self.wait_for_next(&mut inputs).await? {
                    Step::Render => self.render_next(out)?,
                    Step::ToEnd => self.render_to_end(out)?,
                    Step::Quit => {
                        quit = true;
                        break;
                    }
                }
                continue;
            }

            if inputs.incoming.is_some() && !self.session_ended {
                // Caught up with a live session: wait for more records
                let idle_since = Instant::now();
                let wake = inputs.next(None).await;
                if self.controller.is_running() {
                    self.credit += idle_since.elapsed().mul_f64(self.controller.speed());
                }
                match wake {
                    Wake::Incoming(batch) => self.absorb_incoming(batch, &mut inputs)?,
                    Wake::Command(command) => {
                        self.controller.apply(command);
                    }
                    Wake::Cancelled => {
                        quit = true;
                        break;
                    }
                    Wake::Timer | Wake::Closed => {}
                }
                continue;
            }

            self.controller.reach_end();
            if !self.options.persist || !inputs.can_wake() {
                break;
            }
            match inputs.next(None).await {
                Wake::Command(command) => {
                    self.controller.apply(command);
                }
                Wake::Cancelled => {
                    quit = true;
                    break;
                }
                Wake::Incoming(batch) => self.absorb_incoming(batch, &mut inputs)?,
                Wake::Timer | Wake::Closed => {}
            }
        }

        out.flush()?;
        let reached_end = self.cursor.rendered == self.records.len()
            && (self.session_ended || inputs.incoming.is_none());
        let summary = PlaybackSummary {
            rendered: self.cursor.rendered,
            skipped: self.skipped,
            bytes: self.bytes,
            reached_end,
            quit,
            final_speed: self.controller.speed(),
        };
        info!(
            rendered = summary.rendered,
            bytes = summary.bytes,
            quit = summary.quit,
            "Playback finished"
        );
        Ok(summary)
    }

    /// Waits out the gap before the next record.
    async fn wait_for_next(&mut self, inputs: &mut Inputs) -> Result<Step> {
        let next_pos = self.records[self.cursor.rendered].pos;
        let gap = Duration::from_millis(next_pos.saturating_sub(self.cursor.pos_ms));
        let mut remaining = gap.saturating_sub(std::mem::take(&mut self.credit));

        loop {
            let running = self.controller.is_running();
            if running && remaining.is_zero() {
                return Ok(Step::Render);
            }
            if !running && !inputs.commands_open && !inputs.cancel_open {
                warn!("Playback paused with nothing left to resume it, stopping");
                self.controller.apply(ControlCommand::Quit);
                return Ok(Step::Quit);
            }

            let speed = self.controller.speed();
            let started = Instant::now();
            let deadline = running.then(|| started + remaining.div_f64(speed));
            let wake = inputs.next(deadline).await;
            if running {
                remaining = remaining.saturating_sub(started.elapsed().mul_f64(speed));
            }

            match wake {
                Wake::Timer => return Ok(Step::Render),
                Wake::Cancelled => {
                    self.controller.apply(ControlCommand::Quit);
                    return Ok(Step::Quit);
                }
                Wake::Incoming(batch) => self.absorb_incoming(batch, inputs)?,
                Wake::Closed => {}
                Wake::Command(command) => match self.controller.apply(command) {
                    Effect::Step => return Ok(Step::Render),
                    Effect::GotoEnd => return Ok(Step::ToEnd),
                    Effect::Quit => return Ok(Step::Quit),
                    Effect::None | Effect::SpeedChanged(_) | Effect::Paused | Effect::Resumed => {}
                },
            }
        }
    }

    fn absorb(&mut self, batch: Vec<Record>) {
        for record in batch {
            if self.session_ended {
                break;
            }
            if record.is_end() {
                self.session_ended = true;
            }
            self.records.push(record);
        }
    }

    fn absorb_incoming(
        &mut self,
        batch: Option<Result<Vec<Record>>>,
        inputs: &mut Inputs,
    ) -> Result<()> {
        match batch {
            Some(Ok(records)) => {
                debug!(count = records.len(), "New records while following");
                self.absorb(records);
                Ok(())
            }
            Some(Err(e)) => Err(e),
            None => {
                inputs.incoming = None;
                Ok(())
            }
        }
    }

    fn render_next<W: Write>(&mut self, out: &mut W) -> Result<()> {
        let record = &self.records[self.cursor.rendered];
        self.cursor.rendered += 1;
        self.cursor.last_id = record.id;
        self.cursor.pos_ms = self.cursor.pos_ms.max(record.pos);

        match &record.frame {
            Frame::Output { .. } => match record.decode_payload() {
                Ok(bytes) => {
                    out.write_all(&bytes)?;
                    out.flush()?;
                    self.bytes += bytes.len() as u64;
                }
                Err(e) => {
                    warn!(id = record.id, error = %e, "Skipping record with undecodable payload");
                    self.skipped += 1;
                }
            },
            Frame::Window { width, height } => {
                debug!(width, height, "Recorded window resize");
            }
            Frame::End => debug!(id = record.id, "Reached session end marker"),
            Frame::Input { .. } => {}
        }
        Ok(())
    }

    fn render_to_end<W: Write>(&mut self, out: &mut W) -> Result<()> {
        while self.cursor.rendered < self.records.len() {
            self.render_next(out)?;
        }
        Ok(())
    }

    fn seek<W: Write>(&mut self, goto: &GotoPoint, out: &mut W) -> Result<()> {
        match goto {
            GotoPoint::Start => {}
            GotoPoint::End => self.render_to_end(out)?,
            GotoPoint::Offset(offset) => {
                let target = u64::try_from(offset.as_millis()).unwrap_or(u64::MAX);
                while self
                    .records
                    .get(self.cursor.rendered)
                    .is_some_and(|r| r.pos <= target)
                {
                    self.render_next(out)?;
                }
                self.cursor.pos_ms = self.cursor.pos_ms.max(target);
            }
            GotoPoint::Record(id) => {
                while self
                    .records
                    .get(self.cursor.rendered)
                    .is_some_and(|r| r.id < *id)
                {
                    self.render_next(out)?;
                }
                if let Some(next) = self.records.get(self.cursor.rendered) {
                    self.cursor.pos_ms = next.pos;
                }
            }
        }
        info!(?goto, rendered = self.cursor.rendered, "Jumped to position");
        Ok(())
    }
}
