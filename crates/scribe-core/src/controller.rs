//! Single-key playback controls.
//!
//! | Key       | Command      |
//! |-----------|--------------|
//! | `}`       | double speed |
//! | `{`       | halve speed  |
//! | `=`       | reset speed  |
//! | `.`       | next record  |
//! | `G`       | go to end    |
//! | space     | pause/resume |
//! | `q`, ^C   | quit         |

use crossterm::event::{KeyCode, KeyEvent, KeyEventKind, KeyModifiers};
use tracing::debug;

/// Slowest accepted speed multiplier.
pub const MIN_SPEED: f64 = 1.0 / 16.0;
/// Fastest accepted speed multiplier.
pub const MAX_SPEED: f64 = 16.0;

/// A playback command issued by the viewer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlCommand {
    DoubleSpeed,
    HalveSpeed,
    ResetSpeed,
    Step,
    GotoEnd,
    TogglePause,
    Quit,
}

impl ControlCommand {
    /// Maps a key press to a command.
    pub fn from_key(key: KeyEvent) -> Option<Self> {
        if key.kind != KeyEventKind::Press {
            return None;
        }
        if key.modifiers.contains(KeyModifiers::CONTROL) {
            return match key.code {
                KeyCode::Char('c' | 'C') => Some(ControlCommand::Quit),
                _ => None,
            };
        }
        match key.code {
            KeyCode::Char(c) => Self::from_char(c),
            _ => None,
        }
    }

    /// Maps a typed character to a command.
    pub fn from_char(c: char) -> Option<Self> {
        match c {
            '}' => Some(ControlCommand::DoubleSpeed),
            '{' => Some(ControlCommand::HalveSpeed),
            '=' => Some(ControlCommand::ResetSpeed),
            '.' => Some(ControlCommand::Step),
            'G' => Some(ControlCommand::GotoEnd),
            ' ' => Some(ControlCommand::TogglePause),
            'q' => Some(ControlCommand::Quit),
            _ => None,
        }
    }
}

/// Player state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControllerState {
    Running,
    Paused,
    /// All records are rendered and the player waits for quit.
    PausedAtEnd,
    Quit,
}

/// What the engine has to do after a command.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Effect {
    None,
    SpeedChanged(f64),
    Paused,
    Resumed,
    /// Render the next record now.
    Step,
    /// Render everything known now.
    GotoEnd,
    Quit,
}

/// Playback state machine.
#[derive(Debug, Clone)]
pub struct Controller {
    state: ControllerState,
    speed: f64,
}

impl Controller {
    pub fn new(speed: f64) -> Self {
        Self {
            state: ControllerState::Running,
            speed: clamp_speed(speed),
        }
    }

    pub fn state(&self) -> ControllerState {
        self.state
    }

    pub fn speed(&self) -> f64 {
        self.speed
    }

    pub fn is_running(&self) -> bool {
        self.state == ControllerState::Running
    }

    pub fn is_quit(&self) -> bool {
        self.state == ControllerState::Quit
    }

    /// Applies a command and reports its effect.
    pub fn apply(&mut self, command: ControlCommand) -> Effect {
        if self.state == ControllerState::Quit {
            return Effect::None;
        }
        let at_end = self.state == ControllerState::PausedAtEnd;

        let effect = match command {
            ControlCommand::Quit => {
                self.state = ControllerState::Quit;
                Effect::Quit
            }
            ControlCommand::DoubleSpeed => self.set_speed(self.speed * 2.0),
            ControlCommand::HalveSpeed => self.set_speed(self.speed / 2.0),
            ControlCommand::ResetSpeed => self.set_speed(1.0),
            ControlCommand::TogglePause => match self.state {
                ControllerState::Running => {
                    self.state = ControllerState::Paused;
                    Effect::Paused
                }
                ControllerState::Paused => {
                    self.state = ControllerState::Running;
                    Effect::Resumed
                }
                _ => Effect::None,
            },
            ControlCommand::Step if !at_end => Effect::Step,
            ControlCommand::GotoEnd if !at_end => Effect::GotoEnd,
            ControlCommand::Step | ControlCommand::GotoEnd => Effect::None,
        };
        debug!(?command, ?effect, state = ?self.state, speed = self.speed, "Playback command");
        effect
    }

    /// Marks that every record has been rendered.
    pub fn reach_end(&mut self) {
        if self.state != ControllerState::Quit {
            self.state = ControllerState::PausedAtEnd;
        }
    }

    #[allow(clippy::float_cmp)]
    fn set_speed(&mut self, speed: f64) -> Effect {
        let speed = clamp_speed(speed);
        if speed == self.speed {
            return Effect::None;
        }
        self.speed = speed;
        Effect::SpeedChanged(speed)
    }
}

/// Limits a speed multiplier to the supported range.
pub fn clamp_speed(speed: f64) -> f64 {
    if speed.is_finite() {
        speed.clamp(MIN_SPEED, MAX_SPEED)
    } else {
        1.0
    }
}
