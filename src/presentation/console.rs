//! Interactive console
//!
//! Line-oriented front end over [`LedControlService`]: prints connection and
//! device state changes and turns typed commands into local edits or raw
//! protocol commands.

use crate::domain::listeners::LedControlListener;
use crate::domain::settings::SettingsService;
use crate::domain::models::{
    ConnectionState, DeviceState, LAYER_ARG_COUNT, MAX_LAYERS, SECTION_COUNT,
};
use crate::infrastructure::bluetooth::protocol::ANIM_SPEED_MAX;
use crate::infrastructure::bluetooth::{LedControlService, SendMode};
use std::io::BufRead;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::debug;

pub const HELP: &str = "\
Commands:
  state                         print the device state as JSON
  status                        print the connection state
  connect                       reconnect now
  brightness <value>            set global brightness
  preview <value>               set global brightness if the link is idle
  section <index> <value>       set one section's brightness
  pattern <layer> <pattern> [args...]
  speed <layer> <0-1000>        set a layer's animation speed
  step <layer> <value>          set a layer's animation step
  raw <text>                    send a protocol line as typed
  device <name>                 save the board name used from the next start
  help                          show this text
  quit                          exit";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsoleCommand {
    State,
    Status,
    Connect,
    Brightness { value: i32, mode: SendMode },
    Section { index: usize, value: i32 },
    Pattern { layer: usize, pattern: i32, args: Vec<i32> },
    Speed { layer: usize, speed: i32 },
    Step { layer: usize, step: i32 },
    Raw(String),
    Device(String),
    Help,
    Quit,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CommandError {
    #[error("unknown command {0:?} (try `help`)")]
    Unknown(String),
    #[error("`{command}` expects {expected}")]
    Usage {
        command: &'static str,
        expected: &'static str,
    },
    #[error("{0:?} is not a number")]
    NotANumber(String),
    #[error("{what} {value} is out of range")]
    OutOfRange { what: &'static str, value: i64 },
}

impl ConsoleCommand {
    /// Parse one console line. Blank lines yield `None`.
    pub fn parse(line: &str) -> Result<Option<Self>, CommandError> {
        let line = line.trim();
        let (word, rest) = match line.split_once(char::is_whitespace) {
            Some((word, rest)) => (word, rest.trim()),
            None => (line, ""),
        };
        let args: Vec<&str> = rest.split_whitespace().collect();

        let command = match word {
            "" => return Ok(None),
            "state" => Self::State,
            "status" => Self::Status,
            "connect" | "reconnect" => Self::Connect,
            "help" | "?" => Self::Help,
            "quit" | "exit" => Self::Quit,
            "brightness" | "preview" => {
                let (name, mode) = if word == "preview" {
                    ("preview", SendMode::Preview)
                } else {
                    ("brightness", SendMode::Commit)
                };
                let [value] = args[..] else {
                    return Err(usage(name, "a value"));
                };
                Self::Brightness {
                    value: number(value)?,
                    mode,
                }
            }
            "section" => {
                let [index, value] = args[..] else {
                    return Err(usage("section", "an index and a value"));
                };
                Self::Section {
                    index: bounded_index("section", index, SECTION_COUNT)?,
                    value: number(value)?,
                }
            }
            "pattern" => {
                let [layer, pattern, ref extra @ ..] = args[..] else {
                    return Err(usage("pattern", "a layer and a pattern"));
                };
                if extra.len() > LAYER_ARG_COUNT {
                    return Err(usage("pattern", "at most 3 pattern arguments"));
                }
                Self::Pattern {
                    layer: bounded_index("layer", layer, MAX_LAYERS)?,
                    pattern: number(pattern)?,
                    args: extra.iter().map(|arg| number(arg)).collect::<Result<_, _>>()?,
                }
            }
            "speed" => {
                let [layer, speed] = args[..] else {
                    return Err(usage("speed", "a layer and a speed"));
                };
                let speed = number(speed)?;
                if !(0..=ANIM_SPEED_MAX).contains(&speed) {
                    return Err(CommandError::OutOfRange {
                        what: "speed",
                        value: speed.into(),
                    });
                }
                Self::Speed {
                    layer: bounded_index("layer", layer, MAX_LAYERS)?,
                    speed,
                }
            }
            "step" => {
                let [layer, step] = args[..] else {
                    return Err(usage("step", "a layer and a value"));
                };
                Self::Step {
                    layer: bounded_index("layer", layer, MAX_LAYERS)?,
                    step: number(step)?,
                }
            }
            "raw" => {
                if rest.is_empty() {
                    return Err(usage("raw", "some text"));
                }
                Self::Raw(rest.to_string())
            }
            "device" => {
                if rest.is_empty() {
                    return Err(usage("device", "a board name"));
                }
                Self::Device(rest.to_string())
            }
            other => return Err(CommandError::Unknown(other.to_string())),
        };
        Ok(Some(command))
    }
}

fn usage(command: &'static str, expected: &'static str) -> CommandError {
    CommandError::Usage { command, expected }
}

fn number(text: &str) -> Result<i32, CommandError> {
    text.parse()
        .map_err(|_| CommandError::NotANumber(text.to_string()))
}

fn index(what: &'static str, text: &str) -> Result<usize, CommandError> {
    let value = number(text)?;
    usize::try_from(value).map_err(|_| CommandError::OutOfRange {
        what,
        value: value.into(),
    })
}

fn bounded_index(what: &'static str, text: &str, len: usize) -> Result<usize, CommandError> {
    let value = index(what, text)?;
    if value >= len {
        return Err(CommandError::OutOfRange {
            what,
            value: value as i64,
        });
    }
    Ok(value)
}

/// What the caller should do after a command has run
#[derive(Debug, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Quit,
}

/// Run one parsed command against the service
pub fn execute(
    service: &LedControlService,
    settings: &mut SettingsService,
    command: ConsoleCommand,
) -> anyhow::Result<Flow> {
    match command {
        ConsoleCommand::State => {
            let json = serde_json::to_string_pretty(&*service.state())?;
            println!("{}", json);
        }
        ConsoleCommand::Status => println!("{}", service.connection_state()),
        ConsoleCommand::Connect => service.request_connect(Duration::ZERO),
        ConsoleCommand::Brightness { value, mode } => {
            service.update_global(mode, move |state| state.global_brightness = value);
        }
        ConsoleCommand::Section { index, value } => {
            service.update_global(SendMode::Commit, move |state| {
                state.section_brightness[index] = value;
            });
        }
        ConsoleCommand::Pattern {
            layer,
            pattern,
            args,
        } => {
            service.update_layer(layer, SendMode::Commit, move |settings| {
                settings.pattern_num = pattern;
                for (slot, arg) in settings.args.iter_mut().zip(args) {
                    *slot = arg;
                }
            });
        }
        ConsoleCommand::Speed { layer, speed } => {
            service.update_layer(layer, SendMode::Commit, move |settings| {
                settings.anim_speed = speed;
            });
        }
        ConsoleCommand::Step { layer, step } => {
            service.update_layer(layer, SendMode::Commit, move |settings| {
                settings.anim_step = step;
            });
        }
        ConsoleCommand::Raw(text) => service.send_command(format!("{}\n", text)),
        ConsoleCommand::Device(name) => {
            settings.set_device_name(&name)?;
            println!("Saved to {}", settings.path().display());
        }
        ConsoleCommand::Help => println!("{}", HELP),
        ConsoleCommand::Quit => return Ok(Flow::Quit),
    }
    Ok(Flow::Continue)
}

/// Prints state changes as they arrive
pub struct ConsoleListener;

impl LedControlListener for ConsoleListener {
    fn on_connection_state_change(&self, state: ConnectionState) {
        println!("[{}]", state);
    }

    fn on_device_state_change(&self, state: &DeviceState) {
        println!(
            "brightness {} sections {:?} patterns {} layers {}",
            state.global_brightness,
            state.section_brightness,
            state.patterns().len(),
            state.layer_count()
        );
    }
}

/// Read stdin on a dedicated thread; the channel closes at end of input
pub fn spawn_stdin_reader() -> mpsc::UnboundedReceiver<String> {
    let (tx, rx) = mpsc::unbounded_channel();
    std::thread::spawn(move || {
        for line in std::io::stdin().lock().lines() {
            match line {
                Ok(line) => {
                    if tx.send(line).is_err() {
                        break;
                    }
                }
                Err(e) => {
                    debug!("stdin closed: {}", e);
                    break;
                }
            }
        }
    });
    rx
}
