use colored::{Color, ColoredString, Colorize};
use log::{Level, LevelFilter, Log, Metadata, Record};
use std::io::{self, Write};
use std::sync::{Mutex, MutexGuard, PoisonError};

/**
 * Leveled, colored logger writing to stderr.
 *
 * Everything logged before the configuration is resolved is held back,
 * since the final log level is not known yet. [`LaunchLogger::print_deferred`]
 * replays whatever passes the final level and switches to direct output.
 */
pub struct LaunchLogger {
    state: Mutex<State>,
}

struct State {
    level: LevelFilter,
    output: Box<dyn Write + Send>,
    deferred: Option<Vec<(Level, ColoredString)>>,
}

impl LaunchLogger {
    pub fn new(level: LevelFilter) -> &'static Self {
        Self::with_output(level, Box::new(io::stderr()))
    }

    fn with_output(
        level: LevelFilter,
        output: Box<dyn Write + Send>,
    ) -> &'static Self {
        Box::leak(Box::new(Self {
            state: Mutex::new(State {
                level,
                output,
                deferred: Some(Vec::new()),
            }),
        }))
    }

    pub fn init(&'static self) -> Result<&'static Self, log::SetLoggerError> {
        log::set_logger(self)?;
        log::set_max_level(LevelFilter::Trace);
        Ok(self)
    }

    // A panic while logging must not take every later message with it
    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn set_level(&self, level: LevelFilter) {
        self.state().level = level;
    }

    pub fn print_deferred(&self) {
        let mut state = self.state();
        let level = state.level;
        if let Some(deferred) = state.deferred.take() {
            for (message_level, message) in deferred {
                if message_level <= level {
                    let _ = writeln!(state.output, "{}", message);
                }
            }
        }
    }
}

fn style(level: Level) -> (String, Color) {
    match level {
        Level::Error => (level.to_string(), Color::Red),
        Level::Warn => (format!("{} ", level), Color::Yellow),
        Level::Info => (format!("{} ", level), Color::White),
        Level::Debug => (level.to_string(), Color::Blue),
        Level::Trace => (level.to_string(), Color::BrightBlack),
    }
}

impl Log for LaunchLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= self.state().level
    }

    fn log(&self, record: &Record) {
        let (level_str, color) = style(record.level());
        // Module paths only help when debugging
        let text = if record.level() <= Level::Info {
            format!("[{}] {}", level_str.color(color), record.args())
        } else {
            format!(
                "[{}] {}: {}",
                level_str.color(color),
                record.target(),
                record.args()
            )
        };
        let line = text.color(color);

        let mut state = self.state();
        if let Some(deferred) = state.deferred.as_mut() {
            deferred.push((record.level(), line));
        } else if record.level() <= state.level {
            let _ = writeln!(state.output, "{}", line);
        }
    }

    fn flush(&self) {
        let _ = self.state().output.flush();
    }
}
