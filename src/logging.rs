//! Logging backend which writes to a log file and, optionally, the console.

use chrono::Local;
use eyre::{eyre, Context, Result};
use log::{Level, LevelFilter, Metadata, Record};
use once_cell::sync::OnceCell;
use std::{
    fs::File,
    io::Write,
    sync::{mpsc, Mutex},
};

use crate::settings::Options;

/// Logs an undecorated message. Echo messages go to the same sinks as everything else, but they
/// are written without a level tag and the configured level never filters them out.
#[macro_export]
macro_rules! echo {
    ($($arg:tt)+) => {
        ::log::info!(target: $crate::logging::ECHO_TARGET, $($arg)+)
    };
}

/// The `log` target that `echo!` uses.
pub const ECHO_TARGET: &str = "echo";

#[derive(Clone, Copy, Debug, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "lowercase")]
enum MessageType {
    Info,
    Error,
    Warning,
    Debug,
    Echo,
}

impl MessageType {
    fn for_record(record: &Record) -> MessageType {
        if record.target() == ECHO_TARGET {
            return MessageType::Echo;
        }

        match record.level() {
            Level::Error => MessageType::Error,
            Level::Warn => MessageType::Warning,
            Level::Info => MessageType::Info,
            Level::Debug | Level::Trace => MessageType::Debug,
        }
    }
}

struct Message {
    module: String,
    msg_type: MessageType,
    string: String,
    time: String,
}

impl Message {
    /// Formats the message as a single line, which includes the trailing newline.
    fn format(&self, timestamp: bool) -> String {
        let mut line = String::new();

        if timestamp {
            line.push_str(&format!("[{}] ", self.time));
        }

        if self.msg_type == MessageType::Echo {
            line.push_str(&self.string);
        } else {
            line.push_str(&format!(
                "[{}] [{}] {}",
                self.module, self.msg_type, self.string
            ));
        }

        if !line.ends_with('\n') {
            line.push('\n');
        }

        line
    }
}

/// Where formatted messages end up.
struct Sinks {
    file: File,
    console: bool,
    timestamp: bool,
}

impl Sinks {
    fn write(&mut self, message: &Message) {
        let line = message.format(self.timestamp);

        // Nowhere to report a failed log write, so it's dropped.
        let _ = self.file.write_all(line.as_bytes());

        if self.console {
            eprint!("{line}");
        }
    }
}

pub struct Logger;

impl Logger {
    pub fn commit(&self, record: &log::Record) {
        let module = record
            .module_path()
            .and_then(|path| path.split("::").last())
            .unwrap_or("unknown")
            .to_string();

        let message = Message {
            module,
            msg_type: MessageType::for_record(record),
            string: format!("{}", record.args()),
            time: Local::now().format("%Y-%m-%d %H:%M:%S%.3f").to_string(),
        };

        if let Some(sender) = MSG_SENDER.get() {
            if let Ok(sender) = sender.lock() {
                // The receiver only goes away if the writer thread died, and then there's no
                // one left to tell.
                let _ = sender.send(message);
            }
        }
    }
}

/// Whether a record passes the configured level. Echo messages always do.
fn allows(metadata: &Metadata, level: LevelFilter) -> bool {
    metadata.target() == ECHO_TARGET || metadata.level() <= level
}

impl log::Log for Logger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        allows(metadata, LEVEL.get().copied().unwrap_or(LevelFilter::Trace))
    }

    fn log(&self, record: &Record) {
        if self.enabled(record.metadata()) {
            self.commit(record);
        }
    }

    fn flush(&self) {}
}

static LOGGER: Logger = Logger;
static MSG_SENDER: OnceCell<Mutex<mpsc::Sender<Message>>> = OnceCell::new();
static LEVEL: OnceCell<LevelFilter> = OnceCell::new();

fn panic_hook(info: &std::panic::PanicInfo) {
    let message = info
        .payload()
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| info.payload().downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "no message".to_string());

    let location = info
        .location()
        .map(|loc| format!("{}:{}", loc.file(), loc.line()))
        .unwrap_or_else(|| "unknown location".to_string());

    let backtrace = std::backtrace::Backtrace::force_capture();

    log::error!(
        "panic at {location}: {message}
Image base: {:#x}
Backtrace:
{backtrace}",
        crate::interop::image_base()
    );

    // Unwinding into host code is not an option, so this is as far as we go.
    std::process::abort();
}

fn install_panic_hook() {
    std::panic::set_hook(Box::new(panic_hook));
}

pub fn init(options: &Options) -> Result<()> {
    let path = options.log_path();
    let file = File::create(&path)
        .wrap_err_with(|| format!("failed to create log file {}", path.display()))?;

    let (sender, receiver) = mpsc::channel::<Message>();

    MSG_SENDER
        .set(Mutex::new(sender))
        .map_err(|_| eyre!("logging has already been initialised"))?;

    LEVEL
        .set(options.level)
        .map_err(|_| eyre!("logging has already been initialised"))?;

    log::set_logger(&LOGGER).map_err(|_| eyre!("another logger is already installed"))?;

    // The level is applied in `Logger::enabled` instead, since echo messages bypass it.
    log::set_max_level(LevelFilter::Trace);

    install_panic_hook();

    let mut sinks = Sinks {
        file,
        console: options.console,
        timestamp: options.timestamp,
    };

    // Write on a background thread so that hooked code doesn't wait for file or console I/O.
    std::thread::Builder::new()
        .name("openhedz-log".to_string())
        .spawn(move || {
            for message in receiver {
                sinks.write(&message);
            }
        })
        .wrap_err("failed to start log writer thread")?;

    Ok(())
}
