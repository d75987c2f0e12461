//! Logging backend which logs to a file and, with the `debug` feature, over UDP.

use chrono::Local;
use eyre::{Context, Result};
use log::{Level, LevelFilter, Metadata, Record};
use once_cell::sync::OnceCell;
use serde::{Deserialize, Serialize};
use std::{
    fs::File,
    io::{BufWriter, Write},
    net,
    path::{Path, PathBuf},
    sync::{mpsc::Sender, Mutex},
};

/// Where log messages are mirrored to when the `debug` feature is on.
const MIRROR_ADDRESS: &str = "127.0.0.1:4568";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
enum MessageType {
    Normal,
    Error,
    Warning,
    Debug,
}

#[derive(Debug, PartialEq, Serialize, Deserialize)]
struct Message {
    module: String,
    msg_type: MessageType,
    string: String,
    time: String,
}

impl Message {
    /// Serializes the message with a length prefix that counts itself.
    fn pack(&self) -> Option<Vec<u8>> {
        let serialized = bincode::serialize::<Message>(self).ok()?;

        let mut packed = Vec::from(u32::to_le_bytes((serialized.len() as u32) + 4));
        packed.extend(&serialized);

        Some(packed)
    }

    fn format_line(&self) -> String {
        let level_name = match self.msg_type {
            MessageType::Normal => "info",
            MessageType::Error => "error",
            MessageType::Warning => "warning",
            MessageType::Debug => "debug",
        };

        //      [date time] [module] [level] Text
        format!(
            "[{}] [{}] [{}] {}\n",
            self.time, self.module, level_name, self.string
        )
    }

    fn from_record(record: &Record) -> Message {
        let msg_type = match record.level() {
            Level::Error => MessageType::Error,
            Level::Warn => MessageType::Warning,
            Level::Info => MessageType::Normal,
            Level::Debug | Level::Trace => MessageType::Debug,
        };

        Message {
            module: record
                .module_path()
                .and_then(|path| path.split("::").last())
                .unwrap_or("unknown")
                .to_string(),
            msg_type,
            string: format!("{}", record.args()),
            time: Local::now().format("%Y-%m-%d %H:%M:%S%.3f").to_string(),
        }
    }
}

struct Logger;

impl log::Log for Logger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }

        if let Some(sender) = MSG_SENDER.get() {
            let sender = sender.lock().unwrap_or_else(|err| err.into_inner());

            // The writer thread only stops when the process does.
            let _ = sender.send(Message::from_record(record));
        }
    }

    fn flush(&self) {}
}

static LOGGER: Logger = Logger;
static MSG_SENDER: OnceCell<Mutex<Sender<Message>>> = OnceCell::new();

/// Directory that `PANIC.txt` is written to.
static PANIC_DIR: OnceCell<PathBuf> = OnceCell::new();

fn install_panic_hook() {
    std::panic::set_hook(Box::new(|info| {
        let message = info
            .payload()
            .downcast_ref::<&str>()
            .map(|s| s.to_string())
            .or_else(|| info.payload().downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "no message".to_string());

        let location = info
            .location()
            .map(|l| format!("{}:{}", l.file(), l.line()))
            .unwrap_or_else(|| "unknown".to_string());

        let backtrace = backtrace::Backtrace::new();

        let info_dump = format!(
            "vplus panicked. Please report this along with the log file.

Version: {}
Message: {message}
Location: {location}
Time: {}

{backtrace:?}",
            env!("CARGO_PKG_VERSION"),
            Local::now(),
        );

        log::error!("{info_dump}");

        if let Some(dir) = PANIC_DIR.get() {
            let _ = std::fs::write(dir.join("PANIC.txt"), info_dump);
        }
    }));
}

/// Starts logging to `path`. Messages are written on a background thread so that logging never
/// blocks the caller on I/O.
pub fn init(path: &Path, level: LevelFilter) -> Result<()> {
    let file = File::create(path).wrap_err_with(|| format!("creating log file {}", path.display()))?;

    let (sender, receiver) = std::sync::mpsc::channel::<Message>();

    MSG_SENDER
        .set(Mutex::new(sender))
        .map_err(|_| eyre::eyre!("logging is already initialised"))?;

    if let Some(dir) = path.parent() {
        let _ = PANIC_DIR.set(dir.to_path_buf());
    }

    log::set_logger(&LOGGER).map_err(|err| eyre::eyre!("installing logger: {err}"))?;
    log::set_max_level(level);

    install_panic_hook();

    // Only attempt to mirror over UDP if we're in debug mode.
    let socket = if cfg!(feature = "debug") {
        net::UdpSocket::bind("0.0.0.0:0").ok()
    } else {
        None
    };

    std::thread::Builder::new()
        .name("vplus-log".to_string())
        .spawn(move || {
            let mut file = BufWriter::new(file);

            while let Ok(msg) = receiver.recv() {
                let _ = file.write_all(msg.format_line().as_bytes());
                let _ = file.flush();

                if let Some(socket) = &socket {
                    if let Some(bin) = msg.pack() {
                        let _ = socket.send_to(&bin, MIRROR_ADDRESS);
                    }
                }
            }
        })
        .wrap_err("starting log thread")?;

    log::info!("vplus {} logging to {}", env!("CARGO_PKG_VERSION"), path.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message() -> Message {
        Message {
            module: "pins".to_string(),
            msg_type: MessageType::Warning,
            string: "Bad pin payload from 4".to_string(),
            time: "2021-06-01 12:00:00.000".to_string(),
        }
    }

    #[test]
    fn file_line_format() {
        assert_eq!(
            message().format_line(),
            "[2021-06-01 12:00:00.000] [pins] [warning] Bad pin payload from 4\n"
        );
    }

    #[test]
    fn init_only_once() {
        let path = std::env::temp_dir().join(format!("vplus-logging-{}-init.log", std::process::id()));

        // Another test may already have installed the logger.
        let _ = init(&path, LevelFilter::Debug);
        assert!(init(&path, LevelFilter::Debug).is_err());
        assert!(path.exists());
    }

    #[test]
    fn packed_length_includes_the_prefix() {
        let packed = message().pack().unwrap();
        let length = u32::from_le_bytes([packed[0], packed[1], packed[2], packed[3]]);

        assert_eq!(length as usize, packed.len());
        assert_eq!(
            bincode::deserialize::<Message>(&packed[4..]).unwrap(),
            message()
        );
    }
}
