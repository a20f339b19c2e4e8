use crate::kernel_metadata::errno_name;
use backtrace::Backtrace;
use nix::errno::errno;
use std::{
    collections::HashMap,
    env,
    env::var_os,
    fs::{File, OpenOptions},
    io::{self, BufWriter, Result, Write},
    path::Path,
    sync::{Mutex, MutexGuard},
};

#[derive(Clone)]
struct LogModule {
    name: String,
    level: LogLevel,
}

#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Debug)]
pub enum LogLevel {
    LogFatal,
    LogError,
    LogWarn,
    LogInfo,
    LogDebug,
}

pub use LogLevel::*;

struct LogGlobals {
    level_map: HashMap<String, LogLevel>,
    log_modules_cache: HashMap<String, LogModule>,
    /// Possibly buffered
    log_file: Box<dyn Write + Send>,
    default_level: LogLevel,
}

extern "C" fn flush_log_buffer() {
    // Never panic here: we are called from libc's atexit machinery.
    if let Ok(mut lock) = LOG_GLOBALS.lock() {
        lock.log_file.flush().unwrap_or(());
    }
}

/// Output to stderr always. No backtrace -- simply exit.
/// Does not touch the log globals, so it is usable while they are being built.
macro_rules! clean_fatal {
    ($($args:tt)+) => {
        {
            use std::io::stderr;
            crate::log::write_prefix(&mut stderr(), crate::log::LogLevel::LogFatal, file!(), line!(), module_path!());
            eprintln!($($args)+);
            std::process::exit(1);
        }
    };
}

lazy_static! {
    static ref LOG_GLOBALS: Mutex<LogGlobals> = {
        let maybe_filename = var_os("FDSTEAL_LOG_FILE");
        let maybe_append_filename = var_os("FDSTEAL_APPEND_LOG_FILE");
        let mut f: Box<dyn Write + Send>;
        if let Some(filename) = maybe_filename {
            match File::create(&filename) {
                Ok(file) => f = Box::new(file),
                Err(e) => {
                    clean_fatal!("Could not create `{:?}' specified in FDSTEAL_LOG_FILE: {}", filename, e);
                }
            }
        } else if let Some(append_filename) = maybe_append_filename {
            match OpenOptions::new().append(true).create(true).open(&append_filename) {
                Ok(file) => f = Box::new(file),
                Err(e) => {
                    clean_fatal!("Could not append to `{:?}' specified in FDSTEAL_APPEND_LOG_FILE: {}", append_filename, e);
                }
            }
        } else {
            f = Box::new(io::stderr());
        }

        if let Ok(buf_size) = env::var("FDSTEAL_LOG_BUFFER") {
            match buf_size.parse::<usize>() {
                Ok(log_buffer_size) => f = Box::new(BufWriter::with_capacity(log_buffer_size, f)),
                Err(_) => {
                    clean_fatal!("Could not parse `{}' in FDSTEAL_LOG_BUFFER as a number", buf_size);
                }
            }
        }

        let ret = unsafe { libc::atexit(flush_log_buffer) };
        if ret != 0 {
            clean_fatal!("Could not register log flush handler");
        }

        let (default_level, level_map) = match env::var("FDSTEAL_LOG") {
            Ok(fdsteal_log) => init_log_levels(&fdsteal_log),
            Err(_) => (LogError, HashMap::new())
        };

        Mutex::new(LogGlobals {
            level_map,
            log_modules_cache: HashMap::new(),
            log_file: f,
            default_level,
        })
    };
}

fn log_level_string_to_level(log_level_string: &str) -> LogLevel {
    match log_level_string {
        "fatal" => LogFatal,
        "error" => LogError,
        "warn" => LogWarn,
        "info" => LogInfo,
        "debug" => LogDebug,
        _ => LogWarn,
    }
}

/// Parses strings like `all:warn,link_check_command:debug`.
fn init_log_levels(fdsteal_log: &str) -> (LogLevel, HashMap<String, LogLevel>) {
    let mut hm: HashMap<String, LogLevel> = HashMap::new();
    let mut default_level = LogDebug;
    for mod_colon_level in fdsteal_log.split(',') {
        let res: Vec<&str> = mod_colon_level.splitn(2, ':').collect();
        if res.len() == 2 {
            let mod_name = res[0].trim();
            let log_level_string = res[1].trim();
            if mod_name == "all" {
                default_level = log_level_string_to_level(log_level_string);
            } else {
                hm.insert(
                    mod_name.to_owned(),
                    log_level_string_to_level(log_level_string),
                );
            }
        }
    }
    (default_level, hm)
}

fn get_log_level(module_name: &str, l: &MutexGuard<LogGlobals>) -> LogLevel {
    // Module names come from filenames, which are case sensitive.
    match l.level_map.get(module_name) {
        Some(log_level) => *log_level,
        None => l.default_level,
    }
}

fn filename_to_module_name(filename: &str) -> String {
    match Path::new(filename).file_stem() {
        Some(stem) => stem.to_string_lossy().to_string(),
        None => filename.to_owned(),
    }
}

fn get_log_module(filename: &str, l: &mut MutexGuard<LogGlobals>) -> LogModule {
    if let Some(log_module) = l.log_modules_cache.get(filename) {
        return log_module.to_owned();
    }
    let name = filename_to_module_name(filename);
    let level = get_log_level(&name, l);
    let m = LogModule { level, name };
    l.log_modules_cache.insert(filename.to_owned(), m.clone());
    m
}

fn log_name(level: LogLevel) -> &'static str {
    match level {
        LogFatal => "FATAL",
        LogError => "ERROR",
        LogWarn => "WARN",
        LogInfo => "INFO",
        LogDebug => "DEBUG",
    }
}

pub struct NewLineTerminatingOstream {
    enabled: bool,
    message: Vec<u8>,
    lock: MutexGuard<'static, LogGlobals>,
}

impl NewLineTerminatingOstream {
    fn new(
        level: LogLevel,
        filename: &str,
        line: u32,
        module_path: &str,
        always_enabled: bool,
    ) -> Option<NewLineTerminatingOstream> {
        // A poisoned lock still holds a usable log file.
        let mut lock = match LOG_GLOBALS.lock() {
            Ok(lock) => lock,
            Err(poisoned) => poisoned.into_inner(),
        };
        let m = get_log_module(filename, &mut lock);
        let enabled = always_enabled || level <= m.level;
        if !enabled {
            return None;
        }

        let mut stream = NewLineTerminatingOstream {
            message: Vec::new(),
            enabled,
            lock,
        };
        if level == LogDebug {
            write!(stream, "[{}] ", m.name).unwrap_or(());
        } else {
            write_prefix(&mut stream, level, filename, line, module_path);
        }
        Some(stream)
    }
}

/// Low level. Use is_logging!() macro instead.
pub fn is_logging(level: LogLevel, filename: &str, _line: u32, _func_name: &str) -> bool {
    let mut lock = match LOG_GLOBALS.lock() {
        Ok(lock) => lock,
        Err(poisoned) => poisoned.into_inner(),
    };
    let m = get_log_module(filename, &mut lock);
    level <= m.level
}

impl Drop for NewLineTerminatingOstream {
    fn drop(&mut self) {
        if self.enabled {
            self.write(b"\n").unwrap_or(0);
            // Moves the message into the log file. The log file itself is
            // flushed at exit (it may be a BufWriter).
            self.flush().unwrap_or(());
        }
    }
}

impl Write for NewLineTerminatingOstream {
    fn flush(&mut self) -> Result<()> {
        if !self.message.is_empty() && self.enabled {
            self.lock.log_file.write_all(&self.message)?;
        }
        self.message.clear();
        Ok(())
    }

    fn write(&mut self, buf: &[u8]) -> Result<usize> {
        if self.enabled {
            self.message.extend_from_slice(buf);
        }

        // Pretend the bytes were written even when disabled, otherwise
        // write!() reports WriteZero.
        Ok(buf.len())
    }
}

pub fn write_prefix(
    stream: &mut dyn Write,
    level: LogLevel,
    filename: &str,
    line: u32,
    _module_path: &str,
) {
    write!(stream, "[{} {}:{}", log_name(level), filename, line).unwrap_or(());

    let err = errno();
    if level <= LogWarn && err != 0 {
        write!(stream, " errno: {}", errno_name(err)).unwrap_or(());
    }
    write!(stream, "] ").unwrap_or(());
}

/// This is almost always not the method you want. Use log!() macro instead
pub fn log(
    log_level: LogLevel,
    filename: &str,
    line: u32,
    module_path: &str,
    always_enabled: bool,
) -> Option<NewLineTerminatingOstream> {
    NewLineTerminatingOstream::new(log_level, filename, line, module_path, always_enabled)
}

/// Outputs to (possibly write buffered) log file (or stderr if no log file was specified)
/// After this program continues normally.
macro_rules! log {
    ($log_level:expr, $($args:tt)+) => {
        {
            use std::io::Write;
            let maybe_stream = crate::log::log(
                $log_level,
                file!(),
                line!(),
                module_path!(),
                false
            );
            match maybe_stream {
                Some(mut stream) => write!(stream, $($args)+).unwrap_or(()),
                None => ()
            }
        }
    };
}

macro_rules! is_logging {
    ($log_level:expr) => {
        crate::log::is_logging($log_level, file!(), line!(), module_path!())
    };
}

/// Outputs to (possibly write buffered) log file (or stderr if no log file was specified)
/// Prints out the backtrace to stderr and aborts.
macro_rules! fatal {
    ($($args:tt)+) => {
        {
            {
                use std::io::Write;
                use crate::log::LogFatal;
                let maybe_stream = crate::log::log(
                    LogFatal,
                    file!(),
                    line!(),
                    module_path!(),
                    true
                );
                match maybe_stream {
                   Some(mut stream) => write!(stream, $($args)+).unwrap_or(()),
                   None => ()
                }
            }
            crate::log::notifying_abort(backtrace::Backtrace::new());
            unreachable!();
        }
    };
}

/// Dump the stacktrace and abort.
pub fn notifying_abort(bt: Backtrace) {
    flush_log_buffer();
    dump_fdsteal_stack(bt);
    std::process::abort();
}

fn dump_fdsteal_stack(bt: Backtrace) {
    eprintln!("=== Start fdsteal backtrace:");
    eprintln!("{:?}", bt);
    eprintln!("=== End fdsteal backtrace");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_all_and_module_levels() {
        let (default_level, hm) = init_log_levels("all:warn, link_check_command : debug");
        assert_eq!(LogWarn, default_level);
        assert_eq!(Some(&LogDebug), hm.get("link_check_command"));
        assert_eq!(1, hm.len());
    }

    #[test]
    fn unknown_level_is_warn() {
        let (default_level, hm) = init_log_levels("remote_fd:chatty");
        // No `all:` entry means everything else is at debug.
        assert_eq!(LogDebug, default_level);
        assert_eq!(Some(&LogWarn), hm.get("remote_fd"));
    }

    #[test]
    fn entries_without_colon_are_ignored() {
        let (default_level, hm) = init_log_levels("garbage,,all:info");
        assert_eq!(LogInfo, default_level);
        assert!(hm.is_empty());
    }

    #[test]
    fn module_name_is_file_stem() {
        assert_eq!(
            "leak_check_command",
            filename_to_module_name("src/commands/leak_check_command.rs")
        );
        assert_eq!("main", filename_to_module_name("main.rs"));
    }

    #[test]
    fn prefix_without_errno() {
        nix::errno::Errno::clear();
        let mut out = Vec::<u8>::new();
        write_prefix(&mut out, LogInfo, "src/file_nr.rs", 12, "fdsteal::file_nr");
        assert_eq!("[INFO src/file_nr.rs:12] ", String::from_utf8_lossy(&out));
    }

    #[test]
    fn levels_are_ordered_by_severity() {
        assert!(LogFatal < LogError);
        assert!(LogError < LogWarn);
        assert!(LogInfo < LogDebug);
    }
}
