use crate::log::LogLevel::LogWarn;
use serde::Serialize;
use std::{
    fmt,
    fmt::{Display, Formatter},
    fs, io,
    path::{Path, PathBuf},
};

pub const PROC_FILE_NR: &str = "/proc/sys/fs/file-nr";

/// Source of the system wide count of open file objects.
///
/// The count is shared with every other process on the machine so any two
/// samples are only loosely comparable.
pub trait FileCounter {
    fn sample(&self) -> io::Result<u64>;
}

/// Reads the first field (allocated file handles) of `/proc/sys/fs/file-nr`.
pub struct ProcFileNr {
    path: PathBuf,
}

impl ProcFileNr {
    pub fn new() -> ProcFileNr {
        ProcFileNr::with_path(PROC_FILE_NR)
    }

    pub fn with_path<P: AsRef<Path>>(path: P) -> ProcFileNr {
        ProcFileNr {
            path: path.as_ref().to_owned(),
        }
    }
}

impl FileCounter for ProcFileNr {
    fn sample(&self) -> io::Result<u64> {
        let contents = fs::read_to_string(&self.path)?;
        parse_file_nr(&contents)
    }
}

pub fn parse_file_nr(contents: &str) -> io::Result<u64> {
    match contents.split_whitespace().next() {
        Some(first) => first.parse::<u64>().map_err(|e| {
            io::Error::new(
                io::ErrorKind::InvalidData,
                format!("Could not parse `{}' as a file count: {}", first, e),
            )
        }),
        None => Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "file-nr is empty",
        )),
    }
}

/// One reading of a `FileCounter`. A failed read is kept as a diagnostic
/// rather than aborting whatever was being measured.
#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
pub struct CounterSample {
    pub value: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl CounterSample {
    pub fn take<C: FileCounter + ?Sized>(counter: &C) -> CounterSample {
        match counter.sample() {
            Ok(value) => CounterSample {
                value: Some(value),
                error: None,
            },
            Err(e) => {
                log!(LogWarn, "Could not sample open file count: {}", e);
                CounterSample {
                    value: None,
                    error: Some(e.to_string()),
                }
            }
        }
    }
}

impl Display for CounterSample {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match (&self.value, &self.error) {
            (Some(v), _) => write!(f, "{}", v),
            (None, Some(e)) => write!(f, "unavailable ({})", e),
            (None, None) => write!(f, "unavailable"),
        }
    }
}
