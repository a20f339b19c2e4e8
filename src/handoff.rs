//! The single message a producer sends to announce the descriptor it holds.
//!
//! Wire layout, all integers little endian:
//!
//! ```text
//! +----------------+-------------------+------------------+
//! | path_len: u32  | descriptor: i32   | path bytes       |
//! +----------------+-------------------+------------------+
//! ```
//!
//! The reader never depends on end-of-file: a forked sibling may still hold a
//! copy of the write end.

use std::{
    error::Error,
    ffi::OsStr,
    fmt,
    fmt::{Display, Formatter},
    io,
    io::Read,
    os::unix::{ffi::OsStrExt, io::RawFd},
    path::PathBuf,
};

pub const HANDOFF_HEADER_LEN: usize = 8;

/// Largest message that is still written atomically to a pipe.
pub const HANDOFF_MAX_LEN: usize = libc::PIPE_BUF;

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct HandoffMessage {
    pub descriptor_number: RawFd,
    pub file_path: PathBuf,
}

#[derive(Debug)]
pub enum HandoffError {
    /// The channel ended after this many bytes of the message.
    Truncated(usize),
    EmptyPath,
    InteriorNul,
    TooLong(usize),
    BadDescriptor(RawFd),
    /// Output buffer does not have the exact encoded length.
    BufferSize { expected: usize, actual: usize },
    Io(io::Error),
}

impl Display for HandoffError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            HandoffError::Truncated(n) => write!(f, "announcement truncated after {} byte(s)", n),
            HandoffError::EmptyPath => write!(f, "announcement carries an empty path"),
            HandoffError::InteriorNul => write!(f, "announced path contains a NUL byte"),
            HandoffError::TooLong(n) => write!(
                f,
                "announcement of {} bytes exceeds the atomic pipe write size {}",
                n, HANDOFF_MAX_LEN
            ),
            HandoffError::BadDescriptor(fd) => write!(f, "invalid descriptor number {}", fd),
            HandoffError::BufferSize { expected, actual } => write!(
                f,
                "announcement buffer is {} bytes, expected {}",
                actual, expected
            ),
            HandoffError::Io(e) => write!(f, "reading announcement: {}", e),
        }
    }
}

impl Error for HandoffError {}

impl HandoffMessage {
    pub fn encoded_len(path_len: usize) -> usize {
        HANDOFF_HEADER_LEN + path_len
    }

    /// Allocation free. Safe to call between fork() and _exit().
    pub fn encode_into(
        descriptor_number: RawFd,
        path: &[u8],
        out: &mut [u8],
    ) -> Result<(), HandoffError> {
        validate(descriptor_number, path)?;
        let expected = Self::encoded_len(path.len());
        if out.len() != expected {
            return Err(HandoffError::BufferSize {
                expected,
                actual: out.len(),
            });
        }
        out[0..4].copy_from_slice(&(path.len() as u32).to_le_bytes());
        out[4..8].copy_from_slice(&descriptor_number.to_le_bytes());
        out[HANDOFF_HEADER_LEN..].copy_from_slice(path);
        Ok(())
    }

    /// Reads exactly one message.
    pub fn read_from<R: Read>(r: &mut R) -> Result<HandoffMessage, HandoffError> {
        let mut header = [0u8; HANDOFF_HEADER_LEN];
        read_exact_counting(r, &mut header, 0)?;

        let mut len_bytes = [0u8; 4];
        len_bytes.copy_from_slice(&header[0..4]);
        let path_len = u32::from_le_bytes(len_bytes) as usize;
        let mut fd_bytes = [0u8; 4];
        fd_bytes.copy_from_slice(&header[4..8]);
        let descriptor_number = RawFd::from_le_bytes(fd_bytes);

        let total = Self::encoded_len(path_len);
        if total > HANDOFF_MAX_LEN {
            return Err(HandoffError::TooLong(total));
        }
        let mut path = vec![0u8; path_len];
        read_exact_counting(r, &mut path, HANDOFF_HEADER_LEN)?;
        validate(descriptor_number, &path)?;

        Ok(HandoffMessage {
            descriptor_number,
            file_path: PathBuf::from(OsStr::from_bytes(&path)),
        })
    }
}

fn validate(descriptor_number: RawFd, path: &[u8]) -> Result<(), HandoffError> {
    if descriptor_number < 0 {
        return Err(HandoffError::BadDescriptor(descriptor_number));
    }
    if path.is_empty() {
        return Err(HandoffError::EmptyPath);
    }
    if path.contains(&0) {
        return Err(HandoffError::InteriorNul);
    }
    let total = HandoffMessage::encoded_len(path.len());
    if total > HANDOFF_MAX_LEN {
        return Err(HandoffError::TooLong(total));
    }
    Ok(())
}

/// Like `read_exact` but reports how far we got when the channel ends early.
fn read_exact_counting<R: Read>(
    r: &mut R,
    buf: &mut [u8],
    already_read: usize,
) -> Result<(), HandoffError> {
    let mut filled = 0;
    while filled < buf.len() {
        match r.read(&mut buf[filled..]) {
            Ok(0) => return Err(HandoffError::Truncated(already_read + filled)),
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(HandoffError::Io(e)),
        }
    }
    Ok(())
}

#[cfg(test)]
impl HandoffMessage {
    pub fn new(descriptor_number: RawFd, file_path: PathBuf) -> HandoffMessage {
        HandoffMessage {
            descriptor_number,
            file_path,
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, HandoffError> {
        let path = self.file_path.as_os_str().as_bytes();
        let mut out = vec![0u8; Self::encoded_len(path.len())];
        Self::encode_into(self.descriptor_number, path, &mut out)?;
        Ok(out)
    }
}
