use nix::{
    fcntl::{open, OFlag},
    sys::stat::Mode,
    unistd::{close, lseek, read, Whence},
    NixPath,
};
use std::{io, os::unix::io::RawFd};

/// Owns a raw descriptor and closes it on drop.
// We DON'T want this to be Copy or Clone because of the Drop.
#[derive(Debug)]
pub struct ScopedFd {
    fd: RawFd,
}

impl ScopedFd {
    pub fn from_raw(fd: RawFd) -> Self {
        ScopedFd { fd }
    }

    pub fn open_path<P: ?Sized + NixPath>(path: &P, oflag: OFlag) -> nix::Result<Self> {
        let rawfd = open(path, oflag, Mode::empty())?;
        Ok(ScopedFd { fd: rawfd })
    }

    pub fn close(&mut self) {
        if self.fd >= 0 {
            // We swallow any error on close
            close(self.fd).unwrap_or(());
        }

        self.fd = -1;
    }

    pub fn as_raw(&self) -> RawFd {
        self.fd
    }

    pub fn unwrap(&self) -> RawFd {
        if self.fd < 0 {
            fatal!("fd is closed");
        }
        self.fd
    }

    /// Repositions to the start of the underlying open-file object.
    pub fn rewind(&self) -> nix::Result<()> {
        lseek(self.unwrap(), 0, Whence::SeekSet)?;
        Ok(())
    }

    /// Reads until EOF or until `limit` bytes have been read.
    pub fn read_up_to(&self, limit: usize) -> nix::Result<Vec<u8>> {
        let fd = self.unwrap();
        let mut buf = vec![0u8; limit];
        let mut filled = 0;
        while filled < limit {
            match read(fd, &mut buf[filled..]) {
                Ok(0) => break,
                Ok(nread) => filled += nread,
                Err(nix::errno::Errno::EINTR) => continue,
                Err(e) => return Err(e),
            }
        }
        buf.truncate(filled);
        Ok(buf)
    }
}

impl io::Read for ScopedFd {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        read(self.unwrap(), buf).map_err(|e| io::Error::from_raw_os_error(e as i32))
    }
}

impl Drop for ScopedFd {
    fn drop(&mut self) {
        self.close()
    }
}
