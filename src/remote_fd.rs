//! Backends for `dup_remote_fd(remote_fd, remote_pid) -> local_fd`.

use crate::{log::LogLevel::LogDebug, scoped_fd::ScopedFd};
use nix::{errno::Errno, fcntl::OFlag, unistd::Pid};
use std::{
    cell::RefCell,
    fmt,
    fmt::{Display, Formatter},
    os::unix::io::RawFd,
    path::{Path, PathBuf},
    str::FromStr,
};

pub const DEFAULT_EVENTFD_LINK_DEVICE: &str = "/dev/eventfd-link";

/// The duplication primitive under test.
///
/// On success the returned descriptor must refer to the same open-file
/// object as `remote_fd` does inside `remote_pid`.
pub trait RemoteFdDuplicator {
    fn name(&self) -> &'static str;

    fn dup_remote_fd(&self, remote_fd: RawFd, remote_pid: Pid) -> nix::Result<ScopedFd>;
}

impl<T: RemoteFdDuplicator + ?Sized> RemoteFdDuplicator for Box<T> {
    fn name(&self) -> &'static str {
        (**self).name()
    }

    fn dup_remote_fd(&self, remote_fd: RawFd, remote_pid: Pid) -> nix::Result<ScopedFd> {
        (**self).dup_remote_fd(remote_fd, remote_pid)
    }
}

/// `pidfd_open(2)` followed by `pidfd_getfd(2)`. Needs Linux 5.6 and
/// ptrace access to the target.
///
/// The pidfd of the most recent target is kept open, so repeated steals from
/// one process create a single new file object each.
pub struct PidfdGetfd {
    target: RefCell<Option<(Pid, ScopedFd)>>,
}

impl PidfdGetfd {
    pub fn new() -> PidfdGetfd {
        PidfdGetfd {
            target: RefCell::new(None),
        }
    }
}

fn pidfd_open(pid: Pid) -> nix::Result<ScopedFd> {
    let ret = unsafe { libc::syscall(libc::SYS_pidfd_open, pid.as_raw(), 0) };
    let fd = Errno::result(ret)?;
    Ok(ScopedFd::from_raw(fd as RawFd))
}

/// The flags argument is reserved and must be zero. The result is always
/// close-on-exec.
fn pidfd_getfd(pidfd: &ScopedFd, targetfd: RawFd) -> nix::Result<ScopedFd> {
    let ret = unsafe { libc::syscall(libc::SYS_pidfd_getfd, pidfd.as_raw(), targetfd, 0) };
    let fd = Errno::result(ret)?;
    Ok(ScopedFd::from_raw(fd as RawFd))
}

impl RemoteFdDuplicator for PidfdGetfd {
    fn name(&self) -> &'static str {
        "pidfd"
    }

    fn dup_remote_fd(&self, remote_fd: RawFd, remote_pid: Pid) -> nix::Result<ScopedFd> {
        let mut target = self.target.borrow_mut();
        if let Some((pid, pidfd)) = &*target {
            if *pid == remote_pid {
                return pidfd_getfd(pidfd, remote_fd);
            }
        }
        let pidfd = pidfd_open(remote_pid)?;
        log!(LogDebug, "Opened pidfd {} for {}", pidfd.as_raw(), remote_pid);
        let stolen = pidfd_getfd(&pidfd, remote_fd);
        *target = Some((remote_pid, pidfd));
        stolen
    }
}

bitflags! {
    /// Flags word of the `eventfd_link` copy request.
    pub struct DupFlags: libc::c_int {
        const CLOEXEC = libc::O_CLOEXEC;
    }
}

/// Request block of the `EVENTFD_COPY2` ioctl. The ioctl returns the new
/// descriptor.
#[repr(C)]
#[derive(Copy, Clone, Debug, Default)]
pub struct EventfdCopy2 {
    pub fd: libc::c_int,
    pub pid: libc::pid_t,
    pub flags: libc::c_int,
}

/// Request number and block layout follow DPDK's vhost `eventfd_link`
/// module (`eventfd_link.h`). Not encoded with `_IOW`; the module dispatches
/// on the bare number.
const EVENTFD_COPY2: libc::c_ulong = 2;

/// The `eventfd_link` kernel module's character device.
pub struct EventfdLinkDevice {
    device: ScopedFd,
    flags: DupFlags,
}

impl EventfdLinkDevice {
    pub fn open<P: AsRef<Path>>(path: P, flags: DupFlags) -> nix::Result<EventfdLinkDevice> {
        let device = ScopedFd::open_path(path.as_ref(), OFlag::O_RDWR | OFlag::O_CLOEXEC)?;
        log!(
            LogDebug,
            "Opened {:?} as fd {}",
            path.as_ref(),
            device.as_raw()
        );
        Ok(EventfdLinkDevice { device, flags })
    }
}

impl RemoteFdDuplicator for EventfdLinkDevice {
    fn name(&self) -> &'static str {
        "eventfd-link"
    }

    fn dup_remote_fd(&self, remote_fd: RawFd, remote_pid: Pid) -> nix::Result<ScopedFd> {
        let req = EventfdCopy2 {
            fd: remote_fd,
            pid: remote_pid.as_raw(),
            flags: self.flags.bits(),
        };
        let ret = unsafe {
            libc::ioctl(
                self.device.as_raw(),
                EVENTFD_COPY2 as _,
                &req as *const EventfdCopy2,
            )
        };
        let fd = Errno::result(ret)?;
        Ok(ScopedFd::from_raw(fd))
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Backend {
    Pidfd,
    EventfdLink(PathBuf),
}

impl Backend {
    pub fn open(&self) -> nix::Result<Box<dyn RemoteFdDuplicator>> {
        match self {
            Backend::Pidfd => Ok(Box::new(PidfdGetfd::new())),
            Backend::EventfdLink(device) => {
                Ok(Box::new(EventfdLinkDevice::open(device, DupFlags::CLOEXEC)?))
            }
        }
    }
}

impl Display for Backend {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Backend::Pidfd => write!(f, "pidfd"),
            Backend::EventfdLink(device) => write!(f, "eventfd-link ({:?})", device),
        }
    }
}

/// Parses `pidfd`, `eventfd-link` or `eventfd-link=<device>`.
impl FromStr for Backend {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pidfd" => Ok(Backend::Pidfd),
            "eventfd-link" => Ok(Backend::EventfdLink(PathBuf::from(
                DEFAULT_EVENTFD_LINK_DEVICE,
            ))),
            _ => match s.strip_prefix("eventfd-link=") {
                Some(device) if !device.is_empty() => {
                    Ok(Backend::EventfdLink(PathBuf::from(device)))
                }
                _ => Err(format!(
                    "Unknown backend `{}'. Expected `pidfd', `eventfd-link' or `eventfd-link=<device>'",
                    s
                )),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nix::{
        fcntl::{fcntl, FcntlArg, FdFlag},
        unistd::{close, getpid, pipe, read, write},
    };

    /// pidfd_getfd may be missing (old kernel) or forbidden (seccomp,
    /// ptrace restrictions) where the tests run.
    fn pidfd_unavailable(e: Errno) -> bool {
        e == Errno::ENOSYS || e == Errno::EPERM || e == Errno::EACCES
    }

    #[test]
    fn pidfd_duplicate_shares_the_open_file() {
        let (r, w) = pipe().unwrap();
        let dup = match PidfdGetfd::new().dup_remote_fd(w, getpid()) {
            Ok(dup) => dup,
            Err(e) if pidfd_unavailable(e) => {
                close(r).unwrap();
                close(w).unwrap();
                return;
            }
            Err(e) => panic!("pidfd_getfd failed: {}", e),
        };
        assert_ne!(w, dup.as_raw());
        let flags = FdFlag::from_bits_truncate(fcntl(dup.as_raw(), FcntlArg::F_GETFD).unwrap());
        assert!(flags.contains(FdFlag::FD_CLOEXEC));

        write(dup.as_raw(), b"via dup").unwrap();
        let mut buf = [0u8; 16];
        let n = read(r, &mut buf).unwrap();
        assert_eq!(b"via dup", &buf[..n]);
        close(r).unwrap();
        close(w).unwrap();
    }

    #[test]
    fn pidfd_rejects_closed_remote_descriptor() {
        // Far above any descriptor a test thread could have open.
        let never_open: RawFd = 1 << 20;
        match PidfdGetfd::new().dup_remote_fd(never_open, getpid()) {
            Ok(_) => panic!("duplicated a descriptor that is not open"),
            Err(e) if pidfd_unavailable(e) => (),
            Err(e) => assert_eq!(Errno::EBADF, e),
        }
    }

    #[test]
    fn pidfd_is_opened_once_per_target() {
        let steal = PidfdGetfd::new();
        let cached = || steal.target.borrow().as_ref().map(|(p, fd)| (*p, fd.as_raw()));
        let first = match steal.dup_remote_fd(2, getpid()) {
            Ok(fd) => fd,
            Err(e) if pidfd_unavailable(e) => return,
            Err(e) => panic!("pidfd_getfd failed: {}", e),
        };
        let held = cached().unwrap();
        assert_eq!(getpid(), held.0);
        drop(first);

        for _ in 0..3 {
            steal.dup_remote_fd(2, getpid()).unwrap();
            assert_eq!(Some(held), cached());
        }
    }

    #[test]
    fn missing_device_fails_to_open() {
        let res = EventfdLinkDevice::open("/nonexistent/eventfd-link", DupFlags::CLOEXEC);
        assert_eq!(Errno::ENOENT, res.err().unwrap());
    }

    #[test]
    fn parses_backends() {
        assert_eq!(Backend::Pidfd, "pidfd".parse().unwrap());
        assert_eq!(
            Backend::EventfdLink(PathBuf::from(DEFAULT_EVENTFD_LINK_DEVICE)),
            "eventfd-link".parse().unwrap()
        );
        assert_eq!(
            Backend::EventfdLink(PathBuf::from("/dev/my-link")),
            "eventfd-link=/dev/my-link".parse().unwrap()
        );
        assert!("eventfd-link=".parse::<Backend>().is_err());
        assert!("ptrace".parse::<Backend>().is_err());
    }

    #[test]
    fn request_block_layout() {
        assert_eq!(12, std::mem::size_of::<EventfdCopy2>());
        assert_eq!(4, std::mem::align_of::<EventfdCopy2>());
        assert_eq!(2, EVENTFD_COPY2);

        let req = EventfdCopy2 {
            fd: 42,
            pid: 4242,
            flags: DupFlags::CLOEXEC.bits(),
        };
        let base = &req as *const EventfdCopy2 as usize;
        assert_eq!(0, &req.fd as *const libc::c_int as usize - base);
        assert_eq!(4, &req.pid as *const libc::pid_t as usize - base);
        assert_eq!(8, &req.flags as *const libc::c_int as usize - base);
        assert_eq!(libc::O_CLOEXEC, req.flags);
    }
}
