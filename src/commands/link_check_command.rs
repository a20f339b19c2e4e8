//! Checks that a stolen descriptor refers to the *same* open file as the
//! original, not merely a fresh open of the same path.
//!
//! 0. build the temp file template and the announcement buffer
//! 1. open a pipe and fork
//! 2. the producer creates a temp file and dups it to the agreed slot
//! 3. the producer writes the salt, fsyncs, and announces {slot, path}
//! 4. the consumer steals the slot from the producer
//! 5. the consumer reads the stolen fd from offset 0 and compares
//! 6. the consumer removes the temp file, kills and reaps the producer

use crate::{
    commands::{check_error::CheckError, exit_result::ExitResult, FdStealCommand},
    handoff::{HandoffError, HandoffMessage, HANDOFF_MAX_LEN},
    kernel_metadata::wait_status_name,
    log::LogLevel::{LogDebug, LogError, LogInfo, LogWarn},
    remote_fd::RemoteFdDuplicator,
    scoped_fd::ScopedFd,
};
use nix::{
    errno::Errno,
    fcntl::{fcntl, FcntlArg, OFlag},
    sys::{
        signal::{kill, Signal},
        wait::waitpid,
    },
    unistd::{close, dup2, fork, fsync, pause, pipe2, unlink, write, ForkResult, Pid},
};
use serde::Serialize;
use std::{
    io,
    io::{stdout, Write},
    os::unix::{ffi::OsStringExt, io::RawFd},
    path::{Path, PathBuf},
};

pub const SALT: &[u8] = b"The Life, the Universe and everything";
pub const DEFAULT_SLOT: RawFd = 42;

/// Size of the buffer the stolen fd is read into.
const READ_LIMIT: usize = 1024;

pub struct LinkCheckConfig {
    /// Descriptor number the producer parks its temp file at.
    pub slot: RawFd,
    pub tmp_dir: PathBuf,
    /// Treat a content mismatch as a failure (exit status 2).
    pub strict: bool,
    pub json: bool,
}

impl Default for LinkCheckConfig {
    fn default() -> Self {
        LinkCheckConfig {
            slot: DEFAULT_SLOT,
            tmp_dir: PathBuf::from("/tmp"),
            strict: false,
            json: false,
        }
    }
}

#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
#[serde(tag = "verdict", rename_all = "snake_case")]
pub enum LinkVerdict {
    Linked,
    NotLinked { observed: String },
}

impl LinkVerdict {
    fn from_observed(observed: &[u8]) -> LinkVerdict {
        if observed == SALT {
            LinkVerdict::Linked
        } else {
            LinkVerdict::NotLinked {
                observed: String::from_utf8_lossy(observed).into_owned(),
            }
        }
    }
}

/// Everything learned from one run of the scenario. By the time this exists
/// the producer has been killed and reaped and the temp file removed.
#[derive(Debug)]
pub struct LinkOutcome {
    pub producer: Option<Pid>,
    pub announcement: Option<HandoffMessage>,
    pub result: Result<LinkVerdict, CheckError>,
}

impl LinkOutcome {
    fn not_attempted(e: CheckError) -> LinkOutcome {
        LinkOutcome {
            producer: None,
            announcement: None,
            result: Err(e),
        }
    }
}

#[derive(Serialize)]
struct LinkReport<'a> {
    backend: &'static str,
    producer_pid: Option<i32>,
    descriptor_number: Option<RawFd>,
    temp_path: Option<&'a Path>,
    #[serde(flatten)]
    verdict: Option<&'a LinkVerdict>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

/// The forked producer, as seen from the consumer. Dropping it removes the
/// temp file (if its path is known), SIGKILLs the producer and reaps it.
struct Producer {
    pid: Pid,
    temp_path: Option<PathBuf>,
}

impl Drop for Producer {
    fn drop(&mut self) {
        if let Some(path) = self.temp_path.take() {
            if let Err(e) = unlink(path.as_path()) {
                log!(LogWarn, "Could not remove {:?}: {}", path, e);
            }
        }

        if let Err(e) = kill(self.pid, Signal::SIGKILL) {
            // ESRCH cannot happen before we reap, but the zombie still needs reaping.
            log!(LogWarn, "Could not kill producer {}: {}", self.pid, e);
        }

        loop {
            match waitpid(self.pid, None) {
                Ok(status) => {
                    log!(LogDebug, "Reaped producer: {}", wait_status_name(&status));
                    break;
                }
                Err(Errno::EINTR) => continue,
                Err(e) => {
                    log!(LogError, "Could not reap producer {}: {}", self.pid, e);
                    break;
                }
            }
        }
    }
}

pub struct LinkCheckCommand<D: RemoteFdDuplicator> {
    config: LinkCheckConfig,
    duplicator: D,
}

impl<D: RemoteFdDuplicator> LinkCheckCommand<D> {
    pub fn new(config: LinkCheckConfig, duplicator: D) -> LinkCheckCommand<D> {
        LinkCheckCommand { config, duplicator }
    }

    /// Runs the scenario once. Cleanup has completed on every path out of here.
    pub fn check(&self) -> LinkOutcome {
        let slot = self.config.slot;
        if slot < 0 {
            return LinkOutcome::not_attempted(HandoffError::BadDescriptor(slot).into());
        }

        // After fork() the producer must not allocate: everything it touches
        // is sized here.
        let mut template = match temp_template(&self.config.tmp_dir) {
            Ok(t) => t,
            Err(e) => return LinkOutcome::not_attempted(e),
        };
        let mut message = vec![0u8; HandoffMessage::encoded_len(template.len() - 1)];

        let (read_end, write_end) = match pipe2(OFlag::O_CLOEXEC) {
            Ok((r, w)) => (ScopedFd::from_raw(r), ScopedFd::from_raw(w)),
            Err(e) => {
                log!(LogError, "Unsuccessful call to pipe2: {}", e);
                return LinkOutcome::not_attempted(CheckError::ipc("pipe")(e));
            }
        };

        match unsafe { fork() } {
            Err(e) => {
                log!(LogError, "Failed to fork producer: {}", e);
                LinkOutcome::not_attempted(CheckError::ipc("fork")(e))
            }
            Ok(ForkResult::Child) => run_producer(
                read_end.as_raw(),
                write_end.as_raw(),
                slot,
                &mut template,
                &mut message,
            ),
            Ok(ForkResult::Parent { child }) => {
                let mut write_end = write_end;
                write_end.close();
                log!(LogDebug, "Forked producer {}", child);

                let mut producer = Producer {
                    pid: child,
                    temp_path: None,
                };
                let mut announcement = None;
                let result = self.consume(&mut producer, read_end, &mut announcement);
                drop(producer);

                LinkOutcome {
                    producer: Some(child),
                    announcement,
                    result,
                }
            }
        }
    }

    fn consume(
        &self,
        producer: &mut Producer,
        mut read_end: ScopedFd,
        announcement: &mut Option<HandoffMessage>,
    ) -> Result<LinkVerdict, CheckError> {
        let maybe_msg = HandoffMessage::read_from(&mut read_end);
        read_end.close();
        let msg = match maybe_msg {
            Ok(msg) => msg,
            Err(e) => {
                log!(LogError, "Producer {} did not announce: {}", producer.pid, e);
                return Err(e.into());
            }
        };
        log!(
            LogInfo,
            "Producer {} holds {:?} at fd {}",
            producer.pid,
            msg.file_path,
            msg.descriptor_number
        );
        producer.temp_path = Some(msg.file_path.clone());
        *announcement = Some(msg.clone());

        let stolen = self
            .duplicator
            .dup_remote_fd(msg.descriptor_number, producer.pid)
            .map_err(|err| {
                log!(
                    LogError,
                    "{} could not steal fd {} from {}",
                    self.duplicator.name(),
                    msg.descriptor_number,
                    producer.pid
                );
                CheckError::Primitive {
                    remote_fd: msg.descriptor_number,
                    remote_pid: producer.pid,
                    err,
                }
            })?;

        stolen.rewind().map_err(CheckError::ipc("lseek"))?;
        let observed = stolen
            .read_up_to(READ_LIMIT)
            .map_err(CheckError::ipc("read stolen salt"))?;
        Ok(LinkVerdict::from_observed(&observed))
    }

    fn report(&self, outcome: &LinkOutcome, out: &mut dyn Write) -> io::Result<()> {
        if self.config.json {
            let report = LinkReport {
                backend: self.duplicator.name(),
                producer_pid: outcome.producer.map(|p| p.as_raw()),
                descriptor_number: outcome.announcement.as_ref().map(|m| m.descriptor_number),
                temp_path: outcome.announcement.as_ref().map(|m| m.file_path.as_path()),
                verdict: outcome.result.as_ref().ok(),
                error: outcome.result.as_ref().err().map(|e| e.to_string()),
            };
            serde_json::to_writer_pretty(&mut *out, &report)?;
            return writeln!(out);
        }

        match &outcome.result {
            Ok(LinkVerdict::Linked) => writeln!(out, "Stealing FD OK"),
            Ok(LinkVerdict::NotLinked { observed }) => {
                eprintln!(
                    "dup_remote_fd appears to not be linking correctly: expected {:?}, read {:?}",
                    String::from_utf8_lossy(SALT),
                    observed
                );
                writeln!(out, "Stealing FD failed")
            }
            Err(_) => Ok(()),
        }
    }
}

impl<D: RemoteFdDuplicator> FdStealCommand for LinkCheckCommand<D> {
    fn run(&mut self) -> ExitResult<()> {
        let outcome = self.check();
        if let Err(e) = self.report(&outcome, &mut stdout()) {
            return ExitResult::err_from(e, 1);
        }
        match outcome.result {
            Ok(LinkVerdict::Linked) => ExitResult::Ok(()),
            Ok(LinkVerdict::NotLinked { .. }) if self.config.strict => {
                let e = CheckError::NotLinked;
                let code = e.exit_code();
                ExitResult::err_from(e, code)
            }
            Ok(LinkVerdict::NotLinked { .. }) => ExitResult::Ok(()),
            Err(e) => {
                let code = e.exit_code();
                ExitResult::err_from(e, code)
            }
        }
    }
}

/// `<tmp_dir>/linkXXXXXX` as a NUL terminated buffer mkstemp can fill in.
fn temp_template(tmp_dir: &Path) -> Result<Vec<u8>, CheckError> {
    let mut template = tmp_dir.join("linkXXXXXX").into_os_string().into_vec();
    if template.contains(&0) {
        return Err(HandoffError::InteriorNul.into());
    }
    let needed = HandoffMessage::encoded_len(template.len());
    if needed > HANDOFF_MAX_LEN {
        return Err(HandoffError::TooLong(needed).into());
    }
    template.push(0);
    Ok(template)
}

/// Producer side. Only async-signal-safe calls from here on: no allocation,
/// no locks, no logging. Never returns.
fn run_producer(
    read_end: RawFd,
    write_end: RawFd,
    slot: RawFd,
    template: &mut [u8],
    message: &mut [u8],
) -> ! {
    close(read_end).unwrap_or(());

    // The pipe may itself sit at the slot we are about to take over.
    let write_end = if write_end == slot {
        match fcntl(write_end, FcntlArg::F_DUPFD_CLOEXEC(slot + 1)) {
            Ok(fd) => fd,
            Err(_) => producer_fail(b"moving the pipe off the slot"),
        }
    } else {
        write_end
    };

    let fd = unsafe { libc::mkstemp(template.as_mut_ptr() as *mut libc::c_char) };
    if fd < 0 {
        producer_fail(b"mkstemp");
    }

    if fd != slot {
        if dup2(fd, slot).is_err() {
            producer_abandon(template, b"dup2");
        }
        close(fd).unwrap_or(());
    }

    if write_all_raw(slot, SALT).is_err() {
        producer_abandon(template, b"write salt");
    }

    // The consumer must never see a partially written salt.
    if fsync(slot).is_err() {
        producer_abandon(template, b"fsync");
    }

    let path = &template[..template.len() - 1];
    if HandoffMessage::encode_into(slot, path, message).is_err() {
        producer_abandon(template, b"encode announcement");
    }
    // Fits in PIPE_BUF so this write is atomic.
    match write(write_end, message) {
        Ok(n) if n == message.len() => (),
        _ => producer_abandon(template, b"write pipe"),
    }
    close(write_end).unwrap_or(());

    // Hold the slot open until the consumer kills us.
    loop {
        pause();
    }
}

fn write_all_raw(fd: RawFd, mut buf: &[u8]) -> nix::Result<()> {
    while !buf.is_empty() {
        match write(fd, buf) {
            Ok(0) => return Err(Errno::EIO),
            Ok(n) => buf = &buf[n..],
            Err(Errno::EINTR) => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

/// Removes the temp file the consumer will never hear about, then exits.
fn producer_abandon(template: &[u8], what: &'static [u8]) -> ! {
    unsafe { libc::unlink(template.as_ptr() as *const libc::c_char) };
    producer_fail(what)
}

fn producer_fail(what: &'static [u8]) -> ! {
    write(libc::STDERR_FILENO, b"fdsteal producer: ").unwrap_or(0);
    write(libc::STDERR_FILENO, what).unwrap_or(0);
    write(libc::STDERR_FILENO, b" failed\n").unwrap_or(0);
    unsafe { libc::_exit(1) }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote_fd::PidfdGetfd;
    use std::cell::RefCell;

    /// Opens `/proc/<pid>/fd/<n>`. That is a *new* open of the same file, so
    /// it sees the salt but does not prove linking.
    struct ProcFdReopen {
        calls: RefCell<Vec<(RawFd, Pid)>>,
    }

    impl ProcFdReopen {
        fn new() -> ProcFdReopen {
            ProcFdReopen {
                calls: RefCell::new(Vec::new()),
            }
        }
    }

    impl RemoteFdDuplicator for ProcFdReopen {
        fn name(&self) -> &'static str {
            "proc-reopen"
        }

        fn dup_remote_fd(&self, remote_fd: RawFd, remote_pid: Pid) -> nix::Result<ScopedFd> {
            self.calls.borrow_mut().push((remote_fd, remote_pid));
            let path = format!("/proc/{}/fd/{}", remote_pid, remote_fd);
            ScopedFd::open_path(path.as_str(), OFlag::O_RDONLY | OFlag::O_CLOEXEC)
        }
    }

    /// Hands back an unrelated, empty file.
    struct DevNull;

    impl RemoteFdDuplicator for DevNull {
        fn name(&self) -> &'static str {
            "dev-null"
        }

        fn dup_remote_fd(&self, _remote_fd: RawFd, _remote_pid: Pid) -> nix::Result<ScopedFd> {
            ScopedFd::open_path("/dev/null", OFlag::O_RDONLY | OFlag::O_CLOEXEC)
        }
    }

    struct AlwaysFails;

    impl RemoteFdDuplicator for AlwaysFails {
        fn name(&self) -> &'static str {
            "always-fails"
        }

        fn dup_remote_fd(&self, _remote_fd: RawFd, _remote_pid: Pid) -> nix::Result<ScopedFd> {
            Err(Errno::EPERM)
        }
    }

    fn assert_cleaned_up(outcome: &LinkOutcome) {
        let pid = outcome.producer.expect("producer was forked");
        // Reaped children are gone entirely, zombies would still answer.
        assert_eq!(Err(Errno::ESRCH), kill(pid, None));
        if let Some(msg) = &outcome.announcement {
            assert!(!msg.file_path.exists(), "{:?} left behind", msg.file_path);
        }
    }

    #[test]
    fn reopened_file_reads_back_the_salt() {
        let command = LinkCheckCommand::new(LinkCheckConfig::default(), ProcFdReopen::new());
        let outcome = command.check();
        assert_eq!(LinkVerdict::Linked, *outcome.result.as_ref().unwrap());

        let msg = outcome.announcement.as_ref().unwrap();
        assert_eq!(DEFAULT_SLOT, msg.descriptor_number);
        let name = msg.file_path.file_name().unwrap().to_string_lossy().into_owned();
        assert!(name.starts_with("link") && name.len() == "linkXXXXXX".len());
        assert_eq!(Path::new("/tmp"), msg.file_path.parent().unwrap());

        let calls = command.duplicator.calls.borrow();
        assert_eq!(vec![(DEFAULT_SLOT, outcome.producer.unwrap())], *calls);
        assert_cleaned_up(&outcome);
    }

    #[test]
    fn slot_travels_in_the_announcement() {
        let config = LinkCheckConfig {
            slot: 57,
            ..Default::default()
        };
        let command = LinkCheckCommand::new(config, ProcFdReopen::new());
        let outcome = command.check();
        assert!(outcome.result.is_ok());
        assert_eq!(57, outcome.announcement.as_ref().unwrap().descriptor_number);
        assert_eq!(57, command.duplicator.calls.borrow()[0].0);
        assert_cleaned_up(&outcome);
    }

    #[test]
    fn unrelated_file_is_not_linked() {
        let command = LinkCheckCommand::new(LinkCheckConfig::default(), DevNull);
        let outcome = command.check();
        assert_eq!(
            LinkVerdict::NotLinked {
                observed: String::new()
            },
            *outcome.result.as_ref().unwrap()
        );
        assert_cleaned_up(&outcome);
    }

    #[test]
    fn primitive_failure_still_cleans_up() {
        let command = LinkCheckCommand::new(LinkCheckConfig::default(), AlwaysFails);
        let outcome = command.check();
        match &outcome.result {
            Err(CheckError::Primitive {
                remote_fd,
                remote_pid,
                err,
            }) => {
                assert_eq!(DEFAULT_SLOT, *remote_fd);
                assert_eq!(outcome.producer.unwrap(), *remote_pid);
                assert_eq!(Errno::EPERM, *err);
            }
            other => panic!("unexpected {:?}", other),
        }
        // The path was learned before the steal failed.
        assert!(outcome.announcement.is_some());
        assert_cleaned_up(&outcome);
    }

    #[test]
    fn producer_that_cannot_create_its_file() {
        // /proc exists but nothing can be created in it.
        let config = LinkCheckConfig {
            tmp_dir: PathBuf::from("/proc"),
            ..Default::default()
        };
        let command = LinkCheckCommand::new(config, ProcFdReopen::new());
        let outcome = command.check();
        assert!(matches!(
            outcome.result,
            Err(CheckError::Handoff(HandoffError::Truncated(0)))
        ));
        assert!(outcome.announcement.is_none());
        assert!(command.duplicator.calls.borrow().is_empty());
        assert_cleaned_up(&outcome);
    }

    #[test]
    fn negative_slot_is_not_attempted() {
        let config = LinkCheckConfig {
            slot: -1,
            ..Default::default()
        };
        let outcome = LinkCheckCommand::new(config, AlwaysFails).check();
        assert!(outcome.producer.is_none());
        assert!(matches!(
            outcome.result,
            Err(CheckError::Handoff(HandoffError::BadDescriptor(-1)))
        ));
    }

    #[test]
    fn template_is_nul_terminated() {
        let t = temp_template(Path::new("/tmp")).unwrap();
        assert_eq!(b"/tmp/linkXXXXXX\0".to_vec(), t);
        let long = PathBuf::from(format!("/{}", "d".repeat(HANDOFF_MAX_LEN)));
        assert!(matches!(
            temp_template(&long),
            Err(CheckError::Handoff(HandoffError::TooLong(_)))
        ));
    }

    #[test]
    fn verdict_requires_exact_bytes() {
        assert_eq!(LinkVerdict::Linked, LinkVerdict::from_observed(SALT));
        let mut trailing = SALT.to_vec();
        trailing.push(b'\n');
        assert!(matches!(
            LinkVerdict::from_observed(&trailing),
            LinkVerdict::NotLinked { .. }
        ));
        assert!(matches!(
            LinkVerdict::from_observed(&SALT[..10]),
            LinkVerdict::NotLinked { .. }
        ));
    }

    #[test]
    fn prints_ok_line() {
        let command = LinkCheckCommand::new(LinkCheckConfig::default(), ProcFdReopen::new());
        let outcome = command.check();
        let mut out = Vec::new();
        command.report(&outcome, &mut out).unwrap();
        assert_eq!("Stealing FD OK\n", String::from_utf8(out).unwrap());
    }

    #[test]
    fn json_report_carries_the_announcement() {
        let config = LinkCheckConfig {
            json: true,
            ..Default::default()
        };
        let command = LinkCheckCommand::new(config, DevNull);
        let outcome = command.check();
        let mut out = Vec::new();
        command.report(&outcome, &mut out).unwrap();
        let v: serde_json::Value = serde_json::from_slice(&out).unwrap();
        assert_eq!("dev-null", v["backend"]);
        assert_eq!(42, v["descriptor_number"]);
        assert_eq!("not_linked", v["verdict"]);
        assert_eq!("", v["observed"]);
        assert_eq!(outcome.producer.unwrap().as_raw() as i64, v["producer_pid"]);
    }

    #[test]
    fn strict_mismatch_exits_with_two() {
        let config = LinkCheckConfig {
            strict: true,
            ..Default::default()
        };
        let mut command = LinkCheckCommand::new(config, DevNull);
        assert_eq!(Some(2), command.run().code());

        let mut lenient = LinkCheckCommand::new(LinkCheckConfig::default(), DevNull);
        assert_eq!(None, lenient.run().code());

        let mut failing = LinkCheckCommand::new(LinkCheckConfig::default(), AlwaysFails);
        assert_eq!(Some(1), failing.run().code());
    }

    #[test]
    fn pidfd_steals_the_same_open_file() {
        let command = LinkCheckCommand::new(LinkCheckConfig::default(), PidfdGetfd::new());
        let outcome = command.check();
        match &outcome.result {
            Ok(verdict) => assert_eq!(LinkVerdict::Linked, *verdict),
            // Old kernel, seccomp or ptrace restrictions.
            Err(CheckError::Primitive { err, .. })
                if *err == Errno::ENOSYS || *err == Errno::EPERM || *err == Errno::EACCES => {}
            Err(e) => panic!("unexpected {}", e),
        }
        assert_cleaned_up(&outcome);
    }
}
