use crate::{
    commands::{check_error::CheckError, exit_result::ExitResult, FdStealCommand},
    file_nr::{CounterSample, FileCounter},
    log::LogLevel::{LogDebug, LogError, LogInfo},
    remote_fd::RemoteFdDuplicator,
};
use nix::unistd::getpid;
use serde::Serialize;
use std::{
    io::{stdout, Write},
    os::unix::io::RawFd,
};

pub const DEFAULT_ITERATIONS: u64 = 100000;

/// Any descriptor that is always open will do. We steal our own stderr.
pub const LEAK_CHECK_TARGET_FD: RawFd = 2;

const PROGRESS_EVERY: u64 = 10000;

pub struct LeakCheckConfig {
    pub iterations: u64,
    /// Without a tolerance the before/after samples are only printed.
    pub max_growth: Option<u64>,
    pub json: bool,
}

impl Default for LeakCheckConfig {
    fn default() -> Self {
        LeakCheckConfig {
            iterations: DEFAULT_ITERATIONS,
            max_growth: None,
            json: false,
        }
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct LeakReport {
    pub backend: &'static str,
    pub iterations_requested: u64,
    pub iterations_completed: u64,
    pub before: CounterSample,
    pub after: CounterSample,
}

impl LeakReport {
    pub fn growth(&self) -> Option<i64> {
        match (self.before.value, self.after.value) {
            (Some(before), Some(after)) => Some(after as i64 - before as i64),
            _ => None,
        }
    }
}

pub struct LeakCheckCommand<D: RemoteFdDuplicator, C: FileCounter> {
    config: LeakCheckConfig,
    duplicator: D,
    counter: C,
}

impl<D: RemoteFdDuplicator, C: FileCounter> LeakCheckCommand<D, C> {
    pub fn new(config: LeakCheckConfig, duplicator: D, counter: C) -> LeakCheckCommand<D, C> {
        LeakCheckCommand {
            config,
            duplicator,
            counter,
        }
    }

    /// Duplicates and immediately closes `LEAK_CHECK_TARGET_FD` of this
    /// process `iterations` times, sampling the open file count around it.
    pub fn check(&self, out: &mut dyn Write) -> Result<LeakReport, CheckError> {
        let iterations = self.config.iterations;
        let pid = getpid();

        eprintln!(
            "dummy dup_remote_fd check for {} file(s) using {}",
            iterations,
            self.duplicator.name()
        );
        let before = CounterSample::take(&self.counter);
        if !self.config.json {
            writeln!(out, "file-nr before: {}", before)?;
        }

        for i in 0..iterations {
            match self.duplicator.dup_remote_fd(LEAK_CHECK_TARGET_FD, pid) {
                // Dropping closes it.
                Ok(stolen) => drop(stolen),
                Err(err) => {
                    log!(
                        LogError,
                        "dup_remote_fd failed on iteration {} of {}",
                        i + 1,
                        iterations
                    );
                    return Err(CheckError::Primitive {
                        remote_fd: LEAK_CHECK_TARGET_FD,
                        remote_pid: pid,
                        err,
                    });
                }
            }
            if (i + 1) % PROGRESS_EVERY == 0 && is_logging!(LogDebug) {
                log!(LogDebug, "{} of {} duplications done", i + 1, iterations);
            }
        }

        let after = CounterSample::take(&self.counter);
        let report = LeakReport {
            backend: self.duplicator.name(),
            iterations_requested: iterations,
            iterations_completed: iterations,
            before,
            after,
        };
        if self.config.json {
            serde_json::to_writer_pretty(&mut *out, &report)
                .map_err(|e| CheckError::Io(e.into()))?;
            writeln!(out)?;
        } else {
            writeln!(out, "file-nr after: {}", report.after)?;
        }

        if let Some(growth) = report.growth() {
            log!(LogInfo, "file-nr changed by {} over {} iterations", growth, iterations);
        }
        self.check_growth(&report)?;
        Ok(report)
    }

    fn check_growth(&self, report: &LeakReport) -> Result<(), CheckError> {
        let tolerance = match self.config.max_growth {
            Some(tolerance) => tolerance,
            None => return Ok(()),
        };
        match (report.before.value, report.after.value) {
            (Some(before), Some(after)) if after > before.saturating_add(tolerance) => {
                Err(CheckError::Growth {
                    before,
                    after,
                    tolerance,
                })
            }
            (Some(_), Some(_)) => Ok(()),
            _ => Err(CheckError::CounterUnavailable),
        }
    }
}

impl<D: RemoteFdDuplicator, C: FileCounter> FdStealCommand for LeakCheckCommand<D, C> {
    fn run(&mut self) -> ExitResult<()> {
        match self.check(&mut stdout()) {
            Ok(_) => ExitResult::Ok(()),
            Err(e) => {
                let code = e.exit_code();
                ExitResult::err_from(e, code)
            }
        }
    }
}
