use crate::{
    commands::{
        leak_check_command::{LeakCheckConfig, DEFAULT_ITERATIONS},
        link_check_command::LinkCheckConfig,
    },
    remote_fd::Backend,
};
use std::{ffi::OsString, io, os::unix::io::RawFd, path::PathBuf};
use structopt::{clap, clap::AppSettings, StructOpt};

#[derive(Debug, StructOpt)]
#[structopt(
    name = "fdsteal",
    about = "Checks a primitive that duplicates a file descriptor out of another process",
    after_help = "Use FDSTEAL_LOG to control logging; e.g. FDSTEAL_LOG=all:warn,link_check_command:debug\n\
                  Temporary files go to FDSTEAL_TMPDIR, TMPDIR or /tmp."
)]
#[structopt(global_settings = &[AppSettings::UnifiedHelpMessage])]
pub struct FdStealOptions {
    /// Checks that there is no `struct file' leakage by ensuring that `/proc/sys/fs/file-nr'
    /// is not growing while duplicating <count> times (default is 100000)
    #[structopt(long = "file-nr", value_name = "count", conflicts_with = "check")]
    pub file_nr: Option<Option<u64>>,

    /// Checks that the stolen fd refers to the same open file as the original
    #[structopt(long)]
    pub check: bool,

    /// Duplication primitive: `pidfd', `eventfd-link' or `eventfd-link=<device>'
    #[structopt(long, default_value = "pidfd")]
    pub backend: Backend,

    /// Descriptor slot the producer holds its temporary file at (--check)
    #[structopt(long, default_value = "42")]
    pub slot: RawFd,

    /// Exit with status 2 when the stolen fd's content does not match (--check)
    #[structopt(long)]
    pub strict: bool,

    /// Fail when file-nr grows by more than this many files (--file-nr)
    #[structopt(long, value_name = "files")]
    pub max_growth: Option<u64>,

    /// Print a JSON report on stdout instead of the plain text lines
    #[structopt(long)]
    pub json: bool,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Mode {
    FileNr(u64),
    Check,
}

/// What the dispatcher should do with the command line.
#[derive(Debug)]
pub enum Invocation {
    /// No arguments at all.
    Usage,
    /// Help or version was requested; clap prints it and exits 0.
    Info(clap::Error),
    Run(FdStealOptions, Mode),
    /// Unparseable arguments or no mode selected.
    Invalid(Option<clap::Error>),
}

impl FdStealOptions {
    pub fn invocation<I, T>(args: I) -> Invocation
    where
        I: IntoIterator<Item = T>,
        T: Into<OsString> + Clone,
    {
        let args: Vec<OsString> = args.into_iter().map(Into::into).collect();
        if args.len() < 2 {
            return Invocation::Usage;
        }
        match FdStealOptions::from_iter_safe(args) {
            Ok(options) => match options.mode() {
                Some(mode) => Invocation::Run(options, mode),
                None => Invocation::Invalid(None),
            },
            Err(e)
                if e.kind == clap::ErrorKind::HelpDisplayed
                    || e.kind == clap::ErrorKind::VersionDisplayed =>
            {
                Invocation::Info(e)
            }
            Err(e) => Invocation::Invalid(Some(e)),
        }
    }

    pub fn mode(&self) -> Option<Mode> {
        match (self.file_nr, self.check) {
            (Some(count), false) => Some(Mode::FileNr(count.unwrap_or(DEFAULT_ITERATIONS))),
            (None, true) => Some(Mode::Check),
            _ => None,
        }
    }

    pub fn leak_check_config(&self, iterations: u64) -> LeakCheckConfig {
        LeakCheckConfig {
            iterations,
            max_growth: self.max_growth,
            json: self.json,
        }
    }

    pub fn link_check_config(&self, tmp_dir: PathBuf) -> LinkCheckConfig {
        LinkCheckConfig {
            slot: self.slot,
            tmp_dir,
            strict: self.strict,
            json: self.json,
        }
    }
}

pub fn write_usage(mut out: &mut dyn io::Write) -> io::Result<()> {
    FdStealOptions::clap()
        .write_help(&mut out)
        .map_err(|e| io::Error::new(io::ErrorKind::Other, e.to_string()))?;
    writeln!(out)
}
