#[macro_use]
extern crate bitflags;
#[macro_use]
extern crate lazy_static;

#[macro_use]
mod log;
mod commands;
mod file_nr;
mod handoff;
mod kernel_metadata;
mod remote_fd;
mod scoped_fd;
mod util;

use crate::{
    commands::{
        check_error::CheckError,
        exit_result::ExitResult,
        fdsteal_options::{write_usage, FdStealOptions, Invocation, Mode},
        leak_check_command::LeakCheckCommand,
        link_check_command::LinkCheckCommand,
        FdStealCommand,
    },
    file_nr::ProcFileNr,
    log::LogLevel::LogError,
    remote_fd::RemoteFdDuplicator,
};
use std::{env, io::stderr};
use structopt::clap;

fn main() -> ExitResult<()> {
    match FdStealOptions::invocation(env::args_os()) {
        Invocation::Usage => {
            write_usage(&mut stderr()).unwrap_or(());
            ExitResult::Ok(())
        }
        Invocation::Info(e) => e.exit(),
        Invocation::Invalid(maybe_err) => {
            write_usage(&mut stderr()).unwrap_or(());
            match maybe_err {
                Some(e) => ExitResult::err_from(e, 1),
                None => ExitResult::err_from(
                    clap::Error::with_description(
                        "Exactly one of --file-nr or --check is required",
                        clap::ErrorKind::MissingRequiredArgument,
                    ),
                    1,
                ),
            }
        }
        Invocation::Run(options, mode) => {
            let duplicator: Box<dyn RemoteFdDuplicator> = match options.backend.open() {
                Ok(d) => d,
                Err(err) => {
                    log!(LogError, "Could not set up backend {}: {}", options.backend, err);
                    return ExitResult::err_from(CheckError::ipc("open backend")(err), 1);
                }
            };
            match mode {
                Mode::FileNr(iterations) => LeakCheckCommand::new(
                    options.leak_check_config(iterations),
                    duplicator,
                    ProcFileNr::new(),
                )
                .run(),
                Mode::Check => match util::tmp_dir() {
                    Ok(tmp_dir) => {
                        LinkCheckCommand::new(options.link_check_config(tmp_dir), duplicator)
                            .run()
                    }
                    Err(e) => ExitResult::err_from(e, 1),
                },
            }
        }
    }
}
