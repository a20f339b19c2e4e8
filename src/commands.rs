use exit_result::ExitResult;

pub mod check_error;
pub mod exit_result;
pub mod fdsteal_options;
pub mod leak_check_command;
pub mod link_check_command;

pub trait FdStealCommand {
    fn run(&mut self) -> ExitResult<()>;
}
