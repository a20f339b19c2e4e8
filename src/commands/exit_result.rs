use std::{
    error::Error,
    process::{ExitCode, Termination},
};

pub enum ExitResult<T: Termination> {
    Ok(T),
    Err(Box<dyn Error>, i32),
}

impl<T: Termination> ExitResult<T> {
    pub fn err_from<E: Error + 'static>(e: E, code: i32) -> ExitResult<T> {
        ExitResult::Err(Box::new(e), code)
    }

    /// Exit status the process will report. Errors with a code outside
    /// 1..=255 are reported as 1.
    pub fn code(&self) -> Option<i32> {
        match self {
            ExitResult::Ok(_) => None,
            ExitResult::Err(_, c) => Some(clamp_code(*c)),
        }
    }
}

fn clamp_code(code: i32) -> i32 {
    if code <= 0 || code > 255 {
        1
    } else {
        code
    }
}

impl<T: Termination> Termination for ExitResult<T> {
    fn report(self) -> ExitCode {
        match self {
            ExitResult::Ok(t) => t.report(),
            ExitResult::Err(b, c) => {
                eprintln!("Error: {}", b);
                ExitCode::from(clamp_code(c) as u8)
            }
        }
    }
}
