use nix::unistd::{access, AccessFlags};
use std::{
    env,
    ffi::OsString,
    io,
    path::{Path, PathBuf},
};

/// Returns $FDSTEAL_TMPDIR, $TMPDIR or "/tmp", whichever is set first.
/// The directory must exist and be writeable.
pub fn tmp_dir() -> io::Result<PathBuf> {
    let dir = env::var_os("FDSTEAL_TMPDIR")
        .or_else(|| env::var_os("TMPDIR"))
        .filter(|d| !d.is_empty())
        .unwrap_or_else(|| OsString::from("/tmp"));
    let dir = PathBuf::from(dir);
    ensure_writeable_dir(&dir)?;
    Ok(dir)
}

fn ensure_writeable_dir(dir: &Path) -> io::Result<()> {
    if !dir.is_dir() {
        return Err(io::Error::new(
            io::ErrorKind::NotFound,
            format!("temporary file directory {:?} is not a directory", dir),
        ));
    }
    access(dir, AccessFlags::W_OK | AccessFlags::X_OK).map_err(|e| {
        io::Error::new(
            io::ErrorKind::PermissionDenied,
            format!("Can't write to temporary file directory {:?}: {}", dir, e),
        )
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tmp_is_writeable() {
        assert!(ensure_writeable_dir(Path::new("/tmp")).is_ok());
    }

    #[test]
    fn missing_dir_is_rejected() {
        let e = ensure_writeable_dir(Path::new("/nonexistent/fdsteal")).unwrap_err();
        assert_eq!(io::ErrorKind::NotFound, e.kind());
    }

    #[test]
    fn regular_file_is_rejected() {
        assert!(ensure_writeable_dir(Path::new("/proc/self/stat")).is_err());
    }
}
