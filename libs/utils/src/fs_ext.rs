//! Small filesystem helpers shared by cleanup paths.

use std::io;

/// Turn a `NotFound` error into success: cleanup code that removes
/// directories or links must tolerate being called a second time.
pub fn ignore_not_found(e: io::Error) -> io::Result<()> {
    if e.kind() == io::ErrorKind::NotFound {
        Ok(())
    } else {
        Err(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn not_found_is_ok() {
        assert!(ignore_not_found(io::Error::new(io::ErrorKind::NotFound, "gone")).is_ok());
    }

    #[test]
    fn other_errors_propagate() {
        assert!(ignore_not_found(io::Error::new(io::ErrorKind::PermissionDenied, "no")).is_err());
    }
}
