//! Spawn Errors
//!
//! Launch failures are the only errors that cross the public API. Stream
//! failures (broken pipe, hard read/write errors) are folded into stream
//! closure by the process handle, and termination failures are swallowed
//! by `destroy()`.

use std::io;
use thiserror::Error;

/// Failure to launch a child process.
///
/// When `start` fails with this error no listener notification has been
/// issued and no descriptors remain open.
#[derive(Debug, Error)]
pub enum SpawnError {
    /// The command line was empty.
    #[error("cannot spawn an empty command")]
    EmptyCommand,

    /// The program could not be found.
    #[error("program not found: {program}")]
    NotFound { program: String },

    /// The program exists but may not be executed.
    #[error("permission denied executing {program}")]
    PermissionDenied { program: String },

    /// The operating system ran out of processes, descriptors or memory.
    #[error("insufficient resources to spawn {program}: {source}")]
    Resources {
        program: String,
        #[source]
        source: io::Error,
    },

    /// Any other launch failure.
    #[error("failed to spawn {program}: {source}")]
    Io {
        program: String,
        #[source]
        source: io::Error,
    },

    /// The event processor assigned to the process could not be started.
    #[error("failed to start event processor: {source}")]
    Processor {
        #[source]
        source: io::Error,
    },
}

impl SpawnError {
    /// Classify an I/O error raised while launching `program`.
    pub fn from_io(program: impl Into<String>, source: io::Error) -> Self {
        let program = program.into();
        match source.kind() {
            io::ErrorKind::NotFound => Self::NotFound { program },
            io::ErrorKind::PermissionDenied => Self::PermissionDenied { program },
            _ if is_resource_exhaustion(&source) => Self::Resources { program, source },
            _ => Self::Io { program, source },
        }
    }
}

fn is_resource_exhaustion(err: &io::Error) -> bool {
    use nix::errno::Errno;

    matches!(
        err.raw_os_error().map(Errno::from_i32),
        Some(Errno::EAGAIN | Errno::EMFILE | Errno::ENFILE | Errno::ENOMEM)
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_not_found() {
        let err = SpawnError::from_io("/bin/zxczxc", io::Error::from(io::ErrorKind::NotFound));
        assert!(matches!(err, SpawnError::NotFound { ref program } if program == "/bin/zxczxc"));
        assert_eq!(err.to_string(), "program not found: /bin/zxczxc");
    }

    #[test]
    fn test_classify_permission_denied() {
        let err = SpawnError::from_io("x", io::Error::from(io::ErrorKind::PermissionDenied));
        assert!(matches!(err, SpawnError::PermissionDenied { .. }));
    }

    #[test]
    fn test_classify_resources() {
        let err = SpawnError::from_io("x", io::Error::from_raw_os_error(nix::libc::EMFILE));
        assert!(matches!(err, SpawnError::Resources { .. }));
    }

    #[test]
    fn test_classify_other() {
        let err = SpawnError::from_io("x", io::Error::from_raw_os_error(nix::libc::EINVAL));
        assert!(matches!(err, SpawnError::Io { .. }));
    }
}
