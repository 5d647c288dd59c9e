use std::io;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum BufmgrError {
    #[error("I/O Error: {0}")]
    Io(#[from] io::Error),

    #[error("Out of memory")]
    OutOfMemory,

    #[error("Address space exhausted")]
    AddressSpaceExhausted,

    #[error("Invalid combination: {0}")]
    InvalidCombination(&'static str),

    #[error("Operation timed out")]
    Timeout,

    #[error("Device busy or lost")]
    DeviceBusyOrLost,
}

impl BufmgrError {
    /// Classifies a failed submission ioctl.
    #[must_use]
    pub fn from_exec(err: io::Error) -> Self {
        match err.raw_os_error() {
            Some(libc::ENOSPC) => Self::AddressSpaceExhausted,
            Some(libc::ENOMEM) => Self::OutOfMemory,
            Some(libc::EBUSY | libc::EIO | libc::EAGAIN | libc::EINTR) => Self::DeviceBusyOrLost,
            _ => Self::Io(err),
        }
    }
}

// A convenient alias
pub type BufmgrResult<T> = Result<T, BufmgrError>;
