//! Kernel error types
//!
//! Every kernel-visible failure is one value of [`KernelError`]. The
//! enum mirrors the fixed syscall error taxonomy: [`KernelError::code`]
//! maps each public variant to its stable negative integer, which is
//! what the syscall layer hands back to user code. [`WouldBlock`] is the
//! one internal variant: it never reaches user space, it tells the
//! dispatcher to park the calling thread and retry after a wake-up.
//!
//! [`WouldBlock`]: KernelError::WouldBlock

use core::fmt;

/// Main kernel error type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[must_use = "kernel errors must be handled, not silently discarded"]
pub enum KernelError {
    /// Unspecified error
    Unspecified,
    /// No such file or directory
    NotFound,
    /// Operation not supported
    Unsupported,
    /// No such device
    NoDev,
    /// Input/output error
    Io,
    /// Resource in use
    Busy,
    /// Out of memory
    NoMem,
    /// No such filesystem
    NoFilesys,
    /// Name too long
    NameTooLong,
    /// Invalid format for filesystem
    InvalidFs,
    /// Permission denied
    Access,
    /// Invalid argument
    Invalid,
    /// File descriptor table full
    MFile,
    /// Not a directory
    NotDir,
    /// File or directory already exists
    Exist,
    /// Out of space on device
    NoSpace,
    /// Pipe has no reader
    Pipe,
    /// Invalid executable format
    NoExec,
    /// General filesystem error
    FsGen,
    /// Directory is not empty
    DirNotEmpty,
    /// Found directory but expected file
    NotFile,
    /// Maximum size reached
    MaxSize,
    /// Maximum number of open files exceeded
    UsrMaxFiles,
    /// Maximum number of ACL entries reached
    AclMaxEntries,
    /// Operation would block; the calling thread has been parked on a
    /// wait queue and the request must be re-issued after wake-up.
    /// Never surfaced to user code.
    WouldBlock,
}

/// Result type alias for kernel operations
pub type KernelResult<T> = Result<T, KernelError>;

impl KernelError {
    /// The stable negative integer the syscall layer returns for this
    /// error. `WouldBlock` has no user-visible code; it maps to the
    /// unspecified code as a backstop, but the dispatcher intercepts it
    /// before any value reaches user registers.
    pub fn code(self) -> i32 {
        match self {
            Self::Unspecified => -1,
            Self::NotFound => -2,
            Self::Unsupported => -3,
            Self::NoDev => -4,
            Self::Io => -5,
            Self::Busy => -6,
            Self::NoMem => -7,
            Self::NoFilesys => -8,
            Self::NameTooLong => -9,
            Self::InvalidFs => -10,
            Self::Access => -11,
            Self::Invalid => -12,
            Self::MFile => -13,
            Self::NotDir => -14,
            Self::Exist => -15,
            Self::NoSpace => -16,
            Self::Pipe => -17,
            Self::NoExec => -18,
            Self::FsGen => -19,
            Self::DirNotEmpty => -20,
            Self::NotFile => -21,
            Self::MaxSize => -22,
            Self::UsrMaxFiles => -23,
            Self::AclMaxEntries => -24,
            Self::WouldBlock => -1,
        }
    }

    /// Human-readable description, as the user-space library prints it.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Unspecified => "Unspecified error",
            Self::NotFound => "No such file or directory",
            Self::Unsupported => "Operation not supported",
            Self::NoDev => "No such device",
            Self::Io => "Input/output error",
            Self::Busy => "Resource in use",
            Self::NoMem => "Out of memory",
            Self::NoFilesys => "No such filesystem",
            Self::NameTooLong => "Name too long",
            Self::InvalidFs => "Invalid format for filesystem",
            Self::Access => "Permission denied",
            Self::Invalid => "Invalid argument",
            Self::MFile => "File descriptor table full",
            Self::NotDir => "Not a directory",
            Self::Exist => "File or directory already exists",
            Self::NoSpace => "Out of space on device",
            Self::Pipe => "Pipe has no reader",
            Self::NoExec => "Invalid executable format",
            Self::FsGen => "General filesystem error",
            Self::DirNotEmpty => "Directory is not empty",
            Self::NotFile => "Found directory but expected file",
            Self::MaxSize => "Maximum size reached",
            Self::UsrMaxFiles => "Maximum number of open files exceeded",
            Self::AclMaxEntries => "Maximum number of ACL entries reached",
            Self::WouldBlock => "Operation would block",
        }
    }

    /// Look up the error for a negative syscall return value.
    pub fn from_code(code: i32) -> Option<Self> {
        const TABLE: [KernelError; 24] = [
            KernelError::Unspecified,
            KernelError::NotFound,
            KernelError::Unsupported,
            KernelError::NoDev,
            KernelError::Io,
            KernelError::Busy,
            KernelError::NoMem,
            KernelError::NoFilesys,
            KernelError::NameTooLong,
            KernelError::InvalidFs,
            KernelError::Access,
            KernelError::Invalid,
            KernelError::MFile,
            KernelError::NotDir,
            KernelError::Exist,
            KernelError::NoSpace,
            KernelError::Pipe,
            KernelError::NoExec,
            KernelError::FsGen,
            KernelError::DirNotEmpty,
            KernelError::NotFile,
            KernelError::MaxSize,
            KernelError::UsrMaxFiles,
            KernelError::AclMaxEntries,
        ];
        if (-24..=-1).contains(&code) {
            Some(TABLE[(-code - 1) as usize])
        } else {
            None
        }
    }
}

impl fmt::Display for KernelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codes_are_stable_and_injective() {
        let mut seen = [false; 25];
        for code in -24..=-1 {
            let err = KernelError::from_code(code).unwrap();
            assert_eq!(err.code(), code);
            let idx = (-code) as usize;
            assert!(!seen[idx], "duplicate code {}", code);
            seen[idx] = true;
        }
        assert_eq!(KernelError::from_code(0), None);
        assert_eq!(KernelError::from_code(-25), None);
        assert_eq!(KernelError::from_code(1), None);
    }

    #[test]
    fn test_would_block_is_internal() {
        // The backstop mapping exists, but no code round-trips to it.
        assert_eq!(KernelError::WouldBlock.code(), -1);
        assert_eq!(KernelError::from_code(-1), Some(KernelError::Unspecified));
    }

    #[test]
    fn test_display_matches_taxonomy() {
        assert_eq!(KernelError::NotFound.as_str(), "No such file or directory");
        assert_eq!(KernelError::DirNotEmpty.code(), -20);
        assert_eq!(KernelError::AclMaxEntries.code(), -24);
    }
}
