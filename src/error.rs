//! Errors surfaced by the load pipeline.

use crate::elf::ElfError;
use crate::sys::Errno;

/// Failure of one object's load pipeline.
#[derive(Debug, thiserror::Error)]
pub enum LoadError {
    /// The object image could not be parsed
    #[error(transparent)]
    Elf(#[from] ElfError),
    /// Every object must carry a license section
    #[error("missing license section")]
    MissingLicense,
    /// A descriptor section is not a whole number of records
    #[error("{section} section length {len} is not a multiple of record size {record_size}")]
    BadRecordSize {
        section: &'static str,
        len: usize,
        record_size: usize,
    },
    /// Records and section symbols must match one to one
    #[error("{section} section has {records} records but {symbols} symbols")]
    RecordCountMismatch {
        section: &'static str,
        records: usize,
        symbols: usize,
    },
    /// The object declares records smaller than the oldest understood layout
    #[error("declared {section} record size {size} is below the minimum {min}")]
    RecordSizeTooSmall {
        section: &'static str,
        size: usize,
        min: usize,
    },
    /// This loader is older than the object's hard floor
    #[error("object requires loader version >= {min:#x}, running {have:#x}")]
    LoaderTooOld { min: u32, have: u32 },
    /// A map record's reserved field must be zero
    #[error("map {0} has a non-zero reserved field")]
    ReservedFieldNotZero(String),
    /// A descriptor names a pin subdirectory this loader does not know
    #[error("unrecognized pin_subdir '{0}'")]
    UnrecognizedPinSubdir(String),
    /// An existing pin does not match the shape the object declares
    #[error("pinned object at {0} does not match its definition")]
    PinMismatch(String),
    /// A code section has no matching entry in the progs section
    #[error("code section {0} has no program definition")]
    MissingProgDef(String),
    /// The kernel or filesystem rejected an operation
    #[error("{op} failed: {err}")]
    Sys { op: &'static str, err: Errno },
}

impl LoadError {
    /// Flatten onto the errno namespace used for exit-status reporting.
    ///
    /// Shape mismatches are `ENOTUNIQ`, unknown pin subdirectories are
    /// `ENOTDIR`, kernel failures keep their own errno, and everything
    /// else (format trouble) reads as `EINVAL`.
    pub fn errno(&self) -> i32 {
        match self {
            LoadError::Sys { err, .. } => err.0,
            LoadError::PinMismatch(_) => libc::ENOTUNIQ,
            LoadError::UnrecognizedPinSubdir(_) => libc::ENOTDIR,
            _ => libc::EINVAL,
        }
    }
}
