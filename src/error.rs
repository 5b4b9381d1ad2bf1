use std::fmt::Display;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Shmstore errors.
///
/// Arena errors leave the shared region in an unrecoverable state and are
/// treated as fatal by callers. Overlay and layout errors indicate misuse by
/// the hosting process. Init errors other than `OutOfSharedMemory` are caught
/// internally to drive the filesystem fallback chain.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Error {
    /// The blob heap has no room left for an allocation.
    HeapFull,
    /// Every slot of the shared hash table has been claimed.
    HashTableFull,
    /// Every slot of the dependency-edge table is occupied.
    DepTableFull,
    /// A revision string was required but empty.
    RevisionLengthZero,
    /// The anonymous shared mapping could not be created.
    AnonymousMappingFailed(String),
    /// A candidate filesystem reported less free space than required.
    LessThanMinimumAvailable {
        path: PathBuf,
        available: u64,
        required: u64,
    },
    /// A candidate filesystem could not be used at all.
    FilesystemUnusable { path: PathBuf, reason: String },
    /// Anonymous mapping and every candidate filesystem failed.
    OutOfSharedMemory,
    /// An internal invariant of the shared region was violated.
    Assertion(String),

    /// `pop_stack` was called with no overlay frame pushed.
    EmptyStack,
    /// A key expected to be present was absent.
    KeyMissing,
    /// `remove` of a key that is not visible.
    RemoveAbsent,
    /// `move` whose source key is not visible.
    MoveSourceMissing,
    /// `move` whose destination key is already bound.
    MoveDestinationPresent,
    /// A write was attempted while this process's write gate is closed.
    WritesDisabled,
    /// A `remove` was attempted while removes are globally forbidden.
    RemovesDisabled,

    /// Layout creation after the hierarchy was sealed.
    HierarchySealed,
    /// A lattice operation on a non-top layout before sealing.
    HierarchyUnsealed,
    /// Two layouts were registered under the same index.
    DuplicateLayoutIndex(u16),
    /// A layout named a parent index that does not exist yet.
    MissingParent(u16),
    /// Vtable access on an abstract layout.
    AbstractVtable(u16),

    /// Invalid data, typically decoding errors or corrupt persisted state.
    InvalidData(String),
    /// An IO error.
    IO(String),
}

impl std::error::Error for Error {}

impl Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Error::HeapFull => write!(f, "shared heap exhausted"),
            Error::HashTableFull => write!(f, "shared hash table full"),
            Error::DepTableFull => write!(f, "dependency table full"),
            Error::RevisionLengthZero => write!(f, "revision string is empty"),
            Error::AnonymousMappingFailed(msg) => {
                write!(f, "anonymous shared mapping failed: {msg}")
            }
            Error::LessThanMinimumAvailable {
                path,
                available,
                required,
            } => write!(
                f,
                "{} has {available} bytes available, {required} required",
                path.display()
            ),
            Error::FilesystemUnusable { path, reason } => {
                write!(f, "{} is unusable: {reason}", path.display())
            }
            Error::OutOfSharedMemory => write!(f, "no usable backing for the shared region"),
            Error::Assertion(msg) => write!(f, "internal assertion failed: {msg}"),
            Error::EmptyStack => write!(f, "pop of an empty overlay stack"),
            Error::KeyMissing => write!(f, "key is not present"),
            Error::RemoveAbsent => write!(f, "remove of an absent key"),
            Error::MoveSourceMissing => write!(f, "move source is absent"),
            Error::MoveDestinationPresent => write!(f, "move destination is already bound"),
            Error::WritesDisabled => write!(f, "hash table writes are disabled in this process"),
            Error::RemovesDisabled => write!(f, "removes are globally disabled"),
            Error::HierarchySealed => write!(f, "layout hierarchy is sealed"),
            Error::HierarchyUnsealed => {
                write!(f, "lattice operation on a non-top layout before sealing")
            }
            Error::DuplicateLayoutIndex(idx) => write!(f, "duplicate layout index {idx:#06x}"),
            Error::MissingParent(idx) => write!(f, "parent layout {idx:#06x} does not exist"),
            Error::AbstractVtable(idx) => {
                write!(f, "vtable access on abstract layout {idx:#06x}")
            }
            Error::InvalidData(msg) => write!(f, "invalid data: {msg}"),
            Error::IO(msg) => write!(f, "io error: {msg}"),
        }
    }
}

/// Constructs an Error::InvalidData for the given format string.
#[macro_export]
macro_rules! errdata {
    ($($args:tt)*) => { $crate::error::Error::InvalidData(format!($($args)*)).into() };
}

/// Constructs an Error::Assertion for the given format string.
#[macro_export]
macro_rules! errassert {
    ($($args:tt)*) => { $crate::error::Error::Assertion(format!($($args)*)).into() };
}

/// A shmstore Result returning Error.
pub type Result<T> = std::result::Result<T, Error>;

impl<T> From<Error> for Result<T> {
    fn from(error: Error) -> Self {
        Err(error)
    }
}

impl From<Box<bincode::ErrorKind>> for Error {
    fn from(err: Box<bincode::ErrorKind>) -> Self {
        Error::InvalidData(err.to_string())
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::IO(err.to_string())
    }
}

impl From<rusqlite::Error> for Error {
    fn from(err: rusqlite::Error) -> Self {
        Error::IO(err.to_string())
    }
}
