//! Error types shared by the device registry and all drivers
//!
//! One flat taxonomy is used across the whole storage subsystem; drivers
//! propagate these values to the caller unchanged.

/// Core error type - no_std compatible, Copy for efficiency
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    /// Malformed argument: offset out of range, unsupported port width,
    /// unknown command, corrupt on-flash structure
    #[error("invalid argument")]
    Invalid,
    /// Device not registered, not initialized, or no matching chip found
    /// at probe time
    #[error("no such device")]
    NoDevice,
    /// Lookup by name or identifier found nothing
    #[error("no such entry")]
    NoEntry,
    /// Hardware returned an error status (program fail, erase fail, bus
    /// error, DMA error)
    #[error("I/O error")]
    Io,
    /// A polled wait exceeded its bounded timeout
    #[error("operation timed out")]
    Timeout,
    /// Operation not supported by this hardware
    #[error("operation not supported")]
    NotSupported,
    /// All candidate blocks are bad (NAND sync)
    #[error("no space left on device")]
    NoSpace,
    /// Write attempted while the write gate is off, or a read-only
    /// constraint was violated
    #[error("access denied")]
    AccessDenied,
    /// Controller reports busy at the moment of issue
    #[error("device busy")]
    Busy,
    /// ECC uncorrectable beyond recovery
    #[error("uncorrectable ECC error")]
    EccFault,
    /// Medium is write protected
    #[error("write protected")]
    WriteProtected,
}

/// Result type alias using the core Error type
pub type Result<T> = core::result::Result<T, Error>;
