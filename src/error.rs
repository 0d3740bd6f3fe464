//! Error taxonomy for the demultiplexer and the filesystem tree.

use std::io;
use thiserror::Error;

/// Errors raised while demultiplexing a transport stream or serving the tree.
///
/// Only [`DemuxError::BackendFatal`] unwinds past the demultiplexer; every
/// other variant is recovered locally, leaving the per-PID state valid for the
/// next packet.
#[derive(Error, Debug)]
pub enum DemuxError {
    /// The input backend cannot produce packets. Terminates the parser thread.
    #[error("backend failure: {0}")]
    BackendFatal(#[from] io::Error),

    /// Sync byte mismatch, wrong packet size or adaptation field past the
    /// packet end.
    #[error("malformed packet: {0}")]
    MalformedPacket(&'static str),

    /// A bounded read walked past the end of its slice. The parameter is the
    /// length of the offending read.
    #[error("read of {0} bytes past end of payload")]
    PacketOverrun(usize),

    /// continuity_counter gap on one PID.
    #[error("continuity error on pid {pid:#x}: last counter={last}, current counter={current}")]
    ContinuityBreak { pid: u16, last: u8, current: u8 },

    /// PSI section failed the MPEG-2 CRC-32 check.
    #[error("CRC error on pid {pid:#x}, table_id {table_id:#x}")]
    CrcMismatch { pid: u16, table_id: u8 },

    /// Table or descriptor payload shorter than its minimal fixed prefix.
    #[error("{context}: payload holds {found} bytes, expected at least {expected}")]
    ShortPayload {
        context: &'static str,
        expected: usize,
        found: usize,
    },

    /// Descriptor tag with no registered parser.
    #[error("invalid descriptor tag {0:#04x}")]
    UnknownTag(u8),

    /// Path or name lookup found nothing.
    #[error("no such entry")]
    NoSuchEntry,

    /// Extended attribute lookup found nothing.
    #[error("no such attribute")]
    NoSuchAttribute,

    /// Write access to a read-only node, execute on a non-directory, or an
    /// xattr outside the user namespace.
    #[error("access denied")]
    AccessDenied,

    /// Invalid parameter from the filesystem binding.
    #[error("invalid argument")]
    InvalidArgument,
}

/// [`std::result::Result`] alias that uses [`DemuxError`].
pub type Result<T> = std::result::Result<T, DemuxError>;
