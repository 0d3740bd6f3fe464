//! Library exposing an MPEG transport stream as a read-only hierarchical
//! filesystem tree.
//!
//! The demultiplexer decodes PSI tables, DSM-CC object carousels and
//! Packetised Elementary Streams in real time and materialises, for each
//! table, descriptor, elementary stream and carousel file it discovers, a
//! corresponding directory or file. A user-space filesystem binding serves
//! the resulting tree through standard file operations; this crate owns
//! everything up to (and including) that tree.
//!
//! # Usage
//! Simply add this crate as a dependency in your `Cargo.toml`.
//!
//! ```toml
//! [dependencies]
//! demuxfs = "~0.1.0"
//! ```
//!
//! # Example
//!
//! ```no_run
//! use demuxfs::{Backend, Demuxer, FileBackend, UserOptions};
//!
//! let mut backend = FileBackend::open("capture.ts", false).expect("unable to open");
//! let mut options = UserOptions::default();
//! options.packet_size = backend.packet_size();
//! let mut demux = Demuxer::new(options);
//! let root = demux.root();
//! while backend.read().expect("read error") {
//!     if let Err(e) = demux.process_packet(backend.packet()) {
//!         eprintln!("dropped packet: {}", e);
//!     }
//! }
//! println!("{:?}", demuxfs::fs::readdir(&root));
//! ```

#![allow(unused)]

use std::collections::HashMap;
use std::sync::Arc;

use crc::{Crc, CRC_32_MPEG_2};
use modular_bitfield_msb::prelude::*;

mod error;
pub use error::{DemuxError, Result};

mod slice_reader;
pub use slice_reader::SliceReader;

mod config;
pub use config::{ReportMask, Standard, UserOptions};

mod backend;
pub use backend::{run, spawn_parser_thread, Backend, FileBackend, TS_PACKET_SIZES};

pub mod fifo;
pub mod fs;

mod section;
pub use section::{SectionBuffer, MAX_SECTION_SIZE};

pub mod demux;
pub mod descriptors;
pub mod dsmcc;
pub mod pes;
pub mod psi;
pub mod tables;

use descriptors::DescriptorRegistry;
use dsmcc::descriptors::DsmccDescriptorRegistry;
use dsmcc::CarouselState;
use fs::Dentry;
use pes::{PesKind, PesStreamState};
use psi::TableVersion;
use tables::PsiParser;

const CRC: Crc<u32> = Crc::<u32>::new(&CRC_32_MPEG_2);

/// MPEG-2 CRC-32 (polynomial 0x04C11DB7) over a byte region.
pub fn mpeg_crc32(data: &[u8]) -> u32 {
    CRC.checksum(data)
}

/// A complete PSI section is valid iff the CRC over the full section,
/// including the trailing four CRC bytes, is zero.
pub fn crc32_check(section: &[u8]) -> bool {
    CRC.checksum(section) == 0
}

/// TSC information used in a packet's payload.
#[repr(u8)]
#[derive(Debug, BitfieldSpecifier)]
#[bits = 2]
pub enum TransportScramblingControl {
    /// Not scrambled.
    NotScrambled,
    /// Do not use.
    Reserved,
    /// Scrambled with even key.
    ScrambledEvenKey,
    /// Scrambled with odd key.
    ScrambledOddKey,
}

/// Link-layer header found at the start of every MPEG-TS packet.
#[bitfield]
#[derive(Debug)]
pub struct TsPacketHeader {
    pub sync_byte: B8,
    pub tei: bool,
    pub pusi: bool,
    pub priority: bool,
    pub pid: B13,
    pub tsc: TransportScramblingControl,
    pub adaptation_field_control: B2,
    pub continuity_counter: B4,
}

/// Demultiplexer state: per-PID buffers and parsers, completed tables by
/// synthetic inode, and the tree every parser mutates.
///
/// All maps are owned by the parser thread; only the tree is shared with
/// the filesystem binding, under the per-dentry mutexes.
pub struct Demuxer {
    pub(crate) options: UserOptions,
    pub(crate) root: Arc<Dentry>,
    /// Parsers of known PSI PIDs (registered by the PAT, PMT, ...).
    pub(crate) psi_parsers: HashMap<u16, PsiParser>,
    /// Parsers of known PES PIDs (registered by the PMT).
    pub(crate) pes_parsers: HashMap<u16, PesKind>,
    /// Incomplete sections and PES packets, keyed by PID.
    pub(crate) packet_buffers: HashMap<u16, SectionBuffer>,
    /// Completed tables, keyed by synthetic inode.
    pub(crate) tables: HashMap<u64, TableVersion>,
    /// (program_number, PMT PID) pairs announced by the current PAT.
    pub(crate) pat_programs: HashMap<u16, u16>,
    /// FIFO dentry cache for the PES delivery path.
    pub(crate) pes_dentries: HashMap<u64, Arc<Dentry>>,
    /// Elementary-stream extraction state per PID.
    pub(crate) pes_states: HashMap<u16, PesStreamState>,
    /// Object carousel reconstruction state per PID.
    pub(crate) carousels: HashMap<u16, CarouselState>,
    /// Tag-indexed descriptor registries, built once at startup.
    pub(crate) ts_descriptors: DescriptorRegistry,
    pub(crate) dsmcc_descriptors: DsmccDescriptorRegistry,
}

impl Demuxer {
    /// Creates a demultiplexer with an empty tree root and the descriptor
    /// registries installed.
    pub fn new(options: UserOptions) -> Demuxer {
        Demuxer {
            options,
            root: Dentry::new_root(),
            psi_parsers: HashMap::new(),
            pes_parsers: HashMap::new(),
            packet_buffers: HashMap::new(),
            tables: HashMap::new(),
            pat_programs: HashMap::new(),
            pes_dentries: HashMap::new(),
            pes_states: HashMap::new(),
            carousels: HashMap::new(),
            ts_descriptors: DescriptorRegistry::ts(),
            dsmcc_descriptors: DsmccDescriptorRegistry::new(),
        }
    }

    /// The tree root served by the filesystem binding.
    pub fn root(&self) -> Arc<Dentry> {
        self.root.clone()
    }

    /// The options this demultiplexer was created with.
    pub fn options(&self) -> &UserOptions {
        &self.options
    }

    /// Processes exactly one transport stream packet, mutating the tree as
    /// sections complete. Every error is local to the packet.
    pub fn process_packet(&mut self, packet: &[u8]) -> Result<()> {
        demux::process_packet(self, packet)
    }
}

impl Default for Demuxer {
    fn default() -> Demuxer {
        Demuxer::new(UserOptions::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mpeg2_crc_of_a_sealed_section_is_zero() {
        let mut section = vec![0x00, 0xb0, 0x0d, 0x00, 0x01, 0xc1, 0x00, 0x00, 0x00];
        let crc = mpeg_crc32(&section);
        section.extend_from_slice(&crc.to_be_bytes());
        assert!(crc32_check(&section));
        section[3] ^= 0xff;
        assert!(!crc32_check(&section));
    }

    #[test]
    fn packet_header_bitfield_layout() {
        // pid 0x0100, pusi set, payload only, cc 5.
        let header = TsPacketHeader::from_bytes([0x47, 0x41, 0x00, 0x15]);
        assert_eq!(header.sync_byte(), 0x47);
        assert!(header.pusi());
        assert_eq!(header.pid(), 0x0100);
        assert_eq!(header.adaptation_field_control(), 0x01);
        assert_eq!(header.continuity_counter(), 5);
    }
}
