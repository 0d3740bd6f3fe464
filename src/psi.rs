use std::sync::Arc;

use log::warn;
use modular_bitfield_msb::prelude::*;

use crate::fs::{self, Dentry};
use crate::{DemuxError, Result};

/// Highest valid section_length.
pub const TS_MAX_SECTION_LENGTH: u16 = 4093;
/// Highest table_id defined by the standard.
pub const TS_LAST_TABLE_ID: u8 = 0xbf;

/// Wire layout of the eight-byte common header every PSI table embeds.
#[bitfield]
#[derive(Debug)]
pub struct PsiHeaderFields {
    pub table_id: B8,
    pub section_syntax_indicator: bool,
    pub private_bit: bool,
    pub reserved_1: B2,
    pub section_length: B12,
    pub identifier: B16,
    pub reserved_2: B2,
    pub version_number: B5,
    pub current_next_indicator: bool,
    pub section_number: B8,
    pub last_section_number: B8,
}

/// Decoded PSI common header.
#[derive(Debug, Clone)]
pub struct PsiHeader {
    pub table_id: u8,
    pub section_syntax_indicator: bool,
    pub section_length: u16,
    pub identifier: u16,
    pub version_number: u8,
    pub current_next_indicator: bool,
    pub section_number: u8,
    pub last_section_number: u8,
    /// How many further TS packets the section still spans.
    pub remaining_packets: u16,
}

impl PsiHeader {
    /// Parses the common header from the start of a section. Out-of-range
    /// values are warnings, not errors.
    pub fn parse(payload: &[u8]) -> Result<PsiHeader> {
        if payload.len() < 8 {
            warn!(
                "cannot parse PSI header: contents is smaller than 8 bytes ({})",
                payload.len()
            );
            return Err(DemuxError::ShortPayload {
                context: "PSI common header",
                expected: 8,
                found: payload.len(),
            });
        }
        let mut bytes = [0u8; 8];
        bytes.copy_from_slice(&payload[..8]);
        let fields = PsiHeaderFields::from_bytes(bytes);

        let section_length = fields.section_length();
        let total = section_length as u32 + 3;
        let header = PsiHeader {
            table_id: fields.table_id(),
            section_syntax_indicator: fields.section_syntax_indicator(),
            section_length,
            identifier: fields.identifier(),
            version_number: fields.version_number(),
            current_next_indicator: fields.current_next_indicator(),
            section_number: fields.section_number(),
            last_section_number: fields.last_section_number(),
            remaining_packets: (total / 188 + if total % 188 != 0 { 1 } else { 0 } - 1) as u16,
        };
        header.check();
        Ok(header)
    }

    fn check(&self) {
        if !self.section_syntax_indicator {
            warn!("section_syntax_indicator != 1");
        }
        if self.section_length > TS_MAX_SECTION_LENGTH {
            warn!(
                "section_length is greater than {:#x} bytes",
                TS_MAX_SECTION_LENGTH
            );
        }
        if self.table_id > TS_LAST_TABLE_ID {
            warn!("table_id is greater than {:#x}", TS_LAST_TABLE_ID);
        }
    }

    /// Materialises the header fields under a version directory.
    pub fn populate(&self, parent: &Arc<Dentry>) {
        fs::create_file_number(parent, "table_id", self.table_id as u64);
        fs::create_file_number(
            parent,
            "section_syntax_indicator",
            self.section_syntax_indicator as u64,
        );
        fs::create_file_number(parent, "section_length", self.section_length as u64);
        fs::create_file_number(parent, "identifier", self.identifier as u64);
        fs::create_file_number(parent, "version_number", self.version_number as u64);
        fs::create_file_number(
            parent,
            "current_next_indicator",
            self.current_next_indicator as u64,
        );
        fs::create_file_number(parent, "section_number", self.section_number as u64);
        fs::create_file_number(
            parent,
            "last_section_number",
            self.last_section_number as u64,
        );
    }
}

/// The synthetic inode keying completed tables: `(PID << 8) | table_id`.
pub fn table_inode(pid: u16, table_id: u8) -> u64 {
    ((pid as u64 & 0xffff) << 8) | table_id as u64
}

/// DSI shares PID and table_id 0x3B with the DII; its key is disambiguated
/// by bit 24.
pub const DSI_INODE_FLAG: u64 = 0x0100_0000;

/// One installed table version, indexed by synthetic inode.
pub struct TableVersion {
    pub version_number: u8,
    /// The per-table directory, e.g. `/PMT/<pid>`.
    pub table_dentry: Arc<Dentry>,
    /// The installed `<version_nr>` subtree.
    pub version_dentry: Arc<Dentry>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_a_pat_header() {
        // table_id 0, ssi=1, length 0x00d, identifier 0x0001, version 2,
        // current, section 0 of 0.
        let payload = [0x00, 0xb0, 0x0d, 0x00, 0x01, 0xc5, 0x00, 0x00];
        let header = PsiHeader::parse(&payload).unwrap();
        assert_eq!(header.table_id, 0);
        assert!(header.section_syntax_indicator);
        assert_eq!(header.section_length, 0x00d);
        assert_eq!(header.identifier, 1);
        assert_eq!(header.version_number, 2);
        assert!(header.current_next_indicator);
        assert_eq!(header.remaining_packets, 0);
    }

    #[test]
    fn short_payload_is_rejected() {
        assert!(matches!(
            PsiHeader::parse(&[0x00, 0xb0, 0x0d]),
            Err(DemuxError::ShortPayload { .. })
        ));
    }

    #[test]
    fn remaining_packets_counts_spanned_packets() {
        // section_length 0x300 spans multiple packets.
        let payload = [0x42, 0xb3, 0x00, 0x00, 0x01, 0xc1, 0x00, 0x00];
        let header = PsiHeader::parse(&payload).unwrap();
        assert_eq!(header.section_length, 0x300);
        assert_eq!(header.remaining_packets, 4);
    }

    #[test]
    fn inode_formula_is_stable() {
        assert_eq!(table_inode(0x0100, 0x02), 0x010002);
        assert_eq!(table_inode(0x1fff, 0x3b), 0x1fff3b);
        assert_eq!(table_inode(0x0030, 0x3b) | DSI_INODE_FLAG, 0x100303b);
    }
}
