//! DSM-CC U-N Download decoding: message headers, the AIT/DII/DSI/DDB
//! dispatch and the per-PID carousel state.

pub mod ait;
pub mod biop;
pub mod ddb;
pub mod descriptors;
pub mod dii;
pub mod dsi;
pub mod iop;

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use log::{debug, warn};
use modular_bitfield_msb::prelude::*;
use num_derive::FromPrimitive;
use num_traits::FromPrimitive;
use smallvec::SmallVec;

use crate::fs::{self, Dentry};
use crate::tables::TableParser;
use crate::{Demuxer, Result, SliceReader};

pub const TS_AIT_TABLE_ID: u8 = 0x74;
pub const TS_DII_TABLE_ID: u8 = 0x3b;
pub const TS_DDB_TABLE_ID: u8 = 0x3c;

/// U-N Download message ids.
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromPrimitive)]
pub enum DsmccMessageId {
    DownloadInfoIndication = 0x1002,
    DownloadDataBlock = 0x1003,
    DownloadServerInitiate = 0x1006,
}

/// Per-PID object carousel reconstruction state.
pub(crate) struct CarouselState {
    pub block_size: u16,
    pub download_id: u32,
    /// transaction_id announced by the most recent DII message header.
    pub transaction_id: Option<u32>,
    /// module_id to (module_size, module_version) from the DII.
    pub modules: HashMap<u16, ModuleInfo>,
    /// Raw block bytes awaiting module completion.
    pub blocks: HashMap<u16, BTreeMap<u16, Vec<u8>>>,
    /// Modules already run through the BIOP traversal.
    pub assembled: HashSet<(u16, u8)>,
    /// Staging root for forward references.
    pub stepfather: Arc<Dentry>,
    /// transaction_id read from the DSI connbinder's message selector.
    pub dsi_selector_transaction: Option<u32>,
    pub dsi_linked: bool,
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct ModuleInfo {
    pub size: u32,
    pub version: u8,
}

impl CarouselState {
    pub fn new() -> Self {
        CarouselState {
            block_size: 0,
            download_id: 0,
            transaction_id: None,
            modules: HashMap::new(),
            blocks: HashMap::new(),
            assembled: HashSet::new(),
            stepfather: Dentry::new_detached_root("stepfather"),
            dsi_selector_transaction: None,
            dsi_linked: false,
        }
    }
}

/// The `dsmccMessageHeader` / `dsmccDownloadDataHeader` fixed part.
#[bitfield]
#[derive(Debug)]
pub struct DsmccHeaderFields {
    pub protocol_discriminator: B8,
    pub dsmcc_type: B8,
    pub message_id: B16,
    pub transaction_id: B32,
    pub reserved: B8,
    pub adaptation_length: B8,
    pub message_length: B16,
}

/// Decoded DSM-CC message header. For `download_data_header` carriage the
/// transaction_id field carries the download_id instead.
#[derive(Debug, Clone)]
pub struct DsmccMessageHeader {
    pub protocol_discriminator: u8,
    pub dsmcc_type: u8,
    pub message_id: u16,
    pub transaction_id: u32,
    pub adaptation_length: u8,
    pub message_length: u16,
    pub adaptation_type: u8,
    pub adaptation_data: SmallVec<[u8; 8]>,
}

impl DsmccMessageHeader {
    /// Parses the 12-byte fixed header plus the optional adaptation header.
    pub fn parse(reader: &mut SliceReader) -> Result<DsmccMessageHeader> {
        let fields = crate::read_bitfield!(reader, DsmccHeaderFields);
        let mut header = DsmccMessageHeader {
            protocol_discriminator: fields.protocol_discriminator(),
            dsmcc_type: fields.dsmcc_type(),
            message_id: fields.message_id(),
            transaction_id: fields.transaction_id(),
            adaptation_length: fields.adaptation_length(),
            message_length: fields.message_length(),
            adaptation_type: 0,
            adaptation_data: SmallVec::new(),
        };
        if header.protocol_discriminator != 0x11 {
            warn!(
                "protocol_discriminator != 0x11 ({:#x})",
                header.protocol_discriminator
            );
        }
        if header.adaptation_length > 0 {
            header.adaptation_type = reader.read_u8()?;
            header
                .adaptation_data
                .extend_from_slice(reader.read(header.adaptation_length as usize - 1)?);
        }
        Ok(header)
    }

    /// Total header size in bytes.
    pub fn len(&self) -> usize {
        12 + self.adaptation_length as usize
    }

    pub fn dsmcc_type_name(&self) -> String {
        if self.dsmcc_type == 0x03 {
            format!("U-N Download Message [{:#x}]", self.dsmcc_type)
        } else {
            format!("Unknown [{:#x}]", self.dsmcc_type)
        }
    }

    pub fn message_id_name(&self) -> String {
        match DsmccMessageId::from_u16(self.message_id) {
            Some(DsmccMessageId::DownloadInfoIndication) => {
                format!("Download Info Indication [{:#x}]", self.message_id)
            }
            Some(DsmccMessageId::DownloadDataBlock) => {
                format!("Download Data Block [{:#x}]", self.message_id)
            }
            Some(DsmccMessageId::DownloadServerInitiate) => {
                format!("Download Server Initiate [{:#x}]", self.message_id)
            }
            None => format!("Unknown [{:#x}]", self.message_id),
        }
    }

    /// Materialises the header under `parent`. `download_data` selects the
    /// `download_id` naming of the data-header flavour.
    pub fn populate(&self, parent: &Arc<Dentry>, download_data: bool) {
        let dirname = if download_data {
            "DownloadDataHeader"
        } else {
            "MessageHeader"
        };
        let dir = fs::create_directory(parent, dirname);
        fs::create_file_string(
            &dir,
            "dsmcc_type",
            &self.dsmcc_type_name(),
            crate::fs::xattr::XATTR_FORMAT_STRING_AND_NUMBER,
        );
        fs::create_file_string(
            &dir,
            "message_id",
            &self.message_id_name(),
            crate::fs::xattr::XATTR_FORMAT_STRING_AND_NUMBER,
        );
        fs::create_file_number(
            &dir,
            "protocol_discriminator",
            self.protocol_discriminator as u64,
        );
        if download_data {
            fs::create_file_number(&dir, "download_id", self.transaction_id as u64);
        } else {
            fs::create_file_number(&dir, "transaction_id", self.transaction_id as u64);
            if self.transaction_id & 0x8000_0000 != 0x8000_0000 {
                warn!(
                    "transaction_id originator != '10' ({:#x})",
                    self.transaction_id
                );
            }
        }
        fs::create_file_number(&dir, "adaptation_length", self.adaptation_length as u64);
        fs::create_file_number(&dir, "message_length", self.message_length as u64);
        if self.adaptation_length > 0 {
            fs::create_file_number(&dir, "adaptation_type", self.adaptation_type as u64);
            fs::create_file_bin(&dir, "adaptation_data_bytes", &self.adaptation_data);
        }
    }
}

/// One entry of the DSM-CC compatibilityDescriptor loop.
#[derive(Debug, Default)]
pub struct CompatibilityEntry {
    pub descriptor_type: u8,
    pub descriptor_length: u8,
    pub specifier_type: u8,
    pub specifier_data: [u8; 3],
    pub model: u16,
    pub version: u16,
    pub sub_descriptors: Vec<(u8, Vec<u8>)>,
}

/// compatibilityDescriptor() as carried by DSI and DII.
#[derive(Debug, Default)]
pub struct CompatibilityDescriptor {
    pub compatibility_descriptor_length: u16,
    pub entries: Vec<CompatibilityEntry>,
}

impl CompatibilityDescriptor {
    pub fn parse(reader: &mut SliceReader) -> Result<CompatibilityDescriptor> {
        let mut descriptor = CompatibilityDescriptor {
            compatibility_descriptor_length: reader.read_be_u16()?,
            entries: Vec::new(),
        };
        if descriptor.compatibility_descriptor_length < 2 {
            reader.skip(descriptor.compatibility_descriptor_length as usize)?;
            return Ok(descriptor);
        }
        let mut body =
            reader.new_sub_reader(descriptor.compatibility_descriptor_length as usize)?;
        let descriptor_count = body.read_be_u16()?;
        for _ in 0..descriptor_count {
            let mut entry = CompatibilityEntry {
                descriptor_type: body.read_u8()?,
                descriptor_length: body.read_u8()?,
                specifier_type: body.read_u8()?,
                specifier_data: *body.read_array_ref::<3>()?,
                model: body.read_be_u16()?,
                version: body.read_be_u16()?,
                sub_descriptors: Vec::new(),
            };
            let sub_descriptor_count = body.read_u8()?;
            for _ in 0..sub_descriptor_count {
                let sub_type = body.read_u8()?;
                let sub_length = body.read_u8()? as usize;
                entry
                    .sub_descriptors
                    .push((sub_type, body.read(sub_length)?.to_vec()));
            }
            descriptor.entries.push(entry);
        }
        Ok(descriptor)
    }

    pub fn populate(&self, parent: &Arc<Dentry>) {
        let dir = fs::create_directory(parent, "CompatibilityDescriptor");
        fs::create_file_number(
            &dir,
            "compatibility_descriptor_length",
            self.compatibility_descriptor_length as u64,
        );
        fs::create_file_number(&dir, "descriptor_count", self.entries.len() as u64);
        for (i, entry) in self.entries.iter().enumerate() {
            let subdir = fs::create_directory(&dir, &format!("descriptor_{:02}", i + 1));
            fs::create_file_number(&subdir, "descriptor_type", entry.descriptor_type as u64);
            fs::create_file_number(&subdir, "descriptor_length", entry.descriptor_length as u64);
            fs::create_file_number(&subdir, "specifier_type", entry.specifier_type as u64);
            fs::create_file_bin(&subdir, "specifier_data", &entry.specifier_data);
            fs::create_file_number(&subdir, "model", entry.model as u64);
            fs::create_file_number(&subdir, "version", entry.version as u64);
            fs::create_file_number(
                &subdir,
                "sub_descriptor_count",
                entry.sub_descriptors.len() as u64,
            );
            for (k, (sub_type, data)) in entry.sub_descriptors.iter().enumerate() {
                let sub_dentry = fs::create_directory(&subdir, &format!("sub_descriptor_{:02}", k + 1));
                fs::create_file_number(&sub_dentry, "sub_descriptor_type", *sub_type as u64);
                fs::create_file_number(&sub_dentry, "sub_descriptor_length", data.len() as u64);
                if !data.is_empty() {
                    fs::create_file_bin(&sub_dentry, "additional_information", data);
                }
            }
        }
    }
}

/// DSM-CC section parser registered on elementary PIDs tagged for carousel
/// carriage. Branches on table_id: AIT, DII (which may carry a DSI by
/// message_id) or DDB.
#[derive(Debug, Clone, Copy)]
pub struct Dsmcc;

impl TableParser for Dsmcc {
    fn parse(&self, demux: &mut Demuxer, pid: u16, payload: &[u8]) -> Result<()> {
        if payload.is_empty() {
            return Ok(());
        }
        match payload[0] {
            TS_AIT_TABLE_ID => ait::parse(demux, pid, payload),
            TS_DII_TABLE_ID => dii::parse(demux, pid, payload),
            TS_DDB_TABLE_ID => ddb::parse(demux, pid, payload),
            other => {
                debug!("no DSM-CC parser for table_id {:#x}", other);
                Ok(())
            }
        }
    }
}
