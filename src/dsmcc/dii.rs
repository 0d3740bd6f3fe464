//! Download Info Indication (table_id 0x3B, message_id 0x1002).

use log::{debug, warn};

use super::{CarouselState, CompatibilityDescriptor, DsmccMessageHeader, DsmccMessageId, ModuleInfo};
use crate::fs::{self, names};
use crate::psi::{table_inode, PsiHeader};
use crate::tables::{install_version, version_unchanged};
use crate::{DemuxError, Demuxer, Result, SliceReader};

use num_traits::FromPrimitive;

pub(crate) fn parse(demux: &mut Demuxer, pid: u16, payload: &[u8]) -> Result<()> {
    if payload.len() < 20 {
        return Err(DemuxError::ShortPayload {
            context: "DII fixed prefix",
            expected: 20,
            found: payload.len(),
        });
    }
    let header = PsiHeader::parse(payload)?;
    if !header.section_syntax_indicator {
        /* Checksum carriage */
        warn!("DII contains a Checksum");
    }

    let mut reader = SliceReader::new(&payload[8..]);
    let msg_header = DsmccMessageHeader::parse(&mut reader)?;

    if msg_header.protocol_discriminator != 0x11 || msg_header.dsmcc_type != 0x03 {
        debug!(
            "protocol_discriminator={:#x}, dsmcc_type={:#x}: not a U-N message, bailing out",
            msg_header.protocol_discriminator, msg_header.dsmcc_type
        );
        return Ok(());
    }

    match DsmccMessageId::from_u16(msg_header.message_id) {
        Some(DsmccMessageId::DownloadServerInitiate) => {
            /* A DSI arrives on the same PID and table_id. */
            return super::dsi::parse(demux, pid, payload);
        }
        Some(DsmccMessageId::DownloadInfoIndication) => {}
        _ => return Ok(()),
    }

    let inode = table_inode(pid, header.table_id);
    if version_unchanged(demux, inode, &header) {
        return Ok(());
    }

    debug!(
        "DII parser: pid={:#x}, table_id={:#x}, version={:#x}, transaction={:#x}",
        pid,
        header.table_id,
        header.version_number,
        msg_header.transaction_id & !0x8000_0000
    );

    /* DownloadInfoIndication fixed part */
    let download_id = reader.read_be_u32()?;
    let block_size = reader.read_be_u16()?;
    let window_size = reader.read_u8()?;
    let ack_period = reader.read_u8()?;
    let t_c_download_window = reader.read_be_u32()?;
    let t_c_download_scenario = reader.read_be_u32()?;

    if block_size == 0 {
        return Ok(());
    }

    let compatibility = CompatibilityDescriptor::parse(&mut reader)?;

    let number_of_modules = reader.read_be_u16()?;
    let mut modules = Vec::with_capacity(number_of_modules as usize);
    for _ in 0..number_of_modules {
        let module_id = reader.read_be_u16()?;
        let module_size = reader.read_be_u32()?;
        let module_version = reader.read_u8()?;
        let module_info_length = reader.read_u8()? as usize;
        let module_info = reader.read(module_info_length)?.to_vec();
        modules.push((module_id, module_size, module_version, module_info));
    }

    /* Create filesystem entries for this table */
    let dii_dir = fs::create_directory(&demux.root.clone(), names::DII);
    let table_dentry = fs::create_directory(&dii_dir, &format!("{:#06x}", pid));
    let version_dentry = fs::create_version_dir(&table_dentry, download_id);
    header.populate(&version_dentry);
    msg_header.populate(&version_dentry, false);
    compatibility.populate(&version_dentry);

    fs::create_file_number(&version_dentry, "download_id", download_id as u64);
    fs::create_file_number(&version_dentry, "block_size", block_size as u64);
    fs::create_file_number(&version_dentry, "window_size", window_size as u64);
    fs::create_file_number(&version_dentry, "ack_period", ack_period as u64);
    fs::create_file_number(&version_dentry, "t_c_download_window", t_c_download_window as u64);
    fs::create_file_number(
        &version_dentry,
        "t_c_download_scenario",
        t_c_download_scenario as u64,
    );
    if window_size != 0 {
        warn!("window_size != 0 ({})", window_size);
    }
    if ack_period != 0 {
        warn!("ack_period != 0 ({})", ack_period);
    }
    if t_c_download_window != 0 {
        warn!("t_c_download_window != 0 ({})", t_c_download_window);
    }

    fs::create_file_number(&version_dentry, "number_of_modules", number_of_modules as u64);
    for (i, (module_id, module_size, module_version, module_info)) in modules.iter().enumerate() {
        let subdir = fs::create_directory(&version_dentry, &format!("module_{:02}", i + 1));
        fs::create_file_number(&subdir, "module_id", *module_id as u64);
        fs::create_file_number(&subdir, "module_size", *module_size as u64);
        fs::create_file_number(&subdir, "module_version", *module_version as u64);
        fs::create_file_number(&subdir, "module_info_length", module_info.len() as u64);
        if !module_info.is_empty() {
            let mut offset = 0;
            while offset < module_info.len() {
                let consumed = demux
                    .dsmcc_descriptors
                    .parse(&module_info[offset..], 1, &subdir);
                if consumed == 0 {
                    break;
                }
                offset += consumed;
            }
        }
    }

    let private_data_length = reader.read_be_u16().unwrap_or(0);
    fs::create_file_number(&version_dentry, "private_data_length", private_data_length as u64);

    /* Remember the module map so the DDB parser can tell when a module has
     * all of its blocks */
    let carousel = demux
        .carousels
        .entry(pid)
        .or_insert_with(CarouselState::new);
    carousel.block_size = block_size;
    carousel.download_id = download_id;
    carousel.transaction_id = Some(msg_header.transaction_id);
    carousel.modules.clear();
    for (module_id, module_size, module_version, _) in &modules {
        carousel.modules.insert(
            *module_id,
            ModuleInfo {
                size: *module_size,
                version: *module_version,
            },
        );
    }

    install_version(
        demux,
        inode,
        header.version_number,
        table_dentry,
        version_dentry,
    );
    Ok(())
}
