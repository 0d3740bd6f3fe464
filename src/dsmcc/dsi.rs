//! Download Server Initiate (table_id 0x3B, message_id 0x1006).
//!
//! The private data carries either a GroupInfoIndication (data carousel) or
//! a BIOP::ServiceGatewayInformation whose IOR locates the gateway module
//! (object carousel).

use log::{debug, warn};

use super::{CarouselState, CompatibilityDescriptor, DsmccMessageHeader};
use crate::fs::{self, names};
use crate::psi::{table_inode, PsiHeader, DSI_INODE_FLAG};
use crate::tables::{install_version, version_unchanged};
use crate::{DemuxError, Demuxer, Result, SliceReader};

/// Tries to cross-link the DSI to the DII announced by its connbinder. The
/// symlink is created in the DSI's current version directory; a
/// transaction_id mismatch installs a broken link instead.
fn create_dii_symlink(demux: &mut Demuxer, pid: u16, selector_transaction_id: u32) -> bool {
    let dii_inode = table_inode(pid, super::TS_DII_TABLE_ID);
    let dii_transaction_id = match demux
        .carousels
        .get(&pid)
        .and_then(|carousel| carousel.transaction_id)
    {
        Some(id) => id,
        /* Possibly we didn't scan the DII yet */
        None => return false,
    };
    if demux.tables.get(&dii_inode).is_none() {
        return false;
    }

    let dsi_inode = table_inode(pid, super::TS_DII_TABLE_ID) | DSI_INODE_FLAG;
    let dsi_current = match demux
        .tables
        .get(&dsi_inode)
        .and_then(|table| fs::get_current(&table.table_dentry))
    {
        Some(current) => current,
        None => return false,
    };

    if dii_transaction_id != selector_transaction_id {
        warn!(
            "dii_transaction_id {:#x} != dsi_transaction_id {:#x}",
            dii_transaction_id, selector_transaction_id
        );
        fs::create_symlink(&dsi_current, "DII", names::BROKEN_SYMLINK);
    } else {
        let target = format!("../../../{}/{:#06x}/{}", names::DII, pid, names::CURRENT);
        fs::create_symlink(&dsi_current, "DII", &target);
    }
    true
}

pub(crate) fn parse(demux: &mut Demuxer, pid: u16, payload: &[u8]) -> Result<()> {
    if payload.len() < 20 {
        return Err(DemuxError::ShortPayload {
            context: "DSI fixed prefix",
            expected: 20,
            found: payload.len(),
        });
    }
    let header = PsiHeader::parse(payload)?;

    let mut reader = SliceReader::new(&payload[8..]);
    let msg_header = DsmccMessageHeader::parse(&mut reader)?;

    /* The inode is generated from PID and table_id, which would collide
     * with DII tables arriving on the same PID: disambiguate with bit 24. */
    let inode = table_inode(pid, header.table_id) | DSI_INODE_FLAG;

    if version_unchanged(demux, inode, &header) {
        /* A previously installed DSI may still be waiting for its DII */
        let pending = demux
            .carousels
            .get(&pid)
            .and_then(|carousel| carousel.dsi_selector_transaction)
            .filter(|_| {
                demux
                    .carousels
                    .get(&pid)
                    .map_or(false, |carousel| !carousel.dsi_linked)
            });
        if let Some(selector_transaction_id) = pending {
            if create_dii_symlink(demux, pid, selector_transaction_id) {
                if let Some(carousel) = demux.carousels.get_mut(&pid) {
                    carousel.dsi_linked = true;
                }
            }
        }
        return Ok(());
    }

    debug!(
        "DSI parser: pid={:#x}, table_id={:#x}, version={:#x}, transaction={:#x}",
        pid,
        header.table_id,
        header.version_number,
        msg_header.transaction_id & !0x8000_0000
    );

    /* Create filesystem entries for this table */
    let dsi_dir = fs::create_directory(&demux.root.clone(), names::DSI);
    let table_dentry = fs::create_directory(&dsi_dir, &format!("{:#06x}", pid));
    let version_dentry = fs::create_version_dir(&table_dentry, header.version_number as u32);
    header.populate(&version_dentry);
    msg_header.populate(&version_dentry, false);

    /* server_id must contain 20 entries filled up with 0xff */
    let server_id = reader.read(20)?;
    fs::create_file_bin(&version_dentry, "server_id", server_id);

    /* There must be no entries in the compatibility descriptor loop */
    let compatibility = CompatibilityDescriptor::parse(&mut reader)?;
    if compatibility.compatibility_descriptor_length != 0 {
        warn!(
            "DSM-CC compatibility descriptor has length != 0 ({})",
            compatibility.compatibility_descriptor_length
        );
    }
    fs::create_file_number(
        &version_dentry,
        "compatibility_descriptor_length",
        compatibility.compatibility_descriptor_length as u64,
    );

    let private_data_length = reader.read_be_u16()?;
    fs::create_file_number(&version_dentry, "private_data_length", private_data_length as u64);

    /* The private data holds two different data sets, depending on which
     * carousel flavour this is. Peek at the BIOP U-U object type_id the way
     * DVBSnoop does: "srg\0" or "DSM:" means ServiceGatewayInformation. */
    let type_id = {
        let peeked = reader.peek(8)?;
        u32::from_be_bytes([peeked[4], peeked[5], peeked[6], peeked[7]])
    };

    let mut selector_transaction_id = None;
    if type_id != 0x7372_6700 && type_id != 0x5344_3a4d {
        /* Data Carousel: GroupInfoIndication + carousel descriptors */
        let gii_dentry = fs::create_directory(&version_dentry, "GroupInfoIndication");
        let number_of_groups = reader.read_be_u16()?;
        fs::create_file_number(&gii_dentry, "number_of_groups", number_of_groups as u64);

        for i in 0..number_of_groups {
            debug!("parsing group {}/{}", i + 1, number_of_groups);
            let group_dentry = fs::create_directory(&gii_dentry, &format!("GroupInfo_{:02}", i + 1));
            let group_id = reader.read_be_u32()?;
            let group_size = reader.read_be_u32()?;
            fs::create_file_number(&group_dentry, "group_id", group_id as u64);
            fs::create_file_number(&group_dentry, "group_size", group_size as u64);

            let group_compatibility = CompatibilityDescriptor::parse(&mut reader)?;
            group_compatibility.populate(&group_dentry);
        }
    } else {
        /* Object Carousel: BIOP::ServiceGatewayInformation */
        let sgi_dentry = fs::create_directory(&version_dentry, "ServiceGatewayInfo");
        let ior = super::iop::parse_ior(&mut reader)?;
        super::iop::populate_ior(&sgi_dentry, &ior);

        selector_transaction_id = ior
            .first_tap()
            .and_then(|tap| tap.message_selector.as_ref())
            .map(|selector| selector.transaction_id);

        let download_taps_count = reader.read_u8()?;
        fs::create_file_number(&sgi_dentry, "download_taps_count", download_taps_count as u64);
        if download_taps_count > 0 {
            let taps = reader.read(download_taps_count as usize)?;
            fs::create_file_bin(&sgi_dentry, "download_taps", taps);
        }

        let service_context_list_count = reader.read_u8()?;
        fs::create_file_number(
            &sgi_dentry,
            "service_context_list_count",
            service_context_list_count as u64,
        );
        if service_context_list_count > 0 {
            let _context_id = reader.read_be_u16()?;
            let context_data_length = reader.read_u8()? as usize;
            reader.skip(context_data_length)?;
        }

        let user_info_length = reader.read_be_u16()?;
        fs::create_file_number(&sgi_dentry, "user_info_length", user_info_length as u64);
        if user_info_length > 0 {
            let user_info = reader.read(user_info_length as usize)?;
            fs::create_file_bin(&sgi_dentry, "user_info", user_info);
        }
    }

    install_version(
        demux,
        inode,
        header.version_number,
        table_dentry,
        version_dentry,
    );

    /* Remember the announced DII transaction and try the cross-link now
     * that the version directory is in place */
    let carousel = demux
        .carousels
        .entry(pid)
        .or_insert_with(CarouselState::new);
    carousel.dsi_selector_transaction = selector_transaction_id;
    carousel.dsi_linked = false;
    if let Some(selector) = selector_transaction_id {
        if create_dii_symlink(demux, pid, selector) {
            if let Some(carousel) = demux.carousels.get_mut(&pid) {
                carousel.dsi_linked = true;
            }
        }
    }
    Ok(())
}
