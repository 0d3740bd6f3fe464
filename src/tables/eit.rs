//! Event Information Tables (table_ids 0x4E-0x6F).

use log::debug;

use super::tot::{decode_bcd_duration, decode_mjd_time};
use super::{install_version, version_unchanged, TableParser};
use crate::descriptors::{descriptors_count, DescriptorContext};
use crate::fs::xattr::XATTR_FORMAT_STRING_AND_NUMBER;
use crate::fs::{self, names};
use crate::psi::{table_inode, PsiHeader};
use crate::{DemuxError, Demuxer, Result};

#[derive(Debug, Clone, Copy)]
pub struct Eit;

impl TableParser for Eit {
    fn parse(&self, demux: &mut Demuxer, pid: u16, payload: &[u8]) -> Result<()> {
        let header = PsiHeader::parse(payload)?;
        let inode = table_inode(pid, header.table_id);
        if version_unchanged(demux, inode, &header) {
            return Ok(());
        }
        if payload.len() < 18 {
            return Err(DemuxError::ShortPayload {
                context: "EIT fixed prefix",
                expected: 18,
                found: payload.len(),
            });
        }

        debug!(
            "EIT parser: pid={:#x}, table_id={:#x}, version={:#x}, len={}",
            pid,
            header.table_id,
            header.version_number,
            payload.len()
        );

        let eit_dir = fs::create_directory(&demux.root.clone(), names::EIT);
        let table_dentry = fs::create_directory(&eit_dir, &format!("{:#06x}", pid));
        let version_dentry = fs::create_version_dir(&table_dentry, header.version_number as u32);
        header.populate(&version_dentry);

        let transport_stream_id = (payload[8] as u16) << 8 | payload[9] as u16;
        let original_network_id = (payload[10] as u16) << 8 | payload[11] as u16;
        fs::create_file_number(&version_dentry, "transport_stream_id", transport_stream_id as u64);
        fs::create_file_number(&version_dentry, "original_network_id", original_network_id as u64);
        fs::create_file_number(
            &version_dentry,
            "segment_last_section_number",
            payload[12] as u64,
        );
        fs::create_file_number(&version_dentry, "last_table_id", payload[13] as u64);

        /* Event entries keyed by event_id, bounded by the CRC */
        let section_end = (3 + header.section_length as usize)
            .saturating_sub(4)
            .min(payload.len());
        let mut offset = 14;
        while offset + 12 <= section_end {
            let event_id = (payload[offset] as u16) << 8 | payload[offset + 1] as u16;
            let start_time = (payload[offset + 2] as u64) << 32
                | (payload[offset + 3] as u64) << 24
                | (payload[offset + 4] as u64) << 16
                | (payload[offset + 5] as u64) << 8
                | payload[offset + 6] as u64;
            let duration = (payload[offset + 7] as u32) << 16
                | (payload[offset + 8] as u32) << 8
                | payload[offset + 9] as u32;
            let running_status = (payload[offset + 10] >> 5) & 0x07;
            let free_ca_mode = (payload[offset + 10] >> 4) & 0x01;
            let descriptors_loop_length =
                ((payload[offset + 10] as usize) << 8 | payload[offset + 11] as usize) & 0x0fff;
            if offset + 12 + descriptors_loop_length > section_end {
                break;
            }

            let event_dentry =
                fs::create_directory(&version_dentry, &format!("Event_{:#06x}", event_id));
            fs::create_file_number(&event_dentry, "event_id", event_id as u64);
            fs::create_file_string(
                &event_dentry,
                "start_time",
                &format!("{} [{:#x}]", decode_mjd_time(start_time), start_time),
                XATTR_FORMAT_STRING_AND_NUMBER,
            );
            fs::create_file_string(
                &event_dentry,
                "duration",
                &format!("{} [{:#x}]", decode_bcd_duration(duration), duration),
                XATTR_FORMAT_STRING_AND_NUMBER,
            );
            fs::create_file_number(&event_dentry, "running_status", running_status as u64);
            fs::create_file_number(&event_dentry, "free_ca_mode", free_ca_mode as u64);

            let region = &payload[offset + 12..offset + 12 + descriptors_loop_length];
            let num = descriptors_count(region, descriptors_loop_length);
            demux
                .ts_descriptors
                .parse(region, num, &event_dentry, &DescriptorContext::default());

            offset += 12 + descriptors_loop_length;
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
}
