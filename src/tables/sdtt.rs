//! Software Download Trigger Table (table_id 0xC3).

use log::{debug, warn};

use super::tot::{decode_bcd_duration, decode_mjd_time};
use super::{install_version, version_unchanged, TableParser};
use crate::descriptors::{descriptors_count, DescriptorContext};
use crate::fs::xattr::XATTR_FORMAT_STRING_AND_NUMBER;
use crate::fs::{self, names};
use crate::psi::{table_inode, PsiHeader};
use crate::{DemuxError, Demuxer, Result};

#[derive(Debug, Clone, Copy)]
pub struct Sdtt;

fn download_level_name(level: u8) -> &'static str {
    match level {
        0x01 => "Mandatory download",
        _ => "Optional download",
    }
}

fn version_indicator_name(indicator: u8) -> &'static str {
    match indicator {
        0x00 => "All versions are targeted",
        0x01 => "Versions specified or later are targeted",
        0x02 => "Versions specified or earlier are targeted",
        _ => "Only the specified version is targeted",
    }
}

impl TableParser for Sdtt {
    fn parse(&self, demux: &mut Demuxer, pid: u16, payload: &[u8]) -> Result<()> {
        let header = PsiHeader::parse(payload)?;
        if header.section_number != 0 {
            warn!("section_number != 0");
        }
        if header.last_section_number != 0 {
            warn!("last_section_number != 0");
        }

        let inode = table_inode(pid, header.table_id);
        if version_unchanged(demux, inode, &header) {
            return Ok(());
        }
        if payload.len() < 15 {
            return Err(DemuxError::ShortPayload {
                context: "SDTT fixed prefix",
                expected: 15,
                found: payload.len(),
            });
        }

        debug!(
            "SDTT parser: pid={:#x}, table_id={:#x}, version={:#x}, len={}",
            pid,
            header.table_id,
            header.version_number,
            payload.len()
        );

        let sdtt_dir = fs::create_directory(&demux.root.clone(), names::SDTT);
        let table_dentry = fs::create_directory(&sdtt_dir, &format!("{:#06x}", pid));
        let version_dentry = fs::create_version_dir(&table_dentry, header.version_number as u32);
        header.populate(&version_dentry);

        /* The table identifier packs maker and model */
        fs::create_file_number(&version_dentry, "maker_id", (header.identifier >> 8) as u64);
        fs::create_file_number(&version_dentry, "model_id", (header.identifier & 0xff) as u64);

        let transport_stream_id = (payload[8] as u16) << 8 | payload[9] as u16;
        let original_network_id = (payload[10] as u16) << 8 | payload[11] as u16;
        let service_id = (payload[12] as u16) << 8 | payload[13] as u16;
        let num_of_contents = payload[14];
        fs::create_file_number(&version_dentry, "transport_stream_id", transport_stream_id as u64);
        fs::create_file_number(&version_dentry, "original_network_id", original_network_id as u64);
        fs::create_file_number(&version_dentry, "service_id", service_id as u64);
        fs::create_file_number(&version_dentry, "num_of_contents", num_of_contents as u64);

        let mut offset = 15;
        for i in 0..num_of_contents {
            if offset + 8 > payload.len() {
                warn!("SDTT content loop truncated after {} contents", i);
                break;
            }
            let content_dentry =
                fs::create_directory(&version_dentry, &format!("Content_{:02}", i + 1));

            let group = (payload[offset] >> 4) & 0x0f;
            let target_version =
                ((payload[offset] as u16) << 8 | payload[offset + 1] as u16) & 0x0fff;
            let new_version =
                ((payload[offset + 2] as u16) << 4 | (payload[offset + 3] as u16) >> 4) & 0x0fff;
            let download_level = (payload[offset + 3] >> 2) & 0x03;
            let version_indicator = payload[offset + 3] & 0x03;
            let content_description_length =
                (((payload[offset + 4] as usize) << 8 | payload[offset + 5] as usize) & 0xfff0) >> 4;
            let schedule_description_length =
                (((payload[offset + 6] as usize) << 8 | payload[offset + 7] as usize) & 0xfff0) >> 4;
            let schedule_timeshift_information = payload[offset + 7] & 0x0f;
            offset += 8;

            fs::create_file_number(&content_dentry, "group", group as u64);
            fs::create_file_number(&content_dentry, "target_version", target_version as u64);
            fs::create_file_number(&content_dentry, "new_version", new_version as u64);
            fs::create_file_string(
                &content_dentry,
                "download_level",
                &format!("{} [{:#x}]", download_level_name(download_level), download_level),
                XATTR_FORMAT_STRING_AND_NUMBER,
            );
            fs::create_file_string(
                &content_dentry,
                "version_indicator",
                &format!(
                    "{} [{:#x}]",
                    version_indicator_name(version_indicator),
                    version_indicator
                ),
                XATTR_FORMAT_STRING_AND_NUMBER,
            );
            fs::create_file_number(
                &content_dentry,
                "schedule_timeshift_information",
                schedule_timeshift_information as u64,
            );

            if offset + content_description_length > payload.len()
                || schedule_description_length > content_description_length
            {
                warn!("SDTT content description exceeds the payload");
                break;
            }

            /* Schedule loop: 8-byte (start_time, duration) pairs */
            let mut schedule_offset = 0;
            let mut schedule_index = 0;
            while schedule_offset + 8 <= schedule_description_length {
                let base = offset + schedule_offset;
                let start_time = (payload[base] as u64) << 32
                    | (payload[base + 1] as u64) << 24
                    | (payload[base + 2] as u64) << 16
                    | (payload[base + 3] as u64) << 8
                    | payload[base + 4] as u64;
                let duration = (payload[base + 5] as u32) << 16
                    | (payload[base + 6] as u32) << 8
                    | payload[base + 7] as u32;

                schedule_index += 1;
                let schedule_dentry =
                    fs::create_directory(&content_dentry, &format!("Schedule_{:02}", schedule_index));
                fs::create_file_string(
                    &schedule_dentry,
                    "start_time",
                    &format!("{} [{:#x}]", decode_mjd_time(start_time), start_time),
                    XATTR_FORMAT_STRING_AND_NUMBER,
                );
                fs::create_file_string(
                    &schedule_dentry,
                    "duration",
                    &format!("{} [{:#x}]", decode_bcd_duration(duration), duration),
                    XATTR_FORMAT_STRING_AND_NUMBER,
                );
                schedule_offset += 8;
            }

            /* Remaining content description bytes are TS descriptors */
            let region =
                &payload[offset + schedule_description_length..offset + content_description_length];
            let num = descriptors_count(region, region.len());
            demux
                .ts_descriptors
                .parse(region, num, &content_dentry, &DescriptorContext::default());

            offset += content_description_length;
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
