//! Service Description Table (table_id 0x42).

use log::{debug, warn};

use super::{install_version, pat::announces_service, version_unchanged, TableParser};
use crate::descriptors::DescriptorContext;
use crate::fs::{self, names};
use crate::psi::{table_inode, PsiHeader};
use crate::{DemuxError, Demuxer, Result};

#[derive(Debug, Clone, Copy)]
pub struct Sdt;

impl TableParser for Sdt {
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
                context: "SDT fixed prefix",
                expected: 15,
                found: payload.len(),
            });
        }

        debug!(
            "SDT parser: pid={:#x}, table_id={:#x}, version={:#x}, len={}",
            pid,
            header.table_id,
            header.version_number,
            payload.len()
        );

        let table_dentry = fs::create_directory(&demux.root.clone(), names::SDT);
        let version_dentry = fs::create_version_dir(&table_dentry, header.version_number as u32);
        header.populate(&version_dentry);

        let original_network_id = (payload[8] as u16) << 8 | payload[9] as u16;
        fs::create_file_number(&version_dentry, "original_network_id", original_network_id as u64);

        let section_end = (3 + header.section_length as usize)
            .saturating_sub(4)
            .min(payload.len());
        let mut offset = 11;
        let mut service_index = 0;
        while offset + 5 <= section_end {
            let descriptors_loop_length =
                ((payload[offset + 3] as usize) << 8 | payload[offset + 4] as usize) & 0x0fff;
            if offset + 5 + descriptors_loop_length > section_end {
                warn!("descriptor_loop_length exceeds table size");
                return Err(DemuxError::InvalidArgument);
            }

            service_index += 1;
            let service_dentry =
                fs::create_directory(&version_dentry, &format!("Service_{:02}", service_index));

            let service_id = (payload[offset] as u16) << 8 | payload[offset + 1] as u16;
            let eit_schedule_flag = (payload[offset + 2] >> 1) & 0x01;
            let eit_present_following_flag = payload[offset + 2] & 0x01;
            let running_status = (payload[offset + 3] >> 5) & 0x07;
            let free_ca_mode = (payload[offset + 3] >> 4) & 0x01;
            fs::create_file_number(&service_dentry, "service_id", service_id as u64);
            fs::create_file_number(&service_dentry, "eit_schedule_flag", eit_schedule_flag as u64);
            fs::create_file_number(
                &service_dentry,
                "eit_present_following_flag",
                eit_present_following_flag as u64,
            );
            fs::create_file_number(&service_dentry, "running_status", running_status as u64);
            fs::create_file_number(&service_dentry, "free_ca_mode", free_ca_mode as u64);
            fs::create_file_number(
                &service_dentry,
                "descriptors_loop_length",
                descriptors_loop_length as u64,
            );

            if !announces_service(demux, service_id) {
                warn!("service_id {:#x} not declared by the PAT", service_id);
            }

            /* Per-service descriptor loop, one descriptor at a time */
            let mut n = 0;
            while n + 2 <= descriptors_loop_length {
                let region = &payload[offset + 5 + n..offset + 5 + descriptors_loop_length];
                let descriptor_length = region[1] as usize;
                demux
                    .ts_descriptors
                    .parse(region, 1, &service_dentry, &DescriptorContext::default());
                n += 2 + descriptor_length;
            }
            offset += 5 + descriptors_loop_length;
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
