//! Network Information Table (table_id 0x40).

use log::{debug, warn};

use super::{install_version, version_unchanged, TableParser};
use crate::descriptors::{descriptors_count, DescriptorContext};
use crate::fs::{self, names};
use crate::psi::{table_inode, PsiHeader};
use crate::{DemuxError, Demuxer, Result};

#[derive(Debug, Clone, Copy)]
pub struct Nit;

impl TableParser for Nit {
    fn parse(&self, demux: &mut Demuxer, pid: u16, payload: &[u8]) -> Result<()> {
        let header = PsiHeader::parse(payload)?;
        let inode = table_inode(pid, header.table_id);
        if version_unchanged(demux, inode, &header) {
            return Ok(());
        }
        if payload.len() < 12 {
            return Err(DemuxError::ShortPayload {
                context: "NIT fixed prefix",
                expected: 12,
                found: payload.len(),
            });
        }

        debug!(
            "NIT parser: pid={:#x}, table_id={:#x}, version={:#x}, len={}",
            pid,
            header.table_id,
            header.version_number,
            payload.len()
        );

        let network_descriptors_length =
            (((payload[8] as usize) << 8 | payload[9] as usize) & 0x0fff)
                .min(payload.len().saturating_sub(10));

        let table_dentry = fs::create_directory(&demux.root.clone(), names::NIT);
        let version_dentry = fs::create_version_dir(&table_dentry, header.version_number as u32);
        header.populate(&version_dentry);

        let network_info = &payload[10..10 + network_descriptors_length];
        let num_descriptors = descriptors_count(network_info, network_descriptors_length);
        demux.ts_descriptors.parse(
            network_info,
            num_descriptors,
            &version_dentry,
            &DescriptorContext::default(),
        );

        let mut offset = 10 + network_descriptors_length;
        if offset + 2 > payload.len() {
            return Err(DemuxError::ShortPayload {
                context: "NIT transport stream loop",
                expected: offset + 2,
                found: payload.len(),
            });
        }
        let transport_stream_loop_length =
            ((payload[offset] as usize) << 8 | payload[offset + 1] as usize) & 0x0fff;
        offset += 2;

        let ts_dentry = fs::create_directory(&version_dentry, "TS_INFORMATION");
        let mut walked = 0;
        let mut info_index = 0;
        while walked < transport_stream_loop_length && offset + 6 <= payload.len() {
            info_index += 1;
            let info_dentry = fs::create_directory(&ts_dentry, &format!("{:02}", info_index));

            let transport_stream_id =
                (payload[offset] as u16) << 8 | payload[offset + 1] as u16;
            let original_network_id =
                (payload[offset + 2] as u16) << 8 | payload[offset + 3] as u16;
            let transport_descriptors_length =
                (((payload[offset + 4] as usize) << 8 | payload[offset + 5] as usize) & 0x0fff)
                    .min(payload.len().saturating_sub(offset + 6));
            fs::create_file_number(&info_dentry, "transport_stream_id", transport_stream_id as u64);
            fs::create_file_number(&info_dentry, "original_network_id", original_network_id as u64);
            fs::create_file_number(
                &info_dentry,
                "transport_descriptors_length",
                transport_descriptors_length as u64,
            );

            if original_network_id != header.identifier {
                warn!(
                    "NIT: original_network_id({:#x}) != network_id({:#x})",
                    original_network_id, header.identifier
                );
            }

            let region = &payload[offset + 6..offset + 6 + transport_descriptors_length];
            let num = descriptors_count(region, transport_descriptors_length);
            demux
                .ts_descriptors
                .parse(region, num, &info_dentry, &DescriptorContext::default());

            walked += 6 + transport_descriptors_length;
            offset += 6 + transport_descriptors_length;
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
