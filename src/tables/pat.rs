//! Program Association Table (table_id 0x00).

use log::{debug, warn};

use super::{install_version, version_unchanged, TableParser};
use crate::fs::{self, names};
use crate::psi::{table_inode, PsiHeader};
use crate::tables::PsiParser;
use crate::{DemuxError, Demuxer, Result};

#[derive(Debug, Clone, Copy)]
pub struct Pat;

impl TableParser for Pat {
    fn parse(&self, demux: &mut Demuxer, pid: u16, payload: &[u8]) -> Result<()> {
        let header = PsiHeader::parse(payload)?;
        let inode = table_inode(pid, header.table_id);

        if version_unchanged(demux, inode, &header) {
            return Ok(());
        }

        /* Enumerate (program_number, pid) pairs up to the CRC */
        let num_programs = (header.section_length as usize)
            .saturating_sub(2 + 1 + 1 + 1 + 4)
            / 4;
        if payload.len() < 8 + num_programs * 4 {
            return Err(DemuxError::ShortPayload {
                context: "PAT program loop",
                expected: 8 + num_programs * 4,
                found: payload.len(),
            });
        }
        let mut programs = Vec::with_capacity(num_programs);
        for i in 0..num_programs {
            let offset = 8 + i * 4;
            let program_number = (payload[offset] as u16) << 8 | payload[offset + 1] as u16;
            let program_pid =
                ((payload[offset + 2] as u16) << 8 | payload[offset + 3] as u16) & 0x1fff;
            programs.push((program_number, program_pid));
        }

        debug!(
            "PAT parser: pid={:#x}, version={:#x}, programs={}",
            pid,
            header.version_number,
            programs.len()
        );

        let table_dentry = fs::create_directory(&demux.root.clone(), names::PAT);
        let version_dentry = fs::create_version_dir(&table_dentry, header.version_number as u32);
        header.populate(&version_dentry);

        /* "Programs" directory with one symlink per announced program */
        let programs_dir = fs::create_directory(&version_dentry, names::PROGRAMS);
        demux.pat_programs.clear();
        for &(program_number, program_pid) in &programs {
            let name = format!("{:#06x}", program_number);
            if program_number == 0 {
                /* program_number 0 announces the NIT PID */
                let target = format!("../../{}", names::NIT);
                fs::create_symlink(&programs_dir, &name, &target);
                demux
                    .psi_parsers
                    .insert(program_pid, PsiParser::Nit(super::Nit));
            } else {
                let target = format!("../../{}/{:#06x}", names::PMT, program_pid);
                fs::create_symlink(&programs_dir, &name, &target);
                demux
                    .psi_parsers
                    .insert(program_pid, PsiParser::Pmt(super::Pmt));
                demux.pat_programs.insert(program_number, program_pid);
            }
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

/// SDT cross-check: whether the PAT announced a service_id.
pub(crate) fn announces_service(demux: &Demuxer, service_id: u16) -> bool {
    if demux.pat_programs.is_empty() {
        warn!("SDT service check requested before any PAT was parsed");
        return true;
    }
    demux.pat_programs.contains_key(&service_id)
}
