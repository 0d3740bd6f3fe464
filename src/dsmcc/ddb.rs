//! Download Data Block (table_id 0x3C).
//!
//! Every (module_id, block_number) pair materialises as a raw
//! `module_<nn>/block_<nn>.bin` file. Once a module announced by the DII has
//! collected all of its blocks, the concatenated bytes are handed to the
//! BIOP traversal and the orphan reparenting pass runs.

use std::collections::BTreeMap;
use std::sync::Arc;

use log::{debug, warn};

use super::{biop, CarouselState, DsmccMessageHeader, DsmccMessageId};
use crate::fs::{self, names, Dentry};
use crate::psi::{table_inode, PsiHeader, TableVersion};
use crate::{DemuxError, Demuxer, Result, SliceReader};

use num_traits::FromPrimitive;

fn block_already_parsed(version_dentry: &Arc<Dentry>, module_id: u16, block_number: u16) -> bool {
    let module_name = format!("module_{:02}", module_id);
    let block_name = format!("block_{:02}.bin", block_number);
    fs::get_child(version_dentry, &module_name)
        .and_then(|module_dir| fs::get_child(&module_dir, &block_name))
        .is_some()
}

/// Runs the BIOP traversal for every module whose blocks are all present,
/// then reparents staged children. Unresolvable orphans are discarded once
/// every module announced by the DII has been traversed.
fn assemble_completed_modules(demux: &mut Demuxer, pid: u16, version_dentry: &Arc<Dentry>) {
    let mut completed: Vec<(u16, u8, Vec<u8>)> = Vec::new();
    let stepfather;
    {
        let carousel = match demux.carousels.get(&pid) {
            Some(carousel) => carousel,
            None => return,
        };
        stepfather = carousel.stepfather.clone();
        for (module_id, info) in &carousel.modules {
            if carousel.assembled.contains(&(*module_id, info.version)) {
                continue;
            }
            let blocks = match carousel.blocks.get(module_id) {
                Some(blocks) => blocks,
                None => continue,
            };
            let total: usize = blocks.values().map(Vec::len).sum();
            if total >= info.size as usize {
                let mut module = Vec::with_capacity(total);
                for block in blocks.values() {
                    module.extend_from_slice(block);
                }
                completed.push((*module_id, info.version, module));
            }
        }
    }

    for (module_id, module_version, module) in &completed {
        debug!(
            "module {} v{} complete ({} bytes), running the BIOP traversal",
            module_id,
            module_version,
            module.len()
        );
        if let Err(e) = biop::create_filesystem_dentries(version_dentry, &stepfather, module) {
            warn!("BIOP traversal failed for module {}: {}", module_id, e);
        }
    }

    if completed.is_empty() {
        return;
    }

    let all_assembled = {
        let carousel = match demux.carousels.get_mut(&pid) {
            Some(carousel) => carousel,
            None => return,
        };
        for (module_id, module_version, _) in &completed {
            carousel.assembled.insert((*module_id, *module_version));
            carousel.blocks.remove(module_id);
        }
        carousel
            .modules
            .iter()
            .all(|(id, info)| carousel.assembled.contains(&(*id, info.version)))
    };

    biop::reparent_orphaned_dentries(version_dentry, &stepfather, all_assembled);
}

pub(crate) fn parse(demux: &mut Demuxer, pid: u16, payload: &[u8]) -> Result<()> {
    let header = PsiHeader::parse(payload)?;
    let inode = table_inode(pid, header.table_id);

    if !header.current_next_indicator {
        debug!("ddb doesn't have current_next_indicator bit set, skipping it");
        return Ok(());
    }

    let mut reader = SliceReader::new(&payload[8..]);
    let data_header = DsmccMessageHeader::parse(&mut reader)?;
    if data_header.dsmcc_type != 0x03
        || DsmccMessageId::from_u16(data_header.message_id) != Some(DsmccMessageId::DownloadDataBlock)
    {
        return Ok(());
    }
    if data_header.message_length < 5 {
        if data_header.message_length > 0 {
            debug!("skipping message with len={}", data_header.message_length);
        }
        return Ok(());
    }

    /* downloadDataBlock() */
    let module_id = reader.read_be_u16()?;
    let module_version = reader.read_u8()?;
    let _reserved = reader.read_u8()?;
    let block_number = reader.read_be_u16()?;

    let declared_size = (data_header.message_length as usize)
        .saturating_sub(data_header.adaptation_length as usize + 6);
    if declared_size == 0 {
        return Ok(());
    }

    /* Block bytes run to the section CRC */
    let available = reader.remaining_len().saturating_sub(4);
    if available == 0 {
        return Err(DemuxError::ShortPayload {
            context: "DDB block data",
            expected: declared_size,
            found: 0,
        });
    }
    if available != declared_size {
        warn!(
            "ddb block_data_size={} != this_block_size={}",
            declared_size, available
        );
    }
    let block_data = reader.read(available)?;

    /* Duplicate (module_id, block_number) pairs are suppressed */
    let version_dentry = match demux.tables.get(&inode) {
        Some(current) => match fs::get_current(&current.table_dentry) {
            Some(version_dentry) => {
                if block_already_parsed(&version_dentry, module_id, block_number) {
                    return Ok(());
                }
                version_dentry
            }
            None => return Ok(()),
        },
        None => {
            let ddb_dir = fs::create_directory(&demux.root.clone(), names::DDB);
            let table_dentry = fs::create_directory(&ddb_dir, &format!("{:#06x}", pid));
            let version_dentry =
                fs::create_version_dir(&table_dentry, header.version_number as u32);
            demux.tables.insert(
                inode,
                TableVersion {
                    version_number: header.version_number,
                    table_dentry,
                    version_dentry: version_dentry.clone(),
                },
            );
            version_dentry
        }
    };

    /* Materialise the raw block file */
    let module_dir = fs::create_directory(&version_dentry, &format!("module_{:02}", module_id));
    fs::create_file_bin(
        &module_dir,
        &format!("block_{:02}.bin", block_number),
        block_data,
    );

    /* Stash the bytes for the carousel decode pass */
    let carousel = demux
        .carousels
        .entry(pid)
        .or_insert_with(CarouselState::new);
    carousel
        .blocks
        .entry(module_id)
        .or_insert_with(BTreeMap::new)
        .insert(block_number, block_data.to_vec());
    if let Some(info) = carousel.modules.get(&module_id) {
        if info.version != module_version {
            warn!(
                "module {} version {} does not match the DII announcement ({})",
                module_id, module_version, info.version
            );
        }
    }

    assemble_completed_modules(demux, pid, &version_dentry);
    Ok(())
}
