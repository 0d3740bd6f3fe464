//! Application Information Table (table_id 0x74).

use std::sync::Arc;

use log::{debug, warn};

use crate::fs::xattr::XATTR_FORMAT_STRING;
use crate::fs::{self, names, Dentry};
use crate::psi::{table_inode, PsiHeader};
use crate::tables::{install_version, version_unchanged};
use crate::{DemuxError, Demuxer, Result};

fn latin1(bytes: &[u8]) -> String {
    bytes.iter().map(|&b| b as char).collect()
}

/// AIT-specific descriptor decoding. Tags without a structured decoder
/// materialise as named binary files.
fn parse_ait_descriptor(tag: u8, body: &[u8], parent: &Arc<Dentry>) {
    match tag {
        0x00 => {
            /* Application descriptor */
            let dentry = fs::create_directory(parent, "APPLICATION");
            if body.is_empty() {
                return;
            }
            let profiles_length = body[0] as usize;
            let mut offset = 1;
            let mut profile_index = 0;
            while offset + 5 <= 1 + profiles_length.min(body.len().saturating_sub(1)) {
                profile_index += 1;
                let profile_dentry =
                    fs::create_directory(&dentry, &format!("profile_{:02}", profile_index));
                let application_profile = (body[offset] as u16) << 8 | body[offset + 1] as u16;
                fs::create_file_number(&profile_dentry, "application_profile", application_profile as u64);
                fs::create_file_number(&profile_dentry, "version_major", body[offset + 2] as u64);
                fs::create_file_number(&profile_dentry, "version_minor", body[offset + 3] as u64);
                fs::create_file_number(&profile_dentry, "version_micro", body[offset + 4] as u64);
                offset += 5;
            }
            if offset + 2 <= body.len() {
                let service_bound_flag = (body[offset] >> 7) & 0x01;
                let visibility = (body[offset] >> 5) & 0x03;
                fs::create_file_number(&dentry, "service_bound_flag", service_bound_flag as u64);
                fs::create_file_number(&dentry, "visibility", visibility as u64);
                fs::create_file_number(&dentry, "application_priority", body[offset + 1] as u64);
                if offset + 2 < body.len() {
                    fs::create_file_bin(&dentry, "transport_protocol_labels", &body[offset + 2..]);
                }
            }
        }
        0x01 => {
            /* Application name descriptor */
            let dentry = fs::create_directory(parent, "APPLICATION_NAME");
            if body.len() < 4 {
                return;
            }
            fs::create_file_string(
                &dentry,
                "iso_639_language_code",
                &latin1(&body[..3]),
                XATTR_FORMAT_STRING,
            );
            let name_length = body[3] as usize;
            if 4 + name_length <= body.len() {
                fs::create_file_string(
                    &dentry,
                    "application_name",
                    &latin1(&body[4..4 + name_length]),
                    XATTR_FORMAT_STRING,
                );
            }
        }
        0x02 => {
            /* Transport protocol descriptor */
            let dentry = fs::create_directory(parent, "TRANSPORT_PROTOCOL");
            if body.len() < 3 {
                return;
            }
            let protocol_id = (body[0] as u16) << 8 | body[1] as u16;
            let protocol_name = match protocol_id {
                0x0001 => "Object Carousel",
                0x0002 => "IP",
                0x0003 => "Interaction Channel",
                _ => "Reserved",
            };
            fs::create_file_string(
                &dentry,
                "protocol_id",
                &format!("{} [{:#x}]", protocol_name, protocol_id),
                crate::fs::xattr::XATTR_FORMAT_STRING_AND_NUMBER,
            );
            fs::create_file_number(&dentry, "transport_protocol_label", body[2] as u64);
            if body.len() > 3 {
                fs::create_file_bin(&dentry, "selector_bytes", &body[3..]);
            }
        }
        0x03 => {
            /* Ginga-J application descriptor */
            let dentry = fs::create_directory(parent, "GINGA_J_APPLICATION");
            let mut offset = 0;
            let mut parameter_index = 0;
            while offset < body.len() {
                let parameter_length = body[offset] as usize;
                offset += 1;
                if offset + parameter_length > body.len() {
                    break;
                }
                parameter_index += 1;
                fs::create_file_string(
                    &dentry,
                    &format!("parameter_{:02}", parameter_index),
                    &latin1(&body[offset..offset + parameter_length]),
                    XATTR_FORMAT_STRING,
                );
                offset += parameter_length;
            }
        }
        0x04 => {
            /* Ginga-J application location descriptor */
            let dentry = fs::create_directory(parent, "GINGA_J_APPLICATION_LOCATION");
            if body.is_empty() {
                return;
            }
            let base_length = body[0] as usize;
            if 1 + base_length > body.len() {
                return;
            }
            fs::create_file_string(
                &dentry,
                "base_directory",
                &latin1(&body[1..1 + base_length]),
                XATTR_FORMAT_STRING,
            );
            let mut offset = 1 + base_length;
            if offset < body.len() {
                let classpath_length = body[offset] as usize;
                offset += 1;
                if offset + classpath_length <= body.len() {
                    fs::create_file_string(
                        &dentry,
                        "classpath_extension",
                        &latin1(&body[offset..offset + classpath_length]),
                        XATTR_FORMAT_STRING,
                    );
                    fs::create_file_string(
                        &dentry,
                        "initial_class",
                        &latin1(&body[offset + classpath_length..]),
                        XATTR_FORMAT_STRING,
                    );
                }
            }
        }
        0x05 | 0x06 | 0x0b | 0x0c | 0x0d | 0x11 => {
            fs::create_file_bin(parent, &format!("ait_descriptor_{:#04x}", tag), body);
        }
        _ => debug!("no AIT parser for descriptor tag {:#x}", tag),
    }
}

fn parse_descriptor_loop(payload: &[u8], parent: &Arc<Dentry>) {
    let mut offset = 0;
    while offset + 2 <= payload.len() {
        let tag = payload[offset];
        let length = payload[offset + 1] as usize;
        if offset + 2 + length > payload.len() {
            warn!("AIT descriptor length overruns the loop");
            break;
        }
        parse_ait_descriptor(tag, &payload[offset + 2..offset + 2 + length], parent);
        offset += 2 + length;
    }
}

pub(crate) fn parse(demux: &mut Demuxer, pid: u16, payload: &[u8]) -> Result<()> {
    let header = PsiHeader::parse(payload)?;
    let inode = table_inode(pid, header.table_id);
    if version_unchanged(demux, inode, &header) {
        return Ok(());
    }
    if payload.len() < 14 {
        return Err(DemuxError::ShortPayload {
            context: "AIT fixed prefix",
            expected: 14,
            found: payload.len(),
        });
    }

    debug!(
        "AIT parser: pid={:#x}, version={:#x}, len={}",
        pid,
        header.version_number,
        payload.len()
    );

    let ait_dir = fs::create_directory(&demux.root.clone(), names::AIT);
    let table_dentry = fs::create_directory(&ait_dir, &format!("{:#06x}", pid));
    let version_dentry = fs::create_version_dir(&table_dentry, header.version_number as u32);
    header.populate(&version_dentry);

    let section_end = (3 + header.section_length as usize)
        .saturating_sub(4)
        .min(payload.len());

    /* Common descriptor loop */
    let common_descriptors_length =
        (((payload[8] as usize) << 8 | payload[9] as usize) & 0x0fff)
            .min(section_end.saturating_sub(10));
    parse_descriptor_loop(
        &payload[10..10 + common_descriptors_length],
        &version_dentry,
    );

    let mut offset = 10 + common_descriptors_length;
    if offset + 2 > section_end {
        return Ok(());
    }
    let application_loop_length =
        ((payload[offset] as usize) << 8 | payload[offset + 1] as usize) & 0x0fff;
    offset += 2;

    let loop_end = (offset + application_loop_length).min(section_end);
    let mut application_index = 0;
    while offset + 9 <= loop_end {
        application_index += 1;
        let application_dentry = fs::create_directory(
            &version_dentry,
            &format!("Application_{:02}", application_index),
        );

        let organization_id = (payload[offset] as u32) << 24
            | (payload[offset + 1] as u32) << 16
            | (payload[offset + 2] as u32) << 8
            | payload[offset + 3] as u32;
        let application_id = (payload[offset + 4] as u16) << 8 | payload[offset + 5] as u16;
        let application_control_code = payload[offset + 6];
        let descriptors_loop_length =
            ((payload[offset + 7] as usize) << 8 | payload[offset + 8] as usize) & 0x0fff;
        offset += 9;

        fs::create_file_number(&application_dentry, "organization_id", organization_id as u64);
        fs::create_file_number(&application_dentry, "application_id", application_id as u64);
        fs::create_file_number(
            &application_dentry,
            "application_control_code",
            application_control_code as u64,
        );

        if offset + descriptors_loop_length > loop_end {
            warn!("AIT application descriptor loop exceeds the section");
            break;
        }
        parse_descriptor_loop(
            &payload[offset..offset + descriptors_loop_length],
            &application_dentry,
        );
        offset += descriptors_loop_length;
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
