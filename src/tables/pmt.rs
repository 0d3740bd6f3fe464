//! Program Map Table (table_id 0x02).
//!
//! Beyond decoding the stream loop, the PMT drives most of the runtime
//! registration: PES parsers for audio/video PIDs, the DSM-CC parser for
//! carousel PIDs, the per-stream FIFO nodes and the flat `/Streams` index.

use std::sync::Arc;

use log::{debug, info, warn};

use super::{install_version, version_unchanged, TableParser};
use crate::descriptors::{component_tag, descriptors_count, stream_type, DescriptorContext, StreamContext};
use crate::fs::xattr::XATTR_FORMAT_STRING_AND_NUMBER;
use crate::fs::{self, names, Dentry, DentryKind};
use crate::pes::PesKind;
use crate::psi::{table_inode, PsiHeader};
use crate::tables::PsiParser;
use crate::{DemuxError, Demuxer, Result};

#[derive(Debug, Clone, Copy)]
pub struct Pmt;

struct StreamClass {
    streams_name: &'static str,
    is_primary: bool,
    is_secondary: bool,
}

/// Chooses the per-class directory for one stream entry. A
/// stream_identifier_descriptor refines the classification (and decides
/// primary/secondary and one-seg placement); without one the stream_type
/// alone decides.
fn classify_stream(stream_type_id: u8, component: Option<u8>) -> StreamClass {
    let mut is_primary = false;
    let mut is_secondary = false;
    let mut streams_name = names::RESERVED_STREAMS;

    if let Some(tag) = component {
        let mut is_reserved = false;
        if component_tag::is_video(tag, &mut is_primary) {
            streams_name = if component_tag::is_one_seg(tag) {
                names::ONE_SEG_VIDEO_STREAMS
            } else {
                names::VIDEO_STREAMS
            };
        } else if component_tag::is_audio(tag, &mut is_primary) {
            streams_name = if component_tag::is_one_seg(tag) {
                names::ONE_SEG_AUDIO_STREAMS
            } else {
                names::AUDIO_STREAMS
            };
        } else if component_tag::is_caption(tag, &mut is_primary) {
            streams_name = names::CLOSED_CAPTION_STREAMS;
        } else if component_tag::is_superimposed(tag, &mut is_primary) {
            streams_name = names::SUPERIMPOSED_STREAMS;
        } else if component_tag::is_object_carousel(tag, &mut is_primary) {
            streams_name = names::OBJECT_CAROUSEL_STREAMS;
        } else if component_tag::is_data_carousel(tag, &mut is_primary) {
            streams_name = names::DATA_CAROUSEL_STREAMS;
        } else if component_tag::is_event_message(tag) {
            streams_name = names::EVENT_MESSAGE_STREAMS;
        } else {
            is_reserved = true;
        }
        if !is_primary && !is_reserved {
            is_secondary = true;
        }
    } else if stream_type::is_data_carousel(stream_type_id) {
        streams_name = names::DATA_CAROUSEL_STREAMS;
    } else if stream_type::is_event_message(stream_type_id) {
        streams_name = names::EVENT_MESSAGE_STREAMS;
    } else if stream_type::is_mpe(stream_type_id) {
        streams_name = names::MPE_STREAMS;
    } else if stream_type::is_object_carousel(stream_type_id) {
        streams_name = names::OBJECT_CAROUSEL_STREAMS;
    } else if stream_type::is_video(stream_type_id) {
        streams_name = names::VIDEO_STREAMS;
    } else if stream_type::is_audio(stream_type_id) {
        streams_name = names::AUDIO_STREAMS;
    }

    StreamClass {
        streams_name,
        is_primary,
        is_secondary,
    }
}

/// First component_tag carried by a stream_identifier_descriptor (0x52) in
/// an ES_info region, if any.
fn find_component_tag(es_info: &[u8]) -> Option<u8> {
    let mut offset = 0;
    while offset + 2 <= es_info.len() {
        let tag = es_info[offset];
        let length = es_info[offset + 1] as usize;
        if offset + 2 + length > es_info.len() {
            return None;
        }
        if tag == 0x52 && length >= 1 {
            return Some(es_info[offset + 2]);
        }
        offset += 2 + length;
    }
    None
}

fn populate_stream_dir(
    demux: &mut Demuxer,
    version_dentry: &Arc<Dentry>,
    stream_type_id: u8,
    es_pid: u16,
    es_info_length: u16,
    component: Option<u8>,
) -> Arc<Dentry> {
    let class = classify_stream(stream_type_id, component);
    let parent = fs::create_directory(version_dentry, class.streams_name);

    /* Directory named after the elementary PID in
     * /PMT/<pid>/<version>/<streams_name>/ */
    let dirname = format!("{:#06x}", es_pid);
    let subdir = fs::create_directory(&parent, &dirname);

    if class.is_primary {
        fs::create_symlink(&parent, names::PRIMARY, &dirname);
    } else if class.is_secondary && fs::get_child(&parent, names::SECONDARY).is_none() {
        fs::create_symlink(&parent, names::SECONDARY, &dirname);
    }

    /* Symlink in the flat /Streams index pointing at this directory */
    let streams_dir = fs::create_directory(&demux.root.clone(), names::STREAMS);
    let target = format!("..{}", fs::path_of(&subdir));
    fs::create_symlink(&streams_dir, &dirname, &target);

    /* FIFOs carrying this stream's PES (and optionally ES) contents */
    if stream_type::is_audio(stream_type_id) || stream_type::is_video(stream_type_id) {
        let kind = if stream_type::is_video(stream_type_id) {
            DentryKind::VideoFifo
        } else {
            DentryKind::AudioFifo
        };
        fs::create_fifo(&subdir, kind, names::PES_FIFO);
        if demux.options.parse_pes {
            fs::create_fifo(&subdir, kind, names::ES_FIFO);
        }
    }

    if stream_type::is_data_carousel(stream_type_id) || stream_type::is_object_carousel(stream_type_id)
    {
        let target = format!("../../../../../{}/{:#06x}/{}", names::DDB, es_pid, names::CURRENT);
        fs::create_symlink(&subdir, "BIOP", &target);
    }

    let described = format!(
        "{} [{:#x}]",
        stream_type::to_string(stream_type_id),
        stream_type_id
    );
    fs::create_file_string(
        &subdir,
        "stream_type_identifier",
        &described,
        XATTR_FORMAT_STRING_AND_NUMBER,
    );
    fs::create_file_number(&subdir, "elementary_stream_pid", es_pid as u64);
    fs::create_file_number(&subdir, "es_information_length", es_info_length as u64);

    /* Parser registration for the elementary PID */
    if stream_type::is_data_carousel(stream_type_id)
        || stream_type::is_event_message(stream_type_id)
        || stream_type::is_mpe(stream_type_id)
        || stream_type::is_object_carousel(stream_type_id)
    {
        demux
            .psi_parsers
            .entry(es_pid)
            .or_insert(PsiParser::Dsmcc(crate::dsmcc::Dsmcc));
    } else if stream_type::is_audio(stream_type_id) {
        demux.pes_parsers.entry(es_pid).or_insert(PesKind::Audio);
    } else if stream_type::is_video(stream_type_id) {
        demux.pes_parsers.entry(es_pid).or_insert(PesKind::Video);
    } else if !demux.pes_parsers.contains_key(&es_pid) {
        info!(
            "will parse pid {:#x} / stream_type {:#x} using a generic PES parser",
            es_pid, stream_type_id
        );
        demux.pes_parsers.insert(es_pid, PesKind::Other);
    }

    subdir
}

impl TableParser for Pmt {
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
        if payload.len() < 16 {
            return Err(DemuxError::ShortPayload {
                context: "PMT fixed prefix",
                expected: 16,
                found: payload.len(),
            });
        }

        debug!(
            "PMT parser: pid={:#x}, table_id={:#x}, version={:#x}, len={}",
            pid,
            header.table_id,
            header.version_number,
            payload.len()
        );

        let pcr_pid = ((payload[8] as u16) << 8 | payload[9] as u16) & 0x1fff;
        let program_info_length =
            (((payload[10] as usize) << 8 | payload[11] as usize) & 0x0fff)
                .min(payload.len().saturating_sub(12));

        let pmt_dir = fs::create_directory(&demux.root.clone(), names::PMT);
        let table_dentry = fs::create_directory(&pmt_dir, &format!("{:#06x}", pid));
        let version_dentry = fs::create_version_dir(&table_dentry, header.version_number as u32);
        header.populate(&version_dentry);
        fs::create_file_number(&version_dentry, "pcr_pid", pcr_pid as u64);
        fs::create_file_number(
            &version_dentry,
            "program_information_length",
            program_info_length as u64,
        );

        /* Program-level descriptor loop */
        let program_info = &payload[12..12 + program_info_length];
        let num_descriptors = descriptors_count(program_info, program_info_length);
        demux.ts_descriptors.parse(
            program_info,
            num_descriptors,
            &version_dentry,
            &DescriptorContext::default(),
        );

        /* Elementary stream loop, bounded by the CRC */
        let section_end = (3 + header.section_length as usize)
            .saturating_sub(4)
            .min(payload.len());
        let mut offset = 12 + program_info_length;
        while offset + 5 <= section_end {
            let stream_type_id = payload[offset];
            let es_pid = ((payload[offset + 1] as u16) << 8 | payload[offset + 2] as u16) & 0x1fff;
            let es_info_length =
                ((payload[offset + 3] as u16) << 8 | payload[offset + 4] as u16) & 0x0fff;
            let es_info_end = offset + 5 + es_info_length as usize;
            if es_info_end > section_end {
                warn!("ES_info_length exceeds the section end");
                break;
            }
            let es_info = &payload[offset + 5..es_info_end];
            let component = find_component_tag(es_info);

            let subdir = populate_stream_dir(
                demux,
                &version_dentry,
                stream_type_id,
                es_pid,
                es_info_length,
                component,
            );

            let ctx = DescriptorContext {
                stream: Some(StreamContext {
                    stream_type: stream_type_id,
                    elementary_pid: es_pid,
                }),
            };
            let num = descriptors_count(es_info, es_info.len());
            demux.ts_descriptors.parse(es_info, num, &subdir, &ctx);

            offset = es_info_end;
        }

        /* The PES dentry cache points into the superseded subtree */
        demux.pes_dentries.clear();
        demux.pes_states.clear();

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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn component_tag_refines_classification() {
        let class = classify_stream(0x1b, Some(0x00));
        assert_eq!(class.streams_name, names::VIDEO_STREAMS);
        assert!(class.is_primary);

        let class = classify_stream(0x1b, Some(0x81));
        assert_eq!(class.streams_name, names::ONE_SEG_VIDEO_STREAMS);
        assert!(class.is_primary);

        let class = classify_stream(0x0f, Some(0x11));
        assert_eq!(class.streams_name, names::AUDIO_STREAMS);
        assert!(!class.is_primary);
        assert!(class.is_secondary);
    }

    #[test]
    fn stream_type_classifies_without_component_tag() {
        assert_eq!(classify_stream(0x0b, None).streams_name, names::DATA_CAROUSEL_STREAMS);
        assert_eq!(classify_stream(0x06, None).streams_name, names::OBJECT_CAROUSEL_STREAMS);
        assert_eq!(classify_stream(0x1b, None).streams_name, names::VIDEO_STREAMS);
        assert_eq!(classify_stream(0x81, None).streams_name, names::AUDIO_STREAMS);
        assert_eq!(classify_stream(0xc0, None).streams_name, names::RESERVED_STREAMS);
    }

    #[test]
    fn first_stream_identifier_descriptor_wins() {
        let es_info = [0x0a, 0x02, 0x00, 0x00, 0x52, 0x01, 0x40, 0x52, 0x01, 0x10];
        assert_eq!(find_component_tag(&es_info), Some(0x40));
        assert_eq!(find_component_tag(&[]), None);
    }
}
