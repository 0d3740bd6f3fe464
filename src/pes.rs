use std::sync::Arc;

use log::warn;
use modular_bitfield_msb::prelude::*;
use num_derive::FromPrimitive;
use num_traits::FromPrimitive;

use crate::fs::{self, names, Dentry};
use crate::{read_bitfield, Demuxer, Result, SliceReader};

/// First six bytes of every PES packet.
#[bitfield]
#[derive(Debug)]
pub struct PesHeader {
    pub start_code: B24,
    pub stream_id: B8,
    pub packet_length: B16,
}

/// Optional header present on audio/video stream ids: the two flag bytes
/// plus the additional header length.
#[bitfield]
#[derive(Debug)]
pub struct PesOptionalHeader {
    pub marker_bits: B2,
    pub scrambling_control: B2,
    pub priority: bool,
    pub data_alignment_indicator: bool,
    pub copyright: bool,
    pub original: bool,
    pub has_pts: bool,
    pub has_dts: bool,
    pub escr: bool,
    pub es_rate: bool,
    pub dsm_trick_mode: bool,
    pub has_additional_copy_info: bool,
    pub has_crc: bool,
    pub has_extension: bool,
    pub additional_header_length: B8,
}

/// Stream classes addressed by the PES stream_id byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PesStream {
    ProgramStreamMap,
    PrivateStream1,
    PaddingStream,
    PrivateStream2,
    Audio,
    Video,
    Ecm,
    Emm,
    Dsmcc,
    Iso13522,
    H222TypeA,
    H222TypeB,
    H222TypeC,
    H222TypeD,
    H222TypeE,
    Ancillary,
    SlPacketized,
    Flexmux,
    ReservedData,
    ProgramStreamDirectory,
    Unknown,
}

/// Maps a PES stream_id to its stream class.
pub fn identify_stream_id(stream_id: u8) -> PesStream {
    match stream_id {
        0xbc => PesStream::ProgramStreamMap,
        0xbd => PesStream::PrivateStream1,
        0xbe => PesStream::PaddingStream,
        0xbf => PesStream::PrivateStream2,
        0xc0..=0xdf => PesStream::Audio,
        0xe0..=0xef => PesStream::Video,
        0xf0 => PesStream::Ecm,
        0xf1 => PesStream::Emm,
        0xf2 => PesStream::Dsmcc,
        0xf3 => PesStream::Iso13522,
        0xf4 => PesStream::H222TypeA,
        0xf5 => PesStream::H222TypeB,
        0xf6 => PesStream::H222TypeC,
        0xf7 => PesStream::H222TypeD,
        0xf8 => PesStream::H222TypeE,
        0xf9 => PesStream::Ancillary,
        0xfa => PesStream::SlPacketized,
        0xfb => PesStream::Flexmux,
        0xfc..=0xfe => PesStream::ReservedData,
        0xff => PesStream::ProgramStreamDirectory,
        _ => PesStream::Unknown,
    }
}

/// Parser flavour registered per elementary PID by the PMT.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PesKind {
    Audio,
    Video,
    Other,
}

/// trick_mode_control values inside the DSM trick mode field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromPrimitive)]
pub enum TrickModeControl {
    FastForward = 0,
    SlowMotion = 1,
    FreezeFrame = 2,
    FastReverse = 3,
    SlowReverse = 4,
}

/// Elementary-stream extraction state kept per PID.
#[derive(Debug, Default)]
pub struct PesStreamState {
    pub packet_length: u16,
    pub parsed_length: u32,
    pub initialized: bool,
    pub stream: Option<PesStream>,
}

fn is_nal_idc_reference(buf: &[u8]) -> bool {
    buf.len() >= 4 && buf[0] == 0 && buf[1] == 0 && buf[2] == 1 && (buf[3] & 0x60) != 0
}

fn is_aac_latm_syncword(buf: &[u8]) -> bool {
    buf.len() >= 2 && buf[0] == 0x56 && (buf[1] & 0xe0) == 0xe0
}

/// Skips the PES header and optional fields, returning the offset of the
/// first Elementary Stream byte.
pub fn es_payload_offset(payload: &[u8]) -> Result<usize> {
    let mut reader = SliceReader::new(payload);
    let header = read_bitfield!(reader, PesHeader);
    let optional = read_bitfield!(reader, PesOptionalHeader);
    let mut n = 9usize;

    if header.start_code() != 0x000001 {
        warn!("PES start code prefix != 0x000001");
    }

    if optional.has_pts() {
        reader.skip(5)?;
        n += 5;
    }
    if optional.has_dts() {
        reader.skip(5)?;
        n += 5;
    }
    if optional.escr() {
        reader.skip(6)?;
        n += 6;
    }
    if optional.es_rate() {
        reader.skip(3)?;
        n += 3;
    }
    if optional.dsm_trick_mode() {
        let trick = reader.read_u8()?;
        let _control: Option<TrickModeControl> = TrickModeControl::from_u8((trick & 0x0e) >> 1);
        n += 1;
    }
    if optional.has_additional_copy_info() {
        reader.skip(1)?;
        n += 1;
    }
    if optional.has_crc() {
        reader.skip(2)?;
        n += 2;
    }
    if optional.has_extension() {
        let flags = reader.read_u8()?;
        n += 1;
        if flags & 0x80 != 0 {
            /* PES_private_data */
            reader.skip(16)?;
            n += 16;
        }
        if flags & 0x40 != 0 {
            let pack_field_length = reader.read_u8()? as usize;
            reader.skip(pack_field_length)?;
            n += 1 + pack_field_length;
        }
        if flags & 0x20 != 0 {
            /* program_packet_sequence_counter */
            reader.skip(2)?;
            n += 2;
        }
        if flags & 0x10 != 0 {
            /* P-STD buffer */
            reader.skip(2)?;
            n += 2;
        }
        if flags & 0x03 != 0 {
            let ext2_length = (reader.read_u8()? & 0x7f) as usize;
            reader.skip(ext2_length)?;
            n += 1 + ext2_length;
        }
    }

    /* Stuffing bytes */
    while n < payload.len() && payload[n] == 0xff {
        n += 1;
    }

    if n > payload.len() {
        return Err(crate::DemuxError::ShortPayload {
            context: "PES optional fields",
            expected: n,
            found: payload.len(),
        });
    }
    Ok(n)
}

/// Resolves (and caches) the `pes` or `es` FIFO dentry of a stream through
/// the flat `/Streams/<pid>` index.
fn get_fifo_dentry(demux: &mut Demuxer, pid: u16, fifo_name: &str) -> Option<Arc<Dentry>> {
    let key = (pid as u64) << 1 | if fifo_name == names::ES_FIFO { 0 } else { 1 };
    if let Some(dentry) = demux.pes_dentries.get(&key) {
        return Some(dentry.clone());
    }
    let index = fs::lookup_path(&demux.root, &format!("/{}/{:#06x}", names::STREAMS, pid))?;
    let target = index.readlink().ok()?;
    let dentry = fs::lookup_path(&demux.root, &format!("{}/{}", target, fifo_name))?;
    demux.pes_dentries.insert(key, dentry.clone());
    Some(dentry)
}

/// Appends one fragment to a FIFO, gating video on a NAL IDC reference
/// boundary and audio on the AAC-LATM syncword so the consumer always
/// starts on a decodable boundary. Fragments without a boundary are
/// dropped.
fn append_to_fifo(dentry: &Arc<Dentry>, payload: &[u8], stream: Option<PesStream>) -> usize {
    let fifo = match dentry.fifo() {
        Some(fifo) => fifo,
        None => return 0,
    };
    if payload.is_empty() || !fifo.is_open() {
        return 0;
    }
    let fragment = match stream {
        Some(PesStream::Video) => {
            let mut i = 0;
            while i < payload.len() && !is_nal_idc_reference(&payload[i..]) {
                i += 1;
            }
            &payload[i..]
        }
        Some(PesStream::Audio) => {
            let mut i = 0;
            while i < payload.len() && !is_aac_latm_syncword(&payload[i..]) {
                i += 1;
            }
            &payload[i..]
        }
        _ => payload,
    };
    fifo.append(fragment)
}

/// Delivers one reassembled PES packet verbatim to the stream's `pes` FIFO.
pub(crate) fn deliver_pes(demux: &mut Demuxer, pid: u16, data: &[u8]) {
    if let Some(dentry) = get_fifo_dentry(demux, pid, names::PES_FIFO) {
        append_to_fifo(&dentry, data, None);
    }
}

/// Per-packet Elementary Stream extraction into the `es` FIFO.
///
/// On a payload unit start the PES header and optional fields are stripped
/// and the remainder is the first ES fragment; on continuation packets the
/// entire payload is a fragment. A decode error drops the packet but keeps
/// the per-PID state; the next unit start fully resynchronises the stream.
pub(crate) fn extract_es(demux: &mut Demuxer, pid: u16, pusi: bool, payload: &[u8]) {
    let dentry = match get_fifo_dentry(demux, pid, names::ES_FIFO) {
        Some(dentry) => dentry,
        None => {
            warn!("failed to get ES dentry for pid {:#x}", pid);
            return;
        }
    };

    let state = demux.pes_states.entry(pid).or_default();
    if pusi {
        if payload.len() < 6 {
            warn!(
                "cannot parse PES header: payload holds less than 6 bytes ({})",
                payload.len()
            );
            return;
        }
        let stream = identify_stream_id(payload[3]);
        state.packet_length = (payload[4] as u16) << 8 | payload[5] as u16;
        state.parsed_length = 0;
        state.initialized = true;
        state.stream = Some(stream);

        let fragment = match stream {
            PesStream::PaddingStream => None,
            PesStream::ProgramStreamMap
            | PesStream::PrivateStream2
            | PesStream::Ecm
            | PesStream::Emm
            | PesStream::ProgramStreamDirectory
            | PesStream::Dsmcc
            | PesStream::H222TypeE => Some(&payload[6..]),
            _ => match es_payload_offset(payload) {
                Ok(offset) => Some(&payload[offset..]),
                Err(e) => {
                    warn!("failed to parse PES audio/video payload: {}", e);
                    return;
                }
            },
        };
        if let Some(fragment) = fragment {
            state.parsed_length += fragment.len() as u32;
            let stream = state.stream;
            append_to_fifo(&dentry, fragment, stream);
        }
    } else if state.initialized {
        state.parsed_length += payload.len() as u32;
        let stream = state.stream;
        append_to_fifo(&dentry, payload, stream);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stream_id_classes() {
        assert_eq!(identify_stream_id(0xe3), PesStream::Video);
        assert_eq!(identify_stream_id(0xc0), PesStream::Audio);
        assert_eq!(identify_stream_id(0xbe), PesStream::PaddingStream);
        assert_eq!(identify_stream_id(0xff), PesStream::ProgramStreamDirectory);
    }

    #[test]
    fn es_offset_skips_pts_dts_and_stuffing() {
        // start code, video stream id, length 0, flags: pts+dts set.
        let mut payload = vec![0x00, 0x00, 0x01, 0xe0, 0x00, 0x00, 0x80, 0xc0, 0x0a];
        payload.extend_from_slice(&[0u8; 10]); // pts + dts
        payload.extend_from_slice(&[0xff, 0xff]); // stuffing
        payload.extend_from_slice(&[0x00, 0x00, 0x01, 0x65]); // ES bytes
        let offset = es_payload_offset(&payload).unwrap();
        assert_eq!(&payload[offset..offset + 4], &[0x00, 0x00, 0x01, 0x65]);
    }

    #[test]
    fn es_offset_with_no_optional_fields() {
        let payload = [0x00, 0x00, 0x01, 0xe0, 0x00, 0x00, 0x80, 0x00, 0x00, 0xab];
        assert_eq!(es_payload_offset(&payload).unwrap(), 9);
    }

    #[test]
    fn nal_gate_detects_reference_boundary() {
        assert!(is_nal_idc_reference(&[0, 0, 1, 0x65]));
        assert!(!is_nal_idc_reference(&[0, 0, 1, 0x01]));
        assert!(is_aac_latm_syncword(&[0x56, 0xe0]));
        assert!(!is_aac_latm_syncword(&[0x56, 0x1f]));
    }
}
