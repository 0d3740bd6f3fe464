//! Packet-level demultiplexer: adaptation-field stripping, PUSI handling,
//! pointer_field walking and dispatch to the PSI or PES path.

use log::warn;

use crate::pes::{self, PesKind};
use crate::section::SectionBuffer;
use crate::tables::{self, TableParser};
use crate::{crc32_check, DemuxError, Demuxer, Result};

pub const TS_SYNC_BYTE: u8 = 0x47;

/* Well-known PIDs */
pub const TS_PAT_PID: u16 = 0x00;
pub const TS_CAT_PID: u16 = 0x01;
pub const TS_NIT_PID: u16 = 0x10;
pub const TS_SDT_PID: u16 = 0x11; /* or BAT */
pub const TS_H_EIT_PID: u16 = 0x12;
pub const TS_RST_PID: u16 = 0x13;
pub const TS_TDT_PID: u16 = 0x14;
pub const TS_DCT_PID: u16 = 0x17;
pub const TS_DIT_PID: u16 = 0x1e;
pub const TS_SIT_PID: u16 = 0x1f;
pub const TS_PCAT_PID: u16 = 0x22;
pub const TS_SDTT1_PID: u16 = 0x23;
pub const TS_BIT_PID: u16 = 0x24;
pub const TS_NBIT_PID: u16 = 0x25; /* or LDT */
pub const TS_M_EIT_PID: u16 = 0x26;
pub const TS_L_EIT_PID: u16 = 0x27;
pub const TS_SDTT2_PID: u16 = 0x28;
pub const TS_CDT_PID: u16 = 0x29;
pub const TS_NULL_PID: u16 = 0x1fff;

/* Known table IDs, according to ABNT NBR 15603-1 */
pub const TS_PAT_TABLE_ID: u8 = 0x00;
pub const TS_PMT_TABLE_ID: u8 = 0x02;
pub const TS_DII_TABLE_ID: u8 = 0x3b;
pub const TS_DDB_TABLE_ID: u8 = 0x3c;
pub const TS_NIT_TABLE_ID: u8 = 0x40;
pub const TS_SDT_TABLE_ID: u8 = 0x42;
pub const TS_EIT_PF_TABLE_ID: u8 = 0x4e;
pub const TS_EIT_LAST_TABLE_ID: u8 = 0x6f;
pub const TS_TOT_TABLE_ID: u8 = 0x73;
pub const TS_AIT_TABLE_ID: u8 = 0x74;
pub const TS_SDTT_TABLE_ID: u8 = 0xc3;

fn is_stuffing(byte: u8) -> bool {
    byte == 0xff
}

/// Well-known PSI PIDs plus any PID registered by a prior table.
fn is_psi_pid(demux: &Demuxer, pid: u16) -> bool {
    match pid {
        TS_PAT_PID | TS_CAT_PID | TS_NIT_PID | TS_SDT_PID | TS_H_EIT_PID | TS_M_EIT_PID
        | TS_L_EIT_PID | TS_RST_PID | TS_TDT_PID | TS_DCT_PID | TS_DIT_PID | TS_SIT_PID
        | TS_PCAT_PID | TS_SDTT1_PID | TS_SDTT2_PID | TS_BIT_PID | TS_NBIT_PID | TS_CDT_PID => {
            true
        }
        _ => demux.psi_parsers.contains_key(&pid),
    }
}

fn section_length_at(payload: &[u8], start: usize) -> usize {
    ((payload[start + 1] as usize) << 8 | payload[start + 2] as usize) & 0x0fff
}

/// Drives one packet through the state machine. The packet must be exactly
/// `packet_size` bytes; errors are local to the packet.
pub(crate) fn process_packet(demux: &mut Demuxer, packet: &[u8]) -> Result<()> {
    if packet.len() != demux.options.packet_size as usize {
        return Err(DemuxError::MalformedPacket("wrong packet size"));
    }

    let header = crate::TsPacketHeader::from_bytes([packet[0], packet[1], packet[2], packet[3]]);
    if header.sync_byte() != TS_SYNC_BYTE {
        warn!(
            "sync_byte != {:#x} ({:#x})",
            TS_SYNC_BYTE,
            header.sync_byte()
        );
        return Err(DemuxError::MalformedPacket("sync_byte mismatch"));
    }

    let pid = header.pid();
    if pid == TS_NULL_PID {
        if header.pusi() {
            warn!("NULL packet has payload_unit_start_indicator != 0");
        }
        return Ok(());
    }

    let mut payload_start = 4usize;
    match header.adaptation_field_control() {
        0x00 => {
            /* ITU-T Rec. H.222.0 decoders shall discard this packet */
            return Ok(());
        }
        0x01 => { /* No adaptation field, payload only */ }
        0x02 => {
            /* Adaptation field only, no payload */
            return Ok(());
        }
        _ => {
            /* Adaptation field followed by payload */
            let adaptation_field_length = packet[4] as usize;
            payload_start += 1 + adaptation_field_length;
            if payload_start > packet.len() {
                warn!(
                    "adaptation_field length is bigger than a TS packet: {}",
                    adaptation_field_length
                );
                return Err(DemuxError::MalformedPacket(
                    "adaptation_field past packet end",
                ));
            }
        }
    }

    let payload_end = packet.len() - demux.options.packet_error_correction_bytes() as usize;
    if payload_start >= payload_end {
        return Ok(());
    }
    let payload = &packet[payload_start..payload_end];

    if is_psi_pid(demux, pid) {
        process_psi_payload(demux, pid, header.pusi(), header.continuity_counter(), payload)
    } else if let Some(kind) = demux.pes_parsers.get(&pid).copied() {
        process_pes_payload(demux, pid, kind, header.pusi(), header.continuity_counter(), payload)
    } else {
        Ok(())
    }
}

/// Walks every section embedded in one packet's payload, appending bytes
/// into the per-PID buffer and invoking the table parser for each section
/// that completes and passes the CRC check.
fn process_psi_payload(
    demux: &mut Demuxer,
    pid: u16,
    pusi: bool,
    cc: u8,
    payload: &[u8],
) -> Result<()> {
    let mut pointer_field = 0usize;
    let mut is_new;
    let mut start;
    let mut end;

    if pusi {
        if payload.len() < 4 {
            return Ok(());
        }
        /* The first byte of the payload carries the pointer_field */
        pointer_field = payload[0] as usize;
        if pointer_field >= payload.len() {
            warn!("pointer_field > TS packet size ({})", pointer_field);
            return Err(DemuxError::MalformedPacket("pointer_field past packet end"));
        }
        start = 1;
        if pointer_field > 0 {
            /* The first pointer_field bytes belong to the previous section */
            is_new = false;
            end = 1 + pointer_field;
        } else {
            is_new = true;
            end = (1 + 3 + section_length_at(payload, 1)).min(payload.len());
        }
    } else {
        is_new = false;
        start = 0;
        end = payload.len();
    }

    /* The counter transition is judged once per packet, not per section */
    let mut check_continuity = true;

    loop {
        let mut use_buffer = true;

        if !demux.packet_buffers.contains_key(&pid) {
            if is_new {
                let size = 3 + section_length_at(payload, start);
                match SectionBuffer::new(pid, size, false) {
                    Some(mut buffer) => {
                        buffer.continuity_counter = cc;
                        demux.packet_buffers.insert(pid, buffer);
                    }
                    None => return Ok(()),
                }
                check_continuity = false;
            } else {
                /* No established buffer for this continuation */
                use_buffer = false;
            }
        } else {
            let buffer = demux.packet_buffers.get_mut(&pid).unwrap();
            if check_continuity && !buffer.continuity_ok(cc, true, demux.options.report) {
                return Ok(());
            }
            check_continuity = false;
            if buffer.is_empty() && !is_new {
                /* Cannot start appending data without PUSI when there are no
                 * contents in the buffer yet. The second half of the packet
                 * can very well hold valid data, though. */
                if !pusi {
                    return Ok(());
                }
                use_buffer = false;
            }
        }

        /* A stuffing byte in a newly pointed section terminates scanning */
        if is_new && payload.get(start).copied().map_or(false, is_stuffing) {
            use_buffer = false;
        }

        if use_buffer {
            let completed = {
                let buffer = match demux.packet_buffers.get_mut(&pid) {
                    Some(buffer) => buffer,
                    None => return Ok(()),
                };
                buffer.append(&payload[start..end.min(payload.len())]);
                if buffer.contains_full_psi_section() {
                    Some(buffer.take())
                } else {
                    None
                }
            };

            if let Some(section) = completed {
                let table_id = section[0];
                if !crc32_check(&section) {
                    if demux.options.report.crc() {
                        warn!(
                            "CRC error on PID {}({:#x}), table_id {}({:#x})",
                            pid, pid, table_id, table_id
                        );
                    }
                } else if let Some(parser) = tables::get_psi_parser(demux, pid, table_id) {
                    if let Err(e) = parser.parse(demux, pid, &section) {
                        warn!("table parser error on pid {:#x}: {}", pid, e);
                    }
                }
            }
        }

        /* Continuation packets carry a single chunk */
        if !pusi {
            break;
        }
        if end >= payload.len() {
            /* The chunk ran to the payload end; a partial section stays
             * buffered for the next packet */
            break;
        }

        /* Walk to the next embedded section, dropping any unfinished tail */
        if let Some(buffer) = demux.packet_buffers.get_mut(&pid) {
            buffer.reset();
        }
        start = end;
        if start + 3 > payload.len() {
            break;
        }
        if is_stuffing(payload[start]) {
            break;
        }
        let section_length = section_length_at(payload, start);
        if section_length == 0 {
            break;
        }
        end = (start + 3 + section_length).min(payload.len());
        is_new = true;
    }

    if let Some(buffer) = demux.packet_buffers.get_mut(&pid) {
        buffer.continuity_counter = cc;
    }
    Ok(())
}

/// PES path: reassemble length-bounded packets in the per-PID buffer,
/// flush unbounded video on every successor PUSI and extract per-packet ES
/// fragments when enabled.
fn process_pes_payload(
    demux: &mut Demuxer,
    pid: u16,
    kind: PesKind,
    pusi: bool,
    cc: u8,
    payload: &[u8],
) -> Result<()> {
    if pusi && payload.len() <= 6 {
        return Ok(());
    }

    if pusi {
        /* The standard permits up to two packets with the same counter; a
         * repeated unit start is a no-op */
        if let Some(buffer) = demux.packet_buffers.get(&pid) {
            if buffer.continuity_counter == cc {
                return Ok(());
            }
        }

        /* Unbounded PES are flushed on every successor PUSI */
        let flushed = match demux.packet_buffers.get_mut(&pid) {
            Some(buffer) => {
                if buffer.is_unbounded() && !buffer.is_empty() {
                    Some(buffer.take())
                } else {
                    None
                }
            }
            None => None,
        };
        if let Some(data) = flushed {
            if kind != PesKind::Other {
                pes::deliver_pes(demux, pid, &data);
            }
        }

        let declared = ((payload[4] as usize) << 8 | payload[5] as usize) as usize;
        if !demux.packet_buffers.contains_key(&pid) {
            match SectionBuffer::new(pid, declared, true) {
                Some(buffer) => {
                    demux.packet_buffers.insert(pid, buffer);
                }
                None => return Ok(()),
            }
        }
        let buffer = demux.packet_buffers.get_mut(&pid).unwrap();
        buffer.reset();
        buffer.append(payload);
        buffer.is_unbounded();
    } else {
        let buffer = match demux.packet_buffers.get_mut(&pid) {
            Some(buffer) => buffer,
            None => return Ok(()),
        };
        if !buffer.continuity_ok(cc, false, demux.options.report) {
            return Ok(());
        }
        if buffer.is_empty() && !buffer.is_unbounded() {
            return Ok(());
        }
        buffer.append(payload);
    }

    /* Length-bounded packets deliver once fully accumulated */
    let completed = match demux.packet_buffers.get_mut(&pid) {
        Some(buffer) => {
            if buffer.contains_full_pes_section() {
                Some(buffer.take())
            } else {
                None
            }
        }
        None => None,
    };
    if let Some(data) = completed {
        if kind != PesKind::Other {
            pes::deliver_pes(demux, pid, &data);
        }
    }

    /* Elementary Stream extraction is per packet */
    if demux.options.parse_pes && kind != PesKind::Other {
        pes::extract_es(demux, pid, pusi, payload);
    }

    if let Some(buffer) = demux.packet_buffers.get_mut(&pid) {
        buffer.continuity_counter = cc;
    }
    Ok(())
}
