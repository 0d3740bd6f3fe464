//! End-to-end scenarios driven through `Demuxer::process_packet` with
//! literal packet bytes.

use demuxfs::fs::{self, DentryKind};
use demuxfs::{mpeg_crc32, Demuxer, ReportMask, UserOptions};
use pretty_assertions::assert_eq;

fn init() {
    let _ = pretty_env_logger::try_init();
}

/// Builds one 188-byte packet with payload-only adaptation control. The
/// remainder of the payload is stuffed with 0xFF.
fn ts_packet(pid: u16, pusi: bool, cc: u8, payload: &[u8]) -> Vec<u8> {
    assert!(payload.len() <= 184);
    let mut packet = vec![0xffu8; 188];
    packet[0] = 0x47;
    packet[1] = ((pusi as u8) << 6) | ((pid >> 8) as u8 & 0x1f);
    packet[2] = (pid & 0xff) as u8;
    packet[3] = 0x10 | (cc & 0x0f);
    packet[4..4 + payload.len()].copy_from_slice(payload);
    packet
}

/// Appends the MPEG-2 CRC, sealing a section body.
fn seal(mut section: Vec<u8>) -> Vec<u8> {
    let crc = mpeg_crc32(&section);
    section.extend_from_slice(&crc.to_be_bytes());
    section
}

fn psi_header(table_id: u8, body_len: usize, identifier: u16, version: u8) -> Vec<u8> {
    // section_length covers everything after itself, including the CRC.
    let section_length = 5 + body_len + 4;
    vec![
        table_id,
        0xb0 | ((section_length >> 8) as u8 & 0x0f),
        section_length as u8,
        (identifier >> 8) as u8,
        identifier as u8,
        0xc0 | (version << 1) | 0x01,
        0x00,
        0x00,
    ]
}

fn pat_section(version: u8, programs: &[(u16, u16)]) -> Vec<u8> {
    let mut section = psi_header(0x00, programs.len() * 4, 0x0001, version);
    for &(program_number, pid) in programs {
        section.push((program_number >> 8) as u8);
        section.push(program_number as u8);
        section.push(0xe0 | (pid >> 8) as u8);
        section.push(pid as u8);
    }
    seal(section)
}

fn pmt_section(version: u8, streams: &[(u8, u16)]) -> Vec<u8> {
    let mut body = vec![0xe1, 0xff, 0xf0, 0x00]; /* pcr_pid, program_info_length 0 */
    for &(stream_type, es_pid) in streams {
        body.push(stream_type);
        body.push(0xe0 | (es_pid >> 8) as u8);
        body.push(es_pid as u8);
        body.push(0xf0);
        body.push(0x00); /* ES_info_length 0 */
    }
    let mut section = psi_header(0x02, body.len(), 0x0001, version);
    section.extend_from_slice(&body);
    seal(section)
}

/// PSI payload: pointer_field zero followed by the section.
fn psi_payload(section: &[u8]) -> Vec<u8> {
    let mut payload = vec![0x00];
    payload.extend_from_slice(section);
    payload
}

/// Feeds one section, splitting it over as many packets as it needs.
fn feed_section(demux: &mut Demuxer, pid: u16, first_cc: u8, section: &[u8]) {
    let mut chunks = section.chunks(183);
    let mut cc = first_cc;
    let first = chunks.next().unwrap();
    demux
        .process_packet(&ts_packet(pid, true, cc, &psi_payload(first)))
        .unwrap();
    for chunk in chunks {
        cc = (cc + 1) % 16;
        demux
            .process_packet(&ts_packet(pid, false, cc, chunk))
            .unwrap();
    }
}

#[test]
fn pat_then_pmt_materialise_program_links() {
    init();
    let mut demux = Demuxer::new(UserOptions::default());
    let root = demux.root();

    let pat = pat_section(1, &[(0x0001, 0x0100)]);
    demux
        .process_packet(&ts_packet(0x0000, true, 0, &psi_payload(&pat)))
        .unwrap();

    let link = fs::lookup_path(&root, "/PAT/Current/Programs/0x0001").unwrap();
    assert_eq!(link.kind(), DentryKind::Symlink);
    assert_eq!(link.readlink().unwrap(), "../../PMT/0x0100");

    /* /PMT/0x0100 appears once the announced PMT PID carries a section */
    assert!(fs::lookup_path(&root, "/PMT/0x0100").is_none());
    let pmt = pmt_section(0, &[(0x1b, 0x0200)]);
    demux
        .process_packet(&ts_packet(0x0100, true, 0, &psi_payload(&pmt)))
        .unwrap();

    assert!(fs::lookup_path(&root, "/PMT/0x0100").is_some());
    let stream = fs::lookup_path(&root, "/PMT/0x0100/Current/VideoStreams/0x0200").unwrap();
    assert!(fs::get_child(&stream, "pes").is_some());
    let index = fs::lookup_path(&root, "/Streams/0x0200").unwrap();
    assert_eq!(index.kind(), DentryKind::Symlink);
}

#[test]
fn version_upgrade_repoints_current_and_disposes_the_old_subtree() {
    init();
    let mut demux = Demuxer::new(UserOptions::default());
    let root = demux.root();

    let pat_v1 = pat_section(1, &[(0x0001, 0x0100)]);
    demux
        .process_packet(&ts_packet(0x0000, true, 0, &psi_payload(&pat_v1)))
        .unwrap();
    let pat_v2 = pat_section(2, &[(0x0002, 0x0200)]);
    demux
        .process_packet(&ts_packet(0x0000, true, 1, &psi_payload(&pat_v2)))
        .unwrap();

    assert!(fs::lookup_path(&root, "/PAT/0x0001").is_some());
    assert!(fs::lookup_path(&root, "/PAT/0x0002").is_some());
    let current = fs::lookup_path(&root, "/PAT/Current").unwrap();
    assert_eq!(current.readlink().unwrap(), "0x0002");
    assert!(fs::lookup_path(&root, "/PAT/0x0001/Programs").is_none());
    assert!(fs::lookup_path(&root, "/PAT/0x0002/Programs/0x0002").is_some());
}

#[test]
fn reobserving_the_same_version_is_a_no_op() {
    init();
    let mut demux = Demuxer::new(UserOptions::default());
    let root = demux.root();

    let pat = pat_section(1, &[(0x0001, 0x0100)]);
    demux
        .process_packet(&ts_packet(0x0000, true, 0, &psi_payload(&pat)))
        .unwrap();
    let programs_before = fs::lookup_path(&root, "/PAT/0x0001/Programs")
        .unwrap()
        .children()
        .len();

    demux
        .process_packet(&ts_packet(0x0000, true, 1, &psi_payload(&pat)))
        .unwrap();
    let programs_after = fs::lookup_path(&root, "/PAT/0x0001/Programs")
        .unwrap()
        .children()
        .len();
    assert_eq!(programs_before, programs_after);
}

#[test]
fn duplicate_packet_is_tolerated_without_duplicate_nodes() {
    init();
    let mut demux = Demuxer::new(UserOptions::default());
    let root = demux.root();

    let pat = pat_section(1, &[(0x0001, 0x0100)]);
    let packet = ts_packet(0x0000, true, 0, &psi_payload(&pat));
    demux.process_packet(&packet).unwrap();
    demux.process_packet(&packet).unwrap();

    let programs = fs::lookup_path(&root, "/PAT/0x0001/Programs").unwrap();
    assert_eq!(programs.children().len(), 1);
}

#[test]
fn continuity_gap_drops_the_spanning_section() {
    init();
    let mut options = UserOptions::default();
    options.report = ReportMask::ALL;
    let mut demux = Demuxer::new(options);
    let root = demux.root();

    /* Register the PMT parser on PID 0x0100 */
    let pat = pat_section(1, &[(0x0001, 0x0100)]);
    demux
        .process_packet(&ts_packet(0x0000, true, 0, &psi_payload(&pat)))
        .unwrap();

    /* A PMT section spanning two packets, with a counter gap between them */
    let streams: Vec<(u8, u16)> = (0..48).map(|i| (0x1b, 0x0200 + i as u16)).collect();
    let pmt = pmt_section(0, &streams);
    assert!(pmt.len() > 183);
    demux
        .process_packet(&ts_packet(0x0100, true, 5, &psi_payload(&pmt[..183])))
        .unwrap();
    demux
        .process_packet(&ts_packet(0x0100, false, 7, &pmt[183..]))
        .unwrap();

    assert!(fs::lookup_path(&root, "/PMT").is_none());
}

#[test]
fn section_straddling_the_crc_boundary_is_reassembled() {
    init();
    let mut demux = Demuxer::new(UserOptions::default());
    let root = demux.root();

    let pat = pat_section(1, &[(0x0001, 0x0100)]);
    demux
        .process_packet(&ts_packet(0x0000, true, 0, &psi_payload(&pat)))
        .unwrap();

    /* Split a long PMT precisely between section_length and its CRC32 */
    let streams: Vec<(u8, u16)> = (0..30).map(|i| (0x1b, 0x0200 + i as u16)).collect();
    let pmt = pmt_section(0, &streams);
    let split = pmt.len() - 4;
    assert!(split <= 183);
    demux
        .process_packet(&ts_packet(0x0100, true, 5, &psi_payload(&pmt[..split])))
        .unwrap();
    assert!(fs::lookup_path(&root, "/PMT/0x0100").is_none());
    demux
        .process_packet(&ts_packet(0x0100, false, 6, &pmt[split..]))
        .unwrap();
    assert!(fs::lookup_path(&root, "/PMT/0x0100/Current").is_some());
}

#[test]
fn tail_and_new_section_in_one_packet_produce_both_invocations() {
    init();
    let mut demux = Demuxer::new(UserOptions::default());
    let root = demux.root();

    /* First packet carries everything except the PAT's last 4 bytes */
    let pat_v1 = pat_section(1, &[(0x0001, 0x0100)]);
    let tail_len = 4;
    let head = &pat_v1[..pat_v1.len() - tail_len];
    demux
        .process_packet(&ts_packet(0x0000, true, 0, &psi_payload(head)))
        .unwrap();
    assert!(fs::lookup_path(&root, "/PAT").is_none());

    /* Second packet: pointer_field covers the tail, then a whole new PAT */
    let pat_v2 = pat_section(2, &[(0x0002, 0x0200)]);
    let mut payload = vec![tail_len as u8];
    payload.extend_from_slice(&pat_v1[pat_v1.len() - tail_len..]);
    payload.extend_from_slice(&pat_v2);
    demux
        .process_packet(&ts_packet(0x0000, true, 1, &payload))
        .unwrap();

    /* Both versions parsed from the single packet */
    assert!(fs::lookup_path(&root, "/PAT/0x0001").is_some());
    assert!(fs::lookup_path(&root, "/PAT/0x0002").is_some());
    let current = fs::lookup_path(&root, "/PAT/Current").unwrap();
    assert_eq!(current.readlink().unwrap(), "0x0002");
}

#[test]
fn crc_mismatch_leaves_the_tree_untouched() {
    init();
    let mut options = UserOptions::default();
    options.report = ReportMask::CRC;
    let mut demux = Demuxer::new(options);
    let root = demux.root();

    let mut pat = pat_section(1, &[(0x0001, 0x0100)]);
    let last = pat.len() - 1;
    pat[last] ^= 0xff;
    demux
        .process_packet(&ts_packet(0x0000, true, 0, &psi_payload(&pat)))
        .unwrap();
    assert!(fs::lookup_path(&root, "/PAT").is_none());
}

#[test]
fn unbounded_video_pes_flushes_on_the_next_unit_start() {
    init();
    let mut options = UserOptions::default();
    options.parse_pes = true;
    let mut demux = Demuxer::new(options);
    let root = demux.root();

    /* Announce a video stream on PID 0x0200 */
    let pat = pat_section(1, &[(0x0001, 0x0100)]);
    demux
        .process_packet(&ts_packet(0x0000, true, 0, &psi_payload(&pat)))
        .unwrap();
    let pmt = pmt_section(0, &[(0x1b, 0x0200)]);
    demux
        .process_packet(&ts_packet(0x0100, true, 0, &psi_payload(&pmt)))
        .unwrap();

    let stream_dir = fs::lookup_path(&root, "/PMT/0x0100/Current/VideoStreams/0x0200").unwrap();
    let es_fifo = fs::get_child(&stream_dir, "es").unwrap().fifo().unwrap();
    let pes_fifo = fs::get_child(&stream_dir, "pes").unwrap().fifo().unwrap();
    es_fifo.attach_reader();
    pes_fifo.attach_reader();

    /* Unbounded video PES: length 0, no optional fields, ES opens on a NAL
     * reference boundary */
    let mut first = vec![0x00, 0x00, 0x01, 0xe0, 0x00, 0x00, 0x80, 0x00, 0x00];
    first.extend_from_slice(&[0x00, 0x00, 0x01, 0x65]);
    first.resize(184, 0xaa);
    demux.process_packet(&ts_packet(0x0200, true, 0, &first)).unwrap();

    /* Continuation fragments without a reference boundary are skipped */
    let continuation = vec![0xbb; 184];
    demux
        .process_packet(&ts_packet(0x0200, false, 1, &continuation))
        .unwrap();
    demux
        .process_packet(&ts_packet(0x0200, false, 2, &continuation))
        .unwrap();

    /* A new unit start flushes the previous unbounded PES */
    assert_eq!(pes_fifo.write_count(), 0);
    demux.process_packet(&ts_packet(0x0200, true, 3, &first)).unwrap();
    assert_eq!(pes_fifo.write_count(), 1);
    assert_eq!(pes_fifo.len(), 184 * 3);

    /* One ES write per unit start, PES overhead stripped from the first
     * fragment only */
    assert_eq!(es_fifo.write_count(), 2);
    assert_eq!(es_fifo.len(), (184 - 9) * 2);
}

mod carousel {
    use super::*;
    use pretty_assertions::assert_eq;

    const CAROUSEL_PID: u16 = 0x0300;

    fn dsmcc_section(table_id: u8, version: u8, message: &[u8]) -> Vec<u8> {
        let mut section = psi_header(table_id, message.len(), 0x0001, version);
        section.extend_from_slice(message);
        seal(section)
    }

    /// dsmccMessageHeader / dsmccDownloadDataHeader.
    fn dsmcc_header(message_id: u16, transaction_id: u32, message_length: u16) -> Vec<u8> {
        let mut header = vec![0x11, 0x03];
        header.extend_from_slice(&message_id.to_be_bytes());
        header.extend_from_slice(&transaction_id.to_be_bytes());
        header.push(0xff); /* reserved */
        header.push(0x00); /* adaptation_length */
        header.extend_from_slice(&message_length.to_be_bytes());
        header
    }

    fn dii_message(download_id: u32, block_size: u16, modules: &[(u16, u32)]) -> Vec<u8> {
        let mut body = Vec::new();
        body.extend_from_slice(&download_id.to_be_bytes());
        body.extend_from_slice(&block_size.to_be_bytes());
        body.push(0); /* window_size */
        body.push(0); /* ack_period */
        body.extend_from_slice(&0u32.to_be_bytes()); /* t_c_download_window */
        body.extend_from_slice(&0u32.to_be_bytes()); /* t_c_download_scenario */
        body.extend_from_slice(&0u16.to_be_bytes()); /* compatibility descriptor */
        body.extend_from_slice(&(modules.len() as u16).to_be_bytes());
        for &(module_id, module_size) in modules {
            body.extend_from_slice(&module_id.to_be_bytes());
            body.extend_from_slice(&module_size.to_be_bytes());
            body.push(0); /* module_version */
            body.push(0); /* module_info_length */
        }
        body.extend_from_slice(&0u16.to_be_bytes()); /* private_data_length */

        let mut message = dsmcc_header(0x1002, 0x8000_0001, body.len() as u16);
        message.extend_from_slice(&body);
        message
    }

    fn ddb_message(download_id: u32, module_id: u16, block_number: u16, data: &[u8]) -> Vec<u8> {
        let mut body = Vec::new();
        body.extend_from_slice(&module_id.to_be_bytes());
        body.push(0); /* module_version */
        body.push(0xff); /* reserved */
        body.extend_from_slice(&block_number.to_be_bytes());
        body.extend_from_slice(data);

        let mut message = dsmcc_header(0x1003, download_id, body.len() as u16);
        message.extend_from_slice(&body);
        message
    }

    /* Minimal BIOP serialisers, mirroring the carousel wire format */

    fn biop_ior(object_key: u32) -> Vec<u8> {
        let mut body = Vec::new();
        body.extend_from_slice(&0x4953_4f50u32.to_be_bytes()); /* object location */
        body.push(13);
        body.extend_from_slice(&1u32.to_be_bytes());
        body.extend_from_slice(&1u16.to_be_bytes());
        body.push(1);
        body.push(0);
        body.push(4);
        body.extend_from_slice(&object_key.to_be_bytes());
        body.extend_from_slice(&0x4953_4f40u32.to_be_bytes()); /* connbinder */
        body.push(18);
        body.push(1);
        body.extend_from_slice(&0u16.to_be_bytes());
        body.extend_from_slice(&0x0016u16.to_be_bytes());
        body.extend_from_slice(&0x000bu16.to_be_bytes());
        body.push(0x0a);
        body.extend_from_slice(&1u16.to_be_bytes());
        body.extend_from_slice(&0x8000_0001u32.to_be_bytes());
        body.extend_from_slice(&0u32.to_be_bytes());

        let mut profile = Vec::new();
        profile.extend_from_slice(&0x4953_4f06u32.to_be_bytes());
        profile.extend_from_slice(&((body.len() + 2) as u32).to_be_bytes());
        profile.push(0);
        profile.push(2);
        profile.extend_from_slice(&body);

        let mut ior = Vec::new();
        ior.extend_from_slice(&4u32.to_be_bytes());
        ior.extend_from_slice(b"dir\0");
        ior.extend_from_slice(&1u32.to_be_bytes());
        ior.extend_from_slice(&profile);
        ior
    }

    fn biop_sub_header(object_key: u32, kind: u32, object_info: &[u8]) -> Vec<u8> {
        let mut out = Vec::new();
        out.push(4);
        out.extend_from_slice(&object_key.to_be_bytes());
        out.extend_from_slice(&4u32.to_be_bytes());
        out.extend_from_slice(&kind.to_be_bytes());
        out.extend_from_slice(&(object_info.len() as u16).to_be_bytes());
        out.extend_from_slice(object_info);
        out.push(0);
        out
    }

    fn biop_binding(name: &str, kind: u32, child_key: u32, content_size: Option<u64>) -> Vec<u8> {
        let mut out = Vec::new();
        out.push(1);
        out.push(name.len() as u8 + 1);
        out.extend_from_slice(name.as_bytes());
        out.push(0);
        out.push(4);
        out.extend_from_slice(&kind.to_be_bytes());
        out.push(1);
        out.extend_from_slice(&biop_ior(child_key));
        match content_size {
            Some(size) => {
                out.extend_from_slice(&8u16.to_be_bytes());
                out.extend_from_slice(&size.to_be_bytes());
            }
            None => out.extend_from_slice(&0u16.to_be_bytes()),
        }
        out
    }

    fn biop_message(body: Vec<u8>) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(&0x4249_4f50u32.to_be_bytes());
        out.extend_from_slice(&[1, 0, 0, 0]);
        out.extend_from_slice(&(body.len() as u32).to_be_bytes());
        out.extend_from_slice(&body);
        out
    }

    fn biop_directory(object_key: u32, kind: u32, bindings: &[Vec<u8>]) -> Vec<u8> {
        let mut body = biop_sub_header(object_key, kind, &[]);
        let mut binding_bytes = Vec::new();
        for binding in bindings {
            binding_bytes.extend_from_slice(binding);
        }
        body.extend_from_slice(&((binding_bytes.len() + 2) as u32).to_be_bytes());
        body.extend_from_slice(&(bindings.len() as u16).to_be_bytes());
        body.extend_from_slice(&binding_bytes);
        biop_message(body)
    }

    fn biop_file(object_key: u32, contents: &[u8]) -> Vec<u8> {
        let mut object_info = Vec::new();
        object_info.extend_from_slice(&(contents.len() as u64).to_be_bytes());
        let mut body = biop_sub_header(object_key, 0x6669_6c00, &object_info);
        body.extend_from_slice(&((contents.len() + 4) as u32).to_be_bytes());
        body.extend_from_slice(&(contents.len() as u32).to_be_bytes());
        body.extend_from_slice(contents);
        biop_message(body)
    }

    fn register_carousel_pid(demux: &mut Demuxer) {
        let pat = pat_section(1, &[(0x0001, 0x0100)]);
        demux
            .process_packet(&ts_packet(0x0000, true, 0, &psi_payload(&pat)))
            .unwrap();
        /* stream_type 0x0b: DSM-CC U-N carriage */
        let pmt = pmt_section(0, &[(0x0b, CAROUSEL_PID)]);
        demux
            .process_packet(&ts_packet(0x0100, true, 0, &psi_payload(&pmt)))
            .unwrap();
    }

    #[test]
    fn dii_and_ddb_materialise_blocks_and_carousel_files() {
        init();
        let mut demux = Demuxer::new(UserOptions::default());
        let root = demux.root();
        register_carousel_pid(&mut demux);

        /* The carousel module: gateway with one file binding plus the file */
        let mut module = Vec::new();
        module.extend_from_slice(&biop_directory(
            0x01,
            0x7372_6700, /* srg */
            &[biop_binding("boot.txt", 0x6669_6c00, 0x20, Some(5))],
        ));
        module.extend_from_slice(&biop_file(0x20, b"hello"));

        let dii = dii_message(7, module.len() as u16, &[(1, module.len() as u32)]);
        feed_section(&mut demux, CAROUSEL_PID, 0, &dsmcc_section(0x3b, 1, &dii));
        assert!(fs::lookup_path(&root, "/DII/0x0300/Current").is_some());

        /* The DDB section is longer than one packet and must be spanned */
        let ddb = ddb_message(7, 1, 0, &module);
        feed_section(&mut demux, CAROUSEL_PID, 1, &dsmcc_section(0x3c, 1, &ddb));

        /* The raw block file */
        let block = fs::lookup_path(&root, "/DDB/0x0300/Current/module_01/block_00.bin").unwrap();
        assert_eq!(block.contents(), module);

        /* The decoded carousel appears next to the block files */
        let file = fs::lookup_path(&root, "/DDB/0x0300/Current/boot.txt").unwrap();
        assert_eq!(file.contents(), b"hello");
    }

    #[test]
    fn duplicate_blocks_are_suppressed() {
        init();
        let mut demux = Demuxer::new(UserOptions::default());
        let root = demux.root();
        register_carousel_pid(&mut demux);

        /* A DII announcing one never-completing module keeps the carousel
         * collecting */
        let dii = dii_message(7, 64, &[(1, 1024)]);
        demux
            .process_packet(&ts_packet(
                CAROUSEL_PID,
                true,
                0,
                &psi_payload(&dsmcc_section(0x3b, 1, &dii)),
            ))
            .unwrap();

        let ddb = ddb_message(7, 1, 0, &[0xabu8; 64]);
        let section = dsmcc_section(0x3c, 1, &ddb);
        demux
            .process_packet(&ts_packet(CAROUSEL_PID, true, 1, &psi_payload(&section)))
            .unwrap();
        demux
            .process_packet(&ts_packet(CAROUSEL_PID, true, 2, &psi_payload(&section)))
            .unwrap();

        let module_dir = fs::lookup_path(&root, "/DDB/0x0300/Current/module_01").unwrap();
        assert_eq!(module_dir.children().len(), 1);
    }
}
