//! Classification of PMT stream_type values.

pub fn is_video(stream_type: u8) -> bool {
    stream_type == 0x01 || stream_type == 0x02 || stream_type == 0x1b
}

pub fn is_audio(stream_type: u8) -> bool {
    matches!(stream_type, 0x03 | 0x04 | 0x0f | 0x11 | 0x81)
}

pub fn is_data_carousel(stream_type: u8) -> bool {
    if stream_type == 0x05 {
        // ATSC uses 0x05 to transport Data Carousel
        return true;
    }
    stream_type == 0x0b || stream_type == 0x0d
}

pub fn is_event_message(stream_type: u8) -> bool {
    stream_type == 0x0c || stream_type == 0x0d
}

pub fn is_mpe(stream_type: u8) -> bool {
    stream_type == 0x0a
}

pub fn is_object_carousel(stream_type: u8) -> bool {
    matches!(stream_type, 0x06 | 0x0a | 0x0c | 0x0d | 0x7e)
}

pub fn to_string(stream_type: u8) -> &'static str {
    match stream_type {
        0x00 => "ITU-T | ISO/IEC reserved",
        0x01 => "ISO/IEC 11172-2 Video - H.261 - MPEG-1 Video",
        0x02 => "ITU-T H.262 | ISO/IEC 13818-2 Video - MPEG-2 Video | 11172-2 constrained parameter video stream",
        0x03 => "ISO/IEC 11172 Audio - MPEG-1 Audio Layer 2 (MP2)",
        0x04 => "ISO/IEC 13818-3 Audio - MPEG-2 Audio Layer 3 (MP3)",
        0x05 => "ITU-T H.222.0 | ISO/IEC 13818-1 private sections",
        0x06 => "ITU-T H.222.0 | ISO/IEC 13818-1 PES packets with private data",
        0x07 => "ISO/IEC 13522 MHEG",
        0x08 => "ITU-T Rec. H.222.0|ISO/IEC 13818-1 Annex A DSMCC",
        0x09 => "ITU-T Rec. H.222.1",
        0x0a => "ISO 13818-6 type A - DSM CC (Multi-protocol Encapsulation)",
        0x0b => "ISO 13818-6 type B - DSM CC (DSM-CC U-N Messages)",
        0x0c => "ISO 13818-6 type C - DSM CC (DSM-CC Stream Descriptors)",
        0x0d => "ISO 13818-6 type D - DSM CC (DSM-CC Sections - any type, including private data)",
        0x0e => "ITU-T Rec. H.222.0|ISO/IEC 13818-1 auxiliary - DSM CC",
        0x0f => "ISO/IEC 13818-7 Audio with ADTS transport syntax (AAC)",
        0x10 => "ISO/IEC 14496-2 Visual",
        0x11 => "ISO/IEC 14496-3 Audio with the LATM transport syntax as defined in ISO/IEC 14496-3/AMD 1 (HE-AAC)",
        0x12 => "ISO/IEC 14496-1 SL-packetized stream or FlexMux stream carried in PES packets",
        0x13 => "ISO/IEC 14496-1 SL-packetized stream or FlexMux stream carried in ISO/IEC 14496 sections",
        0x14 => "ISO/IEC 13818-6 Synchronized Download Protocol",
        0x15 => "Metadata carried in PES packets",
        0x16 => "Metadata carried in metadata_sections",
        0x17 => "Metadata carried in ISO/IEC 13818-6 Data Carousel",
        0x18 => "Metadata carried in ISO/IEC 13818-6 Object Carousel",
        0x19 => "Metadata carried in ISO/IEC 13818-6 Synchronized Download Protocol",
        0x1a => "IPMP stream (defined in ISO/IEC 13818-11, MPEG-2 IPMP)",
        0x1b => "AVC video stream as defined in ITU-T Rec. H.264 | ISO/IEC 14496-10 Video",
        0x1c..=0x7d => "ITU-T H.222.0 | ISO/IEC 13818-1 reserved",
        0x7e => "Data pipe",
        0x7f => "IPMP stream",
        // Assigned by Intel in the ATSC standard
        0x81 => "Dolby Digital Audio (AC3)",
        _ => "User private",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classes_match_the_standard_tables() {
        assert!(is_video(0x1b));
        assert!(is_audio(0x0f));
        assert!(is_data_carousel(0x0b));
        assert!(is_object_carousel(0x0c));
        assert!(is_event_message(0x0d) && is_data_carousel(0x0d));
        assert!(is_mpe(0x0a) && is_object_carousel(0x0a));
        assert!(!is_video(0x03));
        assert!(!is_audio(0x1b));
    }
}
