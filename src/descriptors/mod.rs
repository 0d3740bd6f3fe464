//! Registry of MPEG/ARIB TS descriptor parsers.
//!
//! One 256-slot array indexed by descriptor_tag, built once at startup and
//! read-only thereafter. Each slot carries `(tag, name, parser)`. Tags that
//! are known but have no dedicated decoder materialise as a named binary
//! file; unknown tags are logged and skipped.

pub mod component_tag;
mod parsers;
pub mod stream_type;

use std::sync::Arc;

use log::{debug, warn};

use crate::fs::Dentry;
use crate::Result;

/// Shared context handed down from the table parser driving the descriptor
/// walk. The PMT fills in the stream entry being decorated so that the
/// stream_identifier_descriptor can cross-check its classification.
#[derive(Debug, Clone, Copy, Default)]
pub struct DescriptorContext {
    pub stream: Option<StreamContext>,
}

/// The PMT stream entry a descriptor loop belongs to.
#[derive(Debug, Clone, Copy)]
pub struct StreamContext {
    pub stream_type: u8,
    pub elementary_pid: u16,
}

/// Parser callback: receives the descriptor body (tag and length stripped).
pub type DescriptorParser =
    fn(&Descriptor, &[u8], &Arc<Dentry>, &DescriptorContext) -> Result<()>;

#[derive(Clone, Copy)]
pub struct Descriptor {
    pub tag: u8,
    pub name: &'static str,
    pub parser: DescriptorParser,
}

pub struct DescriptorRegistry {
    slots: [Option<Descriptor>; 256],
}

impl DescriptorRegistry {
    /// Builds the TS descriptor registry (ISO/IEC 13818-1, 13818-6 and
    /// SBTVD/ARIB assignments).
    pub fn ts() -> DescriptorRegistry {
        let mut registry = DescriptorRegistry {
            slots: [None; 256],
        };
        let mut add = |tag: u8, name: &'static str, parser: DescriptorParser| {
            registry.slots[tag as usize] = Some(Descriptor { tag, name, parser });
        };

        /* TS descriptors and their tag values, defined by ISO/IEC 13818-1 */
        add(0x02, "Video_Stream_Descriptor", parsers::binary);
        add(0x03, "Audio_Stream_Descriptor", parsers::binary);
        add(0x04, "Hierarchy_Descriptor", parsers::binary);
        add(0x05, "Registration_Descriptor", parsers::binary);
        add(0x06, "Data_Stream_Alignment_Descriptor", parsers::binary);
        add(0x07, "Target_Background_Grid_Descriptor", parsers::binary);
        add(0x08, "Video_Window_Descriptor", parsers::binary);
        add(0x09, "Conditional_Access_Descriptor", parsers::binary);
        add(0x0a, "ISO_639_Language_Descriptor", parsers::binary);
        add(0x0b, "System_Clock_Descriptor", parsers::binary);
        add(0x0c, "Multiplex_Buffer_Utilization_Descriptor", parsers::binary);
        add(0x0d, "Copyright_Descriptor", parsers::binary);
        add(0x0e, "Maximum_Bitrate_Descriptor", parsers::binary);
        add(0x0f, "Private_Data_Indicator_Descriptor", parsers::binary);
        add(0x10, "Smoothing_Buffer_Descriptor", parsers::binary);
        add(0x11, "STD_Descriptor", parsers::binary);
        add(0x12, "IBP_Descriptor", parsers::binary);
        /* Defined by ISO/IEC 13818-6 (0x13-0x1a) */
        add(0x13, "Carousel_Id_Descriptor", parsers::binary);
        add(0x14, "Association_Tag_Descriptor", parsers::binary);
        add(0x15, "Deferred_Association_Tag_Descriptor", parsers::binary);
        add(0x1b, "MPEG-4_Video_Descriptor", parsers::binary);
        add(0x1c, "MPEG-4_Audio_Descriptor", parsers::binary);
        add(0x1d, "IOD_Descriptor", parsers::binary);
        add(0x1e, "SL_Descriptor", parsers::binary);
        add(0x1f, "FMC_Descriptor", parsers::binary);
        add(0x20, "External_ES_Id_Descriptor", parsers::binary);
        add(0x21, "Muxcode_Descriptor", parsers::binary);
        add(0x22, "FMX_Buffer_Size_Descriptor", parsers::binary);
        add(0x23, "Multiplex_Buffer_Descriptor", parsers::binary);
        add(0x24, "Content_Labeling_Descriptor", parsers::binary);
        add(0x25, "Metadata_Pointer_Descriptor", parsers::binary);
        add(0x26, "Metadata_Descriptor", parsers::binary);
        add(0x27, "Metadata_STD_Descriptor", parsers::binary);
        add(0x28, "AVC_Video_Descriptor", parsers::binary);
        add(0x2a, "AVC_Timing_and_HDR_Descriptor", parsers::binary);
        add(0x2b, "MPEG-2_AAC_Audio_Descriptor", parsers::binary);
        add(0x2c, "FlexMuxTiming_Descriptor", parsers::binary);
        /* SBTVD */
        add(0x40, "Network_Name_Descriptor", parsers::network_name);
        add(0x41, "Service_List_Descriptor", parsers::service_list);
        add(0x42, "Stuffing_Descriptor", parsers::binary);
        add(0x43, "Satellite_Delivery_System_Descriptor", parsers::binary);
        add(0x47, "Bouquet_Name_Descriptor", parsers::binary);
        add(0x48, "Service_Descriptor", parsers::service);
        add(0x49, "Country_Availability_Descriptor", parsers::binary);
        add(0x4a, "Linkage_Descriptor", parsers::binary);
        add(0x4b, "NVOD_Reference_Descriptor", parsers::binary);
        add(0x4c, "Time_Shifted_Service_Descriptor", parsers::binary);
        add(0x4d, "Short_Event_Descriptor", parsers::short_event);
        add(0x4e, "Extended_Event_Descriptor", parsers::binary);
        add(0x4f, "Time_Shifted_Event_Descriptor", parsers::binary);
        add(0x50, "Component_Descriptor", parsers::binary);
        add(0x51, "Mosaic_Descriptor", parsers::binary);
        add(0x52, "Stream_Identifier_Descriptor", parsers::stream_identifier);
        add(0x53, "CA_Identifier_Descriptor", parsers::binary);
        add(0x54, "Content_Descriptor", parsers::binary);
        add(0x55, "Parental_Rating_Descriptor", parsers::parental_rating);
        add(0x58, "Local_Time_Offset_Descriptor", parsers::binary);
        add(0x63, "Partial_Transport_Stream_Descriptor", parsers::binary);
        add(0x7c, "AAC_Audio_Descriptor", parsers::binary);
        /* 0x80 - 0xBF - Reserved for identification of companies */
        add(0xa0, "FS_Metadata_Descriptor", parsers::binary);
        add(0xc0, "Hierarchical_Transmission_Descriptor", parsers::binary);
        add(0xc1, "Digital_Copy_Control_Descriptor", parsers::binary);
        add(0xc2, "Network_Identifier_Descriptor", parsers::binary);
        add(0xc3, "Partial_Transport_Stream_Time_Descriptor", parsers::binary);
        add(0xc4, "Audio_Component_Descriptor", parsers::binary);
        add(0xc5, "Hyperlink_Descriptor", parsers::binary);
        add(0xc6, "Target_Area_Descriptor", parsers::binary);
        add(0xc7, "Data_Contents_Descriptor", parsers::binary);
        add(0xc8, "Video_Decode_Control_Descriptor", parsers::binary);
        add(0xc9, "Download_Content_Descriptor", parsers::binary);
        add(0xca, "CA_EMM_TS_Descriptor", parsers::binary);
        add(0xcb, "CA_Contract_Information_Descriptor", parsers::binary);
        add(0xcc, "CA_Service_Descriptor", parsers::binary);
        add(0xcd, "TS_Information_Descriptor", parsers::binary);
        add(0xce, "Extended_Broadcaster_Descriptor", parsers::binary);
        add(0xcf, "Logo_Transmission_Descriptor", parsers::binary);
        add(0xd0, "Basic_Local_Event_Descriptor", parsers::binary);
        add(0xd1, "Reference_Descriptor", parsers::binary);
        add(0xd2, "Node_Relation_Descriptor", parsers::binary);
        add(0xd3, "Short_Node_Information_Descriptor", parsers::binary);
        add(0xd4, "STC_Reference_Descriptor", parsers::binary);
        add(0xd5, "Series_Descriptor", parsers::binary);
        add(0xd6, "Event_Group_Descriptor", parsers::binary);
        add(0xd7, "SI_Parameter_Descriptor", parsers::binary);
        add(0xd8, "Broadcaster_Name_Descriptor", parsers::binary);
        add(0xd9, "Component_Group_Descriptor", parsers::binary);
        add(0xda, "SI_Prime_TS_Descriptor", parsers::binary);
        add(0xdb, "Board_Information_Descriptor", parsers::binary);
        add(0xdc, "LDT_Linkage_Descriptor", parsers::binary);
        add(0xdd, "Connected_Transmission_Descriptor", parsers::binary);
        add(0xde, "Content_Availability_Descriptor", parsers::binary);
        add(0xe0, "Service_Group_Descriptor", parsers::binary);
        /* 0xe1 - 0xF6 - Not defined */
        add(0xf7, "Carousel_Compatible_Composite_Descriptor", parsers::binary);
        add(0xf8, "Conditional_Playback_Descriptor", parsers::binary);
        add(0xfa, "Terrestrial_Delivery_System_Descriptor", parsers::binary);
        add(0xfb, "Partial_Reception_Descriptor", parsers::binary);
        add(0xfc, "Emergency_Information_Descriptor", parsers::binary);
        add(0xfd, "Data_Component_Descriptor", parsers::binary);
        add(0xfe, "System_Management_Descriptor", parsers::binary);
        add(0xff, "User_Private_Descriptor", parsers::binary);

        registry
    }

    pub fn find(&self, tag: u8) -> Option<&Descriptor> {
        self.slots[tag as usize].as_ref()
    }

    /// Walks `count` descriptors in `payload`, invoking each registered
    /// parser with the descriptor body. Returns how many bytes the walk
    /// consumed. Unknown tags are logged and skipped; a declared length
    /// running past the region stops the walk.
    pub fn parse(
        &self,
        payload: &[u8],
        count: usize,
        parent: &Arc<Dentry>,
        ctx: &DescriptorContext,
    ) -> usize {
        let mut offset = 0;
        for n in 0..count {
            if offset + 2 > payload.len() {
                warn!("descriptor loop truncated after {} descriptors", n);
                break;
            }
            let tag = payload[offset];
            let length = payload[offset + 1] as usize;
            if offset + 2 + length > payload.len() {
                warn!(
                    "tag {:#04x}: descriptor size mismatch. Expected at least {} bytes, found {}",
                    tag,
                    length,
                    payload.len() - offset - 2
                );
                break;
            }
            let body = &payload[offset + 2..offset + 2 + length];
            match self.find(tag) {
                Some(descriptor) => {
                    debug!(
                        "parsing descriptor {:#04x}-{} (#{}/{})",
                        tag,
                        descriptor.name,
                        n + 1,
                        count
                    );
                    if let Err(e) = (descriptor.parser)(descriptor, body, parent, ctx) {
                        warn!("error parsing descriptor tag {:#x}: {}", tag, e);
                    }
                }
                None => warn!("invalid descriptor tag {:#04x}", tag),
            }
            offset += 2 + length;
        }
        offset
    }
}

/// Counts descriptors in a byte region by walking (tag, length) pairs.
/// Returns 0 if a malformed length would overflow the region.
pub fn descriptors_count(payload: &[u8], info_length: usize) -> usize {
    let mut num = 0;
    let mut len = info_length.min(payload.len()) as isize;
    let mut p = payload;
    while len > 0 {
        let count = if p.len() >= 2 { p[1] as isize + 2 } else { -1 };
        if count < 0 {
            return 0;
        }
        len -= count;
        if len < 0 {
            return 0;
        }
        p = &p[(count as usize).min(p.len())..];
        num += 1;
    }
    num
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs;
    use crate::fs::Dentry;

    #[test]
    fn count_walks_tag_length_pairs() {
        // Two descriptors: (0x52, 1, xx) and (0x48, 2, xx xx).
        let region = [0x52, 0x01, 0xaa, 0x48, 0x02, 0xbb, 0xcc];
        assert_eq!(descriptors_count(&region, region.len()), 2);
        // A region is consumed in full iff the walk covers it exactly.
        assert_eq!(descriptors_count(&region, 3), 1);
        assert_eq!(descriptors_count(&region, 4), 0);
    }

    #[test]
    fn malformed_length_counts_as_zero() {
        let region = [0x52, 0x20, 0xaa];
        assert_eq!(descriptors_count(&region, region.len()), 0);
    }

    #[test]
    fn unknown_tags_are_skipped() {
        let registry = DescriptorRegistry::ts();
        let root = Dentry::new_root();
        // 0x30 is not assigned; 0x52 follows and must still be parsed.
        let region = [0x30, 0x01, 0xaa, 0x52, 0x01, 0x40];
        let consumed = registry.parse(&region, 2, &root, &DescriptorContext::default());
        assert_eq!(consumed, region.len());
        assert!(fs::get_child(&root, "component_tag").is_some());
    }

    #[test]
    fn overrunning_length_stops_the_walk() {
        let registry = DescriptorRegistry::ts();
        let root = Dentry::new_root();
        let region = [0x52, 0x10, 0x40];
        let consumed = registry.parse(&region, 1, &root, &DescriptorContext::default());
        assert_eq!(consumed, 0);
    }
}
