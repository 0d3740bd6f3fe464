//! Registry of DSM-CC module-info descriptor parsers (ABNT 15606-3).

use std::sync::Arc;

use log::{debug, warn};

use crate::fs::xattr::XATTR_FORMAT_STRING;
use crate::fs::{self, Dentry};
use crate::Result;

pub type DsmccDescriptorParser = fn(&DsmccDescriptor, &[u8], &Arc<Dentry>) -> Result<()>;

#[derive(Clone, Copy)]
pub struct DsmccDescriptor {
    pub tag: u8,
    pub name: &'static str,
    pub parser: DsmccDescriptorParser,
}

pub struct DsmccDescriptorRegistry {
    slots: [Option<DsmccDescriptor>; 256],
}

fn latin1(bytes: &[u8]) -> String {
    bytes.iter().map(|&b| b as char).collect()
}

fn type_descriptor(
    _descriptor: &DsmccDescriptor,
    body: &[u8],
    parent: &Arc<Dentry>,
) -> Result<()> {
    fs::create_file_string(parent, "type", &latin1(body), XATTR_FORMAT_STRING);
    Ok(())
}

fn name_descriptor(
    _descriptor: &DsmccDescriptor,
    body: &[u8],
    parent: &Arc<Dentry>,
) -> Result<()> {
    fs::create_file_string(parent, "name", &latin1(body), XATTR_FORMAT_STRING);
    Ok(())
}

fn info_descriptor(
    _descriptor: &DsmccDescriptor,
    body: &[u8],
    parent: &Arc<Dentry>,
) -> Result<()> {
    if body.len() < 3 {
        return Err(crate::DemuxError::ShortPayload {
            context: "info_descriptor",
            expected: 3,
            found: body.len(),
        });
    }
    fs::create_file_string(
        parent,
        "iso_639_language_code",
        &latin1(&body[..3]),
        XATTR_FORMAT_STRING,
    );
    fs::create_file_string(parent, "info", &latin1(&body[3..]), XATTR_FORMAT_STRING);
    Ok(())
}

fn module_link_descriptor(
    _descriptor: &DsmccDescriptor,
    body: &[u8],
    parent: &Arc<Dentry>,
) -> Result<()> {
    if body.len() < 3 {
        return Err(crate::DemuxError::ShortPayload {
            context: "module_link_descriptor",
            expected: 3,
            found: body.len(),
        });
    }
    fs::create_file_number(parent, "position", body[0] as u64);
    fs::create_file_number(
        parent,
        "module_id_link",
        ((body[1] as u16) << 8 | body[2] as u16) as u64,
    );
    Ok(())
}

fn crc32_descriptor(
    _descriptor: &DsmccDescriptor,
    body: &[u8],
    parent: &Arc<Dentry>,
) -> Result<()> {
    if body.len() < 4 {
        return Err(crate::DemuxError::ShortPayload {
            context: "crc32_descriptor",
            expected: 4,
            found: body.len(),
        });
    }
    let crc = u32::from_be_bytes([body[0], body[1], body[2], body[3]]);
    fs::create_file_number(parent, "module_crc32", crc as u64);
    Ok(())
}

fn location_descriptor(
    _descriptor: &DsmccDescriptor,
    body: &[u8],
    parent: &Arc<Dentry>,
) -> Result<()> {
    if body.is_empty() {
        return Err(crate::DemuxError::ShortPayload {
            context: "location_descriptor",
            expected: 1,
            found: 0,
        });
    }
    fs::create_file_number(parent, "location_tag", body[0] as u64);
    Ok(())
}

fn estimated_download_time_descriptor(
    _descriptor: &DsmccDescriptor,
    body: &[u8],
    parent: &Arc<Dentry>,
) -> Result<()> {
    if body.len() < 4 {
        return Err(crate::DemuxError::ShortPayload {
            context: "estimated_download_time_descriptor",
            expected: 4,
            found: body.len(),
        });
    }
    let seconds = u32::from_be_bytes([body[0], body[1], body[2], body[3]]);
    fs::create_file_number(parent, "estimated_download_time", seconds as u64);
    Ok(())
}

fn compression_type_descriptor(
    _descriptor: &DsmccDescriptor,
    body: &[u8],
    parent: &Arc<Dentry>,
) -> Result<()> {
    if body.len() < 5 {
        return Err(crate::DemuxError::ShortPayload {
            context: "compression_type_descriptor",
            expected: 5,
            found: body.len(),
        });
    }
    fs::create_file_number(parent, "compression_type", body[0] as u64);
    let original_size = u32::from_be_bytes([body[1], body[2], body[3], body[4]]);
    fs::create_file_number(parent, "original_size", original_size as u64);
    Ok(())
}

fn application_descriptor(
    _descriptor: &DsmccDescriptor,
    body: &[u8],
    parent: &Arc<Dentry>,
) -> Result<()> {
    let dir = fs::create_directory(parent, "Application");
    if body.is_empty() {
        return Err(crate::DemuxError::ShortPayload {
            context: "application_descriptor",
            expected: 1,
            found: 0,
        });
    }
    let profiles_length = body[0] as usize;
    let mut offset = 1;
    let mut profile_index = 0;
    while offset + 5 <= (1 + profiles_length).min(body.len()) {
        profile_index += 1;
        let profile_dentry = fs::create_directory(&dir, &format!("profile_{:02}", profile_index));
        let application_profile = (body[offset] as u16) << 8 | body[offset + 1] as u16;
        fs::create_file_number(&profile_dentry, "application_profile", application_profile as u64);
        fs::create_file_number(&profile_dentry, "version_major", body[offset + 2] as u64);
        fs::create_file_number(&profile_dentry, "version_minor", body[offset + 3] as u64);
        fs::create_file_number(&profile_dentry, "version_micro", body[offset + 4] as u64);
        offset += 5;
    }
    if offset + 2 <= body.len() {
        fs::create_file_number(&dir, "service_bound_flag", ((body[offset] >> 7) & 0x01) as u64);
        fs::create_file_number(&dir, "visibility", ((body[offset] >> 5) & 0x03) as u64);
        fs::create_file_number(&dir, "application_priority", body[offset + 1] as u64);
    }
    Ok(())
}

fn broadcaster_descriptor(
    descriptor: &DsmccDescriptor,
    body: &[u8],
    parent: &Arc<Dentry>,
) -> Result<()> {
    let dir = fs::create_directory(parent, descriptor.name);
    fs::create_file_number(&dir, "descriptor_tag", descriptor.tag as u64);
    fs::create_file_bin(&dir, "contents", body);
    Ok(())
}

impl DsmccDescriptorRegistry {
    pub fn new() -> DsmccDescriptorRegistry {
        let mut registry = DsmccDescriptorRegistry {
            slots: [None; 256],
        };
        let mut add = |tag: u8, name: &'static str, parser: DsmccDescriptorParser| {
            registry.slots[tag as usize] = Some(DsmccDescriptor { tag, name, parser });
        };

        add(0x00, "Application_Descriptor", application_descriptor);
        add(0x01, "Type_Descriptor", type_descriptor);
        add(0x02, "Name_Descriptor", name_descriptor);
        add(0x03, "Info_Descriptor", info_descriptor);
        add(0x04, "Module_Link_Descriptor", module_link_descriptor);
        add(0x05, "CRC-32_Descriptor", crc32_descriptor);
        add(0x06, "Location_Descriptor", location_descriptor);
        add(
            0x07,
            "Estimated_Download_Time_Descriptor",
            estimated_download_time_descriptor,
        );
        add(0xc2, "Compression_Type_Descriptor", compression_type_descriptor);
        for tag in 0x80..=0xbf {
            add(tag, "Reserved_For_Broadcasters", broadcaster_descriptor);
        }

        registry
    }

    pub fn find(&self, tag: u8) -> Option<&DsmccDescriptor> {
        self.slots[tag as usize].as_ref()
    }

    /// Walks `count` descriptors, returning the bytes consumed. A declared
    /// length overrunning the region stops the walk with a short-payload
    /// diagnostic.
    pub fn parse(&self, payload: &[u8], count: usize, parent: &Arc<Dentry>) -> usize {
        let mut offset = 0;
        for n in 0..count {
            if offset + 2 > payload.len() {
                warn!("DSM-CC descriptor loop truncated after {} descriptors", n);
                break;
            }
            let tag = payload[offset];
            let length = payload[offset + 1] as usize;
            if offset + 2 + length > payload.len() {
                warn!(
                    "tag {:#04x} could not be parsed: descriptor size mismatch (expected {} bytes, found {})",
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
                        "calling parser for descriptor {:#04x}-{} (descriptor {}/{})",
                        tag,
                        descriptor.name,
                        n + 1,
                        count
                    );
                    if let Err(e) = (descriptor.parser)(descriptor, body, parent) {
                        warn!("error parsing descriptor tag {:#x}: {}", tag, e);
                    }
                }
                None => warn!("invalid descriptor tag {:#x}", tag),
            }
            offset += 2 + length;
        }
        offset
    }
}

impl Default for DsmccDescriptorRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::Dentry;

    #[test]
    fn name_and_crc_descriptors_materialise() {
        let registry = DsmccDescriptorRegistry::new();
        let root = Dentry::new_root();
        let region = [
            0x02, 0x04, b'm', b'a', b'i', b'n', /* Name */
            0x05, 0x04, 0xde, 0xad, 0xbe, 0xef, /* CRC-32 */
        ];
        let consumed = registry.parse(&region, 2, &root);
        assert_eq!(consumed, region.len());
        assert_eq!(fs::get_child(&root, "name").unwrap().contents(), b"main");
        assert_eq!(
            fs::get_child(&root, "module_crc32").unwrap().contents(),
            b"0xdeadbeef"
        );
    }

    #[test]
    fn overrun_stops_the_walk() {
        let registry = DsmccDescriptorRegistry::new();
        let root = Dentry::new_root();
        let region = [0x02, 0x7f, b'x'];
        assert_eq!(registry.parse(&region, 1, &root), 0);
    }
}
