//! Individual TS descriptor decoders.

use std::sync::Arc;

use log::warn;
use smallvec::SmallVec;

use super::{component_tag, stream_type, Descriptor, DescriptorContext};
use crate::fs::xattr::XATTR_FORMAT_STRING;
use crate::fs::{self, Dentry};
use crate::{DemuxError, Result};

fn latin1(bytes: &[u8]) -> String {
    bytes.iter().map(|&b| b as char).collect()
}

fn short(context: &'static str, expected: usize, found: usize) -> DemuxError {
    DemuxError::ShortPayload {
        context,
        expected,
        found,
    }
}

/// Fallback for registered tags without a dedicated decoder: the body
/// materialises as a binary file named after the descriptor.
pub(super) fn binary(
    descriptor: &Descriptor,
    body: &[u8],
    parent: &Arc<Dentry>,
    _ctx: &DescriptorContext,
) -> Result<()> {
    let mut data: SmallVec<[u8; 8]> = SmallVec::new();
    data.extend_from_slice(body);
    fs::create_file_bin(parent, descriptor.name, &data);
    Ok(())
}

/// 0x40: network_name_descriptor.
pub(super) fn network_name(
    _descriptor: &Descriptor,
    body: &[u8],
    parent: &Arc<Dentry>,
    _ctx: &DescriptorContext,
) -> Result<()> {
    fs::create_file_string(parent, "network_name", &latin1(body), XATTR_FORMAT_STRING);
    Ok(())
}

/// 0x41: service_list_descriptor. Three bytes per service.
pub(super) fn service_list(
    _descriptor: &Descriptor,
    body: &[u8],
    parent: &Arc<Dentry>,
    _ctx: &DescriptorContext,
) -> Result<()> {
    let dir = fs::create_directory(parent, "ServiceList");
    for entry in body.chunks_exact(3) {
        let service_id = (entry[0] as u16) << 8 | entry[1] as u16;
        fs::create_file_number(&dir, &format!("{:#06x}", service_id), entry[2] as u64);
    }
    Ok(())
}

/// 0x48: service_descriptor.
pub(super) fn service(
    _descriptor: &Descriptor,
    body: &[u8],
    parent: &Arc<Dentry>,
    _ctx: &DescriptorContext,
) -> Result<()> {
    if body.len() < 3 {
        return Err(short("service_descriptor", 3, body.len()));
    }
    fs::create_file_number(parent, "service_type", body[0] as u64);
    let provider_len = body[1] as usize;
    if 2 + provider_len + 1 > body.len() {
        return Err(short("service_descriptor", 2 + provider_len + 1, body.len()));
    }
    let provider = &body[2..2 + provider_len];
    let name_len = body[2 + provider_len] as usize;
    let name_start = 3 + provider_len;
    if name_start + name_len > body.len() {
        return Err(short("service_descriptor", name_start + name_len, body.len()));
    }
    let name = &body[name_start..name_start + name_len];
    fs::create_file_string(
        parent,
        "service_provider_name",
        &latin1(provider),
        XATTR_FORMAT_STRING,
    );
    fs::create_file_string(parent, "service_name", &latin1(name), XATTR_FORMAT_STRING);
    Ok(())
}

/// 0x4D: short_event_descriptor.
pub(super) fn short_event(
    _descriptor: &Descriptor,
    body: &[u8],
    parent: &Arc<Dentry>,
    _ctx: &DescriptorContext,
) -> Result<()> {
    if body.len() < 5 {
        return Err(short("short_event_descriptor", 5, body.len()));
    }
    fs::create_file_string(
        parent,
        "iso_639_language_code",
        &latin1(&body[..3]),
        XATTR_FORMAT_STRING,
    );
    let name_len = body[3] as usize;
    if 4 + name_len + 1 > body.len() {
        return Err(short("short_event_descriptor", 4 + name_len + 1, body.len()));
    }
    fs::create_file_string(
        parent,
        "event_name",
        &latin1(&body[4..4 + name_len]),
        XATTR_FORMAT_STRING,
    );
    let text_len = body[4 + name_len] as usize;
    let text_start = 5 + name_len;
    if text_start + text_len > body.len() {
        return Err(short(
            "short_event_descriptor",
            text_start + text_len,
            body.len(),
        ));
    }
    fs::create_file_string(
        parent,
        "text",
        &latin1(&body[text_start..text_start + text_len]),
        XATTR_FORMAT_STRING,
    );
    Ok(())
}

/// 0x52: stream_identifier_descriptor. The PMT supplies the stream entry
/// through the context so the component classification can be cross-checked
/// against the stream_type classification.
pub(super) fn stream_identifier(
    _descriptor: &Descriptor,
    body: &[u8],
    parent: &Arc<Dentry>,
    ctx: &DescriptorContext,
) -> Result<()> {
    if body.is_empty() {
        return Err(short("stream_identifier_descriptor", 1, 0));
    }
    let tag = body[0];
    fs::create_file_number(parent, "component_tag", tag as u64);

    if let Some(stream) = &ctx.stream {
        let mut primary = false;
        if stream_type::is_video(stream.stream_type) && !component_tag::is_video(tag, &mut primary)
        {
            warn!(
                "component_tag {:#x} does not match video stream_type {:#x} on pid {:#x}",
                tag, stream.stream_type, stream.elementary_pid
            );
        } else if stream_type::is_audio(stream.stream_type)
            && !component_tag::is_audio(tag, &mut primary)
        {
            warn!(
                "component_tag {:#x} does not match audio stream_type {:#x} on pid {:#x}",
                tag, stream.stream_type, stream.elementary_pid
            );
        }
    }
    Ok(())
}

/// 0x55: parental_rating_descriptor. Four bytes per country entry.
pub(super) fn parental_rating(
    _descriptor: &Descriptor,
    body: &[u8],
    parent: &Arc<Dentry>,
    _ctx: &DescriptorContext,
) -> Result<()> {
    let dir = fs::create_directory(parent, "ParentalRating");
    for (i, entry) in body.chunks_exact(4).enumerate() {
        let subdir = fs::create_directory(&dir, &format!("Rating_{:02}", i + 1));
        fs::create_file_string(
            &subdir,
            "country_code",
            &latin1(&entry[..3]),
            XATTR_FORMAT_STRING,
        );
        fs::create_file_number(&subdir, "rating", entry[3] as u64);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::super::{DescriptorContext, DescriptorRegistry};
    use crate::fs::{self, Dentry};

    #[test]
    fn service_descriptor_decodes_names() {
        let registry = DescriptorRegistry::ts();
        let root = Dentry::new_root();
        // service_type 1, provider "TV", name "News"
        let region = [
            0x48, 0x09, 0x01, 0x02, b'T', b'V', 0x04, b'N', b'e', b'w', b's',
        ];
        registry.parse(&region, 1, &root, &DescriptorContext::default());
        assert_eq!(
            fs::get_child(&root, "service_name").unwrap().contents(),
            b"News"
        );
        assert_eq!(
            fs::get_child(&root, "service_provider_name")
                .unwrap()
                .contents(),
            b"TV"
        );
    }

    #[test]
    fn unhandled_tag_materialises_named_binary() {
        let registry = DescriptorRegistry::ts();
        let root = Dentry::new_root();
        let region = [0x05, 0x02, 0xaa, 0xbb];
        registry.parse(&region, 1, &root, &DescriptorContext::default());
        let file = fs::get_child(&root, "Registration_Descriptor").unwrap();
        assert_eq!(file.contents(), vec![0xaa, 0xbb]);
    }
}
