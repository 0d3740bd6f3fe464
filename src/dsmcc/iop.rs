//! IOP::IOR decoding: tagged profiles, the BIOP profile body, object
//! location and connbinder.

use std::sync::Arc;

use log::{debug, warn};

use crate::fs::xattr::XATTR_FORMAT_STRING;
use crate::fs::{self, Dentry};
use crate::{Result, SliceReader};

pub const TAG_BIOP: u32 = 0x4249_4f50;
pub const TAG_LITE_OPTIONS: u32 = 0x4953_4f05;
pub const TAG_BIOP_PROFILE: u32 = 0x4953_4f06;
pub const TAG_CONN_BINDER: u32 = 0x4953_4f40;
pub const TAG_SERVICE_LOCATION: u32 = 0x4953_4f46;
pub const TAG_OBJECT_LOCATION: u32 = 0x4953_4f50;

pub const BIOP_DELIVERY_PARA_USE: u16 = 0x0016;
pub const BIOP_OBJECT_USE: u16 = 0x0017;

#[derive(Debug, Clone)]
pub struct MessageSelector {
    pub selector_length: u8,
    pub selector_type: u16,
    pub transaction_id: u32,
    pub timeout: u32,
}

#[derive(Debug, Clone)]
pub struct Tap {
    pub tap_id: u16,
    pub tap_use: u16,
    pub association_tag: u16,
    pub message_selector: Option<MessageSelector>,
}

#[derive(Debug, Clone, Default)]
pub struct Connbinder {
    pub connbinder_tag: u32,
    pub connbinder_length: u8,
    pub taps: Vec<Tap>,
}

#[derive(Debug, Clone, Default)]
pub struct ObjectLocation {
    pub object_location_tag: u32,
    pub object_location_length: u8,
    pub carousel_id: u32,
    pub module_id: u16,
    pub version_major: u8,
    pub version_minor: u8,
    pub object_key_length: u8,
    pub object_key: u64,
}

#[derive(Debug, Clone)]
pub struct ProfileBody {
    pub profile_id_tag: u32,
    pub profile_data_length: u32,
    pub profile_data_byte_order: u8,
    pub component_count: u8,
    pub object_location: ObjectLocation,
    pub connbinder: Connbinder,
}

#[derive(Debug, Clone, Default)]
pub struct TaggedProfile {
    pub profile_body: Option<ProfileBody>,
}

#[derive(Debug, Clone, Default)]
pub struct Ior {
    pub type_id_length: u32,
    pub type_id: Vec<u8>,
    pub tagged_profiles: Vec<TaggedProfile>,
}

impl Ior {
    /// First tap of the first BIOP profile body, if any. The DSI uses its
    /// message selector to cross-link the DII.
    pub fn first_tap(&self) -> Option<&Tap> {
        self.tagged_profiles
            .iter()
            .find_map(|p| p.profile_body.as_ref())
            .and_then(|pb| pb.connbinder.taps.first())
    }

    /// object_key of the first BIOP profile body: the child inode of a
    /// carousel binding.
    pub fn object_key(&self) -> Option<u64> {
        self.tagged_profiles
            .iter()
            .find_map(|p| p.profile_body.as_ref())
            .map(|pb| pb.object_location.object_key)
    }
}

pub fn parse_object_location(reader: &mut SliceReader) -> Result<ObjectLocation> {
    let mut location = ObjectLocation {
        object_location_tag: reader.read_be_u32()?,
        object_location_length: reader.read_u8()?,
        carousel_id: reader.read_be_u32()?,
        module_id: reader.read_be_u16()?,
        version_major: reader.read_u8()?,
        version_minor: reader.read_u8()?,
        object_key_length: reader.read_u8()?,
        object_key: 0,
    };

    if location.version_major != 0x01 {
        warn!("version_major != 0x01 ({:#x})", location.version_major);
    }
    if location.version_minor != 0x00 {
        warn!("version_minor != 0x00 ({:#x})", location.version_minor);
    }

    location.object_key = match location.object_key_length {
        1 => reader.read_u8()? as u64,
        2 => reader.read_be_u16()? as u64,
        3 => reader.read_be_u24()? as u64,
        4 => reader.read_be_u32()? as u64,
        _ => {
            debug!("object_key_length indicates more than 4 bytes, cannot parse object_key");
            location.object_key_length = 4;
            reader.read_be_u32()? as u64
        }
    };
    Ok(location)
}

pub fn parse_connbinder(reader: &mut SliceReader) -> Result<Connbinder> {
    let mut connbinder = Connbinder {
        connbinder_tag: reader.read_be_u32()?,
        connbinder_length: reader.read_u8()?,
        taps: Vec::new(),
    };
    let tap_count = reader.read_u8()?;
    for _ in 0..tap_count {
        let mut tap = Tap {
            tap_id: reader.read_be_u16()?,
            tap_use: reader.read_be_u16()?,
            association_tag: reader.read_be_u16()?,
            message_selector: None,
        };
        if tap.tap_use == BIOP_DELIVERY_PARA_USE {
            let selector = MessageSelector {
                selector_length: reader.read_u8()?,
                selector_type: reader.read_be_u16()?,
                transaction_id: reader.read_be_u32()?,
                timeout: reader.read_be_u32()?,
            };
            if selector.selector_length != 0x0a {
                warn!("selector_length != 0x0a ({:#x})", selector.selector_length);
            }
            if selector.selector_type != 0x0001 {
                warn!("selector_type != 0x0001 ({:#x})", selector.selector_type);
            }
            tap.message_selector = Some(selector);
        } else if tap.tap_use == BIOP_OBJECT_USE {
            let selector_length = reader.read_u8()?;
            if selector_length != 0 {
                debug!("BIOP_OBJECT_USE: selector_length != 0 ({})", selector_length);
                reader.skip(selector_length as usize)?;
            }
        } else {
            debug!(
                "unsupported tap_use value {:#x}, cannot parse selector() field",
                tap.tap_use
            );
        }
        connbinder.taps.push(tap);
    }
    Ok(connbinder)
}

pub fn parse_profile_body(reader: &mut SliceReader) -> Result<ProfileBody> {
    let profile_id_tag = reader.read_be_u32()?;
    let profile_data_length = reader.read_be_u32()?;
    let profile_data_byte_order = reader.read_u8()?;
    let component_count = reader.read_u8()?;

    if profile_id_tag != TAG_BIOP_PROFILE {
        debug!("parsing profile body but profile_id_tag={:#x}", profile_id_tag);
    }

    let object_location = parse_object_location(reader)?;
    let connbinder = parse_connbinder(reader)?;

    if component_count > 2 {
        debug!(
            "component_count={}, but LiteOptionsComponent() parser is not implemented",
            component_count
        );
    }

    Ok(ProfileBody {
        profile_id_tag,
        profile_data_length,
        profile_data_byte_order,
        component_count,
        object_location,
        connbinder,
    })
}

/// Parses the tagged profile list of an IOR. Each profile is framed by an
/// (id_tag, data_length) prefix so unknown profiles can be skipped whole.
pub fn parse_tagged_profiles(
    reader: &mut SliceReader,
    count: u32,
) -> Result<Vec<TaggedProfile>> {
    let mut profiles = Vec::new();
    for _ in 0..count {
        let id_tag = u32::from_be_bytes(*reader.peek_array_ref::<4>()?);
        let data_length = {
            let header = reader.peek(8)?;
            u32::from_be_bytes([header[4], header[5], header[6], header[7]])
        };

        let mut profile = TaggedProfile::default();
        match id_tag {
            TAG_BIOP_PROFILE => {
                let mut body = reader.new_sub_reader(8 + data_length as usize)?;
                profile.profile_body = Some(parse_profile_body(&mut body)?);
            }
            TAG_BIOP => {
                debug!("BIOP profile parser not implemented");
                reader.skip(8 + data_length as usize)?;
            }
            TAG_LITE_OPTIONS => {
                debug!("Lite Options profile parser not implemented");
                reader.skip(8 + data_length as usize)?;
            }
            TAG_SERVICE_LOCATION => {
                debug!("Service Location parser not implemented");
                reader.skip(8 + data_length as usize)?;
            }
            TAG_OBJECT_LOCATION => {
                debug!("Object Location parser not implemented");
                reader.skip(8 + data_length as usize)?;
            }
            _ => {
                debug!("unknown profile {:#x}, cannot parse", id_tag);
                reader.skip(8 + data_length as usize)?;
            }
        }
        profiles.push(profile);
    }
    Ok(profiles)
}

/// Parses an IOP::IOR().
pub fn parse_ior(reader: &mut SliceReader) -> Result<Ior> {
    let type_id_length = reader.read_be_u32()?;
    if type_id_length != 4 {
        warn!("ior->type_id_length != 4 ({:#x})", type_id_length);
    }
    let type_id = reader.read(type_id_length as usize)?.to_vec();

    /* CDR alignment gap after the type id */
    let gap_bytes = (type_id_length % 4) as usize;
    if gap_bytes != 0 {
        reader.skip(4 - gap_bytes)?;
    }

    let tagged_profiles_count = reader.read_be_u32()?;
    let tagged_profiles = parse_tagged_profiles(reader, tagged_profiles_count)?;

    Ok(Ior {
        type_id_length,
        type_id,
        tagged_profiles,
    })
}

fn populate_profile_body(parent: &Arc<Dentry>, profile: &TaggedProfile) {
    let body = match &profile.profile_body {
        Some(body) => body,
        None => {
            debug!("LiteBody profile parser not implemented");
            return;
        }
    };

    let body_dentry = fs::create_directory(parent, "BiopProfileBody");
    fs::create_file_number(&body_dentry, "profile_id_tag", body.profile_id_tag as u64);
    fs::create_file_number(&body_dentry, "profile_data_length", body.profile_data_length as u64);
    fs::create_file_number(
        &body_dentry,
        "profile_data_byte_order",
        body.profile_data_byte_order as u64,
    );
    fs::create_file_number(&body_dentry, "component_count", body.component_count as u64);
    if body.profile_data_byte_order != 0 {
        warn!("profile_data_byte_order != 0");
    }

    let obj_dentry = fs::create_directory(&body_dentry, "ObjectLocation");
    let location = &body.object_location;
    fs::create_file_number(&obj_dentry, "object_location_tag", location.object_location_tag as u64);
    fs::create_file_number(
        &obj_dentry,
        "object_location_length",
        location.object_location_length as u64,
    );
    fs::create_file_number(&obj_dentry, "carousel_id", location.carousel_id as u64);
    fs::create_file_number(&obj_dentry, "module_id", location.module_id as u64);
    fs::create_file_number(&obj_dentry, "version_major", location.version_major as u64);
    fs::create_file_number(&obj_dentry, "version_minor", location.version_minor as u64);
    fs::create_file_number(&obj_dentry, "object_key_length", location.object_key_length as u64);
    fs::create_file_number(&obj_dentry, "object_key", location.object_key);
    if location.object_location_tag != TAG_OBJECT_LOCATION {
        warn!("object_location_tag != 0x49534f50");
    }
    if location.module_id >= 0xfff0 {
        warn!("module_id contains a reserved value");
    }

    let cb_dentry = fs::create_directory(&body_dentry, "ConnBinder");
    let connbinder = &body.connbinder;
    fs::create_file_number(&cb_dentry, "connbinder_tag", connbinder.connbinder_tag as u64);
    fs::create_file_number(&cb_dentry, "connbinder_length", connbinder.connbinder_length as u64);
    fs::create_file_number(&cb_dentry, "tap_count", connbinder.taps.len() as u64);
    if connbinder.connbinder_tag != TAG_CONN_BINDER {
        warn!("connbinder_tag != 0x49534f40");
    }

    for (i, tap) in connbinder.taps.iter().enumerate() {
        let tap_dentry = fs::create_directory(&cb_dentry, &format!("tap_{:02}", i + 1));
        fs::create_file_number(&tap_dentry, "tap_id", tap.tap_id as u64);
        fs::create_file_number(&tap_dentry, "tap_use", tap.tap_use as u64);
        fs::create_file_number(&tap_dentry, "association_tag", tap.association_tag as u64);

        if let Some(selector) = &tap.message_selector {
            let selector_dentry = fs::create_directory(&tap_dentry, "MessageSelector");
            fs::create_file_number(&selector_dentry, "selector_length", selector.selector_length as u64);
            fs::create_file_number(&selector_dentry, "selector_type", selector.selector_type as u64);
            fs::create_file_number(&selector_dentry, "transaction_id", selector.transaction_id as u64);
            fs::create_file_number(&selector_dentry, "timeout", selector.timeout as u64);
        }
    }
}

/// Materialises an IOR subtree under `parent`.
pub fn populate_ior(parent: &Arc<Dentry>, ior: &Ior) {
    fs::create_file_number(parent, "type_id_length", ior.type_id_length as u64);
    let type_id: String = ior.type_id.iter().map(|&b| b as char).collect();
    fs::create_file_string(parent, "type_id", &type_id, XATTR_FORMAT_STRING);
    fs::create_file_number(parent, "tagged_profiles_count", ior.tagged_profiles.len() as u64);
    if let Some(profile) = ior.tagged_profiles.first() {
        populate_profile_body(parent, profile);
    }
}

/// Serialises a minimal BIOP-profile IOR for the given object key.
#[cfg(test)]
pub(crate) fn build_test_ior(object_key: u32, transaction_id: u32) -> Vec<u8> {
    let mut body = Vec::new();
    /* ObjectLocation */
    body.extend_from_slice(&TAG_OBJECT_LOCATION.to_be_bytes());
    body.push(13); /* object_location_length */
    body.extend_from_slice(&1u32.to_be_bytes()); /* carousel_id */
    body.extend_from_slice(&1u16.to_be_bytes()); /* module_id */
    body.push(1); /* version_major */
    body.push(0); /* version_minor */
    body.push(4); /* object_key_length */
    body.extend_from_slice(&object_key.to_be_bytes());
    /* ConnBinder with one delivery-para tap */
    body.extend_from_slice(&TAG_CONN_BINDER.to_be_bytes());
    body.push(18); /* connbinder_length */
    body.push(1); /* tap_count */
    body.extend_from_slice(&0u16.to_be_bytes()); /* tap_id */
    body.extend_from_slice(&BIOP_DELIVERY_PARA_USE.to_be_bytes());
    body.extend_from_slice(&0x0bu16.to_be_bytes()); /* association_tag */
    body.push(0x0a); /* selector_length */
    body.extend_from_slice(&1u16.to_be_bytes()); /* selector_type */
    body.extend_from_slice(&transaction_id.to_be_bytes());
    body.extend_from_slice(&0u32.to_be_bytes()); /* timeout */

    let mut profile = Vec::new();
    profile.extend_from_slice(&TAG_BIOP_PROFILE.to_be_bytes());
    profile.extend_from_slice(&((body.len() + 2) as u32).to_be_bytes());
    profile.push(0); /* byte order */
    profile.push(2); /* component_count */
    profile.extend_from_slice(&body);

    let mut ior = Vec::new();
    ior.extend_from_slice(&4u32.to_be_bytes()); /* type_id_length */
    ior.extend_from_slice(b"dir\0");
    ior.extend_from_slice(&1u32.to_be_bytes()); /* tagged_profiles_count */
    ior.extend_from_slice(&profile);
    ior
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_a_profile_body() {
        let bytes = build_test_ior(0x42, 0x8000_0001);
        let mut reader = SliceReader::new(&bytes);
        let ior = parse_ior(&mut reader).unwrap();
        assert_eq!(ior.object_key(), Some(0x42));
        let tap = ior.first_tap().unwrap();
        assert_eq!(
            tap.message_selector.as_ref().unwrap().transaction_id,
            0x8000_0001
        );
        assert_eq!(reader.remaining_len(), 0);
    }
}
