//! BIOP message decoding and carousel tree assembly.
//!
//! The traversal consumes the concatenated bytes of a completed module and
//! materialises gateway, directory and file objects. Children bound before
//! their parent has been seen are staged on a stepfather root and moved to
//! their real parent by a post-pass; every child has exactly one owner at
//! any instant.

use std::sync::Arc;

use log::{debug, warn};

use super::iop::{self, Ior};
use crate::fs::{self, Dentry};
use crate::{DemuxError, Result, SliceReader};

pub const BIOP_MAGIC: u32 = 0x4249_4f50; /* "BIOP" */

pub const KIND_SRG: u32 = 0x7372_6700; /* "srg\0" service gateway */
pub const KIND_DIR: u32 = 0x6469_7200; /* "dir\0" */
pub const KIND_FIL: u32 = 0x6669_6c00; /* "fil\0" */
pub const KIND_STE: u32 = 0x7374_6500; /* "ste\0" */
pub const KIND_STR: u32 = 0x7374_7200; /* "str\0" */

/// Fixed 12-byte preamble of every BIOP message.
#[derive(Debug, Clone)]
pub struct BiopMessageHeader {
    pub magic: u32,
    pub biop_version_major: u8,
    pub biop_version_minor: u8,
    pub byte_order: u8,
    pub message_type: u8,
    pub message_size: u32,
}

pub fn parse_message_header(reader: &mut SliceReader) -> Result<BiopMessageHeader> {
    let header = BiopMessageHeader {
        magic: reader.read_be_u32()?,
        biop_version_major: reader.read_u8()?,
        biop_version_minor: reader.read_u8()?,
        byte_order: reader.read_u8()?,
        message_type: reader.read_u8()?,
        message_size: reader.read_be_u32()?,
    };

    if header.magic != BIOP_MAGIC {
        warn!("magic != 0x42494f50/'BIOP' ({:#x})", header.magic);
    }
    if header.biop_version_major != 0x01 {
        warn!("biop_version_major != 0x01 ({:#x})", header.biop_version_major);
    }
    if header.biop_version_minor != 0x00 {
        warn!("biop_version_minor != 0x00 ({:#x})", header.biop_version_minor);
    }
    if header.byte_order != 0x00 {
        warn!("byte_order != 0x00 ({:#x})", header.byte_order);
    }
    if header.message_type != 0x00 {
        warn!("message_type != 0x00 ({:#x})", header.message_type);
    }
    Ok(header)
}

/// Sub-header common to gateway, directory and file messages.
#[derive(Debug, Clone)]
pub struct BiopSubHeader {
    /// Up to four object key bytes folded big-endian into the inode.
    pub object_key: u64,
    pub object_kind: u32,
    pub object_info_length: u16,
    /// Content size from a file object's objectInfo.
    pub content_size: Option<u64>,
}

fn fold_object_key(bytes: &[u8]) -> u64 {
    bytes.iter().take(4).fold(0u64, |acc, &b| acc << 8 | b as u64)
}

pub fn parse_sub_header(reader: &mut SliceReader) -> Result<BiopSubHeader> {
    let object_key_length = reader.read_u8()? as usize;
    let object_key = fold_object_key(reader.read(object_key_length)?);

    let object_kind_length = reader.read_be_u32()?;
    if object_kind_length != 4 {
        warn!("objectKind_length != 4 ({})", object_kind_length);
    }
    let object_kind = reader.read_be_u32()?;
    let object_info_length = reader.read_be_u16()?;

    let mut object_info = reader.new_sub_reader(object_info_length as usize)?;
    let content_size = if object_kind == KIND_FIL && object_info_length >= 8 {
        Some(object_info.read_be_u64()?)
    } else {
        None
    };
    /* Remaining objectInfo descriptor bytes carry no tree state */

    let service_context_list_count = reader.read_u8()?;
    for _ in 0..service_context_list_count {
        reader.skip(4)?; /* context_id */
        let context_data_length = reader.read_be_u16()? as usize;
        reader.skip(context_data_length)?;
    }

    Ok(BiopSubHeader {
        object_key,
        object_kind,
        object_info_length,
        content_size,
    })
}

#[derive(Debug, Clone)]
struct BiopName {
    id: String,
    kind_data: u32,
}

fn parse_name(reader: &mut SliceReader) -> Result<BiopName> {
    let name_component_count = reader.read_u8()?;
    if name_component_count != 1 {
        warn!("name_component_count != 1 ({})", name_component_count);
    }
    let id_length = reader.read_u8()? as usize;
    let id_bytes = reader.read(id_length)?;
    let id: String = id_bytes
        .iter()
        .take_while(|&&b| b != 0)
        .map(|&b| b as char)
        .collect();

    let kind_length = reader.read_u8()? as usize;
    if kind_length != 4 {
        warn!("kind_length != 4 ({})", kind_length);
    }
    let kind_data = reader.read_be_u32()?;
    Ok(BiopName { id, kind_data })
}

/// One name binding of a directory message.
#[derive(Debug, Clone)]
pub struct Binding {
    pub name: String,
    pub kind_data: u32,
    pub binding_type: u8,
    pub ior: Ior,
    pub child_object_info_length: u16,
    pub content_size: u64,
    pub timestamp: Option<u64>,
    pub content_type: Option<String>,
    /// Child inode from the IOR's first profile body object_key.
    pub inode: u64,
}

/// Walks the child_object_info descriptors of a binding: 0x72 content type
/// and 0x81 timestamp are decoded, others are skipped. A descriptor whose
/// declared length overruns the region stops the walk.
fn parse_binding_descriptors(binding: &mut Binding, reader: &mut SliceReader) {
    while reader.remaining_len() >= 2 {
        let descriptor_tag = match reader.read_u8() {
            Ok(tag) => tag,
            Err(_) => return,
        };
        let descriptor_length = match reader.read_u8() {
            Ok(length) => length as usize,
            Err(_) => return,
        };
        let body = match reader.read(descriptor_length) {
            Ok(body) => body,
            Err(_) => {
                warn!(
                    "binding descriptor {:#x}: declared length {} overruns the region",
                    descriptor_tag, descriptor_length
                );
                return;
            }
        };
        match descriptor_tag {
            0x72 => {
                let content_type: String = body.iter().map(|&b| b as char).collect();
                debug!("content_type='{}'", content_type);
                binding.content_type = Some(content_type);
            }
            0x81 => {
                if body.len() >= 8 {
                    let mut ts = SliceReader::new(body);
                    binding.timestamp = ts.read_be_u64().ok();
                }
            }
            _ => debug!("unsupported descriptor tag '{:#x}'", descriptor_tag),
        }
    }
}

fn parse_binding(reader: &mut SliceReader) -> Result<Binding> {
    let name = parse_name(reader)?;
    let binding_type = reader.read_u8()?;
    let ior = iop::parse_ior(reader)?;
    let child_object_info_length = reader.read_be_u16()?;

    let mut binding = Binding {
        name: name.id,
        kind_data: name.kind_data,
        binding_type,
        child_object_info_length,
        content_size: 0,
        timestamp: None,
        content_type: None,
        inode: 0,
        ior,
    };

    let mut info = reader.new_sub_reader(child_object_info_length as usize)?;
    if binding.kind_data == KIND_FIL && child_object_info_length >= 8 {
        binding.content_size = info.read_be_u64()?;
        if binding.content_size & 0xffff_ffff_0000_0000 != 0 {
            warn!("binding has invalid content size: {:#x}", binding.content_size);
        }
        if binding.binding_type != 0x01 {
            warn!("binding_type != 0x01 ({:#x})", binding.binding_type);
        }
    } else if binding.kind_data == KIND_FIL {
        /* File size becomes known when the file message arrives */
        warn!(
            "child_object_info_length < 8 ({})",
            child_object_info_length
        );
    }
    parse_binding_descriptors(&mut binding, &mut info);

    binding.inode = binding.ior.object_key().unwrap_or(0);
    Ok(binding)
}

/// Directory (and gateway) message body: sub-header plus the binding list.
pub fn parse_directory_message(reader: &mut SliceReader) -> Result<(BiopSubHeader, Vec<Binding>)> {
    let sub_header = parse_sub_header(reader)?;
    let _message_body_length = reader.read_be_u32()?;
    let bindings_count = reader.read_be_u16()?;
    let mut bindings = Vec::with_capacity(bindings_count as usize);
    for _ in 0..bindings_count {
        bindings.push(parse_binding(reader)?);
    }
    Ok((sub_header, bindings))
}

/// File message body: sub-header plus the content bytes.
pub fn parse_file_message<'a>(
    reader: &mut SliceReader<'a>,
) -> Result<(BiopSubHeader, &'a [u8])> {
    let sub_header = parse_sub_header(reader)?;
    let _message_body_length = reader.read_be_u32()?;
    let content_length = reader.read_be_u32()?;
    let contents = reader.read(content_length as usize)?;
    Ok((sub_header, contents))
}

/// Creates the dentries announced by one directory message. When the parent
/// object has not been seen yet, children land on the stepfather with the
/// parent inode remembered for the reparenting pass.
fn create_children_dentries(
    root: &Arc<Dentry>,
    stepfather: &Arc<Dentry>,
    parent_inode: u64,
    bindings: &[Binding],
) {
    let (parent, found_parent) = match fs::find_by_inode(root, parent_inode) {
        Some(parent) => (parent, true),
        None => (stepfather.clone(), false),
    };

    for binding in bindings {
        let entry = if binding.kind_data == KIND_FIL {
            debug!(
                "creating file '{}' of size {} and inode {:#x} under parent {:#x} ({})",
                binding.name,
                binding.content_size,
                binding.inode,
                parent_inode,
                if found_parent { "found" } else { "not found" }
            );
            match fs::find_by_inode(root, binding.inode)
                .or_else(|| fs::find_by_inode(stepfather, binding.inode))
            {
                Some(entry) => {
                    /* A file message arrived first and staged a nameless
                     * dentry; adopt it. */
                    entry.set_name(&binding.name);
                    fs::reparent(&entry, &parent);
                    if entry.size() == 0 && binding.content_size > 0 {
                        entry.resize_contents(binding.content_size as usize);
                    }
                    entry
                }
                None => fs::create_sized_file(
                    &parent,
                    &binding.name,
                    binding.content_size as usize,
                    binding.inode,
                ),
            }
        } else {
            debug!(
                "creating directory '{}' with inode {:#x} under parent {:#x} ({})",
                binding.name,
                binding.inode,
                parent_inode,
                if found_parent { "found" } else { "not found" }
            );
            match fs::find_by_inode(&parent, binding.inode) {
                Some(entry) => {
                    entry.set_name(&binding.name);
                    fs::reparent(&entry, &parent);
                    entry
                }
                None => fs::create_inode_directory(&parent, &binding.name, binding.inode),
            }
        };

        if let Some(timestamp) = binding.timestamp {
            entry.set_times(timestamp);
        }
        if !found_parent {
            /* Possibly the parent wasn't scanned yet. Remember its inode to
             * reparent this child later on. */
            entry.set_parent_hint(Some(parent_inode));
        }
    }
}

/// Applies a file message to the dentry whose inode matches its object key,
/// staging a nameless file when no binding has announced it yet.
fn update_file_dentry(
    root: &Arc<Dentry>,
    stepfather: &Arc<Dentry>,
    sub_header: &BiopSubHeader,
    contents: &[u8],
) {
    let inode = sub_header.object_key;
    let dentry = fs::find_by_inode(root, inode)
        .or_else(|| fs::find_by_inode(stepfather, inode))
        .unwrap_or_else(|| {
            /* Create a nameless dentry in the hope that a directory message
             * will update it later on. */
            fs::create_sized_file(stepfather, "", contents.len(), inode)
        });

    if dentry.size() != contents.len() {
        debug!(
            "'{}': directory object said size={}, file object says {} (inode={:#x})",
            dentry.name(),
            dentry.size(),
            contents.len(),
            inode
        );
        if dentry.size() == 0 {
            dentry.resize_contents(contents.len());
        }
    }
    dentry.fill_contents(contents);
}

/// Walks the stepfather's children, moving every child whose remembered
/// parent inode now resolves in the real tree (or inside the stepfather
/// itself). With `discard_unresolved` set, children that still cannot be
/// resolved after a full carousel pass are disposed with a diagnostic.
/// Returns the number of disposed orphans.
pub fn reparent_orphaned_dentries(
    root: &Arc<Dentry>,
    stepfather: &Arc<Dentry>,
    discard_unresolved: bool,
) -> usize {
    let mut disposed = 0;
    for entry in stepfather.children() {
        let real_parent_inode = match entry.parent_hint() {
            Some(hint) => hint,
            None => {
                if discard_unresolved {
                    debug!(
                        "orphaned entry '{}' ({:#x}) doesn't contain a parent hint",
                        entry.name(),
                        entry.inode()
                    );
                    fs::dispose_tree(&entry);
                    disposed += 1;
                }
                continue;
            }
        };

        let real_parent = fs::find_by_inode(root, real_parent_inode).or_else(|| {
            /* It's possible that the real parent is also staged */
            fs::find_by_inode(stepfather, real_parent_inode)
        });

        match real_parent {
            Some(real_parent) => {
                fs::reparent(&entry, &real_parent);
                entry.set_parent_hint(None);
            }
            None if discard_unresolved => {
                warn!(
                    "'{}' is definitely orphaned for its parent {:#x} is missing",
                    entry.name(),
                    real_parent_inode
                );
                fs::dispose_tree(&entry);
                disposed += 1;
            }
            None => {}
        }
    }
    disposed
}

/// Parses a sequence of BIOP messages from a module's concatenated bytes,
/// mutating the carousel tree under `parent`. The gateway message assigns
/// its object key to `parent` so directory messages can locate it by inode.
pub fn create_filesystem_dentries(
    parent: &Arc<Dentry>,
    stepfather: &Arc<Dentry>,
    buf: &[u8],
) -> Result<()> {
    let mut reader = SliceReader::new(buf);
    while reader.remaining_len() > 12 {
        let header = parse_message_header(&mut reader)?;
        if header.magic != BIOP_MAGIC {
            return Err(DemuxError::MalformedPacket("BIOP magic mismatch"));
        }
        let mut body = reader.new_sub_reader(header.message_size as usize)?;

        /* Lookahead four bytes past the object key and objectKind_length
         * fields to read the object kind tag */
        let object_key_length = body.peek(1)?[0] as usize;
        let lookahead = body.peek(1 + object_key_length + 4 + 4)?;
        let kind = u32::from_be_bytes([
            lookahead[1 + object_key_length + 4],
            lookahead[1 + object_key_length + 5],
            lookahead[1 + object_key_length + 6],
            lookahead[1 + object_key_length + 7],
        ]);

        match kind {
            KIND_SRG => {
                debug!("----------------- gateway start ----------------");
                let (sub_header, bindings) = parse_directory_message(&mut body)?;
                /* The gateway becomes the carousel root */
                parent.set_inode(sub_header.object_key);
                create_children_dentries(parent, stepfather, sub_header.object_key, &bindings);
            }
            KIND_DIR => {
                debug!("----------------- directory start ----------------");
                let (sub_header, bindings) = parse_directory_message(&mut body)?;
                create_children_dentries(parent, stepfather, sub_header.object_key, &bindings);
            }
            KIND_FIL => {
                let (sub_header, contents) = parse_file_message(&mut body)?;
                update_file_dentry(parent, stepfather, &sub_header, contents);
            }
            other => {
                debug!("parser for object kind {:#010x} not implemented", other);
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dsmcc::iop::build_test_ior;

    fn build_sub_header(object_key: u32, kind: u32, object_info: &[u8]) -> Vec<u8> {
        let mut out = Vec::new();
        out.push(4); /* objectKey_length */
        out.extend_from_slice(&object_key.to_be_bytes());
        out.extend_from_slice(&4u32.to_be_bytes()); /* objectKind_length */
        out.extend_from_slice(&kind.to_be_bytes());
        out.extend_from_slice(&(object_info.len() as u16).to_be_bytes());
        out.extend_from_slice(object_info);
        out.push(0); /* serviceContextList_count */
        out
    }

    fn build_binding(name: &str, kind: u32, child_key: u32, content_size: Option<u64>) -> Vec<u8> {
        let mut out = Vec::new();
        out.push(1); /* nameComponents_count */
        out.push(name.len() as u8 + 1);
        out.extend_from_slice(name.as_bytes());
        out.push(0);
        out.push(4); /* kind_length */
        out.extend_from_slice(&kind.to_be_bytes());
        out.push(1); /* binding_type */
        out.extend_from_slice(&build_test_ior(child_key, 0x8000_0001));
        match content_size {
            Some(size) => {
                out.extend_from_slice(&8u16.to_be_bytes());
                out.extend_from_slice(&size.to_be_bytes());
            }
            None => out.extend_from_slice(&0u16.to_be_bytes()),
        }
        out
    }

    fn build_directory_message(object_key: u32, kind: u32, bindings: &[Vec<u8>]) -> Vec<u8> {
        let mut body = build_sub_header(object_key, kind, &[]);
        let mut binding_bytes = Vec::new();
        for binding in bindings {
            binding_bytes.extend_from_slice(binding);
        }
        body.extend_from_slice(&((binding_bytes.len() + 2) as u32).to_be_bytes());
        body.extend_from_slice(&(bindings.len() as u16).to_be_bytes());
        body.extend_from_slice(&binding_bytes);

        let mut out = Vec::new();
        out.extend_from_slice(&BIOP_MAGIC.to_be_bytes());
        out.extend_from_slice(&[1, 0, 0, 0]); /* version 1.0, big endian, type 0 */
        out.extend_from_slice(&(body.len() as u32).to_be_bytes());
        out.extend_from_slice(&body);
        out
    }

    fn build_file_message(object_key: u32, contents: &[u8]) -> Vec<u8> {
        let mut object_info = Vec::new();
        object_info.extend_from_slice(&(contents.len() as u64).to_be_bytes());
        let mut body = build_sub_header(object_key, KIND_FIL, &object_info);
        body.extend_from_slice(&((contents.len() + 4) as u32).to_be_bytes());
        body.extend_from_slice(&(contents.len() as u32).to_be_bytes());
        body.extend_from_slice(contents);

        let mut out = Vec::new();
        out.extend_from_slice(&BIOP_MAGIC.to_be_bytes());
        out.extend_from_slice(&[1, 0, 0, 0]);
        out.extend_from_slice(&(body.len() as u32).to_be_bytes());
        out.extend_from_slice(&body);
        out
    }

    #[test]
    fn gateway_and_file_assemble_a_tree() {
        let root = Dentry::new_detached_root("0x0001");
        let stepfather = Dentry::new_detached_root("stepfather");

        let mut module = Vec::new();
        module.extend_from_slice(&build_directory_message(
            0x01,
            KIND_SRG,
            &[
                build_binding("app", KIND_DIR, 0x10, None),
                build_binding("boot.txt", KIND_FIL, 0x20, Some(5)),
            ],
        ));
        module.extend_from_slice(&build_file_message(0x20, b"hello"));

        create_filesystem_dentries(&root, &stepfather, &module).unwrap();

        assert_eq!(root.inode(), 0x01);
        let app = fs::get_child(&root, "app").unwrap();
        assert_eq!(app.inode(), 0x10);
        let file = fs::get_child(&root, "boot.txt").unwrap();
        assert_eq!(file.inode(), 0x20);
        assert_eq!(file.contents(), b"hello");
        assert!(stepfather.children().is_empty());
    }

    #[test]
    fn forward_reference_is_staged_then_reparented() {
        let root = Dentry::new_detached_root("0x0001");
        let stepfather = Dentry::new_detached_root("stepfather");

        /* A directory message for a parent (0x10) nobody has seen yet */
        let mut module = Vec::new();
        module.extend_from_slice(&build_directory_message(
            0x10,
            KIND_DIR,
            &[build_binding("late", KIND_DIR, 0x42, None)],
        ));
        create_filesystem_dentries(&root, &stepfather, &module).unwrap();

        /* The child waits under the staging parent */
        let staged = fs::get_child(&stepfather, "late").unwrap();
        assert_eq!(staged.parent_hint(), Some(0x10));
        assert_eq!(reparent_orphaned_dentries(&root, &stepfather, false), 0);
        assert!(fs::get_child(&stepfather, "late").is_some());

        /* The gateway names 0x10; afterwards the orphan must move home */
        let mut gateway = Vec::new();
        gateway.extend_from_slice(&build_directory_message(
            0x01,
            KIND_SRG,
            &[build_binding("app", KIND_DIR, 0x10, None)],
        ));
        create_filesystem_dentries(&root, &stepfather, &gateway).unwrap();
        reparent_orphaned_dentries(&root, &stepfather, true);

        let app = fs::get_child(&root, "app").unwrap();
        let late = fs::get_child(&app, "late").unwrap();
        assert_eq!(late.inode(), 0x42);
        assert!(stepfather.children().is_empty());
    }

    #[test]
    fn unresolved_orphans_are_discarded_after_the_full_pass() {
        let root = Dentry::new_detached_root("0x0001");
        let stepfather = Dentry::new_detached_root("stepfather");

        let mut module = Vec::new();
        module.extend_from_slice(&build_directory_message(
            0x99,
            KIND_DIR,
            &[build_binding("lost", KIND_DIR, 0x42, None)],
        ));
        create_filesystem_dentries(&root, &stepfather, &module).unwrap();
        assert_eq!(reparent_orphaned_dentries(&root, &stepfather, true), 1);
        assert!(stepfather.children().is_empty());
    }

    #[test]
    fn file_message_before_binding_is_adopted() {
        let root = Dentry::new_detached_root("0x0001");
        let stepfather = Dentry::new_detached_root("stepfather");

        let mut module = Vec::new();
        module.extend_from_slice(&build_file_message(0x20, b"early"));
        module.extend_from_slice(&build_directory_message(
            0x01,
            KIND_SRG,
            &[build_binding("early.txt", KIND_FIL, 0x20, Some(5))],
        ));
        create_filesystem_dentries(&root, &stepfather, &module).unwrap();

        let file = fs::get_child(&root, "early.txt").unwrap();
        assert_eq!(file.contents(), b"early");
    }
}
