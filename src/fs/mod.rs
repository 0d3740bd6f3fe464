//! In-memory filesystem tree materialised by the table parsers.
//!
//! The tree is single-rooted. Dentries are shared between the parser thread
//! and the filesystem binding; every mutable field lives behind the per-dentry
//! mutex. Parent links are weak, so disposing a subtree is detaching it from
//! its parent and letting the strong child links unwind.

pub mod xattr;

use std::sync::{Arc, Weak};
use std::time::{SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;

use self::xattr::{Xattr, XATTR_FORMAT, XATTR_FORMAT_BIN, XATTR_FORMAT_NUMBER};
use crate::fifo::Fifo;
use crate::{DemuxError, Result};

/// Well-known names in the exposed namespace.
pub mod names {
    pub const PAT: &str = "PAT";
    pub const PMT: &str = "PMT";
    pub const NIT: &str = "NIT";
    pub const SDT: &str = "SDT";
    pub const SDTT: &str = "SDTT";
    pub const TOT: &str = "TOT";
    pub const EIT: &str = "EIT";
    pub const AIT: &str = "AIT";
    pub const DII: &str = "DII";
    pub const DSI: &str = "DSI";
    pub const DDB: &str = "DDB";
    pub const STREAMS: &str = "Streams";
    pub const PROGRAMS: &str = "Programs";
    pub const CURRENT: &str = "Current";
    pub const PRIMARY: &str = "Primary";
    pub const SECONDARY: &str = "Secondary";
    pub const BROKEN_SYMLINK: &str = "Broken";
    pub const PES_FIFO: &str = "pes";
    pub const ES_FIFO: &str = "es";

    pub const VIDEO_STREAMS: &str = "VideoStreams";
    pub const AUDIO_STREAMS: &str = "AudioStreams";
    pub const ONE_SEG_VIDEO_STREAMS: &str = "OneSegVideoStreams";
    pub const ONE_SEG_AUDIO_STREAMS: &str = "OneSegAudioStreams";
    pub const CLOSED_CAPTION_STREAMS: &str = "ClosedCaptionStreams";
    pub const SUPERIMPOSED_STREAMS: &str = "SuperimposedStreams";
    pub const OBJECT_CAROUSEL_STREAMS: &str = "ObjectCarouselStreams";
    pub const DATA_CAROUSEL_STREAMS: &str = "DataCarouselStreams";
    pub const EVENT_MESSAGE_STREAMS: &str = "EventMessageStreams";
    pub const MPE_STREAMS: &str = "MpeStreams";
    pub const RESERVED_STREAMS: &str = "ReservedStreams";
}

/// Node kind, fixed at creation time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DentryKind {
    Directory,
    File,
    Symlink,
    AudioFifo,
    VideoFifo,
}

impl DentryKind {
    pub fn is_fifo(self) -> bool {
        matches!(self, DentryKind::AudioFifo | DentryKind::VideoFifo)
    }

    /// UNIX mode bits for the filesystem binding. Everything is read-only.
    pub fn mode(self) -> u32 {
        match self {
            DentryKind::Directory => 0o040555,
            DentryKind::File => 0o100444,
            DentryKind::Symlink => 0o120777,
            DentryKind::AudioFifo | DentryKind::VideoFifo => 0o010444,
        }
    }
}

struct DentryInner {
    inode: u64,
    name: String,
    atime: u64,
    ctime: u64,
    mtime: u64,
    refcount: u32,
    /// File contents, or the target string for symlinks.
    contents: Vec<u8>,
    xattrs: Vec<Xattr>,
    parent: Weak<Dentry>,
    children: Vec<Arc<Dentry>>,
    fifo: Option<Arc<Fifo>>,
    /// Remembered parent inode for carousel children staged on the
    /// stepfather before their real parent has been seen.
    parent_hint: Option<u64>,
}

/// A node of the tree.
pub struct Dentry {
    kind: DentryKind,
    inner: Mutex<DentryInner>,
}

fn now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

impl Dentry {
    fn new(kind: DentryKind, name: &str, inode: u64) -> Arc<Dentry> {
        let t = now();
        Arc::new(Dentry {
            kind,
            inner: Mutex::new(DentryInner {
                inode,
                name: name.to_owned(),
                atime: t,
                ctime: t,
                mtime: t,
                refcount: 0,
                contents: Vec::new(),
                xattrs: Vec::new(),
                parent: Weak::new(),
                children: Vec::new(),
                fifo: None,
                parent_hint: None,
            }),
        })
    }

    /// Creates the root dentry ("/", inode 1).
    pub fn new_root() -> Arc<Dentry> {
        Dentry::new(DentryKind::Directory, "/", 1)
    }

    /// Creates a detached directory serving as a staging root, e.g. the
    /// carousel stepfather.
    pub fn new_detached_root(name: &str) -> Arc<Dentry> {
        Dentry::new(DentryKind::Directory, name, 0)
    }

    pub fn kind(&self) -> DentryKind {
        self.kind
    }

    pub fn mode(&self) -> u32 {
        self.kind.mode()
    }

    pub fn name(&self) -> String {
        self.inner.lock().name.clone()
    }

    pub fn set_name(&self, name: &str) {
        self.inner.lock().name = name.to_owned();
    }

    pub fn inode(&self) -> u64 {
        self.inner.lock().inode
    }

    pub fn set_inode(&self, inode: u64) {
        self.inner.lock().inode = inode;
    }

    pub fn size(&self) -> usize {
        self.inner.lock().contents.len()
    }

    pub fn contents(&self) -> Vec<u8> {
        self.inner.lock().contents.clone()
    }

    pub fn set_contents(&self, contents: &[u8]) {
        let mut inner = self.inner.lock();
        inner.contents = contents.to_owned();
        inner.mtime = now();
    }

    /// Preallocates the contents buffer; used when a carousel binding
    /// announces a file size before the file message arrives.
    pub fn resize_contents(&self, size: usize) {
        self.inner.lock().contents.resize(size, 0);
    }

    /// Copies file bytes into an already-sized contents buffer.
    pub fn fill_contents(&self, data: &[u8]) {
        let mut inner = self.inner.lock();
        let n = inner.contents.len().min(data.len());
        inner.contents[..n].copy_from_slice(&data[..n]);
        inner.mtime = now();
    }

    pub fn parent(&self) -> Option<Arc<Dentry>> {
        self.inner.lock().parent.upgrade()
    }

    pub fn children(&self) -> Vec<Arc<Dentry>> {
        self.inner.lock().children.clone()
    }

    pub fn fifo(&self) -> Option<Arc<Fifo>> {
        self.inner.lock().fifo.clone()
    }

    pub fn parent_hint(&self) -> Option<u64> {
        self.inner.lock().parent_hint
    }

    pub fn set_parent_hint(&self, hint: Option<u64>) {
        self.inner.lock().parent_hint = hint;
    }

    pub fn set_times(&self, t: u64) {
        let mut inner = self.inner.lock();
        inner.atime = t;
        inner.ctime = t;
        inner.mtime = t;
    }

    pub fn times(&self) -> (u64, u64, u64) {
        let inner = self.inner.lock();
        (inner.atime, inner.ctime, inner.mtime)
    }

    /// Refcounting for the binding's open/release pair.
    pub fn open(&self) {
        self.inner.lock().refcount += 1;
    }

    pub fn release(&self) {
        let mut inner = self.inner.lock();
        if inner.refcount > 0 {
            inner.refcount -= 1;
        }
    }

    pub fn refcount(&self) -> u32 {
        self.inner.lock().refcount
    }

    /// Access check for the read-only namespace: any write access fails, and
    /// execute is only valid on directories.
    pub fn access(&self, write: bool, execute: bool) -> Result<()> {
        if write {
            return Err(DemuxError::AccessDenied);
        }
        if execute && self.kind != DentryKind::Directory {
            return Err(DemuxError::AccessDenied);
        }
        Ok(())
    }

    /// Copies file bytes starting at `offset` into `buf`, returning the
    /// amount copied.
    pub fn read_at(&self, offset: usize, buf: &mut [u8]) -> usize {
        let inner = self.inner.lock();
        if offset >= inner.contents.len() {
            return 0;
        }
        let n = buf.len().min(inner.contents.len() - offset);
        buf[..n].copy_from_slice(&inner.contents[offset..offset + n]);
        n
    }

    /// Symlink target.
    pub fn readlink(&self) -> Result<String> {
        if self.kind != DentryKind::Symlink {
            return Err(DemuxError::InvalidArgument);
        }
        Ok(String::from_utf8_lossy(&self.inner.lock().contents).into_owned())
    }

    /// Adds or replaces an attribute. Internal callers may use reserved
    /// names; the binding goes through [`Dentry::setxattr`].
    pub fn add_xattr(&self, name: &str, value: &[u8]) {
        let mut inner = self.inner.lock();
        if let Some(x) = inner.xattrs.iter_mut().find(|x| x.name == name) {
            x.value = value.to_owned();
        } else {
            inner.xattrs.push(Xattr::new(name, value));
        }
    }

    /// setxattr from the binding: user namespace only.
    pub fn setxattr(&self, name: &str, value: &[u8]) -> Result<()> {
        if !name.starts_with("user.") {
            return Err(DemuxError::AccessDenied);
        }
        self.add_xattr(name, value);
        Ok(())
    }

    pub fn getxattr(&self, name: &str) -> Result<Vec<u8>> {
        if !name.starts_with("user.") {
            return Err(DemuxError::AccessDenied);
        }
        self.inner
            .lock()
            .xattrs
            .iter()
            .find(|x| x.name == name)
            .map(|x| x.value.clone())
            .ok_or(DemuxError::NoSuchAttribute)
    }

    pub fn listxattr(&self) -> Vec<String> {
        self.inner
            .lock()
            .xattrs
            .iter()
            .map(|x| x.name.clone())
            .collect()
    }

    pub fn removexattr(&self, name: &str) -> Result<()> {
        if !name.starts_with("user.") {
            return Err(DemuxError::AccessDenied);
        }
        let mut inner = self.inner.lock();
        let before = inner.xattrs.len();
        inner.xattrs.retain(|x| x.name != name);
        if inner.xattrs.len() == before {
            Err(DemuxError::NoSuchAttribute)
        } else {
            Ok(())
        }
    }
}

impl std::fmt::Debug for Dentry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("Dentry")
            .field("kind", &self.kind)
            .field("name", &inner.name)
            .field("inode", &inner.inode)
            .field("size", &inner.contents.len())
            .field("children", &inner.children.len())
            .finish()
    }
}

/// Returns the named child, if any.
pub fn get_child(parent: &Arc<Dentry>, name: &str) -> Option<Arc<Dentry>> {
    parent
        .inner
        .lock()
        .children
        .iter()
        .find(|c| c.name() == name)
        .cloned()
}

fn attach(parent: &Arc<Dentry>, child: Arc<Dentry>) -> Arc<Dentry> {
    {
        let mut child_inner = child.inner.lock();
        child_inner.parent = Arc::downgrade(parent);
    }
    parent.inner.lock().children.push(child.clone());
    child
}

/// Creates a directory under `parent`, or returns the existing child of the
/// same name. Child names are unique within one directory.
pub fn create_directory(parent: &Arc<Dentry>, name: &str) -> Arc<Dentry> {
    if let Some(existing) = get_child(parent, name) {
        return existing;
    }
    attach(parent, Dentry::new(DentryKind::Directory, name, 0))
}

/// Creates a regular file with the given contents and format hint.
pub fn create_file(parent: &Arc<Dentry>, name: &str, contents: &[u8], format: &str) -> Arc<Dentry> {
    if let Some(existing) = get_child(parent, name) {
        existing.set_contents(contents);
        return existing;
    }
    let child = Dentry::new(DentryKind::File, name, 0);
    child.set_contents(contents);
    child.add_xattr(XATTR_FORMAT, format.as_bytes());
    attach(parent, child)
}

/// Creates a file holding a number formatted as hexadecimal text.
pub fn create_file_number(parent: &Arc<Dentry>, name: &str, value: u64) -> Arc<Dentry> {
    create_file(
        parent,
        name,
        format!("{:#x}", value).as_bytes(),
        XATTR_FORMAT_NUMBER,
    )
}

/// Creates a file holding a string with the given format hint.
pub fn create_file_string(
    parent: &Arc<Dentry>,
    name: &str,
    value: &str,
    format: &str,
) -> Arc<Dentry> {
    create_file(parent, name, value.as_bytes(), format)
}

/// Creates a file holding a raw byte buffer.
pub fn create_file_bin(parent: &Arc<Dentry>, name: &str, contents: &[u8]) -> Arc<Dentry> {
    create_file(parent, name, contents, XATTR_FORMAT_BIN)
}

/// Creates a bare file for the carousel: named by the caller, preallocated to
/// `size` bytes, carrying the object key as its inode.
pub fn create_sized_file(parent: &Arc<Dentry>, name: &str, size: usize, inode: u64) -> Arc<Dentry> {
    let child = Dentry::new(DentryKind::File, name, inode);
    child.resize_contents(size);
    child.add_xattr(XATTR_FORMAT, XATTR_FORMAT_BIN.as_bytes());
    attach(parent, child)
}

/// Creates a bare directory carrying an explicit inode (carousel objects).
pub fn create_inode_directory(parent: &Arc<Dentry>, name: &str, inode: u64) -> Arc<Dentry> {
    let child = Dentry::new(DentryKind::Directory, name, inode);
    attach(parent, child)
}

/// Creates a symlink, or repoints an existing one.
pub fn create_symlink(parent: &Arc<Dentry>, name: &str, target: &str) -> Arc<Dentry> {
    if let Some(existing) = get_child(parent, name) {
        if existing.kind() == DentryKind::Symlink {
            existing.set_contents(target.as_bytes());
            return existing;
        }
    }
    let child = Dentry::new(DentryKind::Symlink, name, 0);
    child.set_contents(target.as_bytes());
    attach(parent, child)
}

/// Creates a FIFO node of audio or video flavour with its delivery object.
pub fn create_fifo(parent: &Arc<Dentry>, kind: DentryKind, name: &str) -> Arc<Dentry> {
    debug_assert!(kind.is_fifo());
    if let Some(existing) = get_child(parent, name) {
        return existing;
    }
    let child = Dentry::new(kind, name, 0);
    child.inner.lock().fifo = Some(Arc::new(Fifo::new()));
    attach(parent, child)
}

/// Name of a version directory: `{:#06x}` of the version number.
pub fn version_dir_name(version: u32) -> String {
    format!("{:#06x}", version)
}

/// Creates the `<version_nr>` child of a table directory and repoints the
/// `Current` symlink sibling at it.
pub fn create_version_dir(table: &Arc<Dentry>, version: u32) -> Arc<Dentry> {
    let name = version_dir_name(version);
    let version_dentry = create_directory(table, &name);
    create_symlink(table, names::CURRENT, &name);
    version_dentry
}

/// Resolves the version directory the `Current` symlink points at.
pub fn get_current(table: &Arc<Dentry>) -> Option<Arc<Dentry>> {
    let current = get_child(table, names::CURRENT)?;
    let target = current.readlink().ok()?;
    get_child(table, &target)
}

/// Moves `child` under `new_parent`, dropping it from its previous parent.
pub fn reparent(child: &Arc<Dentry>, new_parent: &Arc<Dentry>) {
    if let Some(old_parent) = child.parent() {
        let mut inner = old_parent.inner.lock();
        inner.children.retain(|c| !Arc::ptr_eq(c, child));
    }
    attach(new_parent, child.clone());
}

/// Migrates long-lived children from a superseded version directory: every
/// child of `old` whose name the new version has not recreated moves to
/// `new`.
pub fn migrate_children(old: &Arc<Dentry>, new: &Arc<Dentry>) {
    for child in old.children() {
        if get_child(new, &child.name()).is_none() {
            reparent(&child, new);
        }
    }
}

/// Disposes everything below `dentry`, keeping the node itself.
pub fn dispose_children(dentry: &Arc<Dentry>) {
    let children = {
        let mut inner = dentry.inner.lock();
        std::mem::take(&mut inner.children)
    };
    for child in children {
        child.inner.lock().parent = Weak::new();
        dispose_children(&child);
    }
}

/// Disposes a subtree in post-order, detaching it from its parent.
pub fn dispose_tree(dentry: &Arc<Dentry>) {
    dispose_children(dentry);
    if let Some(parent) = dentry.parent() {
        let mut inner = parent.inner.lock();
        inner.children.retain(|c| !Arc::ptr_eq(c, dentry));
    }
    dentry.inner.lock().parent = Weak::new();
}

/// Depth-first inode search. Inode 0 marks nodes without a synthetic inode
/// and never matches.
pub fn find_by_inode(start: &Arc<Dentry>, inode: u64) -> Option<Arc<Dentry>> {
    if inode == 0 {
        return None;
    }
    if start.inode() == inode {
        return Some(start.clone());
    }
    for child in start.children() {
        if let Some(found) = find_by_inode(&child, inode) {
            return Some(found);
        }
    }
    None
}

/// Resolves a slash-separated path by descending child links. Intermediate
/// symlinks are followed relative to their containing directory; the final
/// component is returned as-is. A `..` component at the root resolves to
/// the root itself, which makes the `..`-prefixed targets stored in
/// `/Streams` symlinks resolvable.
pub fn lookup_path(base: &Arc<Dentry>, path: &str) -> Option<Arc<Dentry>> {
    let mut cursor = base.clone();
    let components: Vec<&str> = path.split('/').collect();
    for (i, component) in components.iter().enumerate() {
        match *component {
            "" | "." => continue,
            ".." => {
                if let Some(parent) = cursor.parent() {
                    cursor = parent;
                }
            }
            name => {
                let next = get_child(&cursor, name)?;
                let last = i == components.len() - 1;
                if !last && next.kind() == DentryKind::Symlink {
                    cursor = lookup_path(&cursor, &next.readlink().ok()?)?;
                } else {
                    cursor = next;
                }
            }
        }
    }
    Some(cursor)
}

/// Resolves the full pathname of a dentry by walking parent links.
pub fn path_of(dentry: &Arc<Dentry>) -> String {
    let mut components = Vec::new();
    let mut cursor = dentry.clone();
    loop {
        match cursor.parent() {
            Some(parent) => {
                components.push(cursor.name());
                cursor = parent;
            }
            None => break,
        }
    }
    let mut path = String::new();
    for name in components.iter().rev() {
        path.push('/');
        path.push_str(name);
    }
    if path.is_empty() {
        path.push('/');
    }
    path
}

/// Enumerates a directory for the binding.
pub fn readdir(dentry: &Arc<Dentry>) -> Result<Vec<(String, DentryKind)>> {
    if dentry.kind() != DentryKind::Directory {
        return Err(DemuxError::InvalidArgument);
    }
    Ok(dentry
        .children()
        .iter()
        .map(|c| (c.name(), c.kind()))
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn child_names_are_unique() {
        let root = Dentry::new_root();
        let a = create_directory(&root, "A");
        let again = create_directory(&root, "A");
        assert!(Arc::ptr_eq(&a, &again));
        assert_eq!(root.children().len(), 1);
    }

    #[test]
    fn number_files_format_as_hex() {
        let root = Dentry::new_root();
        let f = create_file_number(&root, "pid", 0x100);
        assert_eq!(f.contents(), b"0x100");
        assert_eq!(
            f.getxattr(XATTR_FORMAT).unwrap(),
            XATTR_FORMAT_NUMBER.as_bytes()
        );
    }

    #[test]
    fn version_dir_repoints_current() {
        let root = Dentry::new_root();
        let table = create_directory(&root, "PAT");
        let v1 = create_version_dir(&table, 1);
        assert_eq!(v1.name(), "0x0001");
        assert!(Arc::ptr_eq(&get_current(&table).unwrap(), &v1));

        let v2 = create_version_dir(&table, 2);
        assert!(Arc::ptr_eq(&get_current(&table).unwrap(), &v2));
        assert!(get_child(&table, "0x0001").is_some());
    }

    #[test]
    fn migrate_moves_only_missing_children() {
        let root = Dentry::new_root();
        let old = create_directory(&root, "old");
        let new = create_directory(&root, "new");
        create_directory(&old, "module_01");
        create_file(&old, "table_id", b"0x0", XATTR_FORMAT_NUMBER);
        create_file(&new, "table_id", b"0x0", XATTR_FORMAT_NUMBER);

        migrate_children(&old, &new);
        assert!(get_child(&new, "module_01").is_some());
        assert!(get_child(&old, "module_01").is_none());
        // Recreated by the new version, not migrated.
        assert!(get_child(&old, "table_id").is_some());
    }

    #[test]
    fn dispose_children_keeps_the_node() {
        let root = Dentry::new_root();
        let dir = create_directory(&root, "dir");
        create_directory(&dir, "a");
        create_directory(&dir, "b");
        dispose_children(&dir);
        assert!(dir.children().is_empty());
        assert!(get_child(&root, "dir").is_some());
    }

    #[test]
    fn path_lookup_and_walk_round_trip() {
        let root = Dentry::new_root();
        let a = create_directory(&root, "PMT");
        let b = create_directory(&a, "0x0100");
        let c = create_directory(&b, "0x0001");
        assert_eq!(path_of(&c), "/PMT/0x0100/0x0001");
        let found = lookup_path(&root, "/PMT/0x0100/0x0001").unwrap();
        assert!(Arc::ptr_eq(&found, &c));
        // Leading ".." at the root stays at the root.
        let found = lookup_path(&root, "../PMT/0x0100").unwrap();
        assert!(Arc::ptr_eq(&found, &b));
    }

    #[test]
    fn find_by_inode_skips_unset_inodes() {
        let root = Dentry::new_root();
        let a = create_directory(&root, "a");
        let b = create_inode_directory(&a, "b", 0x42);
        assert!(find_by_inode(&root, 0).is_none());
        assert!(Arc::ptr_eq(&find_by_inode(&root, 0x42).unwrap(), &b));
    }

    #[test]
    fn xattr_namespace_is_enforced() {
        let root = Dentry::new_root();
        let f = create_file(&root, "f", b"", XATTR_FORMAT_BIN);
        assert!(matches!(
            f.setxattr("system.posix_acl", b""),
            Err(DemuxError::AccessDenied)
        ));
        f.setxattr("user.note", b"hello").unwrap();
        assert_eq!(f.getxattr("user.note").unwrap(), b"hello");
        assert!(f.listxattr().contains(&"user.note".to_owned()));
        f.removexattr("user.note").unwrap();
        assert!(matches!(
            f.getxattr("user.note"),
            Err(DemuxError::NoSuchAttribute)
        ));
    }

    #[test]
    fn write_access_is_denied() {
        let root = Dentry::new_root();
        let f = create_file(&root, "f", b"x", XATTR_FORMAT_BIN);
        assert!(matches!(f.access(true, false), Err(DemuxError::AccessDenied)));
        assert!(matches!(f.access(false, true), Err(DemuxError::AccessDenied)));
        assert!(f.access(false, false).is_ok());
        assert!(root.access(false, true).is_ok());
    }
}
