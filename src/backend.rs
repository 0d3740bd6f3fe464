//! Input backends producing fixed-size transport stream packets, plus the
//! parser driver loop.

use std::fs::File;
use std::io::{ErrorKind, Read, Seek, SeekFrom};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use log::{debug, warn};

use crate::demux::TS_SYNC_BYTE;
use crate::{DemuxError, Demuxer, Result};

/// Accepted packet sizes. Trailing bytes beyond 188 are error correction.
pub const TS_PACKET_SIZES: [u8; 3] = [188, 204, 208];

/// Contract every input backend implements. The required operations
/// (construction, teardown, `read`, `packet`, `keep_alive`) cannot be
/// absent: construction is the backend's own constructor, teardown is
/// [`Drop`], and the rest are trait methods.
pub trait Backend: Send {
    /// Pulls the next packet into the internal buffer. `Ok(false)` signals
    /// a clean end of stream.
    fn read(&mut self) -> Result<bool>;

    /// The packet produced by the last successful [`Backend::read`].
    fn packet(&self) -> &[u8];

    /// Packet size this backend produces: 188, 204 or 208 bytes.
    fn packet_size(&self) -> u8;

    /// Whether the backend can still produce packets.
    fn keep_alive(&self) -> bool;

    /// Tuner backends accept a frequency; others ignore it.
    fn set_frequency(&mut self, _frequency: u32) -> Result<()> {
        Ok(())
    }
}

/// Checks five consecutive candidate packet boundaries for the sync byte.
fn search_sync_byte(file: &mut File, packet_size: u8) -> Result<bool> {
    let offset = file.seek(SeekFrom::Current(0))?;
    let mut checked = 0;
    let mut found = true;
    for _ in 0..5 {
        let mut byte = [0u8; 1];
        match file.read(&mut byte)? {
            0 => break,
            _ => {
                if byte[0] != TS_SYNC_BYTE {
                    found = false;
                    break;
                }
                checked += 1;
                file.seek(SeekFrom::Current(packet_size as i64 - 1))?;
            }
        }
    }
    file.seek(SeekFrom::Start(offset))?;
    Ok(found && checked > 0)
}

/// Backend reading packets from a transport stream dump on disk.
pub struct FileBackend {
    file: File,
    packet: Vec<u8>,
    packet_size: u8,
    fileloop: bool,
    eof: bool,
}

impl FileBackend {
    /// Opens a capture file, probing for 188, 204 and 208-byte packets.
    pub fn open<P: AsRef<Path>>(path: P, fileloop: bool) -> Result<FileBackend> {
        let mut file = File::open(path)?;

        let mut detected = None;
        for &candidate in TS_PACKET_SIZES.iter() {
            if search_sync_byte(&mut file, candidate)? {
                detected = Some(candidate);
                break;
            }
        }
        let packet_size = match detected {
            Some(size) => size,
            None => {
                warn!("input does not seem to be a valid transport stream");
                return Err(DemuxError::MalformedPacket("no sync byte found"));
            }
        };
        debug!("detected {}-byte packets", packet_size);

        Ok(FileBackend {
            file,
            packet: vec![0u8; packet_size as usize],
            packet_size,
            fileloop,
            eof: false,
        })
    }
}

impl Backend for FileBackend {
    fn read(&mut self) -> Result<bool> {
        loop {
            match self.file.read_exact(&mut self.packet) {
                Ok(()) => return Ok(true),
                Err(e) if e.kind() == ErrorKind::UnexpectedEof => {
                    if self.fileloop {
                        debug!("rewinding TS file");
                        self.file.seek(SeekFrom::Start(0))?;
                        continue;
                    }
                    self.eof = true;
                    return Ok(false);
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    fn packet(&self) -> &[u8] {
        &self.packet
    }

    fn packet_size(&self) -> u8 {
        self.packet_size
    }

    fn keep_alive(&self) -> bool {
        !self.eof
    }
}

/// Drives the demultiplexer from a backend until the end of stream or the
/// stop flag. Per-packet errors are logged and skipped; only a backend read
/// failure terminates the loop.
pub fn run<B: Backend>(backend: &mut B, demux: &mut Demuxer, stop: &AtomicBool) -> Result<()> {
    while backend.keep_alive() && !stop.load(Ordering::Relaxed) {
        if !backend.read()? {
            break;
        }
        if let Err(e) = demux.process_packet(backend.packet()) {
            match e {
                DemuxError::BackendFatal(_) => return Err(e),
                other => warn!("error processing packet: {}", other),
            }
        }
    }
    Ok(())
}

/// Spawns the packet-parser thread. The caller keeps the tree root (cloned
/// from [`Demuxer::root`] before the move) and joins the handle on
/// shutdown after raising the stop flag.
pub fn spawn_parser_thread<B: Backend + 'static>(
    mut backend: B,
    mut demux: Demuxer,
    stop: Arc<AtomicBool>,
) -> JoinHandle<Result<()>> {
    std::thread::spawn(move || run(&mut backend, &mut demux, &stop))
}
