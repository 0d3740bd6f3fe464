//! Per-PID reassembly buffers for PSI sections and PES packets.

use log::warn;

use crate::config::ReportMask;
use crate::pes::{identify_stream_id, PesStream};

/// Hard limit for PSI sections: max section_length is 4093 plus the 3
/// preamble bytes.
pub const MAX_SECTION_SIZE: usize = 4096;

/// Reassembly buffer owned by one PID. Lives for the entire session; resets
/// shrink the size back to zero without releasing the capacity.
pub struct SectionBuffer {
    pid: u16,
    data: Vec<u8>,
    max_size: usize,
    /// continuity_counter of the last contributing packet.
    pub continuity_counter: u8,
    holds_pes_data: bool,
    pes_unbounded_data: bool,
}

impl SectionBuffer {
    /// Allocates a buffer. PSI buffers above [`MAX_SECTION_SIZE`] are
    /// refused. A PES buffer sized zero is an unbounded video buffer.
    pub fn new(pid: u16, size: usize, pes_data: bool) -> Option<SectionBuffer> {
        if size > MAX_SECTION_SIZE && !pes_data {
            warn!("section size ({}) > hard limit ({})", size, MAX_SECTION_SIZE);
            return None;
        }
        let (size, unbounded) = if size == 0 && pes_data {
            (MAX_SECTION_SIZE, true)
        } else {
            (size, false)
        };
        Some(SectionBuffer {
            pid,
            data: Vec::with_capacity(size),
            max_size: size,
            continuity_counter: 0,
            holds_pes_data: pes_data,
            pes_unbounded_data: unbounded,
        })
    }

    pub fn pid(&self) -> u16 {
        self.pid
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.max_size
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Appends section or PES bytes. PSI growth is clamped at
    /// [`MAX_SECTION_SIZE`]; PES buffers grow on demand.
    pub fn append(&mut self, buf: &[u8]) -> usize {
        if buf.is_empty() {
            return self.data.len();
        }
        let mut to_write = buf.len();
        if self.data.is_empty() {
            if buf.len() > self.max_size {
                // Reusing the slot
                self.max_size = buf.len();
            }
        } else {
            if self.data.len() + buf.len() > MAX_SECTION_SIZE && !self.holds_pes_data {
                to_write = MAX_SECTION_SIZE - self.data.len();
            }
            if self.data.len() + to_write > self.max_size {
                let required = self.data.len() + to_write;
                self.max_size = required.max(MAX_SECTION_SIZE);
            }
        }
        self.data.extend_from_slice(&buf[..to_write]);
        self.data.len()
    }

    /// True when the buffer holds exactly `section_length + 3` bytes; the
    /// size is truncated to the declared end so trailing bytes of the last
    /// packet never leak into the section.
    pub fn contains_full_psi_section(&mut self) -> bool {
        if self.data.len() < 4 {
            return false;
        }
        let section_length =
            (((self.data[1] as usize) << 8 | self.data[2] as usize) & 0x0fff) + 3;
        if self.data.len() < section_length {
            if section_length > MAX_SECTION_SIZE {
                warn!(
                    "bad section packet: curr_size={} max_size={} section_length={} [pid {:#x} table_id {:#x}]",
                    self.data.len(),
                    self.max_size,
                    section_length - 3,
                    self.pid,
                    self.data[0]
                );
                self.reset();
            }
            return false;
        }
        self.data.truncate(section_length);
        true
    }

    /// True when the buffer has accumulated `pes_packet_length + 6` bytes.
    /// Unbounded buffers never complete here; they are flushed on the next
    /// payload unit start instead.
    pub fn contains_full_pes_section(&mut self) -> bool {
        if self.data.len() < 6 {
            return false;
        }
        if self.pes_unbounded_data {
            return false;
        }
        let packet_length = ((self.data[4] as usize) << 8 | self.data[5] as usize) + 6;
        if self.data.len() < packet_length {
            return false;
        }
        self.data.truncate(packet_length);
        true
    }

    /// Inspects the buffered PES header: a declared length of zero marks the
    /// buffer unbounded, which the standard permits only for video streams.
    pub fn is_unbounded(&mut self) -> bool {
        if self.pes_unbounded_data {
            return true;
        }
        if self.holds_pes_data && self.data.len() > 6 {
            let stream_id = self.data[3];
            let packet_length = (self.data[4] as u16) << 8 | self.data[5] as u16;
            if packet_length == 0 {
                if identify_stream_id(stream_id) == PesStream::Video {
                    self.pes_unbounded_data = true;
                    return true;
                }
                warn!(
                    "unbounded buffer size in non-video stream with stream_id {:#x}",
                    stream_id
                );
            }
        }
        false
    }

    /// Resets the size to zero. The capacity survives for the next section.
    pub fn reset(&mut self) {
        self.data.clear();
        self.pes_unbounded_data = false;
    }

    /// Takes the assembled bytes out, resetting the buffer.
    pub fn take(&mut self) -> Vec<u8> {
        let out = self.data.clone();
        self.reset();
        out
    }

    /// Checks the continuity_counter transition for the next packet on this
    /// PID. A repeated counter is tolerated as a duplicate packet (and is a
    /// no-op); any gap resets the buffer.
    pub fn continuity_ok(&mut self, this_cc: u8, psi: bool, report: ReportMask) -> bool {
        let last_cc = self.continuity_counter;
        if last_cc == this_cc {
            // The standard allows up to 2 sequential packets with the same
            // continuity counter.
            return false;
        }
        if !self.data.is_empty() && (this_cc != (last_cc + 1) % 16) {
            if report.continuity() {
                warn!(
                    "{} continuity error on pid={}: last counter={}, current counter={}",
                    if psi { "PSI" } else { "PES" },
                    self.pid,
                    last_cc,
                    this_cc
                );
            }
            self.reset();
            return false;
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn psi_buffer_respects_the_hard_limit() {
        assert!(SectionBuffer::new(0x100, MAX_SECTION_SIZE + 1, false).is_none());
        assert!(SectionBuffer::new(0x100, MAX_SECTION_SIZE, false).is_some());
    }

    #[test]
    fn psi_size_never_exceeds_capacity_bound() {
        let mut buffer = SectionBuffer::new(0x100, 16, false).unwrap();
        buffer.append(&[0u8; 8]);
        buffer.append(&[0u8; MAX_SECTION_SIZE]);
        assert!(buffer.len() <= MAX_SECTION_SIZE);
        assert!(buffer.len() <= buffer.capacity().max(MAX_SECTION_SIZE));
    }

    #[test]
    fn full_psi_section_is_detected_and_truncated() {
        // table_id 0, section_length 5: total 8 bytes.
        let mut buffer = SectionBuffer::new(0, 8, false).unwrap();
        buffer.append(&[0x00, 0xb0, 0x05, 1, 2, 3, 4]);
        assert!(!buffer.contains_full_psi_section());
        buffer.append(&[5, 0xff, 0xff]);
        assert!(buffer.contains_full_psi_section());
        assert_eq!(buffer.len(), 8);
    }

    #[test]
    fn unbounded_pes_is_video_only() {
        // Video stream_id 0xe0, length 0.
        let mut buffer = SectionBuffer::new(0x200, 64, true).unwrap();
        buffer.append(&[0, 0, 1, 0xe0, 0, 0, 0xaa, 0xbb]);
        assert!(buffer.is_unbounded());
        assert!(!buffer.contains_full_pes_section());

        // Audio stream_id 0xc0, length 0: not unbounded.
        let mut buffer = SectionBuffer::new(0x201, 64, true).unwrap();
        buffer.append(&[0, 0, 1, 0xc0, 0, 0, 0xaa, 0xbb]);
        assert!(!buffer.is_unbounded());
    }

    #[test]
    fn continuity_gap_resets_the_buffer() {
        let mut buffer = SectionBuffer::new(0x100, 32, false).unwrap();
        buffer.append(&[0x00, 0xb0, 0x20, 1, 2, 3]);
        buffer.continuity_counter = 5;
        assert!(!buffer.continuity_ok(7, true, ReportMask::ALL));
        assert!(buffer.is_empty());
    }

    #[test]
    fn duplicate_counter_is_a_tolerated_no_op() {
        let mut buffer = SectionBuffer::new(0x100, 32, false).unwrap();
        buffer.append(&[0x00, 0xb0, 0x20, 1, 2, 3]);
        buffer.continuity_counter = 5;
        assert!(!buffer.continuity_ok(5, true, ReportMask::ALL));
        // Duplicate does not reset.
        assert!(!buffer.is_empty());
    }

    #[test]
    fn counter_wraps_at_sixteen() {
        let mut buffer = SectionBuffer::new(0x100, 32, false).unwrap();
        buffer.append(&[0x00]);
        buffer.continuity_counter = 15;
        assert!(buffer.continuity_ok(0, true, ReportMask::NONE));
    }
}
