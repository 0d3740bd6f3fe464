//! Time Offset Table (table_id 0x73).
//!
//! Unlike the versioned tables the TOT keeps a single `/TOT/Current`
//! subtree which is refreshed in place as new sections arrive.

use log::debug;

use super::TableParser;
use crate::descriptors::{descriptors_count, DescriptorContext};
use crate::fs::xattr::XATTR_FORMAT_STRING_AND_NUMBER;
use crate::fs::{self, names};
use crate::psi::{table_inode, TableVersion};
use crate::{DemuxError, Demuxer, Result};

#[derive(Debug, Clone, Copy)]
pub struct Tot;

/// Decodes a 40-bit MJD + BCD wall-clock value into
/// `YYYY-MM-DD HH:MM:SS`.
pub(crate) fn decode_mjd_time(utc: u64) -> String {
    let hh = ((utc & 0xf00000) >> 20) * 10 + ((utc & 0x0f0000) >> 16);
    let mm = ((utc & 0x00f000) >> 12) * 10 + ((utc & 0x000f00) >> 8);
    let ss = ((utc & 0x0000f0) >> 4) * 10 + (utc & 0x00000f);

    let mjd = (utc >> 24) as u32;
    let (mut y, mut m, mut d) = (0u32, 0u32, 0u32);
    if mjd != 0 {
        let yy = ((mjd as f64 - 15078.2) / 365.25) as u32;
        let mm_ = ((mjd as f64 - 14956.1 - (yy as f64 * 365.25).floor()) / 30.6001) as u32;
        let dd = mjd - 14956 - (yy as f64 * 365.25) as u32 - (mm_ as f64 * 30.6001) as u32;
        let k = if mm_ == 14 || mm_ == 15 { 1 } else { 0 };
        y = yy + k;
        m = mm_ - 1 - k * 12;
        d = dd;
    }

    format!(
        "{:04}-{:02}-{:02} {:02}:{:02}:{:02}",
        if y != 0 { y + 1900 } else { 0 },
        m,
        d,
        hh,
        mm,
        ss
    )
}

/// Decodes a 24-bit BCD duration into `HH:MM:SS`.
pub(crate) fn decode_bcd_duration(duration: u32) -> String {
    let hh = ((duration & 0xf00000) >> 20) * 10 + ((duration & 0x0f0000) >> 16);
    let mm = ((duration & 0x00f000) >> 12) * 10 + ((duration & 0x000f00) >> 8);
    let ss = ((duration & 0x0000f0) >> 4) * 10 + (duration & 0x00000f);
    format!("{:02}:{:02}:{:02}", hh, mm, ss)
}

impl TableParser for Tot {
    fn parse(&self, demux: &mut Demuxer, pid: u16, payload: &[u8]) -> Result<()> {
        if payload.len() < 10 {
            return Err(DemuxError::ShortPayload {
                context: "TOT fixed prefix",
                expected: 10,
                found: payload.len(),
            });
        }
        let table_id = payload[0];
        let section_syntax_indicator = (payload[1] >> 7) & 0x01;
        let section_length = ((payload[1] as u16) << 8 | payload[2] as u16) & 0x0fff;

        let utc3_time = (payload[3] as u64) << 32
            | (payload[4] as u64) << 24
            | (payload[5] as u64) << 16
            | (payload[6] as u64) << 8
            | payload[7] as u64;
        let descriptors_loop_length =
            (((payload[8] as usize) << 8 | payload[9] as usize) & 0x0fff)
                .min(payload.len().saturating_sub(10));
        let num_descriptors = descriptors_count(&payload[10..], descriptors_loop_length);

        debug!(
            "TOT parser: pid={:#x}, table_id={:#x}, time={:#x}",
            pid, table_id, utc3_time
        );

        let tot_dir = fs::create_directory(&demux.root.clone(), names::TOT);
        let current = fs::create_directory(&tot_dir, names::CURRENT);

        fs::create_file_number(&current, "table_id", table_id as u64);
        fs::create_file_number(
            &current,
            "section_syntax_indicator",
            section_syntax_indicator as u64,
        );
        fs::create_file_number(&current, "section_length", section_length as u64);
        fs::create_file_number(
            &current,
            "descriptors_loop_length",
            descriptors_loop_length as u64,
        );

        /* Decoded UTC-3 time string plus the hex original */
        let described = format!("{} [{:#x}]", decode_mjd_time(utc3_time), utc3_time);
        fs::create_file_string(&current, "utc3_time", &described, XATTR_FORMAT_STRING_AND_NUMBER);

        demux.ts_descriptors.parse(
            &payload[10..10 + descriptors_loop_length],
            num_descriptors,
            &current,
            &DescriptorContext::default(),
        );

        let inode = table_inode(pid, table_id);
        demux.tables.entry(inode).or_insert(TableVersion {
            version_number: 0,
            table_dentry: tot_dir,
            version_dentry: current,
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mjd_epoch_examples_decode() {
        // ETSI EN 300 468 annex C example: MJD 45218 = 1982-09-06, 12:45:00.
        let utc = (45218u64 << 24) | 0x124500;
        assert_eq!(decode_mjd_time(utc), "1982-09-06 12:45:00");
    }

    #[test]
    fn bcd_duration_decodes() {
        assert_eq!(decode_bcd_duration(0x013045), "01:30:45");
    }

    #[test]
    fn zero_mjd_keeps_a_zero_date() {
        assert_eq!(decode_mjd_time(0x124500), "0000-00-00 12:45:00");
    }
}
