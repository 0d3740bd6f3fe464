//! Structure-specific PSI table parsers and their dispatch registry.
//!
//! A parser is chosen by a PID registered at runtime (a PMT PID announced by
//! the PAT, an elementary PID tagged for DSM-CC carriage) or, failing that,
//! by table_id with the PID as a secondary discriminator: table_ids 0x73
//! (TOT) and 0x3B (DII) are ambiguous without PID context.

pub mod eit;
pub mod nit;
pub mod pat;
pub mod pmt;
pub mod sdt;
pub mod sdtt;
pub mod tot;

use enum_dispatch::enum_dispatch;

use crate::dsmcc::Dsmcc;
use crate::fs;
use crate::psi::{PsiHeader, TableVersion};
use crate::{Demuxer, Result};

use self::eit::Eit;
use self::nit::Nit;
use self::pat::Pat;
use self::pmt::Pmt;
use self::sdt::Sdt;
use self::sdtt::Sdtt;
use self::tot::Tot;

/// One table parser invocation: a complete, CRC-valid section.
#[enum_dispatch]
pub trait TableParser {
    fn parse(&self, demux: &mut Demuxer, pid: u16, payload: &[u8]) -> Result<()>;
}

/// The registrable parsers.
#[enum_dispatch(TableParser)]
#[derive(Debug, Clone, Copy)]
pub enum PsiParser {
    Pat(Pat),
    Pmt(Pmt),
    Nit(Nit),
    Sdt(Sdt),
    Sdtt(Sdtt),
    Tot(Tot),
    Eit(Eit),
    Dsmcc(Dsmcc),
}

struct ParserRow {
    table_id: u8,
    /// -1 matches any PID.
    pid: i32,
    parser: PsiParser,
}

const PARSER_TABLE: &[ParserRow] = &[
    ParserRow {
        table_id: crate::demux::TS_PAT_TABLE_ID,
        pid: crate::demux::TS_PAT_PID as i32,
        parser: PsiParser::Pat(Pat),
    },
    ParserRow {
        table_id: crate::demux::TS_PMT_TABLE_ID,
        pid: -1,
        parser: PsiParser::Pmt(Pmt),
    },
    ParserRow {
        table_id: crate::demux::TS_NIT_TABLE_ID,
        pid: crate::demux::TS_NIT_PID as i32,
        parser: PsiParser::Nit(Nit),
    },
    ParserRow {
        table_id: crate::demux::TS_SDT_TABLE_ID,
        pid: crate::demux::TS_SDT_PID as i32,
        parser: PsiParser::Sdt(Sdt),
    },
    ParserRow {
        table_id: crate::demux::TS_TOT_TABLE_ID,
        pid: -1,
        parser: PsiParser::Tot(Tot),
    },
    ParserRow {
        table_id: crate::demux::TS_SDTT_TABLE_ID,
        pid: crate::demux::TS_SDTT1_PID as i32,
        parser: PsiParser::Sdtt(Sdtt),
    },
    ParserRow {
        table_id: crate::demux::TS_SDTT_TABLE_ID,
        pid: crate::demux::TS_SDTT2_PID as i32,
        parser: PsiParser::Sdtt(Sdtt),
    },
];

/// Chooses a parser for a completed section: runtime-registered PIDs first,
/// then the static (table_id, pid) rows, then the EIT table_id range.
pub(crate) fn get_psi_parser(demux: &Demuxer, pid: u16, table_id: u8) -> Option<PsiParser> {
    if let Some(parser) = demux.psi_parsers.get(&pid) {
        return Some(*parser);
    }
    for row in PARSER_TABLE {
        if table_id == row.table_id && (row.pid == -1 || row.pid == pid as i32) {
            return Some(row.parser);
        }
    }
    if (crate::demux::TS_EIT_PF_TABLE_ID..=crate::demux::TS_EIT_LAST_TABLE_ID).contains(&table_id)
    {
        return Some(PsiParser::Eit(Eit));
    }
    None
}

/// Common version gate: discard when current_next_indicator is unset or the
/// installed version equals the incoming one.
pub(crate) fn version_unchanged(demux: &Demuxer, inode: u64, header: &PsiHeader) -> bool {
    !header.current_next_indicator
        || demux
            .tables
            .get(&inode)
            .map_or(false, |current| current.version_number == header.version_number)
}

/// Installs a freshly populated version subtree: migrates long-lived
/// children out of the superseded version, disposes what remains of it and
/// replaces the hash-map entry.
pub(crate) fn install_version(
    demux: &mut Demuxer,
    inode: u64,
    version_number: u8,
    table_dentry: std::sync::Arc<crate::fs::Dentry>,
    version_dentry: std::sync::Arc<crate::fs::Dentry>,
) {
    if let Some(old) = demux.tables.remove(&inode) {
        if !std::sync::Arc::ptr_eq(&old.version_dentry, &version_dentry) {
            fs::migrate_children(&old.version_dentry, &version_dentry);
            fs::dispose_children(&old.version_dentry);
        }
    }
    demux.tables.insert(
        inode,
        TableVersion {
            version_number,
            table_dentry,
            version_dentry,
        },
    );
}
