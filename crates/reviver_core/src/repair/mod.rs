//! Recovery of damaged databases from their raw pages.
//!
//! Nothing here goes through the storage engine's query layer to read the
//! source. The [`Pager`] reads pages straight from the database file,
//! overlays committed WAL frames, and hands them out as [`Page`]s. Crawlers
//! walk table B-trees from `sqlite_master` and emit decoded [`Cell`]s; an
//! [`Assembler`] writes them into a fresh target.
//!
//! ## Sessions
//!
//! - [`Backup`] summarizes a healthy database as a [`Material`]: schema,
//!   sequences, and a hash of every table leaf page. Consecutive backups
//!   in one WAL generation extend the previous material
//!   ([`IncrementalMaterial`]).
//! - [`Repairman`] rebuilds a damaged database. It runs the [`Mechanic`]
//!   over a material when one exists, then crawls whatever B-trees are
//!   still reachable, and finally assigns unreachable leaf pages to tables
//!   that lost pages.
//!
//! ## Damage Policy
//!
//! | Damage | Effect |
//! |--------|--------|
//! | Unreadable page, wrong page type, cyclic child | page marked corrupted, crawl continues |
//! | Undecodable cell | cell skipped, counted in the [`Evaluation`] |
//! | Truncated overflow chain | row kept with the columns decoded |
//! | Torn or unsalted WAL frame | WAL cut at the last commit before it |
//! | Unreadable header of the main file | fatal unless the WAL gives a page size |
//!
//! Every session is bounded by the page count: a B-tree walk never visits
//! a page twice.

mod assembler;
mod backup;
mod cell;
mod checksum;
mod cipher;
mod crawler;
mod deserialize;
mod evaluation;
mod full_crawler;
mod incremental;
mod master;
mod material;
mod mechanic;
mod page;
mod pager;
mod repairman;
mod shm;
mod value;
mod wal;

pub use assembler::{quote_identifier, Assembler, ColumnInfo, SqliteAssembler};
pub use backup::{Backup, BackupFilter};
pub use cell::{decode_record, local_payload_size, Cell};
pub use checksum::{compute_crc32, native_checksum, wal_checksum};
pub use cipher::{CipherKey, MaterialCipher, KEY_SIZE, NONCE_SIZE, TAG_SIZE};
pub use crawler::{CrawlStats, Crawlable, CrawlerDelegate, MasterCrawler, SequenceCrawler};
pub use deserialize::{decode_varint, encode_varint, Deserializer};
pub use evaluation::{Evaluation, TableEvaluation};
pub use full_crawler::{Affinity, FullCrawler, OrphanPage, TableShape, ORPHAN_SCORE_THRESHOLD};
pub use incremental::{IncrementalMaterial, MAX_INCREMENTAL_BACKUPS, MAX_INCREMENTAL_PAGES};
pub use master::{is_reserved_name, MasterItem, MasterKind, MASTER_ROOT_PAGE, SEQUENCE_TABLE};
pub use material::{
    first_material_path, last_material_path, Material, MaterialContent, MaterialInfo, VerifiedPage,
    FLAG_ENCRYPTED, MATERIAL_MAGIC, MATERIAL_VERSION,
};
pub use mechanic::Mechanic;
pub use page::{Page, PageType, DATABASE_HEADER_SIZE};
pub use pager::{
    decode_page_size, is_valid_page_size, shm_path, wal_path, PageCodec, Pager, PagerOptions,
    DATABASE_MAGIC,
};
pub use repairman::{RepairError, RepairResult, Repairman};
pub use shm::{Shm, ShmHeader, SHM_HEADER_SIZE, SHM_MIN_SIZE};
pub use value::{SerialType, Value};
pub use wal::{
    Wal, WalFrame, WalHeader, WAL_FRAME_HEADER_SIZE, WAL_HEADER_SIZE, WAL_MAGIC_BE, WAL_MAGIC_LE,
    WAL_VERSION,
};
