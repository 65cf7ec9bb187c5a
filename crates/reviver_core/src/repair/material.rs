//! Persisted schema and page summaries used to guide later repairs.
//!
//! A backup records, for every user table, its schema, its root page, its
//! autoincrement sequence and the hash of each leaf page it crawled. When
//! the B-tree interior pages of a table are later destroyed, the mechanic
//! can still find its rows on the recorded leaves.
//!
//! # File layout
//!
//! ```text
//! magic (4) | version (4) | flags (4) | checksum (4) | body length (4) | body
//! ```
//!
//! All integers are big-endian. The checksum is the CRC32 of the stored
//! body. With [`FLAG_ENCRYPTED`] set the stored body is sealed with
//! AES-256-GCM and the first 12 header bytes are authenticated with it.
//!
//! Two generations are kept next to the database: `<db>-first.material`
//! is the newest and `<db>-last.material` the one before it.

use crate::error::{CoreError, CoreResult, ErrorKind};
use crate::repair::checksum::compute_crc32;
use crate::repair::cipher::{CipherKey, MaterialCipher};
use crate::repair::deserialize::{encode_varint, Deserializer};
use crate::repair::pager::sibling;
use fs2::FileExt;
use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Magic number of material files ("RVMT").
pub const MATERIAL_MAGIC: u32 = 0x5256_4d54;

/// Current material format version.
pub const MATERIAL_VERSION: u32 = 1;

/// Flag bit marking an encrypted body.
pub const FLAG_ENCRYPTED: u32 = 1;

const HEADER_SIZE: usize = 20;
const AUTHENTICATED_HEADER: usize = 12;

/// Database-level facts captured at backup time.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MaterialInfo {
    /// Page size of the database.
    pub page_size: u32,
    /// Reserved bytes at the end of each page.
    pub reserved_bytes: u32,
    /// Salts of the WAL the backup read, zero without WAL.
    pub wal_salt: (u32, u32),
    /// Frames already copied back into the main file.
    pub n_backfill: u32,
    /// Root page of `sqlite_sequence`, zero if absent.
    pub sequence_root_page: u32,
}

/// A leaf page recorded by a backup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VerifiedPage {
    /// Page number.
    pub number: u32,
    /// CRC32 of the page bytes.
    pub hash: u32,
}

/// What a material knows about one table.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MaterialContent {
    /// Root page at backup time.
    pub root_page: u32,
    /// Autoincrement sequence, zero if none.
    pub sequence: i64,
    /// `CREATE TABLE` statement.
    pub sql: String,
    /// Index, trigger and view statements belonging to the table.
    pub associated_sqls: Vec<String>,
    /// Leaf pages with their hashes, in crawl order.
    pub verified_pages: Vec<VerifiedPage>,
}

/// A decoded material.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Material {
    /// Database-level facts.
    pub info: MaterialInfo,
    /// Table name to content.
    pub contents: BTreeMap<String, MaterialContent>,
}

/// Returns the path of the newest material of `database`.
#[must_use]
pub fn first_material_path(database: &Path) -> PathBuf {
    sibling(database, "-first.material")
}

/// Returns the path of the previous material of `database`.
#[must_use]
pub fn last_material_path(database: &Path) -> PathBuf {
    sibling(database, "-last.material")
}

fn put_u32(out: &mut Vec<u8>, value: u32) {
    out.extend_from_slice(&value.to_be_bytes());
}

fn put_string(out: &mut Vec<u8>, value: &str) {
    out.extend(encode_varint(value.len() as u64));
    out.extend_from_slice(value.as_bytes());
}

fn read_string(reader: &mut Deserializer<'_>) -> CoreResult<String> {
    let len = usize::try_from(reader.read_varint()?)
        .map_err(|_| CoreError::corruption("material string length overflows"))?;
    let bytes = reader.read_bytes(len)?;
    String::from_utf8(bytes.to_vec()).map_err(|_| CoreError::corruption("material string is not UTF-8"))
}

fn read_count(reader: &mut Deserializer<'_>) -> CoreResult<usize> {
    let count = usize::try_from(reader.read_varint()?)
        .map_err(|_| CoreError::corruption("material count overflows"))?;
    // Every element takes at least one byte.
    if count > reader.remaining() {
        return Err(CoreError::corruption("material count exceeds body"));
    }
    Ok(count)
}

impl Material {
    /// Creates an empty material.
    #[must_use]
    pub fn new(info: MaterialInfo) -> Self {
        Self {
            info,
            contents: BTreeMap::new(),
        }
    }

    fn encode_body(&self) -> Vec<u8> {
        let mut body = Vec::new();
        put_u32(&mut body, self.info.page_size);
        put_u32(&mut body, self.info.reserved_bytes);
        put_u32(&mut body, self.info.wal_salt.0);
        put_u32(&mut body, self.info.wal_salt.1);
        put_u32(&mut body, self.info.n_backfill);
        put_u32(&mut body, self.info.sequence_root_page);

        body.extend(encode_varint(self.contents.len() as u64));
        for (name, content) in &self.contents {
            put_string(&mut body, name);
            put_u32(&mut body, content.root_page);
            body.extend(encode_varint(content.sequence as u64));
            put_string(&mut body, &content.sql);
            body.extend(encode_varint(content.associated_sqls.len() as u64));
            for sql in &content.associated_sqls {
                put_string(&mut body, sql);
            }
            body.extend(encode_varint(content.verified_pages.len() as u64));
            for page in &content.verified_pages {
                body.extend(encode_varint(u64::from(page.number)));
                put_u32(&mut body, page.hash);
            }
        }
        body
    }

    fn decode_body(body: &[u8]) -> CoreResult<Self> {
        let mut reader = Deserializer::new(body);
        let info = MaterialInfo {
            page_size: reader.read_u32()?,
            reserved_bytes: reader.read_u32()?,
            wal_salt: (reader.read_u32()?, reader.read_u32()?),
            n_backfill: reader.read_u32()?,
            sequence_root_page: reader.read_u32()?,
        };

        let mut contents = BTreeMap::new();
        for _ in 0..read_count(&mut reader)? {
            let name = read_string(&mut reader)?;
            let root_page = reader.read_u32()?;
            let sequence = reader.read_varint()? as i64;
            let sql = read_string(&mut reader)?;
            let associated_sqls = (0..read_count(&mut reader)?)
                .map(|_| read_string(&mut reader))
                .collect::<CoreResult<Vec<_>>>()?;
            let verified_pages = (0..read_count(&mut reader)?)
                .map(|_| -> CoreResult<VerifiedPage> {
                    let number = u32::try_from(reader.read_varint()?)
                        .map_err(|_| CoreError::corruption("material page number overflows"))?;
                    Ok(VerifiedPage {
                        number,
                        hash: reader.read_u32()?,
                    })
                })
                .collect::<CoreResult<Vec<_>>>()?;
            contents.insert(
                name,
                MaterialContent {
                    root_page,
                    sequence,
                    sql,
                    associated_sqls,
                    verified_pages,
                },
            );
        }

        if !reader.is_ended() {
            return Err(CoreError::corruption("material body has trailing bytes"));
        }
        Ok(Self { info, contents })
    }

    /// Serializes the material, sealing the body when `key` is given.
    ///
    /// # Errors
    ///
    /// Returns a cipher error if sealing fails.
    pub fn encode(&self, key: Option<&CipherKey>) -> CoreResult<Vec<u8>> {
        let flags = if key.is_some() { FLAG_ENCRYPTED } else { 0 };
        let mut out = Vec::new();
        put_u32(&mut out, MATERIAL_MAGIC);
        put_u32(&mut out, MATERIAL_VERSION);
        put_u32(&mut out, flags);

        let body = match key {
            Some(key) => MaterialCipher::new(key).seal(&self.encode_body(), &out[..AUTHENTICATED_HEADER])?,
            None => self.encode_body(),
        };
        let body_len = u32::try_from(body.len())
            .map_err(|_| CoreError::invalid_operation("material body exceeds 4 GiB"))?;
        put_u32(&mut out, compute_crc32(&body));
        put_u32(&mut out, body_len);
        out.extend(body);
        Ok(out)
    }

    /// Parses a serialized material.
    ///
    /// # Errors
    ///
    /// Returns a corruption error for a bad header, length or checksum, and
    /// a cipher error when an encrypted body has no or the wrong key.
    pub fn decode(data: &[u8], key: Option<&CipherKey>) -> CoreResult<Self> {
        let mut reader = Deserializer::new(data);
        let header = |r: CoreResult<u32>| r.map_err(|_| CoreError::corruption("material header is cut off"));
        let magic = header(reader.read_u32())?;
        let version = header(reader.read_u32())?;
        let flags = header(reader.read_u32())?;
        let checksum = header(reader.read_u32())?;
        let body_len = header(reader.read_u32())? as usize;

        if magic != MATERIAL_MAGIC {
            return Err(CoreError::corruption(format!("bad material magic {magic:#010x}")));
        }
        if version != MATERIAL_VERSION {
            return Err(CoreError::corruption(format!("unsupported material version {version}")));
        }
        if reader.remaining() != body_len {
            return Err(CoreError::corruption(format!(
                "material body is {} bytes, header says {body_len}",
                reader.remaining()
            )));
        }
        let stored = &data[HEADER_SIZE..];
        let actual = compute_crc32(stored);
        if actual != checksum {
            return Err(CoreError::ChecksumMismatch {
                expected: checksum,
                actual,
            });
        }

        if flags & FLAG_ENCRYPTED != 0 {
            let key = key.ok_or_else(|| CoreError::cipher("material is encrypted but no key was given"))?;
            let body = MaterialCipher::new(key).open(stored, &data[..AUTHENTICATED_HEADER])?;
            Self::decode_body(&body)
        } else {
            Self::decode_body(stored)
        }
    }

    /// Writes the material next to `database`, rotating the previous one.
    ///
    /// The new file is written to a temporary path, synced and renamed over
    /// `<db>-first.material` after the old one moved to `<db>-last.material`.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if any file operation fails.
    pub fn save(&self, database: &Path, key: Option<&CipherKey>) -> CoreResult<PathBuf> {
        let data = self.encode(key)?;
        let first = first_material_path(database);
        let last = last_material_path(database);
        let temp = sibling(database, "-material.tmp");

        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(false)
            .open(&temp)?;
        file.lock_exclusive()?;
        file.set_len(0)?;
        file.write_all(&data)?;
        file.sync_all()?;

        if first.exists() {
            fs::rename(&first, &last)?;
        }
        fs::rename(&temp, &first)?;
        FileExt::unlock(&file)?;
        drop(file);
        sync_parent(database)?;

        info!(
            path = %first.display(),
            tables = self.contents.len(),
            bytes = data.len(),
            encrypted = key.is_some(),
            "material saved"
        );
        Ok(first)
    }

    /// Loads the newest readable material of `database`.
    ///
    /// A corrupted newest material falls back to the previous one. Returns
    /// `Ok(None)` when no material file exists.
    ///
    /// # Errors
    ///
    /// Returns the error of the last candidate when none could be decoded,
    /// and stops at the first non-corruption error (I/O, cipher).
    pub fn load(database: &Path, key: Option<&CipherKey>) -> CoreResult<Option<Self>> {
        let mut last_error = None;
        for path in [first_material_path(database), last_material_path(database)] {
            let data = match fs::read(&path) {
                Ok(data) => data,
                Err(error) if error.kind() == std::io::ErrorKind::NotFound => continue,
                Err(error) => return Err(error.into()),
            };
            match Self::decode(&data, key) {
                Ok(material) => {
                    debug!(path = %path.display(), tables = material.contents.len(), "material loaded");
                    return Ok(Some(material));
                }
                Err(error) if error.kind() == ErrorKind::Corruption => {
                    warn!(path = %path.display(), error = %error, "material is corrupted");
                    last_error = Some(error);
                }
                Err(error) => return Err(error),
            }
        }
        last_error.map_or(Ok(None), Err)
    }

    /// Deletes both material generations of `database`.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if an existing file cannot be removed.
    pub fn remove(database: &Path) -> CoreResult<()> {
        for path in [first_material_path(database), last_material_path(database)] {
            match fs::remove_file(&path) {
                Ok(()) => debug!(path = %path.display(), "material removed"),
                Err(error) if error.kind() == std::io::ErrorKind::NotFound => {}
                Err(error) => return Err(error.into()),
            }
        }
        Ok(())
    }

    /// Returns true if any material generation of `database` exists.
    #[must_use]
    pub fn exists(database: &Path) -> bool {
        first_material_path(database).exists() || last_material_path(database).exists()
    }

    /// Returns the number of recorded leaf pages over all tables.
    #[must_use]
    pub fn page_count(&self) -> usize {
        self.contents
            .values()
            .map(|content| content.verified_pages.len())
            .sum()
    }
}

#[cfg(unix)]
fn sync_parent(path: &Path) -> CoreResult<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        File::open(parent)?.sync_all()?;
    }
    Ok(())
}

#[cfg(not(unix))]
fn sync_parent(_path: &Path) -> CoreResult<()> {
    Ok(())
}
