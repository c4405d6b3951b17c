//! On-disk cache persistence: a self-describing binary encoding, one file
//! per entry, with directory load/compaction.
//!
//! The source system pickles `CacheEntry` objects directly. Pickle is
//! language-specific and not meaningfully versioned, so this port uses an
//! explicit magic header plus a format version byte followed by
//! length-prefixed fields — the Disk Encoding design note's "stable,
//! versioned binary encoding... so entries survive software upgrades",
//! built the way `tako::body::TakoBody` frames bytes by hand rather than
//! reaching for a generic serializer whose wire format isn't under our
//! control.

use std::collections::BTreeMap;
use std::io::{self, Cursor, Read, Write};
use std::path::{Path, PathBuf};

use crate::cache::entry::CacheEntry;
use crate::cache::key::CacheKey;
use crate::value::Value;

const MAGIC: &[u8; 4] = b"AFC1";
const FORMAT_VERSION: u8 = 1;

fn write_len_prefixed(out: &mut Vec<u8>, bytes: &[u8]) {
    out.extend_from_slice(&(bytes.len() as u64).to_le_bytes());
    out.extend_from_slice(bytes);
}

fn read_len_prefixed(cursor: &mut Cursor<&[u8]>) -> io::Result<Vec<u8>> {
    let mut len_buf = [0u8; 8];
    cursor.read_exact(&mut len_buf)?;
    let len = u64::from_le_bytes(len_buf) as usize;
    let mut buf = vec![0u8; len];
    cursor.read_exact(&mut buf)?;
    Ok(buf)
}

fn encode_value(value: &Value, out: &mut Vec<u8>) {
    match value {
        Value::Null => out.push(0),
        Value::Bool(b) => {
            out.push(1);
            out.push(*b as u8);
        }
        Value::Int(i) => {
            out.push(2);
            out.extend_from_slice(&i.to_le_bytes());
        }
        Value::Float(f) => {
            out.push(3);
            out.extend_from_slice(&f.to_bits().to_le_bytes());
        }
        Value::Str(s) => {
            out.push(4);
            write_len_prefixed(out, s.as_bytes());
        }
        Value::List(items) => {
            out.push(5);
            out.extend_from_slice(&(items.len() as u64).to_le_bytes());
            for item in items {
                encode_value(item, out);
            }
        }
        Value::Map(map) => {
            out.push(6);
            out.extend_from_slice(&(map.len() as u64).to_le_bytes());
            for (k, v) in map {
                write_len_prefixed(out, k.as_bytes());
                encode_value(v, out);
            }
        }
        Value::Bytes(bytes) => {
            out.push(7);
            write_len_prefixed(out, bytes);
        }
    }
}

fn decode_value(cursor: &mut Cursor<&[u8]>) -> io::Result<Value> {
    let mut tag = [0u8; 1];
    cursor.read_exact(&mut tag)?;
    Ok(match tag[0] {
        0 => Value::Null,
        1 => {
            let mut b = [0u8; 1];
            cursor.read_exact(&mut b)?;
            Value::Bool(b[0] != 0)
        }
        2 => {
            let mut b = [0u8; 8];
            cursor.read_exact(&mut b)?;
            Value::Int(i64::from_le_bytes(b))
        }
        3 => {
            let mut b = [0u8; 8];
            cursor.read_exact(&mut b)?;
            Value::Float(f64::from_bits(u64::from_le_bytes(b)))
        }
        4 => {
            let bytes = read_len_prefixed(cursor)?;
            Value::Str(String::from_utf8(bytes).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?)
        }
        5 => {
            let mut len_buf = [0u8; 8];
            cursor.read_exact(&mut len_buf)?;
            let len = u64::from_le_bytes(len_buf);
            let mut items = Vec::with_capacity(len as usize);
            for _ in 0..len {
                items.push(decode_value(cursor)?);
            }
            Value::List(items)
        }
        6 => {
            let mut len_buf = [0u8; 8];
            cursor.read_exact(&mut len_buf)?;
            let len = u64::from_le_bytes(len_buf);
            let mut map = BTreeMap::new();
            for _ in 0..len {
                let key_bytes = read_len_prefixed(cursor)?;
                let key = String::from_utf8(key_bytes).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
                map.insert(key, decode_value(cursor)?);
            }
            Value::Map(map)
        }
        7 => Value::Bytes(read_len_prefixed(cursor)?),
        other => return Err(io::Error::new(io::ErrorKind::InvalidData, format!("unknown value tag {other}"))),
    })
}

/// Encodes a [`CacheEntry`] into the on-disk binary format.
pub fn encode_entry(entry: &CacheEntry) -> Vec<u8> {
    let mut out = Vec::new();
    out.extend_from_slice(MAGIC);
    out.push(FORMAT_VERSION);

    write_len_prefixed(&mut out, entry.key.plugin_name.as_bytes());
    write_len_prefixed(&mut out, entry.key.operation.as_bytes());
    encode_value(&Value::Map(entry.key.parameters.clone()), &mut out);
    encode_value(&entry.data, &mut out);

    out.extend_from_slice(&entry.created_at.to_bits().to_le_bytes());
    match entry.expires_at {
        Some(expires_at) => {
            out.push(1);
            out.extend_from_slice(&expires_at.to_bits().to_le_bytes());
        }
        None => out.push(0),
    }
    out.extend_from_slice(&entry.last_accessed.to_bits().to_le_bytes());
    out.extend_from_slice(&entry.access_count.to_le_bytes());
    out.extend_from_slice(&(entry.byte_size as u64).to_le_bytes());
    out
}

/// Decodes a [`CacheEntry`] previously written by [`encode_entry`].
pub fn decode_entry(bytes: &[u8]) -> io::Result<CacheEntry> {
    let mut cursor = Cursor::new(bytes);

    let mut magic = [0u8; 4];
    cursor.read_exact(&mut magic)?;
    if &magic != MAGIC {
        return Err(io::Error::new(io::ErrorKind::InvalidData, "bad magic header"));
    }
    let mut version = [0u8; 1];
    cursor.read_exact(&mut version)?;
    if version[0] != FORMAT_VERSION {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("unsupported cache format version {}", version[0]),
        ));
    }

    let plugin_name = String::from_utf8(read_len_prefixed(&mut cursor)?)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    let operation = String::from_utf8(read_len_prefixed(&mut cursor)?)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    let parameters = match decode_value(&mut cursor)? {
        Value::Map(map) => map,
        _ => return Err(io::Error::new(io::ErrorKind::InvalidData, "expected map for parameters")),
    };
    let data = decode_value(&mut cursor)?;

    let mut f64_buf = [0u8; 8];
    cursor.read_exact(&mut f64_buf)?;
    let created_at = f64::from_bits(u64::from_le_bytes(f64_buf));

    let mut has_expiry = [0u8; 1];
    cursor.read_exact(&mut has_expiry)?;
    let expires_at = if has_expiry[0] != 0 {
        cursor.read_exact(&mut f64_buf)?;
        Some(f64::from_bits(u64::from_le_bytes(f64_buf)))
    } else {
        None
    };

    cursor.read_exact(&mut f64_buf)?;
    let last_accessed = f64::from_bits(u64::from_le_bytes(f64_buf));

    let mut u64_buf = [0u8; 8];
    cursor.read_exact(&mut u64_buf)?;
    let access_count = u64::from_le_bytes(u64_buf);

    cursor.read_exact(&mut u64_buf)?;
    let byte_size = u64::from_le_bytes(u64_buf) as usize;

    let key = CacheKey::new(plugin_name, operation, parameters);
    Ok(CacheEntry {
        key,
        data,
        created_at,
        expires_at,
        last_accessed,
        access_count,
        byte_size,
    })
}

/// Path to the on-disk file for a given key hex digest.
pub fn entry_path(cache_dir: &Path, key_hex: &str) -> PathBuf {
    cache_dir.join(format!("{key_hex}.cache"))
}

/// Writes an entry to disk. Failures are the caller's to log and swallow —
/// this function surfaces them so the caller can decide, matching "all disk
/// I/O failures are logged and do not fail the operation; the in-memory
/// cache remains authoritative".
pub fn persist_entry(cache_dir: &Path, entry: &CacheEntry) -> io::Result<()> {
    std::fs::create_dir_all(cache_dir)?;
    let path = entry_path(cache_dir, &entry.key.hex());
    let bytes = encode_entry(entry);
    let mut file = std::fs::File::create(path)?;
    file.write_all(&bytes)
}

pub fn remove_entry(cache_dir: &Path, key_hex: &str) -> io::Result<()> {
    let path = entry_path(cache_dir, key_hex);
    match std::fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}

pub fn clear_dir(cache_dir: &Path) -> io::Result<()> {
    if !cache_dir.exists() {
        return Ok(());
    }
    for entry in std::fs::read_dir(cache_dir)? {
        let entry = entry?;
        if entry.path().extension().and_then(|e| e.to_str()) == Some("cache") {
            std::fs::remove_file(entry.path())?;
        }
    }
    Ok(())
}

/// Loads every `*.cache` file in `cache_dir`. Expired entries are deleted
/// from disk and skipped; unreadable files are skipped (the caller logs
/// them). Returns the successfully loaded entries.
pub fn load_dir(cache_dir: &Path) -> Vec<CacheEntry> {
    let Ok(read_dir) = std::fs::read_dir(cache_dir) else {
        return Vec::new();
    };

    let mut loaded = Vec::new();
    for entry in read_dir.flatten() {
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some("cache") {
            continue;
        }
        let Ok(bytes) = std::fs::read(&path) else {
            continue;
        };
        match decode_entry(&bytes) {
            Ok(entry) if entry.is_expired() => {
                let _ = std::fs::remove_file(&path);
            }
            Ok(entry) => loaded.push(entry),
            Err(_) => {
                // Unreadable/corrupt file: skip it, leave it for operator inspection.
            }
        }
    }
    loaded
}

/// Rewrites `cache_dir` from the given in-memory entries, using a sibling
/// `<cache_dir>_backup` directory swapped in atomically. Restoration on
/// failure is best-effort, matching the source's `compress_disk_cache`.
pub fn compact(cache_dir: &Path, entries: &[CacheEntry]) -> io::Result<usize> {
    let backup_dir = PathBuf::from(format!("{}_backup", cache_dir.display()));
    if backup_dir.exists() {
        std::fs::remove_dir_all(&backup_dir)?;
    }
    if cache_dir.exists() {
        copy_dir(cache_dir, &backup_dir)?;
    }

    let result = (|| -> io::Result<usize> {
        clear_dir(cache_dir)?;
        let mut persisted = 0;
        for entry in entries {
            persist_entry(cache_dir, entry)?;
            persisted += 1;
        }
        Ok(persisted)
    })();

    match result {
        Ok(count) => {
            let _ = std::fs::remove_dir_all(&backup_dir);
            Ok(count)
        }
        Err(e) => {
            if backup_dir.exists() {
                let _ = std::fs::remove_dir_all(cache_dir);
                let _ = copy_dir(&backup_dir, cache_dir);
            }
            Err(e)
        }
    }
}

fn copy_dir(src: &Path, dst: &Path) -> io::Result<()> {
    std::fs::create_dir_all(dst)?;
    for entry in std::fs::read_dir(src)? {
        let entry = entry?;
        let dst_path = dst.join(entry.file_name());
        if entry.file_type()?.is_dir() {
            copy_dir(&entry.path(), &dst_path)?;
        } else {
            std::fs::copy(entry.path(), dst_path)?;
        }
    }
    Ok(())
}
