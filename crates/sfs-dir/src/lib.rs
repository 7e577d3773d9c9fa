#![forbid(unsafe_code)]
//! Directory payload codec.
//!
//! A directory's file contents are UTF-8 text: one record per entry,
//! each record a leading newline, the entry name, a pipe, and the
//! decimal inode number (`\n<name>|<inode>`). No trailing terminator.
//! Pure functions over byte buffers — reading and writing the payload
//! through an inode is the caller's business.

use sfs_error::{FsError, Result};
use sfs_types::InodeNumber;
use std::collections::BTreeMap;

/// Self entry, present in every directory.
pub const DOT: &str = ".";
/// Parent entry, present in every directory except the root.
pub const DOTDOT: &str = "..";

/// Check that `name` is usable as a new directory entry.
///
/// Rejects the empty string, the reserved `.`/`..` entries, and any
/// character that collides with the record syntax or path separator.
pub fn validate_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(FsError::InvalidArgument("empty file name".to_owned()));
    }
    if name == DOT || name == DOTDOT {
        return Err(FsError::InvalidArgument(format!(
            "name {name:?} is reserved"
        )));
    }
    if let Some(bad) = name.chars().find(|c| matches!(c, '/' | '|' | '\n' | '\0')) {
        return Err(FsError::InvalidArgument(format!(
            "name {name:?} contains forbidden character {bad:?}"
        )));
    }
    Ok(())
}

/// Linearize entries into the on-disk payload. Entries are emitted in
/// name order, so equal maps always produce identical bytes.
#[must_use]
pub fn encode_entries(entries: &BTreeMap<String, InodeNumber>) -> Vec<u8> {
    let mut out = String::new();
    for (name, ino) in entries {
        out.push('\n');
        out.push_str(name);
        out.push('|');
        out.push_str(&ino.0.to_string());
    }
    out.into_bytes()
}

/// Parse the on-disk payload back into an entry map. Empty lines are
/// skipped; anything else malformed is a format error.
pub fn decode_entries(payload: &[u8]) -> Result<BTreeMap<String, InodeNumber>> {
    let text = std::str::from_utf8(payload)
        .map_err(|e| FsError::Format(format!("directory payload is not UTF-8: {e}")))?;

    let mut entries = BTreeMap::new();
    for record in text.split('\n') {
        if record.is_empty() {
            continue;
        }
        let (name, number) = record.split_once('|').ok_or_else(|| {
            FsError::Format(format!("directory record {record:?} has no separator"))
        })?;
        if name.is_empty() {
            return Err(FsError::Format(format!(
                "directory record {record:?} has an empty name"
            )));
        }
        let ino: u16 = number.parse().map_err(|_| {
            FsError::Format(format!("directory record {record:?} has a bad inode number"))
        })?;
        entries.insert(name.to_owned(), InodeNumber(ino));
    }
    Ok(entries)
}

/// Entries for a brand-new directory.
///
/// The root directory is its own parent and gets only `.`; every other
/// directory gets both `.` and `..`.
#[must_use]
pub fn initial_entries(own: InodeNumber, parent: Option<InodeNumber>) -> BTreeMap<String, InodeNumber> {
    let mut entries = BTreeMap::new();
    entries.insert(DOT.to_owned(), own);
    if let Some(parent) = parent {
        entries.insert(DOTDOT.to_owned(), parent);
    }
    entries
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_decode_round_trip() {
        let mut entries = BTreeMap::new();
        entries.insert(".".to_owned(), InodeNumber(3));
        entries.insert("..".to_owned(), InodeNumber(0));
        entries.insert("notes.txt".to_owned(), InodeNumber(7));
        entries.insert("zèbre".to_owned(), InodeNumber(12));

        let payload = encode_entries(&entries);
        assert_eq!(decode_entries(&payload).expect("decode"), entries);
    }

    #[test]
    fn encode_format_is_exact() {
        let mut entries = BTreeMap::new();
        entries.insert(".".to_owned(), InodeNumber(0));
        entries.insert("a".to_owned(), InodeNumber(42));

        let payload = encode_entries(&entries);
        assert_eq!(payload, b"\n.|0\na|42");
    }

    #[test]
    fn decode_skips_empty_records() {
        let entries = decode_entries(b"\n.|0\n\na|1").expect("decode");
        assert_eq!(entries.len(), 2);
        assert_eq!(entries["a"], InodeNumber(1));
    }

    #[test]
    fn decode_empty_payload_is_empty_map() {
        assert!(decode_entries(b"").expect("decode").is_empty());
    }

    #[test]
    fn decode_rejects_malformed_records() {
        assert!(decode_entries(b"\nno-separator").is_err());
        assert!(decode_entries(b"\n|5").is_err());
        assert!(decode_entries(b"\nname|notanumber").is_err());
        assert!(decode_entries(b"\nname|99999999").is_err());
        assert!(decode_entries(&[0xFF, 0xFE]).is_err());
    }

    #[test]
    fn validate_name_rules() {
        assert!(validate_name("notes.txt").is_ok());
        assert!(validate_name("zèbre").is_ok());
        assert!(validate_name("").is_err());
        assert!(validate_name(".").is_err());
        assert!(validate_name("..").is_err());
        assert!(validate_name("a/b").is_err());
        assert!(validate_name("a|b").is_err());
        assert!(validate_name("a\nb").is_err());
        assert!(validate_name("a\0b").is_err());
    }

    #[test]
    fn initial_entries_for_root_and_child() {
        let root = initial_entries(InodeNumber(0), None);
        assert_eq!(root.len(), 1);
        assert_eq!(root["."], InodeNumber(0));

        let child = initial_entries(InodeNumber(5), Some(InodeNumber(0)));
        assert_eq!(child.len(), 2);
        assert_eq!(child["."], InodeNumber(5));
        assert_eq!(child[".."], InodeNumber(0));
    }
}
