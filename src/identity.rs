//! Object identifiers and the mapping from shard paths back to them.

use std::{fmt, str::FromStr};

use serde::Serialize;

use crate::error::Error;

/// Length of a hex SHA-1 object id
pub const HEX_LEN: usize = 40;

/// Length of the shard directory name (`objects/ab/...`)
pub const SHARD_LEN: usize = 2;

/// Length of a loose object file name inside its shard directory
pub const FILE_NAME_LEN: usize = HEX_LEN - SHARD_LEN;

/// Shortest abbreviation handed out, same floor as `core.abbrev`
pub const MIN_ABBREV_LEN: usize = 7;

/// Canonical (lower-case) 40 character hex object id
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct ObjectId(String);

impl ObjectId {
    /// Parse a 40 character hex string, normalising to lower case
    pub fn from_hex(hex: &str) -> Option<Self> {
        if hex.len() != HEX_LEN || !validate_hex(hex) {
            return None;
        }
        Some(ObjectId(hex.to_ascii_lowercase()))
    }

    /// Build an id from the 20 raw bytes found in tree entries
    pub fn from_raw(raw: &[u8]) -> Option<Self> {
        if raw.len() != HEX_LEN / 2 {
            return None;
        }
        Some(ObjectId(hex::encode(raw)))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Split into the shard directory name and the file name inside it
    pub fn shard(&self) -> (&str, &str) {
        self.0.split_at(SHARD_LEN)
    }

    /// Fixed-width prefix used in log lines
    pub fn prefix(&self, len: usize) -> &str {
        &self.0[..len.min(HEX_LEN)]
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for ObjectId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ObjectId::from_hex(s).ok_or_else(|| Error::NotAnObjectPath(s.to_string()))
    }
}

impl AsRef<str> for ObjectId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// True iff every character is a hex digit (either case)
pub fn validate_hex(s: &str) -> bool {
    s.chars().all(|c| c.is_ascii_hexdigit())
}

/// Map a watcher event's directory and file name to the object it names.
///
/// The store shards objects as `objects/<2 hex>/<38 hex>`, so the id is the last
/// two characters of the directory (ignoring a trailing separator) followed by
/// the file name. Anything else, e.g. `tmp_obj_*`, lock files or pack files, is
/// `NotAnObjectPath`.
pub fn path_to_id(directory: &str, file_name: &str) -> Result<ObjectId, Error> {
    let not_an_object = || Error::NotAnObjectPath(format!("{} {}", directory, file_name));

    if file_name.len() != FILE_NAME_LEN || !validate_hex(file_name) {
        return Err(not_an_object());
    }

    let trimmed = directory.trim_end_matches(['/', std::path::MAIN_SEPARATOR]);
    let shard = trimmed
        .len()
        .checked_sub(SHARD_LEN)
        .and_then(|start| trimmed.get(start..))
        .ok_or_else(not_an_object)?;

    ObjectId::from_hex(&format!("{}{}", shard, file_name)).ok_or_else(not_an_object)
}

/// Shortest unique abbreviation of `id` among `known`, never below
/// [`MIN_ABBREV_LEN`]. `known` may contain `id` itself.
pub fn abbreviate<'a>(id: &ObjectId, known: impl IntoIterator<Item = &'a str>) -> String {
    let target = id.as_str().as_bytes();
    let longest_shared = known
        .into_iter()
        .filter(|other| *other != id.as_str())
        .map(|other| {
            target
                .iter()
                .zip(other.as_bytes())
                .take_while(|(a, b)| a == b)
                .count()
        })
        .max()
        .unwrap_or(0);

    let len = (longest_shared + 1).clamp(MIN_ABBREV_LEN, HEX_LEN);
    id.prefix(len).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    const BLOB: &str = "a906cb2a4a904a152e80877d4088654daad0c859";

    #[test]
    fn test_validate_hex() {
        assert!(validate_hex(BLOB));
        assert!(validate_hex("ABCDEF0123456789abcdef"));
        assert!(!validate_hex("a906cb2a4a904a152e80877d4088654daad0c85g"));
        assert!(!validate_hex("tmp_obj_1234"));
        assert!(!validate_hex("ab cd"));
    }

    #[test]
    fn test_from_hex_normalises_case() {
        let id = ObjectId::from_hex(&BLOB.to_uppercase()).unwrap();
        assert_eq!(id.as_str(), BLOB);
        assert_eq!(id, ObjectId::from_hex(BLOB).unwrap());
    }

    #[test]
    fn test_from_hex_rejects_bad_shapes() {
        assert!(ObjectId::from_hex(&BLOB[..39]).is_none());
        assert!(ObjectId::from_hex(&format!("{}0", BLOB)).is_none());
        assert!(ObjectId::from_hex("z906cb2a4a904a152e80877d4088654daad0c859").is_none());
    }

    #[test]
    fn test_path_to_id() {
        let id = path_to_id("/repo/.git/objects/a9/", &BLOB[2..]).unwrap();
        assert_eq!(id.as_str(), BLOB);

        let id = path_to_id("/repo/.git/objects/a9", &BLOB[2..]).unwrap();
        assert_eq!(id.as_str(), BLOB);
    }

    #[test]
    fn test_path_to_id_inverts_shard() {
        let id = ObjectId::from_hex(BLOB).unwrap();
        let (dir, file) = id.shard();
        let directory = format!("/tmp/repo/.git/objects/{}/", dir);
        assert_eq!(path_to_id(&directory, file).unwrap(), id);
    }

    #[test]
    fn test_path_to_id_rejects_non_objects() {
        let cases = [
            ("/repo/.git/objects/a9/", "tmp_obj_Xy12ab"),
            ("/repo/.git/objects/a9/", &BLOB[3..]),
            ("/repo/.git/objects/pack/", "pack-1234.idx"),
            ("/repo/.git/objects/zz/", &BLOB[2..]),
            ("a", &BLOB[2..]),
            ("", &BLOB[2..]),
        ];
        for (dir, file) in cases {
            assert!(
                matches!(path_to_id(dir, file), Err(Error::NotAnObjectPath(_))),
                "{} {} should not map to an object",
                dir,
                file
            );
        }
    }

    #[test]
    fn test_from_raw() {
        let raw = hex::decode(BLOB).unwrap();
        assert_eq!(ObjectId::from_raw(&raw).unwrap().as_str(), BLOB);
        assert!(ObjectId::from_raw(&raw[..19]).is_none());
    }

    #[test]
    fn test_abbreviate() {
        let id = ObjectId::from_hex(BLOB).unwrap();
        assert_eq!(abbreviate(&id, [BLOB]), "a906cb2");

        let neighbour = "a906cb2a4a0000000000000000000000000000000";
        assert_eq!(abbreviate(&id, [BLOB, neighbour]), "a906cb2a4a9");

        let twin_prefix = format!("{}0", &BLOB[..39]);
        assert_eq!(abbreviate(&id, [twin_prefix.as_str()]), BLOB);
    }
}
