use std::{
    fs,
    io::Read,
    path::{Path, PathBuf},
    sync::atomic::{AtomicBool, Ordering},
};

use super::{find_git_dir, hash_object, ObjectKind, ObjectStore, RawObject};
use crate::{
    error::Error,
    identity::{abbreviate, validate_hex, ObjectId, FILE_NAME_LEN, SHARD_LEN},
};

/// Object store reading loose objects (`objects/ab/cdef...`) directly from disk.
///
/// Packed objects are invisible to this backend.
pub struct LooseObjectStore {
    git_dir: PathBuf,
    objects_dir: PathBuf,
    verify_hashes: bool,
    warned_about_packs: AtomicBool,
}

impl LooseObjectStore {
    /// Open the object database of the repository at `repo_root`
    pub fn open<P: AsRef<Path>>(repo_root: P) -> Result<Self, Error> {
        let git_dir = find_git_dir(repo_root.as_ref())?;
        let objects_dir = git_dir.join("objects");
        if !objects_dir.is_dir() {
            return Err(Error::StoreUnavailable(format!(
                "no objects directory at {}",
                objects_dir.display()
            )));
        }

        tracing::debug!("Opened loose object store at {:?}", objects_dir);
        Ok(Self {
            git_dir,
            objects_dir,
            verify_hashes: false,
            warned_about_packs: AtomicBool::new(false),
        })
    }

    /// Re-hash every object read and reject mismatches
    pub fn verify_hashes(mut self, verify: bool) -> Self {
        self.verify_hashes = verify;
        self
    }

    fn object_path(&self, id: &ObjectId) -> PathBuf {
        let (dir, file) = id.shard();
        self.objects_dir.join(dir).join(file)
    }

    fn shard_dirs(&self) -> Result<Vec<(String, PathBuf)>, Error> {
        let mut dirs = Vec::new();
        for entry in fs::read_dir(&self.objects_dir)? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.len() == SHARD_LEN && validate_hex(&name) && entry.file_type()?.is_dir() {
                dirs.push((name, entry.path()));
            }
        }
        dirs.sort();
        Ok(dirs)
    }

    /// Loose object file names in one shard directory, sorted
    fn shard_entries(dir: &Path) -> Result<Vec<String>, Error> {
        let mut names = Vec::new();
        match fs::read_dir(dir) {
            Ok(entries) => {
                for entry in entries {
                    let name = entry?.file_name().to_string_lossy().into_owned();
                    if name.len() == FILE_NAME_LEN && validate_hex(&name) {
                        names.push(name);
                    }
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        names.sort();
        Ok(names)
    }

    fn warn_about_packs(&self) {
        if self.warned_about_packs.swap(true, Ordering::Relaxed) {
            return;
        }
        let packs = fs::read_dir(self.objects_dir.join("pack"))
            .map(|entries| {
                entries
                    .filter_map(|entry| entry.ok())
                    .filter(|entry| entry.path().extension().is_some_and(|ext| ext == "pack"))
                    .count()
            })
            .unwrap_or(0);
        if packs > 0 {
            tracing::warn!(
                "{} packfile(s) present; packed objects are not visible to the loose backend",
                packs
            );
        }
    }

    fn read_ref(&self, name: &str) -> Result<Option<ObjectId>, Error> {
        let path = self.git_dir.join(name);
        if path.is_file() {
            let content = fs::read_to_string(&path)?;
            return Ok(ObjectId::from_hex(content.trim()));
        }

        let packed = self.git_dir.join("packed-refs");
        if !packed.is_file() {
            return Ok(None);
        }
        let content = fs::read_to_string(&packed)?;
        Ok(content
            .lines()
            .filter(|line| !line.starts_with('#') && !line.starts_with('^'))
            .filter_map(|line| line.split_once(' '))
            .find(|(_, refname)| *refname == name)
            .and_then(|(hex, _)| ObjectId::from_hex(hex)))
    }
}

/// Split a decompressed loose object into kind, declared size and payload
fn parse_loose(id: &ObjectId, content: &[u8]) -> Result<(ObjectKind, u64, Vec<u8>), Error> {
    let null_pos = content
        .iter()
        .position(|&b| b == 0)
        .ok_or_else(|| Error::malformed(id, "no null terminator in object header"))?;

    let header = std::str::from_utf8(&content[..null_pos])
        .map_err(|_| Error::malformed(id, "invalid UTF-8 in object header"))?;

    let (type_name, size) = header
        .split_once(' ')
        .ok_or_else(|| Error::malformed(id, format!("invalid object header: {}", header)))?;
    let size: u64 = size
        .parse()
        .map_err(|_| Error::malformed(id, format!("invalid size in object header: {}", size)))?;

    let data = content[null_pos + 1..].to_vec();
    if data.len() as u64 != size {
        return Err(Error::malformed(
            id,
            format!("header declares {} bytes, found {}", size, data.len()),
        ));
    }

    Ok((ObjectKind::from_type_name(type_name.as_bytes()), size, data))
}

impl ObjectStore for LooseObjectStore {
    fn enumerate(&self) -> Result<Vec<ObjectId>, Error> {
        self.warn_about_packs();

        let mut ids = Vec::new();
        for (shard, path) in self.shard_dirs()? {
            for name in Self::shard_entries(&path)? {
                if let Some(id) = ObjectId::from_hex(&format!("{}{}", shard, name)) {
                    ids.push(id);
                }
            }
        }
        Ok(ids)
    }

    fn read(&self, id: &ObjectId) -> Result<RawObject, Error> {
        let path = self.object_path(id);
        let file = match fs::File::open(&path) {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(Error::NotFound(id.clone()))
            }
            Err(e) => return Err(e.into()),
        };

        // Loose objects are zlib compressed
        let mut decoder = flate2::read::ZlibDecoder::new(file);
        let mut content = Vec::new();
        decoder
            .read_to_end(&mut content)
            .map_err(|e| Error::malformed(id, format!("failed to decompress: {}", e)))?;

        let (kind, size, data) = parse_loose(id, &content)?;

        if self.verify_hashes && kind != ObjectKind::Unknown {
            let actual = hash_object(kind, &data);
            if &actual != id {
                return Err(Error::malformed(id, format!("content hashes to {}", actual)));
            }
        }

        Ok(RawObject {
            kind,
            size,
            short_id: self.short_id(id)?,
            data,
        })
    }

    fn short_id(&self, id: &ObjectId) -> Result<String, Error> {
        let (dir, _) = id.shard();
        let siblings: Vec<String> = Self::shard_entries(&self.objects_dir.join(dir))?
            .into_iter()
            .map(|name| format!("{}{}", dir, name))
            .collect();
        Ok(abbreviate(id, siblings.iter().map(String::as_str)))
    }

    fn resolve_head(&self) -> Result<ObjectId, Error> {
        let head = fs::read_to_string(self.git_dir.join("HEAD"))
            .map_err(|e| Error::StoreUnavailable(format!("cannot read HEAD: {}", e)))?;
        let head = head.trim();

        let resolved = match head.strip_prefix("ref:") {
            Some(refname) => self.read_ref(refname.trim())?,
            None => ObjectId::from_hex(head),
        };
        resolved.ok_or_else(|| Error::StoreUnavailable(format!("HEAD does not resolve: {}", head)))
    }

    fn objects_dir(&self) -> Option<&Path> {
        Some(&self.objects_dir)
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use tempfile::TempDir;

    use super::*;

    fn write_loose(objects_dir: &Path, kind: ObjectKind, data: &[u8]) -> ObjectId {
        let id = hash_object(kind, data);
        let (dir, file) = id.shard();
        fs::create_dir_all(objects_dir.join(dir)).unwrap();

        let mut content = format!("{} {}\0", kind, data.len()).into_bytes();
        content.extend_from_slice(data);
        let file = fs::File::create(objects_dir.join(dir).join(file)).unwrap();
        let mut encoder = flate2::write::ZlibEncoder::new(file, flate2::Compression::default());
        encoder.write_all(&content).unwrap();
        encoder.finish().unwrap();
        id
    }

    fn bare_repo() -> TempDir {
        let temp = TempDir::new().unwrap();
        fs::create_dir_all(temp.path().join("objects/pack")).unwrap();
        fs::create_dir_all(temp.path().join("objects/info")).unwrap();
        fs::create_dir_all(temp.path().join("refs/heads")).unwrap();
        fs::write(temp.path().join("HEAD"), "ref: refs/heads/main\n").unwrap();
        temp
    }

    #[test]
    fn test_enumerate_and_read() -> Result<(), Error> {
        let repo = bare_repo();
        let objects = repo.path().join("objects");
        let a = write_loose(&objects, ObjectKind::Blob, b"hello world\n");
        let b = write_loose(&objects, ObjectKind::Blob, b"second\n");
        fs::write(objects.join(a.shard().0).join("tmp_obj_abc"), b"junk")?;

        let store = LooseObjectStore::open(repo.path())?.verify_hashes(true);
        let mut expected = vec![a.clone(), b];
        expected.sort();
        assert_eq!(store.enumerate()?, expected);

        let raw = store.read(&a)?;
        assert_eq!(raw.kind, ObjectKind::Blob);
        assert_eq!(raw.size, 12);
        assert_eq!(raw.data, b"hello world\n");
        assert_eq!(raw.short_id, a.prefix(7));
        Ok(())
    }

    #[test]
    fn test_read_missing_is_not_found() -> Result<(), Error> {
        let repo = bare_repo();
        let store = LooseObjectStore::open(repo.path())?;
        let id = hash_object(ObjectKind::Blob, b"absent");
        assert!(matches!(store.read(&id), Err(Error::NotFound(missing)) if missing == id));
        Ok(())
    }

    #[test]
    fn test_verify_hashes_rejects_mismatch() -> Result<(), Error> {
        let repo = bare_repo();
        let objects = repo.path().join("objects");
        let real = write_loose(&objects, ObjectKind::Blob, b"original\n");
        let forged = hash_object(ObjectKind::Blob, b"other\n");
        let (dir, file) = forged.shard();
        fs::create_dir_all(objects.join(dir))?;
        fs::copy(
            store_path(&objects, &real),
            objects.join(dir).join(file),
        )?;

        let store = LooseObjectStore::open(repo.path())?;
        assert!(store.read(&forged).is_ok());

        let store = store.verify_hashes(true);
        assert!(matches!(
            store.read(&forged),
            Err(Error::MalformedObject { .. })
        ));
        Ok(())
    }

    fn store_path(objects: &Path, id: &ObjectId) -> PathBuf {
        let (dir, file) = id.shard();
        objects.join(dir).join(file)
    }

    #[test]
    fn test_parse_loose_size_mismatch() {
        let id = hash_object(ObjectKind::Blob, b"x");
        let result = parse_loose(&id, b"blob 5\0abc");
        assert!(matches!(result, Err(Error::MalformedObject { .. })));
    }

    #[test]
    fn test_resolve_head() -> Result<(), Error> {
        let repo = bare_repo();
        let store = LooseObjectStore::open(repo.path())?;
        assert!(matches!(
            store.resolve_head(),
            Err(Error::StoreUnavailable(_))
        ));

        let commit = hash_object(ObjectKind::Commit, b"tree x\n");
        fs::write(
            repo.path().join("packed-refs"),
            format!("# pack-refs with: peeled\n{} refs/heads/main\n", commit),
        )?;
        assert_eq!(store.resolve_head()?, commit);

        let newer = hash_object(ObjectKind::Commit, b"tree y\n");
        fs::write(repo.path().join("refs/heads/main"), format!("{}\n", newer))?;
        assert_eq!(store.resolve_head()?, newer);

        fs::write(repo.path().join("HEAD"), format!("{}\n", commit))?;
        assert_eq!(store.resolve_head()?, commit);
        Ok(())
    }
}
