//! Read-only access to a repository's object database.

mod git_cli;
mod loose;
mod memory;

use std::{
    fmt,
    path::{Path, PathBuf},
};

use serde::{Deserialize, Serialize};
use sha1::{Digest, Sha1};

use crate::{error::Error, identity::ObjectId};

pub use git_cli::GitCliStore;
pub use loose::LooseObjectStore;
pub use memory::MemoryStore;

/// Object type as recorded in the object header
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ObjectKind {
    Commit,
    Tree,
    Blob,
    Tag,
    Unknown,
}

impl ObjectKind {
    /// Parse the type word of an object header (`commit`, `tree`, ...)
    pub fn from_type_name(name: &[u8]) -> Self {
        match gix_object::Kind::from_bytes(name) {
            Ok(kind) => kind.into(),
            Err(_) => ObjectKind::Unknown,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ObjectKind::Commit => "commit",
            ObjectKind::Tree => "tree",
            ObjectKind::Blob => "blob",
            ObjectKind::Tag => "tag",
            ObjectKind::Unknown => "unknown",
        }
    }
}

impl From<gix_object::Kind> for ObjectKind {
    fn from(kind: gix_object::Kind) -> Self {
        match kind {
            gix_object::Kind::Commit => ObjectKind::Commit,
            gix_object::Kind::Tree => ObjectKind::Tree,
            gix_object::Kind::Blob => ObjectKind::Blob,
            gix_object::Kind::Tag => ObjectKind::Tag,
        }
    }
}

impl fmt::Display for ObjectKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One object as handed out by a store
#[derive(Debug, Clone)]
pub struct RawObject {
    pub kind: ObjectKind,
    /// Payload size in bytes, from the object header
    pub size: u64,
    /// Store-defined abbreviation of the id
    pub short_id: String,
    /// Payload without the header
    pub data: Vec<u8>,
}

/// Read-only view of a content-addressed object database.
///
/// All calls block. Callers that share a store between tasks serialise access
/// themselves (the sync session keeps it behind a mutex).
pub trait ObjectStore: Send {
    /// Every object id in the store, in store-defined order
    fn enumerate(&self) -> Result<Vec<ObjectId>, Error>;

    /// Read one object. Missing objects are `Error::NotFound`.
    fn read(&self, id: &ObjectId) -> Result<RawObject, Error>;

    /// Abbreviated form of `id`, whether or not the object exists
    fn short_id(&self, id: &ObjectId) -> Result<String, Error>;

    /// Commit currently checked out (HEAD)
    fn resolve_head(&self) -> Result<ObjectId, Error>;

    /// On-disk root of the object database, if there is one to watch
    fn objects_dir(&self) -> Option<&Path>;
}

/// Which backend to open a repository with
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum StoreBackend {
    /// Loose and packed objects through the `git` executable
    #[default]
    Git,
    /// Loose object files only, read in-process
    Loose,
}

/// Backend selected at runtime, delegating to the concrete store
pub enum Store {
    Git(GitCliStore),
    Loose(LooseObjectStore),
}

impl Store {
    /// Open the repository at `repo_root` with the requested backend
    pub fn open(
        backend: StoreBackend,
        repo_root: impl AsRef<Path>,
        verify_hashes: bool,
    ) -> Result<Self, Error> {
        let repo_root = repo_root.as_ref();
        match backend {
            StoreBackend::Git => Ok(Store::Git(GitCliStore::open(repo_root)?)),
            StoreBackend::Loose => Ok(Store::Loose(
                LooseObjectStore::open(repo_root)?.verify_hashes(verify_hashes),
            )),
        }
    }
}

impl ObjectStore for Store {
    fn enumerate(&self) -> Result<Vec<ObjectId>, Error> {
        match self {
            Store::Git(s) => s.enumerate(),
            Store::Loose(s) => s.enumerate(),
        }
    }

    fn read(&self, id: &ObjectId) -> Result<RawObject, Error> {
        match self {
            Store::Git(s) => s.read(id),
            Store::Loose(s) => s.read(id),
        }
    }

    fn short_id(&self, id: &ObjectId) -> Result<String, Error> {
        match self {
            Store::Git(s) => s.short_id(id),
            Store::Loose(s) => s.short_id(id),
        }
    }

    fn resolve_head(&self) -> Result<ObjectId, Error> {
        match self {
            Store::Git(s) => s.resolve_head(),
            Store::Loose(s) => s.resolve_head(),
        }
    }

    fn objects_dir(&self) -> Option<&Path> {
        match self {
            Store::Git(s) => s.objects_dir(),
            Store::Loose(s) => s.objects_dir(),
        }
    }
}

/// Compute the git SHA-1 object id for a payload of the given kind
pub fn hash_object(kind: ObjectKind, data: &[u8]) -> ObjectId {
    let header = format!("{} {}\0", kind.as_str(), data.len());
    let mut hasher = Sha1::new();
    hasher.update(header.as_bytes());
    hasher.update(data);
    let hex = hex::encode(hasher.finalize());
    ObjectId::from_hex(&hex).expect("sha1 digest is 40 hex characters")
}

/// Locate the git directory for a working tree, a `.git` file, or a bare repository
pub(crate) fn find_git_dir(repo_root: &Path) -> Result<PathBuf, Error> {
    let dot_git = repo_root.join(".git");
    if dot_git.is_dir() {
        return Ok(dot_git);
    }

    if dot_git.is_file() {
        let content = std::fs::read_to_string(&dot_git)?;
        let target = content
            .lines()
            .find_map(|line| line.strip_prefix("gitdir:"))
            .map(str::trim)
            .ok_or_else(|| {
                Error::StoreUnavailable(format!("{} has no gitdir line", dot_git.display()))
            })?;
        let target = Path::new(target);
        return Ok(if target.is_absolute() {
            target.to_path_buf()
        } else {
            repo_root.join(target)
        });
    }

    if repo_root.join("objects").is_dir() && repo_root.join("HEAD").is_file() {
        return Ok(repo_root.to_path_buf());
    }

    Err(Error::StoreUnavailable(format!(
        "{} is not a git repository",
        repo_root.display()
    )))
}
