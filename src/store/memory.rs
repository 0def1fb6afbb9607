use std::{collections::HashMap, fmt::Write as _, path::Path};

use super::{hash_object, ObjectKind, ObjectStore, RawObject};
use crate::{
    error::Error,
    identity::{abbreviate, ObjectId},
};

/// In-process object store. Enumeration follows insertion order.
#[derive(Debug, Default, Clone)]
pub struct MemoryStore {
    order: Vec<ObjectId>,
    objects: HashMap<ObjectId, (ObjectKind, Vec<u8>)>,
    head: Option<ObjectId>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a payload under its content-derived id
    pub fn insert(&mut self, kind: ObjectKind, data: impl Into<Vec<u8>>) -> ObjectId {
        let data = data.into();
        let id = hash_object(kind, &data);
        self.insert_with_id(id.clone(), kind, data);
        id
    }

    /// Store a payload under an arbitrary id, for corrupt or foreign objects
    pub fn insert_with_id(&mut self, id: ObjectId, kind: ObjectKind, data: impl Into<Vec<u8>>) {
        if self.objects.insert(id.clone(), (kind, data.into())).is_none() {
            self.order.push(id);
        }
    }

    pub fn insert_blob(&mut self, content: &str) -> ObjectId {
        self.insert(ObjectKind::Blob, content)
    }

    /// Store a tree from `(mode, name, id)` entries, encoded the way git does
    pub fn insert_tree(&mut self, entries: &[(u32, &str, &ObjectId)]) -> ObjectId {
        let mut data = Vec::new();
        for (mode, name, id) in entries {
            data.extend_from_slice(format!("{:o} {}\0", mode, name).as_bytes());
            data.extend_from_slice(&hex::decode(id.as_str()).unwrap_or_default());
        }
        self.insert(ObjectKind::Tree, data)
    }

    /// Store a commit with fixed identity lines and the given committer time
    pub fn insert_commit(
        &mut self,
        tree: &ObjectId,
        parents: &[&ObjectId],
        time: i64,
        message: &str,
    ) -> ObjectId {
        let mut text = format!("tree {}\n", tree);
        for parent in parents {
            let _ = writeln!(text, "parent {}", parent);
        }
        let _ = writeln!(text, "author A U Thor <author@example.com> {} +0000", time);
        let _ = writeln!(text, "committer C O Mitter <committer@example.com> {} +0000", time);
        let _ = write!(text, "\n{}\n", message);
        self.insert(ObjectKind::Commit, text)
    }

    pub fn set_head(&mut self, id: &ObjectId) {
        self.head = Some(id.clone());
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}

impl ObjectStore for MemoryStore {
    fn enumerate(&self) -> Result<Vec<ObjectId>, Error> {
        Ok(self.order.clone())
    }

    fn read(&self, id: &ObjectId) -> Result<RawObject, Error> {
        let (kind, data) = self
            .objects
            .get(id)
            .ok_or_else(|| Error::NotFound(id.clone()))?;
        Ok(RawObject {
            kind: *kind,
            size: data.len() as u64,
            short_id: self.short_id(id)?,
            data: data.clone(),
        })
    }

    fn short_id(&self, id: &ObjectId) -> Result<String, Error> {
        Ok(abbreviate(id, self.order.iter().map(ObjectId::as_str)))
    }

    fn resolve_head(&self) -> Result<ObjectId, Error> {
        self.head
            .clone()
            .ok_or_else(|| Error::StoreUnavailable("HEAD is not set".to_string()))
    }

    fn objects_dir(&self) -> Option<&Path> {
        None
    }
}
