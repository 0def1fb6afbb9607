//! Turns stored objects into graph nodes and the edges they imply.

use std::{borrow::Cow, fmt::Write as _};

use crate::{
    error::Error,
    identity::{ObjectId, HEX_LEN},
    store::{ObjectKind, ObjectStore},
};

// Commit payloads start with "tree <40 hex>\n" (46 bytes), optionally followed by
// "parent <40 hex>\n".
const TREE_KEYWORD: &[u8] = b"tree ";
const TREE_ID_OFFSET: usize = 5;
const TREE_LINE_LEN: usize = 46;
const PARENT_KEYWORD: &[u8] = b"parent";
const PARENT_ID_OFFSET: usize = 53;
const PARENT_LINE_LEN: usize = 48;

/// Value snapshot of one object at decode time
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Node {
    pub id: ObjectId,
    pub short_id: String,
    pub kind: ObjectKind,
    pub size: u64,
    /// Payload as text; trees carry their synthesized listing instead
    pub content: String,
}

/// "source references target"
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Edge {
    pub id: String,
    pub source: ObjectId,
    pub target: ObjectId,
}

impl Edge {
    pub fn new(source: &ObjectId, target: ObjectId) -> Self {
        Self {
            id: format!("{}{}", source, target),
            source: source.clone(),
            target,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DecodeOptions {
    /// Emit an edge for every parent line. Off by default: only the first parent
    /// of a merge commit is modelled.
    pub all_parents: bool,
}

/// Read `id` from the store and derive its node and outgoing edges
pub fn decode<S: ObjectStore + ?Sized>(
    store: &S,
    id: &ObjectId,
    options: &DecodeOptions,
) -> Result<(Node, Vec<Edge>), Error> {
    let raw = store.read(id)?;
    tracing::debug!("{} {:>6} {}", id.prefix(10), raw.kind, raw.size);

    let (content, edges) = match raw.kind {
        ObjectKind::Commit => {
            let edges = commit_edges(id, &raw.data, options)?;
            (String::from_utf8_lossy(&raw.data).into_owned(), edges)
        }
        ObjectKind::Tree => {
            let entries = tree_entries(id, &raw.data)?;
            (tree_listing(&entries), tree_edges(id, &entries))
        }
        ObjectKind::Blob | ObjectKind::Tag | ObjectKind::Unknown => {
            (String::from_utf8_lossy(&raw.data).into_owned(), Vec::new())
        }
    };

    let node = Node {
        id: id.clone(),
        short_id: raw.short_id,
        kind: raw.kind,
        size: raw.size,
        content,
    };
    Ok((node, edges))
}

/// Hex id stored at `offset`, or a malformed-object error naming `what`
fn hex_at(id: &ObjectId, data: &[u8], offset: usize, what: &str) -> Result<ObjectId, Error> {
    let bytes = data
        .get(offset..offset + HEX_LEN)
        .ok_or_else(|| Error::malformed(id, format!("payload too short for {} id", what)))?;
    std::str::from_utf8(bytes)
        .ok()
        .and_then(ObjectId::from_hex)
        .ok_or_else(|| Error::malformed(id, format!("{} id is not hex", what)))
}

/// Edges of a commit: its tree, then its first parent (or every parent when
/// `all_parents` is set).
pub fn commit_edges(
    id: &ObjectId,
    data: &[u8],
    options: &DecodeOptions,
) -> Result<Vec<Edge>, Error> {
    if !data.starts_with(TREE_KEYWORD) {
        return Err(Error::malformed(id, "commit does not start with a tree line"));
    }
    let tree = hex_at(id, data, TREE_ID_OFFSET, "tree")?;
    if data.get(TREE_LINE_LEN - 1) != Some(&b'\n') {
        return Err(Error::malformed(id, "tree line is not terminated"));
    }

    let mut edges = vec![Edge::new(id, tree)];

    let mut line_start = TREE_LINE_LEN;
    while data[line_start..].starts_with(PARENT_KEYWORD) {
        let id_offset = line_start + (PARENT_ID_OFFSET - TREE_LINE_LEN);
        edges.push(Edge::new(id, hex_at(id, data, id_offset, "parent")?));

        if !options.all_parents {
            break;
        }
        line_start += PARENT_LINE_LEN;
        if line_start > data.len() {
            break;
        }
    }

    Ok(edges)
}

fn entry_type(mode: u32) -> &'static str {
    match mode & 0o170000 {
        0o040000 => "tree",
        0o160000 => "commit",
        _ => "blob",
    }
}

/// One entry of a binary tree payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TreeEntry {
    pub mode: u32,
    pub name: String,
    pub id: ObjectId,
}

impl TreeEntry {
    /// Type word derived from the mode: `tree`, `commit` (gitlink) or `blob`
    pub fn kind(&self) -> &'static str {
        entry_type(self.mode)
    }

    /// Name as printed in listings, C-quoted when it contains control
    /// characters, quotes or backslashes (as `git ls-tree` does)
    pub fn display_name(&self) -> Cow<'_, str> {
        quote_name(&self.name)
    }
}

fn quote_name(name: &str) -> Cow<'_, str> {
    if !name.chars().any(|c| c.is_control() || c == '"' || c == '\\') {
        return Cow::Borrowed(name);
    }

    let mut quoted = String::with_capacity(name.len() + 2);
    quoted.push('"');
    for c in name.chars() {
        match c {
            '\n' => quoted.push_str("\\n"),
            '\t' => quoted.push_str("\\t"),
            '\r' => quoted.push_str("\\r"),
            '"' => quoted.push_str("\\\""),
            '\\' => quoted.push_str("\\\\"),
            c if c.is_control() => {
                let _ = write!(quoted, "\\{:03o}", c as u32);
            }
            c => quoted.push(c),
        }
    }
    quoted.push('"');
    Cow::Owned(quoted)
}

/// Read the records of a binary tree payload. Each record is the fixed
/// sequence `<octal mode> SP <name> NUL <20 byte id>`.
pub fn tree_entries(id: &ObjectId, data: &[u8]) -> Result<Vec<TreeEntry>, Error> {
    let mut entries = Vec::new();
    let mut rest = data;

    while !rest.is_empty() {
        let space = rest
            .iter()
            .position(|&b| b == b' ')
            .ok_or_else(|| Error::malformed(id, "tree entry has no mode"))?;
        let mode = std::str::from_utf8(&rest[..space])
            .ok()
            .and_then(|mode| u32::from_str_radix(mode, 8).ok())
            .ok_or_else(|| Error::malformed(id, "tree entry mode is not octal"))?;
        rest = &rest[space + 1..];

        let nul = rest
            .iter()
            .position(|&b| b == 0)
            .ok_or_else(|| Error::malformed(id, "tree entry name is not terminated"))?;
        let name = String::from_utf8_lossy(&rest[..nul]).into_owned();
        rest = &rest[nul + 1..];

        let target = rest
            .get(..HEX_LEN / 2)
            .and_then(ObjectId::from_raw)
            .ok_or_else(|| Error::malformed(id, "tree entry id is truncated"))?;
        rest = &rest[HEX_LEN / 2..];

        entries.push(TreeEntry {
            mode,
            name,
            id: target,
        });
    }

    Ok(entries)
}

/// Render entries as `<mode> <type> <id>\t<name>` lines, one per entry
pub fn tree_listing(entries: &[TreeEntry]) -> String {
    let mut listing = String::new();
    for entry in entries {
        let _ = writeln!(
            listing,
            "{:06o} {} {}\t{}",
            entry.mode,
            entry.kind(),
            entry.id,
            entry.display_name()
        );
    }
    listing
}

/// One edge per entry, from the tree to the entry
pub fn tree_edges(id: &ObjectId, entries: &[TreeEntry]) -> Vec<Edge> {
    entries
        .iter()
        .map(|entry| Edge::new(id, entry.id.clone()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    const TREE: &str = "dfea9995ef759d90b879ce623ec9b26f2a781e0c";
    const PARENT: &str = "96b5e3f3aaadc5e1e6d6e1510c32c8666db98b51";
    const SECOND_PARENT: &str = "a906cb2a4a904a152e80877d4088654daad0c859";

    fn oid(hex: &str) -> ObjectId {
        ObjectId::from_hex(hex).unwrap()
    }

    fn commit_id() -> ObjectId {
        oid("1111111111111111111111111111111111111111")
    }

    #[test]
    fn test_commit_with_parent_yields_two_edges() {
        let payload = format!(
            "tree {}\nparent {}\nauthor A <a@b> 0 +0000\ncommitter A <a@b> 0 +0000\n\nmsg\n",
            TREE, PARENT
        );
        let edges = commit_edges(&commit_id(), payload.as_bytes(), &DecodeOptions::default())
            .unwrap();

        assert_eq!(edges.len(), 2);
        assert_eq!(edges[0].target, oid(TREE));
        assert_eq!(edges[1].target, oid(PARENT));
        assert_eq!(edges[1].id, format!("{}{}", commit_id(), PARENT));
        assert!(edges.iter().all(|e| e.source == commit_id()));
    }

    #[test]
    fn test_root_commit_yields_tree_edge_only() {
        let payload = format!("tree {}\nauthor A <a@b> 0 +0000\n\nroot\n", TREE);
        let edges = commit_edges(&commit_id(), payload.as_bytes(), &DecodeOptions::default())
            .unwrap();
        assert_eq!(edges, vec![Edge::new(&commit_id(), oid(TREE))]);
    }

    #[test]
    fn test_merge_commit_models_first_parent_only() {
        let payload = format!(
            "tree {}\nparent {}\nparent {}\nauthor A <a@b> 0 +0000\n\nmerge\n",
            TREE, PARENT, SECOND_PARENT
        );
        let edges = commit_edges(&commit_id(), payload.as_bytes(), &DecodeOptions::default())
            .unwrap();
        assert_eq!(edges.len(), 2);

        let all = DecodeOptions { all_parents: true };
        let edges = commit_edges(&commit_id(), payload.as_bytes(), &all).unwrap();
        let targets: Vec<_> = edges.iter().map(|e| e.target.as_str()).collect();
        assert_eq!(targets, vec![TREE, PARENT, SECOND_PARENT]);
    }

    #[test]
    fn test_malformed_commits() {
        let options = DecodeOptions::default();
        let cases = [
            "author A <a@b> 0 +0000\n".to_string(),
            "tree dfea9995".to_string(),
            format!("tree {}", TREE),
            format!("tree {}\nparent 96b5e3f3", TREE),
            format!("tree {}\nparent {}\n", TREE, "x".repeat(40)),
        ];
        for payload in cases {
            assert!(
                matches!(
                    commit_edges(&commit_id(), payload.as_bytes(), &options),
                    Err(Error::MalformedObject { .. })
                ),
                "{:?} should be malformed",
                payload
            );
        }
    }

    #[test]
    fn test_tree_listing_and_edges() {
        let mut store = MemoryStore::new();
        let readme = store.insert_blob("hello\n");
        let lib = store.insert_tree(&[(0o100644, "mod.rs", &readme)]);
        let tree = store.insert_tree(&[
            (0o100644, "README", &readme),
            (0o040000, "lib", &lib),
            (0o100755, "run.sh", &readme),
        ]);

        let (node, edges) = decode(&store, &tree, &DecodeOptions::default()).unwrap();
        assert_eq!(node.kind, ObjectKind::Tree);
        assert_eq!(
            node.content,
            format!(
                "100644 blob {r}\tREADME\n040000 tree {l}\tlib\n100755 blob {r}\trun.sh\n",
                r = readme,
                l = lib
            )
        );

        assert_eq!(edges.len(), 3);
        for (edge, line) in edges.iter().zip(node.content.lines()) {
            assert_eq!(edge.source, tree);
            assert_eq!(edge.target.as_str(), &line[12..52]);
        }
    }

    #[test]
    fn test_gitlink_entries_yield_edges() {
        let mut store = MemoryStore::new();
        let sub = oid(SECOND_PARENT);
        let tree = store.insert_tree(&[(0o160000, "vendor", &sub)]);

        let (node, edges) = decode(&store, &tree, &DecodeOptions::default()).unwrap();
        assert_eq!(node.content, format!("160000 commit {}\tvendor\n", sub));
        assert_eq!(edges, vec![Edge::new(&tree, sub)]);
    }

    #[test]
    fn test_newline_in_entry_name() {
        let mut store = MemoryStore::new();
        let blob = store.insert_blob("x\n");
        let tree = store.insert_tree(&[(0o100644, "a\nb", &blob), (0o100644, "plain", &blob)]);

        let (node, edges) = decode(&store, &tree, &DecodeOptions::default()).unwrap();
        assert_eq!(edges.len(), 2);
        assert!(edges.iter().all(|e| e.target == blob));
        assert_eq!(
            node.content,
            format!(
                "100644 blob {b}\t\"a\\nb\"\n100644 blob {b}\tplain\n",
                b = blob
            )
        );
        assert_eq!(node.content.lines().count(), 2);
    }

    #[test]
    fn test_quote_name() {
        assert_eq!(quote_name("README"), "README");
        assert_eq!(quote_name("tab\there"), "\"tab\\there\"");
        assert_eq!(quote_name("say \"hi\""), "\"say \\\"hi\\\"\"");
        assert_eq!(quote_name("bell\u{7}"), "\"bell\\007\"");
    }

    #[test]
    fn test_truncated_tree_payload_is_malformed() {
        let mut data = b"100644 README\0".to_vec();
        data.extend_from_slice(&[0xab; 12]);
        assert!(matches!(
            tree_entries(&commit_id(), &data),
            Err(Error::MalformedObject { .. })
        ));
        assert!(matches!(
            tree_entries(&commit_id(), b"100644 README"),
            Err(Error::MalformedObject { .. })
        ));
        assert!(matches!(
            tree_entries(&commit_id(), b"10z644 README\0"),
            Err(Error::MalformedObject { .. })
        ));
    }

    #[test]
    fn test_blob_and_tag_have_no_edges() {
        let mut store = MemoryStore::new();
        let blob = store.insert_blob("some text\n");
        let tag = store.insert(
            ObjectKind::Tag,
            format!("object {}\ntype blob\ntag v1\n\nrelease\n", blob),
        );

        let (node, edges) = decode(&store, &blob, &DecodeOptions::default()).unwrap();
        assert!(edges.is_empty());
        assert_eq!(node.content, "some text\n");
        assert_eq!(node.size, 10);
        assert_eq!(node.short_id, blob.prefix(7));

        let (node, edges) = decode(&store, &tag, &DecodeOptions::default()).unwrap();
        assert!(edges.is_empty());
        assert_eq!(node.kind, ObjectKind::Tag);
    }

    #[test]
    fn test_decode_missing_is_not_found() {
        let store = MemoryStore::new();
        assert!(matches!(
            decode(&store, &commit_id(), &DecodeOptions::default()),
            Err(Error::NotFound(_))
        ));
    }
}
