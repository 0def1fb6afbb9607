//! Read-only history report: the newest commits reachable from HEAD, each
//! followed by its full tree.

use std::{
    collections::{BinaryHeap, HashMap, HashSet},
    io::Write,
};

use gix_object::CommitRefIter;

use crate::{
    decode::tree_entries,
    error::Error,
    identity::ObjectId,
    store::{ObjectKind, ObjectStore},
};

/// Header fields of a commit needed for the walk
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitHeader {
    pub tree: ObjectId,
    pub parents: Vec<ObjectId>,
    /// Committer timestamp in seconds, 0 when absent
    pub time: i64,
}

impl CommitHeader {
    pub fn parse(id: &ObjectId, data: &[u8]) -> Result<Self, Error> {
        let tree = CommitRefIter::from_bytes(data)
            .tree_id()
            .map_err(|e| Error::malformed(id, format!("no tree line: {}", e)))?;
        let tree = ObjectId::from_hex(&tree.to_string())
            .ok_or_else(|| Error::malformed(id, "tree id is not a SHA-1"))?;

        let parents = CommitRefIter::from_bytes(data)
            .parent_ids()
            .map(|parent| {
                ObjectId::from_hex(&parent.to_string())
                    .ok_or_else(|| Error::malformed(id, "parent id is not a SHA-1"))
            })
            .collect::<Result<Vec<_>, _>>()?;

        let time = CommitRefIter::from_bytes(data)
            .committer()
            .ok()
            .and_then(|committer| committer.time().ok())
            .map(|time| time.seconds)
            .unwrap_or(0);

        Ok(Self {
            tree,
            parents,
            time,
        })
    }
}

/// Write `depth`, then `1 + (depth - 1) * 2` spaces, then `text`
fn write_line<W: Write>(out: &mut W, depth: usize, text: &str) -> Result<(), Error> {
    let spaces = 1 + depth.saturating_sub(1) * 2;
    writeln!(out, "{}{:spaces$}{}", depth, "", text, spaces = spaces)?;
    Ok(())
}

fn read_commit<S: ObjectStore + ?Sized>(store: &S, id: &ObjectId) -> Result<CommitHeader, Error> {
    let raw = store.read(id)?;
    if raw.kind != ObjectKind::Commit {
        return Err(Error::malformed(id, format!("expected a commit, found {}", raw.kind)));
    }
    CommitHeader::parse(id, &raw.data)
}

/// Print the tree rooted at `tree` in pre-order. `prefix` is the path of the
/// tree relative to the commit root, ending in '/' unless empty.
fn write_tree<S: ObjectStore + ?Sized, W: Write>(
    store: &S,
    tree: &ObjectId,
    base_depth: usize,
    prefix: &str,
    out: &mut W,
) -> Result<(), Error> {
    let raw = store.read(tree)?;
    let depth = base_depth + prefix.matches('/').count();

    for entry in tree_entries(tree, &raw.data)? {
        let short = store.short_id(&entry.id)?;
        write_line(
            out,
            depth,
            &format!("{} {} {}", entry.display_name(), entry.kind(), short),
        )?;

        if entry.kind() == "tree" {
            let nested = format!("{}{}/", prefix, entry.name);
            write_tree(store, &entry.id, base_depth, &nested, out)?;
        }
    }
    Ok(())
}

/// Walk at most `max_commits` commits from HEAD, newest committer time first,
/// and write each commit, its root tree and every tree entry to `out`.
pub fn write_history<S: ObjectStore + ?Sized, W: Write>(
    store: &S,
    max_commits: usize,
    out: &mut W,
) -> Result<(), Error> {
    let head = store.resolve_head()?;
    let mut headers = HashMap::new();
    let mut queued = HashSet::new();
    let mut queue = BinaryHeap::new();

    let header = read_commit(store, &head)?;
    queue.push((header.time, head.clone()));
    queued.insert(head.clone());
    headers.insert(head, header);

    let mut printed = 0;
    while printed < max_commits {
        let Some((_, id)) = queue.pop() else {
            break;
        };
        let Some(header) = headers.remove(&id) else {
            continue;
        };

        let depth = 1;
        write_line(out, depth, &format!("commit {}", store.short_id(&id)?))?;
        write_line(out, depth + 1, &format!("tree {}", store.short_id(&header.tree)?))?;
        write_tree(store, &header.tree, depth + 2, "", out)?;
        printed += 1;

        for parent in header.parents {
            if !queued.insert(parent.clone()) {
                continue;
            }
            match read_commit(store, &parent) {
                Ok(parent_header) => {
                    queue.push((parent_header.time, parent.clone()));
                    headers.insert(parent, parent_header);
                }
                // Shallow clones end in parents that are not in the store
                Err(Error::NotFound(_)) => {
                    tracing::debug!("History stops at missing parent {}", parent);
                }
                Err(e) => return Err(e),
            }
        }
    }

    tracing::debug!("History report covered {} commit(s)", printed);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    fn report(store: &MemoryStore, max: usize) -> String {
        let mut out = Vec::new();
        write_history(store, max, &mut out).unwrap();
        String::from_utf8(out).unwrap()
    }

    #[test]
    fn test_commit_header_parse() {
        let mut store = MemoryStore::new();
        let tree = store.insert_tree(&[]);
        let parent = store.insert_commit(&tree, &[], 100, "first");
        let child = store.insert_commit(&tree, &[&parent], 200, "second");

        let raw = store.read(&child).unwrap();
        let header = CommitHeader::parse(&child, &raw.data).unwrap();
        assert_eq!(header.tree, tree);
        assert_eq!(header.parents, vec![parent]);
        assert_eq!(header.time, 200);

        assert!(matches!(
            CommitHeader::parse(&child, b"author nobody\n\nmessage\n"),
            Err(Error::MalformedObject { .. })
        ));
    }

    #[test]
    fn test_commit_header_with_signature_and_offset() {
        let id = ObjectId::from_hex("1111111111111111111111111111111111111111").unwrap();
        let tree = "dfea9995ef759d90b879ce623ec9b26f2a781e0c";
        let first = "96b5e3f3aaadc5e1e6d6e1510c32c8666db98b51";
        let second = "a906cb2a4a904a152e80877d4088654daad0c859";
        let data = format!(
            "tree {}\nparent {}\nparent {}\n\
             author A U Thor <a@example.com> 1700000000 +0200\n\
             committer C O Mitter <c@example.com> 1700000500 -0700\n\
             gpgsig -----BEGIN PGP SIGNATURE-----\n \n wsBcBAABCAAQ\n -----END PGP SIGNATURE-----\n\
             \nmerge\n",
            tree, first, second
        );

        let header = CommitHeader::parse(&id, data.as_bytes()).unwrap();
        assert_eq!(header.tree.as_str(), tree);
        assert_eq!(
            header.parents.iter().map(ObjectId::as_str).collect::<Vec<_>>(),
            vec![first, second]
        );
        assert_eq!(header.time, 1_700_000_500);
    }

    #[test]
    fn test_report_layout() {
        let mut store = MemoryStore::new();
        let readme = store.insert_blob("hello\n");
        let lib = store.insert_blob("fn main() {}\n");
        let src = store.insert_tree(&[(0o100644, "lib.rs", &lib)]);
        let root = store.insert_tree(&[(0o100644, "README", &readme), (0o40000, "src", &src)]);
        let commit = store.insert_commit(&root, &[], 1_700_000_000, "initial");
        store.set_head(&commit);

        let short = |id: &ObjectId| store.short_id(id).unwrap();
        let expected = format!(
            "1 commit {}\n2   tree {}\n3     README blob {}\n3     src tree {}\n4       lib.rs blob {}\n",
            short(&commit),
            short(&root),
            short(&readme),
            short(&src),
            short(&lib),
        );
        assert_eq!(report(&store, 4), expected);
    }

    #[test]
    fn test_walk_is_newest_first_and_bounded() {
        let mut store = MemoryStore::new();
        let tree = store.insert_tree(&[]);
        let base = store.insert_commit(&tree, &[], 100, "base");
        let old_side = store.insert_commit(&tree, &[&base], 150, "old side");
        let new_side = store.insert_commit(&tree, &[&base], 300, "new side");
        let merge = store.insert_commit(&tree, &[&old_side, &new_side], 400, "merge");
        store.set_head(&merge);

        let commits: Vec<String> = report(&store, 10)
            .lines()
            .filter(|line| line.starts_with("1 commit "))
            .map(|line| line["1 commit ".len()..].to_string())
            .collect();
        let short = |id: &ObjectId| store.short_id(id).unwrap();
        assert_eq!(
            commits,
            vec![short(&merge), short(&new_side), short(&old_side), short(&base)]
        );

        let bounded = report(&store, 2);
        assert_eq!(bounded.lines().filter(|l| l.starts_with("1 commit ")).count(), 2);
    }

    #[test]
    fn test_gitlink_is_listed_not_descended() {
        let mut store = MemoryStore::new();
        let submodule = ObjectId::from_hex("a906cb2a4a904a152e80877d4088654daad0c859").unwrap();
        let root = store.insert_tree(&[(0o160000, "vendor", &submodule)]);
        let commit = store.insert_commit(&root, &[], 1, "with submodule");
        store.set_head(&commit);

        let out = report(&store, 1);
        let last = out.lines().last().unwrap();
        assert!(last.starts_with("3     vendor commit "));
        assert_eq!(out.lines().count(), 3);
    }

    #[test]
    fn test_missing_parent_ends_walk() {
        let mut store = MemoryStore::new();
        let tree = store.insert_tree(&[]);
        let ghost = ObjectId::from_hex("96b5e3f3aaadc5e1e6d6e1510c32c8666db98b51").unwrap();
        let tip = store.insert_commit(&tree, &[&ghost], 10, "shallow");
        store.set_head(&tip);

        assert_eq!(report(&store, 4).lines().count(), 2);
    }
}
