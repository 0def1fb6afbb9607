//! Flattening decoded objects into the element stream sent to the observer.

use std::collections::HashMap;

use indicatif::{ProgressBar, ProgressStyle};
use serde::{ser::SerializeStruct, Serialize, Serializer};

use crate::{
    decode::{decode, DecodeOptions, Edge, Node},
    error::Error,
    identity::ObjectId,
    store::{ObjectKind, ObjectStore},
};

/// Show a progress bar for snapshots larger than this
const PROGRESS_THRESHOLD: usize = 100;

/// Node or edge, serialised as `{"data": {...}}`
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GraphElement {
    Node(Node),
    Edge(Edge),
}

impl GraphElement {
    /// Key used for last-write-wins in [`Graph`]
    pub fn id(&self) -> &str {
        match self {
            GraphElement::Node(node) => node.id.as_str(),
            GraphElement::Edge(edge) => &edge.id,
        }
    }

    pub fn is_node(&self) -> bool {
        matches!(self, GraphElement::Node(_))
    }

    pub fn to_json(&self) -> Result<String, Error> {
        Ok(serde_json::to_string(self)?)
    }
}

/// Shape hint for the observer's renderer
fn node_shape(kind: ObjectKind) -> &'static str {
    match kind {
        ObjectKind::Commit => "ellipse",
        ObjectKind::Tree => "round-triangle",
        ObjectKind::Blob => "round-rectangle",
        ObjectKind::Tag => "round-tag",
        ObjectKind::Unknown => "ellipse",
    }
}

fn node_color(kind: ObjectKind) -> &'static str {
    match kind {
        ObjectKind::Commit => "green",
        ObjectKind::Tree => "blue",
        ObjectKind::Blob => "red",
        ObjectKind::Tag => "gray",
        ObjectKind::Unknown => "green",
    }
}

struct NodeData<'a>(&'a Node);

impl Serialize for NodeData<'_> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let node = self.0;
        let mut data = serializer.serialize_struct("NodeData", 7)?;
        data.serialize_field("id", &node.id)?;
        data.serialize_field("shortId", &node.short_id)?;
        data.serialize_field("type", node_shape(node.kind))?;
        data.serialize_field("color", node_color(node.kind))?;
        data.serialize_field("objectType", node.kind.as_str())?;
        data.serialize_field("size", &node.size)?;
        data.serialize_field("content", &node.content)?;
        data.end()
    }
}

#[derive(Serialize)]
struct EdgeData<'a> {
    id: &'a str,
    source: &'a ObjectId,
    target: &'a ObjectId,
}

#[derive(Serialize)]
struct Envelope<T> {
    data: T,
}

impl Serialize for GraphElement {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            GraphElement::Node(node) => Envelope {
                data: NodeData(node),
            }
            .serialize(serializer),
            GraphElement::Edge(edge) => Envelope {
                data: EdgeData {
                    id: &edge.id,
                    source: &edge.source,
                    target: &edge.target,
                },
            }
            .serialize(serializer),
        }
    }
}

/// Everything known to a session, keyed by element id with last-write-wins.
/// Insertion order of first appearance is kept.
#[derive(Debug, Default)]
pub struct Graph {
    index: HashMap<String, usize>,
    elements: Vec<GraphElement>,
}

impl Graph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, element: GraphElement) {
        match self.index.get(element.id()) {
            Some(&pos) => self.elements[pos] = element,
            None => {
                self.index.insert(element.id().to_string(), self.elements.len());
                self.elements.push(element);
            }
        }
    }

    pub fn get(&self, id: &str) -> Option<&GraphElement> {
        self.index.get(id).map(|&pos| &self.elements[pos])
    }

    pub fn elements(&self) -> &[GraphElement] {
        &self.elements
    }

    pub fn len(&self) -> usize {
        self.elements.len()
    }

    pub fn is_empty(&self) -> bool {
        self.elements.is_empty()
    }

    pub fn node_count(&self) -> usize {
        self.elements.iter().filter(|e| e.is_node()).count()
    }

    pub fn edge_count(&self) -> usize {
        self.len() - self.node_count()
    }
}

impl Extend<GraphElement> for Graph {
    fn extend<I: IntoIterator<Item = GraphElement>>(&mut self, iter: I) {
        for element in iter {
            self.insert(element);
        }
    }
}

/// Result of decoding a full enumeration
#[derive(Debug, Default)]
pub struct Snapshot {
    /// Each node immediately followed by its edges, in enumeration order
    pub elements: Vec<GraphElement>,
    /// Objects left out because their payload was malformed
    pub skipped: Vec<ObjectId>,
}

impl Snapshot {
    pub fn node_count(&self) -> usize {
        self.elements.iter().filter(|e| e.is_node()).count()
    }

    /// Add the decode result for `id`. Malformed objects are recorded as
    /// skipped; any other error is returned and ends the snapshot.
    pub fn record(
        &mut self,
        id: &ObjectId,
        decoded: Result<(Node, Vec<Edge>), Error>,
    ) -> Result<(), Error> {
        match decoded {
            Ok((node, edges)) => self.elements.extend(flatten(node, edges)),
            Err(e @ Error::MalformedObject { .. }) => {
                tracing::warn!("Skipping object in snapshot: {}", e);
                self.skipped.push(id.clone());
            }
            Err(e) => return Err(e),
        }
        Ok(())
    }
}

fn flatten(node: Node, edges: Vec<Edge>) -> impl Iterator<Item = GraphElement> {
    std::iter::once(GraphElement::Node(node)).chain(edges.into_iter().map(GraphElement::Edge))
}

/// Progress bar for snapshots of more than a handful of objects
pub fn snapshot_progress(total: usize) -> Option<ProgressBar> {
    if total <= PROGRESS_THRESHOLD {
        return None;
    }
    let bar = ProgressBar::new(total as u64);
    bar.set_style(
        ProgressStyle::default_bar()
            .template("  {msg} [{bar:40.cyan/blue}] {pos}/{len} objects ({eta})")
            .expect("Failed to create progress template")
            .progress_chars("█▓░"),
    );
    bar.set_message("Decoding objects");
    Some(bar)
}

/// Decode every id in order. A missing object aborts the snapshot since the
/// enumeration just listed it; malformed objects are logged and skipped.
/// Duplicate edges are kept as emitted.
pub fn snapshot<S: ObjectStore + ?Sized>(
    store: &S,
    ids: &[ObjectId],
    options: &DecodeOptions,
) -> Result<Snapshot, Error> {
    let pb = snapshot_progress(ids.len());

    let mut result = Snapshot::default();
    for id in ids {
        if let Err(e) = result.record(id, decode(store, id, options)) {
            if let Some(ref bar) = pb {
                bar.abandon();
            }
            return Err(e);
        }
        if let Some(ref bar) = pb {
            bar.inc(1);
        }
    }

    if let Some(ref bar) = pb {
        bar.finish_with_message("Snapshot decoded");
    }

    Ok(result)
}

/// Single-object variant of [`snapshot`], for incremental pushes
pub fn update<S: ObjectStore + ?Sized>(
    store: &S,
    id: &ObjectId,
    options: &DecodeOptions,
) -> Result<Vec<GraphElement>, Error> {
    let (node, edges) = decode(store, id, options)?;
    Ok(flatten(node, edges).collect())
}
