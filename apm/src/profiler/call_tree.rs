//! Call trees built from merged stack samples.
//!
//! All nodes of one profiling session live in a single arena so pruning can
//! rank them across every thread category at once. Each category keeps its own
//! map of root nodes.
//!
//! ```text
//! samples (innermost first)        tree for the category
//! [C, B, A]                        A (2)
//! [D, B, A]            ──▶         └── B (2)
//!                                      ├── C (1)
//!                                      └── D (1)
//! ```
//!
//! # Memory
//!
//! Nothing bounds the node count while sampling; every distinct stack adds
//! nodes until the session ends and [`CallForest::prune`] runs. A long session
//! at a short sample period over highly varied stacks can hold a large arena.

use base64::Engine;
use flate2::write::ZlibEncoder;
use flate2::Compression;
use serde::ser::{SerializeMap, SerializeTuple};
use serde::{Serialize, Serializer};
use std::collections::HashMap;
use std::io::Write;

use crate::domain::{ProfileError, ThreadCategory};
use crate::stack::Frame;

pub type NodeId = usize;

/// Identity of a call tree node: where the code is and what it is called.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MethodData {
    pub file: String,
    pub method: String,
    pub line: u32,
}

impl MethodData {
    pub fn new(file: impl Into<String>, method: impl Into<String>, line: u32) -> Self {
        Self { file: file.into(), method: method.into(), line }
    }
}

impl Serialize for MethodData {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        (&self.file, &self.method, self.line).serialize(serializer)
    }
}

#[derive(Debug, Clone)]
pub struct ProfileNode {
    pub method: MethodData,
    pub call_count: u64,
    /// 1 for roots, parent depth + 1 otherwise
    pub depth: usize,
    /// Set by pruning; ignored nodes stay in the arena but are not reported
    pub ignored: bool,
    children: HashMap<MethodData, NodeId>,
}

impl ProfileNode {
    fn new(method: MethodData, depth: usize) -> Self {
        Self { method, call_count: 0, depth, ignored: false, children: HashMap::new() }
    }
}

/// Turn a captured shadow stack into node identities, innermost first.
///
/// The innermost kept frame contributes an extra execution-point entry named
/// `@<function>#<line>` ahead of its own `<function>#<first_line>` entry.
/// Agent frames are dropped from non-agent threads when `ignore_agent_frames`
/// is set.
#[must_use]
pub fn method_stack(
    frames: &[Frame],
    category: ThreadCategory,
    ignore_agent_frames: bool,
) -> Vec<MethodData> {
    let mut stack = Vec::with_capacity(frames.len() + 1);
    let mut leaf = true;

    for frame in frames.iter().rev() {
        if ignore_agent_frames && category != ThreadCategory::Agent && frame.is_agent_code() {
            continue;
        }

        if leaf {
            stack.push(MethodData::new(
                frame.file,
                format!("@{}#{}", frame.function, frame.line),
                frame.line,
            ));
            leaf = false;
        }

        stack.push(MethodData::new(
            frame.file,
            format!("{}#{}", frame.function, frame.first_line),
            frame.line,
        ));
    }

    stack
}

/// Per-category call trees sharing one node arena.
#[derive(Debug, Default)]
pub struct CallForest {
    nodes: Vec<ProfileNode>,
    roots: [HashMap<MethodData, NodeId>; 4],
}

impl CallForest {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Merge one sample into `category`'s trees.
    ///
    /// `stack` is ordered innermost first, so the walk starts at the end: the
    /// outermost frame becomes (or matches) a root and each step moves one
    /// level deeper.
    pub fn merge_stack(&mut self, category: ThreadCategory, stack: &[MethodData]) {
        let mut parent: Option<NodeId> = None;
        let mut depth = 1;
        let mut cursor = stack.len();

        while cursor > 0 {
            cursor -= 1;
            let method = &stack[cursor];

            let existing = match parent {
                None => self.roots[category.index()].get(method).copied(),
                Some(parent) => self.nodes[parent].children.get(method).copied(),
            };

            let id = match existing {
                Some(id) => id,
                None => {
                    let id = self.nodes.len();
                    self.nodes.push(ProfileNode::new(method.clone(), depth));
                    let siblings = match parent {
                        None => &mut self.roots[category.index()],
                        Some(parent) => &mut self.nodes[parent].children,
                    };
                    siblings.insert(method.clone(), id);
                    id
                }
            };

            self.nodes[id].call_count += 1;
            parent = Some(id);
            depth += 1;
        }
    }

    #[must_use]
    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    #[must_use]
    pub fn node(&self, id: NodeId) -> &ProfileNode {
        &self.nodes[id]
    }

    /// Root nodes of `category` in creation order.
    #[must_use]
    pub fn roots(&self, category: ThreadCategory) -> Vec<NodeId> {
        sorted_ids(&self.roots[category.index()])
    }

    /// Children of `id` in creation order.
    #[must_use]
    pub fn children(&self, id: NodeId) -> Vec<NodeId> {
        sorted_ids(&self.nodes[id].children)
    }

    /// Flag all but `limit` nodes as ignored.
    ///
    /// Nodes are ranked by call count, highest first; among equal counts the
    /// shallower node ranks first, and remaining ties keep creation order.
    /// A child is ranked on its own, so it can survive an ignored parent.
    pub fn prune(&mut self, limit: usize) {
        if self.nodes.len() <= limit {
            return;
        }

        let mut order: Vec<NodeId> = (0..self.nodes.len()).collect();
        order.sort_by(|&a, &b| {
            let (a, b) = (&self.nodes[a], &self.nodes[b]);
            b.call_count.cmp(&a.call_count).then(a.depth.cmp(&b.depth))
        });

        for &id in &order[limit..] {
            self.nodes[id].ignored = true;
        }
    }

    /// Reported (non-ignored) root nodes across all categories.
    #[must_use]
    pub fn thread_count(&self) -> usize {
        self.roots.iter().flat_map(HashMap::values).filter(|&&id| !self.nodes[id].ignored).count()
    }

    /// JSON encoding of every reported tree, keyed by category name.
    ///
    /// # Errors
    /// Returns an error if serialization fails
    pub fn to_json(&self) -> Result<Vec<u8>, ProfileError> {
        Ok(serde_json::to_vec(&ForestView { forest: self })?)
    }

    /// zlib-compressed, base64-encoded [`CallForest::to_json`].
    ///
    /// # Errors
    /// Returns an error if serialization or compression fails
    pub fn encode(&self) -> Result<String, ProfileError> {
        let json = self.to_json()?;
        let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(&json)?;
        let compressed = encoder.finish()?;
        Ok(base64::engine::general_purpose::STANDARD.encode(compressed))
    }

    fn reported(&self, ids: Vec<NodeId>) -> Vec<NodeView<'_>> {
        ids.into_iter()
            .filter(|&id| !self.nodes[id].ignored)
            .map(|id| NodeView { forest: self, id })
            .collect()
    }
}

fn sorted_ids(map: &HashMap<MethodData, NodeId>) -> Vec<NodeId> {
    let mut ids: Vec<NodeId> = map.values().copied().collect();
    ids.sort_unstable();
    ids
}

struct ForestView<'a> {
    forest: &'a CallForest,
}

impl Serialize for ForestView<'_> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let buckets: Vec<(ThreadCategory, Vec<NodeView<'_>>)> = ThreadCategory::ALL
            .iter()
            .map(|&category| (category, self.forest.reported(self.forest.roots(category))))
            .filter(|(_, roots)| !roots.is_empty())
            .collect();

        let mut map = serializer.serialize_map(Some(buckets.len()))?;
        for (category, roots) in &buckets {
            map.serialize_entry(category.as_str(), roots)?;
        }
        map.end()
    }
}

/// `[method, call_count, 0, [children...]]`
struct NodeView<'a> {
    forest: &'a CallForest,
    id: NodeId,
}

impl Serialize for NodeView<'_> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let node = self.forest.node(self.id);
        let children = self.forest.reported(self.forest.children(self.id));

        let mut tuple = serializer.serialize_tuple(4)?;
        tuple.serialize_element(&node.method)?;
        tuple.serialize_element(&node.call_count)?;
        tuple.serialize_element(&0)?;
        tuple.serialize_element(&children)?;
        tuple.end()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::read::ZlibDecoder;
    use std::io::Read;

    fn m(name: &str) -> MethodData {
        MethodData::new("app.rs", name, 1)
    }

    /// Build an innermost-first stack from names given outermost first.
    fn stack(outer_to_inner: &[&str]) -> Vec<MethodData> {
        outer_to_inner.iter().rev().map(|name| m(name)).collect()
    }

    fn find(forest: &CallForest, ids: &[NodeId], name: &str) -> NodeId {
        *ids.iter().find(|&&id| forest.node(id).method.method == name).unwrap()
    }

    #[test]
    fn test_merge_shares_common_prefix() {
        let mut forest = CallForest::new();
        forest.merge_stack(ThreadCategory::Request, &stack(&["A", "B", "C"]));
        forest.merge_stack(ThreadCategory::Request, &stack(&["A", "B", "D"]));

        let roots = forest.roots(ThreadCategory::Request);
        assert_eq!(roots.len(), 1);
        let a = forest.node(roots[0]);
        assert_eq!(a.method.method, "A");
        assert_eq!(a.call_count, 2);
        assert_eq!(a.depth, 1);

        let b_ids = forest.children(roots[0]);
        assert_eq!(b_ids.len(), 1);
        let b = forest.node(b_ids[0]);
        assert_eq!(b.call_count, 2);
        assert_eq!(b.depth, 2);

        let leaves = forest.children(b_ids[0]);
        assert_eq!(leaves.len(), 2);
        for name in ["C", "D"] {
            let leaf = forest.node(find(&forest, &leaves, name));
            assert_eq!(leaf.call_count, 1);
            assert_eq!(leaf.depth, 3);
        }
        assert_eq!(forest.node_count(), 4);
    }

    #[test]
    fn test_categories_have_separate_roots() {
        let mut forest = CallForest::new();
        forest.merge_stack(ThreadCategory::Request, &stack(&["A"]));
        forest.merge_stack(ThreadCategory::Background, &stack(&["A"]));
        forest.merge_stack(ThreadCategory::Background, &[]);

        assert_eq!(forest.roots(ThreadCategory::Request).len(), 1);
        assert_eq!(forest.roots(ThreadCategory::Background).len(), 1);
        assert!(forest.roots(ThreadCategory::Other).is_empty());
        assert_eq!(forest.node_count(), 2);
        assert_eq!(forest.thread_count(), 2);
    }

    #[test]
    fn test_deep_stack_merges_without_recursion() {
        let names: Vec<String> = (0..10_000).map(|i| format!("f{i}")).collect();
        let deep: Vec<MethodData> = names.iter().rev().map(|n| m(n)).collect();

        let mut forest = CallForest::new();
        forest.merge_stack(ThreadCategory::Other, &deep);
        assert_eq!(forest.node_count(), 10_000);
        assert_eq!(forest.node(9_999).depth, 10_000);
    }

    #[test]
    fn test_prune_keeps_top_nodes_by_count_then_shallowest() {
        let mut forest = CallForest::new();
        let counts = [5, 5, 4, 4, 3, 3, 2, 2, 1, 1];
        let depths = [3, 1, 2, 4, 1, 2, 5, 1, 2, 3];
        for (i, (&count, &depth)) in counts.iter().zip(depths.iter()).enumerate() {
            let mut node = ProfileNode::new(m(&format!("n{i}")), depth);
            node.call_count = count;
            forest.nodes.push(node);
        }

        forest.prune(4);

        let kept: Vec<NodeId> = (0..10).filter(|&id| !forest.node(id).ignored).collect();
        // count 5 at depths 3 and 1, then count 4 at depth 2 before depth 4
        assert_eq!(kept, [0, 1, 2, 3]);

        let mut ranked: Vec<NodeId> = (0..10).collect();
        ranked.sort_by(|&a, &b| {
            let (a, b) = (forest.node(a), forest.node(b));
            b.call_count.cmp(&a.call_count).then(a.depth.cmp(&b.depth))
        });
        assert_eq!(&ranked[..4], &[1, 0, 2, 3]);
    }

    #[test]
    fn test_prune_prefers_shallow_on_ties() {
        // Linear chain with equal counts: the root end survives
        let mut forest = CallForest::new();
        forest.merge_stack(ThreadCategory::Request, &stack(&["A", "B", "C", "D"]));
        forest.prune(2);

        let names: Vec<&str> = (0..forest.node_count())
            .filter(|&id| !forest.node(id).ignored)
            .map(|id| forest.node(id).method.method.as_str())
            .collect();
        assert_eq!(names, ["A", "B"]);
    }

    #[test]
    fn test_prune_within_limit_is_noop() {
        let mut forest = CallForest::new();
        forest.merge_stack(ThreadCategory::Request, &stack(&["A", "B"]));
        forest.prune(2);
        assert!((0..2).all(|id| !forest.node(id).ignored));
    }

    #[test]
    fn test_json_omits_ignored_nodes_and_empty_categories() {
        let mut forest = CallForest::new();
        forest.merge_stack(ThreadCategory::Request, &stack(&["A", "B"]));
        forest.merge_stack(ThreadCategory::Request, &stack(&["A"]));
        forest.merge_stack(ThreadCategory::Other, &stack(&["X"]));
        forest.prune(2);

        let json: serde_json::Value = serde_json::from_slice(&forest.to_json().unwrap()).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "REQUEST": [[["app.rs", "A", 1], 2, 0, []]],
                "OTHER": [[["app.rs", "X", 1], 1, 0, []]],
            })
        );
    }

    #[test]
    fn test_encode_is_base64_zlib_json() {
        let mut forest = CallForest::new();
        forest.merge_stack(ThreadCategory::Background, &stack(&["job", "step"]));

        let encoded = forest.encode().unwrap();
        let compressed = base64::engine::general_purpose::STANDARD.decode(encoded).unwrap();
        let mut json = String::new();
        ZlibDecoder::new(compressed.as_slice()).read_to_string(&mut json).unwrap();

        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["BACKGROUND"][0][0][1], "job");
        assert_eq!(value["BACKGROUND"][0][3][0][0][1], "step");
    }

    #[test]
    fn test_method_stack_adds_execution_point_leaf() {
        let frames = [
            Frame { file: "src/main.rs", function: "main", first_line: 10, line: 14, module: "myapp" },
            Frame { file: "src/db.rs", function: "query", first_line: 30, line: 37, module: "myapp::db" },
        ];
        let methods = method_stack(&frames, ThreadCategory::Request, true);
        let names: Vec<&str> = methods.iter().map(|m| m.method.as_str()).collect();
        assert_eq!(names, ["@query#37", "query#30", "main#10"]);
        assert!(methods.iter().all(|m| m.line == 37 || m.line == 14));
        assert_eq!(methods[2].line, 14);
    }

    #[test]
    fn test_method_stack_drops_agent_frames_outside_agent_threads() {
        let frames = [
            Frame { file: "src/main.rs", function: "main", first_line: 1, line: 2, module: "myapp" },
            Frame { file: "src/application.rs", function: "record", first_line: 5, line: 6, module: "apm::application" },
        ];

        let user = method_stack(&frames, ThreadCategory::Request, true);
        let names: Vec<&str> = user.iter().map(|m| m.method.as_str()).collect();
        assert_eq!(names, ["@main#2", "main#1"]);

        let agent = method_stack(&frames, ThreadCategory::Agent, true);
        assert_eq!(agent[0].method, "@record#6");

        let unfiltered = method_stack(&frames, ThreadCategory::Request, false);
        assert_eq!(unfiltered.len(), 3);
    }
}
