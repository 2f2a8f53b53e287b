use std::{collections::HashMap, sync::Arc};

use serde::{ser::SerializeStruct, Serialize, Serializer};

use crate::stack::Frame;

/// Which counter orders a query's results.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Metric {
  /// Everything ever allocated through a node (churn).
  Total,
  /// Allocations still live (leak candidates).
  Retained,
}

impl Metric {
  fn pick(self, total: u64, retained: u64) -> u64 {
    match self {
      Self::Total => total,
      Self::Retained => retained,
    }
  }
}

/// Handle to a node in a [`CallTree`].
///
/// Returned by [`CallTree::record`] so the owner can issue
/// [`CallTree::decrement_path`] when the allocation recorded there dies.
/// Handles are invalidated by [`CallTree::clear`].
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct NodeId(usize);

const ROOT: NodeId = NodeId(0);

#[derive(Debug)]
struct Node {
  frame: Option<Frame>,
  parent: Option<NodeId>,
  children: HashMap<Arc<str>, NodeId>,
  total: u64,
  retained: u64,
}

impl Node {
  fn root() -> Self {
    Self {
      frame: None,
      parent: None,
      children: HashMap::new(),
      total: 0,
      retained: 0,
    }
  }

  fn child(frame: Frame, parent: NodeId) -> Self {
    Self {
      frame: Some(frame),
      parent: Some(parent),
      children: HashMap::new(),
      total: 0,
      retained: 0,
    }
  }
}

/// Prefix-compressed tree of allocation stacks.
///
/// Stacks share long common prefixes; storing each one linearly would cost
/// `stack_depth x allocations` entries. One node per distinct prefix makes
/// recording O(stack_depth) and serves both per-path and per-frame queries.
/// Every node carries a total and a retained counter, maintained by the same
/// leaf-to-root walk.
#[derive(Debug)]
pub struct CallTree {
  nodes: Vec<Node>,
}

impl Default for CallTree {
  fn default() -> Self {
    Self {
      nodes: vec![Node::root()],
    }
  }
}

impl CallTree {
  #[must_use]
  pub fn new() -> Self {
    Self::default()
  }

  /// Record one observed stack, frames ordered outermost first.
  ///
  /// Creates nodes as needed, increments both counters along the path, and
  /// returns the leaf handle. An empty stack records nothing.
  pub fn record(&mut self, frames: &[Frame]) -> Option<NodeId> {
    if frames.is_empty() {
      return None;
    }

    let mut current = ROOT;

    for frame in frames {
      current = self.find_or_create_child(current, frame);
    }

    self.increment_path(current);

    Some(current)
  }

  fn find_or_create_child(&mut self, parent: NodeId, frame: &Frame) -> NodeId {
    let key = frame.location_key();

    if let Some(existing) = self.nodes[parent.0].children.get(key.as_str()) {
      return *existing;
    }

    let id = NodeId(self.nodes.len());
    self.nodes.push(Node::child(frame.clone(), parent));
    self.nodes[parent.0].children.insert(Arc::from(key), id);

    id
  }

  fn increment_path(&mut self, leaf: NodeId) {
    let mut current = Some(leaf);

    while let Some(id) = current {
      let node = &mut self.nodes[id.0];
      node.total += 1;
      node.retained += 1;
      current = node.parent;
    }
  }

  /// Mark one allocation recorded at `leaf` as dead.
  ///
  /// Walks leaf to root decrementing the retained counter only; churn totals
  /// are permanent. A handle invalidated by `clear` is ignored.
  pub fn decrement_path(&mut self, leaf: NodeId) {
    if leaf.0 >= self.nodes.len() {
      return;
    }

    let mut current = Some(leaf);

    while let Some(id) = current {
      let node = &mut self.nodes[id.0];
      node.retained = node.retained.saturating_sub(1);
      current = node.parent;
    }
  }

  /// Total allocations ever recorded through the tree.
  #[must_use]
  pub fn total_allocations(&self) -> u64 {
    self.nodes[ROOT.0].total
  }

  /// Allocations recorded and not yet decremented.
  #[must_use]
  pub fn retained_allocations(&self) -> u64 {
    self.nodes[ROOT.0].retained
  }

  /// Replace the tree with a fresh empty root. Outstanding handles become
  /// stale and are ignored from then on.
  pub fn clear(&mut self) {
    self.nodes.clear();
    self.nodes.push(Node::root());
  }

  /// The `limit` heaviest root-to-leaf paths by the chosen metric.
  #[must_use]
  pub fn top_paths(&self, limit: usize, by: Metric) -> Vec<PathStats> {
    if limit == 0 {
      return Vec::new();
    }

    let mut paths: Vec<PathStats> = (1..self.nodes.len())
      .filter(|index| self.nodes[*index].children.is_empty())
      .map(|index| {
        let node = &self.nodes[index];

        PathStats {
          frames: self.path_to(NodeId(index)),
          total: node.total,
          retained: node.retained,
        }
      })
      .collect();

    paths.sort_by(|a, b| {
      by.pick(b.total, b.retained).cmp(&by.pick(a.total, a.retained))
    });
    paths.truncate(limit);

    paths
  }

  /// The `limit` heaviest source locations, counters summed across every
  /// node denoting that location.
  #[must_use]
  pub fn hotspots(&self, limit: usize, by: Metric) -> Vec<HotSpot> {
    if limit == 0 {
      return Vec::new();
    }

    let mut by_location: HashMap<String, (u64, u64)> = HashMap::new();

    for node in &self.nodes[1..] {
      if let Some(frame) = &node.frame {
        let entry = by_location.entry(frame.location_key()).or_default();
        entry.0 += node.total;
        entry.1 += node.retained;
      }
    }

    let mut spots: Vec<HotSpot> = by_location
      .into_iter()
      .map(|(location, (total, retained))| HotSpot {
        location,
        total,
        retained,
      })
      .collect();

    spots.sort_by(|a, b| {
      by.pick(b.total, b.retained).cmp(&by.pick(a.total, a.retained))
    });
    spots.truncate(limit);

    spots
  }

  fn path_to(&self, leaf: NodeId) -> Vec<Frame> {
    let mut frames = Vec::new();
    let mut current = Some(leaf);

    while let Some(id) = current {
      let node = &self.nodes[id.0];

      if let Some(frame) = &node.frame {
        frames.push(frame.clone());
      }

      current = node.parent;
    }

    frames.reverse();
    frames
  }
}

#[derive(Serialize)]
struct FrameExport<'a> {
  path: &'a str,
  label: &'a str,
  line: u32,
}

/// One root-to-leaf path with its counters, frames outermost first.
#[derive(Clone, Debug)]
pub struct PathStats {
  pub frames: Vec<Frame>,
  pub total: u64,
  pub retained: u64,
}

impl Serialize for PathStats {
  fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
  where
    S: Serializer,
  {
    let frames = self
      .frames
      .iter()
      .map(|frame| FrameExport {
        path: frame.path.as_ref(),
        label: frame.label.as_ref(),
        line: frame.line,
      })
      .collect::<Vec<FrameExport<'_>>>();

    let mut state = serializer.serialize_struct("PathStats", 3)?;
    state.serialize_field("frames", &frames)?;
    state.serialize_field("total", &self.total)?;
    state.serialize_field("retained", &self.retained)?;
    state.end()
  }
}

/// Aggregate counters for one source location across every path through it.
#[derive(Clone, Debug, Serialize)]
pub struct HotSpot {
  pub location: String,
  pub total: u64,
  pub retained: u64,
}
