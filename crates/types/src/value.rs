//! Pool values and branch-lane bookkeeping.
//!
//! A variable written inside a branch arm no longer holds a plain list: each
//! element ("lane") remembers which arm it was routed to at every nesting depth.
//! [`WrappedSequence`] carries those per-lane tags together with an optional data
//! slot, where `None` means "not written by the arm that owns this lane".

use std::{collections::BTreeMap, fmt};

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;

/// Branch state selected at each depth, keyed by depth.
pub type LaneTags = BTreeMap<usize, String>;

/// One `(depth, state)` pair of a [`BranchPath`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BranchSegment {
    pub depth: usize,
    pub state: String,
}

/// Stack of branch arms active for the current interpreter frame.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BranchPath {
    segments: Vec<BranchSegment>,
}

impl BranchPath {
    pub fn root() -> Self {
        Self::default()
    }

    pub fn is_root(&self) -> bool {
        self.segments.is_empty()
    }

    /// Returns a copy of this path with one more arm selected.
    pub fn extended(&self, depth: usize, state: impl Into<String>) -> Self {
        let mut segments = self.segments.clone();
        segments.push(BranchSegment {
            depth,
            state: state.into(),
        });
        Self { segments }
    }

    pub fn segments(&self) -> &[BranchSegment] {
        &self.segments
    }

    /// A lane matches when its tags agree with every segment of the path.
    pub fn matches(&self, tags: &LaneTags) -> bool {
        self.segments
            .iter()
            .all(|segment| tags.get(&segment.depth) == Some(&segment.state))
    }
}

impl fmt::Display for BranchPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.segments.is_empty() {
            return f.write_str("root");
        }
        let rendered: Vec<String> = self
            .segments
            .iter()
            .map(|segment| format!("{}:{}", segment.depth, segment.state))
            .collect();
        f.write_str(&rendered.join("/"))
    }
}

/// A single lane of a [`WrappedSequence`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LaneRecord {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<JsonValue>,
    #[serde(default)]
    pub tags: LaneTags,
}

/// Raised when a partial result does not line up with the lanes it targets.
#[derive(Debug, Clone, Copy, Error, PartialEq, Eq)]
#[error("expected {expected} lanes, got {actual}")]
pub struct LaneCountMismatch {
    pub expected: usize,
    pub actual: usize,
}

/// Ordered lanes of a variable written under branch control.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WrappedSequence {
    lanes: Vec<LaneRecord>,
}

impl WrappedSequence {
    pub fn new(lanes: Vec<LaneRecord>) -> Self {
        Self { lanes }
    }

    /// Builds a fresh sequence from router output, tagging every lane at `depth`.
    pub fn routed(entries: Vec<(JsonValue, String)>, depth: usize) -> Self {
        let lanes = entries
            .into_iter()
            .map(|(data, state)| LaneRecord {
                data: Some(data),
                tags: LaneTags::from([(depth, state)]),
            })
            .collect();
        Self { lanes }
    }

    /// Copies the lane layout of `skeleton` with every data slot unset.
    pub fn skeleton_of(skeleton: &WrappedSequence) -> Self {
        let lanes = skeleton
            .lanes
            .iter()
            .map(|lane| LaneRecord {
                data: None,
                tags: lane.tags.clone(),
            })
            .collect();
        Self { lanes }
    }

    pub fn lanes(&self) -> &[LaneRecord] {
        &self.lanes
    }

    pub fn len(&self) -> usize {
        self.lanes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lanes.is_empty()
    }

    pub fn matching_indices(&self, path: &BranchPath) -> Vec<usize> {
        self.lanes
            .iter()
            .enumerate()
            .filter(|(_, lane)| path.matches(&lane.tags))
            .map(|(index, _)| index)
            .collect()
    }

    /// Data of the lanes selected by `path`, skipping unset lanes.
    pub fn filtered(&self, path: &BranchPath) -> Vec<JsonValue> {
        self.lanes
            .iter()
            .filter(|lane| path.matches(&lane.tags))
            .filter_map(|lane| lane.data.clone())
            .collect()
    }

    /// Full-width data with unset lanes rendered as `null`.
    pub fn unwrapped(&self) -> Vec<JsonValue> {
        self.lanes
            .iter()
            .map(|lane| lane.data.clone().unwrap_or(JsonValue::Null))
            .collect()
    }

    /// Number of lanes selected by `path`. Lanes routed elsewhere never carry the deeper tags.
    pub fn matching_len(&self, path: &BranchPath) -> usize {
        self.lanes.iter().filter(|lane| path.matches(&lane.tags)).count()
    }

    /// Writes `items` into the lanes selected by `path`, in lane order.
    pub fn fill_matching(&mut self, path: &BranchPath, items: Vec<JsonValue>) -> Result<(), LaneCountMismatch> {
        let indices = self.matching_indices(path);
        if indices.len() != items.len() {
            return Err(LaneCountMismatch {
                expected: indices.len(),
                actual: items.len(),
            });
        }
        for (index, item) in indices.into_iter().zip(items) {
            self.lanes[index].data = Some(item);
        }
        Ok(())
    }

    /// Writes router output into the lanes selected by `path` and tags them at `depth`.
    ///
    /// Tags at `depth` and deeper are cleared first so a re-run router never leaves
    /// stale arm selections behind.
    pub fn route_matching(
        &mut self,
        path: &BranchPath,
        depth: usize,
        entries: Vec<(JsonValue, String)>,
    ) -> Result<(), LaneCountMismatch> {
        let indices = self.matching_indices(path);
        if indices.len() != entries.len() {
            return Err(LaneCountMismatch {
                expected: indices.len(),
                actual: entries.len(),
            });
        }
        for (index, (data, state)) in indices.into_iter().zip(entries) {
            let lane = &mut self.lanes[index];
            lane.data = Some(data);
            lane.tags.retain(|tag_depth, _| *tag_depth < depth);
            lane.tags.insert(depth, state);
        }
        Ok(())
    }

    /// Replaces the tags of the given lanes with those of `source`.
    pub fn copy_tags_from(&mut self, source: &WrappedSequence, indices: &[usize]) {
        for &index in indices {
            if let (Some(lane), Some(origin)) = (self.lanes.get_mut(index), source.lanes.get(index)) {
                lane.tags = origin.tags.clone();
            }
        }
    }
}

/// Value held by a pool variable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum PoolValue {
    Scalar(JsonValue),
    Sequence(Vec<JsonValue>),
    Wrapped(WrappedSequence),
}

impl Default for PoolValue {
    fn default() -> Self {
        PoolValue::Scalar(JsonValue::Null)
    }
}

impl PoolValue {
    pub fn from_json(value: JsonValue) -> Self {
        match value {
            JsonValue::Array(items) => PoolValue::Sequence(items),
            other => PoolValue::Scalar(other),
        }
    }

    /// Plain JSON view; wrapped sequences are flattened to full width.
    pub fn to_json(&self) -> JsonValue {
        match self {
            PoolValue::Scalar(value) => value.clone(),
            PoolValue::Sequence(items) => JsonValue::Array(items.clone()),
            PoolValue::Wrapped(wrapped) => JsonValue::Array(wrapped.unwrapped()),
        }
    }

    pub fn as_wrapped(&self) -> Option<&WrappedSequence> {
        match self {
            PoolValue::Wrapped(wrapped) => Some(wrapped),
            _ => None,
        }
    }

    pub fn is_wrapped(&self) -> bool {
        matches!(self, PoolValue::Wrapped(_))
    }
}
