// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Conversion of sampled call stacks into a segment tree.
//!
//! The sampling profiler hands over a time-ordered list of samples, each a
//! call stack rendered as frame names joined by `==>` (outermost first):
//!
//! ```text
//! 1700000000.000  main()==>run==>query
//! 1700000000.005  main()==>run==>query
//! 1700000000.010  main()==>run==>render
//! ```
//!
//! Consecutive samples that share a frame at the same depth are merged into
//! one node, so the tree above has `run` once with two children. Merging only
//! ever looks at the most recent sibling: a frame that reappears after a
//! different sibling is a new call and gets its own node.

use lazy_static::lazy_static;
use regex::Regex;
use tracing::debug;

use crate::error::TracerError;
use crate::ids::new_segment_id;
use crate::segment::Segment;

pub const FRAME_SEPARATOR: &str = "==>";

/// Name of the synthetic root node.
pub const ENTRY_POINT: &str = "main()";

/// Name given to the top of the converted profile subsegment.
pub const PROFILE_SEGMENT_NAME: &str = "profile";

lazy_static! {
    static ref DISALLOWED_NAME_CHARS: Option<Regex> = Regex::new(r"[^\w\s_.:/%&#=+\\\-@]").ok();
}

/// One profiler sample.
#[derive(Debug, Clone, PartialEq)]
pub struct StackSample {
    pub timestamp: f64,
    pub stack: String,
}

impl StackSample {
    #[must_use]
    pub fn new(timestamp: f64, stack: impl Into<String>) -> Self {
        Self {
            timestamp,
            stack: stack.into(),
        }
    }
}

/// Samples captured for a request along with the sampling interval.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Profile {
    pub samples: Vec<StackSample>,
    /// Seconds covered by each sample.
    pub sample_duration: f64,
}

/// A call-tree node. `value` is the time attributed to the frame.
#[derive(Debug, Clone, PartialEq)]
pub struct SamplingNode {
    pub name: String,
    pub value: f64,
    pub children: Vec<SamplingNode>,
    pub start_time: f64,
    pub end_time: f64,
}

impl SamplingNode {
    fn new(name: &str, start_time: f64, width: f64) -> Self {
        Self {
            name: name.to_string(),
            value: width,
            children: Vec::new(),
            start_time,
            end_time: start_time + width,
        }
    }

    fn absorb(&mut self, duration: f64) {
        self.value += duration;
        self.end_time += duration;
    }

    /// Converts the tree 1:1 into segments with fresh ids.
    pub fn into_segment(self, trace_id: &str) -> Result<Segment, TracerError> {
        let mut segment = Segment::new(
            sanitize_name(&self.name),
            new_segment_id()?,
            trace_id,
            self.start_time,
        );
        segment.close(self.end_time);
        segment.subsegments = self
            .children
            .into_iter()
            .map(|child| child.into_segment(trace_id))
            .collect::<Result<_, _>>()?;
        Ok(segment)
    }
}

/// Strips characters the X-Ray console does not accept in segment names.
#[must_use]
pub fn sanitize_name(name: &str) -> String {
    match DISALLOWED_NAME_CHARS.as_ref() {
        Some(regex) => regex.replace_all(name, "").into_owned(),
        None => name.to_string(),
    }
}

/// Adds `frames` below `siblings`, merging into the last sibling when it
/// has the same name.
fn add_frames(siblings: &mut Vec<SamplingNode>, frames: &[&str], timestamp: f64, duration: f64) {
    let Some((frame, rest)) = frames.split_first() else {
        return;
    };
    match siblings.last_mut() {
        Some(last) if last.name == *frame => last.absorb(duration),
        _ => siblings.push(SamplingNode::new(frame, timestamp, duration)),
    }
    if let Some(node) = siblings.last_mut() {
        add_frames(&mut node.children, rest, timestamp, duration);
    }
}

/// Builds call trees from stack samples.
#[derive(Debug, Clone)]
pub struct ProfileBuilder {
    entry_point: String,
    max_samples: usize,
}

impl Default for ProfileBuilder {
    fn default() -> Self {
        Self::new(crate::config::DEFAULT_MAX_STACK_SAMPLES)
    }
}

impl ProfileBuilder {
    /// `max_samples` bounds how many samples end up in the tree; it is
    /// raised to 1 if zero.
    #[must_use]
    pub fn new(max_samples: usize) -> Self {
        Self {
            entry_point: ENTRY_POINT.to_string(),
            max_samples: max_samples.max(1),
        }
    }

    /// Names the root node. Samples whose outermost frame carries this name
    /// are merged into the root instead of nested below it.
    #[must_use]
    pub fn with_entry_point(mut self, entry_point: impl Into<String>) -> Self {
        self.entry_point = entry_point.into();
        self
    }

    /// Builds the call tree for `samples`, rooted at a zero-width node
    /// anchored at `request_start`.
    ///
    /// Above `max_samples`, every Nth sample is kept (N = ceil(count / max))
    /// and each kept sample is stretched so the total duration covered is
    /// unchanged.
    #[must_use]
    pub fn build(
        &self,
        samples: &[StackSample],
        sample_duration: f64,
        request_start: f64,
    ) -> SamplingNode {
        let mut root = SamplingNode::new(&self.entry_point, request_start, 0.0);
        if samples.is_empty() {
            return root;
        }

        let step = samples.len().div_ceil(self.max_samples);
        let kept = samples.len().div_ceil(step);
        let duration = sample_duration * samples.len() as f64 / kept as f64;
        if step > 1 {
            debug!(
                "Subsampling profile: keeping {} of {} samples at {:.6}s each",
                kept,
                samples.len(),
                duration
            );
        }

        for sample in samples.iter().step_by(step) {
            let frames: Vec<&str> = sample
                .stack
                .split(FRAME_SEPARATOR)
                .filter(|frame| !frame.is_empty())
                .collect();
            let nested = match frames.split_first() {
                Some((outer, rest)) if *outer == root.name => rest,
                _ => frames.as_slice(),
            };
            root.absorb(duration);
            add_frames(&mut root.children, nested, sample.timestamp, duration);
        }

        root
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const EPSILON: f64 = 1e-9;

    fn samples(raw: &[(f64, &str)]) -> Vec<StackSample> {
        raw.iter().map(|(t, s)| StackSample::new(*t, *s)).collect()
    }

    fn approx(a: f64, b: f64) -> bool {
        (a - b).abs() < EPSILON
    }

    #[test]
    fn test_empty_profile_is_zero_width_root() {
        let root = ProfileBuilder::default().build(&[], 0.005, 100.0);
        assert_eq!(root.name, ENTRY_POINT);
        assert!(root.children.is_empty());
        assert!(approx(root.start_time, 100.0));
        assert!(approx(root.end_time, 100.0));
        assert!(approx(root.value, 0.0));
    }

    #[test]
    fn test_adjacent_frames_are_merged() {
        let root = ProfileBuilder::default().with_entry_point("main").build(
            &samples(&[(0.0, "main"), (0.005, "main==>foo"), (0.010, "main==>foo")]),
            0.005,
            0.0,
        );
        assert_eq!(root.name, "main");
        assert_eq!(root.children.len(), 1);
        let foo = &root.children[0];
        assert_eq!(foo.name, "foo");
        assert!(approx(foo.value, 0.010));
        assert!(approx(foo.start_time, 0.005));
        assert!(approx(foo.end_time, 0.015));
        assert!(approx(root.value, 0.015));
    }

    #[test]
    fn test_non_adjacent_frames_are_not_merged() {
        let root = ProfileBuilder::default().build(
            &samples(&[
                (1.0, "main()==>a==>x"),
                (1.1, "main()==>b"),
                (1.2, "main()==>a==>x"),
            ]),
            0.1,
            1.0,
        );
        let names: Vec<&str> = root.children.iter().map(|n| n.name.as_str()).collect();
        assert_eq!(names, ["a", "b", "a"]);
        assert!(approx(root.children[2].start_time, 1.2));
        assert_eq!(root.children[2].children.len(), 1);
    }

    #[test]
    fn test_deeper_stack_creates_new_children() {
        let root = ProfileBuilder::default().build(
            &samples(&[(1.0, "main()==>a"), (1.1, "main()==>a==>b==>c")]),
            0.1,
            1.0,
        );
        let a = &root.children[0];
        assert!(approx(a.value, 0.2));
        let b = &a.children[0];
        assert_eq!(b.name, "b");
        assert!(approx(b.start_time, 1.1));
        assert_eq!(b.children[0].name, "c");
    }

    #[test]
    fn test_foreign_entry_point_is_nested_under_root() {
        let root = ProfileBuilder::default().build(&samples(&[(1.0, "{closure}==>x")]), 0.1, 1.0);
        assert_eq!(root.name, ENTRY_POINT);
        assert_eq!(root.children[0].name, "{closure}");
        assert_eq!(root.children[0].children[0].name, "x");
    }

    #[test]
    fn test_subsampling_preserves_total_time() {
        let raw: Vec<StackSample> = (0..2500)
            .map(|i| StackSample::new(f64::from(i) * 0.001, "main()==>loop"))
            .collect();
        let root = ProfileBuilder::new(1000).build(&raw, 0.001, 0.0);
        assert!((root.value - 2.5).abs() < 1e-6);
        assert!((root.children[0].value - 2.5).abs() < 1e-6);
    }

    #[test]
    fn test_subsampling_keeps_every_nth_sample() {
        let raw = samples(&[
            (0.0, "main()==>a"),
            (0.1, "main()==>b"),
            (0.2, "main()==>c"),
            (0.3, "main()==>d"),
            (0.4, "main()==>e"),
        ]);
        let root = ProfileBuilder::new(2).build(&raw, 0.1, 0.0);
        let names: Vec<&str> = root.children.iter().map(|n| n.name.as_str()).collect();
        assert_eq!(names, ["a", "d"]);
        assert!((root.children[0].value - 0.25).abs() < 1e-9);
    }

    #[test]
    fn test_sanitize_name() {
        assert_eq!(sanitize_name("WP_Hook::apply_filters"), "WP_Hook::apply_filters");
        assert_eq!(sanitize_name("{closure}"), "closure");
        assert_eq!(sanitize_name("load::wp-settings.php@2"), "load::wp-settings.php@2");
        assert_eq!(sanitize_name("a<b>(c)"), "abc");
    }

    #[test]
    fn test_into_segment_converts_tree() {
        let root = ProfileBuilder::default().build(
            &samples(&[(1.0, "main()==>a==>b"), (1.1, "main()==>c")]),
            0.1,
            1.0,
        );
        let segment = root.into_segment("1-abc-def").unwrap();
        assert_eq!(segment.tree_len(), 4);
        assert_eq!(segment.subsegments[0].name, "a");
        assert_eq!(segment.subsegments[0].subsegments[0].name, "b");
        assert!(!segment.in_progress);
        assert_eq!(segment.subsegments[1].trace_id, "1-abc-def");
        assert_ne!(segment.id, segment.subsegments[0].id);
        assert!(approx(segment.end_time.unwrap(), 1.2));
    }
}
