// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Splitting of segment trees that do not fit in one datagram.
//!
//! A tree whose encoding is under budget is sent as is. Otherwise its
//! subsegments are detached, the parent goes out on its own and every child
//! is re-linked to it through `parent_id` and flattened in turn. Leaves are
//! never split further: an oversized leaf is emitted anyway and logged.

use tracing::{debug, warn};

use crate::encoding::serialized_len;
use crate::segment::{Segment, SegmentKind};

/// Splits `segment` into standalone documents, parent first, then each
/// child's documents in the original child order.
///
/// Every detached child gets `parent_id` set to its parent's id and
/// `trace_id` set to `trace_id`.
#[must_use]
pub fn flatten(segment: Segment, trace_id: &str, max_bytes: usize) -> Vec<Segment> {
    let mut out = Vec::with_capacity(1);
    flatten_into(segment, trace_id, max_bytes, &mut out);
    if out.len() > 1 {
        debug!(
            "Flattened segment tree into {} documents (budget {} bytes)",
            out.len(),
            max_bytes
        );
    }
    out
}

fn flatten_into(mut segment: Segment, trace_id: &str, max_bytes: usize, out: &mut Vec<Segment>) {
    if segment.subsegments.is_empty() {
        let size = serialized_len(&segment);
        if size >= max_bytes {
            warn!(
                "Segment {} ({}) is {} bytes, over the {} byte budget, and cannot be split further",
                segment.id, segment.name, size, max_bytes
            );
        }
        out.push(segment);
        return;
    }
    if serialized_len(&segment) < max_bytes {
        out.push(segment);
        return;
    }

    let children = std::mem::take(&mut segment.subsegments);
    let parent_id = segment.id.clone();
    out.push(segment);

    for mut child in children {
        child.parent_id = Some(parent_id.clone());
        child.trace_id = trace_id.to_string();
        child.kind = Some(SegmentKind::Subsegment);
        flatten_into(child, trace_id, max_bytes, out);
    }
}
