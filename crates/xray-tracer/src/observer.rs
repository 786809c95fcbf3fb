// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Extension points the host registers once at startup.

use std::sync::{Arc, Mutex};

use serde_json::{Map, Value};

use crate::metadata::RedactRules;
use crate::segment::Segment;

/// Hooks called by the tracer. Every method defaults to a no-op.
pub trait TraceObserver: Send + Sync {
    /// Adds redaction rules on top of the configured ones.
    fn redact_keys(&self, _rules: &mut RedactRules) {}

    /// Post-processes metadata after redaction and truncation.
    fn filter_metadata(&self, _metadata: &mut Map<String, Value>) {}

    /// Inspects or alters a segment tree before it is flattened and sent.
    fn before_send(&self, _segment: &mut Segment) {}

    /// Called for every document the transport delivered. Documents that
    /// failed to send are not reported.
    fn on_sent(&self, _segment: &Segment) {}
}

/// Ordered set of registered observers.
#[derive(Clone, Default)]
pub struct Observers {
    observers: Vec<Arc<dyn TraceObserver>>,
}

impl std::fmt::Debug for Observers {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Observers")
            .field("count", &self.observers.len())
            .finish()
    }
}

impl Observers {
    pub fn register(&mut self, observer: Arc<dyn TraceObserver>) {
        self.observers.push(observer);
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.observers.is_empty()
    }

    pub fn redact_keys(&self, rules: &mut RedactRules) {
        for observer in &self.observers {
            observer.redact_keys(rules);
        }
    }

    pub fn filter_metadata(&self, metadata: &mut Map<String, Value>) {
        for observer in &self.observers {
            observer.filter_metadata(metadata);
        }
    }

    pub fn before_send(&self, segment: &mut Segment) {
        for observer in &self.observers {
            observer.before_send(segment);
        }
    }

    pub fn on_sent(&self, segment: &Segment) {
        for observer in &self.observers {
            observer.on_sent(segment);
        }
    }
}

/// Keeps every sent document in memory, for hosts that display the trace
/// of the current request.
#[derive(Debug, Default)]
pub struct SentSegments {
    segments: Mutex<Vec<Segment>>,
}

impl SentSegments {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy of the documents recorded so far, in send order.
    #[must_use]
    pub fn segments(&self) -> Vec<Segment> {
        match self.segments.lock() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Takes the recorded documents, leaving the recorder empty.
    pub fn drain(&self) -> Vec<Segment> {
        match self.segments.lock() {
            Ok(mut guard) => std::mem::take(&mut *guard),
            Err(poisoned) => std::mem::take(&mut *poisoned.into_inner()),
        }
    }
}

impl TraceObserver for SentSegments {
    fn on_sent(&self, segment: &Segment) {
        match self.segments.lock() {
            Ok(mut guard) => guard.push(segment.clone()),
            Err(poisoned) => poisoned.into_inner().push(segment.clone()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct Tagger;

    impl TraceObserver for Tagger {
        fn redact_keys(&self, rules: &mut RedactRules) {
            rules.add("cookies", "session");
        }

        fn filter_metadata(&self, metadata: &mut Map<String, Value>) {
            metadata.remove("server");
        }

        fn before_send(&self, segment: &mut Segment) {
            segment
                .annotations
                .insert("tagged".to_string(), json!(true));
        }
    }

    #[test]
    fn test_observers_run_in_order() {
        let mut observers = Observers::default();
        assert!(observers.is_empty());
        observers.register(Arc::new(Tagger));

        let mut rules = RedactRules::new();
        observers.redact_keys(&mut rules);
        assert!(!rules.is_empty());

        let mut metadata = Map::new();
        metadata.insert("server".to_string(), json!({"HTTP_HOST": "example.com"}));
        observers.filter_metadata(&mut metadata);
        assert!(metadata.is_empty());

        let mut segment = Segment::new("local", "a", "t", 1.0);
        observers.before_send(&mut segment);
        assert_eq!(segment.annotations["tagged"], true);
    }

    #[test]
    fn test_sent_segments_records_and_drains() {
        let recorder = Arc::new(SentSegments::new());
        let mut observers = Observers::default();
        observers.register(recorder.clone());

        observers.on_sent(&Segment::new("one", "a", "t", 1.0));
        observers.on_sent(&Segment::new("two", "b", "t", 2.0));

        let names: Vec<String> = recorder.segments().into_iter().map(|s| s.name).collect();
        assert_eq!(names, ["one", "two"]);
        assert_eq!(recorder.drain().len(), 2);
        assert!(recorder.segments().is_empty());
    }
}
