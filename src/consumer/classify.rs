//! Poison message classification.

use crate::event::{Event, TestDirective};

/// Decides whether an event carries a failure directive.
///
/// The explicit `directive` field always wins. With legacy markers enabled,
/// marker strings are also recognised when a field equals one exactly
/// (`message`, `entityName`) or when the payload text contains one.
#[derive(Debug, Clone, Copy)]
pub struct PoisonClassifier {
    legacy_markers: bool,
}

impl Default for PoisonClassifier {
    fn default() -> Self {
        Self::new(true)
    }
}

impl PoisonClassifier {
    pub fn new(legacy_markers: bool) -> Self {
        Self { legacy_markers }
    }

    pub fn classify(&self, event: &Event) -> Option<TestDirective> {
        if let Some(directive) = event.directive {
            return Some(directive);
        }
        if !self.legacy_markers {
            return None;
        }

        let exact = [event.message.as_deref(), event.entity_name.as_deref()]
            .into_iter()
            .flatten()
            .find_map(TestDirective::from_marker);
        if exact.is_some() {
            return exact;
        }

        let payload = event.payload.as_ref().filter(|p| !p.is_null())?.to_string();
        TestDirective::ALL
            .into_iter()
            .find(|d| payload.contains(d.marker()))
    }
}
