//! Annotation parsing for workload identity records
//!
//! Operators declare extra subjects on a ServiceAccount through two
//! annotations, comma-separated subject patterns:
//!
//! ```yaml
//! metadata:
//!   annotations:
//!     nats.io/allowed-pub-subjects: "test.>, events.>"
//!     nats.io/allowed-sub-subjects: "test.>, commands.*"
//! ```
//!
//! Items are trimmed, empty items are dropped, declared order is preserved.
//!
//! Subjects beginning with a reserved prefix (`_INBOX`, `_REPLY`) are never
//! accepted from annotations: the permission builder injects the inbox
//! grants itself, and an operator-supplied copy would only widen or mask
//! them. Filtered items are reported back to the caller so they can be
//! counted and logged against the identity that declared them.

use std::collections::BTreeMap;

/// Default annotation key prefix.
pub const DEFAULT_ANNOTATION_PREFIX: &str = "nats.io/";

/// Annotation key suffix for extra publish subjects.
pub const PUB_SUBJECTS_SUFFIX: &str = "allowed-pub-subjects";

/// Annotation key suffix for extra subscribe subjects.
pub const SUB_SUBJECTS_SUFFIX: &str = "allowed-sub-subjects";

/// Subject prefixes owned by the request/reply machinery.
pub const RESERVED_PREFIXES: &[&str] = &["_INBOX", "_REPLY"];

/// Which annotated list an item came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubjectList {
    Publish,
    Subscribe,
}

impl SubjectList {
    /// Short label used in logs and counter labels.
    pub fn as_label(&self) -> &'static str {
        match self {
            SubjectList::Publish => "pub",
            SubjectList::Subscribe => "sub",
        }
    }
}

/// A subject stripped by the reserved-pattern filter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilteredSubject {
    pub subject: String,
    pub list: SubjectList,
    /// The reserved prefix that matched.
    pub reserved: &'static str,
}

/// Result of parsing one record's annotations.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParsedAnnotations {
    pub publish: Vec<String>,
    pub subscribe: Vec<String>,
    pub filtered: Vec<FilteredSubject>,
}

/// Parse the two recognized annotation keys out of a record's metadata.
///
/// Unrecognized keys are ignored. A missing annotation yields an empty
/// list; the caller still applies the default grants.
pub fn parse_annotations(
    prefix: &str,
    annotations: &BTreeMap<String, String>,
) -> ParsedAnnotations {
    let mut parsed = ParsedAnnotations::default();

    let pub_key = format!("{prefix}{PUB_SUBJECTS_SUFFIX}");
    if let Some(raw) = annotations.get(&pub_key) {
        parsed.publish = split_subject_list(raw, SubjectList::Publish, &mut parsed.filtered);
    }
    let sub_key = format!("{prefix}{SUB_SUBJECTS_SUFFIX}");
    if let Some(raw) = annotations.get(&sub_key) {
        parsed.subscribe = split_subject_list(raw, SubjectList::Subscribe, &mut parsed.filtered);
    }
    parsed
}

fn split_subject_list(
    raw: &str,
    list: SubjectList,
    filtered: &mut Vec<FilteredSubject>,
) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .filter_map(|item| match reserved_prefix(item) {
            Some(reserved) => {
                filtered.push(FilteredSubject {
                    subject: item.to_string(),
                    list,
                    reserved,
                });
                None
            }
            None => Some(item.to_string()),
        })
        .collect()
}

/// Return the reserved prefix a subject starts with, if any.
pub fn reserved_prefix(subject: &str) -> Option<&'static str> {
    RESERVED_PREFIXES
        .iter()
        .find(|prefix| subject.starts_with(*prefix))
        .copied()
}
