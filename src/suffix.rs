use std::collections::HashSet;

/// Set of domain labels answering "is this name equal to, or a dot-boundary
/// suffix of, any stored label?".
///
/// Membership is a hash probe per label depth of the queried name, so lookups
/// stay cheap even for large sets. Stored labels are ASCII-lowered on insert;
/// lookups expect callers to hand in lowercased names with trailing dots
/// already trimmed.
#[derive(Debug, Default, Clone)]
pub struct SuffixSet {
    labels: HashSet<String>,
}

impl SuffixSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts a label. Idempotent.
    pub fn add(&mut self, label: &str) {
        self.labels.insert(label.to_ascii_lowercase());
    }

    /// Exact membership. This is what the blacklist uses for IP literals,
    /// where suffix semantics would be meaningless.
    pub fn exists(&self, label: &str) -> bool {
        self.labels.contains(label)
    }

    /// Suffix membership: probes every dot-boundary suffix of `name`,
    /// starting with the full name, and returns true on the first hit.
    pub fn contains(&self, name: &str) -> bool {
        if name.is_empty() {
            return false;
        }
        let mut rest = name;
        loop {
            if self.labels.contains(rest) {
                return true;
            }
            match rest.split_once('.') {
                Some((_, tail)) => rest = tail,
                None => return false,
            }
        }
    }

    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }
}
