use std::cmp::Ordering;

/// A route key compiled once per lookup table evaluation.
///
/// The orderings below give deterministic tie-breaks without per-call
/// re-sorting: exact keys beat wildcard keys, fewer wildcard characters beat
/// more, longer literal material beats shorter (so `claude-*` beats a bare
/// `*`), and the raw key string settles anything left.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoutePattern {
    key: String,
    segments: Vec<String>,
    wildcard_count: u32,
    literal_len: usize,
}

impl RoutePattern {
    pub fn compile(key: &str) -> Self {
        let segments: Vec<String> = key.split('*').map(|part| part.to_string()).collect();
        let wildcard_count = (segments.len() - 1) as u32;
        let literal_len = segments.iter().map(String::len).sum();
        Self {
            key: key.to_string(),
            segments,
            wildcard_count,
            literal_len,
        }
    }

    pub fn is_exact(&self) -> bool {
        self.wildcard_count == 0
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn matches(&self, candidate: &str) -> bool {
        if self.is_exact() {
            return self.key == candidate;
        }

        let mut remaining = candidate;
        let last = self.segments.len() - 1;
        for (position, segment) in self.segments.iter().enumerate() {
            if position == 0 {
                match remaining.strip_prefix(segment.as_str()) {
                    Some(rest) => remaining = rest,
                    None => return false,
                }
            } else if position == last {
                return remaining.ends_with(segment.as_str());
            } else if !segment.is_empty() {
                match remaining.find(segment.as_str()) {
                    Some(at) => remaining = &remaining[at + segment.len()..],
                    None => return false,
                }
            }
        }
        // Single-segment patterns are exact and returned above; wildcard
        // patterns always end through the `position == last` arm.
        true
    }
}

impl Ord for RoutePattern {
    fn cmp(&self, other: &Self) -> Ordering {
        // Lower sorts first = more specific.
        other
            .is_exact()
            .cmp(&self.is_exact())
            .then(self.wildcard_count.cmp(&other.wildcard_count))
            .then(other.literal_len.cmp(&self.literal_len))
            .then(self.key.cmp(&other.key))
    }
}

impl PartialOrd for RoutePattern {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}
