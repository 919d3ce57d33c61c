// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use std::cmp::Ordering;

/// End-of-component marker of a composite component
///
/// `-1`/`1` encode exclusive bounds: a composite ending in `-1` sorts before
/// every longer composite with the same prefix, one ending in `1` sorts after.
fn eoc_rank(byte: u8) -> i8 {
    match byte {
        0 => 0,
        1 => 1,
        _ => -1,
    }
}

/// Comparator for clustering / column names within a row
///
/// Cells inside a row are kept and written in this order; every merge,
/// slice filter and promoted-index lookup goes through it.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub enum ClusteringComparator {
    /// Plain lexicographical byte order
    #[default]
    Bytes,

    /// Composite of length-prefixed components, each followed by an
    /// end-of-component marker in `{0, 1, -1}`
    Composite,
}

impl ClusteringComparator {
    /// Compares two column names.
    #[must_use]
    pub fn compare(&self, a: &[u8], b: &[u8]) -> Ordering {
        match self {
            Self::Bytes => a.cmp(b),
            Self::Composite => compare_composite(a, b),
        }
    }

    /// Returns `true` if `name` lies within `[start, end]`.
    ///
    /// An empty bound is unbounded on that side.
    #[must_use]
    pub fn in_range(&self, name: &[u8], start: &[u8], end: &[u8]) -> bool {
        (start.is_empty() || self.compare(name, start) != Ordering::Less)
            && (end.is_empty() || self.compare(name, end) != Ordering::Greater)
    }
}

/// Splits the next component off a composite name.
///
/// Returns `(bytes, eoc, rest)`, or `None` when exhausted. A trailing
/// fragment that is not a well-formed component is returned verbatim with a
/// neutral marker, so malformed names still have a total order.
fn next_component(buf: &[u8]) -> Option<(&[u8], u8, &[u8])> {
    if buf.is_empty() {
        return None;
    }

    if buf.len() < 3 {
        return Some((buf, 0, &[]));
    }

    let len = usize::from(u16::from_be_bytes([buf[0], buf[1]]));

    let Some(component) = buf.get(2..2 + len) else {
        return Some((buf, 0, &[]));
    };

    let Some(&eoc) = buf.get(2 + len) else {
        return Some((buf, 0, &[]));
    };

    #[allow(clippy::indexing_slicing)]
    Some((component, eoc, &buf[2 + len + 1..]))
}

fn compare_composite(mut a: &[u8], mut b: &[u8]) -> Ordering {
    loop {
        match (next_component(a), next_component(b)) {
            (None, None) => return Ordering::Equal,
            (None, Some(_)) => return Ordering::Less,
            (Some(_), None) => return Ordering::Greater,
            (Some((bytes_a, eoc_a, rest_a)), Some((bytes_b, eoc_b, rest_b))) => {
                let ord = bytes_a.cmp(bytes_b);
                if ord != Ordering::Equal {
                    return ord;
                }

                let ord = eoc_rank(eoc_a).cmp(&eoc_rank(eoc_b));
                if ord != Ordering::Equal {
                    return ord;
                }

                a = rest_a;
                b = rest_b;
            }
        }
    }
}

/// Builds a composite name from components, for tests and embedding systems.
#[must_use]
pub fn composite(components: &[(&[u8], i8)]) -> Vec<u8> {
    let mut out = vec![];

    for (bytes, eoc) in components {
        #[allow(clippy::cast_possible_truncation)]
        out.extend_from_slice(&(bytes.len() as u16).to_be_bytes());
        out.extend_from_slice(bytes);
        out.push(match eoc {
            0 => 0,
            1 => 1,
            _ => 0xFF,
        });
    }

    out
}
