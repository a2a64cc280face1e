//! Approximate matching of a request against recorded resources
//!
//! Used only when the exact `(method, url)` lookup misses. Neither
//! strategy ever crosses a method or host boundary.

use std::collections::HashMap;

use crate::resource::ResourceTag;
use crate::url::query_string_distance;

/// Candidate with the highest `common_prefix - edit_distance(rest)`
///
/// Candidates are `(position, path_query)` pairs already filtered to the
/// request's method and host; the first one wins ties.
#[must_use]
pub fn best_by_prefix<'a>(
    path_query: &str,
    candidates: impl IntoIterator<Item = (usize, &'a str)>,
) -> Option<usize> {
    let mut best: Option<(usize, i64)> = None;
    for (position, candidate) in candidates {
        let score = prefix_score(candidate, path_query);
        if score <= 0 {
            continue;
        }
        match best {
            Some((_, best_score)) if best_score >= score => {}
            _ => best = Some((position, score)),
        }
    }
    best.map(|(position, _)| position)
}

/// Lowest query distance among resources with the same path
#[must_use]
pub fn nearest_in_tree(query: &ResourceTag, tags: &[ResourceTag], tree: &PathTree) -> Option<usize> {
    let candidates = tree.candidates(query)?;

    let mut best: Option<(usize, f64)> = None;
    for &position in candidates {
        let distance = query_string_distance(&query.query, &tags[position].query);
        match best {
            Some((_, best_distance)) if best_distance <= distance => {}
            _ => best = Some((position, distance)),
        }
    }
    best.map(|(position, _)| position)
}

/// `common_prefix_len - levenshtein(rest_a, rest_b)`, or 0 without a common prefix
#[must_use]
pub fn prefix_score(a: &str, b: &str) -> i64 {
    let a: Vec<char> = a.chars().collect();
    let b: Vec<char> = b.chars().collect();

    let common = a.iter().zip(&b).take_while(|(x, y)| x == y).count();
    if common == 0 {
        return 0;
    }

    common as i64 - levenshtein(&a[common..], &b[common..]) as i64
}

/// Edit distance with unit insert, delete and substitute costs
#[must_use]
pub fn levenshtein<T: PartialEq>(a: &[T], b: &[T]) -> usize {
    if a.is_empty() {
        return b.len();
    }
    if b.is_empty() {
        return a.len();
    }

    let mut previous: Vec<usize> = (0..=b.len()).collect();
    let mut current = vec![0; b.len() + 1];

    for (i, x) in a.iter().enumerate() {
        current[0] = i + 1;
        for (j, y) in b.iter().enumerate() {
            let substitution = previous[j] + usize::from(x != y);
            current[j + 1] = substitution
                .min(previous[j + 1] + 1)
                .min(current[j] + 1);
        }
        std::mem::swap(&mut previous, &mut current);
    }

    previous[b.len()]
}

/// Key of one path-tree leaf
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct TreeKey {
    method: String,
    scheme: String,
    host: String,
    pathname: String,
}

impl TreeKey {
    fn of(tag: &ResourceTag) -> Self {
        Self {
            method: tag.method.clone(),
            scheme: tag.scheme.clone(),
            host: tag.host.clone(),
            pathname: tag.pathname.clone(),
        }
    }
}

/// `method → scheme → host → pathname → positions`, flattened into one map
///
/// Leaves list positions in insertion order.
#[derive(Debug, Default, Clone)]
pub struct PathTree {
    leaves: HashMap<TreeKey, Vec<usize>>,
}

impl PathTree {
    /// Empty tree
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that the resource at `position` has this tag
    pub fn insert(&mut self, tag: &ResourceTag, position: usize) {
        self.leaves.entry(TreeKey::of(tag)).or_default().push(position);
    }

    /// Positions of resources sharing method, scheme, host and pathname
    #[must_use]
    pub fn candidates(&self, tag: &ResourceTag) -> Option<&[usize]> {
        self.leaves
            .get(&TreeKey::of(tag))
            .map(Vec::as_slice)
            .filter(|positions| !positions.is_empty())
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.leaves.len()
    }
}
