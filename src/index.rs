//! Resource index: exact lookup, first-write-wins insertion and nearest match

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::MatchStrategy;
use crate::matcher::{self, PathTree};
use crate::resource::{Headers, Resource, ResourceTag};
use crate::url::ProxyUrl;
use crate::Result;

/// Outcome of [`ResourceIndex::insert_if_absent`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Insertion {
    /// The resource was added at this position
    Inserted(usize),
    /// A resource with the same method and URL already sits at this position
    Existing(usize),
}

impl Insertion {
    /// Whether the resource was added
    #[must_use]
    pub fn is_inserted(self) -> bool {
        matches!(self, Self::Inserted(_))
    }

    /// Position of the indexed resource
    #[must_use]
    pub fn position(self) -> usize {
        match self {
            Self::Inserted(position) | Self::Existing(position) => position,
        }
    }
}

/// Timestamp order for [`ResourceIndex::filter_resources`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SortOrder {
    /// Oldest first
    #[default]
    Ascending,
    /// Newest first
    Descending,
}

#[derive(Serialize)]
struct IndexDocumentRef<'a> {
    resources: &'a [Resource],
}

#[derive(Deserialize)]
struct IndexDocument {
    #[serde(default)]
    resources: Vec<Resource>,
}

/// A nearest-match lookup split from the index borrow
///
/// Exact hits and path-tree matches are cheap and resolved while the
/// index is borrowed. Prefix matching scores every same-host candidate,
/// so its inputs are copied out and scored by [`NearestMatch::resolve`].
#[derive(Debug, Clone, PartialEq)]
pub enum NearestMatch {
    /// Already decided
    Resolved(Option<usize>),
    /// Same method/host `(position, path_query)` candidates to score
    Pending {
        /// Path and query of the request
        path_query: String,
        /// Candidates in insertion order
        candidates: Vec<(usize, String)>,
    },
}

impl NearestMatch {
    /// Number of candidates left to score
    #[must_use]
    pub fn pending(&self) -> usize {
        match self {
            Self::Resolved(_) => 0,
            Self::Pending { candidates, .. } => candidates.len(),
        }
    }

    /// Position of the best match
    #[must_use]
    pub fn resolve(self) -> Option<usize> {
        match self {
            Self::Resolved(position) => position,
            Self::Pending {
                path_query,
                candidates,
            } => matcher::best_by_prefix(
                &path_query,
                candidates
                    .iter()
                    .map(|(position, candidate)| (*position, candidate.as_str())),
            ),
        }
    }
}

/// All recorded resources of a cache root
///
/// The resource list is the source of truth; the exact map, the tags and
/// the path tree are always rebuilt from it.
#[derive(Debug, Clone, Default)]
pub struct ResourceIndex {
    resources: Vec<Resource>,
    exact: HashMap<String, HashMap<String, usize>>,
    tags: Vec<ResourceTag>,
    tree: PathTree,
    strategy: MatchStrategy,
}

impl ResourceIndex {
    /// Empty index using the given approximate matching strategy
    #[must_use]
    pub fn new(strategy: MatchStrategy) -> Self {
        Self {
            strategy,
            ..Self::default()
        }
    }

    /// Build an index from a list of resources; later duplicates are dropped
    ///
    /// # Errors
    ///
    /// Returns error if a resource has an unparseable URL
    pub fn from_resources(resources: Vec<Resource>, strategy: MatchStrategy) -> Result<Self> {
        let mut index = Self::new(strategy);
        for mut resource in resources {
            resource.normalize()?;
            index.insert_if_absent(resource)?;
        }
        Ok(index)
    }

    /// Parse a persisted `{ "resources": [...] }` document
    ///
    /// # Errors
    ///
    /// Returns error if the document is not valid JSON of that shape
    pub fn from_json(json: &str, strategy: MatchStrategy) -> Result<Self> {
        let document: IndexDocument = serde_json::from_str(json)?;
        Self::from_resources(document.resources, strategy)
    }

    /// Pretty-printed `{ "resources": [...] }` in insertion order
    ///
    /// # Errors
    ///
    /// Returns error if serialization fails
    pub fn to_json(&self) -> Result<String> {
        let document = IndexDocumentRef {
            resources: &self.resources,
        };
        Ok(serde_json::to_string_pretty(&document)?)
    }

    /// Matching strategy in use
    #[must_use]
    pub fn strategy(&self) -> MatchStrategy {
        self.strategy
    }

    /// Number of resources
    #[must_use]
    pub fn len(&self) -> usize {
        self.resources.len()
    }

    /// Whether the index is empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.resources.is_empty()
    }

    /// Resource at a position
    #[must_use]
    pub fn get(&self, position: usize) -> Option<&Resource> {
        self.resources.get(position)
    }

    /// All resources in insertion order
    #[must_use]
    pub fn resources(&self) -> &[Resource] {
        &self.resources
    }

    /// Tags, parallel to [`Self::resources`]
    #[must_use]
    pub fn tags(&self) -> &[ResourceTag] {
        &self.tags
    }

    /// Exact lookup by method and URL
    #[must_use]
    pub fn lookup_exact(&self, method: &str, url: &str) -> Option<&Resource> {
        self.position_of(method, url)
            .map(|position| &self.resources[position])
    }

    /// Whether a resource for this method and URL exists
    #[must_use]
    pub fn contains(&self, method: &str, url: &str) -> bool {
        self.position_of(method, url).is_some()
    }

    fn position_of(&self, method: &str, url: &str) -> Option<usize> {
        self.exact
            .get(method.to_lowercase().as_str())
            .and_then(|by_url| by_url.get(url))
            .copied()
    }

    /// Add a resource unless its method and URL are already indexed
    ///
    /// # Errors
    ///
    /// Returns error if the resource URL cannot be parsed
    pub fn insert_if_absent(&mut self, mut resource: Resource) -> Result<Insertion> {
        resource.method = resource.method.to_lowercase();
        if let Some(position) = self.position_of(&resource.method, &resource.url) {
            return Ok(Insertion::Existing(position));
        }

        let tag = ResourceTag::new(&resource)?;
        let position = self.resources.len();

        self.exact
            .entry(resource.method.clone())
            .or_default()
            .insert(resource.url.clone(), position);
        self.tree.insert(&tag, position);
        self.tags.push(tag);
        self.resources.push(resource);

        Ok(Insertion::Inserted(position))
    }

    /// Exact match, or else the best approximate match
    #[must_use]
    pub fn find_nearest(&self, method: &str, url: &str) -> Option<&Resource> {
        let position = self.prepare_nearest(method, url).resolve()?;
        let resource = &self.resources[position];
        if resource.url != url {
            debug!("Approximate match for {} {}: {}", method, url, resource.url);
        }
        Some(resource)
    }

    /// Start a nearest-match lookup, copying out what prefix scoring needs
    #[must_use]
    pub fn prepare_nearest(&self, method: &str, url: &str) -> NearestMatch {
        if let Some(position) = self.position_of(method, url) {
            return NearestMatch::Resolved(Some(position));
        }

        let Ok(parsed) = ProxyUrl::parse(url) else {
            return NearestMatch::Resolved(None);
        };
        let query = ResourceTag::from_url(method, &parsed, &Headers::new());

        match self.strategy {
            MatchStrategy::PathTree => {
                NearestMatch::Resolved(matcher::nearest_in_tree(&query, &self.tags, &self.tree))
            }
            MatchStrategy::PrefixEditDistance => NearestMatch::Pending {
                candidates: self
                    .tags
                    .iter()
                    .enumerate()
                    .filter(|(_, tag)| tag.host == query.host && tag.method == query.method)
                    .map(|(position, tag)| (position, tag.path_query.clone()))
                    .collect(),
                path_query: query.path_query,
            },
        }
    }

    /// Resources whose tag passes the predicate, sorted by timestamp
    pub fn filter_resources<F>(&self, mut predicate: F, order: SortOrder) -> Vec<&Resource>
    where
        F: FnMut(&ResourceTag, &Resource) -> bool,
    {
        let mut matched: Vec<&Resource> = self
            .tags
            .iter()
            .zip(&self.resources)
            .filter(|(tag, resource)| predicate(tag, resource))
            .map(|(_, resource)| resource)
            .collect();

        match order {
            SortOrder::Ascending => matched.sort_by_key(|r| r.timestamp),
            SortOrder::Descending => matched.sort_by_key(|r| std::cmp::Reverse(r.timestamp)),
        }
        matched
    }
}
