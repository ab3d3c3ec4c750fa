//! Near-duplicate detection.
//!
//! Pairs at or above the similarity threshold are merged with a union-find, so groups are
//! transitive: a member may be linked to its master through an intermediate record and
//! score below the threshold against the master directly. Comparisons never cross
//! repositories and never pair a record with itself.
//!
//! The master of a group is its earliest-created record; ties go to the higher
//! comment + reaction count, then to the lowest identifier.

use std::cmp::{Ordering, Reverse};
use std::collections::{BTreeMap, HashMap, HashSet};

use chrono::{DateTime, Utc};
use iris_core::{DuplicateGroup, DuplicateMember, IssueRecord, TriagedIssue};
use iris_storage::{MembershipUpdate, RepositorySnapshot, RepositoryWrite};
use serde::Serialize;

use crate::config::ConfigError;
use crate::similarity::{SimilarityProfile, SimilarityWeights};

pub const DEFAULT_SIMILARITY_THRESHOLD: f64 = 0.75;

/// Index-based disjoint sets with path compression and union by rank.
#[derive(Debug, Clone)]
pub struct UnionFind {
    parent: Vec<usize>,
    rank: Vec<u8>,
}

impl UnionFind {
    pub fn new(len: usize) -> Self {
        Self {
            parent: (0..len).collect(),
            rank: vec![0; len],
        }
    }

    pub fn len(&self) -> usize {
        self.parent.len()
    }

    pub fn is_empty(&self) -> bool {
        self.parent.is_empty()
    }

    pub fn find(&mut self, x: usize) -> usize {
        let mut root = x;
        while self.parent[root] != root {
            root = self.parent[root];
        }
        let mut node = x;
        while self.parent[node] != root {
            let next = self.parent[node];
            self.parent[node] = root;
            node = next;
        }
        root
    }

    /// Returns `false` when both were already in the same set.
    pub fn union(&mut self, a: usize, b: usize) -> bool {
        let (ra, rb) = (self.find(a), self.find(b));
        if ra == rb {
            return false;
        }
        match self.rank[ra].cmp(&self.rank[rb]) {
            Ordering::Less => self.parent[ra] = rb,
            Ordering::Greater => self.parent[rb] = ra,
            Ordering::Equal => {
                self.parent[rb] = ra;
                self.rank[ra] = self.rank[ra].saturating_add(1);
            }
        }
        true
    }

    /// Sets with more than one element, each listed in index order, ordered by their
    /// smallest index.
    pub fn components(&mut self) -> Vec<Vec<usize>> {
        let mut by_root: BTreeMap<usize, Vec<usize>> = BTreeMap::new();
        for index in 0..self.len() {
            let root = self.find(index);
            by_root.entry(root).or_default().push(index);
        }
        let mut sets: Vec<Vec<usize>> = by_root.into_values().filter(|s| s.len() > 1).collect();
        sets.sort_by_key(|s| s[0]);
        sets
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct DuplicateMatch {
    pub id: u64,
    pub similarity: f64,
}

/// Final group membership of one batch record.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct DuplicateAssignment {
    pub id: u64,
    pub master_id: u64,
    pub similarity: f64,
}

/// Writes computed for one repository against one snapshot version.
#[derive(Debug, Clone, PartialEq)]
pub struct RepositoryPlan {
    pub write: RepositoryWrite,
    pub assignments: Vec<DuplicateAssignment>,
}

struct Node<'a> {
    record: &'a IssueRecord,
    profile: SimilarityProfile,
}

impl<'a> Node<'a> {
    fn new(record: &'a IssueRecord) -> Self {
        Self {
            record,
            profile: SimilarityProfile::of(record),
        }
    }

    fn master_key(&self) -> (DateTime<Utc>, Reverse<u64>, u64) {
        (self.record.created_at, Reverse(self.record.activity()), self.record.id)
    }
}

#[derive(Debug, Clone)]
pub struct DedupEngine {
    weights: SimilarityWeights,
    threshold: f64,
}

impl Default for DedupEngine {
    fn default() -> Self {
        Self {
            weights: SimilarityWeights::default(),
            threshold: DEFAULT_SIMILARITY_THRESHOLD,
        }
    }
}

impl DedupEngine {
    pub fn new(weights: SimilarityWeights, threshold: f64) -> Result<Self, ConfigError> {
        weights.validate()?;
        if !(0.0..=1.0).contains(&threshold) {
            return Err(ConfigError::Invalid(format!(
                "similarity threshold {threshold} is outside [0, 1]"
            )));
        }
        Ok(Self { weights, threshold })
    }

    pub fn threshold(&self) -> f64 {
        self.threshold
    }

    pub fn similarity(&self, a: &IssueRecord, b: &IssueRecord) -> f64 {
        self.weights.score(&SimilarityProfile::of(a), &SimilarityProfile::of(b))
    }

    /// Groups every same-repository pair at or above the threshold.
    pub fn find_duplicates(&self, pool: &[IssueRecord]) -> Vec<DuplicateGroup> {
        let nodes: Vec<Node<'_>> = pool.iter().map(Node::new).collect();

        let mut partitions: BTreeMap<&str, Vec<usize>> = BTreeMap::new();
        for (index, node) in nodes.iter().enumerate() {
            partitions.entry(node.record.repository.as_str()).or_default().push(index);
        }

        let mut sets = UnionFind::new(nodes.len());
        for members in partitions.values() {
            for (pos, &i) in members.iter().enumerate() {
                for &j in &members[pos + 1..] {
                    if nodes[i].record.id == nodes[j].record.id {
                        continue;
                    }
                    if self.weights.score(&nodes[i].profile, &nodes[j].profile) >= self.threshold {
                        sets.union(i, j);
                    }
                }
            }
        }

        let mut groups: Vec<DuplicateGroup> = sets
            .components()
            .into_iter()
            .map(|component| self.build_group(&nodes, &component))
            .collect();
        groups.sort_by(|a, b| a.repository.cmp(&b.repository).then(a.master_id.cmp(&b.master_id)));
        groups
    }

    /// Most similar same-repository record at or above the threshold. Stops at the first
    /// perfect match.
    pub fn is_duplicate_of(&self, record: &IssueRecord, pool: &[IssueRecord]) -> Option<DuplicateMatch> {
        let profile = SimilarityProfile::of(record);
        let candidates: Vec<(&IssueRecord, SimilarityProfile)> = pool
            .iter()
            .filter(|c| c.repository == record.repository && c.id != record.id)
            .map(|c| (c, SimilarityProfile::of(c)))
            .collect();
        self.best_match(
            record,
            &profile,
            candidates.iter().map(|(c, p)| (*c, p)),
        )
        .map(|(candidate, similarity)| DuplicateMatch {
            id: candidate.id,
            similarity,
        })
    }

    fn best_match<'a, I>(
        &self,
        record: &IssueRecord,
        profile: &SimilarityProfile,
        candidates: I,
    ) -> Option<(&'a IssueRecord, f64)>
    where
        I: IntoIterator<Item = (&'a IssueRecord, &'a SimilarityProfile)>,
    {
        let mut best: Option<(&'a IssueRecord, f64)> = None;
        for (candidate, candidate_profile) in candidates {
            if candidate.id == record.id || candidate.repository != record.repository {
                continue;
            }
            let similarity = self.weights.score(profile, candidate_profile);
            if similarity < self.threshold {
                continue;
            }
            if best.map_or(true, |(_, s)| similarity > s) {
                best = Some((candidate, similarity));
                if similarity >= 1.0 {
                    break;
                }
            }
        }
        best
    }

    /// Incremental assignment for one repository: persisted links seed the groups, each
    /// draft is matched against the stored records and the drafts before it, then masters
    /// are re-selected. Drafts replacing a stored record keep its `first_seen_at`; stored
    /// records whose link changes are emitted as membership updates. Draft identifiers
    /// must be unique.
    ///
    /// A persisted link to a master whose content this batch rewrites is not trusted; the
    /// member is matched again against every other record instead.
    pub fn plan_repository(&self, snapshot: &RepositorySnapshot, mut drafts: Vec<TriagedIssue>) -> RepositoryPlan {
        let replaced: HashMap<u64, &TriagedIssue> = snapshot
            .issues
            .iter()
            .filter(|stored| drafts.iter().any(|d| d.id() == stored.id()))
            .map(|stored| (stored.id(), stored))
            .collect();

        let rewritten: HashSet<u64> = drafts
            .iter()
            .filter(|draft| {
                replaced
                    .get(&draft.id())
                    .is_some_and(|stored| stored.fingerprint != draft.fingerprint)
            })
            .map(TriagedIssue::id)
            .collect();

        for draft in &mut drafts {
            if let Some(stored) = replaced.get(&draft.id()) {
                draft.first_seen_at = stored.first_seen_at;
            }
            draft.duplicate_of = None;
            draft.duplicate_similarity = None;
        }

        let kept: Vec<&TriagedIssue> = snapshot
            .issues
            .iter()
            .filter(|stored| !replaced.contains_key(&stored.id()))
            .collect();

        let mut nodes: Vec<Node<'_>> = kept.iter().map(|stored| Node::new(&stored.record)).collect();
        let draft_base = nodes.len();
        nodes.extend(drafts.iter().map(|draft| Node::new(&draft.record)));

        let position: HashMap<u64, usize> = nodes
            .iter()
            .enumerate()
            .map(|(index, node)| (node.record.id, index))
            .collect();

        let mut sets = UnionFind::new(nodes.len());
        let mut orphaned: Vec<usize> = Vec::new();
        for (index, stored) in kept.iter().enumerate() {
            let Some(master_id) = stored.duplicate_of else {
                continue;
            };
            if rewritten.contains(&master_id) {
                orphaned.push(index);
            } else if let Some(&master) = position.get(&master_id) {
                sets.union(index, master);
            }
        }

        for offset in 0..drafts.len() {
            let index = draft_base + offset;
            let found = self
                .best_match(
                    nodes[index].record,
                    &nodes[index].profile,
                    nodes[..index].iter().map(|n| (n.record, &n.profile)),
                )
                .map(|(candidate, _)| candidate.id);
            if let Some(&matched) = found.as_ref().and_then(|id| position.get(id)) {
                sets.union(index, matched);
            }
        }

        for &index in &orphaned {
            let found = self
                .best_match(
                    nodes[index].record,
                    &nodes[index].profile,
                    nodes.iter().map(|n| (n.record, &n.profile)),
                )
                .map(|(candidate, _)| candidate.id);
            if let Some(&matched) = found.as_ref().and_then(|id| position.get(id)) {
                sets.union(index, matched);
            }
        }

        let mut links: Vec<Option<(u64, f64)>> = vec![None; nodes.len()];
        for component in sets.components() {
            let master = self.pick_master(&nodes, &component);
            for &index in component.iter().filter(|&&i| i != master) {
                let similarity = self.weights.score(&nodes[index].profile, &nodes[master].profile);
                links[index] = Some((nodes[master].record.id, similarity));
            }
        }

        let membership: Vec<MembershipUpdate> = kept
            .iter()
            .enumerate()
            .filter_map(|(index, stored)| link_update(stored, links[index]))
            .collect();

        let mut assignments = Vec::new();
        for (offset, draft) in drafts.iter_mut().enumerate() {
            if let Some((master_id, similarity)) = links[draft_base + offset] {
                draft.duplicate_of = Some(master_id);
                draft.duplicate_similarity = Some(similarity);
                assignments.push(DuplicateAssignment {
                    id: draft.id(),
                    master_id,
                    similarity,
                });
            }
        }

        RepositoryPlan {
            write: RepositoryWrite {
                repository: snapshot.repository.clone(),
                expected_version: snapshot.version,
                upserts: drafts,
                membership,
            },
            assignments,
        }
    }

    fn pick_master(&self, nodes: &[Node<'_>], component: &[usize]) -> usize {
        let mut master = component[0];
        for &index in &component[1..] {
            if nodes[index].master_key() < nodes[master].master_key() {
                master = index;
            }
        }
        master
    }

    fn build_group(&self, nodes: &[Node<'_>], component: &[usize]) -> DuplicateGroup {
        let master = self.pick_master(nodes, component);
        let mut others: Vec<usize> = component.iter().copied().filter(|&i| i != master).collect();
        others.sort_by(|&a, &b| nodes[a].master_key().cmp(&nodes[b].master_key()));
        DuplicateGroup {
            repository: nodes[master].record.repository.clone(),
            master_id: nodes[master].record.id,
            members: others
                .into_iter()
                .map(|index| DuplicateMember {
                    id: nodes[index].record.id,
                    similarity_to_master: self.weights.score(&nodes[index].profile, &nodes[master].profile),
                })
                .collect(),
        }
    }
}

/// Membership updates that make the stored records match `groups`: every member links to
/// its master and every other record is unlinked.
pub fn membership_for_groups(stored: &[TriagedIssue], groups: &[DuplicateGroup]) -> Vec<MembershipUpdate> {
    let mut links: HashMap<u64, (u64, f64)> = HashMap::new();
    for group in groups {
        for member in &group.members {
            links.insert(member.id, (group.master_id, member.similarity_to_master));
        }
    }
    stored
        .iter()
        .filter_map(|issue| link_update(issue, links.get(&issue.id()).copied()))
        .collect()
}

fn link_update(stored: &TriagedIssue, link: Option<(u64, f64)>) -> Option<MembershipUpdate> {
    let duplicate_of = link.map(|(master, _)| master);
    let duplicate_similarity = link.map(|(_, similarity)| similarity);
    if stored.duplicate_of == duplicate_of && stored.duplicate_similarity == duplicate_similarity {
        return None;
    }
    Some(MembershipUpdate {
        id: stored.id(),
        duplicate_of,
        duplicate_similarity,
    })
}
