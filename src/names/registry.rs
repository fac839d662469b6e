//! Alias → canonical mapping for one namespace of names (teams or leagues).
//!
//! Invariants kept by every mutation:
//! - each normalized alias key maps to exactly one canonical entity
//! - every entity's canonical name is also one of its aliases, unless a
//!   loaded cache already gave that key to another entity
//!
//! Entities merge (many → one) in `deduplicate`; they are never split.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Reverse;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use tracing::{debug, info, warn};

use super::normalize::{blocking_keys, core_form, normalize_key, similarity};
use crate::store::models::lenient_timestamp;

pub const DEFAULT_SIMILARITY_THRESHOLD: f64 = 0.90;

/// One real-world team or league and every spelling seen for it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CanonicalEntity {
    #[serde(default)]
    pub aliases: BTreeSet<String>,
    /// Feeds that have reported this name
    #[serde(default)]
    pub sources: BTreeSet<String>,
    #[serde(default)]
    pub usage_count: u64,
    #[serde(default, deserialize_with = "lenient_timestamp")]
    pub first_seen: Option<DateTime<Utc>>,
    #[serde(default, deserialize_with = "lenient_timestamp")]
    pub last_seen: Option<DateTime<Utc>>,
}

impl CanonicalEntity {
    fn touch(&mut self, source: Option<&str>, now: DateTime<Utc>) {
        self.usage_count += 1;
        if let Some(src) = source {
            self.sources.insert(src.to_string());
        }
        self.first_seen.get_or_insert(now);
        self.last_seen = Some(now);
    }

    fn absorb(&mut self, other: CanonicalEntity) {
        self.aliases.extend(other.aliases);
        self.sources.extend(other.sources);
        self.usage_count += other.usage_count;
        self.first_seen = match (self.first_seen, other.first_seen) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        };
        self.last_seen = self.last_seen.max(other.last_seen);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolveOutcome {
    /// Input matched a known alias
    Known,
    /// Input was close to an existing entity and became its alias
    NewAlias,
    /// Nothing close enough; a new entity was created
    Created,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Resolution {
    pub canonical: String,
    pub outcome: ResolveOutcome,
    /// Closeness to the matched entity (1.0 for exact and created)
    pub score: f64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DedupeReport {
    pub duplicates_merged: usize,
    pub entities_before: usize,
    pub entities_after: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EntityReport {
    pub canonical_name: String,
    pub alias_count: usize,
    pub usage_count: u64,
    pub sources: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RegistryReport {
    pub total_entities: usize,
    pub total_aliases: usize,
    /// Most-used entities first
    pub top: Vec<EntityReport>,
}

#[derive(Debug, Clone)]
pub struct NameRegistry {
    entities: BTreeMap<String, CanonicalEntity>,
    /// normalized alias key → canonical name
    alias_index: HashMap<String, String>,
    /// core form (of any alias) → canonical name
    core_index: HashMap<String, String>,
    /// blocking key → canonical names whose core carries that key
    blocks: HashMap<String, BTreeSet<String>>,
    threshold: f64,
}

impl Default for NameRegistry {
    fn default() -> Self {
        NameRegistry::new(DEFAULT_SIMILARITY_THRESHOLD)
    }
}

impl NameRegistry {
    pub fn new(threshold: f64) -> Self {
        NameRegistry {
            entities: BTreeMap::new(),
            alias_index: HashMap::new(),
            core_index: HashMap::new(),
            blocks: HashMap::new(),
            threshold,
        }
    }

    /// Rebuild a registry from persisted entities.
    pub fn from_entities(entities: BTreeMap<String, CanonicalEntity>, threshold: f64) -> Self {
        let mut registry = NameRegistry {
            entities,
            ..NameRegistry::new(threshold)
        };
        registry.rebuild_indexes();
        registry
    }

    pub fn entities(&self) -> &BTreeMap<String, CanonicalEntity> {
        &self.entities
    }

    #[cfg(test)]
    pub fn get(&self, canonical: &str) -> Option<&CanonicalEntity> {
        self.entities.get(canonical)
    }

    pub fn len(&self) -> usize {
        self.entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }

    pub fn total_aliases(&self) -> usize {
        self.entities.values().map(|e| e.aliases.len()).sum()
    }

    /// Exact alias lookup without side effects.
    pub fn lookup(&self, raw: &str) -> Option<&str> {
        self.alias_index
            .get(&normalize_key(raw))
            .map(|s| s.as_str())
    }

    /// Map a raw name to its canonical entity, learning it if new.
    /// Returns `None` for names with no alphanumeric content.
    pub fn resolve(
        &mut self,
        raw: &str,
        source: Option<&str>,
        now: DateTime<Utc>,
    ) -> Option<Resolution> {
        if normalize_key(raw).is_empty() {
            return None;
        }

        if let Some(canonical) = self.lookup(raw).map(str::to_string) {
            self.touch(&canonical, source, now);
            return Some(Resolution {
                canonical,
                outcome: ResolveOutcome::Known,
                score: 1.0,
            });
        }

        let shown = display_form(raw);
        let core = core_form(raw);
        let closest = match self.core_index.get(&core) {
            Some(canonical) => Some((canonical.clone(), 1.0)),
            None => self.closest(&core),
        };

        if let Some((canonical, score)) = closest {
            debug!("'{}' → '{}' (score {:.3})", shown, canonical, score);
            self.add_alias(&canonical, &shown);
            self.touch(&canonical, source, now);
            return Some(Resolution {
                canonical,
                outcome: ResolveOutcome::NewAlias,
                score,
            });
        }

        debug!("New canonical entity '{}'", shown);
        self.insert_entity(shown.clone(), CanonicalEntity::default());
        self.touch(&shown, source, now);
        Some(Resolution {
            canonical: shown,
            outcome: ResolveOutcome::Created,
            score: 1.0,
        })
    }

    /// Best existing entity at or above the threshold; ties go to the
    /// alphabetically first canonical name.
    fn closest(&self, core: &str) -> Option<(String, f64)> {
        let mut candidates: BTreeSet<&String> = BTreeSet::new();
        for key in blocking_keys(core) {
            if let Some(names) = self.blocks.get(&key) {
                candidates.extend(names);
            }
        }

        let mut best: Option<(&String, f64)> = None;
        for name in candidates {
            let score = similarity(core, &core_form(name));
            if score >= self.threshold && best.map_or(true, |(_, b)| score > b) {
                best = Some((name, score));
            }
        }
        best.map(|(name, score)| (name.clone(), score))
    }

    /// Merge entities that denote the same team/league.
    ///
    /// Similar pairs (same closeness test as `resolve`) are clustered with
    /// union-find, so chains A~B~C collapse together. Each cluster keeps the
    /// entity with the highest usage, ties broken alphabetically. A second
    /// run with no new input merges nothing.
    pub fn deduplicate(&mut self) -> DedupeReport {
        let before = self.entities.len();
        let names: Vec<String> = self.entities.keys().cloned().collect();
        let cores: Vec<String> = names.iter().map(|n| core_form(n)).collect();

        let mut buckets: HashMap<String, Vec<usize>> = HashMap::new();
        for (i, core) in cores.iter().enumerate() {
            for key in blocking_keys(core) {
                buckets.entry(key).or_default().push(i);
            }
        }

        let mut sets = DisjointSet::new(names.len());
        for members in buckets.values() {
            for (pos, &i) in members.iter().enumerate() {
                for &j in &members[pos + 1..] {
                    if sets.find(i) != sets.find(j)
                        && similarity(&cores[i], &cores[j]) >= self.threshold
                    {
                        sets.union(i, j);
                    }
                }
            }
        }

        let mut clusters: BTreeMap<usize, Vec<usize>> = BTreeMap::new();
        for i in 0..names.len() {
            clusters.entry(sets.find(i)).or_default().push(i);
        }

        let mut merged = 0;
        for members in clusters.values().filter(|m| m.len() > 1) {
            let survivor = members
                .iter()
                .map(|&i| &names[i])
                .min_by_key(|name| (Reverse(self.entities[*name].usage_count), *name))
                .cloned();
            let Some(survivor) = survivor else { continue };

            for &i in members {
                let absorbed = &names[i];
                if *absorbed == survivor {
                    continue;
                }
                if let Some(entity) = self.entities.remove(absorbed) {
                    info!("Merging '{}' into '{}'", absorbed, survivor);
                    if let Some(target) = self.entities.get_mut(&survivor) {
                        target.absorb(entity);
                    }
                    merged += 1;
                }
            }
        }

        if merged > 0 {
            self.rebuild_indexes();
        }

        DedupeReport {
            duplicates_merged: merged,
            entities_before: before,
            entities_after: self.entities.len(),
        }
    }

    pub fn report(&self, top: usize) -> RegistryReport {
        let mut ranked: Vec<(&String, &CanonicalEntity)> = self.entities.iter().collect();
        ranked.sort_by_key(|(name, e)| (Reverse(e.usage_count), *name));

        RegistryReport {
            total_entities: self.entities.len(),
            total_aliases: self.total_aliases(),
            top: ranked
                .into_iter()
                .take(top)
                .map(|(name, e)| EntityReport {
                    canonical_name: name.clone(),
                    alias_count: e.aliases.len(),
                    usage_count: e.usage_count,
                    sources: e.sources.iter().cloned().collect(),
                })
                .collect(),
        }
    }

    fn touch(&mut self, canonical: &str, source: Option<&str>, now: DateTime<Utc>) {
        if let Some(entity) = self.entities.get_mut(canonical) {
            entity.touch(source, now);
        }
    }

    fn insert_entity(&mut self, canonical: String, entity: CanonicalEntity) {
        self.entities.insert(canonical.clone(), entity);
        self.add_alias(&canonical, &canonical);
        for key in blocking_keys(&core_form(&canonical)) {
            self.blocks.entry(key).or_default().insert(canonical.clone());
        }
    }

    /// Attach `alias` to `canonical` unless its key already belongs to
    /// another entity.
    fn add_alias(&mut self, canonical: &str, alias: &str) -> bool {
        let key = normalize_key(alias);
        if key.is_empty() {
            return false;
        }
        match self.alias_index.get(&key) {
            Some(owner) if owner != canonical => return false,
            Some(_) => {}
            None => {
                self.alias_index.insert(key, canonical.to_string());
            }
        }
        self.core_index
            .entry(core_form(alias))
            .or_insert_with(|| canonical.to_string());
        if let Some(entity) = self.entities.get_mut(canonical) {
            entity.aliases.insert(alias.to_string());
        }
        true
    }

    /// Recompute every index from `entities`. Canonical names claim their
    /// own keys first; an alias key claimed by two entities stays with the
    /// alphabetically first and is dropped from the other.
    fn rebuild_indexes(&mut self) {
        self.alias_index.clear();
        self.core_index.clear();
        self.blocks.clear();

        let names: Vec<String> = self.entities.keys().cloned().collect();
        for name in &names {
            let key = normalize_key(name);
            self.alias_index.entry(key).or_insert_with(|| name.clone());
            self.core_index
                .entry(core_form(name))
                .or_insert_with(|| name.clone());
            for block in blocking_keys(&core_form(name)) {
                self.blocks.entry(block).or_default().insert(name.clone());
            }
        }

        for name in &names {
            let aliases: Vec<String> = self.entities[name].aliases.iter().cloned().collect();
            let mut conflicted = Vec::new();
            for alias in aliases {
                if !self.add_alias(name, &alias) {
                    conflicted.push(alias);
                }
            }
            if let Some(entity) = self.entities.get_mut(name) {
                for alias in conflicted {
                    warn!(
                        "Alias '{}' already maps elsewhere; dropping it from '{}'",
                        alias, name
                    );
                    entity.aliases.remove(&alias);
                }
            }
            let owns_own_key = self.alias_index.get(&normalize_key(name)) == Some(name);
            if owns_own_key {
                if let Some(entity) = self.entities.get_mut(name) {
                    entity.aliases.insert(name.clone());
                }
            } else {
                warn!(
                    "Canonical name '{}' collides with another entity's alias; run dedupe",
                    name
                );
            }
        }
    }
}

/// Trim and collapse internal whitespace, keeping the original casing.
fn display_form(raw: &str) -> String {
    raw.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Union-find with path halving.
struct DisjointSet {
    parent: Vec<usize>,
}

impl DisjointSet {
    fn new(n: usize) -> Self {
        DisjointSet {
            parent: (0..n).collect(),
        }
    }

    fn find(&mut self, mut x: usize) -> usize {
        while self.parent[x] != x {
            self.parent[x] = self.parent[self.parent[x]];
            x = self.parent[x];
        }
        x
    }

    fn union(&mut self, a: usize, b: usize) {
        let (ra, rb) = (self.find(a), self.find(b));
        if ra != rb {
            // Lower index as root keeps cluster ids stable across runs.
            let (root, child) = if ra < rb { (ra, rb) } else { (rb, ra) };
            self.parent[child] = root;
        }
    }
}
