use std::collections::{HashMap, HashSet};

use tracing::debug;
use uuid::Uuid;

use super::ScopeBucket;
use super::normalizer::tokens;
use crate::llm::ProposedBucket;
use crate::model::{ContractorRef, ExtractedItem};

pub const DEFAULT_MATCH_THRESHOLD: f64 = 0.72;
pub const DEFAULT_CATEGORY_PENALTY: f64 = 0.10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NormalizationMode {
    /// Deterministic token similarity.
    Similarity,
    /// Buckets proposed by the LLM, then checked.
    Llm,
}

impl NormalizationMode {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "similarity" | "rules" => Some(NormalizationMode::Similarity),
            "llm" => Some(NormalizationMode::Llm),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MatchConfig {
    pub threshold: f64,
    pub category_penalty: f64,
    pub mode: NormalizationMode,
}

impl Default for MatchConfig {
    fn default() -> Self {
        Self {
            threshold: DEFAULT_MATCH_THRESHOLD,
            category_penalty: DEFAULT_CATEGORY_PENALTY,
            mode: NormalizationMode::Similarity,
        }
    }
}

impl MatchConfig {
    pub fn from_env() -> Self {
        let threshold = std::env::var("BIDVET_MATCH_THRESHOLD")
            .ok()
            .and_then(|raw| raw.trim().parse::<f64>().ok())
            .filter(|value| value.is_finite())
            .map(|value| value.clamp(0.0, 1.0))
            .unwrap_or(DEFAULT_MATCH_THRESHOLD);
        let mode = std::env::var("BIDVET_NORMALIZATION_MODE")
            .ok()
            .and_then(|raw| NormalizationMode::parse(&raw))
            .unwrap_or(NormalizationMode::Similarity);
        Self {
            threshold,
            mode,
            ..Self::default()
        }
    }
}

/// `max(token-set Jaccard, normalized Damerau-Levenshtein over the sorted
/// token strings)`. Empty inputs never match.
pub fn similarity(a: &[String], b: &[String]) -> f64 {
    if a.is_empty() || b.is_empty() {
        return 0.0;
    }
    let set_a: HashSet<&str> = a.iter().map(String::as_str).collect();
    let set_b: HashSet<&str> = b.iter().map(String::as_str).collect();
    let shared = set_a.intersection(&set_b).count() as f64;
    let jaccard = shared / set_a.union(&set_b).count() as f64;

    let mut sorted_a: Vec<&str> = set_a.into_iter().collect();
    let mut sorted_b: Vec<&str> = set_b.into_iter().collect();
    sorted_a.sort_unstable();
    sorted_b.sort_unstable();
    let edit = strsim::normalized_damerau_levenshtein(&sorted_a.join(" "), &sorted_b.join(" "));

    jaccard.max(edit)
}

/// Share of the seed's tokens found in the item.
fn seed_coverage(seed: &[String], item: &[String]) -> f64 {
    if seed.is_empty() {
        return 0.0;
    }
    let item: HashSet<&str> = item.iter().map(String::as_str).collect();
    let covered = seed.iter().filter(|token| item.contains(token.as_str())).count();
    covered as f64 / seed.len() as f64
}

fn same_category(a: Option<&str>, b: Option<&str>) -> bool {
    match (a.map(str::trim), b.map(str::trim)) {
        (Some(a), Some(b)) if !a.is_empty() && !b.is_empty() => a.eq_ignore_ascii_case(b),
        _ => true,
    }
}

struct Member<'a> {
    item: &'a ExtractedItem,
    tokens: Vec<String>,
}

struct WorkingBucket<'a> {
    label: String,
    seed_tokens: Vec<String>,
    members: Vec<Member<'a>>,
}

impl WorkingBucket<'_> {
    fn holds_document(&self, document_id: Uuid) -> bool {
        self.members
            .iter()
            .any(|member| member.item.document_id == document_id)
    }

    fn score(&self, item: &ExtractedItem, item_tokens: &[String], config: &MatchConfig) -> f64 {
        let seeded = seed_coverage(&self.seed_tokens, item_tokens);
        self.members
            .iter()
            .map(|member| {
                let raw = similarity(&member.tokens, item_tokens);
                if same_category(member.item.category.as_deref(), item.category.as_deref()) {
                    raw
                } else {
                    raw - config.category_penalty
                }
            })
            .fold(seeded, f64::max)
    }

    fn finish(self) -> ScopeBucket {
        ScopeBucket {
            label: self.label,
            item_ids: self.members.iter().map(|member| member.item.id).collect(),
        }
    }
}

/// Items of one document, highest confidence first, then insertion order.
fn ranked<'a>(items: &'a [ExtractedItem], document_id: Uuid) -> Vec<&'a ExtractedItem> {
    let mut ranked: Vec<&ExtractedItem> = items
        .iter()
        .filter(|item| item.document_id == document_id)
        .collect();
    ranked.sort_by(|a, b| {
        b.confidence
            .total_cmp(&a.confidence)
            .then(a.line_number.cmp(&b.line_number))
    });
    ranked
}

fn leaf_name(seed_label: &str) -> &str {
    seed_label
        .rsplit(" > ")
        .next()
        .unwrap_or(seed_label)
        .trim()
}

/// Group the items of `contractors` (in upload order) into scope buckets.
///
/// `seeds` are breakdown labels (`Parent > Leaf`); a seed attracts items
/// that contain every token of its leaf name. Seeds nobody joined are
/// dropped. A bucket never holds two items of the same document.
pub fn bucket_by_similarity(
    contractors: &[ContractorRef],
    items: &[ExtractedItem],
    seeds: &[String],
    config: &MatchConfig,
) -> Vec<ScopeBucket> {
    let mut buckets: Vec<WorkingBucket<'_>> = seeds
        .iter()
        .map(|label| WorkingBucket {
            label: label.clone(),
            seed_tokens: tokens(leaf_name(label)),
            members: Vec::new(),
        })
        .collect();

    for contractor in contractors {
        for item in ranked(items, contractor.document_id) {
            let item_tokens = tokens(&item.description);
            let mut best: Option<(usize, f64)> = None;
            for (index, bucket) in buckets.iter().enumerate() {
                if bucket.holds_document(item.document_id) {
                    continue;
                }
                let score = bucket.score(item, &item_tokens, config);
                if score >= config.threshold && best.is_none_or(|(_, top)| score > top) {
                    best = Some((index, score));
                }
            }

            let member = Member {
                item,
                tokens: item_tokens,
            };
            match best {
                Some((index, score)) => {
                    debug!(item_id = %item.id, bucket = %buckets[index].label, score, "item joined bucket");
                    buckets[index].members.push(member);
                }
                None => buckets.push(WorkingBucket {
                    label: item.description.trim().to_string(),
                    seed_tokens: Vec::new(),
                    members: vec![member],
                }),
            }
        }
    }

    buckets
        .into_iter()
        .filter(|bucket| !bucket.members.is_empty())
        .map(WorkingBucket::finish)
        .collect()
}

/// Check LLM-proposed buckets against the one-item-per-document rule.
///
/// Unknown and repeated ids are ignored. When a proposal holds several
/// items of one document the highest-confidence one (then the lowest
/// line number) stays; the rest, and every item no proposal mentioned,
/// become singleton buckets.
pub fn enforce_proposals(
    contractors: &[ContractorRef],
    items: &[ExtractedItem],
    proposals: Vec<ProposedBucket>,
) -> Vec<ScopeBucket> {
    let order: HashMap<Uuid, usize> = contractors
        .iter()
        .enumerate()
        .map(|(position, contractor)| (contractor.document_id, position))
        .collect();
    let by_id: HashMap<Uuid, &ExtractedItem> = items
        .iter()
        .filter(|item| order.contains_key(&item.document_id))
        .map(|item| (item.id, item))
        .collect();

    let mut assigned: HashSet<Uuid> = HashSet::new();
    let mut buckets = Vec::new();

    for proposal in proposals {
        let mut winners: HashMap<Uuid, &ExtractedItem> = HashMap::new();
        for item_id in &proposal.item_ids {
            let Some(item) = by_id.get(item_id).copied() else {
                debug!(%item_id, "proposal names an unknown item");
                continue;
            };
            if assigned.contains(item_id) {
                continue;
            }
            winners
                .entry(item.document_id)
                .and_modify(|current| {
                    let better = item.confidence > current.confidence
                        || (item.confidence == current.confidence
                            && item.line_number < current.line_number);
                    if better {
                        *current = item;
                    }
                })
                .or_insert(item);
        }
        if winners.is_empty() {
            continue;
        }

        let mut members: Vec<&ExtractedItem> = winners.into_values().collect();
        members.sort_by_key(|item| order.get(&item.document_id).copied().unwrap_or(usize::MAX));
        assigned.extend(members.iter().map(|item| item.id));

        let label = match proposal.label.trim() {
            "" => members[0].description.trim().to_string(),
            label => label.to_string(),
        };
        buckets.push(ScopeBucket {
            label,
            item_ids: members.iter().map(|item| item.id).collect(),
        });
    }

    for contractor in contractors {
        let mut leftovers: Vec<&ExtractedItem> = items
            .iter()
            .filter(|item| item.document_id == contractor.document_id)
            .filter(|item| !assigned.contains(&item.id))
            .collect();
        leftovers.sort_by_key(|item| item.line_number);
        for item in leftovers {
            buckets.push(ScopeBucket {
                label: item.description.trim().to_string(),
                item_ids: vec![item.id],
            });
        }
    }
    buckets
}
