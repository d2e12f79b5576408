//! Rewrites relationship ids into display names once every dataset is known.

use std::collections::{BTreeSet, HashMap};

use tcia_core::normalize::{parse_id, FieldAnomaly};
use tcia_core::DatasetRecord;

use crate::unify::{RelatedRefs, StagedDataset};
use crate::AnomalyLog;

/// Display name for an id that has no title, or no record at all.
pub fn placeholder(id: i64) -> String {
    format!("ID: {id}")
}

#[derive(Debug, Clone, Default)]
pub struct TitleIndex {
    titles: HashMap<i64, String>,
}

impl TitleIndex {
    /// First record wins when ids collide.
    pub fn build<'a>(records: impl IntoIterator<Item = &'a DatasetRecord>) -> Self {
        let mut titles = HashMap::new();
        for record in records {
            titles.entry(record.id).or_insert_with(|| {
                if record.title.trim().is_empty() {
                    placeholder(record.id)
                } else {
                    record.title.clone()
                }
            });
        }
        Self { titles }
    }

    pub fn len(&self) -> usize {
        self.titles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.titles.is_empty()
    }

    pub fn contains(&self, id: i64) -> bool {
        self.titles.contains_key(&id)
    }

    pub fn display_name(&self, id: i64) -> String {
        self.titles.get(&id).cloned().unwrap_or_else(|| placeholder(id))
    }

    /// Sorted display names, one per distinct id.
    pub fn resolve_names(&self, ids: &[i64]) -> Vec<String> {
        let distinct: BTreeSet<i64> = ids.iter().copied().collect();
        let mut names: Vec<String> = distinct.into_iter().map(|id| self.display_name(id)).collect();
        names.sort();
        names
    }
}

/// All three upstream spellings concatenated, parsed, deduplicated in first-seen order.
pub fn collect_related_ids(refs: &RelatedRefs, owner_id: i64, log: &mut AnomalyLog) -> Vec<i64> {
    let mut seen = BTreeSet::new();
    let mut ids = Vec::new();
    for raw in refs.iter() {
        match parse_id(raw) {
            Some(id) => {
                if seen.insert(id) {
                    ids.push(id);
                }
            }
            None => log.record(
                "related_dataset_ids",
                owner_id,
                &FieldAnomaly::Unparseable {
                    expected: "dataset id",
                    raw: raw.clone(),
                },
            ),
        }
    }
    ids
}

/// Populates `related_dataset_ids` and `related_datasets`; returns how many
/// references resolved only to a placeholder.
pub fn resolve_related(staged: &mut [StagedDataset], log: &mut AnomalyLog) -> usize {
    let index = TitleIndex::build(staged.iter().map(|s| &s.record));
    let mut unresolved = 0;
    for item in staged.iter_mut() {
        let ids = collect_related_ids(&item.related, item.record.id, log);
        unresolved += ids.iter().filter(|id| !index.contains(**id)).count();
        item.record.related_datasets = index.resolve_names(&ids);
        item.record.related_dataset_ids = ids;
    }
    unresolved
}
