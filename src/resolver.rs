//! Indicator code -> ordered candidate dataflows.
//!
//! Three tiers, first hit wins: the indicator's own catalog entry, the indicator family
//! (prefix) table, and finally the universal default dataflow alone. Every sequence ends with
//! [`UNIVERSAL_DATAFLOW`], so a resolution is never empty.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use ahash::AHashMap;

use crate::error::SdmxError;
use crate::metadata::MetadataStore;
use crate::models::{DataflowId, FallbackSequence, IndicatorCode, SequenceSource};
use crate::parser::{Document, Node};

/// Dataflow holding (a copy of) every published indicator.
pub const UNIVERSAL_DATAFLOW: &str = "GLOBAL_DATAFLOW";

/// Historically known dataflows per indicator family, most preferred first.
const BUILTIN_SEQUENCES: &[(&str, &[&str])] = &[
    ("CME", &["CME", "CME_DF_2021_WQ", "CME_SUBNATIONAL", "GLOBAL_DATAFLOW"]),
    ("COD", &["CAUSE_OF_DEATH", "GLOBAL_DATAFLOW"]),
    ("DM", &["DM", "DM_PROJECTIONS", "GLOBAL_DATAFLOW"]),
    ("ECD", &["ECD", "GLOBAL_DATAFLOW"]),
    ("ECON", &["ECONOMIC", "GLOBAL_DATAFLOW"]),
    ("ED", &["EDUCATION_UIS_SDG", "EDUCATION", "GLOBAL_DATAFLOW"]),
    ("FD", &["FUNCTIONAL_DIFF", "GLOBAL_DATAFLOW"]),
    ("GN", &["GENDER", "GLOBAL_DATAFLOW"]),
    ("HVA", &["HIV_AIDS", "GLOBAL_DATAFLOW"]),
    ("IM", &["IMMUNISATION", "GLOBAL_DATAFLOW"]),
    ("MG", &["MIGRATION", "GLOBAL_DATAFLOW"]),
    ("MNCH", &["MNCH", "GLOBAL_DATAFLOW"]),
    ("NT", &["NUTRITION", "GLOBAL_DATAFLOW"]),
    ("PT", &["PT", "PT_CM", "PT_FGM", "CHILD_PROTECTION", "GLOBAL_DATAFLOW"]),
    ("PV", &["CHLD_PVTY", "GLOBAL_DATAFLOW"]),
    ("SPP", &["SOC_PROTECTION", "GLOBAL_DATAFLOW"]),
    ("TRGT", &["CHILD_RELATED_SDG", "GLOBAL_DATAFLOW"]),
    ("WS", &["WASH_HOUSEHOLDS", "WASH_SCHOOLS", "WASH_HEALTHCARE_FACILITY", "GLOBAL_DATAFLOW"]),
    ("WT", &["WT", "GLOBAL_DATAFLOW"]),
];

fn universal() -> DataflowId {
    DataflowId::from_static(UNIVERSAL_DATAFLOW)
}

/// Drops duplicates, then makes the universal dataflow the single last element.
fn normalize(dataflows: impl IntoIterator<Item = DataflowId>) -> Vec<DataflowId> {
    let default = universal();
    let mut out: Vec<DataflowId> = Vec::new();
    for id in dataflows {
        if id != default && !out.contains(&id) {
            out.push(id);
        }
    }
    out.push(default);
    out
}

/// Prefix -> sequence table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FallbackTable {
    sequences: AHashMap<String, Vec<DataflowId>>,
}

impl Default for FallbackTable {
    fn default() -> Self {
        Self::builtin()
    }
}

impl FallbackTable {
    pub fn empty() -> Self {
        Self {
            sequences: AHashMap::new(),
        }
    }

    /// The compiled-in table.
    pub fn builtin() -> Self {
        let mut table = Self::empty();
        for (prefix, flows) in BUILTIN_SEQUENCES {
            table.insert(prefix, flows.iter().copied().map(DataflowId::from_static));
        }
        table
    }

    /// Built-in table extended (and overridden per prefix) by the store's
    /// `fallback_sequences.yaml`, when that file exists.
    pub fn load(store: &MetadataStore) -> Result<Self, SdmxError> {
        let mut table = Self::builtin();
        let path = store.layout().fallback_path();
        if let Some(doc) = store.optional_document(&path)? {
            table.merge_document(&doc);
        }
        Ok(table)
    }

    /// Reads `fallback_sequences: {PREFIX: [DF, ...]}` (or the same mapping at the root).
    pub fn merge_document(&mut self, doc: &Document) {
        let section = doc
            .get("fallback_sequences")
            .or_else(|| Some(doc.root()))
            .and_then(Node::as_map);
        let Some(section) = section else {
            return;
        };
        for entry in section.iter().filter(|e| !e.key.starts_with('_')) {
            let flows = entry
                .value
                .as_str_list()
                .into_iter()
                .filter_map(|f| f.parse::<DataflowId>().ok())
                .collect::<Vec<_>>();
            if flows.is_empty() {
                continue;
            }
            self.insert(&entry.key, flows);
        }
    }

    pub fn insert(&mut self, prefix: &str, dataflows: impl IntoIterator<Item = DataflowId>) {
        self.sequences
            .insert(prefix.trim().to_ascii_uppercase(), normalize(dataflows));
    }

    pub fn get(&self, prefix: &str) -> Option<&[DataflowId]> {
        self.sequences.get(prefix).map(Vec::as_slice)
    }

    pub fn len(&self) -> usize {
        self.sequences.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sequences.is_empty()
    }

    /// Content hash, stable within a process; equal tables share memoised sequences.
    pub fn fingerprint(&self) -> u64 {
        let mut entries: Vec<_> = self.sequences.iter().collect();
        entries.sort_by(|a, b| a.0.cmp(b.0));
        let mut hasher = DefaultHasher::new();
        entries.hash(&mut hasher);
        hasher.finish()
    }
}

/// Resolves indicator codes against one metadata store.
#[derive(Debug, Clone)]
pub struct IndicatorResolver<'a> {
    store: &'a MetadataStore,
    table: FallbackTable,
    fingerprint: u64,
}

impl<'a> IndicatorResolver<'a> {
    pub fn new(store: &'a MetadataStore) -> Self {
        Self::with_table(store, FallbackTable::builtin())
    }

    pub fn with_table(store: &'a MetadataStore, table: FallbackTable) -> Self {
        let fingerprint = table.fingerprint();
        Self {
            store,
            table,
            fingerprint,
        }
    }

    pub fn table(&self) -> &FallbackTable {
        &self.table
    }

    /// Candidate dataflows for `code`. Repeated calls return the same `Arc`.
    pub fn resolve(&self, code: &IndicatorCode) -> Result<Arc<FallbackSequence>, SdmxError> {
        self.store
            .memoized_sequence(self.fingerprint, code, || self.resolve_uncached(code))
    }

    /// Like [`resolve`](Self::resolve), with an explicit dataflow tried first.
    pub fn resolve_with_override(
        &self,
        code: &IndicatorCode,
        dataflow: Option<&DataflowId>,
    ) -> Result<Arc<FallbackSequence>, SdmxError> {
        let base = self.resolve(code)?;
        let Some(first) = dataflow else {
            return Ok(base);
        };
        let flows = std::iter::once(first.clone()).chain(base.dataflows.iter().cloned());
        Ok(Arc::new(FallbackSequence {
            indicator: code.clone(),
            dataflows: normalize(flows),
            source: SequenceSource::Override,
        }))
    }

    fn resolve_uncached(&self, code: &IndicatorCode) -> Result<FallbackSequence, SdmxError> {
        match self.store.resolve_indicator(code) {
            Ok(Some(record)) if !record.dataflows.is_empty() => {
                log::debug!("{code}: dataflows from catalog");
                return Ok(FallbackSequence {
                    indicator: code.clone(),
                    dataflows: normalize(record.dataflows.iter().cloned()),
                    source: SequenceSource::Metadata,
                });
            }
            Ok(_) => {}
            Err(err) if err.is_metadata_unavailable() => {
                log::warn!("{err}; resolving {code} from the built-in prefix table");
            }
            Err(err) => return Err(err),
        }

        let prefix = code.prefix();
        if let Some(flows) = self.table.get(prefix) {
            log::debug!("{code}: dataflows from prefix {prefix}");
            return Ok(FallbackSequence {
                indicator: code.clone(),
                dataflows: flows.to_vec(),
                source: SequenceSource::PrefixTable {
                    prefix: prefix.to_string(),
                },
            });
        }

        log::debug!("{code}: no catalog entry or prefix match, using {UNIVERSAL_DATAFLOW}");
        Ok(FallbackSequence {
            indicator: code.clone(),
            dataflows: vec![universal()],
            source: SequenceSource::UniversalDefault,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids(names: &[&str]) -> Vec<DataflowId> {
        names.iter().map(|n| n.parse().unwrap()).collect()
    }

    #[test]
    fn normalize_moves_default_last_and_dedups() {
        let got = normalize(ids(&["GLOBAL_DATAFLOW", "CME", "CME", "NUTRITION"]));
        assert_eq!(got, ids(&["CME", "NUTRITION", "GLOBAL_DATAFLOW"]));
    }

    #[test]
    fn fingerprint_tracks_content_not_identity() {
        let mut custom = FallbackTable::builtin();
        assert_eq!(custom.fingerprint(), FallbackTable::builtin().fingerprint());
        custom.insert("NEW", ids(&["NEW_FLOW"]));
        assert_ne!(custom.fingerprint(), FallbackTable::builtin().fingerprint());
    }

    #[test]
    fn builtin_sequences_end_with_default() {
        let table = FallbackTable::builtin();
        assert_eq!(table.len(), BUILTIN_SEQUENCES.len());
        for (prefix, _) in BUILTIN_SEQUENCES {
            let seq = table.get(prefix).unwrap();
            assert_eq!(seq.last().unwrap().as_str(), UNIVERSAL_DATAFLOW);
        }
    }
}
