//! Metadata documents (indicator catalog, dataflow schemas) and their process-lifetime cache.
//!
//! A [`MetadataStore`] is created once per application context and handed by reference to
//! the resolver and the key builder. Every document is parsed at most once; derived lookups
//! (the indicator catalog, per-dataflow schemas, fallback sequences) are memoised next to it
//! and only dropped by [`MetadataStore::refresh`].

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};

use ahash::AHashMap;
use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use serde::Serialize;

use crate::error::SdmxError;
use crate::models::{DataflowId, DimensionDescriptor, FallbackSequence, IndicatorCode};
use crate::parser::{self, Document, Mapping, Node};

/// Where the metadata files live below the metadata root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetadataLayout {
    pub root: PathBuf,
    pub indicators_file: String,
    pub dataflows_dir: String,
    pub fallback_file: String,
}

impl MetadataLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            indicators_file: "indicators.yaml".to_string(),
            dataflows_dir: "dataflows".to_string(),
            fallback_file: "fallback_sequences.yaml".to_string(),
        }
    }

    pub fn indicators_path(&self) -> PathBuf {
        self.root.join(&self.indicators_file)
    }

    pub fn schema_path(&self, dataflow: &DataflowId) -> PathBuf {
        self.root
            .join(&self.dataflows_dir)
            .join(format!("{}.yaml", dataflow.as_str()))
    }

    pub fn fallback_path(&self) -> PathBuf {
        self.root.join(&self.fallback_file)
    }
}

/// Catalog entry for one indicator.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IndicatorRecord {
    pub code: IndicatorCode,
    pub name: String,
    pub category: Option<String>,
    pub description: Option<String>,
    /// Candidate dataflows in declared order.
    pub dataflows: Vec<DataflowId>,
    pub tier: Option<i64>,
    pub disaggregations_with_totals: Vec<String>,
}

/// The `_metadata` block of the catalog.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CatalogInfo {
    pub synced_at: Option<String>,
    pub source: Option<String>,
    pub agency: Option<String>,
    pub version: Option<String>,
    pub indicator_count: usize,
}

#[derive(Debug)]
struct IndicatorCatalog {
    info: CatalogInfo,
    records: AHashMap<IndicatorCode, Arc<IndicatorRecord>>,
    order: Vec<IndicatorCode>,
}

/// Structure of one dataflow.
#[derive(Debug, Clone, PartialEq)]
pub struct DataflowSchema {
    pub id: DataflowId,
    pub name: Option<String>,
    pub agency: Option<String>,
    pub version: Option<String>,
    /// Sorted ascending by position.
    pub dimensions: Arc<[DimensionDescriptor]>,
    pub attributes: Vec<String>,
}

impl DataflowSchema {
    pub fn filter_eligible(&self) -> impl Iterator<Item = &DimensionDescriptor> {
        self.dimensions.iter().filter(|d| d.is_filter_eligible())
    }

    pub fn has_dimension(&self, id: &str) -> bool {
        self.dimensions.iter().any(|d| d.id == id)
    }
}

fn read_lock<T>(lock: &RwLock<T>) -> std::sync::RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(PoisonError::into_inner)
}

fn write_lock<T>(lock: &RwLock<T>) -> std::sync::RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(PoisonError::into_inner)
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// One cached document; the first caller parses while later callers wait on the mutex.
type DocumentSlot = Arc<Mutex<Option<Arc<Document>>>>;

/// Memo key: prefix table fingerprint plus indicator.
type SequenceKey = (u64, IndicatorCode);

/// Typed, cached access to the metadata documents.
#[derive(Debug)]
pub struct MetadataStore {
    layout: MetadataLayout,
    documents: RwLock<AHashMap<PathBuf, DocumentSlot>>,
    catalog: RwLock<Option<Arc<IndicatorCatalog>>>,
    catalog_build: Mutex<()>,
    schemas: RwLock<AHashMap<DataflowId, Arc<DataflowSchema>>>,
    sequences: RwLock<AHashMap<SequenceKey, Arc<FallbackSequence>>>,
    parses: AtomicUsize,
}

impl MetadataStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self::with_layout(MetadataLayout::new(root))
    }

    pub fn with_layout(layout: MetadataLayout) -> Self {
        Self {
            layout,
            documents: RwLock::new(AHashMap::new()),
            catalog: RwLock::new(None),
            catalog_build: Mutex::new(()),
            schemas: RwLock::new(AHashMap::new()),
            sequences: RwLock::new(AHashMap::new()),
            parses: AtomicUsize::new(0),
        }
    }

    pub fn layout(&self) -> &MetadataLayout {
        &self.layout
    }

    /// Number of documents parsed since construction (cache misses).
    pub fn parse_count(&self) -> usize {
        self.parses.load(Ordering::Relaxed)
    }

    /// Drops every cached document and derived lookup.
    pub fn refresh(&self) {
        write_lock(&self.documents).clear();
        *write_lock(&self.catalog) = None;
        write_lock(&self.schemas).clear();
        write_lock(&self.sequences).clear();
        log::debug!("metadata cache cleared");
    }

    /// Parsed document at `path`, read from disk on first use.
    pub fn document(&self, path: &Path) -> Result<Arc<Document>, SdmxError> {
        let slot = self.document_slot(path);
        let mut cached = lock(&slot);
        if let Some(doc) = cached.as_ref() {
            return Ok(Arc::clone(doc));
        }
        let text = fs::read_to_string(path).map_err(|err| unavailable(path, &err))?;
        let doc = parser::parse(&text).map_err(|err| SdmxError::MalformedMetadata {
            path: path.to_path_buf(),
            line: err.line,
            message: err.message,
        })?;
        self.parses.fetch_add(1, Ordering::Relaxed);
        log::debug!("parsed metadata document {}", path.display());
        let doc = Arc::new(doc);
        *cached = Some(Arc::clone(&doc));
        Ok(doc)
    }

    fn document_slot(&self, path: &Path) -> DocumentSlot {
        if let Some(slot) = read_lock(&self.documents).get(path) {
            return Arc::clone(slot);
        }
        Arc::clone(write_lock(&self.documents).entry(path.to_path_buf()).or_default())
    }

    /// Document at `path`, or `None` when the file does not exist.
    pub fn optional_document(&self, path: &Path) -> Result<Option<Arc<Document>>, SdmxError> {
        match self.document(path) {
            Ok(doc) => Ok(Some(doc)),
            Err(err) if err.is_metadata_unavailable() && !path.exists() => Ok(None),
            Err(err) => Err(err),
        }
    }

    fn catalog(&self) -> Result<Arc<IndicatorCatalog>, SdmxError> {
        if let Some(catalog) = read_lock(&self.catalog).as_ref() {
            return Ok(Arc::clone(catalog));
        }
        let _building = lock(&self.catalog_build);
        if let Some(catalog) = read_lock(&self.catalog).as_ref() {
            return Ok(Arc::clone(catalog));
        }
        let path = self.layout.indicators_path();
        let doc = self.document(&path)?;
        let catalog = Arc::new(build_catalog(&path, &doc)?);
        let mut slot = write_lock(&self.catalog);
        Ok(Arc::clone(slot.get_or_insert(catalog)))
    }

    /// Catalog entry for `code`, `None` when the catalog has no such indicator.
    pub fn resolve_indicator(
        &self,
        code: &IndicatorCode,
    ) -> Result<Option<Arc<IndicatorRecord>>, SdmxError> {
        Ok(self.catalog()?.records.get(code).cloned())
    }

    /// Every catalog code, in document order.
    pub fn indicator_codes(&self) -> Result<Vec<IndicatorCode>, SdmxError> {
        Ok(self.catalog()?.order.clone())
    }

    pub fn catalog_info(&self) -> Result<CatalogInfo, SdmxError> {
        Ok(self.catalog()?.info.clone())
    }

    /// Case-insensitive substring search over code, name and category.
    pub fn search_indicators(&self, query: &str) -> Result<Vec<Arc<IndicatorRecord>>, SdmxError> {
        let catalog = self.catalog()?;
        let needle = query.trim().to_lowercase();
        Ok(catalog
            .order
            .iter()
            .filter_map(|code| catalog.records.get(code))
            .filter(|rec| {
                needle.is_empty()
                    || rec.code.as_str().to_lowercase().contains(&needle)
                    || rec.name.to_lowercase().contains(&needle)
                    || rec
                        .category
                        .as_deref()
                        .is_some_and(|c| c.to_lowercase().contains(&needle))
            })
            .cloned()
            .collect())
    }

    pub fn schema(&self, dataflow: &DataflowId) -> Result<Arc<DataflowSchema>, SdmxError> {
        if let Some(schema) = read_lock(&self.schemas).get(dataflow) {
            return Ok(Arc::clone(schema));
        }
        let path = self.layout.schema_path(dataflow);
        let doc = self.document(&path)?;
        let schema = Arc::new(build_schema(&path, dataflow, &doc)?);
        let mut schemas = write_lock(&self.schemas);
        Ok(Arc::clone(schemas.entry(dataflow.clone()).or_insert(schema)))
    }

    /// Dimensions of `dataflow`, ascending by position.
    pub fn get_dimensions(
        &self,
        dataflow: &DataflowId,
    ) -> Result<Arc<[DimensionDescriptor]>, SdmxError> {
        Ok(Arc::clone(&self.schema(dataflow)?.dimensions))
    }

    /// Returns the memoised sequence for `code` under the prefix table identified by
    /// `table`, building it with `build` on first use.
    pub fn memoized_sequence<F>(
        &self,
        table: u64,
        code: &IndicatorCode,
        build: F,
    ) -> Result<Arc<FallbackSequence>, SdmxError>
    where
        F: FnOnce() -> Result<FallbackSequence, SdmxError>,
    {
        let key = (table, code.clone());
        if let Some(seq) = read_lock(&self.sequences).get(&key) {
            return Ok(Arc::clone(seq));
        }
        let seq = Arc::new(build()?);
        let mut sequences = write_lock(&self.sequences);
        Ok(Arc::clone(sequences.entry(key).or_insert(seq)))
    }

    pub fn is_stale(&self, path: &Path, max_age_days: u32) -> Result<bool, SdmxError> {
        self.is_stale_at(path, max_age_days, Utc::now())
    }

    /// A document is stale when its `synced_at` / `last_updated` stamp is older than
    /// `max_age_days`, or when the stamp (or the whole file) is missing.
    pub fn is_stale_at(
        &self,
        path: &Path,
        max_age_days: u32,
        now: DateTime<Utc>,
    ) -> Result<bool, SdmxError> {
        let Some(doc) = self.optional_document(path)? else {
            return Ok(true);
        };
        let Some(stamp) = sync_timestamp(doc.root()) else {
            log::debug!("{} declares no sync timestamp", path.display());
            return Ok(true);
        };
        let Some(synced) = parse_timestamp(stamp) else {
            log::warn!("unparseable sync timestamp {stamp:?} in {}", path.display());
            return Ok(true);
        };
        Ok(now.signed_duration_since(synced) > chrono::Duration::days(i64::from(max_age_days)))
    }
}

fn unavailable(path: &Path, err: &io::Error) -> SdmxError {
    SdmxError::MetadataUnavailable {
        path: path.to_path_buf(),
        reason: err.to_string(),
    }
}

fn malformed(path: &Path, line: usize, message: impl Into<String>) -> SdmxError {
    SdmxError::MalformedMetadata {
        path: path.to_path_buf(),
        line,
        message: message.into(),
    }
}

fn sync_timestamp(root: &Node) -> Option<&str> {
    ["synced_at", "last_updated"].iter().find_map(|field| {
        root.path(&["_metadata", field])
            .or_else(|| root.get(field))
            .and_then(Node::as_str)
    })
}

/// RFC 3339, `YYYY-MM-DDTHH:MM:SS[.f]`, `YYYY-MM-DD HH:MM:SS` or a bare date (UTC assumed).
pub fn parse_timestamp(value: &str) -> Option<DateTime<Utc>> {
    let value = value.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(value) {
        return Some(dt.with_timezone(&Utc));
    }
    for format in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(value, format) {
            return Some(naive.and_utc());
        }
    }
    NaiveDate::parse_from_str(value, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|naive| naive.and_utc())
}

fn opt_string(map: &Mapping, key: &str) -> Option<String> {
    map.get(key)
        .and_then(Node::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

fn build_catalog(path: &Path, doc: &Document) -> Result<IndicatorCatalog, SdmxError> {
    let root = doc
        .root()
        .as_map()
        .ok_or_else(|| malformed(path, 1, "catalog root must be a mapping"))?;
    let meta = root.get("_metadata").and_then(Node::as_map);
    let mut info = CatalogInfo {
        synced_at: sync_timestamp(doc.root()).map(str::to_string),
        source: meta.and_then(|m| opt_string(m, "source")),
        agency: meta.and_then(|m| opt_string(m, "agency")),
        version: meta.and_then(|m| opt_string(m, "version")),
        indicator_count: 0,
    };

    let mut records = AHashMap::new();
    let mut order = Vec::new();
    let empty = Mapping::new();
    let Some(entry) = root.entry("indicators") else {
        return Ok(IndicatorCatalog {
            info,
            records,
            order,
        });
    };
    let indicators = match &entry.value {
        Node::Map(map) => map,
        Node::Null => &empty,
        _ => return Err(malformed(path, entry.line, "`indicators` must be a mapping")),
    };

    for item in indicators.iter() {
        let code: IndicatorCode = item.key.parse().map_err(|_| {
            malformed(path, item.line, format!("invalid indicator code {:?}", item.key))
        })?;
        let fields = match &item.value {
            Node::Map(map) => map,
            Node::Null => &empty,
            _ => {
                return Err(malformed(
                    path,
                    item.line,
                    format!("indicator {code} must be a mapping"),
                ));
            }
        };
        let flows_node = fields.get("dataflows").or_else(|| fields.get("dataflow"));
        let mut dataflows = Vec::new();
        for name in flows_node.map(Node::as_str_list).unwrap_or_default() {
            let id: DataflowId = name.parse().map_err(|_| {
                malformed(path, item.line, format!("invalid dataflow {name:?} for {code}"))
            })?;
            if !dataflows.contains(&id) {
                dataflows.push(id);
            }
        }
        let record = IndicatorRecord {
            name: opt_string(fields, "name").unwrap_or_else(|| code.to_string()),
            category: opt_string(fields, "category"),
            description: opt_string(fields, "description"),
            dataflows,
            tier: fields.get("tier").and_then(Node::as_i64),
            disaggregations_with_totals: fields
                .get("disaggregations_with_totals")
                .map(Node::as_str_list)
                .unwrap_or_default()
                .into_iter()
                .map(|s| s.trim().to_ascii_uppercase())
                .collect(),
            code: code.clone(),
        };
        // codes differing only in case collapse onto one entry; keep the later one
        if records.insert(code.clone(), Arc::new(record)).is_none() {
            order.push(code);
        }
    }
    info.indicator_count = order.len();
    Ok(IndicatorCatalog {
        info,
        records,
        order,
    })
}

fn build_schema(
    path: &Path,
    dataflow: &DataflowId,
    doc: &Document,
) -> Result<DataflowSchema, SdmxError> {
    let root = doc
        .root()
        .as_map()
        .ok_or_else(|| malformed(path, 1, "schema root must be a mapping"))?;
    let dims_entry = root
        .entry("dimensions")
        .ok_or_else(|| malformed(path, 1, "schema has no `dimensions` list"))?;
    let items = dims_entry
        .value
        .as_list()
        .ok_or_else(|| malformed(path, dims_entry.line, "`dimensions` must be a list"))?;

    let mut dimensions = Vec::with_capacity(items.len());
    for (i, item) in items.iter().enumerate() {
        let (id, position) = match item {
            Node::Scalar(id) => (id.trim().to_string(), None),
            Node::Map(map) => {
                let id = opt_string(map, "id").ok_or_else(|| {
                    malformed(path, dims_entry.line, format!("dimension #{} has no id", i + 1))
                })?;
                let position = match map.entry("position") {
                    Some(pos) => Some(
                        pos.value
                            .as_i64()
                            .filter(|p| *p >= 1)
                            .and_then(|p| u32::try_from(p).ok())
                            .ok_or_else(|| {
                                malformed(path, pos.line, "position must be between 1 and 4294967295")
                            })?,
                    ),
                    None => None,
                };
                (id, position)
            }
            _ => {
                return Err(malformed(
                    path,
                    dims_entry.line,
                    format!("dimension #{} must be an id or a mapping", i + 1),
                ));
            }
        };
        dimensions.push(DimensionDescriptor {
            id: id.to_ascii_uppercase(),
            position: match position {
                Some(p) => p,
                None => u32::try_from(i + 1)
                    .map_err(|_| malformed(path, dims_entry.line, "too many dimensions"))?,
            },
        });
    }
    dimensions.sort_by_key(|d| d.position);

    let attributes = root
        .get("attributes")
        .and_then(Node::as_list)
        .map(|items| {
            items
                .iter()
                .filter_map(|item| match item {
                    Node::Scalar(id) => Some(id.trim().to_string()),
                    Node::Map(map) => opt_string(map, "id"),
                    _ => None,
                })
                .collect()
        })
        .unwrap_or_default();

    if let Some(declared) = opt_string(root, "id")
        && !declared.eq_ignore_ascii_case(dataflow.as_str())
    {
        log::warn!(
            "{} declares id {declared}, expected {dataflow}",
            path.display()
        );
    }

    Ok(DataflowSchema {
        id: dataflow.clone(),
        name: opt_string(root, "name"),
        agency: opt_string(root, "agency"),
        version: opt_string(root, "version"),
        dimensions: dimensions.into(),
        attributes,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn timestamps_in_several_shapes() {
        let expected = Utc.with_ymd_and_hms(2025, 3, 4, 5, 6, 7).unwrap();
        assert_eq!(parse_timestamp("2025-03-04T05:06:07Z"), Some(expected));
        assert_eq!(parse_timestamp("2025-03-04T05:06:07"), Some(expected));
        assert_eq!(parse_timestamp("2025-03-04 05:06:07"), Some(expected));
        assert_eq!(parse_timestamp("2025-03-04T05:06:07.250").map(|d| d.timestamp()), Some(expected.timestamp()));
        assert_eq!(
            parse_timestamp("2025-03-04"),
            Some(Utc.with_ymd_and_hms(2025, 3, 4, 0, 0, 0).unwrap())
        );
        assert_eq!(parse_timestamp("last tuesday"), None);
    }

    #[test]
    fn layout_paths() {
        let layout = MetadataLayout::new("/tmp/meta");
        let id: DataflowId = "CME".parse().unwrap();
        assert!(layout.schema_path(&id).ends_with("dataflows/CME.yaml"));
        assert!(layout.indicators_path().ends_with("indicators.yaml"));
    }
}
