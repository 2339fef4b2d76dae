//! Paged fetch with fallback across candidate dataflows.
//!
//! For each dataflow of the indicator's [`FallbackSequence`](crate::models::FallbackSequence),
//! in order:
//!
//! 1. build the key against that dataflow's schema;
//! 2. request pages of `page_size` rows (`startIndex` = 0, n, 2n, ...) until a short page,
//!    a 204, or an error status after the first page;
//! 3. retry each page on transient failures, up to `max_attempts`;
//! 4. stop at the first dataflow that yields rows; otherwise record the attempt and move on.
//!
//! Pages of a failed attempt are dropped, never merged into a later one. If every candidate
//! fails the caller gets [`SdmxError::ExhaustedFallback`] with the full attempt history.
//!
//! ```no_run
//! # use unicef_sdmx::config::Settings;
//! # use unicef_sdmx::fetch::{FetchEngine, FetchRequest};
//! let settings = Settings::load(None)?;
//! let store = settings.metadata_store();
//! let engine = FetchEngine::new(&store, settings.transport()?, settings.fetch_options());
//! let result = engine.fetch(&FetchRequest::new("CME_MRY0T4".parse()?))?;
//! println!("{} rows from {}", result.row_count(), result.dataflow_used);
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

use std::time::Duration;

use serde::Serialize;

use crate::client::{PageRequest, PageResponse, SdmxTransport, TransportError, is_transient_status};
use crate::error::SdmxError;
use crate::metadata::MetadataStore;
use crate::models::{DataflowId, FetchResult, IndicatorCode, QueryKey, YearRange};
use crate::query_key::{Filters, KeyMode, KeyWarning, SchemaKeyBuilder};
use crate::resolver::{FallbackTable, IndicatorResolver};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchOptions {
    pub page_size: usize,
    /// Tries per page, first try included.
    pub max_attempts: u32,
    pub retry_delay: Duration,
    /// Safety cap on pages per attempt.
    pub max_pages: usize,
    /// Used when the dataflow's schema does not name one.
    pub agency: String,
    pub version: String,
}

impl Default for FetchOptions {
    fn default() -> Self {
        Self {
            page_size: 100_000,
            max_attempts: 3,
            retry_delay: Duration::from_secs(1),
            max_pages: 1_000,
            agency: "UNICEF".to_string(),
            version: "1.0".to_string(),
        }
    }
}

/// What to fetch for one indicator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchRequest {
    pub indicator: IndicatorCode,
    /// Tried before the resolved sequence.
    pub dataflow: Option<DataflowId>,
    pub filters: Filters,
    pub years: Option<YearRange>,
    /// Empty segments instead of `_T` when no filters are given.
    pub all_disaggregations: bool,
}

impl FetchRequest {
    pub fn new(indicator: IndicatorCode) -> Self {
        Self {
            indicator,
            dataflow: None,
            filters: Filters::default(),
            years: None,
            all_disaggregations: false,
        }
    }

    pub fn dataflow(mut self, dataflow: DataflowId) -> Self {
        self.dataflow = Some(dataflow);
        self
    }

    pub fn filters(mut self, filters: Filters) -> Self {
        self.filters = filters;
        self
    }

    pub fn years(mut self, years: YearRange) -> Self {
        self.years = Some(years);
        self
    }

    pub fn all_disaggregations(mut self, yes: bool) -> Self {
        self.all_disaggregations = yes;
        self
    }

    pub fn mode(&self) -> KeyMode {
        if !self.filters.is_empty() {
            KeyMode::UserFilters
        } else if self.all_disaggregations {
            KeyMode::AllDisaggregations
        } else {
            KeyMode::Totals
        }
    }
}

/// How one dataflow attempt ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AttemptOutcome {
    Success,
    /// Every page came back empty.
    Empty,
    /// Non-transient error status on the first page.
    NoData { status: u16 },
    /// A page kept failing after `attempts` tries.
    TransportFailed { attempts: u32, message: String },
    DecodeFailed { message: String },
}

impl AttemptOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, AttemptOutcome::Success)
    }
}

/// One dataflow tried during a fetch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Attempt {
    pub dataflow: DataflowId,
    pub key: QueryKey,
    pub outcome: AttemptOutcome,
    pub pages: usize,
    pub rows: usize,
    pub warnings: Vec<KeyWarning>,
}

enum PageFailure {
    Exhausted { attempts: u32, message: String },
    Decode(String),
}

struct AttemptRun {
    outcome: AttemptOutcome,
    pages: usize,
    headers: Vec<String>,
    rows: Vec<Vec<String>>,
}

impl AttemptRun {
    fn failed(outcome: AttemptOutcome, pages: usize) -> Self {
        Self {
            outcome,
            pages,
            headers: Vec::new(),
            rows: Vec::new(),
        }
    }
}

/// Orchestrates resolution, key building and paging against one transport.
#[derive(Debug)]
pub struct FetchEngine<'a, T: SdmxTransport> {
    store: &'a MetadataStore,
    resolver: IndicatorResolver<'a>,
    keys: SchemaKeyBuilder<'a>,
    transport: T,
    options: FetchOptions,
}

impl<'a, T: SdmxTransport> FetchEngine<'a, T> {
    pub fn new(store: &'a MetadataStore, transport: T, options: FetchOptions) -> Self {
        Self {
            store,
            resolver: IndicatorResolver::new(store),
            keys: SchemaKeyBuilder::new(store),
            transport,
            options,
        }
    }

    /// Replaces the prefix table used for indicators without a catalog entry.
    pub fn with_fallback_table(mut self, table: FallbackTable) -> Self {
        self.resolver = IndicatorResolver::with_table(self.store, table);
        self
    }

    pub fn options(&self) -> &FetchOptions {
        &self.options
    }

    pub fn resolver(&self) -> &IndicatorResolver<'a> {
        &self.resolver
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Rows for `request.indicator` from the first candidate dataflow that has any.
    pub fn fetch(&self, request: &FetchRequest) -> Result<FetchResult, SdmxError> {
        let indicator = &request.indicator;
        let mode = request.mode();
        let sequence = self
            .resolver
            .resolve_with_override(indicator, request.dataflow.as_ref())?;
        log::debug!(
            "{indicator}: {} candidate dataflow(s), mode {mode:?}",
            sequence.len()
        );

        let mut attempts: Vec<Attempt> = Vec::with_capacity(sequence.len());
        for dataflow in sequence.iter() {
            let built = self.keys.build(indicator, dataflow, &request.filters, mode)?;
            let run = self.run_attempt(dataflow, &built.key, request.years);
            log::debug!(
                "{indicator}: {dataflow} key {} -> {:?} ({} rows, {} pages)",
                built.key,
                run.outcome,
                run.rows.len(),
                run.pages
            );
            attempts.push(Attempt {
                dataflow: dataflow.clone(),
                key: built.key.clone(),
                outcome: run.outcome.clone(),
                pages: run.pages,
                rows: run.rows.len(),
                warnings: built.warnings,
            });
            if run.outcome.is_success() {
                log::info!(
                    "{indicator}: {} rows from {dataflow} after {} attempt(s)",
                    run.rows.len(),
                    attempts.len()
                );
                return Ok(FetchResult {
                    indicator: Some(indicator.clone()),
                    dataflow_used: dataflow.clone(),
                    key: built.key,
                    headers: run.headers,
                    rows: run.rows,
                    pages: run.pages,
                    attempts,
                });
            }
        }

        let err = SdmxError::ExhaustedFallback {
            indicator: indicator.to_string(),
            attempts,
        };
        log::warn!("{err}");
        Err(err)
    }

    /// Whole-dataflow export (`all` key), without fallback.
    pub fn fetch_dataflow(
        &self,
        dataflow: &DataflowId,
        years: Option<YearRange>,
    ) -> Result<FetchResult, SdmxError> {
        let key = self.keys.build_bulk().key;
        let run = self.run_attempt(dataflow, &key, years);
        let attempt = Attempt {
            dataflow: dataflow.clone(),
            key: key.clone(),
            outcome: run.outcome.clone(),
            pages: run.pages,
            rows: run.rows.len(),
            warnings: Vec::new(),
        };
        match run.outcome {
            AttemptOutcome::Success => Ok(FetchResult {
                indicator: None,
                dataflow_used: dataflow.clone(),
                key,
                headers: run.headers,
                rows: run.rows,
                pages: run.pages,
                attempts: vec![attempt],
            }),
            AttemptOutcome::Empty => Err(SdmxError::NoDataForDataflow {
                dataflow: dataflow.to_string(),
                status: 204,
            }),
            AttemptOutcome::NoData { status } => Err(SdmxError::NoDataForDataflow {
                dataflow: dataflow.to_string(),
                status,
            }),
            AttemptOutcome::TransportFailed { attempts, message } => {
                Err(SdmxError::TransientTransport {
                    message: format!("{dataflow}: {message} (after {attempts} tries)"),
                })
            }
            AttemptOutcome::DecodeFailed { message } => Err(SdmxError::TransientTransport {
                message: format!("{dataflow}: undecodable response: {message}"),
            }),
        }
    }

    /// Agency and version from the dataflow's schema, else the configured defaults.
    fn coordinates(&self, dataflow: &DataflowId) -> (String, String) {
        match self.store.schema(dataflow) {
            Ok(schema) => (
                schema
                    .agency
                    .clone()
                    .unwrap_or_else(|| self.options.agency.clone()),
                schema
                    .version
                    .clone()
                    .unwrap_or_else(|| self.options.version.clone()),
            ),
            Err(_) => (self.options.agency.clone(), self.options.version.clone()),
        }
    }

    fn run_attempt(
        &self,
        dataflow: &DataflowId,
        key: &QueryKey,
        years: Option<YearRange>,
    ) -> AttemptRun {
        let (agency, version) = self.coordinates(dataflow);
        let page_size = self.options.page_size.max(1);
        let mut headers: Vec<String> = Vec::new();
        let mut rows: Vec<Vec<String>> = Vec::new();
        let mut pages = 0usize;

        loop {
            if pages >= self.options.max_pages {
                log::warn!(
                    "{dataflow}: page limit reached ({}), keeping {} rows",
                    self.options.max_pages,
                    rows.len()
                );
                break;
            }
            let request = PageRequest {
                agency: agency.clone(),
                dataflow: dataflow.clone(),
                version: version.clone(),
                key: key.clone(),
                years,
                start_index: pages * page_size,
                count: page_size,
            };
            match self.get_with_retry(&request) {
                Ok(PageResponse::Rows(page)) => {
                    pages += 1;
                    let n = page.len();
                    log::debug!("{dataflow}: page {pages} at {} -> {n} rows", request.start_index);
                    if headers.is_empty() {
                        headers = page.headers;
                    }
                    rows.extend(page.rows);
                    if n < page_size {
                        break;
                    }
                }
                Ok(PageResponse::NoContent) => break,
                Ok(PageResponse::Status(status)) if pages == 0 => {
                    return AttemptRun::failed(AttemptOutcome::NoData { status }, 0);
                }
                Ok(PageResponse::Status(status)) => {
                    log::debug!("{dataflow}: HTTP {status} after {pages} pages, treating as end");
                    break;
                }
                Err(PageFailure::Exhausted { attempts, message }) => {
                    return AttemptRun::failed(
                        AttemptOutcome::TransportFailed { attempts, message },
                        pages,
                    );
                }
                Err(PageFailure::Decode(message)) => {
                    return AttemptRun::failed(AttemptOutcome::DecodeFailed { message }, pages);
                }
            }
        }

        let outcome = if rows.is_empty() {
            AttemptOutcome::Empty
        } else {
            AttemptOutcome::Success
        };
        AttemptRun {
            outcome,
            pages,
            headers,
            rows,
        }
    }

    fn get_with_retry(&self, request: &PageRequest) -> Result<PageResponse, PageFailure> {
        let max_attempts = self.options.max_attempts.max(1);
        let mut last = String::new();
        for attempt in 1..=max_attempts {
            match self.transport.get_page(request) {
                Ok(PageResponse::Status(status)) if is_transient_status(status) => {
                    last = format!("HTTP {status}");
                }
                Ok(response) => return Ok(response),
                Err(err) if err.is_transient() => {
                    last = match &err {
                        TransportError::Network { timeout: true, .. } => format!("{err} (timed out)"),
                        _ => err.to_string(),
                    };
                }
                Err(TransportError::Decode { message }) => return Err(PageFailure::Decode(message)),
                Err(err) => return Err(PageFailure::Decode(err.to_string())),
            }
            if attempt < max_attempts {
                log::debug!(
                    "{} page at {}: {last}, retrying ({attempt}/{max_attempts})",
                    request.dataflow,
                    request.start_index
                );
                std::thread::sleep(self.options.retry_delay);
            }
        }
        Err(PageFailure::Exhausted {
            attempts: max_attempts,
            message: last,
        })
    }
}
