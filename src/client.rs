//! HTTP access to the SDMX REST `data` endpoint.
//!
//! The fetch engine talks to the warehouse through [`SdmxTransport`], one page per call, so
//! tests can drive it with an in-memory implementation. [`HttpTransport`] is the real one:
//!
//! ```text
//! {base}/data/{agency},{dataflow},{version}/{key}?format=csv&labels=id&startIndex=0&count=100000
//! ```
//!
//! ```no_run
//! # use unicef_sdmx::client::{HttpTransport, PageRequest, SdmxTransport};
//! # use unicef_sdmx::config::Settings;
//! let transport = HttpTransport::new(&Settings::default())?;
//! let page = transport.get_page(&PageRequest {
//!     agency: "UNICEF".into(),
//!     dataflow: "CME".parse()?,
//!     version: "1.0".into(),
//!     key: unicef_sdmx::models::QueryKey::new(".CME_MRY0T4._T"),
//!     years: None,
//!     start_index: 0,
//!     count: 1000,
//! })?;
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

use std::time::Duration;

use percent_encoding::{AsciiSet, NON_ALPHANUMERIC};
use reqwest::StatusCode;
use reqwest::blocking::Client as HttpClient;
use reqwest::redirect::Policy;
use thiserror::Error;

use crate::config::{LabelMode, Settings};
use crate::error::SdmxError;
use crate::models::{DataflowId, FetchPage, QueryKey, YearRange};

/// One page of one query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageRequest {
    pub agency: String,
    pub dataflow: DataflowId,
    pub version: String,
    pub key: QueryKey,
    pub years: Option<YearRange>,
    pub start_index: usize,
    pub count: usize,
}

/// What the server answered, short of a transport failure.
#[derive(Debug, Clone, PartialEq)]
pub enum PageResponse {
    Rows(FetchPage),
    /// HTTP 204.
    NoContent,
    /// Any other non-success status.
    Status(u16),
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    #[error("network error: {message}")]
    Network { message: String, timeout: bool },
    #[error("undecodable response: {message}")]
    Decode { message: String },
}

impl TransportError {
    /// Network errors and timeouts count against the retry budget; a body that does not
    /// parse will not parse the second time either.
    pub fn is_transient(&self) -> bool {
        matches!(self, TransportError::Network { .. })
    }
}

/// Statuses worth retrying.
pub fn is_transient_status(status: u16) -> bool {
    status >= 500 || status == 408 || status == 429
}

/// Page-at-a-time access to the data endpoint.
pub trait SdmxTransport: Send + Sync {
    fn get_page(&self, request: &PageRequest) -> Result<PageResponse, TransportError>;
}

impl<T: SdmxTransport + ?Sized> SdmxTransport for &T {
    fn get_page(&self, request: &PageRequest) -> Result<PageResponse, TransportError> {
        (**self).get_page(request)
    }
}

impl<T: SdmxTransport + ?Sized> SdmxTransport for Box<T> {
    fn get_page(&self, request: &PageRequest) -> Result<PageResponse, TransportError> {
        (**self).get_page(request)
    }
}

// Allow -, _, . unescaped in path parts; + joins alternative codes inside a key segment
const SAFE: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'+');

fn enc(part: &str) -> String {
    percent_encoding::utf8_percent_encode(part.trim(), SAFE).to_string()
}

/// Blocking `reqwest` transport.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    pub base_url: String,
    pub labels: LabelMode,
    http: HttpClient,
}

impl HttpTransport {
    pub fn new(settings: &Settings) -> Result<Self, SdmxError> {
        let http = HttpClient::builder()
            .timeout(Duration::from_secs(settings.timeout_secs)) // total request timeout
            .connect_timeout(Duration::from_secs(settings.connect_timeout_secs))
            .redirect(Policy::limited(5)) // cap redirects
            .user_agent(concat!("unicef_sdmx/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| SdmxError::Config(format!("http client: {e}")))?;
        Ok(Self {
            base_url: settings.base_url.trim_end_matches('/').to_string(),
            labels: settings.labels,
            http,
        })
    }

    pub fn page_url(&self, request: &PageRequest) -> String {
        let mut url = format!(
            "{}/data/{},{},{}/{}?format=csv&labels={}",
            self.base_url,
            enc(&request.agency),
            enc(request.dataflow.as_str()),
            enc(&request.version),
            enc(request.key.as_str()),
            self.labels.as_param(),
        );
        if let Some(years) = &request.years {
            for (name, value) in years.to_query_params() {
                url.push_str(&format!("&{name}={value}"));
            }
        }
        url.push_str(&format!(
            "&startIndex={}&count={}",
            request.start_index, request.count
        ));
        url
    }
}

impl SdmxTransport for HttpTransport {
    fn get_page(&self, request: &PageRequest) -> Result<PageResponse, TransportError> {
        let url = self.page_url(request);
        log::debug!("GET {url}");
        let response = self
            .http
            .get(&url)
            .header(reqwest::header::ACCEPT, "text/csv")
            .send()
            .map_err(|e| TransportError::Network {
                message: format!("GET {url}: {e}"),
                timeout: e.is_timeout(),
            })?;

        let status = response.status();
        if status == StatusCode::NO_CONTENT {
            return Ok(PageResponse::NoContent);
        }
        if !status.is_success() {
            return Ok(PageResponse::Status(status.as_u16()));
        }
        let body = response.text().map_err(|e| TransportError::Network {
            message: format!("read body of {url}: {e}"),
            timeout: e.is_timeout(),
        })?;
        parse_csv_page(&body).map(PageResponse::Rows)
    }
}

/// Parses one SDMX-CSV page. An empty body is an empty page.
pub fn parse_csv_page(body: &str) -> Result<FetchPage, TransportError> {
    if body.trim().is_empty() {
        return Ok(FetchPage::default());
    }
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .from_reader(body.as_bytes());
    let headers = reader
        .headers()
        .map_err(|e| TransportError::Decode {
            message: e.to_string(),
        })?
        .iter()
        .map(|h| h.trim().to_string())
        .collect::<Vec<_>>();

    let mut rows = Vec::new();
    for record in reader.records() {
        let record = record.map_err(|e| TransportError::Decode {
            message: e.to_string(),
        })?;
        rows.push(record.iter().map(str::to_string).collect());
    }
    Ok(FetchPage { headers, rows })
}
