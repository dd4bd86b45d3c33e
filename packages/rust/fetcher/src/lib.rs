//! Registry archive acquisition.
//!
//! Resolves the publication month from the registry index, selects the
//! partner archives and downloads them into the raw staging directory. Every
//! request is tried against the primary host first and then against each
//! mirror, with bounded retries and exponential backoff per host.

mod listing;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use egressos_shared::{EgressosError, FetchConfig, Month, Result};
use reqwest::{Client, StatusCode};
use tokio::io::AsyncWriteExt;
use tokio::sync::Semaphore;
use tracing::{debug, info, instrument, warn};
use url::Url;

pub use listing::{normalize_prefixes, parse_archive_names, parse_months, select_archives};

/// User-Agent string for registry requests.
const USER_AGENT: &str = concat!("egressos/", env!("CARGO_PKG_VERSION"));

/// Maximum number of redirects to follow.
const MAX_REDIRECTS: usize = 5;

/// Connect timeout for every request.
const CONNECT_TIMEOUT_SECS: u64 = 20;

// ---------------------------------------------------------------------------
// DataSource
// ---------------------------------------------------------------------------

/// A host serving the registry index, tried in declaration order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DataSource {
    Primary(Url),
    Mirror(Url),
}

impl DataSource {
    /// Build the ordered candidate list: the first URL is the primary host,
    /// the rest are mirrors.
    pub fn from_urls<S: AsRef<str>>(urls: &[S]) -> Result<Vec<Self>> {
        if urls.is_empty() {
            return Err(EgressosError::config("no registry index URL configured"));
        }
        urls.iter()
            .enumerate()
            .map(|(i, raw)| {
                let raw = raw.as_ref().trim();
                let with_slash = if raw.ends_with('/') {
                    raw.to_string()
                } else {
                    format!("{raw}/")
                };
                let url = Url::parse(&with_slash).map_err(|e| {
                    EgressosError::config(format!("invalid registry index URL '{raw}': {e}"))
                })?;
                Ok(if i == 0 { Self::Primary(url) } else { Self::Mirror(url) })
            })
            .collect()
    }

    pub fn base(&self) -> &Url {
        match self {
            Self::Primary(url) | Self::Mirror(url) => url,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::Primary(_) => "primary",
            Self::Mirror(_) => "mirror",
        }
    }

    fn resolve(&self, relative: &str) -> Result<Url> {
        self.base().join(relative).map_err(|e| {
            EgressosError::validation(format!("cannot resolve '{relative}' against {}: {e}", self.base()))
        })
    }
}

// ---------------------------------------------------------------------------
// Request / report
// ---------------------------------------------------------------------------

/// What to download and where.
#[derive(Debug, Clone)]
pub struct FetchRequest {
    /// Publication month; the latest listed month when `None`.
    pub month: Option<Month>,
    /// Archive cap; negative means unbounded.
    pub max_files: i64,
    /// Raw prefix filters (see [`normalize_prefixes`]).
    pub prefixes: Vec<String>,
    /// Staging root; archives land in `<raw_dir>/<month>/`.
    pub raw_dir: PathBuf,
}

/// Outcome of a fetch run.
#[derive(Debug, Clone)]
pub struct FetchReport {
    /// The resolved month.
    pub month: Month,
    /// Local archive paths, in lexicographic file-name order.
    pub files: Vec<PathBuf>,
    /// How many of `files` were already present and reused.
    pub cached: usize,
    /// Archives that failed on every source (file name, error).
    pub failed: Vec<(String, String)>,
}

// ---------------------------------------------------------------------------
// Fetcher
// ---------------------------------------------------------------------------

/// Registry fetcher with host failover.
#[derive(Debug, Clone)]
pub struct Fetcher {
    config: FetchConfig,
    sources: Vec<DataSource>,
    listing_client: Client,
    download_client: Client,
}

impl Fetcher {
    /// Create a fetcher from the runtime fetch configuration.
    pub fn new(config: FetchConfig) -> Result<Self> {
        let sources = DataSource::from_urls(&config.index_urls)?;
        let listing_client = build_client(config.listing_timeout_secs)?;
        let download_client = build_client(config.download_timeout_secs)?;
        Ok(Self {
            config,
            sources,
            listing_client,
            download_client,
        })
    }

    pub fn sources(&self) -> &[DataSource] {
        &self.sources
    }

    /// Months listed in the index root, ascending.
    #[instrument(skip_all)]
    pub async fn list_months(&self) -> Result<Vec<Month>> {
        let html = self.get_listing("").await?;
        let months = parse_months(&html);
        debug!(count = months.len(), "months listed");
        Ok(months)
    }

    /// Archive names published for `month`, sorted lexicographically.
    #[instrument(skip_all, fields(month = %month))]
    pub async fn list_files(&self, month: &Month) -> Result<Vec<String>> {
        let html = self.get_listing(&format!("{month}/")).await?;
        let names = parse_archive_names(&html);
        debug!(count = names.len(), "archives listed");
        Ok(names)
    }

    /// Resolve the month, select archives and download them.
    ///
    /// Per-file failures are collected in [`FetchReport::failed`]; only a
    /// listing that fails on every source aborts the run.
    #[instrument(skip_all, fields(max_files = request.max_files))]
    pub async fn fetch(&self, request: &FetchRequest) -> Result<FetchReport> {
        let months = self.list_months().await?;
        let month = match &request.month {
            Some(wanted) if months.contains(wanted) => wanted.clone(),
            Some(wanted) => {
                return Err(EgressosError::NotFound(format!(
                    "month {wanted} is not published in the registry index"
                )));
            }
            None => months.last().cloned().ok_or_else(|| {
                EgressosError::NotFound("registry index lists no publication month".into())
            })?,
        };

        let prefixes = normalize_prefixes(&request.prefixes);
        let names = self.list_files(&month).await?;
        let selected = select_archives(&names, &prefixes, request.max_files);

        info!(
            month = %month,
            listed = names.len(),
            selected = selected.len(),
            prefixes = ?prefixes,
            "registry archives selected"
        );

        let dest_dir = request.raw_dir.join(month.as_str());
        if !selected.is_empty() {
            tokio::fs::create_dir_all(&dest_dir)
                .await
                .map_err(|e| EgressosError::io(&dest_dir, e))?;
        }

        let semaphore = Arc::new(Semaphore::new(self.config.concurrency.max(1) as usize));
        let mut handles = Vec::with_capacity(selected.len());

        for name in selected {
            let fetcher = self.clone();
            let sem = semaphore.clone();
            let month = month.clone();
            let dest_dir = dest_dir.clone();
            handles.push((
                name.clone(),
                tokio::spawn(async move {
                    let _permit = sem
                        .acquire_owned()
                        .await
                        .map_err(|e| EgressosError::Network(format!("download pool closed: {e}")))?;
                    fetcher.download(&month, &name, &dest_dir).await
                }),
            ));
        }

        let mut report = FetchReport {
            month,
            files: Vec::new(),
            cached: 0,
            failed: Vec::new(),
        };

        for (name, handle) in handles {
            match handle.await {
                Ok(Ok(downloaded)) => {
                    if downloaded.cached {
                        report.cached += 1;
                    }
                    report.files.push(downloaded.path);
                }
                Ok(Err(e)) => {
                    warn!(file = %name, error = %e, "archive download failed");
                    report.failed.push((name, e.to_string()));
                }
                Err(e) => {
                    warn!(file = %name, error = %e, "download task failed");
                    report.failed.push((name, e.to_string()));
                }
            }
        }

        info!(
            month = %report.month,
            files = report.files.len(),
            cached = report.cached,
            failed = report.failed.len(),
            "registry fetch completed"
        );

        Ok(report)
    }

    // -----------------------------------------------------------------------
    // Requests with failover
    // -----------------------------------------------------------------------

    async fn get_listing(&self, relative: &str) -> Result<String> {
        let mut last_error = None;
        for source in &self.sources {
            let url = source.resolve(relative)?;
            match self
                .with_retries(source, &url, || fetch_text(&self.listing_client, &url))
                .await
            {
                Ok(body) => return Ok(body),
                Err(e @ EgressosError::NotFound(_)) => return Err(e),
                Err(e) => last_error = Some(e),
            }
        }
        Err(exhausted(relative, last_error))
    }

    async fn download(&self, month: &Month, name: &str, dest_dir: &Path) -> Result<Downloaded> {
        let dest = dest_dir.join(name);
        if let Ok(meta) = tokio::fs::metadata(&dest).await {
            if meta.is_file() && meta.len() > 0 {
                debug!(file = %name, bytes = meta.len(), "archive already staged");
                return Ok(Downloaded { path: dest, cached: true });
            }
        }

        let part = dest_dir.join(format!("{name}.part"));
        let relative = format!("{month}/{name}");
        let mut last_error = None;

        for source in &self.sources {
            let url = source.resolve(&relative)?;
            let result = self
                .with_retries(source, &url, || {
                    stream_to_file(&self.download_client, &url, &part)
                })
                .await;
            match result {
                Ok(bytes) => {
                    tokio::fs::rename(&part, &dest)
                        .await
                        .map_err(|e| EgressosError::io(&dest, e))?;
                    info!(file = %name, bytes, source = source.label(), "archive downloaded");
                    return Ok(Downloaded { path: dest, cached: false });
                }
                Err(e @ EgressosError::NotFound(_)) => return Err(e),
                Err(e) => last_error = Some(e),
            }
        }
        Err(exhausted(&relative, last_error))
    }

    /// Run `op` up to `retries` times against one source, sleeping
    /// `backoff_ms * 2^attempt` between retryable failures.
    async fn with_retries<T, F, Fut>(&self, source: &DataSource, url: &Url, mut op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<T>>,
    {
        let attempts = self.config.retries.max(1);
        let mut attempt = 0;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_retryable() && attempt + 1 < attempts => {
                    let delay = self.config.backoff_ms.saturating_mul(1 << attempt.min(16));
                    warn!(
                        %url,
                        source = source.label(),
                        attempt = attempt + 1,
                        delay_ms = delay,
                        error = %e,
                        "request failed, retrying"
                    );
                    tokio::time::sleep(Duration::from_millis(delay)).await;
                    attempt += 1;
                }
                Err(e) => {
                    if e.is_retryable() {
                        warn!(%url, source = source.label(), error = %e, "source exhausted");
                    }
                    return Err(e);
                }
            }
        }
    }
}

struct Downloaded {
    path: PathBuf,
    cached: bool,
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn build_client(timeout_secs: u64) -> Result<Client> {
    Client::builder()
        .user_agent(USER_AGENT)
        .redirect(reqwest::redirect::Policy::limited(MAX_REDIRECTS))
        .connect_timeout(Duration::from_secs(CONNECT_TIMEOUT_SECS))
        .timeout(Duration::from_secs(timeout_secs))
        .build()
        .map_err(|e| EgressosError::Network(format!("failed to build HTTP client: {e}")))
}

fn exhausted(what: &str, last_error: Option<EgressosError>) -> EgressosError {
    match last_error {
        Some(e) => EgressosError::Network(format!("all registry sources failed for '{what}': {e}")),
        None => EgressosError::Network(format!("no registry source available for '{what}'")),
    }
}

/// Map a non-success status to an error. 404 is terminal, everything else retryable.
fn check_status(url: &Url, status: StatusCode) -> Result<()> {
    if status.is_success() {
        Ok(())
    } else if status == StatusCode::NOT_FOUND {
        Err(EgressosError::NotFound(format!("{url}: HTTP {status}")))
    } else {
        Err(EgressosError::Network(format!("{url}: HTTP {status}")))
    }
}

async fn fetch_text(client: &Client, url: &Url) -> Result<String> {
    let response = client
        .get(url.as_str())
        .send()
        .await
        .map_err(|e| EgressosError::Network(format!("{url}: {e}")))?;
    check_status(url, response.status())?;
    response
        .text()
        .await
        .map_err(|e| EgressosError::Network(format!("{url}: failed to read body: {e}")))
}

/// Stream a response body into `part`. The partial file is removed on any failure.
async fn stream_to_file(client: &Client, url: &Url, part: &Path) -> Result<u64> {
    let result = stream_inner(client, url, part).await;
    if result.is_err() {
        let _ = tokio::fs::remove_file(part).await;
    }
    result
}

async fn stream_inner(client: &Client, url: &Url, part: &Path) -> Result<u64> {
    let mut response = client
        .get(url.as_str())
        .send()
        .await
        .map_err(|e| EgressosError::Network(format!("{url}: {e}")))?;
    check_status(url, response.status())?;

    let mut file = tokio::fs::File::create(part)
        .await
        .map_err(|e| EgressosError::io(part, e))?;
    let mut written = 0u64;
    while let Some(chunk) = response
        .chunk()
        .await
        .map_err(|e| EgressosError::Network(format!("{url}: body interrupted: {e}")))?
    {
        file.write_all(&chunk)
            .await
            .map_err(|e| EgressosError::io(part, e))?;
        written += chunk.len() as u64;
    }
    file.flush().await.map_err(|e| EgressosError::io(part, e))?;
    file.sync_all().await.map_err(|e| EgressosError::io(part, e))?;
    Ok(written)
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn temp_dir() -> PathBuf {
        let dir = std::env::temp_dir().join(format!("egressos-fetch-{}", Uuid::now_v7()));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    fn config(urls: Vec<String>) -> FetchConfig {
        FetchConfig {
            index_urls: urls,
            concurrency: 2,
            retries: 2,
            backoff_ms: 1,
            listing_timeout_secs: 5,
            download_timeout_secs: 5,
        }
    }

    fn listing(links: &[&str]) -> String {
        let body: String = links
            .iter()
            .map(|l| format!("<a href=\"{l}\">{l}</a>\n"))
            .collect();
        format!("<html><body>\n{body}</body></html>")
    }

    async fn mount_get(server: &MockServer, p: &str, template: ResponseTemplate) {
        Mock::given(method("GET"))
            .and(path(p))
            .respond_with(template)
            .mount(server)
            .await;
    }

    fn request(raw_dir: &Path, month: Option<&str>, max_files: i64, prefixes: &[&str]) -> FetchRequest {
        FetchRequest {
            month: month.map(|m| m.parse().unwrap()),
            max_files,
            prefixes: prefixes.iter().map(|s| s.to_string()).collect(),
            raw_dir: raw_dir.to_path_buf(),
        }
    }

    fn leftover_parts(dir: &Path) -> usize {
        std::fs::read_dir(dir)
            .map(|entries| {
                entries
                    .filter_map(|e| e.ok())
                    .filter(|e| e.file_name().to_string_lossy().ends_with(".part"))
                    .count()
            })
            .unwrap_or(0)
    }

    #[test]
    fn sources_are_ordered() {
        let sources =
            DataSource::from_urls(&["https://primary.example/cnpj", "https://mirror.example/"])
                .unwrap();
        assert!(matches!(sources[0], DataSource::Primary(_)));
        assert!(matches!(sources[1], DataSource::Mirror(_)));
        assert_eq!(sources[0].base().as_str(), "https://primary.example/cnpj/");
        assert!(DataSource::from_urls::<&str>(&[]).is_err());
        assert!(DataSource::from_urls(&["not a url"]).is_err());
    }

    #[tokio::test]
    async fn max_files_keeps_first_in_lexicographic_order() {
        let server = MockServer::start().await;
        let names: Vec<String> = (0..10).rev().map(|i| format!("Socios{i}.zip")).collect();
        let links: Vec<&str> = names.iter().map(String::as_str).collect();

        mount_get(&server, "/", ResponseTemplate::new(200).set_body_string(listing(&["2025-09/"]))).await;
        mount_get(&server, "/2025-09/", ResponseTemplate::new(200).set_body_string(listing(&links))).await;
        for name in &names {
            mount_get(
                &server,
                &format!("/2025-09/{name}"),
                ResponseTemplate::new(200).set_body_bytes(name.as_bytes().to_vec()),
            )
            .await;
        }

        let dir = temp_dir();
        let fetcher = Fetcher::new(config(vec![server.uri()])).unwrap();
        let report = fetcher
            .fetch(&request(&dir, None, 3, &["Socios"]))
            .await
            .unwrap();

        assert_eq!(report.month.as_str(), "2025-09");
        let got: Vec<String> = report
            .files
            .iter()
            .map(|p| p.file_name().unwrap().to_string_lossy().into_owned())
            .collect();
        assert_eq!(got, vec!["Socios0.zip", "Socios1.zip", "Socios2.zip"]);
        assert_eq!(std::fs::read_dir(dir.join("2025-09")).unwrap().count(), 3);
        assert!(report.failed.is_empty());

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn fails_over_to_mirror_without_partial_files() {
        let primary = MockServer::start().await;
        let mirror = MockServer::start().await;

        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(503))
            .expect(6)
            .mount(&primary)
            .await;

        mount_get(&mirror, "/", ResponseTemplate::new(200).set_body_string(listing(&["2025-08/", "2025-09/"]))).await;
        mount_get(
            &mirror,
            "/2025-09/",
            ResponseTemplate::new(200).set_body_string(listing(&["Socios0.zip", "Empresas0.zip"])),
        )
        .await;
        mount_get(
            &mirror,
            "/2025-09/Socios0.zip",
            ResponseTemplate::new(200).set_body_bytes(b"PK-archive".to_vec()),
        )
        .await;

        let dir = temp_dir();
        let fetcher = Fetcher::new(config(vec![primary.uri(), mirror.uri()])).unwrap();
        let report = fetcher
            .fetch(&request(&dir, Some("2025-09"), -1, &["socios"]))
            .await
            .unwrap();

        assert_eq!(report.files.len(), 1);
        assert!(report.failed.is_empty());
        let staged = dir.join("2025-09");
        assert_eq!(std::fs::read(staged.join("Socios0.zip")).unwrap(), b"PK-archive");
        assert_eq!(leftover_parts(&staged), 0);

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn missing_month_listing_is_not_found() {
        let server = MockServer::start().await;
        mount_get(&server, "/", ResponseTemplate::new(200).set_body_string(listing(&["2025-09/"]))).await;
        mount_get(&server, "/2025-09/", ResponseTemplate::new(404)).await;

        let dir = temp_dir();
        let fetcher = Fetcher::new(config(vec![server.uri()])).unwrap();

        let err = fetcher.fetch(&request(&dir, None, -1, &[])).await.unwrap_err();
        assert!(matches!(err, EgressosError::NotFound(_)), "got {err:?}");

        let err = fetcher
            .fetch(&request(&dir, Some("2024-01"), -1, &[]))
            .await
            .unwrap_err();
        assert!(matches!(err, EgressosError::NotFound(_)), "got {err:?}");

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn listing_failing_everywhere_is_network_error() {
        let server = MockServer::start().await;
        mount_get(&server, "/", ResponseTemplate::new(500)).await;

        let dir = temp_dir();
        let fetcher = Fetcher::new(config(vec![server.uri()])).unwrap();
        let err = fetcher.fetch(&request(&dir, None, -1, &[])).await.unwrap_err();
        assert!(matches!(err, EgressosError::Network(_)), "got {err:?}");

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn per_file_failures_are_reported() {
        let server = MockServer::start().await;
        mount_get(&server, "/", ResponseTemplate::new(200).set_body_string(listing(&["2025-09/"]))).await;
        mount_get(
            &server,
            "/2025-09/",
            ResponseTemplate::new(200).set_body_string(listing(&["Socios0.zip", "Socios1.zip"])),
        )
        .await;
        mount_get(
            &server,
            "/2025-09/Socios0.zip",
            ResponseTemplate::new(200).set_body_bytes(b"ok".to_vec()),
        )
        .await;
        mount_get(&server, "/2025-09/Socios1.zip", ResponseTemplate::new(500)).await;

        let dir = temp_dir();
        let fetcher = Fetcher::new(config(vec![server.uri()])).unwrap();
        let report = fetcher.fetch(&request(&dir, None, -1, &["Socios"])).await.unwrap();

        assert_eq!(report.files.len(), 1);
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].0, "Socios1.zip");
        assert_eq!(leftover_parts(&dir.join("2025-09")), 0);

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn staged_archives_are_reused() {
        let server = MockServer::start().await;
        mount_get(&server, "/", ResponseTemplate::new(200).set_body_string(listing(&["2025-09/"]))).await;
        mount_get(
            &server,
            "/2025-09/",
            ResponseTemplate::new(200).set_body_string(listing(&["Socios0.zip"])),
        )
        .await;
        Mock::given(method("GET"))
            .and(path("/2025-09/Socios0.zip"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(b"fresh".to_vec()))
            .expect(0)
            .mount(&server)
            .await;

        let dir = temp_dir();
        let staged = dir.join("2025-09");
        std::fs::create_dir_all(&staged).unwrap();
        std::fs::write(staged.join("Socios0.zip"), b"cached").unwrap();

        let fetcher = Fetcher::new(config(vec![server.uri()])).unwrap();
        let report = fetcher.fetch(&request(&dir, None, -1, &["all"])).await.unwrap();

        assert_eq!(report.cached, 1);
        assert_eq!(std::fs::read(staged.join("Socios0.zip")).unwrap(), b"cached");

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn zero_max_files_downloads_nothing() {
        let server = MockServer::start().await;
        mount_get(&server, "/", ResponseTemplate::new(200).set_body_string(listing(&["2025-09/"]))).await;
        mount_get(
            &server,
            "/2025-09/",
            ResponseTemplate::new(200).set_body_string(listing(&["Socios0.zip"])),
        )
        .await;

        let dir = temp_dir();
        let fetcher = Fetcher::new(config(vec![server.uri()])).unwrap();
        let report = fetcher.fetch(&request(&dir, None, 0, &[])).await.unwrap();

        assert!(report.files.is_empty());
        assert!(!dir.join("2025-09").exists());

        let _ = std::fs::remove_dir_all(&dir);
    }
}
