//! Aggregation pipeline: source registry, per-source fetch tasks, and the
//! normalize → filter → dedup → stats stages behind `run()`.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use serde::Deserialize;
use serde_json::Value as JsonValue;
use tokio::sync::{Mutex, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};
use uuid::Uuid;
use w3jobs_core::{
    AggregationResult, ApiAccount, ApiSchema, ListingRecord, SourceCount, SourceDescriptor,
    SourceKind,
};
use w3jobs_extract::{
    collapse_whitespace, extract_records, map_flat_array, map_greenhouse, map_lever, resolve_url,
    ExtractContext, SelectorProfile,
};
use w3jobs_fetch::{HttpClientConfig, HttpFetcher, PageFetch};

pub const CRATE_NAME: &str = "w3jobs-aggregate";

const WEB3CAREER_API_ENDPOINT: &str = "https://web3.career/api/v1?token={token}";

/// Pipeline knobs; everything is per-run, nothing survives across runs.
#[derive(Debug, Clone)]
pub struct AggregatorConfig {
    /// Concurrent source tasks; sources beyond the cap queue for a slot.
    pub concurrency: usize,
    pub http: HttpClientConfig,
    /// Courtesy delay between successive pages of one HTML source.
    pub page_delay: Duration,
    /// Courtesy delay between account calls behind one API source.
    pub api_call_delay: Duration,
    pub web3career_api_key: Option<String>,
}

impl Default for AggregatorConfig {
    fn default() -> Self {
        Self {
            concurrency: 6,
            http: HttpClientConfig::default(),
            page_delay: Duration::from_millis(500),
            api_call_delay: Duration::from_millis(200),
            web3career_api_key: None,
        }
    }
}

impl AggregatorConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let mut http = defaults.http;
        if let Some(secs) = std::env::var("W3JOBS_HTTP_TIMEOUT_SECS")
            .ok()
            .and_then(|v| v.parse().ok())
        {
            http.timeout = Duration::from_secs(secs);
        }
        if let Ok(agent) = std::env::var("W3JOBS_USER_AGENT") {
            http.user_agent = agent;
        }
        Self {
            concurrency: std::env::var("W3JOBS_CONCURRENCY")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.concurrency),
            http,
            page_delay: defaults.page_delay,
            api_call_delay: defaults.api_call_delay,
            web3career_api_key: std::env::var("WEB3CAREER_API_KEY")
                .ok()
                .filter(|key| !key.is_empty()),
        }
    }
}

// --- Source registry -----------------------------------------------------

#[derive(Debug, Clone)]
pub struct SourceRegistry {
    sources: Vec<SourceDescriptor>,
}

#[derive(Debug, Clone, Deserialize)]
struct RegistryOverrides {
    sources: Vec<SourceOverride>,
}

#[derive(Debug, Clone, Deserialize)]
struct SourceOverride {
    id: String,
    enabled: bool,
}

impl SourceRegistry {
    pub fn new(sources: Vec<SourceDescriptor>) -> Self {
        Self { sources }
    }

    pub fn list(&self) -> &[SourceDescriptor] {
        &self.sources
    }

    pub fn enabled(&self) -> Vec<SourceDescriptor> {
        self.sources.iter().filter(|s| s.enabled).cloned().collect()
    }

    /// Flip enabled flags from a `sources.yaml` override document.
    /// Unknown ids are ignored with a warning.
    pub fn apply_overrides_yaml(&mut self, yaml: &str) -> Result<()> {
        let overrides: RegistryOverrides =
            serde_yaml::from_str(yaml).context("parsing sources override yaml")?;
        for entry in overrides.sources {
            match self.sources.iter_mut().find(|s| s.id == entry.id) {
                Some(source) => source.enabled = entry.enabled,
                None => warn!(id = %entry.id, "override references unknown source id"),
            }
        }
        Ok(())
    }

    /// The builtin catalog: HTML boards plus the Greenhouse and Lever
    /// multi-company APIs.
    pub fn builtin() -> Self {
        let mut sources = vec![
            SourceDescriptor::html(
                "cryptocurrencyjobs",
                "CryptocurrencyJobs",
                "https://cryptocurrencyjobs.co/jobs/?page={page}",
                "https://cryptocurrencyjobs.co",
                3,
            ),
            SourceDescriptor::html(
                "web3career",
                "Web3.career",
                "https://web3.career/?page={page}",
                "https://web3.career",
                7,
            ),
            SourceDescriptor::html(
                "cryptojobslist",
                "CryptoJobsList",
                "https://cryptojobslist.com/?page={page}",
                "https://cryptojobslist.com",
                3,
            ),
            SourceDescriptor::html(
                "remote3",
                "Remote3",
                "https://www.remote3.co/",
                "https://www.remote3.co",
                1,
            )
            .with_assume_remote(),
            SourceDescriptor::html(
                "cryptojobs_com",
                "CryptoJobs.com",
                "https://www.cryptojobs.com/jobs?page={page}",
                "https://www.cryptojobs.com",
                3,
            ),
            SourceDescriptor::html(
                "crypto_jobs_io",
                "Crypto.Jobs",
                "https://www.crypto.jobs/",
                "https://www.crypto.jobs",
                1,
            ),
            SourceDescriptor::html(
                "beincrypto",
                "BeInCrypto",
                "https://beincrypto.com/jobs/",
                "https://beincrypto.com",
                1,
            ),
            SourceDescriptor::html(
                "jobstash",
                "JobStash",
                "https://jobstash.xyz/jobs",
                "https://jobstash.xyz",
                1,
            ),
            SourceDescriptor::html(
                "crypto_careers",
                "Crypto Careers",
                "https://www.crypto-careers.com/jobs?page={page}",
                "https://www.crypto-careers.com",
                3,
            ),
            SourceDescriptor::html(
                "midnight",
                "Midnight Network",
                "https://midnight.network/careers",
                "https://midnight.network",
                1,
            )
            .with_default_company("Midnight Network"),
            SourceDescriptor::html(
                "dragonfly",
                "Dragonfly",
                "https://jobs.dragonfly.xyz/jobs",
                "https://jobs.dragonfly.xyz",
                1,
            )
            .with_default_company("Dragonfly Portfolio"),
            SourceDescriptor::html(
                "block",
                "Block",
                "https://block.xyz/careers",
                "https://block.xyz",
                1,
            )
            .with_default_company("Block (Square/Cash App)"),
            SourceDescriptor::html(
                "solana_jobs",
                "Solana Jobs",
                "https://jobs.solana.com/jobs",
                "https://jobs.solana.com",
                1,
            )
            .with_default_company("Solana Ecosystem"),
            SourceDescriptor::html(
                "avalanche_jobs",
                "Avalanche Jobs",
                "https://jobs.avax.network/jobs",
                "https://jobs.avax.network",
                1,
            )
            .with_default_company("Avalanche Ecosystem"),
            SourceDescriptor::html(
                "ethereum_jobboard",
                "Ethereum Job Board",
                "https://www.ethereumjobboard.com/jobs",
                "https://www.ethereumjobboard.com",
                1,
            ),
        ];

        sources.push(SourceDescriptor::api(
            "greenhouse",
            "Greenhouse (Multi-company API)",
            "https://boards-api.greenhouse.io/v1/boards/{slug}/jobs",
            ApiSchema::Greenhouse,
            greenhouse_accounts(),
        ));
        sources.push(SourceDescriptor::api(
            "lever",
            "Lever (Multi-company API)",
            "https://api.lever.co/v0/postings/{slug}?mode=json",
            ApiSchema::Lever,
            lever_accounts(),
        ));

        Self::new(sources)
    }
}

fn greenhouse_accounts() -> Vec<ApiAccount> {
    [
        ("coinbase", "Coinbase"),
        ("kraken", "Kraken"),
        ("blockchain", "Blockchain.com"),
        ("fireblocks", "Fireblocks"),
        ("chainalysis", "Chainalysis"),
        ("ledger", "Ledger"),
        ("bitgo", "BitGo"),
        ("circle", "Circle"),
        ("paxos", "Paxos"),
        ("anchorage", "Anchorage Digital"),
        ("figment", "Figment"),
        ("uniswaplabs", "Uniswap Labs"),
        ("consensys", "ConsenSys"),
        ("opensea", "OpenSea"),
        ("dydx", "dYdX"),
        ("arbitrum", "Arbitrum"),
        ("optimism", "Optimism"),
        ("celestiaorg", "Celestia"),
        ("eigenlabs", "EigenLayer"),
        ("starkware", "StarkWare"),
        ("aptoslabs", "Aptos Labs"),
        ("galaxydigitalservices", "Galaxy Digital"),
        ("wormholefoundation", "Wormhole"),
        ("nethermind", "Nethermind"),
        ("dune", "Dune Analytics"),
        ("axelar", "Axelar"),
        ("layerzero", "LayerZero"),
    ]
    .into_iter()
    .map(|(slug, company)| ApiAccount::new(slug, company))
    .collect()
}

fn lever_accounts() -> Vec<ApiAccount> {
    [
        ("crypto", "Crypto.com"),
        ("binance", "Binance"),
        ("animocabrands", "Animoca Brands"),
        ("certik", "CertiK"),
        ("polygon-technology", "Polygon"),
        ("chainlink", "Chainlink"),
        ("offchainlabs", "Offchain Labs (Arbitrum)"),
        ("ethereumfoundation", "Ethereum Foundation"),
        ("Solana", "Solana Foundation"),
        ("zksync", "zkSync (Matter Labs)"),
        ("alchemy", "Alchemy"),
        ("quicknode", "QuickNode"),
        ("thegraph", "The Graph"),
        ("phantom", "Phantom"),
        ("WalletConnect", "WalletConnect"),
        ("wintermute", "Wintermute"),
        ("mythicalgames", "Mythical Games"),
        ("skymavis", "Sky Mavis (Axie Infinity)"),
        ("filecoin", "Filecoin Foundation"),
        ("protocol", "Protocol Labs"),
        ("livepeer", "Livepeer"),
        ("kadena", "Kadena"),
    ]
    .into_iter()
    .map(|(slug, company)| ApiAccount::new(slug, company))
    .collect()
}

// --- Per-source fetch tasks ----------------------------------------------

/// Contract for one source's fetch task. The orchestrator only sees this
/// trait, which keeps failure isolation testable with stub sources.
#[async_trait]
pub trait SourceFetch: Send + Sync {
    fn descriptor(&self) -> &SourceDescriptor;
    async fn fetch(&self, http: &dyn PageFetch, run_id: Uuid) -> Result<Vec<ListingRecord>>;
}

/// Iterates the account list behind one JSON API source.
pub struct ApiFetcher {
    descriptor: SourceDescriptor,
    call_delay: Duration,
}

impl ApiFetcher {
    pub fn new(descriptor: SourceDescriptor, call_delay: Duration) -> Self {
        Self {
            descriptor,
            call_delay,
        }
    }

    fn account_label(&self, company: &str) -> String {
        match self.descriptor.schema {
            Some(ApiSchema::Greenhouse) => format!("{company} (Greenhouse)"),
            Some(ApiSchema::Lever) => format!("{company} (Lever)"),
            _ => self.descriptor.display_name.clone(),
        }
    }

    fn map_body(&self, body: &JsonValue, company: &str) -> Vec<ListingRecord> {
        let label = self.account_label(company);
        let fetched_at = Utc::now();
        match self.descriptor.schema {
            Some(ApiSchema::Greenhouse) => map_greenhouse(body, company, &label, fetched_at),
            Some(ApiSchema::Lever) => map_lever(body, company, &label, fetched_at),
            Some(ApiSchema::FlatArray) => map_flat_array(body, &label, fetched_at),
            None => Vec::new(),
        }
    }
}

#[async_trait]
impl SourceFetch for ApiFetcher {
    fn descriptor(&self) -> &SourceDescriptor {
        &self.descriptor
    }

    async fn fetch(&self, http: &dyn PageFetch, run_id: Uuid) -> Result<Vec<ListingRecord>> {
        let mut records = Vec::new();

        if self.descriptor.accounts.is_empty() {
            match http
                .get_json(run_id, &self.descriptor.id, &self.descriptor.endpoint)
                .await
            {
                Ok(body) => records.extend(self.map_body(&body, &self.descriptor.display_name)),
                Err(err) => debug!(source = %self.descriptor.id, error = %err, "api call failed"),
            }
            return Ok(records);
        }

        for account in &self.descriptor.accounts {
            if records.len() >= self.descriptor.max_records {
                break;
            }
            let url = self.descriptor.endpoint.replace("{slug}", &account.slug);
            match http.get_json(run_id, &self.descriptor.id, &url).await {
                Ok(body) => records.extend(self.map_body(&body, &account.company)),
                Err(err) => {
                    debug!(
                        source = %self.descriptor.id,
                        account = %account.slug,
                        error = %err,
                        "account call failed"
                    );
                }
            }
            tokio::time::sleep(self.call_delay).await;
        }
        records.truncate(self.descriptor.max_records);
        Ok(records)
    }
}

/// Paginates one HTML source, extracting per page until a page comes back
/// empty, a fetch fails, or the ceilings are hit.
pub struct HtmlFetcher {
    descriptor: SourceDescriptor,
    profile: SelectorProfile,
    page_delay: Duration,
    /// Structured endpoint tried before scraping (Web3.career with a key).
    api_probe: Option<String>,
}

impl HtmlFetcher {
    pub fn new(descriptor: SourceDescriptor, page_delay: Duration) -> Self {
        Self {
            descriptor,
            profile: SelectorProfile::default(),
            page_delay,
            api_probe: None,
        }
    }

    pub fn with_profile(mut self, profile: SelectorProfile) -> Self {
        self.profile = profile;
        self
    }

    pub fn with_api_probe(mut self, endpoint: String) -> Self {
        self.api_probe = Some(endpoint);
        self
    }

    fn page_url(&self, page: u32) -> String {
        self.descriptor.endpoint.replace("{page}", &page.to_string())
    }
}

#[async_trait]
impl SourceFetch for HtmlFetcher {
    fn descriptor(&self) -> &SourceDescriptor {
        &self.descriptor
    }

    async fn fetch(&self, http: &dyn PageFetch, run_id: Uuid) -> Result<Vec<ListingRecord>> {
        if let Some(endpoint) = &self.api_probe {
            match http.get_json(run_id, &self.descriptor.id, endpoint).await {
                Ok(body) => {
                    let label = format!("{} (API)", self.descriptor.display_name);
                    let records = map_flat_array(&body, &label, Utc::now());
                    if !records.is_empty() {
                        return Ok(records);
                    }
                    debug!(source = %self.descriptor.id, "api probe empty; falling back to scraping");
                }
                Err(err) => {
                    debug!(source = %self.descriptor.id, error = %err, "api probe failed; falling back to scraping");
                }
            }
        }

        let mut records: Vec<ListingRecord> = Vec::new();
        for page in 1..=self.descriptor.max_pages {
            let url = self.page_url(page);
            let html = match http.get_text(run_id, &self.descriptor.id, &url).await {
                Ok(html) => html,
                Err(err) => {
                    // A timed-out or failed page stops this source's
                    // pagination only; siblings are unaffected.
                    debug!(source = %self.descriptor.id, page, error = %err, "page fetch failed");
                    break;
                }
            };

            let ctx = ExtractContext {
                source: &self.descriptor.display_name,
                base_url: &self.descriptor.base_url,
                default_company: &self.descriptor.default_company,
                assume_remote: self.descriptor.assume_remote,
                record_ceiling: self.descriptor.max_records.saturating_sub(records.len()),
                fetched_at: Utc::now(),
            };
            let page_records = extract_records(&html, &self.profile, &ctx);
            if page_records.is_empty() {
                break;
            }
            records.extend(page_records);
            if records.len() >= self.descriptor.max_records {
                break;
            }
            if page < self.descriptor.max_pages {
                tokio::time::sleep(self.page_delay).await;
            }
        }
        Ok(records)
    }
}

fn fetcher_for(descriptor: SourceDescriptor, config: &AggregatorConfig) -> Arc<dyn SourceFetch> {
    match descriptor.kind {
        SourceKind::Api => Arc::new(ApiFetcher::new(descriptor, config.api_call_delay)),
        SourceKind::Html => {
            let mut fetcher = HtmlFetcher::new(descriptor, config.page_delay);
            if fetcher.descriptor.id == "web3career" {
                if let Some(key) = &config.web3career_api_key {
                    fetcher = fetcher
                        .with_api_probe(WEB3CAREER_API_ENDPOINT.replace("{token}", key));
                }
            }
            Arc::new(fetcher)
        }
    }
}

// --- Orchestrator --------------------------------------------------------

/// Run the whole pipeline over the given sources with default config.
pub async fn run(
    sources: &[SourceDescriptor],
    keywords: Option<&[String]>,
) -> Result<AggregationResult> {
    run_with_config(sources, keywords, &AggregatorConfig::default()).await
}

/// Run the whole pipeline: fan out one bounded task per enabled source,
/// then normalize, filter, deduplicate, and count the combined records.
///
/// Individual source failures are soft; the only fatal error is failing to
/// construct the HTTP client itself.
pub async fn run_with_config(
    sources: &[SourceDescriptor],
    keywords: Option<&[String]>,
    config: &AggregatorConfig,
) -> Result<AggregationResult> {
    let http = Arc::new(HttpFetcher::new(config.http.clone()).context("constructing http client")?);
    let fetchers: Vec<Arc<dyn SourceFetch>> = sources
        .iter()
        .filter(|s| s.enabled)
        .map(|s| fetcher_for(s.clone(), config))
        .collect();

    let started = std::time::Instant::now();
    info!(sources = fetchers.len(), "starting aggregation run");
    let collected = collect_from_sources(fetchers, http, config.concurrency).await;
    let result = finish_pipeline(collected, sources, keywords);
    info!(
        total = result.total(),
        elapsed_ms = started.elapsed().as_millis() as u64,
        "aggregation run complete"
    );
    Ok(result)
}

/// Fan out one task per source under the concurrency cap, appending each
/// successful contribution into one mutex-guarded collection. A failing
/// task logs and contributes nothing.
async fn collect_from_sources(
    fetchers: Vec<Arc<dyn SourceFetch>>,
    http: Arc<HttpFetcher>,
    concurrency: usize,
) -> Vec<ListingRecord> {
    let run_id = Uuid::new_v4();
    let limit = Arc::new(Semaphore::new(concurrency.max(1)));
    let collected = Arc::new(Mutex::new(Vec::new()));
    let mut tasks = JoinSet::new();

    for fetcher in fetchers {
        let limit = Arc::clone(&limit);
        let collected = Arc::clone(&collected);
        let http = Arc::clone(&http);
        tasks.spawn(async move {
            let _permit = limit.acquire_owned().await.expect("semaphore not closed");
            let source_id = fetcher.descriptor().id.clone();
            match fetcher.fetch(http.as_ref(), run_id).await {
                Ok(records) => {
                    info!(source = %source_id, count = records.len(), "source complete");
                    collected.lock().await.extend(records);
                }
                Err(err) => {
                    warn!(source = %source_id, error = %err, "source failed; contributing nothing");
                }
            }
        });
    }

    while let Some(joined) = tasks.join_next().await {
        if let Err(err) = joined {
            warn!(error = %err, "source task aborted");
        }
    }

    match Arc::try_unwrap(collected) {
        Ok(mutex) => mutex.into_inner(),
        Err(shared) => shared.lock().await.clone(),
    }
}

fn finish_pipeline(
    mut records: Vec<ListingRecord>,
    sources: &[SourceDescriptor],
    keywords: Option<&[String]>,
) -> AggregationResult {
    let normalizer = Normalizer::from_sources(sources);
    for record in &mut records {
        normalizer.normalize(record);
    }

    let records = match keywords {
        Some(keywords) if !keywords.is_empty() => filter_by_keywords(records, keywords),
        _ => records,
    };
    let records = deduplicate(records);
    let counts_by_source = source_stats(&records);

    AggregationResult {
        records,
        counts_by_source,
    }
}

// --- Normalizer ----------------------------------------------------------

/// Whitespace collapsing and relative-URL resolution. Pure; the base URL
/// lookup goes through the record's source display name, never a live
/// descriptor reference.
pub struct Normalizer {
    base_urls: HashMap<String, String>,
}

impl Normalizer {
    pub fn from_sources(sources: &[SourceDescriptor]) -> Self {
        let base_urls = sources
            .iter()
            .filter(|s| !s.base_url.is_empty())
            .map(|s| (s.display_name.clone(), s.base_url.clone()))
            .collect();
        Self { base_urls }
    }

    pub fn normalize(&self, record: &mut ListingRecord) {
        record.title = collapse_whitespace(&record.title);
        record.company = collapse_whitespace(&record.company);
        record.location = collapse_whitespace(&record.location);

        let url = record.url.trim();
        if !url.is_empty() && !url.starts_with("http://") && !url.starts_with("https://") {
            if let Some(base) = self.base_urls.get(&record.source) {
                record.url = resolve_url(base, url);
            }
        }
    }
}

// --- Deduplicator --------------------------------------------------------

/// Dedup key: lowercased title + "|" + lowercased company, falling back to
/// the URL when both are empty. Degenerate keys get `None` and the record
/// is dropped rather than kept ambiguous.
pub fn dedup_key(record: &ListingRecord) -> Option<String> {
    let title = collapse_whitespace(&record.title).to_lowercase();
    let company = collapse_whitespace(&record.company).to_lowercase();
    if title.is_empty() && company.is_empty() {
        let url = record.url.trim().to_lowercase();
        if url.is_empty() {
            return None;
        }
        return Some(url);
    }
    Some(format!("{title}|{company}"))
}

/// First-seen record per key wins. Idempotent.
pub fn deduplicate(records: Vec<ListingRecord>) -> Vec<ListingRecord> {
    let mut seen = HashSet::new();
    let mut unique = Vec::new();
    for record in records {
        let Some(key) = dedup_key(&record) else {
            continue;
        };
        if seen.insert(key) {
            unique.push(record);
        }
    }
    unique
}

// --- KeywordFilter -------------------------------------------------------

/// Retain records whose searchable text contains every keyword,
/// case-insensitively. An empty keyword list is the identity filter.
pub fn filter_by_keywords(records: Vec<ListingRecord>, keywords: &[String]) -> Vec<ListingRecord> {
    if keywords.is_empty() {
        return records;
    }
    let lowered: Vec<String> = keywords.iter().map(|k| k.to_lowercase()).collect();
    records
        .into_iter()
        .filter(|record| {
            let text = record.searchable_text();
            lowered.iter().all(|keyword| text.contains(keyword.as_str()))
        })
        .collect()
}

// --- StatsAggregator -----------------------------------------------------

/// Per-source record counts, descending; ties keep first-encountered order.
pub fn source_stats(records: &[ListingRecord]) -> Vec<SourceCount> {
    let mut counts: HashMap<&str, usize> = HashMap::new();
    let mut order: Vec<&str> = Vec::new();
    for record in records {
        let entry = counts.entry(record.source.as_str()).or_insert(0);
        if *entry == 0 {
            order.push(record.source.as_str());
        }
        *entry += 1;
    }

    let mut stats: Vec<SourceCount> = order
        .into_iter()
        .map(|source| SourceCount {
            source: source.to_string(),
            count: counts[source],
        })
        .collect();
    stats.sort_by(|a, b| b.count.cmp(&a.count));
    stats
}
