//! Record extraction: cascading HTML heuristics + API payload mapping.
//!
//! Extraction is deterministic given identical input, so every heuristic here
//! is testable without touching the network.

use chrono::{DateTime, Utc};
use scraper::{ElementRef, Html, Selector};
use serde_json::Value as JsonValue;
use w3jobs_core::{title_within_bounds, ListingRecord};

pub const CRATE_NAME: &str = "w3jobs-extract";

/// Strategy configuration for one HTML source. Sources share the default
/// profile; a source with unusual markup overrides fields instead of
/// getting its own extraction code path.
#[derive(Debug, Clone)]
pub struct SelectorProfile {
    /// Known "job card" class fragments, tried first.
    pub card_class_patterns: Vec<String>,
    /// Container tags scanned by the vocabulary strategy.
    pub container_tags: Vec<String>,
    /// Word-bounded class vocabulary for the container strategy.
    pub container_vocab: Vec<String>,
    /// Substring class vocabulary for company extraction.
    pub company_vocab: Vec<String>,
    /// Substring class vocabulary for location extraction.
    pub location_vocab: Vec<String>,
    /// Titles rejected outright (navigation and UI chrome).
    pub stopwords: Vec<String>,
    /// Container-strategy scan ceiling.
    pub scan_limit: usize,
}

impl Default for SelectorProfile {
    fn default() -> Self {
        Self {
            card_class_patterns: strings(&["job-card", "JobCard", "job-listing", "job_card"]),
            container_tags: strings(&["div", "article", "li", "section"]),
            container_vocab: strings(&[
                "job", "listing", "posting", "position", "opening", "vacancy",
            ]),
            company_vocab: strings(&["company", "employer", "org"]),
            location_vocab: strings(&["location", "place", "geo", "remote"]),
            stopwords: strings(&[
                "login",
                "sign up",
                "post a job",
                "home",
                "about",
                "contact",
                "menu",
                "newsletter",
                "subscribe",
                "cookie",
                "privacy",
                "terms",
                "jobs",
                "careers",
                "apply",
                "more",
                "view all",
                "see all",
                "load more",
            ]),
            scan_limit: 200,
        }
    }
}

fn strings(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}

/// Per-page extraction input that comes from the owning source descriptor.
#[derive(Debug, Clone)]
pub struct ExtractContext<'a> {
    pub source: &'a str,
    pub base_url: &'a str,
    pub default_company: &'a str,
    pub assume_remote: bool,
    pub record_ceiling: usize,
    pub fetched_at: DateTime<Utc>,
}

/// Collapse internal whitespace runs to single spaces and trim the ends.
pub fn collapse_whitespace(input: &str) -> String {
    input.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Resolve an href against a base URL. Already-absolute links pass through.
pub fn resolve_url(base_url: &str, href: &str) -> String {
    let href = href.trim();
    if href.is_empty() || href.starts_with("http://") || href.starts_with("https://") {
        return href.to_string();
    }
    format!(
        "{}/{}",
        base_url.trim_end_matches('/'),
        href.trim_start_matches('/')
    )
}

fn parse_selector(source: &str) -> Option<Selector> {
    Selector::parse(source).ok()
}

/// Word-bounded match: any class token (split on space, `-`, `_`) equals a
/// vocabulary word, case-insensitively.
fn class_has_word(class_attr: &str, vocab: &[String]) -> bool {
    class_attr
        .split([' ', '\t', '\n', '-', '_'])
        .filter(|token| !token.is_empty())
        .any(|token| vocab.iter().any(|word| token.eq_ignore_ascii_case(word)))
}

/// Loose match: the class attribute contains a vocabulary word anywhere.
fn class_contains(class_attr: &str, vocab: &[String]) -> bool {
    let lowered = class_attr.to_lowercase();
    vocab.iter().any(|word| lowered.contains(word.as_str()))
}

/// Hrefs that look like job detail pages: `/job/...` or `/jobs/...` followed
/// by a slug character.
fn job_path_like(href: &str) -> bool {
    let lowered = href.to_lowercase();
    for marker in ["/job/", "/jobs/"] {
        if let Some(idx) = lowered.find(marker) {
            let rest = &lowered[idx + marker.len()..];
            if rest
                .chars()
                .next()
                .is_some_and(|c| c.is_ascii_alphanumeric())
            {
                return true;
            }
        }
    }
    false
}

fn element_text(el: ElementRef<'_>) -> String {
    collapse_whitespace(&el.text().collect::<String>())
}

fn first_descendant_with_class<'a>(
    candidate: ElementRef<'a>,
    vocab: &[String],
) -> Option<ElementRef<'a>> {
    let any = parse_selector("*")?;
    candidate.select(&any).find(|el| {
        el.value()
            .attr("class")
            .is_some_and(|class| class_contains(class, vocab))
    })
}

/// Pick candidate nodes with the cascading strategy set: known card classes,
/// then vocabulary-matched containers, then job-path anchors, then all
/// anchors capped at the record ceiling. The first strategy yielding any
/// candidates wins.
fn candidate_nodes<'a>(
    document: &'a Html,
    profile: &SelectorProfile,
    record_ceiling: usize,
) -> Vec<ElementRef<'a>> {
    let card_selector = profile
        .card_class_patterns
        .iter()
        .map(|pattern| format!("[class*=\"{pattern}\"]"))
        .collect::<Vec<_>>()
        .join(", ");
    if let Some(sel) = parse_selector(&card_selector) {
        let cards: Vec<_> = document.select(&sel).collect();
        if !cards.is_empty() {
            return cards;
        }
    }

    if let Some(sel) = parse_selector(&profile.container_tags.join(", ")) {
        let containers: Vec<_> = document
            .select(&sel)
            .filter(|el| {
                el.value()
                    .attr("class")
                    .is_some_and(|class| class_has_word(class, &profile.container_vocab))
            })
            .take(profile.scan_limit)
            .collect();
        if !containers.is_empty() {
            return containers;
        }
    }

    if let Some(sel) = parse_selector("a[href]") {
        let job_links: Vec<_> = document
            .select(&sel)
            .filter(|el| el.value().attr("href").is_some_and(job_path_like))
            .collect();
        if !job_links.is_empty() {
            return job_links;
        }
    }

    match parse_selector("a") {
        Some(sel) => document.select(&sel).take(record_ceiling).collect(),
        None => Vec::new(),
    }
}

fn extract_candidate(
    candidate: ElementRef<'_>,
    profile: &SelectorProfile,
    ctx: &ExtractContext<'_>,
) -> Option<ListingRecord> {
    let heading_sel = parse_selector("h2, h3, h4")?;
    let anchor_sel = parse_selector("a[href]")?;

    let (title, raw_url) = if candidate.value().name() == "a" {
        (
            element_text(candidate),
            candidate.value().attr("href").unwrap_or_default().to_string(),
        )
    } else {
        let title_el = candidate
            .select(&heading_sel)
            .next()
            .or_else(|| candidate.select(&anchor_sel).next())?;
        let href = candidate
            .select(&anchor_sel)
            .next()
            .and_then(|a| a.value().attr("href"))
            .unwrap_or_default()
            .to_string();
        (element_text(title_el), href)
    };

    if !title_within_bounds(&title) {
        return None;
    }
    let lowered = title.trim().to_lowercase();
    if profile.stopwords.iter().any(|stop| *stop == lowered) {
        return None;
    }

    let company = first_descendant_with_class(candidate, &profile.company_vocab)
        .map(element_text)
        .filter(|text| !text.is_empty())
        .unwrap_or_else(|| ctx.default_company.to_string());

    let mut location = first_descendant_with_class(candidate, &profile.location_vocab)
        .map(element_text)
        .unwrap_or_default();
    if location.is_empty() {
        if element_text(candidate).to_lowercase().contains("remote") {
            location = "Remote".to_string();
        } else if ctx.assume_remote {
            location = "Remote".to_string();
        }
    }

    Some(ListingRecord {
        title,
        company,
        location,
        url: resolve_url(ctx.base_url, &raw_url),
        source: ctx.source.to_string(),
        team: None,
        fetched_at: ctx.fetched_at,
    })
}

/// Extract listing records from one parsed page.
pub fn extract_records(
    html: &str,
    profile: &SelectorProfile,
    ctx: &ExtractContext<'_>,
) -> Vec<ListingRecord> {
    let document = Html::parse_document(html);
    let candidates = candidate_nodes(&document, profile, ctx.record_ceiling);

    let mut records = Vec::new();
    for candidate in candidates {
        if records.len() >= ctx.record_ceiling {
            break;
        }
        if let Some(record) = extract_candidate(candidate, profile, ctx) {
            records.push(record);
        }
    }
    records
}

// --- API payload mapping -------------------------------------------------

fn json_str<'a>(value: &'a JsonValue, path: &[&str]) -> Option<&'a str> {
    let mut cur = value;
    for segment in path {
        cur = cur.get(*segment)?;
    }
    cur.as_str()
}

fn json_field(value: &JsonValue, path: &[&str]) -> String {
    json_str(value, path).unwrap_or_default().trim().to_string()
}

/// Greenhouse boards API: `{"jobs": [{title, location: {name}, absolute_url}]}`.
pub fn map_greenhouse(
    body: &JsonValue,
    company: &str,
    source_label: &str,
    fetched_at: DateTime<Utc>,
) -> Vec<ListingRecord> {
    let Some(jobs) = body.get("jobs").and_then(|v| v.as_array()) else {
        return Vec::new();
    };
    jobs.iter()
        .filter_map(|job| {
            let title = json_field(job, &["title"]);
            if !title_within_bounds(&title) {
                return None;
            }
            Some(ListingRecord {
                title,
                company: company.to_string(),
                location: json_field(job, &["location", "name"]),
                url: json_field(job, &["absolute_url"]),
                source: source_label.to_string(),
                team: None,
                fetched_at,
            })
        })
        .collect()
}

/// Lever postings API: `[{text, categories: {location, team}, hostedUrl}]`.
pub fn map_lever(
    body: &JsonValue,
    company: &str,
    source_label: &str,
    fetched_at: DateTime<Utc>,
) -> Vec<ListingRecord> {
    let Some(postings) = body.as_array() else {
        return Vec::new();
    };
    postings
        .iter()
        .filter_map(|posting| {
            let title = json_field(posting, &["text"]);
            if !title_within_bounds(&title) {
                return None;
            }
            let team = json_str(posting, &["categories", "team"])
                .map(str::trim)
                .filter(|t| !t.is_empty())
                .map(ToString::to_string);
            Some(ListingRecord {
                title,
                company: company.to_string(),
                location: json_field(posting, &["categories", "location"]),
                url: json_field(posting, &["hostedUrl"]),
                source: source_label.to_string(),
                team,
                fetched_at,
            })
        })
        .collect()
}

/// Flat array shape: `[{title, company, location, url}]`.
pub fn map_flat_array(
    body: &JsonValue,
    source_label: &str,
    fetched_at: DateTime<Utc>,
) -> Vec<ListingRecord> {
    let Some(items) = body.as_array() else {
        return Vec::new();
    };
    items
        .iter()
        .filter_map(|item| {
            let title = json_field(item, &["title"]);
            if !title_within_bounds(&title) {
                return None;
            }
            Some(ListingRecord {
                title,
                company: json_field(item, &["company"]),
                location: json_field(item, &["location"]),
                url: json_field(item, &["url"]),
                source: source_label.to_string(),
                team: None,
                fetched_at,
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ctx<'a>(source: &'a str, base_url: &'a str) -> ExtractContext<'a> {
        ExtractContext {
            source,
            base_url,
            default_company: "",
            assume_remote: false,
            record_ceiling: 200,
            fetched_at: Utc::now(),
        }
    }

    #[test]
    fn url_resolution_handles_relative_and_absolute() {
        assert_eq!(
            resolve_url("https://example.com", "/jobs/42"),
            "https://example.com/jobs/42"
        );
        assert_eq!(
            resolve_url("https://example.com/", "jobs/42"),
            "https://example.com/jobs/42"
        );
        assert_eq!(
            resolve_url("https://example.com", "https://other.io/x"),
            "https://other.io/x"
        );
        assert_eq!(resolve_url("https://example.com", ""), "");
    }

    #[test]
    fn known_card_classes_win_the_cascade() {
        let html = r#"
            <div class="job-card">
              <h3>Senior Solidity Engineer</h3>
              <span class="company-name">Acme Labs</span>
              <span class="location-tag">Berlin</span>
              <a href="/jobs/42">details</a>
            </div>
            <div class="unrelated"><a href="/jobs/99">Other Role Anchor</a></div>
        "#;
        let records = extract_records(html, &SelectorProfile::default(), &ctx("Board", "https://example.com"));
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].title, "Senior Solidity Engineer");
        assert_eq!(records[0].company, "Acme Labs");
        assert_eq!(records[0].location, "Berlin");
        assert_eq!(records[0].url, "https://example.com/jobs/42");
        assert_eq!(records[0].source, "Board");
    }

    #[test]
    fn container_vocabulary_strategy_applies_when_no_cards_match() {
        let html = r#"
            <li class="open-position"><h2>Protocol Engineer</h2><a href="/p/1">go</a></li>
            <li class="nav-item"><a href="/about">About Us Page</a></li>
        "#;
        let records = extract_records(html, &SelectorProfile::default(), &ctx("Board", "https://example.com"));
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].title, "Protocol Engineer");
    }

    #[test]
    fn job_path_anchors_are_the_third_fallback() {
        let html = r#"
            <p><a href="/jobs/rust-engineer">Rust Engineer at Acme</a></p>
            <p><a href="/blog/post">A Very Long Blog Post Title</a></p>
        "#;
        let records = extract_records(html, &SelectorProfile::default(), &ctx("Board", "https://example.com"));
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].title, "Rust Engineer at Acme");
        assert_eq!(records[0].url, "https://example.com/jobs/rust-engineer");
    }

    #[test]
    fn all_anchors_fallback_is_capped_by_record_ceiling() {
        let html = r#"
            <a href="/x/1">First Opportunity Title</a>
            <a href="/x/2">Second Opportunity Title</a>
            <a href="/x/3">Third Opportunity Title</a>
        "#;
        let mut context = ctx("Board", "https://example.com");
        context.record_ceiling = 2;
        let records = extract_records(html, &SelectorProfile::default(), &context);
        assert_eq!(records.len(), 2);
    }

    #[test]
    fn nav_chrome_and_short_titles_are_rejected() {
        let html = r#"
            <div class="job-card"><h3>Home</h3><a href="/">x</a></div>
            <div class="job-card"><h3>Go</h3><a href="/go">x</a></div>
            <div class="job-card"><h3>View All</h3><a href="/all">x</a></div>
            <div class="job-card"><h3>Senior Solidity Engineer</h3><a href="/jobs/1">x</a></div>
        "#;
        let records = extract_records(html, &SelectorProfile::default(), &ctx("Board", "https://example.com"));
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].title, "Senior Solidity Engineer");
    }

    #[test]
    fn remote_substring_infers_location() {
        let html = r#"
            <div class="job-card"><h3>Backend Engineer</h3><p>Remote, worldwide</p><a href="/jobs/7">x</a></div>
        "#;
        let records = extract_records(html, &SelectorProfile::default(), &ctx("Board", "https://example.com"));
        assert_eq!(records[0].location, "Remote");
    }

    #[test]
    fn assume_remote_fills_empty_locations() {
        let html = r#"
            <div class="job-card"><h3>Backend Engineer</h3><a href="/jobs/7">x</a></div>
        "#;
        let mut context = ctx("Remote Board", "https://example.com");
        context.assume_remote = true;
        let records = extract_records(html, &SelectorProfile::default(), &context);
        assert_eq!(records[0].location, "Remote");
    }

    #[test]
    fn default_company_applies_to_careers_pages() {
        let html = r#"
            <div class="job-card"><h3>Compiler Engineer</h3><a href="/jobs/9">x</a></div>
        "#;
        let mut context = ctx("Midnight Network", "https://midnight.network");
        context.default_company = "Midnight Network";
        let records = extract_records(html, &SelectorProfile::default(), &context);
        assert_eq!(records[0].company, "Midnight Network");
    }

    #[test]
    fn whitespace_is_collapsed_in_extracted_text() {
        let html = "<div class=\"job-card\"><h3>  Senior\n\t Rust   Engineer </h3><a href=\"/jobs/3\">x</a></div>";
        let records = extract_records(html, &SelectorProfile::default(), &ctx("Board", "https://example.com"));
        assert_eq!(records[0].title, "Senior Rust Engineer");
    }

    #[test]
    fn extraction_is_deterministic() {
        let html = r#"
            <div class="job-card"><h3>Role One Title</h3><a href="/jobs/1">x</a></div>
            <div class="job-card"><h3>Role Two Title</h3><a href="/jobs/2">x</a></div>
        "#;
        let context = ctx("Board", "https://example.com");
        let a = extract_records(html, &SelectorProfile::default(), &context);
        let b = extract_records(html, &SelectorProfile::default(), &context);
        assert_eq!(a, b);
    }

    #[test]
    fn greenhouse_mapping_tolerates_missing_optionals() {
        let body = json!({
            "jobs": [
                {"title": "Backend Engineer", "location": {"name": "NYC"}, "absolute_url": "https://a.co/1"},
                {"title": "Platform Engineer"},
                {"title": "x"}
            ]
        });
        let records = map_greenhouse(&body, "Acme", "Acme (Greenhouse)", Utc::now());
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].location, "NYC");
        assert_eq!(records[0].url, "https://a.co/1");
        assert_eq!(records[1].location, "");
        assert_eq!(records[1].url, "");
        assert_eq!(records[0].source, "Acme (Greenhouse)");
    }

    #[test]
    fn lever_mapping_extracts_team_and_hosted_url() {
        let body = json!([
            {
                "text": "Smart Contract Auditor",
                "categories": {"location": "Remote", "team": "Security"},
                "hostedUrl": "https://jobs.lever.co/acme/1"
            },
            {"text": "Untitled", "categories": {}}
        ]);
        let records = map_lever(&body, "Acme", "Acme (Lever)", Utc::now());
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].team.as_deref(), Some("Security"));
        assert_eq!(records[0].location, "Remote");
        assert_eq!(records[0].url, "https://jobs.lever.co/acme/1");
        assert_eq!(records[1].team, None);
    }

    #[test]
    fn flat_array_mapping_reads_direct_fields() {
        let body = json!([
            {"title": "Rust Developer", "company": "Acme", "location": "Lisbon", "url": "https://a.co/2"}
        ]);
        let records = map_flat_array(&body, "Web3.career (API)", Utc::now());
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].company, "Acme");
    }

    #[test]
    fn malformed_api_bodies_yield_no_records() {
        assert!(map_greenhouse(&json!({"unexpected": true}), "A", "A", Utc::now()).is_empty());
        assert!(map_lever(&json!({"not": "an array"}), "A", "A", Utc::now()).is_empty());
        assert!(map_flat_array(&json!(42), "A", Utc::now()).is_empty());
    }
}
