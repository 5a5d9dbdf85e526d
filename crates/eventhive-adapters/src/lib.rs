//! Per-site extractors: turn a rendered listing page into event candidates.
//!
//! Extractors are pure. Cards missing the fields a site needs are skipped
//! silently and everything else falls back to the site's defaults, so a
//! page whose markup has drifted yields fewer candidates instead of an error.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, SecondsFormat, TimeDelta, Utc};
use eventhive_core::{EventCandidate, EventStatus};
use eventhive_storage::{source_slug, RenderedPage};
use regex::Regex;
use scraper::{ElementRef, Html, Selector};
use thiserror::Error;
use tracing::debug;
use url::Url;

pub const CRATE_NAME: &str = "eventhive-adapters";

pub const DEFAULT_SKILLS: [&str; 3] = ["Coding", "Teamwork", "Innovation"];
const OPEN_TO_ALL: &str = "Open to all";
const NOT_AVAILABLE: &str = "N/A";
const TBD: &str = "TBD";

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("invalid selector `{selector}`: {reason}")]
    Selector { selector: String, reason: String },
    #[error("invalid pattern `{pattern}`: {reason}")]
    Pattern { pattern: String, reason: String },
    #[error("no extractor registered for: {}", .0.join(", "))]
    MissingExtractors(Vec<String>),
}

pub trait Extractor: Send + Sync {
    /// Name of the source this extractor understands, as stored in the registry.
    fn source_name(&self) -> &'static str;

    /// Element the fetcher should wait for before the DOM is read.
    fn wait_selector(&self) -> Option<&'static str>;

    /// Every candidate carries `page.source_name` as its source.
    fn extract(&self, page: &RenderedPage, now: DateTime<Utc>) -> Vec<EventCandidate>;
}

fn compile(selector: &str) -> Result<Selector, AdapterError> {
    Selector::parse(selector).map_err(|e| AdapterError::Selector {
        selector: selector.to_string(),
        reason: e.to_string(),
    })
}

/// Collapses runs of whitespace and drops empty results.
pub fn clean_text(raw: &str) -> Option<String> {
    let cleaned = raw.split_whitespace().collect::<Vec<_>>().join(" ");
    if cleaned.is_empty() {
        None
    } else {
        Some(cleaned)
    }
}

pub fn is_virtual_location(location: &str) -> bool {
    let lower = location.to_lowercase();
    lower.contains("online") || lower.contains("virtual")
}

/// Resolves `raw` against the page URL the way a browser resolves `href`.
pub fn resolve_url(base: Option<&Url>, raw: &str) -> Option<String> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    match base.and_then(|b| b.join(raw).ok()) {
        Some(url) => Some(url.to_string()),
        None => Some(raw.to_string()),
    }
}

fn default_skills() -> Vec<String> {
    DEFAULT_SKILLS.iter().map(|s| s.to_string()).collect()
}

fn extract_integers(text: &str) -> Vec<Option<i64>> {
    let mut out = Vec::new();
    let mut current = String::new();
    for ch in text.chars() {
        if ch.is_ascii_digit() {
            current.push(ch);
            continue;
        }
        if !current.is_empty() {
            out.push(current.parse::<i64>().ok());
            current.clear();
        }
    }
    if !current.is_empty() {
        out.push(current.parse::<i64>().ok());
    }
    out
}

/// Reads a countdown such as "2 days : 5 hours : 30 mins" as days, hours,
/// minutes and seconds in that order, missing trailing units being zero.
///
/// Returns `None` when every unit is zero or the offset does not fit.
pub fn deadline_from_countdown(text: &str, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
    let mut units = extract_integers(text).into_iter();
    let mut next = || units.next().unwrap_or(Some(0));
    let (days, hours, minutes, seconds) = (next()?, next()?, next()?, next()?);
    if days == 0 && hours == 0 && minutes == 0 && seconds == 0 {
        return None;
    }
    let offset = TimeDelta::try_days(days)?
        .checked_add(&TimeDelta::try_hours(hours)?)?
        .checked_add(&TimeDelta::try_minutes(minutes)?)?
        .checked_add(&TimeDelta::try_seconds(seconds)?)?;
    now.checked_add_signed(offset)
}

/// Millisecond-precision UTC timestamp with a `Z` suffix.
pub fn format_timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Query helpers scoped to one listing card.
struct Card<'a> {
    el: ElementRef<'a>,
    base: Option<&'a Url>,
}

impl<'a> Card<'a> {
    fn new(el: ElementRef<'a>, base: Option<&'a Url>) -> Self {
        Self { el, base }
    }

    fn first(&self, selector: &Selector) -> Option<ElementRef<'a>> {
        self.el.select(selector).next()
    }

    fn text(&self, selector: &Selector) -> Option<String> {
        self.first(selector)
            .and_then(|n| clean_text(&n.text().collect::<String>()))
    }

    fn texts(&self, selector: &Selector) -> Vec<String> {
        self.el
            .select(selector)
            .filter_map(|n| clean_text(&n.text().collect::<String>()))
            .collect()
    }

    fn attr(&self, selector: &Selector, name: &str) -> Option<String> {
        self.first(selector)
            .and_then(|n| n.value().attr(name))
            .and_then(clean_text)
    }

    fn url(&self, selector: &Selector, name: &str) -> Option<String> {
        self.first(selector)
            .and_then(|n| n.value().attr(name))
            .and_then(|raw| resolve_url(self.base, raw))
    }

    /// `href` of the card itself or its nearest enclosing anchor.
    fn enclosing_link(&self) -> Option<String> {
        std::iter::once(self.el)
            .chain(self.el.ancestors().filter_map(ElementRef::wrap))
            .find(|el| el.value().name() == "a")
            .and_then(|a| a.value().attr("href"))
            .and_then(|raw| resolve_url(self.base, raw))
    }
}

fn page_base(page: &RenderedPage) -> Option<Url> {
    Url::parse(&page.url).ok()
}

pub struct UnstopExtractor {
    cards: Selector,
    title: Selector,
    organizer: Selector,
    image: Selector,
    days_left: Selector,
    skills: Selector,
}

impl UnstopExtractor {
    pub const SOURCE: &'static str = "Unstop";
    const CARDS: &'static str = "app-competition-listing, app-featured-opportunity-tile";

    pub fn new() -> Result<Self, AdapterError> {
        Ok(Self {
            cards: compile(Self::CARDS)?,
            title: compile("h2")?,
            organizer: compile("p")?,
            image: compile("img")?,
            days_left: compile(".seperate_box.align-center")?,
            skills: compile(".skill_list .chip_text")?,
        })
    }
}

impl Extractor for UnstopExtractor {
    fn source_name(&self) -> &'static str {
        Self::SOURCE
    }

    fn wait_selector(&self) -> Option<&'static str> {
        Some(Self::CARDS)
    }

    fn extract(&self, page: &RenderedPage, _now: DateTime<Utc>) -> Vec<EventCandidate> {
        let document = Html::parse_document(&page.html);
        let base = page_base(page);
        let mut out = Vec::new();
        for el in document.select(&self.cards) {
            let card = Card::new(el, base.as_ref());
            let (Some(title), Some(organizer)) = (card.text(&self.title), card.text(&self.organizer))
            else {
                continue;
            };
            let days_left = card.text(&self.days_left).unwrap_or_else(|| NOT_AVAILABLE.to_string());

            let mut event = EventCandidate::new(&title, &organizer, &days_left, &page.source_name);
            event.location = Some("Online".to_string());
            event.event_type = Some("Internship".to_string());
            event.image_url = card.url(&self.image, "src");
            event.is_virtual = true;
            event.description = Some(format!("{title} at {organizer}"));
            event.registration_deadline = Some(days_left);
            event.registration_url = card.enclosing_link();
            event.skills = card.texts(&self.skills);
            event.eligibility = Some(OPEN_TO_ALL.to_string());
            event.prizes = Some(NOT_AVAILABLE.to_string());
            out.push(event);
        }
        out
    }
}

pub struct DevfolioExtractor {
    cards: Selector,
    title: Selector,
    kind: Selector,
    link: Selector,
    location: Selector,
    image: Selector,
}

impl DevfolioExtractor {
    pub const SOURCE: &'static str = "Devfolio";
    // The styled-components hash changes between deploys; match on the stable prefix.
    const CARDS: &'static str = r#"[class*="CompactHackathonCard__StyledCard"]"#;

    pub fn new() -> Result<Self, AdapterError> {
        Ok(Self {
            cards: compile(Self::CARDS)?,
            title: compile("h3")?,
            kind: compile("p")?,
            link: compile("a")?,
            location: compile(".ifkmYk")?,
            image: compile("img")?,
        })
    }
}

impl Extractor for DevfolioExtractor {
    fn source_name(&self) -> &'static str {
        Self::SOURCE
    }

    fn wait_selector(&self) -> Option<&'static str> {
        Some(Self::CARDS)
    }

    fn extract(&self, page: &RenderedPage, _now: DateTime<Utc>) -> Vec<EventCandidate> {
        let document = Html::parse_document(&page.html);
        let base = page_base(page);
        let mut out = Vec::new();
        for el in document.select(&self.cards) {
            let card = Card::new(el, base.as_ref());
            let (Some(title), Some(link)) = (card.text(&self.title), card.url(&self.link, "href")) else {
                continue;
            };
            let kind = card.text(&self.kind).unwrap_or_else(|| "Event".to_string());
            let location = card.text(&self.location).unwrap_or_else(|| "Unknown".to_string());

            let mut event = EventCandidate::new(&title, "Devfolio", TBD, &page.source_name);
            event.is_virtual = is_virtual_location(&location);
            event.location = Some(location);
            event.description = Some(format!("{title} - {kind}"));
            event.event_type = Some(kind);
            event.image_url = card.url(&self.image, "src");
            event.registration_deadline = Some(TBD.to_string());
            event.registration_url = Some(link);
            event.skills = default_skills();
            event.eligibility = Some(OPEN_TO_ALL.to_string());
            event.prizes = Some(NOT_AVAILABLE.to_string());
            out.push(event);
        }
        out
    }
}

pub struct MlhExtractor {
    cards: Selector,
    title: Selector,
    date: Selector,
    location: Selector,
    link: Selector,
    image: Selector,
}

impl MlhExtractor {
    pub const SOURCE: &'static str = "MLH";

    pub fn new() -> Result<Self, AdapterError> {
        Ok(Self {
            cards: compile(".event-wrapper")?,
            title: compile(".event-name")?,
            date: compile(".event-date")?,
            location: compile(".event-location")?,
            link: compile("a.event-link")?,
            image: compile(".image-wrap img")?,
        })
    }
}

impl Extractor for MlhExtractor {
    fn source_name(&self) -> &'static str {
        Self::SOURCE
    }

    // The season page is server-rendered.
    fn wait_selector(&self) -> Option<&'static str> {
        None
    }

    fn extract(&self, page: &RenderedPage, _now: DateTime<Utc>) -> Vec<EventCandidate> {
        let document = Html::parse_document(&page.html);
        let base = page_base(page);
        let mut out = Vec::new();
        for el in document.select(&self.cards) {
            let card = Card::new(el, base.as_ref());
            let (Some(title), Some(link)) = (card.text(&self.title), card.url(&self.link, "href")) else {
                continue;
            };
            let date = card.text(&self.date).unwrap_or_else(|| "Upcoming".to_string());
            let location = card.text(&self.location).unwrap_or_else(|| "Online".to_string());

            let mut event = EventCandidate::new(&title, "Major League Hacking", &date, &page.source_name);
            event.is_virtual = is_virtual_location(&location);
            event.location = Some(location);
            event.event_type = Some("Hackathon".to_string());
            event.image_url = card.url(&self.image, "src");
            event.description = Some(format!("{title} - {date}"));
            event.registration_url = Some(link);
            event.skills = default_skills();
            out.push(event);
        }
        out
    }
}

pub struct HackerEarthExtractor {
    sections: [(Selector, EventStatus); 2],
    cards: Selector,
    title: Selector,
    kind: Selector,
    link: Selector,
    image: Selector,
    countdown: Selector,
    organizer: Selector,
    background_url: Regex,
}

impl HackerEarthExtractor {
    pub const SOURCE: &'static str = "HackerEarth";
    const CARDS: &'static str = ".challenge-card-modern";
    const BACKGROUND_URL: &'static str = r#"url\(['"]?(.*?)['"]?\)"#;

    pub fn new() -> Result<Self, AdapterError> {
        let background_url = Regex::new(Self::BACKGROUND_URL).map_err(|e| AdapterError::Pattern {
            pattern: Self::BACKGROUND_URL.to_string(),
            reason: e.to_string(),
        })?;
        Ok(Self {
            sections: [
                (compile(".ongoing.challenge-list")?, EventStatus::Ongoing),
                (compile(".upcoming.challenge-list")?, EventStatus::Upcoming),
            ],
            cards: compile(Self::CARDS)?,
            title: compile(".challenge-name span")?,
            kind: compile(".challenge-type")?,
            link: compile("a.challenge-card-link")?,
            image: compile(".event-image")?,
            countdown: compile(".date")?,
            organizer: compile(".company-details")?,
            background_url,
        })
    }

    fn background_image(&self, card: &Card<'_>) -> Option<String> {
        let style = card.attr(&self.image, "style")?;
        let raw = self.background_url.captures(&style)?.get(1)?.as_str().to_string();
        resolve_url(card.base, &raw)
    }

    fn card_candidate(
        &self,
        card: &Card<'_>,
        status: EventStatus,
        source: &str,
        now: DateTime<Utc>,
    ) -> Option<EventCandidate> {
        let title = card.text(&self.title)?;
        let link = card.url(&self.link, "href");
        let organizer = card.text(&self.organizer);
        if link.is_none() && organizer.is_none() {
            return None;
        }
        let kind = card.text(&self.kind).unwrap_or_else(|| "Hackathon".to_string());
        let deadline = card
            .text(&self.countdown)
            .and_then(|text| deadline_from_countdown(&text, now))
            .map(format_timestamp)
            .unwrap_or_else(|| TBD.to_string());

        let mut event = EventCandidate::new(
            &title,
            organizer.unwrap_or_else(|| "HackerEarth".to_string()),
            &deadline,
            source,
        );
        event.location = Some("Online".to_string());
        event.description = Some(format!("{title} - {kind}"));
        event.event_type = Some(kind);
        event.image_url = self.background_image(card);
        event.is_virtual = true;
        event.registration_deadline = Some(deadline);
        event.registration_url = link;
        event.skills = default_skills();
        event.eligibility = Some(OPEN_TO_ALL.to_string());
        event.prizes = Some(NOT_AVAILABLE.to_string());
        event.status = Some(status);
        Some(event)
    }
}

impl Extractor for HackerEarthExtractor {
    fn source_name(&self) -> &'static str {
        Self::SOURCE
    }

    fn wait_selector(&self) -> Option<&'static str> {
        Some(Self::CARDS)
    }

    fn extract(&self, page: &RenderedPage, now: DateTime<Utc>) -> Vec<EventCandidate> {
        let document = Html::parse_document(&page.html);
        let base = page_base(page);
        let mut out = Vec::new();
        for (section_selector, status) in &self.sections {
            let Some(section) = document.select(section_selector).next() else {
                debug!(status = %status, "challenge section not present");
                continue;
            };
            for el in section.select(&self.cards) {
                let card = Card::new(el, base.as_ref());
                if let Some(event) = self.card_candidate(&card, *status, &page.source_name, now) {
                    out.push(event);
                }
            }
        }
        out
    }
}

/// Extractors keyed by exact source name.
#[derive(Default)]
pub struct ExtractorRegistry {
    extractors: BTreeMap<String, Box<dyn Extractor>>,
}

impl ExtractorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Unstop, Devfolio, MLH and HackerEarth.
    pub fn with_defaults() -> Result<Self, AdapterError> {
        let mut registry = Self::new();
        registry.register(Box::new(UnstopExtractor::new()?));
        registry.register(Box::new(DevfolioExtractor::new()?));
        registry.register(Box::new(MlhExtractor::new()?));
        registry.register(Box::new(HackerEarthExtractor::new()?));
        Ok(registry)
    }

    /// Replaces any extractor already registered under the same name.
    pub fn register(&mut self, extractor: Box<dyn Extractor>) {
        self.extractors
            .insert(extractor.source_name().to_string(), extractor);
    }

    pub fn get(&self, source_name: &str) -> Option<&dyn Extractor> {
        self.extractors.get(source_name).map(|e| e.as_ref())
    }

    pub fn names(&self) -> Vec<&str> {
        self.extractors.keys().map(String::as_str).collect()
    }

    /// Fails listing every name in `source_names` that has no extractor.
    pub fn ensure_covers<'a>(
        &self,
        source_names: impl IntoIterator<Item = &'a str>,
    ) -> Result<(), AdapterError> {
        let mut missing: Vec<String> = source_names
            .into_iter()
            .filter(|name| !self.extractors.contains_key(*name))
            .map(str::to_string)
            .collect();
        if missing.is_empty() {
            return Ok(());
        }
        missing.sort();
        missing.dedup();
        Err(AdapterError::MissingExtractors(missing))
    }

    /// Dispatches on `page.source_name`; `None` when no extractor is registered.
    pub fn extract(&self, page: &RenderedPage, now: DateTime<Utc>) -> Option<Vec<EventCandidate>> {
        self.get(&page.source_name)
            .map(|extractor| extractor.extract(page, now))
    }
}

pub fn fixture_listing_path(fixtures_root: impl AsRef<Path>, source_name: &str) -> PathBuf {
    fixtures_root
        .as_ref()
        .join(source_slug(source_name))
        .join("sample")
        .join("listing.html")
}

/// Reads a recorded listing page as if it had just been rendered from `url`.
pub fn load_fixture_page(
    fixtures_root: impl AsRef<Path>,
    source_name: &str,
    url: &str,
) -> Result<RenderedPage> {
    let path = fixture_listing_path(fixtures_root, source_name);
    let html = fs::read_to_string(&path).with_context(|| format!("reading {}", path.display()))?;
    Ok(RenderedPage::new(source_name, url, html))
}

pub fn load_fixture_snapshot(
    fixtures_root: impl AsRef<Path>,
    source_name: &str,
) -> Result<Vec<EventCandidate>> {
    let path = fixtures_root
        .as_ref()
        .join(source_slug(source_name))
        .join("sample")
        .join("snapshot.json");
    let text = fs::read_to_string(&path).with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_str(&text).with_context(|| format!("parsing {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    const UNSTOP_URL: &str = "https://unstop.com/hackathons";
    const DEVFOLIO_URL: &str = "https://devfolio.co/hackathons";
    const MLH_URL: &str = "https://mlh.io/seasons/2025/events";
    const HACKEREARTH_URL: &str = "https://www.hackerearth.com/challenges/hackathon/";

    fn fixtures_root() -> PathBuf {
        Path::new(env!("CARGO_MANIFEST_DIR"))
            .join("../..")
            .join("fixtures")
            .canonicalize()
            .expect("fixtures root")
    }

    fn fixed_now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, 0, 0, 0).unwrap()
    }

    fn assert_matches_golden(source_name: &str, url: &str) {
        let registry = ExtractorRegistry::with_defaults().unwrap();
        let page = load_fixture_page(fixtures_root(), source_name, url).unwrap();
        let actual = registry.extract(&page, fixed_now()).expect("extractor registered");
        let expected = load_fixture_snapshot(fixtures_root(), source_name).unwrap();
        assert_eq!(actual, expected);
    }

    #[tokio::test]
    async fn golden_json_snapshot_test_unstop() {
        assert_matches_golden("Unstop", UNSTOP_URL);
    }

    #[tokio::test]
    async fn golden_json_snapshot_test_devfolio() {
        assert_matches_golden("Devfolio", DEVFOLIO_URL);
    }

    #[tokio::test]
    async fn golden_json_snapshot_test_mlh() {
        assert_matches_golden("MLH", MLH_URL);
    }

    #[tokio::test]
    async fn golden_json_snapshot_test_hackerearth() {
        assert_matches_golden("HackerEarth", HACKEREARTH_URL);
    }

    #[test]
    fn mlh_card_without_title_is_skipped() {
        let html = r#"
            <div class="event-wrapper">
              <a class="event-link" href="https://aihack.example.com/">
                <h3 class="event-name">AI Hack</h3>
                <p class="event-date">May 2nd - 4th</p>
                <div class="event-location">Online</div>
                <div class="image-wrap"><img src="/splash.png"></div>
              </a>
            </div>
            <div class="event-wrapper">
              <a class="event-link" href="https://other.example.com/"></a>
            </div>
        "#;
        let page = RenderedPage::new("MLH", MLH_URL, html);
        let events = MlhExtractor::new().unwrap().extract(&page, fixed_now());
        assert_eq!(events.len(), 1);
        let event = &events[0];
        assert_eq!(event.title, "AI Hack");
        assert_eq!(event.source, "MLH");
        assert_eq!(event.organizer, "Major League Hacking");
        assert!(event.is_virtual);
        assert_eq!(event.image_url.as_deref(), Some("https://mlh.io/splash.png"));
    }

    #[test]
    fn candidates_carry_the_crawled_source_name() {
        let html = r#"<div class="event-wrapper"><a class="event-link" href="/x"><span class="event-name">X</span></a></div>"#;
        let page = RenderedPage::new("MLH", MLH_URL, html);
        let events = MlhExtractor::new().unwrap().extract(&page, fixed_now());
        assert!(events.iter().all(|e| e.source == page.source_name));
    }

    #[test]
    fn devfolio_defaults_apply_when_optional_fields_missing() {
        let html = r#"
            <div class="CompactHackathonCard__StyledCard-sc-0000-0">
              <a href="https://solo.devfolio.co/"><h3>Solo Hack</h3></a>
            </div>
        "#;
        let page = RenderedPage::new("Devfolio", DEVFOLIO_URL, html);
        let events = DevfolioExtractor::new().unwrap().extract(&page, fixed_now());
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_type.as_deref(), Some("Event"));
        assert_eq!(events[0].location.as_deref(), Some("Unknown"));
        assert!(!events[0].is_virtual);
        assert_eq!(events[0].date, "TBD");
    }

    #[test]
    fn hackerearth_card_needs_link_or_organizer() {
        let html = r#"
            <div class="ongoing challenge-list">
              <div class="challenge-card-modern">
                <div class="challenge-name"><span>Orphan</span></div>
              </div>
              <div class="challenge-card-modern">
                <div class="challenge-name"><span>Sponsored</span></div>
                <div class="company-details">Acme</div>
              </div>
            </div>
        "#;
        let page = RenderedPage::new("HackerEarth", HACKEREARTH_URL, html);
        let events = HackerEarthExtractor::new().unwrap().extract(&page, fixed_now());
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].title, "Sponsored");
        assert_eq!(events[0].organizer, "Acme");
        assert_eq!(events[0].registration_url, None);
        assert_eq!(events[0].status, Some(EventStatus::Ongoing));
    }

    #[test]
    fn countdown_offsets_from_now() {
        let now = Utc::now();
        let deadline = deadline_from_countdown("3 days 4 hours", now).unwrap();
        let expected = now + TimeDelta::try_days(3).unwrap() + TimeDelta::try_hours(4).unwrap();
        assert!((deadline - expected).num_seconds().abs() <= 1);
    }

    #[test]
    fn countdown_without_digits_or_all_zero_is_none() {
        assert_eq!(deadline_from_countdown("Starts soon", fixed_now()), None);
        assert_eq!(deadline_from_countdown("0 days : 0 hours", fixed_now()), None);
        assert_eq!(deadline_from_countdown("99999999999999999999 days", fixed_now()), None);
    }

    #[test]
    fn timestamps_format_with_millis_and_z() {
        let at = Utc.with_ymd_and_hms(2026, 3, 3, 5, 30, 10).unwrap();
        assert_eq!(format_timestamp(at), "2026-03-03T05:30:10.000Z");
    }

    #[test]
    fn relative_links_resolve_against_page_url() {
        let base = Url::parse(UNSTOP_URL).unwrap();
        assert_eq!(
            resolve_url(Some(&base), "/hackathons/abc").as_deref(),
            Some("https://unstop.com/hackathons/abc")
        );
        assert_eq!(resolve_url(Some(&base), "  ").as_deref(), None);
        assert_eq!(resolve_url(None, "relative/path").as_deref(), Some("relative/path"));
    }

    #[test]
    fn registry_reports_missing_extractors() {
        let registry = ExtractorRegistry::with_defaults().unwrap();
        assert_eq!(registry.names(), vec!["Devfolio", "HackerEarth", "MLH", "Unstop"]);
        assert!(registry.ensure_covers(["Unstop", "MLH"]).is_ok());
        match registry.ensure_covers(["Unstop", "Hackerearth", "Kaggle"]) {
            Err(AdapterError::MissingExtractors(missing)) => {
                assert_eq!(missing, vec!["Hackerearth".to_string(), "Kaggle".to_string()]);
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn wait_selectors_match_their_fixtures() {
        let registry = ExtractorRegistry::with_defaults().unwrap();
        for name in registry.names() {
            let extractor = registry.get(name).unwrap();
            let Some(selector) = extractor.wait_selector() else {
                continue;
            };
            let page = load_fixture_page(fixtures_root(), name, "https://example.com/").unwrap();
            assert_eq!(
                eventhive_storage::html_has_selector(&page.html, selector),
                Ok(true),
                "{name} wait selector"
            );
        }
    }
}
