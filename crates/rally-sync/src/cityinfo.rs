//! City metadata: canonical encyclopedia article and thumbnail for a
//! (city, state) pair.
//!
//! Encyclopedia search is noisy. Candidates are ranked by how well their
//! title matches the city and state, then accepted only if the article's
//! categories say it is a populated place.

use std::cmp::Ordering;
use std::collections::HashSet;
use std::sync::{Arc, OnceLock};

use async_trait::async_trait;
use rally_core::{expand_state, CityInfo, CityKey};
use rally_storage::{
    url_with_params, CacheEntry, CacheError, FetchError, HttpFetcher, ResolverCache, RetryOn, Url,
};
use regex::Regex;
use serde::Deserialize;
use strsim::jaro_winkler;
use thiserror::Error;
use tracing::{debug, warn};

pub const ENCYCLOPEDIA_SERVICE: &str = "encyclopedia";

const DEFAULT_ARTICLE_BASE: &str = "https://en.wikipedia.org/wiki/";

#[async_trait]
pub trait Encyclopedia: Send + Sync {
    /// Article titles for a free-text query, in the service's own rank order.
    async fn search_titles(&self, query: &str) -> Result<Vec<String>, FetchError>;
    async fn categories(&self, title: &str) -> Result<Vec<String>, FetchError>;
    async fn thumbnail(&self, title: &str) -> Result<Option<String>, FetchError>;
    fn article_url(&self, title: &str) -> String;
}

fn place_category_pattern() -> &'static Regex {
    static PLACE: OnceLock<Regex> = OnceLock::new();
    PLACE.get_or_init(|| {
        Regex::new(
            concat!(
                r"(?i)^(category:)?\s*(",
                r"(census[- ]designated places|cities|towns|villages|townships|counties|",
                r"boroughs|unincorporated communities|islands|county seats)\s+(in|of)\b",
                r"|.*\bcounties$)",
            ),
        )
        .expect("static place regex")
    })
}

/// True when any category marks the article as a populated place.
pub fn is_populated_place(categories: &[String]) -> bool {
    categories
        .iter()
        .any(|c| place_category_pattern().is_match(c.trim()))
}

/// Search phrasings for a city, most literal first.
pub fn candidate_queries(city: &str, state: &str) -> Vec<String> {
    let city = city.trim();
    let state = state.trim();
    let base = if state.is_empty() {
        city.to_string()
    } else {
        format!("{city}, {state}")
    };
    let lower = city.to_lowercase();
    if lower.contains("island") || lower.contains("township") {
        return vec![base];
    }
    let suffix = if state.is_empty() {
        String::new()
    } else {
        format!(", {state}")
    };
    vec![
        base,
        format!("{city} Township{suffix}"),
        format!("{city} County{suffix}"),
    ]
}

/// Lower is better: exact title 0, prefix 1, substring 2, unrelated 3; one
/// point off when the title names the state, one point on when it does not.
pub fn candidate_priority(title: &str, city: &str, state: &str) -> i32 {
    let title = title.to_lowercase();
    let city = city.trim().to_lowercase();
    let state = state.trim().to_lowercase();

    let mut priority = if title == city {
        0
    } else if title.starts_with(&city) {
        1
    } else if title.contains(&city) {
        2
    } else {
        3
    };
    if !state.is_empty() {
        if title.contains(&state) {
            priority -= 1;
        } else {
            priority += 1;
        }
    }
    priority
}

/// Sort by priority; ties go to the title closest to "city, state", then to
/// the search engine's order.
pub fn rank_candidates(titles: Vec<String>, city: &str, state: &str) -> Vec<String> {
    let target = format!("{}, {}", city.trim(), state.trim()).to_lowercase();
    let mut scored = titles
        .into_iter()
        .map(|title| {
            let priority = candidate_priority(&title, city, state);
            let similarity = jaro_winkler(&title.to_lowercase(), &target);
            (priority, similarity, title)
        })
        .collect::<Vec<_>>();
    scored.sort_by(|a, b| {
        a.0.cmp(&b.0)
            .then_with(|| b.1.partial_cmp(&a.1).unwrap_or(Ordering::Equal))
    });
    scored.into_iter().map(|(_, _, title)| title).collect()
}

#[derive(Debug, Error)]
pub enum CityInfoError {
    #[error("encyclopedia transport failure for {key}: {message}")]
    Transport { key: String, message: String },
    #[error(transparent)]
    Cache(#[from] CacheError),
}

pub struct CityInfoResolver {
    encyclopedia: Arc<dyn Encyclopedia>,
    cache: ResolverCache<CityInfo>,
    network_calls: u64,
    cache_hits: u64,
}

impl CityInfoResolver {
    pub fn new(encyclopedia: Arc<dyn Encyclopedia>, cache: ResolverCache<CityInfo>) -> Self {
        Self {
            encyclopedia,
            cache,
            network_calls: 0,
            cache_hits: 0,
        }
    }

    pub fn network_calls(&self) -> u64 {
        self.network_calls
    }

    pub fn cache_hits(&self) -> u64 {
        self.cache_hits
    }

    pub fn cache(&self) -> &ResolverCache<CityInfo> {
        &self.cache
    }

    pub fn cache_mut(&mut self) -> &mut ResolverCache<CityInfo> {
        &mut self.cache
    }

    /// `Ok(None)` means no validated place exists; that outcome is cached.
    pub async fn resolve(
        &mut self,
        city: &str,
        state: &str,
    ) -> Result<Option<CityInfo>, CityInfoError> {
        if city.trim().is_empty() {
            return Ok(None);
        }
        let key = CityKey::new(city, state);
        match self.cache.get(key.as_str()) {
            Some(CacheEntry::Good(info)) => {
                self.cache_hits += 1;
                return Ok(Some(info.clone()));
            }
            Some(CacheEntry::Bad) => {
                self.cache_hits += 1;
                return Ok(None);
            }
            None => {}
        }

        let state_name = expand_state(state);
        let mut tried = HashSet::new();
        let mut errors: Vec<FetchError> = Vec::new();

        for query in candidate_queries(city, &state_name) {
            self.network_calls += 1;
            let titles = match self.encyclopedia.search_titles(&query).await {
                Ok(titles) => titles,
                Err(err) => {
                    warn!(query = %query, error = %err, "encyclopedia search failed");
                    errors.push(err);
                    continue;
                }
            };

            for title in rank_candidates(titles, city, &state_name) {
                if !tried.insert(title.clone()) {
                    continue;
                }
                self.network_calls += 1;
                let categories = match self.encyclopedia.categories(&title).await {
                    Ok(categories) => categories,
                    Err(err) => {
                        warn!(title = %title, error = %err, "category lookup failed");
                        errors.push(err);
                        continue;
                    }
                };
                if !is_populated_place(&categories) {
                    debug!(title = %title, "rejected candidate without place category");
                    continue;
                }

                self.network_calls += 1;
                let thumbnail_url = match self.encyclopedia.thumbnail(&title).await {
                    Ok(thumbnail) => thumbnail.unwrap_or_default(),
                    Err(err) => {
                        warn!(title = %title, error = %err, "thumbnail lookup failed");
                        String::new()
                    }
                };
                let info = CityInfo {
                    article_url: self.encyclopedia.article_url(&title),
                    thumbnail_url,
                };
                debug!(key = %key, title = %title, "city resolved");
                self.cache.put_good(key.as_str(), info.clone()).await?;
                return Ok(Some(info));
            }
        }

        if errors.is_empty() {
            self.cache.put_bad(key.as_str()).await?;
            Ok(None)
        } else {
            Err(CityInfoError::Transport {
                key: key.to_string(),
                message: errors
                    .iter()
                    .map(ToString::to_string)
                    .collect::<Vec<_>>()
                    .join("; "),
            })
        }
    }
}

#[derive(Debug, Deserialize)]
struct SearchResponse {
    #[serde(default)]
    query: Option<SearchQuery>,
}

#[derive(Debug, Deserialize)]
struct SearchQuery {
    #[serde(default)]
    search: Vec<SearchHit>,
}

#[derive(Debug, Deserialize)]
struct SearchHit {
    title: String,
}

#[derive(Debug, Deserialize)]
struct PagesResponse {
    #[serde(default)]
    query: Option<PagesQuery>,
}

#[derive(Debug, Deserialize)]
struct PagesQuery {
    #[serde(default)]
    pages: Vec<Page>,
}

#[derive(Debug, Deserialize)]
struct Page {
    #[serde(default)]
    categories: Vec<CategoryRef>,
    #[serde(default)]
    thumbnail: Option<Thumbnail>,
}

impl SearchResponse {
    fn titles(self) -> Vec<String> {
        self.query
            .map(|q| q.search.into_iter().map(|hit| hit.title).collect())
            .unwrap_or_default()
    }
}

impl PagesResponse {
    fn first_page(self) -> Option<Page> {
        self.query.and_then(|q| q.pages.into_iter().next())
    }
}

impl Page {
    fn category_titles(self) -> Vec<String> {
        self.categories.into_iter().map(|c| c.title).collect()
    }

    fn thumbnail_source(self) -> Option<String> {
        self.thumbnail.map(|t| t.source)
    }
}

#[derive(Debug, Deserialize)]
struct CategoryRef {
    title: String,
}

#[derive(Debug, Deserialize)]
struct Thumbnail {
    source: String,
}

/// MediaWiki action API client (`formatversion=2` responses).
pub struct WikipediaClient {
    http: Arc<HttpFetcher>,
    api_url: String,
    article_base: String,
}

impl WikipediaClient {
    pub fn new(http: Arc<HttpFetcher>, api_url: impl Into<String>) -> Self {
        let api_url = api_url.into();
        let article_base = Url::parse(&api_url)
            .and_then(|u| u.join("/wiki/"))
            .map(|u| u.to_string())
            .unwrap_or_else(|_| DEFAULT_ARTICLE_BASE.to_string());
        Self {
            http,
            api_url,
            article_base,
        }
    }

    async fn query<T: serde::de::DeserializeOwned>(
        &self,
        params: &[(&str, &str)],
    ) -> Result<T, FetchError> {
        let mut all = vec![("action", "query"), ("format", "json"), ("formatversion", "2")];
        all.extend_from_slice(params);
        let url = url_with_params(&self.api_url, &all)?;
        self.http
            .fetch_json(ENCYCLOPEDIA_SERVICE, &url, RetryOn { forbidden: true })
            .await
    }

    async fn first_page(&self, params: &[(&str, &str)]) -> Result<Option<Page>, FetchError> {
        let response: PagesResponse = self.query(params).await?;
        Ok(response.first_page())
    }
}

#[async_trait]
impl Encyclopedia for WikipediaClient {
    async fn search_titles(&self, query: &str) -> Result<Vec<String>, FetchError> {
        let response: SearchResponse = self
            .query(&[("list", "search"), ("srsearch", query), ("srlimit", "10")])
            .await?;
        Ok(response.titles())
    }

    async fn categories(&self, title: &str) -> Result<Vec<String>, FetchError> {
        let page = self
            .first_page(&[
                ("prop", "categories"),
                ("titles", title),
                ("cllimit", "max"),
                ("clshow", "!hidden"),
                ("redirects", "1"),
            ])
            .await?;
        Ok(page.map(Page::category_titles).unwrap_or_default())
    }

    async fn thumbnail(&self, title: &str) -> Result<Option<String>, FetchError> {
        let page = self
            .first_page(&[
                ("prop", "pageimages"),
                ("piprop", "thumbnail"),
                ("pithumbsize", "640"),
                ("titles", title),
                ("redirects", "1"),
            ])
            .await?;
        Ok(page.and_then(Page::thumbnail_source))
    }

    fn article_url(&self, title: &str) -> String {
        format!("{}{}", self.article_base, title.trim().replace(' ', "_"))
    }
}


#[cfg(test)]
mod tests {
    use super::fakes::FakeEncyclopedia;
    use super::*;

    fn strings(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn queries_skip_variants_for_islands_and_townships() {
        assert_eq!(
            candidate_queries("Springfield", "Illinois"),
            strings(&[
                "Springfield, Illinois",
                "Springfield Township, Illinois",
                "Springfield County, Illinois"
            ])
        );
        assert_eq!(
            candidate_queries("Mackinac Island", "Michigan"),
            strings(&["Mackinac Island, Michigan"])
        );
        assert_eq!(
            candidate_queries("Cheltenham Township", "Pennsylvania").len(),
            1
        );
    }

    #[test]
    fn state_qualified_titles_outrank_bare_matches() {
        assert_eq!(candidate_priority("Springfield, Illinois", "Springfield", "Illinois"), 0);
        assert_eq!(candidate_priority("Springfield", "Springfield", "Illinois"), 1);
        assert_eq!(
            candidate_priority("West Springfield, Massachusetts", "Springfield", "Illinois"),
            3
        );
        assert_eq!(candidate_priority("Chicago", "Springfield", "Illinois"), 4);

        let ranked = rank_candidates(
            strings(&[
                "Springfield (disambiguation)",
                "Springfield",
                "Springfield, Illinois",
                "Illinois",
            ]),
            "Springfield",
            "Illinois",
        );
        assert_eq!(ranked[0], "Springfield, Illinois");
        assert_eq!(ranked[1], "Springfield");
    }

    #[test]
    fn place_categories_are_recognized() {
        assert!(is_populated_place(&strings(&["Category:Cities in Illinois"])));
        assert!(is_populated_place(&strings(&["Category:County seats in Illinois"])));
        assert!(is_populated_place(&strings(&[
            "Category:Census-designated places in Marin County, California"
        ])));
        assert!(is_populated_place(&strings(&["Category:Illinois counties"])));
        assert!(!is_populated_place(&strings(&[
            "Category:People from Springfield, Illinois",
            "Category:Disambiguation pages",
        ])));
        assert!(!is_populated_place(&[]));
    }

    #[tokio::test]
    async fn first_validated_candidate_wins() {
        let fake = Arc::new(
            FakeEncyclopedia::default()
                .search(
                    "Springfield, Illinois",
                    &["Springfield", "Springfield, Illinois", "Springfield (disambiguation)"],
                )
                .page(
                    "Springfield, Illinois",
                    &["Category:Cities in Illinois"],
                    Some("https://upload.example.org/springfield.jpg"),
                )
                .page("Springfield", &["Category:Disambiguation pages"], None),
        );
        let mut resolver = CityInfoResolver::new(fake.clone(), ResolverCache::in_memory("city"));

        let info = resolver
            .resolve("Springfield", "IL")
            .await
            .expect("resolve")
            .expect("validated place");
        assert_eq!(info.article_url, "https://en.wikipedia.org/wiki/Springfield,_Illinois");
        assert_eq!(info.thumbnail_url, "https://upload.example.org/springfield.jpg");
        assert_eq!(fake.calls(), 3);

        let again = resolver.resolve("springfield", "Illinois").await.expect("cached");
        assert_eq!(again, Some(info));
        assert_eq!(fake.calls(), 3);
        assert_eq!(resolver.cache_hits(), 1);
    }

    #[tokio::test]
    async fn non_place_candidates_are_skipped() {
        let fake = Arc::new(
            FakeEncyclopedia::default()
                .search(
                    "Springfield, Illinois",
                    &["Springfield, Illinois", "Springfield Township, Illinois"],
                )
                .page("Springfield, Illinois", &["Category:Disambiguation pages"], None)
                .page(
                    "Springfield Township, Illinois",
                    &["Category:Townships in Sangamon County, Illinois"],
                    None,
                ),
        );
        let mut resolver = CityInfoResolver::new(fake, ResolverCache::in_memory("city"));
        let info = resolver
            .resolve("Springfield", "IL")
            .await
            .expect("resolve")
            .expect("township accepted");
        assert!(info.article_url.ends_with("Springfield_Township,_Illinois"));
        assert_eq!(info.thumbnail_url, "");
    }

    #[tokio::test]
    async fn no_validated_place_is_cached_as_bad() {
        let fake = Arc::new(
            FakeEncyclopedia::default()
                .search("Nowhere, Illinois", &["Nowhere (album)"])
                .page("Nowhere (album)", &["Category:1990 albums"], None),
        );
        let mut resolver = CityInfoResolver::new(fake.clone(), ResolverCache::in_memory("city"));

        assert_eq!(resolver.resolve("Nowhere", "IL").await.expect("resolve"), None);
        let calls = fake.calls();
        // three searches plus one category lookup
        assert_eq!(calls, 4);

        assert_eq!(resolver.resolve("Nowhere", "IL").await.expect("resolve"), None);
        assert_eq!(fake.calls(), calls);
        assert_eq!(resolver.cache().bad_count(), 1);
    }

    #[tokio::test]
    async fn transport_failures_surface_and_are_not_cached() {
        let fake = Arc::new(FakeEncyclopedia::failing());
        let mut resolver = CityInfoResolver::new(fake, ResolverCache::in_memory("city"));
        let err = resolver.resolve("Springfield", "IL").await.expect_err("transport");
        assert!(matches!(err, CityInfoError::Transport { .. }));
        assert!(resolver.cache().is_empty());
    }

    #[test]
    fn article_base_follows_api_host() {
        let http = Arc::new(HttpFetcher::new(Default::default()).expect("client"));
        let client = WikipediaClient::new(http, "https://en.wikipedia.org/w/api.php");
        assert_eq!(
            client.article_url("Springfield, Illinois"),
            "https://en.wikipedia.org/wiki/Springfield,_Illinois"
        );
    }

    #[test]
    fn mediawiki_search_results_decode_in_rank_order() {
        let body = r#"{"batchcomplete": true, "continue": {"sroffset": 10},
            "query": {"searchinfo": {"totalhits": 812}, "search": [
                {"ns": 0, "title": "Springfield, Illinois", "pageid": 29239, "size": 98211},
                {"ns": 0, "title": "Springfield (disambiguation)", "pageid": 29240}
            ]}}"#;
        let response: SearchResponse = serde_json::from_str(body).expect("decode");
        assert_eq!(
            response.titles(),
            strings(&["Springfield, Illinois", "Springfield (disambiguation)"])
        );

        let empty: SearchResponse =
            serde_json::from_str(r#"{"batchcomplete": true}"#).expect("decode");
        assert!(empty.titles().is_empty());
    }

    #[test]
    fn mediawiki_pages_decode_categories_and_thumbnail() {
        let body = r#"{"batchcomplete": true, "query": {
            "normalized": [{"fromencoded": false,
                "from": "springfield, illinois", "to": "Springfield, Illinois"}],
            "pages": [{"pageid": 29239, "ns": 0, "title": "Springfield, Illinois",
                "categories": [
                    {"ns": 14, "title": "Category:Cities in Illinois"},
                    {"ns": 14, "title": "Category:County seats in Illinois"}
                ],
                "thumbnail": {"source": "https://upload.wikimedia.org/springfield.jpg",
                              "width": 640, "height": 427}
            }]}}"#;
        let page = serde_json::from_str::<PagesResponse>(body)
            .expect("decode")
            .first_page()
            .expect("page");
        assert_eq!(
            page.category_titles(),
            strings(&["Category:Cities in Illinois", "Category:County seats in Illinois"])
        );

        let page = serde_json::from_str::<PagesResponse>(body)
            .expect("decode")
            .first_page()
            .expect("page");
        assert_eq!(
            page.thumbnail_source().as_deref(),
            Some("https://upload.wikimedia.org/springfield.jpg")
        );
    }

    #[test]
    fn missing_pages_decode_without_categories() {
        let body = r#"{"query": {"pages": [
            {"ns": 0, "title": "Nowhere, Illinois", "missing": true}
        ]}}"#;
        let page = serde_json::from_str::<PagesResponse>(body)
            .expect("decode")
            .first_page()
            .expect("page");
        assert!(page.category_titles().is_empty());
    }
}
