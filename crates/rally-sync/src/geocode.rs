//! Address resolution through a cascade of geocoding queries.

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use rally_core::{Address, GeocodeResult};
use rally_storage::{
    url_with_params, CacheEntry, CacheError, FetchError, HttpFetcher, ResolverCache, RetryOn,
};
use serde::Deserialize;
use thiserror::Error;
use tracing::debug;

pub const GEOCODER_SERVICE: &str = "geocoder";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GeocodeQuery {
    Structured {
        street: Option<String>,
        city: String,
        state: String,
        postalcode: Option<String>,
        country: String,
    },
    FreeText(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryStyle {
    Structured,
    FreeText,
}

/// One tier of the cascade: how to phrase the query and which optional
/// address parts to include.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GeocodeStrategy {
    pub style: QueryStyle,
    pub with_street: bool,
    pub with_postal: bool,
}

/// Most specific first. Postal codes only ride along once the street is
/// dropped.
pub const CANONICAL_CASCADE: [GeocodeStrategy; 4] = [
    GeocodeStrategy {
        style: QueryStyle::Structured,
        with_street: true,
        with_postal: false,
    },
    GeocodeStrategy {
        style: QueryStyle::FreeText,
        with_street: true,
        with_postal: false,
    },
    GeocodeStrategy {
        style: QueryStyle::Structured,
        with_street: false,
        with_postal: true,
    },
    GeocodeStrategy {
        style: QueryStyle::FreeText,
        with_street: false,
        with_postal: false,
    },
];

fn non_empty(value: &str) -> Option<String> {
    let trimmed = value.trim();
    (!trimmed.is_empty()).then(|| trimmed.to_string())
}

impl GeocodeStrategy {
    /// `None` when the tier has nothing to ask for. Street tiers need a street.
    pub fn build(&self, address: &Address) -> Option<GeocodeQuery> {
        let street = if self.with_street {
            Some(non_empty(&address.address)?)
        } else {
            None
        };
        let postal = self.with_postal.then(|| non_empty(&address.zip)).flatten();
        match self.style {
            QueryStyle::Structured => {
                let query = GeocodeQuery::Structured {
                    street,
                    city: address.city.trim().to_string(),
                    state: address.state.trim().to_string(),
                    postalcode: postal,
                    country: address.country.trim().to_string(),
                };
                (!query.is_blank()).then_some(query)
            }
            QueryStyle::FreeText => {
                let text = [
                    street,
                    non_empty(&address.city),
                    non_empty(&address.state),
                    postal,
                    non_empty(&address.country),
                ]
                .into_iter()
                .flatten()
                .collect::<Vec<_>>()
                .join(", ");
                (!text.is_empty()).then_some(GeocodeQuery::FreeText(text))
            }
        }
    }
}

impl GeocodeQuery {
    fn is_blank(&self) -> bool {
        match self {
            GeocodeQuery::Structured {
                street,
                city,
                state,
                postalcode,
                country,
            } => {
                street.is_none()
                    && postalcode.is_none()
                    && city.is_empty()
                    && state.is_empty()
                    && country.is_empty()
            }
            GeocodeQuery::FreeText(text) => text.is_empty(),
        }
    }
}

/// Queries for an address in cascade order, skipping blank tiers and tiers
/// that would repeat an earlier query verbatim.
pub fn cascade_queries(strategies: &[GeocodeStrategy], address: &Address) -> Vec<GeocodeQuery> {
    let mut queries: Vec<GeocodeQuery> = Vec::new();
    for query in strategies.iter().filter_map(|s| s.build(address)) {
        if !queries.contains(&query) {
            queries.push(query);
        }
    }
    queries
}

#[derive(Debug, Clone, PartialEq)]
pub enum FirstHit<T, E> {
    Hit { tier: usize, value: T },
    Exhausted { errors: Vec<E> },
}

/// Evaluate tiers in order and stop at the first one yielding a value.
/// Failed tiers are collected and the cascade moves on.
pub async fn first_non_empty<I, T, E, F, Fut>(tiers: I, mut attempt: F) -> FirstHit<T, E>
where
    I: IntoIterator,
    F: FnMut(I::Item) -> Fut,
    Fut: Future<Output = Result<Option<T>, E>>,
{
    let mut errors = Vec::new();
    for (tier, item) in tiers.into_iter().enumerate() {
        match attempt(item).await {
            Ok(Some(value)) => return FirstHit::Hit { tier, value },
            Ok(None) => {}
            Err(err) => errors.push(err),
        }
    }
    FirstHit::Exhausted { errors }
}

#[derive(Debug, Clone, PartialEq)]
pub struct GeocodeCandidate {
    pub latitude: f64,
    pub longitude: f64,
    pub display_name: String,
}

#[async_trait]
pub trait Geocoder: Send + Sync {
    /// Ranked candidates, best first. Empty when nothing matched.
    async fn search(&self, query: &GeocodeQuery) -> Result<Vec<GeocodeCandidate>, FetchError>;
}

#[derive(Debug, Error)]
pub enum AddressError {
    #[error("address has no usable fields")]
    Empty,
    #[error("no geocoding candidates for {key}")]
    Unresolvable { key: String },
    #[error("address {key} failed to resolve on an earlier run")]
    KnownBad { key: String },
    #[error("geocoding transport failure for {key}: {message}")]
    Transport { key: String, message: String },
    #[error(transparent)]
    Cache(#[from] CacheError),
}

pub struct AddressResolver {
    geocoder: Arc<dyn Geocoder>,
    cache: ResolverCache<GeocodeResult>,
    cascade: Vec<GeocodeStrategy>,
    network_calls: u64,
    cache_hits: u64,
}

impl AddressResolver {
    pub fn new(geocoder: Arc<dyn Geocoder>, cache: ResolverCache<GeocodeResult>) -> Self {
        Self {
            geocoder,
            cache,
            cascade: CANONICAL_CASCADE.to_vec(),
            network_calls: 0,
            cache_hits: 0,
        }
    }

    pub fn with_cascade(mut self, cascade: Vec<GeocodeStrategy>) -> Self {
        self.cascade = cascade;
        self
    }

    pub fn network_calls(&self) -> u64 {
        self.network_calls
    }

    pub fn cache_hits(&self) -> u64 {
        self.cache_hits
    }

    pub fn cache(&self) -> &ResolverCache<GeocodeResult> {
        &self.cache
    }

    pub fn cache_mut(&mut self) -> &mut ResolverCache<GeocodeResult> {
        &mut self.cache
    }

    pub async fn resolve(&mut self, address: &Address) -> Result<GeocodeResult, AddressError> {
        if address.is_empty() {
            return Err(AddressError::Empty);
        }
        let key = address.key();
        match self.cache.get(key.as_str()) {
            Some(CacheEntry::Good(hit)) => {
                self.cache_hits += 1;
                return Ok(hit.clone());
            }
            Some(CacheEntry::Bad) => {
                self.cache_hits += 1;
                return Err(AddressError::KnownBad {
                    key: key.to_string(),
                });
            }
            None => {}
        }

        let queries = cascade_queries(&self.cascade, address);
        let geocoder = &self.geocoder;
        let mut calls = 0u64;
        let outcome = first_non_empty(queries, |query| {
            calls += 1;
            async move {
                let candidates = geocoder.search(&query).await?;
                debug!(?query, candidates = candidates.len(), "geocode attempt");
                Ok::<_, FetchError>(candidates.into_iter().next())
            }
        })
        .await;
        self.network_calls += calls;

        match outcome {
            FirstHit::Hit { tier, value } => {
                debug!(key = %key, tier, "address resolved");
                let result = GeocodeResult {
                    latitude: value.latitude,
                    longitude: value.longitude,
                    display_name: value.display_name,
                };
                self.cache.put_good(key.as_str(), result.clone()).await?;
                Ok(result)
            }
            FirstHit::Exhausted { errors } if errors.is_empty() => {
                self.cache.put_bad(key.as_str()).await?;
                Err(AddressError::Unresolvable {
                    key: key.to_string(),
                })
            }
            FirstHit::Exhausted { errors } => Err(AddressError::Transport {
                key: key.to_string(),
                message: errors
                    .iter()
                    .map(ToString::to_string)
                    .collect::<Vec<_>>()
                    .join("; "),
            }),
        }
    }
}

#[derive(Debug, Deserialize)]
struct NominatimPlace {
    lat: String,
    lon: String,
    #[serde(default)]
    display_name: String,
}

impl NominatimPlace {
    /// Nominatim sends coordinates as strings; unparseable places are dropped.
    fn into_candidate(self) -> Option<GeocodeCandidate> {
        Some(GeocodeCandidate {
            latitude: self.lat.trim().parse().ok()?,
            longitude: self.lon.trim().parse().ok()?,
            display_name: self.display_name,
        })
    }
}

/// Nominatim-compatible search endpoint.
pub struct NominatimGeocoder {
    http: Arc<HttpFetcher>,
    endpoint: String,
    country_codes: String,
}

impl NominatimGeocoder {
    pub fn new(
        http: Arc<HttpFetcher>,
        endpoint: impl Into<String>,
        country_codes: impl Into<String>,
    ) -> Self {
        Self {
            http,
            endpoint: endpoint.into(),
            country_codes: country_codes.into(),
        }
    }

    fn params(&self, query: &GeocodeQuery) -> Vec<(&'static str, String)> {
        let mut params = vec![("format", "jsonv2".to_string()), ("limit", "5".to_string())];
        if !self.country_codes.is_empty() {
            params.push(("countrycodes", self.country_codes.clone()));
        }
        match query {
            GeocodeQuery::Structured {
                street,
                city,
                state,
                postalcode,
                country,
            } => {
                let fields = [
                    ("street", street.clone().unwrap_or_default()),
                    ("city", city.clone()),
                    ("state", state.clone()),
                    ("postalcode", postalcode.clone().unwrap_or_default()),
                    ("country", country.clone()),
                ];
                params.extend(fields.into_iter().filter(|(_, v)| !v.is_empty()));
            }
            GeocodeQuery::FreeText(text) => params.push(("q", text.clone())),
        }
        params
    }
}

#[async_trait]
impl Geocoder for NominatimGeocoder {
    async fn search(&self, query: &GeocodeQuery) -> Result<Vec<GeocodeCandidate>, FetchError> {
        let params = self.params(query);
        let borrowed = params.iter().map(|(k, v)| (*k, v.as_str())).collect::<Vec<_>>();
        let url = url_with_params(&self.endpoint, &borrowed)?;
        let places: Vec<NominatimPlace> = self
            .http
            .fetch_json(GEOCODER_SERVICE, &url, RetryOn::default())
            .await?;
        Ok(places
            .into_iter()
            .filter_map(NominatimPlace::into_candidate)
            .collect())
    }
}


#[cfg(test)]
mod tests {
    use super::fakes::FakeGeocoder;
    use super::*;

    fn springfield() -> Address {
        Address::new("", "Springfield", "IL", "62704", "")
    }

    fn postal_query() -> GeocodeQuery {
        GeocodeQuery::Structured {
            street: None,
            city: "Springfield".into(),
            state: "IL".into(),
            postalcode: Some("62704".into()),
            country: String::new(),
        }
    }

    fn city_only_query() -> GeocodeQuery {
        GeocodeQuery::Structured {
            street: None,
            city: "Springfield".into(),
            state: "IL".into(),
            postalcode: None,
            country: String::new(),
        }
    }

    #[test]
    fn blank_street_skips_street_tiers() {
        let queries = cascade_queries(&CANONICAL_CASCADE, &springfield());
        assert_eq!(
            queries,
            vec![postal_query(), GeocodeQuery::FreeText("Springfield, IL".into())]
        );
    }

    #[tokio::test]
    async fn postal_tier_answers_before_city_only_queries() {
        let fake = Arc::new(
            FakeGeocoder::default()
                .answering(city_only_query(), 39.80, -89.64)
                .answering(postal_query(), 39.75, -89.70),
        );
        let mut resolver = AddressResolver::new(fake.clone(), ResolverCache::in_memory("address"));

        let resolved = resolver.resolve(&springfield()).await.expect("resolved");
        assert_eq!((resolved.latitude, resolved.longitude), (39.75, -89.70));
        assert_eq!(fake.calls(), 1);
        assert_eq!(fake.seen.lock().expect("lock")[0], postal_query());
    }

    #[test]
    fn street_tiers_lead_the_cascade() {
        let address = Address::new("1 Capitol Ave", "Springfield", "IL", "62704", "US");
        let queries = cascade_queries(&CANONICAL_CASCADE, &address);
        assert_eq!(queries.len(), 4);
        assert_eq!(
            queries[1],
            GeocodeQuery::FreeText("1 Capitol Ave, Springfield, IL, US".into())
        );
        assert_eq!(queries[3], GeocodeQuery::FreeText("Springfield, IL, US".into()));
    }

    #[tokio::test]
    async fn first_non_empty_skips_empty_and_failed_tiers() {
        let outcome = first_non_empty(vec![0, 1, 2, 3], |tier| async move {
            match tier {
                0 => Ok(None),
                1 => Err("boom"),
                2 => Ok(Some("hit")),
                _ => panic!("tier after a hit must not run"),
            }
        })
        .await;
        assert_eq!(outcome, FirstHit::Hit { tier: 2, value: "hit" });

        let exhausted: FirstHit<(), &str> =
            first_non_empty(vec![1, 2], |_| async { Err("down") }).await;
        assert_eq!(exhausted, FirstHit::Exhausted { errors: vec!["down", "down"] });
    }

    #[tokio::test]
    async fn repeated_resolution_is_served_from_cache() {
        let fake = Arc::new(FakeGeocoder::default().answering(postal_query(), 39.78, -89.65));
        let mut resolver = AddressResolver::new(fake.clone(), ResolverCache::in_memory("address"));

        let first = resolver.resolve(&springfield()).await.expect("first");
        let calls_after_first = fake.calls();
        assert_eq!(calls_after_first, 1);
        assert_eq!(first.latitude, 39.78);

        let second = resolver
            .resolve(&Address::new(" ", "SPRINGFIELD ", "il", "62704", ""))
            .await
            .expect("second");
        assert_eq!(first, second);
        assert_eq!(fake.calls(), calls_after_first);
        assert_eq!(resolver.network_calls(), 1);
        assert_eq!(resolver.cache_hits(), 1);
    }

    #[tokio::test]
    async fn failures_are_cached_and_short_circuit() {
        let fake = Arc::new(FakeGeocoder::default());
        let mut resolver = AddressResolver::new(fake.clone(), ResolverCache::in_memory("address"));

        let err = resolver.resolve(&springfield()).await.expect_err("unresolvable");
        assert!(matches!(err, AddressError::Unresolvable { .. }));
        let calls = fake.calls();

        let err = resolver.resolve(&springfield()).await.expect_err("known bad");
        assert!(matches!(err, AddressError::KnownBad { .. }));
        assert_eq!(fake.calls(), calls);
        assert_eq!(resolver.cache().bad_count(), 1);
    }

    #[tokio::test]
    async fn transport_failures_are_not_cached() {
        let fake = Arc::new(FakeGeocoder::failing());
        let mut resolver = AddressResolver::new(fake.clone(), ResolverCache::in_memory("address"));

        let err = resolver.resolve(&springfield()).await.expect_err("transport");
        assert!(matches!(err, AddressError::Transport { .. }));
        assert!(resolver.cache().is_empty());

        resolver.resolve(&springfield()).await.expect_err("retried");
        assert_eq!(fake.calls(), 4);
    }

    fn nominatim(countries: &str) -> NominatimGeocoder {
        let http = HttpFetcher::new(rally_storage::HttpClientConfig::default()).expect("client");
        NominatimGeocoder::new(
            Arc::new(http),
            "https://nominatim.example.org/search",
            countries,
        )
    }

    #[test]
    fn structured_queries_send_only_present_fields() {
        let params = nominatim("us").params(&postal_query());
        assert_eq!(
            params,
            vec![
                ("format", "jsonv2".to_string()),
                ("limit", "5".to_string()),
                ("countrycodes", "us".to_string()),
                ("city", "Springfield".to_string()),
                ("state", "IL".to_string()),
                ("postalcode", "62704".to_string()),
            ]
        );
    }

    #[test]
    fn free_text_queries_use_q_and_skip_blank_country_filter() {
        let params = nominatim("").params(&GeocodeQuery::FreeText("Springfield, IL".into()));
        assert!(params.iter().all(|(k, _)| *k != "countrycodes"));
        assert!(params.contains(&("q", "Springfield, IL".to_string())));
        assert!(params.iter().all(|(k, _)| *k != "city"));
    }

    #[test]
    fn nominatim_string_coordinates_decode() {
        let body = r#"[
            {"place_id": 1, "lat": "39.7990175", "lon": "-89.6439575",
             "display_name": "Springfield, Sangamon County, Illinois, United States"},
            {"place_id": 2, "lat": "not-a-number", "lon": "-89.6"},
            {"place_id": 3, "lat": " 39.75 ", "lon": "-89.70"}
        ]"#;
        let places: Vec<NominatimPlace> = serde_json::from_str(body).expect("decode");
        let candidates = places
            .into_iter()
            .filter_map(NominatimPlace::into_candidate)
            .collect::<Vec<_>>();
        assert_eq!(candidates.len(), 2);
        assert_eq!(candidates[0].latitude, 39.7990175);
        assert_eq!(candidates[0].longitude, -89.6439575);
        assert!(candidates[0].display_name.starts_with("Springfield, Sangamon County"));
        assert_eq!(candidates[1].latitude, 39.75);
        assert_eq!(candidates[1].display_name, "");
    }

    #[tokio::test]
    async fn empty_addresses_never_hit_the_network() {
        let fake = Arc::new(FakeGeocoder::default());
        let mut resolver = AddressResolver::new(fake.clone(), ResolverCache::in_memory("address"));
        let err = resolver.resolve(&Address::default()).await.expect_err("empty");
        assert!(matches!(err, AddressError::Empty));
        assert_eq!(fake.calls(), 0);
    }
}
