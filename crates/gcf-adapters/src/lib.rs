//! Marketplace adapter contracts, HTTP clients for both marketplaces and the
//! normalizer that maps their listings onto the canonical [`Gift`].
//!
//! The two marketplaces have different query power, so each gets its own trait:
//! [`BatchMarketplace`] filters by many collections and models in one call, while
//! [`CollectionMarketplace`] takes exactly one collection and cannot filter by model.

use std::sync::Arc;

use async_trait::async_trait;
use gcf_core::{Gift, GiftSource};
use gcf_http::{FetchError, HttpFetcher, HttpRequest};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{json, Value as JsonValue};
use thiserror::Error;
use tracing::debug;
use uuid::Uuid;

pub const CRATE_NAME: &str = "gcf-adapters";

pub const DEFAULT_PORTALS_API_URL: &str = "https://portals-market.com/api";
pub const DEFAULT_TONNEL_API_URL: &str = "https://gifts2.tonnel.network/api";

/// Tonnel prices are quoted before its marketplace fee; clients see the fee-inclusive price.
pub const TONNEL_FEE_MARKUP: f64 = 1.1;

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("no credential configured for {0}")]
    MissingCredential(GiftSource),
    #[error(transparent)]
    Fetch(#[from] FetchError),
}

#[derive(Debug, Clone)]
pub struct MarketConfig {
    pub portals_api_url: String,
    pub portals_auth_data: Option<String>,
    pub tonnel_api_url: String,
    pub tonnel_auth_data: Option<String>,
}

impl Default for MarketConfig {
    fn default() -> Self {
        Self {
            portals_api_url: DEFAULT_PORTALS_API_URL.to_string(),
            portals_auth_data: None,
            tonnel_api_url: DEFAULT_TONNEL_API_URL.to_string(),
            tonnel_auth_data: None,
        }
    }
}

impl MarketConfig {
    pub fn from_env() -> Self {
        Self {
            portals_api_url: std::env::var("PORTALS_API_URL")
                .unwrap_or_else(|_| DEFAULT_PORTALS_API_URL.to_string()),
            portals_auth_data: non_empty_env("PORTALS_AUTH_DATA"),
            tonnel_api_url: std::env::var("TONNEL_API_URL")
                .unwrap_or_else(|_| DEFAULT_TONNEL_API_URL.to_string()),
            tonnel_auth_data: non_empty_env("TONNEL_AUTH_DATA"),
        }
    }
}

fn non_empty_env(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

/// Constraints for a single batched call. Empty `backdrops` means any backdrop.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BatchSearch {
    pub collections: Vec<String>,
    pub models: Vec<String>,
    pub backdrops: Vec<String>,
    pub limit: usize,
}

/// Constraints for a single-collection call. `None` backdrop means any backdrop.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CollectionSearch {
    pub collection: String,
    pub backdrop: Option<String>,
    pub limit: usize,
}

#[async_trait]
pub trait BatchMarketplace: Send + Sync {
    fn source(&self) -> GiftSource;

    async fn search(&self, query: &BatchSearch) -> Result<Vec<PortalsListing>, AdapterError>;
}

#[async_trait]
pub trait CollectionMarketplace: Send + Sync {
    fn source(&self) -> GiftSource;

    async fn search_collection(
        &self,
        query: &CollectionSearch,
    ) -> Result<Vec<TonnelListing>, AdapterError>;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PortalsAttribute {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub value: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PortalsListing {
    #[serde(deserialize_with = "string_or_number")]
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub photo_url: Option<String>,
    #[serde(default, deserialize_with = "lenient_price")]
    pub price: Option<f64>,
    #[serde(default)]
    pub attributes: Vec<PortalsAttribute>,
}

impl PortalsListing {
    pub fn model(&self) -> Option<&str> {
        self.attributes
            .iter()
            .find(|attr| attr.kind == "model")
            .map(|attr| attr.value.as_str())
    }
}

#[derive(Debug, Clone, Deserialize)]
struct PortalsSearchResponse {
    #[serde(default)]
    results: Vec<JsonValue>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TonnelListing {
    #[serde(deserialize_with = "string_or_number")]
    pub gift_id: String,
    #[serde(default, deserialize_with = "string_or_number")]
    pub gift_num: String,
    #[serde(default)]
    pub name: String,
    /// Compound `"<model> (<rarity>)"` string.
    #[serde(default)]
    pub model: String,
    #[serde(default)]
    pub backdrop: Option<String>,
    #[serde(default, deserialize_with = "lenient_price")]
    pub price: Option<f64>,
}

impl TonnelListing {
    pub fn model_name(&self) -> &str {
        parse_tonnel_model(&self.model)
    }
}

/// `"Amber (1.5%)"` -> `"Amber"`. Splits on the first `" ("`; strings without a
/// rarity suffix come back unchanged.
pub fn parse_tonnel_model(raw: &str) -> &str {
    raw.split_once(" (").map_or(raw, |(model, _rarity)| model)
}

/// Decodes each record on its own; records that do not decode are skipped.
fn listings_from_page<T: DeserializeOwned>(source: GiftSource, page: Vec<JsonValue>) -> Vec<T> {
    let received = page.len();
    let listings = page
        .into_iter()
        .filter_map(|record| match serde_json::from_value(record) {
            Ok(listing) => Some(listing),
            Err(err) => {
                debug!(%source, error = %err, "skipping undecodable listing");
                None
            }
        })
        .collect::<Vec<T>>();
    if listings.len() < received {
        debug!(%source, received, decoded = listings.len(), "page had undecodable listings");
    }
    listings
}

fn string_or_number<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    match JsonValue::deserialize(deserializer)? {
        JsonValue::String(s) => Ok(s),
        JsonValue::Number(n) => Ok(n.to_string()),
        JsonValue::Null => Ok(String::new()),
        other => Err(serde::de::Error::custom(format!(
            "expected string or number, got {other}"
        ))),
    }
}

fn lenient_price<'de, D>(deserializer: D) -> Result<Option<f64>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<JsonValue>::deserialize(deserializer)?;
    Ok(match value {
        Some(JsonValue::Number(n)) => n.as_f64(),
        Some(JsonValue::String(s)) => s.trim().parse::<f64>().ok(),
        _ => None,
    }
    .filter(|p| p.is_finite()))
}

pub fn portals_buy_url(id: &str) -> String {
    format!("https://t.me/portals/market?startapp=gift_{id}")
}

pub fn tonnel_buy_url(gift_id: &str) -> String {
    format!("https://market.tonnel.network/gift/{gift_id}")
}

pub fn fragment_image_url(collection: &str, gift_num: &str) -> String {
    let slug = collection.to_lowercase().replace(' ', "");
    format!("https://nft.fragment.com/gift/{slug}-{gift_num}.large.jpg")
}

/// Listings without a model attribute or a usable price do not normalize.
pub fn normalize_portals(listing: &PortalsListing) -> Option<Gift> {
    let model = listing.model()?;
    let price = listing.price?;
    Some(Gift {
        id: GiftSource::Portals.id_for(&listing.id),
        name: listing.name.clone(),
        model: model.to_string(),
        price,
        image_url: listing.photo_url.clone().unwrap_or_default(),
        buy_url: portals_buy_url(&listing.id),
        source: GiftSource::Portals,
    })
}

pub fn normalize_tonnel(listing: &TonnelListing) -> Option<Gift> {
    let price = listing.price? * TONNEL_FEE_MARKUP;
    Some(Gift {
        id: GiftSource::Tonnel.id_for(&listing.gift_id),
        name: listing.name.clone(),
        model: listing.model_name().to_string(),
        price,
        image_url: fragment_image_url(&listing.name, &listing.gift_num),
        buy_url: tonnel_buy_url(&listing.gift_id),
        source: GiftSource::Tonnel,
    })
}

#[derive(Debug, Clone)]
pub struct PortalsClient {
    http: Arc<HttpFetcher>,
    api_url: String,
    auth_data: Option<String>,
}

impl PortalsClient {
    pub fn new(http: Arc<HttpFetcher>, config: &MarketConfig) -> Self {
        Self {
            http,
            api_url: config.portals_api_url.trim_end_matches('/').to_string(),
            auth_data: config.portals_auth_data.clone(),
        }
    }

    fn build_request(&self, auth_data: &str, query: &BatchSearch) -> HttpRequest {
        let mut request = HttpRequest::get(format!("{}/nfts/search", self.api_url))
            .query("offset", "0")
            .query("limit", query.limit.to_string())
            .query("sort_by", "price asc")
            .query("status", "listed")
            .header("Authorization", format!("tma {auth_data}"))
            .max_retries(0);
        for (key, values) in [
            ("filter_by_collections", &query.collections),
            ("filter_by_models", &query.models),
            ("filter_by_backdrops", &query.backdrops),
        ] {
            if !values.is_empty() {
                request = request.query(key, values.join(","));
            }
        }
        request
    }
}

#[async_trait]
impl BatchMarketplace for PortalsClient {
    fn source(&self) -> GiftSource {
        GiftSource::Portals
    }

    async fn search(&self, query: &BatchSearch) -> Result<Vec<PortalsListing>, AdapterError> {
        let auth_data = self
            .auth_data
            .as_deref()
            .ok_or(AdapterError::MissingCredential(GiftSource::Portals))?;
        let request = self.build_request(auth_data, query);
        let response: PortalsSearchResponse = self
            .http
            .fetch_json(Uuid::new_v4(), GiftSource::Portals.as_str(), &request)
            .await?;
        Ok(listings_from_page(GiftSource::Portals, response.results))
    }
}

#[derive(Debug, Clone)]
pub struct TonnelClient {
    http: Arc<HttpFetcher>,
    api_url: String,
    auth_data: Option<String>,
}

impl TonnelClient {
    pub fn new(http: Arc<HttpFetcher>, config: &MarketConfig) -> Self {
        Self {
            http,
            api_url: config.tonnel_api_url.trim_end_matches('/').to_string(),
            auth_data: config.tonnel_auth_data.clone(),
        }
    }

    fn build_request(&self, auth_data: &str, query: &CollectionSearch) -> HttpRequest {
        let mut filter = json!({
            "price": {"$exists": true},
            "buyer": {"$exists": false},
            "asset": "TON",
            "gift_name": query.collection,
        });
        if let Some(backdrop) = &query.backdrop {
            // stored backdrops carry a rarity suffix, e.g. "Onyx Black (2%)"
            filter["backdrop"] = json!({"$regex": format!("^{} \\(", escape_regex(backdrop))});
        }
        let body = json!({
            "page": 1,
            "limit": query.limit,
            "sort": json!({"price": 1, "gift_id": -1}).to_string(),
            "filter": filter.to_string(),
            "ref": 0,
            "price_range": null,
            "user_auth": auth_data,
        });
        HttpRequest::post_json(format!("{}/pageGifts", self.api_url), body)
            .header("Origin", "https://market.tonnel.network")
            .header("Referer", "https://market.tonnel.network/")
            .max_retries(0)
    }
}

fn escape_regex(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for ch in raw.chars() {
        if "\\.+*?()|[]{}^$".contains(ch) {
            out.push('\\');
        }
        out.push(ch);
    }
    out
}

#[async_trait]
impl CollectionMarketplace for TonnelClient {
    fn source(&self) -> GiftSource {
        GiftSource::Tonnel
    }

    async fn search_collection(
        &self,
        query: &CollectionSearch,
    ) -> Result<Vec<TonnelListing>, AdapterError> {
        let auth_data = self
            .auth_data
            .as_deref()
            .ok_or(AdapterError::MissingCredential(GiftSource::Tonnel))?;
        let request = self.build_request(auth_data, query);
        let page: Vec<JsonValue> = self
            .http
            .fetch_json(Uuid::new_v4(), GiftSource::Tonnel.as_str(), &request)
            .await?;
        Ok(listings_from_page(GiftSource::Tonnel, page))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gcf_http::HttpClientConfig;
    use std::path::{Path, PathBuf};

    fn workspace_root() -> PathBuf {
        Path::new(env!("CARGO_MANIFEST_DIR"))
            .join("../..")
            .canonicalize()
            .expect("workspace root")
    }

    fn read_fixture(rel: &str) -> String {
        std::fs::read_to_string(workspace_root().join("fixtures").join(rel)).expect("read fixture")
    }

    fn fetcher() -> Arc<HttpFetcher> {
        Arc::new(HttpFetcher::new(HttpClientConfig::default()).expect("fetcher"))
    }

    #[test]
    fn tonnel_model_split_drops_rarity_suffix() {
        assert_eq!(parse_tonnel_model("Amber (1.5%)"), "Amber");
        assert_eq!(parse_tonnel_model("Lava Lamp (Glow) (2%)"), "Lava Lamp");
        assert_eq!(parse_tonnel_model("Plain"), "Plain");
        assert_eq!(parse_tonnel_model(""), "");
    }

    #[test]
    fn portals_fixture_normalizes_to_canonical_gifts() {
        let response: PortalsSearchResponse =
            serde_json::from_str(&read_fixture("portals/search_response.json")).unwrap();
        let listings: Vec<PortalsListing> =
            listings_from_page(GiftSource::Portals, response.results);
        assert_eq!(listings.len(), 3);

        let first = normalize_portals(&listings[0]).unwrap();
        assert_eq!(first.id, "portals_0b1d4a5e-portals-1");
        assert_eq!(first.name, "DeskCalendar");
        assert_eq!(first.model, "Amber");
        assert_eq!(first.price, 12.5);
        assert_eq!(first.image_url, "https://cdn.portals.example/deskcalendar-101.webp");
        assert_eq!(first.buy_url, "https://t.me/portals/market?startapp=gift_0b1d4a5e-portals-1");
        assert_eq!(first.source, GiftSource::Portals);

        // third listing carries no model attribute
        assert!(normalize_portals(&listings[2]).is_none());
    }

    #[test]
    fn tonnel_fixture_applies_fee_markup_and_fragment_image() {
        let page: Vec<JsonValue> =
            serde_json::from_str(&read_fixture("tonnel/page_gifts_response.json")).unwrap();
        let listings: Vec<TonnelListing> = listings_from_page(GiftSource::Tonnel, page);
        let gift = normalize_tonnel(&listings[0]).unwrap();
        assert_eq!(gift.id, "tonnel_9001");
        assert_eq!(gift.name, "Desk Calendar");
        assert_eq!(gift.model, "Amber");
        assert!((gift.price - 22.0).abs() < 1e-9);
        assert_eq!(gift.image_url, "https://nft.fragment.com/gift/deskcalendar-4242.large.jpg");
        assert_eq!(gift.buy_url, "https://market.tonnel.network/gift/9001");
        assert_eq!(gift.source, GiftSource::Tonnel);
    }

    #[test]
    fn unusable_prices_do_not_normalize() {
        let listing: PortalsListing = serde_json::from_value(json!({
            "id": 7,
            "name": "DeskCalendar",
            "price": "n/a",
            "attributes": [{"type": "model", "value": "Amber"}]
        }))
        .unwrap();
        assert_eq!(listing.id, "7");
        assert!(listing.price.is_none());
        assert!(normalize_portals(&listing).is_none());

        let listing: TonnelListing = serde_json::from_value(json!({
            "gift_id": 1, "gift_num": 2, "name": "X", "model": "Y (1%)"
        }))
        .unwrap();
        assert!(normalize_tonnel(&listing).is_none());
    }

    #[test]
    fn portals_request_joins_filters_and_omits_empty_backdrops() {
        let client = PortalsClient::new(fetcher(), &MarketConfig::default());
        let request = client.build_request(
            "secret",
            &BatchSearch {
                collections: vec!["DeskCalendar".into(), "PlushPepe".into()],
                models: vec!["Amber".into(), "Ruby".into()],
                backdrops: vec![],
                limit: 50,
            },
        );
        assert_eq!(request.url, "https://portals-market.com/api/nfts/search");
        assert!(request.query.contains(&(
            "filter_by_collections".to_string(),
            "DeskCalendar,PlushPepe".to_string()
        )));
        assert!(request
            .query
            .contains(&("filter_by_models".to_string(), "Amber,Ruby".to_string())));
        assert!(request.query.iter().all(|(k, _)| k != "filter_by_backdrops"));
        assert!(request.query.contains(&("limit".to_string(), "50".to_string())));
        assert!(request
            .headers
            .contains(&("Authorization".to_string(), "tma secret".to_string())));
        assert_eq!(request.max_retries, Some(0));
    }

    #[test]
    fn tonnel_request_encodes_collection_and_optional_backdrop() {
        let client = TonnelClient::new(fetcher(), &MarketConfig::default());
        let request = client.build_request(
            "secret",
            &CollectionSearch {
                collection: "DeskCalendar".into(),
                backdrop: Some("Onyx Black".into()),
                limit: 30,
            },
        );
        assert_eq!(request.url, "https://gifts2.tonnel.network/api/pageGifts");
        assert_eq!(request.max_retries, Some(0));
        let body = request.json_body.expect("body");
        assert_eq!(body["limit"], 30);
        assert_eq!(body["user_auth"], "secret");
        let filter: JsonValue = serde_json::from_str(body["filter"].as_str().unwrap()).unwrap();
        assert_eq!(filter["gift_name"], "DeskCalendar");
        assert_eq!(filter["backdrop"]["$regex"], "^Onyx Black \\(");

        let request = client.build_request(
            "secret",
            &CollectionSearch {
                collection: "DeskCalendar".into(),
                backdrop: None,
                limit: 30,
            },
        );
        let body = request.json_body.expect("body");
        let filter: JsonValue = serde_json::from_str(body["filter"].as_str().unwrap()).unwrap();
        assert!(filter.get("backdrop").is_none());
    }

    #[test]
    fn malformed_records_are_skipped_without_losing_the_page() {
        let response: PortalsSearchResponse =
            serde_json::from_str(&read_fixture("portals/search_response_partial.json")).unwrap();
        let listings: Vec<PortalsListing> =
            listings_from_page(GiftSource::Portals, response.results);
        let ids = listings.iter().map(|l| l.id.as_str()).collect::<Vec<_>>();
        assert_eq!(ids, vec!["c7e2-portals-1", "c7e2-portals-4"]);
        assert!(listings.iter().all(|l| normalize_portals(l).is_some()));

        let page: Vec<JsonValue> =
            serde_json::from_str(&read_fixture("tonnel/page_gifts_partial.json")).unwrap();
        let listings: Vec<TonnelListing> = listings_from_page(GiftSource::Tonnel, page);
        let ids = listings.iter().map(|l| l.gift_id.as_str()).collect::<Vec<_>>();
        assert_eq!(ids, vec!["9101", "9104"]);
        assert_eq!(listings[1].model_name(), "Snow");
    }

    #[test]
    fn backdrop_regex_escapes_metacharacters() {
        assert_eq!(escape_regex("Onyx Black"), "Onyx Black");
        assert_eq!(escape_regex("Neon (v2)"), "Neon \\(v2\\)");
    }

    #[tokio::test]
    async fn missing_credentials_fail_without_network() {
        let portals = PortalsClient::new(fetcher(), &MarketConfig::default());
        let err = portals
            .search(&BatchSearch {
                collections: vec!["DeskCalendar".into()],
                models: vec!["Amber".into()],
                backdrops: vec![],
                limit: 50,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, AdapterError::MissingCredential(GiftSource::Portals)));

        let tonnel = TonnelClient::new(fetcher(), &MarketConfig::default());
        let err = tonnel
            .search_collection(&CollectionSearch {
                collection: "DeskCalendar".into(),
                backdrop: None,
                limit: 30,
            })
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "no credential configured for tonnel");
    }
}
