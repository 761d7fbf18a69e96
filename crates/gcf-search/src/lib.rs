//! Aggregation pipeline: color index lookup, fan-out to both marketplaces,
//! cross-validation against the index, price filtering and sorting.

use std::collections::HashSet;
use std::sync::Arc;

use futures_util::future::join_all;
use gcf_adapters::{
    normalize_portals, normalize_tonnel, AdapterError, BatchMarketplace, BatchSearch,
    CollectionMarketplace, CollectionSearch,
};
use gcf_core::{
    collection_key, Color, ColorIndex, CollectionModel, Gift, GiftSource, SearchQuery, SortOrder,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "gcf-search";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SearchError {
    #[error("{0} parameter is required")]
    MissingParameter(&'static str),
}

/// Raw query-string parameters as received from a client.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SearchParams {
    pub color: Option<String>,
    pub collections: Option<String>,
    pub backdrops: Option<String>,
    pub min_price: Option<String>,
    pub max_price: Option<String>,
    pub sort: Option<String>,
}

impl SearchParams {
    /// Validates the parameters. `Ok(None)` means the color is outside the closed
    /// set, which can never match anything.
    pub fn into_query(self) -> Result<Option<SearchQuery>, SearchError> {
        let raw_color = self
            .color
            .as_deref()
            .map(str::trim)
            .filter(|c| !c.is_empty())
            .ok_or(SearchError::MissingParameter("Color"))?;
        let Ok(color) = raw_color.parse::<Color>() else {
            debug!(color = raw_color, "unrecognized color");
            return Ok(None);
        };
        Ok(Some(
            SearchQuery::new(color)
                .with_collections(split_csv(self.collections.as_deref()))
                .with_backdrops(split_csv(self.backdrops.as_deref()))
                .with_price_range(
                    parse_price(self.min_price.as_deref()),
                    parse_price(self.max_price.as_deref()),
                )
                .with_sort(SortOrder::parse_lenient(self.sort.as_deref())),
        ))
    }
}

fn split_csv(raw: Option<&str>) -> Vec<String> {
    raw.map(|s| {
        s.split(',')
            .map(str::trim)
            .filter(|part| !part.is_empty())
            .map(ToString::to_string)
            .collect()
    })
    .unwrap_or_default()
}

/// Unparsable or non-finite bounds are ignored rather than rejected.
fn parse_price(raw: Option<&str>) -> Option<f64> {
    raw.and_then(|s| s.trim().parse::<f64>().ok())
        .filter(|p| p.is_finite())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SearchLimits {
    pub portals: usize,
    pub tonnel: usize,
}

impl Default for SearchLimits {
    fn default() -> Self {
        Self {
            portals: 50,
            tonnel: 30,
        }
    }
}

impl SearchLimits {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            portals: std::env::var("GCF_PORTALS_LIMIT")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.portals),
            tonnel: std::env::var("GCF_TONNEL_LIMIT")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.tonnel),
        }
    }
}

/// One failed upstream unit: a whole source, or one collection for Tonnel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SourceFailure {
    pub source: GiftSource,
    pub collection: Option<String>,
    pub message: String,
}

impl SourceFailure {
    fn new(source: GiftSource, collection: Option<&str>, err: &AdapterError) -> Self {
        Self {
            source,
            collection: collection.map(ToString::to_string),
            message: err.to_string(),
        }
    }
}

#[derive(Debug, Default)]
struct SourceOutcome {
    accepted: Vec<Gift>,
    failures: Vec<SourceFailure>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct SearchReport {
    pub gifts: Vec<Gift>,
    pub candidates: usize,
    pub failures: Vec<SourceFailure>,
}

/// Index pairs eligible for one request, with set-backed membership.
#[derive(Debug)]
struct Candidates<'a> {
    pairs: Vec<&'a CollectionModel>,
    members: HashSet<(&'a str, &'a str)>,
}

impl<'a> Candidates<'a> {
    fn new(indexed: &'a [CollectionModel], collections: &[String]) -> Self {
        let pairs = indexed
            .iter()
            .filter(|pair| collections.is_empty() || collections.contains(&pair.collection))
            .collect::<Vec<_>>();
        let members = pairs
            .iter()
            .map(|pair| (pair.collection.as_str(), pair.model.as_str()))
            .collect();
        Self { pairs, members }
    }

    fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }

    fn contains(&self, collection: &str, model: &str) -> bool {
        self.members.contains(&(collection, model))
    }

    fn distinct_collections(&self) -> Vec<&'a str> {
        distinct(self.pairs.iter().map(|pair| pair.collection.as_str()))
    }

    fn distinct_models(&self) -> Vec<&'a str> {
        distinct(self.pairs.iter().map(|pair| pair.model.as_str()))
    }

    fn models_in(&self, collection: &str) -> HashSet<&'a str> {
        self.pairs
            .iter()
            .filter(|pair| pair.collection == collection)
            .map(|pair| pair.model.as_str())
            .collect()
    }
}

/// First-appearance order, duplicates dropped.
fn distinct<'a>(items: impl Iterator<Item = &'a str>) -> Vec<&'a str> {
    let mut seen = HashSet::new();
    items.filter(|item| seen.insert(*item)).collect()
}

/// Stable sort: equal prices keep their merge order.
pub fn sort_gifts(gifts: &mut [Gift], order: SortOrder) {
    match order {
        SortOrder::PriceAsc => gifts.sort_by(|a, b| a.price.total_cmp(&b.price)),
        SortOrder::PriceDesc => gifts.sort_by(|a, b| b.price.total_cmp(&a.price)),
    }
}

pub struct SearchPipeline {
    index: Arc<ColorIndex>,
    portals: Arc<dyn BatchMarketplace>,
    tonnel: Arc<dyn CollectionMarketplace>,
    limits: SearchLimits,
}

impl SearchPipeline {
    pub fn new(
        index: Arc<ColorIndex>,
        portals: Arc<dyn BatchMarketplace>,
        tonnel: Arc<dyn CollectionMarketplace>,
    ) -> Self {
        Self {
            index,
            portals,
            tonnel,
            limits: SearchLimits::default(),
        }
    }

    pub fn with_limits(mut self, limits: SearchLimits) -> Self {
        self.limits = limits;
        self
    }

    pub fn index(&self) -> &ColorIndex {
        &self.index
    }

    /// Validates raw parameters and runs the search.
    pub async fn search_params(&self, params: SearchParams) -> Result<Vec<Gift>, SearchError> {
        match params.into_query()? {
            Some(query) => Ok(self.search(&query).await),
            None => Ok(Vec::new()),
        }
    }

    pub async fn search(&self, query: &SearchQuery) -> Vec<Gift> {
        self.search_with_report(query).await.gifts
    }

    /// Upstream failures never fail the search; they are logged here once and
    /// returned alongside the gifts.
    pub async fn search_with_report(&self, query: &SearchQuery) -> SearchReport {
        let span = info_span!("search", search_id = %Uuid::new_v4(), color = %query.color);
        async {
            let candidates = Candidates::new(self.index.lookup(query.color), &query.collections);
            if candidates.is_empty() {
                debug!("no indexed models for request");
                return SearchReport::default();
            }

            let (portals, tonnel) = tokio::join!(
                self.query_portals(&candidates, query),
                self.query_tonnel(&candidates, query),
            );

            let mut failures = portals.failures;
            failures.extend(tonnel.failures);
            for failure in &failures {
                warn!(
                    source = %failure.source,
                    collection = failure.collection.as_deref().unwrap_or("*"),
                    error = %failure.message,
                    "marketplace contributed no records"
                );
            }

            let mut gifts = portals.accepted;
            gifts.extend(tonnel.accepted);
            gifts.retain(|gift| query.price_in_range(gift.price));
            sort_gifts(&mut gifts, query.sort);

            info!(
                candidates = candidates.pairs.len(),
                results = gifts.len(),
                failures = failures.len(),
                "search complete"
            );
            SearchReport {
                gifts,
                candidates: candidates.pairs.len(),
                failures,
            }
        }
        .instrument(span)
        .await
    }

    async fn query_portals(
        &self,
        candidates: &Candidates<'_>,
        query: &SearchQuery,
    ) -> SourceOutcome {
        let request = BatchSearch {
            collections: owned(candidates.distinct_collections()),
            models: owned(candidates.distinct_models()),
            backdrops: query.backdrops.clone(),
            limit: self.limits.portals,
        };
        match self.portals.search(&request).await {
            Ok(listings) => {
                let accepted = listings
                    .iter()
                    .filter(|listing| {
                        listing
                            .model()
                            .is_some_and(|model| candidates.contains(&listing.name, model))
                    })
                    .filter_map(normalize_portals)
                    .collect::<Vec<_>>();
                debug!(received = listings.len(), accepted = accepted.len(), "portals results");
                SourceOutcome {
                    accepted,
                    failures: Vec::new(),
                }
            }
            Err(err) => SourceOutcome {
                accepted: Vec::new(),
                failures: vec![SourceFailure::new(self.portals.source(), None, &err)],
            },
        }
    }

    async fn query_tonnel(
        &self,
        candidates: &Candidates<'_>,
        query: &SearchQuery,
    ) -> SourceOutcome {
        let collections = if query.collections.is_empty() {
            candidates.distinct_collections()
        } else {
            distinct(query.collections.iter().map(String::as_str))
        };
        // the backend filters by at most one backdrop
        let backdrop = match query.backdrops.as_slice() {
            [only] => Some(only.clone()),
            _ => None,
        };

        let units = collections
            .into_iter()
            .map(|collection| (collection, candidates.models_in(collection)))
            .filter(|(_, models)| !models.is_empty())
            .collect::<Vec<_>>();

        let results = join_all(units.iter().map(|(collection, _)| {
            let request = CollectionSearch {
                collection: collection.to_string(),
                backdrop: backdrop.clone(),
                limit: self.limits.tonnel,
            };
            async move { self.tonnel.search_collection(&request).await }
        }))
        .await;

        let mut outcome = SourceOutcome::default();
        for ((collection, models), result) in units.iter().zip(results) {
            // upstream reports display names, e.g. "Desk Calendar" for DeskCalendar
            let key = collection_key(collection);
            match result {
                Ok(listings) => outcome.accepted.extend(
                    listings
                        .iter()
                        .filter(|listing| {
                            collection_key(&listing.name) == key
                                && models.contains(listing.model_name())
                        })
                        .filter_map(normalize_tonnel),
                ),
                Err(err) => outcome.failures.push(SourceFailure::new(
                    self.tonnel.source(),
                    Some(*collection),
                    &err,
                )),
            }
        }
        outcome
    }
}

fn owned(items: Vec<&str>) -> Vec<String> {
    items.into_iter().map(ToString::to_string).collect()
}
