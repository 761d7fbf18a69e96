//! Core domain model and the color index for the gift color finder.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const CRATE_NAME: &str = "gcf-core";

/// Closed set of primary colors a gift model can carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Color {
    White,
    Black,
    Gray,
    Red,
    Orange,
    Yellow,
    Green,
    Cyan,
    Blue,
    Purple,
    Pink,
    Unknown,
}

impl Color {
    pub const ALL: [Color; 12] = [
        Color::White,
        Color::Black,
        Color::Gray,
        Color::Red,
        Color::Orange,
        Color::Yellow,
        Color::Green,
        Color::Cyan,
        Color::Blue,
        Color::Purple,
        Color::Pink,
        Color::Unknown,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Color::White => "white",
            Color::Black => "black",
            Color::Gray => "gray",
            Color::Red => "red",
            Color::Orange => "orange",
            Color::Yellow => "yellow",
            Color::Green => "green",
            Color::Cyan => "cyan",
            Color::Blue => "blue",
            Color::Purple => "purple",
            Color::Pink => "pink",
            Color::Unknown => "unknown",
        }
    }

    /// Ingestion-side parse: anything outside the closed set becomes `Unknown`.
    pub fn normalize(raw: &str) -> Color {
        raw.parse().unwrap_or(Color::Unknown)
    }
}

impl fmt::Display for Color {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unrecognized color `{0}`")]
pub struct ParseColorError(pub String);

impl FromStr for Color {
    type Err = ParseColorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let needle = s.trim();
        Color::ALL
            .into_iter()
            .find(|c| c.as_str().eq_ignore_ascii_case(needle))
            .ok_or_else(|| ParseColorError(s.to_string()))
    }
}

/// A named gift family, e.g. `{"id": "5170145012310081615", "name": "Desk Calendar"}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Collection {
    pub id: String,
    pub name: String,
}

/// Opaque backdrop reference value, passed through to clients untouched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Backdrop(pub serde_json::Value);

/// Hashable `(collection, model)` pair used for membership checks.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CollectionModel {
    pub collection: String,
    pub model: String,
}

impl CollectionModel {
    pub fn new(collection: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            collection: collection.into(),
            model: model.into(),
        }
    }
}

/// Case- and whitespace-insensitive form of a collection name, so a display name
/// such as `"Desk Calendar"` compares equal to the catalog key `"DeskCalendar"`.
pub fn collection_key(name: &str) -> String {
    name.chars()
        .filter(|c| !c.is_whitespace())
        .flat_map(char::to_lowercase)
        .collect()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelColorRecord {
    pub collection: String,
    pub model: String,
    pub main_color: Color,
}

/// Immutable mapping from color to every `(collection, model)` pair of that color.
///
/// Pairs keep ingestion order. Repeated insertions of the same pair are kept as-is.
#[derive(Debug, Clone, Default)]
pub struct ColorIndex {
    by_color: HashMap<Color, Vec<CollectionModel>>,
}

impl ColorIndex {
    pub fn from_records(records: impl IntoIterator<Item = ModelColorRecord>) -> Self {
        let mut by_color: HashMap<Color, Vec<CollectionModel>> = HashMap::new();
        for record in records {
            by_color
                .entry(record.main_color)
                .or_default()
                .push(CollectionModel::new(record.collection, record.model));
        }
        Self { by_color }
    }

    pub fn lookup(&self, color: Color) -> &[CollectionModel] {
        self.by_color.get(&color).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Total number of indexed pairs across all colors.
    pub fn len(&self) -> usize {
        self.by_color.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.by_color.values().all(Vec::is_empty)
    }

    /// Per-color pair counts in the fixed color order, skipping empty colors.
    pub fn color_counts(&self) -> Vec<(Color, usize)> {
        Color::ALL
            .into_iter()
            .filter_map(|c| {
                let n = self.lookup(c).len();
                (n > 0).then_some((c, n))
            })
            .collect()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SortOrder {
    #[default]
    PriceAsc,
    PriceDesc,
}

impl SortOrder {
    /// Unrecognized values fall back to ascending.
    pub fn parse_lenient(raw: Option<&str>) -> Self {
        match raw.map(str::trim) {
            Some("price_desc") => SortOrder::PriceDesc,
            _ => SortOrder::PriceAsc,
        }
    }
}

/// Validated search constraints. `color` is the only required field.
#[derive(Debug, Clone, PartialEq)]
pub struct SearchQuery {
    pub color: Color,
    pub collections: Vec<String>,
    pub backdrops: Vec<String>,
    pub min_price: Option<f64>,
    pub max_price: Option<f64>,
    pub sort: SortOrder,
}

impl SearchQuery {
    pub fn new(color: Color) -> Self {
        Self {
            color,
            collections: Vec::new(),
            backdrops: Vec::new(),
            min_price: None,
            max_price: None,
            sort: SortOrder::default(),
        }
    }

    pub fn with_collections<I, S>(mut self, collections: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.collections = collections.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_backdrops<I, S>(mut self, backdrops: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.backdrops = backdrops.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_price_range(mut self, min_price: Option<f64>, max_price: Option<f64>) -> Self {
        self.min_price = min_price;
        self.max_price = max_price;
        self
    }

    pub fn with_sort(mut self, sort: SortOrder) -> Self {
        self.sort = sort;
        self
    }

    /// Inclusive bounds; an absent bound admits everything on that side.
    pub fn price_in_range(&self, price: f64) -> bool {
        self.min_price.is_none_or(|min| price >= min)
            && self.max_price.is_none_or(|max| price <= max)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GiftSource {
    Portals,
    Tonnel,
}

impl GiftSource {
    pub fn as_str(self) -> &'static str {
        match self {
            GiftSource::Portals => "portals",
            GiftSource::Tonnel => "tonnel",
        }
    }

    /// Prefix applied to upstream ids so ids stay unique across marketplaces.
    pub fn id_for(self, raw_id: &str) -> String {
        format!("{}_{raw_id}", self.as_str())
    }
}

impl fmt::Display for GiftSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

/// Canonical listing returned to clients. `name` is the collection name.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Gift {
    pub id: String,
    pub name: String,
    pub model: String,
    pub price: f64,
    #[serde(rename = "imageUrl")]
    pub image_url: String,
    #[serde(rename = "buyUrl")]
    pub buy_url: String,
    pub source: GiftSource,
}
