//! Data models for livemap
//!
//! Defines the tracked `Point`, its wire form `PointPayload`, and the marker
//! style a point's category maps to.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::MalformedPayload;

/// A latitude/longitude pair in degrees
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LatLng {
    pub lat: f64,
    pub lng: f64,
}

impl LatLng {
    pub fn new(lat: f64, lng: f64) -> Self {
        Self { lat, lng }
    }
}

/// Point category, drives the marker colour and nothing else
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Category {
    #[serde(rename = "R", alias = "r", alias = "red", alias = "#ff4444")]
    Red,
    #[serde(rename = "G", alias = "g", alias = "green", alias = "#44ff44")]
    Green,
}

impl Category {
    /// Wire code used by the hub
    pub fn code(&self) -> &'static str {
        match self {
            Category::Red => "R",
            Category::Green => "G",
        }
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

impl FromStr for Category {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "R" | "r" | "red" | "#ff4444" => Ok(Category::Red),
            "G" | "g" | "green" | "#44ff44" => Ok(Category::Green),
            other => Err(format!("Unknown category '{}', expected R or G", other)),
        }
    }
}

/// A tracked entity
#[derive(Debug, Clone, PartialEq)]
pub struct Point {
    /// Stable external identifier, unique within the store
    pub id: String,
    pub position: LatLng,
    pub category: Category,
}

impl Point {
    pub fn new(id: impl Into<String>, lat: f64, lng: f64, category: Category) -> Self {
        Self {
            id: id.into(),
            position: LatLng::new(lat, lng),
            category,
        }
    }

    /// Marker style for this point
    pub fn style(&self) -> MarkerStyle {
        MarkerStyle::for_category(self.category)
    }

    /// Convert to the hub's wire shape
    pub fn to_payload(&self) -> PointPayload {
        PointPayload {
            id: self.id.clone(),
            lat: self.position.lat,
            lng: self.position.lng,
            category: self.category,
        }
    }
}

/// Point as it travels over the hub connection
///
/// Outbound payloads use the hub contract names (`imei`, `lat`, `lng`, `c`).
/// On input `id`/`name`, `long` and `category`/`color` are accepted too; a
/// `color` may be a category code, a colour name or the marker fill colour.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PointPayload {
    #[serde(rename = "imei", alias = "id", alias = "name")]
    pub id: String,
    pub lat: f64,
    #[serde(alias = "long")]
    pub lng: f64,
    #[serde(rename = "c", alias = "category", alias = "color")]
    pub category: Category,
}

impl PointPayload {
    /// Check shape constraints and convert into a `Point`
    pub fn validate(self) -> Result<Point, MalformedPayload> {
        if self.id.trim().is_empty() {
            return Err(MalformedPayload::EmptyId);
        }
        if !self.lat.is_finite() || !self.lng.is_finite() {
            return Err(MalformedPayload::NonFinite {
                id: self.id,
                lat: self.lat,
                lng: self.lng,
            });
        }
        if !(-90.0..=90.0).contains(&self.lat) {
            return Err(MalformedPayload::LatitudeOutOfRange {
                id: self.id,
                lat: self.lat,
            });
        }
        if !(-180.0..=180.0).contains(&self.lng) {
            return Err(MalformedPayload::LongitudeOutOfRange {
                id: self.id,
                lng: self.lng,
            });
        }

        Ok(Point::new(self.id, self.lat, self.lng, self.category))
    }
}

/// How a marker is drawn
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct MarkerStyle {
    pub fill_color: &'static str,
    pub stroke_color: &'static str,
    pub radius: f32,
    pub weight: f32,
    pub opacity: f32,
    pub fill_opacity: f32,
}

impl MarkerStyle {
    pub const RED_FILL: &'static str = "#ff4444";
    pub const GREEN_FILL: &'static str = "#44ff44";

    pub fn for_category(category: Category) -> Self {
        let fill_color = match category {
            Category::Red => Self::RED_FILL,
            Category::Green => Self::GREEN_FILL,
        };

        Self {
            fill_color,
            stroke_color: "#000000",
            radius: 4.0,
            weight: 1.0,
            opacity: 1.0,
            fill_opacity: 0.8,
        }
    }
}
