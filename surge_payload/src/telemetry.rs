//! Gateway telemetry payload.
//!
//! Two event categories are produced, device geolocation fixes and gateway
//! statistics, each in one of two encodings. A `dict` message is one document
//! whose measures are a single self-describing record. An `array` message is
//! a JSON list of `batch_size` documents, each carrying its measures as a flat
//! positional array of values. The category and encoding together select the
//! topic.

use std::num::NonZeroU32;

use bytes::Bytes;
use rand::Rng;
use serde::Deserialize;
use time::{OffsetDateTime, format_description::BorrowedFormatItem, macros::format_description};

use crate::{
    Error, Message,
    device::{self, Pool},
};

const GATEWAY_ID: &str = "TID-GWID-436521";
const TIMESTAMP_FORMAT: &[BorrowedFormatItem<'static>] =
    format_description!("[year]-[month]-[day]T[hour]:[minute]:[second].[subsecond digits:3]Z");

/// The event category of a message.
#[derive(Debug, Deserialize, serde::Serialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Category {
    /// A device position fix
    Geolocation,
    /// Gateway connectivity and battery statistics
    GatewayStatistics,
}

impl Category {
    /// The `detail-type` this category is reported as.
    #[must_use]
    pub fn detail_type(self) -> &'static str {
        match self {
            Category::Geolocation => "geolocation",
            Category::GatewayStatistics => "gwCDMStatistics",
        }
    }
}

/// The encoding shape of a message's measures.
#[derive(Debug, Deserialize, serde::Serialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Shape {
    /// One document, one record with named fields
    Dict,
    /// A batch of documents, each with field values in a fixed order
    Array,
}

/// Either a random pick per message or a fixed value.
#[derive(Debug, Deserialize, serde::Serialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum Choice<T> {
    /// Pick uniformly at random for every message
    #[default]
    Random,
    /// Always use the given value
    Fixed(T),
}

impl Choice<Category> {
    fn pick<R>(self, rng: &mut R) -> Category
    where
        R: Rng + ?Sized,
    {
        match self {
            Choice::Fixed(c) => c,
            Choice::Random if rng.random() => Category::Geolocation,
            Choice::Random => Category::GatewayStatistics,
        }
    }
}

impl Choice<Shape> {
    fn pick<R>(self, rng: &mut R) -> Shape
    where
        R: Rng + ?Sized,
    {
        match self {
            Choice::Fixed(s) => s,
            Choice::Random if rng.random() => Shape::Dict,
            Choice::Random => Shape::Array,
        }
    }
}

fn default_device_count() -> NonZeroU32 {
    NonZeroU32::new(10).unwrap_or(NonZeroU32::MIN)
}

fn default_batch_size() -> NonZeroU32 {
    NonZeroU32::MIN
}

fn default_root_topic() -> String {
    "testmapper/".to_string()
}

/// Configuration for the `Telemetry` payload generator.
#[derive(Debug, Deserialize, serde::Serialize, Clone, PartialEq)]
#[serde(deny_unknown_fields, default)]
pub struct Config {
    /// The number of distinct devices messages are attributed to.
    pub device_count: NonZeroU32,
    /// How devices are picked from the pool.
    pub device_selection: device::Selection,
    /// The event category of each message.
    pub category: Choice<Category>,
    /// The encoding shape of each message.
    pub shape: Choice<Shape>,
    /// The number of documents in one `array` message.
    pub batch_size: NonZeroU32,
    /// The prefix every topic starts with.
    pub root_topic: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            device_count: default_device_count(),
            device_selection: device::Selection::default(),
            category: Choice::Random,
            shape: Choice::Random,
            batch_size: default_batch_size(),
            root_topic: default_root_topic(),
        }
    }
}

/// The topic for a given category and shape.
#[must_use]
pub fn topic(root: &str, category: Category, shape: Shape) -> String {
    let suffix = match (category, shape) {
        (Category::Geolocation, Shape::Dict) => "geodict",
        (Category::Geolocation, Shape::Array) => "geoarray",
        (Category::GatewayStatistics, Shape::Dict) => "gwdict",
        (Category::GatewayStatistics, Shape::Array) => "gwarray",
    };
    format!("{root}{suffix}")
}

#[derive(Debug, serde::Serialize)]
struct GeoRecord<'a> {
    latitude: f64,
    longitude: f64,
    elevation: f64,
    accuracy: f64,
    origin: &'static str,
    gatewayidentifier: &'static str,
    #[serde(rename = "_time")]
    time: &'a str,
}

#[derive(Debug, serde::Serialize)]
struct GeoValues<'a>(f64, f64, f64, f64, &'static str, &'static str, &'a str);

#[derive(Debug, serde::Serialize)]
struct StatRecord<'a> {
    #[serde(rename = "tmsDvcTot")]
    tms_dvc_tot: u32,
    #[serde(rename = "cntApplicTot")]
    cnt_applic_tot: u32,
    #[serde(rename = "cntCldCnctsPerDay")]
    cnt_cld_cncts_per_day: u32,
    #[serde(rename = "enmCellTech")]
    enm_cell_tech: &'static str,
    #[serde(rename = "cntBattPlugged")]
    cnt_batt_plugged: u32,
    #[serde(rename = "cntBattLower10")]
    cnt_batt_lower10: u32,
    #[serde(rename = "isBattHealthy")]
    is_batt_healthy: &'static str,
    #[serde(rename = "_time")]
    time: &'a str,
}

#[derive(Debug, serde::Serialize)]
struct StatValues<'a>(u32, u32, u32, &'static str, u32, u32, &'static str, &'a str);

#[derive(Debug, serde::Serialize)]
#[serde(untagged)]
enum Measures<'a> {
    GeoRecord([GeoRecord<'a>; 1]),
    GeoValues(GeoValues<'a>),
    StatRecord([StatRecord<'a>; 1]),
    StatValues(StatValues<'a>),
}

#[derive(Debug, serde::Serialize)]
#[serde(rename_all = "camelCase")]
struct Detail<'a> {
    sensor_alternate_id: &'a str,
    capability_alternate_id: &'static str,
    measures: Measures<'a>,
}

#[derive(Debug, serde::Serialize)]
struct Member<'a> {
    version: &'static str,
    id: &'a str,
    #[serde(rename = "detail-type")]
    detail_type: &'static str,
    source: &'static str,
    account: &'static str,
    time: &'a str,
    region: &'static str,
    detail: Detail<'a>,
}

fn measures<'a, R>(rng: &mut R, category: Category, shape: Shape, time: &'a str) -> Measures<'a>
where
    R: Rng + ?Sized,
{
    match category {
        Category::Geolocation => {
            let latitude = rng.random_range(-90.0..=90.0);
            let longitude = rng.random_range(-180.0..=180.0);
            let elevation = rng.random_range(0.0..=1000.0);
            let accuracy = (rng.random_range(0.0..=10.0_f64) * 100.0).round() / 100.0;
            match shape {
                Shape::Dict => Measures::GeoRecord([GeoRecord {
                    latitude,
                    longitude,
                    elevation,
                    accuracy,
                    origin: "gps",
                    gatewayidentifier: GATEWAY_ID,
                    time,
                }]),
                Shape::Array => Measures::GeoValues(GeoValues(
                    latitude, longitude, elevation, accuracy, "gps", GATEWAY_ID, time,
                )),
            }
        }
        Category::GatewayStatistics => {
            let tms_dvc_tot = rng.random_range(0..=1_108_972);
            let cnt_applic_tot = rng.random_range(0..=6_258);
            let cnt_cld_cncts_per_day = rng.random_range(0..=50);
            let cnt_batt_plugged = rng.random_range(50..=500);
            let cnt_batt_lower10 = rng.random_range(0..=20);
            match shape {
                Shape::Dict => Measures::StatRecord([StatRecord {
                    tms_dvc_tot,
                    cnt_applic_tot,
                    cnt_cld_cncts_per_day,
                    enm_cell_tech: "lteCatM1",
                    cnt_batt_plugged,
                    cnt_batt_lower10,
                    is_batt_healthy: "true",
                    time,
                }]),
                Shape::Array => Measures::StatValues(StatValues(
                    tms_dvc_tot,
                    cnt_applic_tot,
                    cnt_cld_cncts_per_day,
                    "lteCatM1",
                    cnt_batt_plugged,
                    cnt_batt_lower10,
                    "true",
                    time,
                )),
            }
        }
    }
}

fn document<'a, R>(
    rng: &mut R,
    id: &'a str,
    category: Category,
    shape: Shape,
    time: &'a str,
) -> Member<'a>
where
    R: Rng + ?Sized,
{
    Member {
        version: "0",
        id,
        detail_type: category.detail_type(),
        source: "myapp.orders",
        account: "123451235123",
        time,
        region: "us-west-1",
        detail: Detail {
            sensor_alternate_id: id,
            capability_alternate_id: category.detail_type(),
            measures: measures(rng, category, shape, time),
        },
    }
}

#[derive(Debug)]
/// Telemetry payload generator
pub struct Telemetry {
    devices: Pool,
    category: Choice<Category>,
    shape: Choice<Shape>,
    batch_size: NonZeroU32,
    root_topic: String,
}

impl Telemetry {
    /// Create a new instance of `Telemetry`
    #[must_use]
    pub fn new(config: &Config) -> Self {
        Self {
            devices: Pool::new(config.device_count, config.device_selection),
            category: config.category,
            shape: config.shape,
            batch_size: config.batch_size,
            root_topic: config.root_topic.clone(),
        }
    }

    /// Build the next message, stamped with the current UTC time.
    ///
    /// # Errors
    ///
    /// Function will error if the timestamp cannot be formatted or the
    /// payload cannot be encoded.
    pub fn next_message<R>(&mut self, rng: &mut R) -> Result<Message, Error>
    where
        R: Rng + ?Sized,
    {
        self.message_at(rng, OffsetDateTime::now_utc())
    }

    fn message_at<R>(&mut self, rng: &mut R, now: OffsetDateTime) -> Result<Message, Error>
    where
        R: Rng + ?Sized,
    {
        let category = self.category.pick(rng);
        let shape = self.shape.pick(rng);
        let time = now.format(TIMESTAMP_FORMAT)?;

        let payload = match shape {
            Shape::Dict => {
                let id = self.devices.next(rng);
                serde_json::to_vec(&document(rng, id, category, shape, &time))?
            }
            Shape::Array => {
                let ids: Vec<String> = (0..self.batch_size.get())
                    .map(|_| self.devices.next(rng).to_owned())
                    .collect();
                let batch: Vec<Member<'_>> = ids
                    .iter()
                    .map(|id| document(rng, id, category, shape, &time))
                    .collect();
                serde_json::to_vec(&batch)?
            }
        };

        Ok(Message {
            topic: topic(&self.root_topic, category, shape),
            payload: Bytes::from(payload),
        })
    }
}
