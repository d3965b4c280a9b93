//! The benchmark record schema and the synthetic record generator

use anyhow::{Context, Result, anyhow};
use chrono::{NaiveDateTime, SubsecRound, Utc};
use rand::distr::Alphanumeric;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use uuid::Uuid;

use crate::config::{DEFAULT_MAX_RECORD_BYTES, DEFAULT_MIN_RECORD_BYTES, MAX_FILLER_ITEMS};

/// Column names in declared order. Staged artifact headers, COPY column lists
/// and batch INSERT statements all use this order.
pub const COLUMNS: [&str; 15] = [
    "id",
    "worker_id",
    "connection_id",
    "sequence_no",
    "created_at",
    "customer_id",
    "product_id",
    "order_id",
    "category",
    "status",
    "is_active",
    "is_priority",
    "amount",
    "description",
    "payload",
];

/// Text representation of `created_at` in staged rows
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.6f";

// Sparsity of the nullable cross-references. Each is drawn independently.
const CUSTOMER_NULL_PROBABILITY: f64 = 0.10;
const PRODUCT_NULL_PROBABILITY: f64 = 0.20;
const ORDER_NULL_PROBABILITY: f64 = 0.30;

const ACTIVE_PROBABILITY: f64 = 0.9;
const PRIORITY_PROBABILITY: f64 = 0.15;

const CATEGORIES: [&str; 6] = [
    "electronics",
    "books",
    "garden",
    "toys",
    "grocery",
    "apparel",
];
const STATUSES: [&str; 5] = ["pending", "paid", "shipped", "delivered", "returned"];

// Free-text fragments. Several carry commas, quotes or line breaks so staged
// rows exercise CSV quoting.
const DESCRIPTION_FRAGMENTS: [&str; 8] = [
    "Ships in 2-3 business days",
    "Customer asked for \"gift wrap\", no invoice",
    "Fragile, handle with care",
    "Back-ordered item\nexpected restock next week",
    "Promo code \"SPRING24\" applied",
    "Delivered to side door, signed by neighbour",
    "Bulk order: 12 units, 3 cartons",
    "Note from warehouse:\r\n\"double-check the serial\"",
];

// Every filler item has the same serialized width, so one increment has a
// fixed cost.
const FILLER_NOTE_LEN: usize = 200;
const FILLER_TAGS: [&str; 4] = ["red", "tan", "sky", "ash"];

/// One synthetic row destined for the target table
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    pub id: Uuid,
    pub worker_id: i32,
    pub connection_id: i32,
    pub sequence_no: i64,
    pub created_at: NaiveDateTime,
    pub customer_id: Option<Uuid>,
    pub product_id: Option<Uuid>,
    pub order_id: Option<Uuid>,
    pub category: String,
    pub status: String,
    pub is_active: bool,
    pub is_priority: bool,
    pub amount: f64,
    pub description: String,
    pub payload: Value,
}

impl Record {
    /// Render the record as text fields in `COLUMNS` order. NULL is an empty field.
    pub fn to_row(&self) -> Vec<String> {
        fn opt(id: &Option<Uuid>) -> String {
            id.map(|u| u.to_string()).unwrap_or_default()
        }

        vec![
            self.id.to_string(),
            self.worker_id.to_string(),
            self.connection_id.to_string(),
            self.sequence_no.to_string(),
            self.created_at.format(TIMESTAMP_FORMAT).to_string(),
            opt(&self.customer_id),
            opt(&self.product_id),
            opt(&self.order_id),
            self.category.clone(),
            self.status.clone(),
            self.is_active.to_string(),
            self.is_priority.to_string(),
            self.amount.to_string(),
            self.description.clone(),
            self.payload.to_string(),
        ]
    }

    /// Parse a row produced by [`Record::to_row`]
    #[cfg_attr(not(test), allow(dead_code))]
    pub fn from_row<S: AsRef<str>>(fields: &[S]) -> Result<Self> {
        if fields.len() != COLUMNS.len() {
            return Err(anyhow!(
                "Expected {} fields, got {}",
                COLUMNS.len(),
                fields.len()
            ));
        }
        let field = |idx: usize| fields[idx].as_ref();
        let opt_uuid = |idx: usize| -> Result<Option<Uuid>> {
            let value = field(idx);
            if value.is_empty() {
                Ok(None)
            } else {
                Uuid::parse_str(value)
                    .map(Some)
                    .with_context(|| format!("Invalid UUID in column {}", COLUMNS[idx]))
            }
        };

        Ok(Record {
            id: Uuid::parse_str(field(0)).context("Invalid UUID in column id")?,
            worker_id: field(1).parse().context("Invalid worker_id")?,
            connection_id: field(2).parse().context("Invalid connection_id")?,
            sequence_no: field(3).parse().context("Invalid sequence_no")?,
            created_at: NaiveDateTime::parse_from_str(field(4), TIMESTAMP_FORMAT)
                .context("Invalid created_at")?,
            customer_id: opt_uuid(5)?,
            product_id: opt_uuid(6)?,
            order_id: opt_uuid(7)?,
            category: field(8).to_string(),
            status: field(9).to_string(),
            is_active: field(10).parse().context("Invalid is_active")?,
            is_priority: field(11).parse().context("Invalid is_priority")?,
            amount: field(12).parse().context("Invalid amount")?,
            description: field(13).to_string(),
            payload: serde_json::from_str(field(14)).context("Invalid payload JSON")?,
        })
    }
}

/// Size of the record's compact JSON serialization in bytes
pub fn serialized_size(record: &Record) -> usize {
    serde_json::to_vec(record).map(|v| v.len()).unwrap_or(0)
}

/// Worst-case growth of a record from appending one filler item
pub fn filler_increment_bytes() -> usize {
    let mut rng = StdRng::seed_from_u64(0);
    let item = filler_item(&mut rng, MAX_FILLER_ITEMS);
    // Every item after the first is preceded by a comma
    item.to_string().len() + 1
}

/// Largest target size the capped filler loop is guaranteed to reach
pub fn max_reachable_bytes() -> usize {
    MAX_FILLER_ITEMS * filler_increment_bytes()
}

/// Target range for the serialized size of generated records
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordSizeRange {
    pub min_bytes: usize,
    pub max_bytes: usize,
}

impl RecordSizeRange {
    pub fn new(min_bytes: usize, max_bytes: usize) -> Result<Self> {
        if min_bytes == 0 || min_bytes > max_bytes {
            anyhow::bail!(
                "Invalid record size range {}..{}: minimum must be positive and not above the maximum",
                min_bytes,
                max_bytes
            );
        }
        let reachable = max_reachable_bytes();
        if max_bytes > reachable {
            anyhow::bail!(
                "Invalid record size range {}..{}: records are capped at {} bytes",
                min_bytes,
                max_bytes,
                reachable
            );
        }
        Ok(Self {
            min_bytes,
            max_bytes,
        })
    }

    /// Expected serialized size of a record drawn from this range
    pub fn average(&self) -> usize {
        (self.min_bytes + self.max_bytes) / 2
    }
}

impl Default for RecordSizeRange {
    fn default() -> Self {
        Self {
            min_bytes: DEFAULT_MIN_RECORD_BYTES,
            max_bytes: DEFAULT_MAX_RECORD_BYTES,
        }
    }
}

/// Generates records for one worker unit
pub struct RecordGenerator {
    worker_id: i32,
    connection_id: i32,
    next_sequence: i64,
    rng: StdRng,
}

impl RecordGenerator {
    pub fn new(worker_id: i32, connection_id: i32) -> Self {
        Self::with_rng(worker_id, connection_id, StdRng::from_os_rng())
    }

    /// Deterministic generator, for tests
    #[cfg_attr(not(test), allow(dead_code))]
    pub fn with_seed(worker_id: i32, connection_id: i32, seed: u64) -> Self {
        Self::with_rng(worker_id, connection_id, StdRng::seed_from_u64(seed))
    }

    fn with_rng(worker_id: i32, connection_id: i32, rng: StdRng) -> Self {
        Self {
            worker_id,
            connection_id,
            next_sequence: 0,
            rng,
        }
    }

    /// Produce one record whose serialized size reaches a target drawn from `size`.
    ///
    /// Filler items are appended until the running size meets the target, so the
    /// result overshoots the target by less than one filler increment.
    pub fn generate(&mut self, size: RecordSizeRange) -> Record {
        let target = self.rng.random_range(size.min_bytes..=size.max_bytes);

        let mut record = self.base_record();
        let mut running = serialized_size(&record);
        let mut items = Vec::new();

        while running < target && items.len() < MAX_FILLER_ITEMS {
            let item = filler_item(&mut self.rng, items.len());
            let separator = usize::from(!items.is_empty());
            running += item.to_string().len() + separator;
            items.push(item);
        }

        record.payload["items"] = Value::Array(items);
        debug_assert_eq!(running, serialized_size(&record));
        record
    }

    fn base_record(&mut self) -> Record {
        let sequence_no = self.next_sequence;
        self.next_sequence += 1;

        let rng = &mut self.rng;
        let customer_id = (!rng.random_bool(CUSTOMER_NULL_PROBABILITY)).then(|| random_uuid(rng));
        let product_id = (!rng.random_bool(PRODUCT_NULL_PROBABILITY)).then(|| random_uuid(rng));
        let order_id = (!rng.random_bool(ORDER_NULL_PROBABILITY)).then(|| random_uuid(rng));

        let fragments = rng.random_range(1..=3);
        let description = (0..fragments)
            .map(|_| DESCRIPTION_FRAGMENTS[rng.random_range(0..DESCRIPTION_FRAGMENTS.len())])
            .collect::<Vec<_>>()
            .join("; ");

        let category = CATEGORIES[rng.random_range(0..CATEGORIES.len())].to_string();
        let cents: i64 = rng.random_range(100..1_000_000);

        Record {
            id: random_uuid(rng),
            worker_id: self.worker_id,
            connection_id: self.connection_id,
            sequence_no,
            created_at: Utc::now().naive_utc().trunc_subsecs(6),
            customer_id,
            product_id,
            order_id,
            payload: json!({
                "kind": "order",
                "currency": "USD",
                "channel": category,
                "items": [],
            }),
            category,
            status: STATUSES[rng.random_range(0..STATUSES.len())].to_string(),
            is_active: rng.random_bool(ACTIVE_PROBABILITY),
            is_priority: rng.random_bool(PRIORITY_PROBABILITY),
            amount: cents as f64 / 100.0,
            description,
        }
    }
}

fn random_uuid(rng: &mut StdRng) -> Uuid {
    uuid::Builder::from_random_bytes(rng.random()).into_uuid()
}

fn filler_item(rng: &mut StdRng, index: usize) -> Value {
    let note: String = (&mut *rng)
        .sample_iter(Alphanumeric)
        .take(FILLER_NOTE_LEN)
        .map(char::from)
        .collect();
    json!({
        "sku": format!("SKU-{:010}", index),
        "qty": rng.random_range(1..=9),
        "tag": FILLER_TAGS[rng.random_range(0..FILLER_TAGS.len())],
        "note": note,
    })
}
