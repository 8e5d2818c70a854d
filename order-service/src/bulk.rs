use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use csv::{ByteRecord, ReaderBuilder, WriterBuilder};
use shared::bus::EventPublisher;
use shared::inventory::{InventoryError, ReservationService};
use shared::retry::{Message, MessageHandler};
use shared::BulkIngestionJob;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tracing::{error, info, warn};

use crate::blob::BlobStore;
use crate::intake::announce_created;
use crate::models::{OrderRequest, ValidationError};
use crate::store::OrderStore;

/// Uploads are read into memory whole; anything bigger fails the job.
pub const DEFAULT_MAX_OBJECT_BYTES: u64 = 64 * 1024 * 1024;

const REQUIRED_COLUMNS: [&str; 5] = ["tenant_id", "seller_id", "hub_id", "sku_id", "quantity"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BulkReport {
    pub total: usize,
    pub accepted: usize,
    pub rejected: usize,
    /// Key of the sidecar holding rejected rows, when one was written.
    pub error_key: Option<String>,
}

#[derive(Debug, Error)]
enum RowRejection {
    #[error(transparent)]
    Invalid(#[from] ValidationError),
    #[error(transparent)]
    Inventory(#[from] InventoryError),
    #[error("persist failed: {0:#}")]
    Persistence(anyhow::Error),
    #[error("publish failed: {0:#}")]
    Publish(anyhow::Error),
}

struct Columns {
    tenant_id: usize,
    seller_id: usize,
    hub_id: usize,
    sku_id: usize,
    quantity: usize,
}

impl Columns {
    fn from_header(header: &ByteRecord) -> Result<Self> {
        let index: HashMap<String, usize> = header
            .iter()
            .enumerate()
            .map(|(i, name)| (String::from_utf8_lossy(name).trim().to_string(), i))
            .collect();

        let missing: Vec<&str> = REQUIRED_COLUMNS
            .iter()
            .copied()
            .filter(|c| !index.contains_key(*c))
            .collect();
        if !missing.is_empty() {
            anyhow::bail!("header is missing required columns: {}", missing.join(", "));
        }

        Ok(Self {
            tenant_id: index["tenant_id"],
            seller_id: index["seller_id"],
            hub_id: index["hub_id"],
            sku_id: index["sku_id"],
            quantity: index["quantity"],
        })
    }

    fn field(record: &ByteRecord, index: usize, name: &'static str) -> Result<String, ValidationError> {
        let raw = record.get(index).unwrap_or_default();
        std::str::from_utf8(raw)
            .map(|s| s.trim().to_string())
            .map_err(|_| ValidationError::Encoding(name))
    }

    fn parse(&self, record: &ByteRecord) -> Result<OrderRequest, ValidationError> {
        let quantity = Self::field(record, self.quantity, "quantity")?;
        let request = OrderRequest {
            tenant_id: Self::field(record, self.tenant_id, "tenant_id")?,
            seller_id: Self::field(record, self.seller_id, "seller_id")?,
            hub_id: Self::field(record, self.hub_id, "hub_id")?,
            sku_id: Self::field(record, self.sku_id, "sku_id")?,
            quantity: quantity
                .parse()
                .map_err(|_| ValidationError::NonNumericQuantity(quantity.clone()))?,
        };
        request.validate()?;
        Ok(request)
    }
}

/// Turns an uploaded CSV into `on_hold` orders, one row at a time.
///
/// Rows are independent: a bad row is set aside in an error sidecar next to
/// the upload and never stops the batch. Stock is not touched here; the
/// finalizer reserves it when it sees the `order.created` event.
pub struct BulkWorker {
    blobs: Arc<dyn BlobStore>,
    store: Arc<dyn OrderStore>,
    publisher: Arc<dyn EventPublisher>,
    inventory: Option<ReservationService>,
    created_topic: String,
    max_object_bytes: u64,
}

impl BulkWorker {
    pub fn new(
        blobs: Arc<dyn BlobStore>,
        store: Arc<dyn OrderStore>,
        publisher: Arc<dyn EventPublisher>,
        created_topic: impl Into<String>,
    ) -> Self {
        Self {
            blobs,
            store,
            publisher,
            inventory: None,
            created_topic: created_topic.into(),
            max_object_bytes: DEFAULT_MAX_OBJECT_BYTES,
        }
    }

    pub fn max_object_bytes(mut self, max_bytes: u64) -> Self {
        self.max_object_bytes = max_bytes;
        self
    }

    /// Rejects rows whose hub/SKU does not resolve to exactly one inventory record.
    pub fn verify_inventory(mut self, reservations: ReservationService) -> Self {
        self.inventory = Some(reservations);
        self
    }

    pub async fn ingest(&self, job: &BulkIngestionJob) -> Result<BulkReport> {
        let body = self
            .blobs
            .get(&job.bucket, &job.key, self.max_object_bytes)
            .await
            .with_context(|| format!("cannot fetch {}/{}", job.bucket, job.key))?;

        let mut reader = ReaderBuilder::new()
            .has_headers(true)
            .flexible(true)
            .from_reader(body.as_slice());

        let header = reader
            .byte_headers()
            .with_context(|| format!("cannot read header of {}", job.key))?
            .clone();
        let columns = Columns::from_header(&header).with_context(|| format!("rejecting {}", job.key))?;

        let mut total = 0;
        let mut rejected = Vec::new();
        for record in reader.byte_records() {
            let record = record.with_context(|| format!("cannot read rows of {}", job.key))?;
            total += 1;

            if let Err(reason) = self.ingest_row(&columns, &record).await {
                warn!(key = %job.key, row = total, "Rejected row: {}", reason);
                rejected.push(record);
            }
        }

        let error_key = if rejected.is_empty() {
            None
        } else {
            self.write_sidecar(job, &header, &rejected).await
        };

        let report = BulkReport {
            total,
            accepted: total - rejected.len(),
            rejected: rejected.len(),
            error_key,
        };
        info!(
            bucket = %job.bucket,
            key = %job.key,
            total = report.total,
            accepted = report.accepted,
            rejected = report.rejected,
            "Bulk file processed"
        );
        Ok(report)
    }

    async fn ingest_row(&self, columns: &Columns, record: &ByteRecord) -> Result<(), RowRejection> {
        let request = columns.parse(record)?;

        if let Some(reservations) = &self.inventory {
            reservations.snapshot(&request.hub_id, &request.sku_id).await?;
        }

        let order = self
            .store
            .insert(request.into_new_order(Utc::now()))
            .await
            .map_err(RowRejection::Persistence)?;

        announce_created(self.publisher.as_ref(), &self.created_topic, &order)
            .await
            .map_err(RowRejection::Publish)
    }

    async fn write_sidecar(
        &self,
        job: &BulkIngestionJob,
        header: &ByteRecord,
        rows: &[ByteRecord],
    ) -> Option<String> {
        let key = sidecar_key(&job.key, Utc::now().timestamp());

        let body = match render_rows(header, rows) {
            Ok(body) => body,
            Err(e) => {
                error!(key = %key, "Error rendering rejected rows: {:#}", e);
                return None;
            }
        };

        match self.blobs.put(&job.bucket, &key, body).await {
            Ok(()) => {
                info!(bucket = %job.bucket, key = %key, rows = rows.len(), "Wrote rejected rows");
                Some(key)
            }
            Err(e) => {
                error!(bucket = %job.bucket, key = %key, "Error writing rejected rows: {:#}", e);
                None
            }
        }
    }
}

/// `errors/<file name of key>-<unix seconds>.csv`
pub fn sidecar_key(key: &str, unix_secs: i64) -> String {
    let base = key.rsplit('/').next().unwrap_or(key);
    format!("errors/{}-{}.csv", base, unix_secs)
}

fn render_rows(header: &ByteRecord, rows: &[ByteRecord]) -> Result<Vec<u8>> {
    let mut writer = WriterBuilder::new().flexible(true).from_writer(Vec::new());
    writer.write_byte_record(header)?;
    for row in rows {
        writer.write_byte_record(row)?;
    }
    writer
        .into_inner()
        .map_err(|e| anyhow::anyhow!("Failed to flush rejected rows: {}", e.error()))
}

#[async_trait]
impl MessageHandler for BulkWorker {
    async fn process(&self, message: &Message) -> Result<()> {
        let job: BulkIngestionJob =
            serde_json::from_slice(&message.payload).context("undecodable bulk ingestion job")?;
        self.ingest(&job).await?;
        Ok(())
    }
}
