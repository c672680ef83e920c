use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::sync::Arc;

use super::number::rewrite_prefix;
use super::InvoiceError;
use crate::auth::{current_user_id, AuthProvider};
use crate::clock::{self, Clock};
use crate::events::{EventBus, Signal};
use crate::store::{from_row, to_row, Direction, Query, RelationalStore, Row, Table};

pub const DEFAULT_RETENTION_DAYS: i64 = 30;

/// A stored invoice. Only the columns the desk reads are typed; the rest of
/// the document rides along in `extra`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InvoiceRecord {
    pub id: String,
    pub invoice_number: String,
    #[serde(default)]
    pub recipient_name: String,
    #[serde(with = "clock::rfc3339")]
    pub created_at: DateTime<Utc>,
    #[serde(rename = "deletedAt", default, with = "clock::rfc3339_option")]
    pub deleted_at: Option<DateTime<Utc>>,
    #[serde(rename = "deletedBy", default)]
    pub deleted_by: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Saved and binned invoices of the signed-in user.
pub struct InvoiceLedger {
    store: Arc<dyn RelationalStore>,
    auth: Arc<dyn AuthProvider>,
    bus: EventBus,
    clock: Arc<dyn Clock>,
    retention: Duration,
}

fn parse_rows(rows: Vec<Row>) -> Vec<InvoiceRecord> {
    rows.into_iter()
        .filter_map(|row| match from_row::<InvoiceRecord>(row) {
            Ok(record) => Some(record),
            Err(e) => {
                tracing::warn!("Skipping malformed invoice row: {}", e);
                None
            }
        })
        .collect()
}

impl InvoiceLedger {
    pub fn new(
        store: Arc<dyn RelationalStore>,
        auth: Arc<dyn AuthProvider>,
        bus: EventBus,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            auth,
            bus,
            clock,
            retention: Duration::days(DEFAULT_RETENTION_DAYS),
        }
    }

    pub fn with_retention(mut self, retention: Duration) -> Self {
        self.retention = retention;
        self
    }

    async fn require_user(&self) -> Result<String, InvoiceError> {
        current_user_id(self.auth.as_ref())
            .await
            .ok_or(InvoiceError::NotSignedIn)
    }

    /// Invoices not in the bin, newest first. Row visibility beyond that is
    /// the store's business.
    pub async fn saved(&self) -> Vec<InvoiceRecord> {
        if current_user_id(self.auth.as_ref()).await.is_none() {
            return Vec::new();
        }
        let query = Query::new()
            .is_null("deletedAt")
            .order_by("created_at", Direction::Descending);
        match self.store.select(Table::Invoices, &query).await {
            Ok(rows) => parse_rows(rows),
            Err(e) => {
                tracing::error!("Error fetching saved invoices: {}", e);
                Vec::new()
            }
        }
    }

    /// Invoices the user binned inside the retention window, most recently
    /// binned first.
    pub async fn deleted(&self) -> Vec<InvoiceRecord> {
        let Some(user_id) = current_user_id(self.auth.as_ref()).await else {
            return Vec::new();
        };
        let mut query = Query::new()
            .eq("deletedBy", user_id.as_str())
            .not_null("deletedAt");
        // A window reaching past the earliest representable time keeps everything.
        if let Some(cutoff) = self.clock.now().checked_sub_signed(self.retention) {
            query = query.gte("deletedAt", clock::format_timestamp(cutoff));
        }
        let query = query.order_by("deletedAt", Direction::Descending);
        match self.store.select(Table::Invoices, &query).await {
            Ok(rows) => parse_rows(rows),
            Err(e) => {
                tracing::error!("Error fetching deleted invoices for {}: {}", user_id, e);
                Vec::new()
            }
        }
    }

    pub async fn create(
        &self,
        recipient_name: &str,
        invoice_number: &str,
        extra: Map<String, Value>,
    ) -> Result<InvoiceRecord, InvoiceError> {
        self.require_user().await?;
        let record = InvoiceRecord {
            id: uuid::Uuid::new_v4().to_string(),
            invoice_number: invoice_number.to_string(),
            recipient_name: recipient_name.to_string(),
            created_at: self.clock.now(),
            deleted_at: None,
            deleted_by: None,
            extra,
        };
        self.store
            .insert(Table::Invoices, vec![to_row(&record)?])
            .await?;

        tracing::info!("Saved invoice {} ({})", record.invoice_number, record.id);
        self.bus.emit(Signal::InvoicesUpdated);
        Ok(record)
    }

    /// Move an invoice to the bin.
    pub async fn bin(&self, id: &str) -> Result<(), InvoiceError> {
        let user_id = self.require_user().await?;
        let mut patch = Row::new();
        patch.insert(
            "deletedAt".to_string(),
            json!(clock::format_timestamp(self.clock.now())),
        );
        patch.insert("deletedBy".to_string(), json!(user_id));

        let query = Query::new().eq("id", id).is_null("deletedAt");
        if self.store.update(Table::Invoices, &query, patch).await? == 0 {
            return Err(InvoiceError::NotFound(id.to_string()));
        }
        self.bus.emit(Signal::InvoicesUpdated);
        Ok(())
    }

    /// Rename the recipient and rewrite the invoice number's prefix to match.
    pub async fn rename_recipient(
        &self,
        id: &str,
        name: &str,
    ) -> Result<InvoiceRecord, InvoiceError> {
        self.require_user().await?;
        let rows = self
            .store
            .select(Table::Invoices, &Query::new().eq("id", id))
            .await?;
        let Some(row) = rows.into_iter().next() else {
            return Err(InvoiceError::NotFound(id.to_string()));
        };
        let mut record: InvoiceRecord = from_row(row)?;

        let renumbered = rewrite_prefix(&record.invoice_number, name);
        let mut patch = Row::new();
        patch.insert("recipient_name".to_string(), json!(name));
        patch.insert("invoice_number".to_string(), json!(renumbered));
        self.store
            .update(Table::Invoices, &Query::new().eq("id", id), patch)
            .await?;

        tracing::info!(
            "Invoice {} renumbered {} -> {}",
            id,
            record.invoice_number,
            renumbered
        );
        record.recipient_name = name.to_string();
        record.invoice_number = renumbered;
        self.bus.emit(Signal::InvoicesUpdated);
        Ok(record)
    }
}
