use rand::Rng;
use std::ops::RangeInclusive;
use std::sync::Arc;

use super::number::{customer_prefix, date_key, rewrite_prefix, InvoiceNumber};
use crate::clock::Clock;
use crate::store::RelationalStore;

const FALLBACK_SERIALS: RangeInclusive<u32> = 1000..=9999;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SerialSource {
    /// Issued by the store's atomic counter; unique per prefix and day.
    Counter,
    /// Random; may collide with another number.
    Fallback,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Allocation {
    pub number: InvoiceNumber,
    pub source: SerialSource,
}

pub struct InvoiceNumberAllocator {
    store: Arc<dyn RelationalStore>,
    clock: Arc<dyn Clock>,
}

impl InvoiceNumberAllocator {
    pub fn new(store: Arc<dyn RelationalStore>, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    /// Allocate the next number for `recipient` on today's date.
    ///
    /// Uniqueness comes from the store's counter. If the counter is down the
    /// serial is random and the allocation says so.
    pub async fn generate(&self, recipient: &str) -> Allocation {
        let prefix = customer_prefix(recipient);
        let date_key = date_key(self.clock.today());

        let counted = match self.store.next_invoice_serial(&prefix, &date_key).await {
            Ok(0) => {
                tracing::warn!("Serial counter returned 0 for {}-{}", prefix, date_key);
                None
            }
            Ok(serial) => Some(serial),
            Err(e) => {
                tracing::warn!("Serial counter unavailable for {}-{}: {}", prefix, date_key, e);
                None
            }
        };

        let (serial, source) = match counted {
            Some(serial) => (serial, SerialSource::Counter),
            None => {
                let serial = rand::thread_rng().gen_range(FALLBACK_SERIALS);
                tracing::warn!(
                    "Using random serial {:04} for {}-{}; it may collide with another invoice",
                    serial,
                    prefix,
                    date_key
                );
                (serial, SerialSource::Fallback)
            }
        };

        Allocation {
            number: InvoiceNumber {
                prefix,
                date_key,
                serial,
            },
            source,
        }
    }

    pub fn rewrite_prefix(current: &str, new_name: &str) -> String {
        rewrite_prefix(current, new_name)
    }
}
