//! Invoice numbering and the saved/binned invoice ledger.

mod allocator;
mod ledger;
mod number;

use thiserror::Error;

use crate::store::StoreError;

pub use allocator::{Allocation, InvoiceNumberAllocator, SerialSource};
pub use ledger::{InvoiceLedger, InvoiceRecord, DEFAULT_RETENTION_DAYS};
pub use number::{
    customer_prefix, date_key, rewrite_prefix, InvoiceNumber, ParseInvoiceNumberError,
    DEFAULT_PREFIX,
};

#[derive(Error, Debug)]
pub enum InvoiceError {
    #[error("No signed-in user")]
    NotSignedIn,

    #[error("Invoice not found: {0}")]
    NotFound(String),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),
}
