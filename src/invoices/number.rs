use chrono::NaiveDate;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

pub const DEFAULT_PREFIX: &str = "CUST";
const PREFIX_LEN: usize = 4;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum ParseInvoiceNumberError {
    #[error("expected PREFIX-DATEKEY-SERIAL, got {0:?}")]
    Shape(String),

    #[error("date key must be 8 digits: {0:?}")]
    DateKey(String),

    #[error("serial must be numeric: {0:?}")]
    Serial(String),
}

/// `PREFIX-YYYYMMDD-SERIAL` with the serial zero-padded to four digits.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct InvoiceNumber {
    pub prefix: String,
    pub date_key: String,
    pub serial: u32,
}

impl InvoiceNumber {
    pub fn new(prefix: impl Into<String>, date: NaiveDate, serial: u32) -> Self {
        Self {
            prefix: prefix.into(),
            date_key: date_key(date),
            serial,
        }
    }
}

impl fmt::Display for InvoiceNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}-{:04}", self.prefix, self.date_key, self.serial)
    }
}

impl FromStr for InvoiceNumber {
    type Err = ParseInvoiceNumberError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.split('-').collect();
        let [prefix, date_key, serial] = parts.as_slice() else {
            return Err(ParseInvoiceNumberError::Shape(s.to_string()));
        };
        if date_key.len() != 8 || !date_key.bytes().all(|b| b.is_ascii_digit()) {
            return Err(ParseInvoiceNumberError::DateKey(date_key.to_string()));
        }
        let serial = serial
            .parse()
            .map_err(|_| ParseInvoiceNumberError::Serial(serial.to_string()))?;

        Ok(Self {
            prefix: prefix.to_string(),
            date_key: date_key.to_string(),
            serial,
        })
    }
}

/// First four characters of the trimmed name, uppercased; `CUST` when blank.
///
/// Characters are taken before uppercasing, so letters that uppercase to
/// several (`ß` to `SS`) lengthen the prefix, and a `-` in the name is kept.
pub fn customer_prefix(name: &str) -> String {
    let trimmed = name.trim();
    if trimmed.is_empty() {
        return DEFAULT_PREFIX.to_string();
    }
    trimmed
        .chars()
        .take(PREFIX_LEN)
        .collect::<String>()
        .to_uppercase()
}

pub fn date_key(date: NaiveDate) -> String {
    date.format("%Y%m%d").to_string()
}

/// Swap the prefix of `current` for one derived from `new_name`.
///
/// Anything that is not three `-`separated parts, or a blank name, comes
/// back unchanged.
pub fn rewrite_prefix(current: &str, new_name: &str) -> String {
    if current.is_empty() || new_name.trim().is_empty() {
        return current.to_string();
    }
    let prefix = customer_prefix(new_name);
    let mut parts: Vec<&str> = current.split('-').collect();
    if parts.len() != 3 {
        return current.to_string();
    }
    parts[0] = &prefix;
    parts.join("-")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_customer_prefix() {
        assert_eq!(customer_prefix("Jo"), "JO");
        assert_eq!(customer_prefix("  acme corp "), "ACME");
        assert_eq!(customer_prefix("Jo Smith"), "JO S");
        assert_eq!(customer_prefix("   "), "CUST");
        assert_eq!(customer_prefix(""), "CUST");
        assert_eq!(customer_prefix("Éclair Ltd"), "ÉCLA");
    }

    #[test]
    fn test_prefix_keeps_unusual_characters() {
        assert_eq!(customer_prefix("ßabc"), "SSABC");
        assert_eq!(customer_prefix("A-1 Plumbing"), "A-1 ");

        let number = format!("{}-20240315-0001", customer_prefix("A-1 Plumbing"));
        assert_eq!(number, "A-1 -20240315-0001");
        assert!(number.parse::<InvoiceNumber>().is_err());
        assert_eq!(rewrite_prefix(&number, "Beta"), number);
    }

    #[test]
    fn test_display_pads_serial() {
        let date = NaiveDate::from_ymd_opt(2024, 1, 1).unwrap();
        assert_eq!(InvoiceNumber::new("JO", date, 1).to_string(), "JO-20240101-0001");
        assert_eq!(InvoiceNumber::new("ACME", date, 4321).to_string(), "ACME-20240101-4321");
    }

    #[test]
    fn test_parse() {
        let number: InvoiceNumber = "ACME-20240101-0007".parse().unwrap();
        assert_eq!(number.prefix, "ACME");
        assert_eq!(number.date_key, "20240101");
        assert_eq!(number.serial, 7);
        assert_eq!(number.to_string(), "ACME-20240101-0007");

        assert!(matches!(
            "bad-format".parse::<InvoiceNumber>(),
            Err(ParseInvoiceNumberError::Shape(_))
        ));
        assert!(matches!(
            "A-2024-0001".parse::<InvoiceNumber>(),
            Err(ParseInvoiceNumberError::DateKey(_))
        ));
        assert!(matches!(
            "A-20240101-x1".parse::<InvoiceNumber>(),
            Err(ParseInvoiceNumberError::Serial(_))
        ));
    }

    #[test]
    fn test_rewrite_prefix() {
        assert_eq!(rewrite_prefix("ACME-20240101-0007", "Beta Corp"), "BETA-20240101-0007");
        assert_eq!(rewrite_prefix("bad-format", "X"), "bad-format");
        assert_eq!(rewrite_prefix("A-B-C-D", "X"), "A-B-C-D");
        assert_eq!(rewrite_prefix("ACME-20240101-0007", ""), "ACME-20240101-0007");
        assert_eq!(rewrite_prefix("ACME-20240101-0007", "  "), "ACME-20240101-0007");
        assert_eq!(rewrite_prefix("", "Beta"), "");
    }
}
