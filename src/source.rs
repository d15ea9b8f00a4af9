// 🔌 Source Types - the four upstream systems the warehouse pulls from

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

// ============================================================================
// SOURCE
// ============================================================================

/// Source - which upstream API a record came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Source {
    /// Point of sale (cafe and market stand payments)
    Square,
    /// Accounting (wholesale invoices)
    Quickbooks,
    /// E-commerce (web store orders)
    Shopify,
    /// Roasting operations (roast batches)
    Cropster,
}

impl Source {
    pub const ALL: [Source; 4] = [
        Source::Square,
        Source::Quickbooks,
        Source::Shopify,
        Source::Cropster,
    ];

    /// Human-readable name for display
    pub fn name(&self) -> &'static str {
        match self {
            Source::Square => "Square",
            Source::Quickbooks => "QuickBooks",
            Source::Shopify => "Shopify",
            Source::Cropster => "Cropster",
        }
    }

    /// Stable code used in the database and config keys
    pub fn code(&self) -> &'static str {
        match self {
            Source::Square => "square",
            Source::Quickbooks => "quickbooks",
            Source::Shopify => "shopify",
            Source::Cropster => "cropster",
        }
    }

    /// What kind of business document this source produces
    pub fn record_kind(&self) -> RecordKind {
        match self {
            Source::Square => RecordKind::Sale,
            Source::Quickbooks => RecordKind::Invoice,
            Source::Shopify => RecordKind::Order,
            Source::Cropster => RecordKind::Roast,
        }
    }
}

impl fmt::Display for Source {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

impl FromStr for Source {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "square" => Ok(Source::Square),
            "quickbooks" | "qb" => Ok(Source::Quickbooks),
            "shopify" => Ok(Source::Shopify),
            "cropster" => Ok(Source::Cropster),
            other => Err(format!("Unknown source: {}", other)),
        }
    }
}

// ============================================================================
// RECORD KIND
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecordKind {
    Sale,
    Invoice,
    Order,
    Roast,
}

impl RecordKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecordKind::Sale => "sale",
            RecordKind::Invoice => "invoice",
            RecordKind::Order => "order",
            RecordKind::Roast => "roast",
        }
    }
}

impl FromStr for RecordKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "sale" => Ok(RecordKind::Sale),
            "invoice" => Ok(RecordKind::Invoice),
            "order" => Ok(RecordKind::Order),
            "roast" => Ok(RecordKind::Roast),
            other => Err(format!("Unknown record kind: {}", other)),
        }
    }
}
