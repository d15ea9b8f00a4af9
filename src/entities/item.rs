// ☕ Item Entity - canonical SKU with cross-source identifiers
//
// One row per sellable thing: "Ethiopia Guji / 12oz whole bean", "Latte",
// "Logo Mug". The item_id is stable (the zolo_id of the reference sheet);
// every source names the same product differently and those names map here.

use crate::error::{EtlError, Result};
use crate::source::Source;
use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::str::FromStr;

// ============================================================================
// ITEM FORM
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemForm {
    WholeBean,
    Ground,
    /// Prepared in the cafe (espresso, drip, milk drinks)
    Drink,
    Merchandise,
    Other,
}

impl ItemForm {
    pub fn as_str(&self) -> &'static str {
        match self {
            ItemForm::WholeBean => "whole_bean",
            ItemForm::Ground => "ground",
            ItemForm::Drink => "drink",
            ItemForm::Merchandise => "merchandise",
            ItemForm::Other => "other",
        }
    }

    /// Coffee sold by weight, as opposed to drinks and merchandise
    pub fn is_packaged_coffee(&self) -> bool {
        matches!(self, ItemForm::WholeBean | ItemForm::Ground)
    }
}

impl FromStr for ItemForm {
    type Err = std::convert::Infallible;

    /// Lenient: the reference sheet is maintained by hand
    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let normalized = s.trim().to_lowercase().replace(['-', ' '], "_");
        Ok(match normalized.as_str() {
            "whole_bean" | "wholebean" | "bean" | "beans" | "whole" => ItemForm::WholeBean,
            "ground" | "grind" => ItemForm::Ground,
            "drink" | "beverage" | "bar" => ItemForm::Drink,
            "merchandise" | "merch" | "retail" => ItemForm::Merchandise,
            _ => ItemForm::Other,
        })
    }
}

// ============================================================================
// ITEM ENTITY
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Item {
    pub item_id: i64,
    pub product_name: String,
    pub variant_name: Option<String>,
    pub category_name: Option<String>,
    pub form: ItemForm,
    /// Package weight in pounds, for coffee sold by the bag
    pub weight_lb: Option<f64>,
    pub profile_id: Option<i64>,

    // Per-source product identifiers
    pub square_id: Option<String>,
    pub quickbooks_id: Option<String>,
    pub shopify_id: Option<String>,
    pub cropster_id: Option<String>,
}

impl Item {
    pub fn new(item_id: i64, product_name: &str) -> Self {
        Item {
            item_id,
            product_name: product_name.to_string(),
            variant_name: None,
            category_name: None,
            form: ItemForm::Other,
            weight_lb: None,
            profile_id: None,
            square_id: None,
            quickbooks_id: None,
            shopify_id: None,
            cropster_id: None,
        }
    }

    pub fn with_variant(mut self, variant: &str) -> Self {
        self.variant_name = Some(variant.to_string());
        self
    }

    pub fn with_source_id(mut self, source: Source, external_id: &str) -> Self {
        self.set_source_id(source, external_id);
        self
    }

    pub fn set_source_id(&mut self, source: Source, external_id: &str) {
        let id = Some(external_id.to_string());
        match source {
            Source::Square => self.square_id = id,
            Source::Quickbooks => self.quickbooks_id = id,
            Source::Shopify => self.shopify_id = id,
            Source::Cropster => self.cropster_id = id,
        }
    }

    /// This item's identifier in `source`, if it is sold/produced there
    pub fn source_id(&self, source: Source) -> Option<&str> {
        let id = match source {
            Source::Square => &self.square_id,
            Source::Quickbooks => &self.quickbooks_id,
            Source::Shopify => &self.shopify_id,
            Source::Cropster => &self.cropster_id,
        };
        id.as_deref().map(str::trim).filter(|id| !id.is_empty())
    }

    /// "Product / Variant", or just the product name
    pub fn display_name(&self) -> String {
        match self.variant_name.as_deref().filter(|v| !v.trim().is_empty()) {
            Some(variant) => format!("{} / {}", self.product_name, variant),
            None => self.product_name.clone(),
        }
    }
}

// ============================================================================
// CSV
// ============================================================================

/// Row of the items reference sheet
#[derive(Debug, Deserialize)]
struct ItemRow {
    #[serde(alias = "item_id")]
    zolo_id: i64,
    product_name: String,
    variant_name: Option<String>,
    category_name: Option<String>,
    form: Option<String>,
    weight: Option<f64>,
    profile_id: Option<i64>,
    square_id: Option<String>,
    quickbooks_id: Option<String>,
    shopify_id: Option<String>,
    #[serde(default)]
    cropster_id: Option<String>,
}

impl From<ItemRow> for Item {
    fn from(row: ItemRow) -> Self {
        let clean = |value: Option<String>| {
            value
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };

        Item {
            item_id: row.zolo_id,
            product_name: row.product_name.trim().to_string(),
            variant_name: clean(row.variant_name),
            category_name: clean(row.category_name),
            form: row
                .form
                .as_deref()
                .map(|f| f.parse().unwrap_or(ItemForm::Other))
                .unwrap_or(ItemForm::Other),
            weight_lb: row.weight,
            profile_id: row.profile_id,
            square_id: clean(row.square_id),
            quickbooks_id: clean(row.quickbooks_id),
            shopify_id: clean(row.shopify_id),
            cropster_id: clean(row.cropster_id),
        }
    }
}

pub fn load_items_csv(path: &Path) -> Result<Vec<Item>> {
    let mut rdr = csv::Reader::from_path(path)?;
    let mut items = Vec::new();

    for result in rdr.deserialize() {
        let row: ItemRow = result?;
        if row.product_name.trim().is_empty() {
            return Err(EtlError::Config(format!(
                "{}: item {} has no product_name",
                path.display(),
                row.zolo_id
            )));
        }
        items.push(Item::from(row));
    }

    Ok(items)
}

/// Product-name alias pointing at one item
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ItemAlias {
    pub alias: String,
    #[serde(alias = "zolo_id")]
    pub item_id: i64,
}

pub fn load_aliases_csv(path: &Path) -> Result<Vec<ItemAlias>> {
    let mut rdr = csv::Reader::from_path(path)?;
    let mut aliases = Vec::new();

    for result in rdr.deserialize() {
        let alias: ItemAlias = result?;
        aliases.push(alias);
    }

    Ok(aliases)
}

// ============================================================================
// PERSISTENCE
// ============================================================================

pub(crate) fn upsert_item(conn: &Connection, item: &Item) -> Result<()> {
    conn.execute(
        "INSERT INTO items (
            item_id, product_name, variant_name, category_name, form, weight_lb, profile_id
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
        ON CONFLICT(item_id) DO UPDATE SET
            product_name = excluded.product_name,
            variant_name = excluded.variant_name,
            category_name = excluded.category_name,
            form = excluded.form,
            weight_lb = excluded.weight_lb,
            profile_id = excluded.profile_id",
        params![
            item.item_id,
            item.product_name,
            item.variant_name,
            item.category_name,
            item.form.as_str(),
            item.weight_lb,
            item.profile_id,
        ],
    )?;

    for source in Source::ALL {
        if let Some(external_id) = item.source_id(source) {
            conn.execute(
                "INSERT INTO item_mappings (source, external_id, item_id) VALUES (?1, ?2, ?3)",
                params![source.code(), external_id, item.item_id],
            )?;
        }
    }

    Ok(())
}

/// All items with their source mappings, ordered by id
pub fn get_all_items(conn: &Connection) -> Result<Vec<Item>> {
    let mut stmt = conn.prepare(
        "SELECT item_id, product_name, variant_name, category_name, form, weight_lb, profile_id
         FROM items
         ORDER BY item_id",
    )?;

    let mut items = stmt
        .query_map([], |row| {
            let form: String = row.get(4)?;
            Ok(Item {
                item_id: row.get(0)?,
                product_name: row.get(1)?,
                variant_name: row.get(2)?,
                category_name: row.get(3)?,
                form: form.parse().unwrap_or(ItemForm::Other),
                weight_lb: row.get(5)?,
                profile_id: row.get(6)?,
                square_id: None,
                quickbooks_id: None,
                shopify_id: None,
                cropster_id: None,
            })
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;

    let mut stmt = conn.prepare("SELECT source, external_id, item_id FROM item_mappings")?;
    let mappings = stmt
        .query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, i64>(2)?,
            ))
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;

    for (source, external_id, item_id) in mappings {
        let Ok(source) = source.parse::<Source>() else {
            continue;
        };
        if let Ok(index) = items.binary_search_by_key(&item_id, |item| item.item_id) {
            items[index].set_source_id(source, &external_id);
        }
    }

    Ok(items)
}

pub fn get_all_aliases(conn: &Connection) -> Result<Vec<ItemAlias>> {
    let mut stmt = conn.prepare("SELECT alias, item_id FROM item_aliases ORDER BY alias")?;
    let aliases = stmt
        .query_map([], |row| {
            Ok(ItemAlias {
                alias: row.get(0)?,
                item_id: row.get(1)?,
            })
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;

    Ok(aliases)
}
