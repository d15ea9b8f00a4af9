// Reference entities - the catalog every transaction resolves against
//
// Items and coffee profiles come from hand-maintained reference sheets and
// are replaced wholesale on each load; item ids stay stable across loads.

pub mod item;
pub mod profile;

pub use item::{
    get_all_aliases, get_all_items, load_aliases_csv, load_items_csv, Item, ItemAlias, ItemForm,
};
pub use profile::{get_all_profiles, load_profiles_csv, CoffeeProfile, OriginComponent};

use crate::config::ReferenceConfig;
use crate::db::{insert_event, Event};
use crate::error::{EtlError, Result};
use crate::sku::SkuMap;
use crate::source::Source;
use rusqlite::{params, Connection};
use serde::Serialize;
use std::collections::HashSet;
use tracing::{info, warn};

#[derive(Debug, Clone, Default)]
pub struct ReferenceData {
    pub items: Vec<Item>,
    pub profiles: Vec<CoffeeProfile>,
    pub aliases: Vec<ItemAlias>,
}

impl ReferenceData {
    pub fn load(config: &ReferenceConfig) -> Result<Self> {
        let items = load_items_csv(&config.items_csv)?;
        let profiles = load_profiles_csv(&config.profiles_csv)?;
        let aliases = match &config.aliases_csv {
            Some(path) => load_aliases_csv(path)?,
            None => Vec::new(),
        };

        Ok(ReferenceData {
            items,
            profiles,
            aliases,
        })
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ReferenceSummary {
    pub items: usize,
    pub mappings: usize,
    pub aliases: usize,
    pub profiles: usize,
    pub removed_items: usize,
}

/// Replace the catalog in one transaction.
///
/// Fails without touching the warehouse when the new catalog is ambiguous or
/// would drop an item that loaded transactions still point at.
pub fn replace_reference_data(conn: &mut Connection, data: &ReferenceData) -> Result<ReferenceSummary> {
    let sku_map = SkuMap::build(&data.items, &data.aliases)?;

    let profile_ids: HashSet<i64> = data.profiles.iter().map(|p| p.profile_id).collect();
    for item in &data.items {
        if let Some(profile_id) = item.profile_id {
            if !profile_ids.contains(&profile_id) {
                warn!(
                    item_id = item.item_id,
                    profile_id = profile_id,
                    "Item references unknown coffee profile"
                );
            }
        }
    }

    let tx = conn.transaction()?;

    tx.execute("DELETE FROM item_mappings", [])?;
    tx.execute("DELETE FROM item_aliases", [])?;
    tx.execute("DELETE FROM coffee_profiles", [])?;

    for profile in &data.profiles {
        profile::insert_profile(&tx, profile)?;
    }

    let mut mappings = 0;
    for item in &data.items {
        item::upsert_item(&tx, item)?;
        mappings += Source::ALL
            .iter()
            .filter(|source| item.source_id(**source).is_some())
            .count();
    }

    for alias in &data.aliases {
        tx.execute(
            "INSERT OR REPLACE INTO item_aliases (alias, item_id) VALUES (?1, ?2)",
            params![crate::sku::normalize_name(&alias.alias), alias.item_id],
        )?;
    }

    // Items gone from the sheet are dropped unless history points at them
    let existing = {
        let mut stmt = tx.prepare("SELECT item_id FROM items")?;
        let rows = stmt.query_map([], |row| row.get::<_, i64>(0))?;
        rows.collect::<std::result::Result<Vec<_>, _>>()?
    };

    let mut removed_items = 0;
    for item_id in existing {
        if sku_map.contains_item(item_id) {
            continue;
        }
        let referenced: i64 = tx.query_row(
            "SELECT COUNT(*) FROM transactions WHERE item_id = ?1",
            [item_id],
            |row| row.get(0),
        )?;
        if referenced > 0 {
            return Err(EtlError::Config(format!(
                "item {} is missing from the reference sheet but {} loaded transactions use it",
                item_id, referenced
            )));
        }
        tx.execute("DELETE FROM items WHERE item_id = ?1", [item_id])?;
        removed_items += 1;
    }

    let summary = ReferenceSummary {
        items: data.items.len(),
        mappings,
        aliases: data.aliases.len(),
        profiles: data.profiles.len(),
        removed_items,
    };

    insert_event(
        &tx,
        &Event::new(
            "reference_data_replaced",
            "catalog",
            "items",
            serde_json::to_value(&summary)?,
            "reference_loader",
        ),
    )?;

    tx.commit()?;

    info!(
        items = summary.items,
        mappings = summary.mappings,
        aliases = summary.aliases,
        profiles = summary.profiles,
        removed = summary.removed_items,
        "Reference data replaced"
    );

    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::setup_database;

    fn reference() -> ReferenceData {
        ReferenceData {
            items: vec![
                Item::new(101, "Ethiopia Guji")
                    .with_variant("12oz")
                    .with_source_id(Source::Square, "SQ-GUJI-12")
                    .with_source_id(Source::Shopify, "SH-GUJI-12"),
                Item::new(200, "Latte").with_source_id(Source::Square, "SQ-LATTE"),
            ],
            profiles: vec![CoffeeProfile {
                profile_id: 3,
                profile_name: "Guji".to_string(),
                roast_level: Some("light".to_string()),
                single_origin: true,
                components: vec![OriginComponent {
                    origin: "Ethiopia".to_string(),
                    process: Some("washed".to_string()),
                    percent: Some(100.0),
                }],
            }],
            aliases: vec![ItemAlias {
                alias: "Cafe Latte".to_string(),
                item_id: 200,
            }],
        }
    }

    #[test]
    fn test_replace_reference_data_round_trips() {
        let mut conn = Connection::open_in_memory().unwrap();
        setup_database(&conn).unwrap();

        let summary = replace_reference_data(&mut conn, &reference()).unwrap();

        assert_eq!(summary.items, 2);
        assert_eq!(summary.mappings, 3);
        assert_eq!(summary.aliases, 1);

        let items = get_all_items(&conn).unwrap();
        assert_eq!(items.len(), 2);
        assert_eq!(items[0].source_id(Source::Shopify), Some("SH-GUJI-12"));
        assert_eq!(get_all_profiles(&conn).unwrap()[0].components.len(), 1);
        assert_eq!(get_all_aliases(&conn).unwrap()[0].alias, "cafe latte");
    }

    #[test]
    fn test_replace_is_idempotent_and_removes_dropped_items() {
        let mut conn = Connection::open_in_memory().unwrap();
        setup_database(&conn).unwrap();
        replace_reference_data(&mut conn, &reference()).unwrap();

        let mut smaller = reference();
        smaller.items.retain(|item| item.item_id == 101);
        smaller.aliases.clear();

        let summary = replace_reference_data(&mut conn, &smaller).unwrap();

        assert_eq!(summary.removed_items, 1);
        assert_eq!(get_all_items(&conn).unwrap().len(), 1);
    }

    #[test]
    fn test_ambiguous_catalog_leaves_warehouse_untouched() {
        let mut conn = Connection::open_in_memory().unwrap();
        setup_database(&conn).unwrap();
        replace_reference_data(&mut conn, &reference()).unwrap();

        let mut broken = reference();
        broken
            .items
            .push(Item::new(300, "Mocha").with_source_id(Source::Square, "SQ-LATTE"));

        assert!(matches!(
            replace_reference_data(&mut conn, &broken),
            Err(EtlError::AmbiguousMapping { .. })
        ));
        assert_eq!(get_all_items(&conn).unwrap().len(), 2);
    }
}
