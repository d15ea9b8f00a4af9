// 🔗 SKU Reconciliation Map - every source's product identifier → one canonical item
//
// Lookup order:
// 1. (source, external item id)  "SQ-GUJI-12" from Square
// 2. product-name alias          "Guji 12 oz"
// 3. item name + variant         "Ethiopia Guji 12oz"
//
// The map refuses to build when a source id or alias points at two items,
// so a resolved line always has exactly one item.

use crate::entities::{Item, ItemAlias};
use crate::error::{EtlError, Result};
use crate::source::Source;
use rusqlite::Connection;
use std::collections::{HashMap, HashSet};
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchKind {
    SourceId,
    Alias,
    Name,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    Resolved { item_id: i64, via: MatchKind },
    Unresolved(String),
}

impl Resolution {
    pub fn item_id(&self) -> Option<i64> {
        match self {
            Resolution::Resolved { item_id, .. } => Some(*item_id),
            Resolution::Unresolved(_) => None,
        }
    }
}

#[derive(Debug, Default, Clone)]
pub struct SkuMap {
    by_source: HashMap<(Source, String), i64>,
    by_alias: HashMap<String, i64>,
    by_name: HashMap<String, i64>,
    /// Names shared by several items; never resolved by name
    ambiguous_names: HashSet<String>,
    item_ids: HashSet<i64>,
}

impl SkuMap {
    pub fn build(items: &[Item], aliases: &[ItemAlias]) -> Result<Self> {
        let mut map = SkuMap::default();

        for item in items {
            if !map.item_ids.insert(item.item_id) {
                return Err(EtlError::Config(format!(
                    "item_id {} appears more than once",
                    item.item_id
                )));
            }

            for source in Source::ALL {
                if let Some(external_id) = item.source_id(source) {
                    let key = (source, external_id.to_string());
                    match map.by_source.get(&key) {
                        Some(&existing) if existing != item.item_id => {
                            return Err(EtlError::AmbiguousMapping {
                                key: format!("{}:{}", source, external_id),
                                first: existing,
                                second: item.item_id,
                            });
                        }
                        _ => {
                            map.by_source.insert(key, item.item_id);
                        }
                    }
                }
            }

            for name in name_keys(item) {
                map.register_name(name, item.item_id);
            }
        }

        for alias in aliases {
            if !map.item_ids.contains(&alias.item_id) {
                return Err(EtlError::Config(format!(
                    "alias '{}' points at unknown item {}",
                    alias.alias, alias.item_id
                )));
            }

            let key = normalize_name(&alias.alias);
            if key.is_empty() {
                continue;
            }
            match map.by_alias.get(&key) {
                Some(&existing) if existing != alias.item_id => {
                    return Err(EtlError::AmbiguousMapping {
                        key: format!("alias '{}'", alias.alias),
                        first: existing,
                        second: alias.item_id,
                    });
                }
                _ => {
                    map.by_alias.insert(key, alias.item_id);
                }
            }
        }

        debug!(
            items = map.item_ids.len(),
            source_ids = map.by_source.len(),
            aliases = map.by_alias.len(),
            ambiguous_names = map.ambiguous_names.len(),
            "SKU map built"
        );

        Ok(map)
    }

    /// Build from the reference tables currently in the warehouse
    pub fn from_db(conn: &Connection) -> Result<Self> {
        let items = crate::entities::get_all_items(conn)?;
        let aliases = crate::entities::get_all_aliases(conn)?;
        Self::build(&items, &aliases)
    }

    fn register_name(&mut self, name: String, item_id: i64) {
        if name.is_empty() || self.ambiguous_names.contains(&name) {
            return;
        }
        match self.by_name.get(&name) {
            Some(&existing) if existing != item_id => {
                self.by_name.remove(&name);
                self.ambiguous_names.insert(name);
            }
            _ => {
                self.by_name.insert(name, item_id);
            }
        }
    }

    pub fn resolve(
        &self,
        source: Source,
        external_item_id: Option<&str>,
        product_name: Option<&str>,
    ) -> Resolution {
        let external_item_id = external_item_id.map(str::trim).filter(|id| !id.is_empty());

        if let Some(external_id) = external_item_id {
            if let Some(&item_id) = self.by_source.get(&(source, external_id.to_string())) {
                return Resolution::Resolved {
                    item_id,
                    via: MatchKind::SourceId,
                };
            }
        }

        let name = product_name.map(normalize_name).unwrap_or_default();
        if !name.is_empty() {
            if let Some(&item_id) = self.by_alias.get(&name) {
                return Resolution::Resolved {
                    item_id,
                    via: MatchKind::Alias,
                };
            }
            if let Some(&item_id) = self.by_name.get(&name) {
                return Resolution::Resolved {
                    item_id,
                    via: MatchKind::Name,
                };
            }
            if self.ambiguous_names.contains(&name) {
                return Resolution::Unresolved(format!(
                    "name '{}' matches several items",
                    product_name.unwrap_or_default()
                ));
            }
        }

        let reason = match (external_item_id, product_name) {
            (Some(id), Some(name)) => format!("no item for {} id '{}' or name '{}'", source, id, name),
            (Some(id), None) => format!("no item for {} id '{}'", source, id),
            (None, Some(name)) => format!("no item named '{}'", name),
            (None, None) => "line has neither an item id nor a name".to_string(),
        };
        Resolution::Unresolved(reason)
    }

    pub fn contains_item(&self, item_id: i64) -> bool {
        self.item_ids.contains(&item_id)
    }

    pub fn item_count(&self) -> usize {
        self.item_ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.item_ids.is_empty()
    }
}

/// "Product Variant" and, for items without a variant, the bare product name
fn name_keys(item: &Item) -> Vec<String> {
    match item.variant_name.as_deref() {
        Some(variant) => vec![
            normalize_name(&format!("{} {}", item.product_name, variant)),
            normalize_name(&format!("{} - {}", item.product_name, variant)),
        ],
        None => vec![normalize_name(&item.product_name)],
    }
}

/// Normalize a product name for matching
///
/// - Lowercase
/// - Drop apostrophes ("Farmer's" → "farmers")
/// - Other punctuation becomes a space
/// - Collapse whitespace
pub fn normalize_name(s: &str) -> String {
    let cleaned: String = s
        .to_lowercase()
        .chars()
        .filter(|c| !matches!(c, '\'' | '’'))
        .map(|c| if c.is_alphanumeric() { c } else { ' ' })
        .collect();

    cleaned.split_whitespace().collect::<Vec<_>>().join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn catalog() -> Vec<Item> {
        vec![
            Item::new(101, "Ethiopia Guji")
                .with_variant("12oz")
                .with_source_id(Source::Square, "SQ-GUJI-12")
                .with_source_id(Source::Shopify, "SH-GUJI-12"),
            Item::new(102, "Ethiopia Guji")
                .with_variant("5lb")
                .with_source_id(Source::Quickbooks, "31"),
            Item::new(200, "Latte").with_source_id(Source::Square, "SQ-LATTE"),
            Item::new(300, "Farmer's Blend").with_source_id(Source::Cropster, "P-77"),
        ]
    }

    #[test]
    fn test_normalize_name() {
        assert_eq!(normalize_name("  Farmer's   BLEND "), "farmers blend");
        assert_eq!(normalize_name("Guji - 12oz"), "guji 12oz");
        assert_eq!(normalize_name("Café Latte!"), "café latte");
        assert_eq!(normalize_name("***"), "");
    }

    #[test]
    fn test_resolve_by_source_id_first() {
        let map = SkuMap::build(&catalog(), &[]).unwrap();

        let resolution = map.resolve(Source::Square, Some("SQ-GUJI-12"), Some("Latte"));
        assert_eq!(
            resolution,
            Resolution::Resolved {
                item_id: 101,
                via: MatchKind::SourceId
            }
        );

        // ids are per source
        assert_eq!(
            map.resolve(Source::Shopify, Some("SQ-GUJI-12"), None).item_id(),
            None
        );
    }

    #[test]
    fn test_resolve_falls_back_to_alias_then_name() {
        let aliases = vec![ItemAlias {
            alias: "Guji 12 oz".to_string(),
            item_id: 101,
        }];
        let map = SkuMap::build(&catalog(), &aliases).unwrap();

        let by_alias = map.resolve(Source::Square, Some("UNKNOWN"), Some("guji 12 OZ"));
        assert_eq!(
            by_alias,
            Resolution::Resolved {
                item_id: 101,
                via: MatchKind::Alias
            }
        );

        let by_name = map.resolve(Source::Shopify, None, Some("Ethiopia Guji - 5lb"));
        assert_eq!(
            by_name,
            Resolution::Resolved {
                item_id: 102,
                via: MatchKind::Name
            }
        );

        assert_eq!(
            map.resolve(Source::Cropster, None, Some("farmers blend")).item_id(),
            Some(300)
        );
    }

    #[test]
    fn test_bare_product_name_with_variants_is_unresolved() {
        let map = SkuMap::build(&catalog(), &[]).unwrap();

        assert!(matches!(
            map.resolve(Source::Shopify, None, Some("Ethiopia Guji")),
            Resolution::Unresolved(_)
        ));
    }

    #[test]
    fn test_duplicate_names_are_never_matched_by_name() {
        let items = vec![Item::new(1, "Mug"), Item::new(2, "MUG")];
        let map = SkuMap::build(&items, &[]).unwrap();

        match map.resolve(Source::Square, None, Some("mug")) {
            Resolution::Unresolved(reason) => assert!(reason.contains("several items")),
            other => panic!("expected unresolved, got {:?}", other),
        }
    }

    #[test]
    fn test_conflicting_source_id_is_rejected() {
        let mut items = catalog();
        items.push(Item::new(400, "Cappuccino").with_source_id(Source::Square, "SQ-LATTE"));

        let err = SkuMap::build(&items, &[]).unwrap_err();
        match err {
            EtlError::AmbiguousMapping { key, first, second } => {
                assert_eq!(key, "square:SQ-LATTE");
                assert_eq!((first, second), (200, 400));
            }
            other => panic!("expected ambiguous mapping, got {:?}", other),
        }
    }

    #[test]
    fn test_conflicting_alias_is_rejected() {
        let aliases = vec![
            ItemAlias {
                alias: "House".to_string(),
                item_id: 200,
            },
            ItemAlias {
                alias: "house".to_string(),
                item_id: 300,
            },
        ];

        assert!(matches!(
            SkuMap::build(&catalog(), &aliases),
            Err(EtlError::AmbiguousMapping { .. })
        ));
    }

    #[test]
    fn test_alias_to_unknown_item_is_rejected() {
        let aliases = vec![ItemAlias {
            alias: "Ghost".to_string(),
            item_id: 999,
        }];

        assert!(matches!(
            SkuMap::build(&catalog(), &aliases),
            Err(EtlError::Config(_))
        ));
    }

    #[test]
    fn test_unresolved_reason_names_the_identifier() {
        let map = SkuMap::build(&catalog(), &[]).unwrap();

        match map.resolve(Source::Quickbooks, Some("99"), None) {
            Resolution::Unresolved(reason) => assert!(reason.contains("'99'")),
            other => panic!("expected unresolved, got {:?}", other),
        }
    }
}
