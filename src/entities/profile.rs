// 🌱 Coffee Profile - roast level and origin blend behind a coffee item

use crate::error::Result;
use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// One origin in a blend
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OriginComponent {
    pub origin: String,
    pub process: Option<String>,
    /// Share of the blend, 0-100
    pub percent: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CoffeeProfile {
    pub profile_id: i64,
    pub profile_name: String,
    pub roast_level: Option<String>,
    pub single_origin: bool,
    pub components: Vec<OriginComponent>,
}

impl CoffeeProfile {
    /// Sum of component percentages, ignoring components without one
    pub fn total_percent(&self) -> f64 {
        self.components.iter().filter_map(|c| c.percent).sum()
    }
}

/// Row of the coffee_profiles reference sheet (up to three components)
#[derive(Debug, Deserialize)]
struct ProfileRow {
    profile_id: i64,
    profile_name: String,
    roast_level: Option<String>,
    single_origin: Option<i64>,
    c1_origin: Option<String>,
    c1_process: Option<String>,
    c1_percent: Option<f64>,
    c2_origin: Option<String>,
    c2_process: Option<String>,
    c2_percent: Option<f64>,
    c3_origin: Option<String>,
    // the sheet header has been misspelled "c3_procss"
    #[serde(alias = "c3_procss")]
    c3_process: Option<String>,
    c3_percent: Option<f64>,
}

impl From<ProfileRow> for CoffeeProfile {
    fn from(row: ProfileRow) -> Self {
        let slots = [
            (row.c1_origin, row.c1_process, row.c1_percent),
            (row.c2_origin, row.c2_process, row.c2_percent),
            (row.c3_origin, row.c3_process, row.c3_percent),
        ];

        let components = slots
            .into_iter()
            .filter_map(|(origin, process, percent)| {
                let origin = origin?.trim().to_string();
                if origin.is_empty() {
                    return None;
                }
                Some(OriginComponent {
                    origin,
                    process: process.filter(|p| !p.trim().is_empty()),
                    percent,
                })
            })
            .collect();

        CoffeeProfile {
            profile_id: row.profile_id,
            profile_name: row.profile_name.trim().to_string(),
            roast_level: row.roast_level.filter(|r| !r.trim().is_empty()),
            single_origin: row.single_origin.unwrap_or(0) != 0,
            components,
        }
    }
}

pub fn load_profiles_csv(path: &Path) -> Result<Vec<CoffeeProfile>> {
    let mut rdr = csv::Reader::from_path(path)?;
    let mut profiles = Vec::new();

    for result in rdr.deserialize() {
        let row: ProfileRow = result?;
        profiles.push(CoffeeProfile::from(row));
    }

    Ok(profiles)
}

pub(crate) fn insert_profile(conn: &Connection, profile: &CoffeeProfile) -> Result<()> {
    conn.execute(
        "INSERT INTO coffee_profiles (
            profile_id, profile_name, roast_level, single_origin, components
        ) VALUES (?1, ?2, ?3, ?4, ?5)",
        params![
            profile.profile_id,
            profile.profile_name,
            profile.roast_level,
            profile.single_origin,
            serde_json::to_string(&profile.components)?,
        ],
    )?;
    Ok(())
}

pub fn get_all_profiles(conn: &Connection) -> Result<Vec<CoffeeProfile>> {
    let mut stmt = conn.prepare(
        "SELECT profile_id, profile_name, roast_level, single_origin, components
         FROM coffee_profiles
         ORDER BY profile_id",
    )?;

    let rows = stmt
        .query_map([], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, Option<String>>(2)?,
                row.get::<_, bool>(3)?,
                row.get::<_, String>(4)?,
            ))
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;

    let mut profiles = Vec::with_capacity(rows.len());
    for (profile_id, profile_name, roast_level, single_origin, components) in rows {
        profiles.push(CoffeeProfile {
            profile_id,
            profile_name,
            roast_level,
            single_origin,
            components: serde_json::from_str(&components)?,
        });
    }

    Ok(profiles)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_load_profiles_with_misspelled_header() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "profile_id,profile_name,roast_level,single_origin,c1_origin,c1_process,c1_percent,c2_origin,c2_process,c2_percent,c3_procss,c3_origin,c3_percent\n\
             1,House Blend,medium,0,Brazil,natural,60,Colombia,washed,30,honey,Costa Rica,10\n\
             2,Ethiopia Guji,light,1,Ethiopia,washed,100,,,,,,"
        )
        .unwrap();

        let profiles = load_profiles_csv(file.path()).unwrap();

        assert_eq!(profiles.len(), 2);
        let blend = &profiles[0];
        assert!(!blend.single_origin);
        assert_eq!(blend.components.len(), 3);
        assert_eq!(blend.components[2].origin, "Costa Rica");
        assert_eq!(blend.components[2].process.as_deref(), Some("honey"));
        assert_eq!(blend.total_percent(), 100.0);

        let guji = &profiles[1];
        assert!(guji.single_origin);
        assert_eq!(guji.components.len(), 1);
        assert_eq!(guji.roast_level.as_deref(), Some("light"));
    }
}
