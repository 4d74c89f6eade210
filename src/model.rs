//! Entity records produced by scanners.
//!
//! Each record knows its primary key and how to encode itself as a
//! [`Row`] in its table's column order. Records are plain data: they are
//! built, handed to the write queue, and dropped once the write completes.

use chrono::{DateTime, Utc};
use rusqlite::types::Value;
use serde::{Deserialize, Serialize};

use crate::storage::schema::{EntityKind, Row};

/// A record that can be written through the upsert path.
pub trait Entity {
    /// Entity type (and so table) this record belongs to.
    const KIND: EntityKind;

    /// Primary identity used to collapse duplicates within one row set.
    fn key(&self) -> String;

    /// Column values in [`crate::storage::schema::TableDef::columns`] order.
    fn to_row(&self) -> Row;
}

/// Controlling team of a structure or trainer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[repr(u8)]
pub enum Team {
    #[default]
    Neutral = 0,
    A = 1,
    B = 2,
    C = 3,
}

impl Team {
    pub fn id(self) -> u8 {
        self as u8
    }
}

impl TryFrom<u8> for Team {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Team::Neutral),
            1 => Ok(Team::A),
            2 => Ok(Team::B),
            3 => Ok(Team::C),
            other => Err(other),
        }
    }
}

fn ts(t: DateTime<Utc>) -> Value {
    Value::Integer(t.timestamp_millis())
}

fn opt_ts(t: Option<DateTime<Utc>>) -> Value {
    t.map_or(Value::Null, ts)
}

/// One active occurrence of a creature at a location.
///
/// The occurrence id arrives as a large integer and is stored re-encoded as
/// a compact string of at most 50 characters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Spawn {
    pub occurrence_id: String,
    pub spawnpoint_id: String,
    pub species_id: u16,
    pub latitude: f64,
    pub longitude: f64,
    pub disappear_time: DateTime<Utc>,
    pub individual_attack: Option<u8>,
    pub individual_defense: Option<u8>,
    pub individual_stamina: Option<u8>,
    pub move_1: Option<u16>,
    pub move_2: Option<u16>,
    pub cp: Option<u16>,
    pub cp_multiplier: Option<f64>,
    pub weight: Option<f64>,
    pub height: Option<f64>,
    pub gender: Option<u8>,
    pub form: Option<u16>,
    pub last_modified: Option<DateTime<Utc>>,
}

impl Spawn {
    /// A spawn with only the required attributes set.
    pub fn new(
        occurrence_id: impl Into<String>,
        spawnpoint_id: impl Into<String>,
        species_id: u16,
        (latitude, longitude): (f64, f64),
        disappear_time: DateTime<Utc>,
    ) -> Self {
        Self {
            occurrence_id: occurrence_id.into(),
            spawnpoint_id: spawnpoint_id.into(),
            species_id,
            latitude,
            longitude,
            disappear_time,
            individual_attack: None,
            individual_defense: None,
            individual_stamina: None,
            move_1: None,
            move_2: None,
            cp: None,
            cp_multiplier: None,
            weight: None,
            height: None,
            gender: None,
            form: None,
            last_modified: Some(Utc::now()),
        }
    }
}

impl Entity for Spawn {
    const KIND: EntityKind = EntityKind::Spawn;

    fn key(&self) -> String {
        self.occurrence_id.clone()
    }

    fn to_row(&self) -> Row {
        vec![
            Value::from(self.occurrence_id.clone()),
            Value::from(self.spawnpoint_id.clone()),
            Value::from(self.species_id),
            Value::from(self.latitude),
            Value::from(self.longitude),
            ts(self.disappear_time),
            Value::from(self.individual_attack),
            Value::from(self.individual_defense),
            Value::from(self.individual_stamina),
            Value::from(self.move_1),
            Value::from(self.move_2),
            Value::from(self.cp),
            Value::from(self.cp_multiplier),
            Value::from(self.weight),
            Value::from(self.height),
            Value::from(self.gender),
            Value::from(self.form),
            opt_ts(self.last_modified),
        ]
    }
}

/// Time-bounded bonus active on a point of interest.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Bonus {
    pub expiration: DateTime<Utc>,
    pub modifier: String,
}

/// Static location that can carry a time-bounded bonus.
///
/// The bonus expiration and descriptor live in one `Option`, so they are
/// always present or absent together.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PointOfInterest {
    pub poi_id: String,
    pub enabled: bool,
    pub latitude: f64,
    pub longitude: f64,
    pub last_modified: DateTime<Utc>,
    pub bonus: Option<Bonus>,
    pub last_updated: Option<DateTime<Utc>>,
}

impl Entity for PointOfInterest {
    const KIND: EntityKind = EntityKind::PointOfInterest;

    fn key(&self) -> String {
        self.poi_id.clone()
    }

    fn to_row(&self) -> Row {
        let (expiration, modifier) = match &self.bonus {
            Some(bonus) => (ts(bonus.expiration), Value::from(bonus.modifier.clone())),
            None => (Value::Null, Value::Null),
        };
        vec![
            Value::from(self.poi_id.clone()),
            Value::from(self.enabled),
            Value::from(self.latitude),
            Value::from(self.longitude),
            ts(self.last_modified),
            expiration,
            modifier,
            opt_ts(self.last_updated),
        ]
    }
}

/// Team-controlled location with defenders.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Structure {
    pub structure_id: String,
    pub team: Team,
    pub guard_species_id: u16,
    pub slots_available: u8,
    pub score: u32,
    pub enabled: bool,
    pub latitude: f64,
    pub longitude: f64,
    pub last_modified: DateTime<Utc>,
    pub last_scanned: DateTime<Utc>,
}

impl Entity for Structure {
    const KIND: EntityKind = EntityKind::Structure;

    fn key(&self) -> String {
        self.structure_id.clone()
    }

    fn to_row(&self) -> Row {
        vec![
            Value::from(self.structure_id.clone()),
            Value::from(self.team.id()),
            Value::from(self.guard_species_id),
            Value::from(self.slots_available),
            Value::from(self.score),
            Value::from(self.enabled),
            Value::from(self.latitude),
            Value::from(self.longitude),
            ts(self.last_modified),
            ts(self.last_scanned),
        ]
    }
}

/// Descriptive details of a structure, one-to-one with [`Structure`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StructureDetails {
    pub structure_id: String,
    pub name: String,
    pub description: Option<String>,
    pub url: String,
    pub last_scanned: DateTime<Utc>,
}

impl Entity for StructureDetails {
    const KIND: EntityKind = EntityKind::StructureDetails;

    fn key(&self) -> String {
        self.structure_id.clone()
    }

    fn to_row(&self) -> Row {
        vec![
            Value::from(self.structure_id.clone()),
            Value::from(self.name.clone()),
            Value::from(self.description.clone().unwrap_or_default()),
            Value::from(self.url.clone()),
            ts(self.last_scanned),
        ]
    }
}

/// A defending creature seen at a structure during one scan.
///
/// Memberships have no identity of their own; the row set key combines
/// structure, creature instance and scan time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StructureMembership {
    pub structure_id: String,
    pub instance_id: String,
    pub last_scanned: DateTime<Utc>,
    pub deployment_time: DateTime<Utc>,
    pub cp_decayed: u16,
}

impl Entity for StructureMembership {
    const KIND: EntityKind = EntityKind::StructureMembership;

    fn key(&self) -> String {
        format!(
            "{}|{}|{}",
            self.structure_id,
            self.instance_id,
            self.last_scanned.timestamp_millis()
        )
    }

    fn to_row(&self) -> Row {
        vec![
            Value::from(self.structure_id.clone()),
            Value::from(self.instance_id.clone()),
            ts(self.last_scanned),
            ts(self.deployment_time),
            Value::from(self.cp_decayed),
        ]
    }
}

/// A specific defending creature belonging to a trainer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreatureInstance {
    pub instance_id: String,
    pub species_id: u16,
    pub cp: u16,
    pub trainer_name: String,
    pub num_upgrades: Option<u16>,
    pub move_1: Option<u16>,
    pub move_2: Option<u16>,
    pub height: Option<f64>,
    pub weight: Option<f64>,
    pub stamina: Option<u16>,
    pub stamina_max: Option<u16>,
    pub cp_multiplier: Option<f64>,
    pub additional_cp_multiplier: Option<f64>,
    pub iv_defense: Option<u8>,
    pub iv_stamina: Option<u8>,
    pub iv_attack: Option<u8>,
    pub last_seen: DateTime<Utc>,
}

impl Entity for CreatureInstance {
    const KIND: EntityKind = EntityKind::CreatureInstance;

    fn key(&self) -> String {
        self.instance_id.clone()
    }

    fn to_row(&self) -> Row {
        vec![
            Value::from(self.instance_id.clone()),
            Value::from(self.species_id),
            Value::from(self.cp),
            Value::from(self.trainer_name.clone()),
            Value::from(self.num_upgrades),
            Value::from(self.move_1),
            Value::from(self.move_2),
            Value::from(self.height),
            Value::from(self.weight),
            Value::from(self.stamina),
            Value::from(self.stamina_max),
            Value::from(self.cp_multiplier),
            Value::from(self.additional_cp_multiplier),
            Value::from(self.iv_defense),
            Value::from(self.iv_stamina),
            Value::from(self.iv_attack),
            ts(self.last_seen),
        ]
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trainer {
    pub name: String,
    pub team: Team,
    pub level: u8,
    pub last_seen: DateTime<Utc>,
}

impl Entity for Trainer {
    const KIND: EntityKind = EntityKind::Trainer;

    fn key(&self) -> String {
        self.name.clone()
    }

    fn to_row(&self) -> Row {
        vec![
            Value::from(self.name.clone()),
            Value::from(self.team.id()),
            Value::from(self.level),
            ts(self.last_seen),
        ]
    }
}

/// Stored access token. Issuing tokens happens elsewhere.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessToken {
    pub token: String,
    pub name: String,
}

impl Entity for AccessToken {
    const KIND: EntityKind = EntityKind::AccessToken;

    fn key(&self) -> String {
        self.token.clone()
    }

    fn to_row(&self) -> Row {
        vec![Value::from(self.token.clone()), Value::from(self.name.clone())]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_rows_match_table_columns() {
        let now = Utc::now();
        let spawn = Spawn::new("abc", "sp1", 25, (51.5, -0.12), now);
        assert_eq!(spawn.to_row().len(), Spawn::KIND.table().columns.len());

        let poi = PointOfInterest {
            poi_id: "p".into(),
            enabled: true,
            latitude: 0.0,
            longitude: 0.0,
            last_modified: now,
            bonus: None,
            last_updated: None,
        };
        assert_eq!(poi.to_row().len(), PointOfInterest::KIND.table().columns.len());

        let trainer = Trainer {
            name: "ash".into(),
            team: Team::B,
            level: 30,
            last_seen: now,
        };
        assert_eq!(trainer.to_row().len(), Trainer::KIND.table().columns.len());

        let membership = StructureMembership {
            structure_id: "s".into(),
            instance_id: "i".into(),
            last_scanned: now,
            deployment_time: now,
            cp_decayed: 0,
        };
        assert_eq!(
            membership.to_row().len(),
            StructureMembership::KIND.table().columns.len()
        );
    }

    #[test]
    fn test_bonus_fields_encode_together() {
        let now = Utc::now();
        let mut poi = PointOfInterest {
            poi_id: "p".into(),
            enabled: true,
            latitude: 0.0,
            longitude: 0.0,
            last_modified: now,
            bonus: Some(Bonus {
                expiration: now + Duration::minutes(30),
                modifier: "501".into(),
            }),
            last_updated: None,
        };
        let row = poi.to_row();
        assert!(matches!(row[5], Value::Integer(_)));
        assert_eq!(row[6], Value::Text("501".into()));

        poi.bonus = None;
        let row = poi.to_row();
        assert_eq!(row[5], Value::Null);
        assert_eq!(row[6], Value::Null);
    }

    #[test]
    fn test_membership_key_includes_scan_time() {
        let now = Utc::now();
        let a = StructureMembership {
            structure_id: "s".into(),
            instance_id: "i".into(),
            last_scanned: now,
            deployment_time: now,
            cp_decayed: 0,
        };
        let mut b = a.clone();
        b.last_scanned = now + Duration::seconds(1);
        assert_ne!(a.key(), b.key());
    }

    #[test]
    fn test_team_ids() {
        assert_eq!(Team::try_from(2), Ok(Team::B));
        assert_eq!(Team::try_from(9), Err(9));
        assert_eq!(Team::C.id(), 3);
    }
}
