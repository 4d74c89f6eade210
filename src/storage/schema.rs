//! Table layout for tracked map entities.
//!
//! Every data table is a SQLite `STRICT` table, so a value of the wrong type
//! is rejected by the store instead of being silently coerced. Entity
//! invariants that the store can check are expressed as CHECK constraints.
//! Timestamps are INTEGER Unix milliseconds.

use rusqlite::types::Value;
use rusqlite::{params, Connection, OptionalExtension};
use std::fmt;

/// One encoded record, values in [`TableDef::columns`] order.
pub type Row = Vec<Value>;

/// Name of the version-tracking table.
pub const SCHEMA_VERSION_TABLE: &str = "schema_version";

/// Entity types accepted by the write path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntityKind {
    AccessToken,
    Spawn,
    PointOfInterest,
    Structure,
    StructureDetails,
    StructureMembership,
    CreatureInstance,
    Trainer,
}

impl EntityKind {
    /// All kinds, in table creation order.
    pub const ALL: [EntityKind; 8] = [
        EntityKind::AccessToken,
        EntityKind::Spawn,
        EntityKind::PointOfInterest,
        EntityKind::Structure,
        EntityKind::StructureDetails,
        EntityKind::StructureMembership,
        EntityKind::CreatureInstance,
        EntityKind::Trainer,
    ];

    /// Table definition backing this kind.
    pub fn table(self) -> &'static TableDef {
        match self {
            EntityKind::AccessToken => &ACCESS_TOKEN,
            EntityKind::Spawn => &SPAWN,
            EntityKind::PointOfInterest => &POINT_OF_INTEREST,
            EntityKind::Structure => &STRUCTURE,
            EntityKind::StructureDetails => &STRUCTURE_DETAILS,
            EntityKind::StructureMembership => &STRUCTURE_MEMBER,
            EntityKind::CreatureInstance => &CREATURE_INSTANCE,
            EntityKind::Trainer => &TRAINER,
        }
    }

    /// Stable label used in logs and metric attributes.
    pub fn as_str(self) -> &'static str {
        self.table().name
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Static description of a data table.
#[derive(Debug)]
pub struct TableDef {
    pub name: &'static str,
    /// Columns written by the upsert path, in row order.
    pub columns: &'static [&'static str],
    /// Conflict target for upserts. Empty for multiset tables.
    pub primary_key: &'static [&'static str],
    /// `CREATE TABLE` plus its indexes.
    pub ddl: &'static str,
}

impl TableDef {
    /// Whether rows are keyed (upserted) or appended.
    pub fn is_keyed(&self) -> bool {
        !self.primary_key.is_empty()
    }

    /// Build the write statement for `rows` records.
    ///
    /// Keyed tables get `INSERT .. ON CONFLICT (pk) DO UPDATE` overwriting
    /// every non-key column; multiset tables get a plain multi-row insert.
    pub fn upsert_sql(&self, rows: usize) -> String {
        let placeholders = format!("({})", vec!["?"; self.columns.len()].join(", "));
        let values = vec![placeholders.as_str(); rows].join(", ");
        let mut sql = format!(
            "INSERT INTO {} ({}) VALUES {}",
            self.name,
            self.columns.join(", "),
            values
        );

        if self.is_keyed() {
            let updates: Vec<String> = self
                .columns
                .iter()
                .filter(|c| !self.primary_key.contains(*c))
                .map(|c| format!("{c} = excluded.{c}"))
                .collect();
            sql.push_str(&format!(" ON CONFLICT ({}) ", self.primary_key.join(", ")));
            if updates.is_empty() {
                sql.push_str("DO NOTHING");
            } else {
                sql.push_str(&format!("DO UPDATE SET {}", updates.join(", ")));
            }
        }
        sql
    }
}

pub static ACCESS_TOKEN: TableDef = TableDef {
    name: "access_token",
    columns: &["token", "name"],
    primary_key: &["token"],
    ddl: r#"
        CREATE TABLE IF NOT EXISTS access_token (
            token TEXT PRIMARY KEY NOT NULL CHECK (length(token) <= 32),
            name TEXT NOT NULL
        ) STRICT;
        CREATE INDEX IF NOT EXISTS idx_access_token_name ON access_token(name);
    "#,
};

pub static SPAWN: TableDef = TableDef {
    name: "spawn",
    columns: &[
        "occurrence_id",
        "spawnpoint_id",
        "species_id",
        "latitude",
        "longitude",
        "disappear_time",
        "individual_attack",
        "individual_defense",
        "individual_stamina",
        "move_1",
        "move_2",
        "cp",
        "cp_multiplier",
        "weight",
        "height",
        "gender",
        "form",
        "last_modified",
    ],
    primary_key: &["occurrence_id"],
    ddl: r#"
        CREATE TABLE IF NOT EXISTS spawn (
            occurrence_id TEXT PRIMARY KEY NOT NULL CHECK (length(occurrence_id) <= 50),
            spawnpoint_id TEXT NOT NULL,
            species_id INTEGER NOT NULL,
            latitude REAL NOT NULL CHECK (latitude BETWEEN -90 AND 90),
            longitude REAL NOT NULL CHECK (longitude BETWEEN -180 AND 180),
            disappear_time INTEGER NOT NULL,
            individual_attack INTEGER,
            individual_defense INTEGER,
            individual_stamina INTEGER,
            move_1 INTEGER,
            move_2 INTEGER,
            cp INTEGER,
            cp_multiplier REAL,
            weight REAL,
            height REAL,
            gender INTEGER,
            form INTEGER,
            last_modified INTEGER
        ) STRICT;
        CREATE INDEX IF NOT EXISTS idx_spawn_spawnpoint ON spawn(spawnpoint_id);
        CREATE INDEX IF NOT EXISTS idx_spawn_species ON spawn(species_id);
        CREATE INDEX IF NOT EXISTS idx_spawn_disappear ON spawn(disappear_time);
        CREATE INDEX IF NOT EXISTS idx_spawn_modified ON spawn(last_modified);
        CREATE INDEX IF NOT EXISTS idx_spawn_location ON spawn(latitude, longitude);
    "#,
};

pub static POINT_OF_INTEREST: TableDef = TableDef {
    name: "point_of_interest",
    columns: &[
        "poi_id",
        "enabled",
        "latitude",
        "longitude",
        "last_modified",
        "bonus_expiration",
        "bonus_modifier",
        "last_updated",
    ],
    primary_key: &["poi_id"],
    ddl: r#"
        CREATE TABLE IF NOT EXISTS point_of_interest (
            poi_id TEXT PRIMARY KEY NOT NULL CHECK (length(poi_id) <= 50),
            enabled INTEGER NOT NULL CHECK (enabled IN (0, 1)),
            latitude REAL NOT NULL CHECK (latitude BETWEEN -90 AND 90),
            longitude REAL NOT NULL CHECK (longitude BETWEEN -180 AND 180),
            last_modified INTEGER NOT NULL,
            bonus_expiration INTEGER,
            bonus_modifier TEXT CHECK (length(bonus_modifier) <= 50),
            last_updated INTEGER,
            CHECK ((bonus_expiration IS NULL) = (bonus_modifier IS NULL))
        ) STRICT;
        CREATE INDEX IF NOT EXISTS idx_poi_modified ON point_of_interest(last_modified);
        CREATE INDEX IF NOT EXISTS idx_poi_bonus_expiration ON point_of_interest(bonus_expiration);
        CREATE INDEX IF NOT EXISTS idx_poi_bonus_modifier ON point_of_interest(bonus_modifier);
        CREATE INDEX IF NOT EXISTS idx_poi_updated ON point_of_interest(last_updated);
        CREATE INDEX IF NOT EXISTS idx_poi_location ON point_of_interest(latitude, longitude);
    "#,
};

pub static STRUCTURE: TableDef = TableDef {
    name: "structure",
    columns: &[
        "structure_id",
        "team_id",
        "guard_species_id",
        "slots_available",
        "score",
        "enabled",
        "latitude",
        "longitude",
        "last_modified",
        "last_scanned",
    ],
    primary_key: &["structure_id"],
    ddl: r#"
        CREATE TABLE IF NOT EXISTS structure (
            structure_id TEXT PRIMARY KEY NOT NULL CHECK (length(structure_id) <= 50),
            team_id INTEGER NOT NULL CHECK (team_id BETWEEN 0 AND 3),
            guard_species_id INTEGER NOT NULL,
            slots_available INTEGER NOT NULL DEFAULT 0,
            score INTEGER NOT NULL DEFAULT 0,
            enabled INTEGER NOT NULL CHECK (enabled IN (0, 1)),
            latitude REAL NOT NULL CHECK (latitude BETWEEN -90 AND 90),
            longitude REAL NOT NULL CHECK (longitude BETWEEN -180 AND 180),
            last_modified INTEGER NOT NULL,
            last_scanned INTEGER NOT NULL
        ) STRICT;
        CREATE INDEX IF NOT EXISTS idx_structure_modified ON structure(last_modified);
        CREATE INDEX IF NOT EXISTS idx_structure_scanned ON structure(last_scanned);
        CREATE INDEX IF NOT EXISTS idx_structure_location ON structure(latitude, longitude);
    "#,
};

pub static STRUCTURE_DETAILS: TableDef = TableDef {
    name: "structure_details",
    columns: &["structure_id", "name", "description", "url", "last_scanned"],
    primary_key: &["structure_id"],
    ddl: r#"
        CREATE TABLE IF NOT EXISTS structure_details (
            structure_id TEXT PRIMARY KEY NOT NULL
                REFERENCES structure(structure_id),
            name TEXT NOT NULL,
            description TEXT DEFAULT '',
            url TEXT NOT NULL,
            last_scanned INTEGER NOT NULL
        ) STRICT;
    "#,
};

pub static STRUCTURE_MEMBER: TableDef = TableDef {
    name: "structure_member",
    columns: &[
        "structure_id",
        "instance_id",
        "last_scanned",
        "deployment_time",
        "cp_decayed",
    ],
    primary_key: &[],
    ddl: r#"
        CREATE TABLE IF NOT EXISTS structure_member (
            structure_id TEXT NOT NULL REFERENCES structure(structure_id),
            instance_id TEXT NOT NULL REFERENCES creature_instance(instance_id),
            last_scanned INTEGER NOT NULL,
            deployment_time INTEGER NOT NULL DEFAULT 0,
            cp_decayed INTEGER NOT NULL DEFAULT 0
        ) STRICT;
        CREATE INDEX IF NOT EXISTS idx_structure_member_structure ON structure_member(structure_id);
        CREATE INDEX IF NOT EXISTS idx_structure_member_instance ON structure_member(instance_id);
        CREATE INDEX IF NOT EXISTS idx_structure_member_scanned ON structure_member(last_scanned);
    "#,
};

pub static CREATURE_INSTANCE: TableDef = TableDef {
    name: "creature_instance",
    columns: &[
        "instance_id",
        "species_id",
        "cp",
        "trainer_name",
        "num_upgrades",
        "move_1",
        "move_2",
        "height",
        "weight",
        "stamina",
        "stamina_max",
        "cp_multiplier",
        "additional_cp_multiplier",
        "iv_defense",
        "iv_stamina",
        "iv_attack",
        "last_seen",
    ],
    primary_key: &["instance_id"],
    ddl: r#"
        CREATE TABLE IF NOT EXISTS creature_instance (
            instance_id TEXT PRIMARY KEY NOT NULL CHECK (length(instance_id) <= 50),
            species_id INTEGER NOT NULL,
            cp INTEGER NOT NULL,
            trainer_name TEXT NOT NULL REFERENCES trainer(name),
            num_upgrades INTEGER,
            move_1 INTEGER,
            move_2 INTEGER,
            height REAL,
            weight REAL,
            stamina INTEGER,
            stamina_max INTEGER,
            cp_multiplier REAL,
            additional_cp_multiplier REAL,
            iv_defense INTEGER,
            iv_stamina INTEGER,
            iv_attack INTEGER,
            last_seen INTEGER NOT NULL
        ) STRICT;
        CREATE INDEX IF NOT EXISTS idx_creature_instance_trainer ON creature_instance(trainer_name);
    "#,
};

pub static TRAINER: TableDef = TableDef {
    name: "trainer",
    columns: &["name", "team", "level", "last_seen"],
    primary_key: &["name"],
    ddl: r#"
        CREATE TABLE IF NOT EXISTS trainer (
            name TEXT PRIMARY KEY NOT NULL CHECK (length(name) <= 50),
            team INTEGER NOT NULL CHECK (team BETWEEN 0 AND 3),
            level INTEGER NOT NULL,
            last_seen INTEGER NOT NULL
        ) STRICT;
    "#,
};

const SCHEMA_VERSION_DDL: &str = r#"
    CREATE TABLE IF NOT EXISTS schema_version (
        key TEXT PRIMARY KEY NOT NULL,
        val INTEGER NOT NULL
    ) STRICT;
"#;

/// Apply connection pragmas for the write path.
///
/// Foreign keys are enforced by default; the upsert path relaxes them per call.
pub fn apply_pragmas(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(
        r#"
        PRAGMA busy_timeout = 5000;
        PRAGMA journal_mode = WAL;
        PRAGMA synchronous = NORMAL;
        PRAGMA foreign_keys = ON;
        "#,
    )
}

/// Check whether a table exists.
pub fn table_exists(conn: &Connection, name: &str) -> rusqlite::Result<bool> {
    conn.query_row(
        "SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?1 LIMIT 1",
        params![name],
        |_| Ok(()),
    )
    .optional()
    .map(|found| found.is_some())
}

/// Create the version-tracking table if missing.
pub fn create_version_table(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(SCHEMA_VERSION_DDL)
}

/// Create every missing data table with its indexes.
///
/// Returns the tables that were actually created.
pub fn initialize_schema(conn: &Connection) -> rusqlite::Result<Vec<&'static str>> {
    let mut created = Vec::new();
    for kind in EntityKind::ALL {
        let table = kind.table();
        if !table_exists(conn, table.name)? {
            tracing::info!(table = table.name, "Creating table");
            created.push(table.name);
        }
        conn.execute_batch(table.ddl)?;
    }
    Ok(created)
}

/// Drop every data table and the version table.
///
/// Access tokens survive a data reset. Foreign keys are off for the duration,
/// since dropping a referenced table would otherwise trip enforcement.
pub fn drop_tables(conn: &Connection) -> rusqlite::Result<Vec<&'static str>> {
    conn.pragma_update(None, "foreign_keys", false)?;
    let result = drop_data_tables(conn);
    conn.pragma_update(None, "foreign_keys", true)?;
    result
}

fn drop_data_tables(conn: &Connection) -> rusqlite::Result<Vec<&'static str>> {
    let mut dropped = Vec::new();
    let names = EntityKind::ALL
        .iter()
        .filter(|kind| **kind != EntityKind::AccessToken)
        .map(|kind| kind.table().name)
        .chain(std::iter::once(SCHEMA_VERSION_TABLE));

    for name in names {
        if table_exists(conn, name)? {
            tracing::info!(table = name, "Dropping table");
            conn.execute_batch(&format!("DROP TABLE IF EXISTS {name}"))?;
            dropped.push(name);
        }
    }
    Ok(dropped)
}
