//! Tests for the one-shot maintenance commands.

mod common;

use chrono::{Duration, Utc};
use common::{count, spawns, TestFixture};
use mapkeep::config::Config;
use mapkeep::model::AccessToken;
use mapkeep::server::{open_database, run_maintenance};
use mapkeep::storage::{Batch, Batcher};

fn seeded(fixture: &TestFixture) -> Config {
    let config = Config::test_config(fixture.db_path.clone());
    let pool = open_database(&config).unwrap();
    let mut conn = pool.get().unwrap();
    let batcher = Batcher::default();
    batcher
        .upsert(
            &mut conn,
            &Batch::from_entities(vec![
                AccessToken {
                    token: "tok-a".into(),
                    name: "north-scanner".into(),
                },
                AccessToken {
                    token: "tok-b".into(),
                    name: "south-scanner".into(),
                },
            ]),
        )
        .unwrap();
    batcher
        .upsert(
            &mut conn,
            &Batch::from_entities(spawns(20, Utc::now() + Duration::minutes(5))),
        )
        .unwrap();
    config
}

fn run(config: &Config) -> String {
    let mut out = Vec::new();
    run_maintenance(config, &mut out).unwrap();
    String::from_utf8(out).unwrap()
}

#[test]
fn test_clear_db_drops_data_and_keeps_tokens() {
    let fixture = TestFixture::new();
    let mut config = seeded(&fixture);
    config.clear_db = true;

    let output = run(&config);
    assert!(output.contains("Cleared database"));

    let pool = fixture.pool();
    assert_eq!(count(&pool, "spawn"), 0);
    assert_eq!(count(&pool, "access_token"), 2);
    assert_eq!(count(&pool, "schema_version"), 1);
}

#[test]
fn test_list_tokens() {
    let fixture = TestFixture::new();
    let mut config = seeded(&fixture);
    config.list_tokens = true;

    let output = run(&config);
    let lines: Vec<&str> = output.lines().collect();
    assert_eq!(lines, vec!["north-scanner\ttok-a", "south-scanner\ttok-b"]);
}

#[test]
fn test_revoke_token() {
    let fixture = TestFixture::new();
    let mut config = seeded(&fixture);
    config.revoke_token = Some("tok-a".into());

    assert_eq!(run(&config).trim(), "Revoked tok-a");
    assert_eq!(run(&config).trim(), "No such token: tok-a");
    assert_eq!(count(&fixture.pool(), "access_token"), 1);
}
