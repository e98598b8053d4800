//! Helpers for database-backed tests.
//!
//! These tests need a disposable PostgreSQL (`DATABASE_URL`); they are
//! `#[ignore]`d so the default `cargo test` run stays hermetic. Each helper
//! provisions uniquely-named rows so test runs never collide.

use crate::db::models::{NewDevice, NewSite};
use crate::schema;
use diesel::prelude::*;
use diesel::PgConnection;
use diesel_migrations::MigrationHarness;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

static SEQ: AtomicU64 = AtomicU64::new(0);

pub fn unique_tag() -> String {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("clock after epoch")
        .as_nanos();
    format!("{:x}-{}", nanos, SEQ.fetch_add(1, Ordering::Relaxed))
}

pub fn database_url() -> String {
    std::env::var("DATABASE_URL").expect("DATABASE_URL must point at a disposable test database")
}

pub fn connect() -> PgConnection {
    let mut conn = PgConnection::establish(&database_url()).expect("test database reachable");
    conn.run_pending_migrations(crate::MIGRATIONS).expect("migrations apply");
    conn
}

pub fn provision_site(conn: &mut PgConnection, timezone: &str) -> i64 {
    use schema::sites::dsl as S;

    let new_site = NewSite {
        name: format!("test-site-{}", unique_tag()),
        timezone: timezone.to_string(),
        program_id: 1,
        company_id: 1,
        active: true,
    };
    diesel::insert_into(S::sites)
        .values(&new_site)
        .returning(S::id)
        .get_result(conn)
        .expect("insert test site")
}

pub fn provision_device(conn: &mut PgConnection, site_id: i64, wake_schedule: &str) -> (i64, String) {
    use schema::devices::dsl as D;

    let uid = format!("TESTCAM{}", unique_tag());
    let new_device = NewDevice {
        device_uid: uid.clone(),
        site_id: Some(site_id),
        name: None,
        wake_schedule: wake_schedule.to_string(),
        active: true,
        firmware_version: None,
        battery_state: None,
    };
    let id = diesel::insert_into(D::devices)
        .values(&new_device)
        .returning(D::id)
        .get_result(conn)
        .expect("insert test device");
    (id, uid)
}
