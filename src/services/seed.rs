//! Deterministic demo fleet for development databases.
//!
//! Seeds one site with a handful of camera devices and replays yesterday's
//! wake schedule through the real ingestion/completion entry points:
//! on-time wakes, a failed upload that recovers through a retry, one that
//! stays failed, and an off-schedule wake. Everything is derived from a
//! fixed RNG seed so repeated runs converge on the same fleet.

use crate::db::models::{NewDevice, NewSite, Site};
use crate::error::CoreError;
use crate::schema;
use crate::services::{completion, ingest, risk_state, session};
use crate::telemetry::{self, Telemetry};
use crate::wake_schedule::{WakeSchedule, WakeTolerance};
use chrono::{DateTime, Duration, NaiveTime, TimeZone, Timelike, Utc};
use diesel::prelude::*;
use diesel::PgConnection;
use log::info;
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use std::f64::consts::PI;

const SITE_NAME: &str = "Orchard North";
const SITE_TIMEZONE: &str = "Europe/Ljubljana";
const PROGRAM_ID: i64 = 7001;
const COMPANY_ID: i64 = 42;

const DEVICES: [(&str, &str); 3] = [
    ("B8F862F9CFB8", "08:00,16:00 daily"),
    ("B8F862F9ECF8", "08:00,16:00 daily"),
    ("A0B7656E21D4", "06:00,12:00,18:00 daily"),
];

pub fn run(conn: &mut PgConnection, tolerance: WakeTolerance) -> Result<(), CoreError> {
    let site_id = ensure_site(conn)?;
    let devices = ensure_devices(conn, site_id)?;
    let mut rng = SmallRng::seed_from_u64(0x00B8_F862_F9CF_B8u64);

    let tz = SITE_TIMEZONE.parse::<chrono_tz::Tz>().unwrap_or(chrono_tz::UTC);
    let yesterday = (Utc::now() - Duration::days(1)).with_timezone(&tz).date_naive();

    info!(
        "Seed: replaying {} for site {} ({} device(s))",
        yesterday,
        SITE_NAME,
        devices.len()
    );

    let mut wakes = 0usize;
    for (device_index, (device_uid, schedule_expr)) in DEVICES.iter().enumerate() {
        let schedule = WakeSchedule::parse(schedule_expr).expect("seed schedules parse");
        for (slot_index, slot) in schedule.slots().iter().enumerate() {
            let captured_at = local_instant(tz, yesterday, *slot) + jitter(&mut rng);
            replay_wake(
                conn,
                device_uid,
                captured_at,
                &mut rng,
                tolerance,
                device_index,
                slot_index,
            )?;
            wakes += 1;
        }
    }

    // One out-of-schedule wake: mid-morning, hours away from any slot.
    let stray_at = local_instant(tz, yesterday, NaiveTime::from_hms_opt(11, 7, 0).unwrap());
    let receipt = ingest::ingest_wake(
        conn,
        DEVICES[0].0,
        stray_at,
        &image_name_for(stray_at),
        &synthetic_telemetry(&mut rng, 0.47),
        tolerance,
    )?;
    completion::complete_image(conn, receipt.image_id, &upload_url(DEVICES[0].0, stray_at))?;
    wakes += 1;

    let summary = session::get_session_summary(conn, receipt.session_id)?;
    info!(
        "Seed: complete ({} wake(s); session {} holds {} payload(s): completed={} failed={} extra={})",
        wakes,
        summary.session.id,
        summary.payload_total,
        summary.session.completed_count,
        summary.session.failed_count,
        summary.session.extra_count
    );

    let risk = risk_state::get_site_risk_summary(conn, site_id)?;
    info!(
        "Seed: site risk: {}/{} device(s) with state, worst index {:?} ({:?}), {} at critical RH",
        risk.devices_with_state,
        risk.device_total,
        risk.worst_index,
        risk.worst_level,
        risk.devices_at_critical_rh
    );
    for (device_id, device_uid) in &devices {
        if let Some(state) = risk_state::get_device_risk_state(conn, *device_id)? {
            info!(
                "Seed: device {} index {:.3} ({}), +72h {:?}",
                device_uid, state.mold_index, state.risk_level, state.forecast_72h_index
            );
        }
    }
    Ok(())
}

/// Feed one scheduled wake through ingest and drive its upload to an
/// outcome: most complete first try, the second device's morning slot fails
/// and recovers via retry, and the third device's noon slot stays failed.
fn replay_wake(
    conn: &mut PgConnection,
    device_uid: &str,
    captured_at: DateTime<Utc>,
    rng: &mut SmallRng,
    tolerance: WakeTolerance,
    device_index: usize,
    slot_index: usize,
) -> Result<(), CoreError> {
    let day_fraction =
        f64::from(captured_at.with_timezone(&chrono_tz::UTC).time().num_seconds_from_midnight()) / 86_400.0;
    let image_name = image_name_for(captured_at);
    let receipt = ingest::ingest_wake(
        conn,
        device_uid,
        captured_at,
        &image_name,
        &synthetic_telemetry(rng, day_fraction),
        tolerance,
    )?;

    let url = upload_url(device_uid, captured_at);
    match (device_index, slot_index) {
        (1, 0) => {
            // Chunked upload stalls, device retries with the full object.
            completion::fail_image(conn, receipt.image_id, "CHUNK_TIMEOUT", "missing 3 of 11 chunks")?;
            completion::retry_by_stable_id(conn, device_uid, &image_name, Some(&url))?;
        }
        (2, 1) => {
            completion::fail_image(conn, receipt.image_id, "SIGNAL_LOST", "device went dark mid-upload")?;
        }
        _ => {
            completion::complete_image(conn, receipt.image_id, &url)?;
        }
    }
    Ok(())
}

fn ensure_site(conn: &mut PgConnection) -> Result<i64, CoreError> {
    use schema::sites::dsl as S;

    let existing: Option<Site> = S::sites
        .filter(S::name.eq(SITE_NAME))
        .select(Site::as_select())
        .first(conn)
        .optional()?;
    if let Some(site) = existing {
        return Ok(site.id);
    }

    let new_site = NewSite {
        name: SITE_NAME.to_string(),
        timezone: SITE_TIMEZONE.to_string(),
        program_id: PROGRAM_ID,
        company_id: COMPANY_ID,
        active: true,
    };
    let id = diesel::insert_into(S::sites)
        .values(&new_site)
        .returning(S::id)
        .get_result(conn)?;
    Ok(id)
}

fn ensure_devices(conn: &mut PgConnection, site_id: i64) -> Result<Vec<(i64, String)>, CoreError> {
    use schema::devices::dsl as D;

    let mut out = Vec::with_capacity(DEVICES.len());
    for (index, (uid, schedule)) in DEVICES.iter().enumerate() {
        let new_device = NewDevice {
            device_uid: (*uid).to_string(),
            site_id: Some(site_id),
            name: Some(format!("Canopy cam {}", index + 1)),
            wake_schedule: (*schedule).to_string(),
            active: true,
            firmware_version: Some("2.4.1".to_string()),
            battery_state: Some("NORMAL".to_string()),
        };
        diesel::insert_into(D::devices)
            .values(&new_device)
            .on_conflict(D::device_uid)
            .do_update()
            .set((
                D::site_id.eq(new_device.site_id),
                D::wake_schedule.eq(new_device.wake_schedule.clone()),
                D::active.eq(new_device.active),
                D::updated_at.eq(Utc::now()),
            ))
            .execute(conn)?;

        let id: i64 = D::devices
            .filter(D::device_uid.eq(*uid))
            .select(D::id)
            .first(conn)?;
        out.push((id, (*uid).to_string()));
    }
    Ok(out)
}

fn local_instant(tz: chrono_tz::Tz, date: chrono::NaiveDate, time: NaiveTime) -> DateTime<Utc> {
    tz.from_local_datetime(&date.and_time(time))
        .earliest()
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|| Utc.from_utc_datetime(&date.and_time(time)))
}

fn jitter(rng: &mut SmallRng) -> Duration {
    Duration::seconds(rng.random_range(-180..=300))
}

fn image_name_for(at: DateTime<Utc>) -> String {
    format!("image_{}.jpg", at.timestamp_millis())
}

fn upload_url(device_uid: &str, at: DateTime<Utc>) -> String {
    format!(
        "https://storage.example.com/{}/{}",
        device_uid,
        image_name_for(at)
    )
}

/// BME680-flavored environmentals: warm humid mornings, drier afternoons,
/// battery sagging through the day. Rendered as the JSON a gateway would
/// hand over and pushed through the real decoder.
fn synthetic_telemetry(rng: &mut SmallRng, day_fraction: f64) -> Telemetry {
    let diurnal = ((day_fraction - 0.3) * 2.0 * PI).sin();
    let temperature = (21.5 + diurnal * 4.0 + rng.random_range(-1.2..=1.2)).clamp(4.0, 38.0);
    let humidity = (78.0 - diurnal * 9.0 + rng.random_range(-4.0..=4.0)).clamp(35.0, 98.0);
    let pressure: f64 = 1013.0 + rng.random_range(-4.5..=4.5);
    let gas: f64 = (14.0f64 + rng.random_range(-3.0..=6.0)).max(1.0);
    let battery = (4.05 - day_fraction * 0.22 + rng.random_range(-0.03..=0.03)).clamp(3.3, 4.2);
    let signal = -55.0 - rng.random_range(0.0..=25.0);

    let report = serde_json::json!({
        "temperature_c": round1(temperature),
        "humidity_pct": round1(humidity),
        "pressure_hpa": (pressure * 100.0).round() / 100.0,
        "gas_resistance_kohm": round1(gas),
        "battery_v": (battery * 100.0).round() / 100.0,
        "signal_dbm": round1(signal),
        "boot_count": rng.random_range(40..=900),
    })
    .to_string();
    telemetry::decode(&report).expect("seed telemetry decodes")
}

fn round1(v: f64) -> f64 {
    (v * 10.0).round() / 10.0
}
