//! Image completion, failure and retry-by-stable-id.
//!
//! Retries never mint new rows: the (device, image name) pair is the
//! identity of a logical wake, and every retransmission lands on the row it
//! created the first time. `captured_at` is written once at ingest and
//! never again; it anchors the original telemetry and session membership.

use crate::db::models::{
    event_source, event_types, image_status, payload_status, Image, NewEvent, NewObservation,
    Observation, SiteSession, WakePayload,
};
use crate::error::CoreError;
use crate::schema;
use crate::services::session;
use chrono::Utc;
use diesel::prelude::*;
use diesel::PgConnection;
use log::{debug, info, warn};

/// Mark an upload finished: image complete, payload complete, session
/// counter bumped, observation emitted. A second call on a terminal image
/// is a no-op, not an error.
pub fn complete_image(conn: &mut PgConnection, image_id: i64, url: &str) -> Result<(), CoreError> {
    conn.transaction(|conn| {
        let Some(image) = lock_image_by_id(conn, image_id)? else {
            return Err(CoreError::ImageNotFound(format!("id {}", image_id)));
        };
        if image.is_terminal() {
            debug!("Completion: image {} already {}; ignoring complete", image.id, image.status);
            return Ok(());
        }

        set_image_complete(conn, image.id, url)?;
        let payload = linked_payload(conn, image.id)?;
        if let Some(payload) = &payload {
            set_payload_status(conn, payload.id, payload_status::COMPLETE)?;
            session::record_completed(conn, payload.session_id)?;
            emit_observation_once(conn, payload, url)?;
            check_drift(conn, payload.session_id)?;
        } else {
            warn!("Completion: image {} has no linked payload", image.id);
        }

        info!("Completion: image {} complete ({})", image.id, url);
        Ok(())
    })
}

/// Mark an upload failed and raise the alert record. A second call on a
/// terminal image is a no-op.
pub fn fail_image(
    conn: &mut PgConnection,
    image_id: i64,
    error_code: &str,
    error_message: &str,
) -> Result<(), CoreError> {
    conn.transaction(|conn| {
        use schema::images::dsl as I;

        let Some(image) = lock_image_by_id(conn, image_id)? else {
            return Err(CoreError::ImageNotFound(format!("id {}", image_id)));
        };
        if image.is_terminal() {
            debug!("Completion: image {} already {}; ignoring fail", image.id, image.status);
            return Ok(());
        }

        diesel::update(I::images.filter(I::id.eq(image.id)))
            .set((
                I::status.eq(image_status::FAILED),
                I::error_code.eq(Some(error_code)),
                I::error_message.eq(Some(error_message)),
                I::updated_at.eq(Utc::now()),
            ))
            .execute(conn)?;

        let payload = linked_payload(conn, image.id)?;
        let (site_id, session_id) = match &payload {
            Some(p) => {
                set_payload_status(conn, p.id, payload_status::FAILED)?;
                session::record_failed(conn, p.session_id)?;
                (Some(session_site(conn, p.session_id)?), Some(p.session_id))
            }
            None => (None, None),
        };

        let event = NewEvent::new(event_types::IMAGE_FAILED, event_source::COMPLETION, site_id, Some(image.device_id))
            .with_payload(serde_json::json!({
                "image_id": image.id,
                "image_name": image.image_name,
                "session_id": session_id,
                "error_code": error_code,
                "error_message": error_message,
                "retry_count": image.retry_count,
            }));
        session::insert_event(conn, &event)?;

        info!("Completion: image {} failed ({}: {})", image.id, error_code, error_message);
        Ok(())
    })
}

/// Retried transmission for a logical wake. The row is located by its
/// stable natural key and locked, so concurrent retries of the same image
/// serialize; retries of different images proceed independently.
///
/// With a url the image completes (reconciling the session's failed count
/// if it had already been counted failed); without one it goes back to
/// `receiving` while the retransmission runs.
pub fn retry_by_stable_id(
    conn: &mut PgConnection,
    device_uid: &str,
    image_name: &str,
    new_url: Option<&str>,
) -> Result<Image, CoreError> {
    conn.transaction(|conn| {
        use schema::images::dsl as I;

        let device_id = device_id_by_uid(conn, device_uid)?
            .ok_or_else(|| CoreError::ImageNotFound(format!("device {} / {}", device_uid, image_name)))?;

        let image: Option<Image> = I::images
            .filter(I::device_id.eq(device_id).and(I::image_name.eq(image_name)))
            .select(Image::as_select())
            .for_update()
            .first(conn)
            .optional()?;
        let image = image
            .ok_or_else(|| CoreError::ImageNotFound(format!("device {} / {}", device_uid, image_name)))?;

        let now = Utc::now();
        match new_url {
            Some(url) => {
                if image.status == image_status::COMPLETE && image.url.as_deref() == Some(url) {
                    // Duplicate delivery of a finished retry; the row is
                    // already in its terminal state.
                    debug!("Completion: retry for image {} is a duplicate; no-op", image.id);
                    return Ok(image);
                }

                diesel::update(I::images.filter(I::id.eq(image.id)))
                    .set((
                        I::status.eq(image_status::COMPLETE),
                        I::url.eq(Some(url)),
                        I::retry_count.eq(I::retry_count + 1),
                        I::resent_received_at.eq(Some(now)),
                        I::updated_at.eq(now),
                    ))
                    .execute(conn)?;

                let payload = linked_payload(conn, image.id)?;
                if let Some(payload) = &payload {
                    set_payload_status(conn, payload.id, payload_status::COMPLETE)?;
                    match image.status.as_str() {
                        // Was counted failed: move that count over.
                        s if s == image_status::FAILED => {
                            session::reconcile_failed_to_completed(conn, payload.session_id)?;
                        }
                        // First completion for this wake.
                        s if s == image_status::RECEIVING => {
                            session::record_completed(conn, payload.session_id)?;
                        }
                        // Already complete under a different url: counted.
                        _ => {}
                    }
                    emit_observation_once(conn, payload, url)?;
                    check_drift(conn, payload.session_id)?;
                }

                info!(
                    "Completion: retry completed image {} for device {} (attempt {})",
                    image.id,
                    device_uid,
                    image.retry_count + 1
                );
            }
            None => {
                diesel::update(I::images.filter(I::id.eq(image.id)))
                    .set((
                        I::status.eq(image_status::RECEIVING),
                        I::retry_count.eq(I::retry_count + 1),
                        I::resent_received_at.eq(Some(now)),
                        I::updated_at.eq(now),
                    ))
                    .execute(conn)?;
                info!(
                    "Completion: retry in progress for image {} on device {} (attempt {})",
                    image.id,
                    device_uid,
                    image.retry_count + 1
                );
            }
        }

        let refreshed: Image = I::images
            .filter(I::id.eq(image.id))
            .select(Image::as_select())
            .first(conn)?;
        Ok(refreshed)
    })
}

fn lock_image_by_id(conn: &mut PgConnection, image_id: i64) -> Result<Option<Image>, CoreError> {
    use schema::images::dsl as I;

    let image = I::images
        .filter(I::id.eq(image_id))
        .select(Image::as_select())
        .for_update()
        .first(conn)
        .optional()?;
    Ok(image)
}

fn device_id_by_uid(conn: &mut PgConnection, device_uid: &str) -> Result<Option<i64>, CoreError> {
    use schema::devices::dsl as D;

    let id = D::devices
        .filter(D::device_uid.eq(device_uid))
        .select(D::id)
        .first(conn)
        .optional()?;
    Ok(id)
}

fn set_image_complete(conn: &mut PgConnection, image_id: i64, url: &str) -> Result<(), CoreError> {
    use schema::images::dsl as I;

    diesel::update(I::images.filter(I::id.eq(image_id)))
        .set((
            I::status.eq(image_status::COMPLETE),
            I::url.eq(Some(url)),
            I::updated_at.eq(Utc::now()),
        ))
        .execute(conn)?;
    Ok(())
}

fn linked_payload(conn: &mut PgConnection, image_id: i64) -> Result<Option<WakePayload>, CoreError> {
    use schema::wake_payloads::dsl as P;

    let payload = P::wake_payloads
        .filter(P::image_id.eq(image_id))
        .select(WakePayload::as_select())
        .first(conn)
        .optional()?;
    Ok(payload)
}

fn set_payload_status(conn: &mut PgConnection, payload_id: i64, status: &str) -> Result<(), CoreError> {
    use schema::wake_payloads::dsl as P;

    diesel::update(P::wake_payloads.filter(P::id.eq(payload_id)))
        .set((P::status.eq(status), P::updated_at.eq(Utc::now())))
        .execute(conn)?;
    Ok(())
}

fn session_site(conn: &mut PgConnection, session_id: i64) -> Result<i64, CoreError> {
    use schema::site_sessions::dsl as S;

    let site_id = S::site_sessions
        .filter(S::id.eq(session_id))
        .select(S::site_id)
        .first(conn)?;
    Ok(site_id)
}

/// Emit the downstream observation for a completed upload, once per url.
/// The lookup-then-insert guard keeps repeated completions and retries from
/// double-reporting.
fn emit_observation_once(conn: &mut PgConnection, payload: &WakePayload, url: &str) -> Result<(), CoreError> {
    use schema::observations::dsl as O;
    use schema::site_sessions::dsl as S;
    use schema::sites::dsl as ST;

    let existing: Option<Observation> = O::observations
        .filter(O::url.eq(url))
        .select(Observation::as_select())
        .first(conn)
        .optional()?;
    if existing.is_some() {
        return Ok(());
    }

    let session: SiteSession = S::site_sessions
        .filter(S::id.eq(payload.session_id))
        .select(SiteSession::as_select())
        .first(conn)?;
    let (program_id, company_id): (i64, i64) = ST::sites
        .filter(ST::id.eq(session.site_id))
        .select((ST::program_id, ST::company_id))
        .first(conn)?;

    let observation = NewObservation {
        time: Utc::now(),
        site_id: session.site_id,
        program_id,
        company_id,
        device_id: payload.device_id,
        payload_id: Some(payload.id),
        url: url.to_string(),
    };
    diesel::insert_into(O::observations).values(&observation).execute(conn)?;
    Ok(())
}

fn check_drift(conn: &mut PgConnection, session_id: i64) -> Result<(), CoreError> {
    use schema::site_sessions::dsl as S;
    use schema::wake_payloads::dsl as P;

    let session: SiteSession = S::site_sessions
        .filter(S::id.eq(session_id))
        .select(SiteSession::as_select())
        .first(conn)?;
    let payload_total: i64 = P::wake_payloads
        .filter(P::session_id.eq(session_id))
        .count()
        .get_result(conn)?;
    session::verify_counters(conn, &session, payload_total)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::ingest;
    use crate::telemetry::Telemetry;
    use crate::wake_schedule::WakeTolerance;
    use chrono::{DateTime, NaiveDate, Utc};

    fn wake_instant(hour: u32, minute: u32) -> DateTime<Utc> {
        NaiveDate::from_ymd_opt(2027, 4, 12)
            .unwrap()
            .and_hms_opt(hour, minute, 0)
            .unwrap()
            .and_utc()
    }

    fn sample_telemetry() -> Telemetry {
        Telemetry {
            temperature_c: Some(23.5),
            humidity_pct: Some(91.0),
            pressure_hpa: Some(1011.0),
            gas_resistance_kohm: Some(16.8),
            battery_v: Some(3.88),
            signal_dbm: Some(-70.0),
            extra: Default::default(),
        }
    }

    fn image_row(conn: &mut PgConnection, image_id: i64) -> Image {
        use schema::images::dsl as I;
        I::images
            .filter(I::id.eq(image_id))
            .select(Image::as_select())
            .first(conn)
            .expect("image row")
    }

    fn session_row(conn: &mut PgConnection, session_id: i64) -> SiteSession {
        use schema::site_sessions::dsl as S;
        S::site_sessions
            .filter(S::id.eq(session_id))
            .select(SiteSession::as_select())
            .first(conn)
            .expect("session row")
    }

    #[test]
    #[ignore = "requires a live PostgreSQL (set DATABASE_URL)"]
    fn failed_upload_recovers_through_retry_with_stable_identity() {
        let mut conn = crate::testutil::connect();
        let site_id = crate::testutil::provision_site(&mut conn, "Etc/UTC");
        let (device_id, device_uid) = crate::testutil::provision_device(&mut conn, site_id, "08:00,16:00 daily");

        let receipt = ingest::ingest_wake(
            &mut conn,
            &device_uid,
            wake_instant(8, 2),
            "img1.jpg",
            &sample_telemetry(),
            WakeTolerance::default(),
        )
        .expect("ingest");
        assert_eq!(receipt.wake_index, 1);
        assert!(!receipt.overage);
        let original_captured_at = image_row(&mut conn, receipt.image_id).captured_at;

        fail_image(&mut conn, receipt.image_id, "CHUNK_TIMEOUT", "missing chunks").expect("fail");
        let session = session_row(&mut conn, receipt.session_id);
        assert_eq!(session.failed_count, 1);
        assert_eq!(session.completed_count, 0);

        let url = "https://storage.example.com/img1.jpg";
        let retried =
            retry_by_stable_id(&mut conn, &device_uid, "img1.jpg", Some(url)).expect("retry");
        assert_eq!(retried.status, image_status::COMPLETE);
        assert_eq!(retried.url.as_deref(), Some(url));
        assert_eq!(retried.retry_count, 1);
        assert_eq!(retried.captured_at, original_captured_at);

        let session = session_row(&mut conn, receipt.session_id);
        assert_eq!(session.completed_count, 1);
        assert_eq!(session.failed_count, 0);

        // Re-applying the same retry leaves the terminal state untouched and
        // never mints a second image row.
        let again = retry_by_stable_id(&mut conn, &device_uid, "img1.jpg", Some(url)).expect("retry again");
        assert_eq!(again.status, retried.status);
        assert_eq!(again.url, retried.url);
        assert_eq!(again.retry_count, retried.retry_count);
        assert_eq!(again.captured_at, original_captured_at);

        use schema::images::dsl as I;
        let row_count: i64 = I::images
            .filter(I::device_id.eq(device_id).and(I::image_name.eq("img1.jpg")))
            .count()
            .get_result(&mut conn)
            .expect("count");
        assert_eq!(row_count, 1);

        use schema::observations::dsl as O;
        let observation_count: i64 = O::observations
            .filter(O::url.eq(url))
            .count()
            .get_result(&mut conn)
            .expect("count");
        assert_eq!(observation_count, 1, "one observation per url");

        let session = session_row(&mut conn, receipt.session_id);
        assert_eq!(session.completed_count, 1);
        assert_eq!(session.failed_count, 0);
    }

    #[test]
    #[ignore = "requires a live PostgreSQL (set DATABASE_URL)"]
    fn terminal_images_ignore_repeat_outcomes() {
        let mut conn = crate::testutil::connect();
        let site_id = crate::testutil::provision_site(&mut conn, "Etc/UTC");
        let (_, device_uid) = crate::testutil::provision_device(&mut conn, site_id, "08:00,16:00 daily");

        let receipt = ingest::ingest_wake(
            &mut conn,
            &device_uid,
            wake_instant(16, 1),
            "img2.jpg",
            &sample_telemetry(),
            WakeTolerance::default(),
        )
        .expect("ingest");

        let url = "https://storage.example.com/img2.jpg";
        complete_image(&mut conn, receipt.image_id, url).expect("complete");
        complete_image(&mut conn, receipt.image_id, url).expect("second complete is a no-op");
        fail_image(&mut conn, receipt.image_id, "LATE", "already done").expect("fail after complete is a no-op");

        let image = image_row(&mut conn, receipt.image_id);
        assert_eq!(image.status, image_status::COMPLETE);

        let session = session_row(&mut conn, receipt.session_id);
        assert_eq!(session.completed_count, 1);
        assert_eq!(session.failed_count, 0);
    }

    #[test]
    #[ignore = "requires a live PostgreSQL (set DATABASE_URL)"]
    fn retry_against_an_unknown_name_is_surfaced() {
        let mut conn = crate::testutil::connect();
        let site_id = crate::testutil::provision_site(&mut conn, "Etc/UTC");
        let (_, device_uid) = crate::testutil::provision_device(&mut conn, site_id, "08:00,16:00 daily");

        let err = retry_by_stable_id(&mut conn, &device_uid, "never_sent.jpg", None).unwrap_err();
        assert!(matches!(err, CoreError::ImageNotFound(_)), "got {err}");
    }
}
