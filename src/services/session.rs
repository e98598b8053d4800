//! Daily, site-scoped wake sessions.
//!
//! A session is the midnight-to-midnight (site-local) aggregation unit for
//! one site's fleet. Creation is race-safe: concurrent first wakes all
//! insert with `ON CONFLICT DO NOTHING` against the (site_id, session_date)
//! unique constraint and then read back the single surviving row. Counters
//! move only by atomic single-statement increments guarded by the lock
//! state, so concurrent completions never lose updates.

use crate::db::models::{
    event_source, event_types, session_status, NewEvent, NewSiteSession, Site, SiteSession,
};
use crate::error::CoreError;
use crate::lineage::parse_site_timezone;
use crate::schema;
use crate::wake_schedule::WakeSchedule;
use chrono::{DateTime, Duration, NaiveDate, NaiveTime, TimeZone, Utc};
use chrono_tz::Tz;
use diesel::prelude::*;
use diesel::PgConnection;
use log::{debug, info, warn};

/// Site-local calendar day and its UTC bounds for a given instant.
pub fn local_day_bounds(tz: Tz, at: DateTime<Utc>) -> (NaiveDate, DateTime<Utc>, DateTime<Utc>) {
    let date = at.with_timezone(&tz).date_naive();
    let start = local_midnight_utc(tz, date);
    let end = local_midnight_utc(tz, date.succ_opt().unwrap_or(date));
    (date, start, end)
}

fn local_midnight_utc(tz: Tz, date: NaiveDate) -> DateTime<Utc> {
    let mut naive = date.and_time(NaiveTime::MIN);
    // A DST jump can erase local midnight; slide forward to the first
    // instant that exists.
    for _ in 0..3 {
        if let Some(dt) = tz.from_local_datetime(&naive).earliest() {
            return dt.with_timezone(&Utc);
        }
        naive += Duration::hours(1);
    }
    Utc.from_utc_datetime(&date.and_time(NaiveTime::MIN))
}

/// Sum of daily schedule slots across the site's active devices. Devices
/// with an unparseable schedule are skipped with a warning rather than
/// blocking the session open.
fn expected_wake_count(conn: &mut PgConnection, site_id: i64) -> Result<i32, CoreError> {
    use schema::devices::dsl as D;

    let schedules: Vec<(String, String)> = D::devices
        .filter(D::site_id.eq(site_id).and(D::active.eq(true)))
        .select((D::device_uid, D::wake_schedule))
        .load(conn)?;

    let mut total: i32 = 0;
    for (device_uid, expr) in schedules {
        match WakeSchedule::parse(&expr) {
            Ok(s) => total += s.slot_count() as i32,
            Err(e) => warn!(
                "Session: device {} schedule {:?} unparseable ({}); not counted",
                device_uid, expr, e
            ),
        }
    }
    Ok(total)
}

/// Fetch or create the session covering `at` for the site. The insert is
/// conflict-tolerant; whoever loses the race reads the winner's row.
pub fn get_or_open_session(
    conn: &mut PgConnection,
    site_id: i64,
    tz: Tz,
    at: DateTime<Utc>,
) -> Result<SiteSession, CoreError> {
    use schema::site_sessions::dsl as S;

    let (date, started_at, ends_at) = local_day_bounds(tz, at);

    let existing: Option<SiteSession> = S::site_sessions
        .filter(S::site_id.eq(site_id).and(S::session_date.eq(date)))
        .select(SiteSession::as_select())
        .first(conn)
        .optional()?;
    if let Some(session) = existing {
        return Ok(session);
    }

    let new_session = NewSiteSession {
        site_id,
        session_date: date,
        started_at,
        ends_at,
        expected_wake_count: expected_wake_count(conn, site_id)?,
        status: session_status::PENDING.to_string(),
    };

    let inserted = diesel::insert_into(S::site_sessions)
        .values(&new_session)
        .on_conflict((S::site_id, S::session_date))
        .do_nothing()
        .execute(conn)?;
    if inserted > 0 {
        info!(
            "Session: opened site {} day {} (expected {} wake(s))",
            site_id, date, new_session.expected_wake_count
        );
    } else {
        debug!("Session: site {} day {} created concurrently; reusing", site_id, date);
    }

    let session: SiteSession = S::site_sessions
        .filter(S::site_id.eq(site_id).and(S::session_date.eq(date)))
        .select(SiteSession::as_select())
        .first(conn)?;
    Ok(session)
}

/// First payload flips a pending session to in-progress.
pub fn mark_in_progress(conn: &mut PgConnection, session_id: i64) -> Result<(), CoreError> {
    use schema::site_sessions::dsl as S;

    diesel::update(
        S::site_sessions.filter(S::id.eq(session_id).and(S::status.eq(session_status::PENDING))),
    )
    .set((
        S::status.eq(session_status::IN_PROGRESS),
        S::updated_at.eq(Utc::now()),
    ))
    .execute(conn)?;
    Ok(())
}

#[derive(Debug, Clone, Copy)]
enum Counter {
    Completed,
    Failed,
    Extra,
}

/// Atomic `+1` on one of the session counters, refused once the session is
/// locked. The guard lives in the WHERE clause, so two concurrent
/// completions both land and a late one fails cleanly.
fn bump(conn: &mut PgConnection, session_id: i64, counter: Counter) -> Result<(), CoreError> {
    use schema::site_sessions::dsl as S;

    let target = S::site_sessions.filter(S::id.eq(session_id).and(S::status.ne(session_status::LOCKED)));
    let now = Utc::now();
    let updated = match counter {
        Counter::Completed => diesel::update(target)
            .set((S::completed_count.eq(S::completed_count + 1), S::updated_at.eq(now)))
            .execute(conn)?,
        Counter::Failed => diesel::update(target)
            .set((S::failed_count.eq(S::failed_count + 1), S::updated_at.eq(now)))
            .execute(conn)?,
        Counter::Extra => diesel::update(target)
            .set((S::extra_count.eq(S::extra_count + 1), S::updated_at.eq(now)))
            .execute(conn)?,
    };

    if updated == 0 {
        return Err(refusal_reason(conn, session_id)?);
    }
    Ok(())
}

/// A guarded update that matched nothing means either a locked session or a
/// bogus id; look once to tell callers which.
fn refusal_reason(conn: &mut PgConnection, session_id: i64) -> Result<CoreError, CoreError> {
    use schema::site_sessions::dsl as S;

    let session: Option<SiteSession> = S::site_sessions
        .filter(S::id.eq(session_id))
        .select(SiteSession::as_select())
        .first(conn)
        .optional()?;
    Ok(match session {
        Some(s) => CoreError::SessionLocked {
            site_id: s.site_id,
            date: s.session_date,
        },
        None => CoreError::SessionNotFound(session_id),
    })
}

pub fn record_completed(conn: &mut PgConnection, session_id: i64) -> Result<(), CoreError> {
    bump(conn, session_id, Counter::Completed)
}

pub fn record_failed(conn: &mut PgConnection, session_id: i64) -> Result<(), CoreError> {
    bump(conn, session_id, Counter::Failed)
}

pub fn record_extra(conn: &mut PgConnection, session_id: i64) -> Result<(), CoreError> {
    bump(conn, session_id, Counter::Extra)
}

/// Move one count from `failed` to `completed` after a retried image makes
/// it through. Runs as a single statement so the two columns never drift
/// apart under concurrency.
pub fn reconcile_failed_to_completed(conn: &mut PgConnection, session_id: i64) -> Result<(), CoreError> {
    use schema::site_sessions::dsl as S;

    let updated = diesel::update(
        S::site_sessions.filter(
            S::id
                .eq(session_id)
                .and(S::status.ne(session_status::LOCKED))
                .and(S::failed_count.gt(0)),
        ),
    )
    .set((
        S::completed_count.eq(S::completed_count + 1),
        S::failed_count.eq(S::failed_count - 1),
        S::updated_at.eq(Utc::now()),
    ))
    .execute(conn)?;

    if updated == 0 {
        // Either the session is gone/locked, or failed_count was already
        // zero. The latter is counter drift: record it, count the
        // completion, and keep serving.
        if let Some(err) = refusal_applies(conn, session_id)? {
            return Err(err);
        }
        warn!(
            "Session: reconcile on session {} found failed_count already at zero",
            session_id
        );
        emit_drift_event(conn, session_id)?;
        bump(conn, session_id, Counter::Completed)?;
    }
    Ok(())
}

fn refusal_applies(conn: &mut PgConnection, session_id: i64) -> Result<Option<CoreError>, CoreError> {
    use schema::site_sessions::dsl as S;

    let session: Option<SiteSession> = S::site_sessions
        .filter(S::id.eq(session_id))
        .select(SiteSession::as_select())
        .first(conn)
        .optional()?;
    Ok(match session {
        None => Some(CoreError::SessionNotFound(session_id)),
        Some(s) if s.is_locked() => Some(CoreError::SessionLocked {
            site_id: s.site_id,
            date: s.session_date,
        }),
        Some(_) => None,
    })
}

/// One-way transition; after this, counter mutations fail with
/// `SessionLocked` and late wakes reroute to the next day's session.
pub fn lock_session(conn: &mut PgConnection, site_id: i64, date: NaiveDate) -> Result<(), CoreError> {
    use schema::site_sessions::dsl as S;

    let session: Option<SiteSession> = S::site_sessions
        .filter(S::site_id.eq(site_id).and(S::session_date.eq(date)))
        .select(SiteSession::as_select())
        .first(conn)
        .optional()?;
    let Some(session) = session else {
        warn!("Session: lock requested for site {} day {} but no session exists", site_id, date);
        return Ok(());
    };
    if session.is_locked() {
        return Ok(());
    }

    diesel::update(S::site_sessions.filter(S::id.eq(session.id)))
        .set((S::status.eq(session_status::LOCKED), S::updated_at.eq(Utc::now())))
        .execute(conn)?;

    let event = NewEvent::new(event_types::SESSION_LOCKED, event_source::SCHEDULER, Some(site_id), None)
        .with_payload(serde_json::json!({
            "session_id": session.id,
            "session_date": date,
            "completed": session.completed_count,
            "failed": session.failed_count,
            "extra": session.extra_count,
            "expected": session.expected_wake_count,
        }));
    insert_event(conn, &event)?;

    info!("Session: locked site {} day {}", site_id, date);
    Ok(())
}

/// Scheduler entry point: eagerly open today's session for every active
/// site. Returns how many sites now have one.
pub fn open_daily_sessions(conn: &mut PgConnection, now: DateTime<Utc>) -> Result<usize, CoreError> {
    use schema::sites::dsl as S;

    let sites: Vec<Site> = S::sites
        .filter(S::active.eq(true))
        .select(Site::as_select())
        .load(conn)?;

    let mut opened = 0;
    for site in &sites {
        let tz = parse_site_timezone(site.id, &site.timezone);
        get_or_open_session(conn, site.id, tz, now)?;
        opened += 1;
    }
    debug!("Session: daily open pass covered {} site(s)", opened);
    Ok(opened)
}

/// Scheduler entry point: lock every session whose end instant has passed.
pub fn lock_expired_sessions(conn: &mut PgConnection, now: DateTime<Utc>) -> Result<usize, CoreError> {
    use schema::site_sessions::dsl as S;

    let expired: Vec<SiteSession> = S::site_sessions
        .filter(S::ends_at.le(now).and(S::status.ne(session_status::LOCKED)))
        .select(SiteSession::as_select())
        .load(conn)?;

    for session in &expired {
        lock_session(conn, session.site_id, session.session_date)?;
    }
    if !expired.is_empty() {
        info!("Session: locked {} expired session(s)", expired.len());
    }
    Ok(expired.len())
}

#[derive(Debug, Clone)]
pub struct SessionSummary {
    pub session: SiteSession,
    pub payload_total: i64,
    pub overage_total: i64,
}

pub fn get_session_summary(conn: &mut PgConnection, session_id: i64) -> Result<SessionSummary, CoreError> {
    use schema::site_sessions::dsl as S;
    use schema::wake_payloads::dsl as P;

    let session: SiteSession = S::site_sessions
        .filter(S::id.eq(session_id))
        .select(SiteSession::as_select())
        .first(conn)
        .optional()?
        .ok_or(CoreError::SessionNotFound(session_id))?;

    let payload_total: i64 = P::wake_payloads
        .filter(P::session_id.eq(session_id))
        .count()
        .get_result(conn)?;
    let overage_total: i64 = P::wake_payloads
        .filter(P::session_id.eq(session_id).and(P::overage.eq(true)))
        .count()
        .get_result(conn)?;

    verify_counters(conn, &session, payload_total)?;

    Ok(SessionSummary {
        session,
        payload_total,
        overage_total,
    })
}

/// Terminal counters can never exceed the payloads that exist. A violation
/// is correctness debt to surface, not a reason to stop serving.
pub fn verify_counters(
    conn: &mut PgConnection,
    session: &SiteSession,
    payload_total: i64,
) -> Result<(), CoreError> {
    let terminal = i64::from(session.completed_count) + i64::from(session.failed_count);
    if terminal > payload_total {
        warn!(
            "Session: counters drifted on session {} (completed {} + failed {} > payloads {})",
            session.id, session.completed_count, session.failed_count, payload_total
        );
        emit_drift_event(conn, session.id)?;
    }
    Ok(())
}

fn emit_drift_event(conn: &mut PgConnection, session_id: i64) -> Result<(), CoreError> {
    let event = NewEvent::new(event_types::COUNTER_DRIFT, event_source::COMPLETION, None, None)
        .with_payload(serde_json::json!({ "session_id": session_id }));
    insert_event(conn, &event)
}

pub fn insert_event(conn: &mut PgConnection, event: &NewEvent) -> Result<(), CoreError> {
    use schema::events::dsl as E;

    diesel::insert_into(E::events).values(event).execute(conn)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn day_bounds_follow_the_site_timezone() {
        let tz = chrono_tz::Europe::Ljubljana;
        // 23:30 UTC on Jun 1 is already 01:30 Jun 2 local (CEST, UTC+2).
        let at = Utc.with_ymd_and_hms(2026, 6, 1, 23, 30, 0).unwrap();
        let (date, start, end) = local_day_bounds(tz, at);
        assert_eq!(date, NaiveDate::from_ymd_opt(2026, 6, 2).unwrap());
        assert_eq!(start, Utc.with_ymd_and_hms(2026, 6, 1, 22, 0, 0).unwrap());
        assert_eq!(end, Utc.with_ymd_and_hms(2026, 6, 2, 22, 0, 0).unwrap());
        assert_eq!(end - start, Duration::hours(24));
    }

    #[test]
    fn day_bounds_in_utc_are_utc_midnights() {
        let at = Utc.with_ymd_and_hms(2026, 3, 15, 11, 0, 0).unwrap();
        let (date, start, end) = local_day_bounds(chrono_tz::UTC, at);
        assert_eq!(date, NaiveDate::from_ymd_opt(2026, 3, 15).unwrap());
        assert_eq!(start, Utc.with_ymd_and_hms(2026, 3, 15, 0, 0, 0).unwrap());
        assert_eq!(end, Utc.with_ymd_and_hms(2026, 3, 16, 0, 0, 0).unwrap());
    }

    #[test]
    fn dst_transition_days_are_not_24_hours() {
        // Europe's spring-forward day (2026-03-29) is 23 hours long.
        let tz = chrono_tz::Europe::Ljubljana;
        let at = Utc.with_ymd_and_hms(2026, 3, 29, 12, 0, 0).unwrap();
        let (_, start, end) = local_day_bounds(tz, at);
        assert_eq!(end - start, Duration::hours(23));
    }

    #[test]
    fn midnight_erased_by_dst_still_yields_a_start() {
        // America/Santiago jumps 00:00 -> 01:00 on its spring-forward date,
        // so local midnight does not exist on 2026-09-06.
        let tz = chrono_tz::America::Santiago;
        let date = NaiveDate::from_ymd_opt(2026, 9, 6).unwrap();
        let start = local_midnight_utc(tz, date);
        assert_eq!(start.with_timezone(&tz).date_naive(), date);
    }

    #[test]
    #[ignore = "requires a live PostgreSQL (set DATABASE_URL)"]
    fn concurrent_first_wakes_share_one_session() {
        let mut conn = crate::testutil::connect();
        let site_id = crate::testutil::provision_site(&mut conn, "Etc/UTC");
        let at = Utc::now();

        let url = crate::testutil::database_url();
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let url = url.clone();
                std::thread::spawn(move || {
                    let mut conn = PgConnection::establish(&url).expect("connect");
                    get_or_open_session(&mut conn, site_id, chrono_tz::UTC, at)
                        .expect("open session")
                        .id
                })
            })
            .collect();

        let ids: std::collections::BTreeSet<i64> =
            handles.into_iter().map(|h| h.join().expect("thread")).collect();
        assert_eq!(ids.len(), 1, "racing opens must converge on one session");
    }

    #[test]
    #[ignore = "requires a live PostgreSQL (set DATABASE_URL)"]
    fn locked_sessions_refuse_counter_mutation() {
        let mut conn = crate::testutil::connect();
        let site_id = crate::testutil::provision_site(&mut conn, "Etc/UTC");
        let at = Utc::now();

        let session = get_or_open_session(&mut conn, site_id, chrono_tz::UTC, at).expect("open");
        record_completed(&mut conn, session.id).expect("counter moves while open");
        lock_session(&mut conn, site_id, session.session_date).expect("lock");

        let err = record_completed(&mut conn, session.id).unwrap_err();
        assert!(matches!(err, CoreError::SessionLocked { .. }), "got {err}");

        let reread = get_or_open_session(&mut conn, site_id, chrono_tz::UTC, at).expect("reread");
        assert_eq!(reread.completed_count, 1, "late increment must not land");
        assert!(reread.is_locked(), "locking is one-way");
    }
}
