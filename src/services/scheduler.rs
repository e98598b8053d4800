//! Daily session upkeep on a steady cadence.
//!
//! The cron-shaped work (eagerly opening today's sessions, locking the
//! ones whose day has ended) runs as a plain ticker so the "when" stays
//! out of the session logic. Locking never blocks ingestion; it only makes
//! later writes against that session fail and reroute.

use crate::error::CoreError;
use crate::services::session;
use chrono::Utc;
use diesel::PgConnection;
use log::{debug, error};
use std::thread;
use std::time::{Duration, Instant};

pub fn run_loop(conn: &mut PgConnection, interval: Duration) -> Result<(), CoreError> {
    loop {
        let tick_start = Instant::now();

        // A failed sweep (e.g. transient storage trouble) is logged and
        // retried on the next tick rather than taking the process down.
        if let Err(e) = tick(conn) {
            error!("Scheduler: sweep failed: {}", e);
        }

        // Maintain steady cadence
        let elapsed = tick_start.elapsed();
        if elapsed < interval {
            thread::sleep(interval - elapsed);
        }
    }
}

pub fn tick(conn: &mut PgConnection) -> Result<(), CoreError> {
    let now = Utc::now();
    let opened = session::open_daily_sessions(conn, now)?;
    let locked = session::lock_expired_sessions(conn, now)?;
    debug!("Scheduler: tick covered {} site(s), locked {}", opened, locked);
    Ok(())
}
