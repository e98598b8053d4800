//! Per-device mold-risk state: one evolve step per qualifying sample, plus
//! persistence forecasts. One continuously-overwritten row per device;
//! devices never share state, so recomputation parallelizes freely.

use crate::db::models::{DeviceRiskState, NewDeviceRiskState};
use crate::error::CoreError;
use crate::risk;
use crate::schema;
use chrono::{DateTime, Utc};
use diesel::prelude::*;
use diesel::PgConnection;
use log::debug;

/// Re-evaluate a device's growth index from its latest temperature/humidity
/// pair and store the refreshed state. Quietly does nothing for devices
/// that have never reported a full climate pair.
pub fn recompute_device_risk(
    conn: &mut PgConnection,
    device_id: i64,
) -> Result<Option<DeviceRiskState>, CoreError> {
    use schema::device_risk_states::dsl as R;

    let Some((temp_c, rh_pct, sampled_at)) = latest_climate_pair(conn, device_id)? else {
        debug!("Risk: device {} has no climate pair yet; skipping", device_id);
        return Ok(None);
    };

    let previous: Option<DeviceRiskState> = R::device_risk_states
        .filter(R::device_id.eq(device_id))
        .select(DeviceRiskState::as_select())
        .first(conn)
        .optional()?;
    let current_index = previous.map(|s| s.mold_index).unwrap_or(0.0);

    let index = risk::evolve(current_index, temp_c, rh_pct);
    let rate = risk::growth_rate_per_hour(temp_c, rh_pct, index);

    let forecast_24 = risk::forecast(index, temp_c, rh_pct, 24);
    let forecast_48 = risk::forecast(index, temp_c, rh_pct, 48);
    let forecast_72 = risk::forecast(index, temp_c, rh_pct, 72);

    let state = NewDeviceRiskState {
        device_id,
        mold_index: index,
        risk_level: risk::risk_level(index).as_str().to_string(),
        last_temp_c: Some(temp_c),
        last_humidity_pct: Some(rh_pct),
        critical_rh_pct: Some(risk::critical_rh(temp_c)),
        forecast_24h_index: Some(forecast_24),
        forecast_24h_level: Some(risk::risk_level(forecast_24).as_str().to_string()),
        forecast_48h_index: Some(forecast_48),
        forecast_48h_level: Some(risk::risk_level(forecast_48).as_str().to_string()),
        forecast_72h_index: Some(forecast_72),
        forecast_72h_level: Some(risk::risk_level(forecast_72).as_str().to_string()),
        hours_to_next_level: risk::hours_to_next_level(index, rate),
        calculated_at: Utc::now(),
    };

    diesel::insert_into(R::device_risk_states)
        .values(&state)
        .on_conflict(R::device_id)
        .do_update()
        .set((
            R::mold_index.eq(state.mold_index),
            R::risk_level.eq(state.risk_level.clone()),
            R::last_temp_c.eq(state.last_temp_c),
            R::last_humidity_pct.eq(state.last_humidity_pct),
            R::critical_rh_pct.eq(state.critical_rh_pct),
            R::forecast_24h_index.eq(state.forecast_24h_index),
            R::forecast_24h_level.eq(state.forecast_24h_level.clone()),
            R::forecast_48h_index.eq(state.forecast_48h_index),
            R::forecast_48h_level.eq(state.forecast_48h_level.clone()),
            R::forecast_72h_index.eq(state.forecast_72h_index),
            R::forecast_72h_level.eq(state.forecast_72h_level.clone()),
            R::hours_to_next_level.eq(state.hours_to_next_level),
            R::calculated_at.eq(state.calculated_at),
        ))
        .execute(conn)?;

    debug!(
        "Risk: device {} index {:.3} ({}) from sample at {}",
        device_id, index, risk::risk_level(index), sampled_at
    );

    let refreshed: DeviceRiskState = R::device_risk_states
        .filter(R::device_id.eq(device_id))
        .select(DeviceRiskState::as_select())
        .first(conn)?;
    Ok(Some(refreshed))
}

/// Most recent payload carrying both temperature and humidity.
fn latest_climate_pair(
    conn: &mut PgConnection,
    device_id: i64,
) -> Result<Option<(f64, f64, DateTime<Utc>)>, CoreError> {
    use schema::wake_payloads::dsl as P;

    let row: Option<(Option<f64>, Option<f64>, DateTime<Utc>)> = P::wake_payloads
        .filter(
            P::device_id
                .eq(device_id)
                .and(P::temperature_c.is_not_null())
                .and(P::humidity_pct.is_not_null()),
        )
        .order(P::captured_at.desc())
        .select((P::temperature_c, P::humidity_pct, P::captured_at))
        .first(conn)
        .optional()?;

    Ok(row.and_then(|(t, h, at)| match (t, h) {
        (Some(t), Some(h)) => Some((t, h, at)),
        _ => None,
    }))
}

pub fn get_device_risk_state(
    conn: &mut PgConnection,
    device_id: i64,
) -> Result<Option<DeviceRiskState>, CoreError> {
    use schema::device_risk_states::dsl as R;

    let state = R::device_risk_states
        .filter(R::device_id.eq(device_id))
        .select(DeviceRiskState::as_select())
        .first(conn)
        .optional()?;
    Ok(state)
}

#[derive(Debug, Clone, Default)]
pub struct SiteRiskSummary {
    pub site_id: i64,
    pub device_total: usize,
    pub devices_with_state: usize,
    pub worst_index: Option<f64>,
    pub worst_level: Option<String>,
    /// Devices whose last reported humidity sits at or above their critical
    /// threshold, i.e. currently growing.
    pub devices_at_critical_rh: usize,
}

/// Worst-case view across a site's active fleet.
pub fn get_site_risk_summary(conn: &mut PgConnection, site_id: i64) -> Result<SiteRiskSummary, CoreError> {
    use schema::device_risk_states::dsl as R;
    use schema::devices::dsl as D;

    let rows: Vec<(i64, Option<DeviceRiskState>)> = D::devices
        .left_join(R::device_risk_states)
        .filter(D::site_id.eq(site_id).and(D::active.eq(true)))
        .select((D::id, Option::<DeviceRiskState>::as_select()))
        .load(conn)?;

    let mut summary = SiteRiskSummary {
        site_id,
        device_total: rows.len(),
        ..Default::default()
    };

    for (_, state) in rows.into_iter() {
        let Some(state) = state else { continue };
        summary.devices_with_state += 1;
        if summary.worst_index.is_none_or(|w| state.mold_index > w) {
            summary.worst_index = Some(state.mold_index);
            summary.worst_level = Some(state.risk_level.clone());
        }
        if let (Some(rh), Some(crit)) = (state.last_humidity_pct, state.critical_rh_pct)
            && rh >= crit
        {
            summary.devices_at_critical_rh += 1;
        }
    }

    Ok(summary)
}
