//! Device lineage: which site/program/company a wake belongs to.
//!
//! Tenant scoping is resolved once, explicitly, at the top of each operation
//! instead of being smeared across writes. Provisioning owns the underlying
//! rows; we only read them.

use crate::db::models::{Device, Site};
use crate::error::CoreError;
use crate::schema;
use chrono_tz::Tz;
use diesel::prelude::*;
use diesel::PgConnection;
use log::warn;

#[derive(Debug, Clone)]
pub struct Lineage {
    pub device_id: i64,
    pub device_uid: String,
    pub site_id: i64,
    pub program_id: i64,
    pub company_id: i64,
    pub wake_schedule: String,
    pub timezone: Tz,
}

/// Resolve a raw device identifier to its current context. Unknown uids,
/// inactive devices, and devices without an active site all surface as
/// `DeviceNotAssigned`.
pub fn resolve(conn: &mut PgConnection, device_uid: &str) -> Result<Lineage, CoreError> {
    use schema::devices::dsl as D;
    use schema::sites::dsl as S;

    let pair: Option<(Device, Site)> = D::devices
        .inner_join(S::sites)
        .filter(
            D::device_uid
                .eq(device_uid)
                .and(D::active.eq(true))
                .and(S::active.eq(true)),
        )
        .select((Device::as_select(), Site::as_select()))
        .first(conn)
        .optional()?;

    let (device, site) = pair.ok_or_else(|| CoreError::DeviceNotAssigned(device_uid.to_string()))?;

    Ok(Lineage {
        device_id: device.id,
        device_uid: device.device_uid,
        site_id: site.id,
        program_id: site.program_id,
        company_id: site.company_id,
        wake_schedule: device.wake_schedule,
        timezone: parse_site_timezone(site.id, &site.timezone),
    })
}

/// Parse a site's IANA timezone name. Ingestion must not die on a backoffice
/// typo, so unknown names degrade to UTC with a warning.
pub fn parse_site_timezone(site_id: i64, name: &str) -> Tz {
    match name.parse::<Tz>() {
        Ok(tz) => tz,
        Err(_) => {
            warn!("Lineage: site {} has unknown timezone {:?}; falling back to UTC", site_id, name);
            chrono_tz::UTC
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_iana_names_and_falls_back_to_utc() {
        assert_eq!(parse_site_timezone(1, "Europe/Ljubljana"), chrono_tz::Europe::Ljubljana);
        assert_eq!(parse_site_timezone(1, "America/New_York"), chrono_tz::America::New_York);
        assert_eq!(parse_site_timezone(1, "Middle/Earth"), chrono_tz::UTC);
    }
}
