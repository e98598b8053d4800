//! Diesel model structs for fleet, session and risk-state rows.
//!
//! Sites and devices are owned by provisioning and treated as read-only
//! reference data here; everything else is written by the services.

use chrono::{DateTime, NaiveDate, Utc};
use diesel::prelude::*;
use serde::{Deserialize, Serialize};

use crate::schema;

// String constants for the status columns. These are states of an in-code
// state machine, not database enums, so late rows from old binaries never
// fail a cast.
pub mod session_status {
    pub const PENDING: &str = "pending";
    pub const IN_PROGRESS: &str = "in_progress";
    pub const LOCKED: &str = "locked";
}

pub mod payload_status {
    pub const PENDING: &str = "pending";
    pub const COMPLETE: &str = "complete";
    pub const FAILED: &str = "failed";
}

pub mod image_status {
    pub const RECEIVING: &str = "receiving";
    pub const COMPLETE: &str = "complete";
    pub const FAILED: &str = "failed";
}

pub mod event_types {
    pub const IMAGE_FAILED: &str = "IMAGE_FAILED";
    pub const SESSION_LOCKED: &str = "SESSION_LOCKED";
    pub const COUNTER_DRIFT: &str = "COUNTER_DRIFT";
    pub const DUPLICATE_WAKE_REPORT: &str = "DUPLICATE_WAKE_REPORT";
}

pub mod event_source {
    pub const INGEST: &str = "ingest";
    pub const COMPLETION: &str = "completion";
    pub const SCHEDULER: &str = "scheduler";
    pub const SEED: &str = "seed";
}

#[derive(Debug, Clone, Queryable, Identifiable, Selectable, Serialize, Deserialize)]
#[diesel(table_name = schema::sites)]
pub struct Site {
    pub id: i64,
    pub name: String,
    pub timezone: String,
    pub program_id: i64,
    pub company_id: i64,
    pub active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Insertable, Serialize, Deserialize)]
#[diesel(table_name = schema::sites)]
pub struct NewSite {
    pub name: String,
    pub timezone: String,
    pub program_id: i64,
    pub company_id: i64,
    pub active: bool,
}

#[derive(Debug, Clone, Queryable, Identifiable, Associations, Selectable, Serialize, Deserialize)]
#[diesel(table_name = schema::devices)]
#[diesel(belongs_to(Site))]
pub struct Device {
    pub id: i64,
    pub device_uid: String,
    pub site_id: Option<i64>,
    pub name: Option<String>,
    pub wake_schedule: String,
    pub active: bool,
    pub firmware_version: Option<String>,
    pub battery_state: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Insertable, Serialize, Deserialize)]
#[diesel(table_name = schema::devices)]
pub struct NewDevice {
    pub device_uid: String,
    pub site_id: Option<i64>,
    pub name: Option<String>,
    pub wake_schedule: String,
    pub active: bool,
    pub firmware_version: Option<String>,
    pub battery_state: Option<String>,
}

#[derive(Debug, Clone, Queryable, Identifiable, Associations, Selectable, Serialize, Deserialize)]
#[diesel(table_name = schema::site_sessions)]
#[diesel(belongs_to(Site))]
pub struct SiteSession {
    pub id: i64,
    pub site_id: i64,
    pub session_date: NaiveDate,
    pub started_at: DateTime<Utc>,
    pub ends_at: DateTime<Utc>,
    pub expected_wake_count: i32,
    pub completed_count: i32,
    pub failed_count: i32,
    pub extra_count: i32,
    pub status: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl SiteSession {
    pub fn is_locked(&self) -> bool {
        self.status == session_status::LOCKED
    }
}

#[derive(Debug, Clone, Insertable, Serialize, Deserialize)]
#[diesel(table_name = schema::site_sessions)]
pub struct NewSiteSession {
    pub site_id: i64,
    pub session_date: NaiveDate,
    pub started_at: DateTime<Utc>,
    pub ends_at: DateTime<Utc>,
    pub expected_wake_count: i32,
    pub status: String,
}

#[derive(Debug, Clone, Queryable, Identifiable, Associations, Selectable, Serialize, Deserialize)]
#[diesel(table_name = schema::images)]
#[diesel(belongs_to(Device))]
pub struct Image {
    pub id: i64,
    pub device_id: i64,
    pub image_name: String,
    pub status: String,
    pub url: Option<String>,
    pub retry_count: i32,
    pub resent_received_at: Option<DateTime<Utc>>,
    pub captured_at: DateTime<Utc>,
    pub error_code: Option<String>,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Image {
    /// Terminal images ignore further complete/fail calls.
    pub fn is_terminal(&self) -> bool {
        self.status == image_status::COMPLETE || self.status == image_status::FAILED
    }
}

#[derive(Debug, Clone, Insertable, Serialize, Deserialize)]
#[diesel(table_name = schema::images)]
pub struct NewImage {
    pub device_id: i64,
    pub image_name: String,
    pub status: String,
    pub captured_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Queryable, Identifiable, Associations, Selectable, Serialize, Deserialize)]
#[diesel(table_name = schema::wake_payloads)]
#[diesel(belongs_to(Device))]
#[diesel(belongs_to(SiteSession, foreign_key = session_id))]
pub struct WakePayload {
    pub id: i64,
    pub device_id: i64,
    pub session_id: i64,
    pub image_id: Option<i64>,
    pub captured_at: DateTime<Utc>,
    pub wake_window_index: i32,
    pub overage: bool,
    pub temperature_c: Option<f64>,
    pub humidity_pct: Option<f64>,
    pub pressure_hpa: Option<f64>,
    pub gas_resistance_kohm: Option<f64>,
    pub battery_v: Option<f64>,
    pub signal_dbm: Option<f64>,
    pub extra: Option<serde_json::Value>,
    pub status: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Insertable, Serialize, Deserialize)]
#[diesel(table_name = schema::wake_payloads)]
pub struct NewWakePayload {
    pub device_id: i64,
    pub session_id: i64,
    pub image_id: Option<i64>,
    pub captured_at: DateTime<Utc>,
    pub wake_window_index: i32,
    pub overage: bool,
    pub temperature_c: Option<f64>,
    pub humidity_pct: Option<f64>,
    pub pressure_hpa: Option<f64>,
    pub gas_resistance_kohm: Option<f64>,
    pub battery_v: Option<f64>,
    pub signal_dbm: Option<f64>,
    pub extra: Option<serde_json::Value>,
    pub status: String,
}

#[derive(Debug, Clone, Queryable, Identifiable, Selectable, Serialize, Deserialize)]
#[diesel(table_name = schema::device_risk_states)]
#[diesel(primary_key(device_id))]
pub struct DeviceRiskState {
    pub device_id: i64,
    pub mold_index: f64,
    pub risk_level: String,
    pub last_temp_c: Option<f64>,
    pub last_humidity_pct: Option<f64>,
    pub critical_rh_pct: Option<f64>,
    pub forecast_24h_index: Option<f64>,
    pub forecast_24h_level: Option<String>,
    pub forecast_48h_index: Option<f64>,
    pub forecast_48h_level: Option<String>,
    pub forecast_72h_index: Option<f64>,
    pub forecast_72h_level: Option<String>,
    pub hours_to_next_level: Option<f64>,
    pub calculated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Insertable, Serialize, Deserialize)]
#[diesel(table_name = schema::device_risk_states)]
pub struct NewDeviceRiskState {
    pub device_id: i64,
    pub mold_index: f64,
    pub risk_level: String,
    pub last_temp_c: Option<f64>,
    pub last_humidity_pct: Option<f64>,
    pub critical_rh_pct: Option<f64>,
    pub forecast_24h_index: Option<f64>,
    pub forecast_24h_level: Option<String>,
    pub forecast_48h_index: Option<f64>,
    pub forecast_48h_level: Option<String>,
    pub forecast_72h_index: Option<f64>,
    pub forecast_72h_level: Option<String>,
    pub hours_to_next_level: Option<f64>,
    pub calculated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Queryable, Identifiable, Selectable, Serialize, Deserialize)]
#[diesel(table_name = schema::observations)]
pub struct Observation {
    pub id: i64,
    pub time: DateTime<Utc>,
    pub site_id: i64,
    pub program_id: i64,
    pub company_id: i64,
    pub device_id: i64,
    pub payload_id: Option<i64>,
    pub url: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Insertable, Serialize, Deserialize)]
#[diesel(table_name = schema::observations)]
pub struct NewObservation {
    pub time: DateTime<Utc>,
    pub site_id: i64,
    pub program_id: i64,
    pub company_id: i64,
    pub device_id: i64,
    pub payload_id: Option<i64>,
    pub url: String,
}

#[derive(Debug, Clone, Queryable, Identifiable, Selectable, Serialize, Deserialize)]
#[diesel(table_name = schema::events)]
pub struct Event {
    pub id: i64,
    pub time: DateTime<Utc>,
    pub site_id: Option<i64>,
    pub device_id: Option<i64>,
    pub source: Option<String>,
    pub event_type: String,
    pub payload: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Insertable, Serialize, Deserialize)]
#[diesel(table_name = schema::events)]
pub struct NewEvent {
    pub time: DateTime<Utc>,
    pub site_id: Option<i64>,
    pub device_id: Option<i64>,
    pub source: Option<String>,
    pub event_type: String,
    pub payload: Option<serde_json::Value>,
}

impl NewEvent {
    pub fn new(event_type: &str, source: &str, site_id: Option<i64>, device_id: Option<i64>) -> Self {
        NewEvent {
            time: Utc::now(),
            site_id,
            device_id,
            source: Some(source.to_string()),
            event_type: event_type.to_string(),
            payload: None,
        }
    }

    pub fn with_payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = Some(payload);
        self
    }
}
