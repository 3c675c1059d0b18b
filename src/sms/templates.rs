//! SMS template store and rendering. Templates carry `{variable}`
//! placeholders; unknown variables render as `[variable]` instead of
//! failing the send.

use std::collections::HashMap;
use std::sync::OnceLock;

use chrono::NaiveDateTime;
use regex::Regex;
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::config;
use crate::db::DatabaseError;
use crate::models::enums::TemplateType;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SmsTemplate {
    pub id: String,
    pub name: String,
    pub template_type: TemplateType,
    pub message: String,
    pub is_active: bool,
}

/// Clinic constants every template may reference.
pub fn clinic_context() -> HashMap<String, String> {
    HashMap::from([
        ("clinic_name".to_string(), config::CLINIC_NAME.to_string()),
        ("clinic_phone".to_string(), config::CLINIC_PHONE.to_string()),
        ("clinic_address".to_string(), config::CLINIC_ADDRESS.to_string()),
    ])
}

fn placeholder() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\{([a-z_]+)\}").expect("static regex"))
}

/// Substitute `{var}` placeholders from the context (clinic constants
/// included). Missing variables become `[var]`.
pub fn render(message: &str, context: &HashMap<String, String>) -> String {
    let mut full = clinic_context();
    full.extend(context.iter().map(|(k, v)| (k.clone(), v.clone())));

    placeholder()
        .replace_all(message, |caps: &regex::Captures| {
            let name = &caps[1];
            full.get(name)
                .cloned()
                .unwrap_or_else(|| format!("[{name}]"))
        })
        .trim()
        .to_string()
}

/// First active template of the given type.
pub fn get_template(
    conn: &Connection,
    template_type: TemplateType,
) -> Result<Option<SmsTemplate>, DatabaseError> {
    let row = conn
        .query_row(
            "SELECT id, name, template_type, message, is_active
             FROM sms_templates
             WHERE template_type = ?1 AND is_active = 1
             ORDER BY created_at ASC, rowid ASC LIMIT 1",
            params![template_type.as_str()],
            |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, bool>(4)?,
                ))
            },
        )
        .optional()?;
    Ok(row.map(|(id, name, message, is_active)| SmsTemplate {
        id,
        name,
        template_type,
        message,
        is_active,
    }))
}

pub fn create_template(
    conn: &Connection,
    name: &str,
    template_type: TemplateType,
    message: &str,
    now: NaiveDateTime,
) -> Result<String, DatabaseError> {
    let id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO sms_templates (id, name, template_type, message, is_active, created_at)
         VALUES (?1, ?2, ?3, ?4, 1, ?5)",
        params![id, name, template_type.as_str(), message, now],
    )?;
    Ok(id)
}

/// Seed the default template set. Existing (type, name) pairs are kept.
pub fn seed_default_templates(conn: &Connection, now: NaiveDateTime) -> Result<(), DatabaseError> {
    let defaults: [(&str, TemplateType, &str); 5] = [
        (
            "Default Confirmation",
            TemplateType::Confirmation,
            "Hi {patient_name}!\n\nYour appointment has been confirmed:\nDate: {appointment_date}\nTime: {appointment_time}\nService: {service_name}\nLocation: {clinic_name}\n\nPlease arrive 15 minutes early.\nThank you for choosing us!",
        ),
        (
            "Default Reminder",
            TemplateType::Reminder,
            "Hi {patient_name}!\n\nReminder: You have an appointment tomorrow:\nDate: {appointment_date}\nTime: {appointment_time}\nService: {service_name}\n\nPlease arrive 15 minutes early.\nSee you soon!",
        ),
        (
            "Default Cancellation",
            TemplateType::Cancellation,
            "Hi {patient_name}!\n\nYour appointment has been cancelled:\nDate: {appointment_date}\nTime: {appointment_time}\nService: {service_name}\n\n{cancellation_reason}\n\nPlease contact us to reschedule.\nThank you for your understanding.",
        ),
        (
            "Default Package Confirmation",
            TemplateType::PackageConfirmation,
            "Hi {patient_name}!\n\nYour package has been booked successfully:\nPackage: {package_name}\nPrice: {package_price}\nSessions: {package_sessions}\nDuration: {package_duration}\n\nYour package is now active. Book your sessions anytime!\nThank you for choosing us!",
        ),
        (
            "Default Attendant Reassignment",
            TemplateType::AttendantReassignment,
            "Hi {patient_name}!\n\nWe have assigned a new staff member to assist you for your upcoming appointment:\nDate: {appointment_date}\nTime: {appointment_time}\nService: {service_name}\nNew Staff: {attendant_name}\n\nIf you have any questions, feel free to contact us at {clinic_phone}.\nWe look forward to seeing you!",
        ),
    ];

    for (name, template_type, message) in defaults {
        conn.execute(
            "INSERT OR IGNORE INTO sms_templates (id, name, template_type, message, is_active, created_at)
             VALUES (?1, ?2, ?3, ?4, 1, ?5)",
            params![Uuid::new_v4().to_string(), name, template_type.as_str(), message, now],
        )?;
    }
    Ok(())
}
