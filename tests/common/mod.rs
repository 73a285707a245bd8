//! Fixtures shared by the integration tests.
#![allow(dead_code)]

use bigdecimal::BigDecimal;
use chrono::{DateTime, TimeZone, Utc};
use serde_json::json;
use std::str::FromStr;
use tenant_metrics::models::{
    Appointment, AppointmentStatus, ConversationMessage, SubscriptionPayment, Tenant, TenantStatus,
};
use uuid::Uuid;

pub fn dec(s: &str) -> BigDecimal {
    BigDecimal::from_str(s).unwrap()
}

pub fn at(day: u32, hour: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 8, day, hour, 0, 0).unwrap()
}

pub fn tenant(status: TenantStatus, plan: Option<&str>, fee: Option<&str>) -> Tenant {
    Tenant {
        id: Uuid::new_v4(),
        business_name: "Studio Bella".to_string(),
        domain: Some("beauty".to_string()),
        subscription_plan: plan.map(str::to_string),
        monthly_subscription_fee: fee.map(dec),
        status,
        created_at: Utc.with_ymd_and_hms(2025, 1, 10, 9, 0, 0).unwrap(),
        trial_ends_at: None,
    }
}

pub fn appointment(
    tenant_id: Uuid,
    status: AppointmentStatus,
    quoted: Option<&str>,
    final_price: Option<&str>,
    start_time: DateTime<Utc>,
) -> Appointment {
    Appointment {
        id: Uuid::new_v4(),
        tenant_id,
        user_id: Uuid::new_v4(),
        status,
        quoted_price: quoted.map(dec),
        final_price: final_price.map(dec),
        start_time,
        source: None,
    }
}

pub fn message(
    tenant_id: Uuid,
    session: Option<&str>,
    created_at: DateTime<Utc>,
    outcome: Option<&str>,
) -> ConversationMessage {
    ConversationMessage {
        id: Uuid::new_v4(),
        tenant_id,
        user_id: Uuid::new_v4(),
        content: "Olá, gostaria de agendar".to_string(),
        is_from_user: true,
        conversation_context: session.map(|s| json!({ "session_id": s })),
        conversation_outcome: outcome.map(str::to_string),
        confidence_score: Some(0.9),
        api_cost_usd: Some(dec("0.002")),
        processing_cost_usd: Some(dec("0.0005")),
        created_at,
        conversation_id: None,
    }
}

pub fn payment(tenant_id: Uuid, amount: &str, status: &str, paid_at: DateTime<Utc>) -> SubscriptionPayment {
    SubscriptionPayment {
        id: Uuid::new_v4(),
        tenant_id,
        amount: dec(amount),
        payment_date: paid_at,
        payment_status: status.to_string(),
    }
}
