use bigdecimal::BigDecimal;
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::period::MetricPeriod;

// ============ Enumerations ============

/// Lifecycle status of a tenant. Tenants are never hard-deleted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TenantStatus {
    Active,
    Trial,
    Cancelled,
}

impl TenantStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TenantStatus::Active => "active",
            TenantStatus::Trial => "trial",
            TenantStatus::Cancelled => "cancelled",
        }
    }
}

impl FromStr for TenantStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "active" => Ok(TenantStatus::Active),
            "trial" | "trialing" => Ok(TenantStatus::Trial),
            "cancelled" | "canceled" | "inactive" => Ok(TenantStatus::Cancelled),
            other => Err(format!("unknown tenant status '{}'", other)),
        }
    }
}

impl TryFrom<String> for TenantStatus {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl fmt::Display for TenantStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Booking status of an appointment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AppointmentStatus {
    Pending,
    Confirmed,
    Completed,
    Cancelled,
    NoShow,
}

impl AppointmentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AppointmentStatus::Pending => "pending",
            AppointmentStatus::Confirmed => "confirmed",
            AppointmentStatus::Completed => "completed",
            AppointmentStatus::Cancelled => "cancelled",
            AppointmentStatus::NoShow => "no_show",
        }
    }

    /// Statuses whose price counts as revenue.
    pub fn is_revenue_bearing(&self) -> bool {
        matches!(
            self,
            AppointmentStatus::Completed | AppointmentStatus::Confirmed
        )
    }
}

impl FromStr for AppointmentStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "pending" => Ok(AppointmentStatus::Pending),
            "confirmed" => Ok(AppointmentStatus::Confirmed),
            "completed" => Ok(AppointmentStatus::Completed),
            "cancelled" | "canceled" => Ok(AppointmentStatus::Cancelled),
            "no_show" | "no-show" | "noshow" => Ok(AppointmentStatus::NoShow),
            other => Err(format!("unknown appointment status '{}'", other)),
        }
    }
}

impl TryFrom<String> for AppointmentStatus {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

/// Channel an appointment was booked through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AppointmentSource {
    Internal,
    CalendarSync,
    Whatsapp,
    Other,
}

impl AppointmentSource {
    pub fn from_tag(tag: Option<&str>) -> Self {
        let Some(tag) = tag else {
            return AppointmentSource::Internal;
        };
        match tag.trim().to_lowercase().as_str() {
            "" | "internal" | "booking_ui" | "manual" => AppointmentSource::Internal,
            "google_calendar" | "calendar_sync" | "external_calendar" => {
                AppointmentSource::CalendarSync
            }
            "whatsapp" | "whatsapp_ai" | "ai" => AppointmentSource::Whatsapp,
            _ => AppointmentSource::Other,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            AppointmentSource::Internal => "internal",
            AppointmentSource::CalendarSync => "calendar_sync",
            AppointmentSource::Whatsapp => "whatsapp",
            AppointmentSource::Other => "other",
        }
    }
}

// ============ Database Models ============

/// A business customer of the platform.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct Tenant {
    pub id: Uuid,
    pub business_name: String,
    /// Industry tag (e.g. "beauty", "healthcare").
    pub domain: Option<String>,
    pub subscription_plan: Option<String>,
    pub monthly_subscription_fee: Option<BigDecimal>,
    #[sqlx(try_from = "String")]
    pub status: TenantStatus,
    pub created_at: DateTime<Utc>,
    pub trial_ends_at: Option<DateTime<Utc>>,
}

impl Tenant {
    /// Cancelled tenants stay in the table but drop out of period rollups.
    pub fn is_cancelled(&self) -> bool {
        self.status == TenantStatus::Cancelled
    }
}

/// A booking made by an end customer with a tenant.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct Appointment {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub user_id: Uuid,
    #[sqlx(try_from = "String")]
    pub status: AppointmentStatus,
    pub quoted_price: Option<BigDecimal>,
    pub final_price: Option<BigDecimal>,
    pub start_time: DateTime<Utc>,
    /// Raw origin tag as stored; see `Appointment::source`.
    pub source: Option<String>,
}

impl Appointment {
    /// Final price when set, otherwise the quoted price.
    pub fn effective_price(&self) -> Option<&BigDecimal> {
        self.final_price.as_ref().or(self.quoted_price.as_ref())
    }

    pub fn source(&self) -> AppointmentSource {
        AppointmentSource::from_tag(self.source.as_deref())
    }

    /// Price that counts towards revenue, if this appointment contributes any.
    pub fn revenue_contribution(&self) -> Option<&BigDecimal> {
        if self.status.is_revenue_bearing() {
            self.effective_price()
        } else {
            None
        }
    }
}

/// One chat/WhatsApp message as stored in `conversation_history`.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct ConversationMessage {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub user_id: Uuid,
    pub content: String,
    pub is_from_user: bool,
    /// Free-form JSON; carries `session_id` and sometimes `duration_minutes`.
    pub conversation_context: Option<serde_json::Value>,
    pub conversation_outcome: Option<String>,
    pub confidence_score: Option<f64>,
    pub api_cost_usd: Option<BigDecimal>,
    pub processing_cost_usd: Option<BigDecimal>,
    pub created_at: DateTime<Utc>,
    pub conversation_id: Option<Uuid>,
}

/// Incoming message payload for ingestion.
#[derive(Debug, Clone, Deserialize)]
pub struct NewConversationMessage {
    /// Caller-supplied id makes replays idempotent; generated when absent.
    pub id: Option<Uuid>,
    pub tenant_id: Uuid,
    pub user_id: Uuid,
    #[serde(default)]
    pub content: String,
    pub is_from_user: bool,
    pub conversation_context: Option<serde_json::Value>,
    pub conversation_outcome: Option<String>,
    pub confidence_score: Option<f64>,
    pub api_cost_usd: Option<BigDecimal>,
    pub processing_cost_usd: Option<BigDecimal>,
    pub created_at: Option<DateTime<Utc>>,
}

impl NewConversationMessage {
    pub fn into_message(self, now: DateTime<Utc>) -> ConversationMessage {
        ConversationMessage {
            id: self.id.unwrap_or_else(Uuid::new_v4),
            tenant_id: self.tenant_id,
            user_id: self.user_id,
            content: self.content,
            is_from_user: self.is_from_user,
            conversation_context: self.conversation_context,
            conversation_outcome: self
                .conversation_outcome
                .map(|o| o.trim().to_string())
                .filter(|o| !o.is_empty()),
            confidence_score: self.confidence_score,
            api_cost_usd: self.api_cost_usd,
            processing_cost_usd: self.processing_cost_usd,
            created_at: self.created_at.unwrap_or(now),
            conversation_id: None,
        }
    }
}

/// First-class conversation: every message sharing a session key, keyed by
/// a stable id derived from (tenant, session key).
#[derive(Debug, Clone, PartialEq, FromRow, Serialize, Deserialize)]
pub struct Conversation {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub session_key: String,
    pub user_id: Option<Uuid>,
    pub started_at: DateTime<Utc>,
    pub last_message_at: DateTime<Utc>,
    pub message_count: i32,
    pub user_message_count: i32,
    pub api_cost_usd: BigDecimal,
    pub processing_cost_usd: BigDecimal,
    /// Largest `duration_minutes` reported in the message contexts.
    pub duration_minutes: Option<i32>,
    /// Distinct non-empty outcomes seen on the session's messages.
    pub observed_outcomes: Vec<String>,
}

impl Conversation {
    pub fn total_cost_usd(&self) -> BigDecimal {
        &self.api_cost_usd + &self.processing_cost_usd
    }

    /// Reported duration, else the span between first and last message for
    /// multi-message sessions.
    pub fn effective_duration_minutes(&self) -> Option<i64> {
        if let Some(minutes) = self.duration_minutes {
            return Some(i64::from(minutes));
        }
        if self.message_count > 1 {
            Some((self.last_message_at - self.started_at).num_minutes())
        } else {
            None
        }
    }
}

/// A subscription payment collected from a tenant.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct SubscriptionPayment {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub amount: BigDecimal,
    pub payment_date: DateTime<Utc>,
    pub payment_status: String,
}

impl SubscriptionPayment {
    pub fn is_completed(&self) -> bool {
        matches!(
            self.payment_status.trim().to_lowercase().as_str(),
            "completed" | "paid" | "succeeded"
        )
    }
}

/// One persisted (tenant, period, metric type) snapshot.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct TenantMetricSnapshot {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub period_start: NaiveDate,
    pub period_end: NaiveDate,
    pub metric_type: String,
    pub metric_data: serde_json::Value,
    pub payload_checksum: String,
    pub calculated_at: DateTime<Utc>,
}

/// Persisted platform-wide rollup for one period.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct PlatformMetricSnapshot {
    pub id: Uuid,
    pub period_start: NaiveDate,
    pub period_end: NaiveDate,
    pub calculation_date: NaiveDate,
    pub tenants_included: i32,
    pub total_revenue: BigDecimal,
    pub total_conversations: i64,
    pub mrr: BigDecimal,
    pub metric_data: serde_json::Value,
    pub payload_checksum: String,
    pub calculated_at: DateTime<Utc>,
}

// ============ API Request/Response Models ============

/// Query string carrying an optional period (`YYYY-MM`, range, or `<N>d`).
#[derive(Debug, Default, Deserialize)]
pub struct PeriodQuery {
    pub period: Option<String>,
}

/// Body of `POST /api/v1/metrics/recalculate`.
#[derive(Debug, Default, Deserialize)]
pub struct RecalculateRequest {
    pub period: Option<String>,
}

/// Result of ingesting one message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestResponse {
    pub message_id: Uuid,
    pub conversation_id: Uuid,
    pub session_key: String,
    /// True when the message id had already been ingested.
    pub duplicate: bool,
}

#[derive(Debug, Serialize)]
pub struct RebuildResponse {
    pub tenant_id: Uuid,
    pub conversations: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TenantMetricsResponse {
    pub tenant_id: Uuid,
    pub period: MetricPeriod,
    pub period_key: String,
    pub snapshots: Vec<TenantMetricSnapshot>,
}
