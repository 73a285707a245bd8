//! Canonical metric definitions.
//!
//! Every tenant and platform figure is computed here and only here, as pure
//! functions over already-loaded rows. Storage, HTTP handlers, binaries and
//! the consistency checker all go through these functions.
//!
//! Rules shared by every function:
//! - rows are filtered to the tenant and the period before anything is
//!   counted, so passing platform-wide slices is always safe;
//! - revenue is the effective price (final, else quoted) of completed or
//!   confirmed appointments that have a price;
//! - conversation costs are summed per conversation; averages only exist
//!   at report level;
//! - the platform rollup is the exact sum of the tenant metrics it is given.

use bigdecimal::{BigDecimal, Zero};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::conversation::OutcomeResolution;
use crate::models::{
    Appointment, AppointmentSource, AppointmentStatus, Conversation, SubscriptionPayment, Tenant,
    TenantStatus,
};
use crate::period::MetricPeriod;
use crate::plans::{plan_cost, PlanCost, PlanTier};

/// Kinds of per-tenant snapshot rows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricType {
    Appointments,
    Revenue,
    Conversations,
    Billing,
}

impl MetricType {
    pub const ALL: [MetricType; 4] = [
        MetricType::Appointments,
        MetricType::Revenue,
        MetricType::Conversations,
        MetricType::Billing,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            MetricType::Appointments => "appointments",
            MetricType::Revenue => "revenue",
            MetricType::Conversations => "conversations",
            MetricType::Billing => "billing",
        }
    }
}

impl FromStr for MetricType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        MetricType::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| format!("unknown metric type '{}'", s))
    }
}

impl fmt::Display for MetricType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AppointmentMetrics {
    pub total: u64,
    pub pending: u64,
    pub confirmed: u64,
    pub completed: u64,
    pub cancelled: u64,
    pub no_show: u64,
    pub by_source: BTreeMap<String, u64>,
    /// Percentages of `total`, two decimals.
    pub completion_rate: f64,
    pub cancellation_rate: f64,
    pub no_show_rate: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RevenueMetrics {
    pub revenue: BigDecimal,
    pub revenue_appointments: u64,
    pub average_ticket: BigDecimal,
    /// Price of no-show appointments: revenue the tenant lost to no-shows.
    pub no_show_lost_revenue: BigDecimal,
    pub no_show_appointments: u64,
    pub cancelled_lost_revenue: BigDecimal,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationMetrics {
    pub total_conversations: u64,
    pub total_messages: u64,
    pub user_messages: u64,
    /// Conversations per resolved outcome label.
    pub outcomes: BTreeMap<String, u64>,
    pub unresolved_outcome_conversations: u64,
    pub conflicting_outcome_conversations: u64,
    pub api_cost_usd: BigDecimal,
    pub processing_cost_usd: BigDecimal,
    pub total_ai_cost_usd: BigDecimal,
    pub avg_cost_per_conversation_usd: BigDecimal,
    pub avg_messages_per_conversation: f64,
    pub avg_duration_minutes: Option<f64>,
    /// Appointments booked through WhatsApp/AI in the period.
    pub ai_sourced_appointments: u64,
    /// `ai_sourced_appointments` as a percentage of conversations.
    pub conversion_rate: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BillingMetrics {
    pub status: TenantStatus,
    pub subscription_plan: Option<String>,
    pub plan_tier: Option<PlanTier>,
    /// Monthly fee when the tenant is active, zero otherwise.
    pub mrr: BigDecimal,
    pub plan_cost: Option<PlanCost>,
    pub payments_received: BigDecimal,
    pub payments_count: u64,
}

/// Every metric of one tenant for one period.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TenantMetrics {
    pub tenant_id: Uuid,
    pub period: MetricPeriod,
    pub appointments: AppointmentMetrics,
    pub revenue: RevenueMetrics,
    pub conversations: ConversationMetrics,
    pub billing: BillingMetrics,
}

impl TenantMetrics {
    /// One JSON payload per metric type, in `MetricType::ALL` order.
    pub fn metric_payloads(&self) -> Result<Vec<(MetricType, serde_json::Value)>, serde_json::Error> {
        Ok(vec![
            (MetricType::Appointments, serde_json::to_value(&self.appointments)?),
            (MetricType::Revenue, serde_json::to_value(&self.revenue)?),
            (MetricType::Conversations, serde_json::to_value(&self.conversations)?),
            (MetricType::Billing, serde_json::to_value(&self.billing)?),
        ])
    }
}

/// Platform-wide rollup of a period.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlatformMetrics {
    pub period: MetricPeriod,
    pub tenants_included: u64,
    pub active_tenants: u64,
    pub trial_tenants: u64,
    pub cancelled_tenants: u64,
    pub mrr: BigDecimal,
    pub total_revenue: BigDecimal,
    pub total_appointments: u64,
    pub revenue_appointments: u64,
    pub no_show_appointments: u64,
    pub no_show_lost_revenue: BigDecimal,
    pub total_conversations: u64,
    pub total_messages: u64,
    pub total_ai_cost_usd: BigDecimal,
    pub payments_received: BigDecimal,
}

/// `part / whole` as a percentage with two decimals; zero when `whole` is zero.
pub fn percentage(part: u64, whole: u64) -> f64 {
    if whole == 0 {
        return 0.0;
    }
    round2(part as f64 * 100.0 / whole as f64)
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

fn average(total: &BigDecimal, count: u64, digits: i64) -> BigDecimal {
    if count == 0 {
        return BigDecimal::zero();
    }
    (total / BigDecimal::from(count)).round(digits)
}

pub fn appointment_metrics(appointments: &[Appointment]) -> AppointmentMetrics {
    let mut metrics = AppointmentMetrics::default();

    for appointment in appointments {
        metrics.total += 1;
        match appointment.status {
            AppointmentStatus::Pending => metrics.pending += 1,
            AppointmentStatus::Confirmed => metrics.confirmed += 1,
            AppointmentStatus::Completed => metrics.completed += 1,
            AppointmentStatus::Cancelled => metrics.cancelled += 1,
            AppointmentStatus::NoShow => metrics.no_show += 1,
        }
        *metrics
            .by_source
            .entry(appointment.source().as_str().to_string())
            .or_insert(0) += 1;
    }

    metrics.completion_rate = percentage(metrics.completed, metrics.total);
    metrics.cancellation_rate = percentage(metrics.cancelled, metrics.total);
    metrics.no_show_rate = percentage(metrics.no_show, metrics.total);
    metrics
}

pub fn revenue_metrics(appointments: &[Appointment]) -> RevenueMetrics {
    let mut revenue = BigDecimal::zero();
    let mut revenue_appointments = 0u64;
    let mut no_show_lost_revenue = BigDecimal::zero();
    let mut no_show_appointments = 0u64;
    let mut cancelled_lost_revenue = BigDecimal::zero();

    for appointment in appointments {
        if let Some(price) = appointment.revenue_contribution() {
            revenue += price;
            revenue_appointments += 1;
            continue;
        }
        match appointment.status {
            AppointmentStatus::NoShow => {
                no_show_appointments += 1;
                if let Some(price) = appointment.effective_price() {
                    no_show_lost_revenue += price;
                }
            }
            AppointmentStatus::Cancelled => {
                if let Some(price) = appointment.effective_price() {
                    cancelled_lost_revenue += price;
                }
            }
            _ => {}
        }
    }

    let average_ticket = average(&revenue, revenue_appointments, 2);
    RevenueMetrics {
        revenue,
        revenue_appointments,
        average_ticket,
        no_show_lost_revenue,
        no_show_appointments,
        cancelled_lost_revenue,
    }
}

pub fn conversation_metrics(
    conversations: &[Conversation],
    appointments: &[Appointment],
) -> ConversationMetrics {
    let total_conversations = conversations.len() as u64;
    let mut total_messages = 0u64;
    let mut user_messages = 0u64;
    let mut outcomes: BTreeMap<String, u64> = BTreeMap::new();
    let mut unresolved = 0u64;
    let mut conflicting = 0u64;
    let mut api_cost = BigDecimal::zero();
    let mut processing_cost = BigDecimal::zero();
    let mut duration_sum = 0i64;
    let mut duration_count = 0u64;

    for conversation in conversations {
        total_messages += conversation.message_count.max(0) as u64;
        user_messages += conversation.user_message_count.max(0) as u64;
        api_cost += &conversation.api_cost_usd;
        processing_cost += &conversation.processing_cost_usd;

        match conversation.outcome() {
            OutcomeResolution::Unresolved => unresolved += 1,
            OutcomeResolution::Resolved(label) => *outcomes.entry(label).or_insert(0) += 1,
            OutcomeResolution::Conflicting(_) => conflicting += 1,
        }

        if let Some(minutes) = conversation.effective_duration_minutes() {
            duration_sum += minutes;
            duration_count += 1;
        }
    }

    let ai_sourced_appointments = appointments
        .iter()
        .filter(|a| a.source() == AppointmentSource::Whatsapp)
        .count() as u64;

    let total_ai_cost = &api_cost + &processing_cost;
    let avg_cost_per_conversation_usd = average(&total_ai_cost, total_conversations, 6);
    let avg_messages_per_conversation = if total_conversations == 0 {
        0.0
    } else {
        round2(total_messages as f64 / total_conversations as f64)
    };
    let avg_duration_minutes =
        (duration_count > 0).then(|| round2(duration_sum as f64 / duration_count as f64));

    ConversationMetrics {
        total_conversations,
        total_messages,
        user_messages,
        outcomes,
        unresolved_outcome_conversations: unresolved,
        conflicting_outcome_conversations: conflicting,
        api_cost_usd: api_cost,
        processing_cost_usd: processing_cost,
        total_ai_cost_usd: total_ai_cost,
        avg_cost_per_conversation_usd,
        avg_messages_per_conversation,
        avg_duration_minutes,
        ai_sourced_appointments,
        conversion_rate: percentage(ai_sourced_appointments, total_conversations),
    }
}

pub fn billing_metrics(
    tenant: &Tenant,
    conversations: u64,
    payments: &[SubscriptionPayment],
) -> BillingMetrics {
    let mrr = match (tenant.status, &tenant.monthly_subscription_fee) {
        (TenantStatus::Active, Some(fee)) => fee.clone(),
        _ => BigDecimal::zero(),
    };

    let plan_tier = tenant
        .subscription_plan
        .as_deref()
        .and_then(PlanTier::from_plan_name);

    let mut payments_received = BigDecimal::zero();
    let mut payments_count = 0u64;
    for payment in payments.iter().filter(|p| p.is_completed()) {
        payments_received += &payment.amount;
        payments_count += 1;
    }

    BillingMetrics {
        status: tenant.status,
        subscription_plan: tenant.subscription_plan.clone(),
        plan_tier,
        mrr,
        plan_cost: plan_tier.map(|tier| plan_cost(tier, conversations)),
        payments_received,
        payments_count,
    }
}

/// Computes every metric of `tenant` for `period`.
///
/// Input slices may contain other tenants' rows and rows outside the period;
/// they are filtered out here.
pub fn compute_tenant_metrics(
    tenant: &Tenant,
    period: &MetricPeriod,
    appointments: &[Appointment],
    conversations: &[Conversation],
    payments: &[SubscriptionPayment],
) -> TenantMetrics {
    let appointments: Vec<Appointment> = appointments
        .iter()
        .filter(|a| a.tenant_id == tenant.id && period.contains(a.start_time))
        .cloned()
        .collect();
    let conversations: Vec<Conversation> = conversations
        .iter()
        .filter(|c| c.tenant_id == tenant.id && period.contains(c.started_at))
        .cloned()
        .collect();
    let payments: Vec<SubscriptionPayment> = payments
        .iter()
        .filter(|p| p.tenant_id == tenant.id && period.contains(p.payment_date))
        .cloned()
        .collect();

    let conversation_metrics = conversation_metrics(&conversations, &appointments);
    let billing = billing_metrics(tenant, conversation_metrics.total_conversations, &payments);

    TenantMetrics {
        tenant_id: tenant.id,
        period: *period,
        appointments: appointment_metrics(&appointments),
        revenue: revenue_metrics(&appointments),
        conversations: conversation_metrics,
        billing,
    }
}

/// Sums tenant metrics into the platform rollup for `period`.
pub fn rollup_platform(period: &MetricPeriod, tenants: &[TenantMetrics]) -> PlatformMetrics {
    let mut rollup = PlatformMetrics {
        period: *period,
        tenants_included: 0,
        active_tenants: 0,
        trial_tenants: 0,
        cancelled_tenants: 0,
        mrr: BigDecimal::zero(),
        total_revenue: BigDecimal::zero(),
        total_appointments: 0,
        revenue_appointments: 0,
        no_show_appointments: 0,
        no_show_lost_revenue: BigDecimal::zero(),
        total_conversations: 0,
        total_messages: 0,
        total_ai_cost_usd: BigDecimal::zero(),
        payments_received: BigDecimal::zero(),
    };

    for tenant in tenants {
        rollup.tenants_included += 1;
        match tenant.billing.status {
            TenantStatus::Active => rollup.active_tenants += 1,
            TenantStatus::Trial => rollup.trial_tenants += 1,
            TenantStatus::Cancelled => rollup.cancelled_tenants += 1,
        }
        rollup.mrr += &tenant.billing.mrr;
        rollup.total_revenue += &tenant.revenue.revenue;
        rollup.total_appointments += tenant.appointments.total;
        rollup.revenue_appointments += tenant.revenue.revenue_appointments;
        rollup.no_show_appointments += tenant.revenue.no_show_appointments;
        rollup.no_show_lost_revenue += &tenant.revenue.no_show_lost_revenue;
        rollup.total_conversations += tenant.conversations.total_conversations;
        rollup.total_messages += tenant.conversations.total_messages;
        rollup.total_ai_cost_usd += &tenant.conversations.total_ai_cost_usd;
        rollup.payments_received += &tenant.billing.payments_received;
    }

    rollup
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_percentage() {
        assert_eq!(percentage(0, 0), 0.0);
        assert_eq!(percentage(1, 3), 33.33);
        assert_eq!(percentage(2, 3), 66.67);
        assert_eq!(percentage(5, 5), 100.0);
    }

    #[test]
    fn test_metric_type_round_trip_names() {
        for metric_type in MetricType::ALL {
            assert_eq!(metric_type.as_str().parse::<MetricType>(), Ok(metric_type));
        }
        assert!("mrr".parse::<MetricType>().is_err());
    }

    #[test]
    fn test_empty_inputs_yield_zeroes() {
        let revenue = revenue_metrics(&[]);
        assert!(revenue.revenue.is_zero());
        assert!(revenue.average_ticket.is_zero());

        let conversations = conversation_metrics(&[], &[]);
        assert_eq!(conversations.total_conversations, 0);
        assert_eq!(conversations.avg_duration_minutes, None);
        assert_eq!(conversations.conversion_rate, 0.0);
    }
}
