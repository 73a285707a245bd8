mod common;

use bigdecimal::Zero;
use chrono::{TimeZone, Utc};
use common::{appointment, at, dec, message, payment, tenant};
use tenant_metrics::conversation::aggregate_sessions;
use tenant_metrics::metrics::{compute_tenant_metrics, rollup_platform, MetricType};
use tenant_metrics::models::{AppointmentStatus, TenantStatus};
use tenant_metrics::period::MetricPeriod;
use tenant_metrics::plans::PlanTier;

fn august() -> MetricPeriod {
    MetricPeriod::month(2025, 8).unwrap()
}

#[test]
fn revenue_uses_final_price_and_skips_non_bearing_statuses() {
    let t = tenant(TenantStatus::Active, Some("Profissional"), Some("116.00"));
    let appointments = vec![
        appointment(t.id, AppointmentStatus::Completed, Some("80.00"), Some("95.00"), at(2, 10)),
        appointment(t.id, AppointmentStatus::Confirmed, Some("50.00"), None, at(3, 10)),
        appointment(t.id, AppointmentStatus::Pending, Some("70.00"), None, at(4, 10)),
        appointment(t.id, AppointmentStatus::NoShow, Some("60.00"), None, at(5, 10)),
        appointment(t.id, AppointmentStatus::Cancelled, Some("40.00"), None, at(6, 10)),
    ];

    let metrics = compute_tenant_metrics(&t, &august(), &appointments, &[], &[]);

    assert_eq!(metrics.revenue.revenue, dec("145.00"));
    assert_eq!(metrics.revenue.revenue_appointments, 2);
    assert_eq!(metrics.revenue.average_ticket, dec("72.50"));
    assert_eq!(metrics.revenue.no_show_lost_revenue, dec("60.00"));
    assert_eq!(metrics.revenue.no_show_appointments, 1);
    assert_eq!(metrics.revenue.cancelled_lost_revenue, dec("40.00"));

    assert_eq!(metrics.appointments.total, 5);
    assert_eq!(metrics.appointments.completion_rate, 20.0);
    assert_eq!(metrics.appointments.no_show_rate, 20.0);
}

#[test]
fn rows_of_other_tenants_and_periods_are_ignored() {
    let t = tenant(TenantStatus::Active, None, None);
    let other = tenant(TenantStatus::Active, None, None);
    let july = Utc.with_ymd_and_hms(2025, 7, 31, 23, 59, 59).unwrap();
    let september = Utc.with_ymd_and_hms(2025, 9, 1, 0, 0, 0).unwrap();

    let appointments = vec![
        appointment(t.id, AppointmentStatus::Completed, Some("10"), None, at(1, 0)),
        appointment(t.id, AppointmentStatus::Completed, Some("10"), None, july),
        appointment(t.id, AppointmentStatus::Completed, Some("10"), None, september),
        appointment(other.id, AppointmentStatus::Completed, Some("10"), None, at(1, 0)),
    ];
    let conversations = aggregate_sessions(&[
        message(t.id, Some("a"), at(31, 23), None),
        message(t.id, Some("b"), july, None),
        message(other.id, Some("a"), at(10, 10), None),
    ]);

    let metrics = compute_tenant_metrics(&t, &august(), &appointments, &conversations, &[]);

    assert_eq!(metrics.revenue.revenue, dec("10"));
    assert_eq!(metrics.appointments.total, 1);
    assert_eq!(metrics.conversations.total_conversations, 1);
}

#[test]
fn conversation_metrics_count_conversations_not_messages() {
    let t = tenant(TenantStatus::Active, Some("basic"), Some("58.00"));
    let conversations = aggregate_sessions(&[
        message(t.id, Some("s1"), at(2, 9), None),
        message(t.id, Some("s1"), at(2, 10), Some("appointment_created")),
        message(t.id, Some("s2"), at(3, 9), Some("price_inquiry")),
        message(t.id, Some("s2"), at(3, 10), Some("appointment_created")),
        message(t.id, None, at(4, 9), None),
    ]);
    let mut whatsapp = appointment(t.id, AppointmentStatus::Confirmed, Some("30"), None, at(2, 15));
    whatsapp.source = Some("whatsapp_ai".to_string());

    let metrics = compute_tenant_metrics(&t, &august(), &[whatsapp], &conversations, &[]);
    let c = &metrics.conversations;

    assert_eq!(c.total_conversations, 3);
    assert_eq!(c.total_messages, 5);
    assert_eq!(c.outcomes.get("appointment_created"), Some(&1));
    assert_eq!(c.conflicting_outcome_conversations, 1);
    assert_eq!(c.unresolved_outcome_conversations, 1);
    assert_eq!(c.total_ai_cost_usd, dec("0.0125"));
    assert_eq!(c.avg_cost_per_conversation_usd, dec("0.004167"));
    assert_eq!(c.ai_sourced_appointments, 1);
    assert_eq!(c.conversion_rate, 33.33);
}

#[test]
fn billing_uses_plan_tier_and_counts_only_completed_payments() {
    let t = tenant(TenantStatus::Active, Some("Básico"), Some("58.00"));
    let messages: Vec<_> = (0..205)
        .map(|i: u32| message(t.id, Some(format!("s{}", i).as_str()), at(1 + i % 28, 10), None))
        .collect();
    let conversations = aggregate_sessions(&messages);
    let payments = vec![
        payment(t.id, "58.00", "completed", at(1, 12)),
        payment(t.id, "58.00", "failed", at(2, 12)),
    ];

    let metrics = compute_tenant_metrics(&t, &august(), &[], &conversations, &payments);
    let billing = &metrics.billing;

    assert_eq!(billing.plan_tier, Some(PlanTier::Basic));
    assert_eq!(billing.mrr, dec("58.00"));
    assert_eq!(billing.payments_received, dec("58.00"));
    assert_eq!(billing.payments_count, 1);

    let cost = billing.plan_cost.as_ref().unwrap();
    assert_eq!(cost.overage_conversations, 5);
    assert_eq!(cost.total, dec("59.25"));
}

#[test]
fn trial_tenants_contribute_no_mrr() {
    let t = tenant(TenantStatus::Trial, Some("enterprise"), Some("290.00"));
    let metrics = compute_tenant_metrics(&t, &august(), &[], &[], &[]);
    assert!(metrics.billing.mrr.is_zero());
}

#[test]
fn platform_rollup_is_the_sum_of_tenants() {
    let a = tenant(TenantStatus::Active, Some("basic"), Some("58.00"));
    let b = tenant(TenantStatus::Trial, None, None);
    let appointments = vec![
        appointment(a.id, AppointmentStatus::Completed, Some("100.00"), None, at(10, 10)),
        appointment(b.id, AppointmentStatus::Confirmed, Some("25.50"), None, at(11, 10)),
        appointment(b.id, AppointmentStatus::NoShow, Some("30.00"), None, at(12, 10)),
    ];
    let conversations = aggregate_sessions(&[
        message(a.id, Some("x"), at(10, 9), None),
        message(b.id, Some("y"), at(11, 9), None),
        message(b.id, Some("z"), at(12, 9), None),
    ]);

    let tenants: Vec<_> = [&a, &b]
        .iter()
        .map(|t| compute_tenant_metrics(t, &august(), &appointments, &conversations, &[]))
        .collect();
    let platform = rollup_platform(&august(), &tenants);

    assert_eq!(platform.tenants_included, 2);
    assert_eq!(platform.active_tenants, 1);
    assert_eq!(platform.trial_tenants, 1);
    assert_eq!(platform.total_revenue, dec("125.50"));
    assert_eq!(platform.total_conversations, 3);
    assert_eq!(platform.no_show_lost_revenue, dec("30.00"));
    assert_eq!(platform.mrr, dec("58.00"));
}

#[test]
fn metric_payloads_cover_every_type() {
    let t = tenant(TenantStatus::Active, None, None);
    let metrics = compute_tenant_metrics(&t, &august(), &[], &[], &[]);

    let payloads = metrics.metric_payloads().unwrap();
    let types: Vec<MetricType> = payloads.iter().map(|(m, _)| *m).collect();

    assert_eq!(types, MetricType::ALL.to_vec());
    assert!(payloads.iter().all(|(_, p)| p.is_object()));
}
