//! Invariant checks over stored snapshots and their source rows.
//!
//! - platform revenue equals the sum of the tenants' stored revenue;
//! - each tenant's stored conversation count equals the distinct
//!   conversations its message history references, and no message in the
//!   period is left without a conversation;
//! - every revenue-bearing appointment contributes exactly once to the
//!   platform revenue of its date bucket;
//! - every stored payload still matches its checksum.

use bigdecimal::{BigDecimal, Zero};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use uuid::Uuid;

use crate::checksum::verify_payload;
use crate::models::{Appointment, PlatformMetricSnapshot, TenantMetricSnapshot};
use crate::period::MetricPeriod;

pub const CHECK_PLATFORM_REVENUE: &str = "platform_revenue_matches_tenants";
pub const CHECK_CONVERSATION_COUNTS: &str = "conversation_counts_match_history";
pub const CHECK_APPOINTMENT_ONCE: &str = "appointment_revenue_counted_once";
pub const CHECK_SNAPSHOT_INTEGRITY: &str = "snapshot_payload_integrity";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckResult {
    pub name: String,
    pub passed: bool,
    pub detail: String,
    pub violations: Vec<String>,
}

impl CheckResult {
    fn from_violations(name: &str, detail: String, violations: Vec<String>) -> Self {
        Self {
            name: name.to_string(),
            passed: violations.is_empty(),
            detail,
            violations,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConsistencyReport {
    pub period: MetricPeriod,
    pub period_key: String,
    pub checks: Vec<CheckResult>,
}

impl ConsistencyReport {
    pub fn new(period: MetricPeriod, checks: Vec<CheckResult>) -> Self {
        Self {
            period,
            period_key: period.key(),
            checks,
        }
    }

    pub fn is_consistent(&self) -> bool {
        self.checks.iter().all(|c| c.passed)
    }

    pub fn violations(&self) -> impl Iterator<Item = (&str, &str)> {
        self.checks
            .iter()
            .flat_map(|c| c.violations.iter().map(move |v| (c.name.as_str(), v.as_str())))
    }
}

/// Platform revenue must equal the sum of per-tenant revenue.
///
/// `platform_revenue` is `None` when no platform snapshot exists; that is
/// only consistent when no tenant snapshot exists either.
pub fn check_platform_revenue(
    platform_revenue: Option<&BigDecimal>,
    tenant_revenues: &[(Uuid, BigDecimal)],
) -> CheckResult {
    let tenant_sum: BigDecimal = tenant_revenues.iter().map(|(_, r)| r.clone()).sum();
    let mut violations = Vec::new();

    let detail = match platform_revenue {
        Some(platform) => {
            if *platform != tenant_sum {
                violations.push(format!(
                    "platform revenue {} != sum of {} tenants {} (difference {})",
                    platform,
                    tenant_revenues.len(),
                    tenant_sum,
                    platform - &tenant_sum
                ));
            }
            format!("platform {} vs tenants {}", platform, tenant_sum)
        }
        None => {
            if !tenant_revenues.is_empty() {
                violations.push(format!(
                    "{} tenant revenue snapshots but no platform snapshot",
                    tenant_revenues.len()
                ));
            }
            "no platform snapshot".to_string()
        }
    };

    CheckResult::from_violations(CHECK_PLATFORM_REVENUE, detail, violations)
}

/// Stored `total_conversations` per tenant must equal the distinct
/// conversations referenced by message history.
pub fn check_conversation_counts(
    stored: &HashMap<Uuid, u64>,
    actual: &HashMap<Uuid, u64>,
    unlinked_messages: u64,
) -> CheckResult {
    let tenants: BTreeSet<&Uuid> = stored.keys().chain(actual.keys()).collect();
    let mut violations = Vec::new();

    for tenant_id in &tenants {
        let stored_count = stored.get(*tenant_id).copied();
        let actual_count = actual.get(*tenant_id).copied().unwrap_or(0);
        match stored_count {
            Some(count) if count == actual_count => {}
            Some(count) => violations.push(format!(
                "tenant {}: stored {} conversations, history has {}",
                tenant_id, count, actual_count
            )),
            None => violations.push(format!(
                "tenant {}: {} conversations in history but no stored snapshot",
                tenant_id, actual_count
            )),
        }
    }

    if unlinked_messages > 0 {
        violations.push(format!(
            "{} messages are not linked to any conversation",
            unlinked_messages
        ));
    }

    CheckResult::from_violations(
        CHECK_CONVERSATION_COUNTS,
        format!("{} tenants compared", tenants.len()),
        violations,
    )
}

/// Revenue per UTC start date of the revenue-bearing appointments.
pub fn revenue_by_day(appointments: &[Appointment]) -> BTreeMap<NaiveDate, BigDecimal> {
    let mut buckets: BTreeMap<NaiveDate, BigDecimal> = BTreeMap::new();
    for appointment in appointments {
        if let Some(price) = appointment.revenue_contribution() {
            *buckets
                .entry(appointment.start_time.date_naive())
                .or_insert_with(BigDecimal::zero) += price;
        }
    }
    buckets
}

/// Every revenue-bearing appointment of an included tenant must appear once,
/// fall inside the period, and the date buckets must add up to the platform
/// revenue.
pub fn check_appointment_revenue_once(
    period: &MetricPeriod,
    appointments: &[Appointment],
    included_tenants: &HashSet<Uuid>,
    platform_revenue: Option<&BigDecimal>,
) -> CheckResult {
    let eligible: Vec<Appointment> = appointments
        .iter()
        .filter(|a| included_tenants.contains(&a.tenant_id) && a.revenue_contribution().is_some())
        .cloned()
        .collect();

    let mut violations = Vec::new();
    let mut seen: HashSet<Uuid> = HashSet::new();
    for appointment in &eligible {
        if !seen.insert(appointment.id) {
            violations.push(format!("appointment {} appears more than once", appointment.id));
        }
        if !period.contains(appointment.start_time) {
            violations.push(format!(
                "appointment {} starts outside the period ({})",
                appointment.id, appointment.start_time
            ));
        }
    }

    let buckets = revenue_by_day(&eligible);
    let bucket_total: BigDecimal = buckets.values().cloned().sum();
    let expected = platform_revenue.cloned().unwrap_or_else(BigDecimal::zero);
    if bucket_total != expected {
        violations.push(format!(
            "{} daily buckets sum to {}, platform revenue is {}",
            buckets.len(),
            bucket_total,
            expected
        ));
    }

    CheckResult::from_violations(
        CHECK_APPOINTMENT_ONCE,
        format!(
            "{} revenue appointments across {} days",
            eligible.len(),
            buckets.len()
        ),
        violations,
    )
}

/// Every stored payload must still match the checksum written with it.
pub fn check_snapshot_integrity(
    tenant_snapshots: &[TenantMetricSnapshot],
    platform: Option<&PlatformMetricSnapshot>,
) -> CheckResult {
    let mut violations: Vec<String> = tenant_snapshots
        .iter()
        .filter(|s| !verify_payload(&s.metric_data, &s.payload_checksum))
        .map(|s| {
            format!(
                "tenant {} {} snapshot does not match its checksum",
                s.tenant_id, s.metric_type
            )
        })
        .collect();

    if let Some(platform) = platform {
        if !verify_payload(&platform.metric_data, &platform.payload_checksum) {
            violations.push("platform snapshot does not match its checksum".to_string());
        }
    }

    let checked = tenant_snapshots.len() + usize::from(platform.is_some());
    CheckResult::from_violations(
        CHECK_SNAPSHOT_INTEGRITY,
        format!("{} snapshots verified", checked),
        violations,
    )
}
