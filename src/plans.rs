//! Subscription plan tiers and the cost of a tenant's usage under its plan.

use bigdecimal::{BigDecimal, Zero};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanTier {
    Basic,
    Professional,
    Enterprise,
}

/// List price and conversation allowance of a tier.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanPricing {
    pub monthly_price: BigDecimal,
    pub included_conversations: u64,
    pub overage_per_conversation: BigDecimal,
}

/// Cost of one period's usage under a tier.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanCost {
    pub tier: PlanTier,
    pub base_price: BigDecimal,
    pub included_conversations: u64,
    pub conversations: u64,
    pub overage_conversations: u64,
    pub overage_cost: BigDecimal,
    pub total: BigDecimal,
}

impl PlanTier {
    /// Maps a stored `subscription_plan` name to a tier; unknown names yield `None`.
    pub fn from_plan_name(name: &str) -> Option<Self> {
        let normalized: String = name
            .trim()
            .to_lowercase()
            .chars()
            .map(|c| match c {
                'á' | 'à' | 'â' | 'ã' => 'a',
                'é' | 'ê' => 'e',
                'í' => 'i',
                'ó' | 'ô' | 'õ' => 'o',
                'ú' => 'u',
                'ç' => 'c',
                '-' | ' ' => '_',
                other => other,
            })
            .collect();

        match normalized.as_str() {
            "basic" | "basico" | "starter" => Some(PlanTier::Basic),
            "professional" | "profissional" | "pro" => Some(PlanTier::Professional),
            "enterprise" | "empresarial" => Some(PlanTier::Enterprise),
            _ => None,
        }
    }

    pub fn pricing(&self) -> PlanPricing {
        // Prices carry two decimal places; overage is per conversation.
        let (price_cents, included): (i64, u64) = match self {
            PlanTier::Basic => (5800, 200),
            PlanTier::Professional => (11600, 400),
            PlanTier::Enterprise => (29000, 1250),
        };
        PlanPricing {
            monthly_price: BigDecimal::new(price_cents.into(), 2),
            included_conversations: included,
            overage_per_conversation: BigDecimal::new(25.into(), 2),
        }
    }
}

/// Cost of `conversations` conversations in one month under `tier`.
pub fn plan_cost(tier: PlanTier, conversations: u64) -> PlanCost {
    let pricing = tier.pricing();
    let overage_conversations = conversations.saturating_sub(pricing.included_conversations);
    let overage_cost = if overage_conversations == 0 {
        BigDecimal::zero()
    } else {
        &pricing.overage_per_conversation * BigDecimal::from(overage_conversations)
    };
    let total = &pricing.monthly_price + &overage_cost;

    PlanCost {
        tier,
        base_price: pricing.monthly_price,
        included_conversations: pricing.included_conversations,
        conversations,
        overage_conversations,
        overage_cost,
        total,
    }
}
