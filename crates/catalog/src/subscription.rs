//! Subscriptions: standing filters that mint replication rules for newly
//! registered DIDs matching a pattern.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::rule::Grouping;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SubscriptionState {
    Active,
    Inactive,
    Updated,
    Broken,
}

impl SubscriptionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SubscriptionState::Active => "ACTIVE",
            SubscriptionState::Inactive => "INACTIVE",
            SubscriptionState::Updated => "UPDATED",
            SubscriptionState::Broken => "BROKEN",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "ACTIVE" => SubscriptionState::Active,
            "INACTIVE" => SubscriptionState::Inactive,
            "UPDATED" => SubscriptionState::Updated,
            "BROKEN" => SubscriptionState::Broken,
            _ => return None,
        })
    }
}

/// A single rule to mint when a subscription's filter matches.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleTemplate {
    pub copies: u32,
    pub rse_expression: String,
    pub grouping: Option<Grouping>,
    pub weight_attr: Option<String>,
    pub lifetime_seconds: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Subscription {
    pub id: Uuid,
    pub account: String,
    /// JSON object keyed by metadata attributes the matcher checks
    /// (`pattern`, `scope`, arbitrary other keys — spec.md §4.6).
    pub filter: Value,
    pub replication_rules: Vec<RuleTemplate>,
    pub state: SubscriptionState,
    pub last_processed: Option<chrono::DateTime<chrono::Utc>>,
}
