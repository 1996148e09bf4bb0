//! Plan catalog: the immutable set of subscription tiers.
//!
//! Catalog order is the upgrade order: the first plan is the entry tier and
//! each subsequent plan is an upgrade over the one before it.

use std::{collections::HashSet, fmt};

use serde::{Deserialize, Serialize};

use crate::{
  Error, Result,
  error::CatalogError,
};

// ─── Identifier ──────────────────────────────────────────────────────────────

/// Unique plan identifier, e.g. `"free"`, `"pro"`, `"enterprise"`.
#[derive(
  Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct PlanId(String);

impl PlanId {
  pub fn new(id: impl Into<String>) -> Self { Self(id.into()) }

  pub fn as_str(&self) -> &str { &self.0 }
}

impl fmt::Display for PlanId {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(&self.0)
  }
}

impl From<&str> for PlanId {
  fn from(s: &str) -> Self { Self(s.to_owned()) }
}

// ─── Plan ────────────────────────────────────────────────────────────────────

/// A published subscription tier. Immutable once the catalog is loaded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Plan {
  pub id:                   PlanId,
  pub name:                 String,
  pub monthly_price_usd:    u32,
  /// Queries admitted per quota cycle. Zero means every query is denied.
  pub max_queries:          u32,
  pub response_time_target: String,
  pub support_tier:         String,
  /// Ordered feature flags, as displayed on the plan page.
  pub features:             Vec<String>,
  pub popular:              bool,
}

/// Unvalidated plan definition as it appears in configuration.
///
/// `max_queries` is signed so that a negative value in a config file is
/// caught by validation rather than by a deserialisation error.
#[derive(Debug, Clone, Deserialize)]
pub struct PlanSpec {
  pub id:                   String,
  pub name:                 String,
  #[serde(default)]
  pub monthly_price_usd:    u32,
  pub max_queries:          i64,
  #[serde(default)]
  pub response_time_target: String,
  #[serde(default)]
  pub support_tier:         String,
  #[serde(default)]
  pub features:             Vec<String>,
  #[serde(default)]
  pub popular:              bool,
}

impl TryFrom<PlanSpec> for Plan {
  type Error = CatalogError;

  fn try_from(spec: PlanSpec) -> Result<Self, CatalogError> {
    let id = spec.id.trim();
    if id.is_empty() {
      return Err(CatalogError::BlankId);
    }
    let id = PlanId::from(id);
    let max_queries = match u32::try_from(spec.max_queries) {
      Ok(n) => n,
      Err(_) if spec.max_queries < 0 => {
        return Err(CatalogError::NegativeQuota {
          plan:  id,
          value: spec.max_queries,
        });
      }
      Err(_) => {
        return Err(CatalogError::QuotaOutOfRange {
          plan:  id,
          value: spec.max_queries,
        });
      }
    };
    Ok(Plan {
      id,
      name: spec.name,
      monthly_price_usd: spec.monthly_price_usd,
      max_queries,
      response_time_target: spec.response_time_target,
      support_tier: spec.support_tier,
      features: spec.features,
      popular: spec.popular,
    })
  }
}

// ─── Catalog ─────────────────────────────────────────────────────────────────

/// The loaded plan catalog. Read-only after construction, so it is shared
/// freely between tasks without synchronisation.
#[derive(Debug, Clone)]
pub struct PlanCatalog {
  plans: Vec<Plan>,
}

impl PlanCatalog {
  /// Validate and load plan definitions, preserving their order.
  pub fn from_specs(
    specs: impl IntoIterator<Item = PlanSpec>,
  ) -> Result<Self, CatalogError> {
    let mut seen = HashSet::new();
    let mut plans = Vec::new();
    for spec in specs {
      let plan = Plan::try_from(spec)?;
      if !seen.insert(plan.id.clone()) {
        return Err(CatalogError::DuplicatePlan(plan.id));
      }
      plans.push(plan);
    }
    if plans.is_empty() {
      return Err(CatalogError::Empty);
    }
    Ok(Self { plans })
  }

  /// The built-in Free / Professional / Enterprise catalog.
  pub fn builtin() -> Self {
    Self { plans: builtin_plans() }
  }

  pub fn lookup(&self, id: &PlanId) -> Result<&Plan> {
    self
      .plans
      .iter()
      .find(|p| &p.id == id)
      .ok_or_else(|| Error::UnknownPlan(id.clone()))
  }

  /// All plans in catalog (upgrade) order.
  pub fn list(&self) -> &[Plan] { &self.plans }

  /// The plan assigned to subscribers seen for the first time.
  pub fn entry_plan(&self) -> &Plan { &self.plans[0] }

  /// Position of `id` in upgrade order.
  pub fn rank(&self, id: &PlanId) -> Result<usize> {
    self
      .plans
      .iter()
      .position(|p| &p.id == id)
      .ok_or_else(|| Error::UnknownPlan(id.clone()))
  }

  /// The next plan above `id`, or `None` for the top tier.
  pub fn upgrade_from(&self, id: &PlanId) -> Result<Option<&Plan>> {
    Ok(self.plans.get(self.rank(id)? + 1))
  }

  pub fn is_upgrade(&self, from: &PlanId, to: &PlanId) -> Result<bool> {
    Ok(self.rank(to)? > self.rank(from)?)
  }
}

fn builtin_plans() -> Vec<Plan> {
  let plan = |id: &str, name: &str, price: u32, max_queries: u32| Plan {
    id: PlanId::from(id),
    name: name.to_owned(),
    monthly_price_usd: price,
    max_queries,
    response_time_target: String::new(),
    support_tier: String::new(),
    features: Vec::new(),
    popular: false,
  };
  let features =
    |list: &[&str]| list.iter().map(|f| (*f).to_owned()).collect::<Vec<_>>();

  vec![
    Plan {
      response_time_target: "< 5s".into(),
      support_tier: "Community".into(),
      features: features(&[
        "Basic threat detection",
        "50 queries per month",
        "Community support",
        "Basic vulnerability scan",
        "Email notifications",
      ]),
      ..plan("free", "Free", 0, 50)
    },
    Plan {
      response_time_target: "< 2s".into(),
      support_tier: "Priority".into(),
      popular: true,
      features: features(&[
        "Advanced threat analysis",
        "500 queries per month",
        "Priority support",
        "Real-time monitoring",
        "Custom alerts",
        "API access",
        "Detailed reports",
        "Multi-user access",
      ]),
      ..plan("pro", "Professional", 29, 500)
    },
    Plan {
      response_time_target: "< 1s".into(),
      support_tier: "Dedicated".into(),
      features: features(&[
        "Enterprise-grade security",
        "2000 queries per month",
        "Dedicated support manager",
        "24/7 monitoring",
        "Custom integrations",
        "Advanced analytics",
        "White-label options",
        "SLA guarantee",
        "On-premise deployment",
      ]),
      ..plan("enterprise", "Enterprise", 99, 2000)
    },
  ]
}

#[cfg(test)]
mod tests {
  use super::*;

  fn plan_spec(id: &str, max_queries: i64) -> PlanSpec {
    PlanSpec {
      id: id.into(),
      name: id.to_uppercase(),
      monthly_price_usd: 0,
      max_queries,
      response_time_target: String::new(),
      support_tier: String::new(),
      features: Vec::new(),
      popular: false,
    }
  }

  #[test]
  fn builtin_catalog_is_ordered_free_pro_enterprise() {
    let catalog = PlanCatalog::builtin();
    let ids: Vec<_> = catalog.list().iter().map(|p| p.id.as_str()).collect();
    assert_eq!(ids, ["free", "pro", "enterprise"]);
    assert_eq!(catalog.entry_plan().max_queries, 50);
    assert!(catalog.lookup(&"pro".into()).unwrap().popular);
  }

  #[test]
  fn lookup_miss_is_unknown_plan() {
    let catalog = PlanCatalog::builtin();
    let err = catalog.lookup(&"platinum".into()).unwrap_err();
    assert!(matches!(err, Error::UnknownPlan(id) if id.as_str() == "platinum"));
  }

  #[test]
  fn upgrade_order_follows_catalog_order() {
    let catalog = PlanCatalog::builtin();
    let next = catalog.upgrade_from(&"free".into()).unwrap().unwrap();
    assert_eq!(next.id.as_str(), "pro");
    assert!(catalog.upgrade_from(&"enterprise".into()).unwrap().is_none());
    assert!(catalog.is_upgrade(&"free".into(), &"enterprise".into()).unwrap());
    assert!(!catalog.is_upgrade(&"pro".into(), &"free".into()).unwrap());
  }

  #[test]
  fn negative_quota_is_rejected_at_load() {
    let err = PlanCatalog::from_specs([plan_spec("free", 50), plan_spec("bad", -1)])
      .unwrap_err();
    assert!(matches!(err, CatalogError::NegativeQuota { value: -1, .. }));
  }

  #[test]
  fn zero_quota_is_allowed() {
    let catalog = PlanCatalog::from_specs([plan_spec("locked", 0)]).unwrap();
    assert_eq!(catalog.entry_plan().max_queries, 0);
  }

  #[test]
  fn duplicate_and_empty_catalogs_are_rejected() {
    assert!(matches!(
      PlanCatalog::from_specs([plan_spec("a", 1), plan_spec("a", 2)]),
      Err(CatalogError::DuplicatePlan(_))
    ));
    assert!(matches!(
      PlanCatalog::from_specs(Vec::new()),
      Err(CatalogError::Empty)
    ));
    assert!(matches!(
      PlanCatalog::from_specs([plan_spec("  ", 1)]),
      Err(CatalogError::BlankId)
    ));
  }

  #[test]
  fn oversized_quota_is_out_of_range() {
    let err = PlanCatalog::from_specs([plan_spec("huge", i64::MAX)]).unwrap_err();
    assert!(matches!(err, CatalogError::QuotaOutOfRange { .. }));
  }
}
