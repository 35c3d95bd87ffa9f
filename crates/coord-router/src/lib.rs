//! The Model Router (C3): per-request backend selection under budget and
//! mode policy, producing an ordered fallback chain that always ends at the
//! local tier. Grounded in the teacher's `ProviderRegistry::select_provider`
//! precedence chain (explicit id -> configured default -> first available),
//! generalized here to tier + task-class + budget-phase + economic mode.

use coord_types::{BudgetPhase, BudgetStatus, CoreError, CoreResult, EconomicMode, LatencyClass, ModelDescriptor, TaskClass, Tier};

/// Which subsystem is asking for a chain. Per-component overrides (§4.3
/// rule 4) take precedence over the mode-derived tier for these two.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Component {
    Arbitrator,
    Orchestrator,
    Default,
}

#[derive(Debug, Clone, Copy)]
pub struct SelectRequest {
    pub est_in_tokens: u64,
    pub est_out_tokens: u64,
    pub task_class: TaskClass,
    pub mode: EconomicMode,
    pub budget: BudgetStatus,
    pub component: Component,
}

/// Selects a backend per request, holding the static catalog of
/// `ModelDescriptor`s and the two per-component tier overrides from
/// configuration (`router.overrides.arbitrator`/`orchestrator`).
pub struct ModelRouter {
    catalog: Vec<ModelDescriptor>,
    arbitrator_override: Tier,
    orchestrator_override: Tier,
}

impl ModelRouter {
    pub fn new(catalog: Vec<ModelDescriptor>, arbitrator_override: Tier, orchestrator_override: Tier) -> Self {
        Self {
            catalog,
            arbitrator_override,
            orchestrator_override,
        }
    }

    pub fn catalog(&self) -> &[ModelDescriptor] {
        &self.catalog
    }

    fn in_tier(&self, tier: Tier) -> Vec<&ModelDescriptor> {
        self.catalog.iter().filter(|m| m.tier == tier).collect()
    }

    fn fits_context(model: &ModelDescriptor, req: &SelectRequest) -> bool {
        (req.est_in_tokens + req.est_out_tokens) <= model.context_window as u64
    }

    fn latency_weight(class: LatencyClass) -> u32 {
        match class {
            LatencyClass::Fast => 1,
            LatencyClass::Medium => 2,
            LatencyClass::Slow => 3,
        }
    }

    /// Backend ids in `tier`, cheapest-first for the given estimate. Ties
    /// broken by latency, then id, for determinism.
    fn sorted_ids_in_tier(&self, tier: Tier, req: &SelectRequest) -> Vec<String> {
        let mut models = self.in_tier(tier);
        models.sort_by(|a, b| {
            let cost_a = a.cost(req.est_in_tokens, req.est_out_tokens);
            let cost_b = b.cost(req.est_in_tokens, req.est_out_tokens);
            cost_a
                .partial_cmp(&cost_b)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| Self::latency_weight(a.latency_class).cmp(&Self::latency_weight(b.latency_class)))
                .then_with(|| a.id.cmp(&b.id))
        });
        models.into_iter().map(|m| m.id.clone()).collect()
    }

    /// Cheapest tier (by this request's estimate) with at least one backend
    /// whose context window fits the estimate. Falls back to the cheapest
    /// tier overall if none fit, so callers always get a primary candidate.
    fn cheapest_fitting_tier(&self, req: &SelectRequest) -> Tier {
        let mut best: Option<(f64, Tier)> = None;
        let mut best_any: Option<(f64, Tier)> = None;
        for tier in [Tier::Local, Tier::Elastic, Tier::Premium] {
            let models = self.in_tier(tier);
            let Some(cheapest) = models.iter().min_by(|a, b| {
                a.cost(req.est_in_tokens, req.est_out_tokens)
                    .partial_cmp(&b.cost(req.est_in_tokens, req.est_out_tokens))
                    .unwrap_or(std::cmp::Ordering::Equal)
            }) else {
                continue;
            };
            let cost = cheapest.cost(req.est_in_tokens, req.est_out_tokens);
            if best_any.map(|(c, _)| cost < c).unwrap_or(true) {
                best_any = Some((cost, tier));
            }
            if Self::fits_context(cheapest, req) && best.map(|(c, _)| cost < c).unwrap_or(true) {
                best = Some((cost, tier));
            }
        }
        best.or(best_any).map(|(_, tier)| tier).unwrap_or(Tier::Local)
    }

    /// Tier minimizing `cost x latency` across tiers that have at least one
    /// backend (§4.3 rule 3, "balanced").
    fn balanced_tier(&self, req: &SelectRequest) -> Tier {
        let mut best: Option<(f64, Tier)> = None;
        for tier in [Tier::Local, Tier::Elastic, Tier::Premium] {
            let models = self.in_tier(tier);
            let Some(score) = models
                .iter()
                .map(|m| {
                    let cost = m.cost(req.est_in_tokens, req.est_out_tokens).max(0.000_001);
                    cost * Self::latency_weight(m.latency_class) as f64
                })
                .min_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal))
            else {
                continue;
            };
            if best.map(|(s, _)| score < s).unwrap_or(true) {
                best = Some((score, tier));
            }
        }
        best.map(|(_, tier)| tier).unwrap_or(Tier::Local)
    }

    /// Whether `class` is tagged local-preferred for the "performance" mode
    /// exception in §4.3 rule 3. The source spec leaves the tag set
    /// unspecified; this implementation tags none, so performance mode
    /// always prefers premium unless a budget phase override applies.
    fn is_local_preferred(_class: TaskClass) -> bool {
        false
    }

    fn mode_tier(&self, req: &SelectRequest) -> Tier {
        match req.mode {
            EconomicMode::CostOptimized => self.cheapest_fitting_tier(req),
            EconomicMode::Balanced => self.balanced_tier(req),
            EconomicMode::Performance => {
                if Self::is_local_preferred(req.task_class) {
                    Tier::Local
                } else {
                    Tier::Premium
                }
            }
        }
    }

    fn primary_tier(&self, req: &SelectRequest) -> Tier {
        match req.component {
            Component::Arbitrator => self.arbitrator_override,
            Component::Orchestrator => self.orchestrator_override,
            Component::Default => self.mode_tier(req),
        }
    }

    /// Select a backend chain for `req`. Rule 1/2: HALT errors outright;
    /// OLLAMA_ONLY routes to local regardless of mode. Otherwise builds
    /// `[primary tier backends.., other tiers.., local tier backends]`,
    /// deduplicated by tier and always ending in local (rule 5).
    pub fn select(&self, req: &SelectRequest) -> CoreResult<Vec<String>> {
        if req.budget.phase == BudgetPhase::Halt {
            return Err(CoreError::BudgetExhausted(
                "project budget phase is HALT".to_string(),
            ));
        }

        if req.budget.phase == BudgetPhase::OllamaOnly {
            let locals = self.sorted_ids_in_tier(Tier::Local, req);
            if locals.is_empty() {
                return Err(CoreError::DependencyUnavailable(
                    "no local-tier backend configured".to_string(),
                ));
            }
            return Ok(locals);
        }

        let primary = self.primary_tier(req);
        let mut tier_order = vec![primary];
        for tier in [Tier::Premium, Tier::Elastic, Tier::Local] {
            if !tier_order.contains(&tier) {
                tier_order.push(tier);
            }
        }
        if tier_order.last() != Some(&Tier::Local) {
            tier_order.retain(|t| *t != Tier::Local);
            tier_order.push(Tier::Local);
        }

        let mut chain = Vec::new();
        for tier in tier_order {
            chain.extend(self.sorted_ids_in_tier(tier, req));
        }

        if chain.is_empty() {
            return Err(CoreError::DependencyUnavailable(
                "no backend configured in any tier".to_string(),
            ));
        }
        Ok(chain)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use coord_types::BudgetPhase;

    fn model(id: &str, tier: Tier, price_in: f64, price_out: f64, window: u32, latency: LatencyClass) -> ModelDescriptor {
        ModelDescriptor {
            id: id.to_string(),
            tier,
            price_in_per_million: price_in,
            price_out_per_million: price_out,
            context_window: window,
            latency_class: latency,
            capability_tags: vec![],
            endpoint: "https://example.invalid".to_string(),
        }
    }

    fn router() -> ModelRouter {
        ModelRouter::new(
            vec![
                model("local-ollama", Tier::Local, 0.0, 0.0, 32_000, LatencyClass::Slow),
                model("elastic-default", Tier::Elastic, 0.15, 0.6, 128_000, LatencyClass::Medium),
                model("premium-default", Tier::Premium, 3.0, 15.0, 200_000, LatencyClass::Fast),
            ],
            Tier::Premium,
            Tier::Elastic,
        )
    }

    fn status(daily: f64, phase: BudgetPhase) -> BudgetStatus {
        BudgetStatus { daily, monthly: daily, phase }
    }

    fn request(mode: EconomicMode, component: Component, budget: BudgetStatus) -> SelectRequest {
        SelectRequest {
            est_in_tokens: 1_000,
            est_out_tokens: 500,
            task_class: TaskClass::CodeGeneration,
            mode,
            budget,
            component,
        }
    }

    #[test]
    fn halt_phase_errors_without_a_chain() {
        let router = router();
        let req = request(EconomicMode::Balanced, Component::Default, status(0.96, BudgetPhase::Halt));
        let err = router.select(&req).unwrap_err();
        assert_eq!(err.code(), "budget_exhausted");
    }

    #[test]
    fn ollama_only_routes_to_local_regardless_of_mode() {
        let router = router();
        let req = request(EconomicMode::Performance, Component::Default, status(0.85, BudgetPhase::OllamaOnly));
        let chain = router.select(&req).unwrap();
        assert_eq!(chain, vec!["local-ollama".to_string()]);
    }

    #[test]
    fn chain_always_terminates_at_local_tier() {
        let router = router();
        let req = request(EconomicMode::Performance, Component::Default, status(0.1, BudgetPhase::Normal));
        let chain = router.select(&req).unwrap();
        assert_eq!(chain.last(), Some(&"local-ollama".to_string()));
        assert_eq!(chain.first(), Some(&"premium-default".to_string()));
    }

    #[test]
    fn arbitrator_component_override_wins_over_cost_optimized_mode() {
        let router = router();
        let req = request(EconomicMode::CostOptimized, Component::Arbitrator, status(0.1, BudgetPhase::Normal));
        let chain = router.select(&req).unwrap();
        assert_eq!(chain.first(), Some(&"premium-default".to_string()));
    }

    #[test]
    fn orchestrator_component_override_prefers_elastic() {
        let router = router();
        let req = request(EconomicMode::Performance, Component::Orchestrator, status(0.1, BudgetPhase::Normal));
        let chain = router.select(&req).unwrap();
        assert_eq!(chain.first(), Some(&"elastic-default".to_string()));
    }

    #[test]
    fn cost_optimized_picks_cheapest_tier_that_fits_context() {
        let router = router();
        let req = SelectRequest {
            est_in_tokens: 1_000,
            est_out_tokens: 500,
            task_class: TaskClass::General,
            mode: EconomicMode::CostOptimized,
            budget: status(0.1, BudgetPhase::Normal),
            component: Component::Default,
        };
        let chain = router.select(&req).unwrap();
        assert_eq!(chain.first(), Some(&"local-ollama".to_string()));
    }

    #[test]
    fn budget_below_sixty_percent_is_not_throttled() {
        let router = router();
        let req = request(EconomicMode::Balanced, Component::Default, status(0.59, BudgetPhase::Normal));
        assert!(router.select(&req).is_ok());
    }
}
