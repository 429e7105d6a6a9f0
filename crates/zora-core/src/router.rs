use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use zora_providers::{Provider, ProviderRegistry};
use zora_types::{
    Capability, CapabilitySet, Complexity, CostTier, ResourceType, RoutingMode, TaskClassification,
};

const REASONING_KEYWORDS: &[&str] = &[
    "why", "analyze", "analyse", "explain", "reason", "plan", "strategy", "decide", "evaluate",
    "compare", "tradeoff", "think",
];
const CODING_KEYWORDS: &[&str] = &[
    "code", "function", "bug", "compile", "implement", "refactor", "script", "test", "debug",
    "rust", "python", "typescript", "api", "file", "write",
];
const SEARCH_KEYWORDS: &[&str] = &[
    "search", "find", "look up", "lookup", "latest", "news", "research", "browse", "web",
];
const DATA_KEYWORDS: &[&str] = &[
    "csv", "json", "table", "spreadsheet", "data", "parse", "extract", "summarize", "aggregate",
    "database", "sql",
];
const CREATIVE_KEYWORDS: &[&str] = &[
    "story", "poem", "creative", "imagine", "draft", "blog", "essay", "tagline", "brainstorm",
];

/// Classify a prompt: score it against the five keyword sets with reasoning
/// weighted double, then derive complexity.
pub fn classify(prompt: &str) -> TaskClassification {
    let lower = prompt.to_lowercase();
    let count = |keywords: &[&str]| -> usize {
        keywords.iter().filter(|k| lower.contains(*k)).count()
    };

    let scores = [
        (ResourceType::Reasoning, count(REASONING_KEYWORDS) * 2),
        (ResourceType::Coding, count(CODING_KEYWORDS)),
        (ResourceType::Search, count(SEARCH_KEYWORDS)),
        (ResourceType::Data, count(DATA_KEYWORDS)),
        (ResourceType::Creative, count(CREATIVE_KEYWORDS)),
    ];

    let resource_type = scores
        .iter()
        .max_by_key(|(_, score)| *score)
        .filter(|(_, score)| *score > 0)
        .map(|(rt, _)| *rt)
        .unwrap_or(ResourceType::Reasoning);

    let distinct_signals = scores.iter().filter(|(_, score)| *score > 0).count();
    let complexity = if lower.contains("refactor")
        || lower.contains("security")
        || lower.contains("architect")
        || distinct_signals >= 3
    {
        Complexity::Complex
    } else if prompt.len() < 80 && !lower.contains("research") {
        Complexity::Simple
    } else {
        Complexity::Moderate
    };

    TaskClassification {
        complexity,
        resource_type,
    }
}

/// Capabilities a classified task demands of a provider.
pub fn required_capabilities(classification: &TaskClassification) -> CapabilitySet {
    let mut caps = CapabilitySet::new();
    caps.insert(classification.resource_type.required_capability());
    if classification.complexity == Complexity::Complex {
        caps.insert(Capability::Reasoning);
    }
    caps
}

#[derive(Debug, Clone, Default)]
pub struct SelectionPrefs {
    pub model_preference: Option<String>,
    pub max_cost_tier: Option<CostTier>,
}

/// Capability/cost-aware provider selection honoring the routing mode.
pub struct Router {
    mode: RoutingMode,
    round_robin: AtomicUsize,
}

impl Router {
    pub fn new(mode: RoutingMode) -> Self {
        Self {
            mode,
            round_robin: AtomicUsize::new(0),
        }
    }

    pub async fn select(
        &self,
        registry: &ProviderRegistry,
        classification: &TaskClassification,
        prefs: &SelectionPrefs,
        exclude: &[String],
    ) -> Option<Arc<dyn Provider>> {
        if let RoutingMode::ProviderOnly { provider } = &self.mode {
            let candidate = registry.get(provider)?;
            return self.usable(&candidate, exclude).await.then_some(candidate);
        }

        if let Some(preferred) = &prefs.model_preference {
            if let Some(candidate) = registry.get(preferred) {
                if self.usable(&candidate, exclude).await {
                    return Some(candidate);
                }
            }
        }

        let required = required_capabilities(classification);
        let mut candidates = Vec::new();
        for provider in registry.all() {
            if !provider.spec().has_all(&required) {
                continue;
            }
            if !self.usable(provider, exclude).await {
                continue;
            }
            candidates.push(provider.clone());
        }
        if candidates.is_empty() {
            return None;
        }

        // Soft cost ceiling: a working expensive provider beats a failed
        // task, so an empty filtered set falls back to the unfiltered one.
        if let Some(ceiling) = prefs.max_cost_tier {
            let within: Vec<_> = candidates
                .iter()
                .filter(|p| p.spec().cost_tier <= ceiling)
                .cloned()
                .collect();
            if !within.is_empty() {
                candidates = within;
            }
        }

        match self.mode {
            RoutingMode::RespectRanking | RoutingMode::ProviderOnly { .. } => {
                candidates.sort_by_key(|p| p.spec().rank);
                candidates.first().cloned()
            }
            RoutingMode::OptimizeCost => {
                candidates.sort_by_key(|p| (p.spec().cost_tier, p.spec().rank));
                candidates.first().cloned()
            }
            RoutingMode::RoundRobin => {
                candidates.sort_by_key(|p| p.spec().rank);
                let index = self.round_robin.fetch_add(1, Ordering::Relaxed) % candidates.len();
                candidates.get(index).cloned()
            }
        }
    }

    async fn usable(&self, provider: &Arc<dyn Provider>, exclude: &[String]) -> bool {
        if exclude.iter().any(|name| name == &provider.spec().name) {
            return false;
        }
        if !provider.is_available().await {
            return false;
        }
        !provider.get_quota_status().await.is_exhausted
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use zora_providers::{CircuitBreakerConfig, ScriptedProvider};
    use zora_types::ProviderSpec;

    fn provider(name: &str, rank: u32, tier: CostTier, caps: &[Capability]) -> Arc<ScriptedProvider> {
        Arc::new(ScriptedProvider::new(
            ProviderSpec::new(name, rank, tier).with_capabilities(caps.iter().copied()),
            CircuitBreakerConfig::default(),
        ))
    }

    fn coding_task() -> TaskClassification {
        TaskClassification {
            complexity: Complexity::Simple,
            resource_type: ResourceType::Coding,
        }
    }

    #[test]
    fn classification_picks_the_dominant_resource_type() {
        assert_eq!(classify("fix the bug in this function").resource_type, ResourceType::Coding);
        assert_eq!(
            classify("write a poem about spring, a creative story").resource_type,
            ResourceType::Creative
        );
        assert_eq!(classify("hello there").resource_type, ResourceType::Reasoning);
    }

    #[test]
    fn refactor_and_wide_prompts_classify_complex() {
        assert_eq!(classify("refactor the auth module").complexity, Complexity::Complex);
        let wide = "analyze this csv data and search the web for the code";
        assert_eq!(classify(wide).complexity, Complexity::Complex);
    }

    #[test]
    fn short_prompts_are_simple_unless_research() {
        assert_eq!(classify("what time is it").complexity, Complexity::Simple);
        assert_eq!(classify("research quantum careers").complexity, Complexity::Moderate);
    }

    #[test]
    fn complex_tasks_require_reasoning_too() {
        let classification = TaskClassification {
            complexity: Complexity::Complex,
            resource_type: ResourceType::Coding,
        };
        let caps = required_capabilities(&classification);
        assert!(caps.contains(&Capability::Coding));
        assert!(caps.contains(&Capability::Reasoning));
    }

    #[tokio::test]
    async fn ranking_mode_prefers_the_lowest_rank() {
        let registry = ProviderRegistry::new(vec![
            provider("expensive", 1, CostTier::Premium, &[Capability::Coding]),
            provider("cheap", 2, CostTier::Free, &[Capability::Coding]),
        ]);
        let router = Router::new(RoutingMode::RespectRanking);
        let chosen = router
            .select(&registry, &coding_task(), &SelectionPrefs::default(), &[])
            .await
            .expect("provider");
        assert_eq!(chosen.spec().name, "expensive");
    }

    #[tokio::test]
    async fn cost_mode_prefers_the_cheapest_tier() {
        let registry = ProviderRegistry::new(vec![
            provider("expensive", 1, CostTier::Premium, &[Capability::Coding]),
            provider("cheap", 2, CostTier::Free, &[Capability::Coding]),
        ]);
        let router = Router::new(RoutingMode::OptimizeCost);
        let chosen = router
            .select(&registry, &coding_task(), &SelectionPrefs::default(), &[])
            .await
            .expect("provider");
        assert_eq!(chosen.spec().name, "cheap");
    }

    #[tokio::test]
    async fn cost_ceiling_is_soft() {
        let registry = ProviderRegistry::new(vec![provider(
            "expensive",
            1,
            CostTier::Premium,
            &[Capability::Coding],
        )]);
        let router = Router::new(RoutingMode::RespectRanking);
        let prefs = SelectionPrefs {
            model_preference: None,
            max_cost_tier: Some(CostTier::Free),
        };
        // Filtering to free would empty the set; the premium provider still
        // wins over a failed task.
        let chosen = router
            .select(&registry, &coding_task(), &prefs, &[])
            .await
            .expect("provider");
        assert_eq!(chosen.spec().name, "expensive");
    }

    #[tokio::test]
    async fn excluded_and_circuit_open_providers_are_skipped() {
        let a = provider("a", 1, CostTier::Free, &[Capability::Coding]);
        let b = provider("b", 2, CostTier::Free, &[Capability::Coding]);
        let registry = ProviderRegistry::new(vec![a.clone(), b.clone()]);
        let router = Router::new(RoutingMode::RespectRanking);

        let chosen = router
            .select(
                &registry,
                &coding_task(),
                &SelectionPrefs::default(),
                &["a".to_string()],
            )
            .await
            .expect("provider");
        assert_eq!(chosen.spec().name, "b");

        // Open circuit on b too: nothing left.
        for _ in 0..5 {
            b.state().circuit().record_failure();
        }
        let chosen = router
            .select(
                &registry,
                &coding_task(),
                &SelectionPrefs::default(),
                &["a".to_string()],
            )
            .await;
        assert!(chosen.is_none());
    }

    #[tokio::test]
    async fn model_preference_wins_when_available() {
        let registry = ProviderRegistry::new(vec![
            provider("a", 1, CostTier::Free, &[Capability::Coding]),
            provider("b", 2, CostTier::Free, &[Capability::Coding]),
        ]);
        let router = Router::new(RoutingMode::RespectRanking);
        let prefs = SelectionPrefs {
            model_preference: Some("b".to_string()),
            max_cost_tier: None,
        };
        let chosen = router
            .select(&registry, &coding_task(), &prefs, &[])
            .await
            .expect("provider");
        assert_eq!(chosen.spec().name, "b");
    }

    #[tokio::test]
    async fn round_robin_cycles_the_candidate_list() {
        let registry = ProviderRegistry::new(vec![
            provider("a", 1, CostTier::Free, &[Capability::Coding]),
            provider("b", 2, CostTier::Free, &[Capability::Coding]),
        ]);
        let router = Router::new(RoutingMode::RoundRobin);
        let mut names = Vec::new();
        for _ in 0..4 {
            let chosen = router
                .select(&registry, &coding_task(), &SelectionPrefs::default(), &[])
                .await
                .expect("provider");
            names.push(chosen.spec().name.clone());
        }
        assert_eq!(names, vec!["a", "b", "a", "b"]);
    }
}
