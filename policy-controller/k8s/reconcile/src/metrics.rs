use prometheus_client::{
    encoding::EncodeLabelSet,
    metrics::{counter::Counter, family::Family},
    registry::Registry,
};

#[derive(Clone, Debug)]
pub struct Metrics {
    pub(crate) decisions: Family<DecisionLabels, Counter>,
    pub(crate) fqdn_policy_attempts: Counter,
    pub(crate) confirmation_timeouts: Counter,
    pub(crate) stats_dropped: Counter,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub(crate) struct DecisionLabels {
    operation: &'static str,
    allowed: &'static str,
}

// === impl Metrics ===

impl Metrics {
    pub fn register(prom: &mut Registry) -> Self {
        let decisions = Family::default();
        prom.register(
            "admission_decisions",
            "Count of admission decisions by operation and outcome",
            decisions.clone(),
        );

        let fqdn_policy_attempts = Counter::default();
        prom.register(
            "fqdn_policy_attempts",
            "Count of attempts to apply an FQDNNetworkPolicy",
            fqdn_policy_attempts.clone(),
        );

        let confirmation_timeouts = Counter::default();
        prom.register(
            "confirmation_timeouts",
            "Count of FQDNNetworkPolicies whose NetworkPolicy was not observed in time",
            confirmation_timeouts.clone(),
        );

        let stats_dropped = Counter::default();
        prom.register(
            "stats_dropped",
            "Count of allowlist statistics records dropped because the queue was full",
            stats_dropped.clone(),
        );

        Self {
            decisions,
            fqdn_policy_attempts,
            confirmation_timeouts,
            stats_dropped,
        }
    }

    /// Counts statistics records dropped by [`crate::stats::Sender`].
    pub fn stats_dropped(&self) -> Counter {
        self.stats_dropped.clone()
    }

    pub(crate) fn decision(&self, operation: &'static str, allowed: bool) {
        let allowed = if allowed { "true" } else { "false" };
        self.decisions
            .get_or_create(&DecisionLabels { operation, allowed })
            .inc();
    }

    #[cfg(test)]
    pub(crate) fn decision_count(&self, operation: &'static str, allowed: bool) -> u64 {
        let allowed = if allowed { "true" } else { "false" };
        self.decisions
            .get_or_create(&DecisionLabels { operation, allowed })
            .get()
    }
}
