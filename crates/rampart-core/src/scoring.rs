//! Pure target-selection algorithms and scores.
//!
//! The load balancer snapshots its eligible targets into [`Candidate`]s and
//! asks [`select`] for an index. Nothing here holds state; the round-robin
//! cursor is passed in by the caller.

use std::time::Duration;

use crate::config::{AdaptiveWeights, LoadBalancingAlgorithm};
use crate::types::{GeoLocation, ModelLoadStats, TargetId};

/// Snapshot of one eligible target.
#[derive(Debug, Clone, PartialEq)]
pub struct Candidate {
    pub id: TargetId,
    pub weight: u32,
    pub priority: u32,
    pub max_connections: u32,
    pub active_connections: u32,

    /// Mean latency in milliseconds (0 when unmeasured)
    pub average_response_time: f64,

    pub health_score: f64,
    pub cpu_utilization: f64,
    pub memory_utilization: f64,
    pub location: Option<GeoLocation>,
    pub learning_score: f64,
}

/// Inputs shared by every algorithm.
#[derive(Debug, Clone)]
pub struct SelectionContext<'a> {
    /// Monotonic counter for the cyclic algorithms
    pub cursor: u64,
    pub client_location: Option<GeoLocation>,
    pub weights: &'a AdaptiveWeights,
    pub response_time_ceiling: Duration,
}

/// Index of the candidate chosen by `algorithm`, or `None` when empty.
pub fn select(
    algorithm: LoadBalancingAlgorithm,
    candidates: &[Candidate],
    ctx: &SelectionContext<'_>,
) -> Option<usize> {
    if candidates.is_empty() {
        return None;
    }

    let index = match algorithm {
        LoadBalancingAlgorithm::RoundRobin => (ctx.cursor % candidates.len() as u64) as usize,
        LoadBalancingAlgorithm::WeightedRoundRobin => weighted_round_robin(candidates, ctx.cursor),
        LoadBalancingAlgorithm::LeastConnections => {
            min_by_key_f64(candidates, |c| c.active_connections as f64)
        }
        LoadBalancingAlgorithm::WeightedLeastConnections => min_by_key_f64(candidates, |c| {
            c.active_connections as f64 / c.weight.max(1) as f64
        }),
        LoadBalancingAlgorithm::LeastResponseTime => {
            min_by_key_f64(candidates, |c| c.average_response_time)
        }
        LoadBalancingAlgorithm::ResourceBased => min_by_key_f64(candidates, resource_usage),
        LoadBalancingAlgorithm::Geographic => geographic(candidates, ctx.client_location),
        LoadBalancingAlgorithm::PriorityBased => priority_based(candidates),
        LoadBalancingAlgorithm::Adaptive => {
            let max_weight = candidates.iter().map(|c| c.weight).max().unwrap_or(1);
            max_by_key_f64(candidates, |c| {
                adaptive_score(c, max_weight, ctx.weights, ctx.response_time_ceiling)
            })
        }
    };

    Some(index)
}

/// Composite adaptive score in [0, 1].
pub fn adaptive_score(
    candidate: &Candidate,
    max_weight: u32,
    weights: &AdaptiveWeights,
    response_time_ceiling: Duration,
) -> f64 {
    let rt_score = 1.0 - ratio(candidate.average_response_time, ceiling_ms(response_time_ceiling));
    let load_score = 1.0
        - ratio(
            candidate.active_connections as f64,
            candidate.max_connections.max(1) as f64,
        );
    let health_score = candidate.health_score.clamp(0.0, 1.0);
    let weight_score = ratio(candidate.weight as f64, max_weight.max(1) as f64);
    let resource_score = 1.0 - resource_usage(candidate).clamp(0.0, 1.0);
    let learning_score = candidate.learning_score.clamp(0.0, 1.0);

    let total = weights.total();
    if total <= 0.0 {
        return 0.0;
    }

    (weights.response_time * rt_score
        + weights.load * load_score
        + weights.health * health_score
        + weights.weight * weight_score
        + weights.resource * resource_score
        + weights.learning * learning_score)
        / total
}

/// Health score derived from completed traffic: success rate blended with latency.
pub fn derived_health_score(stats: &ModelLoadStats, response_time_ceiling: Duration) -> f64 {
    let latency_score = 1.0 - ratio(stats.average_response_time, ceiling_ms(response_time_ceiling));
    (0.7 * stats.success_rate() + 0.3 * latency_score).clamp(0.0, 1.0)
}

/// Observation fed into the learning score for one performance report.
pub fn performance_observation(
    success_rate: f64,
    average_response_time: Duration,
    response_time_ceiling: Duration,
) -> f64 {
    let rt = average_response_time.as_secs_f64() * 1000.0;
    let latency_score = 1.0 - ratio(rt, ceiling_ms(response_time_ceiling));
    (0.5 * success_rate.clamp(0.0, 1.0) + 0.5 * latency_score).clamp(0.0, 1.0)
}

/// Exponential moving average step.
pub fn ema(previous: f64, observation: f64, alpha: f64) -> f64 {
    alpha * observation + (1.0 - alpha) * previous
}

fn ceiling_ms(ceiling: Duration) -> f64 {
    (ceiling.as_secs_f64() * 1000.0).max(1.0)
}

fn ratio(value: f64, ceiling: f64) -> f64 {
    (value / ceiling).clamp(0.0, 1.0)
}

fn resource_usage(c: &Candidate) -> f64 {
    (c.cpu_utilization + c.memory_utilization) / 2.0
}

fn weighted_round_robin(candidates: &[Candidate], cursor: u64) -> usize {
    let total: u64 = candidates.iter().map(|c| c.weight.max(1) as u64).sum();
    let mut slot = cursor % total;
    for (i, c) in candidates.iter().enumerate() {
        let w = c.weight.max(1) as u64;
        if slot < w {
            return i;
        }
        slot -= w;
    }
    0
}

fn geographic(candidates: &[Candidate], client: Option<GeoLocation>) -> usize {
    let located = candidates.iter().any(|c| c.location.is_some());
    match client {
        Some(origin) if located => min_by_key_f64(candidates, |c| {
            c.location
                .map(|loc| origin.distance_km(&loc))
                .unwrap_or(f64::INFINITY)
        }),
        _ => min_by_key_f64(candidates, |c| c.average_response_time),
    }
}

fn priority_based(candidates: &[Candidate]) -> usize {
    let mut best = 0;
    for (i, c) in candidates.iter().enumerate().skip(1) {
        let current = &candidates[best];
        if c.priority > current.priority
            || (c.priority == current.priority
                && c.active_connections < current.active_connections)
        {
            best = i;
        }
    }
    best
}

/// First index with the smallest key; ties keep registration order.
fn min_by_key_f64<F: Fn(&Candidate) -> f64>(candidates: &[Candidate], key: F) -> usize {
    let mut best = 0;
    let mut best_key = key(&candidates[0]);
    for (i, c) in candidates.iter().enumerate().skip(1) {
        let k = key(c);
        if k < best_key {
            best = i;
            best_key = k;
        }
    }
    best
}

fn max_by_key_f64<F: Fn(&Candidate) -> f64>(candidates: &[Candidate], key: F) -> usize {
    min_by_key_f64(candidates, |c| -key(c))
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn candidate(id: &str) -> Candidate {
        Candidate {
            id: TargetId::new(id),
            weight: 1,
            priority: 0,
            max_connections: 100,
            active_connections: 0,
            average_response_time: 0.0,
            health_score: 1.0,
            cpu_utilization: 0.0,
            memory_utilization: 0.0,
            location: None,
            learning_score: 0.5,
        }
    }

    fn ctx(weights: &AdaptiveWeights, cursor: u64) -> SelectionContext<'_> {
        SelectionContext {
            cursor,
            client_location: None,
            weights,
            response_time_ceiling: Duration::from_secs(10),
        }
    }

    #[test]
    fn test_round_robin_visits_each_once() {
        let weights = AdaptiveWeights::default();
        let cands = vec![candidate("a"), candidate("b"), candidate("c")];
        let picks: Vec<_> = (0..3)
            .filter_map(|n| select(LoadBalancingAlgorithm::RoundRobin, &cands, &ctx(&weights, n)))
            .collect();
        assert_eq!(picks, vec![0, 1, 2]);
    }

    #[test]
    fn test_weighted_round_robin_expands_weights() {
        let weights = AdaptiveWeights::default();
        let mut heavy = candidate("heavy");
        heavy.weight = 3;
        let cands = vec![heavy, candidate("light")];
        let picks: Vec<_> = (0..4)
            .filter_map(|n| {
                select(
                    LoadBalancingAlgorithm::WeightedRoundRobin,
                    &cands,
                    &ctx(&weights, n),
                )
            })
            .collect();
        assert_eq!(picks, vec![0, 0, 0, 1]);
    }

    #[test]
    fn test_least_connections_and_weighted_variant() {
        let weights = AdaptiveWeights::default();
        let mut a = candidate("a");
        a.active_connections = 4;
        a.weight = 4;
        let mut b = candidate("b");
        b.active_connections = 2;
        let cands = vec![a, b];
        assert_eq!(
            select(LoadBalancingAlgorithm::LeastConnections, &cands, &ctx(&weights, 0)),
            Some(1)
        );
        assert_eq!(
            select(
                LoadBalancingAlgorithm::WeightedLeastConnections,
                &cands,
                &ctx(&weights, 0)
            ),
            Some(0)
        );
    }

    #[test]
    fn test_resource_based_prefers_idle() {
        let weights = AdaptiveWeights::default();
        let mut busy = candidate("busy");
        busy.cpu_utilization = 0.9;
        busy.memory_utilization = 0.8;
        let mut idle = candidate("idle");
        idle.cpu_utilization = 0.2;
        let cands = vec![busy, idle];
        assert_eq!(
            select(LoadBalancingAlgorithm::ResourceBased, &cands, &ctx(&weights, 0)),
            Some(1)
        );
    }

    #[test]
    fn test_geographic_prefers_nearest_and_falls_back() {
        let weights = AdaptiveWeights::default();
        let mut us = candidate("us-west");
        us.location = Some(GeoLocation::new(37.77, -122.41));
        us.average_response_time = 50.0;
        let mut eu = candidate("eu-west");
        eu.location = Some(GeoLocation::new(53.35, -6.26));
        eu.average_response_time = 200.0;
        let cands = vec![eu, us];

        let mut context = ctx(&weights, 0);
        context.client_location = Some(GeoLocation::new(51.5, -0.12));
        assert_eq!(
            select(LoadBalancingAlgorithm::Geographic, &cands, &context),
            Some(0)
        );

        context.client_location = None;
        assert_eq!(
            select(LoadBalancingAlgorithm::Geographic, &cands, &context),
            Some(1)
        );
    }

    #[test]
    fn test_priority_based_picks_highest() {
        let weights = AdaptiveWeights::default();
        let mut low = candidate("low");
        low.priority = 1;
        let mut high = candidate("high");
        high.priority = 9;
        let cands = vec![low, high];
        assert_eq!(
            select(LoadBalancingAlgorithm::PriorityBased, &cands, &ctx(&weights, 0)),
            Some(1)
        );
    }

    #[test]
    fn test_adaptive_prefers_fast_healthy_target() {
        let weights = AdaptiveWeights::default();
        let mut slow = candidate("slow");
        slow.average_response_time = 8_000.0;
        slow.health_score = 0.4;
        let fast = candidate("fast");
        let cands = vec![slow, fast];
        assert_eq!(
            select(LoadBalancingAlgorithm::Adaptive, &cands, &ctx(&weights, 0)),
            Some(1)
        );
    }

    #[test]
    fn test_empty_candidates() {
        let weights = AdaptiveWeights::default();
        assert_eq!(
            select(LoadBalancingAlgorithm::RoundRobin, &[], &ctx(&weights, 0)),
            None
        );
    }

    #[test]
    fn test_derived_health_score() {
        let mut stats = ModelLoadStats::default();
        assert!((derived_health_score(&stats, Duration::from_secs(10)) - 1.0).abs() < 1e-9);
        stats.successful_requests = 1;
        stats.failed_requests = 9;
        stats.average_response_time = 10_000.0;
        assert!((derived_health_score(&stats, Duration::from_secs(10)) - 0.07).abs() < 1e-9);
    }

    #[test]
    fn test_ema_step() {
        assert!((ema(0.5, 1.0, 0.1) - 0.55).abs() < 1e-12);
    }

    proptest! {
        #[test]
        fn adaptive_score_is_normalised(
            rt in 0.0f64..100_000.0,
            active in 0u32..500,
            max_conn in 0u32..500,
            health in -1.0f64..2.0,
            weight in 0u32..20,
            cpu in 0.0f64..1.5,
            mem in 0.0f64..1.5,
            learning in -1.0f64..2.0,
        ) {
            let mut c = candidate("x");
            c.average_response_time = rt;
            c.active_connections = active;
            c.max_connections = max_conn;
            c.health_score = health;
            c.weight = weight;
            c.cpu_utilization = cpu;
            c.memory_utilization = mem;
            c.learning_score = learning;
            let score = adaptive_score(&c, 20, &AdaptiveWeights::default(), Duration::from_secs(10));
            prop_assert!((0.0..=1.0 + 1e-9).contains(&score));
        }

        #[test]
        fn round_robin_is_fair(n in 1usize..10, rounds in 1u64..5) {
            let weights = AdaptiveWeights::default();
            let cands: Vec<_> = (0..n).map(|i| candidate(&format!("t{i}"))).collect();
            let mut counts = vec![0u64; n];
            for cursor in 0..(n as u64 * rounds) {
                let i = select(LoadBalancingAlgorithm::RoundRobin, &cands, &ctx(&weights, cursor)).unwrap();
                counts[i] += 1;
            }
            prop_assert!(counts.iter().all(|&c| c == rounds));
        }
    }
}
