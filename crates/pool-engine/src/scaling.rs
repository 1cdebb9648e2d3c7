//! Closed-loop scaling controller: samples pool metrics on a fixed cadence
//! and issues grow/shrink commands, with a cooldown between actions and a
//! bounded decision log. One bad tick never stops the loop.

use std::sync::Arc;

use hony_pool_core::ScalingConfig;

use crate::api::{PoolEvent, ScalingAction};
use crate::pool::PoolInner;

/// Metric snapshot a decision is made from.
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) struct ScalingMetrics {
    pub(crate) queue_depth: usize,
    pub(crate) p95_latency_sec: f64,
    pub(crate) avg_cpu_percent: f64,
    pub(crate) idle_fraction: f64,
}

/// Pure decision function.
///
/// Scale up when any pressure signal fires; scale down only when every
/// relaxation signal agrees.
pub(crate) fn evaluate(
    cfg: &ScalingConfig,
    metrics: &ScalingMetrics,
) -> Option<(ScalingAction, String)> {
    if metrics.queue_depth > cfg.queue_up_threshold {
        return Some((
            ScalingAction::Up,
            format!(
                "queue depth {} > {}",
                metrics.queue_depth, cfg.queue_up_threshold
            ),
        ));
    }
    if metrics.p95_latency_sec > cfg.latency_up_threshold_sec {
        return Some((
            ScalingAction::Up,
            format!(
                "p95 latency {:.2}s > {:.2}s",
                metrics.p95_latency_sec, cfg.latency_up_threshold_sec
            ),
        ));
    }
    if metrics.avg_cpu_percent > cfg.cpu_up_threshold {
        return Some((
            ScalingAction::Up,
            format!(
                "avg cpu {:.1}% > {:.1}%",
                metrics.avg_cpu_percent, cfg.cpu_up_threshold
            ),
        ));
    }

    if metrics.queue_depth == 0
        && metrics.avg_cpu_percent < cfg.cpu_down_threshold
        && metrics.idle_fraction > cfg.idle_down_threshold
    {
        return Some((
            ScalingAction::Down,
            format!(
                "queue empty, avg cpu {:.1}% < {:.1}%, idle {:.0}% > {:.0}%",
                metrics.avg_cpu_percent,
                cfg.cpu_down_threshold,
                metrics.idle_fraction * 100.0,
                cfg.idle_down_threshold * 100.0
            ),
        ));
    }

    None
}

pub(crate) async fn run_scaling_loop(shared: Arc<PoolInner>) {
    let cfg = shared.cfg.scaling.clone();
    let mut tick = tokio::time::interval(cfg.sample_interval());
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tick.tick().await;
        if shared.is_shutting_down() {
            break;
        }

        let metrics = shared.scaling_metrics();
        let Some((action, reason)) = evaluate(&cfg, &metrics) else {
            continue;
        };
        if !shared.scaling_cooldown_elapsed(cfg.cooldown()) {
            continue;
        }

        // grow/shrink clamp to the configured bounds; a zero-width action
        // means the pool is already at a bound and nothing happened.
        let applied = match action {
            ScalingAction::Up => shared.grow(cfg.step),
            ScalingAction::Down => shared.shrink(cfg.step),
        };
        if applied == 0 {
            continue;
        }

        let decision = shared.record_scaling_decision(action, reason, &metrics);
        tracing::info!(
            action = ?decision.action,
            reason = %decision.reason,
            instances = decision.instances,
            "scaling decision"
        );
        shared.emit(PoolEvent::ScalingDecision { decision });
        shared.push_snapshot();
    }
}
