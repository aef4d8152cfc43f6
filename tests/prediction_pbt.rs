//! Property-based tests for the prediction post-processing rules.
//!
//! - Flow adjustment never moves difficulty against the success rate
//! - Discretized difficulty always lands on the 1..=5 scale
//! - At-risk ranking is sorted and respects the threshold
//! - Timeline projection needs exactly the exercises that close the gap

use chrono::NaiveDate;
use proptest::prelude::*;

use adaptive_engine::config::{FlowParams, TimelineParams};
use adaptive_engine::services::difficulty::{apply_flow_adjustment, discretize_difficulty};
use adaptive_engine::services::success::{project_timeline, rank_at_risk};
use adaptive_engine::services::{FlowZone, MasteryTimeline};

// ============================================================================
// Arbitrary Generators
// ============================================================================

fn arb_f64_0_1() -> impl Strategy<Value = f64> {
    (0u64..=1000u64).prop_map(|v| v as f64 / 1000.0)
}

fn arb_scores() -> impl Strategy<Value = Vec<(String, f64)>> {
    prop::collection::vec(arb_f64_0_1(), 0..40).prop_map(|ps| {
        ps.into_iter()
            .enumerate()
            .map(|(i, p)| (format!("learner-{i:02}"), p))
            .collect()
    })
}

proptest! {
    #[test]
    fn prop_flow_adjustment_follows_zone(raw in 0.0f64..6.0, rate in arb_f64_0_1()) {
        let flow = FlowParams::default();
        let adjusted = apply_flow_adjustment(raw, rate, &flow);
        match FlowZone::classify(rate, &flow) {
            FlowZone::TooEasy => prop_assert!(adjusted > raw),
            FlowZone::TooHard => prop_assert!(adjusted < raw),
            FlowZone::InZone => prop_assert_eq!(adjusted, raw),
        }
    }

    #[test]
    fn prop_flow_adjustment_monotone_in_success(raw in 0.0f64..6.0, a in arb_f64_0_1(), b in arb_f64_0_1()) {
        let flow = FlowParams::default();
        let (lo, hi) = if a <= b { (a, b) } else { (b, a) };
        prop_assert!(apply_flow_adjustment(raw, lo, &flow) <= apply_flow_adjustment(raw, hi, &flow));
    }

    #[test]
    fn prop_discretize_stays_on_scale(value in -100.0f64..100.0) {
        let level = discretize_difficulty(value);
        prop_assert!((1..=5).contains(&level));
        if (1.0..=5.0).contains(&value) {
            prop_assert!((f64::from(level) - value).abs() <= 0.5);
        }
    }

    #[test]
    fn prop_at_risk_sorted_and_thresholded(scores in arb_scores(), threshold in arb_f64_0_1()) {
        let ranked = rank_at_risk(scores.clone(), "addition", threshold);

        prop_assert!(ranked.iter().all(|l| l.risk_score >= threshold));
        prop_assert!(ranked.windows(2).all(|w| w[0].risk_score >= w[1].risk_score));
        for learner in &ranked {
            prop_assert!((learner.risk_score + learner.success_probability - 1.0).abs() < 1e-12);
        }

        let expected = scores.iter().filter(|(_, p)| 1.0 - p >= threshold).count();
        prop_assert_eq!(ranked.len(), expected);
    }

    #[test]
    fn prop_timeline_consistent(
        current in arb_f64_0_1(),
        target in arb_f64_0_1(),
        velocity in 0.0f64..0.5,
    ) {
        let params = TimelineParams::default();
        let today = NaiveDate::from_ymd_opt(2024, 6, 1).unwrap();
        match project_timeline(current, target, velocity, today, &params) {
            MasteryTimeline::Mastered { .. } => prop_assert!(current >= target),
            MasteryTimeline::Predicted {
                exercises_needed,
                estimated_days,
                estimated_date,
                learning_velocity,
                ..
            } => {
                prop_assert!(current < target);
                prop_assert!(exercises_needed >= 1);
                prop_assert!(learning_velocity >= params.min_velocity);
                // fewest whole exercises that close the gap
                let gap = target - current;
                prop_assert!(exercises_needed as f64 * learning_velocity >= gap - 1e-6);
                prop_assert!((exercises_needed - 1) as f64 * learning_velocity < gap + 1e-6);
                prop_assert_eq!(estimated_days, exercises_needed / u64::from(params.exercises_per_day));
                prop_assert_eq!((estimated_date - today).num_days() as u64, estimated_days);
            }
            MasteryTimeline::NoData => prop_assert!(false, "projection never reports missing data"),
        }
    }
}
