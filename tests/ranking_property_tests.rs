//! Property tests for offer ranking and cost arithmetic

use aimad::cost::{expected_cost_cents, rank_offers, RankContext};
use aimad::types::{accrued_cents, JobKind, Offer, ProviderTag, ResourceProfile};
use chrono::{Duration, TimeZone, Utc};
use proptest::prelude::*;

fn arb_provider() -> impl Strategy<Value = ProviderTag> {
    prop_oneof![
        Just(ProviderTag::Aws),
        Just(ProviderTag::Azure),
        Just(ProviderTag::Gcp),
        Just(ProviderTag::Local),
        Just(ProviderTag::Runpod),
        Just(ProviderTag::Vast),
    ]
}

fn arb_offer() -> impl Strategy<Value = Offer> {
    (
        arb_provider(),
        1u32..=8,
        8_192u64..=262_144,
        0i64..=5_000,
        0u32..=10,
    )
        .prop_map(|(provider, gpu_count, memory_mb, rate, availability)| Offer {
            provider,
            region: "r".to_string(),
            gpu_model: "A100".to_string(),
            gpu_count,
            memory_mb,
            vcpus: 8,
            disk_gb: 100,
            hourly_rate_cents: rate,
            availability,
        })
}

fn profile() -> ResourceProfile {
    ResourceProfile {
        gpu_model: "A100".to_string(),
        gpu_count: 1,
        memory_mb: 8_192,
        disk_gb: None,
    }
}

proptest! {
    /// The ranking is a pure function of the offer set, not of its order.
    #[test]
    fn ranking_is_permutation_invariant(
        offers in prop::collection::vec(arb_offer(), 0..12),
        seed in 0u64..1_000,
    ) {
        let mut shuffled = offers.clone();
        let mut rng_state = seed;
        // deterministic Fisher-Yates from the seed
        for i in (1..shuffled.len()).rev() {
            rng_state = rng_state.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
            let j = (rng_state >> 33) as usize % (i + 1);
            shuffled.swap(i, j);
        }

        let ctx = RankContext::default();
        let a = rank_offers(&profile(), JobKind::Inference, offers, &ctx, 30);
        let b = rank_offers(&profile(), JobKind::Inference, shuffled, &ctx, 30);
        prop_assert_eq!(a, b);
    }

    /// Every ranked offer satisfies the profile, and prices never decrease
    /// along the ranking.
    #[test]
    fn ranking_is_sorted_and_suitable(offers in prop::collection::vec(arb_offer(), 0..12)) {
        let ranked = rank_offers(&profile(), JobKind::Inference, offers, &RankContext::default(), 30);
        for pair in ranked.windows(2) {
            prop_assert!(
                expected_cost_cents(pair[0].hourly_rate_cents, 30)
                    <= expected_cost_cents(pair[1].hourly_rate_cents, 30)
            );
        }
        for offer in &ranked {
            prop_assert!(offer.satisfies(&profile()));
        }
    }

    /// Accrual is non-negative and monotone in the period end.
    #[test]
    fn accrual_is_monotone(
        rate in 0i64..=100_000,
        secs_a in 0i64..=86_400,
        secs_b in 0i64..=86_400,
    ) {
        let start = Utc.timestamp_opt(1_700_000_000, 0).single().unwrap();
        let (short, long) = if secs_a <= secs_b { (secs_a, secs_b) } else { (secs_b, secs_a) };
        let cost_short = accrued_cents(rate, start, start + Duration::seconds(short));
        let cost_long = accrued_cents(rate, start, start + Duration::seconds(long));
        prop_assert!(cost_short >= 0);
        prop_assert!(cost_short <= cost_long);
    }

    /// Estimates never undercount: the rounded-up estimate times sixty is at
    /// least the raw rate-minutes product.
    #[test]
    fn estimates_round_up(rate in 0i64..=100_000, mins in 0u64..=10_000) {
        let estimate = expected_cost_cents(rate, mins);
        prop_assert!(estimate * 60 >= rate * mins as i64);
        prop_assert!((estimate - 1) * 60 < rate * mins as i64 + 60);
    }
}
