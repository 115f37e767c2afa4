//! Property-Based Tests for Delta Accumulation
//!
//! **Property: Order Independence**
//!
//! For any base value and any sequence of unbounded deltas applied to a
//! cold field, the cached value SHALL equal `round(base * 1000)` plus the
//! sum of the scaled deltas, whatever the order of application.
//!
//! **Property: Flush Preserves Totals**
//!
//! Flushing between deltas SHALL never change the final persisted total.

use proptest::prelude::*;
use tally_core::scale;
use tally_storage::FieldValue;

#[path = "support/harness.rs"]
mod harness;
use harness::account_harness;

// ============================================================================
// PROPERTY TEST STRATEGIES
// ============================================================================

/// Amounts with up to two decimals, as callers usually pass money.
fn amount_strategy() -> impl Strategy<Value = f64> {
    (-100_000i64..100_000).prop_map(|cents| cents as f64 / 100.0)
}

fn base_strategy() -> impl Strategy<Value = f64> {
    (-1_000_000i64..1_000_000).prop_map(|millis| millis as f64 / 1000.0)
}

fn expected_scaled(base: f64, amounts: &[f64]) -> i64 {
    scale(base)
        + amounts
            .iter()
            .map(|a| if *a >= 0.0 { scale(*a) } else { -scale(-a) })
            .sum::<i64>()
}

async fn apply_all(base: f64, amounts: &[f64]) -> i64 {
    let h = account_harness(FieldValue::Decimal(base));
    let mut account = h.account(false).await;
    for amount in amounts {
        if *amount >= 0.0 {
            account.increment("balance", *amount, None).await.unwrap();
        } else {
            account.decrement("balance", -amount, None).await.unwrap();
        }
    }
    account.get_scaled("balance").await.unwrap()
}

// ============================================================================
// PROPERTIES
// ============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn prop_deltas_commute(
        base in base_strategy(),
        amounts in prop::collection::vec(amount_strategy(), 1..20),
    ) {
        let rt = tokio::runtime::Runtime::new().unwrap();
        let (forward, backward) = rt.block_on(async {
            let forward = apply_all(base, &amounts).await;
            let mut reversed = amounts.clone();
            reversed.reverse();
            let backward = apply_all(base, &reversed).await;
            (forward, backward)
        });

        let expected = expected_scaled(base, &amounts);
        prop_assert_eq!(forward, expected);
        prop_assert_eq!(backward, expected);
    }

    #[test]
    fn prop_interleaved_flushes_preserve_total(
        amounts in prop::collection::vec(0i64..10_000, 1..12),
        flush_every in 1usize..4,
    ) {
        let rt = tokio::runtime::Runtime::new().unwrap();
        let stored = rt.block_on(async {
            let h = account_harness(0i64);
            let mut account = h.account(false).await;
            for (i, cents) in amounts.iter().enumerate() {
                account
                    .increment("balance", *cents as f64 / 100.0, None)
                    .await
                    .unwrap();
                if i % flush_every == 0 {
                    account.flush_cache().await.unwrap();
                }
            }
            account.flush_cache().await.unwrap();
            h.store
                .value(&harness::tag(), &harness::id(), "balance")
                .and_then(|v| v.as_f64())
                .map(scale)
        });

        let expected: i64 = amounts.iter().map(|c| c * 10).sum();
        prop_assert_eq!(stored, Some(expected));
    }
}
