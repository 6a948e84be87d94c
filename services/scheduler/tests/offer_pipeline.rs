use std::collections::{HashMap, HashSet};
use std::time::Duration;

use lattice_id::OfferId;
use lattice_protocol::Offer;
use lattice_scheduler::testing::{offer, task_for, test_config, ScriptedMatcher, TestHarness};
use lattice_scheduler::{
    AbortReason, OfferCache, OfferCacheConfig, OfferHolder, SchedulerAction, SchedulerConfig,
    SchedulerError, SchedulerState,
};
use proptest::prelude::*;
use rstest::rstest;

fn ids(values: &[&str]) -> Vec<OfferId> {
    values.iter().map(|v| OfferId::new(*v).unwrap()).collect()
}

fn offer_ids(offers: &[Offer]) -> Vec<OfferId> {
    offers.iter().map(|o| o.id.clone()).collect()
}

#[rstest]
#[case::not_started(false)]
#[case::stopped(true)]
#[tokio::test]
async fn offers_declined_without_locking_when_not_running(#[case] stop_first: bool) {
    let harness = TestHarness::new();
    if stop_first {
        harness.coordinator.notify_stopping().await;
    }

    let batch = vec![offer("o1", "h1", 1.0, 512.0), offer("o2", "h2", 1.0, 512.0)];
    let summary = harness.coordinator.resource_offers(batch).await.unwrap();

    assert_eq!(summary.declined, ids(&["o1", "o2"]));
    assert_eq!(harness.client.declined_ids(), ids(&["o1", "o2"]));
    assert_eq!(harness.coordinator.locks().offers_acquisitions(), 0);
    assert!(harness.matcher.invocations().is_empty());
    assert!(harness.coordinator.last_offer_timestamp().is_none());
}

#[tokio::test]
async fn holder_without_tasks_has_all_offers_cached() {
    let harness = TestHarness::new();
    harness.subscribe().await;

    let summary = harness
        .coordinator
        .resource_offers(vec![offer("o1", "h1", 1.0, 512.0), offer("o2", "h1", 1.0, 512.0)])
        .await
        .unwrap();

    assert_eq!(summary.cached, ids(&["o1", "o2"]));
    assert!(harness.client.declined_ids().is_empty());
    assert_eq!(harness.offer_cache.held_ids(), ids(&["o1", "o2"]));
    assert_eq!(harness.coordinator.locks().offers_acquisitions(), 1);
}

#[tokio::test]
async fn three_offer_batch_with_inactive_host() {
    let harness = TestHarness::with_matcher(ScriptedMatcher::from_fn(|offers| {
        let task = task_for(&offers[0], "web", 1.0, 256.0);
        Ok(vec![OfferHolder::with_tasks(offers, vec![task])])
    }));
    harness.host_health.decommission_host("h1").await;
    harness.subscribe().await;

    let summary = harness
        .coordinator
        .resource_offers(vec![
            offer("o1", "h1", 4.0, 4096.0),
            offer("o2", "h2", 2.0, 1024.0),
            offer("o3", "h2", 2.0, 1024.0),
        ])
        .await
        .unwrap();

    assert_eq!(harness.client.declined_ids(), ids(&["o1"]));
    assert_eq!(harness.matcher.invocations(), vec![ids(&["o2", "o3"])]);

    let accepts = harness.client.accepts();
    assert_eq!(accepts.len(), 1);
    assert_eq!(accepts[0].0, ids(&["o2"]));
    assert_eq!(accepts[0].1.len(), 1);

    assert_eq!(harness.offer_cache.held_ids(), ids(&["o3"]));
    assert_eq!(summary.declined, ids(&["o1"]));
    assert_eq!(summary.cached, ids(&["o3"]));
    assert_eq!(summary.accepted, ids(&["o2"]));
    assert!(harness.abort.signals().is_empty());
}

#[tokio::test]
async fn unused_offers_cached_with_batch_timestamp() {
    let harness = TestHarness::new();
    harness.subscribe().await;

    harness
        .coordinator
        .resource_offers(vec![offer("o1", "h1", 1.0, 512.0)])
        .await
        .unwrap();

    let timestamp = harness.coordinator.last_offer_timestamp().unwrap();
    assert_eq!(harness.offer_cache.cached(), vec![(timestamp, ids(&["o1"])[0].clone())]);
}

#[tokio::test]
async fn offers_missing_from_every_holder_are_cached() {
    let harness = TestHarness::with_matcher(ScriptedMatcher::from_fn(|mut offers| {
        offers.truncate(1);
        Ok(vec![OfferHolder::new(offers)])
    }));
    harness.subscribe().await;

    let summary = harness
        .coordinator
        .resource_offers(vec![offer("o1", "h1", 1.0, 512.0), offer("o2", "h2", 1.0, 512.0)])
        .await
        .unwrap();

    assert_eq!(summary.cached, ids(&["o1", "o2"]));
    assert!(harness.client.declined_ids().is_empty());
}

#[tokio::test]
async fn matcher_failure_declines_survivors_and_aborts_once() {
    let harness = TestHarness::with_matcher(ScriptedMatcher::failing("placement exploded"));
    harness.host_health.decommission_host("h3").await;
    harness.subscribe().await;

    let result = harness
        .coordinator
        .resource_offers(vec![
            offer("o1", "h1", 1.0, 512.0),
            offer("o2", "h2", 1.0, 512.0),
            offer("o3", "h3", 1.0, 512.0),
        ])
        .await;

    assert!(matches!(result, Err(SchedulerError::Matcher(_))));
    let declined: HashSet<OfferId> = harness.client.declined_ids().into_iter().collect();
    assert_eq!(declined, ids(&["o1", "o2", "o3"]).into_iter().collect());
    assert_eq!(harness.client.declined_ids().len(), 3);

    let signals = harness.abort.signals();
    assert_eq!(signals.len(), 1);
    assert_eq!(signals[0].reason, AbortReason::UnrecoverableError);
    assert_eq!(harness.coordinator.state(), SchedulerState::Stopped);
    assert_eq!(harness.client.close_count(), 1);
    assert_eq!(harness.notifier.messages().len(), 1);
}

#[tokio::test]
async fn launch_failure_withdraws_cached_offers_before_declining() {
    let harness = TestHarness::with_matcher(ScriptedMatcher::from_fn(|offers| {
        let (first, rest) = offers.split_at(1);
        let task = task_for(&rest[0], "web", 1.0, 256.0);
        Ok(vec![
            OfferHolder::new(first.to_vec()),
            OfferHolder::with_tasks(rest.to_vec(), vec![task]),
        ])
    }));
    harness.client.set_fail_accept(true);
    harness.subscribe().await;

    let result = harness
        .coordinator
        .resource_offers(vec![offer("o1", "h1", 1.0, 512.0), offer("o2", "h2", 2.0, 1024.0)])
        .await;

    assert!(matches!(result, Err(SchedulerError::Launch(_))));
    assert_eq!(harness.offer_cache.rescinded(), ids(&["o1"]));
    assert!(harness.offer_cache.held_ids().is_empty());
    assert_eq!(harness.client.declined_ids(), ids(&["o1", "o2"]));
    assert_eq!(harness.abort.signals().len(), 1);
}

fn cache_config(max_offers: usize) -> OfferCacheConfig {
    OfferCacheConfig {
        max_offers,
        ..OfferCacheConfig::default()
    }
}

/// Places one task on `o1`, but only once `o2` is in the round too.
fn place_on_o1_with_o2() -> ScriptedMatcher {
    ScriptedMatcher::from_fn(|offers| {
        let ready = offers.iter().any(|o| o.id.as_str() == "o2");
        let mut holders = Vec::new();
        for offer in offers {
            if ready && offer.id.as_str() == "o1" {
                let task = task_for(&offer, "web", 1.0, 256.0);
                holders.push(OfferHolder::with_tasks(vec![offer], vec![task]));
            } else {
                holders.push(OfferHolder::new(vec![offer]));
            }
        }
        Ok(holders)
    })
}

#[tokio::test]
async fn offer_declined_by_disabled_cache_is_not_declined_again_on_failure() {
    let config = SchedulerConfig {
        cache_offers: false,
        ..test_config()
    };
    let matcher = ScriptedMatcher::from_fn(|offers| {
        let (first, rest) = offers.split_at(1);
        let task = task_for(&rest[0], "web", 1.0, 256.0);
        Ok(vec![
            OfferHolder::new(first.to_vec()),
            OfferHolder::with_tasks(rest.to_vec(), vec![task]),
        ])
    });
    let (harness, cache) = TestHarness::with_in_memory_cache(config, cache_config(10), matcher);
    harness.client.set_fail_accept(true);
    harness.subscribe().await;

    let result = harness
        .coordinator
        .resource_offers(vec![offer("o1", "h1", 1.0, 512.0), offer("o2", "h2", 2.0, 1024.0)])
        .await;

    assert!(matches!(result, Err(SchedulerError::Launch(_))));
    assert_eq!(harness.client.declined_ids(), ids(&["o1", "o2"]));
    assert!(cache.is_empty().await);
    assert_eq!(harness.abort.signals().len(), 1);
}

#[tokio::test]
async fn offers_the_cache_refuses_are_reported_declined() {
    let config = SchedulerConfig {
        cache_offers: false,
        ..test_config()
    };
    let (harness, cache) =
        TestHarness::with_in_memory_cache(config, cache_config(10), ScriptedMatcher::unused());
    harness.subscribe().await;

    let summary = harness
        .coordinator
        .resource_offers(vec![offer("o1", "h1", 1.0, 512.0)])
        .await
        .unwrap();

    assert_eq!(summary.declined, ids(&["o1"]));
    assert!(summary.cached.is_empty());
    assert_eq!(harness.client.declined_ids(), ids(&["o1"]));
    assert!(!cache.is_enabled().await);
}

#[tokio::test]
async fn evicted_batch_offer_is_reported_declined() {
    let (harness, cache) =
        TestHarness::with_in_memory_cache(test_config(), cache_config(1), ScriptedMatcher::unused());
    harness.subscribe().await;

    let summary = harness
        .coordinator
        .resource_offers(vec![offer("o1", "h1", 1.0, 512.0), offer("o2", "h2", 1.0, 512.0)])
        .await
        .unwrap();

    assert_eq!(summary.cached, ids(&["o2"]));
    assert_eq!(summary.declined, ids(&["o1"]));
    assert_eq!(harness.client.declined_ids(), ids(&["o1"]));
    assert_eq!(cache.held_ids().await, ids(&["o2"]));
}

#[tokio::test]
async fn cached_offer_is_used_by_the_next_round() {
    let (harness, cache) =
        TestHarness::with_in_memory_cache(test_config(), cache_config(10), place_on_o1_with_o2());
    harness.subscribe().await;

    let first = harness
        .coordinator
        .resource_offers(vec![offer("o1", "h1", 2.0, 1024.0)])
        .await
        .unwrap();
    assert_eq!(first.cached, ids(&["o1"]));
    assert_eq!(cache.held_ids().await, ids(&["o1"]));

    let second = harness
        .coordinator
        .resource_offers(vec![offer("o2", "h2", 2.0, 1024.0)])
        .await
        .unwrap();

    assert_eq!(harness.matcher.invocations()[1], ids(&["o2", "o1"]));
    let accepts = harness.client.accepts();
    assert_eq!(accepts.len(), 1);
    assert_eq!(accepts[0].0, ids(&["o1"]));
    assert_eq!(second.reused, ids(&["o1"]));
    assert_eq!(second.accepted, ids(&["o1"]));
    assert_eq!(second.cached, ids(&["o2"]));
    assert!(harness.client.declined_ids().is_empty());
    assert_eq!(cache.held_ids().await, ids(&["o2"]));
}

#[tokio::test]
async fn unused_reused_offer_keeps_its_original_timestamp() {
    let (harness, cache) =
        TestHarness::with_in_memory_cache(test_config(), cache_config(10), ScriptedMatcher::unused());
    harness.subscribe().await;

    harness
        .coordinator
        .resource_offers(vec![offer("o1", "h1", 1.0, 512.0)])
        .await
        .unwrap();
    let first_at = harness.coordinator.last_offer_timestamp().unwrap();
    tokio::time::sleep(Duration::from_millis(5)).await;

    let summary = harness
        .coordinator
        .resource_offers(vec![offer("o2", "h2", 1.0, 512.0)])
        .await
        .unwrap();
    let second_at = harness.coordinator.last_offer_timestamp().unwrap();

    assert_eq!(summary.reused, ids(&["o1"]));
    let mut held: Vec<(OfferId, i64)> = cache
        .checkout_offers()
        .await
        .into_iter()
        .map(|c| (c.offer.id, c.received_at_ms))
        .collect();
    held.sort();
    assert_eq!(
        held,
        vec![(ids(&["o1"])[0].clone(), first_at), (ids(&["o2"])[0].clone(), second_at)]
    );
    assert!(harness.client.declined_ids().is_empty());
}

#[tokio::test]
async fn reused_offers_are_declined_when_the_round_fails() {
    let matcher = ScriptedMatcher::from_fn(|offers| {
        if offers.iter().any(|o| o.id.as_str() == "o2") {
            return Err(anyhow::anyhow!("placement exploded"));
        }
        Ok(vec![OfferHolder::new(offers)])
    });
    let (harness, cache) = TestHarness::with_in_memory_cache(test_config(), cache_config(10), matcher);
    harness.subscribe().await;

    harness
        .coordinator
        .resource_offers(vec![offer("o1", "h1", 1.0, 512.0)])
        .await
        .unwrap();
    let result = harness
        .coordinator
        .resource_offers(vec![offer("o2", "h2", 1.0, 512.0)])
        .await;

    assert!(matches!(result, Err(SchedulerError::Matcher(_))));
    assert_eq!(harness.client.declined_ids(), ids(&["o2", "o1"]));
    assert!(cache.is_empty().await);
}

#[tokio::test]
async fn lagging_status_updates_decline_whole_batch() {
    let harness = TestHarness::new();
    harness.subscribe().await;
    harness.status_delta.record(100_000);
    assert!(harness.status_delta.get() > test_config().delay_when_delta_over_ms);

    let summary = harness
        .coordinator
        .resource_offers(vec![offer("o1", "h1", 1.0, 512.0), offer("o2", "h2", 1.0, 512.0)])
        .await
        .unwrap();

    assert_eq!(summary.declined, ids(&["o1", "o2"]));
    assert!(harness.matcher.invocations().is_empty());
    assert!(harness.offer_cache.cached().is_empty());
}

#[tokio::test]
async fn lagging_status_updates_ignored_when_throttling_off() {
    let config = SchedulerConfig {
        delay_offers_for_status_delta: false,
        ..test_config()
    };
    let harness = TestHarness::with(config, ScriptedMatcher::unused());
    harness.subscribe().await;
    harness.status_delta.record(100_000);

    harness
        .coordinator
        .resource_offers(vec![offer("o1", "h1", 1.0, 512.0)])
        .await
        .unwrap();

    assert_eq!(harness.matcher.invocations().len(), 1);
}

#[tokio::test]
async fn disabled_offer_processing_declines_whole_batch() {
    let harness = TestHarness::new();
    harness.gate.disable(SchedulerAction::ProcessOffers);
    harness.subscribe().await;

    let summary = harness
        .coordinator
        .resource_offers(vec![offer("o1", "h1", 1.0, 512.0)])
        .await
        .unwrap();

    assert_eq!(summary.declined, ids(&["o1"]));
    assert!(harness.matcher.invocations().is_empty());
    assert!(harness.coordinator.last_offer_timestamp().is_some());
}

#[rstest]
#[case::caching_allowed(true, false, Some(true))]
#[case::caching_switched_off(true, true, Some(false))]
#[case::caching_not_configured(false, false, None)]
#[tokio::test]
async fn offer_cache_follows_cache_gate(
    #[case] cache_offers: bool,
    #[case] gate_disabled: bool,
    #[case] expected: Option<bool>,
) {
    let config = SchedulerConfig {
        cache_offers,
        ..test_config()
    };
    let harness = TestHarness::with(config, ScriptedMatcher::unused());
    if gate_disabled {
        harness.gate.disable(SchedulerAction::CacheOffers);
    }
    harness.subscribe().await;

    harness
        .coordinator
        .resource_offers(vec![offer("o1", "h1", 1.0, 512.0)])
        .await
        .unwrap();

    assert_eq!(harness.offer_cache.enabled(), expected);
}

#[tokio::test]
async fn rescind_removes_offer_from_cache_when_running() {
    let harness = TestHarness::new();
    let offer_id = OfferId::new("o1").unwrap();

    harness.coordinator.rescind_offer(offer_id.clone()).await;
    assert!(harness.offer_cache.rescinded().is_empty());
    assert_eq!(harness.coordinator.locks().offers_acquisitions(), 0);

    harness.subscribe().await;
    harness.coordinator.rescind_offer(offer_id.clone()).await;
    assert_eq!(harness.offer_cache.rescinded(), vec![offer_id]);
    assert_eq!(harness.coordinator.locks().offers_acquisitions(), 1);
}

// Plan per offer: 0 inactive host, 1 unused holder, 2 launched, 3 dropped by matcher.
proptest! {
    #![proptest_config(ProptestConfig::with_cases(48))]

    #[test]
    fn subscribed_batch_partitions_every_offer(plan in proptest::collection::vec(0u8..4, 0..10)) {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();

        runtime.block_on(async move {
            let offers: Vec<Offer> = plan
                .iter()
                .enumerate()
                .map(|(i, _)| offer(&format!("o{i}"), &format!("h{i}"), 2.0, 1024.0))
                .collect();
            let plan_by_id: HashMap<OfferId, u8> = offers
                .iter()
                .map(|o| o.id.clone())
                .zip(plan.iter().copied())
                .collect();

            let matcher_plan = plan_by_id.clone();
            let harness = TestHarness::with_matcher(ScriptedMatcher::from_fn(move |offers| {
                let mut holders = Vec::new();
                for offer in offers {
                    match matcher_plan[&offer.id] {
                        1 => holders.push(OfferHolder::new(vec![offer])),
                        2 => {
                            let task = task_for(&offer, "web", 1.0, 256.0);
                            holders.push(OfferHolder::with_tasks(vec![offer], vec![task]));
                        }
                        _ => {}
                    }
                }
                Ok(holders)
            }));
            for offer in &offers {
                if plan_by_id[&offer.id] == 0 {
                    harness.host_health.decommission_host(offer.hostname.clone()).await;
                }
            }
            harness.subscribe().await;

            let summary = harness
                .coordinator
                .resource_offers(offers.clone())
                .await
                .unwrap();

            let expect = |wanted: &[u8]| -> Vec<OfferId> {
                offer_ids(&offers)
                    .into_iter()
                    .filter(|id| wanted.contains(&plan_by_id[id]))
                    .collect()
            };

            assert_eq!(summary.total(), offers.len());
            assert_eq!(summary.declined, expect(&[0]));
            assert_eq!(summary.accepted, expect(&[2]));
            let mut cached = summary.cached.clone();
            cached.sort();
            let mut expected_cached = expect(&[1, 3]);
            expected_cached.sort();
            assert_eq!(cached, expected_cached);

            assert_eq!(harness.client.declined_ids(), expect(&[0]));
            let mut held = harness.offer_cache.held_ids();
            held.sort();
            assert_eq!(held, expected_cached);
            assert!(harness.abort.signals().is_empty());
        });
    }
}
