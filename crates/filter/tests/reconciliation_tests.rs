//! Integration tests for bus-relations reconciliation
//!
//! Drives bus-relations queries through a filter attached to an in-memory
//! root hub and checks what the filter exports:
//! - redirected and native children
//! - removal of tracked children
//! - devices with unreadable identity
//! - redirector creation failures
//! - stability of decisions across passes
//!
//! Run with: `cargo test -p filter --test reconciliation_tests`

mod support;

use filter::filter::{ChildDevice, ReconciliationEngine};
use filter::pnp::{DeviceObject, DeviceRelations, FailurePoint, InMemoryStack, Status};
use std::collections::HashSet;
use std::sync::Arc;
use support::{Harness, redirect_rule, root_hub};

const DEVICE_A: &str = "USB\\VID_1234&PID_0001";
const DEVICE_B: &str = "USB\\VID_1234&PID_0002";

fn redirect_a() -> Harness {
    Harness::new(vec![redirect_rule("0x1234:0x0001")])
}

#[tokio::test]
async fn test_redirected_child_is_replaced() {
    let h = redirect_a();
    let a = h.plug(DEVICE_A, "1-1");
    let b = h.plug(DEVICE_B, "1-2");

    let outcome = h.query().await;
    assert_eq!(outcome.status, Status::Success);

    let exported = outcome.relations.unwrap();
    let children = h.filter.engine().children();
    assert_eq!(children.len(), 2);

    let redirector = children[0].redirector.expect("A is redirected");
    assert_eq!(children[0].pdo, a);
    assert_eq!(children[1].redirector, None);
    assert_eq!(exported.objects(), &[redirector, b]);
    assert_eq!(h.stack.lower_device(redirector), Some(a));
}

#[tokio::test]
async fn test_removed_child_is_pruned_and_redirector_retired() {
    let h = redirect_a();
    let a = h.plug(DEVICE_A, "1-1");
    let b = h.plug(DEVICE_B, "1-2");

    let first = h.exported().await;
    let redirector = first[0];
    assert!(h.stack.is_present(redirector));

    assert!(h.stack.unplug(a));
    let second = h.exported().await;
    assert_eq!(second, vec![b]);
    assert_eq!(h.filter.engine().children().len(), 1);

    // The platform retires the redirector once it drops out of the relations
    assert!(!h.stack.is_present(redirector));
    assert!(h.stack.synthetic_devices().is_empty());
}

#[tokio::test]
async fn test_empty_hub_exports_nothing() {
    let h = redirect_a();
    let a = h.plug(DEVICE_A, "1-1");
    let b = h.plug(DEVICE_B, "1-2");
    assert_eq!(h.exported().await.len(), 2);

    h.stack.unplug(a);
    h.stack.unplug(b);
    let outcome = h.query().await;
    assert_eq!(outcome.status, Status::Success);
    assert!(outcome.relations.unwrap().is_empty());
    assert!(h.filter.engine().children().is_empty());
}

#[tokio::test]
async fn test_child_without_identity_is_hidden() {
    let h = redirect_a();
    let _c = h.plug(DEVICE_A, "");

    assert!(h.exported().await.is_empty());
    assert!(h.filter.engine().children().is_empty());
    assert!(h.stack.synthetic_devices().is_empty());

    // Retried, and skipped again, on the next pass
    assert!(h.exported().await.is_empty());
}

#[tokio::test]
async fn test_redirector_failure_falls_back_to_native() {
    let h = redirect_a();
    let a = h.plug(DEVICE_A, "1-1");

    h.stack.fail_next(FailurePoint::AttachToStack);
    assert_eq!(h.exported().await, vec![a]);

    let children = h.filter.engine().children();
    assert_eq!(children[0].redirector, None);
    // The half-built PDO was deleted again
    assert!(h.stack.synthetic_devices().is_empty());

    // The decision is final even though creation would now succeed
    assert_eq!(h.exported().await, vec![a]);
    assert!(h.stack.synthetic_devices().is_empty());
}

#[tokio::test]
async fn test_identical_pass_is_noop() {
    let h = redirect_a();
    h.plug(DEVICE_A, "1-1");
    h.plug(DEVICE_B, "1-2");

    let first = h.exported().await;
    let children = h.filter.engine().children();
    let second = h.exported().await;

    assert_eq!(first, second);
    assert_eq!(children, h.filter.engine().children());
    assert_eq!(h.stack.synthetic_devices().len(), 1);
}

#[tokio::test]
async fn test_new_child_appended_after_existing() {
    let h = redirect_a();
    let b = h.plug(DEVICE_B, "1-2");
    assert_eq!(h.exported().await, vec![b]);

    let a = h.plug(DEVICE_A, "1-1");
    let exported = h.exported().await;
    assert_eq!(exported.len(), 2);
    assert_eq!(exported[0], b);
    assert_eq!(h.stack.lower_device(exported[1]), Some(a));
}

#[tokio::test]
async fn test_filters_on_separate_hubs_are_independent() {
    let h = redirect_a();
    h.plug(DEVICE_A, "1-1");

    let other_hub = root_hub(&h.stack);
    let other = filter::FilterDevice::create(
        h.stack.clone(),
        other_hub,
        &h.slot,
        &filter::config::FilterSettings::default(),
    )
    .unwrap();
    let b = h.stack.plug(other_hub, DEVICE_B, "2-1").unwrap();

    h.query().await;
    let outcome = support::with_timeout(h.stack.query_bus_relations(other_hub))
        .await
        .unwrap();
    assert_eq!(outcome.relations.unwrap().objects(), &[b]);

    let control = h.slot.reference();
    assert_eq!(control.filter_count(), 2);
    let all = control.enumerate_children();
    assert_eq!(all.len(), 2);
    assert_eq!(all[0].filter, h.filter.device());
    assert_eq!(all[1].filter, other.device());
}

mod properties {
    use super::*;
    use proptest::prelude::*;

    const POOL: usize = 6;

    fn mask_strategy() -> impl Strategy<Value = Vec<bool>> {
        proptest::collection::vec(any::<bool>(), POOL)
    }

    fn pick(pool: &[DeviceObject], mask: &[bool]) -> Vec<DeviceObject> {
        pool.iter()
            .zip(mask)
            .filter(|(_, keep)| **keep)
            .map(|(device, _)| *device)
            .collect()
    }

    struct Setup {
        engine: ReconciliationEngine,
        pool: Vec<DeviceObject>,
    }

    fn setup(redirect_mask: &[bool]) -> Setup {
        let stack = Arc::new(InMemoryStack::new());
        let hub = root_hub(&stack);
        let pool: Vec<DeviceObject> = (0..POOL)
            .map(|i| {
                stack
                    .plug(hub, &format!("USB\\VID_1234&PID_{:04X}", i), &format!("1-{}", i + 1))
                    .unwrap()
            })
            .collect();

        let redirected: HashSet<DeviceObject> = pick(&pool, redirect_mask).into_iter().collect();
        let policy = move |child: &ChildDevice| redirected.contains(&child.pdo());
        let engine = ReconciliationEngine::new(hub, stack, Arc::new(policy));

        Setup { engine, pool }
    }

    proptest! {
        /// Property: after S1 then S2 the registry tracks exactly S2, in order
        /// of first appearance, and the decisions of survivors are unchanged
        #[test]
        fn prop_registry_tracks_latest_snapshot(
            s1_mask in mask_strategy(),
            s2_mask in mask_strategy(),
            redirect_mask in mask_strategy(),
        ) {
            let Setup { engine, pool } = setup(&redirect_mask);
            let s1 = pick(&pool, &s1_mask);
            let s2 = pick(&pool, &s2_mask);

            engine.reconcile(Some(DeviceRelations::new(s1.clone())));
            let before = engine.children();

            let out = engine
                .reconcile(Some(DeviceRelations::new(s2.clone())))
                .unwrap();
            let after = engine.children();

            // Survivors of S1 first, then devices new in S2
            let mut expected: Vec<DeviceObject> =
                s1.iter().copied().filter(|d| s2.contains(d)).collect();
            expected.extend(s2.iter().copied().filter(|d| !s1.contains(d)));
            let tracked: Vec<DeviceObject> = after.iter().map(|c| c.pdo).collect();
            prop_assert_eq!(&tracked, &expected);

            // One outward handle per record, within the original capacity
            prop_assert_eq!(out.len(), after.len());
            prop_assert!(out.len() <= s2.len());
            for (exported, child) in out.objects().iter().zip(&after) {
                prop_assert_eq!(*exported, child.redirector.unwrap_or(child.pdo));
            }

            for child in &after {
                if let Some(previous) = before.iter().find(|c| c.pdo == child.pdo) {
                    prop_assert_eq!(previous.redirector, child.redirector);
                }
            }
        }

        /// Property: a second pass over the same snapshot changes nothing
        #[test]
        fn prop_repeated_pass_is_noop(
            mask in mask_strategy(),
            redirect_mask in mask_strategy(),
        ) {
            let Setup { engine, pool } = setup(&redirect_mask);
            let snapshot = pick(&pool, &mask);

            let first = engine.reconcile(Some(DeviceRelations::new(snapshot.clone())));
            let children = engine.children();
            let second = engine.reconcile(Some(DeviceRelations::new(snapshot)));

            prop_assert_eq!(first, second);
            prop_assert_eq!(children, engine.children());
        }
    }
}
