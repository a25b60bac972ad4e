#[macro_use]
mod common;

use rand::{rngs::StdRng, Rng, SeedableRng};
use vksync::{
    context::{Queue, TestContext},
    graph::{Chain, SemaphoreRef},
    resource::ResourceDescription,
    schedule::SubmissionOrder,
    sync::{SemaphoreKind, SynchronizationType},
    TestError,
};
use vksync_soft::{Faults, SoftDeviceCreateInfo};

#[test]
fn bytes_round_trip() {
    let context = test_context!(common::universal_device(1));

    for size in [4, 256, 65536] {
        for sync_type in SynchronizationType::ALL {
            for semaphore_kind in SemaphoreKind::ALL {
                let params = common::params(
                    sync_type,
                    semaphore_kind,
                    ResourceDescription::buffer(size),
                );

                Chain::run(&context, &params, SubmissionOrder::Forward).unwrap();
                assert_eq!(context.teardown().unwrap(), Vec::<String>::new());
            }
        }
    }
}

#[test]
fn chain_values() {
    let context = test_context!(common::universal_device(2));
    let params = common::params(
        SynchronizationType::Synchronization2,
        SemaphoreKind::Timeline,
        ResourceDescription::buffer(0x4000),
    );

    let chain = Chain::build_with(&context, &params, 5, &mut StdRng::seed_from_u64(3)).unwrap();
    let plan = chain.plan();

    let mut rng = StdRng::seed_from_u64(3);
    let first = 5 + rng.gen_range(1..=100);
    let second = first + rng.gen_range(1..=100);
    let third = second + rng.gen_range(1..=100);

    assert_eq!(chain.operation_names().len(), 3);
    assert_eq!(plan.host_signals, [SemaphoreRef::new(0, 5)]);

    let waits = plan
        .submissions
        .iter()
        .map(|submission| submission.waits[0].value)
        .collect::<Vec<_>>();
    let signals = plan
        .submissions
        .iter()
        .map(|submission| submission.signals[0].value)
        .collect::<Vec<_>>();

    assert_eq!(waits, [5, first, second]);
    assert_eq!(signals, [first, second, third]);

    // The copy has a queue of its own, so it can go first. The read shares its queue with the
    // write and has to stay behind it.
    assert_eq!(SubmissionOrder::Reverse.arrange(plan).unwrap(), [1, 0, 2]);

    chain.submit(SubmissionOrder::Reverse).unwrap();
    chain.verify().unwrap();
}

fn one_queue_per_family(context: &TestContext) -> [Queue; 3] {
    [0, 1, 2].map(|family_index| {
        *context
            .queues()
            .iter()
            .find(|queue| queue.family_index == family_index)
            .unwrap()
    })
}

#[test]
fn reverse_across_three_families() {
    let context = test_context!();
    let queues = one_queue_per_family(&context);

    for sync_type in SynchronizationType::ALL {
        let params = common::params(
            sync_type,
            SemaphoreKind::Timeline,
            ResourceDescription::buffer(0x4000),
        );
        let chain =
            Chain::build_across(&context, &params, &queues, 5, &mut StdRng::seed_from_u64(3))
                .unwrap();
        let families = chain
            .plan()
            .submissions
            .iter()
            .map(|submission| submission.queue.family_index)
            .collect::<Vec<_>>();

        assert_eq!(families, [0, 1, 2]);
        assert_eq!(chain.plan().host_signals, [SemaphoreRef::new(0, 5)]);

        // Read, then copy, then write; the host signal comes last.
        assert_eq!(SubmissionOrder::Reverse.arrange(chain.plan()).unwrap(), [2, 1, 0]);

        chain.submit(SubmissionOrder::Reverse).unwrap();
        chain.verify().unwrap();
        assert_eq!(context.teardown().unwrap(), Vec::<String>::new());
    }
}

#[test]
fn ignored_waits_break_reverse_across_three_families() {
    let context = test_context!(SoftDeviceCreateInfo {
        faults: Faults {
            ignore_semaphore_waits: true,
            ..Faults::default()
        },
        ..SoftDeviceCreateInfo::default()
    });
    let queues = one_queue_per_family(&context);
    let params = common::params(
        SynchronizationType::Synchronization2,
        SemaphoreKind::Timeline,
        ResourceDescription::buffer(0x4000),
    );

    let chain =
        Chain::build_across(&context, &params, &queues, 5, &mut StdRng::seed_from_u64(3)).unwrap();
    let result = chain
        .submit(SubmissionOrder::Reverse)
        .and_then(|()| chain.verify());

    assert!(result.is_err());
}

#[test]
fn build_across_needs_two_queues() {
    let context = test_context!();
    let params = common::params(
        SynchronizationType::Legacy,
        SemaphoreKind::Timeline,
        ResourceDescription::buffer(0x4000),
    );

    let result = Chain::build_across(
        &context,
        &params,
        &context.queues()[..1],
        5,
        &mut StdRng::seed_from_u64(3),
    );

    assert!(matches!(result, Err(TestError::Harness(_))));
}

#[test]
fn every_queue_gets_a_copy() {
    let context = test_context!();
    let params = common::params(
        SynchronizationType::Legacy,
        SemaphoreKind::Binary,
        ResourceDescription::buffer(0x4000),
    );

    let chain = Chain::build(&context, &params).unwrap();
    let names = chain.operation_names();

    // Write and read on the universal queue, one copy on each of the three other queues.
    assert_eq!(names.len(), 5);
    assert_eq!(names[0], "write_copy_buffer");
    assert_eq!(names[4], "read_copy_buffer");

    chain.submit(SubmissionOrder::Forward).unwrap();
    chain.verify().unwrap();
}

#[test]
fn wait_before_signal_orders() {
    let context = test_context!();

    for order in [
        SubmissionOrder::Forward,
        SubmissionOrder::Reverse,
        SubmissionOrder::Shuffled { seed: 11 },
    ] {
        for sync_type in SynchronizationType::ALL {
            let params = common::params(
                sync_type,
                SemaphoreKind::Timeline,
                ResourceDescription::buffer(0x4000),
            );

            Chain::run(&context, &params, order).unwrap();
            assert_eq!(context.teardown().unwrap(), Vec::<String>::new());
        }
    }
}

#[test]
fn binary_chains_only_go_forward() {
    let context = test_context!();
    let params = common::params(
        SynchronizationType::Synchronization2,
        SemaphoreKind::Binary,
        ResourceDescription::buffer(0x4000),
    );

    let chain = Chain::build(&context, &params).unwrap();

    assert!(SubmissionOrder::Reverse.arrange(chain.plan()).is_err());
    assert!(chain.plan().host_signals.is_empty());
}
