//! A device that misbehaves must make the affected cases fail.

#[macro_use]
mod common;

use vksync::{
    cases::{self, CaseKind, ChainOrder, TestCase},
    graph::Chain,
    resource::ResourceDescription,
    schedule::SubmissionOrder,
    sync::{SemaphoreKind, SynchronizationType},
    TestError,
};
use vksync_soft::{Faults, SoftDeviceCreateInfo};

#[test]
fn corrupted_copies_are_mismatches() {
    let create_info = SoftDeviceCreateInfo {
        faults: Faults {
            corrupt_copies: true,
            ..Faults::default()
        },
        ..common::universal_device(1)
    };
    let context = test_context!(create_info);
    let params = common::params(
        SynchronizationType::Synchronization2,
        SemaphoreKind::Timeline,
        ResourceDescription::buffer(0x100),
    );

    let result = Chain::run(&context, &params, SubmissionOrder::Forward);

    assert!(matches!(result, Err(TestError::Mismatch(_))), "{result:?}");
}

#[test]
fn ignored_waits_fail_reverse_chains() {
    let create_info = SoftDeviceCreateInfo {
        faults: Faults {
            ignore_semaphore_waits: true,
            ..Faults::default()
        },
        ..common::universal_device(2)
    };
    let context = test_context!(create_info);
    let params = common::params(
        SynchronizationType::Legacy,
        SemaphoreKind::Timeline,
        ResourceDescription::buffer(0x100),
    );

    let case = TestCase {
        name: "ignored_waits".to_owned(),
        kind: CaseKind::Chain {
            order: ChainOrder::Reverse,
            params,
        },
    };

    assert!(cases::run_case(&context, &case).is_fail());
}

#[test]
fn faultless_reverse_chains_pass() {
    let context = test_context!(common::universal_device(2));
    let params = common::params(
        SynchronizationType::Legacy,
        SemaphoreKind::Timeline,
        ResourceDescription::buffer(0x100),
    );

    let case = TestCase {
        name: "reverse".to_owned(),
        kind: CaseKind::Chain {
            order: ChainOrder::Reverse,
            params,
        },
    };

    assert!(cases::run_case(&context, &case).is_pass());
}
