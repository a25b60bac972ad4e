#[macro_use]
mod common;

use vksync::{
    config::Config,
    schedule::timeline::{self, SignalSource},
    sync::SynchronizationType,
    TestError,
};
use vksync_soft::SoftDeviceCreateInfo;

#[test]
fn counter_is_monotonic() {
    let context = test_context!();

    for sync_type in SynchronizationType::ALL {
        timeline::monotonicity(&context, sync_type, 0xabc).unwrap();
    }
}

#[test]
fn initial_values() {
    let context = test_context!();

    timeline::initial_value(&context, 1).unwrap();
    timeline::initial_value(&context, 2).unwrap();
}

#[test]
fn short_timeouts_time_out() {
    let context = test_context!();

    timeline::short_timeout_probe(&context).unwrap();
}

#[test]
fn host_waits_before_signals() {
    let context = test_context!(
        SoftDeviceCreateInfo::default(),
        Config {
            iterations: 3,
            ..Config::default()
        },
    );

    for sync_type in SynchronizationType::ALL {
        timeline::host_wait_before_signal(&context, sync_type, 9).unwrap();
    }
}

#[test]
fn waits_on_every_source() {
    let context = test_context!(
        SoftDeviceCreateInfo::default(),
        Config {
            wait_semaphore_count: 10,
            ..Config::default()
        },
    );

    for source in [SignalSource::Host, SignalSource::Device] {
        for wait_any in [false, true] {
            timeline::wait(
                &context,
                SynchronizationType::Synchronization2,
                source,
                wait_any,
                21,
            )
            .unwrap();
        }
    }
}

#[test]
fn value_differences() {
    let context = test_context!(
        SoftDeviceCreateInfo {
            max_timeline_semaphore_value_difference: 1 << 32,
            ..SoftDeviceCreateInfo::default()
        },
        Config::default(),
    );

    timeline::max_difference(&context, SynchronizationType::Legacy).unwrap();
    assert_eq!(context.teardown().unwrap(), Vec::<String>::new());
}

#[test]
fn value_differences_below_the_minimum() {
    let context = test_context!(
        SoftDeviceCreateInfo {
            max_timeline_semaphore_value_difference: 1000,
            ..SoftDeviceCreateInfo::default()
        },
        Config::default(),
    );

    let result = timeline::max_difference(&context, SynchronizationType::Synchronization2);

    assert!(matches!(result, Err(TestError::Conformance(_))), "{result:?}");
}
