#[macro_use]
mod common;

use vksync::{
    config::Config,
    graph::FanOut,
    operation::{OperationName, ShaderStage},
    resource::ResourceDescription,
    schedule::SubmissionOrder,
    sync::{SemaphoreKind, SynchronizationType},
};
use vksync_soft::SoftDeviceCreateInfo;

#[test]
fn branches_are_verified_independently() {
    let context = test_context!();
    let params = common::params(
        SynchronizationType::Synchronization2,
        SemaphoreKind::Timeline,
        ResourceDescription::buffer(0x4000),
    );

    let fan_out = FanOut::build(&context, &params).unwrap();
    assert_eq!(fan_out.width(), 5);

    fan_out.submit(SubmissionOrder::Forward).unwrap();
    fan_out.verify().unwrap();

    let mut branch_data = fan_out.branch_data().unwrap();
    branch_data[3][0] ^= 0xff;

    let results = fan_out.compare_branches(&branch_data).unwrap();
    let failing = results
        .iter()
        .enumerate()
        .filter(|(_, result)| result.is_err())
        .map(|(index, _)| index)
        .collect::<Vec<_>>();

    assert_eq!(failing, [3]);
    assert_eq!(context.teardown().unwrap(), Vec::<String>::new());
}

#[test]
fn every_protocol_and_semaphore_kind() {
    let context = test_context!(
        SoftDeviceCreateInfo::default(),
        Config {
            fan_out_width: 3,
            ..Config::default()
        },
    );

    for sync_type in SynchronizationType::ALL {
        for semaphore_kind in SemaphoreKind::ALL {
            let mut params = common::params(
                sync_type,
                semaphore_kind,
                ResourceDescription::buffer(0x4000),
            );
            params.read = OperationName::ReadSsbo(ShaderStage::Compute);

            FanOut::run(&context, &params).unwrap();
            assert_eq!(context.teardown().unwrap(), Vec::<String>::new());
        }
    }
}

#[test]
fn zero_width_is_rejected() {
    let context = test_context!(
        SoftDeviceCreateInfo::default(),
        Config {
            fan_out_width: 0,
            ..Config::default()
        },
    );
    let params = common::params(
        SynchronizationType::Legacy,
        SemaphoreKind::Timeline,
        ResourceDescription::buffer(0x4000),
    );

    assert!(FanOut::build(&context, &params).is_err());
}
