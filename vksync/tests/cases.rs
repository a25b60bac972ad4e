#[macro_use]
mod common;

use std::collections::HashSet;
use vksync::{
    cases::{self, TestCase},
    config::Config,
    operation::OperationName,
    resource::{Resource, RESOURCES},
    sync::SynchronizationType,
    TestError,
};
use vksync_soft::SoftDeviceCreateInfo;

const FAMILIES: &[&str] = &[
    "chain_forward",
    "chain_reverse",
    "chain_shuffled",
    "fan_out",
    "implicit",
    "signal_order",
    "device_host",
    "events",
    "timeline",
];

fn small_config() -> Config {
    Config {
        iterations: 2,
        fan_out_width: 3,
        wait_semaphore_count: 8,
        ..Config::default()
    }
}

#[test]
fn every_family_is_enumerated() {
    let cases = cases::enumerate(&Config::default());
    let families = cases.iter().map(TestCase::family).collect::<HashSet<_>>();

    for family in FAMILIES {
        assert!(families.contains(family), "no case in `{family}`");
    }

    let names = cases
        .iter()
        .map(|case| case.name.as_str())
        .collect::<HashSet<_>>();
    assert_eq!(names.len(), cases.len());
}

#[test]
fn filters_narrow_the_selection() {
    let config = Config {
        families: vec!["fan_out".to_owned()],
        sync_types: vec![SynchronizationType::Legacy],
        ..Config::default()
    };
    let cases = cases::enumerate(&config);

    assert!(!cases.is_empty());
    assert!(cases.iter().all(|case| case.family() == "fan_out"));
    assert!(cases
        .iter()
        .all(|case| case.sync_type() == SynchronizationType::Legacy));
}

#[test]
fn catalog_usages() {
    for name in OperationName::all() {
        let supported = RESOURCES
            .iter()
            .filter(|desc| name.support(desc).is_ok())
            .count();

        assert!(supported > 0, "{} supports no resource", name.name());
        assert!(
            !(name.in_usage() | name.out_usage()).is_empty(),
            "{} uses its resource in no way",
            name.name(),
        );
    }
}

#[test]
fn pair_resources_carry_the_usage_union() {
    let context = test_context!();
    let pairs = cases::enumerate(&Config::default())
        .iter()
        .filter_map(TestCase::params)
        .map(|params| (params.write, params.read, params.resource))
        .collect::<HashSet<_>>();
    let mut created = 0;

    for (write, read, desc) in pairs {
        let write = write.support(&desc).unwrap();
        let read = read.support(&desc).unwrap();
        let usage = write.out_usage() | read.in_usage();

        match Resource::new(context.provider(), &desc, usage, &[]) {
            Ok(resource) => {
                assert_eq!(resource.usage(), usage, "{}", desc.name());
                created += 1;
            }
            Err(TestError::NotSupported(_)) => {}
            Err(err) => panic!("{}: {err}", desc.name()),
        }
    }

    assert!(created > 0);
    assert_eq!(context.teardown().unwrap(), Vec::<String>::new());
}

#[test]
fn first_case_of_every_family_passes() {
    let config = small_config();
    let context = test_context!(SoftDeviceCreateInfo::default(), config.clone());
    let cases = cases::enumerate(&config);

    for family in FAMILIES {
        for sync_type in SynchronizationType::ALL {
            let case = cases
                .iter()
                .find(|case| case.family() == *family && case.sync_type() == sync_type)
                .unwrap();
            let status = cases::run_case(&context, case);

            assert!(status.is_pass(), "{case}: {status}");
        }
    }
}

#[test]
fn missing_features_are_not_failures() {
    let config = Config {
        families: vec!["chain_forward".to_owned()],
        sync_types: vec![SynchronizationType::Synchronization2],
        ..small_config()
    };
    let mut create_info = SoftDeviceCreateInfo::default();
    create_info.features.synchronization2 = false;
    create_info.features.timeline_semaphore = false;

    let context = test_context!(create_info, config.clone());

    for case in cases::enumerate(&config).iter().take(8) {
        let status = cases::run_case(&context, case);

        assert!(!status.is_fail(), "{case}: {status}");
        assert!(!status.is_pass(), "{case}: {status}");
    }
}
