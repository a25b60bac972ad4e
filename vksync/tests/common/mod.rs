#![allow(dead_code)]

use std::sync::Arc;
use vksync::{
    config::Config,
    context::{TestContext, TestParams},
    operation::OperationName,
    provider::Provider,
    resource::ResourceDescription,
    sync::{SemaphoreKind, SynchronizationType},
};
use vksync_soft::{QueueFamilyDesc, SoftDevice, SoftDeviceCreateInfo};

/// Creates a [`TestContext`] on a soft device. Defaults to the default device and
/// configuration.
macro_rules! test_context {
    () => {
        test_context!(::vksync_soft::SoftDeviceCreateInfo::default())
    };
    ($create_info:expr $(,)?) => {
        test_context!($create_info, ::vksync::config::Config::default())
    };
    ($create_info:expr, $config:expr $(,)?) => {
        common::context_with($create_info, $config)
    };
}

pub fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Creates a context on a soft device, with a hang timeout short enough for tests.
pub fn context_with(create_info: SoftDeviceCreateInfo, config: Config) -> TestContext {
    init_logger();

    let device = SoftDevice::new(SoftDeviceCreateInfo {
        hang_timeout_ms: 500,
        ..create_info
    })
    .unwrap();
    let provider: Arc<dyn Provider> = Arc::new(device);

    TestContext::new(provider, config).unwrap()
}

/// A device with a single universal family of `queue_count` queues.
pub fn universal_device(queue_count: u32) -> SoftDeviceCreateInfo {
    SoftDeviceCreateInfo {
        queue_families: vec![QueueFamilyDesc {
            graphics: true,
            compute: true,
            transfer: true,
            queue_count,
        }],
        ..Default::default()
    }
}

pub fn params(
    sync_type: SynchronizationType,
    semaphore_kind: SemaphoreKind,
    resource: ResourceDescription,
) -> TestParams {
    TestParams {
        sync_type,
        semaphore_kind,
        write: OperationName::WriteCopyBuffer,
        read: OperationName::ReadCopyBuffer,
        resource,
        seed: 0x1234,
    }
}
