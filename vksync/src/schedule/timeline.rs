//! Behaviour of timeline semaphores on their own, without any resource in between.

use crate::{
    context::TestContext,
    sync::{
        self, Fence, Semaphore, SemaphoreKind, SynchronizationType, SynchronizationWrapper,
        WaitOutcome,
    },
    Result, TestError,
};
use ash::vk;
use log::{debug, info};
use rand::{rngs::StdRng, Rng, SeedableRng};
use std::{
    fmt,
    sync::atomic::{AtomicBool, Ordering},
    thread,
    time::Duration,
};

/// The smallest `max_timeline_semaphore_value_difference` a device may report.
const REQUIRED_MIN_VALUE_DIFFERENCE: u64 = i32::MAX as u64;

/// Who signals the semaphores of a wait test.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum SignalSource {
    Host,
    Device,
}

impl SignalSource {
    #[inline]
    pub fn name(self) -> &'static str {
        match self {
            SignalSource::Host => "host",
            SignalSource::Device => "device",
        }
    }
}

impl fmt::Display for SignalSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Signals a timeline value from the device with an empty submission.
fn device_signal(
    wrapper: &mut SynchronizationWrapper,
    queue: vk::Queue,
    fence: vk::Fence,
    semaphore: &Semaphore,
    value: u64,
) -> Result {
    wrapper.add_submit_info(
        &[],
        &[],
        &[sync::semaphore_submit_info(
            semaphore.handle(),
            value,
            vk::PipelineStageFlags2::ALL_COMMANDS,
        )],
        false,
        true,
    )?;

    wrapper.queue_submit(queue, fence)
}

/// A timeline semaphore starts at the value it was created with, and no further.
pub fn initial_value(context: &TestContext, seed: u64) -> Result {
    let provider = context.provider();
    let config = context.config();
    let max_difference = provider.properties().max_timeline_semaphore_value_difference;
    let mut rng = StdRng::seed_from_u64(seed);

    if max_difference < 2 {
        return Err(TestError::conformance(format!(
            "max_timeline_semaphore_value_difference is {max_difference}",
        )));
    }

    let mut values = vec![0, 1 + rng.gen::<u64>() % (max_difference - 1)];

    if max_difference != u64::MAX {
        values.push(max_difference + 1);
    }

    for value in values {
        let semaphore = Semaphore::new(provider, SemaphoreKind::Timeline, value)?;

        if semaphore.wait(value, Duration::ZERO)? != WaitOutcome::Signaled {
            return Err(TestError::conformance(format!(
                "waiting for the initial value {value} didn't succeed immediately",
            )));
        }

        let counter = semaphore.counter_value()?;

        if counter != value {
            return Err(TestError::conformance(format!(
                "a semaphore created with the initial value {value} reports {counter}",
            )));
        }

        if value != u64::MAX
            && semaphore.wait(value + 1, config.short_timeout())? != WaitOutcome::TimedOut
        {
            return Err(TestError::conformance(format!(
                "a semaphore created with the initial value {value} reached {}",
                value + 1,
            )));
        }
    }

    Ok(())
}

/// Waiting for a value nothing signals runs out of time.
pub fn short_timeout_probe(context: &TestContext) -> Result {
    let semaphore = Semaphore::new(context.provider(), SemaphoreKind::Timeline, 0)?;

    match semaphore.wait(1, context.config().short_timeout())? {
        WaitOutcome::TimedOut => Ok(()),
        WaitOutcome::Signaled => Err(TestError::conformance(
            "a semaphore that was never signaled reached 1",
        )),
    }
}

/// The host waits on a value whose signal operation is itself still waiting on the host.
pub fn host_wait_before_signal(
    context: &TestContext,
    sync_type: SynchronizationType,
    seed: u64,
) -> Result {
    let provider = context.provider();
    let config = context.config();
    let queue = context.universal_queue()?;
    let mut wrapper = SynchronizationWrapper::new(provider, sync_type, true, 1)?;
    let semaphore = Semaphore::new(provider, SemaphoreKind::Timeline, 0)?;
    let mut rng = StdRng::seed_from_u64(seed);
    let _guard = super::IdleGuard::new(provider);

    // The first value is the one the host signals at the end.
    let mut values = vec![1 + rng.gen_range(1..=10_000)];

    for _ in 0..config.iterations {
        let wait_value = values[values.len() - 1];
        let signal_value = wait_value + rng.gen_range(1..=10_000);
        let stage_mask = vk::PipelineStageFlags2::TOP_OF_PIPE;

        wrapper.add_submit_info(
            &[sync::semaphore_submit_info(
                semaphore.handle(),
                wait_value,
                stage_mask,
            )],
            &[],
            &[sync::semaphore_submit_info(
                semaphore.handle(),
                signal_value,
                stage_mask,
            )],
            true,
            true,
        )?;
        wrapper.queue_submit(queue.handle, vk::Fence::null())?;

        values.push(signal_value);
    }

    let last = values[values.len() - 1];

    if semaphore.wait(last, Duration::ZERO)? != WaitOutcome::TimedOut {
        return Err(TestError::conformance(format!(
            "{last} was reached before the host signaled {}",
            values[0],
        )));
    }

    debug!("signaling {} from the host", values[0]);
    semaphore.signal(values[0])?;
    semaphore
        .wait(last, config.long_timeout())?
        .expect_signaled("vkWaitSemaphores")
}

/// Signals many timelines, then waits on all of them, or on any of them.
///
/// With `wait_any`, only one semaphore picked at random is signaled.
pub fn wait(
    context: &TestContext,
    sync_type: SynchronizationType,
    source: SignalSource,
    wait_any: bool,
    seed: u64,
) -> Result {
    let provider = context.provider();
    let config = context.config();
    let queue = context.universal_queue()?;
    let mut wrapper = SynchronizationWrapper::new(provider, sync_type, true, 1)?;
    let fence = Fence::new(provider, false)?;
    let mut rng = StdRng::seed_from_u64(seed);

    let semaphores = (0..config.wait_semaphore_count)
        .map(|_| Semaphore::new(provider, SemaphoreKind::Timeline, 0))
        .collect::<Result<Vec<_>>>()?;
    let values = semaphores
        .iter()
        .map(|_| rng.gen_range(1..=10_000))
        .collect::<Vec<u64>>();
    let _guard = super::IdleGuard::new(provider);

    if semaphores.is_empty() {
        return Err(TestError::harness("there is nothing to wait on"));
    }

    let mut signal = |index: usize| -> Result {
        match source {
            SignalSource::Host => semaphores[index].signal(values[index]),
            SignalSource::Device => {
                device_signal(
                    &mut wrapper,
                    queue.handle,
                    fence.handle(),
                    &semaphores[index],
                    values[index],
                )?;
                fence
                    .wait(config.long_timeout())?
                    .expect_signaled("vkWaitForFences")?;
                fence.reset()
            }
        }
    };

    if wait_any {
        signal(rng.gen_range(0..semaphores.len()))?;
    } else {
        for index in 0..semaphores.len() {
            signal(index)?;
        }
    }

    let semaphore_refs = semaphores.iter().collect::<Vec<_>>();

    match sync::wait_semaphores(&**provider, &semaphore_refs, &values, wait_any, Duration::ZERO)? {
        WaitOutcome::Signaled => Ok(()),
        WaitOutcome::TimedOut => Err(TestError::conformance(format!(
            "waiting on {} of {} signaled semaphores timed out",
            if wait_any { "any" } else { "all" },
            semaphores.len(),
        ))),
    }
}

/// Signals values spread up to the maximum difference the device allows while another thread
/// watches the counter. The counter must never go backwards.
pub fn max_difference(context: &TestContext, sync_type: SynchronizationType) -> Result {
    let provider = context.provider();
    let config = context.config();
    let queue = context.universal_queue()?;
    let max_difference = provider.properties().max_timeline_semaphore_value_difference;

    if max_difference < REQUIRED_MIN_VALUE_DIFFERENCE {
        return Err(TestError::conformance(format!(
            "max_timeline_semaphore_value_difference is {max_difference}, less than the \
            required {REQUIRED_MIN_VALUE_DIFFERENCE}",
        )));
    }

    let iterations = (u64::MAX / max_difference).min(100);
    info!("max_timeline_semaphore_value_difference = {max_difference}, {iterations} iterations");

    let mut wrapper = SynchronizationWrapper::new(provider, sync_type, true, 1)?;
    let semaphore = Semaphore::new(provider, SemaphoreKind::Timeline, 0)?;
    let fence = Fence::new(provider, false)?;
    let guard = super::IdleGuard::new(provider);
    let running = AtomicBool::new(true);

    let overflow = || TestError::harness("timeline values overflowed");

    thread::scope(|scope| {
        let monitor = scope.spawn(|| monitor_counter(&semaphore, &running));

        let signaled = (|| -> Result {
            let mut back: u64 = 1;
            let mut front = 1;
            semaphore.signal(front)?;

            for _ in 0..iterations {
                for _ in 0..10 {
                    front += 1;
                    device_signal(&mut wrapper, queue.handle, vk::Fence::null(), &semaphore, front)?;
                }

                front = back
                    .checked_add(max_difference)
                    .and_then(|value| value.checked_sub(10))
                    .ok_or_else(overflow)?;
                let fence_value = front;
                device_signal(&mut wrapper, queue.handle, fence.handle(), &semaphore, front)?;

                for _ in 1..10 {
                    front = front.checked_add(1).ok_or_else(overflow)?;
                    device_signal(&mut wrapper, queue.handle, vk::Fence::null(), &semaphore, front)?;
                }

                fence
                    .wait(config.long_timeout())?
                    .expect_signaled("vkWaitForFences")?;
                fence.reset()?;
                back = fence_value;
            }

            Ok(())
        })();

        let idle = signaled.and_then(|()| guard.wait_idle());
        running.store(false, Ordering::Release);
        let monitored = monitor
            .join()
            .unwrap_or_else(|_| Err(TestError::harness("the monitor thread panicked")));

        idle.and(monitored)
    })
}

/// Host and device signals mixed on one semaphore, with a monitor thread watching the counter.
pub fn monotonicity(context: &TestContext, sync_type: SynchronizationType, seed: u64) -> Result {
    let provider = context.provider();
    let config = context.config();
    let queue = context.universal_queue()?;
    let mut wrapper = SynchronizationWrapper::new(provider, sync_type, true, 1)?;
    let semaphore = Semaphore::new(provider, SemaphoreKind::Timeline, 0)?;
    let mut rng = StdRng::seed_from_u64(seed);
    let guard = super::IdleGuard::new(provider);
    let running = AtomicBool::new(true);

    thread::scope(|scope| {
        let monitor = scope.spawn(|| monitor_counter(&semaphore, &running));

        let signaled = (|| -> Result {
            let mut value = 0;

            for index in 0..config.iterations * 10 {
                value += rng.gen_range(1..=100);

                if index % 2 == 0 {
                    semaphore.signal(value)?;
                } else {
                    // The device signal has to land before the next host signal overtakes it.
                    device_signal(&mut wrapper, queue.handle, vk::Fence::null(), &semaphore, value)?;
                    semaphore
                        .wait(value, config.long_timeout())?
                        .expect_signaled("vkWaitSemaphores")?;
                }
            }

            Ok(())
        })();

        let idle = signaled.and_then(|()| guard.wait_idle());
        running.store(false, Ordering::Release);
        let monitored = monitor
            .join()
            .unwrap_or_else(|_| Err(TestError::harness("the monitor thread panicked")));

        idle.and(monitored)
    })
}

fn monitor_counter(semaphore: &Semaphore, running: &AtomicBool) -> Result {
    let mut last = 0;
    let mut samples = 0u64;

    while running.load(Ordering::Acquire) {
        let value = semaphore.counter_value()?;

        if value < last {
            return Err(TestError::conformance(format!(
                "the counter went from {last} back to {value}",
            )));
        }

        last = value;
        samples += 1;
        thread::yield_now();
    }

    debug!("monitor sampled the counter {samples} times, last value {last}");

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn source_names() {
        assert_eq!(SignalSource::Host.to_string(), "host");
        assert_eq!(SignalSource::Device.to_string(), "device");
    }

    #[test]
    fn iteration_count_is_bounded() {
        assert_eq!((u64::MAX / REQUIRED_MIN_VALUE_DIFFERENCE).min(100), 100);
        assert_eq!((u64::MAX / u64::MAX).min(100), 1);
    }
}
