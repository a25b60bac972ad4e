//! The named test cases and how to run them.
//!
//! Cases are declared as `const` lists of write/read pairs per family, crossed with
//! [`RESOURCES`], the synchronization protocols and the semaphore kinds, and filtered by what
//! the operations support. Names have the shape
//! `"{family}.{sync}.{semaphore}.{write}_{read}.{resource}"`; families that don't use
//! semaphores leave that part out, and families that don't use operations name their test
//! instead.

use crate::{
    config::Config,
    context::{TestContext, TestParams},
    graph::{Chain, FanOut, SubmitInfoCombinatorics},
    operation::{OperationName, ShaderStage},
    resource::{ResourceDescription, RESOURCES},
    schedule::{
        device_host, events, signal_order,
        timeline::{self, SignalSource},
        SubmissionOrder,
    },
    sync::{SemaphoreKind, SynchronizationType},
    Result, TestStatus,
};
use log::{info, warn};
use std::fmt;

type Pair = (OperationName, OperationName);

/// Pairs whose write stages its payload in host memory, so that the payload can be replaced
/// after recording.
const STAGED_PAIRS: &[Pair] = &[
    (OperationName::WriteCopyBuffer, OperationName::ReadCopyBuffer),
    (OperationName::WriteCopyBuffer, OperationName::ReadSsbo(ShaderStage::Compute)),
    (OperationName::WriteCopyBuffer, OperationName::ReadUbo(ShaderStage::Fragment)),
    (OperationName::WriteCopyBuffer, OperationName::ReadVertexInput),
    (OperationName::WriteSsbo(ShaderStage::Compute), OperationName::ReadCopyBuffer),
    (
        OperationName::WriteSsbo(ShaderStage::Vertex),
        OperationName::ReadSsbo(ShaderStage::Geometry),
    ),
    (OperationName::WriteCopyImageToBuffer, OperationName::ReadCopyBuffer),
    (OperationName::WriteCopyBufferToImage, OperationName::ReadCopyImageToBuffer),
    (OperationName::WriteCopyImage, OperationName::ReadCopyImage),
    (OperationName::WriteBlitImage, OperationName::ReadBlitImage),
    (
        OperationName::WriteImage(ShaderStage::Compute),
        OperationName::ReadImage(ShaderStage::Fragment),
    ),
    (
        OperationName::WriteImage(ShaderStage::TessellationEvaluation),
        OperationName::ReadCopyImageToBuffer,
    ),
];

/// Pairs whose write records its payload into the command buffer.
const INLINE_PAIRS: &[Pair] = &[
    (OperationName::WriteFillBuffer, OperationName::ReadCopyBuffer),
    (OperationName::WriteUpdateBuffer, OperationName::ReadSsbo(ShaderStage::Compute)),
    (OperationName::WriteClearColorImage, OperationName::ReadImage(ShaderStage::Compute)),
    (OperationName::WriteIndirectBufferDraw, OperationName::ReadIndirectBufferDraw),
    (
        OperationName::WriteIndirectBufferDrawIndexed,
        OperationName::ReadIndirectBufferDrawIndexed,
    ),
    (OperationName::WriteIndirectBufferDispatch, OperationName::ReadIndirectBufferDispatch),
    (OperationName::WriteUpdateIndexBuffer, OperationName::ReadIndexInput),
];

/// Pairs of the submit-info combinatorics, each run with only the first resource it supports.
const IMPLICIT_PAIRS: &[Pair] = &[
    (OperationName::WriteCopyBuffer, OperationName::ReadCopyBuffer),
    (OperationName::WriteCopyBuffer, OperationName::ReadSsbo(ShaderStage::Vertex)),
    (OperationName::WriteSsbo(ShaderStage::Vertex), OperationName::ReadCopyBuffer),
    (
        OperationName::WriteSsbo(ShaderStage::Vertex),
        OperationName::ReadSsbo(ShaderStage::Vertex),
    ),
];

/// The order a chain is submitted in.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ChainOrder {
    Forward,
    Reverse,
    Shuffled,
}

impl ChainOrder {
    const ALL: [ChainOrder; 3] = [ChainOrder::Forward, ChainOrder::Reverse, ChainOrder::Shuffled];

    #[inline]
    pub const fn family(self) -> &'static str {
        match self {
            ChainOrder::Forward => "chain_forward",
            ChainOrder::Reverse => "chain_reverse",
            ChainOrder::Shuffled => "chain_shuffled",
        }
    }

    #[inline]
    pub fn submission_order(self, seed: u64) -> SubmissionOrder {
        match self {
            ChainOrder::Forward => SubmissionOrder::Forward,
            ChainOrder::Reverse => SubmissionOrder::Reverse,
            ChainOrder::Shuffled => SubmissionOrder::Shuffled { seed },
        }
    }
}

/// Which side sets the event of an event case.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum EventKind {
    HostSetDeviceWait,
    DeviceSetDeviceWait,
}

impl EventKind {
    const ALL: [EventKind; 2] = [EventKind::HostSetDeviceWait, EventKind::DeviceSetDeviceWait];

    #[inline]
    pub const fn name(self) -> &'static str {
        match self {
            EventKind::HostSetDeviceWait => "host_set_device_wait",
            EventKind::DeviceSetDeviceWait => "device_set_device_wait",
        }
    }
}

/// A timeline semaphore test that doesn't move data.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TimelineTest {
    InitialValue,
    ShortTimeoutProbe,
    HostWaitBeforeSignal,
    Wait { source: SignalSource, wait_any: bool },
    MaxDifference,
    Monotonicity,
}

impl TimelineTest {
    pub fn name(self) -> String {
        match self {
            TimelineTest::InitialValue => "initial_value".to_owned(),
            TimelineTest::ShortTimeoutProbe => "short_timeout_probe".to_owned(),
            TimelineTest::HostWaitBeforeSignal => "host_wait_before_signal".to_owned(),
            TimelineTest::Wait { source, wait_any } => {
                format!("wait_{}_{source}", if wait_any { "any" } else { "all" })
            }
            TimelineTest::MaxDifference => "max_difference".to_owned(),
            TimelineTest::Monotonicity => "monotonicity".to_owned(),
        }
    }

    /// Whether the test submits work and so depends on the protocol.
    #[inline]
    pub const fn submits(self) -> bool {
        !matches!(self, TimelineTest::InitialValue | TimelineTest::ShortTimeoutProbe)
    }
}

/// What a case runs.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CaseKind {
    Chain {
        order: ChainOrder,
        params: TestParams,
    },
    FanOut(TestParams),
    Implicit {
        combination: SubmitInfoCombinatorics,
        params: TestParams,
    },
    SignalOrder(TestParams),
    DeviceHost(TestParams),
    Event {
        kind: EventKind,
        params: TestParams,
    },
    Timeline {
        test: TimelineTest,
        sync_type: SynchronizationType,
        seed: u64,
    },
}

/// A named, runnable test case.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TestCase {
    pub name: String,
    pub kind: CaseKind,
}

impl TestCase {
    /// Returns the family the case belongs to, as used by [`Config::families`].
    pub fn family(&self) -> &'static str {
        match self.kind {
            CaseKind::Chain { order, .. } => order.family(),
            CaseKind::FanOut(_) => "fan_out",
            CaseKind::Implicit { .. } => "implicit",
            CaseKind::SignalOrder(_) => "signal_order",
            CaseKind::DeviceHost(_) => "device_host",
            CaseKind::Event { .. } => "events",
            CaseKind::Timeline { .. } => "timeline",
        }
    }

    /// Returns the operations and resource of the case, if it has any.
    pub fn params(&self) -> Option<&TestParams> {
        match &self.kind {
            CaseKind::Chain { params, .. }
            | CaseKind::FanOut(params)
            | CaseKind::Implicit { params, .. }
            | CaseKind::SignalOrder(params)
            | CaseKind::DeviceHost(params)
            | CaseKind::Event { params, .. } => Some(params),
            CaseKind::Timeline { .. } => None,
        }
    }

    pub fn sync_type(&self) -> SynchronizationType {
        match (&self.kind, self.params()) {
            (CaseKind::Timeline { sync_type, .. }, _) => *sync_type,
            (_, Some(params)) => params.sync_type,
            (_, None) => SynchronizationType::Legacy,
        }
    }

    /// Returns the semaphore kind the case synchronizes with, if any.
    pub fn semaphore_kind(&self) -> Option<SemaphoreKind> {
        match &self.kind {
            CaseKind::Event { .. } => None,
            CaseKind::Timeline { .. } => Some(SemaphoreKind::Timeline),
            _ => self.params().map(|params| params.semaphore_kind),
        }
    }

    /// Runs the case without any reporting.
    pub fn run(&self, context: &TestContext) -> Result {
        match &self.kind {
            CaseKind::Chain { order, params } => {
                Chain::run(context, params, order.submission_order(params.seed))
            }
            CaseKind::FanOut(params) => FanOut::run(context, params),
            CaseKind::Implicit {
                combination,
                params,
            } => combination.run(context, params),
            CaseKind::SignalOrder(params) => signal_order::run(context, params),
            CaseKind::DeviceHost(params) => device_host::run(context, params),
            CaseKind::Event {
                kind: EventKind::HostSetDeviceWait,
                params,
            } => events::host_set_device_wait(context, params),
            CaseKind::Event {
                kind: EventKind::DeviceSetDeviceWait,
                params,
            } => events::device_set_device_wait(context, params),
            CaseKind::Timeline {
                test,
                sync_type,
                seed,
            } => run_timeline(context, *test, *sync_type, *seed),
        }
    }
}

impl fmt::Display for TestCase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

fn run_timeline(
    context: &TestContext,
    test: TimelineTest,
    sync_type: SynchronizationType,
    seed: u64,
) -> Result {
    match test {
        TimelineTest::InitialValue => timeline::initial_value(context, seed),
        TimelineTest::ShortTimeoutProbe => timeline::short_timeout_probe(context),
        TimelineTest::HostWaitBeforeSignal => {
            timeline::host_wait_before_signal(context, sync_type, seed)
        }
        TimelineTest::Wait { source, wait_any } => {
            timeline::wait(context, sync_type, source, wait_any, seed)
        }
        TimelineTest::MaxDifference => timeline::max_difference(context, sync_type),
        TimelineTest::Monotonicity => timeline::monotonicity(context, sync_type, seed),
    }
}

/// Builds every case the configuration selects, in a stable order.
pub fn enumerate(config: &Config) -> Vec<TestCase> {
    let mut builder = CaseBuilder {
        config,
        cases: Vec::new(),
    };

    for sync_type in SynchronizationType::ALL {
        for kind in SemaphoreKind::ALL {
            for order in ChainOrder::ALL {
                // Binary semaphores can't be waited on before they're signaled.
                if order != ChainOrder::Forward && !kind.is_timeline() {
                    continue;
                }

                builder.pairs(order.family(), sync_type, Some(kind), STAGED_PAIRS, |params| {
                    CaseKind::Chain { order, params }
                });
            }

            builder.pairs("fan_out", sync_type, Some(kind), STAGED_PAIRS, CaseKind::FanOut);

            for pairs in [STAGED_PAIRS, INLINE_PAIRS] {
                builder.pairs("signal_order", sync_type, Some(kind), pairs, CaseKind::SignalOrder);
            }

            if kind.is_timeline() {
                builder.pairs(
                    "device_host",
                    sync_type,
                    Some(kind),
                    STAGED_PAIRS,
                    CaseKind::DeviceHost,
                );
            }

            builder.implicit(sync_type, kind);
        }

        for kind in EventKind::ALL {
            let prefix = format!("events.{}", kind.name());

            for pairs in [STAGED_PAIRS, INLINE_PAIRS] {
                builder.pairs(&prefix, sync_type, None, pairs, |params| CaseKind::Event {
                    kind,
                    params,
                });
            }
        }

        builder.timeline(sync_type);
    }

    builder.cases
}

struct CaseBuilder<'a> {
    config: &'a Config,
    cases: Vec<TestCase>,
}

impl CaseBuilder<'_> {
    /// Adds one case per pair and resource both operations support.
    fn pairs(
        &mut self,
        prefix: &str,
        sync_type: SynchronizationType,
        semaphore_kind: Option<SemaphoreKind>,
        pairs: &[Pair],
        kind: impl Fn(TestParams) -> CaseKind,
    ) {
        for &(write, read) in pairs {
            for resource in supported_resources(write, read) {
                let name = format!(
                    "{prefix}.{}",
                    pair_case_name(sync_type, semaphore_kind, write, read, resource),
                );
                let params = self.params(&name, sync_type, semaphore_kind, write, read, resource);

                self.push(name, kind(params));
            }
        }
    }

    fn implicit(&mut self, sync_type: SynchronizationType, semaphore_kind: SemaphoreKind) {
        for &(write, read) in IMPLICIT_PAIRS {
            let Some(resource) = supported_resources(write, read).next() else {
                continue;
            };

            for combination in SubmitInfoCombinatorics::all() {
                let name = format!(
                    "implicit.{}.{combination}",
                    pair_case_name(sync_type, Some(semaphore_kind), write, read, resource),
                );
                let params =
                    self.params(&name, sync_type, Some(semaphore_kind), write, read, resource);

                self.push(
                    name,
                    CaseKind::Implicit {
                        combination,
                        params,
                    },
                );
            }
        }
    }

    fn timeline(&mut self, sync_type: SynchronizationType) {
        let tests = [
            TimelineTest::InitialValue,
            TimelineTest::ShortTimeoutProbe,
            TimelineTest::HostWaitBeforeSignal,
            TimelineTest::Wait {
                source: SignalSource::Host,
                wait_any: false,
            },
            TimelineTest::Wait {
                source: SignalSource::Host,
                wait_any: true,
            },
            TimelineTest::Wait {
                source: SignalSource::Device,
                wait_any: false,
            },
            TimelineTest::Wait {
                source: SignalSource::Device,
                wait_any: true,
            },
            TimelineTest::MaxDifference,
            TimelineTest::Monotonicity,
        ];

        for test in tests {
            // Tests that don't submit are only listed once.
            let name = match (test.submits(), sync_type) {
                (true, _) => format!("timeline.{sync_type}.{}", test.name()),
                (false, SynchronizationType::Legacy) => format!("timeline.{}", test.name()),
                (false, SynchronizationType::Synchronization2) => continue,
            };
            let seed = self.config.seed_for(&name);

            self.push(
                name,
                CaseKind::Timeline {
                    test,
                    sync_type,
                    seed,
                },
            );
        }
    }

    fn params(
        &self,
        name: &str,
        sync_type: SynchronizationType,
        semaphore_kind: Option<SemaphoreKind>,
        write: OperationName,
        read: OperationName,
        resource: &ResourceDescription,
    ) -> TestParams {
        TestParams {
            sync_type,
            // Event cases never create a semaphore.
            semaphore_kind: semaphore_kind.unwrap_or(SemaphoreKind::Binary),
            write,
            read,
            resource: *resource,
            seed: self.config.seed_for(name),
        }
    }

    fn push(&mut self, name: String, kind: CaseKind) {
        let case = TestCase { name, kind };

        if is_selected(self.config, &case) {
            self.cases.push(case);
        }
    }
}

fn supported_resources(
    write: OperationName,
    read: OperationName,
) -> impl Iterator<Item = &'static ResourceDescription> {
    RESOURCES
        .iter()
        .filter(move |desc| write.is_resource_supported(desc) && read.is_resource_supported(desc))
}

fn pair_case_name(
    sync_type: SynchronizationType,
    semaphore_kind: Option<SemaphoreKind>,
    write: OperationName,
    read: OperationName,
    resource: &ResourceDescription,
) -> String {
    match semaphore_kind {
        Some(kind) => format!(
            "{sync_type}.{}.{write}_{read}.{}",
            kind.name(),
            resource.name(),
        ),
        None => format!("{sync_type}.{write}_{read}.{}", resource.name()),
    }
}

fn is_selected(config: &Config, case: &TestCase) -> bool {
    let family = case.family();

    if !config.families.is_empty() && !config.families.iter().any(|f| f == family) {
        return false;
    }

    if !config.sync_types.is_empty() && !config.sync_types.contains(&case.sync_type()) {
        return false;
    }

    if let Some(kind) = case.semaphore_kind() {
        if !config.semaphore_kinds.is_empty() && !config.semaphore_kinds.contains(&kind) {
            return false;
        }
    }

    match &config.name_filter {
        Some(filter) => case.name.contains(filter.as_str()),
        None => true,
    }
}

/// Runs one case and reports its status.
///
/// Only a missing capability turns into [`TestStatus::NotSupported`]; every other error fails
/// the case. Validation messages the provider collected while the case ran fail a case that
/// would otherwise pass.
pub fn run_case(context: &TestContext, case: &TestCase) -> TestStatus {
    let status = TestStatus::from(case.run(context));
    let status = match context.teardown() {
        Ok(messages) => match messages.first() {
            Some(first) if status.is_pass() => TestStatus::Fail(format!(
                "{} validation message(s), the first one: {first}",
                messages.len(),
            )),
            _ => status,
        },
        Err(err) if status.is_pass() => TestStatus::Fail(format!("teardown failed: {err}")),
        Err(err) => {
            warn!("{}: teardown failed: {err}", case.name);
            status
        }
    };

    info!("{}: {status}", case.name);

    status
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn names_are_unique() {
        let cases = enumerate(&Config::default());
        let names = cases
            .iter()
            .map(|case| case.name.as_str())
            .collect::<HashSet<_>>();

        assert_eq!(names.len(), cases.len());
    }

    #[test]
    fn name_shape() {
        let cases = enumerate(&Config::default());

        let has = |name: &str| cases.iter().any(|case| case.name == name);

        assert!(has(
            "chain_forward.legacy.binary_semaphore.write_copy_buffer_read_copy_buffer.buffer_16384",
        ));
        assert!(has("timeline.initial_value"));
        assert!(!has("timeline.legacy.initial_value"));
        assert!(has("timeline.synchronization2.wait_any_device"));
        assert!(has(
            "events.host_set_device_wait.synchronization2.write_fill_buffer_read_copy_buffer.\
            buffer_16384",
        ));
        assert!(has(
            "implicit.legacy.timeline_semaphore.write_copy_buffer_read_copy_buffer.buffer_16384.\
            0123",
        ));
    }

    #[test]
    fn binary_chains_only_go_forward() {
        let cases = enumerate(&Config::default());

        assert!(cases.iter().all(|case| match case.kind {
            CaseKind::Chain { order, params } => {
                order == ChainOrder::Forward || params.semaphore_kind.is_timeline()
            }
            _ => true,
        }));
    }

    #[test]
    fn every_pair_supports_its_resource() {
        for case in enumerate(&Config::default()) {
            if let Some(params) = case.params() {
                assert!(params.write.is_resource_supported(&params.resource), "{case}");
                assert!(params.read.is_resource_supported(&params.resource), "{case}");
            }
        }
    }

    #[test]
    fn implicit_covers_every_combination() {
        let config = Config {
            families: vec!["implicit".to_owned()],
            sync_types: vec![SynchronizationType::Legacy],
            semaphore_kinds: vec![SemaphoreKind::Timeline],
            ..Config::default()
        };

        assert_eq!(enumerate(&config).len(), IMPLICIT_PAIRS.len() * 256);
    }

    #[test]
    fn filters_apply() {
        let config = Config {
            families: vec!["fan_out".to_owned()],
            sync_types: vec![SynchronizationType::Synchronization2],
            semaphore_kinds: vec![SemaphoreKind::Binary],
            name_filter: Some("image".to_owned()),
            ..Config::default()
        };
        let cases = enumerate(&config);

        assert!(!cases.is_empty());

        for case in &cases {
            assert_eq!(case.family(), "fan_out");
            assert_eq!(case.sync_type(), SynchronizationType::Synchronization2);
            assert_eq!(case.semaphore_kind(), Some(SemaphoreKind::Binary));
            assert!(case.name.contains("image"));
        }
    }

    #[test]
    fn seeds_depend_on_the_name_only() {
        let config = Config::default();
        let first = enumerate(&config);
        let second = enumerate(&Config {
            families: vec!["signal_order".to_owned()],
            ..Config::default()
        });

        for case in &second {
            let same = first.iter().find(|other| other.name == case.name);

            assert_eq!(same.map(|other| other.kind), Some(case.kind));
        }
    }
}
