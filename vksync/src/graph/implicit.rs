//! Randomized submit-info shapes in a single `queue_submit`.
//!
//! A case is four submit infos, each of one [`ImplicitShape`]. Every shape waits on semaphores;
//! some also carry command buffers, some also signal. For each of them the builder generates the
//! counterpart infos that make the batch complete on its own:
//!
//! - a producer info, submitted first, that signals what the shaped info waits for and runs the
//!   writes its reads depend on;
//! - for shapes that signal, a consumer info that waits for those signals.
//!
//! Implicit ordering of the infos inside one batch is never relied upon: every read is ordered
//! after its write through a semaphore.

use super::{support_on_queue, PlannedSubmission, SemaphoreRef, SubmissionPlan};
use crate::{
    context::{TestContext, TestParams},
    operation::OperationContext,
    provider::Provider,
    schedule::{self, IdleGuard, ReadWritePair},
    sync::{CommandBuffer, Fence, Semaphore, SemaphoreKind, SynchronizationType},
    verify, Result, TestError,
};
use log::debug;
use rand::{rngs::StdRng, Rng, SeedableRng};
use smallvec::SmallVec;
use std::{fmt, sync::Arc};

/// The elements of one submit info.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ImplicitShape {
    Wait,
    WaitCommandBuffers,
    WaitSignal,
    WaitCommandBuffersSignal,
}

impl ImplicitShape {
    pub const ALL: [ImplicitShape; 4] = [
        ImplicitShape::Wait,
        ImplicitShape::WaitCommandBuffers,
        ImplicitShape::WaitSignal,
        ImplicitShape::WaitCommandBuffersSignal,
    ];

    #[inline]
    pub const fn index(self) -> usize {
        self as usize
    }

    #[inline]
    pub const fn has_command_buffers(self) -> bool {
        matches!(
            self,
            ImplicitShape::WaitCommandBuffers | ImplicitShape::WaitCommandBuffersSignal,
        )
    }

    #[inline]
    pub const fn has_signals(self) -> bool {
        matches!(
            self,
            ImplicitShape::WaitSignal | ImplicitShape::WaitCommandBuffersSignal,
        )
    }
}

/// Four submit-info shapes, handed to the device together.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct SubmitInfoCombinatorics {
    pub shapes: [ImplicitShape; 4],
}

impl SubmitInfoCombinatorics {
    /// Returns every combination of four shapes.
    pub fn all() -> Vec<SubmitInfoCombinatorics> {
        let mut combinations = Vec::with_capacity(256);

        for a in ImplicitShape::ALL {
            for b in ImplicitShape::ALL {
                for c in ImplicitShape::ALL {
                    for d in ImplicitShape::ALL {
                        combinations.push(SubmitInfoCombinatorics {
                            shapes: [a, b, c, d],
                        });
                    }
                }
            }
        }

        combinations
    }

    /// Returns the shape indices as digits, for example `"0312"`.
    pub fn name(&self) -> String {
        self.shapes
            .iter()
            .map(|shape| char::from(b'0' + shape.index() as u8))
            .collect()
    }

    /// Builds the batch, submits it and checks every read against its write.
    pub fn run(&self, context: &TestContext, params: &TestParams) -> Result {
        let batch = self.build(context, params)?;
        batch.submit()?;
        batch.verify()
    }

    pub fn build(&self, context: &TestContext, params: &TestParams) -> Result<ImplicitBatch> {
        ImplicitBatch::build(context, params, &self.shapes)
    }
}

impl fmt::Display for SubmitInfoCombinatorics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name())
    }
}

/// How many elements each list of one shaped info has.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct InfoCounts {
    waits: usize,
    command_buffers: usize,
    signals: usize,
}

impl InfoCounts {
    fn new(shape: ImplicitShape, rng: &mut impl Rng) -> Self {
        let waits = rng.gen_range(2..=10);
        let command_buffers = if shape.has_command_buffers() {
            rng.gen_range(2..=10)
        } else {
            0
        };
        let signals = if shape.has_signals() {
            rng.gen_range(2..=10)
        } else {
            0
        };

        InfoCounts {
            waits,
            command_buffers,
            signals,
        }
    }
}

/// Hands out semaphores and the values signaled on them.
///
/// Timeline lists get one semaphore per list and increasing values starting above 2. Binary
/// lists get one semaphore per entry.
struct SemaphoreAllocator<'r, R> {
    kind: SemaphoreKind,
    count: usize,
    rng: &'r mut R,
}

impl<R: Rng> SemaphoreAllocator<'_, R> {
    fn signal_list(&mut self, len: usize) -> SmallVec<[SemaphoreRef; 2]> {
        match self.kind {
            SemaphoreKind::Timeline => {
                let semaphore = self.count;
                self.count += 1;

                let mut value = 2;

                (0..len)
                    .map(|_| {
                        value += self.rng.gen_range(1..=100);

                        SemaphoreRef::new(semaphore, value)
                    })
                    .collect()
            }
            SemaphoreKind::Binary => (0..len)
                .map(|_| {
                    let semaphore = self.count;
                    self.count += 1;

                    SemaphoreRef::new(semaphore, 0)
                })
                .collect(),
        }
    }
}

/// The objects and the plan of one combination.
pub struct ImplicitBatch {
    guard: IdleGuard,
    sync_type: SynchronizationType,
    fence: Fence,
    command_buffers: Vec<CommandBuffer>,
    pairs: Vec<ReadWritePair>,
    semaphores: Vec<Semaphore>,
    plan: SubmissionPlan,
    provider: Arc<dyn Provider>,
    long_timeout: std::time::Duration,
}

impl ImplicitBatch {
    fn build(
        context: &TestContext,
        params: &TestParams,
        shapes: &[ImplicitShape],
    ) -> Result<Self> {
        let provider = context.provider();
        let queue = context.universal_queue()?;

        if params.semaphore_kind.is_timeline() && !provider.enabled_features().timeline_semaphore
        {
            return Err(TestError::not_supported(
                "the `timeline_semaphore` feature is not supported",
            ));
        }

        let write_support = support_on_queue(context, params.write, &params.resource, &queue)?;
        let read_support = support_on_queue(context, params.read, &params.resource, &queue)?;

        let mut rng = StdRng::seed_from_u64(params.seed);
        let counts = shapes
            .iter()
            .map(|&shape| InfoCounts::new(shape, &mut rng))
            .collect::<Vec<_>>();
        let pair_count: usize = counts.iter().map(|counts| counts.command_buffers).sum();

        let operations = OperationContext::new(provider, params.sync_type, params.seed);
        let pairs = (0..pair_count)
            .map(|_| {
                ReadWritePair::new(
                    &operations,
                    &write_support,
                    &read_support,
                    &[queue.family_index],
                )
            })
            .collect::<Result<Vec<_>>>()?;

        // Writes first, then reads, so that pair `i` owns command buffers `i` and
        // `pair_count + i`.
        let mut command_buffers = Vec::with_capacity(2 * pair_count);

        for pair in &pairs {
            let command_buffer = CommandBuffer::new(provider, queue.family_index)?;
            command_buffer.record(|cb| pair.record_write(params.sync_type, cb))?;
            command_buffers.push(command_buffer);
        }

        for pair in &pairs {
            let command_buffer = CommandBuffer::new(provider, queue.family_index)?;
            command_buffer.record(|cb| pair.read.record_commands(cb))?;
            command_buffers.push(command_buffer);
        }

        let handles = command_buffers
            .iter()
            .map(CommandBuffer::handle)
            .collect::<Vec<_>>();
        let (writes, reads) = handles.split_at(pair_count);

        let mut allocator = SemaphoreAllocator {
            kind: params.semaphore_kind,
            count: 0,
            rng: &mut rng,
        };
        let mut producers = Vec::with_capacity(counts.len());
        let mut shaped = Vec::with_capacity(counts.len());
        let mut consumers = Vec::new();
        let mut next_pair = 0;

        for counts in &counts {
            let producer_signals = allocator.signal_list(counts.waits);
            let shaped_signals = allocator.signal_list(counts.signals);
            let pair_range = next_pair..next_pair + counts.command_buffers;
            next_pair = pair_range.end;

            producers.push(PlannedSubmission {
                queue,
                command_buffers: writes[pair_range.clone()].iter().copied().collect(),
                waits: SmallVec::new(),
                signals: producer_signals.clone(),
            });

            if !shaped_signals.is_empty() {
                consumers.push(PlannedSubmission {
                    queue,
                    command_buffers: SmallVec::new(),
                    waits: shaped_signals.clone(),
                    signals: SmallVec::new(),
                });
            }

            shaped.push(PlannedSubmission {
                queue,
                command_buffers: reads[pair_range].iter().copied().collect(),
                waits: producer_signals,
                signals: shaped_signals,
            });
        }

        let semaphore_count = allocator.count;

        let mut plan = SubmissionPlan::new(params.semaphore_kind);
        plan.submissions.extend(producers);
        plan.submissions.extend(shaped);
        plan.submissions.extend(consumers);
        plan.validate_edges()?;

        debug!(
            "implicit batch of {} submit info(s), {} write/read pair(s), {} semaphore(s)",
            plan.len(),
            pair_count,
            semaphore_count,
        );

        let semaphores = (0..semaphore_count)
            .map(|_| Semaphore::new(provider, params.semaphore_kind, 0))
            .collect::<Result<Vec<_>>>()?;

        Ok(ImplicitBatch {
            guard: IdleGuard::new(provider),
            sync_type: params.sync_type,
            fence: Fence::new(provider, false)?,
            command_buffers,
            pairs,
            semaphores,
            plan,
            provider: provider.clone(),
            long_timeout: context.config().long_timeout(),
        })
    }

    #[inline]
    pub fn plan(&self) -> &SubmissionPlan {
        &self.plan
    }

    /// Submits the whole batch in one `queue_submit` and waits for its fence.
    pub fn submit(&self) -> Result {
        schedule::submit_plan_batched(
            &self.provider,
            self.sync_type,
            &self.plan,
            &self.semaphores,
            self.fence.handle(),
        )?;

        self.fence
            .wait(self.long_timeout)?
            .expect_signaled("vkWaitForFences")
    }

    /// Compares the read of every pair with its write.
    pub fn verify(&self) -> Result {
        let results = self
            .pairs
            .iter()
            .map(|pair| {
                Ok(verify::compare(
                    pair.resource.kind(),
                    &pair.write.get_data()?,
                    &pair.read.get_data()?,
                ))
            })
            .collect::<Result<Vec<_>>>()?;

        verify::first_failure(&results)?;

        Ok(())
    }
}

impl fmt::Debug for ImplicitBatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ImplicitBatch")
            .field("guard", &self.guard)
            .field("pairs", &self.pairs.len())
            .field("command_buffers", &self.command_buffers.len())
            .field("plan", &self.plan)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_combination_once() {
        let all = SubmitInfoCombinatorics::all();
        let names = all
            .iter()
            .map(SubmitInfoCombinatorics::name)
            .collect::<std::collections::HashSet<_>>();

        assert_eq!(all.len(), 256);
        assert_eq!(names.len(), 256);
        assert!(names.contains("0000"));
        assert!(names.contains("3333"));
        assert_eq!(all[27].name(), "0123");
    }

    #[test]
    fn counts_follow_shape() {
        let mut rng = StdRng::seed_from_u64(7);

        for _ in 0..100 {
            for shape in ImplicitShape::ALL {
                let counts = InfoCounts::new(shape, &mut rng);

                assert!((2..=10).contains(&counts.waits));
                assert_eq!(counts.command_buffers != 0, shape.has_command_buffers());
                assert_eq!(counts.signals != 0, shape.has_signals());

                if shape.has_command_buffers() {
                    assert!((2..=10).contains(&counts.command_buffers));
                }

                if shape.has_signals() {
                    assert!((2..=10).contains(&counts.signals));
                }
            }
        }
    }

    #[test]
    fn timeline_lists_share_a_semaphore() {
        let mut rng = StdRng::seed_from_u64(3);
        let mut allocator = SemaphoreAllocator {
            kind: SemaphoreKind::Timeline,
            count: 0,
            rng: &mut rng,
        };

        let first = allocator.signal_list(5);
        let second = allocator.signal_list(3);

        assert_eq!(allocator.count, 2);
        assert!(first.iter().all(|signal| signal.semaphore == 0));
        assert!(second.iter().all(|signal| signal.semaphore == 1));
        assert!(first[0].value > 2 && first[0].value <= 102);
        assert!(first.windows(2).all(|w| w[0].value < w[1].value));
    }

    #[test]
    fn binary_entries_get_a_semaphore_each() {
        let mut rng = StdRng::seed_from_u64(3);
        let mut allocator = SemaphoreAllocator {
            kind: SemaphoreKind::Binary,
            count: 0,
            rng: &mut rng,
        };

        let first = allocator.signal_list(4);
        let second = allocator.signal_list(2);

        assert_eq!(allocator.count, 6);
        assert_eq!(
            first.iter().chain(&second).map(|s| s.semaphore).collect::<Vec<_>>(),
            [0, 1, 2, 3, 4, 5],
        );
        assert!(first.iter().all(|signal| signal.value == 0));
    }
}
