//! The state of a soft device and the engine that executes its queues.
//!
//! Nothing runs in the background. Every call that can unblock work (a submission, a host
//! signal, setting an event) runs [`State::progress`] before it returns, which executes every
//! batch whose waits are satisfied until no queue can move any more. A queue executes its
//! batches in submission order, one command at a time; a batch that reaches a
//! `vkCmdWaitEvents` on an event that isn't set stops there and resumes from the same command
//! later.

use crate::{
    command::{Barriers, Command, Launch},
    object::{
        Buffer, CommandBuffer, Event, Fence, Image, Pipeline, Semaphore, ShaderModule,
    },
    program::{Program, INDEX_SIZE, VERTEX_SIZE},
    Faults,
};
use ash::{
    prelude::VkResult,
    vk::{self, Handle},
};
use crossbeam_queue::SegQueue;
use foldhash::HashMap;
use log::{debug, trace};
use smallvec::SmallVec;
use std::{collections::VecDeque, mem::size_of, sync::Arc};
use vksync::{
    provider::PipelineBinding,
    resource::{
        clear_color_texel, DispatchIndirectCommand, DrawIndexedIndirectCommand,
        DrawIndirectCommand,
    },
};

/// Validation messages, in the order they were reported.
#[derive(Debug, Default)]
pub(crate) struct Messages {
    queue: SegQueue<String>,
}

impl Messages {
    pub(crate) fn report(&self, message: String) {
        debug!("validation: {message}");
        self.queue.push(message);
    }

    pub(crate) fn drain(&self) -> Vec<String> {
        std::iter::from_fn(|| self.queue.pop()).collect()
    }
}

/// One semaphore wait or signal of a batch. The value is ignored for binary semaphores.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct SemaphoreOp {
    pub(crate) semaphore: vk::Semaphore,
    pub(crate) value: u64,
}

/// A submitted batch, as far as it has executed.
#[derive(Debug, Default)]
pub(crate) struct Batch {
    pub(crate) waits: SmallVec<[SemaphoreOp; 4]>,
    pub(crate) command_buffers: SmallVec<[vk::CommandBuffer; 1]>,
    pub(crate) signals: SmallVec<[SemaphoreOp; 4]>,
    fence: Option<vk::Fence>,
    // What the command buffers held when the batch was submitted.
    recorded: SmallVec<[Arc<[Command]>; 1]>,
    waited: bool,
    // The next command to execute: command buffer index, then command index.
    cursor: (usize, usize),
}

impl Batch {
    pub(crate) fn new(
        waits: SmallVec<[SemaphoreOp; 4]>,
        command_buffers: SmallVec<[vk::CommandBuffer; 1]>,
        signals: SmallVec<[SemaphoreOp; 4]>,
    ) -> Self {
        Batch {
            waits,
            command_buffers,
            signals,
            ..Default::default()
        }
    }
}

#[derive(Debug)]
pub(crate) struct QueueState {
    pub(crate) handle: vk::Queue,
    pub(crate) family_index: u32,
    pending: VecDeque<Batch>,
}

impl QueueState {
    pub(crate) fn new(handle: vk::Queue, family_index: u32) -> Self {
        QueueState {
            handle,
            family_index,
            pending: VecDeque::new(),
        }
    }

    #[inline]
    pub(crate) fn is_idle(&self) -> bool {
        self.pending.is_empty()
    }
}

enum Step {
    Complete,
    Blocked { advanced: bool },
}

/// How many invocations a launch makes, and how many vertices or indices each instance
/// fetches.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct LaunchSize {
    invocations: u64,
    elements: u64,
}

pub(crate) struct State {
    pub(crate) messages: Arc<Messages>,
    faults: Faults,
    max_value_difference: u64,
    next_handle: u64,
    pub(crate) queues: Vec<QueueState>,
    pub(crate) buffers: HashMap<vk::Buffer, Buffer>,
    pub(crate) images: HashMap<vk::Image, Image>,
    pub(crate) semaphores: HashMap<vk::Semaphore, Semaphore>,
    pub(crate) fences: HashMap<vk::Fence, Fence>,
    pub(crate) events: HashMap<vk::Event, Event>,
    pub(crate) shader_modules: HashMap<vk::ShaderModule, ShaderModule>,
    pub(crate) pipelines: HashMap<vk::Pipeline, Pipeline>,
    pub(crate) command_buffers: HashMap<vk::CommandBuffer, CommandBuffer>,
}

impl State {
    pub(crate) fn new(
        messages: Arc<Messages>,
        faults: Faults,
        max_value_difference: u64,
    ) -> Self {
        State {
            messages,
            faults,
            max_value_difference,
            next_handle: 0,
            queues: Vec::new(),
            buffers: HashMap::default(),
            images: HashMap::default(),
            semaphores: HashMap::default(),
            fences: HashMap::default(),
            events: HashMap::default(),
            shader_modules: HashMap::default(),
            pipelines: HashMap::default(),
            command_buffers: HashMap::default(),
        }
    }

    /// Returns a handle that was never returned before.
    pub(crate) fn new_handle<H: Handle>(&mut self) -> H {
        self.next_handle += 1;

        H::from_raw(self.next_handle)
    }

    #[inline]
    pub(crate) fn report(&self, message: String) {
        self.messages.report(message);
    }

    pub(crate) fn queue_index(&self, queue: vk::Queue) -> VkResult<usize> {
        self.queues
            .iter()
            .position(|state| state.handle == queue)
            .ok_or(vk::Result::ERROR_UNKNOWN)
    }

    /// Returns whether every queue has executed everything submitted to it.
    pub(crate) fn is_idle(&self) -> bool {
        self.queues.iter().all(QueueState::is_idle)
    }

    /// Returns whether a pending batch waits on or signals `semaphore`.
    pub(crate) fn semaphore_in_use(&self, semaphore: vk::Semaphore) -> bool {
        self.queues
            .iter()
            .flat_map(|queue| &queue.pending)
            .flat_map(|batch| batch.waits.iter().chain(&batch.signals))
            .any(|op| op.semaphore == semaphore)
    }

    /// Returns whether a pending batch signals `fence`.
    pub(crate) fn fence_in_use(&self, fence: vk::Fence) -> bool {
        self.queues
            .iter()
            .flat_map(|queue| &queue.pending)
            .any(|batch| batch.fence == Some(fence))
    }

    /// Validates and enqueues the batches of one submission.
    ///
    /// Nothing is enqueued if any batch is malformed; misuse that a real device would only
    /// notice while executing is reported and the batches are enqueued anyway.
    pub(crate) fn submit(
        &mut self,
        queue: vk::Queue,
        batches: Vec<Batch>,
        fence: vk::Fence,
    ) -> VkResult<()> {
        let queue_index = self.queue_index(queue)?;
        let family_index = self.queues[queue_index].family_index;

        for batch in &batches {
            for command_buffer in &batch.command_buffers {
                let Some(state) = self.command_buffers.get(command_buffer) else {
                    self.report(format!("{command_buffer:?} was submitted after it was freed"));
                    return Err(vk::Result::ERROR_VALIDATION_FAILED_EXT);
                };

                if state.state != crate::object::CommandBufferState::Executable {
                    self.report(format!(
                        "{command_buffer:?} was submitted in the {:?} state",
                        state.state,
                    ));
                    return Err(vk::Result::ERROR_VALIDATION_FAILED_EXT);
                }

                if state.queue_family_index != family_index {
                    self.report(format!(
                        "{command_buffer:?} was allocated for queue family {} but submitted to \
                        queue family {family_index}",
                        state.queue_family_index,
                    ));
                    return Err(vk::Result::ERROR_VALIDATION_FAILED_EXT);
                }
            }

            for op in batch.waits.iter().chain(&batch.signals) {
                if !self.semaphores.contains_key(&op.semaphore) {
                    self.report(format!("{:?} doesn't exist", op.semaphore));
                    return Err(vk::Result::ERROR_VALIDATION_FAILED_EXT);
                }
            }
        }

        if fence != vk::Fence::null() {
            match self.fences.get(&fence) {
                None => {
                    self.report(format!("{fence:?} doesn't exist"));
                    return Err(vk::Result::ERROR_VALIDATION_FAILED_EXT);
                }
                Some(state) if state.signaled || self.fence_in_use(fence) => {
                    self.report(format!("{fence:?} was submitted while it's signaled or pending"));
                    return Err(vk::Result::ERROR_VALIDATION_FAILED_EXT);
                }
                Some(_) => {}
            }
        }

        let batch_count = batches.len();

        for mut batch in batches {
            self.claim_semaphores(&batch);

            for command_buffer in &batch.command_buffers {
                if let Some(state) = self.command_buffers.get_mut(command_buffer) {
                    state.pending += 1;
                    batch.recorded.push(state.recorded.clone());
                }
            }

            debug!(
                "{queue:?}: enqueued a batch with {} wait(s), {} command buffer(s) and {} \
                signal(s)",
                batch.waits.len(),
                batch.command_buffers.len(),
                batch.signals.len(),
            );

            self.queues[queue_index].pending.push_back(batch);
        }

        if fence != vk::Fence::null() {
            let pending = &mut self.queues[queue_index].pending;

            if batch_count == 0 {
                pending.push_back(Batch {
                    fence: Some(fence),
                    ..Default::default()
                });
            } else if let Some(last) = pending.back_mut() {
                last.fence = Some(fence);
            }
        }

        Ok(())
    }

    /// Checks the semaphore operations of a batch as it's enqueued.
    ///
    /// Every binary wait consumes one signal operation that was submitted earlier, and a wait
    /// with none left to consume is reported. A timeline signal is reported if its value is more
    /// than `max_value_difference` ahead of the counter at submit time.
    fn claim_semaphores(&mut self, batch: &Batch) {
        for wait in &batch.waits {
            let Some(semaphore) = self.semaphores.get_mut(&wait.semaphore) else {
                continue;
            };

            if semaphore.is_timeline() {
                continue;
            }

            if semaphore.unclaimed_signals == 0 {
                self.messages.report(format!(
                    "a batch waits on binary {:?}, but no signal operation was submitted for it",
                    wait.semaphore,
                ));
            } else {
                semaphore.unclaimed_signals -= 1;
            }
        }

        for signal in &batch.signals {
            let Some(semaphore) = self.semaphores.get_mut(&signal.semaphore) else {
                continue;
            };

            if !semaphore.is_timeline() {
                semaphore.unclaimed_signals += 1;
            } else if signal.value.saturating_sub(semaphore.value) > self.max_value_difference {
                self.messages.report(format!(
                    "signaling {} on {:?} is more than the maximum difference away from its \
                    counter {}",
                    signal.value, signal.semaphore, semaphore.value,
                ));
            }
        }
    }

    /// Signals a timeline semaphore from the host.
    ///
    /// Binary and destroyed semaphores are rejected. A value that doesn't exceed the counter is
    /// reported and leaves the counter alone.
    pub(crate) fn host_signal(&mut self, semaphore: vk::Semaphore, value: u64) -> VkResult<()> {
        let Some(state) = self.semaphores.get_mut(&semaphore) else {
            self.messages
                .report(format!("{semaphore:?} was signaled after it was destroyed"));
            return Err(vk::Result::ERROR_VALIDATION_FAILED_EXT);
        };

        if !state.is_timeline() {
            self.messages
                .report(format!("binary {semaphore:?} was signaled from the host"));
            return Err(vk::Result::ERROR_VALIDATION_FAILED_EXT);
        }

        if value <= state.value {
            self.messages.report(format!(
                "the host signaled {value} on {semaphore:?}, which already reached {}",
                state.value,
            ));
        } else {
            trace!("host: {semaphore:?} = {value}");
            state.value = value;
        }

        Ok(())
    }

    /// Executes whatever can be executed.
    pub(crate) fn progress(&mut self) {
        loop {
            let mut advanced = false;

            for queue_index in 0..self.queues.len() {
                let family_index = self.queues[queue_index].family_index;

                while let Some(mut batch) = self.queues[queue_index].pending.pop_front() {
                    match self.execute_batch(family_index, &mut batch) {
                        Step::Complete => advanced = true,
                        Step::Blocked { advanced: moved } => {
                            advanced |= moved;
                            self.queues[queue_index].pending.push_front(batch);
                            break;
                        }
                    }
                }
            }

            if !advanced {
                break;
            }
        }
    }

    /// Drops every pending batch, after a hang.
    pub(crate) fn abandon_pending_work(&mut self) -> usize {
        let mut abandoned = 0;

        for queue_index in 0..self.queues.len() {
            let pending = std::mem::take(&mut self.queues[queue_index].pending);
            abandoned += pending.len();

            for batch in pending {
                self.command_buffers_completed(&batch);
            }
        }

        abandoned
    }

    fn execute_batch(&mut self, family: u32, batch: &mut Batch) -> Step {
        let mut advanced = false;

        if !batch.waited {
            if !self.faults.ignore_semaphore_waits
                && !batch.waits.iter().all(|wait| self.is_satisfied(wait))
            {
                return Step::Blocked { advanced: false };
            }

            for wait in &batch.waits {
                if let Some(semaphore) = self.semaphores.get_mut(&wait.semaphore) {
                    if !semaphore.is_timeline() {
                        semaphore.signaled = false;
                    }
                }
            }

            batch.waited = true;
            advanced = true;
        }

        while let Some(commands) = batch.recorded.get(batch.cursor.0).cloned() {
            while let Some(command) = commands.get(batch.cursor.1) {
                if let Command::WaitEvents { events, .. } = command {
                    if !events.iter().all(|event| self.is_set(*event)) {
                        return Step::Blocked { advanced };
                    }
                }

                trace!("family {family}: {}", command.name());
                self.execute(family, command);
                batch.cursor.1 += 1;
                advanced = true;
            }

            batch.cursor = (batch.cursor.0 + 1, 0);
        }

        for signal in &batch.signals {
            self.signal(signal);
        }

        if let Some(fence) = batch.fence {
            match self.fences.get_mut(&fence) {
                Some(state) => state.signaled = true,
                None => self
                    .messages
                    .report(format!("{fence:?} was destroyed while it was pending")),
            }
        }

        self.command_buffers_completed(batch);

        Step::Complete
    }

    fn command_buffers_completed(&mut self, batch: &Batch) {
        for command_buffer in &batch.command_buffers {
            if let Some(state) = self.command_buffers.get_mut(command_buffer) {
                state.pending = state.pending.saturating_sub(1);
            }
        }
    }

    /// Returns whether a wait can complete. A wait on a destroyed semaphore is reported and
    /// counts as satisfied so that the queue doesn't hang.
    fn is_satisfied(&self, wait: &SemaphoreOp) -> bool {
        match self.semaphores.get(&wait.semaphore) {
            Some(semaphore) if semaphore.is_timeline() => semaphore.value >= wait.value,
            Some(semaphore) => semaphore.signaled,
            None => {
                self.report(format!(
                    "{:?} was destroyed while a batch waited on it",
                    wait.semaphore,
                ));
                true
            }
        }
    }

    fn is_set(&self, event: vk::Event) -> bool {
        match self.events.get(&event) {
            Some(state) => state.set,
            None => {
                self.report(format!("{event:?} was destroyed while a batch waited on it"));
                true
            }
        }
    }

    /// Executes a signal operation of a batch.
    ///
    /// Timeline values must strictly increase; a stale value is reported and dropped. Signaling a
    /// binary semaphore that's already signaled is reported.
    fn signal(&mut self, signal: &SemaphoreOp) {
        let Some(semaphore) = self.semaphores.get_mut(&signal.semaphore) else {
            self.messages.report(format!(
                "{:?} was destroyed before a batch signaled it",
                signal.semaphore,
            ));
            return;
        };

        if semaphore.is_timeline() {
            if signal.value <= semaphore.value {
                self.messages.report(format!(
                    "a batch signaled {} on {:?}, which already reached {}",
                    signal.value, signal.semaphore, semaphore.value,
                ));
            } else {
                trace!("device: {:?} = {}", signal.semaphore, signal.value);
                semaphore.value = signal.value;
            }
        } else {
            if semaphore.signaled {
                self.messages.report(format!(
                    "binary {:?} was signaled while it was already signaled",
                    signal.semaphore,
                ));
            }

            semaphore.signaled = true;
        }
    }

    fn execute(&mut self, family: u32, command: &Command) {
        match command {
            Command::CopyBuffer { src, dst, regions } => {
                for region in regions {
                    if let Some(mut data) =
                        self.read_buffer(family, *src, region.src_offset, region.size)
                    {
                        self.corrupt(&mut data);
                        self.write_buffer(family, *dst, region.dst_offset, &data);
                    }
                }
            }
            Command::CopyImage {
                src,
                src_layout,
                dst,
                dst_layout,
                regions,
            } => {
                if !self.same_texel_size(*src, *dst) {
                    return;
                }

                for region in regions {
                    if let Some(mut data) = self.read_texels(
                        family,
                        *src,
                        *src_layout,
                        region.src_offset,
                        region.extent,
                    ) {
                        self.corrupt(&mut data);
                        self.write_texels(
                            family,
                            *dst,
                            *dst_layout,
                            region.dst_offset,
                            region.extent,
                            &data,
                        );
                    }
                }
            }
            Command::CopyBufferToImage {
                src,
                dst,
                dst_layout,
                regions,
            } => {
                for region in regions {
                    let Some(texel_size) = self.images.get(dst).map(|image| image.texel_size)
                    else {
                        self.report(format!("{dst:?} was destroyed while in use"));
                        continue;
                    };

                    if let Some(mut data) = self.gather_rows(family, *src, region, texel_size) {
                        self.corrupt(&mut data);
                        self.write_texels(
                            family,
                            *dst,
                            *dst_layout,
                            region.image_offset,
                            region.image_extent,
                            &data,
                        );
                    }
                }
            }
            Command::CopyImageToBuffer {
                src,
                src_layout,
                dst,
                regions,
            } => {
                for region in regions {
                    let Some(texel_size) = self.images.get(src).map(|image| image.texel_size)
                    else {
                        self.report(format!("{src:?} was destroyed while in use"));
                        continue;
                    };

                    if let Some(mut data) = self.read_texels(
                        family,
                        *src,
                        *src_layout,
                        region.image_offset,
                        region.image_extent,
                    ) {
                        self.corrupt(&mut data);
                        self.scatter_rows(family, *dst, region, texel_size, &data);
                    }
                }
            }
            Command::BlitImage {
                src,
                src_layout,
                dst,
                dst_layout,
                regions,
            } => {
                if !self.same_format(*src, *dst) {
                    return;
                }

                for region in regions {
                    self.blit(family, (*src, *src_layout), (*dst, *dst_layout), region);
                }
            }
            Command::FillBuffer {
                dst,
                offset,
                size,
                data,
            } => {
                let Some(length) = self.buffers.get(dst).map(|buffer| buffer.data.len() as u64)
                else {
                    self.report(format!("{dst:?} was destroyed while in use"));
                    return;
                };
                let size = if *size == vk::WHOLE_SIZE {
                    length.saturating_sub(*offset) & !3
                } else {
                    *size
                };
                let pattern = data.to_ne_bytes();
                let bytes = (0..size)
                    .map(|index| pattern[index as usize % 4])
                    .collect::<Vec<_>>();

                self.write_buffer(family, *dst, *offset, &bytes);
            }
            Command::UpdateBuffer { dst, offset, data } => {
                self.write_buffer(family, *dst, *offset, data);
            }
            Command::ClearColorImage {
                image,
                layout,
                color,
            } => {
                let Some(state) = self.touch_image(family, *image, Some(*layout)) else {
                    return;
                };

                match clear_color_texel(state.format, *color) {
                    Some(texel) => {
                        for chunk in state.data.chunks_exact_mut(texel.len()) {
                            chunk.copy_from_slice(&texel);
                        }
                    }
                    None => {
                        let format = state.format;
                        self.report(format!("{image:?} has format {format:?}, which can't be cleared"));
                    }
                }
            }
            Command::Launch { pipeline, launch } => self.launch(family, *pipeline, *launch),
            Command::Barrier(barriers) | Command::WaitEvents { barriers, .. } => {
                self.apply_barriers(family, barriers);
            }
            Command::SetEvent(event) | Command::ResetEvent(event) => {
                let set = matches!(command, Command::SetEvent(_));

                match self.events.get_mut(event) {
                    Some(state) => state.set = set,
                    None => self
                        .messages
                        .report(format!("{event:?} was destroyed while in use")),
                }
            }
        }
    }

    fn corrupt(&self, data: &mut [u8]) {
        if self.faults.corrupt_copies {
            if let Some(first) = data.first_mut() {
                *first = first.wrapping_add(1);
            }
        }
    }

    /// Records an access to a buffer from `family`.
    fn touch_buffer(&mut self, family: u32, handle: vk::Buffer) -> Option<&mut Buffer> {
        let Some(buffer) = self.buffers.get_mut(&handle) else {
            self.messages
                .report(format!("{handle:?} was destroyed while in use"));
            return None;
        };

        if let Err(owner) = buffer.ownership.access(family) {
            self.messages.report(format!(
                "{handle:?} is accessed on queue family {family} while queue family {owner} owns \
                it",
            ));
        }

        Some(buffer)
    }

    /// Records an access to an image from `family`, in `layout` if the access needs one.
    fn touch_image(
        &mut self,
        family: u32,
        handle: vk::Image,
        layout: Option<vk::ImageLayout>,
    ) -> Option<&mut Image> {
        let Some(image) = self.images.get_mut(&handle) else {
            self.messages
                .report(format!("{handle:?} was destroyed while in use"));
            return None;
        };

        if let Err(owner) = image.ownership.access(family) {
            self.messages.report(format!(
                "{handle:?} is accessed on queue family {family} while queue family {owner} owns \
                it",
            ));
        }

        if let Some(layout) = layout {
            if image.layout != layout {
                self.messages.report(format!(
                    "{handle:?} is used in {layout:?}, but it's in {:?}",
                    image.layout,
                ));
            }
        }

        Some(image)
    }

    fn read_buffer(
        &mut self,
        family: u32,
        handle: vk::Buffer,
        offset: vk::DeviceSize,
        size: vk::DeviceSize,
    ) -> Option<Vec<u8>> {
        let buffer = self.touch_buffer(family, handle)?;

        match buffer.range(offset, size) {
            Some(range) => Some(buffer.data[range].to_vec()),
            None => {
                let length = buffer.data.len();
                self.report(format!(
                    "reading {size} bytes at {offset} overruns {handle:?} ({length} bytes)",
                ));
                None
            }
        }
    }

    fn write_buffer(&mut self, family: u32, handle: vk::Buffer, offset: vk::DeviceSize, data: &[u8]) {
        let Some(buffer) = self.touch_buffer(family, handle) else {
            return;
        };

        match buffer.range(offset, data.len() as u64) {
            Some(range) => buffer.data[range].copy_from_slice(data),
            None => {
                let length = buffer.data.len();
                self.report(format!(
                    "writing {} bytes at {offset} overruns {handle:?} ({length} bytes)",
                    data.len(),
                ));
            }
        }
    }

    fn same_texel_size(&self, src: vk::Image, dst: vk::Image) -> bool {
        match (self.images.get(&src), self.images.get(&dst)) {
            (Some(src_image), Some(dst_image)) if src_image.texel_size == dst_image.texel_size => {
                true
            }
            (Some(_), Some(_)) => {
                self.report(format!("{src:?} and {dst:?} have different texel sizes"));
                false
            }
            _ => {
                self.report(format!("{src:?} or {dst:?} was destroyed while in use"));
                false
            }
        }
    }

    fn same_format(&self, src: vk::Image, dst: vk::Image) -> bool {
        match (self.images.get(&src), self.images.get(&dst)) {
            (Some(src_image), Some(dst_image)) if src_image.format == dst_image.format => true,
            (Some(_), Some(_)) => {
                self.report(format!(
                    "blits between {src:?} and {dst:?} would need a format conversion",
                ));
                false
            }
            _ => {
                self.report(format!("{src:?} or {dst:?} was destroyed while in use"));
                false
            }
        }
    }

    /// Returns the rows of texels in a box of an image, tightly packed.
    fn read_texels(
        &mut self,
        family: u32,
        handle: vk::Image,
        layout: vk::ImageLayout,
        offset: vk::Offset3D,
        extent: vk::Extent3D,
    ) -> Option<Vec<u8>> {
        let image = self.touch_image(family, handle, Some(layout))?;
        let rows = texel_rows(image, offset, extent);

        match rows {
            Some(rows) => Some(
                rows.into_iter()
                    .flat_map(|row| image.data[row].iter().copied())
                    .collect(),
            ),
            None => {
                self.report(format!("a copy region is outside of {handle:?}"));
                None
            }
        }
    }

    fn write_texels(
        &mut self,
        family: u32,
        handle: vk::Image,
        layout: vk::ImageLayout,
        offset: vk::Offset3D,
        extent: vk::Extent3D,
        data: &[u8],
    ) {
        let Some(image) = self.touch_image(family, handle, Some(layout)) else {
            return;
        };

        let Some(rows) = texel_rows(image, offset, extent) else {
            self.report(format!("a copy region is outside of {handle:?}"));
            return;
        };

        let mut source = data;

        for row in rows {
            let (head, tail) = source.split_at(row.len().min(source.len()));
            image.data[row.start..row.start + head.len()].copy_from_slice(head);
            source = tail;
        }
    }

    /// Reads the texels of a buffer/image copy region out of the buffer, tightly packed.
    fn gather_rows(
        &mut self,
        family: u32,
        handle: vk::Buffer,
        region: &vk::BufferImageCopy,
        texel_size: u32,
    ) -> Option<Vec<u8>> {
        let buffer = self.touch_buffer(family, handle)?;
        let rows = buffer_rows(region, texel_size)
            .map(|(offset, size)| buffer.range(offset, size))
            .collect::<Option<Vec<_>>>();

        match rows {
            Some(rows) => Some(
                rows.into_iter()
                    .flat_map(|row| buffer.data[row].iter().copied())
                    .collect(),
            ),
            None => {
                self.report(format!("a copy region is outside of {handle:?}"));
                None
            }
        }
    }

    fn scatter_rows(
        &mut self,
        family: u32,
        handle: vk::Buffer,
        region: &vk::BufferImageCopy,
        texel_size: u32,
        data: &[u8],
    ) {
        let Some(buffer) = self.touch_buffer(family, handle) else {
            return;
        };
        let Some(rows) = buffer_rows(region, texel_size)
            .map(|(offset, size)| buffer.range(offset, size))
            .collect::<Option<Vec<_>>>()
        else {
            self.report(format!("a copy region is outside of {handle:?}"));
            return;
        };

        let row_len = row_len(region, texel_size).max(1);

        for (row, chunk) in rows.into_iter().zip(data.chunks(row_len)) {
            buffer.data[row.start..row.start + chunk.len()].copy_from_slice(chunk);
        }
    }

    /// Nearest-neighbour blit of one region, sampling at texel centers.
    fn blit(
        &mut self,
        family: u32,
        (src, src_layout): (vk::Image, vk::ImageLayout),
        (dst, dst_layout): (vk::Image, vk::ImageLayout),
        region: &vk::ImageBlit,
    ) {
        let (src_offset, src_extent) = offset_extent(region.src_offsets);
        let (dst_offset, dst_extent) = offset_extent(region.dst_offsets);

        let Some(mut source) = self.read_texels(family, src, src_layout, src_offset, src_extent)
        else {
            return;
        };
        let Some(texel_size) = self.images.get(&src).map(|image| image.texel_size as usize)
        else {
            return;
        };

        self.corrupt(&mut source);

        let nearest = |dst_coordinate: u32, src_size: u32, dst_size: u32| -> usize {
            let scaled = (2 * u64::from(dst_coordinate) + 1) * u64::from(src_size)
                / (2 * u64::from(dst_size).max(1));

            scaled.min(u64::from(src_size.max(1) - 1)) as usize
        };

        let mut data = Vec::with_capacity(
            dst_extent.width as usize
                * dst_extent.height as usize
                * dst_extent.depth as usize
                * texel_size,
        );

        for z in 0..dst_extent.depth {
            for y in 0..dst_extent.height {
                for x in 0..dst_extent.width {
                    let sx = nearest(x, src_extent.width, dst_extent.width);
                    let sy = nearest(y, src_extent.height, dst_extent.height);
                    let sz = nearest(z, src_extent.depth, dst_extent.depth);
                    let index = (sz * src_extent.height as usize + sy) * src_extent.width as usize
                        + sx;
                    let start = index * texel_size;

                    match source.get(start..start + texel_size) {
                        Some(texel) => data.extend_from_slice(texel),
                        None => data.extend(std::iter::repeat(0).take(texel_size)),
                    }
                }
            }
        }

        self.write_texels(family, dst, dst_layout, dst_offset, dst_extent, &data);
    }

    fn apply_barriers(&mut self, family: u32, barriers: &Barriers) {
        for barrier in &barriers.buffers {
            let Some(buffer) = self.buffers.get_mut(&barrier.buffer) else {
                self.messages
                    .report(format!("{:?} was destroyed while in use", barrier.buffer));
                continue;
            };

            let Some(transfer) = barrier.transfer else {
                continue;
            };

            if family == transfer.src {
                if let Err(owner) = buffer.ownership.access(family) {
                    self.messages.report(format!(
                        "queue family {family} released {:?}, which queue family {owner} owns",
                        barrier.buffer,
                    ));
                }
            } else if family != transfer.dst {
                self.messages.report(format!(
                    "an ownership transfer of {:?} from {} to {} executed on queue family \
                    {family}",
                    barrier.buffer, transfer.src, transfer.dst,
                ));
            }

            buffer.ownership.transfer(transfer.dst);
        }

        for barrier in &barriers.images {
            let Some(image) = self.images.get_mut(&barrier.image) else {
                self.messages
                    .report(format!("{:?} was destroyed while in use", barrier.image));
                continue;
            };

            let acquire = barrier
                .transfer
                .is_some_and(|transfer| transfer.dst == family);

            match barrier.transfer {
                Some(transfer) if family != transfer.src && family != transfer.dst => {
                    self.messages.report(format!(
                        "an ownership transfer of {:?} from {} to {} executed on queue family \
                        {family}",
                        barrier.image, transfer.src, transfer.dst,
                    ));
                }
                Some(_) if acquire => {}
                _ if barrier.old_layout == vk::ImageLayout::UNDEFINED => {
                    // The contents are discarded, and so is the previous owner.
                    image.ownership.transfer(family);
                }
                _ => {
                    if let Err(owner) = image.ownership.access(family) {
                        self.messages.report(format!(
                            "{:?} is transitioned on queue family {family} while queue family \
                            {owner} owns it",
                            barrier.image,
                        ));
                    }
                }
            }

            // The layout transition of a transfer happens once, between the release and the
            // acquire.
            let transitioned = acquire && image.layout == barrier.new_layout;

            if !transitioned
                && barrier.old_layout != vk::ImageLayout::UNDEFINED
                && barrier.old_layout != image.layout
            {
                self.messages.report(format!(
                    "a barrier transitions {:?} from {:?}, but it's in {:?}",
                    barrier.image, barrier.old_layout, image.layout,
                ));
            }

            if barrier.new_layout != vk::ImageLayout::UNDEFINED {
                image.layout = barrier.new_layout;
            }

            if let Some(transfer) = barrier.transfer {
                image.ownership.transfer(transfer.dst);
            }
        }
    }

    /// Reads a `#[repr(C)]` indirect command out of a buffer.
    fn read_indirect<T: bytemuck::Pod>(
        &mut self,
        family: u32,
        buffer: vk::Buffer,
        offset: vk::DeviceSize,
    ) -> Option<T> {
        let bytes = self.read_buffer(family, buffer, offset, size_of::<T>() as u64)?;

        Some(bytemuck::pod_read_unaligned(&bytes))
    }

    fn launch_size(&mut self, family: u32, launch: Launch) -> Option<LaunchSize> {
        let size = match launch {
            Launch::Dispatch { x, y, z } => {
                let groups = u64::from(x) * u64::from(y) * u64::from(z);

                LaunchSize {
                    invocations: groups,
                    elements: groups,
                }
            }
            Launch::DispatchIndirect { buffer, offset } => {
                let DispatchIndirectCommand { x, y, z } =
                    self.read_indirect(family, buffer, offset)?;
                let groups = u64::from(x) * u64::from(y) * u64::from(z);

                LaunchSize {
                    invocations: groups,
                    elements: groups,
                }
            }
            Launch::Draw {
                vertex_count: count,
                instance_count,
            }
            | Launch::DrawIndexed {
                index_count: count,
                instance_count,
            } => LaunchSize {
                invocations: u64::from(count) * u64::from(instance_count),
                elements: u64::from(count),
            },
            Launch::DrawIndirect { buffer, offset } => {
                let command: DrawIndirectCommand = self.read_indirect(family, buffer, offset)?;

                LaunchSize {
                    invocations: u64::from(command.vertex_count)
                        * u64::from(command.instance_count),
                    elements: u64::from(command.vertex_count),
                }
            }
            Launch::DrawIndexedIndirect { buffer, offset } => {
                let command: DrawIndexedIndirectCommand =
                    self.read_indirect(family, buffer, offset)?;

                LaunchSize {
                    invocations: u64::from(command.index_count)
                        * u64::from(command.instance_count),
                    elements: u64::from(command.index_count),
                }
            }
        };

        Some(size)
    }

    fn launch(&mut self, family: u32, pipeline: vk::Pipeline, launch: Launch) {
        let Some(state) = self.pipelines.get(&pipeline) else {
            self.report(format!("{pipeline:?} was destroyed while in use"));
            return;
        };
        let program = state.program;
        let bindings = state.bindings.clone();

        let Some(size) = self.launch_size(family, launch) else {
            return;
        };

        use PipelineBinding as B;

        match (program, bindings.as_slice()) {
            (
                Program::CopyBuffer,
                [B::StorageBuffer(src) | B::UniformBuffer(src), B::StorageBuffer(dst)],
            ) => {
                if let Some(data) = self.whole_buffer(family, *src) {
                    self.write_prefix(family, *dst, &data);
                }
            }
            (Program::CopyBufferToImage, [B::StorageBuffer(src), B::StorageImage(dst)]) => {
                if let Some(data) = self.whole_buffer(family, *src) {
                    if let Some(image) =
                        self.touch_image(family, *dst, Some(vk::ImageLayout::GENERAL))
                    {
                        let length = data.len().min(image.data.len());
                        image.data[..length].copy_from_slice(&data[..length]);
                    }
                }
            }
            (Program::CopyImageToBuffer, [B::StorageImage(src), B::StorageBuffer(dst)]) => {
                if let Some(data) = self.whole_image(family, *src) {
                    self.write_prefix(family, *dst, &data);
                }
            }
            (Program::CopyImage, [B::StorageImage(src), B::StorageImage(dst)]) => {
                if let Some(data) = self.whole_image(family, *src) {
                    if let Some(image) =
                        self.touch_image(family, *dst, Some(vk::ImageLayout::GENERAL))
                    {
                        let length = data.len().min(image.data.len());
                        image.data[..length].copy_from_slice(&data[..length]);
                    }
                }
            }
            (Program::AtomicCounter, [B::StorageBuffer(counter), ..]) => {
                if let Some(bytes) = self.read_buffer(family, *counter, 0, 4) {
                    let value = bytemuck::pod_read_unaligned::<u32>(&bytes)
                        .wrapping_add(size.invocations as u32);

                    self.write_buffer(family, *counter, 0, bytemuck::bytes_of(&value));
                }
            }
            (Program::VertexFetch, [B::VertexBuffer(src), B::StorageBuffer(dst)]) => {
                if let Some(data) = self.read_buffer(family, *src, 0, size.elements * VERTEX_SIZE) {
                    self.write_buffer(family, *dst, 0, &data);
                }
            }
            (Program::IndexFetch, [B::IndexBuffer(src), B::StorageBuffer(dst)]) => {
                if let Some(data) = self.read_buffer(family, *src, 0, size.elements * INDEX_SIZE) {
                    self.write_buffer(family, *dst, 0, &data);
                }
            }
            _ => self.report(format!(
                "{pipeline:?} runs `{program}` with bindings it can't use",
            )),
        }
    }

    fn whole_buffer(&mut self, family: u32, handle: vk::Buffer) -> Option<Vec<u8>> {
        self.touch_buffer(family, handle)
            .map(|buffer| buffer.data.clone())
    }

    fn whole_image(&mut self, family: u32, handle: vk::Image) -> Option<Vec<u8>> {
        self.touch_image(family, handle, Some(vk::ImageLayout::GENERAL))
            .map(|image| image.data.clone())
    }

    /// Writes as much of `data` as fits at the start of a buffer.
    fn write_prefix(&mut self, family: u32, handle: vk::Buffer, data: &[u8]) {
        if let Some(buffer) = self.touch_buffer(family, handle) {
            let length = data.len().min(buffer.data.len());
            buffer.data[..length].copy_from_slice(&data[..length]);
        }
    }
}

/// Returns the byte ranges of the rows of texels in a box of an image, or `None` if the box
/// doesn't fit in the image.
fn texel_rows(
    image: &Image,
    offset: vk::Offset3D,
    extent: vk::Extent3D,
) -> Option<SmallVec<[std::ops::Range<usize>; 8]>> {
    let row_len = extent.width as usize * image.texel_size as usize;
    let mut rows = SmallVec::new();

    if extent.width == 0 {
        return Some(rows);
    }

    for z in 0..i64::from(extent.depth) {
        for y in 0..i64::from(extent.height) {
            let (x0, y0, z0) = (
                i64::from(offset.x),
                i64::from(offset.y) + y,
                i64::from(offset.z) + z,
            );

            // Both ends of the row must be inside the image.
            image.texel_offset(x0 + i64::from(extent.width) - 1, y0, z0)?;
            let start = image.texel_offset(x0, y0, z0)?;

            rows.push(start..start + row_len);
        }
    }

    Some(rows)
}

fn row_len(region: &vk::BufferImageCopy, texel_size: u32) -> usize {
    region.image_extent.width as usize * texel_size as usize
}

/// Returns the `(offset, size)` in the buffer of every row of a buffer/image copy region.
fn buffer_rows(
    region: &vk::BufferImageCopy,
    texel_size: u32,
) -> impl Iterator<Item = (u64, u64)> + '_ {
    let extent = region.image_extent;
    let row_length = if region.buffer_row_length == 0 {
        extent.width
    } else {
        region.buffer_row_length
    };
    let image_height = if region.buffer_image_height == 0 {
        extent.height
    } else {
        region.buffer_image_height
    };
    let texel_size = u64::from(texel_size);
    let size = u64::from(extent.width) * texel_size;

    (0..u64::from(extent.depth)).flat_map(move |z| {
        (0..u64::from(extent.height)).map(move |y| {
            let texel = (z * u64::from(image_height) + y) * u64::from(row_length);

            (region.buffer_offset + texel * texel_size, size)
        })
    })
}

/// Turns the corners of a blit region into an offset and an extent.
fn offset_extent(corners: [vk::Offset3D; 2]) -> (vk::Offset3D, vk::Extent3D) {
    let [a, b] = corners;
    let offset = vk::Offset3D {
        x: a.x.min(b.x),
        y: a.y.min(b.y),
        z: a.z.min(b.z),
    };
    let extent = vk::Extent3D {
        width: a.x.abs_diff(b.x),
        height: a.y.abs_diff(b.y),
        depth: a.z.abs_diff(b.z),
    };

    (offset, extent)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::Ownership;

    fn image(extent: [u32; 3], texel_size: u32) -> Image {
        let [width, height, depth] = extent;

        Image {
            format: vk::Format::R8G8B8A8_UNORM,
            extent: vk::Extent3D {
                width,
                height,
                depth,
            },
            texel_size,
            usage: vk::ImageUsageFlags::TRANSFER_DST,
            layout: vk::ImageLayout::GENERAL,
            ownership: Ownership::default(),
            data: vec![0; (width * height * depth * texel_size) as usize],
        }
    }

    #[test]
    fn rows_of_a_box() {
        let image = image([4, 4, 2], 4);
        let rows = texel_rows(
            &image,
            vk::Offset3D { x: 1, y: 2, z: 1 },
            vk::Extent3D {
                width: 2,
                height: 2,
                depth: 1,
            },
        )
        .unwrap();

        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0], (16 + 8 + 1) * 4..(16 + 8 + 3) * 4);
        assert_eq!(rows[1], (16 + 12 + 1) * 4..(16 + 12 + 3) * 4);
    }

    #[test]
    fn boxes_must_fit() {
        let image = image([4, 4, 1], 4);

        assert!(texel_rows(
            &image,
            vk::Offset3D { x: 3, y: 0, z: 0 },
            vk::Extent3D {
                width: 2,
                height: 1,
                depth: 1,
            },
        )
        .is_none());
    }

    #[test]
    fn tightly_packed_buffer_rows() {
        let region = vk::BufferImageCopy {
            buffer_offset: 64,
            image_extent: vk::Extent3D {
                width: 8,
                height: 2,
                depth: 2,
            },
            ..Default::default()
        };

        let rows = buffer_rows(&region, 4).collect::<Vec<_>>();

        assert_eq!(rows, [(64, 32), (96, 32), (128, 32), (160, 32)]);
    }

    #[test]
    fn padded_buffer_rows() {
        let region = vk::BufferImageCopy {
            buffer_row_length: 16,
            buffer_image_height: 4,
            image_extent: vk::Extent3D {
                width: 8,
                height: 2,
                depth: 2,
            },
            ..Default::default()
        };

        let rows = buffer_rows(&region, 1).collect::<Vec<_>>();

        assert_eq!(rows, [(0, 8), (16, 8), (64, 8), (80, 8)]);
    }

    #[test]
    fn blit_corners() {
        let (offset, extent) = offset_extent([
            vk::Offset3D { x: 8, y: 0, z: 0 },
            vk::Offset3D { x: 0, y: 4, z: 1 },
        ]);

        assert_eq!((offset.x, offset.y, offset.z), (0, 0, 0));
        assert_eq!((extent.width, extent.height, extent.depth), (8, 4, 1));
    }

    #[test]
    fn messages_drain_in_order() {
        let messages = Messages::default();
        messages.report("first".to_owned());
        messages.report("second".to_owned());

        assert_eq!(messages.drain(), ["first", "second"]);
        assert!(messages.drain().is_empty());
    }
}
