//! Per-frame render task queue.
//!
//! Tasks are collected in submission order into a fixed-capacity buffer,
//! sorted by depth with submission order breaking ties, and grouped into
//! batches of consecutive tasks that bind the same device resource.

mod sort;

use std::ops::Range;

use render_protocol::{Color, QuadVertex, TextureBinding};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use sort::merge_sort_by;

pub const DEFAULT_TASK_CAPACITY: usize = 8192;

/// What a task is filled with.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum TaskFill {
    /// Flat color. Drawn through a white texel.
    Solid(Color),
    Textured { binding: TextureBinding, tint: Color },
}

impl TaskFill {
    pub const fn color(self) -> Color {
        match self {
            TaskFill::Solid(color) => color,
            TaskFill::Textured { tint, .. } => tint,
        }
    }

    pub const fn binding(self) -> Option<TextureBinding> {
        match self {
            TaskFill::Solid(_) => None,
            TaskFill::Textured { binding, .. } => Some(binding),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RenderTask {
    pub vertices: [QuadVertex; 4],
    pub fill: TaskFill,
    pub depth: f32,
    pub submission_index: u32,
}

/// How sorted tasks are split into batches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CoalesceMode {
    /// A new batch whenever the atlas layer, palette slot or standalone
    /// texture changes.
    #[default]
    PerResource,
    /// Atlas tasks read their layer and palette slot from vertex
    /// attributes, so consecutive atlas tasks share one batch whatever
    /// layer they sit in.
    SharedAtlas,
}

/// Resource bound for one batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BatchResource {
    Solid,
    Bound(TextureBinding),
    /// Any atlas layer, under [`CoalesceMode::SharedAtlas`].
    Atlas,
}

impl BatchResource {
    fn of(fill: TaskFill, mode: CoalesceMode) -> Self {
        match (fill, mode) {
            (TaskFill::Solid(_), _) => BatchResource::Solid,
            (
                TaskFill::Textured {
                    binding: TextureBinding::Atlas { .. },
                    ..
                },
                CoalesceMode::SharedAtlas,
            ) => BatchResource::Atlas,
            (TaskFill::Textured { binding, .. }, _) => BatchResource::Bound(binding),
        }
    }
}

/// Consecutive sorted tasks that bind the same resource.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DrawBatch {
    pub resource: BatchResource,
    pub tasks: Range<usize>,
}

impl DrawBatch {
    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum BatchError {
    #[error("render task queue full ({capacity} tasks), task dropped")]
    Full { capacity: usize },
}

#[derive(Debug)]
pub struct BatchQueue {
    tasks: Vec<RenderTask>,
    scratch: Vec<RenderTask>,
    batches: Vec<DrawBatch>,
    capacity: usize,
    mode: CoalesceMode,
    next_submission: u32,
    dropped: u32,
    overflow_warnings: u64,
    overflow_warned: bool,
    flushed: bool,
}

impl BatchQueue {
    pub fn with_capacity(capacity: usize) -> Self {
        Self::with_mode(capacity, CoalesceMode::default())
    }

    pub fn with_mode(capacity: usize, mode: CoalesceMode) -> Self {
        Self {
            tasks: Vec::with_capacity(capacity),
            scratch: Vec::with_capacity(capacity),
            batches: Vec::new(),
            capacity,
            mode,
            next_submission: 0,
            dropped: 0,
            overflow_warnings: 0,
            overflow_warned: false,
            flushed: false,
        }
    }

    /// Queues a quad and returns its submission index. When the queue is
    /// full the task is dropped; only the first drop of a frame is logged.
    pub fn submit(
        &mut self,
        vertices: [QuadVertex; 4],
        fill: TaskFill,
        depth: f32,
    ) -> Result<u32, BatchError> {
        if self.tasks.len() >= self.capacity {
            self.dropped += 1;
            if !self.overflow_warned {
                self.overflow_warned = true;
                self.overflow_warnings += 1;
                log::warn!(
                    "render task queue full ({} tasks), dropping the rest of this frame",
                    self.capacity
                );
            }
            return Err(BatchError::Full {
                capacity: self.capacity,
            });
        }

        let submission_index = self.next_submission;
        self.next_submission += 1;
        self.tasks.push(RenderTask {
            vertices,
            fill,
            depth,
            submission_index,
        });
        self.flushed = false;
        Ok(submission_index)
    }

    /// Sorts the queued tasks and groups them into batches. Calling it again
    /// without new submissions returns the same batches.
    pub fn flush(&mut self) -> &[DrawBatch] {
        if !self.flushed {
            merge_sort_by(&mut self.tasks, &mut self.scratch, |a, b| {
                a.depth
                    .total_cmp(&b.depth)
                    .then(a.submission_index.cmp(&b.submission_index))
                    .is_lt()
            });
            self.coalesce();
            self.flushed = true;
        }
        &self.batches
    }

    /// Batches from the last [`BatchQueue::flush`].
    pub fn batches(&self) -> &[DrawBatch] {
        &self.batches
    }

    /// Tasks in draw order after [`BatchQueue::flush`]; submission order
    /// before it.
    pub fn sorted_tasks(&self) -> &[RenderTask] {
        &self.tasks
    }

    /// Drops queued tasks and batches but keeps the frame's drop count and
    /// overflow state, so a frame rendered in several passes still warns
    /// once.
    pub fn clear_tasks(&mut self) {
        self.tasks.clear();
        self.batches.clear();
        self.flushed = false;
    }

    /// Starts a new frame.
    pub fn clear(&mut self) {
        self.tasks.clear();
        self.batches.clear();
        self.next_submission = 0;
        self.dropped = 0;
        self.overflow_warned = false;
        self.flushed = false;
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn mode(&self) -> CoalesceMode {
        self.mode
    }

    pub fn dropped_this_frame(&self) -> u32 {
        self.dropped
    }

    /// Overflow warnings logged since the queue was created.
    pub fn overflow_warnings(&self) -> u64 {
        self.overflow_warnings
    }

    fn coalesce(&mut self) {
        self.batches.clear();
        for (index, task) in self.tasks.iter().enumerate() {
            let resource = BatchResource::of(task.fill, self.mode);
            if let Some(batch) = self.batches.last_mut()
                && batch.resource == resource
            {
                batch.tasks.end = index + 1;
                continue;
            }
            self.batches.push(DrawBatch {
                resource,
                tasks: index..index + 1,
            });
        }
    }
}
