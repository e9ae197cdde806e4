use std::fmt;
use std::time::{Duration, Instant};

use crate::error::ConfigError;

/// Error produced by a task callback.
pub type TaskError = Box<dyn std::error::Error + Send + Sync>;

/// A task's callback.
///
/// Callbacks run at a safe point after the tracked event that fired them,
/// outside every engine lock and outside the reentrancy guard, so they may
/// allocate and call back into the engine.
pub type TaskCallback = Box<dyn FnMut() -> Result<(), TaskError> + Send>;

/// Handle to a scheduled task.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct TaskId(u64);

/// A deferred callback with its firing conditions.
///
/// A task fires when its delay elapses or when traced memory drifts out of
/// the band `[traced - threshold, traced + threshold]` computed at arming
/// time. At least one of the two triggers must be configured.
pub struct Task {
    callback: TaskCallback,
    repeat: Option<u32>,
    delay: Option<Duration>,
    memory_threshold: Option<usize>,
}

impl Task {
    /// Creates a task around its callback; at least one trigger must be
    /// added before scheduling.
    pub fn new(callback: impl FnMut() -> Result<(), TaskError> + Send + 'static) -> Self {
        Self {
            callback: Box::new(callback),
            repeat: None,
            delay: None,
            memory_threshold: None,
        }
    }

    /// Fires when this much time has passed since arming.
    #[must_use]
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Fires when traced memory moves this many bytes away from its value at
    /// arming time.
    #[must_use]
    pub fn with_memory_threshold(mut self, bytes: usize) -> Self {
        self.memory_threshold = Some(bytes);
        self
    }

    /// Limits how many times the task fires; unlimited by default.
    #[must_use]
    pub fn with_repeat(mut self, count: u32) -> Self {
        self.repeat = Some(count);
        self
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("repeat", &self.repeat)
            .field("delay", &self.delay)
            .field("memory_threshold", &self.memory_threshold)
            .finish_non_exhaustive()
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum TaskState {
    /// Waiting for a trigger condition.
    Armed,

    /// Queued for execution; disabled until the callback reports back.
    Firing,

    /// The callback failed; swept from the list on the next check.
    Failed,
}

struct ScheduledTask {
    id: TaskId,
    state: TaskState,

    /// Taken while the task is firing, restored when it re-arms.
    callback: Option<TaskCallback>,

    repeat: Option<u32>,
    delay: Option<Duration>,
    memory_threshold: Option<usize>,

    deadline: Option<Instant>,
    band: Option<(usize, usize)>,
}

impl ScheduledTask {
    fn arm(&mut self, traced: usize, now: Instant) {
        self.state = TaskState::Armed;
        self.deadline = self.delay.map(|delay| now + delay);
        self.band = self.memory_threshold.map(|threshold| band(traced, threshold));
    }

    fn is_due(&self, traced: usize, now: Instant) -> bool {
        if self.state != TaskState::Armed {
            return false;
        }

        self.deadline.is_some_and(|deadline| now >= deadline)
            || self
                .band
                .is_some_and(|(min, max)| traced <= min || traced >= max)
    }
}

fn band(traced: usize, threshold: usize) -> (usize, usize) {
    (
        traced.saturating_sub(threshold),
        traced.saturating_add(threshold),
    )
}

/// The ordered list of scheduled tasks.
///
/// Owned by the engine's shared state; every mutation happens under the
/// engine's outer lock with the reentrancy guard set, so list maintenance
/// never observes its own allocations as tracked events.
pub(crate) struct TaskList {
    next_id: u64,
    tasks: Vec<ScheduledTask>,
}

impl TaskList {
    pub(crate) fn new() -> Self {
        Self {
            next_id: 0,
            tasks: Vec::new(),
        }
    }

    pub(crate) fn schedule(
        &mut self,
        task: Task,
        traced: usize,
        now: Instant,
    ) -> Result<TaskId, ConfigError> {
        if task.delay == Some(Duration::ZERO) {
            return Err(ConfigError::ZeroDelay);
        }
        if task.memory_threshold == Some(0) {
            return Err(ConfigError::ZeroThreshold);
        }
        if task.delay.is_none() && task.memory_threshold.is_none() {
            return Err(ConfigError::NoTrigger);
        }
        if task.repeat == Some(0) {
            return Err(ConfigError::ZeroRepeat);
        }

        let id = TaskId(self.next_id);
        self.next_id = self
            .next_id
            .checked_add(1)
            .expect("task ids cannot be exhausted in practice");

        let mut scheduled = ScheduledTask {
            id,
            state: TaskState::Armed,
            callback: Some(task.callback),
            repeat: task.repeat,
            delay: task.delay,
            memory_threshold: task.memory_threshold,
            deadline: None,
            band: None,
        };
        scheduled.arm(traced, now);

        self.tasks.push(scheduled);
        Ok(id)
    }

    /// Removes a task in any state; a task already handed out for execution
    /// is dropped when its callback reports back.
    pub(crate) fn cancel(&mut self, id: TaskId) -> bool {
        let before = self.tasks.len();
        self.tasks.retain(|task| task.id != id);
        self.tasks.len() != before
    }

    pub(crate) fn is_scheduled(&self, id: TaskId) -> bool {
        self.tasks.iter().any(|task| task.id == id)
    }

    pub(crate) fn ids(&self) -> Vec<TaskId> {
        self.tasks.iter().map(|task| task.id).collect()
    }

    /// Updates a task's delay, re-arming it if it is armed.
    pub(crate) fn set_delay(
        &mut self,
        id: TaskId,
        delay: Duration,
        traced: usize,
        now: Instant,
    ) -> Result<bool, ConfigError> {
        if delay == Duration::ZERO {
            return Err(ConfigError::ZeroDelay);
        }

        let Some(task) = self.tasks.iter_mut().find(|task| task.id == id) else {
            return Ok(false);
        };

        task.delay = Some(delay);
        if task.state == TaskState::Armed {
            task.arm(traced, now);
        }
        Ok(true)
    }

    /// Updates a task's memory threshold, re-arming it if it is armed.
    pub(crate) fn set_memory_threshold(
        &mut self,
        id: TaskId,
        threshold: usize,
        traced: usize,
        now: Instant,
    ) -> Result<bool, ConfigError> {
        if threshold == 0 {
            return Err(ConfigError::ZeroThreshold);
        }

        let Some(task) = self.tasks.iter_mut().find(|task| task.id == id) else {
            return Ok(false);
        };

        task.memory_threshold = Some(threshold);
        if task.state == TaskState::Armed {
            task.arm(traced, now);
        }
        Ok(true)
    }

    /// Sweeps failed tasks, then hands out the callbacks of every due task.
    ///
    /// Handed-out tasks are marked firing and stay disabled until
    /// [`finish`](Self::finish) re-arms or retires them. The caller runs the
    /// callbacks outside all locks.
    pub(crate) fn take_due(
        &mut self,
        traced: usize,
        now: Instant,
    ) -> Vec<(TaskId, TaskCallback)> {
        self.tasks.retain(|task| task.state != TaskState::Failed);

        let mut due = Vec::new();
        for task in &mut self.tasks {
            if task.is_due(traced, now) {
                task.state = TaskState::Firing;
                let callback = task
                    .callback
                    .take()
                    .expect("armed tasks always hold their callback");
                due.push((task.id, callback));
            }
        }
        due
    }

    /// Reports the outcome of a fired callback.
    ///
    /// A failed task is kept in the list marked failed (swept on the next
    /// check); an exhausted task is removed; otherwise the task re-arms
    /// against the current traced-memory value. A task canceled while firing
    /// is dropped here.
    pub(crate) fn finish(
        &mut self,
        id: TaskId,
        callback: TaskCallback,
        failed: bool,
        traced: usize,
        now: Instant,
    ) {
        let Some(index) = self.tasks.iter().position(|task| task.id == id) else {
            return;
        };

        if failed {
            self.tasks[index].state = TaskState::Failed;
            return;
        }

        if let Some(remaining) = self.tasks[index].repeat {
            let remaining = remaining.saturating_sub(1);
            if remaining == 0 {
                self.tasks.remove(index);
                return;
            }
            self.tasks[index].repeat = Some(remaining);
        }

        let task = &mut self.tasks[index];
        task.callback = Some(callback);
        task.arm(traced, now);
    }

    pub(crate) fn clear(&mut self) {
        self.tasks.clear();
    }
}

impl fmt::Debug for TaskList {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskList")
            .field("scheduled", &self.tasks.len())
            .finish_non_exhaustive()
    }
}
