//! 内存任务存储
//!
//! 用于测试和单进程部署。认领时把选中的任务ID放入锁集合，其他认领跳过这些ID；
//! 执行结果先暂存在认领对象里，只有提交时才写入共享状态。认领对象被丢弃时
//! 锁集合中的ID被移除，暂存的写入随之丢失，与数据库事务回滚的效果一致。

use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use processor_core::models::{
    QueuedTask, RecurringTask, RecurringTaskRun, RunAttempt, RunHistory, Task, TaskRun,
};
use processor_core::traits::{RecurringTaskClaim, TaskClaim, TaskStore};
use processor_errors::{ProcessorError, ProcessorResult};
use tracing::debug;

#[derive(Debug, Default)]
struct MemoryState {
    last_task_id: i64,
    last_recurring_task_id: i64,
    last_task_run_id: i64,
    last_recurring_task_run_id: i64,
    tasks: BTreeMap<i64, Task>,
    recurring_tasks: BTreeMap<i64, RecurringTask>,
    task_runs: Vec<TaskRun>,
    recurring_task_runs: Vec<RecurringTaskRun>,
    locked_tasks: HashSet<i64>,
    locked_recurring_tasks: HashSet<i64>,
}

type SharedState = Arc<Mutex<MemoryState>>;

fn lock_state(state: &Mutex<MemoryState>) -> ProcessorResult<MutexGuard<'_, MemoryState>> {
    state
        .lock()
        .map_err(|_| ProcessorError::Internal("内存任务存储的锁已被污染".to_string()))
}

/// 区分两种任务在内存状态中的存放位置
trait MemoryRecord: QueuedTask {
    fn locked_ids(state: &mut MemoryState) -> &mut HashSet<i64>;

    fn new_run(state: &mut MemoryState, task_id: i64, attempt: RunAttempt) -> Self::Run;

    fn apply(state: &mut MemoryState, task: &Self, run: Self::Run);
}

impl MemoryRecord for Task {
    fn locked_ids(state: &mut MemoryState) -> &mut HashSet<i64> {
        &mut state.locked_tasks
    }

    fn new_run(state: &mut MemoryState, task_id: i64, attempt: RunAttempt) -> TaskRun {
        state.last_task_run_id += 1;
        TaskRun {
            id: state.last_task_run_id,
            task_id,
            attempt,
        }
    }

    fn apply(state: &mut MemoryState, task: &Self, run: TaskRun) {
        if let Some(stored) = state.tasks.get_mut(&task.id()) {
            stored.completed = task.completed;
            stored.num_failures = task.num_failures;
        }
        state.task_runs.push(run);
    }
}

impl MemoryRecord for RecurringTask {
    fn locked_ids(state: &mut MemoryState) -> &mut HashSet<i64> {
        &mut state.locked_recurring_tasks
    }

    fn new_run(state: &mut MemoryState, task_id: i64, attempt: RunAttempt) -> RecurringTaskRun {
        state.last_recurring_task_run_id += 1;
        RecurringTaskRun {
            id: state.last_recurring_task_run_id,
            task_id,
            attempt,
        }
    }

    fn apply(state: &mut MemoryState, _task: &Self, run: RecurringTaskRun) {
        state.recurring_task_runs.push(run);
    }
}

/// 内存认领，丢弃时释放锁
struct MemoryClaim<T: MemoryRecord> {
    state: SharedState,
    tasks: Vec<T>,
    staged: Vec<(T, T::Run)>,
}

impl<T: MemoryRecord> MemoryClaim<T> {
    fn new(state: SharedState, tasks: Vec<T>) -> Self {
        Self {
            state,
            tasks,
            staged: Vec::new(),
        }
    }
}

impl<T: MemoryRecord> Drop for MemoryClaim<T> {
    fn drop(&mut self) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let locked = T::locked_ids(&mut state);
        for task in &self.tasks {
            locked.remove(&task.id());
        }
    }
}

#[async_trait]
impl<T: MemoryRecord> TaskClaim<T> for MemoryClaim<T> {
    fn tasks(&self) -> &[T] {
        &self.tasks
    }

    async fn record_run(&mut self, task: &T, attempt: RunAttempt) -> ProcessorResult<T::Run> {
        let run = {
            let mut state = lock_state(&self.state)?;
            T::new_run(&mut state, task.id(), attempt)
        };
        self.staged.push((task.clone(), run.clone()));
        Ok(run)
    }

    async fn commit(mut self: Box<Self>) -> ProcessorResult<()> {
        let staged = std::mem::take(&mut self.staged);
        {
            let mut state = lock_state(&self.state)?;
            for (task, run) in staged {
                T::apply(&mut state, &task, run);
            }
            debug!("提交内存认领: {} 个 {}", self.tasks.len(), T::KIND);
        }
        Ok(())
    }
}

fn run_history<'a>(
    runs: impl Iterator<Item = &'a RecurringTaskRun>,
    task_id: i64,
    since: DateTime<Utc>,
) -> RunHistory {
    let attempts: Vec<&RunAttempt> = runs
        .filter(|run| run.task_id == task_id)
        .map(|run| &run.attempt)
        .collect();

    let last_run = attempts
        .iter()
        .max_by_key(|attempt| attempt.started_at)
        .map(|attempt| (*attempt).clone());
    let runs_in_window = attempts
        .iter()
        .filter(|attempt| attempt.started_at >= since)
        .count() as i64;

    RunHistory {
        last_run,
        runs_in_window,
    }
}

#[async_trait]
impl RecurringTaskClaim for MemoryClaim<RecurringTask> {
    async fn run_history(
        &mut self,
        task_id: i64,
        since: DateTime<Utc>,
    ) -> ProcessorResult<RunHistory> {
        let state = lock_state(&self.state)?;
        let runs = state
            .recurring_task_runs
            .iter()
            .chain(self.staged.iter().map(|(_, run)| run));
        Ok(run_history(runs, task_id, since))
    }
}

/// 内存任务存储
#[derive(Debug, Clone, Default)]
pub struct InMemoryTaskStore {
    state: SharedState,
}

impl InMemoryTaskStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TaskStore for InMemoryTaskStore {
    async fn create_task(&self, task: &Task) -> ProcessorResult<Task> {
        let mut state = lock_state(&self.state)?;
        state.last_task_id += 1;

        let mut created = task.clone();
        created.base.id = state.last_task_id;
        state.tasks.insert(created.base.id, created.clone());

        debug!(
            "创建任务 '{}' (ID: {})",
            created.base.task_identifier, created.base.id
        );
        Ok(created)
    }

    async fn get_task(&self, id: i64) -> ProcessorResult<Option<Task>> {
        let state = lock_state(&self.state)?;
        Ok(state.tasks.get(&id).cloned())
    }

    async fn list_task_runs(&self, task_id: i64) -> ProcessorResult<Vec<TaskRun>> {
        let state = lock_state(&self.state)?;
        let mut runs: Vec<TaskRun> = state
            .task_runs
            .iter()
            .filter(|run| run.task_id == task_id)
            .cloned()
            .collect();
        runs.sort_by_key(|run| (run.attempt.started_at, run.id));
        Ok(runs)
    }

    async fn claim_tasks(
        &self,
        batch_size: usize,
        now: DateTime<Utc>,
    ) -> ProcessorResult<Box<dyn TaskClaim<Task>>> {
        let mut state = lock_state(&self.state)?;

        let mut tasks: Vec<Task> = state
            .tasks
            .values()
            .filter(|task| task.is_claimable(now) && !state.locked_tasks.contains(&task.base.id))
            .cloned()
            .collect();
        tasks.sort_by_key(|task| (task.scheduled_for, task.base.id));
        tasks.truncate(batch_size);

        for task in &tasks {
            state.locked_tasks.insert(task.base.id);
        }
        drop(state);

        debug!("认领到 {} 个任务", tasks.len());
        Ok(Box::new(MemoryClaim::new(Arc::clone(&self.state), tasks)))
    }

    async fn upsert_recurring_task(&self, task: &RecurringTask) -> ProcessorResult<RecurringTask> {
        let mut state = lock_state(&self.state)?;

        let existing = state.recurring_tasks.values_mut().find(|stored| {
            stored.base.task_identifier == task.base.task_identifier
                && stored.run_every == task.run_every
        });

        if let Some(stored) = existing {
            stored.base.serialized_args = task.base.serialized_args.clone();
            stored.base.serialized_kwargs = task.base.serialized_kwargs.clone();
            return Ok(stored.clone());
        }

        state.last_recurring_task_id += 1;
        let mut created = task.clone();
        created.base.id = state.last_recurring_task_id;
        state.recurring_tasks.insert(created.base.id, created.clone());
        Ok(created)
    }

    async fn get_recurring_task(&self, id: i64) -> ProcessorResult<Option<RecurringTask>> {
        let state = lock_state(&self.state)?;
        Ok(state.recurring_tasks.get(&id).cloned())
    }

    async fn list_recurring_task_runs(&self, task_id: i64) -> ProcessorResult<Vec<RecurringTaskRun>> {
        let state = lock_state(&self.state)?;
        let mut runs: Vec<RecurringTaskRun> = state
            .recurring_task_runs
            .iter()
            .filter(|run| run.task_id == task_id)
            .cloned()
            .collect();
        runs.sort_by_key(|run| (run.attempt.started_at, run.id));
        Ok(runs)
    }

    async fn claim_recurring_tasks(
        &self,
        batch_size: usize,
        now: DateTime<Utc>,
    ) -> ProcessorResult<Box<dyn RecurringTaskClaim>> {
        let mut state = lock_state(&self.state)?;

        let tasks: Vec<RecurringTask> = state
            .recurring_tasks
            .values()
            .filter(|task| !state.locked_recurring_tasks.contains(&task.base.id))
            .filter(|task| {
                run_history(
                    state.recurring_task_runs.iter(),
                    task.base.id,
                    task.window_start(now),
                )
                .is_due(task.run_every, now)
            })
            .take(batch_size)
            .cloned()
            .collect();

        let locked = RecurringTask::locked_ids(&mut state);
        for task in &tasks {
            locked.insert(task.base.id);
        }
        drop(state);

        debug!("认领到 {} 个到期周期任务", tasks.len());
        Ok(Box::new(MemoryClaim::new(Arc::clone(&self.state), tasks)))
    }
}
