//! 任务调度器
//!
//! 单个 1 秒节拍的控制循环负责判定到期任务，实际执行放到独立的
//! worker 任务里，控制循环本身从不等待外部调用。
//! 每个任务持有一把执行锁：定时触发 try_lock 失败即跳过本次节拍，
//! 手动触发等待锁，因此同一任务的执行永不并发。

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use chrono::{NaiveTime, Utc};
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use tokio::sync::{watch, Mutex, OwnedMutexGuard, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{interval, Duration, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::error::app_error::{AppError, AppResult};
use crate::time_util::next_fire_after;
use crate::trading::guard::{GuardChain, GuardDecision};
use crate::trading::model::execution::ExecutionSummary;
use crate::trading::model::task::{ScheduleFrequency, ScheduledTask, TaskLifecycle};
use crate::trading::services::notification::NotificationRelay;
use crate::trading::services::registry::TaskRegistry;
use crate::trading::services::repository::ExecutionRepository;
use crate::trading::task::task_manager::TaskManager;

/// 调度器状态机
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SchedulerState {
    Stopped,
    Running,
    Restarting,
}

/// 调度器健康快照
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerStatus {
    pub state: SchedulerState,
    pub task_count: usize,
    pub in_flight: usize,
    pub checked_at: i64,
}

impl std::fmt::Display for SchedulerStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "状态: {:?}, 任务数: {}, 执行中: {}",
            self.state, self.task_count, self.in_flight
        )
    }
}

const TICK_INTERVAL: Duration = Duration::from_secs(1);

/// 控制循环与 worker 共享的执行核心
struct SchedulerCore {
    registry: Arc<TaskRegistry>,
    guards: Arc<GuardChain>,
    manager: Arc<TaskManager>,
    repository: Arc<dyn ExecutionRepository>,
    notifier: Arc<NotificationRelay>,
    anchor: NaiveTime,
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    in_flight: AtomicUsize,
}

impl SchedulerCore {
    async fn task_lock(&self, task_id: &str) -> Arc<Mutex<()>> {
        self.locks
            .lock()
            .await
            .entry(task_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// 一次执行尝试：守卫 -> 流水线 -> 落库 -> 通知 -> 记录执行时间
    ///
    /// 无论放行、跳过还是失败，恰好产生一条执行记录和一次通知。
    async fn run_attempt(
        &self,
        task: &ScheduledTask,
        stop_rx: &watch::Receiver<bool>,
        _permit: OwnedMutexGuard<()>,
    ) -> ExecutionSummary {
        // 计数覆盖定时触发与手动触发两条路径
        self.in_flight.fetch_add(1, Ordering::SeqCst);
        let now = Utc::now();
        let summary = match self.guards.evaluate(task, now).await {
            GuardDecision::Allow => self.manager.execute(task, stop_rx).await,
            GuardDecision::Skip(reason) => ExecutionSummary::skipped(task, reason, now),
        };
        if let Err(e) = self.repository.append(summary.clone()).await {
            error!("执行 {} 记录写入失败: {}", summary.execution_id, e);
        }
        self.notifier.dispatch(&summary).await;
        if let Err(e) = self.registry.record_run(&task.task_id, summary.started_at).await {
            warn!("任务 {} 执行时间更新失败: {}", task.task_id, e);
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        summary
    }

    /// 一个节拍：推进到期任务，清理已结束的 worker
    async fn tick(
        self: &Arc<Self>,
        deadlines: &mut HashMap<String, (ScheduleFrequency, Instant)>,
        stop_rx: &watch::Receiver<bool>,
    ) {
        let tasks = self.registry.schedulable_snapshot().await;
        deadlines.retain(|id, _| tasks.iter().any(|t| &t.task_id == id));

        let now_utc = Utc::now();
        for task in tasks {
            let frequency_changed = match deadlines.get(&task.task_id) {
                Some((frequency, _)) => *frequency != task.frequency,
                None => true,
            };
            if frequency_changed {
                // 新任务或频率变更：从上次执行时间推算下次触发
                let fire = next_fire_after(
                    &task.frequency,
                    task.last_run.unwrap_or(now_utc),
                    self.anchor,
                );
                let wait = (fire - now_utc).to_std().unwrap_or(std::time::Duration::ZERO);
                deadlines.insert(
                    task.task_id.clone(),
                    (task.frequency.clone(), Instant::now() + wait),
                );
                continue;
            }

            let due = deadlines
                .get(&task.task_id)
                .map(|(_, deadline)| Instant::now() >= *deadline)
                .unwrap_or(false);
            if !due {
                continue;
            }

            let next = next_fire_after(&task.frequency, now_utc, self.anchor);
            let wait = (next - now_utc).to_std().unwrap_or(std::time::Duration::ZERO);
            deadlines.insert(
                task.task_id.clone(),
                (task.frequency.clone(), Instant::now() + wait),
            );
            self.spawn_worker(task, stop_rx.clone()).await;
        }

        self.workers.lock().await.retain(|h| !h.is_finished());
    }

    /// 到期触发：拿不到执行锁说明上一轮仍在跑，本次直接放弃
    async fn spawn_worker(self: &Arc<Self>, task: ScheduledTask, stop_rx: watch::Receiver<bool>) {
        let lock = self.task_lock(&task.task_id).await;
        let permit = match lock.try_lock_owned() {
            Ok(permit) => permit,
            Err(_) => {
                debug!("任务 {} 上一轮仍在执行，跳过本次触发", task.task_id);
                return;
            }
        };

        let core = self.clone();
        let handle = tokio::spawn(async move {
            core.run_attempt(&task, &stop_rx, permit).await;
        });
        self.workers.lock().await.push(handle);
    }

    /// 等待所有在途 worker 结束
    async fn drain_workers(&self) {
        loop {
            let handles: Vec<JoinHandle<()>> = {
                let mut workers = self.workers.lock().await;
                workers.drain(..).collect()
            };
            if handles.is_empty() {
                break;
            }
            join_all(handles).await;
        }
    }
}

struct ControlHandles {
    stop_tx: Option<watch::Sender<bool>>,
    loop_handle: Option<JoinHandle<()>>,
}

/// 调度器外壳：状态机 + 控制循环的生命周期管理
pub struct TradingScheduler {
    core: Arc<SchedulerCore>,
    state: RwLock<SchedulerState>,
    control: Mutex<ControlHandles>,
}

impl TradingScheduler {
    pub fn new(
        registry: Arc<TaskRegistry>,
        guards: Arc<GuardChain>,
        manager: Arc<TaskManager>,
        repository: Arc<dyn ExecutionRepository>,
        notifier: Arc<NotificationRelay>,
        anchor: NaiveTime,
    ) -> Self {
        Self {
            core: Arc::new(SchedulerCore {
                registry,
                guards,
                manager,
                repository,
                notifier,
                anchor,
                locks: Mutex::new(HashMap::new()),
                workers: Mutex::new(Vec::new()),
                in_flight: AtomicUsize::new(0),
            }),
            state: RwLock::new(SchedulerState::Stopped),
            control: Mutex::new(ControlHandles {
                stop_tx: None,
                loop_handle: None,
            }),
        }
    }

    /// 启动控制循环；已在运行时为幂等空操作
    pub async fn start(&self) -> SchedulerStatus {
        {
            let mut state = self.state.write().await;
            if *state == SchedulerState::Running {
                info!("调度器已在运行");
                drop(state);
                return self.status().await;
            }

            let (stop_tx, stop_rx) = watch::channel(false);
            let core = self.core.clone();
            let mut loop_rx = stop_rx.clone();
            let handle = tokio::spawn(async move {
                let mut ticker = interval(TICK_INTERVAL);
                ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
                let mut deadlines: HashMap<String, (ScheduleFrequency, Instant)> = HashMap::new();
                loop {
                    tokio::select! {
                        _ = ticker.tick() => {
                            core.tick(&mut deadlines, &stop_rx).await;
                        }
                        _ = loop_rx.changed() => {
                            info!("调度器控制循环退出");
                            break;
                        }
                    }
                }
            });

            let mut control = self.control.lock().await;
            control.stop_tx = Some(stop_tx);
            control.loop_handle = Some(handle);
            *state = SchedulerState::Running;
            info!("调度器已启动");
        }
        self.status().await
    }

    async fn halt_internals(&self) {
        let (stop_tx, loop_handle) = {
            let mut control = self.control.lock().await;
            (control.stop_tx.take(), control.loop_handle.take())
        };
        if let Some(stop_tx) = stop_tx {
            // 先翻停止信号：在途流水线不再提交新订单
            let _ = stop_tx.send(true);
        }
        if let Some(handle) = loop_handle {
            let _ = handle.await;
        }
        self.core.drain_workers().await;
    }

    /// 停止：翻停止信号，等控制循环与全部在途 worker 退出
    pub async fn stop(&self) -> SchedulerStatus {
        {
            let state = self.state.read().await;
            if *state == SchedulerState::Stopped {
                drop(state);
                return self.status().await;
            }
        }
        self.halt_internals().await;
        *self.state.write().await = SchedulerState::Stopped;
        info!("调度器已停止");
        self.status().await
    }

    /// 重启：对外可见 Restarting 中间态
    pub async fn restart(&self) -> SchedulerStatus {
        *self.state.write().await = SchedulerState::Restarting;
        self.halt_internals().await;
        *self.state.write().await = SchedulerState::Stopped;
        self.start().await
    }

    pub async fn status(&self) -> SchedulerStatus {
        SchedulerStatus {
            state: *self.state.read().await,
            task_count: self.core.registry.list().await.len(),
            in_flight: self.core.in_flight.load(Ordering::SeqCst),
            checked_at: Utc::now().timestamp(),
        }
    }

    /// 手动触发一次执行：不做到期判定，但守卫照常生效。
    /// 与在途执行竞争同一把锁，因此会排队而不是并发。
    pub async fn execute_now(&self, task_id: &str) -> AppResult<ExecutionSummary> {
        let task = self
            .core
            .registry
            .get(task_id)
            .await
            .filter(|t| t.status != TaskLifecycle::Deleted)
            .ok_or_else(|| AppError::TaskNotFound(task_id.to_string()))?;

        let stop_rx = {
            let control = self.control.lock().await;
            match &control.stop_tx {
                Some(stop_tx) => stop_tx.subscribe(),
                // 调度器未运行时用常 false 的哑信号
                None => watch::channel(false).1,
            }
        };

        let lock = self.core.task_lock(task_id).await;
        let permit = lock.lock_owned().await;
        Ok(self.core.run_attempt(&task, &stop_rx, permit).await)
    }
}
