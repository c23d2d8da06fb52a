//! 任务注册表
//!
//! 内存态 + 文件持久化。所有变更先落盘再返回成功，
//! 落盘失败时回滚内存态，保证两边一致。

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use tracing::info;

use crate::error::app_error::{AppError, AppResult};
use crate::trading::model::task::{ScheduledTask, TaskLifecycle, TaskSpec};

/// 任务配置的持久化后端
#[async_trait]
pub trait TaskConfigStore: Send + Sync {
    async fn load_all(&self) -> AppResult<Vec<ScheduledTask>>;
    async fn persist_all(&self, tasks: &[ScheduledTask]) -> AppResult<()>;
}

/// JSON 文件后端，写临时文件后原子重命名，避免半截文件
pub struct JsonFileConfigStore {
    path: PathBuf,
}

impl JsonFileConfigStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl TaskConfigStore for JsonFileConfigStore {
    async fn load_all(&self) -> AppResult<Vec<ScheduledTask>> {
        match tokio::fs::read_to_string(&self.path).await {
            Ok(raw) => serde_json::from_str(&raw)
                .map_err(|e| AppError::config(format!("解析任务配置文件失败: {}", e))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
            Err(e) => Err(AppError::Persistence(format!("读取任务配置文件失败: {}", e))),
        }
    }

    async fn persist_all(&self, tasks: &[ScheduledTask]) -> AppResult<()> {
        let raw = serde_json::to_string_pretty(tasks)
            .map_err(|e| AppError::Persistence(format!("序列化任务配置失败: {}", e)))?;
        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, raw.as_bytes())
            .await
            .map_err(|e| AppError::Persistence(format!("写入临时文件失败: {}", e)))?;
        tokio::fs::rename(&tmp, &self.path)
            .await
            .map_err(|e| AppError::Persistence(format!("替换任务配置文件失败: {}", e)))?;
        Ok(())
    }
}

/// 仅内存的后端，测试用
#[derive(Default)]
pub struct InMemoryConfigStore {
    tasks: tokio::sync::Mutex<Vec<ScheduledTask>>,
}

#[async_trait]
impl TaskConfigStore for InMemoryConfigStore {
    async fn load_all(&self) -> AppResult<Vec<ScheduledTask>> {
        Ok(self.tasks.lock().await.clone())
    }

    async fn persist_all(&self, tasks: &[ScheduledTask]) -> AppResult<()> {
        *self.tasks.lock().await = tasks.to_vec();
        Ok(())
    }
}

/// 任务注册表，调度器与管理接口共用
pub struct TaskRegistry {
    store: Arc<dyn TaskConfigStore>,
    tasks: RwLock<HashMap<String, ScheduledTask>>,
}

impl TaskRegistry {
    /// 从后端加载全部任务并建立内存索引
    pub async fn load(store: Arc<dyn TaskConfigStore>) -> AppResult<Self> {
        let loaded = store.load_all().await?;
        let mut tasks = HashMap::with_capacity(loaded.len());
        for task in loaded {
            if tasks.insert(task.task_id.clone(), task).is_some() {
                return Err(AppError::config("任务配置文件中存在重复的 task_id"));
            }
        }
        info!("任务注册表加载完成，共 {} 个任务", tasks.len());
        Ok(Self {
            store,
            tasks: RwLock::new(tasks),
        })
    }

    async fn persist(&self, tasks: &HashMap<String, ScheduledTask>) -> AppResult<()> {
        let mut list: Vec<ScheduledTask> = tasks.values().cloned().collect();
        list.sort_by(|a, b| a.task_id.cmp(&b.task_id));
        self.store.persist_all(&list).await
    }

    /// 创建任务，task_id 冲突（包括已软删除的）直接拒绝
    pub async fn create(&self, spec: TaskSpec) -> AppResult<ScheduledTask> {
        spec.validate()?;
        let mut tasks = self.tasks.write().await;
        if tasks.contains_key(&spec.task_id) {
            return Err(AppError::DuplicateTask(spec.task_id));
        }
        let task = ScheduledTask::from_spec(spec, Utc::now())?;
        tasks.insert(task.task_id.clone(), task.clone());
        if let Err(e) = self.persist(&tasks).await {
            tasks.remove(&task.task_id);
            return Err(e);
        }
        info!("任务已创建: {} ({})", task.name, task.task_id);
        Ok(task)
    }

    /// 更新任务定义，保留 task_id / created_at / last_run
    pub async fn update(&self, task_id: &str, spec: TaskSpec) -> AppResult<ScheduledTask> {
        spec.validate()?;
        let mut tasks = self.tasks.write().await;
        let previous = tasks
            .get(task_id)
            .cloned()
            .ok_or_else(|| AppError::TaskNotFound(task_id.to_string()))?;
        let mut task = previous.clone();
        task.apply_update(spec, Utc::now())?;
        tasks.insert(task_id.to_string(), task.clone());
        if let Err(e) = self.persist(&tasks).await {
            tasks.insert(task_id.to_string(), previous);
            return Err(e);
        }
        info!("任务已更新: {}", task_id);
        Ok(task)
    }

    /// 软删除：任务保留在存储中但不再被调度
    pub async fn delete(&self, task_id: &str) -> AppResult<()> {
        self.set_status(task_id, TaskLifecycle::Deleted).await?;
        info!("任务已删除: {}", task_id);
        Ok(())
    }

    pub async fn pause(&self, task_id: &str) -> AppResult<()> {
        self.set_status(task_id, TaskLifecycle::Paused).await
    }

    pub async fn resume(&self, task_id: &str) -> AppResult<()> {
        self.set_status(task_id, TaskLifecycle::Active).await
    }

    async fn set_status(&self, task_id: &str, status: TaskLifecycle) -> AppResult<()> {
        let mut tasks = self.tasks.write().await;
        let previous = tasks
            .get(task_id)
            .cloned()
            .ok_or_else(|| AppError::TaskNotFound(task_id.to_string()))?;
        if previous.status == TaskLifecycle::Deleted {
            return Err(AppError::TaskNotFound(task_id.to_string()));
        }
        let mut task = previous.clone();
        task.enabled = status == TaskLifecycle::Active;
        task.status = status;
        task.updated_at = Utc::now();
        tasks.insert(task_id.to_string(), task);
        if let Err(e) = self.persist(&tasks).await {
            tasks.insert(task_id.to_string(), previous);
            return Err(e);
        }
        Ok(())
    }

    pub async fn get(&self, task_id: &str) -> Option<ScheduledTask> {
        self.tasks.read().await.get(task_id).cloned()
    }

    /// 列出全部未删除任务
    pub async fn list(&self) -> Vec<ScheduledTask> {
        let mut list: Vec<ScheduledTask> = self
            .tasks
            .read()
            .await
            .values()
            .filter(|t| t.status != TaskLifecycle::Deleted)
            .cloned()
            .collect();
        list.sort_by(|a, b| a.task_id.cmp(&b.task_id));
        list
    }

    /// 调度器每个 tick 取一次的可执行任务快照
    pub async fn schedulable_snapshot(&self) -> Vec<ScheduledTask> {
        self.tasks
            .read()
            .await
            .values()
            .filter(|t| t.is_schedulable())
            .cloned()
            .collect()
    }

    /// 记录一次执行时间（含被守卫跳过的执行）
    pub async fn record_run(&self, task_id: &str, at: DateTime<Utc>) -> AppResult<()> {
        let mut tasks = self.tasks.write().await;
        let task = tasks
            .get_mut(task_id)
            .ok_or_else(|| AppError::TaskNotFound(task_id.to_string()))?;
        task.last_run = Some(at);
        let snapshot = tasks.clone();
        self.persist(&snapshot).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trading::model::task::ScheduleFrequency;

    fn spec(id: &str) -> TaskSpec {
        TaskSpec {
            task_id: id.to_string(),
            name: format!("任务 {}", id),
            symbols: vec!["AAPL".to_string(), "MSFT".to_string()],
            strategies: vec!["momentum_probe".to_string()],
            frequency: ScheduleFrequency::Daily,
        }
    }

    async fn registry() -> TaskRegistry {
        TaskRegistry::load(Arc::new(InMemoryConfigStore::default()))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_create_and_get() {
        let reg = registry().await;
        let task = reg.create(spec("t1")).await.unwrap();
        assert_eq!(task.status, TaskLifecycle::Active);
        assert!(task.enabled);
        assert_eq!(reg.get("t1").await.unwrap().name, "任务 t1");
    }

    #[tokio::test]
    async fn test_duplicate_id_rejected() {
        let reg = registry().await;
        reg.create(spec("t1")).await.unwrap();
        match reg.create(spec("t1")).await {
            Err(AppError::DuplicateTask(id)) => assert_eq!(id, "t1"),
            other => panic!("期望 DuplicateTask，得到 {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_soft_delete_hides_from_list_but_keeps_record() {
        let reg = registry().await;
        reg.create(spec("t1")).await.unwrap();
        reg.create(spec("t2")).await.unwrap();
        reg.delete("t1").await.unwrap();

        let listed = reg.list().await;
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].task_id, "t2");
        // 软删除后记录仍在，id 不可复用
        assert!(reg.get("t1").await.is_some());
        assert!(matches!(
            reg.create(spec("t1")).await,
            Err(AppError::DuplicateTask(_))
        ));
    }

    #[tokio::test]
    async fn test_pause_resume_controls_scheduling() {
        let reg = registry().await;
        reg.create(spec("t1")).await.unwrap();
        reg.pause("t1").await.unwrap();
        assert!(reg.schedulable_snapshot().await.is_empty());
        reg.resume("t1").await.unwrap();
        assert_eq!(reg.schedulable_snapshot().await.len(), 1);
    }

    #[tokio::test]
    async fn test_deleted_task_cannot_be_mutated() {
        let reg = registry().await;
        reg.create(spec("t1")).await.unwrap();
        reg.delete("t1").await.unwrap();
        assert!(matches!(
            reg.pause("t1").await,
            Err(AppError::TaskNotFound(_))
        ));
        assert!(matches!(
            reg.resume("t1").await,
            Err(AppError::TaskNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_record_run_updates_last_run() {
        let reg = registry().await;
        reg.create(spec("t1")).await.unwrap();
        let at = Utc::now();
        reg.record_run("t1", at).await.unwrap();
        assert_eq!(reg.get("t1").await.unwrap().last_run, Some(at));
    }

    #[tokio::test]
    async fn test_json_file_store_round_trip() {
        let dir = std::env::temp_dir().join(format!("registry-test-{}", uuid::Uuid::new_v4()));
        tokio::fs::create_dir_all(&dir).await.unwrap();
        let path = dir.join("tasks.json");

        let store = Arc::new(JsonFileConfigStore::new(&path));
        let reg = TaskRegistry::load(store.clone()).await.unwrap();
        reg.create(spec("t1")).await.unwrap();
        reg.create(spec("t2")).await.unwrap();
        reg.pause("t2").await.unwrap();

        // 重新加载，状态应完整恢复
        let reloaded = TaskRegistry::load(store).await.unwrap();
        assert_eq!(reloaded.list().await.len(), 2);
        assert_eq!(
            reloaded.get("t2").await.unwrap().status,
            TaskLifecycle::Paused
        );

        tokio::fs::remove_dir_all(&dir).await.unwrap();
    }
}
