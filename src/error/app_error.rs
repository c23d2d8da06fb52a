use thiserror::Error;

/// 应用错误
///
/// 只有配置错误与内部不变量错误会传播到控制面调用方，
/// 守卫跳过与单品种/单订单错误均被吸收进 ExecutionSummary。
#[derive(Error, Debug)]
pub enum AppError {
    /// 配置错误（任务/交易窗口配置非法，加载时立即失败）
    #[error("配置错误: {0}")]
    Config(String),

    /// 任务已存在
    #[error("任务已存在: {0}")]
    DuplicateTask(String),

    /// 任务不存在
    #[error("任务不存在: {0}")]
    TaskNotFound(String),

    /// 持久化错误（任务配置存储写入失败）
    #[error("持久化错误: {0}")]
    Persistence(String),

    /// 内部不变量被破坏（致命，必须记录且不得污染已持久化状态）
    #[error("内部不变量被破坏: {0}")]
    InvariantViolation(String),
}

impl AppError {
    pub fn config(msg: impl Into<String>) -> Self {
        AppError::Config(msg.into())
    }
}

pub type AppResult<T> = Result<T, AppError>;
