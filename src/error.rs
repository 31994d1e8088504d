//! 错误类型
//!
//! 所有错误都同步返回给调用的应用线程，内部不做重试。
//! 实时回调路径没有错误通道。

use crate::engine::EngineStatus;

/// 客户端 / 端口操作错误
#[derive(Debug, thiserror::Error)]
pub enum StreamError {
    /// 在客户端激活时修改端口拓扑
    #[error("precondition violated: {0}")]
    PreconditionViolated(&'static str),

    /// 引擎拒绝注册端点（名称冲突、资源耗尽）
    #[error("failed to register endpoint '{name}': status {status}")]
    EndpointRegistrationFailed { name: String, status: EngineStatus },

    /// 引擎拒绝注销端点
    #[error("failed to unregister endpoint '{name}': status {status}")]
    EndpointUnregistrationFailed { name: String, status: EngineStatus },

    #[error("failed to open session '{name}': status {status}")]
    SessionOpenFailed { name: String, status: EngineStatus },

    #[error("failed to close session: status {status}")]
    SessionCloseFailed { status: EngineStatus },

    #[error("activation failed: status {status}")]
    ActivationFailed { status: EngineStatus },

    #[error("deactivation failed: status {status}")]
    DeactivationFailed { status: EngineStatus },

    /// 注销一个不属于本客户端的端口
    #[error("port '{0}' is not owned by this client")]
    ElementNotFound(String),

    /// 进程内客户端槽位已用尽
    #[error("no free client slot (limit {0})")]
    NoFreeSlot(usize),

    /// Ring Buffer 样本数换算成字节后溢出
    #[error("ring buffer of {0} samples is too large")]
    RingBufferTooLarge(usize),

    #[error("failed to spawn notifier thread: {0}")]
    NotifierSpawn(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, StreamError>;
