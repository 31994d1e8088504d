//! 外部音频引擎接口
//!
//! 核心只通过这个 trait 调用引擎：打开/关闭会话、注册/注销端口、
//! 安装回调、激活/停用处理。引擎在实时线程上按块调用 process 回调，
//! 并通过 [`BlockBuffers`] 提供每个端口本块的样本缓冲区（仅在回调期间有效）。

pub mod offline;

use std::any::{type_name, TypeId};
use std::sync::{Mutex, PoisonError};

use crate::audio::Sample;

pub use offline::{EngineOp, OfflineEngine};

/// 引擎状态码（0 表示成功）
pub type EngineStatus = i32;

pub const STATUS_OK: EngineStatus = 0;

/// 端口方向
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    /// 引擎 → 应用（引擎视角的输入端口）
    Source,
    /// 应用 → 引擎（引擎视角的输出端口）
    Sink,
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Source => write!(f, "source"),
            Self::Sink => write!(f, "sink"),
        }
    }
}

/// 引擎内端口的不透明句柄
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PortHandle(pub u32);

/// 客户端在进程内注册表中的标识，作为回调的不透明参数传给引擎
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ClientId(pub usize);

/// 每个块的端口缓冲区访问
///
/// 返回的切片长度为本块帧数，只在本次回调内有效
pub trait BlockBuffers {
    fn port_buffer(&mut self, port: PortHandle) -> Option<&mut [Sample]>;
}

/// 实时 process 回调：(客户端, 帧数, 端口缓冲区) → 状态码
pub type ProcessCallback = fn(ClientId, u32, &mut dyn BlockBuffers) -> EngineStatus;

/// 引擎关闭回调：(客户端, 原因)
pub type ShutdownCallback = fn(ClientId, &str);

/// 引擎诊断信息处理函数
pub type MessageHandler = fn(&str);

/// 音频引擎能力
pub trait AudioEngine: Send + 'static {
    /// 安装引擎全局的 info / error 消息处理函数（每进程一次，见 [`setup`]）
    fn set_message_handlers(info: MessageHandler, error: MessageHandler)
    where
        Self: Sized;

    /// 打开会话，返回实际使用的客户端名（名称冲突时引擎可能改名）
    fn open(&mut self, name: &str) -> Result<String, EngineStatus>;

    fn close(&mut self) -> Result<(), EngineStatus>;

    fn register_port(&mut self, name: &str, direction: Direction)
        -> Result<PortHandle, EngineStatus>;

    fn unregister_port(&mut self, port: PortHandle) -> Result<(), EngineStatus>;

    /// 安装唯一的 process 回调和 shutdown 回调
    fn set_callbacks(
        &mut self,
        process: ProcessCallback,
        shutdown: ShutdownCallback,
        client: ClientId,
    ) -> Result<(), EngineStatus>;

    fn activate(&mut self) -> Result<(), EngineStatus>;

    /// 停用处理。返回后引擎保证不再有进行中的 process 回调
    fn deactivate(&mut self) -> Result<(), EngineStatus>;

    fn sample_rate(&self) -> u32;

    fn buffer_size(&self) -> u32;
}

/// 已安装过消息处理函数的引擎类型
static INSTALLED: Mutex<Vec<TypeId>> = Mutex::new(Vec::new());

fn forward_info(msg: &str) {
    log::info!(target: "rtstream::engine", "{}", msg);
}

fn forward_error(msg: &str) {
    log::error!(target: "rtstream::engine", "{}", msg);
}

/// 安装引擎全局的消息处理函数
///
/// 每种引擎类型只在第一次调用时生效，之后的调用是空操作；处理函数在进程生命周期内保持安装，
/// 没有对应的拆除操作。`Client::open` 会先调用它。
pub fn setup<E: AudioEngine>() {
    let mut installed = INSTALLED.lock().unwrap_or_else(PoisonError::into_inner);
    let id = TypeId::of::<E>();
    if installed.contains(&id) {
        return;
    }

    E::set_message_handlers(forward_info, forward_error);
    installed.push(id);
    log::debug!("Engine message handlers installed for {}", type_name::<E>());
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_direction_display() {
        assert_eq!(Direction::Source.to_string(), "source");
        assert_eq!(Direction::Sink.to_string(), "sink");
    }

    use std::sync::atomic::{AtomicUsize, Ordering};

    static NULL_ENGINE_INSTALLS: AtomicUsize = AtomicUsize::new(0);

    /// 只统计消息处理函数安装次数的引擎
    struct NullEngine;

    impl AudioEngine for NullEngine {
        fn set_message_handlers(_: MessageHandler, _: MessageHandler) {
            NULL_ENGINE_INSTALLS.fetch_add(1, Ordering::SeqCst);
        }

        fn open(&mut self, name: &str) -> Result<String, EngineStatus> {
            Ok(name.to_string())
        }

        fn close(&mut self) -> Result<(), EngineStatus> {
            Ok(())
        }

        fn register_port(&mut self, _: &str, _: Direction) -> Result<PortHandle, EngineStatus> {
            Ok(PortHandle(1))
        }

        fn unregister_port(&mut self, _: PortHandle) -> Result<(), EngineStatus> {
            Ok(())
        }

        fn set_callbacks(
            &mut self,
            _: ProcessCallback,
            _: ShutdownCallback,
            _: ClientId,
        ) -> Result<(), EngineStatus> {
            Ok(())
        }

        fn activate(&mut self) -> Result<(), EngineStatus> {
            Ok(())
        }

        fn deactivate(&mut self) -> Result<(), EngineStatus> {
            Ok(())
        }

        fn sample_rate(&self) -> u32 {
            48000
        }

        fn buffer_size(&self) -> u32 {
            64
        }
    }

    fn is_installed<E: AudioEngine>() -> bool {
        INSTALLED
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(&TypeId::of::<E>())
    }

    #[test]
    fn test_setup_installs_once_per_engine_type() {
        setup::<OfflineEngine>();
        setup::<OfflineEngine>();
        assert!(is_installed::<OfflineEngine>());

        // 另一种引擎不能被先安装的引擎挡掉
        setup::<NullEngine>();
        setup::<NullEngine>();
        assert!(is_installed::<NullEngine>());
        assert_eq!(NULL_ENGINE_INSTALLS.load(Ordering::SeqCst), 1);
    }
}
