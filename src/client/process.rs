//! 实时 process 回调
//!
//! **绝对禁止：**
//! - 锁
//! - 分配
//! - I/O（包括日志）
//! - 任何可能阻塞的调用
//!
//! 回调只做三件事：Source 写入、Sink 读出、触发通知器。

use std::sync::Arc;

use super::notifier::NotifyHandle;
use super::port::Port;
use super::registry;
use crate::audio::sample::{as_bytes, as_bytes_mut};
use crate::audio::ClientStats;
use crate::engine::{BlockBuffers, ClientId, EngineStatus, STATUS_OK};

/// 激活时发布给实时线程的状态
///
/// 端口集合在激活期间不可变（注册/注销只允许在未激活时进行），
/// 因此这里是一份不可变快照
pub(crate) struct ProcessState {
    pub(crate) sources: Box<[Arc<Port>]>,
    pub(crate) sinks: Box<[Arc<Port>]>,
    pub(crate) notifier: NotifyHandle,
    pub(crate) stats: Arc<ClientStats>,
}

impl ProcessState {
    #[inline]
    fn run(&self, nframes: u32, buffers: &mut dyn BlockBuffers) -> EngineStatus {
        let frames = nframes as usize;

        for port in self.sources.iter() {
            if let Some(input) = buffers.port_buffer(port.handle()) {
                let len = frames.min(input.len());
                port.capture(as_bytes(&input[..len]));
            }
        }

        for port in self.sinks.iter() {
            if let Some(output) = buffers.port_buffer(port.handle()) {
                let len = frames.min(output.len());
                port.playback(as_bytes_mut(&mut output[..len]));
            }
        }

        self.stats.on_callback(nframes);
        self.notifier.raise();
        STATUS_OK
    }
}

/// 安装到引擎的 process 回调
///
/// 客户端未发布状态时（未激活、正在拆除、id 无效）直接返回成功
pub(crate) fn process_callback(
    client: ClientId,
    nframes: u32,
    buffers: &mut dyn BlockBuffers,
) -> EngineStatus {
    registry::with_state(client, |state| state.run(nframes, buffers)).unwrap_or(STATUS_OK)
}

/// 安装到引擎的 shutdown 回调（非实时线程）
pub(crate) fn shutdown_callback(client: ClientId, reason: &str) {
    registry::mark_shut_down(client);
    log::error!("Audio engine shut down client {}: {}", client.0, reason);
}
