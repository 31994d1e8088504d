//! 离线引擎
//!
//! 进程内的 [`AudioEngine`] 实现，块回调由调用方手动驱动（`run_block`）。
//! Source 的输入从预先排队的样本中取，Sink 的输出按块累积，可随时取走。
//! 用于测试和 demo：可模拟名称冲突改名、引擎关闭、以及各生命周期操作的一次性失败。

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError};

use super::{
    AudioEngine, BlockBuffers, ClientId, Direction, EngineStatus, MessageHandler, PortHandle,
    ProcessCallback, ShutdownCallback, STATUS_OK,
};
use crate::audio::Sample;

const ERR_NO_SESSION: EngineStatus = -1;
const ERR_NO_SUCH_PORT: EngineStatus = -2;
const ERR_ALREADY_OPEN: EngineStatus = -16;
const ERR_NAME_TAKEN: EngineStatus = -17;

static HANDLERS: OnceLock<(MessageHandler, MessageHandler)> = OnceLock::new();

fn info(msg: &str) {
    if let Some((handler, _)) = HANDLERS.get() {
        handler(msg);
    }
}

fn error(msg: &str) {
    if let Some((_, handler)) = HANDLERS.get() {
        handler(msg);
    }
}

/// 可注入失败的引擎操作
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineOp {
    Open,
    Close,
    RegisterPort,
    UnregisterPort,
    Activate,
    Deactivate,
}

struct OfflinePort {
    handle: PortHandle,
    name: String,
    direction: Direction,
    /// Source：等待送入回调的样本
    pending_input: VecDeque<Sample>,
    /// Sink：回调写出的全部样本
    captured_output: Vec<Sample>,
    /// 本块缓冲区
    block: Vec<Sample>,
}

struct OfflineState {
    sample_rate: u32,
    buffer_size: u32,
    session: Option<String>,
    taken_names: Vec<String>,
    ports: Vec<OfflinePort>,
    next_handle: u32,
    callbacks: Option<(ProcessCallback, ShutdownCallback, ClientId)>,
    active: bool,
    faults: Vec<(EngineOp, EngineStatus)>,
}

impl OfflineState {
    /// 取出一次性注入的失败
    fn take_fault(&mut self, op: EngineOp) -> Result<(), EngineStatus> {
        match self.faults.iter().position(|(o, _)| *o == op) {
            Some(idx) => {
                let (_, status) = self.faults.remove(idx);
                Err(status)
            }
            None => Ok(()),
        }
    }

    fn require_session(&self) -> Result<(), EngineStatus> {
        if self.session.is_some() {
            Ok(())
        } else {
            Err(ERR_NO_SESSION)
        }
    }

    fn port_mut(&mut self, name: &str) -> Option<&mut OfflinePort> {
        self.ports.iter_mut().find(|p| p.name == name)
    }
}

struct OfflineBlock<'a> {
    ports: &'a mut [OfflinePort],
}

impl BlockBuffers for OfflineBlock<'_> {
    fn port_buffer(&mut self, port: PortHandle) -> Option<&mut [Sample]> {
        self.ports
            .iter_mut()
            .find(|p| p.handle == port)
            .map(|p| p.block.as_mut_slice())
    }
}

/// 手动驱动的进程内引擎
///
/// 克隆得到的是同一个引擎的另一个句柄：一份交给 `Client`，一份留给驱动线程。
#[derive(Clone)]
pub struct OfflineEngine {
    shared: Arc<Mutex<OfflineState>>,
}

impl OfflineEngine {
    pub fn new(sample_rate: u32, buffer_size: u32) -> Self {
        Self {
            shared: Arc::new(Mutex::new(OfflineState {
                sample_rate,
                buffer_size,
                session: None,
                taken_names: Vec::new(),
                ports: Vec::new(),
                next_handle: 1,
                callbacks: None,
                active: false,
                faults: Vec::new(),
            })),
        }
    }

    fn state(&self) -> MutexGuard<'_, OfflineState> {
        self.shared.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// 预先占用一个客户端名，之后同名 open 会被改名
    pub fn reserve_name(&self, name: &str) {
        self.state().taken_names.push(name.to_string());
    }

    /// 让下一次 `op` 以 `status` 失败
    pub fn inject_fault(&self, op: EngineOp, status: EngineStatus) {
        self.state().faults.push((op, status));
    }

    /// 为 Source 端口排队输入样本，后续块按顺序取用（不足时补零）
    pub fn queue_input(&self, port_name: &str, samples: &[Sample]) -> bool {
        match self.state().port_mut(port_name) {
            Some(port) if port.direction == Direction::Source => {
                port.pending_input.extend(samples.iter().copied());
                true
            }
            _ => false,
        }
    }

    /// 取走 Sink 端口至今输出的全部样本
    pub fn take_output(&self, port_name: &str) -> Vec<Sample> {
        self.state()
            .port_mut(port_name)
            .map(|p| std::mem::take(&mut p.captured_output))
            .unwrap_or_default()
    }

    pub fn is_active(&self) -> bool {
        self.state().active
    }

    pub fn is_open(&self) -> bool {
        self.state().session.is_some()
    }

    pub fn port_names(&self) -> Vec<String> {
        self.state().ports.iter().map(|p| p.name.clone()).collect()
    }

    /// 以引擎默认块大小跑一个块
    pub fn run_cycle(&self) -> EngineStatus {
        let frames = self.state().buffer_size;
        self.run_block(frames)
    }

    /// 跑一个 `nframes` 帧的块
    ///
    /// 未激活时什么都不做。回调在引擎锁内执行，因此 `deactivate` 会等待进行中的块结束。
    pub fn run_block(&self, nframes: u32) -> EngineStatus {
        let mut guard = self.state();
        let state = &mut *guard;

        if !state.active {
            return STATUS_OK;
        }
        let Some((process, _, client)) = state.callbacks else {
            return STATUS_OK;
        };

        let frames = nframes as usize;
        for port in state.ports.iter_mut() {
            port.block.clear();
            match port.direction {
                Direction::Source => {
                    let take = frames.min(port.pending_input.len());
                    port.block.extend(port.pending_input.drain(..take));
                    port.block.resize(frames, 0.0);
                }
                // NaN 填充：回调必须覆盖整块
                Direction::Sink => port.block.resize(frames, Sample::NAN),
            }
        }

        let status = process(client, nframes, &mut OfflineBlock { ports: &mut state.ports });

        for port in state.ports.iter_mut() {
            if port.direction == Direction::Sink {
                port.captured_output.extend_from_slice(&port.block);
            }
        }

        status
    }

    /// 模拟服务器关闭：停止处理并调用 shutdown 回调
    pub fn shutdown(&self, reason: &str) {
        let callbacks = {
            let mut state = self.state();
            state.active = false;
            state.callbacks
        };

        error(&format!("engine shut down: {}", reason));
        if let Some((_, shutdown, client)) = callbacks {
            shutdown(client, reason);
        }
    }
}

impl Default for OfflineEngine {
    fn default() -> Self {
        Self::new(48000, 256)
    }
}

impl AudioEngine for OfflineEngine {
    fn set_message_handlers(info: MessageHandler, error: MessageHandler) {
        let _ = HANDLERS.set((info, error));
    }

    fn open(&mut self, name: &str) -> Result<String, EngineStatus> {
        let mut state = self.state();
        state.take_fault(EngineOp::Open)?;
        if state.session.is_some() {
            return Err(ERR_ALREADY_OPEN);
        }

        let mut actual = name.to_string();
        let mut suffix = 1;
        while state.taken_names.contains(&actual) {
            actual = format!("{}-{:02}", name, suffix);
            suffix += 1;
        }

        state.taken_names.push(actual.clone());
        state.session = Some(actual.clone());
        drop(state);

        info(&format!("client '{}' opened", actual));
        Ok(actual)
    }

    fn close(&mut self) -> Result<(), EngineStatus> {
        let mut state = self.state();
        state.take_fault(EngineOp::Close)?;
        let Some(name) = state.session.take() else {
            return Err(ERR_NO_SESSION);
        };

        state.taken_names.retain(|n| *n != name);
        state.ports.clear();
        state.callbacks = None;
        state.active = false;
        drop(state);

        info(&format!("client '{}' closed", name));
        Ok(())
    }

    fn register_port(
        &mut self,
        name: &str,
        direction: Direction,
    ) -> Result<PortHandle, EngineStatus> {
        let mut state = self.state();
        state.take_fault(EngineOp::RegisterPort)?;
        state.require_session()?;
        if state.ports.iter().any(|p| p.name == name) {
            return Err(ERR_NAME_TAKEN);
        }

        let handle = PortHandle(state.next_handle);
        state.next_handle += 1;
        state.ports.push(OfflinePort {
            handle,
            name: name.to_string(),
            direction,
            pending_input: VecDeque::new(),
            captured_output: Vec::new(),
            block: Vec::new(),
        });
        Ok(handle)
    }

    fn unregister_port(&mut self, port: PortHandle) -> Result<(), EngineStatus> {
        let mut state = self.state();
        state.take_fault(EngineOp::UnregisterPort)?;
        let idx = state
            .ports
            .iter()
            .position(|p| p.handle == port)
            .ok_or(ERR_NO_SUCH_PORT)?;
        state.ports.remove(idx);
        Ok(())
    }

    fn set_callbacks(
        &mut self,
        process: ProcessCallback,
        shutdown: ShutdownCallback,
        client: ClientId,
    ) -> Result<(), EngineStatus> {
        let mut state = self.state();
        state.require_session()?;
        state.callbacks = Some((process, shutdown, client));
        Ok(())
    }

    fn activate(&mut self) -> Result<(), EngineStatus> {
        let mut state = self.state();
        state.take_fault(EngineOp::Activate)?;
        state.require_session()?;
        state.active = true;
        Ok(())
    }

    fn deactivate(&mut self) -> Result<(), EngineStatus> {
        let mut state = self.state();
        state.take_fault(EngineOp::Deactivate)?;
        state.active = false;
        Ok(())
    }

    fn sample_rate(&self) -> u32 {
        self.state().sample_rate
    }

    fn buffer_size(&self) -> u32 {
        self.state().buffer_size
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn silent_process(_: ClientId, _: u32, _: &mut dyn BlockBuffers) -> EngineStatus {
        STATUS_OK
    }

    fn ignore_shutdown(_: ClientId, _: &str) {}

    /// 把每个 Sink 填成常数 0.25
    fn fill_process(_: ClientId, _: u32, buffers: &mut dyn BlockBuffers) -> EngineStatus {
        if let Some(out) = buffers.port_buffer(PortHandle(2)) {
            out.fill(0.25);
        }
        STATUS_OK
    }

    #[test]
    fn test_open_renames_on_collision() {
        let mut engine = OfflineEngine::default();
        engine.reserve_name("test");
        engine.reserve_name("test-01");
        assert_eq!(engine.open("test").unwrap(), "test-02");
        assert_eq!(engine.open("again"), Err(ERR_ALREADY_OPEN));
    }

    #[test]
    fn test_port_registration_rules() {
        let mut engine = OfflineEngine::default();
        assert_eq!(
            engine.register_port("in1", Direction::Source),
            Err(ERR_NO_SESSION)
        );

        engine.open("ports").unwrap();
        let handle = engine.register_port("in1", Direction::Source).unwrap();
        assert_eq!(
            engine.register_port("in1", Direction::Sink),
            Err(ERR_NAME_TAKEN)
        );
        engine.unregister_port(handle).unwrap();
        assert_eq!(engine.unregister_port(handle), Err(ERR_NO_SUCH_PORT));
    }

    #[test]
    fn test_fault_is_one_shot() {
        let mut engine = OfflineEngine::default();
        engine.open("faults").unwrap();
        engine.inject_fault(EngineOp::Activate, -5);
        assert_eq!(engine.activate(), Err(-5));
        assert!(engine.activate().is_ok());
        assert!(engine.is_active());
    }

    #[test]
    fn test_run_block_captures_sink_output() {
        let mut engine = OfflineEngine::default();
        engine.open("blocks").unwrap();
        engine.register_port("in1", Direction::Source).unwrap();
        engine.register_port("out1", Direction::Sink).unwrap();
        engine
            .set_callbacks(fill_process, ignore_shutdown, ClientId(0))
            .unwrap();

        // 未激活时不调用回调
        engine.run_block(4);
        assert!(engine.take_output("out1").is_empty());

        engine.activate().unwrap();
        engine.run_block(4);
        engine.run_block(2);
        assert_eq!(engine.take_output("out1"), vec![0.25; 6]);
        assert!(engine.take_output("out1").is_empty());
    }

    #[test]
    fn test_queue_input_only_for_sources() {
        let mut engine = OfflineEngine::default();
        engine.open("inputs").unwrap();
        engine.register_port("in1", Direction::Source).unwrap();
        engine.register_port("out1", Direction::Sink).unwrap();
        engine
            .set_callbacks(silent_process, ignore_shutdown, ClientId(0))
            .unwrap();

        assert!(engine.queue_input("in1", &[1.0, 2.0]));
        assert!(!engine.queue_input("out1", &[1.0]));
        assert!(!engine.queue_input("missing", &[1.0]));
    }

    #[test]
    fn test_close_releases_name_and_ports() {
        let mut engine = OfflineEngine::default();
        engine.open("closing").unwrap();
        engine.register_port("in1", Direction::Source).unwrap();
        engine.close().unwrap();

        assert!(!engine.is_open());
        assert!(engine.port_names().is_empty());
        assert_eq!(engine.open("closing").unwrap(), "closing");
    }
}
