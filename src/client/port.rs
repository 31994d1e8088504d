//! 端口：一个 Ring Buffer + 一个 ring condition
//!
//! Source 和 Sink 共用同一个 [`Port`]，只有方向不同：
//! - Source：实时线程 `capture` 写入，应用线程 [`Source::read`] 阻塞读出
//! - Sink：应用线程 [`Sink::write`] 阻塞写入，实时线程 `playback` 读出
//!
//! ring condition 只在应用线程和通知器线程之间使用，实时线程从不触碰。

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::time::{Duration, Instant};

use crate::audio::sample::{as_bytes, as_bytes_mut, bytes_to_samples};
use crate::audio::{PortStats, RingBuffer, Sample};
use crate::engine::{Direction, PortHandle};

/// 应用侧的等待/唤醒原语
///
/// 每次 `notify_all` 递增 generation。等待方先记录 generation 再尝试传输，
/// 传输不完整时只等待 generation 变化，避免尝试与等待之间的唤醒丢失。
pub struct RingCondition {
    generation: Mutex<u64>,
    cond: Condvar,
}

impl RingCondition {
    pub fn new() -> Self {
        Self {
            generation: Mutex::new(0),
            cond: Condvar::new(),
        }
    }

    pub fn generation(&self) -> u64 {
        *self.generation.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// 唤醒所有等待者
    pub fn notify_all(&self) {
        let mut generation = self.generation.lock().unwrap_or_else(PoisonError::into_inner);
        *generation = generation.wrapping_add(1);
        self.cond.notify_all();
    }

    /// 阻塞直到 generation 不再等于 `seen`
    pub fn wait_past(&self, seen: u64) {
        let mut generation = self.generation.lock().unwrap_or_else(PoisonError::into_inner);
        while *generation == seen {
            generation = self
                .cond
                .wait(generation)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    /// 同 `wait_past`，超过 `deadline` 返回 false
    pub fn wait_past_until(&self, seen: u64, deadline: Instant) -> bool {
        let mut generation = self.generation.lock().unwrap_or_else(PoisonError::into_inner);
        while *generation == seen {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            let (guard, _) = self
                .cond
                .wait_timeout(generation, deadline - now)
                .unwrap_or_else(PoisonError::into_inner);
            generation = guard;
        }
        true
    }
}

impl Default for RingCondition {
    fn default() -> Self {
        Self::new()
    }
}

/// 已注册的端口
pub(crate) struct Port {
    name: String,
    direction: Direction,
    handle: PortHandle,
    ring: RingBuffer,
    condition: RingCondition,
    stats: PortStats,
    registered: AtomicBool,
}

impl Port {
    pub(crate) fn new(
        name: &str,
        direction: Direction,
        handle: PortHandle,
        ring_bytes: usize,
    ) -> Self {
        Self {
            name: name.to_string(),
            direction,
            handle,
            ring: RingBuffer::with_min_capacity(ring_bytes),
            condition: RingCondition::new(),
            stats: PortStats::new(),
            registered: AtomicBool::new(true),
        }
    }

    pub(crate) fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn direction(&self) -> Direction {
        self.direction
    }

    pub(crate) fn handle(&self) -> PortHandle {
        self.handle
    }

    pub(crate) fn ring(&self) -> &RingBuffer {
        &self.ring
    }

    pub(crate) fn stats(&self) -> &PortStats {
        &self.stats
    }

    pub(crate) fn condition(&self) -> &RingCondition {
        &self.condition
    }

    pub(crate) fn is_registered(&self) -> bool {
        self.registered.load(Ordering::Acquire)
    }

    pub(crate) fn mark_unregistered(&self) {
        self.registered.store(false, Ordering::Release);
        self.condition.notify_all();
    }

    /// 实时线程：把一个输入块写入 Ring Buffer（Source）
    ///
    /// 空间不足时先从读端丢弃恰好不足的字节（overwrite-oldest），
    /// 保证整块写入。比整个缓冲区还大的块只保留最新的部分。
    /// 返回丢弃的字节数
    #[inline]
    pub(crate) fn capture(&self, block: &[u8]) -> usize {
        let capacity = self.ring.capacity();
        let (mut discarded, block) = if block.len() > capacity {
            let skip = block.len() - capacity;
            (skip, &block[skip..])
        } else {
            (0, block)
        };

        discarded += self.ring.make_room(block.len());
        if discarded > 0 {
            self.stats.record_overflow(discarded);
        }

        let written = self.ring.write(block);
        self.stats.add_transferred(written);
        discarded
    }

    /// 实时线程：从 Ring Buffer 读出一个输出块（Sink）
    ///
    /// 数据不够则补零，输出静音而不是旧数据。返回读到的字节数
    #[inline]
    pub(crate) fn playback(&self, out: &mut [u8]) -> usize {
        let read = self.ring.read(out);
        self.stats.add_transferred(read);

        if read < out.len() {
            out[read..].fill(0);
            self.stats.record_underrun(out.len() - read);
        }
        read
    }

    /// 通知器线程：唤醒阻塞在本端口上的应用线程
    pub(crate) fn wake(&self) {
        self.condition.notify_all();
    }

    /// 反复执行 `step` 直到传输 `len` 字节，期间在 ring condition 上阻塞
    ///
    /// `step(offset)` 从 `offset` 开始做一次非阻塞的部分传输并返回传输的字节数。
    /// 有 `deadline` 时超时返回已传输的字节数
    fn transfer(
        &self,
        len: usize,
        deadline: Option<Instant>,
        mut step: impl FnMut(usize) -> usize,
    ) -> usize {
        let mut done = 0;

        while done < len {
            if !self.is_registered() {
                log::warn!("Port '{}' is no longer registered, transfer abandoned", self.name);
                break;
            }

            let seen = self.condition.generation();
            done += step(done);
            if done == len {
                break;
            }

            match deadline {
                None => self.condition.wait_past(seen),
                Some(deadline) => {
                    if !self.condition.wait_past_until(seen, deadline) {
                        break;
                    }
                }
            }
        }

        done
    }
}

/// 引擎 → 应用的端口句柄
///
/// 每个端口只有一个句柄，读操作需要 `&mut self`，因此同一端口不会有两个并发读者。
pub struct Source {
    pub(crate) port: Arc<Port>,
}

impl Source {
    pub fn name(&self) -> &str {
        self.port.name()
    }

    /// 阻塞读取，直到 `buffer` 被完全填满
    ///
    /// 返回读取的样本数，总是等于 `buffer.len()`。
    /// 没有上限：如果引擎不再运行，会一直阻塞（见 [`Source::read_timeout`]）。
    /// 端口被注销后立即返回已读部分。
    pub fn read(&mut self, buffer: &mut [Sample]) -> usize {
        self.read_inner(buffer, None)
    }

    /// 同 `read`，但最多阻塞 `timeout`，返回实际读取的完整样本数
    pub fn read_timeout(&mut self, buffer: &mut [Sample], timeout: Duration) -> usize {
        self.read_inner(buffer, Some(Instant::now() + timeout))
    }

    fn read_inner(&mut self, buffer: &mut [Sample], deadline: Option<Instant>) -> usize {
        let port = &self.port;
        let bytes = as_bytes_mut(buffer);
        let len = bytes.len();

        let done = port.transfer(len, deadline, |offset| port.ring.read(&mut bytes[offset..]));
        bytes_to_samples(done)
    }

    /// 当前可读样本数
    pub fn available(&self) -> usize {
        bytes_to_samples(self.port.ring.occupied_space())
    }

    /// Ring Buffer 容量（样本数）
    pub fn capacity(&self) -> usize {
        bytes_to_samples(self.port.ring.capacity())
    }

    /// 溢出时被丢弃的字节总数
    pub fn dropped_bytes(&self) -> u64 {
        self.port.stats.overflow_bytes()
    }

    pub fn is_registered(&self) -> bool {
        self.port.is_registered()
    }
}

/// 应用 → 引擎的端口句柄
pub struct Sink {
    pub(crate) port: Arc<Port>,
}

impl Sink {
    pub fn name(&self) -> &str {
        self.port.name()
    }

    /// 阻塞写入，直到 `samples` 全部进入 Ring Buffer
    ///
    /// 返回写入的样本数，总是等于 `samples.len()`；不会部分失败，只会阻塞。
    pub fn write(&mut self, samples: &[Sample]) -> usize {
        self.write_inner(samples, None)
    }

    /// 同 `write`，但最多阻塞 `timeout`，返回实际写入的完整样本数
    pub fn write_timeout(&mut self, samples: &[Sample], timeout: Duration) -> usize {
        self.write_inner(samples, Some(Instant::now() + timeout))
    }

    fn write_inner(&mut self, samples: &[Sample], deadline: Option<Instant>) -> usize {
        let port = &self.port;
        let bytes = as_bytes(samples);

        let done = port.transfer(bytes.len(), deadline, |offset| port.ring.write(&bytes[offset..]));
        bytes_to_samples(done)
    }

    /// 当前可写样本数
    pub fn free_space(&self) -> usize {
        bytes_to_samples(self.port.ring.free_space())
    }

    /// 尚未被实时线程取走的样本数
    pub fn pending(&self) -> usize {
        bytes_to_samples(self.port.ring.occupied_space())
    }

    pub fn capacity(&self) -> usize {
        bytes_to_samples(self.port.ring.capacity())
    }

    /// 欠载时补零的字节总数
    pub fn underrun_bytes(&self) -> u64 {
        self.port.stats.underrun_bytes()
    }

    pub fn is_registered(&self) -> bool {
        self.port.is_registered()
    }
}
