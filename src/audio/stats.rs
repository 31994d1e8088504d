//! 流统计模块
//!
//! 计数器在实时回调中更新，全部是 Relaxed 原子操作，无锁无分配。
//! 报告在应用线程按需生成。

use std::sync::atomic::{AtomicU64, Ordering};

/// 单个端口的统计
///
/// - Source：溢出时被丢弃的最旧数据（overwrite-oldest 策略）
/// - Sink：欠载时补零的字节
pub struct PortStats {
    overflow_events: AtomicU64,
    overflow_bytes: AtomicU64,
    underrun_events: AtomicU64,
    underrun_bytes: AtomicU64,
    bytes_transferred: AtomicU64,
}

impl PortStats {
    pub fn new() -> Self {
        Self {
            overflow_events: AtomicU64::new(0),
            overflow_bytes: AtomicU64::new(0),
            underrun_events: AtomicU64::new(0),
            underrun_bytes: AtomicU64::new(0),
            bytes_transferred: AtomicU64::new(0),
        }
    }

    /// 记录一次溢出丢弃
    #[inline]
    pub fn record_overflow(&self, bytes: usize) {
        self.overflow_events.fetch_add(1, Ordering::Relaxed);
        self.overflow_bytes.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    /// 记录一次欠载补零
    #[inline]
    pub fn record_underrun(&self, bytes: usize) {
        self.underrun_events.fetch_add(1, Ordering::Relaxed);
        self.underrun_bytes.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    /// 实时侧与 Ring Buffer 之间实际搬运的字节
    #[inline]
    pub fn add_transferred(&self, bytes: usize) {
        self.bytes_transferred
            .fetch_add(bytes as u64, Ordering::Relaxed);
    }

    #[inline]
    pub fn overflow_events(&self) -> u64 {
        self.overflow_events.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn overflow_bytes(&self) -> u64 {
        self.overflow_bytes.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn underrun_events(&self) -> u64 {
        self.underrun_events.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn underrun_bytes(&self) -> u64 {
        self.underrun_bytes.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn bytes_transferred(&self) -> u64 {
        self.bytes_transferred.load(Ordering::Relaxed)
    }
}

impl Default for PortStats {
    fn default() -> Self {
        Self::new()
    }
}

/// 客户端级统计：回调次数、处理帧数、通知器的触发与唤醒
pub struct ClientStats {
    callback_count: AtomicU64,
    frames_processed: AtomicU64,
    notifier_raises: AtomicU64,
    notifier_wakeups: AtomicU64,
}

impl ClientStats {
    pub fn new() -> Self {
        Self {
            callback_count: AtomicU64::new(0),
            frames_processed: AtomicU64::new(0),
            notifier_raises: AtomicU64::new(0),
            notifier_wakeups: AtomicU64::new(0),
        }
    }

    /// 在实时回调内调用
    #[inline]
    pub fn on_callback(&self, nframes: u32) {
        self.callback_count.fetch_add(1, Ordering::Relaxed);
        self.frames_processed
            .fetch_add(nframes as u64, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_raise(&self) {
        self.notifier_raises.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_wakeup(&self) {
        self.notifier_wakeups.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn callback_count(&self) -> u64 {
        self.callback_count.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn frames_processed(&self) -> u64 {
        self.frames_processed.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn notifier_raises(&self) -> u64 {
        self.notifier_raises.load(Ordering::Relaxed)
    }

    /// 通知器线程实际执行 buffer 管理的次数（≤ raises，多次触发会合并）
    #[inline]
    pub fn notifier_wakeups(&self) -> u64 {
        self.notifier_wakeups.load(Ordering::Relaxed)
    }
}

impl Default for ClientStats {
    fn default() -> Self {
        Self::new()
    }
}

/// 单个端口的报告行
#[derive(Debug, Clone)]
pub struct PortReport {
    pub name: String,
    pub is_source: bool,
    pub fill_ratio: f64,
    pub bytes_transferred: u64,
    pub overflow_events: u64,
    pub overflow_bytes: u64,
    pub underrun_events: u64,
    pub underrun_bytes: u64,
}

/// 统计报告
#[derive(Debug, Clone)]
pub struct StatsReport {
    pub client_name: String,
    pub active: bool,
    pub callback_count: u64,
    pub frames_processed: u64,
    pub notifier_raises: u64,
    pub notifier_wakeups: u64,
    pub ports: Vec<PortReport>,
}

impl StatsReport {
    /// 所有 Source 丢弃的字节总数
    pub fn total_overflow_bytes(&self) -> u64 {
        self.ports.iter().map(|p| p.overflow_bytes).sum()
    }

    /// 所有 Sink 补零的字节总数
    pub fn total_underrun_bytes(&self) -> u64 {
        self.ports.iter().map(|p| p.underrun_bytes).sum()
    }
}

impl std::fmt::Display for StatsReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "Stream Statistics: {}", self.client_name)?;
        writeln!(f, "===================")?;
        writeln!(f, "Active: {}", self.active)?;
        writeln!(f, "Total callbacks: {}", self.callback_count)?;
        writeln!(f, "Frames processed: {}", self.frames_processed)?;
        writeln!(
            f,
            "Notifier: {} raises, {} wake-ups",
            self.notifier_raises, self.notifier_wakeups
        )?;
        writeln!(f)?;

        for port in &self.ports {
            let kind = if port.is_source { "source" } else { "sink" };
            writeln!(f, "Port '{}' ({}):", port.name, kind)?;
            writeln!(f, "  Fill: {:.1}%", port.fill_ratio * 100.0)?;
            writeln!(f, "  Transferred: {} bytes", port.bytes_transferred)?;
            if port.is_source {
                writeln!(
                    f,
                    "  Overflows: {} ({} bytes discarded)",
                    port.overflow_events, port.overflow_bytes
                )?;
            } else {
                writeln!(
                    f,
                    "  Underruns: {} ({} bytes zero-filled)",
                    port.underrun_events, port.underrun_bytes
                )?;
            }
        }

        Ok(())
    }
}
