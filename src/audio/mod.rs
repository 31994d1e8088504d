//! 音频核心模块
//!
//! 包含：
//! - Ring Buffer: Lock-free 字节数据传递
//! - Sample: 样本单位和字节视图
//! - Stats: 溢出/欠载/回调统计

pub mod ring_buffer;
pub mod sample;
pub mod stats;

pub use ring_buffer::RingBuffer;
pub use sample::{Sample, SAMPLE_BYTES};
pub use stats::{ClientStats, PortReport, PortStats, StatsReport};
