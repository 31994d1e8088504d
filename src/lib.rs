//! rtstream
//!
//! Blocking sample streams on top of a real-time, callback-driven audio engine.
//!
//! 应用线程通过 [`Source::read`] / [`Sink::write`] 阻塞读写样本；
//! 引擎的实时线程在每个块回调里只做无锁的 Ring Buffer 拷贝，
//! 再由通知器线程把阻塞的读写方唤醒。

pub mod audio;
pub mod client;
pub mod engine;
mod error;

pub use audio::{Sample, StatsReport};
pub use client::{Client, ClientConfig, Sink, Source, MAX_CLIENTS};
pub use engine::{AudioEngine, Direction, EngineStatus, OfflineEngine};
pub use error::{Result, StreamError};
