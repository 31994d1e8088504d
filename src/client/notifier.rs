//! 跨线程通知器
//!
//! 实时线程在每次回调结束时 `raise`：置位 pending 标志，若之前未置位则 unpark
//! 通知器线程。不分配、不加锁、不阻塞；尚未被消费的多次 raise 合并为一次唤醒。
//!
//! 通知器线程（非实时）被唤醒后执行 buffer 管理：广播每个端口的 ring condition，
//! 让阻塞在 read/write 上的应用线程重试。

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle, Thread};

use super::port::Port;
use crate::audio::ClientStats;

struct NotifierShared {
    pending: AtomicBool,
    running: AtomicBool,
    ports: Mutex<Vec<Arc<Port>>>,
    stats: Arc<ClientStats>,
}

impl NotifierShared {
    fn manage_buffers(&self) {
        let ports = self.ports.lock().unwrap_or_else(PoisonError::into_inner);
        for port in ports.iter() {
            port.wake();
        }
    }
}

/// 实时侧持有的触发句柄
#[derive(Clone)]
pub(crate) struct NotifyHandle {
    shared: Arc<NotifierShared>,
    thread: Thread,
}

impl NotifyHandle {
    /// 实时线程调用
    ///
    /// `Thread::unpark` 只做一次原子交换，必要时再发一次 futex 唤醒，不会阻塞
    #[inline]
    pub(crate) fn raise(&self) {
        self.shared.stats.record_raise();
        if !self.shared.pending.swap(true, Ordering::AcqRel) {
            self.thread.unpark();
        }
    }
}

/// 通知器及其消费线程
pub(crate) struct Notifier {
    shared: Arc<NotifierShared>,
    thread: Thread,
    join: Option<JoinHandle<()>>,
}

impl Notifier {
    pub(crate) fn spawn(client_name: &str, stats: Arc<ClientStats>) -> io::Result<Self> {
        let shared = Arc::new(NotifierShared {
            pending: AtomicBool::new(false),
            running: AtomicBool::new(true),
            ports: Mutex::new(Vec::new()),
            stats,
        });

        let join = {
            let shared = Arc::clone(&shared);
            thread::Builder::new()
                .name(format!("{}-notify", client_name))
                .spawn(move || notifier_main(shared))?
        };

        Ok(Self {
            shared,
            thread: join.thread().clone(),
            join: Some(join),
        })
    }

    pub(crate) fn handle(&self) -> NotifyHandle {
        NotifyHandle {
            shared: Arc::clone(&self.shared),
            thread: self.thread.clone(),
        }
    }

    /// 替换需要唤醒的端口集合（只在客户端未激活时调用）
    pub(crate) fn set_ports(&self, ports: Vec<Arc<Port>>) {
        *self.shared.ports.lock().unwrap_or_else(PoisonError::into_inner) = ports;
    }

    /// 在调用线程上直接执行一次 buffer 管理
    pub(crate) fn wake_all(&self) {
        self.shared.manage_buffers();
    }

    pub(crate) fn stop(&mut self) {
        let Some(join) = self.join.take() else {
            return;
        };

        self.shared.running.store(false, Ordering::Release);
        self.thread.unpark();
        if join.join().is_err() {
            log::error!("Notifier thread panicked");
        }
        log::debug!("Notifier thread stopped");
    }
}

impl Drop for Notifier {
    fn drop(&mut self) {
        self.stop();
    }
}

fn notifier_main(shared: Arc<NotifierShared>) {
    log::debug!("Notifier thread started");

    // park 可能虚假返回，所以以 pending 标志为准
    // unpark 先于 park 时，下次 park 立即返回，不会丢失唤醒
    while shared.running.load(Ordering::Acquire) {
        thread::park();

        if shared.pending.swap(false, Ordering::AcqRel) {
            shared.stats.record_wakeup();
            shared.manage_buffers();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{Direction, PortHandle};
    use std::time::{Duration, Instant};

    fn wait_for(mut cond: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if cond() {
                return true;
            }
            thread::sleep(Duration::from_millis(1));
        }
        false
    }

    #[test]
    fn test_raise_wakes_port_conditions() {
        let stats = Arc::new(ClientStats::new());
        let notifier = Notifier::spawn("wake", Arc::clone(&stats)).unwrap();
        let port = Arc::new(Port::new("out1", Direction::Sink, PortHandle(1), 64));
        notifier.set_ports(vec![Arc::clone(&port)]);

        let seen = port.condition().generation();

        notifier.handle().raise();
        assert!(wait_for(|| port.condition().generation() != seen));
        assert!(stats.notifier_wakeups() >= 1);
        assert_eq!(stats.notifier_raises(), 1);
    }

    #[test]
    fn test_raises_coalesce() {
        let stats = Arc::new(ClientStats::new());
        let notifier = Notifier::spawn("coalesce", Arc::clone(&stats)).unwrap();
        let handle = notifier.handle();

        for _ in 0..1000 {
            handle.raise();
        }

        assert!(wait_for(|| stats.notifier_wakeups() >= 1));
        assert_eq!(stats.notifier_raises(), 1000);
        assert!(stats.notifier_wakeups() <= 1000);
    }

    #[test]
    fn test_stop_joins_thread() {
        let stats = Arc::new(ClientStats::new());
        let mut notifier = Notifier::spawn("stop", stats).unwrap();
        notifier.stop();
        // 重复 stop 是空操作
        notifier.stop();
        assert!(notifier.join.is_none());
    }
}
