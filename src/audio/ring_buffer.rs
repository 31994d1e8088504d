//! Lock-free Single-Producer Single-Consumer 字节环形缓冲区
//!
//! 设计目标：
//! - 零锁：生产者和消费者完全无锁操作
//! - 零分配：所有内存在初始化时预分配
//! - 缓存友好：读写游标各自独占一个 cache line，避免 false sharing
//! - 内存锁定：可选 mlock 防止 page fault
//!
//! 实时线程永远在其中一侧，另一侧最多一个应用线程。
//! 唯一的例外是 `read_advance`：Source 溢出时由生产者（实时线程）推进读游标，
//! 因此读游标的提交使用 CAS，保证丢弃的字节不会被重复计算或丢失。

use std::cell::UnsafeCell;
use std::ptr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use crossbeam_utils::CachePadded;

/// SPSC 无锁字节环形缓冲区
///
/// 游标单调递增（wrapping），下标通过 `& mask` 取模。
/// 不变量：`write_pos - read_pos <= capacity`
pub struct RingBuffer {
    buffer: Box<[UnsafeCell<u8>]>,
    capacity: usize,
    mask: usize,

    write_pos: CachePadded<AtomicUsize>,
    read_pos: CachePadded<AtomicUsize>,

    memory_locked: AtomicBool,
}

unsafe impl Send for RingBuffer {}
unsafe impl Sync for RingBuffer {}

impl RingBuffer {
    /// 创建指定容量（字节）的 Ring Buffer
    ///
    /// capacity 必须是 2 的幂
    pub fn new(capacity: usize) -> Self {
        assert!(capacity.is_power_of_two(), "capacity must be power of two");

        let buffer: Vec<UnsafeCell<u8>> = (0..capacity).map(|_| UnsafeCell::new(0)).collect();

        Self {
            buffer: buffer.into_boxed_slice(),
            capacity,
            mask: capacity - 1,
            write_pos: CachePadded::new(AtomicUsize::new(0)),
            read_pos: CachePadded::new(AtomicUsize::new(0)),
            memory_locked: AtomicBool::new(false),
        }
    }

    /// 创建指定最小容量的 Ring Buffer（自动向上取整到 2 的幂）
    pub fn with_min_capacity(min_capacity: usize) -> Self {
        Self::new(min_capacity.max(1).next_power_of_two())
    }

    /// 锁定缓冲区内存，防止被换页
    ///
    /// 返回是否成功锁定
    #[cfg(unix)]
    pub fn lock_memory(&self) -> bool {
        if self.memory_locked.load(Ordering::Acquire) {
            return true;
        }

        let ptr = self.base_ptr() as *const libc::c_void;
        let result = unsafe { libc::mlock(ptr, self.capacity) };

        if result == 0 {
            self.memory_locked.store(true, Ordering::Release);
            log::debug!("Ring buffer memory locked: {} bytes", self.capacity);
            true
        } else {
            log::warn!(
                "Failed to lock ring buffer memory: {}",
                std::io::Error::last_os_error()
            );
            false
        }
    }

    #[cfg(not(unix))]
    pub fn lock_memory(&self) -> bool {
        false
    }

    /// 解锁缓冲区内存
    pub fn unlock_memory(&self) {
        if !self.memory_locked.swap(false, Ordering::AcqRel) {
            return;
        }

        #[cfg(unix)]
        unsafe {
            libc::munlock(self.base_ptr() as *const libc::c_void, self.capacity);
        }
        log::debug!("Ring buffer memory unlocked");
    }

    /// 检查内存是否已锁定
    pub fn is_memory_locked(&self) -> bool {
        self.memory_locked.load(Ordering::Acquire)
    }

    /// 写入字节（生产者调用）
    ///
    /// 返回实际写入的字节数，可能小于 `data.len()`。
    /// wait-free，绝不阻塞，绝不分配
    #[inline]
    pub fn write(&self, data: &[u8]) -> usize {
        let write = self.write_pos.load(Ordering::Relaxed);
        let read = self.read_pos.load(Ordering::Acquire);

        let used = write.wrapping_sub(read);
        debug_assert!(used <= self.capacity, "ring buffer invariant violated: used > capacity");

        let free = self.capacity - used.min(self.capacity);
        let to_write = data.len().min(free);

        unsafe { self.copy_in(write, &data[..to_write]) };

        self.write_pos
            .store(write.wrapping_add(to_write), Ordering::Release);
        to_write
    }

    /// 读取字节（消费者调用）
    ///
    /// 返回实际读取的字节数。
    /// 如果在拷贝期间生产者通过 `read_advance` 丢弃了数据，本次拷贝作废并从新游标重读。
    #[inline]
    pub fn read(&self, output: &mut [u8]) -> usize {
        loop {
            let read = self.read_pos.load(Ordering::Acquire);
            let write = self.write_pos.load(Ordering::Acquire);

            // 两次 load 之间生产者可能已经 make_room + write，
            // 旧的 read 配新的 write 会超出容量，游标不一致时重新取
            let available = write.wrapping_sub(read);
            if available > self.capacity {
                continue;
            }
            let to_read = output.len().min(available);

            unsafe { self.copy_out(read, &mut output[..to_read]) };

            if self
                .read_pos
                .compare_exchange(
                    read,
                    read.wrapping_add(to_read),
                    Ordering::AcqRel,
                    Ordering::Acquire,
                )
                .is_ok()
            {
                return to_read;
            }
        }
    }

    /// 丢弃最多 `n` 个可读字节而不拷贝
    ///
    /// 返回实际丢弃的字节数
    #[inline]
    pub fn read_advance(&self, n: usize) -> usize {
        loop {
            let read = self.read_pos.load(Ordering::Acquire);
            let write = self.write_pos.load(Ordering::Acquire);

            let available = write.wrapping_sub(read);
            if available > self.capacity {
                continue;
            }
            let skip = n.min(available);
            if skip == 0 {
                return 0;
            }

            if self
                .read_pos
                .compare_exchange(
                    read,
                    read.wrapping_add(skip),
                    Ordering::AcqRel,
                    Ordering::Acquire,
                )
                .is_ok()
            {
                return skip;
            }
        }
    }

    /// 生产者侧：丢弃最旧的数据，直到至少有 `len` 字节空闲
    ///
    /// 等价于 `read_advance(len - free_space())`，但空闲空间的计算和游标推进
    /// 在同一次 CAS 中完成，消费者并发读取时不会多丢。返回实际丢弃的字节数
    #[inline]
    pub fn make_room(&self, len: usize) -> usize {
        let len = len.min(self.capacity);
        loop {
            let read = self.read_pos.load(Ordering::Acquire);
            let write = self.write_pos.load(Ordering::Relaxed);

            let free = self.capacity - write.wrapping_sub(read).min(self.capacity);
            if free >= len {
                return 0;
            }

            let skip = len - free;
            if self
                .read_pos
                .compare_exchange(
                    read,
                    read.wrapping_add(skip),
                    Ordering::AcqRel,
                    Ordering::Acquire,
                )
                .is_ok()
            {
                return skip;
            }
        }
    }

    /// 当前可读字节数
    #[inline]
    pub fn occupied_space(&self) -> usize {
        // 先读 read：write 单调递增，保证 write >= read
        let read = self.read_pos.load(Ordering::Acquire);
        let write = self.write_pos.load(Ordering::Acquire);
        write.wrapping_sub(read).min(self.capacity)
    }

    /// 当前可写字节数
    #[inline]
    pub fn free_space(&self) -> usize {
        self.capacity - self.occupied_space()
    }

    /// 容量（字节）
    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// 缓冲区填充比例（用于监控）
    #[inline]
    pub fn fill_ratio(&self) -> f64 {
        self.occupied_space() as f64 / self.capacity as f64
    }

    #[inline]
    fn base_ptr(&self) -> *mut u8 {
        UnsafeCell::raw_get(self.buffer.as_ptr())
    }

    /// 从游标 `pos` 开始写入，最多分两段（环绕）
    ///
    /// 调用方保证 `src.len()` 不超过空闲空间
    #[inline]
    unsafe fn copy_in(&self, pos: usize, src: &[u8]) {
        let start = pos & self.mask;
        let first = src.len().min(self.capacity - start);
        let base = self.base_ptr();

        ptr::copy_nonoverlapping(src.as_ptr(), base.add(start), first);
        ptr::copy_nonoverlapping(src.as_ptr().add(first), base, src.len() - first);
    }

    #[inline]
    unsafe fn copy_out(&self, pos: usize, dst: &mut [u8]) {
        let start = pos & self.mask;
        let first = dst.len().min(self.capacity - start);
        let base = self.base_ptr();

        ptr::copy_nonoverlapping(base.add(start), dst.as_mut_ptr(), first);
        ptr::copy_nonoverlapping(base, dst.as_mut_ptr().add(first), dst.len() - first);
    }
}

impl Drop for RingBuffer {
    fn drop(&mut self) {
        self.unlock_memory();
    }
}
