//! 进程内客户端注册表
//!
//! 引擎只把一个不透明的 [`ClientId`] 交给实时回调。回调用它索引一个静态槽位表，
//! 一次原子 load 取得激活时发布的 [`ProcessState`]：无锁、无分配。
//!
//! 槽位生命周期：
//! - `claim`：客户端打开时占用
//! - `publish`：激活前发布实时状态
//! - `retract`：引擎停用返回后（或激活失败后）收回，此时不会有进行中的回调
//! - `release`：客户端关闭时归还

use std::ptr;
use std::sync::atomic::{AtomicBool, AtomicPtr, Ordering};

use super::process::ProcessState;
use crate::engine::ClientId;

/// 同时存在的客户端上限
pub const MAX_CLIENTS: usize = 64;

struct Slot {
    claimed: AtomicBool,
    state: AtomicPtr<ProcessState>,
    shut_down: AtomicBool,
}

impl Slot {
    const fn new() -> Self {
        Self {
            claimed: AtomicBool::new(false),
            state: AtomicPtr::new(ptr::null_mut()),
            shut_down: AtomicBool::new(false),
        }
    }
}

static SLOTS: [Slot; MAX_CLIENTS] = [const { Slot::new() }; MAX_CLIENTS];

fn slot(id: ClientId) -> Option<&'static Slot> {
    SLOTS.get(id.0)
}

/// 占用一个空闲槽位
pub(crate) fn claim() -> Option<ClientId> {
    SLOTS.iter().enumerate().find_map(|(idx, slot)| {
        slot.claimed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| {
                slot.shut_down.store(false, Ordering::Release);
                ClientId(idx)
            })
    })
}

/// 归还槽位，残留的实时状态一并释放
pub(crate) fn release(id: ClientId) {
    if let Some(slot) = slot(id) {
        debug_assert!(
            slot.state.load(Ordering::Acquire).is_null(),
            "releasing a slot with published process state"
        );
        drop(retract(id));
        slot.claimed.store(false, Ordering::Release);
    }
}

/// 发布实时状态
pub(crate) fn publish(id: ClientId, state: Box<ProcessState>) {
    if let Some(slot) = slot(id) {
        let previous = slot.state.swap(Box::into_raw(state), Ordering::AcqRel);
        if !previous.is_null() {
            // 只有在不会有回调并发运行时才会覆盖，见 Client::activate
            drop(unsafe { Box::from_raw(previous) });
        }
    }
}

/// 收回实时状态
///
/// 调用方保证此时引擎没有进行中的 process 回调
pub(crate) fn retract(id: ClientId) -> Option<Box<ProcessState>> {
    let slot = slot(id)?;
    let state = slot.state.swap(ptr::null_mut(), Ordering::AcqRel);
    if state.is_null() {
        None
    } else {
        Some(unsafe { Box::from_raw(state) })
    }
}

/// 实时回调：取得已发布的状态；未发布（或 id 无效）时返回 None
#[inline]
pub(crate) fn with_state<R>(id: ClientId, f: impl FnOnce(&ProcessState) -> R) -> Option<R> {
    let state = slot(id)?.state.load(Ordering::Acquire);
    if state.is_null() {
        return None;
    }
    // publish 与 retract 之间指针一直有效，retract 只在引擎停用后发生
    Some(f(unsafe { &*state }))
}

pub(crate) fn mark_shut_down(id: ClientId) {
    if let Some(slot) = slot(id) {
        slot.shut_down.store(true, Ordering::Release);
    }
}

pub(crate) fn is_shut_down(id: ClientId) -> bool {
    slot(id).is_some_and(|slot| slot.shut_down.load(Ordering::Acquire))
}
