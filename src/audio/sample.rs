//! 样本单位和字节视图
//!
//! 样本是不透明的定宽浮点值，Ring Buffer 只按字节搬运，不做任何格式转换。

/// 一个样本（与引擎的块缓冲区格式一致）
pub type Sample = f32;

/// 每样本的字节数
pub const SAMPLE_BYTES: usize = std::mem::size_of::<Sample>();

/// 样本数 → 字节数
#[inline]
pub fn samples_to_bytes(samples: usize) -> usize {
    samples * SAMPLE_BYTES
}

/// 字节数 → 完整样本数（不足一个样本的尾部被舍去）
#[inline]
pub fn bytes_to_samples(bytes: usize) -> usize {
    bytes / SAMPLE_BYTES
}

/// 样本切片的只读字节视图
#[inline]
pub fn as_bytes(samples: &[Sample]) -> &[u8] {
    // f32 没有 padding，任意对齐到 1 的字节视图都合法
    unsafe { std::slice::from_raw_parts(samples.as_ptr() as *const u8, samples.len() * SAMPLE_BYTES) }
}

/// 样本切片的可写字节视图
#[inline]
pub fn as_bytes_mut(samples: &mut [Sample]) -> &mut [u8] {
    // 任意字节组合都是合法的 f32 位模式
    unsafe {
        std::slice::from_raw_parts_mut(
            samples.as_mut_ptr() as *mut u8,
            samples.len() * SAMPLE_BYTES,
        )
    }
}
