//! 길이별 버퍼 풀.
//!
//! 지표 재계산은 틱마다 필드 수만큼 출력 배열이 필요합니다. 풀은 길이를 키로 하는
//! 유휴 목록을 유지해 `acquire`/`release`를 O(1)로 처리합니다.
//!
//! 꺼낸 버퍼는 반납 전까지 호출자가 독점합니다. `release`가 버퍼를 소비하므로
//! 같은 값을 두 번 반납하는 코드는 컴파일되지 않습니다.
//!
//! ```compile_fail
//! use market_analytics::BufferPool;
//!
//! let mut pool = BufferPool::new();
//! let buf = pool.acquire(8);
//! pool.release(buf).unwrap();
//! pool.release(buf).unwrap(); // 이미 이동된 값
//! ```

use std::collections::HashMap;
use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicU64, Ordering};
use thiserror::Error;

/// 풀 식별자 발급용 카운터.
static NEXT_POOL_ID: AtomicU64 = AtomicU64::new(1);

/// 길이 하나당 보관하는 유휴 버퍼 기본 상한.
const DEFAULT_MAX_IDLE_PER_LENGTH: usize = 32;

/// 버퍼 오사용 에러.
///
/// 모두 프로그래밍 오류이며 재시도 대상이 아닙니다.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BufferMisuseError {
    /// 다른 풀에서 꺼낸 버퍼
    #[error("다른 풀의 버퍼입니다: pool={buffer_pool}, expected={expected_pool}")]
    ForeignBuffer { buffer_pool: u64, expected_pool: u64 },

    /// 현재 대여 중이 아닌 버퍼 (이미 반납했거나 clear로 무효화됨)
    #[error("대여 중이 아닌 버퍼를 반납했습니다: serial={serial}")]
    DoubleRelease { serial: u64 },

    /// 대여 시 길이와 반납 시 길이가 다름
    #[error("버퍼 길이 불일치: 대여 {expected}, 반납 {actual}")]
    LengthMismatch { expected: usize, actual: usize },
}

/// 풀에서 대여한 고정 길이 버퍼.
///
/// 슬라이스로만 접근할 수 있으므로 대여 중에 길이가 바뀌지 않습니다.
pub struct PooledBuffer {
    data: Vec<f64>,
    pool_id: u64,
    serial: u64,
}

impl PooledBuffer {
    /// 버퍼 길이.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// 길이가 0인지 여부.
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// 읽기 전용 슬라이스.
    pub fn as_slice(&self) -> &[f64] {
        &self.data
    }

    /// 쓰기 가능한 슬라이스.
    pub fn as_mut_slice(&mut self) -> &mut [f64] {
        &mut self.data
    }

    /// 내용을 복사한 `Vec`.
    pub fn to_vec(&self) -> Vec<f64> {
        self.data.clone()
    }

    /// 대여 일련번호.
    pub fn serial(&self) -> u64 {
        self.serial
    }
}

impl Deref for PooledBuffer {
    type Target = [f64];

    fn deref(&self) -> &[f64] {
        &self.data
    }
}

impl DerefMut for PooledBuffer {
    fn deref_mut(&mut self) -> &mut [f64] {
        &mut self.data
    }
}

impl fmt::Debug for PooledBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PooledBuffer")
            .field("len", &self.data.len())
            .field("pool_id", &self.pool_id)
            .field("serial", &self.serial)
            .finish()
    }
}

/// 풀 통계.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// 유휴 버퍼 수 (전체 길이 합산)
    pub idle: usize,
    /// 대여 중인 버퍼 수
    pub outstanding: usize,
    /// 새로 할당한 횟수
    pub allocations: u64,
    /// 재사용한 횟수
    pub reuses: u64,
}

/// 길이별 유휴 목록을 가진 버퍼 풀.
///
/// 단일 소유자(지표 워커 스레드)를 전제로 하며 내부 잠금이 없습니다.
pub struct BufferPool {
    id: u64,
    idle: HashMap<usize, Vec<Vec<f64>>>,
    /// serial → 대여 시 길이
    checked_out: HashMap<u64, usize>,
    next_serial: u64,
    max_idle_per_length: usize,
    allocations: u64,
    reuses: u64,
}

impl Default for BufferPool {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for BufferPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BufferPool")
            .field("id", &self.id)
            .field("stats", &self.stats())
            .finish()
    }
}

impl BufferPool {
    /// 새 풀을 생성합니다.
    pub fn new() -> Self {
        Self {
            id: NEXT_POOL_ID.fetch_add(1, Ordering::Relaxed),
            idle: HashMap::new(),
            checked_out: HashMap::new(),
            next_serial: 0,
            max_idle_per_length: DEFAULT_MAX_IDLE_PER_LENGTH,
            allocations: 0,
            reuses: 0,
        }
    }

    /// 길이당 유휴 버퍼 상한을 설정합니다.
    pub fn with_max_idle_per_length(mut self, max: usize) -> Self {
        self.max_idle_per_length = max;
        self
    }

    /// 정확히 `length` 길이의 버퍼를 대여합니다.
    ///
    /// 재사용된 버퍼는 NaN으로 채워져 있습니다. 호출자는 이전 내용을 가정하면 안 됩니다.
    pub fn acquire(&mut self, length: usize) -> PooledBuffer {
        let data = match self.idle.get_mut(&length).and_then(Vec::pop) {
            Some(mut data) => {
                data.fill(f64::NAN);
                self.reuses += 1;
                data
            }
            None => {
                self.allocations += 1;
                vec![f64::NAN; length]
            }
        };

        let serial = self.next_serial;
        self.next_serial += 1;
        self.checked_out.insert(serial, length);

        PooledBuffer {
            data,
            pool_id: self.id,
            serial,
        }
    }

    /// 버퍼를 풀에 반납합니다.
    pub fn release(&mut self, buffer: PooledBuffer) -> Result<(), BufferMisuseError> {
        if buffer.pool_id != self.id {
            return Err(BufferMisuseError::ForeignBuffer {
                buffer_pool: buffer.pool_id,
                expected_pool: self.id,
            });
        }

        let expected = self
            .checked_out
            .remove(&buffer.serial)
            .ok_or(BufferMisuseError::DoubleRelease {
                serial: buffer.serial,
            })?;

        if buffer.data.len() != expected {
            return Err(BufferMisuseError::LengthMismatch {
                expected,
                actual: buffer.data.len(),
            });
        }

        let bucket = self.idle.entry(expected).or_default();
        if bucket.len() < self.max_idle_per_length {
            bucket.push(buffer.data);
        }
        Ok(())
    }

    /// 이 풀에서 대여한 버퍼인지 확인합니다.
    pub fn owns(&self, buffer: &PooledBuffer) -> bool {
        buffer.pool_id == self.id && self.checked_out.contains_key(&buffer.serial)
    }

    /// 유휴 버퍼를 모두 버리고 대여 기록을 초기화합니다.
    ///
    /// 이후 이전에 대여한 버퍼를 반납하면 [`BufferMisuseError::DoubleRelease`]가 됩니다.
    pub fn clear(&mut self) {
        self.idle.clear();
        self.checked_out.clear();
    }

    /// 현재 통계.
    pub fn stats(&self) -> PoolStats {
        PoolStats {
            idle: self.idle.values().map(Vec::len).sum(),
            outstanding: self.checked_out.len(),
            allocations: self.allocations,
            reuses: self.reuses,
        }
    }
}
