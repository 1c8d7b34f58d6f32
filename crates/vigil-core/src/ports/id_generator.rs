//! IdGenerator port - ID 生成の抽象化
//!
//! # 実装
//! - **UlidGenerator**: ULID ベース（本番用）

use crate::domain::ids::{EventId, TaskId};
use crate::ports::Clock;
use ulid::Ulid;

/// IdGenerator は時刻ソート可能な ID を生成
pub trait IdGenerator: Send + Sync {
    fn generate_task_id(&self) -> TaskId;

    fn generate_event_id(&self) -> EventId;
}

/// UlidGenerator は ULID ベースの ID 生成器
///
/// タイムスタンプ部分は Clock から、残り 80 bit は rand から取る。
pub struct UlidGenerator<C> {
    clock: C,
}

impl<C: Clock> UlidGenerator<C> {
    pub fn new(clock: C) -> Self {
        Self { clock }
    }

    fn next_ulid(&self) -> Ulid {
        let timestamp_ms = self.clock.now().timestamp_millis().max(0) as u64;
        Ulid::from_parts(timestamp_ms, rand::random())
    }
}

impl<C: Clock> IdGenerator for UlidGenerator<C> {
    fn generate_task_id(&self) -> TaskId {
        TaskId::from(self.next_ulid())
    }

    fn generate_event_id(&self) -> EventId {
        EventId::from(self.next_ulid())
    }
}
