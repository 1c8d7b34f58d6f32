//! HookSink port - 監査イベントの書き込み先
//!
//! - MemoryHookSink: テスト・開発用
//! - JsonlHookSink: ファイルに追記

use async_trait::async_trait;

use crate::domain::{HookEvent, VigilError};

/// HookSink は HookEventRecorder のフラッシャーからのみ呼ばれる。
/// エラーはログに残るだけで、タスクの実行には影響しない。
#[async_trait]
pub trait HookSink: Send + Sync {
    /// Persist a batch of events, in order.
    async fn write_batch(&self, events: &[HookEvent]) -> Result<(), VigilError>;
}
