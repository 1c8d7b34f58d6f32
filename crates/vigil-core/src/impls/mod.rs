//! Implementations - ポートの実装
//!
//! - memory: InMemory 実装（開発・テスト用）
//! - file_store: ファイルベースの永続化（本番向け、単一プロセス）
//! - hook_sinks: HookSink 実装

pub mod file_store;
pub mod hook_sinks;
pub mod memory;

pub use self::file_store::FileStore;
pub use self::hook_sinks::{JsonlHookSink, MemoryHookSink};
pub use self::memory::{InMemoryCheckpointStore, InMemoryStateStore, InMemoryTaskStore};
