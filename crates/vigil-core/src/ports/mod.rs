//! Ports - 抽象化レイヤー
//!
//! Hexagonal Architecture の「ポート」。外部の永続化・時刻・解析処理を
//! trait として切り出し、実装（impls）を差し替え可能にする。

pub mod checkpoint_store;
pub mod clock;
pub mod handler;
pub mod hook_sink;
pub mod id_generator;
pub mod state_store;
pub mod task_store;

pub use self::checkpoint_store::CheckpointStore;
pub use self::clock::{Clock, ManualClock, SystemClock};
pub use self::handler::{AnalysisHandler, AnalysisRequest};
pub use self::hook_sink::HookSink;
pub use self::id_generator::{IdGenerator, UlidGenerator};
pub use self::state_store::StateStore;
pub use self::task_store::TaskStore;
