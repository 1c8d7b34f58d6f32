//! App - アプリケーション層
//!
//! ports を組み合わせてパイプラインを実装します。
//!
//! # 主要コンポーネント
//! - **PipelineBuilder / Pipeline / PipelineHandle**: 構築・起動・管理操作・停止
//! - **AnalysisScheduler**: 定期 tick で stale な entity を投入
//! - **SequentialExecutor**: キューごとの単一実行ループ（watchdog / retry / dead）
//! - **CheckpointManager**: 進捗スナップショットと再開
//! - **HookEventRecorder**: pre / post / stop の監査ログ

pub mod builder;
pub mod checkpoint;
pub mod executor;
pub mod hooks;
pub mod scheduler;

pub use self::builder::{BuildError, Pipeline, PipelineBuilder, PipelineHandle};
pub use self::checkpoint::{CheckpointHandle, CheckpointManager};
pub use self::executor::{AttemptOutcome, ExecutorConfig, SequentialExecutor};
pub use self::hooks::{HookEventRecorder, HookRecorderConfig};
pub use self::scheduler::{AnalysisScheduler, SchedulerConfig, TickReport};
