//! vigil-core
//!
//! Periodic analysis scheduler and sequential, checkpointed task pipeline.
//!
//! # モジュール構成
//! - **domain**: ドメインモデル（ids, entity, task, state, checkpoint, hook, outcome, errors, stats）
//! - **ports**: 抽象化レイヤー（StateStore, TaskStore, CheckpointStore, HookSink, AnalysisHandler, Clock）
//! - **queue**: TaskQueue（順序・dedupe・状態遷移）と RetryPolicy
//! - **app**: CheckpointManager, HookEventRecorder, SequentialExecutor, AnalysisScheduler, PipelineBuilder
//! - **impls**: InMemory / ファイル実装
//! - **config**: YAML 設定

pub mod app;
pub mod config;
pub mod domain;
pub mod impls;
pub mod ports;
pub mod queue;

pub use app::{PipelineBuilder, PipelineHandle};
pub use config::VigilConfig;
pub use domain::{TaskError, VigilError};
