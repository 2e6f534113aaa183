//! ランタイム検査のエラー定義

use thiserror::Error;

/// ファイバキャッシュが空のときのメッセージ
pub const ERR_NO_FIBER_CACHE: &str = "No fibers in cache. Run 'rb-fiber-scan-heap' first.";

/// 実行コンテキストが見つからないときのメッセージ
pub const ERR_NO_EXECUTION_CONTEXT: &str =
    "Could not get current execution context (select a fiber with 'rb-fiber-switch' or stop in a Ruby thread)";

/// ランタイムの状態に関するエラー
#[derive(Error, Debug)]
pub enum RuntimeError {
    #[error("ruby_current_vm_ptr is NULL; the Ruby VM is not initialized yet")]
    VmNotInitialized,

    #[error("objspace is NULL; the Ruby GC has not been initialized")]
    ObjspaceNotInitialized,

    #[error("Could not find 'fiber_data_type' (Ruby debug symbols may be missing): {0}")]
    FiberTypeUnavailable(String),

    #[error("Unknown type '{0}'. Use a name like T_STRING / string or a number like 0x05")]
    UnknownTypeFilter(String),

    #[error("VALUE 0x{address:x} is not a {expected}")]
    UnexpectedType { address: u64, expected: &'static str },
}
