//! エラー型とエラーメッセージ定数

use thiserror::Error;

/// プロセスに接続されていない場合のエラーメッセージ
pub const ERR_NOT_ATTACHED: &str = "Not attached to a process";

/// DWARF情報がロードされていない場合のエラーメッセージ
pub const ERR_DWARF_NOT_LOADED: &str = "DWARF information not loaded (use --binary)";

/// シンボルが見つからない場合のエラーメッセージ
pub const ERR_SYMBOL_NOT_FOUND: &str = "Symbol not found";

/// スレッド切り替えに対応していないバックエンドのエラーメッセージ
pub const ERR_NO_THREAD_NAVIGATION: &str = "This backend does not support explicit thread navigation";

/// デバッガ操作のエラー
#[derive(Debug, Error)]
pub enum DebuggerError {
    /// 式の評価に失敗した
    #[error("Failed to evaluate '{expression}': {reason}")]
    Evaluation { expression: String, reason: String },

    /// 型が見つからない
    #[error("Type '{name}' not found; rebuild the runtime with debug symbols (-g) or pass the binary that carries them")]
    TypeNotFound { name: String },

    /// メモリの読み取りに失敗した
    #[error("Cannot access memory at address 0x{address:x} ({size} bytes)")]
    MemoryAccess { address: u64, size: usize },

    /// キャッシュのエントリがもう有効でない
    #[error("Stale cache entry {index} at 0x{address:x}: {reason}")]
    StaleCache {
        index: usize,
        address: u64,
        reason: String,
    },

    /// 切り替え先として不正
    #[error("Cannot switch to {target}: {reason}")]
    InvalidSwitchTarget { target: String, reason: String },
}

impl DebuggerError {
    /// 式評価エラーを作る
    pub fn evaluation(expression: impl Into<String>, reason: impl std::fmt::Display) -> Self {
        Self::Evaluation {
            expression: expression.into(),
            reason: reason.to_string(),
        }
    }

    /// エラーがメモリアクセス失敗かどうか
    pub fn is_memory_error(err: &anyhow::Error) -> bool {
        matches!(err.downcast_ref::<DebuggerError>(), Some(DebuggerError::MemoryAccess { .. }))
    }
}
