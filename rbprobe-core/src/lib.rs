//! rbprobe デバッガのコア機能
//!
//! このクレートは、デバッガ拡張が使う抽象化層を提供します。
//! 値と型（`Value`/`Type`）、構造の異なるバックエンド（ライブプロセス・コアダンプ・テスト用モック）、
//! 式評価、コマンド登録、ネイティブスタックのアンワインドを扱います。

pub mod backend;
pub mod builtins;
pub mod command;
pub mod debugger;
pub mod errors;
pub mod expr_eval;
pub mod parse;
pub mod session;
pub mod types;
pub mod unwind;
pub mod value;

pub use backend::{Backend, CoreBackend, MockBackend, ProcessBackend, SymbolInfo};
pub use command::{Command, CommandCategory, CommandContext, CommandRegistry};
pub use debugger::Debugger;
pub use errors::DebuggerError;
pub use parse::Arguments;
pub use session::Session;
pub use types::{Field, Type, TypeHandle, TypeKind, TypeRef};
pub use unwind::{FrameState, NativeFrame, UnwindStrategy};
pub use value::{Member, StoredValue, Value};

// 他のクレートから使用するために再エクスポート
pub use rbprobe_target::RegisterSnapshot;

/// デバッガの結果型
pub type Result<T> = anyhow::Result<T>;
