//! rbprobe ターゲットアクセス
//!
//! このクレートは、検査対象（稼働中のプロセスまたはコアダンプ）への低レベルな読み取り専用アクセスを提供します。
//! ptraceによるアタッチ、メモリ読み取り、レジスタ取得、ELFコアファイルの解析を行います。

pub mod process;
pub mod thread;
pub mod memory;
pub mod registers;
pub mod core_file;

pub use process::{Process, StopReason};
pub use thread::{Thread, ThreadId};
pub use memory::{Memory, MemoryMapping, MemoryReadable};
pub use registers::{RegisterSnapshot, Registers};
pub use core_file::{CoreFile, CoreSegment, FileMapping};

/// ターゲットアクセスの結果型
pub type Result<T> = anyhow::Result<T>;
