//! デバッガバックエンド
//!
//! 構造の異なる2つのバックエンド（暗黙のコンテキストを持つライブプロセスと、
//! target→thread→frame を明示的にたどるコアダンプ）を `Backend` トレイトで揃えます。
//! テストではメモリイメージを持つ `MockBackend` を使います。

mod debug_info;
mod process;
mod core_dump;
mod mock;

pub use core_dump::CoreBackend;
pub use debug_info::DebugInfo;
pub use mock::MockBackend;
pub use process::ProcessBackend;

use crate::types::{Type, TypeRef};
use crate::Result;
use rbprobe_target::{CoreFile, RegisterSnapshot};
use std::any::Any;
use std::path::{Path, PathBuf};

/// アドレスから解決したシンボル
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SymbolInfo {
    /// 表示用のシンボル名
    pub name: String,
    /// 関数（シンボル）の先頭アドレス（実行時アドレス）
    pub start: u64,
    /// "file:line" 形式のソース位置
    pub location: Option<String>,
}

/// グローバル変数・シンボル
#[derive(Debug, Clone)]
pub struct GlobalSymbol {
    pub address: u64,
    /// デバッグ情報がない場合はNone
    pub ty: Option<Type>,
}

/// スレッドの概要
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ThreadSummary {
    pub index: usize,
    pub tid: i32,
    pub pc: u64,
    pub selected: bool,
}

/// デバッガバックエンド
pub trait Backend {
    /// バックエンド名
    fn name(&self) -> &str;

    /// メモリを読み取る
    fn read_memory(&self, addr: u64, size: usize) -> Result<Vec<u8>>;

    /// 名前で型を検索する
    fn lookup_type(&self, name: &str) -> Option<Type>;

    /// バックエンド固有の型参照を解決する
    fn resolve_type(&self, type_ref: TypeRef) -> Result<Type>;

    /// グローバル変数またはシンボルを検索する
    fn lookup_global(&self, name: &str) -> Option<GlobalSymbol>;

    /// 列挙子の値を取得する（列挙型名を省略するとグローバル名前空間から探す）
    fn enum_value(&self, enum_name: Option<&str>, member: &str) -> Option<i64>;

    /// アドレスを含む関数シンボルを解決する
    fn symbol_at(&self, addr: u64) -> Option<SymbolInfo>;

    /// 選択中スレッドのレジスタ
    fn registers(&self) -> Result<RegisterSnapshot>;

    /// スレッド一覧（明示的なナビゲーションに対応するバックエンドのみ）
    fn threads(&self) -> Vec<ThreadSummary> {
        Vec::new()
    }

    /// スレッドを選択する
    fn select_thread(&self, _index: usize) -> Result<()> {
        Err(anyhow::anyhow!(crate::errors::ERR_NO_THREAD_NAVIGATION))
    }

    /// クラッシュシグナル（コア）または停止シグナル（プロセス）
    fn stop_signal(&self) -> Option<i32>;

    /// 具体的なバックエンドへのダウンキャスト用
    fn as_any(&self) -> &dyn Any;
}

/// バックエンドの選択結果
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TargetKind {
    Process(i32),
    Core(PathBuf),
}

/// ターゲット指定からバックエンドの種類を判定する
///
/// ET_CORE のELFファイルならコア、数値または `/proc/<pid>` が存在すればプロセス
pub fn target_kind(target: &str) -> Result<TargetKind> {
    let path = Path::new(target);
    if path.is_file() {
        if CoreFile::is_core_file(path) {
            return Ok(TargetKind::Core(path.to_path_buf()));
        }
        return Err(anyhow::anyhow!("'{}' is not an ELF core file", target));
    }

    if let Ok(pid) = target.trim().parse::<i32>() {
        return Ok(TargetKind::Process(pid));
    }

    if let Some(pid) = target
        .strip_prefix("/proc/")
        .and_then(|rest| rest.trim_end_matches('/').parse::<i32>().ok())
    {
        if path.exists() {
            return Ok(TargetKind::Process(pid));
        }
    }

    Err(anyhow::anyhow!(
        "Cannot determine backend for '{}': expected a pid or an ELF core file",
        target
    ))
}

/// ターゲットを判定してバックエンドを作成する
pub fn detect(target: &str, binary: Option<&Path>) -> Result<Box<dyn Backend>> {
    match target_kind(target)? {
        TargetKind::Process(pid) => {
            tracing::debug!(pid, "selected process backend");
            Ok(Box::new(ProcessBackend::attach(pid, binary)?))
        }
        TargetKind::Core(path) => {
            tracing::debug!(path = %path.display(), "selected core backend");
            Ok(Box::new(CoreBackend::open(&path, binary)?))
        }
    }
}
