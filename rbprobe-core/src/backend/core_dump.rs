//! コアダンプのバックエンド
//!
//! コンテキストは明示的です。`target()` でコアファイル、`thread(i)` でスレッドを取り出し、
//! 選択中のスレッドのレジスタからフレームをたどります。

use super::{Backend, DebugInfo, GlobalSymbol, SymbolInfo, ThreadSummary};
use crate::errors::{DebuggerError, ERR_DWARF_NOT_LOADED};
use crate::types::{Type, TypeRef};
use crate::Result;
use rbprobe_target::{CoreFile, RegisterSnapshot, Thread};
use std::any::Any;
use std::cell::Cell;
use std::path::Path;

/// ELFコアファイル
pub struct CoreBackend {
    core: CoreFile,
    debug_info: Option<DebugInfo>,
    selected: Cell<usize>,
}

impl CoreBackend {
    /// コアファイルを開き、バイナリのデバッグ情報を読み込む
    pub fn open(path: &Path, binary: Option<&Path>) -> Result<Self> {
        let core = CoreFile::open(path)?;
        tracing::debug!(
            threads = core.threads().len(),
            segments = core.segments().len(),
            "opened core file"
        );

        let debug_info = match binary {
            Some(binary) => Some(DebugInfo::load(binary, |bin| core.load_bias(bin))?),
            None => {
                tracing::warn!("{}", ERR_DWARF_NOT_LOADED);
                None
            }
        };

        // クラッシュしたスレッドを初期選択にする
        let selected = core.threads().iter().position(|t| t.signal().is_some()).unwrap_or(0);

        Ok(Self {
            core,
            debug_info,
            selected: Cell::new(selected),
        })
    }

    /// ターゲット（コアファイル）
    pub fn target(&self) -> &CoreFile {
        &self.core
    }

    /// スレッドを番号で取得する
    pub fn thread(&self, index: usize) -> Option<&Thread> {
        self.core.threads().get(index)
    }

    /// 選択中のスレッド
    pub fn selected_thread(&self) -> Option<&Thread> {
        self.thread(self.selected.get())
    }

    pub fn debug_info(&self) -> Option<&DebugInfo> {
        self.debug_info.as_ref()
    }
}

impl Backend for CoreBackend {
    fn name(&self) -> &str {
        "core"
    }

    fn read_memory(&self, addr: u64, size: usize) -> Result<Vec<u8>> {
        self.core
            .read(addr, size)
            .map_err(|_| DebuggerError::MemoryAccess { address: addr, size }.into())
    }

    fn lookup_type(&self, name: &str) -> Option<Type> {
        self.debug_info.as_ref()?.lookup_type(name)
    }

    fn resolve_type(&self, type_ref: TypeRef) -> Result<Type> {
        self.debug_info
            .as_ref()
            .ok_or_else(|| anyhow::anyhow!(ERR_DWARF_NOT_LOADED))?
            .resolve_type(type_ref)
    }

    fn lookup_global(&self, name: &str) -> Option<GlobalSymbol> {
        self.debug_info.as_ref()?.lookup_global(name)
    }

    fn enum_value(&self, enum_name: Option<&str>, member: &str) -> Option<i64> {
        self.debug_info.as_ref()?.enum_value(enum_name, member)
    }

    fn symbol_at(&self, addr: u64) -> Option<SymbolInfo> {
        self.debug_info.as_ref()?.symbol_at(addr)
    }

    fn registers(&self) -> Result<RegisterSnapshot> {
        self.selected_thread()
            .map(|t| *t.registers())
            .ok_or_else(|| anyhow::anyhow!("Core file has no threads"))
    }

    fn threads(&self) -> Vec<ThreadSummary> {
        self.core
            .threads()
            .iter()
            .enumerate()
            .map(|(index, t)| ThreadSummary {
                index,
                tid: t.tid(),
                pc: t.registers().rip,
                selected: index == self.selected.get(),
            })
            .collect()
    }

    fn select_thread(&self, index: usize) -> Result<()> {
        if index >= self.core.threads().len() {
            return Err(anyhow::anyhow!(
                "Invalid thread {} (core has {} threads)",
                index,
                self.core.threads().len()
            ));
        }
        self.selected.set(index);
        Ok(())
    }

    fn stop_signal(&self) -> Option<i32> {
        self.core.crash_signal()
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}
