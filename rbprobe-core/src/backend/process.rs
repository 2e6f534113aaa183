//! ライブプロセスのバックエンド
//!
//! コンテキストは暗黙的で、アタッチしたpidの停止中のメインスレッドです。

use super::{Backend, DebugInfo, GlobalSymbol, SymbolInfo};
use crate::errors::{DebuggerError, ERR_DWARF_NOT_LOADED};
use crate::types::{Type, TypeRef};
use crate::Result;
use rbprobe_target::{Memory, Process, RegisterSnapshot, Registers, StopReason};
use std::any::Any;
use std::path::Path;

/// ptraceでアタッチしたプロセス
pub struct ProcessBackend {
    process: Process,
    memory: Memory,
    registers: Registers,
    debug_info: Option<DebugInfo>,
}

impl ProcessBackend {
    /// プロセスにアタッチし、バイナリのデバッグ情報を読み込む
    pub fn attach(pid: i32, binary: Option<&Path>) -> Result<Self> {
        let process = Process::attach(pid)?;
        let memory = process.memory();
        let registers = process.registers();

        let debug_info = match binary {
            Some(binary) => Some(DebugInfo::load(binary, |path| memory.load_bias(path).ok())?),
            None => {
                tracing::warn!("{}", ERR_DWARF_NOT_LOADED);
                None
            }
        };

        Ok(Self {
            process,
            memory,
            registers,
            debug_info,
        })
    }

    pub fn pid(&self) -> i32 {
        self.process.pid()
    }

    pub fn memory(&self) -> &Memory {
        &self.memory
    }

    pub fn debug_info(&self) -> Option<&DebugInfo> {
        self.debug_info.as_ref()
    }
}

impl Backend for ProcessBackend {
    fn name(&self) -> &str {
        "process"
    }

    fn read_memory(&self, addr: u64, size: usize) -> Result<Vec<u8>> {
        self.memory.read(addr, size).map_err(|e| {
            tracing::trace!("read 0x{:x} failed: {}", addr, e);
            DebuggerError::MemoryAccess { address: addr, size }.into()
        })
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
        self.registers.read()
    }

    fn stop_signal(&self) -> Option<i32> {
        match self.process.stop_reason() {
            StopReason::Signal(signal) => Some(*signal as i32),
            _ => None,
        }
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}
