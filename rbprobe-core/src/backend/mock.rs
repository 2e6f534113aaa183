//! テスト用のメモリ上のバックエンド
//!
//! 型表とメモリイメージを登録して使います。セッションに渡した後も
//! `Session::native` でダウンキャストしてメモリを書き換えられます。

use super::{Backend, GlobalSymbol, SymbolInfo};
use crate::errors::DebuggerError;
use crate::types::{Type, TypeRef};
use crate::Result;
use rbprobe_target::RegisterSnapshot;
use std::any::Any;
use std::cell::{Cell, RefCell};
use std::collections::{BTreeMap, HashMap};

/// メモリ上のフェイクバックエンド
#[derive(Default)]
pub struct MockBackend {
    /// 先頭アドレス -> バイト列
    regions: RefCell<BTreeMap<u64, Vec<u8>>>,
    types: RefCell<HashMap<String, Type>>,
    enums: RefCell<HashMap<(Option<String>, String), i64>>,
    globals: RefCell<HashMap<String, GlobalSymbol>>,
    /// (先頭アドレス, サイズ, 名前)
    symbols: RefCell<Vec<(u64, u64, String)>>,
    registers: Cell<RegisterSnapshot>,
    stop_signal: Cell<Option<i32>>,
    reads: Cell<usize>,
}

impl MockBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// ゼロ埋めの領域を割り当てる
    pub fn map(&self, addr: u64, size: usize) {
        self.regions.borrow_mut().insert(addr, vec![0; size]);
    }

    /// 割り当て済み領域に書き込む
    pub fn write_bytes(&self, addr: u64, bytes: &[u8]) {
        let mut regions = self.regions.borrow_mut();
        let (start, region) = regions
            .range_mut(..=addr)
            .next_back()
            .filter(|(start, region)| addr + bytes.len() as u64 <= **start + region.len() as u64)
            .unwrap_or_else(|| panic!("mock write outside mapped memory at 0x{:x}", addr));
        let offset = (addr - *start) as usize;
        region[offset..offset + bytes.len()].copy_from_slice(bytes);
    }

    pub fn write_u64(&self, addr: u64, value: u64) {
        self.write_bytes(addr, &value.to_le_bytes());
    }

    pub fn write_u32(&self, addr: u64, value: u32) {
        self.write_bytes(addr, &value.to_le_bytes());
    }

    /// 領域の割り当てを解除する（読み取り失敗を再現する）
    pub fn unmap(&self, addr: u64) {
        self.regions.borrow_mut().remove(&addr);
    }

    /// 型を登録する（"struct X" は "X" でも引けるようにする）
    pub fn add_type(&self, ty: Type) {
        self.types.borrow_mut().insert(ty.name().to_string(), ty);
    }

    pub fn add_enum(&self, enum_name: &str, member: &str, value: i64) {
        let mut enums = self.enums.borrow_mut();
        enums.insert((Some(enum_name.to_string()), member.to_string()), value);
        enums.entry((None, member.to_string())).or_insert(value);
    }

    pub fn add_global(&self, name: &str, address: u64, ty: Option<Type>) {
        self.globals
            .borrow_mut()
            .insert(name.to_string(), GlobalSymbol { address, ty });
    }

    pub fn add_symbol(&self, name: &str, address: u64, size: u64) {
        let mut symbols = self.symbols.borrow_mut();
        symbols.push((address, size, name.to_string()));
        symbols.sort_by_key(|(addr, _, _)| *addr);
    }

    pub fn set_registers(&self, registers: RegisterSnapshot) {
        self.registers.set(registers);
    }

    pub fn set_stop_signal(&self, signal: Option<i32>) {
        self.stop_signal.set(signal);
    }

    /// これまでのメモリ読み取り回数
    pub fn reads(&self) -> usize {
        self.reads.get()
    }
}

impl Backend for MockBackend {
    fn name(&self) -> &str {
        "mock"
    }

    fn read_memory(&self, addr: u64, size: usize) -> Result<Vec<u8>> {
        self.reads.set(self.reads.get() + 1);
        let regions = self.regions.borrow();
        let (start, region) = regions
            .range(..=addr)
            .next_back()
            .ok_or(DebuggerError::MemoryAccess { address: addr, size })?;
        let offset = (addr - start) as usize;
        region
            .get(offset..offset + size)
            .map(|bytes| bytes.to_vec())
            .ok_or_else(|| DebuggerError::MemoryAccess { address: addr, size }.into())
    }

    fn lookup_type(&self, name: &str) -> Option<Type> {
        let types = self.types.borrow();
        types
            .get(name)
            .or_else(|| {
                ["struct ", "union ", "enum "]
                    .iter()
                    .find_map(|prefix| types.get(&format!("{}{}", prefix, name)))
            })
            .cloned()
    }

    fn resolve_type(&self, type_ref: TypeRef) -> Result<Type> {
        Err(anyhow::anyhow!("mock backend cannot resolve type reference {:?}", type_ref))
    }

    fn lookup_global(&self, name: &str) -> Option<GlobalSymbol> {
        if let Some(global) = self.globals.borrow().get(name) {
            return Some(global.clone());
        }
        self.symbols
            .borrow()
            .iter()
            .find(|(_, _, sym)| sym == name)
            .map(|(address, _, _)| GlobalSymbol {
                address: *address,
                ty: None,
            })
    }

    fn enum_value(&self, enum_name: Option<&str>, member: &str) -> Option<i64> {
        let key = (enum_name.map(|n| n.trim_start_matches("enum ").to_string()), member.to_string());
        self.enums.borrow().get(&key).copied()
    }

    fn symbol_at(&self, addr: u64) -> Option<SymbolInfo> {
        self.symbols
            .borrow()
            .iter()
            .rev()
            .find(|(start, size, _)| *start <= addr && (*size == 0 || addr < start + size))
            .map(|(start, _, name)| SymbolInfo {
                name: name.clone(),
                start: *start,
                location: None,
            })
    }

    fn registers(&self) -> Result<RegisterSnapshot> {
        Ok(self.registers.get())
    }

    fn stop_signal(&self) -> Option<i32> {
        self.stop_signal.get()
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}
