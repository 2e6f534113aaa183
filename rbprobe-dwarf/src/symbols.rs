//! シンボル解決機能

use crate::{DwarfLoader, Result};
use std::collections::HashMap;
use object::{Object, ObjectSymbol, SymbolKind};

/// シンボル情報
#[derive(Debug, Clone)]
pub struct Symbol {
    /// シンボル名
    pub name: String,
    /// デマングルされたシンボル名（拡張ライブラリのRustシンボル向け）
    pub demangled_name: String,
    pub address: u64,
    pub size: u64,
    /// 関数シンボルかどうか
    pub is_function: bool,
}

impl Symbol {
    /// シンボルを作成し、デマングルされた名前を設定する
    pub fn new(name: String, address: u64, size: u64, is_function: bool) -> Self {
        let demangled_name = demangle_symbol(&name);
        Self {
            name,
            demangled_name,
            address,
            size,
            is_function,
        }
    }

    /// 表示用の名前を取得
    pub fn display_name(&self) -> &str {
        &self.demangled_name
    }

    /// ロードバイアスを加算したシンボルを返す
    pub fn relocated(&self, bias: u64) -> Self {
        Self {
            address: self.address.wrapping_add(bias),
            ..self.clone()
        }
    }
}

/// シンボル名をデマングルする
fn demangle_symbol(name: &str) -> String {
    if let Ok(demangled) = rustc_demangle::try_demangle(name) {
        return format!("{:#}", demangled);
    }
    name.to_string()
}

/// シンボル解決
pub struct SymbolResolver {
    /// シンボル名 -> シンボル情報のマップ
    symbols_by_name: HashMap<String, Symbol>,
    /// アドレス順にソートされたシンボル
    symbols_by_address: Vec<Symbol>,
    /// 位置独立かどうか
    is_pie: bool,
}

impl SymbolResolver {
    /// DWARFローダーからシンボル解決を作成する
    pub fn new(loader: &DwarfLoader) -> Result<Self> {
        let object_file = loader.object_file();
        let symbols = object_file
            .symbols()
            .chain(object_file.dynamic_symbols())
            .filter(|symbol| symbol.address() != 0)
            .filter_map(|symbol| {
                let name = symbol.name().ok()?;
                if name.is_empty() {
                    return None;
                }
                Some(Symbol::new(
                    name.to_string(),
                    symbol.address(),
                    symbol.size(),
                    symbol.kind() == SymbolKind::Text,
                ))
            });

        Ok(Self::from_symbols(symbols, loader.is_pie()))
    }

    /// シンボル列から作成する
    pub fn from_symbols<I: IntoIterator<Item = Symbol>>(symbols: I, is_pie: bool) -> Self {
        let mut symbols_by_name = HashMap::new();
        let mut symbols_by_address = Vec::new();

        for sym in symbols {
            symbols_by_name.entry(sym.name.clone()).or_insert_with(|| sym.clone());
            symbols_by_address.push(sym);
        }

        symbols_by_address.sort_by_key(|s| s.address);
        symbols_by_address.dedup_by(|a, b| a.address == b.address && a.name == b.name);

        Self {
            symbols_by_name,
            symbols_by_address,
            is_pie,
        }
    }

    /// 位置独立かどうかを取得する
    pub fn is_pie(&self) -> bool {
        self.is_pie
    }

    /// シンボル名からアドレスを解決する（ファイル内アドレス）
    pub fn resolve(&self, symbol: &str) -> Option<u64> {
        self.symbols_by_name.get(symbol).map(|s| s.address)
    }

    /// アドレスからシンボルを解決する（最も近いシンボルを返す）
    pub fn reverse_resolve(&self, addr: u64) -> Option<Symbol> {
        let idx = match self.symbols_by_address.binary_search_by_key(&addr, |s| s.address) {
            Ok(idx) => return Some(self.symbols_by_address[idx].clone()),
            Err(0) => return None,
            Err(idx) => idx - 1,
        };

        let sym = &self.symbols_by_address[idx];
        if sym.size > 0 {
            // サイズ情報がある場合は範囲内のみ
            (addr < sym.address + sym.size).then(|| sym.clone())
        } else {
            Some(sym.clone())
        }
    }

    /// すべてのシンボルを取得する
    pub fn all_symbols(&self) -> impl Iterator<Item = &Symbol> {
        self.symbols_by_address.iter()
    }

    /// パターンにマッチするシンボルを検索する
    pub fn find_symbols(&self, pattern: &str) -> Vec<Symbol> {
        let mut found: Vec<Symbol> = self
            .symbols_by_name
            .values()
            .filter(|s| s.name.contains(pattern) || s.demangled_name.contains(pattern))
            .cloned()
            .collect();
        found.sort_by_key(|s| s.address);
        found
    }
}
