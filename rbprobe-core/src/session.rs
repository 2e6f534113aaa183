//! デバッグセッション
//!
//! バックエンドと、型・列挙子のキャッシュ、コンビニエンス変数、アンワインダを保持します。
//! 検査は単一スレッドで同期的に行うので、内部状態は `RefCell` で管理します。

use crate::backend::{Backend, SymbolInfo};
use crate::errors::DebuggerError;
use crate::expr_eval;
use crate::types::{builtin_type, Type, TypeHandle};
use crate::unwind::{self, NativeFrame, UnwinderRegistry, MAX_FRAMES};
use crate::value::{StoredValue, Value};
use crate::Result;
use rbprobe_target::RegisterSnapshot;
use std::any::Any;
use std::cell::RefCell;
use std::collections::{BTreeMap, HashMap};

/// デバッグセッション
pub struct Session {
    backend: Box<dyn Backend>,
    /// 型名 -> 型
    type_cache: RefCell<HashMap<String, Type>>,
    /// (列挙型名, 列挙子名) -> 値
    enum_cache: RefCell<HashMap<(Option<String>, String), Option<i64>>>,
    /// `$name` の値（名前は `$` なしで保持）
    convenience: RefCell<BTreeMap<String, StoredValue>>,
    unwinders: UnwinderRegistry,
    /// ネイティブフレームのキャッシュ
    frames: RefCell<Option<Vec<NativeFrame>>>,
}

impl Session {
    pub fn new(backend: Box<dyn Backend>) -> Self {
        Self {
            backend,
            type_cache: RefCell::new(HashMap::new()),
            enum_cache: RefCell::new(HashMap::new()),
            convenience: RefCell::new(BTreeMap::new()),
            unwinders: UnwinderRegistry::default(),
            frames: RefCell::new(None),
        }
    }

    pub fn backend(&self) -> &dyn Backend {
        self.backend.as_ref()
    }

    /// 具体的なバックエンドへのエスケープハッチ
    pub fn native(&self) -> &dyn Any {
        self.backend.as_any()
    }

    /// 具体的なバックエンドにダウンキャストする
    pub fn native_as<T: 'static>(&self) -> Option<&T> {
        self.backend.as_any().downcast_ref::<T>()
    }

    /// 新しいアタッチの際にキャッシュを破棄する
    pub fn invalidate_caches(&self) {
        self.type_cache.borrow_mut().clear();
        self.enum_cache.borrow_mut().clear();
        self.invalidate_frames();
    }

    /// 式を現在のコンテキストで評価する
    pub fn parse_and_eval(&self, expression: &str) -> Result<Value<'_>> {
        expr_eval::evaluate(self, expression)
    }

    /// 型を名前で検索する（"struct X *" のような末尾のポインタ指定にも対応）
    pub fn lookup_type(&self, name: &str) -> Result<Type> {
        let mut base = name.trim();
        let mut pointer_depth = 0;
        while let Some(stripped) = base.strip_suffix('*') {
            base = stripped.trim_end();
            pointer_depth += 1;
        }
        let base = base.trim_start_matches("const ").trim();

        let mut ty = self.lookup_base_type(base)?;
        for _ in 0..pointer_depth {
            ty = ty.pointer();
        }
        Ok(ty)
    }

    fn lookup_base_type(&self, name: &str) -> Result<Type> {
        if let Some(ty) = self.type_cache.borrow().get(name) {
            return Ok(ty.clone());
        }

        let ty = self
            .backend
            .lookup_type(name)
            .or_else(|| builtin_type(name))
            .ok_or_else(|| DebuggerError::TypeNotFound { name: name.to_string() })?;
        tracing::debug!(name, size = ty.size(), "type lookup");

        self.type_cache.borrow_mut().insert(name.to_string(), ty.clone());
        Ok(ty)
    }

    /// 遅延参照を解決する
    pub fn resolve(&self, handle: &TypeHandle) -> Result<Type> {
        match handle {
            TypeHandle::Resolved(ty) => Ok(ty.clone()),
            TypeHandle::Deferred(type_ref) => self.backend.resolve_type(*type_ref),
            TypeHandle::Named(name) => self.lookup_type(name),
        }
    }

    /// 列挙子の値（キャッシュ付き）
    pub fn enum_value(&self, enum_name: Option<&str>, member: &str) -> Option<i64> {
        let key = (enum_name.map(str::to_string), member.to_string());
        if let Some(value) = self.enum_cache.borrow().get(&key) {
            return *value;
        }
        let value = self.backend.enum_value(enum_name, member);
        tracing::debug!(member, ?value, "enum lookup");
        self.enum_cache.borrow_mut().insert(key, value);
        value
    }

    /// メモリを読む
    pub fn read_memory(&self, addr: u64, size: usize) -> Result<Vec<u8>> {
        self.backend.read_memory(addr, size)
    }

    pub fn read_u64(&self, addr: u64) -> Result<u64> {
        let bytes = self.read_memory(addr, 8)?;
        let mut word = [0u8; 8];
        word.copy_from_slice(&bytes[..8]);
        Ok(u64::from_le_bytes(word))
    }

    /// NUL終端文字列を読む
    pub fn read_c_string(&self, addr: u64, max: usize) -> Result<String> {
        const CHUNK: usize = 64;
        let mut bytes = Vec::new();
        let mut cursor = addr;

        while bytes.len() < max {
            let want = CHUNK.min(max - bytes.len());
            let chunk = match self.read_memory(cursor, want) {
                Ok(chunk) => chunk,
                // ページ境界をまたぐ場合は1バイトずつ
                Err(_) => match self.read_memory(cursor, 1) {
                    Ok(byte) => byte,
                    Err(e) if bytes.is_empty() => return Err(e),
                    Err(_) => break,
                },
            };
            if let Some(nul) = chunk.iter().position(|b| *b == 0) {
                bytes.extend_from_slice(&chunk[..nul]);
                return Ok(String::from_utf8_lossy(&bytes).into_owned());
            }
            cursor += chunk.len() as u64;
            bytes.extend_from_slice(&chunk);
        }

        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }

    /// アドレスを含む関数シンボル
    pub fn symbol_at(&self, addr: u64) -> Option<SymbolInfo> {
        self.backend.symbol_at(addr)
    }

    /// 選択中スレッドのレジスタ
    pub fn registers(&self) -> Result<RegisterSnapshot> {
        self.backend.registers()
    }

    /// コンビニエンス変数を設定する
    pub fn set_convenience(&self, name: &str, value: &Value<'_>) {
        let name = name.trim_start_matches('$').to_string();
        self.convenience.borrow_mut().insert(name, value.detach());
    }

    /// コンビニエンス変数を取得する
    pub fn convenience(&self, name: &str) -> Option<Value<'_>> {
        let name = name.trim_start_matches('$');
        self.convenience
            .borrow()
            .get(name)
            .map(|stored| Value::from_stored(self, stored))
    }

    /// コンビニエンス変数を削除する
    pub fn clear_convenience(&self, name: &str) {
        self.convenience.borrow_mut().remove(name.trim_start_matches('$'));
    }

    /// 設定済みのコンビニエンス変数名
    pub fn convenience_names(&self) -> Vec<String> {
        self.convenience.borrow().keys().cloned().collect()
    }

    pub fn unwinders(&self) -> &UnwinderRegistry {
        &self.unwinders
    }

    /// キャッシュ済みのネイティブフレームを破棄する
    pub fn invalidate_frames(&self) {
        self.frames.borrow_mut().take();
    }

    /// ネイティブバックトレース（最大 `limit` フレーム）
    pub fn backtrace(&self, limit: usize) -> Result<Vec<NativeFrame>> {
        if self.frames.borrow().is_none() {
            let frames = unwind::unwind(self, MAX_FRAMES)?;
            *self.frames.borrow_mut() = Some(frames);
        }
        Ok(self
            .frames
            .borrow()
            .as_ref()
            .map(|frames| frames.iter().take(limit).cloned().collect())
            .unwrap_or_default())
    }
}
