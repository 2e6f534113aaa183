//! ランタイムへのアクセス
//!
//! セッションと読み込み済みの定数をまとめ、`VALUE` の読み取りを提供します。
//! 分類器・ヒープスキャナ・スタックウォーカはすべて `Runtime` を引数に取るので、
//! テストでは `MockBackend` のセッションから作るだけで済みます。

use crate::constants::{RubyConstants, RubyType};
use crate::Result;
use rbprobe_core::{Session, Type, Value};
use std::cell::RefCell;
use std::collections::HashMap;

/// ランタイム検査のコンテキスト
pub struct Runtime<'s> {
    session: &'s Session,
    consts: RubyConstants,
    /// シンボルID -> 名前
    symbol_names: RefCell<HashMap<u64, Option<String>>>,
}

impl<'s> Runtime<'s> {
    pub fn new(session: &'s Session) -> Self {
        let consts = RubyConstants::load(session);
        tracing::debug!(t_mask = consts.t_mask, fl_ushift = consts.fl_ushift, "loaded runtime constants");
        Self {
            session,
            consts,
            symbol_names: RefCell::new(HashMap::new()),
        }
    }

    pub fn session(&self) -> &'s Session {
        self.session
    }

    pub fn constants(&self) -> &RubyConstants {
        &self.consts
    }

    /// `VALUE` 型（デバッグ情報がなければ `unsigned long`）
    pub fn value_type(&self) -> Type {
        self.session
            .lookup_type("VALUE")
            .unwrap_or_else(|_| Type::u64_type().with_name("VALUE"))
    }

    /// 生の `VALUE` をスカラー値にする
    pub fn value(&self, raw: u64) -> Value<'s> {
        Value::scalar(self.session, self.value_type(), raw)
    }

    /// アドレスにある構造体
    pub fn object(&self, address: u64, type_name: &str) -> Result<Value<'s>> {
        let ty = self.session.lookup_type(type_name)?;
        Ok(Value::at(self.session, ty, address))
    }

    /// 型のサイズ
    pub fn size_of(&self, type_name: &str) -> Result<u64> {
        Ok(self.session.lookup_type(type_name)?.size())
    }

    /// `RBasic.flags`
    pub fn flags(&self, address: u64) -> Result<u64> {
        match self.object(address, "struct RBasic") {
            Ok(basic) => basic.field("flags")?.as_u64(),
            Err(_) => self.session.read_u64(address),
        }
    }

    /// `RBasic.klass`
    pub fn klass(&self, address: u64) -> Result<u64> {
        match self.object(address, "struct RBasic") {
            Ok(basic) => basic.field("klass")?.as_u64(),
            Err(_) => self.session.read_u64(address + 8),
        }
    }

    /// 連続した `VALUE` を読む
    pub fn read_values(&self, address: u64, count: usize) -> Result<Vec<u64>> {
        if count == 0 {
            return Ok(Vec::new());
        }
        let bytes = self.session.read_memory(address, count * 8)?;
        Ok(bytes
            .chunks_exact(8)
            .map(|word| word.iter().rev().fold(0u64, |acc, b| (acc << 8) | *b as u64))
            .collect())
    }

    /// ヒープオブジェクトの型タグ
    pub fn heap_tag(&self, address: u64) -> Result<u64> {
        Ok(self.consts.tag_of(self.flags(address)?))
    }

    /// 値の型（即値も含む）
    pub fn type_of(&self, raw: u64) -> Result<Option<RubyType>> {
        let c = &self.consts;
        let ty = if raw == c.qfalse {
            RubyType::False
        } else if raw == c.qnil {
            RubyType::Nil
        } else if raw == c.qtrue {
            RubyType::True
        } else if raw == c.qundef {
            RubyType::Undef
        } else if raw & c.fixnum_flag != 0 {
            RubyType::Fixnum
        } else if raw & c.flonum_mask == c.flonum_flag {
            RubyType::Float
        } else if self.is_static_symbol(raw) {
            RubyType::Symbol
        } else if c.is_special_const(raw) {
            return Ok(None);
        } else {
            return Ok(c.type_of_tag(self.heap_tag(raw)?));
        };
        Ok(Some(ty))
    }

    /// 値が指定の型か（読み取りに失敗したらfalse）
    pub fn is_type(&self, raw: u64, ty: RubyType) -> bool {
        matches!(self.type_of(raw), Ok(Some(t)) if t == ty)
    }

    /// 即値のシンボルか
    pub fn is_static_symbol(&self, raw: u64) -> bool {
        let mask = !(u64::MAX << self.consts.special_shift);
        raw & mask == self.consts.symbol_flag
    }

    /// グローバル変数のアドレス
    pub fn global_address(&self, name: &str) -> Option<u64> {
        self.session.backend().lookup_global(name).map(|g| g.address)
    }

    /// 型付きのグローバル変数
    pub fn global(&self, name: &str) -> Option<Value<'s>> {
        self.session.parse_and_eval(name).ok()
    }

    /// シンボル名のキャッシュを引く（未登録なら `resolve` で解決して保存する）
    pub(crate) fn cached_symbol_name(&self, id: u64, resolve: impl FnOnce() -> Option<String>) -> Option<String> {
        if let Some(name) = self.symbol_names.borrow().get(&id) {
            return name.clone();
        }
        let name = resolve();
        self.symbol_names.borrow_mut().insert(id, name.clone());
        name
    }
}
