//! 例外オブジェクト

use crate::constants::RubyType;
use crate::rclass::class_name;
use crate::runtime::Runtime;
use std::fmt;

/// 例外（クラス名のみ。メッセージはインスタンス変数の走査が必要なので扱わない）
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RubyException {
    pub address: u64,
    pub class_name: String,
}

impl RubyException {
    /// 例外らしい値なら読む（T_OBJECT か T_DATA のヒープオブジェクト）
    pub fn from_value(rt: &Runtime<'_>, raw: u64) -> Option<Self> {
        if !is_exception(rt, raw) {
            return None;
        }
        let klass = rt.klass(raw).ok()?;
        Some(Self {
            address: raw,
            class_name: class_name(rt, klass),
        })
    }
}

impl fmt::Display for RubyException {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.class_name)
    }
}

/// 例外オブジェクトの候補か
pub fn is_exception(rt: &Runtime<'_>, raw: u64) -> bool {
    if rt.constants().is_special_const(raw) {
        return false;
    }
    matches!(rt.type_of(raw), Ok(Some(RubyType::Object | RubyType::Data)))
}
