//! T_STRING のデコード
//!
//! `RString` のレイアウトはバージョンで3通りあります。
//! - 最上位に `len` がある（3.3以降）
//! - `as.embed.len` に埋め込み長がある（3.2 RVARGC）
//! - 埋め込み長がフラグ `FL_USER2..6` にある（それ以前）
//!
//! どのレイアウトでも `RSTRING_NOEMBED` が立っていればヒープ上のデータです。

use crate::object::Storage;
use crate::runtime::Runtime;
use crate::Result;
use rbprobe_core::Value;

/// 読み取るバイト数の上限
pub const MAX_STRING_BYTES: usize = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Layout {
    TopLevelLen,
    EmbedLen,
    Legacy,
}

/// 文字列オブジェクト
pub struct RString<'r, 's> {
    rt: &'r Runtime<'s>,
    rstring: Value<'s>,
    flags: u64,
    layout: Layout,
}

impl<'r, 's> RString<'r, 's> {
    pub fn new(rt: &'r Runtime<'s>, address: u64) -> Result<Self> {
        let rstring = rt.object(address, "struct RString")?;
        let flags = rt.flags(address)?;
        let layout = if rstring.has_field("len") {
            Layout::TopLevelLen
        } else if embed_has_len(&rstring) {
            Layout::EmbedLen
        } else {
            Layout::Legacy
        };
        Ok(Self {
            rt,
            rstring,
            flags,
            layout,
        })
    }

    pub fn storage(&self) -> Storage {
        if self.flags & self.rt.constants().string_noembed != 0 {
            Storage::Heap
        } else {
            Storage::Embedded
        }
    }

    /// 文字列長（バイト）
    pub fn length(&self) -> Result<u64> {
        let heap = self.storage() == Storage::Heap;
        match self.layout {
            Layout::TopLevelLen => self.rstring.field("len")?.as_u64(),
            Layout::EmbedLen if heap => self.rstring.field("as")?.field("heap")?.field("len")?.as_u64(),
            Layout::EmbedLen => self.rstring.field("as")?.field("embed")?.field("len")?.as_u64(),
            Layout::Legacy if heap => self.rstring.field("as")?.field("heap")?.field("len")?.as_u64(),
            Layout::Legacy => {
                let c = self.rt.constants();
                let mask = (2..=6).fold(0u64, |acc, n| acc | (1 << (c.fl_ushift + n)));
                Ok((self.flags & mask) >> (c.fl_ushift + 2))
            }
        }
    }

    /// データの先頭アドレス
    pub fn data_ptr(&self) -> Result<u64> {
        let as_union = self.rstring.field("as")?;
        if self.storage() == Storage::Heap {
            return as_union.field("heap")?.field("ptr")?.as_u64();
        }
        let ary = match self.layout {
            Layout::Legacy => as_union.field("ary")?,
            _ => as_union.field("embed")?.field("ary")?,
        };
        ary.address()
            .ok_or_else(|| anyhow::anyhow!("embedded string buffer is not in memory"))
    }

    /// 内容を読む（`max` バイトまで）
    pub fn read_bytes(&self, max: usize) -> Result<Vec<u8>> {
        let length = (self.length()? as usize).min(max);
        let data = self.data_ptr()?;
        if length == 0 {
            return Ok(Vec::new());
        }
        self.rt.session().read_memory(data, length)
    }

    /// UTF-8として読む（不正なバイトは置換）
    pub fn to_string_lossy(&self) -> Result<String> {
        Ok(String::from_utf8_lossy(&self.read_bytes(MAX_STRING_BYTES)?).into_owned())
    }
}

fn embed_has_len(rstring: &Value<'_>) -> bool {
    rstring
        .field("as")
        .and_then(|u| u.field("embed"))
        .map(|embed| embed.has_field("len"))
        .unwrap_or(false)
}

/// Rubyの `inspect` に近い形で引用する（`'...'`）
pub fn quote(bytes: &[u8]) -> String {
    let text = String::from_utf8_lossy(bytes);
    let mut out = String::with_capacity(text.len() + 2);
    out.push('\'');
    for c in text.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '\'' => out.push_str("\\'"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            c if c.is_control() => out.push_str(&format!("\\x{:02x}", c as u32)),
            c => out.push(c),
        }
    }
    out.push('\'');
    out
}
