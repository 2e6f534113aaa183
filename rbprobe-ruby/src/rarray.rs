//! T_ARRAY のデコード

use crate::object::Storage;
use crate::runtime::Runtime;
use crate::Result;
use rbprobe_core::Value;

/// 配列オブジェクト
pub struct RArray<'r, 's> {
    rt: &'r Runtime<'s>,
    rarray: Value<'s>,
    flags: u64,
}

impl<'r, 's> RArray<'r, 's> {
    pub fn new(rt: &'r Runtime<'s>, address: u64) -> Result<Self> {
        Ok(Self {
            rt,
            rarray: rt.object(address, "struct RArray")?,
            flags: rt.flags(address)?,
        })
    }

    /// `RARRAY_EMBED_FLAG` が立っていれば埋め込み
    pub fn storage(&self) -> Storage {
        if self.flags & self.rt.constants().array_embed_flag != 0 {
            Storage::Embedded
        } else {
            Storage::Heap
        }
    }

    pub fn length(&self) -> Result<u64> {
        match self.storage() {
            Storage::Embedded => {
                let c = self.rt.constants();
                Ok((self.flags & c.array_embed_len_mask) >> c.array_embed_len_shift)
            }
            Storage::Heap => self.rarray.field("as")?.field("heap")?.field("len")?.as_u64(),
        }
    }

    /// 要素配列の先頭アドレス
    pub fn items_ptr(&self) -> Result<u64> {
        let as_union = self.rarray.field("as")?;
        match self.storage() {
            Storage::Embedded => as_union
                .field("ary")?
                .address()
                .ok_or_else(|| anyhow::anyhow!("embedded array is not in memory")),
            Storage::Heap => as_union.field("heap")?.field("ptr")?.as_u64(),
        }
    }

    /// `index` 番目の要素
    pub fn get(&self, index: u64) -> Result<u64> {
        let length = self.length()?;
        if index >= length {
            return Err(anyhow::anyhow!("Index {} out of range (length {})", index, length));
        }
        self.rt.session().read_u64(self.items_ptr()? + index * 8)
    }

    /// 要素をまとめて読む（最大 `max` 個）
    pub fn items(&self, max: usize) -> Result<Vec<u64>> {
        let count = (self.length()? as usize).min(max);
        if count == 0 {
            return Ok(Vec::new());
        }
        self.rt.read_values(self.items_ptr()?, count)
    }
}
