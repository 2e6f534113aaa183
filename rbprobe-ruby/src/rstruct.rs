//! T_STRUCT のデコード

use crate::object::Storage;
use crate::runtime::Runtime;
use crate::Result;
use rbprobe_core::Value;

/// 構造体オブジェクト
pub struct RStruct<'r, 's> {
    rt: &'r Runtime<'s>,
    rstruct: Value<'s>,
    flags: u64,
}

impl<'r, 's> RStruct<'r, 's> {
    pub fn new(rt: &'r Runtime<'s>, address: u64) -> Result<Self> {
        Ok(Self {
            rt,
            rstruct: rt.object(address, "struct RStruct")?,
            flags: rt.flags(address)?,
        })
    }

    /// 埋め込み長のビットが立っていれば埋め込み
    pub fn storage(&self) -> Storage {
        if self.flags & self.rt.constants().struct_embed_len_mask != 0 {
            Storage::Embedded
        } else {
            Storage::Heap
        }
    }

    pub fn length(&self) -> Result<u64> {
        match self.storage() {
            Storage::Embedded => {
                let c = self.rt.constants();
                Ok((self.flags & c.struct_embed_len_mask) >> c.struct_embed_len_shift)
            }
            Storage::Heap => self.rstruct.field("as")?.field("heap")?.field("len")?.as_u64(),
        }
    }

    fn items_ptr(&self) -> Result<u64> {
        let as_union = self.rstruct.field("as")?;
        match self.storage() {
            Storage::Embedded => as_union
                .field("ary")?
                .address()
                .ok_or_else(|| anyhow::anyhow!("embedded struct is not in memory")),
            Storage::Heap => as_union.field("heap")?.field("ptr")?.as_u64(),
        }
    }

    /// メンバの値（最大 `max` 個）
    pub fn members(&self, max: usize) -> Result<Vec<u64>> {
        let count = (self.length()? as usize).min(max);
        if count == 0 {
            return Ok(Vec::new());
        }
        self.rt.read_values(self.items_ptr()?, count)
    }
}
