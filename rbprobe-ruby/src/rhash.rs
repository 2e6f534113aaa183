//! T_HASH のデコード
//!
//! 小さいハッシュはARテーブル（最大8ペアの配列）、大きいハッシュはSTテーブルです。
//! 3.3以降はどちらも `struct RHash` の直後に埋め込まれ、3.2では `as.ar`/`as.st` の
//! ポインタから参照されます。

use crate::object::HashTable;
use crate::runtime::Runtime;
use crate::Result;
use rbprobe_core::Value;

/// ハッシュオブジェクト
pub struct RHash<'r, 's> {
    rt: &'r Runtime<'s>,
    address: u64,
    rhash: Value<'s>,
    flags: u64,
}

impl<'r, 's> RHash<'r, 's> {
    pub fn new(rt: &'r Runtime<'s>, address: u64) -> Result<Self> {
        Ok(Self {
            rt,
            address,
            rhash: rt.object(address, "struct RHash")?,
            flags: rt.flags(address)?,
        })
    }

    pub fn is_st_table(&self) -> bool {
        self.flags & self.rt.constants().hash_st_table_flag != 0
    }

    /// テーブルの種類と大きさ
    pub fn table(&self) -> Result<HashTable> {
        let c = self.rt.constants();
        if self.is_st_table() {
            let entries = self.st_table()?.field("num_entries")?.as_u64()?;
            return Ok(HashTable::St { entries });
        }
        Ok(HashTable::Ar {
            size: (self.flags & c.hash_ar_size_mask) >> c.hash_ar_size_shift,
            bound: (self.flags & c.hash_ar_bound_mask) >> c.hash_ar_bound_shift,
        })
    }

    /// 埋め込みテーブルのアドレス、または3.2の `as` ポインタ
    fn table_address(&self, member: &str) -> Result<u64> {
        if self.rhash.has_field("as") {
            return self.rhash.field("as")?.field(member)?.as_u64();
        }
        Ok(self.address + self.rt.size_of("struct RHash")?)
    }

    fn st_table(&self) -> Result<Value<'s>> {
        let address = self.table_address("st")?;
        self.rt
            .object(address, "st_table")
            .or_else(|_| self.rt.object(address, "struct st_table"))
    }

    /// キーと値のペア（削除済みのエントリは飛ばす、最大 `max` 個）
    pub fn pairs(&self, max: usize) -> Result<Vec<(u64, u64)>> {
        let qundef = self.rt.constants().qundef;
        let mut pairs = Vec::new();

        if self.is_st_table() {
            let st = self.st_table()?;
            let start = st.field("entries_start")?.as_u64()?;
            let bound = st.field("entries_bound")?.as_u64()?;
            let entries = st.field("entries")?;
            for i in start..bound {
                if pairs.len() >= max {
                    break;
                }
                let entry = entries.index(i as i64)?;
                let key = entry.field("key")?.as_u64()?;
                if key != qundef {
                    pairs.push((key, entry.field("record")?.as_u64()?));
                }
            }
            return Ok(pairs);
        }

        let HashTable::Ar { bound, .. } = self.table()? else {
            return Ok(pairs);
        };
        let ar = self.rt.object(self.table_address("ar")?, "struct ar_table_struct")?;
        let table = ar.field("pairs")?;
        for i in 0..bound.min(8) {
            if pairs.len() >= max {
                break;
            }
            let pair = table.index(i as i64)?;
            let key = pair.field("key")?.as_u64()?;
            if key != qundef {
                pairs.push((key, pair.field("val")?.as_u64()?));
            }
        }
        Ok(pairs)
    }
}
