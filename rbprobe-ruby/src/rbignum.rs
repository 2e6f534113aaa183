//! T_BIGNUM のデコード
//!
//! 符号は `BIGNUM_SIGN_BIT`（立っていれば正）、桁は `BDIGIT` のリトルエンディアン列です。

use crate::object::Storage;
use crate::runtime::Runtime;
use crate::Result;
use num_bigint::{BigInt, BigUint, Sign};
use num_traits::Zero;
use rbprobe_core::Value;

/// 桁数の上限（これを超える値は読まない）
const MAX_DIGITS: u64 = 1 << 16;

/// 多倍長整数オブジェクト
pub struct RBignum<'r, 's> {
    rt: &'r Runtime<'s>,
    rbignum: Value<'s>,
    flags: u64,
}

impl<'r, 's> RBignum<'r, 's> {
    pub fn new(rt: &'r Runtime<'s>, address: u64) -> Result<Self> {
        Ok(Self {
            rt,
            rbignum: rt.object(address, "struct RBignum")?,
            flags: rt.flags(address)?,
        })
    }

    pub fn storage(&self) -> Storage {
        if self.flags & self.rt.constants().bignum_embed_flag != 0 {
            Storage::Embedded
        } else {
            Storage::Heap
        }
    }

    pub fn is_positive(&self) -> bool {
        self.flags & self.rt.constants().bignum_sign_bit != 0
    }

    /// 桁数
    pub fn length(&self) -> Result<u64> {
        match self.storage() {
            Storage::Embedded => {
                let c = self.rt.constants();
                Ok((self.flags & c.bignum_embed_len_mask) >> c.bignum_embed_len_shift)
            }
            Storage::Heap => self.rbignum.field("as")?.field("heap")?.field("len")?.as_u64(),
        }
    }

    fn digit_size(&self) -> u64 {
        self.rt.size_of("BDIGIT").unwrap_or(4)
    }

    fn digits_ptr(&self) -> Result<u64> {
        let as_union = self.rbignum.field("as")?;
        match self.storage() {
            Storage::Embedded => as_union
                .field("ary")?
                .address()
                .ok_or_else(|| anyhow::anyhow!("embedded bignum is not in memory")),
            Storage::Heap => as_union.field("heap")?.field("digits")?.as_u64(),
        }
    }

    /// 値
    pub fn value(&self) -> Result<BigInt> {
        let length = self.length()?;
        if length > MAX_DIGITS {
            return Err(anyhow::anyhow!("bignum has {} digits; refusing to read", length));
        }
        let size = (length * self.digit_size()) as usize;
        let magnitude = if size == 0 {
            BigUint::zero()
        } else {
            BigUint::from_bytes_le(&self.rt.session().read_memory(self.digits_ptr()?, size)?)
        };
        let sign = if magnitude.is_zero() {
            Sign::NoSign
        } else if self.is_positive() {
            Sign::Plus
        } else {
            Sign::Minus
        };
        Ok(BigInt::from_biguint(sign, magnitude))
    }
}
