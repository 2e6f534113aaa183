//! T_FLOAT のデコード（即値のflonumとヒープ上の `RFloat`）

use crate::runtime::Runtime;
use crate::Result;

/// flonumの0.0
const FLONUM_ZERO: u64 = 0x8000_0000_0000_0002;

/// flonumを倍精度浮動小数点数に戻す
///
/// 指数部の上位2ビットを復元してから3ビット右に回転します。
pub fn flonum_value(raw: u64) -> f64 {
    if raw == FLONUM_ZERO {
        return 0.0;
    }
    let b63 = raw >> 63;
    let adjusted = (2u64.wrapping_sub(b63)) | (raw & !0x03);
    f64::from_bits(adjusted.rotate_right(3))
}

/// ヒープ上の `RFloat.float_value`
pub fn heap_value(rt: &Runtime<'_>, address: u64) -> Result<f64> {
    rt.object(address, "struct RFloat")?.field("float_value")?.as_f64()
}
