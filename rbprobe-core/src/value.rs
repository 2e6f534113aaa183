//! デバッグ対象の値
//!
//! `Value` はセッションに束縛された読み取り専用のハンドルです。メモリ上の値（左辺値）と
//! 計算結果のスカラーのどちらかを表します。

use crate::types::{Field, Type, TypeKind};
use crate::{Result, Session};
use std::any::Any;
use std::fmt;

/// 値の実体
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Repr {
    /// アドレスにある値
    Memory(u64),
    /// 計算済みの値（ビット列）
    Scalar(u64),
}

/// `Value::get` のキー（フィールド名またはインデックス）
#[derive(Debug, Clone, Copy)]
pub enum Member<'k> {
    Field(&'k str),
    Index(i64),
}

impl<'k> From<&'k str> for Member<'k> {
    fn from(name: &'k str) -> Self {
        Member::Field(name)
    }
}

impl From<i64> for Member<'_> {
    fn from(index: i64) -> Self {
        Member::Index(index)
    }
}

impl From<usize> for Member<'_> {
    fn from(index: usize) -> Self {
        Member::Index(index as i64)
    }
}

/// セッションから切り離した値（コンビニエンス変数用）
#[derive(Debug, Clone)]
pub struct StoredValue {
    pub(crate) ty: Type,
    pub(crate) repr: Repr,
}

impl StoredValue {
    pub fn ty(&self) -> &Type {
        &self.ty
    }
}

/// デバッグ対象の値
#[derive(Clone)]
pub struct Value<'s> {
    session: &'s Session,
    ty: Type,
    repr: Repr,
}

impl<'s> Value<'s> {
    /// アドレスにある値
    pub fn at(session: &'s Session, ty: Type, address: u64) -> Self {
        Self {
            session,
            ty,
            repr: Repr::Memory(address),
        }
    }

    /// 計算済みのスカラー値（型のサイズに切り詰める）
    pub fn scalar(session: &'s Session, ty: Type, bits: u64) -> Self {
        let bits = normalize(&ty, bits);
        Self {
            session,
            ty,
            repr: Repr::Scalar(bits),
        }
    }

    /// `unsigned long` のスカラー値
    pub fn from_u64(session: &'s Session, value: u64) -> Self {
        Self::scalar(session, Type::u64_type(), value)
    }

    pub(crate) fn from_stored(session: &'s Session, stored: &StoredValue) -> Self {
        Self {
            session,
            ty: stored.ty.clone(),
            repr: stored.repr,
        }
    }

    /// セッションから切り離す
    pub fn detach(&self) -> StoredValue {
        StoredValue {
            ty: self.ty.clone(),
            repr: self.repr,
        }
    }

    pub fn ty(&self) -> &Type {
        &self.ty
    }

    pub fn session(&self) -> &'s Session {
        self.session
    }

    /// メモリ上の値ならそのアドレス
    pub fn address(&self) -> Option<u64> {
        match self.repr {
            Repr::Memory(addr) => Some(addr),
            Repr::Scalar(_) => None,
        }
    }

    /// バックエンド固有の実装へのエスケープハッチ
    pub fn native(&self) -> &'s dyn Any {
        self.session.backend().as_any()
    }

    /// `&value`
    pub fn address_of(&self) -> Result<Value<'s>> {
        match self.repr {
            Repr::Memory(addr) => Ok(Value::scalar(self.session, self.ty.pointer(), addr)),
            Repr::Scalar(_) => Err(anyhow::anyhow!("Attempt to take address of value not located in memory")),
        }
    }

    /// 整数として読む（`int()`）
    pub fn as_u64(&self) -> Result<u64> {
        match (self.repr, self.ty.kind()) {
            (Repr::Scalar(bits), _) => Ok(bits),
            // 配列と関数はアドレスに縮退する
            (Repr::Memory(addr), TypeKind::Array { .. } | TypeKind::Function) => Ok(addr),
            (Repr::Memory(addr), _) if self.ty.is_scalar() => {
                let size = self.ty.size().clamp(1, 8) as usize;
                let bytes = self.session.read_memory(addr, size)?;
                Ok(normalize(&self.ty, le_bits(&bytes)))
            }
            _ => Err(anyhow::anyhow!("Value of type '{}' is not a scalar", self.ty)),
        }
    }

    /// 符号付き整数として読む
    pub fn as_i64(&self) -> Result<i64> {
        Ok(self.as_u64()? as i64)
    }

    /// 浮動小数点数として読む
    pub fn as_f64(&self) -> Result<f64> {
        let bits = self.as_u64()?;
        if self.ty.is_float() {
            return Ok(match self.ty.size() {
                4 => f32::from_bits(bits as u32) as f64,
                _ => f64::from_bits(bits),
            });
        }
        Ok(if self.ty.is_signed() {
            bits as i64 as f64
        } else {
            bits as f64
        })
    }

    /// 型を変換する
    ///
    /// スカラー同士は値の変換、集成型へはアドレスの再解釈になります。
    pub fn cast(&self, ty: &Type) -> Result<Value<'s>> {
        let source_scalar = self.ty.is_scalar()
            || matches!(self.ty.kind(), TypeKind::Array { .. } | TypeKind::Function)
            || matches!(self.repr, Repr::Scalar(_));
        if ty.is_scalar() && source_scalar {
            return Ok(Value::scalar(self.session, ty.clone(), self.as_u64()?));
        }
        match self.repr {
            Repr::Memory(addr) => Ok(Value::at(self.session, ty.clone(), addr)),
            Repr::Scalar(_) => Err(anyhow::anyhow!("Invalid cast from '{}' to '{}'", self.ty, ty)),
        }
    }

    /// ポインタの参照先（`*value`）
    pub fn dereference(&self) -> Result<Value<'s>> {
        match self.ty.kind() {
            TypeKind::Pointer { pointee } => {
                let pointee = self.session.resolve(pointee)?;
                if matches!(pointee.kind(), TypeKind::Void) {
                    return Err(anyhow::anyhow!("Attempt to take contents of a void pointer"));
                }
                Ok(Value::at(self.session, pointee, self.as_u64()?))
            }
            TypeKind::Array { .. } => self.index(0),
            _ => Err(anyhow::anyhow!(
                "Attempt to take contents of a non-pointer value of type '{}'",
                self.ty
            )),
        }
    }

    /// フィールドまたは要素（`value[field_or_index]`）
    pub fn get<'k>(&self, key: impl Into<Member<'k>>) -> Result<Value<'s>> {
        match key.into() {
            Member::Field(name) => self.field(name),
            Member::Index(index) => self.index(index),
        }
    }

    /// フィールドを取り出す（ポインタは自動的に参照をたどる）
    pub fn field(&self, name: &str) -> Result<Value<'s>> {
        if self.ty.is_pointer() {
            return self.dereference()?.field(name);
        }

        let (offset, field) = find_field(self.session, &self.ty, name)?
            .ok_or_else(|| anyhow::anyhow!("There is no member named '{}' in '{}'", name, self.ty))?;

        let Repr::Memory(base) = self.repr else {
            return Err(anyhow::anyhow!("Cannot access member '{}' of a value not in memory", name));
        };
        let field_ty = self.session.resolve(&field.ty)?;
        let address = base.wrapping_add(offset);

        match field.bit_field {
            Some((bit_offset, bit_size)) => {
                let span = ((bit_offset + bit_size + 7) / 8).clamp(1, 8) as usize;
                let raw = le_bits(&self.session.read_memory(address, span)?);
                let mask = if bit_size >= 64 { u64::MAX } else { (1u64 << bit_size) - 1 };
                let mut bits = (raw >> bit_offset) & mask;
                if field_ty.is_signed() && bit_size > 0 && bit_size < 64 && bits & (1 << (bit_size - 1)) != 0 {
                    bits |= !mask;
                }
                Ok(Value {
                    session: self.session,
                    ty: field_ty,
                    repr: Repr::Scalar(bits),
                })
            }
            None => Ok(Value::at(self.session, field_ty, address)),
        }
    }

    /// フィールドを持つかどうか（レイアウトの版の判定に使う）
    pub fn has_field(&self, name: &str) -> bool {
        let ty = if self.ty.is_pointer() {
            match self.ty.kind() {
                TypeKind::Pointer { pointee } => match self.session.resolve(pointee) {
                    Ok(ty) => ty,
                    Err(_) => return false,
                },
                _ => return false,
            }
        } else {
            self.ty.clone()
        };
        matches!(find_field(self.session, &ty, name), Ok(Some(_)))
    }

    /// 要素を取り出す（負のインデックスも可）
    pub fn index(&self, index: i64) -> Result<Value<'s>> {
        match self.ty.kind() {
            TypeKind::Pointer { pointee } => {
                let element = self.session.resolve(pointee)?;
                let address = scaled(self.as_u64()?, index, element.size().max(1));
                Ok(Value::at(self.session, element, address))
            }
            TypeKind::Array { element, .. } => {
                let element = self.session.resolve(element)?;
                let Repr::Memory(base) = self.repr else {
                    return Err(anyhow::anyhow!("Cannot index an array not in memory"));
                };
                let address = scaled(base, index, element.size().max(1));
                Ok(Value::at(self.session, element, address))
            }
            _ => Err(anyhow::anyhow!("Cannot subscript a value of type '{}'", self.ty)),
        }
    }

    /// ポインタ演算（参照先のサイズ単位）
    pub fn offset(&self, n: i64) -> Result<Value<'s>> {
        match self.ty.kind() {
            TypeKind::Pointer { pointee } => {
                let pointee = self.session.resolve(pointee)?;
                let address = scaled(self.as_u64()?, n, pointee.size().max(1));
                Ok(Value::scalar(self.session, self.ty.clone(), address))
            }
            TypeKind::Array { element, .. } => {
                let element = self.session.resolve(element)?;
                let base = self.as_u64()?;
                Ok(Value::scalar(self.session, element.pointer(), scaled(base, n, element.size().max(1))))
            }
            _ => Err(anyhow::anyhow!("Pointer arithmetic on non-pointer type '{}'", self.ty)),
        }
    }

    /// 値の指す先（ポインタなら参照先、それ以外は値自身の位置）からバイト列を読む
    pub fn read_bytes(&self, len: usize) -> Result<Vec<u8>> {
        let address = self.data_address()?;
        self.session.read_memory(address, len)
    }

    /// NUL終端文字列を読む（最大 `max` バイト）
    pub fn read_c_string(&self, max: usize) -> Result<String> {
        let address = self.data_address()?;
        self.session.read_c_string(address, max)
    }

    fn data_address(&self) -> Result<u64> {
        match (self.repr, self.ty.kind()) {
            (_, TypeKind::Pointer { .. }) => self.as_u64(),
            (Repr::Memory(addr), _) => Ok(addr),
            (Repr::Scalar(bits), _) => Ok(bits),
        }
    }
}

impl fmt::Debug for Value<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Value({}, {:?})", self.ty, self.repr)
    }
}

impl fmt::Display for Value<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.ty.kind() {
            TypeKind::Struct { .. } | TypeKind::Union { .. } => match self.address() {
                Some(addr) => write!(f, "({}) @0x{:x}", self.ty, addr),
                None => write!(f, "({}) <not in memory>", self.ty),
            },
            TypeKind::Enum { members } => match self.as_i64() {
                Ok(v) => match members.iter().find(|(_, value)| *value == v) {
                    Some((name, _)) => f.write_str(name),
                    None => write!(f, "{}", v),
                },
                Err(e) => write!(f, "<{}>", e),
            },
            TypeKind::Pointer { .. } | TypeKind::Array { .. } | TypeKind::Function => match self.as_u64() {
                Ok(v) => write!(f, "0x{:x}", v),
                Err(e) => write!(f, "<{}>", e),
            },
            TypeKind::Base { float: true, .. } => match self.as_f64() {
                Ok(v) => write!(f, "{}", v),
                Err(e) => write!(f, "<{}>", e),
            },
            TypeKind::Base { signed: true, .. } => match self.as_i64() {
                Ok(v) => write!(f, "{}", v),
                Err(e) => write!(f, "<{}>", e),
            },
            TypeKind::Base { .. } => match self.as_u64() {
                Ok(v) => write!(f, "{}", v),
                Err(e) => write!(f, "<{}>", e),
            },
            TypeKind::Void => f.write_str("void"),
        }
    }
}

/// 無名メンバの中まで含めてフィールドを探す
fn find_field(session: &Session, ty: &Type, name: &str) -> Result<Option<(u64, Field)>> {
    for field in ty.fields() {
        if field.name == name {
            return Ok(Some((field.offset, field.clone())));
        }
        if field.name.is_empty() {
            let inner = session.resolve(&field.ty)?;
            if let Some((offset, found)) = find_field(session, &inner, name)? {
                return Ok(Some((field.offset + offset, found)));
            }
        }
    }
    Ok(None)
}

fn scaled(base: u64, index: i64, size: u64) -> u64 {
    base.wrapping_add((index as u64).wrapping_mul(size))
}

fn le_bits(bytes: &[u8]) -> u64 {
    bytes
        .iter()
        .take(8)
        .enumerate()
        .fold(0u64, |acc, (i, b)| acc | ((*b as u64) << (i * 8)))
}

/// 型のサイズに切り詰め、符号付きなら符号拡張する
fn normalize(ty: &Type, bits: u64) -> u64 {
    let size = ty.size();
    if size == 0 || size >= 8 || ty.is_float() {
        return bits;
    }
    let width = size * 8;
    let mask = (1u64 << width) - 1;
    let value = bits & mask;
    if ty.is_signed() && value & (1 << (width - 1)) != 0 {
        value | !mask
    } else {
        value
    }
}

impl From<&Value<'_>> for StoredValue {
    fn from(value: &Value<'_>) -> Self {
        value.detach()
    }
}
