//! 分類結果の表示
//!
//! 見出し行のあとに子を1段ずつ字下げして並べます。
//!
//! ```text
//! <T_HASH@0x7f.. AR-Table size=2 bound=2>
//!   [   0] K: <T_SYMBOL> :name
//!          V: <T_STRING@0x7f.. embedded length=5> 'Alice'
//!   [   1] K: <T_SYMBOL> :age
//!          V: <T_FIXNUM> 30
//! ```

use crate::constants::RubyType;
use crate::object::{classify, RubyObject};
use crate::rclass::class_name;
use crate::runtime::Runtime;
use crate::Result;
use rbprobe_core::Value;
use std::io::Write;

const INDENT: &str = "  ";

/// `rb-object-print` の表示設定
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ObjectPrinter {
    /// 子を展開する段数
    pub depth: usize,
    /// 生のフィールドも表示する
    pub debug: bool,
}

impl Default for ObjectPrinter {
    fn default() -> Self {
        Self { depth: 1, debug: false }
    }
}

impl ObjectPrinter {
    pub fn new(depth: usize, debug: bool) -> Self {
        Self { depth, debug }
    }

    /// 値を分類して表示する
    ///
    /// 最下段の子の見出しも中身付きで出せるよう、表示の深さより1段深く分類します。
    pub fn print(&self, rt: &Runtime<'_>, raw: u64, out: &mut dyn Write) -> Result<RubyObject> {
        let object = classify(rt, raw, self.depth + 1);
        if self.debug {
            self.dump_raw(rt, raw, &object, out)?;
        }
        self.render(&object, out)?;
        Ok(object)
    }

    /// 分類済みの値を表示する
    pub fn render(&self, object: &RubyObject, out: &mut dyn Write) -> Result<()> {
        writeln!(out, "{}", object)?;
        self.render_children(object, 1, self.depth, out)
    }

    fn render_children(&self, object: &RubyObject, level: usize, remaining: usize, out: &mut dyn Write) -> Result<()> {
        if !object.has_children() {
            return Ok(());
        }
        let indent = INDENT.repeat(level);
        if remaining == 0 {
            writeln!(out, "{}...", indent)?;
            return Ok(());
        }

        match object {
            RubyObject::Array { items, length, .. }
            | RubyObject::Struct {
                members: items,
                length,
                ..
            } => {
                for (i, item) in items.iter().enumerate() {
                    writeln!(out, "{}[{:>4}] I: {}", indent, i, item)?;
                    self.render_children(item, level + 1, remaining - 1, out)?;
                }
                self.more(items.len() as u64, *length, &indent, out)?;
            }
            RubyObject::Hash { entries, table, .. } => {
                for (i, (key, value)) in entries.iter().enumerate() {
                    writeln!(out, "{}[{:>4}] K: {}", indent, i, key)?;
                    self.render_children(key, level + 1, remaining - 1, out)?;
                    writeln!(out, "{}       V: {}", indent, value)?;
                    self.render_children(value, level + 1, remaining - 1, out)?;
                }
                self.more(entries.len() as u64, table.len(), &indent, out)?;
            }
            _ => {}
        }
        Ok(())
    }

    fn more(&self, shown: u64, total: u64, indent: &str, out: &mut dyn Write) -> Result<()> {
        if shown < total {
            writeln!(out, "{}... ({} more)", indent, total - shown)?;
        }
        Ok(())
    }

    /// `--debug`: ヘッダと構造体のフィールドをそのまま表示する
    fn dump_raw(&self, rt: &Runtime<'_>, raw: u64, object: &RubyObject, out: &mut dyn Write) -> Result<()> {
        writeln!(out, "VALUE: 0x{:x}", raw)?;
        let Some(address) = object.address() else {
            writeln!(out, "  (immediate)")?;
            return Ok(());
        };

        match rt.flags(address) {
            Ok(flags) => writeln!(out, "  flags: 0x{:x} (type 0x{:x})", flags, rt.constants().tag_of(flags))?,
            Err(e) => writeln!(out, "  flags: <error: {:#}>", e)?,
        }
        if let Ok(klass) = rt.klass(address) {
            if klass != 0 {
                writeln!(out, "  klass: 0x{:x} ({})", klass, class_name(rt, klass))?;
            }
        }

        let Some(type_name) = object.tag().and_then(struct_name) else {
            return Ok(());
        };
        let Ok(value) = rt.object(address, type_name) else {
            return Ok(());
        };
        writeln!(out, "  {}:", type_name)?;
        for field in value.ty().fields() {
            if field.name.is_empty() || field.name == "basic" {
                continue;
            }
            writeln!(out, "    {} = {}", field.name, describe_field(&value, &field.name))?;
        }
        Ok(())
    }
}

fn struct_name(tag: RubyType) -> Option<&'static str> {
    Some(match tag {
        RubyType::Object => "struct RObject",
        RubyType::Class | RubyType::Module | RubyType::IClass => "struct RClass",
        RubyType::Float => "struct RFloat",
        RubyType::String => "struct RString",
        RubyType::Array => "struct RArray",
        RubyType::Hash => "struct RHash",
        RubyType::Struct => "struct RStruct",
        RubyType::Bignum => "struct RBignum",
        RubyType::Data => "struct RTypedData",
        RubyType::Symbol => "struct RSymbol",
        _ => return None,
    })
}

fn describe_field(value: &Value<'_>, name: &str) -> String {
    match value.field(name) {
        Ok(field) if field.ty().is_scalar() => match field.as_u64() {
            Ok(bits) => format!("0x{:x}", bits),
            Err(e) => format!("<error: {:#}>", e),
        },
        Ok(field) => format!("<{}>", field.ty()),
        Err(e) => format!("<error: {:#}>", e),
    }
}
