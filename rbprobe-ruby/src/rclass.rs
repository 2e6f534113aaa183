//! クラス名の解決

use crate::constants::RubyType;
use crate::rstring::RString;
use crate::runtime::Runtime;
use crate::Result;

/// よく使われるクラスのグローバル変数と名前
const WELL_KNOWN: &[(&str, &str)] = &[
    ("rb_eException", "Exception"),
    ("rb_eStandardError", "StandardError"),
    ("rb_eSystemExit", "SystemExit"),
    ("rb_eInterrupt", "Interrupt"),
    ("rb_eSignal", "SignalException"),
    ("rb_eFatal", "fatal"),
    ("rb_eScriptError", "ScriptError"),
    ("rb_eLoadError", "LoadError"),
    ("rb_eNotImpError", "NotImplementedError"),
    ("rb_eSyntaxError", "SyntaxError"),
    ("rb_eSecurityError", "SecurityError"),
    ("rb_eNoMemError", "NoMemoryError"),
    ("rb_eTypeError", "TypeError"),
    ("rb_eArgError", "ArgumentError"),
    ("rb_eIndexError", "IndexError"),
    ("rb_eKeyError", "KeyError"),
    ("rb_eRangeError", "RangeError"),
    ("rb_eNameError", "NameError"),
    ("rb_eNoMethodError", "NoMethodError"),
    ("rb_eRuntimeError", "RuntimeError"),
    ("rb_eFrozenError", "FrozenError"),
    ("rb_eIOError", "IOError"),
    ("rb_eEOFError", "EOFError"),
    ("rb_eLocalJumpError", "LocalJumpError"),
    ("rb_eSysStackError", "SystemStackError"),
    ("rb_eRegexpError", "RegexpError"),
    ("rb_eThreadError", "ThreadError"),
    ("rb_eZeroDivError", "ZeroDivisionError"),
    ("rb_eFloatDomainError", "FloatDomainError"),
    ("rb_eStopIteration", "StopIteration"),
    ("rb_eMathDomainError", "Math::DomainError"),
    ("rb_eEncCompatError", "Encoding::CompatibilityError"),
    ("rb_cObject", "Object"),
    ("rb_cBasicObject", "BasicObject"),
    ("rb_cModule", "Module"),
    ("rb_cClass", "Class"),
    ("rb_cString", "String"),
    ("rb_cArray", "Array"),
    ("rb_cHash", "Hash"),
    ("rb_cInteger", "Integer"),
    ("rb_cFloat", "Float"),
    ("rb_cSymbol", "Symbol"),
    ("rb_cProc", "Proc"),
    ("rb_cThread", "Thread"),
];

/// `klass` のクラス名
///
/// 既知のグローバル変数との比較、`rb_classext_t.classpath` の順に試し、
/// どちらもだめなら `#<Class:0x...>` を返します。
pub fn class_name(rt: &Runtime<'_>, klass: u64) -> String {
    if let Some(name) = well_known_name(rt, klass) {
        return name.to_string();
    }
    match classpath(rt, klass) {
        Ok(Some(name)) => name,
        Ok(None) => anonymous(klass),
        Err(e) => {
            tracing::debug!(klass = format_args!("0x{:x}", klass), "classpath lookup failed: {:#}", e);
            anonymous(klass)
        }
    }
}

fn anonymous(klass: u64) -> String {
    format!("#<Class:0x{:x}>", klass)
}

fn well_known_name(rt: &Runtime<'_>, klass: u64) -> Option<&'static str> {
    WELL_KNOWN.iter().find_map(|(symbol, name)| {
        let address = rt.global_address(symbol)?;
        let value = rt.session().read_u64(address).ok()?;
        (value == klass).then_some(*name)
    })
}

/// 埋め込みの `rb_classext_t`（`struct RClass` の直後）か `RClass.ptr` の `classpath`
fn classpath(rt: &Runtime<'_>, klass: u64) -> Result<Option<String>> {
    let rclass = rt.object(klass, "struct RClass")?;
    let classext = if rclass.has_field("ptr") {
        let ptr = rclass.field("ptr")?.as_u64()?;
        rt.object(ptr, "rb_classext_t")?
    } else {
        rt.object(klass + rclass.ty().size(), "rb_classext_t")?
    };

    let path = classext.field("classpath")?.as_u64()?;
    if path == 0 || path == rt.constants().qnil || !rt.is_type(path, RubyType::String) {
        return Ok(None);
    }
    let name = RString::new(rt, path)?.to_string_lossy()?;
    Ok((!name.is_empty()).then_some(name))
}
