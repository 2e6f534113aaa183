//! 式評価エンジン
//!
//! デバッガで使用するC風の式をパースして評価します（printコマンドやRubyコマンドの引数）。
//!
//! ```text
//! expr     := additive
//! additive := unary (('+' | '-') unary)*
//! unary    := '*' unary | '&' unary | '-' unary | '(' type ')' unary | sizeof '(' type ')' | postfix
//! postfix  := primary ('->' ident | '.' ident | '[' expr ']')*
//! primary  := integer | ident | '$' ident | '(' expr ')'
//! ```

use crate::errors::DebuggerError;
use crate::types::Type;
use crate::value::Value;
use crate::{Result, Session};

/// 式の抽象構文木
#[derive(Debug, Clone, PartialEq)]
pub enum Expression {
    /// 整数リテラル
    Integer(u64),
    /// 識別子: `ruby_current_vm_ptr`
    Identifier(String),
    /// コンビニエンス変数: `$fiber`
    Convenience(String),
    /// `*expr`
    Deref(Box<Expression>),
    /// `&expr`
    AddressOf(Box<Expression>),
    /// `-expr`
    Negate(Box<Expression>),
    /// `(type)expr`
    Cast { ty: String, expr: Box<Expression> },
    /// `sizeof(type)`
    SizeOf(String),
    /// `obj.field`
    Member { base: Box<Expression>, field: String },
    /// `ptr->field`
    Arrow { base: Box<Expression>, field: String },
    /// `arr[index]`
    Index { base: Box<Expression>, index: Box<Expression> },
    /// `a + b` / `a - b`
    Binary { op: BinaryOp, lhs: Box<Expression>, rhs: Box<Expression> },
}

/// 二項演算子
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Add,
    Sub,
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Integer(u64),
    Ident(String),
    Dollar(String),
    Arrow,
    Punct(char),
}

/// 型名の先頭になり得るキーワード
const TYPE_KEYWORDS: &[&str] = &[
    "struct", "union", "enum", "unsigned", "signed", "const", "volatile", "char", "short", "int", "long",
    "float", "double", "void",
];

fn tokenize(input: &str) -> Result<Vec<Token>> {
    let chars: Vec<char> = input.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        if c.is_whitespace() {
            i += 1;
        } else if c.is_ascii_digit() {
            let start = i;
            while i < chars.len() && chars[i].is_ascii_alphanumeric() {
                i += 1;
            }
            let text: String = chars[start..i].iter().collect();
            tokens.push(Token::Integer(parse_integer(&text)?));
        } else if c.is_ascii_alphabetic() || c == '_' || c == '$' {
            let start = i;
            i += 1;
            while i < chars.len() && (chars[i].is_ascii_alphanumeric() || chars[i] == '_') {
                i += 1;
            }
            let text: String = chars[start..i].iter().collect();
            match text.strip_prefix('$') {
                Some(name) if !name.is_empty() => tokens.push(Token::Dollar(name.to_string())),
                Some(_) => return Err(anyhow::anyhow!("Expected a variable name after '$'")),
                None => tokens.push(Token::Ident(text)),
            }
        } else if c == '-' && chars.get(i + 1) == Some(&'>') {
            tokens.push(Token::Arrow);
            i += 2;
        } else if "*&()[].+-".contains(c) {
            tokens.push(Token::Punct(c));
            i += 1;
        } else {
            return Err(anyhow::anyhow!("Unexpected character '{}'", c));
        }
    }

    Ok(tokens)
}

fn parse_integer(text: &str) -> Result<u64> {
    let text = text.trim_end_matches(|c: char| matches!(c, 'u' | 'U' | 'l' | 'L'));
    if let Some(hex) = text.strip_prefix("0x").or_else(|| text.strip_prefix("0X")) {
        u64::from_str_radix(hex, 16).map_err(|e| anyhow::anyhow!("Invalid hexadecimal literal '{}': {}", text, e))
    } else {
        text.parse::<u64>()
            .map_err(|e| anyhow::anyhow!("Invalid integer literal '{}': {}", text, e))
    }
}

/// 再帰下降パーサー
struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn peek_at(&self, offset: usize) -> Option<&Token> {
        self.tokens.get(self.pos + offset)
    }

    fn next(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        self.pos += 1;
        token
    }

    fn expect_punct(&mut self, c: char) -> Result<()> {
        match self.next() {
            Some(Token::Punct(p)) if p == c => Ok(()),
            other => Err(anyhow::anyhow!("Expected '{}', found {:?}", c, other)),
        }
    }

    fn expect_ident(&mut self) -> Result<String> {
        match self.next() {
            Some(Token::Ident(name)) => Ok(name),
            other => Err(anyhow::anyhow!("Expected a field name, found {:?}", other)),
        }
    }

    fn parse_expression(&mut self) -> Result<Expression> {
        let mut lhs = self.parse_unary()?;
        loop {
            let op = match self.peek() {
                Some(Token::Punct('+')) => BinaryOp::Add,
                Some(Token::Punct('-')) => BinaryOp::Sub,
                _ => return Ok(lhs),
            };
            self.pos += 1;
            let rhs = self.parse_unary()?;
            lhs = Expression::Binary {
                op,
                lhs: Box::new(lhs),
                rhs: Box::new(rhs),
            };
        }
    }

    fn parse_unary(&mut self) -> Result<Expression> {
        match self.peek() {
            Some(Token::Punct('*')) => {
                self.pos += 1;
                Ok(Expression::Deref(Box::new(self.parse_unary()?)))
            }
            Some(Token::Punct('&')) => {
                self.pos += 1;
                Ok(Expression::AddressOf(Box::new(self.parse_unary()?)))
            }
            Some(Token::Punct('-')) => {
                self.pos += 1;
                Ok(Expression::Negate(Box::new(self.parse_unary()?)))
            }
            Some(Token::Ident(name)) if name == "sizeof" => {
                self.pos += 1;
                self.expect_punct('(')?;
                let ty = self.parse_type_name()?;
                self.expect_punct(')')?;
                Ok(Expression::SizeOf(ty))
            }
            Some(Token::Punct('(')) if self.cast_ahead() => {
                self.pos += 1;
                let ty = self.parse_type_name()?;
                self.expect_punct(')')?;
                let expr = self.parse_unary()?;
                Ok(Expression::Cast { ty, expr: Box::new(expr) })
            }
            _ => self.parse_postfix(),
        }
    }

    /// `(` の後ろが型名かどうか
    ///
    /// 型キーワードで始まるか、`(name *...)`、または `(name)` の直後に被演算子が続く場合
    fn cast_ahead(&self) -> bool {
        let Some(Token::Ident(first)) = self.peek_at(1) else {
            return false;
        };
        if TYPE_KEYWORDS.contains(&first.as_str()) {
            return true;
        }
        let mut offset = 2;
        let mut stars = 0;
        while let Some(Token::Punct('*')) = self.peek_at(offset) {
            offset += 1;
            stars += 1;
        }
        if !matches!(self.peek_at(offset), Some(Token::Punct(')'))) {
            return false;
        }
        if stars > 0 {
            return true;
        }
        matches!(
            self.peek_at(offset + 1),
            Some(Token::Integer(_))
                | Some(Token::Ident(_))
                | Some(Token::Dollar(_))
                | Some(Token::Punct('('))
                | Some(Token::Punct('*'))
                | Some(Token::Punct('&'))
        )
    }

    /// 型名（識別子の並びと末尾の `*`）
    fn parse_type_name(&mut self) -> Result<String> {
        let mut words = Vec::new();
        while let Some(Token::Ident(word)) = self.peek() {
            words.push(word.clone());
            self.pos += 1;
        }
        if words.is_empty() {
            return Err(anyhow::anyhow!("Expected a type name"));
        }
        let mut name = words.join(" ");
        let mut stars = String::new();
        while let Some(Token::Punct('*')) = self.peek() {
            stars.push('*');
            self.pos += 1;
        }
        if !stars.is_empty() {
            name.push(' ');
            name.push_str(&stars);
        }
        Ok(name)
    }

    fn parse_postfix(&mut self) -> Result<Expression> {
        let mut expr = self.parse_primary()?;
        loop {
            match self.peek() {
                Some(Token::Arrow) => {
                    self.pos += 1;
                    let field = self.expect_ident()?;
                    expr = Expression::Arrow { base: Box::new(expr), field };
                }
                Some(Token::Punct('.')) => {
                    self.pos += 1;
                    let field = self.expect_ident()?;
                    expr = Expression::Member { base: Box::new(expr), field };
                }
                Some(Token::Punct('[')) => {
                    self.pos += 1;
                    let index = self.parse_expression()?;
                    self.expect_punct(']')?;
                    expr = Expression::Index {
                        base: Box::new(expr),
                        index: Box::new(index),
                    };
                }
                _ => return Ok(expr),
            }
        }
    }

    fn parse_primary(&mut self) -> Result<Expression> {
        match self.next() {
            Some(Token::Integer(value)) => Ok(Expression::Integer(value)),
            Some(Token::Ident(name)) => Ok(Expression::Identifier(name)),
            Some(Token::Dollar(name)) => Ok(Expression::Convenience(name)),
            Some(Token::Punct('(')) => {
                let expr = self.parse_expression()?;
                self.expect_punct(')')?;
                Ok(expr)
            }
            Some(other) => Err(anyhow::anyhow!("Unexpected token {:?}", other)),
            None => Err(anyhow::anyhow!("Unexpected end of expression")),
        }
    }
}

/// 式をパースする
pub fn parse_expression(input: &str) -> Result<Expression> {
    let tokens = tokenize(input)?;
    if tokens.is_empty() {
        return Err(anyhow::anyhow!("Empty expression"));
    }
    let mut parser = Parser { tokens, pos: 0 };
    let expr = parser.parse_expression()?;
    if let Some(token) = parser.peek() {
        return Err(anyhow::anyhow!("Unexpected trailing token {:?}", token));
    }
    Ok(expr)
}

/// 式評価器
pub struct ExpressionEvaluator<'s> {
    session: &'s Session,
}

impl<'s> ExpressionEvaluator<'s> {
    /// 新しい式評価器を作成する
    pub fn new(session: &'s Session) -> Self {
        Self { session }
    }

    /// 式を評価する
    pub fn evaluate(&self, expr: &Expression) -> Result<Value<'s>> {
        match expr {
            Expression::Integer(value) => Ok(Value::scalar(self.session, Type::i64_type(), *value)),
            Expression::Identifier(name) => self.eval_identifier(name),
            Expression::Convenience(name) => self
                .session
                .convenience(name)
                .ok_or_else(|| anyhow::anyhow!("Convenience variable '${}' is not set", name)),
            Expression::Deref(inner) => self.evaluate(inner)?.dereference(),
            Expression::AddressOf(inner) => self.evaluate(inner)?.address_of(),
            Expression::Negate(inner) => {
                let value = self.evaluate(inner)?;
                let ty = integer_result_type(value.ty());
                Ok(Value::scalar(self.session, ty, value.as_u64()?.wrapping_neg()))
            }
            Expression::Cast { ty, expr } => {
                let ty = self.session.lookup_type(ty)?;
                self.evaluate(expr)?.cast(&ty)
            }
            Expression::SizeOf(ty) => {
                let ty = self.session.lookup_type(ty)?;
                Ok(Value::from_u64(self.session, ty.size()))
            }
            Expression::Member { base, field } => self.evaluate(base)?.field(field),
            Expression::Arrow { base, field } => self.evaluate(base)?.dereference()?.field(field),
            Expression::Index { base, index } => {
                let index = self.evaluate(index)?.as_i64()?;
                self.evaluate(base)?.index(index)
            }
            Expression::Binary { op, lhs, rhs } => self.eval_binary(*op, lhs, rhs),
        }
    }

    /// 識別子を解決する（グローバル変数、列挙子、ELFシンボルの順）
    fn eval_identifier(&self, name: &str) -> Result<Value<'s>> {
        if let Some(global) = self.session.backend().lookup_global(name) {
            let ty = match global.ty {
                Some(ty) => ty,
                // デバッグ情報のないシンボルは8バイトのデータとして扱う
                None => Type::i64_type().with_name("<data variable, no debug info>"),
            };
            return Ok(Value::at(self.session, ty, global.address));
        }
        if let Some(value) = self.session.enum_value(None, name) {
            return Ok(Value::scalar(self.session, Type::i64_type(), value as u64));
        }
        Err(anyhow::anyhow!("No symbol \"{}\" in current context", name))
    }

    fn eval_binary(&self, op: BinaryOp, lhs: &Expression, rhs: &Expression) -> Result<Value<'s>> {
        let lhs = self.evaluate(lhs)?;
        let rhs = self.evaluate(rhs)?.as_i64()?;
        let delta = match op {
            BinaryOp::Add => rhs,
            BinaryOp::Sub => rhs.wrapping_neg(),
        };

        if lhs.ty().is_pointer() || lhs.ty().is_array() {
            return lhs.offset(delta);
        }
        let ty = integer_result_type(lhs.ty());
        Ok(Value::scalar(self.session, ty, lhs.as_u64()?.wrapping_add(delta as u64)))
    }
}

fn integer_result_type(ty: &Type) -> Type {
    if ty.is_scalar() && !ty.is_pointer() && !ty.is_float() {
        ty.clone()
    } else {
        Type::i64_type()
    }
}

/// 式をパースして評価する（エラーは式の文字列付きの `Evaluation` になる）
pub fn evaluate<'s>(session: &'s Session, input: &str) -> Result<Value<'s>> {
    let expr = parse_expression(input).map_err(|e| DebuggerError::evaluation(input, e))?;
    ExpressionEvaluator::new(session)
        .evaluate(&expr)
        .map_err(|e| DebuggerError::evaluation(input, e).into())
}
