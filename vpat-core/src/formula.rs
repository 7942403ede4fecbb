//! 公式解析与求值。
//!
//! 语法：数字、`@id` / `@id.attr` 实体引用、`#name` 测量变量、括号与四则运算。

use thiserror::Error;

use crate::document::EntityId;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum FormulaError {
    #[error("formula is empty")]
    Empty,
    #[error("unexpected character '{ch}' at {pos}")]
    UnexpectedChar { pos: usize, ch: char },
    #[error("unexpected end of formula")]
    UnexpectedEnd,
    #[error("invalid number '{0}'")]
    InvalidNumber(String),
    #[error("invalid object reference '{0}'")]
    InvalidReference(String),
    #[error("object {0} has no value for this reference")]
    UnresolvedReference(EntityId),
    #[error("unknown variable '{0}'")]
    UnknownVariable(String),
    #[error("division by zero")]
    DivisionByZero,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Number(f64),
    Reference { id: EntityId, attr: Option<String> },
    Variable(String),
    Neg(Box<Expr>),
    Binary {
        op: BinaryOp,
        lhs: Box<Expr>,
        rhs: Box<Expr>,
    },
}

/// 求值时的符号解析。
pub trait FormulaScope {
    fn value_of(&self, id: EntityId, attr: Option<&str>) -> Option<f64>;
    fn variable(&self, name: &str) -> Option<f64>;
}

#[derive(Debug, Clone, PartialEq)]
pub struct Formula {
    source: String,
    expr: Expr,
}

impl Formula {
    pub fn parse(source: &str) -> Result<Self, FormulaError> {
        let chars: Vec<char> = source.chars().collect();
        let mut parser = Parser { chars, pos: 0 };
        parser.skip_ws();
        if parser.peek().is_none() {
            return Err(FormulaError::Empty);
        }
        let expr = parser.expr()?;
        parser.skip_ws();
        if let Some(ch) = parser.peek() {
            return Err(FormulaError::UnexpectedChar {
                pos: parser.pos,
                ch,
            });
        }
        Ok(Self {
            source: source.to_string(),
            expr,
        })
    }

    #[inline]
    pub fn source(&self) -> &str {
        &self.source
    }

    #[inline]
    pub fn expr(&self) -> &Expr {
        &self.expr
    }

    /// 引用到的实体 id，去重并保持出现顺序。
    pub fn references(&self) -> Vec<EntityId> {
        let mut out = Vec::new();
        walk(&self.expr, &mut |expr| {
            if let Expr::Reference { id, .. } = expr {
                if !out.contains(id) {
                    out.push(*id);
                }
            }
        });
        out
    }

    pub fn variables(&self) -> Vec<String> {
        let mut out = Vec::new();
        walk(&self.expr, &mut |expr| {
            if let Expr::Variable(name) = expr {
                if !out.contains(name) {
                    out.push(name.clone());
                }
            }
        });
        out
    }

    pub fn evaluate(&self, scope: &dyn FormulaScope) -> Result<f64, FormulaError> {
        eval(&self.expr, scope)
    }
}

fn walk(expr: &Expr, visit: &mut dyn FnMut(&Expr)) {
    visit(expr);
    match expr {
        Expr::Neg(inner) => walk(inner, visit),
        Expr::Binary { lhs, rhs, .. } => {
            walk(lhs, visit);
            walk(rhs, visit);
        }
        Expr::Number(_) | Expr::Reference { .. } | Expr::Variable(_) => {}
    }
}

fn eval(expr: &Expr, scope: &dyn FormulaScope) -> Result<f64, FormulaError> {
    match expr {
        Expr::Number(value) => Ok(*value),
        Expr::Reference { id, attr } => scope
            .value_of(*id, attr.as_deref())
            .ok_or(FormulaError::UnresolvedReference(*id)),
        Expr::Variable(name) => scope
            .variable(name)
            .ok_or_else(|| FormulaError::UnknownVariable(name.clone())),
        Expr::Neg(inner) => Ok(-eval(inner, scope)?),
        Expr::Binary { op, lhs, rhs } => {
            let lhs = eval(lhs, scope)?;
            let rhs = eval(rhs, scope)?;
            match op {
                BinaryOp::Add => Ok(lhs + rhs),
                BinaryOp::Sub => Ok(lhs - rhs),
                BinaryOp::Mul => Ok(lhs * rhs),
                BinaryOp::Div if rhs == 0.0 => Err(FormulaError::DivisionByZero),
                BinaryOp::Div => Ok(lhs / rhs),
            }
        }
    }
}

struct Parser {
    chars: Vec<char>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<char> {
        self.chars.get(self.pos).copied()
    }

    fn skip_ws(&mut self) {
        while self.peek().is_some_and(char::is_whitespace) {
            self.pos += 1;
        }
    }

    fn expr(&mut self) -> Result<Expr, FormulaError> {
        let mut lhs = self.term()?;
        loop {
            self.skip_ws();
            let op = match self.peek() {
                Some('+') => BinaryOp::Add,
                Some('-') => BinaryOp::Sub,
                _ => return Ok(lhs),
            };
            self.pos += 1;
            let rhs = self.term()?;
            lhs = Expr::Binary {
                op,
                lhs: Box::new(lhs),
                rhs: Box::new(rhs),
            };
        }
    }

    fn term(&mut self) -> Result<Expr, FormulaError> {
        let mut lhs = self.factor()?;
        loop {
            self.skip_ws();
            let op = match self.peek() {
                Some('*') => BinaryOp::Mul,
                Some('/') => BinaryOp::Div,
                _ => return Ok(lhs),
            };
            self.pos += 1;
            let rhs = self.factor()?;
            lhs = Expr::Binary {
                op,
                lhs: Box::new(lhs),
                rhs: Box::new(rhs),
            };
        }
    }

    fn factor(&mut self) -> Result<Expr, FormulaError> {
        self.skip_ws();
        match self.peek() {
            None => Err(FormulaError::UnexpectedEnd),
            Some('-') => {
                self.pos += 1;
                Ok(Expr::Neg(Box::new(self.factor()?)))
            }
            Some('(') => {
                self.pos += 1;
                let inner = self.expr()?;
                self.skip_ws();
                match self.peek() {
                    Some(')') => {
                        self.pos += 1;
                        Ok(inner)
                    }
                    Some(ch) => Err(FormulaError::UnexpectedChar { pos: self.pos, ch }),
                    None => Err(FormulaError::UnexpectedEnd),
                }
            }
            Some('@') => {
                self.pos += 1;
                self.reference()
            }
            Some('#') => {
                self.pos += 1;
                let name = self.take_while(|ch| ch.is_alphanumeric() || ch == '_');
                if name.is_empty() {
                    return Err(FormulaError::UnexpectedEnd);
                }
                Ok(Expr::Variable(name))
            }
            Some(ch) if ch.is_ascii_digit() || ch == '.' => {
                let text = self.take_while(|ch| ch.is_ascii_digit() || ch == '.');
                text.parse::<f64>()
                    .map(Expr::Number)
                    .map_err(|_| FormulaError::InvalidNumber(text))
            }
            Some(ch) => Err(FormulaError::UnexpectedChar { pos: self.pos, ch }),
        }
    }

    fn reference(&mut self) -> Result<Expr, FormulaError> {
        let digits = self.take_while(|ch| ch.is_ascii_digit());
        let id = EntityId::parse(&digits)
            .ok_or_else(|| FormulaError::InvalidReference(format!("@{digits}")))?;
        let attr = if self.peek() == Some('.') {
            self.pos += 1;
            let name = self.take_while(|ch| ch.is_alphanumeric() || ch == '_');
            if name.is_empty() {
                return Err(FormulaError::InvalidReference(format!("@{digits}.")));
            }
            Some(name)
        } else {
            None
        };
        Ok(Expr::Reference { id, attr })
    }

    fn take_while(&mut self, accept: impl Fn(char) -> bool) -> String {
        let start = self.pos;
        while self.peek().is_some_and(&accept) {
            self.pos += 1;
        }
        self.chars[start..self.pos].iter().collect()
    }
}
