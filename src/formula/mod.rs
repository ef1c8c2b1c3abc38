//! Restricted formula language for calculated fields and event filters.
//!
//! Formulas are parsed once into a closed AST and evaluated against a set of
//! named bindings. There is no general code execution: the grammar consists of
//! literals, identifiers, arithmetic, comparisons, boolean logic, `CASE`, and a
//! fixed list of scalar functions.
//!
//! # Null semantics
//!
//! - Any arithmetic with a `null` operand yields `null`.
//! - Division or modulo by zero yields `null` instead of failing.
//! - Comparisons with `null` yield `null`; `AND`/`OR` use three-valued logic.
//!
//! Type mismatches (e.g. `'abc' - 1`) are errors.
//!
//! # Example
//!
//! ```
//! use std::collections::BTreeMap;
//! use tally::formula::Formula;
//! use tally::model::Value;
//!
//! let margin = Formula::parse("(revenue - cost) / revenue").unwrap();
//! let mut bindings = BTreeMap::new();
//! bindings.insert("revenue".to_string(), Value::Int(200));
//! bindings.insert("cost".to_string(), Value::Int(150));
//! assert_eq!(margin.evaluate(&bindings).unwrap(), Value::Float(0.25));
//! ```

mod eval;
mod parser;

use std::collections::{BTreeMap, BTreeSet, HashMap};

use thiserror::Error;

use crate::model::Value;

pub use parser::parse_formula;

/// Errors raised while parsing or evaluating a formula.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum FormulaError {
    #[error("syntax error in formula '{formula}': {message}")]
    Syntax { formula: String, message: String },

    #[error("unsupported construct in formula '{formula}': {construct}")]
    Unsupported { formula: String, construct: String },

    #[error("function '{func}' expects {expected} argument(s), got {got}")]
    Arity {
        func: &'static str,
        expected: &'static str,
        got: usize,
    },

    #[error("unknown identifier '{0}'")]
    UnknownIdentifier(String),

    #[error("type mismatch: cannot apply '{op}' to {left} and {right}")]
    TypeMismatch {
        op: &'static str,
        left: &'static str,
        right: &'static str,
    },

    #[error("invalid argument to '{func}': expected {expected}, got {got}")]
    InvalidArgument {
        func: &'static str,
        expected: &'static str,
        got: &'static str,
    },
}

pub type FormulaResult<T> = Result<T, FormulaError>;

// =============================================================================
// AST
// =============================================================================

/// Parsed formula expression.
#[derive(Debug, Clone, PartialEq)]
pub enum FormulaExpr {
    /// Named value; dotted names address nested values.
    Ident(String),
    Literal(Value),
    Unary {
        op: UnaryOp,
        expr: Box<FormulaExpr>,
    },
    Binary {
        left: Box<FormulaExpr>,
        op: BinaryOp,
        right: Box<FormulaExpr>,
    },
    IsNull {
        expr: Box<FormulaExpr>,
        negated: bool,
    },
    Between {
        expr: Box<FormulaExpr>,
        low: Box<FormulaExpr>,
        high: Box<FormulaExpr>,
        negated: bool,
    },
    InList {
        expr: Box<FormulaExpr>,
        list: Vec<FormulaExpr>,
        negated: bool,
    },
    Case {
        operand: Option<Box<FormulaExpr>>,
        branches: Vec<(FormulaExpr, FormulaExpr)>,
        else_result: Option<Box<FormulaExpr>>,
    },
    Function {
        func: Func,
        args: Vec<FormulaExpr>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UnaryOp {
    Neg,
    Not,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BinaryOp {
    // Arithmetic
    Add,
    Sub,
    Mul,
    Div,
    Mod,

    // Comparison
    Eq,
    Ne,
    Lt,
    Lte,
    Gt,
    Gte,

    // Logical
    And,
    Or,

    Concat,
}

impl BinaryOp {
    pub fn symbol(&self) -> &'static str {
        match self {
            BinaryOp::Add => "+",
            BinaryOp::Sub => "-",
            BinaryOp::Mul => "*",
            BinaryOp::Div => "/",
            BinaryOp::Mod => "%",
            BinaryOp::Eq => "=",
            BinaryOp::Ne => "<>",
            BinaryOp::Lt => "<",
            BinaryOp::Lte => "<=",
            BinaryOp::Gt => ">",
            BinaryOp::Gte => ">=",
            BinaryOp::And => "AND",
            BinaryOp::Or => "OR",
            BinaryOp::Concat => "||",
        }
    }
}

/// Scalar functions available to formulas.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Func {
    Coalesce,
    NullIf,
    If,
    Abs,
    Round,
    Floor,
    Ceil,
    Least,
    Greatest,
    Upper,
    Lower,
    Length,
    Concat,
}

impl Func {
    pub fn from_name(name: &str) -> Option<Self> {
        Some(match name {
            "coalesce" | "ifnull" | "nvl" => Func::Coalesce,
            "nullif" => Func::NullIf,
            "if" | "iif" => Func::If,
            "abs" => Func::Abs,
            "round" => Func::Round,
            "floor" => Func::Floor,
            "ceil" | "ceiling" => Func::Ceil,
            "least" => Func::Least,
            "greatest" => Func::Greatest,
            "upper" => Func::Upper,
            "lower" => Func::Lower,
            "length" | "len" => Func::Length,
            "concat" => Func::Concat,
            _ => return None,
        })
    }

    pub fn name(&self) -> &'static str {
        match self {
            Func::Coalesce => "coalesce",
            Func::NullIf => "nullif",
            Func::If => "if",
            Func::Abs => "abs",
            Func::Round => "round",
            Func::Floor => "floor",
            Func::Ceil => "ceil",
            Func::Least => "least",
            Func::Greatest => "greatest",
            Func::Upper => "upper",
            Func::Lower => "lower",
            Func::Length => "length",
            Func::Concat => "concat",
        }
    }

    pub fn check_arity(&self, got: usize) -> FormulaResult<()> {
        let (ok, expected) = match self {
            Func::Coalesce | Func::Least | Func::Greatest | Func::Concat => (got >= 1, "1 or more"),
            Func::NullIf => (got == 2, "2"),
            Func::If => (got == 3, "3"),
            Func::Round => ((1..=2).contains(&got), "1 or 2"),
            Func::Abs | Func::Floor | Func::Ceil | Func::Upper | Func::Lower | Func::Length => {
                (got == 1, "1")
            }
        };
        if ok {
            Ok(())
        } else {
            Err(FormulaError::Arity {
                func: self.name(),
                expected,
                got,
            })
        }
    }
}

impl FormulaExpr {
    /// Collect every identifier this expression reads.
    pub fn collect_references(&self, out: &mut BTreeSet<String>) {
        match self {
            FormulaExpr::Ident(name) => {
                out.insert(name.clone());
            }
            FormulaExpr::Literal(_) => {}
            FormulaExpr::Unary { expr, .. } | FormulaExpr::IsNull { expr, .. } => {
                expr.collect_references(out)
            }
            FormulaExpr::Binary { left, right, .. } => {
                left.collect_references(out);
                right.collect_references(out);
            }
            FormulaExpr::Between {
                expr, low, high, ..
            } => {
                expr.collect_references(out);
                low.collect_references(out);
                high.collect_references(out);
            }
            FormulaExpr::InList { expr, list, .. } => {
                expr.collect_references(out);
                list.iter().for_each(|e| e.collect_references(out));
            }
            FormulaExpr::Case {
                operand,
                branches,
                else_result,
            } => {
                if let Some(op) = operand {
                    op.collect_references(out);
                }
                for (cond, result) in branches {
                    cond.collect_references(out);
                    result.collect_references(out);
                }
                if let Some(e) = else_result {
                    e.collect_references(out);
                }
            }
            FormulaExpr::Function { args, .. } => {
                args.iter().for_each(|e| e.collect_references(out));
            }
        }
    }
}

// =============================================================================
// Bindings
// =============================================================================

/// Named values a formula can read.
pub trait Bindings {
    fn lookup(&self, name: &str) -> Option<&Value>;
}

impl Bindings for BTreeMap<String, Value> {
    fn lookup(&self, name: &str) -> Option<&Value> {
        self.get(name)
    }
}

impl Bindings for HashMap<String, Value> {
    fn lookup(&self, name: &str) -> Option<&Value> {
        self.get(name)
    }
}

/// A document value binds its own dot paths (used for event payloads).
impl Bindings for Value {
    fn lookup(&self, name: &str) -> Option<&Value> {
        self.get_path(name).ok()
    }
}

// =============================================================================
// Formula
// =============================================================================

/// A parsed formula together with its source text.
#[derive(Debug, Clone, PartialEq)]
pub struct Formula {
    source: String,
    expr: FormulaExpr,
}

impl Formula {
    pub fn parse(source: &str) -> FormulaResult<Self> {
        Ok(Self {
            source: source.to_string(),
            expr: parse_formula(source)?,
        })
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn expr(&self) -> &FormulaExpr {
        &self.expr
    }

    /// Every identifier the formula reads.
    pub fn references(&self) -> BTreeSet<String> {
        let mut out = BTreeSet::new();
        self.expr.collect_references(&mut out);
        out
    }

    pub fn evaluate(&self, bindings: &dyn Bindings) -> FormulaResult<Value> {
        eval::evaluate(&self.expr, bindings)
    }

    /// Evaluate as a filter predicate. Only `true` passes; `null` does not.
    pub fn evaluate_predicate(&self, bindings: &dyn Bindings) -> FormulaResult<bool> {
        match self.evaluate(bindings)? {
            Value::Bool(b) => Ok(b),
            Value::Null => Ok(false),
            other => Err(FormulaError::TypeMismatch {
                op: "predicate",
                left: other.type_name(),
                right: "bool",
            }),
        }
    }
}
