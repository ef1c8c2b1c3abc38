//! Formula parser.
//!
//! Formulas are written as SQL scalar expressions and parsed with sqlparser's
//! `GenericDialect`. The sqlparser AST is then converted into the closed
//! `FormulaExpr` grammar; anything the grammar does not cover (sub-queries,
//! wildcards, casts, window functions, unknown functions) is rejected here so
//! evaluation never sees it.

use sqlparser::ast::{
    self as sql, BinaryOperator as SqlBinaryOp, Expr as SqlExpr, UnaryOperator as SqlUnaryOp,
    Value as SqlValue,
};
use sqlparser::dialect::GenericDialect;
use sqlparser::parser::Parser;
use sqlparser::tokenizer::Token;

use super::{BinaryOp, FormulaError, FormulaExpr, Func, UnaryOp};
use crate::model::Value;

/// Parse a formula into the restricted expression AST.
pub fn parse_formula(source: &str) -> Result<FormulaExpr, FormulaError> {
    let dialect = GenericDialect {};
    let syntax = |message: String| FormulaError::Syntax {
        formula: source.to_string(),
        message,
    };

    if source.trim().is_empty() {
        return Err(syntax("empty formula".to_string()));
    }

    let mut parser = Parser::new(&dialect)
        .try_with_sql(source)
        .map_err(|e| syntax(e.to_string()))?;
    let expr = parser.parse_expr().map_err(|e| syntax(e.to_string()))?;

    let trailing = parser.peek_token();
    if trailing.token != Token::EOF {
        return Err(syntax(format!("unexpected trailing input '{}'", trailing.token)));
    }

    convert_expr(&expr, source)
}

fn unsupported(construct: impl Into<String>, source: &str) -> FormulaError {
    FormulaError::Unsupported {
        formula: source.to_string(),
        construct: construct.into(),
    }
}

fn convert_expr(expr: &SqlExpr, source: &str) -> Result<FormulaExpr, FormulaError> {
    match expr {
        SqlExpr::Identifier(ident) => Ok(FormulaExpr::Ident(ident.value.clone())),

        // Dotted names read nested values: customer.address.city
        SqlExpr::CompoundIdentifier(idents) => Ok(FormulaExpr::Ident(
            idents
                .iter()
                .map(|i| i.value.as_str())
                .collect::<Vec<_>>()
                .join("."),
        )),

        SqlExpr::Value(value) => convert_value(value, source),

        SqlExpr::Nested(inner) => convert_expr(inner, source),

        SqlExpr::BinaryOp { left, op, right } => Ok(FormulaExpr::Binary {
            left: Box::new(convert_expr(left, source)?),
            op: convert_binary_op(op, source)?,
            right: Box::new(convert_expr(right, source)?),
        }),

        SqlExpr::UnaryOp { op, expr } => {
            let inner = convert_expr(expr, source)?;
            match op {
                SqlUnaryOp::Plus => Ok(inner),
                SqlUnaryOp::Minus => Ok(FormulaExpr::Unary {
                    op: UnaryOp::Neg,
                    expr: Box::new(inner),
                }),
                SqlUnaryOp::Not => Ok(FormulaExpr::Unary {
                    op: UnaryOp::Not,
                    expr: Box::new(inner),
                }),
                other => Err(unsupported(format!("unary operator {}", other), source)),
            }
        }

        SqlExpr::IsNull(inner) => Ok(FormulaExpr::IsNull {
            expr: Box::new(convert_expr(inner, source)?),
            negated: false,
        }),

        SqlExpr::IsNotNull(inner) => Ok(FormulaExpr::IsNull {
            expr: Box::new(convert_expr(inner, source)?),
            negated: true,
        }),

        SqlExpr::Between {
            expr,
            negated,
            low,
            high,
        } => Ok(FormulaExpr::Between {
            expr: Box::new(convert_expr(expr, source)?),
            low: Box::new(convert_expr(low, source)?),
            high: Box::new(convert_expr(high, source)?),
            negated: *negated,
        }),

        SqlExpr::InList {
            expr,
            list,
            negated,
        } => Ok(FormulaExpr::InList {
            expr: Box::new(convert_expr(expr, source)?),
            list: list
                .iter()
                .map(|item| convert_expr(item, source))
                .collect::<Result<_, _>>()?,
            negated: *negated,
        }),

        SqlExpr::Case {
            operand,
            conditions,
            results,
            else_result,
        } => {
            let operand = operand
                .as_ref()
                .map(|e| convert_expr(e, source))
                .transpose()?
                .map(Box::new);

            let mut branches = Vec::with_capacity(conditions.len());
            for (condition, result) in conditions.iter().zip(results.iter()) {
                branches.push((convert_expr(condition, source)?, convert_expr(result, source)?));
            }

            let else_result = else_result
                .as_ref()
                .map(|e| convert_expr(e, source))
                .transpose()?
                .map(Box::new);

            Ok(FormulaExpr::Case {
                operand,
                branches,
                else_result,
            })
        }

        SqlExpr::Floor { expr, .. } => Ok(FormulaExpr::Function {
            func: Func::Floor,
            args: vec![convert_expr(expr, source)?],
        }),

        SqlExpr::Ceil { expr, .. } => Ok(FormulaExpr::Function {
            func: Func::Ceil,
            args: vec![convert_expr(expr, source)?],
        }),

        SqlExpr::Function(func) => convert_function(func, source),

        other => Err(unsupported(format!("expression '{}'", other), source)),
    }
}

fn convert_value(value: &SqlValue, source: &str) -> Result<FormulaExpr, FormulaError> {
    let literal = match value {
        SqlValue::Number(n, _) => {
            if let Ok(i) = n.parse::<i64>() {
                Value::Int(i)
            } else if let Ok(f) = n.parse::<f64>() {
                Value::Float(f)
            } else {
                return Err(FormulaError::Syntax {
                    formula: source.to_string(),
                    message: format!("invalid number '{}'", n),
                });
            }
        }
        SqlValue::SingleQuotedString(s) => Value::Text(s.clone()),
        SqlValue::Boolean(b) => Value::Bool(*b),
        SqlValue::Null => Value::Null,
        other => return Err(unsupported(format!("literal {}", other), source)),
    };
    Ok(FormulaExpr::Literal(literal))
}

fn convert_binary_op(op: &SqlBinaryOp, source: &str) -> Result<BinaryOp, FormulaError> {
    Ok(match op {
        SqlBinaryOp::Plus => BinaryOp::Add,
        SqlBinaryOp::Minus => BinaryOp::Sub,
        SqlBinaryOp::Multiply => BinaryOp::Mul,
        SqlBinaryOp::Divide => BinaryOp::Div,
        SqlBinaryOp::Modulo => BinaryOp::Mod,
        SqlBinaryOp::Eq => BinaryOp::Eq,
        SqlBinaryOp::NotEq => BinaryOp::Ne,
        SqlBinaryOp::Lt => BinaryOp::Lt,
        SqlBinaryOp::LtEq => BinaryOp::Lte,
        SqlBinaryOp::Gt => BinaryOp::Gt,
        SqlBinaryOp::GtEq => BinaryOp::Gte,
        SqlBinaryOp::And => BinaryOp::And,
        SqlBinaryOp::Or => BinaryOp::Or,
        SqlBinaryOp::StringConcat => BinaryOp::Concat,
        other => return Err(unsupported(format!("operator {}", other), source)),
    })
}

fn convert_function(func: &sql::Function, source: &str) -> Result<FormulaExpr, FormulaError> {
    let name = func.name.to_string().to_lowercase();

    if func.over.is_some() {
        return Err(unsupported(format!("window function {}", name), source));
    }

    let args = match &func.args {
        sql::FunctionArguments::None => Vec::new(),
        sql::FunctionArguments::Subquery(_) => {
            return Err(unsupported("sub-query argument", source));
        }
        sql::FunctionArguments::List(list) => {
            if list.duplicate_treatment.is_some() {
                return Err(unsupported(format!("DISTINCT in {}", name), source));
            }
            list.args
                .iter()
                .map(|arg| match arg {
                    sql::FunctionArg::Unnamed(sql::FunctionArgExpr::Expr(e)) => {
                        convert_expr(e, source)
                    }
                    other => Err(unsupported(format!("function argument {}", other), source)),
                })
                .collect::<Result<Vec<_>, _>>()?
        }
    };

    let func = Func::from_name(&name).ok_or_else(|| unsupported(format!("function {}", name), source))?;
    func.check_arity(args.len())?;

    Ok(FormulaExpr::Function { func, args })
}
