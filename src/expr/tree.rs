//! Syntax tree of user expressions.

use crate::time::AstroTime;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UnaryOperator {
    Not,
    Plus,
    Minus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BinaryOperator {
    Or,
    And,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    Overlaps,
    Add,
    Sub,
    Mul,
    Div,
    Mod,
}

impl BinaryOperator {
    pub fn as_str(&self) -> &'static str {
        match self {
            BinaryOperator::Or => "OR",
            BinaryOperator::And => "AND",
            BinaryOperator::Eq => "=",
            BinaryOperator::Ne => "!=",
            BinaryOperator::Lt => "<",
            BinaryOperator::Le => "<=",
            BinaryOperator::Gt => ">",
            BinaryOperator::Ge => ">=",
            BinaryOperator::Overlaps => "OVERLAPS",
            BinaryOperator::Add => "+",
            BinaryOperator::Sub => "-",
            BinaryOperator::Mul => "*",
            BinaryOperator::Div => "/",
            BinaryOperator::Mod => "%",
        }
    }

    pub fn is_comparison(&self) -> bool {
        matches!(
            self,
            BinaryOperator::Eq
                | BinaryOperator::Ne
                | BinaryOperator::Lt
                | BinaryOperator::Le
                | BinaryOperator::Gt
                | BinaryOperator::Ge
        )
    }

    pub fn is_arithmetic(&self) -> bool {
        matches!(
            self,
            BinaryOperator::Add
                | BinaryOperator::Sub
                | BinaryOperator::Mul
                | BinaryOperator::Div
                | BinaryOperator::Mod
        )
    }
}

/// A node of a parsed expression.
#[derive(Debug, Clone, PartialEq)]
pub enum Node {
    /// A possibly dotted name: `visit`, `visit.exposure_time`, `raw.ingest_date`.
    Identifier(String),
    /// Numeric literal kept as written.
    NumericLiteral(String),
    StringLiteral(String),
    TimeLiteral(AstroTime),
    /// `start..stop[:stride]` inside an `IN` list; `stop` is inclusive.
    RangeLiteral {
        start: i64,
        stop: i64,
        stride: Option<i64>,
    },
    /// `(a, b)`, only valid as the right operand of `OVERLAPS`.
    Tuple(Box<Node>, Box<Node>),
    UnaryOp {
        op: UnaryOperator,
        operand: Box<Node>,
    },
    BinaryOp {
        lhs: Box<Node>,
        op: BinaryOperator,
        rhs: Box<Node>,
    },
    IsIn {
        lhs: Box<Node>,
        values: Vec<Node>,
        not_in: bool,
    },
    Parens(Box<Node>),
}

impl Node {
    pub(crate) fn binary(lhs: Node, op: BinaryOperator, rhs: Node) -> Node {
        Node::BinaryOp {
            lhs: Box::new(lhs),
            op,
            rhs: Box::new(rhs),
        }
    }

    pub(crate) fn unary(op: UnaryOperator, operand: Node) -> Node {
        Node::UnaryOp {
            op,
            operand: Box::new(operand),
        }
    }

    /// Strip any number of enclosing parentheses.
    pub fn unwrap_parens(&self) -> &Node {
        let mut node = self;
        while let Node::Parens(inner) = node {
            node = inner;
        }
        node
    }

    /// All identifiers, in order of appearance.
    pub fn identifiers(&self) -> Vec<&str> {
        let mut names = Vec::new();
        self.collect_identifiers(&mut names);
        names
    }

    fn collect_identifiers<'a>(&'a self, names: &mut Vec<&'a str>) {
        match self {
            Node::Identifier(name) => names.push(name),
            Node::NumericLiteral(_)
            | Node::StringLiteral(_)
            | Node::TimeLiteral(_)
            | Node::RangeLiteral { .. } => {}
            Node::Tuple(a, b) => {
                a.collect_identifiers(names);
                b.collect_identifiers(names);
            }
            Node::UnaryOp { operand, .. } => operand.collect_identifiers(names),
            Node::BinaryOp { lhs, rhs, .. } => {
                lhs.collect_identifiers(names);
                rhs.collect_identifiers(names);
            }
            Node::IsIn { lhs, values, .. } => {
                lhs.collect_identifiers(names);
                for value in values {
                    value.collect_identifiers(names);
                }
            }
            Node::Parens(inner) => inner.collect_identifiers(names),
        }
    }
}

impl fmt::Display for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Node::Identifier(name) => f.write_str(name),
            Node::NumericLiteral(value) => f.write_str(value),
            Node::StringLiteral(value) => write!(f, "'{}'", value),
            Node::TimeLiteral(time) => write!(f, "T'{}'", time),
            Node::RangeLiteral {
                start,
                stop,
                stride,
            } => match stride {
                Some(stride) => write!(f, "{}..{}:{}", start, stop, stride),
                None => write!(f, "{}..{}", start, stop),
            },
            Node::Tuple(a, b) => write!(f, "({}, {})", a, b),
            Node::UnaryOp { op, operand } => match op {
                UnaryOperator::Not => write!(f, "NOT {}", operand),
                UnaryOperator::Plus => write!(f, "+{}", operand),
                UnaryOperator::Minus => write!(f, "-{}", operand),
            },
            Node::BinaryOp { lhs, op, rhs } => write!(f, "{} {} {}", lhs, op.as_str(), rhs),
            Node::IsIn {
                lhs,
                values,
                not_in,
            } => {
                let items: Vec<String> = values.iter().map(|v| v.to_string()).collect();
                let keyword = if *not_in { "NOT IN" } else { "IN" };
                write!(f, "{} {} ({})", lhs, keyword, items.join(", "))
            }
            Node::Parens(inner) => write!(f, "({})", inner),
        }
    }
}
