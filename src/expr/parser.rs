//! Precedence-climbing parser for user expressions.
//!
//! From lowest to highest precedence: `OR`, `AND`, `NOT`, `= !=`,
//! `< <= > >=`, `OVERLAPS`, `IN`/`NOT IN`, `+ -`, `* / %`, unary `+ -`.
//! Comparison operators and `OVERLAPS` are non-associative.

use super::lexer::{Token, TokenKind, tokenize};
use super::tree::{BinaryOperator, Node, UnaryOperator};
use crate::time::AstroTime;
use thiserror::Error;

/// Syntax error in a user expression.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseError {
    #[error("Syntax error at or near '{token}' (line: {lineno}, pos: {})", .pos_in_line + 1)]
    Syntax {
        expression: String,
        token: String,
        /// Character offset from the start of the expression.
        pos: usize,
        lineno: usize,
        /// 0-based offset within the line.
        pos_in_line: usize,
    },
    #[error("End of input reached while expecting further input")]
    Eof,
}

impl ParseError {
    pub(crate) fn syntax(
        expression: &str,
        token: impl Into<String>,
        pos: usize,
        lineno: usize,
    ) -> Self {
        let consumed: usize = expression
            .split('\n')
            .take(lineno.saturating_sub(1))
            .map(|line| line.chars().count() + 1)
            .sum();
        ParseError::Syntax {
            expression: expression.to_string(),
            token: token.into(),
            pos,
            lineno,
            pos_in_line: pos.saturating_sub(consumed),
        }
    }
}

/// Parse an expression. Empty (or all-whitespace) input yields `None`.
pub fn parse(expression: &str) -> Result<Option<Node>, ParseError> {
    let tokens = tokenize(expression)?;
    if tokens.is_empty() {
        return Ok(None);
    }
    let mut parser = Parser {
        expression,
        tokens,
        pos: 0,
    };
    let node = parser.parse_or()?;
    if let Some(token) = parser.peek() {
        return Err(parser.unexpected(token));
    }
    Ok(Some(node))
}

struct Parser<'a> {
    expression: &'a str,
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser<'_> {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn peek_kind(&self) -> Option<TokenKind> {
        self.peek().map(|t| t.kind)
    }

    fn peek_kind_at(&self, offset: usize) -> Option<TokenKind> {
        self.tokens.get(self.pos + offset).map(|t| t.kind)
    }

    fn advance(&mut self) -> Result<Token, ParseError> {
        let token = self.tokens.get(self.pos).cloned().ok_or(ParseError::Eof)?;
        self.pos += 1;
        Ok(token)
    }

    fn unexpected(&self, token: &Token) -> ParseError {
        ParseError::syntax(self.expression, token.value.clone(), token.pos, token.lineno)
    }

    fn expect(&mut self, kind: TokenKind) -> Result<Token, ParseError> {
        let token = self.advance()?;
        if token.kind != kind {
            return Err(self.unexpected(&token));
        }
        Ok(token)
    }

    fn parse_or(&mut self) -> Result<Node, ParseError> {
        let mut lhs = self.parse_and()?;
        while self.peek_kind() == Some(TokenKind::Or) {
            self.advance()?;
            let rhs = self.parse_and()?;
            lhs = Node::binary(lhs, BinaryOperator::Or, rhs);
        }
        Ok(lhs)
    }

    fn parse_and(&mut self) -> Result<Node, ParseError> {
        let mut lhs = self.parse_not()?;
        while self.peek_kind() == Some(TokenKind::And) {
            self.advance()?;
            let rhs = self.parse_not()?;
            lhs = Node::binary(lhs, BinaryOperator::And, rhs);
        }
        Ok(lhs)
    }

    fn parse_not(&mut self) -> Result<Node, ParseError> {
        if self.peek_kind() == Some(TokenKind::Not) {
            self.advance()?;
            let operand = self.parse_not()?;
            return Ok(Node::unary(UnaryOperator::Not, operand));
        }
        self.parse_equality()
    }

    /// Parse one non-associative level: `next (op next)?`, rejecting a
    /// second operator of the same level.
    fn parse_nonassoc(
        &mut self,
        ops: &[(TokenKind, BinaryOperator)],
        next: fn(&mut Self) -> Result<Node, ParseError>,
    ) -> Result<Node, ParseError> {
        let lhs = next(self)?;
        let lookup = |kind: Option<TokenKind>| {
            ops.iter()
                .find(|(k, _)| Some(*k) == kind)
                .map(|(_, op)| *op)
        };
        let Some(op) = lookup(self.peek_kind()) else {
            return Ok(lhs);
        };
        self.advance()?;
        let rhs = next(self)?;
        if lookup(self.peek_kind()).is_some() {
            if let Some(token) = self.peek() {
                return Err(self.unexpected(token));
            }
        }
        Ok(Node::binary(lhs, op, rhs))
    }

    fn parse_equality(&mut self) -> Result<Node, ParseError> {
        self.parse_nonassoc(
            &[
                (TokenKind::Eq, BinaryOperator::Eq),
                (TokenKind::Ne, BinaryOperator::Ne),
            ],
            Self::parse_relational,
        )
    }

    fn parse_relational(&mut self) -> Result<Node, ParseError> {
        self.parse_nonassoc(
            &[
                (TokenKind::Lt, BinaryOperator::Lt),
                (TokenKind::Le, BinaryOperator::Le),
                (TokenKind::Gt, BinaryOperator::Gt),
                (TokenKind::Ge, BinaryOperator::Ge),
            ],
            Self::parse_overlaps,
        )
    }

    fn parse_overlaps(&mut self) -> Result<Node, ParseError> {
        let lhs = self.parse_in()?;
        if self.peek_kind() != Some(TokenKind::Overlaps) {
            return Ok(lhs);
        }
        self.advance()?;
        let rhs = match self.try_parse_tuple()? {
            Some(tuple) => tuple,
            None => self.parse_in()?,
        };
        if self.peek_kind() == Some(TokenKind::Overlaps) {
            if let Some(token) = self.peek() {
                return Err(self.unexpected(token));
            }
        }
        Ok(Node::binary(lhs, BinaryOperator::Overlaps, rhs))
    }

    /// `(expr, expr)`; restores the position if the parenthesised
    /// expression turns out not to be a tuple.
    fn try_parse_tuple(&mut self) -> Result<Option<Node>, ParseError> {
        if self.peek_kind() != Some(TokenKind::LParen) {
            return Ok(None);
        }
        let saved = self.pos;
        self.advance()?;
        let first = self.parse_or()?;
        if self.peek_kind() != Some(TokenKind::Comma) {
            self.pos = saved;
            return Ok(None);
        }
        self.advance()?;
        let second = self.parse_or()?;
        self.expect(TokenKind::RParen)?;
        Ok(Some(Node::Tuple(Box::new(first), Box::new(second))))
    }

    fn parse_in(&mut self) -> Result<Node, ParseError> {
        let lhs = self.parse_additive()?;
        let not_in = match (self.peek_kind(), self.peek_kind_at(1)) {
            (Some(TokenKind::In), _) => false,
            (Some(TokenKind::Not), Some(TokenKind::In)) => {
                self.advance()?;
                true
            }
            _ => return Ok(lhs),
        };
        self.expect(TokenKind::In)?;
        self.expect(TokenKind::LParen)?;
        let mut values = vec![self.parse_in_item()?];
        while self.peek_kind() == Some(TokenKind::Comma) {
            self.advance()?;
            values.push(self.parse_in_item()?);
        }
        self.expect(TokenKind::RParen)?;
        Ok(Node::IsIn {
            lhs: Box::new(lhs),
            values,
            not_in,
        })
    }

    fn parse_in_item(&mut self) -> Result<Node, ParseError> {
        let start_pos = self.pos;
        let item = self.parse_additive()?;
        if self.peek_kind() != Some(TokenKind::DotDot) {
            return Ok(item);
        }
        let start = self.range_bound(&item, start_pos)?;
        self.advance()?;
        let stop_pos = self.pos;
        let stop_node = self.parse_unary()?;
        let stop = self.range_bound(&stop_node, stop_pos)?;
        let stride = if self.peek_kind() == Some(TokenKind::Colon) {
            self.advance()?;
            let stride_pos = self.pos;
            let stride_node = self.parse_unary()?;
            let stride = self.range_bound(&stride_node, stride_pos)?;
            if stride <= 0 {
                let token = &self.tokens[stride_pos];
                return Err(self.unexpected(token));
            }
            Some(stride)
        } else {
            None
        };
        Ok(Node::RangeLiteral {
            start,
            stop,
            stride,
        })
    }

    /// Integer value of a range bound (an optionally negated integer literal).
    fn range_bound(&self, node: &Node, token_pos: usize) -> Result<i64, ParseError> {
        let value = match node {
            Node::NumericLiteral(text) => text.parse::<i64>().ok(),
            Node::UnaryOp {
                op: UnaryOperator::Minus,
                operand,
            } => match operand.as_ref() {
                Node::NumericLiteral(text) => text.parse::<i64>().ok().map(|v| -v),
                _ => None,
            },
            _ => None,
        };
        value.ok_or_else(|| {
            let token = &self.tokens[token_pos.min(self.tokens.len() - 1)];
            self.unexpected(token)
        })
    }

    fn parse_additive(&mut self) -> Result<Node, ParseError> {
        let mut lhs = self.parse_multiplicative()?;
        loop {
            let op = match self.peek_kind() {
                Some(TokenKind::Add) => BinaryOperator::Add,
                Some(TokenKind::Sub) => BinaryOperator::Sub,
                _ => return Ok(lhs),
            };
            self.advance()?;
            let rhs = self.parse_multiplicative()?;
            lhs = Node::binary(lhs, op, rhs);
        }
    }

    fn parse_multiplicative(&mut self) -> Result<Node, ParseError> {
        let mut lhs = self.parse_unary()?;
        loop {
            let op = match self.peek_kind() {
                Some(TokenKind::Mul) => BinaryOperator::Mul,
                Some(TokenKind::Div) => BinaryOperator::Div,
                Some(TokenKind::Mod) => BinaryOperator::Mod,
                _ => return Ok(lhs),
            };
            self.advance()?;
            let rhs = self.parse_unary()?;
            lhs = Node::binary(lhs, op, rhs);
        }
    }

    fn parse_unary(&mut self) -> Result<Node, ParseError> {
        let op = match self.peek_kind() {
            Some(TokenKind::Add) => UnaryOperator::Plus,
            Some(TokenKind::Sub) => UnaryOperator::Minus,
            _ => return self.parse_primary(),
        };
        self.advance()?;
        let operand = self.parse_unary()?;
        Ok(Node::unary(op, operand))
    }

    fn parse_primary(&mut self) -> Result<Node, ParseError> {
        let token = self.advance()?;
        match token.kind {
            TokenKind::Identifier => Ok(Node::Identifier(token.value)),
            TokenKind::Numeric => Ok(Node::NumericLiteral(token.value)),
            TokenKind::Str => Ok(Node::StringLiteral(token.value)),
            TokenKind::Time => AstroTime::parse_literal(&token.value)
                .map(Node::TimeLiteral)
                .map_err(|_| self.unexpected(&token)),
            TokenKind::LParen => {
                let inner = self.parse_or()?;
                self.expect(TokenKind::RParen)?;
                Ok(Node::Parens(Box::new(inner)))
            }
            _ => Err(self.unexpected(&token)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parsed(expression: &str) -> Node {
        parse(expression).unwrap().unwrap()
    }

    #[test]
    fn test_empty_expression() {
        assert_eq!(parse("").unwrap(), None);
        assert_eq!(parse("  \n ").unwrap(), None);
    }

    #[test]
    fn test_precedence() {
        let node = parsed("a = 1 OR b = 2 AND NOT c > 3 + 4 * 5");
        assert_eq!(node.to_string(), "a = 1 OR b = 2 AND NOT c > 3 + 4 * 5");
        let Node::BinaryOp { op, rhs, .. } = &node else {
            panic!("expected binary op");
        };
        assert_eq!(*op, BinaryOperator::Or);
        let Node::BinaryOp { op, rhs, .. } = rhs.as_ref() else {
            panic!("expected AND");
        };
        assert_eq!(*op, BinaryOperator::And);
        let Node::UnaryOp { op, operand } = rhs.as_ref() else {
            panic!("expected NOT");
        };
        assert_eq!(*op, UnaryOperator::Not);
        let Node::BinaryOp { op, rhs, .. } = operand.as_ref() else {
            panic!("expected >");
        };
        assert_eq!(*op, BinaryOperator::Gt);
        assert!(matches!(
            rhs.as_ref(),
            Node::BinaryOp {
                op: BinaryOperator::Add,
                ..
            }
        ));
    }

    #[test]
    fn test_unary_minus_binds_tightest() {
        let node = parsed("-a * b");
        let Node::BinaryOp { lhs, op, .. } = &node else {
            panic!("expected binary op");
        };
        assert_eq!(*op, BinaryOperator::Mul);
        assert!(matches!(
            lhs.as_ref(),
            Node::UnaryOp {
                op: UnaryOperator::Minus,
                ..
            }
        ));
    }

    #[test]
    fn test_in_lists_and_ranges() {
        let node = parsed("visit NOT IN (1, 5..10:2, -3..-1, x)");
        let Node::IsIn { values, not_in, .. } = node else {
            panic!("expected IN");
        };
        assert!(not_in);
        assert_eq!(values.len(), 4);
        assert_eq!(
            values[1],
            Node::RangeLiteral {
                start: 5,
                stop: 10,
                stride: Some(2)
            }
        );
        assert_eq!(
            values[2],
            Node::RangeLiteral {
                start: -3,
                stop: -1,
                stride: None
            }
        );
        assert!(parse("visit IN (1..x)").is_err());
        assert!(parse("visit IN (1..5:0)").is_err());
    }

    #[test]
    fn test_overlaps_tuple() {
        let node = parsed("visit.timespan OVERLAPS (T'2020-01-01', T'2020-01-02')");
        let Node::BinaryOp { op, rhs, .. } = node else {
            panic!("expected OVERLAPS");
        };
        assert_eq!(op, BinaryOperator::Overlaps);
        assert!(matches!(*rhs, Node::Tuple(..)));

        let paren = parsed("a OVERLAPS (b)");
        assert!(matches!(paren, Node::BinaryOp { .. }));
        assert!(parse("(a, b)").is_err());
    }

    #[test]
    fn test_comparisons_are_not_associative() {
        let err = parse("a = b = c").unwrap_err();
        assert_eq!(err.to_string(), "Syntax error at or near '=' (line: 1, pos: 7)");
        assert!(parse("a < b < c").is_err());
        assert!(parse("(a = b) = c").is_ok());
    }

    #[test]
    fn test_syntax_error_reports_position() {
        let err = parse("visit = 1 AND\n  detector ==").unwrap_err();
        match &err {
            ParseError::Syntax {
                token,
                lineno,
                pos_in_line,
                ..
            } => {
                assert_eq!(token, "=");
                assert_eq!(*lineno, 2);
                assert_eq!(*pos_in_line, 12);
            }
            ParseError::Eof => panic!("expected syntax error"),
        }
        assert_eq!(err.to_string(), "Syntax error at or near '=' (line: 2, pos: 13)");
    }

    #[test]
    fn test_end_of_input() {
        let err = parse("visit = ").unwrap_err();
        assert_eq!(err, ParseError::Eof);
        assert_eq!(
            err.to_string(),
            "End of input reached while expecting further input"
        );
    }

    #[test]
    fn test_bad_time_literal() {
        assert!(parse("ingest_date > T'not a time'").is_err());
    }
}
