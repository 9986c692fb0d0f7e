//! Tokenizer for user expressions.

use super::ParseError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TokenKind {
    Identifier,
    Numeric,
    Str,
    Time,
    And,
    Or,
    Not,
    In,
    Overlaps,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    LParen,
    RParen,
    Comma,
    DotDot,
    Colon,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Token {
    pub kind: TokenKind,
    /// Token value; quotes are stripped from string and time literals.
    pub value: String,
    /// Character offset from the start of the expression.
    pub pos: usize,
    /// 1-based line number.
    pub lineno: usize,
}

fn keyword(word: &str) -> Option<TokenKind> {
    match word.to_ascii_uppercase().as_str() {
        "AND" => Some(TokenKind::And),
        "OR" => Some(TokenKind::Or),
        "NOT" => Some(TokenKind::Not),
        "IN" => Some(TokenKind::In),
        "OVERLAPS" => Some(TokenKind::Overlaps),
        _ => None,
    }
}

fn is_ident_start(c: char) -> bool {
    c.is_ascii_alphabetic() || c == '_'
}

fn is_ident_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_'
}

pub(crate) fn tokenize(expression: &str) -> Result<Vec<Token>, ParseError> {
    let chars: Vec<char> = expression.chars().collect();
    let mut tokens = Vec::new();
    let mut lineno = 1;
    let mut i = 0;

    let error = |value: String, pos: usize, lineno: usize| {
        ParseError::syntax(expression, value, pos, lineno)
    };

    while i < chars.len() {
        let c = chars[i];
        let start = i;
        let peek = chars.get(i + 1).copied();

        if c == '\n' {
            lineno += 1;
            i += 1;
            continue;
        }
        if c.is_whitespace() {
            i += 1;
            continue;
        }

        let push = |kind: TokenKind, value: String, tokens: &mut Vec<Token>| {
            tokens.push(Token {
                kind,
                value,
                pos: start,
                lineno,
            });
        };

        // T'...' must be checked before identifiers.
        if (c == 'T' || c == 't') && peek == Some('\'') {
            let body_start = i + 2;
            let end = chars[body_start..]
                .iter()
                .position(|&ch| ch == '\'' || ch == '\n')
                .map(|p| body_start + p)
                .filter(|&p| chars[p] == '\'')
                .ok_or_else(|| error(format!("{}'", c), start, lineno))?;
            let value: String = chars[body_start..end].iter().collect();
            push(TokenKind::Time, value, &mut tokens);
            i = end + 1;
            continue;
        }

        if is_ident_start(c) {
            let mut end = i + 1;
            loop {
                while end < chars.len() && is_ident_char(chars[end]) {
                    end += 1;
                }
                // Dotted names, but not a `..` range operator.
                if end + 1 < chars.len() && chars[end] == '.' && is_ident_start(chars[end + 1]) {
                    end += 2;
                } else {
                    break;
                }
            }
            let word: String = chars[i..end].iter().collect();
            match keyword(&word) {
                Some(kind) => push(kind, word.to_ascii_uppercase(), &mut tokens),
                None => push(TokenKind::Identifier, word, &mut tokens),
            }
            i = end;
            continue;
        }

        if c.is_ascii_digit() || (c == '.' && peek.is_some_and(|p| p.is_ascii_digit())) {
            let mut end = i;
            while end < chars.len() && chars[end].is_ascii_digit() {
                end += 1;
            }
            if end < chars.len()
                && chars[end] == '.'
                && chars.get(end + 1).is_some_and(|p| p.is_ascii_digit())
            {
                end += 1;
                while end < chars.len() && chars[end].is_ascii_digit() {
                    end += 1;
                }
            }
            if end < chars.len() && (chars[end] == 'e' || chars[end] == 'E') {
                let mut exp = end + 1;
                if exp < chars.len() && (chars[exp] == '+' || chars[exp] == '-') {
                    exp += 1;
                }
                if exp < chars.len() && chars[exp].is_ascii_digit() {
                    end = exp;
                    while end < chars.len() && chars[end].is_ascii_digit() {
                        end += 1;
                    }
                }
            }
            let value: String = chars[i..end].iter().collect();
            push(TokenKind::Numeric, value, &mut tokens);
            i = end;
            continue;
        }

        if c == '\'' {
            let end = chars[i + 1..]
                .iter()
                .position(|&ch| ch == '\'' || ch == '\n')
                .map(|p| i + 1 + p)
                .filter(|&p| chars[p] == '\'')
                .ok_or_else(|| error("'".to_string(), start, lineno))?;
            let value: String = chars[i + 1..end].iter().collect();
            push(TokenKind::Str, value, &mut tokens);
            i = end + 1;
            continue;
        }

        let (kind, len) = match (c, peek) {
            ('!', Some('=')) => (TokenKind::Ne, 2),
            ('<', Some('>')) => (TokenKind::Ne, 2),
            ('<', Some('=')) => (TokenKind::Le, 2),
            ('>', Some('=')) => (TokenKind::Ge, 2),
            ('.', Some('.')) => (TokenKind::DotDot, 2),
            ('=', _) => (TokenKind::Eq, 1),
            ('<', _) => (TokenKind::Lt, 1),
            ('>', _) => (TokenKind::Gt, 1),
            ('+', _) => (TokenKind::Add, 1),
            ('-', _) => (TokenKind::Sub, 1),
            ('*', _) => (TokenKind::Mul, 1),
            ('/', _) => (TokenKind::Div, 1),
            ('%', _) => (TokenKind::Mod, 1),
            ('(', _) => (TokenKind::LParen, 1),
            (')', _) => (TokenKind::RParen, 1),
            (',', _) => (TokenKind::Comma, 1),
            (':', _) => (TokenKind::Colon, 1),
            _ => return Err(error(c.to_string(), start, lineno)),
        };
        let value: String = chars[i..i + len].iter().collect();
        push(kind, value, &mut tokens);
        i += len;
    }

    Ok(tokens)
}
