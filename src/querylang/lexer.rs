//! Tokenizer for the query language.

use crate::error::{GilesError, Result};

#[derive(Debug, Clone, PartialEq)]
pub enum TokenKind {
    /// Bare word: keyword, tag name or unit. Keywords are matched case-insensitively.
    Word(String),
    Str(String),
    Number(u64),
    Comma,
    LParen,
    RParen,
    LBracket,
    RBracket,
    Eq,
    Neq,
    Plus,
    Minus,
    Star,
    Semicolon,
    Eof,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Token {
    pub kind: TokenKind,
    /// Byte offset of the first character.
    pub pos: usize,
    /// Byte offset one past the last character.
    pub end: usize,
}

impl Token {
    /// Text shown in parse errors.
    pub fn describe(&self) -> String {
        match &self.kind {
            TokenKind::Word(w) => w.clone(),
            TokenKind::Str(s) => format!("\"{}\"", s),
            TokenKind::Number(n) => n.to_string(),
            TokenKind::Comma => ",".into(),
            TokenKind::LParen => "(".into(),
            TokenKind::RParen => ")".into(),
            TokenKind::LBracket => "[".into(),
            TokenKind::RBracket => "]".into(),
            TokenKind::Eq => "=".into(),
            TokenKind::Neq => "!=".into(),
            TokenKind::Plus => "+".into(),
            TokenKind::Minus => "-".into(),
            TokenKind::Star => "*".into(),
            TokenKind::Semicolon => ";".into(),
            TokenKind::Eof => "end of input".into(),
        }
    }

    /// True if this is the bare word `keyword`, ignoring case.
    pub fn is_keyword(&self, keyword: &str) -> bool {
        matches!(&self.kind, TokenKind::Word(w) if w.eq_ignore_ascii_case(keyword))
    }
}

fn is_word_start(c: char) -> bool {
    c.is_alphabetic() || c == '_' || c == '/' || c == 'µ'
}

fn is_word_char(c: char) -> bool {
    c.is_alphanumeric() || matches!(c, '_' | '/' | '.' | '|' | ':' | 'µ')
}

/// Splits `input` into tokens, ending with a single `Eof`.
pub fn tokenize(input: &str) -> Result<Vec<Token>> {
    let mut tokens = Vec::new();
    let mut chars = input.char_indices().peekable();

    while let Some(&(pos, c)) = chars.peek() {
        if c.is_whitespace() {
            chars.next();
            continue;
        }

        let single = match c {
            ',' => Some(TokenKind::Comma),
            '(' => Some(TokenKind::LParen),
            ')' => Some(TokenKind::RParen),
            '[' => Some(TokenKind::LBracket),
            ']' => Some(TokenKind::RBracket),
            '=' => Some(TokenKind::Eq),
            '+' => Some(TokenKind::Plus),
            '-' => Some(TokenKind::Minus),
            '*' => Some(TokenKind::Star),
            ';' => Some(TokenKind::Semicolon),
            _ => None,
        };
        if let Some(kind) = single {
            chars.next();
            tokens.push(Token { kind, pos, end: pos + c.len_utf8() });
            continue;
        }

        if c == '!' {
            chars.next();
            match chars.next() {
                Some((_, '=')) => tokens.push(Token { kind: TokenKind::Neq, pos, end: pos + 2 }),
                _ => return Err(GilesError::parse(pos, "!", "expected '!='")),
            }
            continue;
        }

        if c == '"' || c == '\'' {
            chars.next();
            let mut value = String::new();
            let mut closed = None;
            while let Some((i, ch)) = chars.next() {
                if ch == c {
                    closed = Some(i + ch.len_utf8());
                    break;
                }
                if ch == '\\' {
                    // Only the quote and the backslash are escapes; other sequences stay for regexes.
                    match chars.peek() {
                        Some(&(_, next)) if next == c || next == '\\' => {
                            value.push(next);
                            chars.next();
                        }
                        _ => value.push(ch),
                    }
                } else {
                    value.push(ch);
                }
            }
            let end = closed.ok_or_else(|| {
                GilesError::parse(pos, &input[pos..], "unterminated string literal")
            })?;
            tokens.push(Token { kind: TokenKind::Str(value), pos, end });
            continue;
        }

        if c.is_ascii_digit() {
            let mut end = pos;
            while let Some(&(i, d)) = chars.peek() {
                if !d.is_ascii_digit() {
                    break;
                }
                end = i + 1;
                chars.next();
            }
            let text = &input[pos..end];
            let n = text
                .parse::<u64>()
                .map_err(|_| GilesError::parse(pos, text, "number out of range"))?;
            tokens.push(Token { kind: TokenKind::Number(n), pos, end });
            continue;
        }

        if is_word_start(c) {
            let mut end = pos;
            while let Some(&(i, ch)) = chars.peek() {
                if !is_word_char(ch) {
                    break;
                }
                end = i + ch.len_utf8();
                chars.next();
            }
            tokens.push(Token { kind: TokenKind::Word(input[pos..end].to_string()), pos, end });
            continue;
        }

        return Err(GilesError::parse(pos, c.to_string(), "unexpected character"));
    }

    tokens.push(Token { kind: TokenKind::Eof, pos: input.len(), end: input.len() });
    Ok(tokens)
}
