//! Tokenizer for arithmetic expressions.

use num_bigint::BigInt;

use super::ParseError;

/// Longest integer literal accepted, in digits.
const MAX_INT_DIGITS: usize = 4300;

#[derive(Debug, Clone, PartialEq)]
pub enum TokenKind {
    Int(BigInt),
    Float(f64),
    Name(String),
    Str(String),
    Plus,
    Minus,
    Star,
    DoubleStar,
    Slash,
    DoubleSlash,
    Percent,
    LParen,
    RParen,
    Comma,
    Dot,
    End,
}

impl TokenKind {
    /// Human-readable form used in syntax error messages.
    pub fn describe(&self) -> String {
        match self {
            Self::Int(v) => v.to_string(),
            Self::Float(v) => v.to_string(),
            Self::Name(name) => format!("'{name}'"),
            Self::Str(_) => "string literal".to_string(),
            Self::Plus => "'+'".to_string(),
            Self::Minus => "'-'".to_string(),
            Self::Star => "'*'".to_string(),
            Self::DoubleStar => "'**'".to_string(),
            Self::Slash => "'/'".to_string(),
            Self::DoubleSlash => "'//'".to_string(),
            Self::Percent => "'%'".to_string(),
            Self::LParen => "'('".to_string(),
            Self::RParen => "')'".to_string(),
            Self::Comma => "','".to_string(),
            Self::Dot => "'.'".to_string(),
            Self::End => "end of expression".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Token {
    pub kind: TokenKind,
    /// Byte offset of the token in the source.
    pub offset: usize,
}

/// Split `source` into tokens. The last token is always `TokenKind::End`.
pub fn tokenize(source: &str) -> Result<Vec<Token>, ParseError> {
    let bytes = source.as_bytes();
    let mut tokens = Vec::new();
    let mut pos = 0;

    while pos < bytes.len() {
        let c = bytes[pos];
        let start = pos;

        let kind = match c {
            b' ' | b'\t' | b'\r' | b'\n' => {
                pos += 1;
                continue;
            }
            b'0'..=b'9' => {
                let (kind, end) = lex_number(source, start)?;
                pos = end;
                kind
            }
            b'.' if bytes.get(pos + 1).is_some_and(u8::is_ascii_digit) => {
                let (kind, end) = lex_number(source, start)?;
                pos = end;
                kind
            }
            b'a'..=b'z' | b'A'..=b'Z' | b'_' => {
                while pos < bytes.len()
                    && (bytes[pos].is_ascii_alphanumeric() || bytes[pos] == b'_')
                {
                    pos += 1;
                }
                TokenKind::Name(source[start..pos].to_string())
            }
            b'\'' | b'"' => {
                let (text, end) = lex_string(source, start)?;
                pos = end;
                TokenKind::Str(text)
            }
            b'+' => {
                pos += 1;
                TokenKind::Plus
            }
            b'-' => {
                pos += 1;
                TokenKind::Minus
            }
            b'*' if bytes.get(pos + 1) == Some(&b'*') => {
                pos += 2;
                TokenKind::DoubleStar
            }
            b'*' => {
                pos += 1;
                TokenKind::Star
            }
            b'/' if bytes.get(pos + 1) == Some(&b'/') => {
                pos += 2;
                TokenKind::DoubleSlash
            }
            b'/' => {
                pos += 1;
                TokenKind::Slash
            }
            b'%' => {
                pos += 1;
                TokenKind::Percent
            }
            b'(' => {
                pos += 1;
                TokenKind::LParen
            }
            b')' => {
                pos += 1;
                TokenKind::RParen
            }
            b',' => {
                pos += 1;
                TokenKind::Comma
            }
            b'.' => {
                pos += 1;
                TokenKind::Dot
            }
            _ => {
                let ch = source[start..].chars().next().unwrap_or('?');
                return Err(ParseError::new(format!("invalid character '{ch}'"), start));
            }
        };

        tokens.push(Token { kind, offset: start });
    }

    tokens.push(Token {
        kind: TokenKind::End,
        offset: bytes.len(),
    });
    Ok(tokens)
}

fn lex_number(source: &str, start: usize) -> Result<(TokenKind, usize), ParseError> {
    let bytes = source.as_bytes();
    let mut pos = start;
    let mut is_float = false;

    while pos < bytes.len() && bytes[pos].is_ascii_digit() {
        pos += 1;
    }
    if pos < bytes.len() && bytes[pos] == b'.' {
        is_float = true;
        pos += 1;
        while pos < bytes.len() && bytes[pos].is_ascii_digit() {
            pos += 1;
        }
    }
    if pos < bytes.len() && (bytes[pos] == b'e' || bytes[pos] == b'E') {
        let mut exp = pos + 1;
        if exp < bytes.len() && (bytes[exp] == b'+' || bytes[exp] == b'-') {
            exp += 1;
        }
        if exp < bytes.len() && bytes[exp].is_ascii_digit() {
            is_float = true;
            pos = exp;
            while pos < bytes.len() && bytes[pos].is_ascii_digit() {
                pos += 1;
            }
        }
    }
    if pos < bytes.len() && (bytes[pos].is_ascii_alphabetic() || bytes[pos] == b'_') {
        return Err(ParseError::new("invalid decimal literal", start));
    }

    let text = &source[start..pos];
    let kind = if is_float {
        let value = text
            .parse::<f64>()
            .map_err(|_| ParseError::new("invalid decimal literal", start))?;
        TokenKind::Float(value)
    } else {
        if text.len() > 1 && text.starts_with('0') && text.bytes().any(|b| b != b'0') {
            return Err(ParseError::new(
                "leading zeros in decimal integer literals are not permitted",
                start,
            ));
        }
        if text.len() > MAX_INT_DIGITS {
            return Err(ParseError::new("integer literal is too large", start));
        }
        let value = text
            .parse::<BigInt>()
            .map_err(|_| ParseError::new("invalid decimal literal", start))?;
        TokenKind::Int(value)
    };
    Ok((kind, pos))
}

fn lex_string(source: &str, start: usize) -> Result<(String, usize), ParseError> {
    let bytes = source.as_bytes();
    let quote = bytes[start];
    let mut pos = start + 1;

    while pos < bytes.len() {
        match bytes[pos] {
            b'\\' => pos += 2,
            b if b == quote => {
                return Ok((source[start + 1..pos].to_string(), pos + 1));
            }
            b'\n' => break,
            _ => pos += 1,
        }
    }
    Err(ParseError::new("unterminated string literal", start))
}
