//! Hand-rolled tokenizer for the supported JavaScript subset.

use num_bigint::BigInt;

use crate::error::EngineError;

#[derive(Clone, Debug, PartialEq)]
pub enum Token {
    Number(f64),
    BigInt(BigInt),
    Str(String),
    Ident(String),
    /// Punctuation and operators, longest-match first.
    Punct(&'static str),
    Eof,
}

impl Token {
    pub fn is_punct(&self, p: &str) -> bool {
        matches!(self, Token::Punct(s) if *s == p)
    }

    pub fn is_ident(&self, name: &str) -> bool {
        matches!(self, Token::Ident(s) if s == name)
    }
}

const PUNCTS: &[&str] = &[
    "===", "!==", "**=", "...", "=>", "==", "!=", "<=", ">=", "&&", "||", "??", "++", "--", "+=",
    "-=", "*=", "/=", "%=", "**", "+", "-", "*", "/", "%", "=", "<", ">", "!", "(", ")", "{", "}",
    "[", "]", ";", ",", ".", ":", "?",
];

pub struct Lexer<'a> {
    src: &'a [u8],
    pos: usize,
    line: u32,
}

impl<'a> Lexer<'a> {
    pub fn new(src: &'a str) -> Self {
        Lexer {
            src: src.as_bytes(),
            pos: 0,
            line: 1,
        }
    }

    pub fn line(&self) -> u32 {
        self.line
    }

    fn peek_byte(&self) -> Option<u8> {
        self.src.get(self.pos).copied()
    }

    fn error(&self, message: impl Into<String>) -> EngineError {
        EngineError::Syntax(format!("{} (line {})", message.into(), self.line))
    }

    fn skip_trivia(&mut self) -> Result<(), EngineError> {
        loop {
            match self.peek_byte() {
                Some(b' ') | Some(b'\t') | Some(b'\r') => self.pos += 1,
                Some(b'\n') => {
                    self.pos += 1;
                    self.line += 1;
                }
                Some(b'/') if self.src.get(self.pos + 1) == Some(&b'/') => {
                    while let Some(c) = self.peek_byte() {
                        if c == b'\n' {
                            break;
                        }
                        self.pos += 1;
                    }
                }
                Some(b'/') if self.src.get(self.pos + 1) == Some(&b'*') => {
                    self.pos += 2;
                    loop {
                        match self.peek_byte() {
                            None => return Err(self.error("unterminated comment")),
                            Some(b'*') if self.src.get(self.pos + 1) == Some(&b'/') => {
                                self.pos += 2;
                                break;
                            }
                            Some(b'\n') => {
                                self.line += 1;
                                self.pos += 1;
                            }
                            Some(_) => self.pos += 1,
                        }
                    }
                }
                _ => return Ok(()),
            }
        }
    }

    pub fn next_token(&mut self) -> Result<Token, EngineError> {
        self.skip_trivia()?;
        let Some(c) = self.peek_byte() else {
            return Ok(Token::Eof);
        };

        if c.is_ascii_digit() {
            return self.lex_number();
        }
        if c == b'"' || c == b'\'' || c == b'`' {
            return self.lex_string(c);
        }
        if c.is_ascii_alphabetic() || c == b'_' || c == b'$' || c >= 0x80 {
            return self.lex_ident();
        }

        for p in PUNCTS {
            if self.src[self.pos..].starts_with(p.as_bytes()) {
                self.pos += p.len();
                return Ok(Token::Punct(p));
            }
        }
        Err(self.error(format!("unexpected character '{}'", c as char)))
    }

    fn lex_number(&mut self) -> Result<Token, EngineError> {
        let start = self.pos;
        let mut is_float = false;
        // Hex literals
        if self.peek_byte() == Some(b'0')
            && matches!(self.src.get(self.pos + 1), Some(b'x') | Some(b'X'))
        {
            self.pos += 2;
            let digits_start = self.pos;
            while matches!(self.peek_byte(), Some(c) if c.is_ascii_hexdigit()) {
                self.pos += 1;
            }
            if digits_start == self.pos {
                return Err(self.error("missing hexadecimal digits"));
            }
            let text = std::str::from_utf8(&self.src[digits_start..self.pos])
                .map_err(|_| self.error("invalid number"))?;
            let n = u64::from_str_radix(text, 16).map_err(|_| self.error("invalid number"))?;
            return Ok(Token::Number(n as f64));
        }
        while matches!(self.peek_byte(), Some(c) if c.is_ascii_digit()) {
            self.pos += 1;
        }
        if self.peek_byte() == Some(b'n') {
            // BigInt literal
            let text = std::str::from_utf8(&self.src[start..self.pos])
                .map_err(|_| self.error("invalid number"))?;
            self.pos += 1;
            let value: BigInt = text.parse().map_err(|_| self.error("invalid bigint"))?;
            return Ok(Token::BigInt(value));
        }
        if self.peek_byte() == Some(b'.') {
            is_float = true;
            self.pos += 1;
            while matches!(self.peek_byte(), Some(c) if c.is_ascii_digit()) {
                self.pos += 1;
            }
        }
        if matches!(self.peek_byte(), Some(b'e') | Some(b'E')) {
            is_float = true;
            self.pos += 1;
            if matches!(self.peek_byte(), Some(b'+') | Some(b'-')) {
                self.pos += 1;
            }
            while matches!(self.peek_byte(), Some(c) if c.is_ascii_digit()) {
                self.pos += 1;
            }
        }
        let _ = is_float;
        let text = std::str::from_utf8(&self.src[start..self.pos])
            .map_err(|_| self.error("invalid number"))?;
        let n: f64 = text.parse().map_err(|_| self.error("invalid number"))?;
        Ok(Token::Number(n))
    }

    fn lex_string(&mut self, quote: u8) -> Result<Token, EngineError> {
        self.pos += 1;
        let mut out = String::new();
        loop {
            match self.peek_byte() {
                None => return Err(self.error("unterminated string literal")),
                Some(c) if c == quote => {
                    self.pos += 1;
                    return Ok(Token::Str(out));
                }
                Some(b'\\') => {
                    self.pos += 1;
                    match self.peek_byte() {
                        Some(b'n') => out.push('\n'),
                        Some(b't') => out.push('\t'),
                        Some(b'r') => out.push('\r'),
                        Some(b'0') => out.push('\0'),
                        Some(b'\\') => out.push('\\'),
                        Some(b'\'') => out.push('\''),
                        Some(b'"') => out.push('"'),
                        Some(b'`') => out.push('`'),
                        Some(b'u') => {
                            let hex = self
                                .src
                                .get(self.pos + 1..self.pos + 5)
                                .ok_or_else(|| self.error("bad unicode escape"))?;
                            let text = std::str::from_utf8(hex)
                                .map_err(|_| self.error("bad unicode escape"))?;
                            let cp = u32::from_str_radix(text, 16)
                                .map_err(|_| self.error("bad unicode escape"))?;
                            out.push(
                                char::from_u32(cp).ok_or_else(|| self.error("bad unicode escape"))?,
                            );
                            self.pos += 4;
                        }
                        _ => return Err(self.error("unsupported escape sequence")),
                    }
                    self.pos += 1;
                }
                Some(b'\n') => return Err(self.error("unterminated string literal")),
                Some(c) if c < 0x80 => {
                    out.push(c as char);
                    self.pos += 1;
                }
                Some(_) => {
                    // Multi-byte UTF-8 sequence; decode one scalar.
                    let rest = std::str::from_utf8(&self.src[self.pos..])
                        .map_err(|_| self.error("invalid utf-8 in string"))?;
                    let ch = rest.chars().next().ok_or_else(|| self.error("bad string"))?;
                    out.push(ch);
                    self.pos += ch.len_utf8();
                }
            }
        }
    }

    fn lex_ident(&mut self) -> Result<Token, EngineError> {
        let start = self.pos;
        while let Some(c) = self.peek_byte() {
            if c.is_ascii_alphanumeric() || c == b'_' || c == b'$' || c >= 0x80 {
                self.pos += 1;
            } else {
                break;
            }
        }
        let text = std::str::from_utf8(&self.src[start..self.pos])
            .map_err(|_| self.error("invalid identifier"))?;
        Ok(Token::Ident(text.to_string()))
    }
}

/// Tokenize the whole source up front; the parser works over the vector.
pub fn tokenize(src: &str) -> Result<Vec<(Token, u32)>, EngineError> {
    let mut lexer = Lexer::new(src);
    let mut out = Vec::new();
    loop {
        let line = lexer.line();
        let token = lexer.next_token()?;
        let done = token == Token::Eof;
        out.push((token, line));
        if done {
            return Ok(out);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kinds(src: &str) -> Vec<Token> {
        tokenize(src).unwrap().into_iter().map(|(t, _)| t).collect()
    }

    #[test]
    fn numbers_and_idents() {
        let tokens = kinds("let x = 40 + 2.5;");
        assert_eq!(tokens[0], Token::Ident("let".into()));
        assert_eq!(tokens[3], Token::Number(40.0));
        assert_eq!(tokens[5], Token::Number(2.5));
    }

    #[test]
    fn strings_with_escapes() {
        let tokens = kinds(r#"'a\nb' "cA""#);
        assert_eq!(tokens[0], Token::Str("a\nb".into()));
        assert_eq!(tokens[1], Token::Str("cA".into()));
    }

    #[test]
    fn multi_char_puncts() {
        let tokens = kinds("a === b => c");
        assert!(tokens[1].is_punct("==="));
        assert!(tokens[3].is_punct("=>"));
    }

    #[test]
    fn comments_skipped() {
        let tokens = kinds("1 // x\n/* y */ 2");
        assert_eq!(tokens[0], Token::Number(1.0));
        assert_eq!(tokens[1], Token::Number(2.0));
    }

    #[test]
    fn bigint_literal() {
        let tokens = kinds("10n");
        assert_eq!(tokens[0], Token::BigInt(BigInt::from(10)));
    }

    #[test]
    fn hex_literal() {
        assert_eq!(kinds("0xff")[0], Token::Number(255.0));
    }
}
