//! Lexer for Melee
//!
//! Converts source code into a stream of tokens. Newlines are insignificant;
//! statements are separated by optional semicolons.

use crate::error::{ErrorKind, MeleeError, Result};
use crate::token::{lookup_keyword, Span, Token, TokenKind};

/// The lexer state
pub struct Lexer<'a> {
    source: &'a str,
    chars: std::iter::Peekable<std::str::CharIndices<'a>>,
    current_pos: usize,
    line: usize,
    column: usize,
}

impl<'a> Lexer<'a> {
    /// Create a new lexer from source code
    pub fn new(source: &'a str) -> Self {
        Self {
            source,
            chars: source.char_indices().peekable(),
            current_pos: 0,
            line: 1,
            column: 1,
        }
    }

    /// Tokenize the entire source
    pub fn tokenize(&mut self) -> Result<Vec<Token>> {
        let mut tokens = Vec::new();

        while let Some(token) = self.next_token()? {
            tokens.push(token);
        }

        tokens.push(Token::new(
            TokenKind::Eof,
            Span::new(self.current_pos, self.current_pos, self.line, self.column),
            String::new(),
        ));

        Ok(tokens)
    }

    fn next_token(&mut self) -> Result<Option<Token>> {
        self.skip_whitespace_and_comments();

        let Some(&(start_pos, ch)) = self.chars.peek() else {
            return Ok(None);
        };

        let start_line = self.line;
        let start_column = self.column;

        let kind = match ch {
            '(' => { self.advance(); TokenKind::LeftParen }
            ')' => { self.advance(); TokenKind::RightParen }
            '{' => { self.advance(); TokenKind::LeftBrace }
            '}' => { self.advance(); TokenKind::RightBrace }
            '[' => { self.advance(); TokenKind::LeftBracket }
            ']' => { self.advance(); TokenKind::RightBracket }
            ',' => { self.advance(); TokenKind::Comma }
            ';' => { self.advance(); TokenKind::Semicolon }

            '+' => self.with_assign(TokenKind::Plus, TokenKind::PlusAssign),
            '-' => self.with_assign(TokenKind::Minus, TokenKind::MinusAssign),
            '*' => self.with_assign(TokenKind::Star, TokenKind::StarAssign),
            '/' => self.with_assign(TokenKind::Slash, TokenKind::SlashAssign),
            '%' => self.with_assign(TokenKind::Percent, TokenKind::PercentAssign),
            '=' => self.with_assign(TokenKind::Assign, TokenKind::EqualEqual),
            '!' => self.with_assign(TokenKind::Bang, TokenKind::BangEqual),
            '<' => self.with_assign(TokenKind::Less, TokenKind::LessEqual),
            '>' => self.with_assign(TokenKind::Greater, TokenKind::GreaterEqual),

            ':' => {
                self.advance();
                if self.peek_char() == Some('=') {
                    self.advance();
                    TokenKind::Declare
                } else {
                    return Err(self.unexpected(':', start_pos, start_line, start_column));
                }
            }
            '&' => {
                self.advance();
                if self.peek_char() == Some('&') {
                    self.advance();
                    TokenKind::AndAnd
                } else {
                    return Err(self.unexpected('&', start_pos, start_line, start_column));
                }
            }
            '|' => {
                self.advance();
                if self.peek_char() == Some('|') {
                    self.advance();
                    TokenKind::OrOr
                } else {
                    return Err(self.unexpected('|', start_pos, start_line, start_column));
                }
            }

            c if c.is_ascii_digit() => self.scan_number()?,

            c if c.is_alphabetic() || c == '_' => self.scan_identifier(),

            _ => {
                self.advance();
                return Err(self.unexpected(ch, start_pos, start_line, start_column));
            }
        };

        let lexeme = self.source[start_pos..self.current_pos].to_string();

        Ok(Some(Token::new(
            kind,
            Span::new(start_pos, self.current_pos, start_line, start_column),
            lexeme,
        )))
    }

    /// Consume one character, then an optional `=` selecting `compound`
    fn with_assign(&mut self, single: TokenKind, compound: TokenKind) -> TokenKind {
        self.advance();
        if self.peek_char() == Some('=') {
            self.advance();
            compound
        } else {
            single
        }
    }

    fn unexpected(&self, ch: char, start: usize, line: usize, column: usize) -> MeleeError {
        MeleeError::at(
            ErrorKind::UnexpectedCharacter(ch),
            Span::new(start, self.current_pos, line, column),
        )
    }

    fn advance(&mut self) -> Option<char> {
        let (pos, ch) = self.chars.next()?;
        self.current_pos = pos + ch.len_utf8();
        if ch == '\n' {
            self.line += 1;
            self.column = 1;
        } else {
            self.column += 1;
        }
        Some(ch)
    }

    fn peek_char(&mut self) -> Option<char> {
        self.chars.peek().map(|&(_, ch)| ch)
    }

    fn skip_whitespace_and_comments(&mut self) {
        while let Some(&(_, ch)) = self.chars.peek() {
            match ch {
                ' ' | '\t' | '\r' | '\n' => {
                    self.advance();
                }

                '/' if self.source[self.current_pos..].starts_with("//") => {
                    while let Some(&(_, c)) = self.chars.peek() {
                        if c == '\n' {
                            break;
                        }
                        self.advance();
                    }
                }

                _ => break,
            }
        }
    }

    fn scan_number(&mut self) -> Result<TokenKind> {
        let start = self.current_pos;
        let (line, column) = (self.line, self.column);

        while let Some(c) = self.peek_char() {
            if c.is_ascii_digit() {
                self.advance();
            } else {
                break;
            }
        }

        let text = &self.source[start..self.current_pos];
        text.parse::<i64>().map(TokenKind::Int).map_err(|_| {
            MeleeError::at(
                ErrorKind::InvalidNumber(text.to_string()),
                Span::new(start, self.current_pos, line, column),
            )
        })
    }

    fn scan_identifier(&mut self) -> TokenKind {
        let start = self.current_pos;

        while let Some(c) = self.peek_char() {
            if c.is_alphanumeric() || c == '_' {
                self.advance();
            } else {
                break;
            }
        }

        let text = &self.source[start..self.current_pos];
        lookup_keyword(text).unwrap_or_else(|| TokenKind::Ident(text.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn tokenize(source: &str) -> Vec<TokenKind> {
        let mut lexer = Lexer::new(source);
        lexer
            .tokenize()
            .unwrap()
            .into_iter()
            .map(|t| t.kind)
            .filter(|k| !matches!(k, TokenKind::Eof))
            .collect()
    }

    #[test]
    fn test_keywords() {
        let tokens = tokenize("fn gen yield loop next note skip cc null");
        assert_eq!(
            tokens,
            vec![
                TokenKind::Fn,
                TokenKind::Gen,
                TokenKind::Yield,
                TokenKind::Loop,
                TokenKind::Next,
                TokenKind::Note,
                TokenKind::Skip,
                TokenKind::Cc,
                TokenKind::Null,
            ]
        );
    }

    #[test]
    fn test_operators() {
        let tokens = tokenize(":= = += -= *= /= %= == != < <= > >= && || !");
        assert_eq!(
            tokens,
            vec![
                TokenKind::Declare,
                TokenKind::Assign,
                TokenKind::PlusAssign,
                TokenKind::MinusAssign,
                TokenKind::StarAssign,
                TokenKind::SlashAssign,
                TokenKind::PercentAssign,
                TokenKind::EqualEqual,
                TokenKind::BangEqual,
                TokenKind::Less,
                TokenKind::LessEqual,
                TokenKind::Greater,
                TokenKind::GreaterEqual,
                TokenKind::AndAnd,
                TokenKind::OrOr,
                TokenKind::Bang,
            ]
        );
    }

    #[test]
    fn test_positions_across_lines() {
        let mut lexer = Lexer::new("x := 1;\n  // comment\n  y");
        let tokens = lexer.tokenize().unwrap();
        let y = &tokens[4];
        assert_eq!(y.kind, TokenKind::Ident("y".to_string()));
        assert_eq!((y.span.line, y.span.column), (3, 3));
    }

    #[test]
    fn test_unexpected_character() {
        let err = Lexer::new("x := @").tokenize().unwrap_err();
        assert_eq!(err.kind, ErrorKind::UnexpectedCharacter('@'));
        assert_eq!(err.column(), Some(6));
    }

    #[test]
    fn test_integer_overflow_is_rejected() {
        let err = Lexer::new("99999999999999999999").tokenize().unwrap_err();
        assert!(matches!(err.kind, ErrorKind::InvalidNumber(_)));
    }
}
