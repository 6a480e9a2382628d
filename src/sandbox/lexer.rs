//! Tokenizer for reward function source.
//!
//! Produces a flat token stream with explicit `Newline`, `Indent` and
//! `Dedent` tokens so the parser never has to look at whitespace.

use super::CompileError;

/// Punctuation, longest first so greedy matching picks `**=` before `**`.
const PUNCTUATION: &[&str] = &[
    "**=", "//=", "**", "//", "==", "!=", "<=", ">=", "+=", "-=", "*=", "/=", "%=", "->", "+", "-",
    "*", "/", "%", "<", ">", "=", "(", ")", "[", "]", "{", "}", ",", ":", ".", ";", "@",
];

/// Kind of a lexed token.
#[derive(Debug, Clone, PartialEq)]
pub enum TokenKind {
    Name(String),
    Number(f64),
    Str(String),
    Punct(&'static str),
    Newline,
    Indent,
    Dedent,
    Eof,
}

/// A token together with the source line it started on.
#[derive(Debug, Clone, PartialEq)]
pub struct Token {
    pub kind: TokenKind,
    pub line: usize,
}

struct Lexer {
    chars: Vec<char>,
    pos: usize,
    line: usize,
    depth: usize,
    indents: Vec<usize>,
    tokens: Vec<Token>,
}

/// Tokenize `source` into a stream ending with `Eof`.
pub fn tokenize(source: &str) -> Result<Vec<Token>, CompileError> {
    let mut lexer = Lexer {
        chars: source.chars().collect(),
        pos: 0,
        line: 1,
        depth: 0,
        indents: vec![0],
        tokens: Vec::new(),
    };
    lexer.run()?;
    Ok(lexer.tokens)
}

impl Lexer {
    fn peek(&self) -> Option<char> {
        self.chars.get(self.pos).copied()
    }

    fn peek_at(&self, offset: usize) -> Option<char> {
        self.chars.get(self.pos + offset).copied()
    }

    fn push(&mut self, kind: TokenKind) {
        self.tokens.push(Token {
            kind,
            line: self.line,
        });
    }

    fn error(&self, message: impl Into<String>) -> CompileError {
        CompileError::Lex {
            line: self.line,
            message: message.into(),
        }
    }

    fn run(&mut self) -> Result<(), CompileError> {
        let mut at_line_start = true;

        while self.pos < self.chars.len() {
            if at_line_start && self.depth == 0 {
                if self.handle_indentation()? {
                    continue;
                }
                at_line_start = false;
            }

            let Some(c) = self.peek() else { break };
            match c {
                '\n' => {
                    self.pos += 1;
                    if self.depth == 0 {
                        self.push_newline();
                        at_line_start = true;
                    }
                    self.line += 1;
                }
                '\r' | ' ' | '\t' => self.pos += 1,
                '#' => self.skip_comment(),
                '\\' if matches!(self.peek_at(1), Some('\n')) => {
                    self.pos += 2;
                    self.line += 1;
                }
                '"' | '\'' => self.lex_string(c)?,
                c if c.is_ascii_digit() => self.lex_number()?,
                '.' if self.peek_at(1).is_some_and(|d| d.is_ascii_digit()) => self.lex_number()?,
                c if c.is_alphabetic() || c == '_' => self.lex_name(),
                _ => self.lex_punct()?,
            }
        }

        self.push_newline();
        while self.indents.len() > 1 {
            self.indents.pop();
            self.push(TokenKind::Dedent);
        }
        self.push(TokenKind::Eof);
        Ok(())
    }

    fn push_newline(&mut self) {
        let needs_newline = self
            .tokens
            .last()
            .is_some_and(|t| !matches!(t.kind, TokenKind::Newline | TokenKind::Indent | TokenKind::Dedent));
        if needs_newline {
            self.push(TokenKind::Newline);
        }
    }

    /// Measures leading whitespace and emits indent tokens.
    ///
    /// Returns `true` when the line was blank or comment-only and has been
    /// consumed entirely.
    fn handle_indentation(&mut self) -> Result<bool, CompileError> {
        let mut width = 0usize;
        while let Some(c) = self.peek() {
            match c {
                ' ' => width += 1,
                '\t' => width = (width / 8 + 1) * 8,
                '\r' | '\x0c' => {}
                _ => break,
            }
            self.pos += 1;
        }

        match self.peek() {
            None => return Ok(true),
            Some('\n') => {
                self.pos += 1;
                self.line += 1;
                return Ok(true);
            }
            Some('#') => {
                self.skip_comment();
                if self.peek() == Some('\n') {
                    self.pos += 1;
                    self.line += 1;
                }
                return Ok(true);
            }
            _ => {}
        }

        let current = self.indents.last().copied().unwrap_or(0);
        if width > current {
            self.indents.push(width);
            self.push(TokenKind::Indent);
        } else if width < current {
            while self.indents.last().is_some_and(|&w| w > width) {
                self.indents.pop();
                self.push(TokenKind::Dedent);
            }
            if self.indents.last().copied() != Some(width) {
                return Err(self.error("unindent does not match any outer indentation level"));
            }
        }
        Ok(false)
    }

    fn skip_comment(&mut self) {
        while let Some(c) = self.peek() {
            if c == '\n' {
                break;
            }
            self.pos += 1;
        }
    }

    fn lex_name(&mut self) {
        let start = self.pos;
        while self
            .peek()
            .is_some_and(|c| c.is_alphanumeric() || c == '_')
        {
            self.pos += 1;
        }
        let name: String = self.chars[start..self.pos].iter().collect();
        self.push(TokenKind::Name(name));
    }

    fn lex_number(&mut self) -> Result<(), CompileError> {
        let start = self.pos;
        let mut seen_exponent = false;
        while let Some(c) = self.peek() {
            if c.is_ascii_digit() || c == '.' || c == '_' {
                self.pos += 1;
            } else if (c == 'e' || c == 'E') && !seen_exponent {
                seen_exponent = true;
                self.pos += 1;
                if matches!(self.peek(), Some('+') | Some('-')) {
                    self.pos += 1;
                }
            } else {
                break;
            }
        }
        let text: String = self.chars[start..self.pos]
            .iter()
            .filter(|c| **c != '_')
            .collect();
        let value = text
            .parse::<f64>()
            .map_err(|_| self.error(format!("invalid number literal '{}'", text)))?;
        if self.peek().is_some_and(|c| c.is_alphabetic()) {
            return Err(self.error(format!("invalid number literal '{}'", text)));
        }
        self.push(TokenKind::Number(value));
        Ok(())
    }

    fn lex_string(&mut self, quote: char) -> Result<(), CompileError> {
        let start_line = self.line;
        let triple = self.peek_at(1) == Some(quote) && self.peek_at(2) == Some(quote);
        self.pos += if triple { 3 } else { 1 };

        let mut value = String::new();
        loop {
            let Some(c) = self.peek() else {
                return Err(CompileError::Lex {
                    line: start_line,
                    message: "unterminated string literal".to_string(),
                });
            };
            if c == quote {
                if !triple {
                    self.pos += 1;
                    break;
                }
                if self.peek_at(1) == Some(quote) && self.peek_at(2) == Some(quote) {
                    self.pos += 3;
                    break;
                }
            }
            if c == '\n' {
                if !triple {
                    return Err(self.error("unterminated string literal"));
                }
                self.line += 1;
            }
            if c == '\\' {
                self.pos += 1;
                match self.peek() {
                    Some('n') => value.push('\n'),
                    Some('t') => value.push('\t'),
                    Some('\n') => self.line += 1,
                    Some(other) => value.push(other),
                    None => continue,
                }
                self.pos += 1;
                continue;
            }
            value.push(c);
            self.pos += 1;
        }

        self.tokens.push(Token {
            kind: TokenKind::Str(value),
            line: start_line,
        });
        Ok(())
    }

    fn lex_punct(&mut self) -> Result<(), CompileError> {
        for punct in PUNCTUATION {
            let len = punct.len();
            let matches = punct
                .chars()
                .enumerate()
                .all(|(i, pc)| self.peek_at(i) == Some(pc));
            if matches {
                match *punct {
                    "(" | "[" | "{" => self.depth += 1,
                    ")" | "]" | "}" => self.depth = self.depth.saturating_sub(1),
                    _ => {}
                }
                self.pos += len;
                self.push(TokenKind::Punct(punct));
                return Ok(());
            }
        }
        let c = self.peek().unwrap_or(' ');
        Err(self.error(format!("unexpected character '{}'", c)))
    }
}
