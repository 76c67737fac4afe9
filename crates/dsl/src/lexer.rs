//! Lexer for the Boogie pipeline language
//!
//! Scans source text into [`Token`]s lazily. The lexer is an iterator over
//! `Result<Token, LexError>`: it is single-pass, fuses after the first error
//! or the end of input, and cannot be rewound. Scan the text again with a new
//! [`Lexer`] to get the tokens a second time.

use std::collections::VecDeque;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::LexError;

/// Reserved operation and outcome names
pub const KEYWORDS: &[&str] = &[
    "analyze", "reason", "call", "next", "cancel", "send", "back", "join", "verify", "match", "ok",
    "default",
];

/// Token categories recognized by the lexer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TokenKind {
    /// The `out` pipeline boundary
    Out,
    /// The `in` pipeline boundary
    In,
    /// `<=`
    Outflow,
    /// `=>`
    Inflow,
    /// `(`, `)` or `|`
    Delimiter,
    Identifier,
    Keyword,
    /// Quoted string, text holds the content between the quotes
    Literal,
    /// `<name>` modifier attached to an operation, text holds `name`
    Behavior,
    /// `;` to end of line, text holds everything after the `;`
    Comment,
}

impl fmt::Display for TokenKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TokenKind::Out => "'out'",
            TokenKind::In => "'in'",
            TokenKind::Outflow => "'<='",
            TokenKind::Inflow => "'=>'",
            TokenKind::Delimiter => "delimiter",
            TokenKind::Identifier => "identifier",
            TokenKind::Keyword => "keyword",
            TokenKind::Literal => "literal",
            TokenKind::Behavior => "behavior",
            TokenKind::Comment => "comment",
        };
        f.write_str(name)
    }
}

/// A lexeme with its source position (1-based)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Token {
    pub kind: TokenKind,
    pub text: String,
    pub line: usize,
    pub column: usize,
}

impl Token {
    pub fn new(kind: TokenKind, text: impl Into<String>, line: usize, column: usize) -> Self {
        Self {
            kind,
            text: text.into(),
            line,
            column,
        }
    }

    /// True for a delimiter token with the given character
    pub fn is_delimiter(&self, delimiter: char) -> bool {
        self.kind == TokenKind::Delimiter && self.text.len() == 1 && self.text.starts_with(delimiter)
    }

    /// Short description used in syntax errors
    pub fn describe(&self) -> String {
        match self.kind {
            TokenKind::Out | TokenKind::In | TokenKind::Outflow | TokenKind::Inflow => {
                self.kind.to_string()
            }
            _ => format!("{} '{}'", self.kind, self.text),
        }
    }
}

impl fmt::Display for Token {
    /// Renders the token back into source form
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            TokenKind::Literal => write!(f, "\"{}\"", self.text),
            TokenKind::Behavior => write!(f, "<{}>", self.text),
            TokenKind::Comment => writeln!(f, ";{}", self.text),
            _ => f.write_str(&self.text),
        }
    }
}

/// Internal scanner state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LexState {
    Scanning,
    /// Saw `<` or `=`, waiting for the second character
    InFlowOperator { lead: char, line: usize, column: usize },
    InLiteral { line: usize, column: usize },
    InBehavior { line: usize, column: usize },
    InComment { line: usize, column: usize },
    Finished,
}

/// Lexer for the Boogie pipeline language
pub struct Lexer {
    input: Vec<char>,
    position: usize,
    line: usize,
    column: usize,
    state: LexState,
    buffer: String,
    buffer_start: (usize, usize),
    pending: VecDeque<Token>,
}

impl Lexer {
    /// Create a new lexer over the given source
    pub fn new(input: &str) -> Self {
        Self {
            input: input.chars().collect(),
            position: 0,
            line: 1,
            column: 1,
            state: LexState::Scanning,
            buffer: String::new(),
            buffer_start: (1, 1),
            pending: VecDeque::new(),
        }
    }

    /// Drain the lexer, stopping at the first error
    pub fn tokenize(self) -> Result<Vec<Token>, LexError> {
        self.collect()
    }

    /// Consume the next character, tracking line and column
    fn bump(&mut self) -> Option<(char, usize, usize)> {
        let ch = *self.input.get(self.position)?;
        let at = (ch, self.line, self.column);
        self.position += 1;
        if ch == '\n' {
            self.line += 1;
            self.column = 1;
        } else {
            self.column += 1;
        }
        Some(at)
    }

    /// Classify and queue the accumulated word, if any
    fn flush_word(&mut self) {
        if self.buffer.is_empty() {
            return;
        }

        let word = std::mem::take(&mut self.buffer);
        let kind = match word.as_str() {
            "out" => TokenKind::Out,
            "in" => TokenKind::In,
            w if KEYWORDS.contains(&w) => TokenKind::Keyword,
            _ => TokenKind::Identifier,
        };
        let (line, column) = self.buffer_start;
        self.pending.push_back(Token::new(kind, word, line, column));
    }

    fn fail(&mut self, error: LexError) -> Option<Result<Token, LexError>> {
        self.state = LexState::Finished;
        self.pending.clear();
        Some(Err(error))
    }

    /// Handle end of input in the current state
    fn finish(&mut self) -> Option<Result<Token, LexError>> {
        match self.state {
            LexState::InLiteral { line, column } => {
                self.fail(LexError::UnterminatedLiteral { line, column })
            }
            LexState::InBehavior { line, column } => {
                self.fail(LexError::UnterminatedBehavior { line, column })
            }
            LexState::InFlowOperator { lead, line, column } => {
                self.fail(LexError::MalformedOperator {
                    lead,
                    found: lead.to_string(),
                    expected: expected_follower(lead),
                    line,
                    column,
                })
            }
            LexState::InComment { line, column } => {
                let text = std::mem::take(&mut self.buffer);
                self.state = LexState::Finished;
                Some(Ok(Token::new(
                    TokenKind::Comment,
                    text.trim_end_matches('\r'),
                    line,
                    column,
                )))
            }
            LexState::Scanning => {
                self.flush_word();
                self.state = LexState::Finished;
                self.pending.pop_front().map(Ok)
            }
            LexState::Finished => None,
        }
    }

    /// Advance the state machine by one character
    fn scan(&mut self, ch: char, line: usize, column: usize) -> Result<(), LexError> {
        match self.state {
            LexState::Scanning => match ch {
                c if c.is_whitespace() => self.flush_word(),
                '(' | ')' | '|' => {
                    self.flush_word();
                    self.pending
                        .push_back(Token::new(TokenKind::Delimiter, ch.to_string(), line, column));
                }
                '<' | '=' => {
                    self.flush_word();
                    self.state = LexState::InFlowOperator {
                        lead: ch,
                        line,
                        column,
                    };
                }
                '"' => {
                    self.flush_word();
                    self.state = LexState::InLiteral { line, column };
                }
                ';' => {
                    self.flush_word();
                    self.state = LexState::InComment { line, column };
                }
                _ => {
                    if self.buffer.is_empty() {
                        self.buffer_start = (line, column);
                    }
                    self.buffer.push(ch);
                }
            },
            LexState::InFlowOperator {
                lead,
                line: start_line,
                column: start_column,
            } => match (lead, ch) {
                ('<', '=') => {
                    self.pending.push_back(Token::new(
                        TokenKind::Outflow,
                        "<=",
                        start_line,
                        start_column,
                    ));
                    self.state = LexState::Scanning;
                }
                ('=', '>') => {
                    self.pending.push_back(Token::new(
                        TokenKind::Inflow,
                        "=>",
                        start_line,
                        start_column,
                    ));
                    self.state = LexState::Scanning;
                }
                ('<', c) if c.is_alphabetic() || c == '_' => {
                    self.buffer.push(c);
                    self.state = LexState::InBehavior {
                        line: start_line,
                        column: start_column,
                    };
                }
                _ => {
                    return Err(LexError::MalformedOperator {
                        lead,
                        found: format!("{}{}", lead, ch),
                        expected: expected_follower(lead),
                        line: start_line,
                        column: start_column,
                    });
                }
            },
            LexState::InBehavior {
                line: start_line,
                column: start_column,
            } => match ch {
                '>' => {
                    let name = std::mem::take(&mut self.buffer);
                    self.pending.push_back(Token::new(
                        TokenKind::Behavior,
                        name,
                        start_line,
                        start_column,
                    ));
                    self.state = LexState::Scanning;
                }
                c if c.is_alphanumeric() || c == '_' || c == '-' || c == '.' => self.buffer.push(c),
                '\n' => {
                    return Err(LexError::UnterminatedBehavior {
                        line: start_line,
                        column: start_column,
                    });
                }
                c => return Err(LexError::UnexpectedCharacter { ch: c, line, column }),
            },
            LexState::InLiteral {
                line: start_line,
                column: start_column,
            } => {
                if ch == '"' {
                    let text = std::mem::take(&mut self.buffer);
                    self.pending.push_back(Token::new(
                        TokenKind::Literal,
                        text,
                        start_line,
                        start_column,
                    ));
                    self.state = LexState::Scanning;
                } else {
                    self.buffer.push(ch);
                }
            }
            LexState::InComment {
                line: start_line,
                column: start_column,
            } => {
                if ch == '\n' {
                    let text = std::mem::take(&mut self.buffer);
                    self.pending.push_back(Token::new(
                        TokenKind::Comment,
                        text.trim_end_matches('\r'),
                        start_line,
                        start_column,
                    ));
                    self.state = LexState::Scanning;
                } else {
                    self.buffer.push(ch);
                }
            }
            LexState::Finished => {}
        }

        Ok(())
    }
}

impl Iterator for Lexer {
    type Item = Result<Token, LexError>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(token) = self.pending.pop_front() {
                return Some(Ok(token));
            }

            if self.state == LexState::Finished {
                return None;
            }

            match self.bump() {
                Some((ch, line, column)) => {
                    if let Err(error) = self.scan(ch, line, column) {
                        return self.fail(error);
                    }
                }
                None => return self.finish(),
            }
        }
    }
}

impl std::iter::FusedIterator for Lexer {}

fn expected_follower(lead: char) -> &'static str {
    if lead == '<' {
        "'=' or a behavior name"
    } else {
        "'>'"
    }
}

/// Scan a complete source text
pub fn tokenize(source: &str) -> Result<Vec<Token>, LexError> {
    Lexer::new(source).tokenize()
}

/// Render tokens back into source text that re-lexes to the same kinds
pub fn render(tokens: &[Token]) -> String {
    let mut out = String::new();
    for token in tokens {
        if !out.is_empty() && !out.ends_with('\n') {
            out.push(' ');
        }
        out.push_str(&token.to_string());
    }
    out
}
