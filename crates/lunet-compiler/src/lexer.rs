use crate::token::{SpannedToken, Token};
use lunet_core::string::StringInterner;
use std::fmt;

/// Lexical error: malformed token. Fatal to compilation.
#[derive(Clone, Debug, PartialEq)]
pub struct LexError {
    pub message: String,
    pub line: u32,
}

impl fmt::Display for LexError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.line, self.message)
    }
}

impl std::error::Error for LexError {}

/// Pull-based lexer for Lua 5.1 with one token of lookahead.
pub struct Lexer<'a> {
    source: &'a [u8],
    pos: usize,
    line: u32,
    current: Option<Result<SpannedToken, LexError>>,
    lookahead: Option<Result<SpannedToken, LexError>>,
    pub strings: StringInterner,
    /// Line of the last consumed token, for "ambiguous syntax" checks and
    /// call-site line info.
    pub last_line: u32,
}

impl<'a> Lexer<'a> {
    pub fn new(source: &'a [u8]) -> Self {
        Self::with_strings(source, StringInterner::new())
    }

    /// Create a lexer reusing an existing string interner.
    pub fn with_strings(source: &'a [u8], strings: StringInterner) -> Self {
        let mut lexer = Lexer {
            source,
            pos: 0,
            line: 1,
            current: None,
            lookahead: None,
            strings,
            last_line: 1,
        };
        lexer.current = Some(lexer.scan_token());
        lexer
    }

    /// Peek at the current token without consuming.
    pub fn current(&self) -> Result<&SpannedToken, &LexError> {
        match &self.current {
            Some(Ok(tok)) => Ok(tok),
            Some(Err(e)) => Err(e),
            None => unreachable!("lexer always has a current token"),
        }
    }

    /// Peek one token past the current one.
    pub fn peek_ahead(&mut self) -> Result<&SpannedToken, LexError> {
        if self.lookahead.is_none() {
            let tok = self.scan_token();
            self.lookahead = Some(tok);
        }
        match self.lookahead.as_ref().unwrap() {
            Ok(tok) => Ok(tok),
            Err(e) => Err(e.clone()),
        }
    }

    /// Consume the current token and advance to the next one.
    pub fn advance(&mut self) -> Result<SpannedToken, LexError> {
        if let Some(Ok(ref tok)) = self.current {
            self.last_line = tok.line;
        }
        let prev = self.current.take().unwrap();
        self.current = Some(match self.lookahead.take() {
            Some(tok) => tok,
            None => self.scan_token(),
        });
        prev
    }

    pub fn line(&self) -> u32 {
        self.line
    }

    // ---- Internal scanning ----

    fn peek(&self) -> Option<u8> {
        self.source.get(self.pos).copied()
    }

    fn peek_at(&self, offset: usize) -> Option<u8> {
        self.source.get(self.pos + offset).copied()
    }

    fn bump(&mut self) -> Option<u8> {
        let ch = self.source.get(self.pos).copied()?;
        self.pos += 1;
        if ch == b'\n' || ch == b'\r' {
            // \n\r and \r\n each count as one newline.
            let other = if ch == b'\n' { b'\r' } else { b'\n' };
            if self.peek() == Some(other) {
                self.pos += 1;
            }
            self.line += 1;
        }
        Some(ch)
    }

    fn error(&self, msg: impl Into<String>) -> LexError {
        LexError {
            message: msg.into(),
            line: self.line,
        }
    }

    fn skip_whitespace_and_comments(&mut self) -> Result<(), LexError> {
        loop {
            while let Some(ch) = self.peek() {
                if matches!(ch, b' ' | b'\t' | b'\n' | b'\r' | b'\x0B' | b'\x0C') {
                    self.bump();
                } else {
                    break;
                }
            }
            if self.peek() == Some(b'-') && self.peek_at(1) == Some(b'-') {
                self.bump();
                self.bump();
                if let Some(level) = self.check_long_bracket() {
                    self.read_long_bracket(level, true)?;
                    continue;
                }
                // Short comment: to end of line.
                while let Some(ch) = self.peek() {
                    if ch == b'\n' || ch == b'\r' {
                        break;
                    }
                    self.bump();
                }
                continue;
            }
            return Ok(());
        }
    }

    /// Check for a long bracket `[=*[` at the current position. Returns
    /// the `=` count without consuming anything.
    fn check_long_bracket(&self) -> Option<usize> {
        if self.peek() != Some(b'[') {
            return None;
        }
        let mut level = 0;
        while self.peek_at(1 + level) == Some(b'=') {
            level += 1;
        }
        if self.peek_at(1 + level) == Some(b'[') {
            Some(level)
        } else {
            None
        }
    }

    /// Read a long string or comment body after `[=*[` has been detected.
    /// Returns the contents (unused for comments).
    fn read_long_bracket(&mut self, level: usize, is_comment: bool) -> Result<Vec<u8>, LexError> {
        // Consume the opening bracket.
        for _ in 0..level + 2 {
            self.bump();
        }
        // A newline immediately after the opening bracket is skipped.
        if matches!(self.peek(), Some(b'\n') | Some(b'\r')) {
            self.bump();
        }
        let mut content = Vec::new();
        loop {
            match self.peek() {
                None => {
                    let what = if is_comment { "comment" } else { "string" };
                    return Err(self.error(format!("unfinished long {what}")));
                }
                Some(b']') => {
                    let mut close = 0;
                    while self.peek_at(1 + close) == Some(b'=') {
                        close += 1;
                    }
                    if close == level && self.peek_at(1 + close) == Some(b']') {
                        for _ in 0..level + 2 {
                            self.bump();
                        }
                        return Ok(content);
                    }
                    content.push(b']');
                    self.bump();
                }
                Some(b'\n') | Some(b'\r') => {
                    self.bump();
                    content.push(b'\n');
                }
                Some(ch) => {
                    content.push(ch);
                    self.bump();
                }
            }
        }
    }

    fn scan_token(&mut self) -> Result<SpannedToken, LexError> {
        self.skip_whitespace_and_comments()?;
        let line = self.line;
        let tok = |token| Ok(SpannedToken { token, line });

        let ch = match self.peek() {
            Some(ch) => ch,
            None => return tok(Token::Eof),
        };

        match ch {
            b'+' => {
                self.bump();
                tok(Token::Plus)
            }
            b'-' => {
                // Comments were consumed above; a lone '-' is minus.
                self.bump();
                tok(Token::Minus)
            }
            b'*' => {
                self.bump();
                tok(Token::Star)
            }
            b'/' => {
                self.bump();
                tok(Token::Slash)
            }
            b'%' => {
                self.bump();
                tok(Token::Percent)
            }
            b'^' => {
                self.bump();
                tok(Token::Caret)
            }
            b'#' => {
                self.bump();
                tok(Token::Hash)
            }
            b'(' => {
                self.bump();
                tok(Token::LParen)
            }
            b')' => {
                self.bump();
                tok(Token::RParen)
            }
            b'{' => {
                self.bump();
                tok(Token::LBrace)
            }
            b'}' => {
                self.bump();
                tok(Token::RBrace)
            }
            b']' => {
                self.bump();
                tok(Token::RBracket)
            }
            b';' => {
                self.bump();
                tok(Token::Semi)
            }
            b':' => {
                self.bump();
                tok(Token::Colon)
            }
            b',' => {
                self.bump();
                tok(Token::Comma)
            }
            b'[' => {
                if let Some(level) = self.check_long_bracket() {
                    let content = self.read_long_bracket(level, false)?;
                    let id = self.strings.intern(&content);
                    return Ok(SpannedToken {
                        token: Token::String(id),
                        line,
                    });
                }
                self.bump();
                tok(Token::LBracket)
            }
            b'=' => {
                self.bump();
                if self.peek() == Some(b'=') {
                    self.bump();
                    tok(Token::Equal)
                } else {
                    tok(Token::Assign)
                }
            }
            b'~' => {
                self.bump();
                if self.peek() == Some(b'=') {
                    self.bump();
                    tok(Token::NotEqual)
                } else {
                    Err(self.error("unexpected symbol near '~'"))
                }
            }
            b'<' => {
                self.bump();
                if self.peek() == Some(b'=') {
                    self.bump();
                    tok(Token::LessEq)
                } else {
                    tok(Token::Less)
                }
            }
            b'>' => {
                self.bump();
                if self.peek() == Some(b'=') {
                    self.bump();
                    tok(Token::GreaterEq)
                } else {
                    tok(Token::Greater)
                }
            }
            b'.' => {
                self.bump();
                if self.peek() == Some(b'.') {
                    self.bump();
                    if self.peek() == Some(b'.') {
                        self.bump();
                        tok(Token::DotDotDot)
                    } else {
                        tok(Token::DotDot)
                    }
                } else if self.peek().is_some_and(|c| c.is_ascii_digit()) {
                    self.scan_number(line, true)
                } else {
                    tok(Token::Dot)
                }
            }
            b'"' | b'\'' => self.scan_short_string(ch, line),
            b'0'..=b'9' => self.scan_number(line, false),
            _ if ch == b'_' || ch.is_ascii_alphabetic() => {
                let start = self.pos;
                while self
                    .peek()
                    .is_some_and(|c| c == b'_' || c.is_ascii_alphanumeric())
                {
                    self.bump();
                }
                let text = &self.source[start..self.pos];
                // Reserved words are recognized by exact match.
                let word = std::str::from_utf8(text).expect("identifier bytes are ASCII");
                match Token::keyword_from_str(word) {
                    Some(keyword) => tok(keyword),
                    None => {
                        let id = self.strings.intern(text);
                        tok(Token::Name(id))
                    }
                }
            }
            _ => Err(self.error(format!("unexpected symbol near '{}'", ch as char))),
        }
    }

    /// Scan a numeric literal: decimal with optional fraction and exponent,
    /// or `0x` hexadecimal. `seen_dot` means the leading '.' was already
    /// consumed.
    fn scan_number(&mut self, line: u32, seen_dot: bool) -> Result<SpannedToken, LexError> {
        let start = if seen_dot { self.pos - 1 } else { self.pos };

        if !seen_dot && self.peek() == Some(b'0') && matches!(self.peek_at(1), Some(b'x') | Some(b'X')) {
            self.bump();
            self.bump();
            let digits_start = self.pos;
            while self.peek().is_some_and(|c| c.is_ascii_hexdigit()) {
                self.bump();
            }
            if self.pos == digits_start || self.trailing_junk() {
                return Err(self.malformed_number(start));
            }
            let digits = std::str::from_utf8(&self.source[digits_start..self.pos]).unwrap();
            let value = u64::from_str_radix(digits, 16)
                .map_err(|_| self.malformed_number(start))? as f64;
            return Ok(SpannedToken {
                token: Token::Number(value),
                line,
            });
        }

        while self.peek().is_some_and(|c| c.is_ascii_digit()) {
            self.bump();
        }
        if !seen_dot && self.peek() == Some(b'.') {
            self.bump();
            while self.peek().is_some_and(|c| c.is_ascii_digit()) {
                self.bump();
            }
        }
        if matches!(self.peek(), Some(b'e') | Some(b'E')) {
            self.bump();
            if matches!(self.peek(), Some(b'+') | Some(b'-')) {
                self.bump();
            }
            let exp_start = self.pos;
            while self.peek().is_some_and(|c| c.is_ascii_digit()) {
                self.bump();
            }
            if self.pos == exp_start {
                return Err(self.malformed_number(start));
            }
        }
        if self.trailing_junk() {
            return Err(self.malformed_number(start));
        }

        let text = std::str::from_utf8(&self.source[start..self.pos]).unwrap();
        let value: f64 = text.parse().map_err(|_| self.malformed_number(start))?;
        Ok(SpannedToken {
            token: Token::Number(value),
            line,
        })
    }

    fn trailing_junk(&self) -> bool {
        self.peek()
            .is_some_and(|c| c == b'_' || c.is_ascii_alphanumeric())
    }

    fn malformed_number(&self, start: usize) -> LexError {
        let mut end = self.pos;
        while self
            .source
            .get(end)
            .is_some_and(|c| *c == b'_' || c.is_ascii_alphanumeric() || *c == b'.')
        {
            end += 1;
        }
        let text = String::from_utf8_lossy(&self.source[start..end]);
        self.error(format!("malformed number near '{text}'"))
    }

    /// Scan a quoted string with the standard escape set.
    fn scan_short_string(&mut self, quote: u8, line: u32) -> Result<SpannedToken, LexError> {
        self.bump(); // opening quote
        let mut content = Vec::new();
        loop {
            match self.peek() {
                None | Some(b'\n') | Some(b'\r') => {
                    return Err(self.error("unfinished string"));
                }
                Some(ch) if ch == quote => {
                    self.bump();
                    break;
                }
                Some(b'\\') => {
                    self.bump();
                    match self.peek() {
                        None => return Err(self.error("unfinished string")),
                        Some(b'a') => {
                            content.push(0x07);
                            self.bump();
                        }
                        Some(b'b') => {
                            content.push(0x08);
                            self.bump();
                        }
                        Some(b'f') => {
                            content.push(0x0C);
                            self.bump();
                        }
                        Some(b'n') => {
                            content.push(b'\n');
                            self.bump();
                        }
                        Some(b'r') => {
                            content.push(b'\r');
                            self.bump();
                        }
                        Some(b't') => {
                            content.push(b'\t');
                            self.bump();
                        }
                        Some(b'v') => {
                            content.push(0x0B);
                            self.bump();
                        }
                        Some(b'\n') | Some(b'\r') => {
                            // Escaped newline: the string continues.
                            self.bump();
                            content.push(b'\n');
                        }
                        Some(d) if d.is_ascii_digit() => {
                            let mut value: u32 = 0;
                            let mut count = 0;
                            while count < 3 && self.peek().is_some_and(|c| c.is_ascii_digit()) {
                                value = value * 10 + (self.bump().unwrap() - b'0') as u32;
                                count += 1;
                            }
                            if value > 255 {
                                return Err(self.error("escape sequence too large"));
                            }
                            content.push(value as u8);
                        }
                        Some(other) => {
                            // \\, \", \', and any other punctuation escape
                            // denote the character itself.
                            content.push(other);
                            self.bump();
                        }
                    }
                }
                Some(ch) => {
                    content.push(ch);
                    self.bump();
                }
            }
        }
        let id = self.strings.intern(&content);
        Ok(SpannedToken {
            token: Token::String(id),
            line,
        })
    }
}
