//! UTF-8 scanner producing the token stream the compiler consumes.
//!
//! Statements are newline-terminated, so the scanner emits [`TokenKind::Newline`]
//! tokens — collapsed across blank lines and suppressed inside parentheses
//! and brackets, where line breaks are purely cosmetic.
//!
//! Interpolated strings (`'${expr}'`) lex as a sequence of
//! [`TokenKind::InterpolChunk`] tokens (the literal text before each
//! embedded expression), followed by the expression's own tokens, and end
//! with a plain [`TokenKind::String`] carrying the final chunk. A small
//! stack of brace depths lets interpolations nest and contain dict
//! literals.

/// Token kinds, including every operator and keyword of the language.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenKind {
    // Punctuation
    LeftParen,
    RightParen,
    LeftBrace,
    RightBrace,
    LeftBracket,
    RightBracket,
    Comma,
    Dot,
    DotDot,
    Ellipsis,
    Semicolon,
    Colon,
    At,

    // Operators
    Plus,
    PlusEqual,
    Minus,
    MinusEqual,
    Star,
    StarEqual,
    StarStar,
    StarStarEqual,
    Slash,
    SlashEqual,
    SlashSlash,
    SlashSlashEqual,
    Percent,
    PercentEqual,
    Amp,
    AmpEqual,
    Pipe,
    PipeEqual,
    Caret,
    CaretEqual,
    Tilde,
    Less,
    LessEqual,
    LessLess,
    LessLessEqual,
    Greater,
    GreaterEqual,
    GreaterGreater,
    GreaterGreaterEqual,
    GreaterGreaterGreater,
    Bang,
    BangEqual,
    Equal,
    EqualEqual,
    QuestionQuestion,

    // Literals
    Identifier,
    /// A complete string literal, or the final chunk of an interpolation.
    String,
    /// A string chunk immediately followed by an embedded `${expr}`.
    InterpolChunk,
    /// A byte-string literal; the lexeme is the raw inner text, decoded by
    /// [`decode_bytes`].
    BytesString,
    Number,

    // Keywords
    And,
    As,
    Break,
    Catch,
    Class,
    Continue,
    Def,
    Do,
    Echo,
    Else,
    False,
    Finally,
    For,
    If,
    Import,
    In,
    Loop,
    New,
    Nil,
    Or,
    Parent,
    Raise,
    Return,
    SelfKw,
    Static,
    True,
    Try,
    Var,
    While,

    Newline,
    Eof,
    /// Lexical error; the message is in the lexeme.
    Error,
}

#[derive(Debug, Clone)]
pub struct Token {
    pub kind: TokenKind,
    /// Decoded content for string tokens, raw source text otherwise.
    pub lexeme: String,
    pub line: u32,
}

impl Token {
    fn new(kind: TokenKind, lexeme: impl Into<String>, line: u32) -> Token {
        Token {
            kind,
            lexeme: lexeme.into(),
            line,
        }
    }
}

/// State of one suspended string, resumed when its interpolation closes.
struct InterpFrame {
    quote: char,
    brace_depth: u32,
}

pub struct Scanner<'a> {
    source: &'a str,
    /// Byte offset of the next character.
    current: usize,
    line: u32,
    /// Depth of open `(` and `[` groups; newlines inside are cosmetic.
    group_depth: u32,
    interp: Vec<InterpFrame>,
}

impl<'a> Scanner<'a> {
    pub fn new(source: &'a str) -> Scanner<'a> {
        // Tolerate and skip a UTF-8 BOM.
        let source = source.strip_prefix('\u{feff}').unwrap_or(source);
        Scanner {
            source,
            current: 0,
            line: 1,
            group_depth: 0,
            interp: Vec::new(),
        }
    }

    pub fn next_token(&mut self) -> Token {
        if let Some(token) = self.skip_blanks() {
            return token;
        }

        let line = self.line;
        let Some(c) = self.advance() else {
            return Token::new(TokenKind::Eof, "", line);
        };

        match c {
            '(' => {
                self.group_depth += 1;
                Token::new(TokenKind::LeftParen, "(", line)
            }
            ')' => {
                self.group_depth = self.group_depth.saturating_sub(1);
                Token::new(TokenKind::RightParen, ")", line)
            }
            '[' => {
                self.group_depth += 1;
                Token::new(TokenKind::LeftBracket, "[", line)
            }
            ']' => {
                self.group_depth = self.group_depth.saturating_sub(1);
                Token::new(TokenKind::RightBracket, "]", line)
            }
            '{' => {
                if let Some(frame) = self.interp.last_mut() {
                    frame.brace_depth += 1;
                }
                Token::new(TokenKind::LeftBrace, "{", line)
            }
            '}' => {
                match self.interp.last_mut() {
                    Some(frame) if frame.brace_depth == 0 => {
                        // This brace closes an interpolation: resume the
                        // suspended string literal.
                        let quote = frame.quote;
                        self.interp.pop();
                        self.scan_string(quote, false)
                    }
                    Some(frame) => {
                        frame.brace_depth -= 1;
                        Token::new(TokenKind::RightBrace, "}", line)
                    }
                    None => Token::new(TokenKind::RightBrace, "}", line),
                }
            }
            ',' => Token::new(TokenKind::Comma, ",", line),
            ';' => Token::new(TokenKind::Semicolon, ";", line),
            ':' => Token::new(TokenKind::Colon, ":", line),
            '@' => Token::new(TokenKind::At, "@", line),
            '.' => {
                if self.matches('.') {
                    if self.matches('.') {
                        Token::new(TokenKind::Ellipsis, "...", line)
                    } else {
                        Token::new(TokenKind::DotDot, "..", line)
                    }
                } else {
                    Token::new(TokenKind::Dot, ".", line)
                }
            }
            '+' => self.with_equal(TokenKind::Plus, TokenKind::PlusEqual, "+", line),
            '-' => self.with_equal(TokenKind::Minus, TokenKind::MinusEqual, "-", line),
            '*' => {
                if self.matches('*') {
                    self.with_equal(TokenKind::StarStar, TokenKind::StarStarEqual, "**", line)
                } else {
                    self.with_equal(TokenKind::Star, TokenKind::StarEqual, "*", line)
                }
            }
            '/' => {
                if self.matches('/') {
                    self.with_equal(TokenKind::SlashSlash, TokenKind::SlashSlashEqual, "//", line)
                } else {
                    self.with_equal(TokenKind::Slash, TokenKind::SlashEqual, "/", line)
                }
            }
            '%' => self.with_equal(TokenKind::Percent, TokenKind::PercentEqual, "%", line),
            '&' => self.with_equal(TokenKind::Amp, TokenKind::AmpEqual, "&", line),
            '|' => self.with_equal(TokenKind::Pipe, TokenKind::PipeEqual, "|", line),
            '^' => self.with_equal(TokenKind::Caret, TokenKind::CaretEqual, "^", line),
            '~' => Token::new(TokenKind::Tilde, "~", line),
            '!' => self.with_equal(TokenKind::Bang, TokenKind::BangEqual, "!", line),
            '=' => self.with_equal(TokenKind::Equal, TokenKind::EqualEqual, "=", line),
            '?' => {
                if self.matches('?') {
                    Token::new(TokenKind::QuestionQuestion, "??", line)
                } else {
                    Token::new(TokenKind::Error, "unexpected character '?'", line)
                }
            }
            '<' => {
                if self.matches('<') {
                    self.with_equal(TokenKind::LessLess, TokenKind::LessLessEqual, "<<", line)
                } else {
                    self.with_equal(TokenKind::Less, TokenKind::LessEqual, "<", line)
                }
            }
            '>' => {
                if self.matches('>') {
                    if self.matches('>') {
                        Token::new(TokenKind::GreaterGreaterGreater, ">>>", line)
                    } else {
                        self.with_equal(
                            TokenKind::GreaterGreater,
                            TokenKind::GreaterGreaterEqual,
                            ">>",
                            line,
                        )
                    }
                } else {
                    self.with_equal(TokenKind::Greater, TokenKind::GreaterEqual, ">", line)
                }
            }
            '\'' | '"' => self.scan_string(c, false),
            'r' if self.peek_is_quote() => {
                let quote = self.advance().unwrap();
                self.scan_string(quote, true)
            }
            'b' if self.peek_is_quote() => {
                let quote = self.advance().unwrap();
                self.scan_bytes(quote)
            }
            c if c.is_ascii_digit() => self.scan_number(c),
            c if is_identifier_start(c) => self.scan_identifier(c),
            other => Token::new(
                TokenKind::Error,
                format!("unexpected character '{}'", other),
                line,
            ),
        }
    }

    // -----------------------------------------------------------------------
    // Whitespace, comments, newlines
    // -----------------------------------------------------------------------

    /// Skip whitespace and comments; emit a single Newline token for a run
    /// of line breaks at group depth zero.
    fn skip_blanks(&mut self) -> Option<Token> {
        let mut saw_newline = false;
        let mut newline_line = self.line;
        loop {
            match self.peek() {
                Some(' ') | Some('\t') | Some('\r') => {
                    self.advance();
                }
                Some('\n') => {
                    if !saw_newline {
                        newline_line = self.line;
                    }
                    saw_newline = true;
                    self.line += 1;
                    self.advance();
                }
                Some('#') => {
                    while let Some(c) = self.peek() {
                        if c == '\n' {
                            break;
                        }
                        self.advance();
                    }
                }
                Some('/') if self.peek_second() == Some('*') => {
                    self.advance();
                    self.advance();
                    loop {
                        match self.advance() {
                            Some('*') if self.peek() == Some('/') => {
                                self.advance();
                                break;
                            }
                            Some('\n') => self.line += 1,
                            Some(_) => {}
                            None => break,
                        }
                    }
                }
                _ => break,
            }
        }
        if saw_newline && self.group_depth == 0 {
            return Some(Token::new(TokenKind::Newline, "\\n", newline_line));
        }
        None
    }

    // -----------------------------------------------------------------------
    // Literals
    // -----------------------------------------------------------------------

    fn scan_number(&mut self, first: char) -> Token {
        let line = self.line;
        let mut text = String::new();
        text.push(first);

        if first == '0' {
            match self.peek() {
                Some('x') | Some('X') => return self.scan_radix(16, line),
                Some('b') | Some('B') => return self.scan_radix(2, line),
                Some('o') | Some('O') => return self.scan_radix(8, line),
                _ => {}
            }
        }

        self.digits_into(&mut text);
        if self.peek() == Some('.') && self.peek_second().is_some_and(|c| c.is_ascii_digit()) {
            text.push('.');
            self.advance();
            self.digits_into(&mut text);
        }
        if matches!(self.peek(), Some('e') | Some('E')) {
            let mark = self.current;
            self.advance();
            let mut exp = String::from("e");
            if matches!(self.peek(), Some('+') | Some('-')) {
                exp.push(self.advance().unwrap());
            }
            if self.peek().is_some_and(|c| c.is_ascii_digit()) {
                self.digits_into(&mut exp);
                text.push_str(&exp);
            } else {
                // Not an exponent after all; `1e` starts an identifier.
                self.current = mark;
            }
        }
        Token::new(TokenKind::Number, text, line)
    }

    fn scan_radix(&mut self, radix: u32, line: u32) -> Token {
        let prefix = self.advance().unwrap(); // consume x/b/o
        let mut text = String::from("0");
        text.push(prefix);
        let mut any = false;
        while let Some(c) = self.peek() {
            if c == '_' {
                self.advance();
                continue;
            }
            if c.is_digit(radix) {
                any = true;
                text.push(c);
                self.advance();
            } else {
                break;
            }
        }
        if !any {
            return Token::new(TokenKind::Error, "malformed number literal", line);
        }
        Token::new(TokenKind::Number, text, line)
    }

    fn digits_into(&mut self, text: &mut String) {
        while let Some(c) = self.peek() {
            if c == '_' {
                self.advance();
                continue;
            }
            if c.is_ascii_digit() {
                text.push(c);
                self.advance();
            } else {
                break;
            }
        }
    }

    /// Scan a (possibly resumed) string literal. Returns `InterpolChunk`
    /// when hitting `${`, `String` at the closing quote.
    fn scan_string(&mut self, quote: char, raw: bool) -> Token {
        let line = self.line;
        let mut text = String::new();
        loop {
            let Some(c) = self.advance() else {
                return Token::new(TokenKind::Error, "unterminated string", line);
            };
            if c == quote {
                return Token::new(TokenKind::String, text, line);
            }
            match c {
                '\n' => {
                    self.line += 1;
                    text.push('\n');
                }
                '$' if !raw && self.peek() == Some('{') => {
                    self.advance();
                    self.interp.push(InterpFrame {
                        quote,
                        brace_depth: 0,
                    });
                    return Token::new(TokenKind::InterpolChunk, text, line);
                }
                '\\' if !raw => match self.scan_escape() {
                    Ok(decoded) => text.push(decoded),
                    Err(message) => return Token::new(TokenKind::Error, message, line),
                },
                other => text.push(other),
            }
        }
    }

    /// Byte strings carry their raw inner text; escapes are decoded later
    /// by [`decode_bytes`] because they may produce non-UTF-8 bytes.
    fn scan_bytes(&mut self, quote: char) -> Token {
        let line = self.line;
        let mut text = String::new();
        loop {
            let Some(c) = self.advance() else {
                return Token::new(TokenKind::Error, "unterminated byte string", line);
            };
            if c == quote {
                return Token::new(TokenKind::BytesString, text, line);
            }
            if c == '\\' {
                text.push('\\');
                if let Some(next) = self.advance() {
                    text.push(next);
                }
                continue;
            }
            if c == '\n' {
                self.line += 1;
            }
            text.push(c);
        }
    }

    fn scan_escape(&mut self) -> Result<char, String> {
        let Some(c) = self.advance() else {
            return Err("unterminated escape sequence".to_string());
        };
        Ok(match c {
            'n' => '\n',
            'r' => '\r',
            't' => '\t',
            '0' => '\0',
            'a' => '\x07',
            'b' => '\x08',
            'v' => '\x0b',
            'f' => '\x0c',
            'e' => '\x1b',
            '\\' => '\\',
            '\'' => '\'',
            '"' => '"',
            '$' => '$',
            'x' => {
                let hi = self.hex_digit()?;
                let lo = self.hex_digit()?;
                char::from_u32(hi * 16 + lo).ok_or("invalid \\x escape")?
            }
            'u' => {
                if self.advance() != Some('{') {
                    return Err("expected '{' after \\u".to_string());
                }
                let mut code: u32 = 0;
                let mut any = false;
                loop {
                    match self.advance() {
                        Some('}') => break,
                        Some(c) if c.is_ascii_hexdigit() => {
                            any = true;
                            code = code * 16 + c.to_digit(16).unwrap();
                        }
                        _ => return Err("malformed \\u{...} escape".to_string()),
                    }
                }
                if !any {
                    return Err("empty \\u{...} escape".to_string());
                }
                char::from_u32(code).ok_or("\\u{...} escape out of range")?
            }
            other => other,
        })
    }

    fn hex_digit(&mut self) -> Result<u32, String> {
        self.advance()
            .and_then(|c| c.to_digit(16))
            .ok_or_else(|| "expected hex digit in escape".to_string())
    }

    fn scan_identifier(&mut self, first: char) -> Token {
        let line = self.line;
        let mut text = String::new();
        text.push(first);
        while let Some(c) = self.peek() {
            if is_identifier_part(c) {
                text.push(c);
                self.advance();
            } else {
                break;
            }
        }
        let kind = keyword_kind(&text).unwrap_or(TokenKind::Identifier);
        Token::new(kind, text, line)
    }

    // -----------------------------------------------------------------------
    // Character helpers
    // -----------------------------------------------------------------------

    fn peek(&self) -> Option<char> {
        self.source[self.current..].chars().next()
    }

    fn peek_second(&self) -> Option<char> {
        let mut chars = self.source[self.current..].chars();
        chars.next();
        chars.next()
    }

    fn peek_is_quote(&self) -> bool {
        matches!(self.peek(), Some('\'') | Some('"'))
    }

    fn advance(&mut self) -> Option<char> {
        let c = self.peek()?;
        self.current += c.len_utf8();
        Some(c)
    }

    fn matches(&mut self, expected: char) -> bool {
        if self.peek() == Some(expected) {
            self.advance();
            true
        } else {
            false
        }
    }

    fn with_equal(&mut self, plain: TokenKind, with_eq: TokenKind, text: &str, line: u32) -> Token {
        if self.matches('=') {
            Token::new(with_eq, format!("{}=", text), line)
        } else {
            Token::new(plain, text, line)
        }
    }
}

fn is_identifier_start(c: char) -> bool {
    c == '_' || c.is_alphabetic()
}

fn is_identifier_part(c: char) -> bool {
    c == '_' || c.is_alphanumeric()
}

fn keyword_kind(text: &str) -> Option<TokenKind> {
    Some(match text {
        "and" => TokenKind::And,
        "as" => TokenKind::As,
        "break" => TokenKind::Break,
        "catch" => TokenKind::Catch,
        "class" => TokenKind::Class,
        "continue" => TokenKind::Continue,
        "def" => TokenKind::Def,
        "do" => TokenKind::Do,
        "echo" => TokenKind::Echo,
        "else" => TokenKind::Else,
        "false" => TokenKind::False,
        "finally" => TokenKind::Finally,
        "for" => TokenKind::For,
        "if" => TokenKind::If,
        "import" => TokenKind::Import,
        "in" => TokenKind::In,
        "loop" => TokenKind::Loop,
        "new" => TokenKind::New,
        "nil" => TokenKind::Nil,
        "or" => TokenKind::Or,
        "parent" => TokenKind::Parent,
        "raise" => TokenKind::Raise,
        "return" => TokenKind::Return,
        "self" => TokenKind::SelfKw,
        "static" => TokenKind::Static,
        "true" => TokenKind::True,
        "try" => TokenKind::Try,
        "var" => TokenKind::Var,
        "while" => TokenKind::While,
        _ => return None,
    })
}

/// Decode the raw inner text of a byte-string literal.
pub fn decode_bytes(raw: &str) -> Vec<u8> {
    let mut out = Vec::with_capacity(raw.len());
    let mut chars = raw.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            let mut buf = [0u8; 4];
            out.extend_from_slice(c.encode_utf8(&mut buf).as_bytes());
            continue;
        }
        match chars.next() {
            Some('n') => out.push(b'\n'),
            Some('r') => out.push(b'\r'),
            Some('t') => out.push(b'\t'),
            Some('0') => out.push(0),
            Some('\\') => out.push(b'\\'),
            Some('\'') => out.push(b'\''),
            Some('"') => out.push(b'"'),
            Some('x') => {
                let hi = chars.next().and_then(|c| c.to_digit(16)).unwrap_or(0);
                let lo = chars.next().and_then(|c| c.to_digit(16)).unwrap_or(0);
                out.push((hi * 16 + lo) as u8);
            }
            Some(other) => {
                let mut buf = [0u8; 4];
                out.extend_from_slice(other.encode_utf8(&mut buf).as_bytes());
            }
            None => {}
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kinds(source: &str) -> Vec<TokenKind> {
        let mut scanner = Scanner::new(source);
        let mut out = Vec::new();
        loop {
            let token = scanner.next_token();
            let kind = token.kind;
            out.push(kind);
            if kind == TokenKind::Eof {
                return out;
            }
        }
    }

    #[test]
    fn scans_arithmetic_expression() {
        assert_eq!(
            kinds("2 + 3 * 4"),
            vec![
                TokenKind::Number,
                TokenKind::Plus,
                TokenKind::Number,
                TokenKind::Star,
                TokenKind::Number,
                TokenKind::Eof,
            ]
        );
    }

    #[test]
    fn number_bases_and_separators() {
        let mut scanner = Scanner::new("0xff 0b1010 0o17 1_000_000 2.5e3");
        assert_eq!(scanner.next_token().lexeme, "0xff");
        assert_eq!(scanner.next_token().lexeme, "0b1010");
        assert_eq!(scanner.next_token().lexeme, "0o17");
        assert_eq!(scanner.next_token().lexeme, "1000000");
        assert_eq!(scanner.next_token().lexeme, "2.5e3");
    }

    #[test]
    fn newlines_collapse_and_hide_inside_groups() {
        assert_eq!(
            kinds("a\n\n\nb"),
            vec![
                TokenKind::Identifier,
                TokenKind::Newline,
                TokenKind::Identifier,
                TokenKind::Eof,
            ]
        );
        assert_eq!(
            kinds("f(\n1,\n2\n)"),
            vec![
                TokenKind::Identifier,
                TokenKind::LeftParen,
                TokenKind::Number,
                TokenKind::Comma,
                TokenKind::Number,
                TokenKind::RightParen,
                TokenKind::Eof,
            ]
        );
    }

    #[test]
    fn string_escapes_decode() {
        let mut scanner = Scanner::new(r#"'a\tb\u{41}\x21'"#);
        let token = scanner.next_token();
        assert_eq!(token.kind, TokenKind::String);
        assert_eq!(token.lexeme, "a\tbA!");
    }

    #[test]
    fn raw_strings_keep_backslashes() {
        let mut scanner = Scanner::new(r"r'a\nb'");
        let token = scanner.next_token();
        assert_eq!(token.kind, TokenKind::String);
        assert_eq!(token.lexeme, "a\\nb");
    }

    #[test]
    fn interpolation_splits_into_chunks() {
        let mut scanner = Scanner::new("'${a}!'");
        let first = scanner.next_token();
        assert_eq!(first.kind, TokenKind::InterpolChunk);
        assert_eq!(first.lexeme, "");
        let ident = scanner.next_token();
        assert_eq!(ident.kind, TokenKind::Identifier);
        assert_eq!(ident.lexeme, "a");
        let tail = scanner.next_token();
        assert_eq!(tail.kind, TokenKind::String);
        assert_eq!(tail.lexeme, "!");
    }

    #[test]
    fn interpolation_tolerates_nested_braces() {
        let mut scanner = Scanner::new("'${ {'k': 1} }x'");
        assert_eq!(scanner.next_token().kind, TokenKind::InterpolChunk);
        assert_eq!(scanner.next_token().kind, TokenKind::LeftBrace);
        assert_eq!(scanner.next_token().kind, TokenKind::String); // 'k'
        assert_eq!(scanner.next_token().kind, TokenKind::Colon);
        assert_eq!(scanner.next_token().kind, TokenKind::Number);
        assert_eq!(scanner.next_token().kind, TokenKind::RightBrace);
        let tail = scanner.next_token();
        assert_eq!(tail.kind, TokenKind::String);
        assert_eq!(tail.lexeme, "x");
    }

    #[test]
    fn byte_strings_decode_hex_escapes() {
        let mut scanner = Scanner::new(r"b'\xff\x00a'");
        let token = scanner.next_token();
        assert_eq!(token.kind, TokenKind::BytesString);
        assert_eq!(decode_bytes(&token.lexeme), vec![0xff, 0x00, b'a']);
    }

    #[test]
    fn comments_are_invisible() {
        assert_eq!(
            kinds("1 # trailing\n/* block\ncomment */ 2"),
            vec![
                TokenKind::Number,
                TokenKind::Newline,
                TokenKind::Number,
                TokenKind::Eof,
            ]
        );
    }

    #[test]
    fn keywords_resolve() {
        assert_eq!(
            kinds("class def var self parent"),
            vec![
                TokenKind::Class,
                TokenKind::Def,
                TokenKind::Var,
                TokenKind::SelfKw,
                TokenKind::Parent,
                TokenKind::Eof,
            ]
        );
    }
}
