//! Remote platform properties.
//!
//! Properties are written in protobuf text form, for example
//!
//! ```text
//! properties { name: "OSFamily" value: "Linux" }
//! properties: < name: "container-image" value: "docker://gcr.io/img" >
//! ```

use crate::spawn::PlatformInfo;
use remex_proto::{Platform, Property};
use std::iter::Peekable;
use std::str::CharIndices;

/// Syntax error in platform text, with a 1-based position
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{line}:{column}: {message}")]
pub struct TextParseError {
    /// Line
    pub line: usize,
    /// Column
    pub column: usize,
    /// What went wrong
    pub message: String,
}

/// Platform properties could not be parsed
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PlatformParseError {
    /// The execution platform's properties are malformed
    #[error("Failed to parse remote_execution_properties from platform {label}")]
    Platform {
        /// Platform label
        label: String,
        /// Syntax error
        #[source]
        source: TextParseError,
    },
    /// The configured default properties are malformed
    #[error("Failed to parse default platform properties {properties}")]
    Default {
        /// The configured text
        properties: String,
        /// Syntax error
        #[source]
        source: TextParseError,
    },
}

impl PlatformParseError {
    /// The underlying syntax error
    #[must_use]
    pub const fn parse_error(&self) -> &TextParseError {
        match self {
            Self::Platform { source, .. } | Self::Default { source, .. } => source,
        }
    }
}

/// Resolve the platform of a spawn
///
/// The execution platform's properties win when present and non-empty;
/// otherwise the configured default is used. Returns `None` when there is
/// neither an execution platform nor a default. Properties are stably
/// sorted by name.
///
/// # Errors
///
/// Returns error if the chosen text does not parse
pub fn parse_platform(
    execution_platform: Option<&PlatformInfo>,
    default_properties: &str,
) -> Result<Option<Platform>, PlatformParseError> {
    if execution_platform.is_none() && default_properties.is_empty() {
        return Ok(None);
    }

    let properties = match execution_platform {
        Some(info) if !info.remote_execution_properties.is_empty() => {
            parse_platform_text(&info.remote_execution_properties).map_err(|source| {
                PlatformParseError::Platform {
                    label: info.label.clone(),
                    source,
                }
            })?
        }
        _ if !default_properties.is_empty() => {
            parse_platform_text(default_properties).map_err(|source| PlatformParseError::Default {
                properties: default_properties.to_string(),
                source,
            })?
        }
        _ => Vec::new(),
    };
    Ok(Some(Platform::new(properties)))
}

/// Parse `properties` entries from protobuf text form, in source order
///
/// # Errors
///
/// Returns error on a syntax error or an unknown field
pub fn parse_platform_text(text: &str) -> Result<Vec<Property>, TextParseError> {
    let mut parser = Parser {
        lexer: Lexer::new(text),
        peeked: None,
    };
    let mut properties = Vec::new();
    while !parser.at_end()? {
        let (field, pos) = parser.expect_ident()?;
        if field != "properties" {
            return Err(pos.error(format!("Unknown field \"{field}\" in Platform")));
        }
        parser.eat(&Tok::Colon)?;
        if parser.eat(&Tok::LBracket)? {
            if !parser.eat(&Tok::RBracket)? {
                loop {
                    properties.push(parser.property()?);
                    if parser.eat(&Tok::RBracket)? {
                        break;
                    }
                    parser.expect(&Tok::Comma)?;
                }
            }
        } else {
            properties.push(parser.property()?);
        }
        parser.separator()?;
    }
    Ok(properties)
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Tok {
    Ident(String),
    Str(String),
    Colon,
    Comma,
    Semi,
    LBrace,
    RBrace,
    LAngle,
    RAngle,
    LBracket,
    RBracket,
}

impl Tok {
    fn describe(&self) -> String {
        match self {
            Self::Ident(s) => format!("identifier \"{s}\""),
            Self::Str(_) => "string".to_string(),
            Self::Colon => "':'".to_string(),
            Self::Comma => "','".to_string(),
            Self::Semi => "';'".to_string(),
            Self::LBrace => "'{'".to_string(),
            Self::RBrace => "'}'".to_string(),
            Self::LAngle => "'<'".to_string(),
            Self::RAngle => "'>'".to_string(),
            Self::LBracket => "'['".to_string(),
            Self::RBracket => "']'".to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Pos {
    line: usize,
    column: usize,
}

impl Pos {
    fn error(self, message: impl Into<String>) -> TextParseError {
        TextParseError {
            line: self.line,
            column: self.column,
            message: message.into(),
        }
    }
}

struct Lexer<'a> {
    chars: Peekable<CharIndices<'a>>,
    pos: Pos,
}

impl<'a> Lexer<'a> {
    fn new(text: &'a str) -> Self {
        Self {
            chars: text.char_indices().peekable(),
            pos: Pos { line: 1, column: 1 },
        }
    }

    fn bump(&mut self) -> Option<char> {
        let (_, c) = self.chars.next()?;
        if c == '\n' {
            self.pos.line += 1;
            self.pos.column = 1;
        } else {
            self.pos.column += 1;
        }
        Some(c)
    }

    fn peek_char(&mut self) -> Option<char> {
        self.chars.peek().map(|&(_, c)| c)
    }

    fn skip_trivia(&mut self) {
        while let Some(c) = self.peek_char() {
            if c.is_whitespace() {
                self.bump();
            } else if c == '#' {
                while let Some(c) = self.bump() {
                    if c == '\n' {
                        break;
                    }
                }
            } else {
                break;
            }
        }
    }

    fn next_token(&mut self) -> Result<Option<(Tok, Pos)>, TextParseError> {
        self.skip_trivia();
        let start = self.pos;
        let Some(c) = self.peek_char() else {
            return Ok(None);
        };
        let tok = match c {
            ':' | ',' | ';' | '{' | '}' | '<' | '>' | '[' | ']' => {
                self.bump();
                match c {
                    ':' => Tok::Colon,
                    ',' => Tok::Comma,
                    ';' => Tok::Semi,
                    '{' => Tok::LBrace,
                    '}' => Tok::RBrace,
                    '<' => Tok::LAngle,
                    '>' => Tok::RAngle,
                    '[' => Tok::LBracket,
                    _ => Tok::RBracket,
                }
            }
            '"' | '\'' => Tok::Str(self.string(start)?),
            c if c.is_ascii_alphabetic() || c == '_' => {
                let mut ident = String::new();
                while let Some(c) = self.peek_char() {
                    if c.is_ascii_alphanumeric() || c == '_' {
                        ident.push(c);
                        self.bump();
                    } else {
                        break;
                    }
                }
                Tok::Ident(ident)
            }
            other => return Err(start.error(format!("Unexpected character '{other}'"))),
        };
        Ok(Some((tok, start)))
    }

    fn string(&mut self, start: Pos) -> Result<String, TextParseError> {
        let quote = self.bump().ok_or_else(|| start.error("Expected string"))?;
        let mut out = String::new();
        loop {
            let esc_pos = self.pos;
            match self.bump() {
                None | Some('\n') => return Err(start.error("Unterminated string")),
                Some(c) if c == quote => return Ok(out),
                Some('\\') => out.push(self.escape(esc_pos)?),
                Some(c) => out.push(c),
            }
        }
    }

    fn escape(&mut self, pos: Pos) -> Result<char, TextParseError> {
        let c = self.bump().ok_or_else(|| pos.error("Unterminated escape"))?;
        let simple = match c {
            'n' => Some('\n'),
            't' => Some('\t'),
            'r' => Some('\r'),
            'a' => Some('\u{7}'),
            'b' => Some('\u{8}'),
            'f' => Some('\u{c}'),
            'v' => Some('\u{b}'),
            '\\' => Some('\\'),
            '\'' => Some('\''),
            '"' => Some('"'),
            '?' => Some('?'),
            _ => None,
        };
        if let Some(ch) = simple {
            return Ok(ch);
        }
        let (radix, first, max_len) = match c {
            'x' | 'X' => (16, None, 2),
            '0'..='7' => (8, Some(c), 3),
            _ => return Err(pos.error(format!("Invalid escape sequence '\\{c}'"))),
        };
        let mut digits = String::new();
        if let Some(d) = first {
            digits.push(d);
        }
        while digits.len() < max_len {
            match self.peek_char() {
                Some(d) if d.is_digit(radix) => {
                    digits.push(d);
                    self.bump();
                }
                _ => break,
            }
        }
        let value = u32::from_str_radix(&digits, radix)
            .map_err(|_| pos.error("Invalid numeric escape"))?;
        char::from_u32(value).ok_or_else(|| pos.error("Invalid numeric escape"))
    }
}

struct Parser<'a> {
    lexer: Lexer<'a>,
    peeked: Option<(Tok, Pos)>,
}

impl Parser<'_> {
    fn peek(&mut self) -> Result<Option<&(Tok, Pos)>, TextParseError> {
        if self.peeked.is_none() {
            self.peeked = self.lexer.next_token()?;
        }
        Ok(self.peeked.as_ref())
    }

    fn at_end(&mut self) -> Result<bool, TextParseError> {
        let end = self.peek()?.is_none();
        Ok(end)
    }

    fn next(&mut self) -> Result<Option<(Tok, Pos)>, TextParseError> {
        self.peek()?;
        Ok(self.peeked.take())
    }

    fn end_pos(&self) -> Pos {
        self.lexer.pos
    }

    fn eat(&mut self, tok: &Tok) -> Result<bool, TextParseError> {
        let found = matches!(self.peek()?, Some((t, _)) if t == tok);
        if found {
            self.peeked = None;
        }
        Ok(found)
    }

    fn expect(&mut self, tok: &Tok) -> Result<(), TextParseError> {
        match self.next()? {
            Some((t, _)) if &t == tok => Ok(()),
            Some((t, pos)) => Err(pos.error(format!("Expected {}, got {}", tok.describe(), t.describe()))),
            None => Err(self.end_pos().error(format!("Expected {}, got end of input", tok.describe()))),
        }
    }

    fn expect_ident(&mut self) -> Result<(String, Pos), TextParseError> {
        match self.next()? {
            Some((Tok::Ident(s), pos)) => Ok((s, pos)),
            Some((t, pos)) => Err(pos.error(format!("Expected field name, got {}", t.describe()))),
            None => Err(self.end_pos().error("Expected field name, got end of input")),
        }
    }

    fn separator(&mut self) -> Result<(), TextParseError> {
        if !self.eat(&Tok::Comma)? {
            self.eat(&Tok::Semi)?;
        }
        Ok(())
    }

    fn string_value(&mut self) -> Result<String, TextParseError> {
        let mut out = match self.next()? {
            Some((Tok::Str(s), _)) => s,
            Some((t, pos)) => return Err(pos.error(format!("Expected string, got {}", t.describe()))),
            None => return Err(self.end_pos().error("Expected string, got end of input")),
        };
        // Adjacent literals concatenate.
        loop {
            let more = matches!(self.peek()?, Some((Tok::Str(_), _)));
            if !more {
                break;
            }
            if let Some((Tok::Str(s), _)) = self.next()? {
                out.push_str(&s);
            }
        }
        Ok(out)
    }

    fn property(&mut self) -> Result<Property, TextParseError> {
        let close = match self.next()? {
            Some((Tok::LBrace, _)) => Tok::RBrace,
            Some((Tok::LAngle, _)) => Tok::RAngle,
            Some((t, pos)) => return Err(pos.error(format!("Expected '{{' or '<', got {}", t.describe()))),
            None => return Err(self.end_pos().error("Expected '{' or '<', got end of input")),
        };

        let mut name: Option<String> = None;
        let mut value: Option<String> = None;
        while !self.eat(&close)? {
            let (field, pos) = self.expect_ident()?;
            self.expect(&Tok::Colon)?;
            let text = self.string_value()?;
            let slot = match field.as_str() {
                "name" => &mut name,
                "value" => &mut value,
                _ => return Err(pos.error(format!("Unknown field \"{field}\" in Property"))),
            };
            if slot.is_some() {
                return Err(pos.error(format!("Field \"{field}\" is specified multiple times")));
            }
            *slot = Some(text);
            self.separator()?;
        }
        Ok(Property::new(name.unwrap_or_default(), value.unwrap_or_default()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_basic() {
        let props = parse_platform_text(
            r#"properties { name: "OSFamily" value: "Linux" }
               properties: < name: 'arch', value: "x86_64" >;"#,
        )
        .unwrap();
        assert_eq!(
            props,
            vec![Property::new("OSFamily", "Linux"), Property::new("arch", "x86_64")]
        );
    }

    #[test]
    fn test_parse_list_comments_and_escapes() {
        let props = parse_platform_text(
            "# container\nproperties: [ { name: \"img\" value: \"docker://a\\tb\" \"\\x41\\101\" }, {name: \"z\"} ]",
        )
        .unwrap();
        assert_eq!(props[0], Property::new("img", "docker://a\tbAA"));
        assert_eq!(props[1], Property::new("z", ""));
    }

    #[test]
    fn test_parse_empty_text() {
        assert!(parse_platform_text("  # nothing\n").unwrap().is_empty());
    }

    #[test]
    fn test_unknown_field_reports_position() {
        let err = parse_platform_text("properties {\n  nmae: \"x\" }").unwrap_err();
        assert_eq!((err.line, err.column), (2, 3));
        assert!(err.message.contains("nmae"));
    }

    #[test]
    fn test_syntax_errors() {
        assert!(parse_platform_text("properties { name: \"x\"").is_err());
        assert!(parse_platform_text("properties { name \"x\" }").is_err());
        assert!(parse_platform_text("properties { name: \"x }").is_err());
        assert!(parse_platform_text("properties { name: \"a\" name: \"b\" }").is_err());
        assert!(parse_platform_text("properties = {}").is_err());
    }

    #[test]
    fn test_none_without_platform_or_default() {
        assert_eq!(parse_platform(None, "").unwrap(), None);
    }

    #[test]
    fn test_execution_platform_wins_and_sorts() {
        let info = PlatformInfo::new(
            "//platforms:linux",
            r#"properties { name: "b" value: "1" } properties { name: "a" value: "2" }"#,
        );
        let platform = parse_platform(Some(&info), r#"properties { name: "default" value: "x" }"#)
            .unwrap()
            .unwrap();
        let names: Vec<_> = platform.properties.iter().map(|p| p.name.as_str()).collect();
        assert_eq!(names, ["a", "b"]);
    }

    #[test]
    fn test_default_used_when_platform_has_no_properties() {
        let info = PlatformInfo::new("//platforms:host", "");
        let platform = parse_platform(Some(&info), r#"properties { name: "pool" value: "big" }"#)
            .unwrap()
            .unwrap();
        assert_eq!(platform.properties, vec![Property::new("pool", "big")]);

        let empty = parse_platform(Some(&info), "").unwrap().unwrap();
        assert!(empty.is_empty());
    }

    #[test]
    fn test_errors_name_their_source() {
        let info = PlatformInfo::new("//platforms:bad", "properties {");
        let err = parse_platform(Some(&info), "").unwrap_err();
        assert!(err.to_string().contains("//platforms:bad"));

        let err = parse_platform(None, "garbage!").unwrap_err();
        assert!(matches!(err, PlatformParseError::Default { .. }));
        assert!(err.to_string().contains("garbage!"));
    }
}
