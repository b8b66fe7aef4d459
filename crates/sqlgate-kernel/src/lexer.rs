//! Minimal SQL tokenizer used by the validator.
//!
//! Comments are dropped and string literals collapse into a single token, so
//! structural checks never see text an engine would ignore or treat as data.

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Token {
    /// Bare or quoted identifier, keyword or number. Dotted names are joined
    /// (`"bank"."satislar"` becomes `bank.satislar`).
    Word { text: String, quoted: bool },
    /// A `'...'` literal.
    Literal,
    /// Any other single character: parentheses, comma, semicolon, operators.
    Punct(char),
}

impl Token {
    /// True for an unquoted word equal to `keyword`, ignoring case.
    pub fn is_keyword(&self, keyword: &str) -> bool {
        matches!(self, Token::Word { text, quoted: false } if text.eq_ignore_ascii_case(keyword))
    }

    pub fn is_punct(&self, c: char) -> bool {
        matches!(self, Token::Punct(p) if *p == c)
    }

    pub fn word(&self) -> Option<&str> {
        match self {
            Token::Word { text, .. } => Some(text.as_str()),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Lexed {
    pub tokens: Vec<Token>,
    /// A block comment, literal or quoted identifier ran to end of input.
    pub unterminated: bool,
    /// Byte offset of the first `;` outside comments and literals.
    pub terminator: Option<usize>,
}

pub fn tokenize(sql: &str) -> Lexed {
    let (offsets, chars): (Vec<usize>, Vec<char>) = sql.char_indices().unzip();
    let mut out = Lexed::default();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        if c.is_whitespace() {
            i += 1;
        } else if c == '-' && chars.get(i + 1) == Some(&'-') {
            while i < chars.len() && chars[i] != '\n' {
                i += 1;
            }
        } else if c == '/' && chars.get(i + 1) == Some(&'*') {
            match find_pair(&chars, i + 2, '*', '/') {
                Some(end) => i = end + 2,
                None => {
                    out.unterminated = true;
                    i = chars.len();
                }
            }
        } else if c == '\'' {
            match skip_quoted(&chars, i, '\'') {
                Some((_, next)) => i = next,
                None => {
                    out.unterminated = true;
                    i = chars.len();
                }
            }
            out.tokens.push(Token::Literal);
        } else if is_word_start(c) || matches!(c, '"' | '`' | '[') {
            let Some((text, quoted, next)) = read_name(&chars, i) else {
                out.unterminated = true;
                break;
            };
            out.tokens.push(Token::Word { text, quoted });
            i = next;
        } else {
            if c == ';' && out.terminator.is_none() {
                out.terminator = Some(offsets[i]);
            }
            out.tokens.push(Token::Punct(c));
            i += 1;
        }
    }
    out
}

fn is_word_start(c: char) -> bool {
    c.is_alphanumeric() || c == '_'
}

fn find_pair(chars: &[char], from: usize, a: char, b: char) -> Option<usize> {
    (from..chars.len().saturating_sub(1)).find(|&k| chars[k] == a && chars[k + 1] == b)
}

/// Reads a quoted run starting at `start`; a doubled quote is an escaped quote.
/// Returns the unquoted text and the index after the closing quote.
fn skip_quoted(chars: &[char], start: usize, close: char) -> Option<(String, usize)> {
    let mut text = String::new();
    let mut k = start + 1;
    while k < chars.len() {
        if chars[k] == close {
            if close != ']' && chars.get(k + 1) == Some(&close) {
                text.push(close);
                k += 2;
                continue;
            }
            return Some((text, k + 1));
        }
        text.push(chars[k]);
        k += 1;
    }
    None
}

/// Reads one possibly dotted, possibly quoted name.
fn read_name(chars: &[char], start: usize) -> Option<(String, bool, usize)> {
    let mut text = String::new();
    let mut quoted = false;
    let mut k = start;
    loop {
        match chars.get(k) {
            Some('"') => {
                let (part, next) = skip_quoted(chars, k, '"')?;
                text.push_str(&part);
                quoted = true;
                k = next;
            }
            Some('`') => {
                let (part, next) = skip_quoted(chars, k, '`')?;
                text.push_str(&part);
                quoted = true;
                k = next;
            }
            Some('[') => {
                let (part, next) = skip_quoted(chars, k, ']')?;
                text.push_str(&part);
                quoted = true;
                k = next;
            }
            _ => {
                while k < chars.len() && is_word_start(chars[k]) {
                    text.push(chars[k]);
                    k += 1;
                }
            }
        }
        let continues = chars.get(k) == Some(&'.')
            && chars
                .get(k + 1)
                .is_some_and(|&n| is_word_start(n) || matches!(n, '"' | '`' | '['));
        if !continues {
            return Some((text, quoted, k));
        }
        text.push('.');
        k += 1;
    }
}
