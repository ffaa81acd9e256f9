//! Quote-aware splitting of one line of GRUB script.
//!
//! This only understands as much of the GRUB shell grammar as `custom.cfg`
//! entries need: bare words, double-quoted strings with backslash escapes,
//! braces, and a trailing `#` comment.

/// A lexical token from one line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Token {
    /// An unquoted word
    Word(String),
    /// The unescaped contents of a double-quoted string
    Quoted(String),
    /// `{`
    OpenBrace,
    /// `}`
    CloseBrace,
    /// Everything after a `#` that starts a word, up to the end of the line
    Comment(String),
}

/// Errors from [`tokenize`]. Columns are 1-based byte offsets.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TokenizeError {
    /// A `"` was never closed.
    #[error("unterminated quote starting at column {0}")]
    UnterminatedQuote(usize),
    /// A character that cannot appear at this position.
    #[error("unexpected {ch:?} at column {column}")]
    Unexpected {
        /// The character
        ch: char,
        /// Where it was found
        column: usize,
    },
    /// A `\` at the very end of the line.
    #[error("dangling escape at end of line")]
    DanglingEscape,
}

#[derive(Debug, Clone, Copy)]
enum State {
    Normal,
    InQuotes { start: usize },
    Escape { start: usize },
    // Just closed a quote; only a separator may follow.
    AfterQuote,
}

fn flush_word(tokens: &mut Vec<Token>, word: &mut String) {
    if !word.is_empty() {
        tokens.push(Token::Word(std::mem::take(word)));
    }
}

/// Split `line` into tokens, honoring double quotes.
pub fn tokenize(line: &str) -> Result<Vec<Token>, TokenizeError> {
    let mut tokens = Vec::new();
    let mut word = String::new();
    let mut state = State::Normal;
    let mut chars = line.char_indices();

    while let Some((idx, c)) = chars.next() {
        let column = idx + 1;
        state = match state {
            State::Normal | State::AfterQuote if c.is_whitespace() => {
                flush_word(&mut tokens, &mut word);
                State::Normal
            }
            State::Normal | State::AfterQuote if c == '{' || c == '}' => {
                flush_word(&mut tokens, &mut word);
                tokens.push(if c == '{' {
                    Token::OpenBrace
                } else {
                    Token::CloseBrace
                });
                State::Normal
            }
            State::AfterQuote => return Err(TokenizeError::Unexpected { ch: c, column }),
            State::Normal => match c {
                '#' if word.is_empty() => {
                    let comment = line[idx + 1..].trim_end_matches(['\r', '\n']);
                    tokens.push(Token::Comment(comment.to_owned()));
                    return Ok(tokens);
                }
                '"' if word.is_empty() => State::InQuotes { start: column },
                '"' => return Err(TokenizeError::Unexpected { ch: c, column }),
                '\\' => {
                    let (_, next) = chars.next().ok_or(TokenizeError::DanglingEscape)?;
                    word.push(next);
                    State::Normal
                }
                c => {
                    word.push(c);
                    State::Normal
                }
            },
            State::InQuotes { start } => match c {
                '"' => {
                    tokens.push(Token::Quoted(std::mem::take(&mut word)));
                    State::AfterQuote
                }
                '\\' => State::Escape { start },
                c => {
                    word.push(c);
                    State::InQuotes { start }
                }
            },
            State::Escape { start } => {
                // Inside double quotes GRUB only treats these as escapable
                if !matches!(c, '"' | '\\' | '$') {
                    word.push('\\');
                }
                word.push(c);
                State::InQuotes { start }
            }
        };
    }

    match state {
        State::InQuotes { start } | State::Escape { start } => {
            Err(TokenizeError::UnterminatedQuote(start))
        }
        State::Normal | State::AfterQuote => {
            flush_word(&mut tokens, &mut word);
            Ok(tokens)
        }
    }
}

/// Quote `s` so that [`tokenize`] yields it back as a single
/// [`Token::Quoted`].
///
/// GRUB expands `$` and honors backslash escapes inside double quotes, so
/// `"`, `\` and `$` are escaped. Any other value is emitted verbatim
/// between the quotes. A literal `"/a\"` is therefore an unterminated
/// string, as it is to GRUB; the value `/a\` is written as `"/a\\"`.
pub fn quote(s: &str) -> String {
    let mut out = String::with_capacity(s.len() + 2);
    out.push('"');
    for c in s.chars() {
        if matches!(c, '"' | '\\' | '$') {
            out.push('\\');
        }
        out.push(c);
    }
    out.push('"');
    out
}
