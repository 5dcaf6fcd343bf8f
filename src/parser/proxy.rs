// SPDX-License-Identifier: MIT
// Copyright 2025. Triad National Security, LLC.

//! Parser for the DRBD proxy section.
//!
//! `drbdadm dump-xml` does not translate the proxy section into XML, so it arrives as plain
//! configuration text:
//!
//! ```text
//! proxy {
//!     memlimit 100M;
//!     plugin {
//!         zlib level 9;
//!     }
//! }
//! ```
//!
//! Top level statements are stored under their own name, statements inside the `plugin` block
//! are stored under `plugin-<name>`.

use std::{collections::BTreeMap, fmt, iter::Peekable};

use super::ConfigError;

pub const PLUGIN_PARAM_PREFIX: &str = "plugin-";

/// Value stored for a statement without arguments, e.g. `read-loadbalancing;`.
pub const FLAG_VALUE: &str = "yes";

#[derive(Debug, Clone, PartialEq, Eq)]
enum Token {
    Word(String),
    Open,
    Close,
    /// A `;`, possibly glued to the preceding word in the input.
    End,
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Token::Word(w) => write!(f, "{w}"),
            Token::Open => write!(f, "{{"),
            Token::Close => write!(f, "}}"),
            Token::End => write!(f, ";"),
        }
    }
}

/// Split the text on whitespace, breaking `{`, `}` and `;` out into their own tokens.
fn tokenize(text: &str) -> Vec<Token> {
    let mut tokens = Vec::new();
    let mut word = String::new();

    let flush = |word: &mut String, tokens: &mut Vec<Token>| {
        if !word.is_empty() {
            tokens.push(Token::Word(std::mem::take(word)));
        }
    };

    for c in text.chars() {
        match c {
            '{' => {
                flush(&mut word, &mut tokens);
                tokens.push(Token::Open);
            }
            '}' => {
                flush(&mut word, &mut tokens);
                tokens.push(Token::Close);
            }
            ';' => {
                flush(&mut word, &mut tokens);
                tokens.push(Token::End);
            }
            c if c.is_whitespace() => flush(&mut word, &mut tokens),
            c => word.push(c),
        }
    }
    flush(&mut word, &mut tokens);

    tokens
}

/// Key/value pairs of a parsed proxy section. Plugin keys carry the `plugin-` prefix.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProxyConfig {
    values: BTreeMap<String, String>,
}

impl ProxyConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse the first `proxy { ... }` section found in `text`.
    ///
    /// Returns `Ok(None)` if there is no proxy section. A malformed section is a hard failure and
    /// nothing of it is returned.
    pub fn parse(text: &str) -> Result<Option<Self>, ConfigError> {
        let mut config = Self::new();
        if parse_into(text, &mut config.values)? {
            Ok(Some(config))
        } else {
            Ok(None)
        }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(String::as_str)
    }

    pub fn plugin(&self, name: &str) -> Option<&str> {
        self.get(&format!("{PLUGIN_PARAM_PREFIX}{name}"))
    }

    pub fn insert(&mut self, key: &str, value: &str) {
        self.values.insert(key.to_string(), value.to_string());
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.values.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

/// Renders the section back into the text form accepted by [`ProxyConfig::parse`].
impl fmt::Display for ProxyConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let render = |f: &mut fmt::Formatter<'_>, indent: &str, key: &str, value: &str| {
            if value == FLAG_VALUE {
                writeln!(f, "{indent}{key};")
            } else {
                writeln!(f, "{indent}{key} {value};")
            }
        };

        writeln!(f, "proxy {{")?;
        for (key, value) in self.iter() {
            if !key.starts_with(PLUGIN_PARAM_PREFIX) {
                render(f, "    ", key, value)?;
            }
        }
        let mut plugins = self
            .iter()
            .filter_map(|(k, v)| k.strip_prefix(PLUGIN_PARAM_PREFIX).map(|k| (k, v)))
            .peekable();
        if plugins.peek().is_some() {
            writeln!(f, "    plugin {{")?;
            for (key, value) in plugins {
                render(f, "        ", key, value)?;
            }
            writeln!(f, "    }}")?;
        }
        write!(f, "}}")
    }
}

/// Parse the first proxy section in `text` into `values`.
///
/// Returns whether a proxy section was found. On error, `values` keeps every statement that was
/// terminated by `;` before the failure point; the failing statement itself is never stored.
pub fn parse_into(text: &str, values: &mut BTreeMap<String, String>) -> Result<bool, ConfigError> {
    let mut tokens = tokenize(text).into_iter().peekable();

    while let Some(token) = tokens.next() {
        if token == Token::Word("proxy".to_string()) {
            log::debug!("parsing proxy section: {text}");
            expect_open(&mut tokens, "proxy")?;
            parse_block(&mut tokens, "", "proxy", values)?;
            return Ok(true);
        }
    }

    Ok(false)
}

fn expect_open<I>(tokens: &mut Peekable<I>, section: &'static str) -> Result<(), ConfigError>
where
    I: Iterator<Item = Token>,
{
    match tokens.next() {
        Some(Token::Open) => Ok(()),
        Some(other) => Err(ConfigError::UnexpectedToken {
            section,
            found: other.to_string(),
            expected: "{",
        }),
        None => Err(ConfigError::Unterminated(section)),
    }
}

/// Parse statements until the closing `}` of the current block.
fn parse_block<I>(
    tokens: &mut Peekable<I>,
    prefix: &str,
    section: &'static str,
    values: &mut BTreeMap<String, String>,
) -> Result<(), ConfigError>
where
    I: Iterator<Item = Token>,
{
    loop {
        match tokens.next() {
            None => return Err(ConfigError::Unterminated(section)),
            Some(Token::Close) => return Ok(()),
            Some(Token::Word(word)) if word == "plugin" && prefix.is_empty() => {
                expect_open(tokens, "proxy plugin")?;
                parse_block(tokens, PLUGIN_PARAM_PREFIX, "proxy plugin", values)?;
            }
            Some(Token::Word(param)) => {
                let value = parse_statement_value(tokens, section)?;
                values.insert(format!("{prefix}{param}"), value);
            }
            Some(other) => {
                return Err(ConfigError::UnexpectedToken {
                    section,
                    found: other.to_string(),
                    expected: "statement",
                })
            }
        }
    }
}

/// Collect the words after a parameter name up to the terminating `;`.
fn parse_statement_value<I>(
    tokens: &mut Peekable<I>,
    section: &'static str,
) -> Result<String, ConfigError>
where
    I: Iterator<Item = Token>,
{
    let mut words: Vec<String> = Vec::new();
    loop {
        match tokens.next() {
            Some(Token::End) => break,
            Some(Token::Word(w)) => words.push(w),
            Some(other) => {
                return Err(ConfigError::UnexpectedToken {
                    section,
                    found: other.to_string(),
                    expected: ";",
                })
            }
            None => return Err(ConfigError::UnterminatedStatement(section)),
        }
    }

    if words.is_empty() {
        Ok(FLAG_VALUE.to_string())
    } else {
        Ok(words.join(" "))
    }
}
