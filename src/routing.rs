// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Routing Keys and Binding Patterns
//!
//! Routing keys are dot-separated word sequences attached to every published message.
//! Binding patterns use the same syntax plus two wildcards: `*` matches exactly one
//! word and `#` matches zero or more words. Matching works on whole words, never on
//! characters inside a word.

use crate::errors::AmqpError;
use std::{fmt, str::FromStr};

/// Separator between words of keys and patterns.
pub const WORD_SEPARATOR: char = '.';
/// Wildcard that matches exactly one word.
pub const SINGLE_WORD_WILDCARD: &str = "*";
/// Wildcard that matches zero or more words.
pub const MULTI_WORD_WILDCARD: &str = "#";

/// A parsed routing key: one or more non-empty literal words.
///
/// `*` and `#` carry no meaning inside a routing key; `order.*` is the two words
/// `order` and `*`, and only a pattern token `*` (or `#`) can select it.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RoutingKey {
    words: Vec<String>,
}

impl RoutingKey {
    /// Parses a dot-separated routing key.
    ///
    /// # Parameters
    /// * `raw` - The key as published, e.g. `order.created`
    ///
    /// # Returns
    /// The parsed key, or [`AmqpError::MalformedRoutingKey`] when the key is empty or
    /// has an empty word (leading, trailing or doubled separator)
    pub fn parse(raw: &str) -> Result<RoutingKey, AmqpError> {
        if raw.is_empty() {
            return Err(AmqpError::MalformedRoutingKey(raw.to_owned()));
        }

        let mut words = vec![];
        for word in raw.split(WORD_SEPARATOR) {
            if word.is_empty() {
                return Err(AmqpError::MalformedRoutingKey(raw.to_owned()));
            }
            words.push(word.to_owned());
        }

        Ok(RoutingKey { words })
    }

    /// The words of the key, in order.
    pub fn words(&self) -> &[String] {
        &self.words
    }
}

impl FromStr for RoutingKey {
    type Err = AmqpError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        RoutingKey::parse(s)
    }
}

impl fmt::Display for RoutingKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.words.join("."))
    }
}

/// A single token of a binding pattern.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum PatternToken {
    Literal(String),
    /// `*`
    AnyWord,
    /// `#`
    AnyWords,
}

/// A parsed binding pattern.
///
/// Runs of consecutive `#` tokens are collapsed while parsing since `#.#` matches
/// exactly what `#` matches.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BindingPattern {
    raw: String,
    tokens: Vec<PatternToken>,
}

impl BindingPattern {
    /// Parses a dot-separated binding pattern.
    ///
    /// The empty pattern is accepted and matches nothing, since no routing key is empty.
    ///
    /// # Parameters
    /// * `raw` - The pattern text, e.g. `order.*` or `#.failed`
    ///
    /// # Returns
    /// The parsed pattern, or [`AmqpError::MalformedPattern`] for empty words and
    /// words mixing wildcards with other characters (`a*`, `#b`)
    pub fn parse(raw: &str) -> Result<BindingPattern, AmqpError> {
        let mut tokens: Vec<PatternToken> = vec![];

        if !raw.is_empty() {
            for word in raw.split(WORD_SEPARATOR) {
                let token = match word {
                    "" => return Err(AmqpError::MalformedPattern(raw.to_owned())),
                    SINGLE_WORD_WILDCARD => PatternToken::AnyWord,
                    MULTI_WORD_WILDCARD => PatternToken::AnyWords,
                    w if w.contains(['*', '#']) => {
                        return Err(AmqpError::MalformedPattern(raw.to_owned()))
                    }
                    w => PatternToken::Literal(w.to_owned()),
                };

                let repeated_hash = token == PatternToken::AnyWords
                    && tokens.last() == Some(&PatternToken::AnyWords);
                if repeated_hash {
                    continue;
                }
                tokens.push(token);
            }
        }

        Ok(BindingPattern {
            raw: raw.to_owned(),
            tokens,
        })
    }

    /// The pattern as it was given to [`BindingPattern::parse`].
    pub fn as_str(&self) -> &str {
        &self.raw
    }

    pub fn tokens(&self) -> &[PatternToken] {
        &self.tokens
    }

    /// Returns true if `key` is selected by this pattern.
    pub fn matches(&self, key: &RoutingKey) -> bool {
        matches(key, self)
    }
}

impl FromStr for BindingPattern {
    type Err = AmqpError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        BindingPattern::parse(s)
    }
}

impl fmt::Display for BindingPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.raw)
    }
}

/// Matches a routing key against a binding pattern.
///
/// # Parameters
/// * `key` - The routing key of the published message
/// * `pattern` - The binding pattern to test
///
/// # Returns
/// `true` when the pattern selects the key
///
/// Tokens are consumed left to right. When a `#` is met it first consumes zero words;
/// if the remainder later fails, the most recent `#` is widened by one word and the
/// comparison resumes from there. Only the latest `#` needs to be remembered: any
/// widening of an earlier one is covered by the later one.
pub fn matches(key: &RoutingKey, pattern: &BindingPattern) -> bool {
    let words = key.words();
    let tokens = pattern.tokens();

    let mut w = 0;
    let mut t = 0;
    // (token index after the `#`, word index the `#` currently stops at)
    let mut resume: Option<(usize, usize)> = None;

    while w < words.len() {
        match tokens.get(t) {
            Some(PatternToken::AnyWords) => {
                t += 1;
                resume = Some((t, w));
                continue;
            }
            Some(PatternToken::AnyWord) => {
                t += 1;
                w += 1;
                continue;
            }
            Some(PatternToken::Literal(lit)) if *lit == words[w] => {
                t += 1;
                w += 1;
                continue;
            }
            _ => {}
        }

        match resume {
            Some((after_hash, stop)) => {
                t = after_hash;
                w = stop + 1;
                resume = Some((after_hash, stop + 1));
            }
            None => return false,
        }
    }

    tokens[t..]
        .iter()
        .all(|token| *token == PatternToken::AnyWords)
}
