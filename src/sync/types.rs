// src/sync/types.rs
use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value};
use std::fmt;

use crate::error::ConfigFault;

/// Opaque token issued by the feed. Feeds hand these out as numbers or strings;
/// both are kept verbatim as text.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Token(String);

impl Token {
    pub fn new(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawToken {
    Int(i64),
    Uint(u64),
    Float(f64),
    Text(String),
}

impl<'de> Deserialize<'de> for Token {
    fn deserialize<D: Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
        Ok(match RawToken::deserialize(d)? {
            RawToken::Int(v) => Token(v.to_string()),
            RawToken::Uint(v) => Token(v.to_string()),
            RawToken::Float(v) => Token(v.to_string()),
            RawToken::Text(s) => Token(s),
        })
    }
}

impl Serialize for Token {
    fn serialize<S: Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        // Numeric ids go back out as numbers so the store sees what the feed sent.
        match self.0.parse::<i64>() {
            Ok(n) if n.to_string() == self.0 => s.serialize_i64(n),
            _ => s.serialize_str(&self.0),
        }
    }
}

pub(crate) fn de_opt_token<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Token>, D::Error> {
    let v: Option<Value> = Option::deserialize(d)?;
    match v {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) if s.is_empty() => Ok(None),
        Some(other) => Token::deserialize(other)
            .map(Some)
            .map_err(serde::de::Error::custom),
    }
}

/// Cursor position in the feed's change stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Anchor {
    pub cursor: Token,
    /// Wall-clock instant the cursor was derived from; never in the future.
    pub derived_at: DateTime<Utc>,
}

/// Lifecycle state reported by the feed for a posting.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum PostingState {
    Active,
    Expired,
    Unavailable,
    #[default]
    Unknown,
    Other(String),
}

impl From<String> for PostingState {
    fn from(s: String) -> Self {
        match s.to_ascii_lowercase().as_str() {
            "active" => PostingState::Active,
            "expired" => PostingState::Expired,
            "unavailable" => PostingState::Unavailable,
            "" => PostingState::Unknown,
            _ => PostingState::Other(s),
        }
    }
}

impl From<PostingState> for String {
    fn from(s: PostingState) -> Self {
        match s {
            PostingState::Active => "active".into(),
            PostingState::Expired => "expired".into(),
            PostingState::Unavailable => "unavailable".into(),
            PostingState::Unknown => String::new(),
            PostingState::Other(s) => s,
        }
    }
}

impl Serialize for PostingState {
    fn serialize<S: Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&String::from(self.clone()))
    }
}

impl<'de> Deserialize<'de> for PostingState {
    fn deserialize<D: Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
        let s: Option<String> = Option::deserialize(d)?;
        Ok(s.map(PostingState::from).unwrap_or_default())
    }
}

fn is_unknown(s: &PostingState) -> bool {
    matches!(s, PostingState::Unknown)
}

fn is_false(b: &bool) -> bool {
    !*b
}

// Feeds are loose about scalar types. One odd field must not fail the whole
// poll, so the fields the engine reads fall back to their defaults instead.

fn number_of(v: &Value) -> Option<f64> {
    match v {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// `true`, non-zero numbers and "true"/"yes"/"1"; everything else is false.
fn de_truthy<'de, D: Deserializer<'de>>(d: D) -> Result<bool, D::Error> {
    Ok(match Value::deserialize(d)? {
        Value::Bool(b) => b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::String(s) => matches!(s.trim().to_ascii_lowercase().as_str(), "true" | "yes" | "1"),
        _ => false,
    })
}

fn de_opt_i64<'de, D: Deserializer<'de>>(d: D) -> Result<Option<i64>, D::Error> {
    let v = Value::deserialize(d)?;
    Ok(v.as_i64().or_else(|| number_of(&v).map(|f| f as i64)))
}

fn de_i64_or_zero<'de, D: Deserializer<'de>>(d: D) -> Result<i64, D::Error> {
    Ok(de_opt_i64(d)?.unwrap_or_default())
}

/// RFC 3339 text, or unix seconds / milliseconds as a number or numeric text.
fn de_opt_instant<'de, D: Deserializer<'de>>(d: D) -> Result<Option<DateTime<Utc>>, D::Error> {
    let v = Value::deserialize(d)?;
    if let Value::String(s) = &v {
        if let Ok(t) = DateTime::parse_from_rfc3339(s.trim()) {
            return Ok(Some(t.with_timezone(&Utc)));
        }
    }
    Ok(number_of(&v).and_then(|n| {
        let n = n as i64;
        // anything past year 5138 in seconds is taken as milliseconds
        if n.abs() >= 100_000_000_000 {
            DateTime::from_timestamp_millis(n)
        } else {
            DateTime::from_timestamp(n, 0)
        }
    }))
}

/// A single classified record. Fields the engine does not interpret ride along
/// in `extra` and are written to the store untouched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Posting {
    pub id: Token,
    #[serde(default, skip_serializing_if = "is_unknown")]
    pub state: PostingState,
    #[serde(default, deserialize_with = "de_truthy", skip_serializing_if = "is_false")]
    pub deleted: bool,
    #[serde(
        rename = "flagged_status",
        alias = "flaggedStatus",
        default,
        deserialize_with = "de_opt_i64",
        skip_serializing_if = "Option::is_none"
    )]
    pub flagged_status: Option<i64>,
    /// Source-side event time, unix seconds.
    #[serde(default, deserialize_with = "de_i64_or_zero")]
    pub timestamp: i64,
    #[serde(
        rename = "createdAt",
        alias = "created_at",
        default,
        deserialize_with = "de_opt_instant",
        skip_serializing_if = "Option::is_none"
    )]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Posting {
    /// Minimal posting, handy for fixtures and tools.
    pub fn new(id: impl Into<String>, timestamp: i64) -> Self {
        Self {
            id: Token::new(id),
            state: PostingState::Active,
            deleted: false,
            flagged_status: None,
            timestamp,
            created_at: None,
            extra: Map::new(),
        }
    }
}

/// Location filter for polling and latest-record lookups.
/// Exactly one of metro/state by construction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LocationFilter {
    Metro(String),
    State(String),
}

impl LocationFilter {
    /// Build from the two config keys, rejecting both-set and both-empty.
    pub fn from_parts(metro: Option<&str>, state: Option<&str>) -> Result<Self, ConfigFault> {
        let metro = metro.map(str::trim).filter(|s| !s.is_empty());
        let state = state.map(str::trim).filter(|s| !s.is_empty());
        match (metro, state) {
            (Some(m), None) => Ok(LocationFilter::Metro(m.to_string())),
            (None, Some(s)) => Ok(LocationFilter::State(s.to_string())),
            _ => Err(ConfigFault::Location),
        }
    }

    pub fn key(&self) -> &'static str {
        match self {
            LocationFilter::Metro(_) => "metro",
            LocationFilter::State(_) => "state",
        }
    }

    pub fn value(&self) -> &str {
        match self {
            LocationFilter::Metro(v) | LocationFilter::State(v) => v,
        }
    }
}

impl fmt::Display for LocationFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}={}", self.key(), self.value())
    }
}

/// Parameters sent upstream for one poll.
#[derive(Debug, Clone, PartialEq)]
pub struct PollRequest {
    pub anchor: Token,
    pub location: LocationFilter,
}

/// Upstream poll response.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct PollResult {
    #[serde(default, deserialize_with = "de_opt_token")]
    pub anchor: Option<Token>,
    #[serde(default)]
    pub postings: Vec<Posting>,
}
