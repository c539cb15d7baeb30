// Copyright (c) 2026 IoT Runtime Team. All rights reserved.
// Use of this source is governed by the Apache License, Version 2.0 that can
// be found in the LICENSE file.

//! MQTT topic parsing, wildcard matching and the topic-superset relation
//! (§4.A).

use std::fmt;

use crate::error::{Error, ErrorKind};

const MAX_UNRESERVED_BYTES: usize = 256;
const MAX_UNRESERVED_LEVELS: usize = 7;
const MAX_SHARE_BYTES: usize = 256;
const MAX_SHARE_LEVELS: usize = 7;
const MAX_RESERVED_AWS_BYTES: usize = 512;

/// A single level of a parsed topic or filter.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Level {
    /// A concrete, non-wildcard level.
    Name(String),
    /// `+`: matches exactly one level.
    SingleWildcard,
    /// `#`: matches zero or more trailing levels. Only valid as the last
    /// level of a filter.
    MultiWildcard,
}

/// Which validation rules apply to a topic string, driven by its prefix
/// (§6 "Topic limits").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReservedClass {
    Unreserved,
    AwsRules,
    Share,
    OtherAws,
}

fn classify(raw: &str) -> ReservedClass {
    if raw.starts_with("$share/") {
        ReservedClass::Share
    } else if raw.starts_with("$aws/rules/") {
        ReservedClass::AwsRules
    } else if raw.starts_with("$aws/") || raw.starts_with("$AWS/") {
        ReservedClass::OtherAws
    } else {
        ReservedClass::Unreserved
    }
}

/// A parsed MQTT topic name or topic filter.
///
/// Construction validates byte length and level-count limits for the
/// reserved class the string belongs to, but does not decide whether
/// wildcards are permitted — use [`Topic::parse_publish`] for concrete
/// publish topics and [`Topic::parse_filter`] for subscription filters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Topic {
    raw: String,
    levels: Vec<Level>,
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

impl Topic {
    /// Parses and validates a concrete publish topic: no wildcards allowed.
    ///
    /// # Errors
    /// Returns `InvalidArguments` if the topic is empty, contains `+`/`#`,
    /// or exceeds the byte/level limits for its reserved class.
    pub fn parse_publish(raw: &str) -> Result<Self, Error> {
        let topic = Self::parse_any(raw)?;
        if topic
            .levels
            .iter()
            .any(|l| matches!(l, Level::SingleWildcard | Level::MultiWildcard))
        {
            return Err(Error::new(
                ErrorKind::InvalidArguments,
                "publish topics must not contain wildcards",
            ));
        }
        Ok(topic)
    }

    /// Parses and validates a subscription filter: wildcards are permitted,
    /// `#` only as the final level.
    ///
    /// # Errors
    /// Returns `InvalidArguments` on an empty filter, a misplaced `#`, or a
    /// byte/level limit violation for its reserved class.
    pub fn parse_filter(raw: &str) -> Result<Self, Error> {
        Self::parse_any(raw)
    }

    fn parse_any(raw: &str) -> Result<Self, Error> {
        if raw.is_empty() {
            return Err(Error::new(ErrorKind::InvalidArguments, "empty topic"));
        }

        let class = classify(raw);
        let (validated_raw, prefix_levels) = match class {
            ReservedClass::Share => {
                // $share/<group>/<filter> — the group/filter portion alone is
                // bound by the same limits as an unreserved filter.
                let mut parts = raw.splitn(3, '/');
                let _dollar_share = parts.next();
                let _group = parts
                    .next()
                    .ok_or_else(|| Error::new(ErrorKind::InvalidArguments, "malformed $share"))?;
                let rest = parts
                    .next()
                    .ok_or_else(|| Error::new(ErrorKind::InvalidArguments, "malformed $share"))?;
                (rest, 2)
            }
            ReservedClass::AwsRules => {
                // $aws/rules/<name>/<rest> — <rest> is bound like unreserved.
                let mut parts = raw.splitn(4, '/');
                let _dollar_aws = parts.next();
                let _rules = parts.next();
                let _name = parts.next();
                let rest = parts.next().ok_or_else(|| {
                    Error::new(ErrorKind::InvalidArguments, "malformed $aws/rules topic")
                })?;
                (rest, 3)
            }
            ReservedClass::OtherAws | ReservedClass::Unreserved => (raw, 0),
        };

        match class {
            ReservedClass::Unreserved => {
                if raw.len() > MAX_UNRESERVED_BYTES {
                    return Err(Error::new(ErrorKind::TooLarge, "topic exceeds 256 bytes"));
                }
            }
            ReservedClass::AwsRules => {
                if raw.len() > MAX_UNRESERVED_BYTES + prefix_exclusion_len(raw, prefix_levels) {
                    return Err(Error::new(
                        ErrorKind::TooLarge,
                        "$aws/rules suffix exceeds 256 bytes",
                    ));
                }
            }
            ReservedClass::Share => {
                if raw.len() > MAX_SHARE_BYTES + prefix_exclusion_len(raw, prefix_levels) {
                    return Err(Error::new(
                        ErrorKind::TooLarge,
                        "$share filter exceeds 256 bytes",
                    ));
                }
            }
            ReservedClass::OtherAws => {
                if raw.len() > MAX_RESERVED_AWS_BYTES {
                    return Err(Error::new(
                        ErrorKind::TooLarge,
                        "reserved $aws topic exceeds 512 bytes",
                    ));
                }
            }
        }

        let levels = parse_levels(validated_raw)?;

        let level_limit = match class {
            ReservedClass::Unreserved => Some(MAX_UNRESERVED_LEVELS),
            ReservedClass::AwsRules => Some(MAX_UNRESERVED_LEVELS),
            ReservedClass::Share => Some(MAX_SHARE_LEVELS),
            // Server-validated, unbounded here.
            ReservedClass::OtherAws => None,
        };
        if let Some(limit) = level_limit {
            if levels.len() > limit {
                return Err(Error::new(
                    ErrorKind::InvalidArguments,
                    "topic exceeds maximum level count",
                ));
            }
        }

        Ok(Topic {
            raw: raw.to_string(),
            levels,
        })
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// True iff `self` is a concrete publish-style topic: no wildcard level.
    #[must_use]
    pub fn is_concrete(&self) -> bool {
        !self
            .levels
            .iter()
            .any(|l| matches!(l, Level::SingleWildcard | Level::MultiWildcard))
    }

    /// Standard MQTT match: `self` is treated as the filter, `topic` as the
    /// concrete topic (§4.A `matches`).
    #[must_use]
    pub fn matches(&self, topic: &Topic) -> bool {
        matches_levels(&self.levels, &topic.levels)
    }

    /// True iff `self` is a topic-superset of `other`: every concrete topic
    /// matched by `other` is also matched by `self` (§4.A `is_superset`).
    #[must_use]
    pub fn is_superset(&self, other: &Topic) -> bool {
        is_superset_levels(&self.levels, &other.levels)
    }
}

fn prefix_exclusion_len(raw: &str, prefix_levels: usize) -> usize {
    // Byte length of the first `prefix_levels` levels plus their trailing
    // slashes, so the limit can be applied to the suffix alone.
    let mut count = 0;
    let mut idx = 0;
    for (i, ch) in raw.char_indices() {
        if ch == '/' {
            count += 1;
            if count == prefix_levels {
                idx = i + 1;
                break;
            }
        }
    }
    idx
}

fn parse_levels(raw: &str) -> Result<Vec<Level>, Error> {
    let parts: Vec<&str> = raw.split('/').collect();
    let mut levels = Vec::with_capacity(parts.len());
    for (i, part) in parts.iter().enumerate() {
        let level = match *part {
            "+" => Level::SingleWildcard,
            "#" => {
                if i != parts.len() - 1 {
                    return Err(Error::new(
                        ErrorKind::InvalidArguments,
                        "'#' is only valid as the last level",
                    ));
                }
                Level::MultiWildcard
            }
            other => Level::Name(other.to_string()),
        };
        levels.push(level);
    }
    Ok(levels)
}

fn matches_levels(filter: &[Level], topic: &[Level]) -> bool {
    let mut fi = 0;
    let mut ti = 0;
    loop {
        match (filter.get(fi), topic.get(ti)) {
            (Some(Level::MultiWildcard), _) => return true,
            (Some(Level::SingleWildcard), Some(_)) => {
                fi += 1;
                ti += 1;
            }
            (Some(Level::Name(f)), Some(Level::Name(t))) => {
                if f != t {
                    return false;
                }
                fi += 1;
                ti += 1;
            }
            (Some(Level::Name(_) | Level::SingleWildcard), None) => return false,
            (None, Some(_)) => return false,
            (None, None) => return true,
            // A concrete topic containing a wildcard character can never
            // occur (callers only match against `parse_publish` results),
            // but treat it as a non-match defensively rather than panic.
            (Some(Level::Name(_)), Some(Level::SingleWildcard | Level::MultiWildcard)) => {
                return false
            }
        }
    }
}

/// `a` is a superset of `b` iff, level by level: `a`'s level equals `b`'s, or
/// `a` has `+` at that level; if `a` ends in `#`, every remaining `b` level
/// (of any kind) is covered; if `b` ends in `#` before `a` does, `a` can only
/// cover it by also ending in `#` at or before that level (§4.A).
fn is_superset_levels(a: &[Level], b: &[Level]) -> bool {
    let mut ai = 0;
    let mut bi = 0;
    loop {
        match (a.get(ai), b.get(bi)) {
            (Some(Level::MultiWildcard), _) => return true,
            (_, Some(Level::MultiWildcard)) => {
                // b still has more (possibly infinite) levels beyond this
                // point; a can only cover that if a is also a multi-wildcard
                // here, which was handled above. Any other a-level leaves
                // levels of b's tail uncovered.
                return false;
            }
            (Some(Level::SingleWildcard), Some(_)) => {
                ai += 1;
                bi += 1;
            }
            (Some(Level::Name(x)), Some(Level::Name(y))) => {
                if x != y {
                    return false;
                }
                ai += 1;
                bi += 1;
            }
            (Some(Level::Name(_)), Some(Level::SingleWildcard)) => {
                // a demands one specific name but b could be any single
                // level — b is not guaranteed to be covered.
                return false;
            }
            (Some(_), None) => return false,
            (None, Some(_)) => return false,
            (None, None) => return true,
        }
    }
}
