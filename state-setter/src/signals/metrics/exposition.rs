// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Parser for the Prometheus text exposition format (version 0.0.4)
//!
//! Only what health checks need is kept: each sample's name, labels and
//! value. `# HELP` and `# TYPE` lines, other comments and sample timestamps
//! are skipped. Samples are grouped under their own name, so the `_bucket`,
//! `_sum` and `_count` series of a histogram land in separate families.

use super::{MetricFamilies, Sample};
use std::collections::BTreeMap;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
#[error("line {line}: {reason}")]
pub struct ParseError {
    pub line: usize,
    pub reason: &'static str,
}

pub fn parse(text: &str) -> Result<MetricFamilies, ParseError> {
    let mut families = MetricFamilies::new();
    for (index, line) in text.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let (name, sample) = parse_sample(line)
            .map_err(|reason| ParseError { line: index + 1, reason })?;
        families.entry(name).or_default().push(sample);
    }
    Ok(families)
}

fn parse_sample(line: &str) -> Result<(String, Sample), &'static str> {
    let mut cursor = Cursor { rest: line };

    let name = cursor.take_name(is_metric_name_char)?;
    if name.starts_with(|c: char| c.is_ascii_digit()) {
        return Err("metric name starts with a digit");
    }

    cursor.skip_whitespace();
    let labels =
        if cursor.eat('{') { cursor.take_labels()? } else { BTreeMap::new() };

    cursor.skip_whitespace();
    let mut fields = cursor.rest.split_whitespace();
    let value = fields.next().ok_or("missing sample value")?;
    let value = parse_value(value)?;
    if let Some(timestamp) = fields.next() {
        timestamp.parse::<i64>().map_err(|_| "invalid timestamp")?;
    }
    if fields.next().is_some() {
        return Err("trailing characters after sample");
    }

    Ok((name.to_string(), Sample { labels, value }))
}

fn parse_value(value: &str) -> Result<f64, &'static str> {
    match value {
        "NaN" => Ok(f64::NAN),
        "+Inf" | "Inf" => Ok(f64::INFINITY),
        "-Inf" => Ok(f64::NEG_INFINITY),
        _ => value.parse().map_err(|_| "invalid sample value"),
    }
}

fn is_metric_name_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_' || c == ':'
}

fn is_label_name_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_'
}

struct Cursor<'a> {
    rest: &'a str,
}

impl<'a> Cursor<'a> {
    fn skip_whitespace(&mut self) {
        self.rest = self.rest.trim_start();
    }

    fn eat(&mut self, c: char) -> bool {
        match self.rest.strip_prefix(c) {
            Some(rest) => {
                self.rest = rest;
                true
            }
            None => false,
        }
    }

    fn take_name(
        &mut self,
        valid: impl Fn(char) -> bool,
    ) -> Result<&'a str, &'static str> {
        let end =
            self.rest.find(|c: char| !valid(c)).unwrap_or(self.rest.len());
        if end == 0 {
            return Err("expected a name");
        }
        let (name, rest) = self.rest.split_at(end);
        self.rest = rest;
        Ok(name)
    }

    /// Parses `name="value",...}` (the opening brace already consumed).
    fn take_labels(
        &mut self,
    ) -> Result<BTreeMap<String, String>, &'static str> {
        let mut labels = BTreeMap::new();
        loop {
            self.skip_whitespace();
            if self.eat('}') {
                return Ok(labels);
            }
            let name = self.take_name(is_label_name_char)?;
            self.skip_whitespace();
            if !self.eat('=') {
                return Err("expected '=' after label name");
            }
            self.skip_whitespace();
            if !self.eat('"') {
                return Err("expected '\"' to open label value");
            }
            let value = self.take_label_value()?;
            labels.insert(name.to_string(), value);
            self.skip_whitespace();
            if !self.eat(',') {
                self.skip_whitespace();
                if self.eat('}') {
                    return Ok(labels);
                }
                return Err("expected ',' or '}' after label");
            }
        }
    }

    /// Parses an escaped label value up to and including the closing quote.
    fn take_label_value(&mut self) -> Result<String, &'static str> {
        let mut value = String::new();
        let mut chars = self.rest.char_indices();
        while let Some((i, c)) = chars.next() {
            match c {
                '"' => {
                    self.rest = &self.rest[i + 1..];
                    return Ok(value);
                }
                '\\' => match chars.next() {
                    Some((_, 'n')) => value.push('\n'),
                    Some((_, '\\')) => value.push('\\'),
                    Some((_, '"')) => value.push('"'),
                    Some((_, other)) => {
                        value.push('\\');
                        value.push(other);
                    }
                    None => break,
                },
                c => value.push(c),
            }
        }
        Err("unterminated label value")
    }
}
