//! Image metadata model and its on-disk representation.
//!
//! The metadata record is persisted as a line-oriented `key=value` file in
//! the classic properties format: `#`/`!` comment lines, backslash escapes,
//! `\uXXXX` for anything outside printable ASCII, and backslash line
//! continuations. Unknown keys are ignored on read.

use std::fmt;

use chrono::{NaiveDateTime, Timelike};
use serde::Serialize;

use crate::error::{Error, Result};

const CONTENT_ID_KEY: &str = "contentId";
const PROCESS_STATUS_KEY: &str = "process.status";
const STORED_DATETIME_KEY: &str = "stored.datetime";
const SOURCE_NAME_KEY: &str = "source.name";
const SOURCE_TYPE_KEY: &str = "source.type";
const SOURCE_QUALITY_KEY: &str = "source.quality";
const SOURCE_SIZE_KEY: &str = "source.size";
const TARGET_QUALITY_KEY: &str = "target.quality";
const TARGET_SIZE_KEY: &str = "target.size";

/// Lifecycle states of a stored entry.
///
/// States only ever advance in the order
/// `stored → waiting → transforming → {transformed|failed}`; the two final
/// states are terminal until deletion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ProcessStatus {
    Stored,
    Waiting,
    Transforming,
    Transformed,
    Failed,
}

impl ProcessStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Stored => "stored",
            Self::Waiting => "waiting",
            Self::Transforming => "transforming",
            Self::Transformed => "transformed",
            Self::Failed => "failed",
        }
    }

    fn parse(s: &str) -> Option<Self> {
        match s {
            "stored" => Some(Self::Stored),
            "waiting" => Some(Self::Waiting),
            "transforming" => Some(Self::Transforming),
            "transformed" => Some(Self::Transformed),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }

    /// True for `transformed` and `failed`.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Transformed | Self::Failed)
    }
}

impl fmt::Display for ProcessStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Supported source image formats.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageType {
    Jpg,
    Png,
}

impl ImageType {
    /// Token used in the metadata file.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Jpg => "JPG",
            Self::Png => "PNG",
        }
    }

    pub fn mime_type(&self) -> &'static str {
        match self {
            Self::Jpg => "image/jpeg",
            Self::Png => "image/png",
        }
    }

    /// File name extension of the stored source.
    pub fn postfix(&self) -> &'static str {
        match self {
            Self::Jpg => "jpg",
            Self::Png => "png",
        }
    }

    /// Map an upload `Content-Type` to the image type.
    pub fn from_mime(mime: &str) -> Result<Self> {
        if mime.eq_ignore_ascii_case("image/jpeg") {
            Ok(Self::Jpg)
        } else if mime.eq_ignore_ascii_case("image/png") {
            Ok(Self::Png)
        } else {
            Err(Error::UnsupportedType(mime.to_string()))
        }
    }

    fn parse(s: &str) -> Option<Self> {
        match s {
            "JPG" => Some(Self::Jpg),
            "PNG" => Some(Self::Png),
            _ => None,
        }
    }
}

impl fmt::Display for ImageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Metadata record of one content entry.
#[derive(Debug, Clone, PartialEq)]
pub struct ImageMetadata {
    /// 32 character lowercase hex id; also the entry's directory name.
    pub content_id: String,
    pub status: ProcessStatus,
    /// Local wall-clock time of admission, written once.
    pub stored_datetime: NaiveDateTime,
    /// Filename supplied by the uploader, if any.
    pub source_name: Option<String>,
    pub source_type: ImageType,
    /// Probed JPEG quality in 1..=100; PNG sources record 100.
    pub source_quality: u8,
    pub source_size: u64,
    /// Probed target quality, present only after a successful transform.
    pub target_quality: Option<u8>,
    /// Target byte length, present only after a successful transform.
    pub target_size: Option<u64>,
}

impl ImageMetadata {
    /// Serialize the record into properties format.
    pub fn to_properties(&self) -> String {
        let mut out = String::new();
        push_property(&mut out, CONTENT_ID_KEY, &self.content_id);
        push_property(&mut out, PROCESS_STATUS_KEY, self.status.as_str());
        push_property(
            &mut out,
            STORED_DATETIME_KEY,
            &format_datetime(&self.stored_datetime),
        );
        if let Some(name) = &self.source_name {
            push_property(&mut out, SOURCE_NAME_KEY, name);
        }
        push_property(&mut out, SOURCE_TYPE_KEY, self.source_type.as_str());
        push_property(&mut out, SOURCE_QUALITY_KEY, &self.source_quality.to_string());
        push_property(&mut out, SOURCE_SIZE_KEY, &self.source_size.to_string());
        if let Some(quality) = self.target_quality {
            push_property(&mut out, TARGET_QUALITY_KEY, &quality.to_string());
        }
        if let Some(size) = self.target_size {
            push_property(&mut out, TARGET_SIZE_KEY, &size.to_string());
        }
        out
    }

    /// Parse a record from properties format.
    ///
    /// Returns the malformation reason on failure; the store wraps it with
    /// the content id context.
    pub fn from_properties(input: &str) -> std::result::Result<Self, String> {
        let props = parse_properties(input)?;
        let get = |key: &str| {
            props
                .iter()
                .find(|(k, _)| k == key)
                .map(|(_, v)| v.as_str())
        };
        let require = |key: &str| get(key).ok_or_else(|| format!("missing key '{key}'"));

        let status_token = require(PROCESS_STATUS_KEY)?;
        let status = ProcessStatus::parse(status_token)
            .ok_or_else(|| format!("unknown process status '{status_token}'"))?;
        let type_token = require(SOURCE_TYPE_KEY)?;
        let source_type = ImageType::parse(type_token)
            .ok_or_else(|| format!("unknown source type '{type_token}'"))?;
        let stored_datetime = require(STORED_DATETIME_KEY)?
            .parse::<NaiveDateTime>()
            .map_err(|e| format!("bad stored.datetime: {e}"))?;

        Ok(Self {
            content_id: require(CONTENT_ID_KEY)?.to_string(),
            status,
            stored_datetime,
            source_name: get(SOURCE_NAME_KEY).map(str::to_owned),
            source_type,
            source_quality: parse_number(SOURCE_QUALITY_KEY, require(SOURCE_QUALITY_KEY)?)?,
            source_size: parse_number(SOURCE_SIZE_KEY, require(SOURCE_SIZE_KEY)?)?,
            target_quality: get(TARGET_QUALITY_KEY)
                .map(|v| parse_number(TARGET_QUALITY_KEY, v))
                .transpose()?,
            target_size: get(TARGET_SIZE_KEY)
                .map(|v| parse_number(TARGET_SIZE_KEY, v))
                .transpose()?,
        })
    }
}

fn parse_number<T: std::str::FromStr>(key: &str, value: &str) -> std::result::Result<T, String> {
    value
        .parse()
        .map_err(|_| format!("bad numeric value '{value}' for key '{key}'"))
}

/// ISO-8601 local date-time without a zone offset; the fraction is omitted
/// for whole seconds.
fn format_datetime(dt: &NaiveDateTime) -> String {
    if dt.nanosecond() == 0 {
        dt.format("%Y-%m-%dT%H:%M:%S").to_string()
    } else {
        dt.format("%Y-%m-%dT%H:%M:%S%.f").to_string()
    }
}

fn push_property(out: &mut String, key: &str, value: &str) {
    escape_into(out, key, true);
    out.push('=');
    escape_into(out, value, false);
    out.push('\n');
}

/// Escape one side of a property line. Keys escape every space; values only
/// escape leading spaces.
fn escape_into(out: &mut String, s: &str, escape_all_spaces: bool) {
    let mut leading = true;
    for c in s.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            '\x0c' => out.push_str("\\f"),
            '=' | ':' | '#' | '!' => {
                out.push('\\');
                out.push(c);
            }
            ' ' if escape_all_spaces || leading => out.push_str("\\ "),
            c if (c as u32) < 0x20 || (c as u32) > 0x7e => {
                let mut units = [0u16; 2];
                for unit in c.encode_utf16(&mut units) {
                    out.push_str(&format!("\\u{:04X}", unit));
                }
            }
            c => out.push(c),
        }
        if c != ' ' {
            leading = false;
        }
    }
}

/// Parse properties text into key/value pairs, in file order.
fn parse_properties(input: &str) -> std::result::Result<Vec<(String, String)>, String> {
    let mut props = Vec::new();
    let mut lines = input.lines();
    while let Some(line) = lines.next() {
        let trimmed = line.trim_start();
        if trimmed.is_empty() || trimmed.starts_with('#') || trimmed.starts_with('!') {
            continue;
        }
        let mut logical = trimmed.to_string();
        while ends_with_odd_backslashes(&logical) {
            logical.pop();
            match lines.next() {
                Some(next) => logical.push_str(next.trim_start()),
                None => break,
            }
        }
        let (key, value) = split_key_value(&logical);
        props.push((unescape(key)?, unescape(value)?));
    }
    Ok(props)
}

fn ends_with_odd_backslashes(s: &str) -> bool {
    s.chars().rev().take_while(|&c| c == '\\').count() % 2 == 1
}

/// Split a logical line at the first unescaped `=`, `:` or whitespace.
fn split_key_value(line: &str) -> (&str, &str) {
    let mut escaped = false;
    let mut sep = None;
    for (i, c) in line.char_indices() {
        if escaped {
            escaped = false;
            continue;
        }
        match c {
            '\\' => escaped = true,
            '=' | ':' | ' ' | '\t' | '\x0c' => {
                sep = Some(i);
                break;
            }
            _ => {}
        }
    }
    let Some(i) = sep else {
        return (line, "");
    };
    let key = &line[..i];
    let mut rest = line[i..].trim_start_matches([' ', '\t', '\x0c']);
    if rest.starts_with(['=', ':']) {
        rest = rest[1..].trim_start_matches([' ', '\t', '\x0c']);
    }
    (key, rest)
}

fn unescape(s: &str) -> std::result::Result<String, String> {
    let mut out = String::with_capacity(s.len());
    let mut chars = s.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            None => return Err("dangling escape at end of line".to_string()),
            Some('n') => out.push('\n'),
            Some('r') => out.push('\r'),
            Some('t') => out.push('\t'),
            Some('f') => out.push('\x0c'),
            Some('u') => {
                let unit = read_code_unit(&mut chars)?;
                if (0xD800..0xDC00).contains(&unit) {
                    // high surrogate; a low half must follow
                    if chars.next() != Some('\\') || chars.next() != Some('u') {
                        return Err("unpaired high surrogate in \\u escape".to_string());
                    }
                    let low = read_code_unit(&mut chars)?;
                    if !(0xDC00..0xE000).contains(&low) {
                        return Err("invalid low surrogate in \\u escape".to_string());
                    }
                    let combined = 0x10000 + ((unit - 0xD800) << 10) + (low - 0xDC00);
                    out.push(char::from_u32(combined).ok_or("invalid surrogate pair")?);
                } else if (0xDC00..0xE000).contains(&unit) {
                    return Err("unpaired low surrogate in \\u escape".to_string());
                } else {
                    out.push(char::from_u32(unit).ok_or("invalid \\u escape")?);
                }
            }
            Some(other) => out.push(other),
        }
    }
    Ok(out)
}

fn read_code_unit(chars: &mut impl Iterator<Item = char>) -> std::result::Result<u32, String> {
    let mut value = 0u32;
    for _ in 0..4 {
        let c = chars.next().ok_or("truncated \\u escape")?;
        value = value * 16
            + c.to_digit(16)
                .ok_or_else(|| format!("invalid hex digit '{c}' in \\u escape"))?;
    }
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn sample() -> ImageMetadata {
        ImageMetadata {
            content_id: "0f8fad5bd9cb469fa16570867728950e".to_string(),
            status: ProcessStatus::Stored,
            stored_datetime: NaiveDate::from_ymd_opt(2017, 4, 12)
                .unwrap()
                .and_hms_opt(9, 30, 11)
                .unwrap(),
            source_name: Some("photo.jpg".to_string()),
            source_type: ImageType::Jpg,
            source_quality: 93,
            source_size: 1_048_576,
            target_quality: None,
            target_size: None,
        }
    }

    #[test]
    fn test_roundtrip_minimal() {
        let meta = sample();
        let parsed = ImageMetadata::from_properties(&meta.to_properties()).unwrap();
        assert_eq!(parsed, meta);
    }

    #[test]
    fn test_roundtrip_transformed() {
        let mut meta = sample();
        meta.status = ProcessStatus::Transformed;
        meta.target_quality = Some(84);
        meta.target_size = Some(734_003);
        let parsed = ImageMetadata::from_properties(&meta.to_properties()).unwrap();
        assert_eq!(parsed, meta);
    }

    #[test]
    fn test_roundtrip_without_name() {
        let mut meta = sample();
        meta.source_name = None;
        let parsed = ImageMetadata::from_properties(&meta.to_properties()).unwrap();
        assert_eq!(parsed.source_name, None);
        assert_eq!(parsed, meta);
    }

    #[test]
    fn test_roundtrip_name_needing_escapes() {
        let mut meta = sample();
        meta.source_name = Some(" grüne Küste = schön #1!.jpg".to_string());
        let text = meta.to_properties();
        // nothing outside printable ASCII leaks into the file
        assert!(text.chars().all(|c| (' '..='\u{7e}').contains(&c) || c == '\n'));
        let parsed = ImageMetadata::from_properties(&text).unwrap();
        assert_eq!(parsed.source_name, meta.source_name);
    }

    #[test]
    fn test_roundtrip_name_outside_bmp() {
        let mut meta = sample();
        meta.source_name = Some("vacation \u{1F60E}.jpg".to_string());
        let parsed = ImageMetadata::from_properties(&meta.to_properties()).unwrap();
        assert_eq!(parsed.source_name, meta.source_name);
    }

    #[test]
    fn test_roundtrip_fractional_datetime() {
        let mut meta = sample();
        meta.stored_datetime = meta
            .stored_datetime
            .with_nanosecond(123_000_000)
            .unwrap();
        let text = meta.to_properties();
        assert!(text.contains("stored.datetime=2017-04-12T09\\:30\\:11.123"));
        let parsed = ImageMetadata::from_properties(&text).unwrap();
        assert_eq!(parsed.stored_datetime, meta.stored_datetime);
    }

    #[test]
    fn test_parse_skips_comments_and_unknown_keys() {
        let text = "# created by hand\n!another comment\n\ncontentId=0f8fad5bd9cb469fa16570867728950e\nprocess.status=failed\nstored.datetime=2017-04-12T09\\:30\\:11\nsource.type=PNG\nsource.quality=100\nsource.size=42\nfuture.key=whatever\n";
        let meta = ImageMetadata::from_properties(text).unwrap();
        assert_eq!(meta.status, ProcessStatus::Failed);
        assert_eq!(meta.source_type, ImageType::Png);
        assert_eq!(meta.source_quality, 100);
        assert_eq!(meta.source_size, 42);
    }

    #[test]
    fn test_parse_colon_separator_and_continuation() {
        let text = "contentId : 0f8fad5bd9cb469fa16570867728950e\nprocess.status: stored\nstored.datetime=2017-04-12T09\\:30\\:11\nsource.type=JPG\nsource.quality=93\nsource.name=pho\\\n    to.jpg\nsource.size=7\n";
        let meta = ImageMetadata::from_properties(text).unwrap();
        assert_eq!(meta.content_id, "0f8fad5bd9cb469fa16570867728950e");
        assert_eq!(meta.source_name.as_deref(), Some("photo.jpg"));
    }

    #[test]
    fn test_parse_rejects_missing_required_key() {
        let err = ImageMetadata::from_properties("contentId=abc\n").unwrap_err();
        assert!(err.contains("process.status"));
    }

    #[test]
    fn test_parse_rejects_unknown_status() {
        let text = "contentId=abc\nprocess.status=exploded\nstored.datetime=2017-04-12T09\\:30\\:11\nsource.type=JPG\nsource.quality=93\nsource.size=7\n";
        let err = ImageMetadata::from_properties(text).unwrap_err();
        assert!(err.contains("exploded"));
    }

    #[test]
    fn test_parse_is_case_exact_for_enums() {
        let text = "contentId=abc\nprocess.status=Stored\nstored.datetime=2017-04-12T09\\:30\\:11\nsource.type=JPG\nsource.quality=93\nsource.size=7\n";
        assert!(ImageMetadata::from_properties(text).is_err());
    }

    #[test]
    fn test_status_terminality() {
        assert!(ProcessStatus::Transformed.is_terminal());
        assert!(ProcessStatus::Failed.is_terminal());
        assert!(!ProcessStatus::Transforming.is_terminal());
    }

    #[test]
    fn test_mime_mapping() {
        assert_eq!(ImageType::from_mime("image/jpeg").unwrap(), ImageType::Jpg);
        assert_eq!(ImageType::from_mime("IMAGE/PNG").unwrap(), ImageType::Png);
        assert!(ImageType::from_mime("image/gif").is_err());
    }
}
