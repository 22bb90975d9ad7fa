//! RFC 2047 encoded-word decoding for header text (the Subject line)
//!
//! `=?charset?B?payload?=` and `=?charset?Q?payload?=` words are decoded and
//! converted to UTF-8. Charset names go through a fixed alias table before the
//! decoder lookup; a charset nobody knows is passed through as raw bytes.

use base64::alphabet;
use base64::engine::{DecodePaddingMode, GeneralPurpose, GeneralPurposeConfig};
use base64::Engine;
use mail_parser::decoders::charsets::map::charset_decoder;
use regex::Regex;
use std::sync::OnceLock;
use tracing::debug;

/// Padding is optional in the wild
const LENIENT_BASE64: GeneralPurpose = GeneralPurpose::new(
    &alphabet::STANDARD,
    GeneralPurposeConfig::new().with_decode_padding_mode(DecodePaddingMode::Indifferent),
);

/// Legacy vendor names mapped to the IANA names decoders know about
const CHARSET_ALIASES: &[(&str, &str)] = &[
    ("utf8", "utf-8"),
    ("ascii", "us-ascii"),
    ("latin1", "iso-8859-1"),
    ("ks_c_5601-1987", "euc-kr"),
    ("ks_c_5601_1987", "euc-kr"),
    ("ks-c-5601-1987", "euc-kr"),
    ("x-windows-949", "euc-kr"),
    ("windows-949", "euc-kr"),
    ("cp949", "euc-kr"),
    ("x-euc-jp", "euc-jp"),
    ("x-euc-tw", "euc-tw"),
    ("x-sjis", "shift_jis"),
    ("sjis", "shift_jis"),
    ("shift-jis", "shift_jis"),
    ("ms_kanji", "shift_jis"),
    ("cp932", "shift_jis"),
    ("x-gbk", "gbk"),
    ("cp936", "gbk"),
    ("cp1250", "windows-1250"),
    ("cp1251", "windows-1251"),
    ("cp1252", "windows-1252"),
    ("cp1253", "windows-1253"),
    ("cp1254", "windows-1254"),
    ("cp1255", "windows-1255"),
    ("cp1256", "windows-1256"),
    ("cp1257", "windows-1257"),
    ("cp1258", "windows-1258"),
    ("cp866", "ibm866"),
    ("iso-8859-8-i", "iso-8859-8"),
    ("iso_8859-1", "iso-8859-1"),
];

fn encoded_word_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"=\?([^?\s]+)\?([QqBb])\?([^?\s]*)\?=").expect("valid regex"))
}

/// Normalize a declared charset name to its canonical (lowercase IANA) form
pub fn canonical_charset(name: &str) -> String {
    // RFC 2231 language suffix: utf-8*en
    let name = name.split('*').next().unwrap_or(name).trim().to_ascii_lowercase();

    if let Some((_, canonical)) = CHARSET_ALIASES.iter().find(|(alias, _)| *alias == name) {
        return canonical.to_string();
    }

    let dashed: String = name
        .chars()
        .map(|c| if matches!(c, '_' | ':' | '.' | '/' | '\\') { '-' } else { c })
        .collect();
    match CHARSET_ALIASES.iter().find(|(alias, _)| *alias == dashed) {
        Some((_, canonical)) => canonical.to_string(),
        None => name,
    }
}

/// Decode every encoded word in `input`, leaving plain text untouched
///
/// # Examples
/// ```
/// use relay_rs::utils::decode_header;
///
/// assert_eq!(decode_header("=?UTF-8?B?aGVsbG8=?="), "hello");
/// ```
pub fn decode_header(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut last = 0;
    let mut after_word = false;

    for caps in encoded_word_regex().captures_iter(input) {
        let Some(word) = caps.get(0) else { continue };

        // Whitespace between two adjacent encoded words is not part of the text
        let gap = &input[last..word.start()];
        if !(after_word && gap.chars().all(char::is_whitespace)) {
            out.push_str(gap);
        }

        match decode_word(&caps[1], &caps[2], &caps[3]) {
            Some(text) => {
                out.push_str(&text);
                after_word = true;
            }
            None => {
                out.push_str(word.as_str());
                after_word = false;
            }
        }
        last = word.end();
    }

    out.push_str(&input[last..]);
    out
}

fn decode_word(charset: &str, encoding: &str, payload: &str) -> Option<String> {
    let bytes = if encoding.eq_ignore_ascii_case("B") {
        LENIENT_BASE64.decode(payload).ok()?
    } else {
        decode_q(payload)
    };
    Some(to_utf8(&bytes, charset))
}

/// Quoted-printable as used in headers: `_` is a space, `=XX` a byte
fn decode_q(payload: &str) -> Vec<u8> {
    let bytes = payload.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;

    while i < bytes.len() {
        match bytes[i] {
            b'_' => out.push(b' '),
            b'=' => {
                let byte = bytes
                    .get(i + 1..i + 3)
                    .filter(|hex| hex.iter().all(u8::is_ascii_hexdigit))
                    .and_then(|hex| std::str::from_utf8(hex).ok())
                    .and_then(|hex| u8::from_str_radix(hex, 16).ok());
                match byte {
                    Some(byte) => {
                        out.push(byte);
                        i += 2;
                    }
                    None => out.push(b'='),
                }
            }
            b => out.push(b),
        }
        i += 1;
    }

    out
}

fn to_utf8(bytes: &[u8], charset: &str) -> String {
    let canonical = canonical_charset(charset);
    match canonical.as_str() {
        "utf-8" | "us-ascii" => String::from_utf8_lossy(bytes).into_owned(),
        name => match charset_decoder(name.as_bytes()) {
            Some(decoder) => decoder(bytes),
            None => {
                debug!("Unknown charset {}, passing bytes through", charset);
                String::from_utf8_lossy(bytes).into_owned()
            }
        },
    }
}
