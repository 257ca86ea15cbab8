//! Percent escaping for the wire protocol.
//!
//! Three positions on the wire reserve different characters:
//!
//! - request parameter values (`name=value&...`): `%`, `&`, `=`
//! - notification fields (`DIRECTIVE,field,...`): `%`, `,`
//! - update field values (`a|b|...`): `%`, `,`, `|`, `#`, `$`
//!
//! ASCII control characters (including CR/LF, which frame lines) are escaped
//! everywhere. Escaping is canonical: the encoder escapes exactly the
//! reserved set, so `escape(unescape(x)) == x` for server-produced lines and
//! `unescape(escape(x)) == x` for arbitrary values. Compatibility with the
//! server is bit-exact on this set.

use std::borrow::Cow;

use percent_encoding::{AsciiSet, CONTROLS, percent_decode_str, utf8_percent_encode};

use super::CodecError;

/// Reserved in request parameter values.
const PARAM_SET: &AsciiSet = &CONTROLS.add(b'%').add(b'&').add(b'=');

/// Reserved in comma-separated notification fields.
const NOTIFICATION_SET: &AsciiSet = &CONTROLS.add(b'%').add(b',');

/// Reserved in pipe-separated update values.
const UPDATE_SET: &AsciiSet = &CONTROLS
    .add(b'%')
    .add(b',')
    .add(b'|')
    .add(b'#')
    .add(b'$');

/// Escape a request parameter value.
pub fn escape_param(value: &str) -> Cow<'_, str> {
    utf8_percent_encode(value, PARAM_SET).into()
}

/// Escape a notification field.
pub fn escape_field(value: &str) -> Cow<'_, str> {
    utf8_percent_encode(value, NOTIFICATION_SET).into()
}

/// Escape an update field value.
pub fn escape_update(value: &str) -> Cow<'_, str> {
    utf8_percent_encode(value, UPDATE_SET).into()
}

/// Decode a percent-escaped value from any wire position.
///
/// # Errors
///
/// Returns [`CodecError::InvalidEscape`] when the escapes do not decode to
/// valid UTF-8.
pub fn unescape(value: &str) -> Result<String, CodecError> {
    percent_decode_str(value)
        .decode_utf8()
        .map(Cow::into_owned)
        .map_err(|_| CodecError::InvalidEscape)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_values_pass_through() {
        assert_eq!(escape_param("item1 item2"), "item1 item2");
        assert_eq!(escape_field("10.5"), "10.5");
        assert_eq!(escape_update("EURUSD"), "EURUSD");
    }

    #[test]
    fn reserved_characters_are_escaped_per_position() {
        assert_eq!(escape_param("a=b&c"), "a%3Db%26c");
        assert_eq!(escape_field("sync error, resuming"), "sync error%2C resuming");
        assert_eq!(escape_update("a|b#c$d"), "a%7Cb%23c%24d");
    }

    #[test]
    fn line_breaks_never_survive_escaping() {
        for escaped in [
            escape_param("a\r\nb").into_owned(),
            escape_field("a\r\nb").into_owned(),
            escape_update("a\r\nb").into_owned(),
        ] {
            assert!(!escaped.contains('\r'));
            assert!(!escaped.contains('\n'));
        }
    }

    #[test]
    fn unescape_inverts_escape() {
        let original = "price=1,5|note#x$y&z\r\n";
        assert_eq!(unescape(&escape_param(original)).unwrap(), original);
        assert_eq!(unescape(&escape_field(original)).unwrap(), original);
        assert_eq!(unescape(&escape_update(original)).unwrap(), original);
    }

    #[test]
    fn unescape_rejects_broken_utf8() {
        assert!(unescape("%FF%FE").is_err());
    }

    #[test]
    fn unescape_handles_multibyte() {
        let value = "caf\u{e9} \u{1f680}";
        assert_eq!(unescape(&escape_update(value)).unwrap(), value);
    }
}
