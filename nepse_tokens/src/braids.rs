use aliri_braid::braid;
use std::fmt;

/// The authorization scheme the service expects in front of a usable token
pub const AUTHORIZATION_SCHEME: &str = "Salter";

/// Characters of a token shown by the alternate `Debug` form
const SHOWN_CHARS: usize = 6;

/// Writes a token so that only the alternate `Display` form carries its
/// full text
///
/// * `{:?}` gives `Label(<redacted, N bytes>)`
/// * `{:#?}` gives `Label("abcdef…")`
/// * `{}` gives `<redacted>`
/// * `{:#}` gives the token itself
fn write_secret(
    f: &mut fmt::Formatter,
    label: &str,
    token: &str,
    debug: bool,
) -> fmt::Result {
    match (debug, f.alternate()) {
        (true, false) => write!(f, "{}(<redacted, {} bytes>)", label, token.len()),
        (true, true) => {
            let shown = token
                .char_indices()
                .nth(SHOWN_CHARS)
                .map_or(token, |(end, _)| &token[..end]);
            let ellipsis = if shown.len() < token.len() { "…" } else { "" };
            write!(f, "{}(\"{}{}\")", label, shown, ellipsis)
        }
        (false, false) => f.write_str("<redacted>"),
        (false, true) => f.write_str(token),
    }
}

/// A usable access token
#[braid(serde, debug = "owned", display = "owned")]
pub struct AccessToken;

impl fmt::Debug for AccessTokenRef {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write_secret(f, "AccessToken", self.as_str(), true)
    }
}

impl fmt::Display for AccessTokenRef {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write_secret(f, "AccessToken", self.as_str(), false)
    }
}

impl AccessTokenRef {
    /// Formats the token as the value of an `Authorization` header
    pub fn to_authorization(&self) -> String {
        format!("{} {}", AUTHORIZATION_SCHEME, self.as_str())
    }
}

/// A usable refresh token
#[braid(serde, debug = "owned", display = "owned")]
pub struct RefreshToken;

impl fmt::Debug for RefreshTokenRef {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write_secret(f, "RefreshToken", self.as_str(), true)
    }
}

impl fmt::Display for RefreshTokenRef {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write_secret(f, "RefreshToken", self.as_str(), false)
    }
}

impl RefreshTokenRef {
    /// Formats the token as the value of an `Authorization` header
    pub fn to_authorization(&self) -> String {
        format!("{} {}", AUTHORIZATION_SCHEME, self.as_str())
    }
}
