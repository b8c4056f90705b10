use std::fmt;

use nepse_clock::UnixTime;
use serde::{Deserialize, Serialize};

/// The five salts issued alongside a pair of raw tokens
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Salts(pub [i32; 5]);

/// A token bundle as issued by the service
///
/// The raw tokens are not usable as credentials until the derived positions
/// have been stripped from them.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenBundle {
    /// First salt
    pub salt1: i32,
    /// Second salt
    pub salt2: i32,
    /// Third salt
    pub salt3: i32,
    /// Fourth salt
    pub salt4: i32,
    /// Fifth salt
    pub salt5: i32,
    /// The raw access token
    pub access_token: String,
    /// The raw refresh token
    pub refresh_token: String,
    /// Server issuance time in milliseconds since the epoch
    #[serde(default)]
    pub server_time: i64,
}

impl TokenBundle {
    /// The salts in issue order
    #[inline]
    pub fn salts(&self) -> Salts {
        Salts([self.salt1, self.salt2, self.salt3, self.salt4, self.salt5])
    }

    /// The server-reported issuance time, truncated to whole seconds
    ///
    /// `None` when the server did not report a usable time.
    #[inline]
    pub fn issued_at(&self) -> Option<UnixTime> {
        UnixTime::from_unix_millis(self.server_time)
    }
}

impl fmt::Debug for TokenBundle {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("TokenBundle")
            .field("salts", &self.salts())
            .field("access_token_len", &self.access_token.len())
            .field("refresh_token_len", &self.refresh_token.len())
            .field("server_time", &self.server_time)
            .finish()
    }
}
