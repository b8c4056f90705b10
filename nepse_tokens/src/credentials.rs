use nepse_clock::{DurationSecs, UnixTime};

use crate::{
    derive::{DerivedIndices, TokenKind},
    reconstruct, AccessToken, AccessTokenRef, CredentialError, RefreshToken, RefreshTokenRef,
    Salts, TokenBundle,
};

/// A pair of usable tokens along with the material they were derived from
#[derive(Clone, Debug)]
pub struct Credentials {
    access_token: AccessToken,
    refresh_token: RefreshToken,
    salts: Salts,
    obtained_at: UnixTime,
}

/// Whether credentials may still be handed out
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CredentialStatus {
    /// Within the validity window
    Fresh,
    /// Past the validity window and due for an update
    Stale,
}

impl Credentials {
    /// Strips the derived positions from both raw tokens
    ///
    /// `obtained_at` is taken from the bundle's server time when reported,
    /// otherwise from `now`. A token that reconstructs to nothing is an error.
    pub fn assemble(
        bundle: &TokenBundle,
        indices: &DerivedIndices,
        now: UnixTime,
    ) -> Result<Self, CredentialError> {
        let access = reconstruct(&bundle.access_token, &indices.access);
        if access.is_empty() {
            return Err(CredentialError::EmptyToken(TokenKind::Access));
        }

        let refresh = reconstruct(&bundle.refresh_token, &indices.refresh);
        if refresh.is_empty() {
            return Err(CredentialError::EmptyToken(TokenKind::Refresh));
        }

        Ok(Self {
            access_token: AccessToken::new(access),
            refresh_token: RefreshToken::new(refresh),
            salts: bundle.salts(),
            obtained_at: bundle.issued_at().unwrap_or(now),
        })
    }

    /// Gets the usable access token
    #[inline]
    pub fn access_token(&self) -> &AccessTokenRef {
        &self.access_token
    }

    /// Gets the usable refresh token
    #[inline]
    pub fn refresh_token(&self) -> &RefreshTokenRef {
        &self.refresh_token
    }

    /// Gets the salts the tokens were derived with
    #[inline]
    pub fn salts(&self) -> Salts {
        self.salts
    }

    /// Gets the time the credentials were obtained, in whole seconds
    #[inline]
    pub fn obtained_at(&self) -> UnixTime {
        self.obtained_at
    }

    /// Gets the credentials' status as of `time` for the given window
    #[inline]
    pub fn status_at(&self, time: UnixTime, window: DurationSecs) -> CredentialStatus {
        if time.saturating_since(self.obtained_at) < window {
            CredentialStatus::Fresh
        } else {
            CredentialStatus::Stale
        }
    }

    /// Gets how much longer the credentials stay fresh as of `time`
    #[inline]
    pub fn until_stale_at(&self, time: UnixTime, window: DurationSecs) -> DurationSecs {
        (self.obtained_at + window).saturating_since(time)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bundle(server_time: i64) -> TokenBundle {
        TokenBundle {
            salt1: 1,
            salt2: 2,
            salt3: 3,
            salt4: 4,
            salt5: 5,
            access_token: "aXbXcXdXeXf".into(),
            refresh_token: "0r1r2r3r4r5".into(),
            server_time,
        }
    }

    const INDICES: DerivedIndices = DerivedIndices {
        access: [9, 1, 7, 3, 5],
        refresh: [1, 3, 5, 7, 9],
    };

    #[test]
    fn assembles_usable_tokens() {
        let creds = Credentials::assemble(&bundle(0), &INDICES, UnixTime(50)).unwrap();

        assert_eq!(creds.access_token().as_str(), "abcdef");
        assert_eq!(creds.refresh_token().as_str(), "012345");
        assert_eq!(creds.salts(), Salts([1, 2, 3, 4, 5]));
    }

    #[test]
    fn prefers_server_time_truncated_to_seconds() {
        let creds = Credentials::assemble(&bundle(1_700_000_000_750), &INDICES, UnixTime(5))
            .unwrap();
        assert_eq!(creds.obtained_at(), UnixTime(1_700_000_000));
    }

    #[test]
    fn falls_back_to_local_time_without_server_time() {
        let creds = Credentials::assemble(&bundle(-1), &INDICES, UnixTime(42)).unwrap();
        assert_eq!(creds.obtained_at(), UnixTime(42));
    }

    #[test]
    fn sub_second_server_time_falls_back_to_local_time() {
        let creds = Credentials::assemble(&bundle(500), &INDICES, UnixTime(42)).unwrap();
        assert_eq!(creds.obtained_at(), UnixTime(42));
    }

    #[test]
    fn empty_access_token_is_rejected() {
        let mut b = bundle(0);
        b.access_token = "x".into();
        let indices = DerivedIndices {
            access: [0, 0, 0, 0, 0],
            ..INDICES
        };

        let err = Credentials::assemble(&b, &indices, UnixTime(0)).unwrap_err();
        assert!(matches!(err, CredentialError::EmptyToken(TokenKind::Access)));
    }

    #[test]
    fn empty_refresh_token_is_rejected() {
        let mut b = bundle(0);
        b.refresh_token = String::new();

        let err = Credentials::assemble(&b, &INDICES, UnixTime(0)).unwrap_err();
        assert!(matches!(err, CredentialError::EmptyToken(TokenKind::Refresh)));
    }

    #[test]
    fn fresh_strictly_inside_window() {
        let creds = Credentials::assemble(&bundle(0), &INDICES, UnixTime(100)).unwrap();
        let window = DurationSecs(45);

        assert_eq!(creds.status_at(UnixTime(100), window), CredentialStatus::Fresh);
        assert_eq!(creds.status_at(UnixTime(144), window), CredentialStatus::Fresh);
        assert_eq!(creds.status_at(UnixTime(145), window), CredentialStatus::Stale);
        assert_eq!(creds.until_stale_at(UnixTime(130), window), DurationSecs(15));
        assert_eq!(creds.until_stale_at(UnixTime(200), window), DurationSecs(0));
    }

    #[test]
    fn server_time_ahead_of_local_clock_counts_as_fresh() {
        let creds = Credentials::assemble(&bundle(200_000), &INDICES, UnixTime(0)).unwrap();
        assert_eq!(
            creds.status_at(UnixTime(150), DurationSecs(45)),
            CredentialStatus::Fresh
        );
    }
}
