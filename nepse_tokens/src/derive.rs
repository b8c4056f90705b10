//! Derivation of the character positions to strip from issued tokens

use std::fmt;

use thiserror::Error;

use crate::{
    module::{DerivationFn, DerivationFunctions, ModuleError},
    Salts,
};

/// Which of the two issued tokens an index set applies to
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TokenKind {
    /// The access token
    Access,
    /// The refresh token
    Refresh,
}

impl fmt::Display for TokenKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TokenKind::Access => f.write_str("access"),
            TokenKind::Refresh => f.write_str("refresh"),
        }
    }
}

/// The positions to remove from each raw token
///
/// Positions are reported in derivation order, which need not be ascending.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DerivedIndices {
    /// Positions to remove from the raw access token
    pub access: [i32; 5],
    /// Positions to remove from the raw refresh token
    pub refresh: [i32; 5],
}

/// A derivation function failed while computing an index
#[derive(Clone, Debug, Error, PartialEq, Eq)]
#[error("unable to derive {kind} token index using `{function}`")]
pub struct DerivationError {
    /// The token whose index was being computed
    pub kind: TokenKind,
    /// The function that failed
    pub function: DerivationFn,
    /// The underlying module failure
    #[source]
    pub source: ModuleError,
}

/// Computes both index sets from the issued salts
///
/// The argument permutations are an external contract and are not
/// interchangeable: each function sees its salts in exactly this order.
pub fn derive_indices<F>(functions: &F, salts: Salts) -> Result<DerivedIndices, DerivationError>
where
    F: DerivationFunctions + ?Sized,
{
    let [s1, s2, s3, s4, s5] = salts.0;

    let access = [
        (DerivationFn::Cdx, [s1, s2, s3, s4, s5]),
        (DerivationFn::Rdx, [s1, s2, s4, s3, s5]),
        (DerivationFn::Bdx, [s1, s2, s4, s3, s5]),
        (DerivationFn::Ndx, [s1, s2, s4, s3, s5]),
        (DerivationFn::Mdx, [s1, s2, s4, s3, s5]),
    ];

    let refresh = [
        (DerivationFn::Cdx, [s2, s1, s3, s5, s4]),
        (DerivationFn::Rdx, [s2, s1, s3, s4, s5]),
        (DerivationFn::Bdx, [s2, s1, s4, s3, s5]),
        (DerivationFn::Ndx, [s2, s1, s4, s3, s5]),
        (DerivationFn::Mdx, [s2, s1, s4, s3, s5]),
    ];

    Ok(DerivedIndices {
        access: evaluate(functions, TokenKind::Access, access)?,
        refresh: evaluate(functions, TokenKind::Refresh, refresh)?,
    })
}

fn evaluate<F>(
    functions: &F,
    kind: TokenKind,
    calls: [(DerivationFn, [i32; 5]); 5],
) -> Result<[i32; 5], DerivationError>
where
    F: DerivationFunctions + ?Sized,
{
    let mut indices = [0; 5];
    for (slot, (function, args)) in indices.iter_mut().zip(calls) {
        *slot = functions
            .call(function, args)
            .map_err(|source| DerivationError {
                kind,
                function,
                source,
            })?;
    }
    Ok(indices)
}
