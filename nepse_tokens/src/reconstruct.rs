//! Recovery of usable tokens from the raw tokens issued by the service

/// Removes the bytes at `indices` from `raw`
///
/// Indices may arrive in any order. Positions that are negative or past the
/// end of `raw` are ignored, and a repeated position removes its byte once.
///
/// ```
/// use nepse_tokens::reconstruct;
///
/// assert_eq!(reconstruct("abcdef", &[3, 1]), "acef");
/// assert_eq!(reconstruct("abc", &[5, -1, 1]), "ac");
/// ```
pub fn reconstruct(raw: &str, indices: &[i32]) -> String {
    if indices.is_empty() {
        return raw.to_owned();
    }

    let mut positions = indices
        .iter()
        .filter_map(|&idx| usize::try_from(idx).ok())
        .filter(|&idx| idx < raw.len())
        .collect::<Vec<_>>();
    positions.sort_unstable();
    positions.dedup();

    let bytes = raw.as_bytes();
    let mut out = Vec::with_capacity(bytes.len() - positions.len());
    let mut prev = 0;
    for pos in positions {
        out.extend_from_slice(&bytes[prev..pos]);
        prev = pos + 1;
    }
    out.extend_from_slice(&bytes[prev..]);

    // Issued tokens are ASCII; anything else cannot be split on byte offsets
    // without producing replacement characters.
    match String::from_utf8(out) {
        Ok(s) => s,
        Err(err) => String::from_utf8_lossy(err.as_bytes()).into_owned(),
    }
}
