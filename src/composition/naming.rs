// Copyright (c) 2024 Mike Tsao

//! Letter suffixes that keep names unique: `a, b, ..., z, aa, ab, ...`.

/// Converts a zero-based index into a bijective base-26 letter string.
pub fn letters(index: usize) -> String {
    let mut n = index + 1;
    let mut out = Vec::default();
    while n > 0 {
        n -= 1;
        out.push(b'a' + (n % 26) as u8);
        n /= 26;
    }
    out.reverse();
    String::from_utf8_lossy(&out).into_owned()
}

/// Picks a name nobody has. A non-empty `requested` name is used as-is when
/// free. Otherwise the first free `<base>_<letters>` wins, where the base is
/// `requested` or, for unnamed things, `stem`.
pub fn unique_name(requested: &str, stem: &str, is_taken: impl Fn(&str) -> bool) -> String {
    if !requested.is_empty() && !is_taken(requested) {
        return requested.to_string();
    }
    let base = if requested.is_empty() { stem } else { requested };
    (0..)
        .map(|i| format!("{base}_{}", letters(i)))
        .find(|candidate| !is_taken(candidate))
        .unwrap_or_else(|| base.to_string())
}
