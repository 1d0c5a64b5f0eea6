//! Obfuscated candidate-name detection
//!
//! The pipeline sees two name candidates per file before Par2 data is
//! available: the `=ybegin name=` field and the quoted token in the NZB
//! subject. Obfuscated posts fill both with generated junk — GUIDs, hex
//! blobs, random alphanumerics — as a single unbroken token, whereas
//! authored release names are segmented (`Some.Show.S01E01.mkv`) and read
//! like words. These checks decide which candidate is worth keeping; a
//! Par2-derived name always wins regardless.

/// Does a candidate name look generated rather than authored?
///
/// A name is rejected when its stem is GUID-shaped, a long hex blob, a
/// vowel-free consonant run, or an unbroken evenly-mixed alphanumeric
/// soup. Detection errs toward keeping names: a falsely kept junk name
/// only costs cosmetics, a falsely dropped real name loses information.
#[must_use]
pub fn is_obfuscated(candidate: &str) -> bool {
    let stem = strip_candidate_extension(candidate);
    if stem.is_empty() {
        return true;
    }

    looks_like_guid(stem) || is_hex_blob(stem) || is_consonant_run(stem) || is_mixed_soup(stem)
}

/// Drop one trailing `.ext` when it looks like a real extension
///
/// Obfuscators usually keep a genuine media extension on their junk stem
/// (`<hex>.mkv`), so the extension itself must not influence the verdict.
/// Only a short alphanumeric tail after the last dot is treated as one.
fn strip_candidate_extension(candidate: &str) -> &str {
    match candidate.rsplit_once('.') {
        Some((stem, ext))
            if !stem.is_empty()
                && (1..=4).contains(&ext.len())
                && ext.chars().all(|c| c.is_ascii_alphanumeric()) =>
        {
            stem
        }
        _ => candidate,
    }
}

/// GUID-shaped: `8-4-4-4-12` hex groups, or 32 hex digits run together
fn looks_like_guid(stem: &str) -> bool {
    if stem.len() == 32 {
        return stem.chars().all(|c| c.is_ascii_hexdigit());
    }

    let groups: Vec<&str> = stem.split('-').collect();
    groups.len() == 5
        && groups
            .iter()
            .zip([8usize, 4, 4, 4, 12])
            .all(|(group, want)| {
                group.len() == want && group.chars().all(|c| c.is_ascii_hexdigit())
            })
}

/// A hex digest longer than anything a human would type as a title
fn is_hex_blob(stem: &str) -> bool {
    stem.len() >= 20 && stem.chars().all(|c| c.is_ascii_hexdigit())
}

/// A run of letters with no vowel anywhere
///
/// Pronounceable names contain vowels; keyboard-mash and base-consonant
/// junk does not. Short stems get the benefit of the doubt.
fn is_consonant_run(stem: &str) -> bool {
    let mut letters = 0usize;
    for c in stem.chars() {
        if c.is_ascii_alphabetic() {
            letters += 1;
            if matches!(c.to_ascii_lowercase(), 'a' | 'e' | 'i' | 'o' | 'u') {
                return false;
            }
        }
    }
    letters >= 10
}

/// An unbroken, evenly mixed alphanumeric token
///
/// Authored names are segmented by dots, dashes, or spaces and cluster
/// their digits (years, resolutions); generated tokens run everything
/// together with digits threaded evenly through both letter cases. The
/// stem must be one unbroken token, long, carry all three character
/// classes, be digit-heavy, and have no dominating class.
fn is_mixed_soup(stem: &str) -> bool {
    let mut upper = 0usize;
    let mut lower = 0usize;
    let mut digits = 0usize;
    for c in stem.chars() {
        match c {
            'A'..='Z' => upper += 1,
            'a'..='z' => lower += 1,
            '0'..='9' => digits += 1,
            // Any separator marks a segmented, authored name
            _ => return false,
        }
    }

    let total = upper + lower + digits;
    if total < 25 || upper == 0 || lower == 0 || digits == 0 {
        return false;
    }

    let share = |count: usize| count as f64 / total as f64;
    share(digits) >= 0.25 && share(upper.max(lower).max(digits)) < 0.4
}
