//! Composes successive partial transcripts without duplicating the words
//! they share at the boundary.

/// Merge an accumulated transcript with a newly returned partial,
/// eliminating suffix/prefix overlap of up to five tokens.
///
/// This handles the common case where two consecutive partial
/// transcriptions overlap on the most recently spoken words, e.g.
/// `merge("what do you", "do you recommend")` → `"what do you recommend"`.
pub fn merge(old: &str, new: &str) -> String {
    if old.is_empty() {
        return new.to_owned();
    }
    if new.is_empty() {
        return old.to_owned();
    }

    let old_tokens: Vec<&str> = old.split_whitespace().collect();
    let new_tokens: Vec<&str> = new.split_whitespace().collect();

    let max_k = old_tokens.len().min(new_tokens.len()).min(5);
    for k in (1..=max_k).rev() {
        let old_suffix = &old_tokens[old_tokens.len() - k..];
        let new_prefix = &new_tokens[..k];
        if old_suffix == new_prefix {
            let mut merged = old.to_owned();
            if k < new_tokens.len() {
                merged.push(' ');
                merged.push_str(&new_tokens[k..].join(" "));
            }
            return merged;
        }
    }

    format!("{old} {new}")
}

/// Token-set overlap ratio between two strings, case-insensitive, computed
/// as the size of the intersection over the larger token-set's size. Used
/// to decide whether a speculative turn's input text was close enough to
/// the final transcript to keep its output.
pub fn overlap_ratio(a: &str, b: &str) -> f32 {
    let a_tokens: std::collections::HashSet<String> =
        a.split_whitespace().map(|t| t.to_lowercase()).collect();
    let b_tokens: std::collections::HashSet<String> =
        b.split_whitespace().map(|t| t.to_lowercase()).collect();

    if a_tokens.is_empty() || b_tokens.is_empty() {
        return if a_tokens.is_empty() && b_tokens.is_empty() {
            1.0
        } else {
            0.0
        };
    }

    let intersection = a_tokens.intersection(&b_tokens).count();
    let denom = a_tokens.len().max(b_tokens.len());
    intersection as f32 / denom as f32
}
