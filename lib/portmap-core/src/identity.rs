//! Owner-key normalization
//!
//! Accounts arrive from the identity provider in whatever form it uses
//! (`Alice.Smith@example.com`, `alice-smith`, ...). Mapping records are
//! compared by a normalized key so the same person always resolves to
//! the same records regardless of provider spelling.

/// Normalize an account string into its comparison key: lowercase, runs
/// of non-alphanumeric characters collapsed to `-`, edges trimmed.
///
/// Falls back to the plain lowercased input when normalization would
/// produce an empty string.
pub fn owner_key(account: &str) -> String {
    let lower = account.to_lowercase();
    let mut key = String::with_capacity(lower.len());
    let mut pending_dash = false;
    for ch in lower.chars() {
        if ch.is_ascii_lowercase() || ch.is_ascii_digit() {
            if pending_dash && !key.is_empty() {
                key.push('-');
            }
            pending_dash = false;
            key.push(ch);
        } else {
            pending_dash = true;
        }
    }
    if key.is_empty() {
        lower
    } else {
        key
    }
}
