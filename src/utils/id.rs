/// Upper bound on identifier length (a DNS name)
const MAX_ID_LEN: usize = 253;

/// Returns true if `id` is safe to embed in a storage key and a DNS label
/// path: non-empty, bounded, and made of ASCII alphanumerics plus `-_.:@`.
pub fn is_valid_id(id: &str) -> bool {
    if id.is_empty() || id.len() > MAX_ID_LEN {
        return false;
    }
    id.chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | ':' | '@'))
}
