//! Random identifiers for networks and endpoints

/// Length of the abbreviated form of an id
pub const SHORT_LEN: usize = 12;

/// Generate a 64 character hex identifier from 32 random bytes.
///
/// An id whose short form parses as a plain number is discarded, so that
/// truncated ids can never be confused with numeric indexes.
pub fn generate_id() -> String {
    loop {
        let bytes: [u8; 32] = rand::random();
        let id = hex::encode(bytes);
        if short_id(&id).parse::<u64>().is_err() {
            return id;
        }
    }
}

/// Truncate an id to its short form
pub fn short_id(id: &str) -> &str {
    match id.char_indices().nth(SHORT_LEN) {
        Some((idx, _)) => &id[..idx],
        None => id,
    }
}
