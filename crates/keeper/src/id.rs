//! Secret identifiers
//!
//! IDs are random lowercase hex strings of a fixed length. Uniqueness is
//! probabilistic; the manager checks each fresh ID against the metadata store
//! and draws again on collision.

/// Length of every secret ID
pub const ID_LENGTH: usize = 25;

/// Generate a new random ID
pub fn new_id() -> String {
    keeper_core::random_hex(ID_LENGTH)
}

/// Whether `input` could be a full ID or a prefix of one
pub fn looks_like_id(input: &str) -> bool {
    !input.is_empty()
        && input.len() <= ID_LENGTH
        && input
            .chars()
            .all(|c| c.is_ascii_digit() || ('a'..='f').contains(&c))
}
