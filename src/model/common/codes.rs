use rand::Rng;

/// Length of a session join code.
pub const JOIN_CODE_LEN: usize = 6;

/// Length of generated question/option IDs.
pub const GENERATED_ID_LEN: usize = 16;

/// Generate `len` random lower-case hexadecimal characters.
pub fn random_hex(rng: &mut impl Rng, len: usize) -> String {
    const HEX: &[u8] = b"0123456789abcdef";
    (0..len)
        .map(|_| HEX[rng.gen_range(0..HEX.len())] as char)
        .collect()
}

/// Generate a candidate join code. Uniqueness is enforced by the store.
pub fn join_code(rng: &mut impl Rng) -> String {
    random_hex(rng, JOIN_CODE_LEN).to_uppercase()
}

/// Generate an ID for a question or option that was created without one.
pub fn generated_id(rng: &mut impl Rng) -> String {
    random_hex(rng, GENERATED_ID_LEN)
}
