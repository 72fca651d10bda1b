/// BLAKE3 of `data` as lowercase hex.
pub fn hash_data(data: &[u8]) -> String {
    blake3::hash(data).to_hex().to_string()
}
