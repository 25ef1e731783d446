//! `checksum(v) = adler32(concat(utf8(stringify(f)) for f in canonical_fields(v)))`.
//! Every entity contributes its canonical fields as `Vec<String>` (see
//! `catalog::entities`); this just joins and hashes them.

/// Adler-32 over the concatenation (no separator) of `fields`.
pub fn adler32_of(fields: &[String]) -> u32 {
    let joined: String = fields.concat();
    adler32::RollingAdler32::from_buffer(joined.as_bytes()).hash()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_fields_produce_the_same_checksum() {
        let a = adler32_of(&["foo".to_string(), "1".to_string()]);
        let b = adler32_of(&["foo".to_string(), "1".to_string()]);
        assert_eq!(a, b);
    }

    #[test]
    fn changing_a_field_changes_the_checksum() {
        let a = adler32_of(&["foo".to_string(), "1".to_string()]);
        let b = adler32_of(&["foo".to_string(), "2".to_string()]);
        assert_ne!(a, b);
    }

    #[test]
    fn concatenation_has_no_separator_so_boundaries_can_collide() {
        // The concatenation has no field separator by design, so field
        // boundaries can collide: ("fo", "o1") and ("foo", "1") hash identically.
        let a = adler32_of(&["fo".to_string(), "o1".to_string()]);
        let b = adler32_of(&["foo".to_string(), "1".to_string()]);
        assert_eq!(a, b);
    }
}
