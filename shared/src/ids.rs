//! Identifier generation for projects, companies and config bundles.

use uuid::Uuid;

/// Builds a globally unique identifier from a human readable seed.
///
/// The seed is lowercased and whitespace is replaced with `-`, then a random
/// v4 UUID is appended: `"My Project"` becomes `my-project_<uuid>`.
pub fn generate_id(seed: &str) -> String {
    let normalized: String = seed
        .trim()
        .chars()
        .map(|c| if c.is_whitespace() { '-' } else { c })
        .collect::<String>()
        .to_lowercase();

    format!("{normalized}_{}", Uuid::new_v4())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generate_id_normalizes_seed() {
        let id = generate_id("AC_My Cool Project");
        assert!(id.starts_with("ac_my-cool-project_"));

        let suffix = id.rsplit('_').next().unwrap();
        assert!(Uuid::parse_str(suffix).is_ok());
    }

    #[test]
    fn test_generate_id_is_unique() {
        assert_ne!(generate_id("seed"), generate_id("seed"));
    }
}
