use rand::Rng;

/// Uppercase alphanumerics without the easily-confused 0/O and 1/I/L
const ALPHABET: &[u8] = b"ABCDEFGHJKMNPQRSTUVWXYZ23456789";

/// Produces candidate referral codes. Uniqueness is checked by the ledger.
#[derive(Debug, Clone)]
pub struct CodeGenerator {
    prefix: String,
    length: usize,
}

impl CodeGenerator {
    pub fn new(prefix: impl Into<String>, length: usize) -> Self {
        Self {
            prefix: prefix.into().to_uppercase(),
            length,
        }
    }

    pub fn candidate(&self) -> String {
        let mut rng = rand::thread_rng();
        let suffix: String = (0..self.length)
            .map(|_| ALPHABET[rng.gen_range(0..ALPHABET.len())] as char)
            .collect();
        format!("{}{}", self.prefix, suffix)
    }

    /// Codes are typed by hand; accept any case and stray whitespace
    pub fn normalize(code: &str) -> String {
        code.trim().to_uppercase()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_candidate_shape() {
        let generator = CodeGenerator::new("wr", 6);
        let code = generator.candidate();

        assert!(code.starts_with("WR"));
        assert_eq!(code.len(), 8);
        assert!(code[2..].bytes().all(|b| ALPHABET.contains(&b)));
    }

    #[test]
    fn test_normalize() {
        assert_eq!(CodeGenerator::normalize("  wrab12cd "), "WRAB12CD");
    }
}
