//! Stage keys.
//!
//! Every step folds into a running SHA256 chain seeded by the base image
//! digest. The key of a filesystem-changing step therefore depends on the
//! base, every earlier instruction, its own input files, and the env and
//! working directory in effect. Editing application source changes only
//! the keys from the source COPY onward.

use sha2::{Digest, Sha256};
use stratum_core::EnvSet;

/// Running stage key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyChain {
    current: String,
}

impl KeyChain {
    /// Seed the chain from the base image manifest digest.
    pub fn from_base(base_digest: &str) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(b"base\0");
        hasher.update(base_digest.as_bytes());
        Self {
            current: hex::encode(hasher.finalize()),
        }
    }

    /// Fold one step into the chain and return the new key.
    ///
    /// `input_digest` is the content digest of the files the step reads
    /// from the build context (COPY), or `None`.
    pub fn fold(
        &mut self,
        instruction: &str,
        input_digest: Option<&str>,
        env: &EnvSet,
        workdir: &str,
    ) -> &str {
        let mut hasher = Sha256::new();
        for part in [
            self.current.as_str(),
            instruction,
            input_digest.unwrap_or(""),
            workdir,
        ] {
            hasher.update(part.as_bytes());
            hasher.update(b"\0");
        }
        for entry in env.to_oci_list() {
            hasher.update(entry.as_bytes());
            hasher.update(b"\n");
        }
        self.current = hex::encode(hasher.finalize());
        &self.current
    }

    pub fn current(&self) -> &str {
        &self.current
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn env() -> EnvSet {
        EnvSet::from_oci_list(&["PYTHONUNBUFFERED=1", "PYTHONPATH=/app"])
    }

    #[test]
    fn test_same_inputs_same_key() {
        let mut a = KeyChain::from_base("sha256:base");
        let mut b = KeyChain::from_base("sha256:base");
        a.fold("RUN pip install -r r.txt", None, &env(), "/app");
        b.fold("RUN pip install -r r.txt", None, &env(), "/app");
        assert_eq!(a, b);
        assert_eq!(a.current().len(), 64);
    }

    #[test]
    fn test_base_digest_changes_every_key() {
        let mut a = KeyChain::from_base("sha256:one");
        let mut b = KeyChain::from_base("sha256:two");
        assert_ne!(
            a.fold("COPY . .", Some("d"), &env(), "/app").to_string(),
            b.fold("COPY . .", Some("d"), &env(), "/app").to_string()
        );
    }

    #[test]
    fn test_input_digest_only_affects_later_keys() {
        let mut a = KeyChain::from_base("sha256:base");
        let mut b = KeyChain::from_base("sha256:base");

        let install_a = a.fold("RUN pip install", None, &env(), "/app").to_string();
        let install_b = b.fold("RUN pip install", None, &env(), "/app").to_string();
        assert_eq!(install_a, install_b);

        let src_a = a.fold("COPY . .", Some("source-v1"), &env(), "/app").to_string();
        let src_b = b.fold("COPY . .", Some("source-v2"), &env(), "/app").to_string();
        assert_ne!(src_a, src_b);
    }

    #[test]
    fn test_env_and_workdir_are_part_of_key() {
        let base = KeyChain::from_base("sha256:base");

        let mut a = base.clone();
        let mut b = base.clone();
        let mut c = base;
        let ka = a.fold("RUN true", None, &env(), "/app").to_string();

        let mut other_env = env();
        other_env.set("PYTHONUNBUFFERED", "0");
        let kb = b.fold("RUN true", None, &other_env, "/app").to_string();
        let kc = c.fold("RUN true", None, &env(), "/srv").to_string();

        assert_ne!(ka, kb);
        assert_ne!(ka, kc);
    }

    #[test]
    fn test_field_boundaries_are_unambiguous() {
        let mut a = KeyChain::from_base("b");
        let mut b = KeyChain::from_base("b");
        let ka = a.fold("RUN ab", Some("c"), &EnvSet::new(), "/").to_string();
        let kb = b.fold("RUN a", Some("bc"), &EnvSet::new(), "/").to_string();
        assert_ne!(ka, kb);
    }
}
