//! # ICS Session (Session & Token Lifecycle Authority)
//!
//! `ics-session` owns the lifecycle of authenticated sessions: it verifies
//! credentials, issues short-lived access tokens and single-use refresh tokens,
//! keeps the authoritative session store, and coordinates single sign-on across
//! trusted applications.
//!
//! ## Sessions
//!
//! A session is created at `BASIC` assurance after a successful login. Its
//! assurance level only ever rises: a valid TOTP code presented through the
//! step-up gate upgrades it to `MFA_VERIFIED`. Revocation is terminal and is
//! published to every subscriber so applications can drop local state.
//!
//! ## Tokens
//!
//! Access tokens are Ed25519-signed `v4.public` tokens that can be verified
//! offline. Refresh tokens are opaque, stored only as SHA-256 digests, and rotate
//! on every use; presenting a rotated token again revokes the whole session.
//!
//! ## Abuse Protection
//!
//! Login, refresh and MFA attempts are rate limited per client and per claimed
//! identity. Consecutive failures back off exponentially and eventually lock the
//! identity out for a fixed period.

pub mod api;
pub mod authority;
pub mod cli;
pub mod totp;

#[allow(clippy::doc_markdown, clippy::needless_raw_string_hashes)]
pub mod built_info {
    include!(concat!(env!("OUT_DIR"), "/built.rs"));
}

pub const GIT_COMMIT_HASH: &str = match built_info::GIT_COMMIT_HASH {
    Some(hash) => hash,
    None => "unknown",
};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_git_commit_hash_format() {
        if GIT_COMMIT_HASH == "unknown" {
            return;
        }
        assert!(
            GIT_COMMIT_HASH.chars().all(|c| c.is_ascii_hexdigit()),
            "GIT_COMMIT_HASH should be a hex string, got: {GIT_COMMIT_HASH}"
        );
        assert!(GIT_COMMIT_HASH.len() >= 7);
    }
}
