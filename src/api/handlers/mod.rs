pub mod health;
pub mod mfa;
pub mod principals;
pub mod sessions;
pub(crate) mod utils;

#[cfg(test)]
pub(crate) mod tests_support;
