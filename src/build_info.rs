//! Build-time information, generated by `build.rs` via the `built` crate.

mod raw {
    include!(concat!(env!("OUT_DIR"), "/built.rs"));
}

/// Crate version such as 0.1.0.
pub const PKG_VERSION: &str = raw::PKG_VERSION;

/// Comma separated Cargo features enabled for this build.
pub const FEATURES: &str = raw::FEATURES_STR;

/// Git revision the build was produced from, e.g. `a96e8f9` or
/// `a96e8f9-dirty`, or `unknown-git-version` if not built from a git
/// checkout.
pub fn git_version() -> String {
    match raw::GIT_COMMIT_HASH {
        Some(hash) => {
            if raw::GIT_DIRTY.unwrap_or(false) {
                format!("{hash}-dirty")
            } else {
                hash.to_string()
            }
        }
        None => "unknown-git-version".to_string(),
    }
}
