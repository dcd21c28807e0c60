//! Cache key derivation
//!
//! Every cache entry rax reads or writes is addressed by a plain string key of
//! the form `prefix[-os-arch][-version][-postfix...]`. The functions here are
//! pure: identical inputs always produce identical keys, and no I/O happens.
//!
//! Key formats currently in use:
//!
//! | artifact    | key                                                              |
//! |-------------|------------------------------------------------------------------|
//! | cargo tool  | `{prefix}-{tool}-{os}-{arch}-{version}`                          |
//! | toolchain   | `{prefix}-{channel}-{host triple}`                               |
//! | build output| `{prefix}-build-{os}-{arch}-{toolchains}-{project}-{fingerprint}`|
//!
//! Changing any of these invalidates every entry written by earlier releases,
//! so a format change must be treated as a cache migration.

use super::sha256_hex;
use crate::platform::HostPlatform;
use once_cell::sync::Lazy;
use regex::Regex;

/// Placeholder used when a normalized path component would otherwise be empty
pub const ROOT_COMPONENT: &str = "root";

/// Number of hex characters kept from the toolchain-set digest
const TOOLCHAIN_SET_HASH_LEN: usize = 8;

/// Number of hex characters kept from the lock-file digest
const LOCK_FILE_HASH_LEN: usize = 20;

static SEPARATOR_RUN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"[/\\]+").expect("separator pattern is valid"));

/// Build a cache key
///
/// Components are concatenated in a fixed order: `prefix`, then
/// `-{os}-{arch}` when a platform is given, then `-{version}` when given, then
/// the postfixes joined by `-`. Postfixes are order-sensitive; callers that
/// need order independence must sort before calling.
///
/// # Examples
///
/// ```
/// use rax_core::cache::build_key;
/// use rax_core::platform::HostPlatform;
///
/// let platform = HostPlatform::new("linux", "x86_64");
/// assert_eq!(
///     build_key("rax-cache-cargo-deny", Some("0.16.1"), Some(&platform), &[]),
///     "rax-cache-cargo-deny-linux-x86_64-0.16.1"
/// );
/// assert_eq!(build_key("tc", None, None, &["a", "b"]), "tc-a-b");
/// ```
pub fn build_key(
    prefix: &str,
    version: Option<&str>,
    platform: Option<&HostPlatform>,
    postfixes: &[&str],
) -> String {
    let mut key = String::from(prefix);
    if let Some(platform) = platform {
        key.push('-');
        key.push_str(&platform.discriminator());
    }
    if let Some(version) = version {
        key.push('-');
        key.push_str(version);
    }
    if !postfixes.is_empty() {
        key.push('-');
        key.push_str(&postfixes.join("-"));
    }
    key
}

/// Key under which an installed cargo tool binary is cached
pub fn tool_key(prefix: &str, tool: &str, version: &str, platform: &HostPlatform) -> String {
    build_key(&format!("{}-{}", prefix, tool), Some(version), Some(platform), &[])
}

/// Key under which an installed toolchain directory is cached
///
/// The host triple already identifies the platform, so no `os-arch` part is
/// added. The component set is deliberately not part of the key.
pub fn toolchain_key(prefix: &str, channel: &str, host_triple: &str) -> String {
    build_key(&format!("{}-{}-{}", prefix, channel, host_triple), None, None, &[])
}

/// Key under which the build output directory is cached
pub fn build_output_key(
    prefix: &str,
    platform: &HostPlatform,
    toolchain_fingerprint: &str,
    project_component: &str,
    lock_fingerprint: &str,
) -> String {
    build_key(
        &format!("{}-build", prefix),
        None,
        Some(platform),
        &[toolchain_fingerprint, project_component, lock_fingerprint],
    )
}

/// Normalize a project path so it can be embedded in a key
///
/// Surrounding whitespace, dots and path separators are stripped, each
/// remaining run of `/` or `\` becomes a single `-`, and an empty result is
/// replaced with `"root"`. The operation is idempotent and the output never
/// contains a path separator.
///
/// # Examples
///
/// ```
/// use rax_core::cache::normalize_path_component;
///
/// assert_eq!(normalize_path_component("./"), "root");
/// assert_eq!(normalize_path_component("./crates/core/"), "crates-core");
/// assert_eq!(normalize_path_component(r"crates\\core"), "crates-core");
/// ```
pub fn normalize_path_component(path: &str) -> String {
    let trimmed =
        path.trim_matches(|c: char| c == '.' || c == '/' || c == '\\' || c.is_whitespace());
    if trimmed.is_empty() {
        return ROOT_COMPONENT.to_string();
    }
    SEPARATOR_RUN.replace_all(trimmed, "-").into_owned()
}

/// Fingerprint a set of toolchain names independently of their order
pub fn toolchain_set_fingerprint<S: AsRef<str>>(toolchains: &[S]) -> String {
    let mut names: Vec<&str> = toolchains.iter().map(AsRef::as_ref).collect();
    names.sort_unstable();
    let digest = sha256_hex(names.join(",").as_bytes());
    digest[..TOOLCHAIN_SET_HASH_LEN].to_string()
}

/// Fingerprint the contents of a dependency lock file
pub fn lock_file_fingerprint(contents: &[u8]) -> String {
    let digest = sha256_hex(contents);
    digest[..LOCK_FILE_HASH_LEN].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn linux() -> HostPlatform {
        HostPlatform::new("linux", "x86_64")
    }

    #[test]
    fn test_build_key_layout() {
        let p = linux();
        assert_eq!(build_key("prefix", None, None, &[]), "prefix");
        assert_eq!(
            build_key("prefix", None, Some(&p), &[]),
            "prefix-linux-x86_64"
        );
        assert_eq!(build_key("prefix", Some("1.2.3"), None, &[]), "prefix-1.2.3");
        assert_eq!(
            build_key("prefix", Some("1.2.3"), Some(&p), &["a", "b"]),
            "prefix-linux-x86_64-1.2.3-a-b"
        );
    }

    #[test]
    fn test_build_key_is_deterministic() {
        let p = linux();
        let first = build_key("x", Some("1"), Some(&p), &["y"]);
        let second = build_key("x", Some("1"), Some(&p), &["y"]);
        assert_eq!(first, second);
    }

    #[test]
    fn test_build_key_varies_with_each_argument() {
        let p = linux();
        let mac = HostPlatform::new("macos", "x86_64");
        let arm = HostPlatform::new("linux", "aarch64");
        let base = build_key("x", Some("1"), Some(&p), &["y"]);

        assert_ne!(base, build_key("z", Some("1"), Some(&p), &["y"]));
        assert_ne!(base, build_key("x", Some("2"), Some(&p), &["y"]));
        assert_ne!(base, build_key("x", None, Some(&p), &["y"]));
        assert_ne!(base, build_key("x", Some("1"), Some(&mac), &["y"]));
        assert_ne!(base, build_key("x", Some("1"), Some(&arm), &["y"]));
        assert_ne!(base, build_key("x", Some("1"), None, &["y"]));
        assert_ne!(base, build_key("x", Some("1"), Some(&p), &["w"]));
        assert_ne!(base, build_key("x", Some("1"), Some(&p), &[]));
    }

    #[test]
    fn test_tool_key() {
        assert_eq!(
            tool_key("myprefix", "cargo-audit", "0.17.4", &linux()),
            "myprefix-cargo-audit-linux-x86_64-0.17.4"
        );
    }

    #[test]
    fn test_toolchain_key_has_no_platform_part() {
        assert_eq!(
            toolchain_key("rax-cache", "nightly", "x86_64-unknown-linux-gnu"),
            "rax-cache-nightly-x86_64-unknown-linux-gnu"
        );
    }

    #[test]
    fn test_build_output_key() {
        assert_eq!(
            build_output_key("rax-cache", &linux(), "0a1b2c3d", "root", "main"),
            "rax-cache-build-linux-x86_64-0a1b2c3d-root-main"
        );
    }

    #[test]
    fn test_normalize_root_variants() {
        for input in [".", "./", "/", "", "  ", "\\", "./."] {
            assert_eq!(normalize_path_component(input), "root", "input {:?}", input);
        }
    }

    #[test]
    fn test_normalize_equivalent_spellings() {
        for input in ["proj", "./proj", "/proj/", "proj/", "proj/.", " proj "] {
            assert_eq!(normalize_path_component(input), "proj", "input {:?}", input);
        }
        assert_eq!(normalize_path_component("a//b\\\\c"), "a-b-c");
        assert_eq!(normalize_path_component("/work/crates/core/"), "work-crates-core");
    }

    #[test]
    fn test_normalize_is_idempotent() {
        for input in [".", "./a/b/", "a/ .", "../x", "a/-/b", "\\\\server\\share", "x.y/z"] {
            let once = normalize_path_component(input);
            assert_eq!(normalize_path_component(&once), once, "input {:?}", input);
            assert!(!once.contains('/') && !once.contains('\\'));
        }
    }

    #[test]
    fn test_toolchain_set_fingerprint_order_independent() {
        let a = toolchain_set_fingerprint(&["stable", "nightly"]);
        let b = toolchain_set_fingerprint(&["nightly", "stable"]);
        assert_eq!(a, b);
        assert_eq!(a.len(), 8);
        assert_ne!(a, toolchain_set_fingerprint(&["stable"]));
    }

    #[test]
    fn test_lock_file_fingerprint() {
        let fp = lock_file_fingerprint(b"version = 3\n");
        assert_eq!(fp.len(), 20);
        assert_eq!(fp, lock_file_fingerprint(b"version = 3\n"));
        assert_ne!(fp, lock_file_fingerprint(b"version = 4\n"));
    }
}
